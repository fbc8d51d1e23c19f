//! HTTP reverse proxy for one application's external port.
//!
//! Each request reserves the active instance, is rewritten to target the
//! instance's internal `host:port` over HTTP/1.1, and is released when the
//! response body finishes streaming. Every connection gets a disconnect
//! watcher on a duplicate of the client socket; a client that goes away
//! while the upstream round trip is still pending cancels that round trip
//! instead of tying the instance down until the backend answers.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Request, Response, StatusCode, Uri, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::app::{App, Reservation};
use crate::Error;

/// Hop-by-hop headers, stripped from requests and responses.
const HOP_HEADERS: [HeaderName; 8] = [
    http::header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    http::header::PROXY_AUTHENTICATE,
    http::header::PROXY_AUTHORIZATION,
    http::header::TE,
    HeaderName::from_static("trailers"),
    http::header::TRANSFER_ENCODING,
    http::header::UPGRADE,
];

/// Back-off between watcher peeks when the socket holds data the watcher
/// must not consume (a pipelined next request).
const WATCH_BACKOFF: Duration = Duration::from_millis(250);

type ProxyClient = Client<HttpConnector, Incoming>;

type ProxyBody = UnsyncBoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

struct ProxyState {
    app: Arc<App>,
    client: ProxyClient,
}

/// Latched per-connection signal, set once the client side goes away.
#[derive(Debug, Default)]
struct ClientGone {
    gone: AtomicBool,
    notify: Notify,
}

impl ClientGone {
    fn set(&self) {
        self.gone.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.gone.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }
}

/// Serves the app's external port as an HTTP/1.1 reverse proxy.
pub async fn serve(app: Arc<App>, listener: TcpListener) -> std::io::Result<()> {
    let state = Arc::new(ProxyState {
        app,
        client: Client::builder(TokioExecutor::new()).build_http(),
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(state, stream, peer).await {
                debug!(%peer, error = %e, "connection error");
            }
        });
    }
}

/// Serves one client connection, with its disconnect watcher.
async fn handle_connection(
    state: Arc<ProxyState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> std::io::Result<()> {
    // A duplicate of the socket lets the watcher observe EOF without
    // touching the bytes the connection itself reads.
    let stream = stream.into_std()?;
    let watch = TcpStream::from_std(stream.try_clone()?)?;
    let stream = TcpStream::from_std(stream)?;

    let gone = Arc::new(ClientGone::default());
    let watcher = {
        let gone = Arc::clone(&gone);
        tokio::spawn(watch_client(watch, gone))
    };

    let service = service_fn(move |request: Request<Incoming>| {
        let state = Arc::clone(&state);
        let gone = Arc::clone(&gone);
        async move {
            Ok::<_, std::convert::Infallible>(forward(&state, peer, &gone, request).await)
        }
    });

    let served = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .await;
    watcher.abort();
    served.map_err(std::io::Error::other)
}

/// Peeks the client socket until it reports EOF or an error, then latches
/// the disconnect signal. Peeked data belongs to the next pipelined
/// request, so the watcher backs off rather than consuming it.
async fn watch_client(watch: TcpStream, gone: Arc<ClientGone>) {
    let mut buf = [0u8; 1];
    loop {
        match watch.peek(&mut buf).await {
            Ok(0) | Err(_) => {
                gone.set();
                return;
            }
            Ok(_) => tokio::time::sleep(WATCH_BACKOFF).await,
        }
    }
}

async fn forward(
    state: &ProxyState,
    peer: SocketAddr,
    gone: &ClientGone,
    request: Request<Incoming>,
) -> Response<ProxyBody> {
    let reservation = match state.app.reserve_active() {
        Ok(reservation) => reservation,
        Err(Error::NoActiveInstance) => return empty_response(StatusCode::SERVICE_UNAVAILABLE),
        Err(e) => {
            error!(app = %state.app.name(), error = %e, "reservation failed");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let (mut parts, body) = request.into_parts();
    parts.uri = match rewrite_uri(&parts.uri, reservation.host_port()) {
        Ok(uri) => uri,
        Err(e) => {
            error!(app = %state.app.name(), error = %e, "request rewrite failed");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    parts.version = Version::HTTP_11;
    strip_hop_headers(&mut parts.headers);
    append_forwarded_headers(&mut parts.headers, peer.ip());

    let round_trip = state.client.request(Request::from_parts(parts, body));
    tokio::pin!(round_trip);

    let result = tokio::select! {
        result = &mut round_trip => result,
        () = gone.wait() => {
            // Returning drops the pinned round trip, which cancels the
            // upstream request; the reservation drops with it.
            debug!(app = %state.app.name(), "client disconnected, upstream request canceled");
            return empty_response(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    match result {
        Ok(upstream) => {
            let (mut parts, body) = upstream.into_parts();
            strip_hop_headers(&mut parts.headers);
            // Streaming the body through (rather than buffering) lets
            // trailer frames and the declared `Trailer` header reach the
            // client; the reservation rides along until the last frame.
            let body = ReservedBody {
                inner: Box::pin(body),
                _lease: reservation,
            }
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
            .boxed_unsync();
            Response::from_parts(parts, body)
        }
        Err(e) => {
            error!(app = %state.app.name(), error = %e, "proxy round trip failed");
            empty_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Upstream response body holding its reservation until fully streamed.
struct ReservedBody {
    inner: Pin<Box<Incoming>>,
    _lease: Reservation,
}

impl http_body::Body for ReservedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, hyper::Error>>> {
        self.get_mut().inner.as_mut().poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> http_body::SizeHint {
        self.inner.size_hint()
    }
}

fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|e| match e {}).boxed_unsync());
    *response.status_mut() = status;
    response
}

/// Points the request at the reserved instance, keeping path and query.
fn rewrite_uri(uri: &Uri, authority: &str) -> Result<Uri, http::Error> {
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    Uri::builder()
        .scheme("http")
        .authority(authority)
        .path_and_query(path)
        .build()
}

fn strip_hop_headers(headers: &mut HeaderMap) {
    for header in &HOP_HEADERS {
        headers.remove(header);
    }
}

/// Appends the client IP to `X-Forwarded-For` (folding any prior values
/// into one comma-separated list) and sets `X-Real-IP`.
fn append_forwarded_headers(headers: &mut HeaderMap, client_ip: IpAddr) {
    let ip = client_ip.to_string();

    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();
    let forwarded = if prior.is_empty() {
        ip.clone()
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&forwarded) {
        headers.insert("x-forwarded-for", value);
    }
    if let Ok(value) = HeaderValue::from_str(&ip) {
        headers.insert("x-real-ip", value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, LoggerConfig};
    use crate::instance::probe_client;
    use crate::ports::PortPool;
    use axum::Router;
    use std::future::IntoFuture;

    fn test_app(dir: &tempfile::TempDir, port_from: u16) -> Arc<App> {
        let config = AppConfig {
            name: "http-test".into(),
            command: "sleep 5".into(),
            stop_signal: "TERM".into(),
            max_retries: 5,
            internal_host: "127.0.0.1".into(),
            external_host: "127.0.0.1".into(),
            external_port: 1,
            stdout_log_file: Some(dir.path().join("out")),
            stderr_log_file: Some(dir.path().join("err")),
            ..Default::default()
        };
        let logger = LoggerConfig {
            log_dir: dir.path().to_path_buf(),
            log_file: dir.path().join("daemon.log"),
            max_log_size: 1,
            max_logs_kept: 0,
            max_log_age: 0,
        };
        App::new(
            config,
            &logger,
            Arc::new(PortPool::new(port_from, port_from + 1)),
        )
    }

    #[tokio::test]
    async fn forwards_to_the_active_instance_with_forwarded_headers() {
        let dir = tempfile::tempdir().unwrap();
        // Single-port pool, so the upstream address is known up front.
        let app = test_app(&dir, 10530);

        // The child itself does not listen; the test serves the leased
        // port and echoes the forwarding headers back.
        let upstream = TcpListener::bind("127.0.0.1:10530").await.unwrap();
        let echo = Router::new().fallback(|headers: HeaderMap| async move {
            let fwd = headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();
            format!("fwd={fwd}")
        });
        tokio::spawn(axum::serve(upstream, echo).into_future());

        app.start_new_instance().unwrap();
        let mut retries = 0;
        app.tick(&mut retries).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(Arc::clone(&app), listener));

        let client = probe_client();
        let uri: Uri = format!("http://{addr}/anything").parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"fwd=127.0.0.1");

        app.stop_instances(None, true).unwrap();
    }

    #[tokio::test]
    async fn responds_503_without_an_active_instance() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, 10540);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(app, listener));

        let client = probe_client();
        let uri: Uri = format!("http://{addr}/").parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn watcher_latches_on_client_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        let gone = Arc::new(ClientGone::default());
        tokio::spawn(watch_client(server, Arc::clone(&gone)));

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), gone.wait())
            .await
            .expect("disconnect was never flagged");
    }

    #[tokio::test]
    async fn disconnect_cancels_a_pending_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = test_app(&dir, 10550);

        // An upstream that accepts but never answers, so the round trip
        // stays pending until the watcher fires.
        let upstream = TcpListener::bind("127.0.0.1:10550").await.unwrap();
        tokio::spawn(async move {
            let (stalled, _) = upstream.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stalled);
        });

        app.start_new_instance().unwrap();
        let mut retries = 0;
        app.tick(&mut retries).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(Arc::clone(&app), listener));

        // Raw client: send a request, then hang up without reading.
        use tokio::io::AsyncWriteExt;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n")
            .await
            .unwrap();
        drop(client);
        tokio::time::sleep(Duration::from_millis(500)).await;

        // The canceled round trip must have released its reservation: a
        // graceful stop then drains immediately, the stop signal goes out,
        // and the instance reaches `stopped`. A leaked reservation would
        // park it in `stopping` forever.
        app.stop_instances(None, false).unwrap();
        for _ in 0..100 {
            app.tick(&mut retries).await;
            if app.report(10).instances[0].status == "stopped" {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("instance never drained after the canceled round trip");
    }

    #[test]
    fn rewrites_authority_and_keeps_path_and_query() {
        let uri: Uri = "https://public.example.com/api/v1?x=1&y=2".parse().unwrap();
        let rewritten = rewrite_uri(&uri, "localhost:10042").unwrap();
        assert_eq!(rewritten.scheme_str(), Some("http"));
        assert_eq!(rewritten.authority().unwrap().as_str(), "localhost:10042");
        assert_eq!(rewritten.path_and_query().unwrap().as_str(), "/api/v1?x=1&y=2");
    }

    #[test]
    fn bare_uri_gets_root_path() {
        let uri: Uri = "http://example.com".parse().unwrap();
        let rewritten = rewrite_uri(&uri, "localhost:10042").unwrap();
        assert_eq!(rewritten.path(), "/");
    }

    #[test]
    fn strips_every_hop_by_hop_header() {
        let mut headers = HeaderMap::new();
        for header in &HOP_HEADERS {
            headers.insert(header, HeaderValue::from_static("x"));
        }
        headers.insert("content-type", HeaderValue::from_static("text/plain"));

        strip_hop_headers(&mut headers);

        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("content-type"));
    }

    #[test]
    fn forwarded_for_is_set_from_scratch() {
        let mut headers = HeaderMap::new();
        append_forwarded_headers(&mut headers, "203.0.113.7".parse().unwrap());
        assert_eq!(headers["x-forwarded-for"], "203.0.113.7");
        assert_eq!(headers["x-real-ip"], "203.0.113.7");
    }

    #[test]
    fn forwarded_for_preserves_prior_proxies() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.2"));

        append_forwarded_headers(&mut headers, "203.0.113.7".parse().unwrap());

        assert_eq!(headers["x-forwarded-for"], "10.0.0.1, 10.0.0.2, 203.0.113.7");
        // Folded into a single header.
        assert_eq!(headers.get_all("x-forwarded-for").iter().count(), 1);
    }

    #[test]
    fn trailer_declaration_survives_stripping() {
        // The singular `Trailer` header names the trailers a response
        // declares; only the hop-by-hop `Trailers` token is stripped.
        let mut headers = HeaderMap::new();
        headers.insert("trailer", HeaderValue::from_static("x-checksum"));
        strip_hop_headers(&mut headers);
        assert_eq!(headers["trailer"], "x-checksum");
    }
}
