//! Operator RPC server.
//!
//! One TCP listener; each connection is a framed request/response loop
//! until the operator disconnects. Requests address applications by name.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use relevo_proto::{Request, Response};
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

use crate::app::App;
use crate::{Error, Result};

/// Accepts operator connections and serves them until the listener fails.
pub async fn serve(
    listener: TcpListener,
    apps: Arc<HashMap<String, Arc<App>>>,
) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "operator connected");
        let apps = Arc::clone(&apps);
        tokio::spawn(async move {
            if let Err(e) = session(stream, &apps).await {
                error!(%peer, error = %e, "rpc session error");
            }
        });
    }
}

/// Handles one operator connection: read request, dispatch, reply.
async fn session(stream: TcpStream, apps: &HashMap<String, Arc<App>>) -> io::Result<()> {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    loop {
        let request: Request = match relevo_proto::recv(&mut reader).await {
            Ok(request) => request,
            // Clean disconnect.
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = dispatch(request, apps);
        relevo_proto::send(&mut writer, &response).await?;
    }
}

fn dispatch(request: Request, apps: &HashMap<String, Arc<App>>) -> Response {
    match request {
        // Start and Restart are deliberate synonyms: both launch a fresh
        // instance and rely on the tick to swap it in once healthy.
        Request::Start { app } | Request::Restart { app } => {
            with_app(apps, &app, |app| app.start_new_instance())
        }
        Request::Stop { app } => with_app(apps, &app, |app| app.stop_instances(None, false)),
        Request::Kill { app } => with_app(apps, &app, |app| app.stop_instances(None, true)),
        Request::Status { app } if app.is_empty() => {
            let mut sorted: Vec<&Arc<App>> = apps.values().collect();
            sorted.sort_by_key(|app| app.name().to_owned());
            Response::Status(sorted.into_iter().map(|app| app.report(3)).collect())
        }
        Request::Status { app } => match apps.get(&app) {
            Some(app) => Response::Status(vec![app.report(10)]),
            None => Response::Error(Error::InvalidApp(app).to_string()),
        },
    }
}

fn with_app(
    apps: &HashMap<String, Arc<App>>,
    name: &str,
    op: impl FnOnce(&App) -> Result<()>,
) -> Response {
    match apps.get(name) {
        Some(app) => match op(app) {
            Ok(()) => Response::Ok,
            Err(e) => Response::Error(e.to_string()),
        },
        None => Response::Error(Error::InvalidApp(name.to_owned()).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, LoggerConfig};
    use crate::ports::PortPool;

    fn test_apps(dir: &tempfile::TempDir) -> Arc<HashMap<String, Arc<App>>> {
        let logger = LoggerConfig {
            log_dir: dir.path().to_path_buf(),
            log_file: dir.path().join("daemon.log"),
            max_log_size: 1,
            max_logs_kept: 0,
            max_log_age: 0,
        };
        let pool = Arc::new(PortPool::new(10600, 10700));

        let mut apps = HashMap::new();
        for name in ["beta", "alpha"] {
            let config = AppConfig {
                name: name.into(),
                command: "sleep 5".into(),
                stop_signal: "TERM".into(),
                max_retries: 5,
                internal_host: "localhost".into(),
                external_host: "localhost".into(),
                external_port: 8080,
                stdout_log_file: Some(dir.path().join(format!("{name}.out"))),
                stderr_log_file: Some(dir.path().join(format!("{name}.err"))),
                ..Default::default()
            };
            apps.insert(name.to_owned(), App::new(config, &logger, Arc::clone(&pool)));
        }
        Arc::new(apps)
    }

    async fn client(apps: Arc<HashMap<String, Arc<App>>>) -> TcpStream {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, apps));
        TcpStream::connect(addr).await.unwrap()
    }

    async fn call(stream: &mut TcpStream, request: Request) -> Response {
        let (reader, writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        relevo_proto::send(&mut writer, &request).await.unwrap();
        relevo_proto::recv(&mut reader).await.unwrap()
    }

    #[tokio::test]
    async fn start_status_and_stop_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let apps = test_apps(&dir);
        let mut stream = client(Arc::clone(&apps)).await;

        let response = call(&mut stream, Request::Start { app: "alpha".into() }).await;
        assert!(matches!(response, Response::Ok));

        match call(&mut stream, Request::Status { app: "alpha".into() }).await {
            Response::Status(reports) => {
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].instances.len(), 1);
            }
            other => panic!("expected status, got {other:?}"),
        }

        let response = call(&mut stream, Request::Kill { app: "alpha".into() }).await;
        assert!(matches!(response, Response::Ok));
    }

    #[tokio::test]
    async fn empty_status_lists_all_apps_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let apps = test_apps(&dir);
        let mut stream = client(apps).await;

        match call(&mut stream, Request::Status { app: String::new() }).await {
            Response::Status(reports) => {
                let names: Vec<&str> = reports.iter().map(|r| r.name.as_str()).collect();
                assert_eq!(names, ["alpha", "beta"]);
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_app_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let apps = test_apps(&dir);
        let mut stream = client(apps).await;

        match call(&mut stream, Request::Restart { app: "ghost".into() }).await {
            Response::Error(message) => assert!(message.contains("ghost")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_with_nothing_running_reports_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let apps = test_apps(&dir);
        let mut stream = client(apps).await;

        match call(&mut stream, Request::Stop { app: "beta".into() }).await {
            Response::Error(message) => assert!(message.contains("not running")),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
