//! Raw TCP front proxy for one application's external port.
//!
//! Each accepted connection takes a semaphore slot, reserves the active
//! instance, and runs two copy tasks (client→backend and backend→client)
//! over buffers from a shared free-list. One idle deadline covers the
//! connection as a whole: it applies from the start and is pushed back by
//! traffic in either direction, so a connection streaming one way is never
//! cut for being quiet the other way. The end of either direction closes
//! the opposite write half. The reservation is released after both copies
//! finish, the slot once the connection is fully closed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::app::App;

/// Cap on concurrent proxied connections per application.
const MAX_CONNECTIONS: usize = 4096;

/// Connections with no traffic in either direction for this long are cut.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of one copy buffer.
const BUFFER_SIZE: usize = 0xffff;

/// Free-list of copy buffers shared by all connections of one app.
#[derive(Debug, Default)]
struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    fn get(&self) -> Vec<u8> {
        self.free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| vec![0u8; BUFFER_SIZE])
    }

    fn put(&self, buf: Vec<u8>) {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).push(buf);
    }
}

/// Connection-wide idle deadline shared by both copy directions.
#[derive(Debug)]
struct IdleClock {
    deadline: Mutex<Instant>,
}

impl IdleClock {
    fn new() -> Self {
        Self {
            deadline: Mutex::new(Instant::now() + IDLE_TIMEOUT),
        }
    }

    /// Pushes the deadline back; called on every completed read.
    fn extend(&self) {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now() + IDLE_TIMEOUT;
    }

    fn deadline(&self) -> Instant {
        *self.deadline.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Serves the app's external port as a raw TCP proxy.
pub async fn serve(app: Arc<App>, listener: TcpListener) -> std::io::Result<()> {
    let slots = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    let buffers = Arc::new(BufferPool::default());

    loop {
        let Ok(slot) = Arc::clone(&slots).acquire_owned().await else {
            return Ok(());
        };
        let (conn, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(app = %app.name(), error = %e, "accept failed");
                continue;
            }
        };

        let app = Arc::clone(&app);
        let buffers = Arc::clone(&buffers);
        tokio::spawn(async move {
            if let Err(e) = process(&app, conn, &buffers).await {
                debug!(app = %app.name(), peer = %peer, error = %e, "connection error");
            }
            drop(slot);
        });
    }
}

async fn process(app: &App, client: TcpStream, buffers: &Arc<BufferPool>) -> std::io::Result<()> {
    let reservation = match app.reserve_active() {
        Ok(reservation) => reservation,
        Err(e) => {
            warn!(app = %app.name(), error = %e, "refusing connection");
            return Ok(());
        }
    };

    let backend = TcpStream::connect(reservation.host_port()).await?;

    let (client_read, client_write) = client.into_split();
    let (backend_read, backend_write) = backend.into_split();

    let clock = Arc::new(IdleClock::new());
    let upstream = tokio::spawn(copy_half(
        client_read,
        backend_write,
        Arc::clone(&clock),
        Arc::clone(buffers),
    ));
    let downstream = tokio::spawn(copy_half(
        backend_read,
        client_write,
        clock,
        Arc::clone(buffers),
    ));
    let _ = upstream.await;
    let _ = downstream.await;

    // Both directions are done; the release may now let a pending stop
    // signal the instance.
    drop(reservation);
    Ok(())
}

/// Copies one direction until EOF, error, or idle expiry, then closes the
/// destination's write half so the peer sees the end of stream.
async fn copy_half(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    clock: Arc<IdleClock>,
    buffers: Arc<BufferPool>,
) {
    let mut buf = buffers.get();
    while let Some(n) = read_idle(&mut src, &mut buf, &clock).await {
        clock.extend();
        if dst.write_all(&buf[..n]).await.is_err() {
            break;
        }
    }
    let _ = dst.shutdown().await;
    buffers.put(buf);
}

/// Reads once, parked against the shared idle deadline. Returns `None` on
/// EOF, error, or idle expiry.
async fn read_idle(src: &mut OwnedReadHalf, buf: &mut [u8], clock: &IdleClock) -> Option<usize> {
    loop {
        let deadline = clock.deadline();
        match time::timeout_at(deadline, src.read(buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) => return None,
            Ok(Ok(n)) => return Some(n),
            Err(_) => {
                // Traffic on the other direction may have pushed the
                // deadline back while this read was parked.
                if clock.deadline() <= deadline {
                    return None;
                }
            }
        }
    }
}
