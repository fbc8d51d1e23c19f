//! One supervised child process and its lifecycle state machine.
//!
//! An instance is created in `Starting`, promoted to `Serving` once its
//! health probe passes, and moved to `Stopping` by a stop or kill request.
//! The stop path waits for the drain latch — the count of outstanding
//! request reservations — to reach zero before the stop signal is sent, so
//! in-flight work always completes first. All other transitions happen in
//! [`Instance::update_status`], driven by the supervisor tick.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::capture::{self, AppSinks};
use crate::config::{AppConfig, PORT_BADGE};
use crate::ports::PortPool;
use crate::Result;

/// Health probes give the child one second to answer.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(1);

/// HTTP client used for startup health probes.
pub type ProbeClient = Client<HttpConnector, Empty<Bytes>>;

/// Builds the shared health-probe client.
pub fn probe_client() -> ProbeClient {
    Client::builder(TokioExecutor::new()).build_http()
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Child spawned, health probe not yet passed.
    Starting,
    /// Active or swap-eligible; receives reservations when active.
    Serving,
    /// Stop requested; draining and/or awaiting child exit.
    Stopping,
    /// Child exited after a graceful stop.
    Stopped,
    /// Child was SIGKILLed (exit signal 9).
    Killed,
    /// Child exited on its own while serving, or disappeared mid-stop.
    Exited,
    /// Child could not be spawned, or died during startup.
    Failed,
    /// Child did not become healthy within `start_timeout`.
    TimedOut,
}

impl InstanceStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::Killed | Self::Exited | Self::Failed | Self::TimedOut
        )
    }

    /// Rank used only for report ordering: live states first.
    pub fn display_rank(self) -> u8 {
        match self {
            Self::Serving => 0,
            Self::Starting => 1,
            Self::Stopping => 2,
            _ => 3,
        }
    }

    /// Status word used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Killed => "killed",
            Self::Exited => "exited",
            Self::Failed => "failed",
            Self::TimedOut => "timed out",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured exit state of the child.
#[derive(Debug, Clone, Copy)]
struct ExitState {
    /// Raw termination signal, if the child died to one.
    signal: Option<i32>,
}

/// Count of outstanding reservations, awaitable at zero.
#[derive(Debug, Default)]
struct DrainLatch {
    count: AtomicI64,
    zero: Notify,
}

impl DrainLatch {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.zero.notify_waiters();
        }
    }

    async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            if self.count.load(Ordering::Acquire) <= 0 {
                return;
            }
            notified.await;
        }
    }
}

/// A port held from the pool, returned at most once.
#[derive(Debug)]
struct PortLease {
    pool: Arc<PortPool>,
    port: u16,
    released: AtomicBool,
}

impl PortLease {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.pool.release(self.port);
        }
    }
}

#[derive(Debug)]
struct State {
    status: InstanceStatus,
    last_change: Instant,
}

/// One child process with its port lease, status, and drain accounting.
pub struct Instance {
    id: u32,
    host_port: String,
    config: Arc<AppConfig>,
    probe: ProbeClient,

    state: Mutex<State>,
    drain: Arc<DrainLatch>,
    lease: Arc<PortLease>,

    pid: Option<i32>,
    spawn_failed: bool,
    exit: OnceLock<ExitState>,
    last_error: Mutex<Option<String>>,
}

impl Instance {
    /// Leases a port and spawns the child.
    ///
    /// A spawn failure does not error here: the instance is still created
    /// (holding its lease) and resolves to `Failed` on the next status
    /// update, exactly like a child that crashed right after exec. Only
    /// port exhaustion is an immediate error.
    pub fn launch(
        id: u32,
        config: Arc<AppConfig>,
        pool: Arc<PortPool>,
        probe: ProbeClient,
        sinks: Arc<AppSinks>,
    ) -> Result<Arc<Self>> {
        let port = pool.reserve()?;
        let host_port = format!("{}:{}", config.internal_host, port);
        let (program, args) = split_command(&config.command, port);

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        for entry in &config.environment {
            let entry = entry.replace(PORT_BADGE, &port.to_string());
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &config.directory {
            cmd.current_dir(dir);
        }
        if let Some(uid) = config.uid() {
            cmd.uid(uid);
        }

        let (child, spawn_error) = match cmd.spawn() {
            Ok(child) => (Some(child), None),
            Err(e) => (None, Some(format!("spawn {program}: {e}"))),
        };

        let instance = Arc::new(Self {
            id,
            host_port,
            config,
            probe,
            state: Mutex::new(State {
                status: InstanceStatus::Starting,
                last_change: Instant::now(),
            }),
            drain: Arc::new(DrainLatch::default()),
            lease: Arc::new(PortLease {
                pool,
                port,
                released: AtomicBool::new(false),
            }),
            pid: child.as_ref().and_then(|c| c.id()).map(|p| p as i32),
            spawn_failed: spawn_error.is_some(),
            exit: OnceLock::new(),
            last_error: Mutex::new(spawn_error),
        });

        if let Some(mut child) = child {
            if let (Some(out), Some(err)) = (child.stdout.take(), child.stderr.take()) {
                capture::spawn_line_readers(id, out, err, sinks);
            }

            let inst = Arc::clone(&instance);
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        let _ = inst.exit.set(ExitState {
                            signal: status.signal(),
                        });
                        if !status.success() {
                            inst.record_error(status.to_string());
                        }
                    }
                    Err(e) => {
                        inst.record_error(format!("wait: {e}"));
                        let _ = inst.exit.set(ExitState { signal: None });
                    }
                }
            });
        }

        Ok(instance)
    }

    /// Instance id, unique per application.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Leased internal port.
    pub fn port(&self) -> u16 {
        self.lease.port
    }

    /// Internal `host:port` the child is expected to listen on.
    pub fn host_port(&self) -> &str {
        &self.host_port
    }

    /// Current status. May be one tick stale for readers outside the tick.
    pub fn status(&self) -> InstanceStatus {
        self.lock_state().status
    }

    /// Time since the last status change.
    pub fn since_change(&self) -> Duration {
        self.lock_state().last_change.elapsed()
    }

    /// Last captured process error, for reporting.
    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Takes one reservation. Called under the app's active-instance lock.
    pub fn serve(&self) {
        self.drain.add();
    }

    /// Releases one reservation. Called on request/connection completion,
    /// never under the active-instance lock.
    pub fn done(&self) {
        self.drain.done();
    }

    /// Requests a graceful stop: the instance moves to `Stopping` at once,
    /// and the configured stop signal is delivered only after every
    /// outstanding reservation has been released.
    pub fn stop(&self) {
        if !self.enter_stopping(false) {
            return;
        }
        debug!(instance = self.id, "draining before stop signal");

        let drain = Arc::clone(&self.drain);
        let pid = self.pid;
        let sig = self.config.stop_signal();
        let id = self.id;
        tokio::spawn(async move {
            drain.wait().await;
            let Some(pid) = pid else { return };
            if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
                warn!(instance = id, signal = %sig, error = %e, "stop signal failed");
            }
        });
    }

    /// Kills the child immediately, bypassing the drain.
    pub fn kill(&self) {
        if !self.enter_stopping(true) {
            return;
        }
        self.send_signal(Signal::SIGKILL);
    }

    /// Re-evaluates the state machine and returns the (possibly new)
    /// status. Only the supervisor tick calls this; `stop`/`kill` are the
    /// only transitions taken elsewhere.
    pub async fn update_status(&self) -> InstanceStatus {
        let observed = self.status();
        let next = match observed {
            InstanceStatus::Starting => self.check_starting().await,
            InstanceStatus::Serving => self.check_serving(),
            InstanceStatus::Stopping => self.check_stopping(),
            terminal => return terminal,
        };
        self.apply_transition(observed, next)
    }

    async fn check_starting(&self) -> InstanceStatus {
        if self.spawn_failed || self.exit.get().is_some() {
            return InstanceStatus::Failed;
        }

        if self.config.start_timeout > 0
            && self.since_change() > Duration::from_secs(self.config.start_timeout)
        {
            self.record_error("did not become healthy within start_timeout".into());
            self.send_signal(Signal::SIGKILL);
            return InstanceStatus::TimedOut;
        }

        if self.pid.is_none() {
            return InstanceStatus::Starting;
        }

        if self.health_check().await {
            InstanceStatus::Serving
        } else {
            InstanceStatus::Starting
        }
    }

    fn check_serving(&self) -> InstanceStatus {
        if self.spawn_failed || self.exit.get().is_some() {
            InstanceStatus::Exited
        } else {
            InstanceStatus::Serving
        }
    }

    fn check_stopping(&self) -> InstanceStatus {
        if let Some(exit) = self.exit.get() {
            return if exit.signal == Some(Signal::SIGKILL as i32) {
                InstanceStatus::Killed
            } else {
                InstanceStatus::Stopped
            };
        }

        // A stop can land on an instance whose spawn already failed.
        if self.pid.is_none() {
            return InstanceStatus::Exited;
        }

        if self.config.stop_timeout > 0
            && self.since_change() > Duration::from_secs(self.config.stop_timeout)
        {
            self.send_signal(Signal::SIGKILL);
            return InstanceStatus::Killed;
        }

        InstanceStatus::Stopping
    }

    /// Commits `next` only if the status is still the one the check was
    /// computed from; a concurrent `stop`/`kill` wins otherwise, which is
    /// what keeps a stopped instance from ever re-entering `Serving`.
    fn apply_transition(&self, observed: InstanceStatus, next: InstanceStatus) -> InstanceStatus {
        let mut state = self.lock_state();
        if state.status != observed {
            return state.status;
        }
        if next != observed {
            state.status = next;
            state.last_change = Instant::now();
            drop(state);
            debug!(instance = self.id, from = %observed, to = %next, "status change");
            if next.is_terminal() {
                // The lease goes back to the pool once the last
                // reservation drains — exactly once.
                let drain = Arc::clone(&self.drain);
                let lease = Arc::clone(&self.lease);
                tokio::spawn(async move {
                    drain.wait().await;
                    lease.release();
                });
            }
        }
        next
    }

    fn enter_stopping(&self, force: bool) -> bool {
        let mut state = self.lock_state();
        if state.status.is_terminal() {
            return false;
        }
        // A second graceful stop is a no-op; a kill still escalates.
        if state.status == InstanceStatus::Stopping && !force {
            return false;
        }
        state.status = InstanceStatus::Stopping;
        state.last_change = Instant::now();
        true
    }

    async fn health_check(&self) -> bool {
        let Some(path) = &self.config.healthcheck else {
            return true;
        };
        let Ok(uri) = format!("http://{}{}", self.host_port, path).parse::<hyper::Uri>() else {
            return false;
        };
        match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.probe.get(uri)).await {
            Ok(Ok(resp)) => resp.status() == http::StatusCode::OK,
            _ => false,
        }
    }

    fn send_signal(&self, sig: Signal) {
        let Some(pid) = self.pid else { return };
        if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
            self.record_error(format!("{sig} delivery failed: {e}"));
            warn!(instance = self.id, signal = %sig, error = %e, "signal delivery failed");
        }
    }

    fn record_error(&self, error: String) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Substitutes `{port}` and splits on spaces. argv\[0\] is the executable;
/// no shell metacharacter handling.
fn split_command(template: &str, port: u16) -> (String, Vec<String>) {
    let substituted = template.replace(PORT_BADGE, &port.to_string());
    let mut parts = substituted
        .split(' ')
        .filter(|p| !p.is_empty())
        .map(String::from);
    let program = parts.next().unwrap_or_default();
    (program, parts.collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoggerConfig;

    fn test_config(command: &str) -> AppConfig {
        AppConfig {
            name: "test".into(),
            command: command.into(),
            stop_signal: "TERM".into(),
            internal_host: "localhost".into(),
            ..Default::default()
        }
    }

    fn test_sinks(dir: &tempfile::TempDir, config: &AppConfig) -> Arc<AppSinks> {
        let logger = LoggerConfig {
            log_dir: dir.path().to_path_buf(),
            log_file: dir.path().join("daemon.log"),
            max_log_size: 1,
            max_logs_kept: 0,
            max_log_age: 0,
        };
        let mut config = config.clone();
        config.stdout_log_file = Some(dir.path().join("out"));
        config.stderr_log_file = Some(dir.path().join("err"));
        Arc::new(AppSinks::new(&config, &logger))
    }

    fn launch(config: AppConfig, pool: Arc<PortPool>, dir: &tempfile::TempDir) -> Arc<Instance> {
        let sinks = test_sinks(dir, &config);
        Instance::launch(1, Arc::new(config), pool, probe_client(), sinks).unwrap()
    }

    async fn wait_terminal(instance: &Instance) -> InstanceStatus {
        for _ in 0..100 {
            let status = instance.update_status().await;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("instance never reached a terminal status");
    }

    #[test]
    fn command_split_substitutes_port() {
        let (program, args) = split_command("./serve --port={port} -v", 10123);
        assert_eq!(program, "./serve");
        assert_eq!(args, ["--port=10123", "-v"]);
    }

    #[test]
    fn command_split_collapses_repeated_spaces() {
        let (program, args) = split_command("app  {port}", 9);
        assert_eq!(program, "app");
        assert_eq!(args, ["9"]);
    }

    #[tokio::test]
    async fn spawn_failure_resolves_to_failed_and_releases_port() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(10000, 10001));
        let instance = launch(
            test_config("./no-such-binary-anywhere {port}"),
            Arc::clone(&pool),
            &dir,
        );

        assert_eq!(instance.status(), InstanceStatus::Starting);
        assert_eq!(instance.update_status().await, InstanceStatus::Failed);
        assert!(instance.last_error().is_some());

        // The lease comes back once the (empty) drain settles.
        for _ in 0..100 {
            if pool.reserve().is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("port was never released");
    }

    #[tokio::test]
    async fn healthy_child_serves_then_stops_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(10100, 10110));
        let instance = launch(test_config("sleep 5"), pool, &dir);

        // No healthcheck configured: healthy as soon as the child has a pid.
        assert_eq!(instance.update_status().await, InstanceStatus::Serving);

        instance.stop();
        assert_eq!(instance.status(), InstanceStatus::Stopping);
        // SIGTERM, not SIGKILL, so the terminal status is Stopped.
        assert_eq!(wait_terminal(&instance).await, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn killed_child_reports_killed() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(10120, 10130));
        let instance = launch(test_config("sleep 5"), pool, &dir);

        assert_eq!(instance.update_status().await, InstanceStatus::Serving);
        instance.kill();
        assert_eq!(wait_terminal(&instance).await, InstanceStatus::Killed);
    }

    #[tokio::test]
    async fn stop_signal_waits_for_drain() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(10140, 10150));
        let instance = launch(test_config("sleep 5"), pool, &dir);

        assert_eq!(instance.update_status().await, InstanceStatus::Serving);

        instance.serve();
        instance.stop();

        // The reservation is still out, so the signal must not have been
        // delivered: the child stays alive and the status stays Stopping.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(instance.update_status().await, InstanceStatus::Stopping);

        instance.done();
        assert_eq!(wait_terminal(&instance).await, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_timeout_escalates_to_sigkill() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(10160, 10170));

        // The command splitter has no shell quoting, so a child that
        // ignores TERM needs its own script.
        let script = dir.path().join("stubborn.sh");
        std::fs::write(&script, "#!/bin/sh\ntrap '' TERM\nsleep 5\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = test_config(&script.display().to_string());
        config.stop_timeout = 1;
        let instance = launch(config, pool, &dir);

        assert_eq!(instance.update_status().await, InstanceStatus::Serving);
        instance.stop();

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(instance.update_status().await, InstanceStatus::Killed);
    }

    #[tokio::test]
    async fn start_timeout_produces_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(10180, 10190));
        let mut config = test_config("sleep 5");
        // Probe a path nothing listens on, so the child never turns healthy.
        config.healthcheck = Some("/health".into());
        config.start_timeout = 1;
        let instance = launch(config, pool, &dir);

        assert_eq!(instance.update_status().await, InstanceStatus::Starting);

        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert_eq!(instance.update_status().await, InstanceStatus::TimedOut);
    }

    #[tokio::test]
    async fn stopping_instance_never_returns_to_serving() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(PortPool::new(10200, 10210));
        let instance = launch(test_config("sleep 5"), pool, &dir);

        assert_eq!(instance.update_status().await, InstanceStatus::Serving);
        instance.serve(); // hold the drain open so Stopping persists
        instance.stop();

        let status = instance.update_status().await;
        assert_ne!(status, InstanceStatus::Serving);
        assert_eq!(status, InstanceStatus::Stopping);

        instance.done();
        let _ = wait_terminal(&instance).await;
    }
}
