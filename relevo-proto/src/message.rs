//! Protocol message types for the operator RPC.

use serde::{Deserialize, Serialize};

/// Default host the daemon RPC listener binds to.
pub const DEFAULT_RPC_HOST: &str = "localhost";

/// Default port the daemon RPC listener binds to.
pub const DEFAULT_RPC_PORT: u16 = 9001;

/// Request sent from `relevoctl` to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Start a new instance of the named application.
    Start {
        /// Application name from the daemon configuration.
        app: String,
    },
    /// Restart the named application.
    ///
    /// Synonym for [`Request::Start`]: both launch a fresh instance and let
    /// the supervisor swap it in once healthy, whether or not an instance
    /// is currently active.
    Restart {
        /// Application name from the daemon configuration.
        app: String,
    },
    /// Gracefully stop all running instances of the named application.
    Stop {
        /// Application name from the daemon configuration.
        app: String,
    },
    /// Forcefully kill all running instances of the named application.
    Kill {
        /// Application name from the daemon configuration.
        app: String,
    },
    /// Request a status report.
    Status {
        /// Application name; empty means all applications.
        app: String,
    },
}

/// Response sent from the daemon to `relevoctl`.
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    /// The request was carried out.
    Ok,
    /// Status report, one entry per application.
    Status(Vec<AppReport>),
    /// The request failed.
    Error(String),
}

/// Status snapshot of one application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppReport {
    /// Application name.
    pub name: String,
    /// External host clients connect to.
    pub external_host: String,
    /// External port clients connect to.
    pub external_port: u16,
    /// Most recent instances, serving/starting/stopping first.
    pub instances: Vec<InstanceReport>,
}

/// Status snapshot of one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    /// Instance id, unique per application.
    pub id: u32,
    /// Whether this instance currently receives new reservations.
    pub active: bool,
    /// Internal host the child is bound to.
    pub host: String,
    /// Internal port leased from the pool.
    pub port: u16,
    /// Lifecycle status word (`serving`, `starting`, ...).
    pub status: String,
    /// Seconds since the last status change.
    pub since_change_secs: u64,
    /// Last captured process error, if any.
    pub error: Option<String>,
}
