//! YAML configuration: document schema, defaulting, and validation.
//!
//! The daemon reads `relevo.yaml` from its configuration directory, then
//! expands `apps_include` entries (single-app YAML files, or directories of
//! them) before validating the merged document.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use serde::Deserialize;

/// Name of the main configuration file inside the config directory.
pub const CONFIG_FILE: &str = "relevo.yaml";

/// Token substituted with the leased internal port in commands and
/// environment entries.
pub const PORT_BADGE: &str = "{port}";

const DEFAULT_PORT_FROM: u16 = 10000;
const DEFAULT_PORT_TO: u16 = 11000;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_RPC_PORT: u16 = relevo_proto::DEFAULT_RPC_PORT;
const DEFAULT_EXTERNAL_PORT: u16 = 8080;

const DEFAULT_STOP_SIGNAL: &str = "TERM";
const DEFAULT_MAX_RETRIES: u32 = 5;

const DEFAULT_LOG_DIR: &str = "/var/log/relevo";
const DEFAULT_LOG_FILE: &str = "/var/log/relevo/relevo.log";
/// Default size, in MiB, at which a log file is rotated.
const DEFAULT_MAX_LOG_SIZE: u64 = 500;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// `port_range` is empty or inverted.
    #[error("invalid port range")]
    InvalidPortRange,

    /// An app entry has no `name`.
    #[error("name must be specified for app")]
    NameRequired,

    /// An app entry has no `command`.
    #[error("command must be specified for app '{0}'")]
    CommandRequired(String),

    /// Neither the command nor any environment entry contains `{port}`.
    #[error("app '{0}' must have {{port}} in command or environment")]
    PortBadgeRequired(String),

    /// `stop_signal` is not one of the supported symbolic names.
    #[error("invalid stop signal '{0}'")]
    InvalidStopSignal(String),

    /// Two apps share an external port.
    #[error("cannot use duplicate external app port {0}")]
    DuplicateExternalPort(u16),

    /// Two apps share a name.
    #[error("cannot use duplicate app name '{0}'")]
    DuplicateAppName(String),

    /// A configured username does not exist on this system.
    #[error("unknown user '{0}'")]
    UnknownUser(String),

    /// The document is not valid YAML for the expected schema.
    #[error("config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The config file or an include could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Internal port range handed to the port pool.
    #[serde(default)]
    pub port_range: PortRange,
    /// Managed applications.
    #[serde(default)]
    pub apps: Vec<AppConfig>,
    /// Operator RPC listener.
    #[serde(default)]
    pub rpc: RpcConfig,
    /// Daemon and per-app log sinks.
    #[serde(default)]
    pub logger: LoggerConfig,
    /// Daemon-wide default user identity for children.
    #[serde(default)]
    pub user: Option<UserConfig>,
    /// Extra single-app YAML files or directories of them.
    #[serde(default)]
    pub apps_include: Vec<PathBuf>,
}

/// Internal `[from, to)` port range.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PortRange {
    /// First port of the range (inclusive).
    #[serde(default)]
    pub from: u16,
    /// End of the range (exclusive).
    #[serde(default)]
    pub to: u16,
}

/// Which protocol the front proxy speaks on the external port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// HTTP/1.1 reverse proxy.
    #[default]
    Http,
    /// Raw TCP forwarding.
    Tcp,
}

/// One managed application.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Unique application name.
    #[serde(default)]
    pub name: String,
    /// Command template; `{port}` is replaced with the leased port.
    #[serde(default)]
    pub command: String,
    /// `KEY=VALUE` environment entries, `{port}`-substituted as well.
    #[serde(default)]
    pub environment: Vec<String>,
    /// HTTP path probed during startup; omit to treat a spawned child as
    /// healthy immediately.
    #[serde(default)]
    pub healthcheck: Option<String>,
    /// Working directory applied before exec.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Symbolic stop signal name (`TERM`, `INT`, `HUP`, `QUIT`, `USR1`,
    /// `USR2`, `KILL`). Defaults to `TERM`.
    #[serde(default)]
    pub stop_signal: String,
    /// Restart attempts after a failed start before giving up.
    #[serde(default)]
    pub max_retries: u32,
    /// Seconds a child may stay in `Starting` before it is killed.
    /// 0 disables the timeout.
    #[serde(default)]
    pub start_timeout: u64,
    /// Seconds a stopping child may keep draining before SIGKILL.
    /// 0 disables the timeout.
    #[serde(default)]
    pub stop_timeout: u64,

    /// Host the child binds its leased port on.
    #[serde(default)]
    pub internal_host: String,
    /// Host the external listener binds on.
    #[serde(default)]
    pub external_host: String,
    /// Stable external port, unique across apps.
    #[serde(default)]
    pub external_port: u16,
    /// Front proxy mode.
    #[serde(default)]
    pub proxy: ProxyMode,

    /// Child stdout log file; defaults to `<log_dir>/app_<name>.out`.
    #[serde(default)]
    pub stdout_log_file: Option<PathBuf>,
    /// Child stderr log file; defaults to `<log_dir>/app_<name>.err`.
    #[serde(default)]
    pub stderr_log_file: Option<PathBuf>,

    /// User identity the child runs as; defaults to the daemon-wide entry.
    #[serde(default)]
    pub user: Option<UserConfig>,
}

/// RPC listener address.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcConfig {
    /// Host to bind.
    #[serde(default)]
    pub host: String,
    /// Port to bind.
    #[serde(default)]
    pub port: u16,
}

/// Log sink settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggerConfig {
    /// Directory for per-app child output files.
    #[serde(default)]
    pub log_dir: PathBuf,
    /// Daemon log file.
    #[serde(default)]
    pub log_file: PathBuf,
    /// Size, in MiB, at which a log file is rotated.
    #[serde(default)]
    pub max_log_size: u64,
    /// Rotated files kept per log; 0 keeps everything.
    #[serde(default)]
    pub max_logs_kept: u32,
    /// Days after which rotated files are pruned; 0 keeps everything.
    #[serde(default)]
    pub max_log_age: u32,
}

/// Identity a child process runs as.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    /// Username looked up at validation time.
    pub username: String,
    /// Resolved numeric uid.
    #[serde(skip)]
    pub uid: Option<u32>,
}

impl Config {
    /// Reads `relevo.yaml` from `dir`, expands includes, and validates.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(dir.join(CONFIG_FILE))?;
        let mut config: Config = serde_yaml::from_str(&data)?;

        for inc in config.apps_include.clone() {
            config.include(&inc)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a document from a string, without includes.
    pub fn from_yaml(data: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn include(&mut self, path: &Path) -> Result<(), ConfigError> {
        if std::fs::metadata(path)?.is_dir() {
            for entry in std::fs::read_dir(path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    self.include_file(&entry.path())?;
                }
            }
        } else {
            self.include_file(path)?;
        }
        Ok(())
    }

    fn include_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        if path.file_name().is_some_and(|n| n == CONFIG_FILE) {
            return Ok(());
        }
        if path.extension().is_none_or(|e| e != "yaml") {
            return Ok(());
        }

        let data = std::fs::read_to_string(path)?;
        let app: AppConfig = serde_yaml::from_str(&data)?;
        self.apps.push(app);
        Ok(())
    }

    /// Applies defaults and checks document-wide invariants.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.port_range.from == 0 && self.port_range.to == 0 {
            self.port_range.from = DEFAULT_PORT_FROM;
            self.port_range.to = DEFAULT_PORT_TO;
        }
        if self.port_range.from >= self.port_range.to {
            return Err(ConfigError::InvalidPortRange);
        }

        if self.rpc.host.is_empty() {
            self.rpc.host = DEFAULT_HOST.into();
        }
        if self.rpc.port == 0 {
            self.rpc.port = DEFAULT_RPC_PORT;
        }

        self.logger.validate();

        if let Some(user) = &mut self.user {
            user.resolve()?;
        }

        let mut used_ports = HashSet::new();
        let mut used_names = HashSet::new();
        for app in &mut self.apps {
            app.validate(&self.logger, self.user.as_ref())?;

            if !used_ports.insert(app.external_port) {
                return Err(ConfigError::DuplicateExternalPort(app.external_port));
            }
            if !used_names.insert(app.name.clone()) {
                return Err(ConfigError::DuplicateAppName(app.name.clone()));
            }
        }

        Ok(())
    }
}

impl LoggerConfig {
    fn validate(&mut self) {
        if self.log_dir.as_os_str().is_empty() {
            self.log_dir = DEFAULT_LOG_DIR.into();
        }
        if self.log_file.as_os_str().is_empty() {
            self.log_file = DEFAULT_LOG_FILE.into();
        }
        if self.max_log_size == 0 {
            self.max_log_size = DEFAULT_MAX_LOG_SIZE;
        }
    }

    /// Rotation size in bytes.
    pub fn max_log_size_bytes(&self) -> u64 {
        self.max_log_size * 1024 * 1024
    }
}

impl AppConfig {
    fn validate(
        &mut self,
        logger: &LoggerConfig,
        default_user: Option<&UserConfig>,
    ) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::NameRequired);
        }
        if self.command.is_empty() {
            return Err(ConfigError::CommandRequired(self.name.clone()));
        }
        if !self.has_port_badge() {
            return Err(ConfigError::PortBadgeRequired(self.name.clone()));
        }

        if self.stop_signal.is_empty() {
            self.stop_signal = DEFAULT_STOP_SIGNAL.into();
        }
        if signal_from_name(&self.stop_signal).is_none() {
            return Err(ConfigError::InvalidStopSignal(self.stop_signal.clone()));
        }

        if self.max_retries == 0 {
            self.max_retries = DEFAULT_MAX_RETRIES;
        }
        if self.internal_host.is_empty() {
            self.internal_host = DEFAULT_HOST.into();
        }
        if self.external_host.is_empty() {
            self.external_host = DEFAULT_HOST.into();
        }
        if self.external_port == 0 {
            self.external_port = DEFAULT_EXTERNAL_PORT;
        }

        if self.stdout_log_file.is_none() {
            self.stdout_log_file = Some(logger.log_dir.join(format!("app_{}.out", self.name)));
        }
        if self.stderr_log_file.is_none() {
            self.stderr_log_file = Some(logger.log_dir.join(format!("app_{}.err", self.name)));
        }

        if self.user.is_none() {
            self.user = default_user.cloned();
        }
        if let Some(user) = &mut self.user {
            user.resolve()?;
        }

        Ok(())
    }

    fn has_port_badge(&self) -> bool {
        self.command.contains(PORT_BADGE)
            || self.environment.iter().any(|e| e.contains(PORT_BADGE))
    }

    /// Parsed stop signal. Validation guarantees the name is known.
    pub fn stop_signal(&self) -> Signal {
        signal_from_name(&self.stop_signal).unwrap_or(Signal::SIGTERM)
    }

    /// External `host:port` string for binding and reporting.
    pub fn external_addr(&self) -> String {
        format!("{}:{}", self.external_host, self.external_port)
    }

    /// Resolved uid for the child, if a user is configured.
    pub fn uid(&self) -> Option<u32> {
        self.user.as_ref().and_then(|u| u.uid)
    }
}

impl UserConfig {
    fn resolve(&mut self) -> Result<(), ConfigError> {
        if self.uid.is_some() {
            return Ok(());
        }
        match nix::unistd::User::from_name(&self.username) {
            Ok(Some(user)) => {
                self.uid = Some(user.uid.as_raw());
                Ok(())
            }
            _ => Err(ConfigError::UnknownUser(self.username.clone())),
        }
    }
}

/// Maps a symbolic signal name to the signal delivered on stop.
pub fn signal_from_name(name: &str) -> Option<Signal> {
    match name {
        "TERM" => Some(Signal::SIGTERM),
        "INT" => Some(Signal::SIGINT),
        "HUP" => Some(Signal::SIGHUP),
        "QUIT" => Some(Signal::SIGQUIT),
        "USR1" => Some(Signal::SIGUSR1),
        "USR2" => Some(Signal::SIGUSR2),
        "KILL" => Some(Signal::SIGKILL),
        _ => None,
    }
}
