//! Per-application supervisor.
//!
//! Owns the instance list and the active-instance pointer, and runs the
//! once-per-second tick that drives promotions, demotions, and restarts.
//! The swap protocol: when a non-active instance turns `Serving`, the tick
//! installs it as active under the write lock and only then asks the
//! previous active to stop, so every reservation either already holds the
//! old instance (and drains normally) or observes the new one.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use relevo_proto::{AppReport, InstanceReport};
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::capture::AppSinks;
use crate::config::{AppConfig, LoggerConfig};
use crate::instance::{probe_client, Instance, InstanceStatus, ProbeClient};
use crate::ports::PortPool;
use crate::{Error, Result};

/// Supervisor for one configured application.
pub struct App {
    config: Arc<AppConfig>,
    pool: Arc<PortPool>,
    sinks: Arc<AppSinks>,
    probe: ProbeClient,

    /// All instances ever started, in insertion order, kept for reporting.
    instances: Mutex<Vec<Arc<Instance>>>,
    /// The instance new reservations are directed to.
    active: RwLock<Option<Arc<Instance>>>,
    next_id: AtomicU32,
}

impl App {
    /// Builds the supervisor for `config`. No instance is started yet.
    pub fn new(config: AppConfig, logger: &LoggerConfig, pool: Arc<PortPool>) -> Arc<Self> {
        let sinks = Arc::new(AppSinks::new(&config, logger));
        Arc::new(Self {
            config: Arc::new(config),
            pool,
            sinks,
            probe: probe_client(),
            instances: Mutex::new(Vec::new()),
            active: RwLock::new(None),
            next_id: AtomicU32::new(0),
        })
    }

    /// Application name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Application configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Launches a fresh instance. Any instance still in `Starting` is
    /// superseded and asked to stop first.
    pub fn start_new_instance(&self) -> Result<()> {
        let mut instances = self.lock_instances();
        for instance in instances.iter() {
            if instance.status() == InstanceStatus::Starting {
                instance.stop();
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let instance = Instance::launch(
            id,
            Arc::clone(&self.config),
            Arc::clone(&self.pool),
            self.probe.clone(),
            Arc::clone(&self.sinks),
        )?;
        info!(
            app = %self.config.name,
            instance = id,
            port = instance.port(),
            "started new instance"
        );
        instances.push(instance);
        Ok(())
    }

    /// Stops (or kills) matching instances in `Serving` or `Starting`.
    ///
    /// `id` restricts the request to one instance; `None` targets all.
    pub fn stop_instances(&self, id: Option<u32>, kill: bool) -> Result<()> {
        let mut matched = false;
        for instance in self.lock_instances().iter() {
            if id.is_some_and(|id| instance.id() != id) {
                continue;
            }
            if matches!(
                instance.status(),
                InstanceStatus::Serving | InstanceStatus::Starting
            ) {
                matched = true;
                if kill {
                    instance.kill();
                } else {
                    instance.stop();
                }
            }
        }
        if matched {
            Ok(())
        } else {
            Err(Error::NotRunning)
        }
    }

    /// Reserves the active instance for one request or connection.
    ///
    /// The drain latch is incremented while the read lock is still held, so
    /// a concurrent swap can never signal (or release the port of) an
    /// instance this reservation is about to use.
    pub fn reserve_active(&self) -> Result<Reservation> {
        let active = self.read_active();
        match active.as_ref() {
            Some(instance) => {
                instance.serve();
                Ok(Reservation {
                    instance: Arc::clone(instance),
                })
            }
            None => Err(Error::NoActiveInstance),
        }
    }

    /// Status snapshot covering the last `last` instances,
    /// serving/starting/stopping ranked first.
    pub fn report(&self, last: usize) -> AppReport {
        let instances = self.lock_instances();
        let active = self.read_active().clone();
        let from = instances.len().saturating_sub(last);

        let mut entries: Vec<(u8, InstanceReport)> = instances[from..]
            .iter()
            .map(|instance| {
                let status = instance.status();
                let report = InstanceReport {
                    id: instance.id(),
                    active: active
                        .as_ref()
                        .is_some_and(|active| Arc::ptr_eq(active, instance)),
                    host: self.config.internal_host.clone(),
                    port: instance.port(),
                    status: status.to_string(),
                    since_change_secs: instance.since_change().as_secs(),
                    error: instance.last_error(),
                };
                (status.display_rank(), report)
            })
            .collect();
        // Stable: terminal instances keep insertion order among themselves.
        entries.sort_by_key(|(rank, _)| *rank);

        AppReport {
            name: self.config.name.clone(),
            external_host: self.config.external_host.clone(),
            external_port: self.config.external_port,
            instances: entries.into_iter().map(|(_, report)| report).collect(),
        }
    }

    /// Spawns this app's supervisor tick, one pass per second.
    pub fn spawn_tick(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let app = self;
        tokio::spawn(async move {
            let mut ticker = time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut retries = 0;
            loop {
                ticker.tick().await;
                app.tick(&mut retries).await;
            }
        })
    }

    /// One pass over all instances: refresh statuses, then promote, demote,
    /// and retry. Serialized with itself by the single tick task.
    pub(crate) async fn tick(&self, retries: &mut u32) {
        let instances: Vec<Arc<Instance>> = self.lock_instances().clone();
        let mut last_status = None;

        for instance in &instances {
            let status = instance.update_status().await;
            last_status = Some(status);

            let is_active = {
                let active = self.read_active();
                active
                    .as_ref()
                    .is_some_and(|active| Arc::ptr_eq(active, instance))
            };

            if is_active {
                if status != InstanceStatus::Serving {
                    warn!(
                        app = %self.config.name,
                        instance = instance.id(),
                        %status,
                        "active instance left serving"
                    );
                    *self.write_active() = None;
                }
            } else if status == InstanceStatus::Serving {
                *retries = 0;
                let previous = self.write_active().replace(Arc::clone(instance));
                info!(
                    app = %self.config.name,
                    instance = instance.id(),
                    "promoted to active"
                );
                if let Some(previous) = previous {
                    // Outside the lock: the old active drains, then gets
                    // its stop signal.
                    previous.stop();
                }
            }
        }

        let failed = matches!(
            last_status,
            Some(InstanceStatus::Exited | InstanceStatus::Failed | InstanceStatus::TimedOut)
        );
        if failed && *retries < self.config.max_retries {
            *retries += 1;
            info!(
                app = %self.config.name,
                attempt = *retries,
                max = self.config.max_retries,
                "restarting after failure"
            );
            if let Err(e) = self.start_new_instance() {
                error!(app = %self.config.name, error = %e, "restart failed");
            }
        }
    }

    fn lock_instances(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Instance>>> {
        self.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_active(&self) -> std::sync::RwLockReadGuard<'_, Option<Arc<Instance>>> {
        self.active.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_active(&self) -> std::sync::RwLockWriteGuard<'_, Option<Arc<Instance>>> {
        self.active.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Lease on one instance for the lifetime of a request or connection.
///
/// Dropping the reservation releases it, whatever path the request took.
pub struct Reservation {
    instance: Arc<Instance>,
}

impl Reservation {
    /// Internal `host:port` of the reserved instance.
    pub fn host_port(&self) -> &str {
        self.instance.host_port()
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.instance.done();
    }
}
