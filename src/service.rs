//! Wiring a configured transaction manager onto its own thread.
//!
//! The caller owns process management and the transport; this module turns a
//! [`Config`] into a recovered [`Manager`] and runs it.

use std::thread::JoinHandle;

use crate::Result;
use crate::config::Config;
use crate::core::ProcessHandle;
use crate::tm::{Manager, ManagerError, Recovery, Registry, SqliteTransactionLog};
use crate::transport::{Connector, InboundDevice, TransportReader};

/// Build the proxy registry the config describes.
pub fn registry(config: &Config) -> Result<Registry> {
    let mut registry = Registry::new();
    for proxy in config.proxies()? {
        tracing::debug!(resource = %proxy.id, name = %proxy.name, instances = proxy.instances, "configured resource");
        registry.register(proxy)?;
    }
    Ok(registry)
}

/// Open the log, build the registry and run the recovery scan.
pub fn build_manager<C: Connector>(
    config: &Config,
    process: ProcessHandle,
    connector: C,
) -> Result<(Manager<SqliteTransactionLog, C>, Recovery)> {
    let registry = registry(config)?;
    let log = SqliteTransactionLog::open(&config.log_path(), config.transaction.durability)?;
    let mut manager =
        Manager::new(process, registry, log, connector).with_default_timeout(config.default_timeout());
    let recovery = manager.recover()?;
    if !recovery.in_doubt.is_empty() {
        tracing::warn!(
            in_doubt = recovery.in_doubt.len(),
            "starting with in-doubt transactions"
        );
    }
    Ok((manager, recovery))
}

pub struct ServiceHandle {
    thread: JoinHandle<std::result::Result<(), ManagerError>>,
}

impl ServiceHandle {
    /// Wait for the manager thread; it ends after a shutdown message or a
    /// fatal error. A panic comes back as `ManagerError::Panicked`.
    pub fn join(self) -> std::result::Result<(), ManagerError> {
        match self.thread.join() {
            Ok(result) => result,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_owned());
                tracing::error!(%reason, "transaction manager thread panicked");
                Err(ManagerError::Panicked(reason))
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Run `manager` on a dedicated thread, reading from `inbound`.
pub fn spawn<C, R>(
    mut manager: Manager<SqliteTransactionLog, C>,
    mut inbound: InboundDevice<R>,
) -> std::io::Result<ServiceHandle>
where
    C: Connector + Send + 'static,
    R: TransportReader + Send + 'static,
{
    let thread = std::thread::Builder::new()
        .name("tmbus-tm".into())
        .spawn(move || {
            let result = manager.run(&mut inbound);
            if let Err(err) = &result {
                tracing::error!(error = %err, effect = err.effect().as_str(), "transaction manager failed");
            }
            result
        })?;
    Ok(ServiceHandle { thread })
}
