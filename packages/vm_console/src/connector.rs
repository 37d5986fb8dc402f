use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::batch::Batch;
use crate::config::ConnectFileConfig;
use crate::error::{ConsoleError, Result};
use crate::instance::{InstancePhase, InstanceRef};
use crate::lifecycle::Lifecycle;
use crate::registry::ConnectionRegistry;
use crate::session::{ConsoleSession, ErrorReceiver, ExpectMatch};
use crate::transport::ConsoleTransport;

/// Minimum time granted to the first instance lookup, so that a missing
/// console is still reported under a zero connection timeout.
const FIRST_LOOKUP_FLOOR: Duration = Duration::from_secs(1);

/// Runtime settings for [`Connector`]
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
    /// Connection timeout used by [`Connector::expect_batch`]
    pub connect_timeout: Duration,
    /// First delay between phase polls
    pub poll_initial: Duration,
    /// Ceiling for the doubling poll delay
    pub poll_max: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::from_file(&ConnectFileConfig::default())
    }
}

impl ConnectorConfig {
    pub fn from_file(fc: &ConnectFileConfig) -> Self {
        let poll_initial = Duration::from_millis(fc.poll_initial_ms.max(1));
        Self {
            connect_timeout: Duration::from_secs(fc.timeout_secs),
            poll_initial,
            poll_max: Duration::from_millis(fc.poll_max_ms).max(poll_initial),
        }
    }
}

/// Entry point that turns an instance reference into a console session.
pub struct Connector {
    lifecycle: Arc<dyn Lifecycle>,
    transport: Arc<dyn ConsoleTransport>,
    registry: ConnectionRegistry,
    config: ConnectorConfig,
}

impl Connector {
    /// Connector backed by the process-wide registry
    pub fn new(lifecycle: Arc<dyn Lifecycle>, transport: Arc<dyn ConsoleTransport>) -> Self {
        Self {
            lifecycle,
            transport,
            registry: ConnectionRegistry::global().clone(),
            config: ConnectorConfig::default(),
        }
    }

    pub fn with_registry(mut self, registry: ConnectionRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_config(mut self, config: ConnectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Wait up to `connection_timeout` for the instance to run, then acquire
    /// its console. An instance without a serial console fails right away.
    ///
    /// The first lookup may use up to one second when the
    /// timeout is shorter than that.
    pub async fn connect(
        &self,
        instance: &InstanceRef,
        connection_timeout: Duration,
    ) -> Result<(ConsoleSession, ErrorReceiver)> {
        let started = Instant::now();
        let deadline = started + connection_timeout;

        let current = tokio::time::timeout_at(
            deadline.max(started + FIRST_LOOKUP_FLOOR),
            self.lifecycle.get(instance),
        )
        .await
        .map_err(|_| {
            info!("Lookup of instance {} timed out", instance);
            ConsoleError::ConnectTimeout
        })??;
        if !current.spec.has_serial_console() {
            info!("Instance {} has no serial console", instance);
            return Err(ConsoleError::NoConsoleDevice);
        }

        if !current.phase.is_running() {
            tokio::time::timeout_at(deadline, self.wait_for_running(instance, current.phase))
                .await
                .map_err(|_| {
                    info!(
                        "Instance {} not running after {:?}",
                        instance, connection_timeout
                    );
                    ConsoleError::ConnectTimeout
                })??;
        }

        self.registry
            .acquire(instance, self.transport.as_ref())
            .await
    }

    async fn wait_for_running(
        &self,
        instance: &InstanceRef,
        mut phase: InstancePhase,
    ) -> Result<()> {
        let mut delay = self.config.poll_initial;
        while !phase.is_running() {
            debug!("Instance {} is {:?}, polling again in {:?}", instance, phase, delay);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.config.poll_max);
            phase = self.lifecycle.get(instance).await?.phase;
        }
        debug!("Instance {} is running", instance);
        Ok(())
    }

    /// Run `batch` on a fresh session and close it afterwards.
    ///
    /// Connection loss reported on the session's error channel ends the
    /// batch with that error.
    pub async fn expect_batch(
        &self,
        instance: &InstanceRef,
        batch: Batch,
    ) -> Result<Vec<ExpectMatch>> {
        let (session, mut errors) = self.connect(instance, self.config.connect_timeout).await?;

        let outcome = tokio::select! {
            result = batch.run(&session) => result,
            Ok(err) = &mut errors => Err(err),
        };

        session.close();
        outcome
    }
}
