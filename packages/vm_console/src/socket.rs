//! Lifecycle and transport over a run directory of Unix console sockets.
//!
//! Each instance owns `<run_dir>/<namespace>/<name>/`:
//!
//! - `instance.toml`: optional record written by the launcher (`phase`,
//!   `[devices] autoattach_serial_console`)
//! - `console.sock`: the serial console, e.g. QEMU's
//!   `-serial unix:console.sock,server,nowait`
//!
//! Without a recorded phase, the instance counts as running once its console
//! socket exists.

use async_trait::async_trait;
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{ConsoleError, Result};
use crate::instance::{Instance, InstancePhase, InstanceRef, InstanceSpec};
use crate::lifecycle::Lifecycle;
use crate::transport::{ConsoleStream, ConsoleTransport};

pub const RECORD_FILE: &str = "instance.toml";
pub const SOCKET_FILE: &str = "console.sock";

#[derive(Debug, Default, Deserialize)]
struct InstanceRecord {
    #[serde(default)]
    phase: Option<InstancePhase>,
    #[serde(flatten)]
    spec: InstanceSpec,
}

#[derive(Clone, Debug)]
pub struct SocketBackend {
    run_dir: PathBuf,
}

impl SocketBackend {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn instance_dir(&self, instance: &InstanceRef) -> PathBuf {
        self.run_dir.join(instance.namespace()).join(instance.name())
    }

    pub fn console_socket(&self, instance: &InstanceRef) -> PathBuf {
        self.instance_dir(instance).join(SOCKET_FILE)
    }

    async fn read_record(&self, instance: &InstanceRef) -> Result<InstanceRecord> {
        let dir = self.instance_dir(instance);
        if !exists(&dir).await? {
            return Err(ConsoleError::InstanceNotFound(instance.clone()));
        }

        let path = dir.join(RECORD_FILE);
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => toml::from_str(&text)
                .map_err(|e| ConsoleError::Api(format!("invalid {}: {}", path.display(), e))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(InstanceRecord::default()),
            Err(e) => Err(ConsoleError::Api(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

async fn exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| ConsoleError::Api(format!("failed to stat {}: {}", path.display(), e)))
}

#[async_trait]
impl Lifecycle for SocketBackend {
    async fn get(&self, instance: &InstanceRef) -> Result<Instance> {
        let record = self.read_record(instance).await?;
        let phase = match record.phase {
            Some(phase) => phase,
            None if exists(&self.console_socket(instance)).await? => InstancePhase::Running,
            None => InstancePhase::Scheduling,
        };
        Ok(Instance::new(phase, record.spec))
    }
}

#[async_trait]
impl ConsoleTransport for SocketBackend {
    async fn open(&self, instance: &InstanceRef) -> Result<ConsoleStream> {
        let record = self.read_record(instance).await?;
        if !record.spec.has_serial_console() {
            return Err(ConsoleError::NoConsoleDevice);
        }

        let path = self.console_socket(instance);
        debug!("Connecting to console socket {}", path.display());
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|e| ConsoleError::DeviceUnavailable {
                instance: instance.clone(),
                reason: format!("{}: {}", path.display(), e),
            })?;
        Ok(Box::new(stream))
    }
}
