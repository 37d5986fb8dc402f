use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::instance::InstanceRef;

/// A raw duplex byte stream bound to one instance's console device
pub trait ConsoleIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ConsoleIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type ConsoleStream = Box<dyn ConsoleIo>;

/// Opens console streams through the orchestration transport.
///
/// Implementations do no buffering or pattern logic. Closing is done by
/// dropping the stream; the session owns both halves and drops each exactly once.
#[async_trait]
pub trait ConsoleTransport: Send + Sync {
    /// Fails with `NoConsoleDevice` when the instance declares no serial
    /// console, and `DeviceUnavailable` when the channel cannot be established.
    async fn open(&self, instance: &InstanceRef) -> Result<ConsoleStream>;
}
