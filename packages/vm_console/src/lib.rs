//! VM Console - scripted access to virtual machine serial consoles
//!
//! This crate connects to the serial console of a running virtual machine
//! instance and drives it with send/expect scripts, e.g. to verify that a
//! guest booted to its login prompt. At most one session per instance is
//! live at a time: acquiring a new one closes the previous one and reports
//! that on the old session's error channel.
//!
//! The orchestration system is reached through two traits, [`Lifecycle`]
//! (instance phase and devices) and [`ConsoleTransport`] (raw console
//! streams). [`SocketBackend`] implements both over Unix console sockets.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use vm_console::{Batch, Connector, InstanceRef, SocketBackend};
//!
//! #[tokio::main]
//! async fn main() -> vm_console::Result<()> {
//!     let backend = Arc::new(SocketBackend::new("/run/vmconsole"));
//!     let connector = Connector::new(backend.clone(), backend);
//!     let vmi = InstanceRef::new("default", "testvmi");
//!
//!     let (session, errors) = connector.connect(&vmi, Duration::from_secs(30)).await?;
//!     tokio::spawn(async move {
//!         if let Ok(err) = errors.await {
//!             eprintln!("console lost: {}", err);
//!         }
//!     });
//!
//!     Batch::login_probe("login as 'cirros' user", Duration::from_secs(120))
//!         .run(&session)
//!         .await?;
//!     session.close();
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
mod connector;
mod error;
pub mod instance;
mod lifecycle;
mod registry;
mod session;
#[cfg(unix)]
pub mod socket;
mod transport;

#[cfg(test)]
mod test_helpers;

pub use batch::{Batch, Step};
pub use connector::{Connector, ConnectorConfig};
pub use error::{CloseReason, ConsoleError, Result};
pub use instance::{DeviceSpec, Instance, InstancePhase, InstanceRef, InstanceSpec};
pub use lifecycle::Lifecycle;
pub use registry::ConnectionRegistry;
pub use session::{ConsoleSession, ErrorReceiver, ExpectMatch, SessionId};
#[cfg(unix)]
pub use socket::SocketBackend;
pub use transport::{ConsoleIo, ConsoleStream, ConsoleTransport};
