use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::error::{ConsoleError, Result};
use crate::instance::{Instance, InstancePhase, InstanceRef, InstanceSpec};
use crate::lifecycle::Lifecycle;
use crate::transport::{ConsoleStream, ConsoleTransport};

#[derive(Clone, Default)]
struct FakeInstance {
    instance: Instance,
    /// When set, every opened console answers each newline with this text
    prompt: Option<String>,
}

/// In-memory orchestration API: instances are table rows and consoles are
/// `tokio::io::duplex` pipes whose guest ends the test can pick up.
#[derive(Default)]
pub(crate) struct FakeCluster {
    instances: Mutex<HashMap<InstanceRef, FakeInstance>>,
    guests: Mutex<HashMap<InstanceRef, DuplexStream>>,
    opens: AtomicUsize,
    gets: AtomicUsize,
}

impl FakeCluster {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, instance: &InstanceRef, phase: InstancePhase, spec: InstanceSpec) {
        self.instances.lock().unwrap().insert(
            instance.clone(),
            FakeInstance {
                instance: Instance::new(phase, spec),
                prompt: None,
            },
        );
    }

    pub(crate) fn add_running(&self, instance: &InstanceRef) {
        self.add(instance, InstancePhase::Running, InstanceSpec::default());
    }

    /// A running instance whose console prints `prompt` after every newline
    pub(crate) fn add_booted(&self, instance: &InstanceRef, prompt: &str) {
        self.add_running(instance);
        self.instances
            .lock()
            .unwrap()
            .get_mut(instance)
            .unwrap()
            .prompt = Some(prompt.to_string());
    }

    pub(crate) fn set_phase(&self, instance: &InstanceRef, phase: InstancePhase) {
        if let Some(fake) = self.instances.lock().unwrap().get_mut(instance) {
            fake.instance.phase = phase;
        }
    }

    /// Guest end of the most recently opened console
    pub(crate) fn take_guest(&self, instance: &InstanceRef) -> Option<DuplexStream> {
        self.guests.lock().unwrap().remove(instance)
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lifecycle for FakeCluster {
    async fn get(&self, instance: &InstanceRef) -> Result<Instance> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.instances
            .lock()
            .unwrap()
            .get(instance)
            .map(|fake| fake.instance.clone())
            .ok_or_else(|| ConsoleError::InstanceNotFound(instance.clone()))
    }
}

#[async_trait]
impl ConsoleTransport for FakeCluster {
    async fn open(&self, instance: &InstanceRef) -> Result<ConsoleStream> {
        let fake = self.instances.lock().unwrap().get(instance).cloned();
        let Some(fake) = fake else {
            return Err(ConsoleError::DeviceUnavailable {
                instance: instance.clone(),
                reason: "no such instance".into(),
            });
        };
        if !fake.instance.spec.has_serial_console() {
            return Err(ConsoleError::NoConsoleDevice);
        }

        self.opens.fetch_add(1, Ordering::SeqCst);
        let (client, guest) = tokio::io::duplex(64 * 1024);
        match fake.prompt {
            Some(prompt) => {
                tokio::spawn(serve_prompt(guest, prompt));
            }
            None => {
                self.guests.lock().unwrap().insert(instance.clone(), guest);
            }
        }
        Ok(Box::new(client))
    }
}

/// Answer every newline from the client with `prompt` until the client hangs up
pub(crate) async fn serve_prompt(mut guest: DuplexStream, prompt: String) {
    let mut buf = [0u8; 256];
    loop {
        match guest.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                for _ in buf[..n].iter().filter(|b| **b == b'\n') {
                    if guest.write_all(prompt.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
