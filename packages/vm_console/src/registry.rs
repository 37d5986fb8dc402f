use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tracing::{debug, info};

use crate::error::{CloseReason, ConsoleError, Result};
use crate::instance::InstanceRef;
use crate::session::{ConsoleSession, ErrorReceiver, SessionId, SessionShared};
use crate::transport::ConsoleTransport;

/// Per-instance slot. `gate` serializes acquisitions for one instance only.
#[derive(Default)]
struct Entry {
    gate: tokio::sync::Mutex<()>,
    active: Mutex<Option<Arc<SessionShared>>>,
}

struct RegistryInner {
    entries: Mutex<HashMap<InstanceRef, Arc<Entry>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RegistryInner {
    fn entry(&self, instance: &InstanceRef) -> Arc<Entry> {
        lock(&self.entries)
            .entry(instance.clone())
            .or_default()
            .clone()
    }

    /// Forget `id` if it is still the installed session, and drop the slot
    /// when nobody else holds it.
    fn release(&self, instance: &InstanceRef, id: SessionId) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get(instance) else {
            return;
        };
        {
            let mut active = lock(&entry.active);
            if active.as_ref().is_some_and(|s| s.id() == id) {
                *active = None;
                debug!("Released console session {} for {}", id, instance);
            }
        }
        prune(&mut entries, instance, 1);
    }
}

/// Remove the slot for `instance` if it is empty and `holders` is the number
/// of references to it, the map's own included.
fn prune(entries: &mut HashMap<InstanceRef, Arc<Entry>>, instance: &InstanceRef, holders: usize) {
    let idle = entries
        .get(instance)
        .is_some_and(|e| lock(&e.active).is_none() && Arc::strong_count(e) == holders);
    if idle {
        entries.remove(instance);
    }
}

/// Keeps a slot referenced for one acquisition and prunes it afterwards,
/// also when the acquiring future is dropped mid-way.
struct SlotGuard<'a> {
    inner: &'a RegistryInner,
    instance: &'a InstanceRef,
    entry: Arc<Entry>,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut entries = lock(&self.inner.entries);
        // The map and this guard
        prune(&mut entries, self.instance, 2);
    }
}

/// Table of the console session currently owning each instance.
///
/// Acquiring a console for an instance that already has one tears the old
/// session down (signalling its error channel) before the new one is opened
/// and installed. Cloning shares the same table.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static ConnectionRegistry {
        static GLOBAL: OnceLock<ConnectionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ConnectionRegistry::new)
    }

    /// Open a console session for `instance`, displacing any current one.
    pub async fn acquire(
        &self,
        instance: &InstanceRef,
        transport: &dyn ConsoleTransport,
    ) -> Result<(ConsoleSession, ErrorReceiver)> {
        let slot = SlotGuard {
            inner: &self.inner,
            instance,
            entry: self.inner.entry(instance),
        };
        self.acquire_in(&slot.entry, instance, transport).await
    }

    async fn acquire_in(
        &self,
        entry: &Entry,
        instance: &InstanceRef,
        transport: &dyn ConsoleTransport,
    ) -> Result<(ConsoleSession, ErrorReceiver)> {
        let _gate = entry.gate.lock().await;

        let previous = lock(&entry.active).take();
        if let Some(previous) = previous {
            info!(
                "Displacing console session {} for {}",
                previous.id(),
                instance
            );
            previous.terminate(
                CloseReason::Displaced,
                Some(ConsoleError::closed(CloseReason::Displaced)),
            );
        }

        let stream = transport.open(instance).await?;

        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let owner = instance.clone();
        let on_close: Box<dyn FnOnce() + Send> = Box::new(move || {
            if let Some(registry) = registry.upgrade() {
                registry.release(&owner, id);
            }
        });

        let (session, errors) =
            ConsoleSession::start(id, instance.clone(), stream, Some(on_close));

        {
            let mut active = lock(&entry.active);
            // A reader that already hit EOF has run its release; keep it out.
            if !session.is_closed() {
                *active = Some(session.shared().clone());
            }
        }

        info!("Acquired console session {} for {}", id, instance);
        Ok((session, errors))
    }

    /// Remove `session` from the table if it is still the installed one
    pub fn release(&self, session: &ConsoleSession) {
        self.inner.release(session.instance(), session.id());
    }

    /// Currently installed session for `instance`
    pub fn active(&self, instance: &InstanceRef) -> Option<SessionId> {
        let entries = lock(&self.inner.entries);
        let entry = entries.get(instance)?;
        let active = lock(&entry.active);
        active.as_ref().map(|s| s.id())
    }

    /// Number of instances with an installed session
    pub fn len(&self) -> usize {
        lock(&self.inner.entries)
            .values()
            .filter(|e| lock(&e.active).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
