use regex::bytes::Regex;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{CloseReason, ConsoleError, Result};
use crate::instance::InstanceRef;
use crate::transport::ConsoleStream;

const READ_CHUNK: usize = 4096;

/// Unique identifier for one console acquisition
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "console-{}", self.0)
    }
}

/// Receives the single terminal error of a session, if one is ever delivered.
///
/// Resolves to `Err(RecvError)` when the session was closed by its owner
/// without a terminal error.
pub type ErrorReceiver = oneshot::Receiver<ConsoleError>;

/// Result of a successful expect
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectMatch {
    /// Consumed output preceding the match
    pub before: String,
    /// The matched text
    pub matched: String,
    /// Capture groups of the pattern, in order
    pub groups: Vec<Option<String>>,
}

type OnClose = Box<dyn FnOnce() + Send>;

struct Inbound {
    buffer: Vec<u8>,
    closed: Option<CloseReason>,
}

impl Inbound {
    /// Find `pattern` and consume everything up to the end of the match
    fn take_match(&mut self, pattern: &Regex) -> Option<ExpectMatch> {
        let caps = pattern.captures(&self.buffer)?;
        let whole = caps.get(0)?;
        let end = whole.end();
        let found = ExpectMatch {
            before: String::from_utf8_lossy(&self.buffer[..whole.start()]).into_owned(),
            matched: String::from_utf8_lossy(whole.as_bytes()).into_owned(),
            groups: caps
                .iter()
                .skip(1)
                .map(|g| g.map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned()))
                .collect(),
        };
        self.buffer.drain(..end);
        Some(found)
    }
}

pub(crate) struct SessionShared {
    id: SessionId,
    instance: InstanceRef,
    inbound: Mutex<Inbound>,
    grown: Notify,
    closing: Notify,
    writer: tokio::sync::Mutex<Option<WriteHalf<ConsoleStream>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    errors: Mutex<Option<oneshot::Sender<ConsoleError>>>,
    on_close: Mutex<Option<OnClose>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionShared {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    fn close_reason(&self) -> Option<CloseReason> {
        lock(&self.inbound).closed.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.inbound).closed.is_some()
    }

    /// Append inbound bytes and wake waiters. Returns false once closed.
    fn append(&self, data: &[u8]) -> bool {
        {
            let mut inbound = lock(&self.inbound);
            if inbound.closed.is_some() {
                return false;
            }
            inbound.buffer.extend_from_slice(data);
        }
        self.grown.notify_waiters();
        true
    }

    /// Tear the session down once. Later calls are no-ops and return false.
    ///
    /// `terminal` is offered to the error channel without blocking; it is
    /// dropped if the receiver is gone.
    pub(crate) fn terminate(&self, reason: CloseReason, terminal: Option<ConsoleError>) -> bool {
        {
            let mut inbound = lock(&self.inbound);
            if inbound.closed.is_some() {
                return false;
            }
            inbound.closed = Some(reason.clone());
            inbound.buffer = Vec::new();
        }
        self.grown.notify_waiters();
        self.closing.notify_waiters();

        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        // A send in flight holds the writer; it drops the half itself when woken by `closing`.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        if let Some(on_close) = lock(&self.on_close).take() {
            on_close();
        }

        let errors = lock(&self.errors).take();
        if let (Some(tx), Some(err)) = (errors, terminal) {
            if tx.send(err).is_err() {
                debug!("Nobody listening for terminal error of {}", self.id);
            }
        }

        info!("Console session {} for {} closed: {}", self.id, self.instance, reason);
        true
    }
}

async fn read_loop(shared: Arc<SessionShared>, mut reader: ReadHalf<ConsoleStream>) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Console EOF for {}", shared.id);
                shared.terminate(
                    CloseReason::Remote,
                    Some(ConsoleError::closed(CloseReason::Remote)),
                );
                break;
            }
            Ok(n) => {
                if !shared.append(&chunk[..n]) {
                    break;
                }
            }
            Err(e) => {
                warn!("Error reading console of {}: {}", shared.instance, e);
                shared.terminate(CloseReason::ReadFailed(e.to_string()), Some(e.into()));
                break;
            }
        }
    }
    debug!("Console reader for {} exiting", shared.id);
}

/// Exclusive interactive access to one instance's serial console.
///
/// A background task drains the stream into an inbound buffer for the whole
/// life of the session. Dropping the session closes it.
pub struct ConsoleSession {
    shared: Arc<SessionShared>,
}

impl ConsoleSession {
    /// Take ownership of `stream` and start the background reader.
    ///
    /// `on_close` runs once, after the session has been torn down for any reason.
    pub(crate) fn start(
        id: SessionId,
        instance: InstanceRef,
        stream: ConsoleStream,
        on_close: Option<OnClose>,
    ) -> (Self, ErrorReceiver) {
        let (read_half, write_half) = tokio::io::split(stream);
        let (error_tx, error_rx) = oneshot::channel();

        let shared = Arc::new(SessionShared {
            id,
            instance,
            inbound: Mutex::new(Inbound {
                buffer: Vec::new(),
                closed: None,
            }),
            grown: Notify::new(),
            closing: Notify::new(),
            writer: tokio::sync::Mutex::new(Some(write_half)),
            reader: Mutex::new(None),
            errors: Mutex::new(Some(error_tx)),
            on_close: Mutex::new(on_close),
        });

        let task = tokio::spawn(read_loop(shared.clone(), read_half));
        {
            let mut reader = lock(&shared.reader);
            if shared.is_closed() {
                task.abort();
            } else {
                *reader = Some(task);
            }
        }

        debug!("Console session {} started for {}", id, shared.instance);
        (Self { shared }, error_rx)
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn instance(&self) -> &InstanceRef {
        &self.shared.instance
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Close the session. Safe to call repeatedly and concurrently with a
    /// displacement; only the first close has any effect.
    pub fn close(&self) {
        self.shared.terminate(CloseReason::Local, None);
    }

    /// Write bytes to the console.
    ///
    /// A close while the write is blocked on a full transport abandons it and
    /// shuts the transport.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.shared.writer.lock().await;

        let closing = self.shared.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();

        if let Some(reason) = self.shared.close_reason() {
            writer.take();
            return Err(ConsoleError::closed(reason));
        }
        let Some(stream) = writer.as_mut() else {
            return Err(ConsoleError::closed(CloseReason::Local));
        };

        let written = tokio::select! {
            result = write_flush(stream, data) => Some(result),
            _ = &mut closing => None,
        };
        match written {
            Some(result) => {
                if self.shared.is_closed() {
                    writer.take();
                }
                result?;
                Ok(())
            }
            None => {
                writer.take();
                debug!("Send on {} interrupted by close", self.shared.id);
                let reason = self.shared.close_reason().unwrap_or(CloseReason::Local);
                Err(ConsoleError::closed(reason))
            }
        }
    }

    pub async fn send_str(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Wait up to `timeout` for `pattern` (a regular expression; plain text
    /// without metacharacters matches literally).
    pub async fn expect(&self, pattern: &str, timeout: Duration) -> Result<ExpectMatch> {
        let compiled = compile(pattern)?;
        self.expect_regex(&compiled, timeout).await
    }

    pub async fn expect_regex(&self, pattern: &Regex, timeout: Duration) -> Result<ExpectMatch> {
        self.expect_until(pattern, Instant::now() + timeout, timeout)
            .await
    }

    /// Scan the buffer now and again on every append until `deadline`.
    /// `budget` is only used to describe the timeout.
    pub(crate) async fn expect_until(
        &self,
        pattern: &Regex,
        deadline: Instant,
        budget: Duration,
    ) -> Result<ExpectMatch> {
        loop {
            let grown = self.shared.grown.notified();
            tokio::pin!(grown);
            grown.as_mut().enable();

            {
                let mut inbound = lock(&self.shared.inbound);
                if let Some(reason) = &inbound.closed {
                    return Err(ConsoleError::closed(reason.clone()));
                }
                if let Some(found) = inbound.take_match(pattern) {
                    debug!("Matched {:?} on {}", pattern.as_str(), self.shared.id);
                    return Ok(found);
                }
            }

            if tokio::time::timeout_at(deadline, grown).await.is_err() {
                debug!(
                    "Timed out after {:?} waiting for {:?} on {}",
                    budget,
                    pattern.as_str(),
                    self.shared.id
                );
                return Err(ConsoleError::PatternTimeout {
                    pattern: pattern.as_str().to_string(),
                    timeout: budget,
                });
            }
        }
    }

    /// Snapshot of inbound bytes not yet consumed by an expect
    pub fn buffered(&self) -> Vec<u8> {
        lock(&self.shared.inbound).buffer.clone()
    }
}

impl std::fmt::Debug for ConsoleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleSession")
            .field("id", &self.shared.id)
            .field("instance", &self.shared.instance)
            .field("closed", &self.shared.close_reason())
            .finish()
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_flush(stream: &mut WriteHalf<ConsoleStream>, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(data).await?;
    stream.flush().await
}

pub(crate) fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|source| ConsoleError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn session() -> (ConsoleSession, ErrorReceiver, DuplexStream) {
        let (client, guest) = tokio::io::duplex(64 * 1024);
        let (session, errors) = ConsoleSession::start(
            SessionId(1),
            InstanceRef::new("default", "testvmi"),
            Box::new(client),
            None,
        );
        (session, errors, guest)
    }

    #[tokio::test]
    async fn test_expect_matches_output_that_arrived_earlier() {
        let (session, _errors, mut guest) = session();
        guest.write_all(b"Welcome to Alpine\nlogin: ").await.unwrap();

        let found = session.expect("login", Duration::from_secs(2)).await.unwrap();
        assert_eq!(found.before, "Welcome to Alpine\n");
        assert_eq!(found.matched, "login");
        // Prefix and match were consumed
        assert_eq!(session.buffered(), b": ");
    }

    #[tokio::test]
    async fn test_expect_matches_output_arriving_mid_wait() {
        let (session, _errors, mut guest) = session();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            guest.write_all(b"login as 'cir").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            guest.write_all(b"ros' user\n").await.unwrap();
            guest
        });

        let found = session
            .expect("login as 'cirros' user", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(found.matched, "login as 'cirros' user");
        let _guest = writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_times_out_no_earlier_than_timeout() {
        let (session, _errors, mut guest) = session();
        guest.write_all(b"booting...\n").await.unwrap();

        let timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = session.expect("login", timeout).await.unwrap_err();
        assert!(started.elapsed() >= timeout);
        match err {
            ConsoleError::PatternTimeout { pattern, timeout: t } => {
                assert_eq!(pattern, "login");
                assert_eq!(t, timeout);
            }
            other => panic!("unexpected error: {other}"),
        }
        // Unmatched output stays available
        assert_eq!(session.buffered(), b"booting...\n");
    }

    #[tokio::test]
    async fn test_consumed_output_does_not_match_twice() {
        let (session, _errors, mut guest) = session();
        guest.write_all(b"login\n").await.unwrap();

        session.expect("login", Duration::from_secs(1)).await.unwrap();
        let err = session
            .expect("login", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::PatternTimeout { .. }));
    }

    #[tokio::test]
    async fn test_regex_capture_groups() {
        let (session, _errors, mut guest) = session();
        guest
            .write_all(b"Welcome to Fedora Linux 39 (Cloud Edition)\n")
            .await
            .unwrap();

        let found = session
            .expect(r"Welcome to (\w+)(?: Linux)? (\d+)", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            found.groups,
            vec![Some("Fedora".to_string()), Some("39".to_string())]
        );
    }

    #[tokio::test]
    async fn test_invalid_pattern_is_rejected() {
        let (session, _errors, _guest) = session();
        let err = session
            .expect("login(", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsoleError::InvalidPattern { .. }));
    }

    #[tokio::test]
    async fn test_send_reaches_the_guest() {
        let (session, _errors, mut guest) = session();
        session.send_str("\n").await.unwrap();
        session.send(b"root\n").await.unwrap();

        let mut buf = [0u8; 6];
        guest.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\nroot\n");
    }

    #[tokio::test]
    async fn test_close_wakes_pending_expect() {
        let (session, _errors, _guest) = session();
        let session = Arc::new(session);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.expect("login", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        session.close();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.is_connection_closed());
    }

    #[tokio::test]
    async fn test_send_and_expect_fail_after_close() {
        let (session, _errors, _guest) = session();
        session.close();
        assert!(session.is_closed());

        assert!(session.send(b"\n").await.unwrap_err().is_connection_closed());
        assert!(
            session
                .expect("login", Duration::from_secs(1))
                .await
                .unwrap_err()
                .is_connection_closed()
        );
        assert!(session.buffered().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_close_never_writes_error_channel() {
        let (session, errors, _guest) = session();
        session.close();
        session.close();
        assert!(errors.await.is_err());
    }

    #[tokio::test]
    async fn test_remote_eof_is_delivered_once() {
        let (session, errors, guest) = session();
        drop(guest);

        let err = tokio::time::timeout(Duration::from_secs(5), errors)
            .await
            .expect("terminal error")
            .expect("error value");
        assert!(matches!(
            err,
            ConsoleError::ConnectionClosed {
                reason: CloseReason::Remote
            }
        ));
        assert!(session.is_closed());
        // Later closes are no-ops
        assert!(!session.shared().terminate(CloseReason::Displaced, None));
    }

    #[tokio::test]
    async fn test_close_shuts_the_transport() {
        let (session, _errors, mut guest) = session();
        session.close();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), guest.read(&mut buf))
            .await
            .expect("guest sees close")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_send() {
        // Tiny pipe the guest never drains
        let (client, mut guest) = tokio::io::duplex(16);
        let (session, _errors) = ConsoleSession::start(
            SessionId(3),
            InstanceRef::new("default", "testvmi"),
            Box::new(client),
            None,
        );
        let session = Arc::new(session);

        let sender = {
            let session = session.clone();
            tokio::spawn(async move { session.send(&[b'x'; 4096]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sender.is_finished());

        session.close();
        let err = tokio::time::timeout(Duration::from_secs(2), sender)
            .await
            .expect("send returns after close")
            .unwrap()
            .unwrap_err();
        assert!(err.is_connection_closed());

        // Transport is shut: the guest reaches EOF after what was already piped
        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), guest.read_to_end(&mut received))
            .await
            .expect("guest sees EOF")
            .unwrap();
        assert!(received.len() <= 16);
    }

    #[tokio::test]
    async fn test_on_close_runs_once() {
        let (client, _guest) = tokio::io::duplex(1024);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let (session, _errors) = ConsoleSession::start(
            SessionId(7),
            InstanceRef::new("default", "testvmi"),
            Box::new(client),
            Some(Box::new(move || {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            })),
        );

        session.close();
        session.close();
        drop(session);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
