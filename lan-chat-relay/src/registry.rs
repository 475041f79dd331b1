use std::{
    collections::BTreeMap,
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, Notify},
    time::{Instant, timeout_at},
};

use crate::protocol::write_line;

/// Write half of a session's stream.
pub type SessionWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One named, live client connection.
///
/// The receive side stays with the session handler; the write side lives here
/// behind a per-session lock so the handler and concurrent broadcasts never
/// interleave partial writes on the same stream.
pub struct Session {
    id: SessionId,
    name: String,
    peer: Option<SocketAddr>,
    writer: Mutex<SessionWriter>,
    /// Set under the writer lock once the stream may hold a partial line.
    dead: AtomicBool,
    evicted: Notify,
}

impl Session {
    pub fn new(
        id: SessionId,
        name: impl Into<String>,
        peer: Option<SocketAddr>,
        writer: SessionWriter,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            peer,
            writer: Mutex::new(writer),
            dead: AtomicBool::new(false),
            evicted: Notify::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Writes one line, waiting at most `limit` for the lock and the write.
    ///
    /// A failed or timed-out write marks the stream dead before the lock is
    /// released, so no later line is appended to a partial one.
    pub async fn send_line(&self, line: &str, limit: Duration) -> io::Result<()> {
        let deadline = Instant::now() + limit;
        let mut writer = timeout_at(deadline, self.writer.lock())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "writer is busy"))?;
        if self.dead.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session stream is closed"));
        }

        let result = match timeout_at(deadline, write_line(&mut *writer, line)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
        };
        if result.is_err() {
            self.dead.store(true, Ordering::Release);
        }
        result
    }

    /// Shuts down the write half. Errors are ignored; the peer may already be gone.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        self.dead.store(true, Ordering::Release);
        let _ = writer.shutdown().await;
    }

    /// Asks the owning session handler to tear the session down.
    pub fn evict(&self) {
        self.evicted.notify_one();
    }

    /// Resolves once [`Session::evict`] has been called.
    pub async fn evicted(&self) {
        self.evicted.notified().await;
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// The authoritative set of sessions eligible to receive broadcasts.
///
/// Every insert, removal and snapshot goes through one lock, so no caller can
/// observe a partially updated set.
#[derive(Default)]
pub struct Registry {
    sessions: Mutex<BTreeMap<SessionId, Arc<Session>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub async fn register(&self, session: Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.id(), session);
    }

    /// Removing an absent session is a no-op and returns `None`.
    pub async fn unregister(&self, id: SessionId) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().await;
        sessions.remove(&id)
    }

    /// Current members in join order.
    pub async fn snapshot(&self) -> Vec<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.values().cloned().collect()
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn names(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .values()
            .map(|session| session.name().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(registry: &Registry, name: &str) -> Arc<Session> {
        Arc::new(Session::new(
            registry.next_id(),
            name,
            None,
            Box::new(tokio::io::sink()),
        ))
    }

    #[tokio::test]
    async fn membership_tracks_register_and_unregister() {
        let registry = Registry::new();
        let alice = session(&registry, "alice");
        let bob = session(&registry, "bob");

        registry.register(Arc::clone(&alice)).await;
        registry.register(Arc::clone(&bob)).await;
        assert_eq!(registry.names().await, vec!["alice", "bob"]);

        let removed = registry.unregister(alice.id()).await;
        assert_eq!(removed.map(|s| s.id()), Some(alice.id()));
        assert!(!registry.contains(alice.id()).await);
        assert!(registry.contains(bob.id()).await);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = Registry::new();
        let alice = session(&registry, "alice");
        registry.register(Arc::clone(&alice)).await;

        assert!(registry.unregister(alice.id()).await.is_some());
        assert!(registry.unregister(alice.id()).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn duplicate_names_are_distinct_sessions() {
        let registry = Registry::new();
        registry.register(session(&registry, "alice")).await;
        registry.register(session(&registry, "alice")).await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_ne!(snapshot[0].id(), snapshot[1].id());
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_mutation() {
        let registry = Registry::new();
        let alice = session(&registry, "alice");
        registry.register(Arc::clone(&alice)).await;

        let snapshot = registry.snapshot().await;
        registry.unregister(alice.id()).await;

        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn timed_out_write_blocks_later_lines() {
        use tokio::io::AsyncReadExt;

        let registry = Registry::new();
        let (server_end, mut client_end) = tokio::io::duplex(4);
        let slow = Session::new(registry.next_id(), "slow", None, Box::new(server_end));

        let err = slow
            .send_line("SYSTEM: longer than four bytes", Duration::from_millis(50))
            .await
            .expect_err("write should time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let mut partial = [0u8; 16];
        let read = client_end.read(&mut partial).await.expect("read partial");
        assert_eq!(&partial[..read], b"SYST");

        let err = slow
            .send_line("bob: hi", Duration::from_secs(1))
            .await
            .expect_err("dead stream refuses further lines");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let mut rest = [0u8; 16];
        let nothing =
            tokio::time::timeout(Duration::from_millis(100), client_end.read(&mut rest)).await;
        assert!(nothing.is_err(), "nothing may follow the partial line");
    }

    #[tokio::test]
    async fn evict_wakes_a_later_waiter() {
        let registry = Registry::new();
        let alice = session(&registry, "alice");

        alice.evict();
        tokio::time::timeout(std::time::Duration::from_secs(1), alice.evicted())
            .await
            .expect("stored eviction permit should resolve immediately");
    }
}
