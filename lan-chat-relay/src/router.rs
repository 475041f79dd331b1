use std::{fmt, io, sync::Arc, time::Duration};

use futures::future::join_all;
use tracing::{debug, warn};

use crate::registry::{Registry, Session, SessionId};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Fans text out to every registered session except an optional sender.
pub struct BroadcastRouter {
    registry: Arc<Registry>,
    write_timeout: Duration,
}

#[derive(Debug)]
enum DeliveryFailure {
    Io(io::Error),
    TimedOut(Duration),
}

impl fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryFailure::Io(err) => write!(f, "write failed: {err}"),
            DeliveryFailure::TimedOut(limit) => write!(f, "write timed out after {limit:?}"),
        }
    }
}

impl BroadcastRouter {
    pub fn new(registry: Arc<Registry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Delivers `text` to every member of a registry snapshot other than
    /// `exclude` and returns how many writes succeeded.
    ///
    /// Targets that fail or exceed the write timeout are unregistered and
    /// evicted; their handlers announce the departure themselves.
    pub async fn broadcast(&self, text: &str, exclude: Option<SessionId>) -> usize {
        let targets: Vec<Arc<Session>> = self
            .registry
            .snapshot()
            .await
            .into_iter()
            .filter(|session| Some(session.id()) != exclude)
            .collect();

        if targets.is_empty() {
            return 0;
        }

        let results = join_all(targets.iter().map(|session| self.deliver(session, text))).await;

        let mut delivered = 0;
        for (session, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(failure) => self.prune(session, failure).await,
            }
        }

        debug!(delivered, targets = targets.len(), "broadcast complete");
        delivered
    }

    async fn deliver(&self, session: &Session, text: &str) -> Result<(), DeliveryFailure> {
        match session.send_line(text, self.write_timeout).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                Err(DeliveryFailure::TimedOut(self.write_timeout))
            }
            Err(err) => Err(DeliveryFailure::Io(err)),
        }
    }

    async fn prune(&self, session: &Session, failure: DeliveryFailure) {
        warn!(
            session = %session.id(),
            name = session.name(),
            peer = ?session.peer(),
            %failure,
            "dropping session after failed delivery"
        );
        self.registry.unregister(session.id()).await;
        session.evict();
    }
}
