//! Per-connection lifecycle: `Accepted → AwaitingName → Active → Closed`.
//!
//! The first non-blank message names the session. Only then is the session
//! registered and announced; a stream that ends earlier is dropped silently.
//! Once active, every message is broadcast to the other members as
//! `name: text`. Whatever ends the receive loop, the handler unregisters the
//! session, announces the departure once and shuts the stream down.

use std::{io, net::SocketAddr, sync::Arc};

use tokio::{
    io::{AsyncRead, AsyncWriteExt},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Framing, MessageReader, chat_line, joined_notice, left_notice},
    registry::{Registry, Session, SessionWriter},
    router::BroadcastRouter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Accepted,
    AwaitingName,
    Active,
    Closed,
}

/// Why an active session ended.
#[derive(Debug)]
pub enum CloseReason {
    /// The read side returned zero bytes.
    PeerClosed,
    /// The connection was reset or aborted by the peer.
    Reset,
    /// A broadcast could not be delivered and the router dropped the session.
    Evicted,
    Failed(io::Error),
}

impl CloseReason {
    fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => CloseReason::Reset,
            _ => CloseReason::Failed(err),
        }
    }
}

#[derive(Debug)]
pub enum SessionOutcome {
    /// The stream ended before a display name arrived; nothing was registered.
    Abandoned,
    Closed { name: String, reason: CloseReason },
}

/// What every session handler on one relay shares.
#[derive(Clone)]
pub struct SessionContext {
    router: Arc<BroadcastRouter>,
    framing: Framing,
}

impl SessionContext {
    pub fn new(router: Arc<BroadcastRouter>, framing: Framing) -> Self {
        Self { router, framing }
    }

    pub fn router(&self) -> &Arc<BroadcastRouter> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.router.registry()
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }
}

pub async fn run_session<R>(
    reader: R,
    writer: SessionWriter,
    peer: Option<SocketAddr>,
    context: &SessionContext,
) -> SessionOutcome
where
    R: AsyncRead + Unpin,
{
    debug!(?peer, state = ?SessionState::Accepted, "connection accepted");
    let mut reader = MessageReader::new(reader, context.framing());

    debug!(?peer, state = ?SessionState::AwaitingName, "waiting for display name");
    let name = match await_name(&mut reader).await {
        Ok(Some(name)) => name,
        Ok(None) => {
            debug!(?peer, "connection closed before a display name arrived");
            return abandon(writer).await;
        }
        Err(err) => {
            warn!(?peer, error = %err, "failed to read display name");
            return abandon(writer).await;
        }
    };

    let registry = context.registry();
    let session = Arc::new(Session::new(registry.next_id(), name, peer, writer));
    registry.register(Arc::clone(&session)).await;
    info!(
        session = %session.id(),
        name = session.name(),
        ?peer,
        state = ?SessionState::Active,
        "client joined"
    );
    context
        .router()
        .broadcast(&joined_notice(session.name()), Some(session.id()))
        .await;

    let reason = receive_loop(&mut reader, &session, context.router()).await;
    teardown(&session, reason, context).await
}

async fn await_name<R>(reader: &mut MessageReader<R>) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    while let Some(message) = reader.read_message().await? {
        let name = message.trim();
        if !name.is_empty() {
            return Ok(Some(name.to_string()));
        }
    }
    Ok(None)
}

async fn abandon(mut writer: SessionWriter) -> SessionOutcome {
    let _ = writer.shutdown().await;
    SessionOutcome::Abandoned
}

async fn receive_loop<R>(
    reader: &mut MessageReader<R>,
    session: &Session,
    router: &BroadcastRouter,
) -> CloseReason
where
    R: AsyncRead + Unpin,
{
    loop {
        let message = select! {
            biased;
            _ = session.evicted() => return CloseReason::Evicted,
            message = reader.read_message() => message,
        };

        match message {
            Ok(Some(text)) => {
                if text.trim().is_empty() {
                    continue;
                }
                let line = chat_line(session.name(), &text);
                debug!(session = %session.id(), %line, "relaying message");
                router.broadcast(&line, Some(session.id())).await;
            }
            Ok(None) => return CloseReason::PeerClosed,
            Err(err) => return CloseReason::from_io(err),
        }
    }
}

async fn teardown(
    session: &Arc<Session>,
    reason: CloseReason,
    context: &SessionContext,
) -> SessionOutcome {
    context.registry().unregister(session.id()).await;

    let id = session.id();
    let name = session.name();
    match &reason {
        CloseReason::PeerClosed => info!(session = %id, name, "client disconnected"),
        CloseReason::Reset => info!(session = %id, name, "connection lost"),
        CloseReason::Evicted => info!(session = %id, name, "client evicted"),
        CloseReason::Failed(err) => warn!(session = %id, name, error = %err, "session failed"),
    }

    context
        .router()
        .broadcast(&left_notice(session.name()), None)
        .await;
    session.close().await;
    debug!(session = %session.id(), state = ?SessionState::Closed, "session closed");

    SessionOutcome::Closed {
        name: session.name().to_string(),
        reason,
    }
}
