use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    protocol::{Framing, system_line},
    registry::Registry,
    router::{BroadcastRouter, DEFAULT_WRITE_TIMEOUT},
    session::{SessionContext, SessionOutcome, run_session},
};

#[derive(Debug, Clone, Copy)]
pub struct RelayOptions {
    pub framing: Framing,
    pub write_timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            framing: Framing::default(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Accepts chat connections and runs one session handler task per connection.
pub struct Relay {
    listener: TcpListener,
    context: SessionContext,
}

impl Relay {
    pub fn new(listener: TcpListener, options: RelayOptions) -> Self {
        let registry = Arc::new(Registry::new());
        let router = Arc::new(BroadcastRouter::new(registry, options.write_timeout));
        Self {
            listener,
            context: SessionContext::new(router, options.framing),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(self.context.registry())
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay { listener, context } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&context).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_shutdown(context: &SessionContext) {
    info!("relay shutting down");
    context
        .router()
        .broadcast(&system_line("server is shutting down."), None)
        .await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: &SessionContext,
) {
    match result {
        Ok((stream, peer)) => spawn_session_handler(stream, peer, context),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session_handler(stream: TcpStream, peer: SocketAddr, context: &SessionContext) {
    let context = context.clone();
    tokio::spawn(async move {
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = ?err, "failed to disable nagle");
        }
        let (reader, writer) = stream.into_split();
        match run_session(reader, Box::new(writer), Some(peer), &context).await {
            SessionOutcome::Abandoned => debug!(peer = %peer, "connection dropped before naming"),
            SessionOutcome::Closed { name, reason } => {
                debug!(peer = %peer, %name, ?reason, "session handler finished")
            }
        }
    });
}
