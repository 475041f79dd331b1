//! Connectionless discovery: clients broadcast [`DISCOVERY_QUERY`] and the
//! responder answers the sender with [`DISCOVERY_ACK`], which tells them the
//! relay's address.

use std::{
    future::Future,
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    select,
    time::{Instant, timeout_at},
};
use tracing::{debug, info, warn};

use crate::protocol::{DISCOVERY_ACK, DISCOVERY_QUERY, READ_BUFFER_SIZE};

/// The reply owed to a datagram, if any.
pub fn reply_for(payload: &[u8]) -> Option<&'static [u8]> {
    (payload == DISCOVERY_QUERY).then_some(DISCOVERY_ACK)
}

pub struct DiscoveryResponder {
    socket: UdpSocket,
}

impl DiscoveryResponder {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr).await?))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Answers queries until `shutdown` resolves. Socket errors are logged and
    /// the loop keeps listening.
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        // One spare byte so an oversized datagram never truncates to a match.
        let mut buf = [0u8; READ_BUFFER_SIZE + 1];

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("discovery responder shutting down");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.answer(&buf[..len], from).await,
                    Err(err) => warn!(error = ?err, "discovery receive failed"),
                },
            }
        }
    }

    async fn answer(&self, payload: &[u8], from: SocketAddr) {
        let Some(reply) = reply_for(payload) else {
            debug!(%from, len = payload.len(), "ignoring unrecognised datagram");
            return;
        };

        info!(%from, "discovery request, responding");
        if let Err(err) = self.socket.send_to(reply, from).await {
            warn!(%from, error = ?err, "failed to answer discovery request");
        }
    }
}

/// Sends a discovery query to `target` (usually a broadcast address) and
/// returns the address of the first relay that answers within `wait`.
pub async fn discover(target: SocketAddr, wait: Duration) -> Result<Option<SocketAddr>> {
    let bind_addr = if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind discovery socket")?;
    socket
        .set_broadcast(true)
        .context("failed to enable broadcast")?;
    socket
        .send_to(DISCOVERY_QUERY, target)
        .await
        .with_context(|| format!("failed to send discovery query to {target}"))?;

    let deadline = Instant::now() + wait;
    let mut buf = [0u8; READ_BUFFER_SIZE];
    loop {
        let (len, from) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Ok(received) => received.context("discovery receive failed")?,
            Err(_) => return Ok(None),
        };
        if &buf[..len] == DISCOVERY_ACK {
            return Ok(Some(from));
        }
        debug!(%from, "ignoring unexpected discovery reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_exact_query_gets_a_reply() {
        assert_eq!(reply_for(b"DISCOVER_CHAT_SERVER"), Some(DISCOVERY_ACK));
        assert_eq!(reply_for(b"DISCOVER_CHAT_SERVER\n"), None);
        assert_eq!(reply_for(b"discover_chat_server"), None);
        assert_eq!(reply_for(b""), None);
    }
}
