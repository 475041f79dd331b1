use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{protocol::Framing, relay::RelayOptions};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the chat relay and its discovery responder.
    Serve(ServeArgs),
    /// Broadcast a discovery query and print the relay that answers.
    Discover(DiscoverArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address for chat connections. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "0.0.0.0:9001")]
    pub listen: SocketAddr,

    /// Socket address the discovery responder answers on.
    #[arg(long, env = "CHAT_RELAY_DISCOVERY", default_value = "0.0.0.0:9002")]
    pub discovery: SocketAddr,

    /// Do not answer discovery queries.
    #[arg(long)]
    pub no_discovery: bool,

    /// How inbound bytes are split into chat messages.
    #[arg(long, env = "CHAT_RELAY_FRAMING", value_enum, default_value_t = Framing::Raw)]
    pub framing: Framing,

    /// Milliseconds a broadcast may spend writing to one peer before that
    /// peer is dropped.
    #[arg(long, env = "CHAT_RELAY_WRITE_TIMEOUT_MS", default_value_t = 2000)]
    pub write_timeout_ms: u64,
}

impl ServeArgs {
    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            framing: self.framing,
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct DiscoverArgs {
    /// Address the query is sent to.
    #[arg(long, default_value = "255.255.255.255:9002")]
    pub target: SocketAddr,

    /// Milliseconds to wait for an answer.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}
