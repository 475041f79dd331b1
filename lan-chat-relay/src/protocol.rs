use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};

pub const DEFAULT_CHAT_PORT: u16 = 9001;
pub const DEFAULT_DISCOVERY_PORT: u16 = 9002;

/// Payload a client broadcasts to locate the relay.
pub const DISCOVERY_QUERY: &[u8] = b"DISCOVER_CHAT_SERVER";
/// Payload the relay sends back to the querying address.
pub const DISCOVERY_ACK: &[u8] = b"CHAT_SERVER_FOUND";

/// Upper bound for a single read in raw framing and for discovery datagrams.
pub const READ_BUFFER_SIZE: usize = 1024;
/// Upper bound for one newline-delimited message in line framing.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const SYSTEM_SENDER: &str = "SYSTEM";
const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// How inbound bytes on a chat stream are split into messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Framing {
    /// Every read from the socket is one message. Matches clients that send
    /// unterminated payloads and rely on one send arriving as one read.
    /// A multi-byte UTF-8 character split across two reads decodes as
    /// replacement characters.
    #[default]
    Raw,
    /// Messages are terminated by `\n`; coalesced or fragmented reads are
    /// reassembled.
    Lines,
}

pub fn chat_line(name: &str, text: &str) -> String {
    format!("{name}: {text}")
}

pub fn system_line(text: &str) -> String {
    format!("{SYSTEM_SENDER}: {text}")
}

pub fn joined_notice(name: &str) -> String {
    system_line(&format!("{name} has joined the chat."))
}

pub fn left_notice(name: &str) -> String {
    system_line(&format!("{name} has left the chat."))
}

/// Reads inbound chat messages according to a [`Framing`].
pub struct MessageReader<R> {
    reader: BufReader<R>,
    framing: Framing,
    line: Vec<u8>,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader: BufReader::new(reader),
            framing,
            line: Vec::new(),
        }
    }

    /// Returns `Ok(None)` once the peer has shut down its side of the stream.
    ///
    /// Trailing line endings are stripped; invalid UTF-8 is replaced rather
    /// than rejected.
    pub async fn read_message(&mut self) -> io::Result<Option<String>> {
        match self.framing {
            Framing::Raw => self.read_chunk().await,
            Framing::Lines => self.read_line().await,
        }
    }

    async fn read_chunk(&mut self) -> io::Result<Option<String>> {
        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let bytes = self.reader.read(&mut chunk).await?;
        if bytes == 0 {
            return Ok(None);
        }
        Ok(Some(decode(&chunk[..bytes])))
    }

    async fn read_line(&mut self) -> io::Result<Option<String>> {
        self.line.clear();
        // Room for a full-length message plus its `\r\n` terminator.
        let bytes = (&mut self.reader)
            .take(MAX_LINE_BYTES as u64 + 2)
            .read_until(b'\n', &mut self.line)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }

        let payload = match self.line.strip_suffix(b"\n") {
            Some(body) => body.strip_suffix(b"\r").unwrap_or(body),
            None => &self.line[..],
        };
        if payload.len() > MAX_LINE_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message exceeds {MAX_LINE_BYTES} bytes"),
            ));
        }

        Ok(Some(decode(payload)))
    }
}

fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(LINE_ENDINGS)
        .to_string()
}

/// Writes `line` followed by a newline and flushes, so peers that split on
/// line boundaries always see whole lines.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}
