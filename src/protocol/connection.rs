use std::io;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::message::END_MARKER;
use crate::overlay::types::Address;

/// A newline-framed text connection.
///
/// Idle reads ([`Connection::recv_line`]) wait forever; replies to our own
/// requests ([`Connection::request`], [`Connection::recv_block`]) are bounded
/// by the receive timeout.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: String,
    receive_timeout: Duration,
}

impl Connection {
    pub fn new(stream: TcpStream, receive_timeout: Duration) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            receive_timeout,
        }
    }

    pub async fn open(address: &Address, receive_timeout: Duration) -> io::Result<Self> {
        let target = address.socket_string();
        let stream = timeout(receive_timeout, TcpStream::connect(target.as_str()))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", target),
                )
            })??;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream, receive_timeout))
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, message: &str) -> io::Result<()> {
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Next line without its terminator, or `None` once the peer has closed.
    pub async fn recv_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Like [`Connection::recv_line`] but bounded, and EOF is an error.
    pub async fn recv_reply(&mut self) -> io::Result<String> {
        let limit = self.receive_timeout;
        match timeout(limit, self.recv_line()).await {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed the connection", self.peer),
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no reply from {} within {:?}", self.peer, limit),
            )),
        }
    }

    /// Reads lines up to and including the `#END` marker. Returned text
    /// keeps one `\n` after every line.
    pub async fn recv_block(&mut self) -> io::Result<String> {
        let mut block = String::new();
        loop {
            let line = self.recv_reply().await?;
            block.push_str(&line);
            block.push('\n');
            if line == END_MARKER {
                return Ok(block);
            }
        }
    }

    /// Sends a one-line request and waits for its one-line reply.
    pub async fn request(&mut self, message: &str) -> io::Result<String> {
        self.send(message).await?;
        self.recv_reply().await
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
