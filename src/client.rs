//! Interactive client for the line protocol.
//!
//! Two tasks share one connection:
//! - the inbound task frames server replies and prints them
//! - the outbound task forwards local input lines to the server
//!
//! They touch disjoint halves of the socket and only share a quit flag
//! and the [`Console`]. The process ends when the server closes the
//! connection, whether after our `quit` or on its own.

use crate::codec::{encode_line, LineFramer};
use crate::command::is_quit;
use crate::config::{ClientConfig, ProtocolConfig};
use crate::error::ClientError;
use crate::net;
use bytes::BytesMut;
use std::fmt::Display;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Prefix for lines received from the server.
const REPLY_PREFIX: &str = "server: ";

/// Line-atomic output shared by both client tasks.
///
/// Each call to [`Console::line`] writes one complete line while holding
/// the lock, so output from the two tasks never interleaves mid-line.
#[derive(Clone)]
pub struct Console {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Console {
    pub fn new<W>(writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            out: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn line(&self, text: impl Display) {
        let mut line = text.to_string();
        line.push('\n');

        let mut out = self.out.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = out.write_all(line.as_bytes()).and_then(|_| out.flush()) {
            warn!(error = %e, "Console write failed");
        }
    }
}

/// How a client session ended.
#[derive(Debug)]
pub enum ClientExit {
    /// We sent `quit`, the server answered with its farewell and closed
    /// the connection.
    QuitAcknowledged,
    /// The server closed the connection without being asked to.
    ServerClosed,
    /// The connection failed.
    ConnectionLost(ClientError),
}

/// State shared between the inbound and outbound tasks.
#[derive(Debug)]
struct Link {
    quit_sent: AtomicBool,
}

impl Link {
    fn new() -> Self {
        Self {
            quit_sent: AtomicBool::new(false),
        }
    }

    fn quit_sent(&self) -> bool {
        self.quit_sent.load(Ordering::Acquire)
    }

    fn mark_quit(&self) {
        self.quit_sent.store(true, Ordering::Release);
    }
}

/// A connected client.
pub struct Client {
    stream: TcpStream,
    server: String,
    /// Longest line the server may send us.
    reply_limit: usize,
    farewell: String,
}

impl Client {
    pub async fn connect(config: &ClientConfig, protocol: &ProtocolConfig) -> Result<Self, ClientError> {
        let server = config.server_addr();
        let stream = TcpStream::connect(&server)
            .await
            .map_err(|source| ClientError::Connect {
                addr: server.clone(),
                source,
            })?;

        if let Err(e) = net::configure_stream(&stream) {
            debug!(error = %e, "Failed to set socket options");
        }

        Ok(Client {
            stream,
            server,
            reply_limit: protocol.reply_line_limit(),
            farewell: protocol.farewell.clone(),
        })
    }

    /// Relay `input` to the server and print its replies until the
    /// connection closes.
    pub async fn run<I>(self, input: I, console: Console) -> ClientExit
    where
        I: AsyncBufRead + Unpin + Send + 'static,
    {
        console.line(format_args!("Connected to server: {}", self.server));
        console.line("Commands: 'quit' to exit, 'time' for the server's time");
        console.line("Type a message:");

        let (reader, writer) = self.stream.into_split();
        let link = Arc::new(Link::new());

        let outbound = tokio::spawn(forward_input(
            input,
            writer,
            Arc::clone(&link),
            console.clone(),
        ));

        let exit = display_replies(reader, self.reply_limit, &self.farewell, &link, &console).await;
        // Local input may still be blocked on a read that never completes.
        outbound.abort();

        match &exit {
            ClientExit::QuitAcknowledged => console.line("Connection closed."),
            ClientExit::ServerClosed => console.line("Server disconnected."),
            ClientExit::ConnectionLost(e) => console.line(format_args!("Connection lost: {e}")),
        }

        exit
    }
}

/// Inbound task: frame and print server lines until EOF.
async fn display_replies(
    mut reader: OwnedReadHalf,
    reply_limit: usize,
    farewell: &str,
    link: &Link,
    console: &Console,
) -> ClientExit {
    let mut framer = LineFramer::new(reply_limit);
    let mut farewell_seen = false;
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buf.clear();
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => return ClientExit::ConnectionLost(e.into()),
        }

        for line in framer.feed(&buf) {
            match line {
                Ok(line) => {
                    farewell_seen = line == farewell;
                    console.line(format_args!("{REPLY_PREFIX}{line}"));
                }
                Err(e) => return ClientExit::ConnectionLost(e.into()),
            }
        }
    }

    // A close after `quit` without the farewell is the server going away.
    if link.quit_sent() && farewell_seen {
        ClientExit::QuitAcknowledged
    } else {
        ClientExit::ServerClosed
    }
}

/// Outbound task: forward local lines until `quit`, end of input or a
/// failed write.
async fn forward_input<I>(mut input: I, mut writer: OwnedWriteHalf, link: Arc<Link>, console: Console)
where
    I: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut frame = BytesMut::new();

    loop {
        line.clear();
        match input.read_line(&mut line).await {
            Ok(0) => {
                debug!("Local input closed");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                console.line(format_args!("Input error: {e}"));
                break;
            }
        }

        let text = line.trim_end_matches(['\n', '\r']);
        let quit = is_quit(text);
        if quit {
            link.mark_quit();
        }

        frame.clear();
        encode_line(text, &mut frame);
        if let Err(e) = writer.write_all(&frame).await {
            debug!(error = %e, "Write to server failed");
            console.line("Server connection lost.");
            return;
        }

        if quit {
            // The server's close ends the session.
            return;
        }
    }

    // Let the server see EOF; replies still in flight are displayed.
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Failed to shut down write side");
    }
}
