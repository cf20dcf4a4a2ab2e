//! Server-side connection session.
//!
//! A session owns one peer connection for its whole lifetime:
//!
//! ```text
//! Connecting -> Active -> Closing -> Closed
//!                  \__________________/
//!                   peer EOF / I/O error
//! ```
//!
//! Each read is pushed through a fixed sequence of stages: the line
//! framer, the command interpreter, the responder and the outbound
//! encoder. Responses for one read are written in a single batch before
//! the next read, so responses leave in the order their requests arrived.

use crate::codec::{encode_line, LineFramer};
use crate::command::{interpret, Responder};
use crate::config::ProtocolConfig;
use crate::error::{FrameError, SessionEnd};
use crate::registry::SessionGuard;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Accepted, welcome line not yet sent.
    Connecting,
    /// Reading requests and answering them.
    Active,
    /// Last response written; shutting down the socket.
    Closing,
    /// Terminal. Registry entry and buffers released.
    Closed,
}

/// Read-only settings shared by every session of a server.
#[derive(Debug)]
pub struct SessionSettings {
    pub max_line_length: usize,
    pub welcome: String,
    pub responder: Responder,
}

impl SessionSettings {
    pub fn from_config(protocol: &ProtocolConfig) -> Self {
        Self {
            max_line_length: protocol.max_line_length,
            welcome: protocol.welcome.clone(),
            responder: protocol.responder(),
        }
    }
}

/// What the session should do after processing one read.
enum Flow {
    Continue,
    Quit,
    Violation(FrameError),
}

/// One peer connection on the server.
pub struct Session<S> {
    stream: S,
    peer: SocketAddr,
    state: SessionState,
    framer: LineFramer,
    settings: Arc<SessionSettings>,
    read_buf: BytesMut,
    outbound: BytesMut,
    shutdown: watch::Receiver<bool>,
    guard: Option<SessionGuard>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        settings: Arc<SessionSettings>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream,
            peer,
            state: SessionState::Connecting,
            framer: LineFramer::new(settings.max_line_length),
            settings,
            read_buf: BytesMut::with_capacity(BUFFER_SIZE),
            outbound: BytesMut::new(),
            shutdown,
            guard: None,
        }
    }

    /// Tie a registry entry to this session; it is released on `Closed`.
    pub fn with_guard(mut self, guard: SessionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until it reaches `Closed`.
    pub async fn run(&mut self) -> SessionEnd {
        let end = self.serve().await;

        match &end {
            SessionEnd::Quit | SessionEnd::Protocol(_) | SessionEnd::Shutdown => {
                self.transition(SessionState::Closing);
                if let Err(e) = self.stream.shutdown().await {
                    debug!(peer = %self.peer, error = %e, "Socket shutdown failed");
                }
            }
            SessionEnd::PeerClosed | SessionEnd::Transport(_) => {}
        }

        self.close(&end);
        end
    }

    async fn serve(&mut self) -> SessionEnd {
        self.transition(SessionState::Active);
        encode_line(&self.settings.welcome, &mut self.outbound);
        if let Err(e) = self.flush().await {
            return SessionEnd::Transport(e);
        }

        loop {
            self.read_buf.clear();

            let read = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return SessionEnd::Shutdown,
                read = self.stream.read_buf(&mut self.read_buf) => read,
            };

            match read {
                Ok(0) => {
                    if self.framer.pending() > 0 {
                        debug!(
                            peer = %self.peer,
                            bytes = self.framer.pending(),
                            "Discarding unterminated line at EOF"
                        );
                    }
                    return SessionEnd::PeerClosed;
                }
                Ok(n) => trace!(peer = %self.peer, bytes = n, "Read"),
                Err(e) => return SessionEnd::Transport(e),
            }

            let data = std::mem::take(&mut self.read_buf);
            let flow = self.process(&data);
            self.read_buf = data;

            // Responses to lines decoded before a violation or quit still go out.
            if let Err(e) = self.flush().await {
                return SessionEnd::Transport(e);
            }

            match flow {
                Flow::Continue => {}
                Flow::Quit => return SessionEnd::Quit,
                Flow::Violation(e) => return SessionEnd::Protocol(e),
            }
        }
    }

    /// Frame, interpret and answer every line completed by `data`.
    fn process(&mut self, data: &[u8]) -> Flow {
        for result in self.framer.feed(data) {
            let line = match result {
                Ok(line) => line,
                Err(e) => return Flow::Violation(e),
            };

            debug!(peer = %self.peer, line = %line, "Received line");

            let command = interpret(&line);
            let response = self.settings.responder.respond(&command);
            encode_line(&response, &mut self.outbound);

            if command.closes_session() {
                return Flow::Quit;
            }
        }
        Flow::Continue
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.outbound).await?;
        self.stream.flush().await?;
        self.outbound.clear();
        Ok(())
    }

    fn close(&mut self, end: &SessionEnd) {
        self.transition(SessionState::Closed);
        self.outbound = BytesMut::new();
        self.read_buf = BytesMut::new();

        drop(self.guard.take());
        if end.is_graceful() {
            info!(peer = %self.peer, reason = %end, "Client disconnected");
        } else {
            warn!(peer = %self.peer, reason = %end, "Client connection dropped");
        }
    }

    fn transition(&mut self, next: SessionState) {
        trace!(peer = %self.peer, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }
}
