//! TCP listener for the line protocol.
//!
//! Accepts connections until the shutdown future resolves and hands each
//! one to its own [`Session`] task. Sessions share only the read-only
//! [`SessionSettings`] and the [`SessionRegistry`].

use crate::config::{ProtocolConfig, ServerConfig};
use crate::error::ServerError;
use crate::net;
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionSettings};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Pause after a failed accept so resource exhaustion does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for sessions to close their sockets.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server instance
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    settings: Arc<SessionSettings>,
    registry: SessionRegistry,
}

impl Server {
    /// Bind the listening socket.
    ///
    /// Failing to acquire the port is reported here, before any connection
    /// is accepted.
    pub async fn bind(config: &ServerConfig, protocol: &ProtocolConfig) -> Result<Self, ServerError> {
        let listen = config.listen_addr();
        let addr = tokio::net::lookup_host(&listen)
            .await
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses found")
                })
            })
            .map_err(|source| ServerError::InvalidAddress {
                addr: listen.clone(),
                source,
            })?;

        let listener = net::bind_listener(addr, config.backlog)
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        info!(
            address = %local_addr,
            backlog = config.backlog,
            max_connections = ?config.session_limit(),
            "Server listening"
        );

        Ok(Server {
            listener,
            local_addr,
            settings: Arc::new(SessionSettings::from_config(protocol)),
            registry: SessionRegistry::new(config.session_limit()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Accept connections until `shutdown` resolves, then close every
    /// session and release the port.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            settings,
            registry,
            ..
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut sessions = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        spawn_session(
                            &mut sessions,
                            stream,
                            peer,
                            &settings,
                            &registry,
                            shutdown_rx.clone(),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Session task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(sessions = registry.len(), "Shutting down");
        if registry.is_empty() {
            return;
        }
        for entry in registry.snapshot() {
            debug!(
                peer = %entry.peer,
                connected_for_ms = entry.connected_at.elapsed().as_millis() as u64,
                "Closing session"
            );
        }

        let _ = shutdown_tx.send(true);
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while let Some(joined) = sessions.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Session task failed");
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(sessions = sessions.len(), "Sessions did not close in time, aborting");
            sessions.abort_all();
        }
    }
}

fn spawn_session(
    sessions: &mut JoinSet<()>,
    stream: TcpStream,
    peer: SocketAddr,
    settings: &Arc<SessionSettings>,
    registry: &SessionRegistry,
    shutdown: watch::Receiver<bool>,
) {
    let Some(guard) = registry.register(peer) else {
        warn!(
            peer = %peer,
            limit = ?registry.capacity(),
            "Connection limit reached, refusing client"
        );
        return;
    };

    if let Err(e) = net::configure_stream(&stream) {
        debug!(peer = %peer, error = %e, "Failed to set socket options");
    }

    info!(peer = %peer, active = registry.len(), "Client connected");

    let settings = Arc::clone(settings);
    sessions.spawn(async move {
        let mut session = Session::new(stream, peer, settings, shutdown).with_guard(guard);
        session.run().await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct Running {
        addr: SocketAddr,
        registry: SessionRegistry,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    }

    fn test_config(max_connections: usize) -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections,
            ..ServerConfig::default()
        }
    }

    async fn start(max_connections: usize) -> Running {
        let server = Server::bind(&test_config(max_connections), &ProtocolConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr();
        let registry = server.registry().clone();
        let (stop, stopped) = oneshot::channel();
        let handle = tokio::spawn(server.run(async move {
            let _ = stopped.await;
        }));
        Running {
            addr,
            registry,
            stop,
            handle,
        }
    }

    struct Peer {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Peer {
        async fn connect(addr: SocketAddr) -> Self {
            let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
            Peer {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
        }

        /// Next line without its line feed, or `None` at EOF.
        async fn recv(&mut self) -> Option<String> {
            let mut line = String::new();
            match self.reader.read_line(&mut line).await {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.trim_end_matches('\n').to_string()),
            }
        }
    }

    async fn wait_for_empty(registry: &SessionRegistry) {
        for _ in 0..100 {
            if registry.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry still holds {} sessions", registry.len());
    }

    #[tokio::test]
    async fn test_echo_time_quit_scenario() {
        let server = start(0).await;
        let mut peer = Peer::connect(server.addr).await;

        assert_eq!(
            peer.recv().await.as_deref(),
            Some("Connected to server. Type a message.")
        );

        peer.send("hello\n").await;
        assert_eq!(peer.recv().await.as_deref(), Some("[echo] hello"));

        peer.send("TIME\n").await;
        let time = peer.recv().await.unwrap();
        assert!(
            NaiveDateTime::parse_from_str(&time, "%Y-%m-%dT%H:%M:%S%.3f").is_ok(),
            "not a timestamp: {time}"
        );

        peer.send("  Quit \n").await;
        assert_eq!(peer.recv().await.as_deref(), Some("Goodbye"));
        assert_eq!(peer.recv().await, None);

        wait_for_empty(&server.registry).await;
    }

    #[tokio::test]
    async fn test_long_line_is_echoed_intact() {
        let server = start(0).await;
        let mut peer = Peer::connect(server.addr).await;
        peer.recv().await.unwrap();

        let payload = "é".repeat(4096);
        peer.send(&format!("{payload}\n")).await;
        assert_eq!(peer.recv().await, Some(format!("[echo] {payload}")));
    }

    #[tokio::test]
    async fn test_oversized_line_closes_connection() {
        let server = start(0).await;
        let mut peer = Peer::connect(server.addr).await;
        peer.recv().await.unwrap();

        peer.send(&"x".repeat(9000)).await;
        assert_eq!(peer.recv().await, None);

        wait_for_empty(&server.registry).await;
    }

    #[tokio::test]
    async fn test_clients_are_isolated() {
        let server = start(0).await;
        let mut a = Peer::connect(server.addr).await;
        let mut b = Peer::connect(server.addr).await;
        a.recv().await.unwrap();
        b.recv().await.unwrap();

        for i in 0..5 {
            a.send(&format!("a-{i}\n")).await;
            b.send(&format!("b-{i}\n")).await;
        }

        for i in 0..5 {
            assert_eq!(a.recv().await, Some(format!("[echo] a-{i}")));
            assert_eq!(b.recv().await, Some(format!("[echo] b-{i}")));
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let server = start(1).await;
        let mut first = Peer::connect(server.addr).await;
        assert!(first.recv().await.is_some());

        let mut second = Peer::connect(server.addr).await;
        assert_eq!(second.recv().await, None);

        first.send("still here\n").await;
        assert_eq!(first.recv().await.as_deref(), Some("[echo] still here"));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let server = start(0).await;
        let config = ServerConfig {
            port: server.addr.port(),
            ..test_config(0)
        };

        let result = Server::bind(&config, &ProtocolConfig::default()).await;
        assert!(matches!(result, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_unresolvable_host_keeps_cause() {
        use std::error::Error as _;

        let config = ServerConfig {
            // Rejected by the resolver without a DNS round trip.
            host: "bad\0host".to_string(),
            ..test_config(0)
        };

        match Server::bind(&config, &ProtocolConfig::default()).await {
            Err(err @ ServerError::InvalidAddress { .. }) => assert!(err.source().is_some()),
            other => panic!("unexpected: {:?}", other.map(|s| s.local_addr())),
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_port() {
        let server = start(0).await;
        let mut peer = Peer::connect(server.addr).await;
        peer.recv().await.unwrap();

        server.stop.send(()).unwrap();
        server.handle.await.unwrap();

        assert_eq!(peer.recv().await, None);
        assert!(server.registry.is_empty());
        assert!(TcpStream::connect(server.addr).await.is_err());
    }
}
