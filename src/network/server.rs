//! TCP server and client transport.
//!
//! Frames are a 4-byte big-endian length followed by a bincode-encoded
//! [`Envelope`]. Replies travel back on the same connection as a framed
//! [`Message`]. A pooled connection carries one exchange at a time; an
//! exchange that fails or is abandoned mid-flight closes the connection so
//! its late reply can never be read by the next request.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{decode_message, frame_message, Envelope, Message, MAX_FRAME_SIZE};
use crate::network::transport::{MessageHandler, Transport};
use crate::types::NodeId;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

async fn read_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(NetworkError::FrameTooLarge(len).into());
    }

    let mut data = vec![0u8; len];
    stream
        .read_exact(&mut data)
        .await
        .map_err(NetworkError::Io)?;
    Ok(Some(data))
}

/// TCP server dispatching framed requests to a handler.
pub struct NetworkServer {
    /// Address to bind to.
    bind_addr: SocketAddr,

    /// Message handler.
    handler: Arc<dyn MessageHandler>,

    /// Shutdown signal receiver.
    shutdown_rx: mpsc::Receiver<()>,
}

impl NetworkServer {
    /// Create a new network server.
    pub fn new(
        bind_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            bind_addr,
            handler,
            shutdown_rx,
        };

        (server, shutdown_tx)
    }

    /// Bind and serve until shutdown.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(mut self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr().map_err(NetworkError::Io)?;
        info!(addr = %local_addr, "Network server listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler).await {
                                    debug!(error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        while let Some(data) = read_frame(&mut stream).await? {
            let envelope: Envelope = decode_message(&data)?;
            let response = handler.handle(envelope.from, envelope.message).await;

            let framed = frame_message(&response)?;
            stream.write_all(&framed).await.map_err(NetworkError::Io)?;
        }
        Ok(())
    }
}

/// Pooled connection slot for one peer. `None` until connected, and again
/// after an exchange on it failed or was cancelled.
type ConnectionSlot = Arc<Mutex<Option<TcpStream>>>;

/// Transport over TCP, keeping one connection per peer.
pub struct TcpTransport {
    local: NodeId,
    peers: RwLock<HashMap<NodeId, SocketAddr>>,
    connections: DashMap<NodeId, ConnectionSlot>,
}

/// An exchange holding a pooled connection. Dropping it before
/// [`InFlight::complete`] closes the connection.
struct InFlight<'a> {
    slot: &'a mut Option<TcpStream>,
    completed: bool,
}

impl InFlight<'_> {
    fn complete(&mut self) {
        self.completed = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed && self.slot.take().is_some() {
            debug!("Closing connection after an unfinished exchange");
        }
    }
}

impl TcpTransport {
    /// Create a transport for the local node.
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            peers: RwLock::new(HashMap::new()),
            connections: DashMap::new(),
        }
    }

    /// Register or update a peer address.
    pub fn add_peer(&self, node: NodeId, addr: SocketAddr) {
        self.peers.write().insert(node, addr);
        self.connections.remove(&node);
    }

    /// Forget a peer.
    pub fn remove_peer(&self, node: NodeId) {
        self.peers.write().remove(&node);
        self.connections.remove(&node);
    }

    fn slot(&self, target: NodeId) -> ConnectionSlot {
        self.connections
            .entry(target)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    async fn connect(&self, target: NodeId) -> Result<TcpStream> {
        let addr = self
            .peers
            .read()
            .get(&target)
            .copied()
            .ok_or(NetworkError::UnknownNode(target))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        stream.set_nodelay(true).map_err(NetworkError::Io)?;
        debug!(target, addr = %addr, "Opened connection");
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, framed: &[u8]) -> Result<Message> {
        stream.write_all(framed).await.map_err(NetworkError::Io)?;
        match read_frame(stream).await? {
            Some(data) => Ok(decode_message(&data)?),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_node(&self) -> NodeId {
        self.local
    }

    async fn request(&self, target: NodeId, msg: Message) -> Result<Message> {
        let framed = frame_message(&Envelope {
            from: self.local,
            message: msg,
        })?;

        if !self.peers.read().contains_key(&target) {
            return Err(NetworkError::UnknownNode(target).into());
        }
        let slot = self.slot(target);
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect(target).await?);
        }

        let mut in_flight = InFlight {
            slot: &mut *guard,
            completed: false,
        };
        let stream = in_flight
            .slot
            .as_mut()
            .ok_or(NetworkError::ConnectionClosed)?;
        let reply = Self::exchange(stream, &framed).await?;
        in_flight.complete();
        Ok(reply)
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("local", &self.local)
            .field("peers", &*self.peers.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{PingRequest, PongResponse};

    struct PongHandler;

    #[async_trait]
    impl MessageHandler for PongHandler {
        async fn handle(&self, from: NodeId, msg: Message) -> Message {
            match msg {
                Message::Ping(_) => Message::Pong(PongResponse {
                    node_id: from + 100,
                    topology_id: 7,
                }),
                _ => Message::Ack,
            }
        }
    }

    #[tokio::test]
    async fn test_request_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server, shutdown_tx) = NetworkServer::new(addr, Arc::new(PongHandler));
        let server_handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let transport = TcpTransport::new(1);
        transport.add_peer(2, addr);

        for _ in 0..3 {
            let reply = transport
                .request(2, Message::Ping(PingRequest { node_id: 1 }))
                .await
                .unwrap();
            assert!(matches!(
                reply,
                Message::Pong(PongResponse {
                    node_id: 101,
                    topology_id: 7
                })
            ));
        }

        let _ = shutdown_tx.send(()).await;
        let _ = server_handle.await;
    }

    /// Answers a ping with its own id, slowly for id 1.
    struct SlowEchoHandler;

    #[async_trait]
    impl MessageHandler for SlowEchoHandler {
        async fn handle(&self, _from: NodeId, msg: Message) -> Message {
            match msg {
                Message::Ping(ping) => {
                    if ping.node_id == 1 {
                        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    }
                    Message::Pong(PongResponse {
                        node_id: ping.node_id,
                        topology_id: 0,
                    })
                }
                _ => Message::Ack,
            }
        }
    }

    #[tokio::test]
    async fn test_timed_out_request_does_not_leak_its_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server, shutdown_tx) = NetworkServer::new(addr, Arc::new(SlowEchoHandler));
        let server_handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        let transport = TcpTransport::new(9);
        transport.add_peer(2, addr);

        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            transport.request(2, Message::Ping(PingRequest { node_id: 1 })),
        )
        .await;
        assert!(abandoned.is_err());

        for id in [2, 3] {
            let reply = transport
                .request(2, Message::Ping(PingRequest { node_id: id }))
                .await
                .unwrap();
            match reply {
                Message::Pong(pong) => assert_eq!(pong.node_id, id),
                other => panic!("Unexpected reply: {}", other.name()),
            }
        }

        // Let the slow reply to the abandoned ping arrive, then make sure
        // nothing reads it.
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let reply = transport
            .request(2, Message::Ping(PingRequest { node_id: 4 }))
            .await
            .unwrap();
        assert!(matches!(reply, Message::Pong(PongResponse { node_id: 4, .. })));

        let _ = shutdown_tx.send(()).await;
        let _ = server_handle.await;
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let transport = TcpTransport::new(1);
        let result = transport.request(5, Message::Ack).await;
        assert!(matches!(
            result,
            Err(crate::error::Error::Network(NetworkError::UnknownNode(5)))
        ));
    }
}
