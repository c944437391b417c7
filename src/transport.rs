//! IP/UDP transport. Binds to a local address, allows to define
//! virtual connections for remote destinations and demultiplexes
//! incoming datagrams based on these connections. Also home of the
//! [MessageSender] seam the messaging core sends through, so tests can
//! substitute a recording sender for the real socket.

use anyhow::{Context, Result};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::UdpSocket, sync::Mutex};

use crate::error::Error;

/// Send primitive consumed by the reliable-message and counter-sync
/// managers. `data` is the fully encoded frame; `peer` is the node id
/// the frame targets. Must not block - implementations hand the frame
/// to a background task or channel.
pub trait MessageSender: Send + Sync {
    fn send(&self, peer: u64, data: &[u8]) -> Result<(), Error>;
}

/// Test/diagnostic sender - records outbound frames on a channel.
pub struct ChannelSender {
    tx: tokio::sync::mpsc::UnboundedSender<(u64, Vec<u8>)>,
}

impl ChannelSender {
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(u64, Vec<u8>)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MessageSender for ChannelSender {
    fn send(&self, peer: u64, data: &[u8]) -> Result<(), Error> {
        self.tx
            .send((peer, data.to_vec()))
            .map_err(|_| Error::SendFailed)
    }
}

#[derive(Debug, Clone)]
struct ConnectionInfo {
    sender: tokio::sync::mpsc::Sender<Vec<u8>>,
}

pub struct Transport {
    socket: Arc<UdpSocket>,
    connections: Mutex<HashMap<SocketAddr, ConnectionInfo>>,
    /// Node-id addressing for the [MessageSender] path.
    peers: std::sync::Mutex<HashMap<u64, SocketAddr>>,
    remove_channel_sender: tokio::sync::mpsc::UnboundedSender<Option<SocketAddr>>,
    stop_receive_token: tokio_util::sync::CancellationToken,
}

pub struct Connection {
    transport: Arc<Transport>,
    remote_address: SocketAddr,
    receiver: Mutex<tokio::sync::mpsc::Receiver<Vec<u8>>>,
}

impl Transport {
    async fn read_from_socket_loop(
        socket: Arc<UdpSocket>,
        stop_receive_token: tokio_util::sync::CancellationToken,
        self_weak: std::sync::Weak<Transport>,
    ) -> Result<()> {
        loop {
            let mut buf = vec![0u8; 1024];
            let (n, addr) = {
                tokio::select! {
                    recv_resp = socket.recv_from(&mut buf) => recv_resp,
                    _ = stop_receive_token.cancelled() => break
                }
            }?;
            buf.resize(n, 0);
            let self_strong = self_weak
                .upgrade()
                .context("weakpointer to self is gone - just stop")?;
            let cons = self_strong.connections.lock().await;
            if let Some(c) = cons.get(&addr) {
                _ = c.sender.send(buf).await;
            } else {
                log::trace!("datagram from unknown peer {} dropped", addr);
            }
        }
        Ok(())
    }

    async fn read_from_delete_queue_loop(
        mut remove_channel_receiver: tokio::sync::mpsc::UnboundedReceiver<Option<SocketAddr>>,
        self_weak: std::sync::Weak<Transport>,
    ) -> Result<()> {
        loop {
            match remove_channel_receiver.recv().await {
                Some(Some(to_remove)) => {
                    let self_strong = self_weak
                        .upgrade()
                        .context("weak to self is gone - just stop")?;
                    let mut cons = self_strong.connections.lock().await;
                    _ = cons.remove(&to_remove);
                }
                Some(None) | None => break,
            }
        }
        Ok(())
    }

    pub async fn new(local: &str) -> Result<Arc<Self>> {
        let socket = UdpSocket::bind(local).await?;
        let (remove_channel_sender, remove_channel_receiver) =
            tokio::sync::mpsc::unbounded_channel();
        let stop_receive_token = tokio_util::sync::CancellationToken::new();
        let stop_receive_token_child = stop_receive_token.child_token();
        let o = Arc::new(Self {
            socket: Arc::new(socket),
            connections: Mutex::new(HashMap::new()),
            peers: std::sync::Mutex::new(HashMap::new()),
            remove_channel_sender,
            stop_receive_token,
        });
        let self_weak = Arc::downgrade(&o.clone());
        let socket = o.socket.clone();
        tokio::spawn(async move {
            _ = Self::read_from_socket_loop(socket, stop_receive_token_child, self_weak).await;
        });
        let self_weak = Arc::downgrade(&o.clone());
        tokio::spawn(async move {
            _ = Self::read_from_delete_queue_loop(remove_channel_receiver, self_weak).await;
        });
        Ok(o)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn create_connection(self: &Arc<Self>, remote: SocketAddr) -> Arc<Connection> {
        let mut clock = self.connections.lock().await;
        let (sender, receiver) = tokio::sync::mpsc::channel(32);
        clock.insert(remote, ConnectionInfo { sender });
        Arc::new(Connection {
            transport: self.clone(),
            remote_address: remote,
            receiver: Mutex::new(receiver),
        })
    }

    /// Make a node id addressable through the [MessageSender] interface.
    pub fn register_peer(&self, node_id: u64, addr: SocketAddr) {
        let mut peers = self.peers.lock().unwrap();
        peers.insert(node_id, addr);
    }
}

impl MessageSender for Transport {
    fn send(&self, peer: u64, data: &[u8]) -> Result<(), Error> {
        let addr = {
            let peers = self.peers.lock().unwrap();
            match peers.get(&peer) {
                Some(a) => *a,
                None => {
                    log::debug!("send to unregistered peer {}", peer);
                    return Err(Error::SendFailed);
                }
            }
        };
        let socket = self.socket.clone();
        let data = data.to_vec();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&data, addr).await {
                log::debug!("send to {} failed: {:?}", addr, e);
            }
        });
        Ok(())
    }
}

impl Connection {
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        self.transport
            .socket
            .send_to(data, self.remote_address)
            .await?;
        Ok(())
    }
    pub async fn receive(&self, timeout: Duration) -> Result<Vec<u8>> {
        let mut ch = self.receiver.lock().await;
        let rec_future = ch.recv();
        let with_timeout = tokio::time::timeout(timeout, rec_future);
        with_timeout.await?.context("eof")
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        _ = self.remove_channel_sender.send(None);
        self.stop_receive_token.cancel();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        _ = self
            .transport
            .remove_channel_sender
            .send(Some(self.remote_address));
    }
}
