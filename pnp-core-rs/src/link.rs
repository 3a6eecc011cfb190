//! Datagram link between the coordinator and actuator nodes
//!
//! The link is unreliable and connectionless: a send hands the packet to every
//! endpoint it can reach and forgets about it. Receivers filter on the packet's
//! node handle and feeder identity.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::error::Error;
use crate::protocol::Packet;

/// Default UDP port of the feeder network
pub const DEFAULT_PORT: u16 = 9990;

/// Maximum datagram size
const MAX_MSG_SIZE: usize = 65536;

/// Depth of each inbound queue
const INBOUND_CAPACITY: usize = 256;

/// Encoded datagrams waiting for the UDP send task
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("outbound queue full")]
    Backlog,
    #[error("link closed")]
    Closed,
}

impl From<LinkError> for Error {
    fn from(e: LinkError) -> Self {
        Error::link(e.to_string())
    }
}

/// Best-effort packet sink
pub trait Link: Send + Sync {
    fn send(&self, packet: &Packet) -> Result<(), LinkError>;
}

/// UDP transport fanning every packet out to a fixed address list
///
/// `send` only queues the encoded datagram; a background task awaits the
/// socket and writes it to each fan-out address in order.
pub struct UdpLink {
    socket: Arc<UdpSocket>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl UdpLink {
    /// Bind the socket, enable broadcast and start the send task
    pub async fn bind(addr: SocketAddr, fanout: Vec<SocketAddr>) -> Result<Self, LinkError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        socket.set_broadcast(true)?;

        let (outbound, mut queue) = mpsc::channel::<Vec<u8>>(OUTBOUND_CAPACITY);
        let sender = socket.clone();
        tokio::spawn(async move {
            while let Some(bytes) = queue.recv().await {
                for addr in &fanout {
                    if let Err(e) = sender.send_to(&bytes, addr).await {
                        warn!("Failed to send to {}: {}", addr, e);
                    }
                }
            }
            debug!("UDP send task stopped");
        });

        Ok(Self { socket, outbound })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.socket.local_addr()?)
    }

    /// Start receiving packets in background
    pub fn start_receive(&self) -> mpsc::Receiver<Packet> {
        let socket = self.socket.clone();
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MSG_SIZE];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, src)) => match Packet::from_bytes(&buf[..len]) {
                        Ok(packet) => {
                            trace!("Received {:?} from {}", packet.payload, src);
                            if tx.send(packet).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!("Dropping datagram from {}: {}", src, e);
                        }
                    },
                    Err(e) => {
                        error!("UDP receive error: {}", e);
                    }
                }
            }
            debug!("UDP receive task stopped");
        });

        rx
    }
}

impl Link for UdpLink {
    fn send(&self, packet: &Packet) -> Result<(), LinkError> {
        let bytes = packet.to_bytes()?;
        trace!("Queueing {:?} ({} bytes)", packet.payload.code(), bytes.len());
        self.outbound.try_send(bytes).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Backlog,
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
        })
    }
}

/// In-process broadcast medium with optional packet loss
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

#[derive(Default)]
struct BusInner {
    endpoints: Vec<(usize, mpsc::Sender<Packet>)>,
    next_id: usize,
    loss_rate: f64,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop each delivery with probability `rate`
    pub fn with_loss_rate(rate: f64) -> Self {
        let bus = Self::default();
        bus.inner.lock().loss_rate = rate.clamp(0.0, 1.0);
        bus
    }

    pub fn set_loss_rate(&self, rate: f64) {
        self.inner.lock().loss_rate = rate.clamp(0.0, 1.0);
    }

    /// New endpoint; it receives everything other endpoints send
    pub fn attach(&self) -> (MemoryLink, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.endpoints.push((id, tx));

        (
            MemoryLink {
                id,
                bus: self.clone(),
            },
            rx,
        )
    }
}

/// Sending half of a [`MemoryBus`] endpoint
pub struct MemoryLink {
    id: usize,
    bus: MemoryBus,
}

impl Link for MemoryLink {
    fn send(&self, packet: &Packet) -> Result<(), LinkError> {
        // Go through the codec so tests see what the wire would carry
        let bytes = packet.to_bytes()?;
        let decoded = Packet::from_bytes(&bytes).map_err(|_| LinkError::Closed)?;

        let mut inner = self.bus.inner.lock();
        let loss_rate = inner.loss_rate;
        let mut rng = rand::thread_rng();

        inner.endpoints.retain(|(id, tx)| {
            if *id == self.id {
                return true;
            }
            if loss_rate > 0.0 && rng.gen_bool(loss_rate) {
                trace!("Bus dropped {:?} to endpoint {}", decoded.payload.code(), id);
                return true;
            }
            match tx.try_send(decoded.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Endpoint {} inbound queue full, dropping packet", id);
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Payload;

    #[tokio::test]
    async fn test_bus_fans_out_to_others() {
        let bus = MemoryBus::new();
        let (a, mut a_rx) = bus.attach();
        let (_b, mut b_rx) = bus.attach();
        let (_c, mut c_rx) = bus.attach();

        a.send(&Packet::broadcast(Payload::Discovery)).unwrap();

        assert_eq!(b_rx.recv().await.unwrap().payload, Payload::Discovery);
        assert_eq!(c_rx.recv().await.unwrap().payload, Payload::Discovery);
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bus_total_loss() {
        let bus = MemoryBus::with_loss_rate(1.0);
        let (a, _a_rx) = bus.attach();
        let (_b, mut b_rx) = bus.attach();

        for _ in 0..10 {
            a.send(&Packet::broadcast(Payload::Heartbeat)).unwrap();
        }
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bus_prunes_closed_endpoints() {
        let bus = MemoryBus::new();
        let (a, _a_rx) = bus.attach();
        let (_b, b_rx) = bus.attach();
        let (_c, mut c_rx) = bus.attach();
        drop(b_rx);

        a.send(&Packet::broadcast(Payload::Discovery)).unwrap();
        assert_eq!(bus.inner.lock().endpoints.len(), 2);
        assert_eq!(c_rx.recv().await.unwrap().payload, Payload::Discovery);
    }

    #[tokio::test]
    async fn test_udp_drops_malformed_and_keeps_receiving() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let receiver = UdpLink::bind(addr, Vec::new()).await.unwrap();
        let target = receiver.local_addr().unwrap();
        let mut rx = receiver.start_receive();

        let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        raw.send_to(b"garbage", target).await.unwrap();

        let sender = UdpLink::bind(addr, vec![target]).await.unwrap();
        sender.send(&Packet::broadcast(Payload::Discovery)).unwrap();

        let packet = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.payload, Payload::Discovery);
    }

    #[tokio::test]
    async fn test_udp_burst_right_after_bind() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let receiver = UdpLink::bind(addr, Vec::new()).await.unwrap();
        let target = receiver.local_addr().unwrap();
        let mut rx = receiver.start_receive();

        let sender = UdpLink::bind(addr, vec![target]).await.unwrap();
        for seq in 0..32 {
            sender
                .send(&Packet::broadcast(Payload::StatusRequest { seq }))
                .unwrap();
        }

        for seq in 0..32 {
            let packet = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(packet.payload, Payload::StatusRequest { seq });
        }
    }
}
