//! Coordinator event loop
//!
//! Multiplexes inbound packets, operator commands and the heartbeat timer.
//! The loop is the only writer of the registration table; routed commands
//! run in their own tasks and get their completions through the router.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command::{self, Command};
use crate::config::CoordinatorConfig;
use crate::discovery::Registrar;
use crate::error::{Error, Result};
use crate::link::{Link, LinkError};
use crate::protocol::{Packet, Payload};
use crate::router::{Reply, Router};
use crate::types::{FeederId, NodeHandle};

/// Queued operator commands
const COMMAND_QUEUE: usize = 64;

struct CommandRequest {
    line: String,
    reply: oneshot::Sender<Reply>,
}

/// Submits text commands to a running coordinator
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CommandRequest>,
}

impl CoordinatorHandle {
    pub async fn execute(&self, line: impl Into<String>) -> Reply {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = CommandRequest {
            line: line.into(),
            reply: reply_tx,
        };
        if self.tx.send(request).await.is_err() {
            return Reply::error(Error::link("coordinator stopped"));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Reply::error(Error::link("coordinator stopped")))
    }
}

pub struct Coordinator {
    config: CoordinatorConfig,
    registrar: Registrar,
    router: Router,
    link: Arc<dyn Link>,
    inbound: mpsc::Receiver<Packet>,
    commands: mpsc::Receiver<CommandRequest>,
}

impl Coordinator {
    pub fn new(
        config: CoordinatorConfig,
        link: Arc<dyn Link>,
        inbound: mpsc::Receiver<Packet>,
    ) -> (Self, CoordinatorHandle) {
        let registrar = Registrar::new(config.liveness_timeout(), config.max_unassigned);
        let router = Router::new(
            registrar.table(),
            link.clone(),
            config.dispatch,
            config.start_enabled,
        );
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);

        let coordinator = Self {
            config,
            registrar,
            router,
            link,
            inbound,
            commands,
        };
        (coordinator, CoordinatorHandle { tx })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run until the link closes or every handle is dropped
    pub async fn run(mut self) {
        info!(
            "Coordinator starting, liveness {:?}, system {}",
            self.config.liveness_timeout(),
            if self.router.is_enabled() { "enabled" } else { "disabled" }
        );
        if let Err(e) = self.broadcast(Payload::Discovery) {
            warn!("Initial discovery failed: {}", e);
        }

        let period = self.config.heartbeat_interval();
        let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                packet = self.inbound.recv() => match packet {
                    Some(packet) => self.handle_packet(packet).await,
                    None => {
                        info!("Link closed, coordinator stopping");
                        break;
                    }
                },
                request = self.commands.recv() => match request {
                    Some(request) => self.handle_command(request).await,
                    None => {
                        info!("No command sources left, coordinator stopping");
                        break;
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = self.broadcast(Payload::Heartbeat) {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        let now = Instant::now();
        match packet.payload {
            Payload::Register => {
                if let Err(e) = self
                    .registrar
                    .handle_register(packet.feeder, packet.node, now)
                    .await
                {
                    debug!("Registration ignored: {}", e);
                }
            }
            Payload::Response {
                seq,
                result,
                snapshot,
            } => {
                self.registrar.touch(packet.node, now).await;
                match FeederId::new(packet.feeder) {
                    Ok(feeder) => self.router.complete(feeder, seq, result, snapshot),
                    Err(_) => debug!("Response from unassigned node {}", packet.node),
                }
            }
            // Our own broadcasts echoed back by the link
            _ => {}
        }
    }

    async fn handle_command(&mut self, request: CommandRequest) {
        let CommandRequest { line, reply } = request;
        debug!("Command: {}", line.trim());

        let command = match command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                let _ = reply.send(Reply::error(e));
                return;
            }
        };

        let result = match command {
            Command::Discovery => self
                .broadcast(Payload::Discovery)
                .map(|()| vec!["Discovery broadcast sent".to_string()])
                .map_err(Error::from),
            Command::ClearRegistration => {
                let count = self.registrar.clear().await;
                Ok(vec![format!("Cleared {} registrations", count)])
            }
            Command::Unassigned => Ok(self.unassigned()),
            Command::Assign { node, feeder } => self.assign(node, feeder),
            routed => {
                let router = self.router.clone();
                tokio::spawn(async move {
                    let _ = reply.send(router.execute(routed).await);
                });
                return;
            }
        };

        let _ = reply.send(Reply::from(result));
    }

    fn unassigned(&self) -> Vec<String> {
        let now = Instant::now();
        let nodes = self
            .registrar
            .unassigned(now, self.config.unassigned_window());
        let mut lines = vec![format!("Unassigned nodes: {}", nodes.len())];
        for node in nodes {
            lines.push(format!(
                "{} seen {} ms ago",
                node.node,
                now.saturating_duration_since(node.last_seen).as_millis()
            ));
        }
        lines
    }

    fn assign(&self, node: NodeHandle, feeder: i64) -> Result<Vec<String>> {
        let feeder = FeederId::parse(feeder)?;
        if node.is_broadcast() {
            return Err(Error::invalid("cannot assign an identity to the broadcast handle"));
        }

        let packet = Packet::new(
            feeder.get(),
            node,
            Payload::SetFeederId {
                feeder: feeder.get(),
            },
        );
        self.link.send(&packet)?;
        info!("Asked {} to serve {}", node, feeder);
        Ok(vec![format!("Assigned {} to {}", feeder, node)])
    }

    fn broadcast(&self, payload: Payload) -> std::result::Result<(), LinkError> {
        debug!("Broadcasting {:?}", payload.code());
        self.link.send(&Packet::broadcast(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryBus;
    use std::time::Duration;

    async fn expect(rx: &mut mpsc::Receiver<Packet>, want: fn(&Payload) -> bool) -> Packet {
        loop {
            let packet = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if want(&packet.payload) {
                return packet;
            }
        }
    }

    fn start() -> (CoordinatorHandle, crate::link::MemoryLink, mpsc::Receiver<Packet>) {
        let bus = MemoryBus::new();
        let (link, inbound) = bus.attach();
        let (peer, peer_rx) = bus.attach();
        let (coordinator, handle) =
            Coordinator::new(CoordinatorConfig::default(), Arc::new(link), inbound);
        tokio::spawn(coordinator.run());
        (handle, peer, peer_rx)
    }

    #[tokio::test]
    async fn test_discovery_at_boot_and_on_demand() {
        let (handle, _peer, mut peer_rx) = start();
        expect(&mut peer_rx, |p| *p == Payload::Discovery).await;

        let reply = handle.execute("discovery").await;
        assert!(reply.is_ok());
        expect(&mut peer_rx, |p| *p == Payload::Discovery).await;
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (handle, _peer, _peer_rx) = start();
        let reply = handle.execute("G28").await;
        assert_eq!(reply.to_string(), "error: unknown command: G28");
    }

    #[tokio::test]
    async fn test_registration_and_clear() {
        let (handle, peer, _peer_rx) = start();
        let node = NodeHandle::new([2, 0, 0, 0, 0, 6]);
        peer.send(&Packet::new(6, node, Payload::Register)).unwrap();
        peer.send(&Packet::new(77, node, Payload::Register)).unwrap();

        // Packets are handled before later commands in arrival order
        tokio::time::sleep(Duration::from_millis(20)).await;
        let reply = handle.execute("status").await;
        assert!(reply.contains("Registered feeders: 1"), "{}", reply);
        assert!(reply.contains("N6 -> 02:00:00:00:00:06"));

        let reply = handle.execute("clear_registration").await;
        assert!(reply.contains("Cleared 1 registrations"));
        let reply = handle.execute("M602 N6").await;
        assert!(matches!(
            reply.error_kind(),
            Some(Error::NotRegistered { feeder: 6, .. })
        ));
    }

    #[tokio::test]
    async fn test_unassigned_and_assign() {
        let (handle, peer, mut peer_rx) = start();
        let node = NodeHandle::new([2, 0, 0, 0, 0, 0x42]);
        peer.send(&Packet::new(255, node, Payload::Register)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let reply = handle.execute("unassigned").await;
        assert!(reply.contains("Unassigned nodes: 1"));
        assert!(reply.contains("02:00:00:00:00:42"));

        let reply = handle.execute("assign 02:00:00:00:00:42 9").await;
        assert!(reply.is_ok(), "{}", reply);
        let packet = expect(&mut peer_rx, |p| matches!(p, Payload::SetFeederId { .. })).await;
        assert_eq!(packet.node, node);
        assert_eq!(packet.payload, Payload::SetFeederId { feeder: 9 });

        let reply = handle.execute("assign 02:00:00:00:00:42 50").await;
        assert!(matches!(reply.error_kind(), Some(Error::InvalidParameter { .. })));
    }
}
