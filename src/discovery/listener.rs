//! Background listener: turns group traffic from unknown senders into joins

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::transport::{classify, DiscoveryTransport, InboundPacket, PacketDisposition};
use crate::membership::Membership;

/// Throttle entries kept before stale ones are pruned
const THROTTLE_PRUNE_THRESHOLD: usize = 256;

/// Remembers when each sender was last joined
pub(crate) struct JoinThrottle {
    cooldown: Duration,
    last_join: HashMap<Ipv4Addr, Instant>,
}

impl JoinThrottle {
    pub(crate) fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_join: HashMap::new(),
        }
    }

    /// Whether `peer` may be joined now; records the attempt when it may
    pub(crate) fn admit(&mut self, peer: Ipv4Addr, now: Instant) -> bool {
        if let Some(last) = self.last_join.get(&peer) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }

        if self.last_join.len() >= THROTTLE_PRUNE_THRESHOLD {
            let cooldown = self.cooldown;
            self.last_join
                .retain(|_, last| now.duration_since(*last) < cooldown);
        }
        self.last_join.insert(peer, now);
        true
    }
}

pub(crate) struct Listener {
    pub(crate) transport: Arc<dyn DiscoveryTransport>,
    pub(crate) membership: Arc<dyn Membership>,
    pub(crate) group: Ipv4Addr,
    pub(crate) local: Ipv4Addr,
    pub(crate) throttle: JoinThrottle,
    /// Upper bound on a single join
    pub(crate) join_timeout: Duration,
}

impl Listener {
    /// Receive until stopped or the transport is closed.
    ///
    /// Joins run concurrently with receiving, so a peer that never answers
    /// delays nobody else. Joins still in flight are abandoned on stop.
    pub(crate) async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let mut joins = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                Some(_) = joins.join_next(), if !joins.is_empty() => {}
                received = self.transport.recv() => match received {
                    Ok(packet) => self.handle(packet, &mut joins),
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                        info!("Discovery socket closed, stopping listener");
                        while joins.join_next().await.is_some() {}
                        return;
                    }
                    Err(e) => warn!(error = %e, "Failed to read discovery packet"),
                },
            }
        }

        info!("Discovery listener stopped");
    }

    fn handle(&mut self, packet: InboundPacket, joins: &mut JoinSet<()>) {
        match classify(&packet, self.group, self.local) {
            PacketDisposition::Join(peer) => {
                if !self.throttle.admit(peer, Instant::now()) {
                    debug!(%peer, "Peer joined recently, skipping");
                    return;
                }

                info!(%peer, "Discovered gossip peer, joining");
                let membership = self.membership.clone();
                let join_timeout = self.join_timeout;
                joins.spawn(async move {
                    match tokio::time::timeout(join_timeout, membership.join(peer)).await {
                        Ok(Ok(())) => debug!(%peer, "Joined discovered peer"),
                        Ok(Err(e)) => warn!(%peer, error = %e, "Failed to join discovered peer"),
                        Err(_) => warn!(
                            %peer,
                            timeout_ms = join_timeout.as_millis() as u64,
                            "Timed out joining discovered peer"
                        ),
                    }
                });
            }
            PacketDisposition::SelfAnnounce => trace!("Ignoring own probe"),
            PacketDisposition::OtherGroup(group) => trace!(%group, "Ignoring packet for other group"),
            PacketDisposition::NotMulticast => {
                trace!(source = %packet.source, "Ignoring non-multicast packet")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MembershipError;
    use std::net::SocketAddrV4;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    const GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 250);
    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const UNREACHABLE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

    struct ChannelTransport {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<InboundPacket>>,
    }

    #[async_trait::async_trait]
    impl DiscoveryTransport for ChannelTransport {
        async fn recv(&self) -> io::Result<InboundPacket> {
            self.inbound
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
        }

        async fn send(&self, _payload: &[u8], _target: SocketAddrV4) -> io::Result<()> {
            Ok(())
        }
    }

    /// Joins of `UNREACHABLE` never complete; every attempt is recorded
    #[derive(Default)]
    struct StallingMembership {
        attempts: Mutex<Vec<Ipv4Addr>>,
        joined: Mutex<Vec<Ipv4Addr>>,
    }

    #[async_trait::async_trait]
    impl Membership for StallingMembership {
        async fn alive_count(&self) -> Result<usize, MembershipError> {
            Ok(1)
        }

        async fn join(&self, address: Ipv4Addr) -> Result<(), MembershipError> {
            self.attempts.lock().unwrap().push(address);
            if address == UNREACHABLE {
                std::future::pending::<()>().await;
            }
            self.joined.lock().unwrap().push(address);
            Ok(())
        }
    }

    fn group_packet(source: Ipv4Addr) -> InboundPacket {
        InboundPacket {
            source: SocketAddrV4::new(source, 1024),
            destination: Some(GROUP),
            len: 0,
        }
    }

    fn listener(
        membership: Arc<StallingMembership>,
        join_timeout: Duration,
    ) -> (Listener, mpsc::UnboundedSender<InboundPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = Listener {
            transport: Arc::new(ChannelTransport {
                inbound: tokio::sync::Mutex::new(rx),
            }),
            membership,
            group: GROUP,
            local: LOCAL,
            throttle: JoinThrottle::new(Duration::from_secs(10)),
            join_timeout,
        };
        (listener, tx)
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_join_does_not_block_next_peer() {
        let membership = Arc::new(StallingMembership::default());
        let (listener, inbound) = listener(membership.clone(), Duration::from_secs(10));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listener.run(stop_rx));

        let reachable = Ipv4Addr::new(10, 0, 0, 7);
        inbound.send(group_packet(UNREACHABLE)).unwrap();
        inbound.send(group_packet(reachable)).unwrap();

        wait_until(|| membership.joined.lock().unwrap().contains(&reachable)).await;
        let attempts = membership.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 2);
        assert!(attempts.contains(&UNREACHABLE));

        // Stopping abandons the hung join instead of waiting for it
        stop_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener must stop with a join in flight")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_join_times_out() {
        let membership = Arc::new(StallingMembership::default());
        let (listener, inbound) = listener(membership.clone(), Duration::from_secs(3));
        let (_stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listener.run(stop_rx));

        inbound.send(group_packet(UNREACHABLE)).unwrap();
        drop(inbound);

        // A closed transport waits for in-flight joins, which the timeout bounds
        let started = Instant::now();
        task.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(*membership.attempts.lock().unwrap(), vec![UNREACHABLE]);
        assert!(membership.joined.lock().unwrap().is_empty());
    }

    #[test]
    fn test_throttle_cooldown() {
        let mut throttle = JoinThrottle::new(Duration::from_secs(10));
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let other = Ipv4Addr::new(10, 0, 0, 3);
        let start = Instant::now();

        assert!(throttle.admit(peer, start));
        assert!(!throttle.admit(peer, start + Duration::from_secs(5)));
        assert!(throttle.admit(other, start + Duration::from_secs(5)));
        assert!(throttle.admit(peer, start + Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_cooldown_always_admits() {
        let mut throttle = JoinThrottle::new(Duration::ZERO);
        let peer = Ipv4Addr::new(10, 0, 0, 2);
        let now = Instant::now();

        assert!(throttle.admit(peer, now));
        assert!(throttle.admit(peer, now));
    }

    #[test]
    fn test_throttle_prunes_stale_entries() {
        let mut throttle = JoinThrottle::new(Duration::from_secs(1));
        let start = Instant::now();

        for i in 0..THROTTLE_PRUNE_THRESHOLD as u32 {
            assert!(throttle.admit(Ipv4Addr::from(0x0a00_0000 + i), start));
        }
        assert!(throttle.admit(Ipv4Addr::new(10, 1, 0, 0), start + Duration::from_secs(2)));
        assert_eq!(throttle.last_join.len(), 1);
    }
}
