use crate::node::Node;
use crate::wire::Packet;
use log::{debug, info, warn};
use mio::{Events, Poll};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

/// Runs the time-bounded discovery round: beacon JOIN_REQ on the broadcast
/// address every interval while collecting JOIN_ACKs from the unicast
/// socket, then adopt neighbors from the candidate table. The candidate
/// table lives and dies inside this call; acks arriving later are ignored
/// by the regular dispatch.
///
/// Non-ack traffic received during the window (a neighbor request from a
/// peer that is bootstrapping at the same time, say) is dispatched as
/// usual.
pub fn bootstrap(
    node: &Arc<Node>,
    poll: &mut Poll,
    socket: &mio::net::UdpSocket,
) -> anyhow::Result<()> {
    if node.config.broadcast_window.is_zero() {
        return Ok(());
    }

    let mut candidates: HashMap<Ipv4Addr, usize> = HashMap::new();
    let deadline = Instant::now() + node.config.broadcast_window;
    let mut next_beacon = Instant::now();
    let mut events = Events::with_capacity(128);
    let mut buf = [0u8; 65535];

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if now >= next_beacon {
            // a segment with no broadcast route is survivable: the node
            // just comes up with an empty neighbor set
            if let Err(e) = node.send_broadcast(&Packet::JoinReq) {
                warn!("join beacon failed: {}", e);
            }
            next_beacon = now + node.config.beacon_interval;
        }

        let timeout = deadline
            .min(next_beacon)
            .saturating_duration_since(Instant::now());
        if let Err(e) = poll.poll(&mut events, Some(timeout)) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            return Err(e.into());
        }
        loop {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("udp recv failed during discovery: {}", e);
                    break;
                }
            };
            let from = match from {
                SocketAddr::V4(addr) => *addr.ip(),
                SocketAddr::V6(_) => continue,
            };
            if from == node.addr {
                continue;
            }
            match Packet::decode(&buf[..len]) {
                Ok(Packet::JoinAck { neighbors }) => {
                    candidates.insert(from, neighbors);
                }
                Ok(packet) => crate::node::dispatch(node, packet, from),
                Err(e) => debug!("ignoring malformed datagram from {}: {}", from, e),
            }
        }
    }

    let chosen = choose_neighbors(&candidates);
    info!(
        "discovery window closed: {} candidates, adopting {:?}",
        candidates.len(),
        chosen
    );
    for peer in chosen {
        node.add_neighbor(peer);
        if let Err(e) = node.send_udp(peer, &Packet::NeighborReq) {
            warn!("neighbor request to {} failed: {}", peer, e);
        }
    }
    Ok(())
}

/// The load-aware selection rule: rank candidates ascending by
/// (advertised neighbor count, address) and take the first
/// `k = max(1, largest advertised count)`. Adapting k to the local
/// density while preferring underloaded peers keeps the overlay from
/// piling onto already busy nodes.
pub fn choose_neighbors(candidates: &HashMap<Ipv4Addr, usize>) -> Vec<Ipv4Addr> {
    if candidates.is_empty() {
        return Vec::new();
    }
    let mut ranked: Vec<(usize, Ipv4Addr)> = candidates
        .iter()
        .map(|(addr, count)| (*count, *addr))
        .collect();
    ranked.sort();
    let k = ranked.last().map_or(0, |(count, _)| *count).max(1);
    ranked.into_iter().take(k).map(|(_, addr)| addr).collect()
}
