use crate::config::Config;
use crate::search::engine;
use crate::search::tracker::SearchTracker;
use crate::store::FileStore;
use crate::transfer::session;
use crate::utils;
use crate::wire::Packet;
use anyhow::Context;
use log::{debug, error, info, warn};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};
use std::thread;

const LISTENER: Token = Token(0);

/// State shared by every listener, handler worker and transfer session.
pub struct Node {
    pub config: Config,
    /// This node's own address; the identity peers see.
    pub addr: Ipv4Addr,
    pub store: FileStore,
    pub tracker: SearchTracker,
    neighbors: Mutex<HashSet<Ipv4Addr>>,
    /// Process-scoped socket used for all outbound UDP, broadcast included.
    send_socket: std::net::UdpSocket,
}

impl Node {
    pub fn new(config: Config) -> anyhow::Result<Arc<Node>> {
        let addr = match config.advertise_ip {
            Some(ip) => ip,
            None => utils::local_ipv4()?,
        };
        let send_socket = std::net::UdpSocket::bind(SocketAddr::from((addr, 0)))
            .context("failed to bind the udp send socket")?;
        send_socket
            .set_broadcast(true)
            .context("failed to enable broadcast on the send socket")?;
        let store = FileStore::new(config.shared_dir.clone());

        Ok(Arc::new(Node {
            config,
            addr,
            store,
            tracker: SearchTracker::new(),
            neighbors: Mutex::new(HashSet::new()),
            send_socket,
        }))
    }

    pub fn send_udp(&self, to: Ipv4Addr, packet: &Packet) -> std::io::Result<()> {
        self.send_socket
            .send_to(&packet.encode(), SocketAddr::from((to, self.config.udp_port)))
            .map(|_| ())
    }

    pub fn send_broadcast(&self, packet: &Packet) -> std::io::Result<()> {
        self.send_socket
            .send_to(
                &packet.encode(),
                SocketAddr::from((Ipv4Addr::BROADCAST, self.config.broadcast_port)),
            )
            .map(|_| ())
    }

    /// Adds a peer to the neighbor set. Self-entries are refused; the set
    /// only ever grows.
    pub fn add_neighbor(&self, peer: Ipv4Addr) -> bool {
        if peer == self.addr {
            return false;
        }
        let added = self.neighbors.lock().unwrap().insert(peer);
        if added {
            info!("{} is now a neighbor", peer);
        }
        added
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbors.lock().unwrap().len()
    }

    /// Consistent snapshot of the neighbor set, sorted for deterministic
    /// forwarding order.
    pub fn neighbors_snapshot(&self) -> Vec<Ipv4Addr> {
        let mut snapshot: Vec<Ipv4Addr> = self.neighbors.lock().unwrap().iter().copied().collect();
        snapshot.sort();
        snapshot
    }
}

/// Binds all three listeners, runs the bootstrap broadcast round and
/// leaves the listeners running on their own threads. A port already in
/// use surfaces here as an error, which takes the process down with a
/// nonzero exit.
pub fn run(node: &Arc<Node>) -> anyhow::Result<()> {
    let (broadcast_poll, broadcast_socket) =
        bind_udp(Ipv4Addr::UNSPECIFIED, node.config.broadcast_port)
            .context("failed to bind the broadcast listener")?;
    let (mut unicast_poll, unicast_socket) = bind_udp(node.addr, node.config.udp_port)
        .context("failed to bind the unicast listener")?;
    let tcp_listener = TcpListener::bind(SocketAddr::from((node.addr, node.config.tcp_port)))
        .context("failed to bind the tcp listener")?;

    info!(
        "node {} listening (broadcast :{}, udp :{}, tcp :{})",
        node.addr, node.config.broadcast_port, node.config.udp_port, node.config.tcp_port
    );

    {
        let node = Arc::clone(node);
        thread::spawn(move || udp_listener_loop(node, broadcast_poll, broadcast_socket));
    }

    // the discovery round owns the unicast socket until the window closes,
    // then the socket moves to its listener thread
    crate::overlay::bootstrap(node, &mut unicast_poll, &unicast_socket)?;
    {
        let node = Arc::clone(node);
        thread::spawn(move || udp_listener_loop(node, unicast_poll, unicast_socket));
    }
    {
        let node = Arc::clone(node);
        thread::spawn(move || tcp_listener_loop(node, tcp_listener));
    }
    Ok(())
}

pub fn handle_datagram(node: &Arc<Node>, data: &[u8], from: SocketAddr) {
    let from = match from {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => return,
    };
    // our own broadcasts loop back; drop anything self-sourced
    if from == node.addr {
        return;
    }
    match Packet::decode(data) {
        Ok(packet) => dispatch(node, packet, from),
        Err(e) => debug!("ignoring malformed datagram from {}: {}", from, e),
    }
}

/// Routes a decoded datagram. Overlay traffic is handled inline (none of
/// it blocks); search traffic gets a worker thread because the aggregation
/// wait can park for the full search timeout.
pub fn dispatch(node: &Arc<Node>, packet: Packet, from: Ipv4Addr) {
    match packet {
        Packet::JoinReq => {
            let ack = Packet::JoinAck {
                neighbors: node.neighbor_count(),
            };
            if let Err(e) = node.send_udp(from, &ack) {
                warn!("failed to ack join request from {}: {}", from, e);
            }
        }
        Packet::JoinAck { .. } => {
            debug!("ignoring JOIN_ACK from {} outside the discovery window", from);
        }
        Packet::NeighborReq => {
            node.add_neighbor(from);
        }
        Packet::SearchReq {
            file_name,
            path,
            search_id,
        } => {
            let node = Arc::clone(node);
            thread::spawn(move || {
                engine::handle_search_req(&node, file_name, path, search_id, from)
            });
        }
        Packet::SearchRes {
            file_name,
            path,
            hits,
            search_id,
        } => {
            let node = Arc::clone(node);
            thread::spawn(move || {
                engine::handle_search_res(&node, file_name, path, hits, search_id, from)
            });
        }
        Packet::DownloadReq { .. } | Packet::DownloadData(_) => {
            debug!("ignoring tcp-only command on udp from {}", from);
        }
    }
}

fn bind_udp(ip: Ipv4Addr, port: u16) -> anyhow::Result<(Poll, mio::net::UdpSocket)> {
    let mut socket = mio::net::UdpSocket::bind(SocketAddr::from((ip, port)))
        .with_context(|| format!("udp bind {}:{}", ip, port))?;
    let poll = Poll::new()?;
    poll.registry()
        .register(&mut socket, LISTENER, Interest::READABLE)?;
    Ok((poll, socket))
}

/// Drains one UDP socket forever, dispatching each datagram. mio wakeups
/// are edge-triggered so the socket is read until it would block.
fn udp_listener_loop(node: Arc<Node>, mut poll: Poll, socket: mio::net::UdpSocket) {
    let mut events = Events::with_capacity(128);
    let mut buf = [0u8; 65535];
    loop {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == ErrorKind::Interrupted {
                continue;
            }
            error!("udp listener poll failed: {}", e);
            return;
        }
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) => handle_datagram(&node, &buf[..len], from),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("udp recv failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Accepts download sessions forever, one thread per session.
fn tcp_listener_loop(node: Arc<Node>, listener: TcpListener) {
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let node = Arc::clone(&node);
                thread::spawn(move || session::serve(&node, stream));
            }
            Err(e) => warn!("tcp accept failed: {}", e),
        }
    }
}
