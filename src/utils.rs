use anyhow::{bail, Context};
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

/// Learns the node's own IPv4 address by connecting a UDP socket to a
/// public address and reading the local endpoint. Nothing is sent.
pub fn local_ipv4() -> anyhow::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to open a probe socket")?;
    socket
        .connect("8.8.8.8:80")
        .context("no route to learn the local address from")?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) => Ok(*addr.ip()),
        SocketAddr::V6(addr) => bail!("expected an ipv4 local address, got {}", addr),
    }
}

/// Mints a fresh 128-bit search identifier as 32 hex digits.
pub fn generate_search_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:032x}", rng.gen::<u128>())
}
