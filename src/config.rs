use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime knobs for a node. Every peer on the segment is expected to run
/// with the same ports and chunk size; the defaults are the protocol
/// defaults and the CLI only sets the shared directory.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of files offered to other peers; downloads land here too.
    pub shared_dir: PathBuf,
    /// UDP port the broadcast listener binds on the wildcard address.
    pub broadcast_port: u16,
    /// UDP port for unicast control traffic, bound to the node's own address.
    pub udp_port: u16,
    /// TCP port for download sessions.
    pub tcp_port: u16,
    /// Address this node advertises. `None` means autodetect (the address
    /// the default route would use); tests pin loopback addresses here.
    pub advertise_ip: Option<Ipv4Addr>,
    /// How long the bootstrap broadcast round runs. Zero skips discovery.
    pub broadcast_window: Duration,
    /// Interval between JOIN_REQ beacons inside the window.
    pub beacon_interval: Duration,
    /// How long a search waits for forwarded neighbors before it settles
    /// for whatever replies arrived.
    pub search_timeout: Duration,
    /// Payload bytes per DOWNLOAD_DATA chunk. Must stay small enough that
    /// an encoded packet fits the 4-digit next-size trailer.
    pub chunk_size: usize,
}

impl Config {
    pub fn new(shared_dir: PathBuf) -> Config {
        Config {
            shared_dir,
            broadcast_port: 25550,
            udp_port: 25555,
            tcp_port: 25560,
            advertise_ip: None,
            broadcast_window: Duration::from_secs(2),
            beacon_interval: Duration::from_millis(500),
            search_timeout: Duration::from_secs(10),
            chunk_size: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let config = Config::new(PathBuf::from("/tmp/share"));
        assert_eq!(config.broadcast_port, 25550);
        assert_eq!(config.udp_port, 25555);
        assert_eq!(config.tcp_port, 25560);
        assert_eq!(config.broadcast_window, Duration::from_secs(2));
        assert_eq!(config.beacon_interval, Duration::from_millis(500));
        assert_eq!(config.chunk_size, 10);
    }
}
