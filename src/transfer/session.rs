use crate::node::Node;
use crate::transfer::frame;
use crate::wire::{FileHit, Packet};
use anyhow::{bail, Context};
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

/// A DOWNLOAD_REQ is tiny; anything past this is not a request.
const MAX_REQUEST_LEN: usize = 1024;

/// Downloads a file from the hit's source (always a direct neighbor or
/// this node itself) and writes the bytes into the local store. Returns
/// the number of bytes received.
pub fn download(node: &Arc<Node>, hit: &FileHit) -> anyhow::Result<usize> {
    let target = SocketAddr::from((hit.source, node.config.tcp_port));
    info!("downloading {:?} from {}", hit.file_name, target);
    let mut stream = TcpStream::connect(target)
        .with_context(|| format!("failed to connect to {}", target))?;
    send_request(&mut stream, &hit.file_name).context("failed to send the download request")?;

    let bytes = frame::read_stream(&mut stream, &hit.file_name)
        .with_context(|| format!("download stream from {} broke", target))?;
    node.store
        .write(&hit.file_name, &bytes)
        .with_context(|| format!("failed to store {:?}", hit.file_name))?;
    info!("stored {:?} ({} bytes)", hit.file_name, bytes.len());
    Ok(bytes.len())
}

/// Entry point for an accepted TCP session. Errors stay inside the
/// session; the socket closes when the stream drops on any exit path.
pub fn serve(node: &Arc<Node>, mut stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "<unknown>".to_string());
    if let Err(e) = handle_session(node, &mut stream) {
        warn!("download session with {} failed: {:#}", peer, e);
    }
}

fn handle_session(node: &Arc<Node>, stream: &mut TcpStream) -> anyhow::Result<()> {
    let file_name = read_request(stream)?;
    debug!("serving a download of {:?}", file_name);

    match node.tracker.best_source(&file_name) {
        Some(hit) if hit.source != node.addr => relay(node, stream, &file_name, &hit),
        // tracked as our own, or never searched for: serve the store bytes
        _ => serve_own(node, stream, &file_name),
    }
}

/// Writes a DOWNLOAD_REQ and half-closes the stream. The request has no
/// length prefix; shutting down the write side gives the server a clean
/// end-of-request while leaving the response direction open.
fn send_request(stream: &mut TcpStream, file_name: &str) -> std::io::Result<()> {
    stream.write_all(
        &Packet::DownloadReq {
            file_name: file_name.to_string(),
        }
        .encode(),
    )?;
    stream.shutdown(std::net::Shutdown::Write)
}

/// Reads the request up to the client's write-side shutdown and decodes it.
fn read_request(stream: &mut TcpStream) -> anyhow::Result<String> {
    let mut request = Vec::new();
    let mut buf = [0u8; 256];
    loop {
        if request.len() > MAX_REQUEST_LEN {
            bail!("oversized download request");
        }
        let n = stream.read(&mut buf).context("request read failed")?;
        if n == 0 {
            break;
        }
        request.extend_from_slice(&buf[..n]);
    }
    match Packet::decode(&request) {
        Ok(Packet::DownloadReq { file_name }) => Ok(file_name),
        Ok(other) => bail!("expected a download request, got {:?}", other),
        Err(e) => Err(e).context("malformed download request"),
    }
}

/// Owner path: chunk the stored bytes and stream them out.
fn serve_own(node: &Arc<Node>, stream: &mut TcpStream, file_name: &str) -> anyhow::Result<()> {
    let bytes = node
        .store
        .read(file_name)
        .with_context(|| format!("cannot read {:?} from the store", file_name))?;
    let packets = frame::build_stream(file_name, &bytes, node.config.chunk_size, node.addr);
    frame::write_stream(stream, &packets)
        .with_context(|| format!("streaming {:?} failed", file_name))?;
    info!("served {:?} ({} bytes) as owner", file_name, bytes.len());
    Ok(())
}

/// Relay path: we answered the search but a neighbor holds the bytes, so
/// open a nested download against it and restream with rewritten transit
/// metadata.
fn relay(
    node: &Arc<Node>,
    downstream: &mut TcpStream,
    file_name: &str,
    hit: &FileHit,
) -> anyhow::Result<()> {
    let target = SocketAddr::from((hit.source, node.config.tcp_port));
    info!("relaying {:?} from {}", file_name, target);
    let mut upstream = TcpStream::connect(target)
        .with_context(|| format!("failed to reach the upstream source {}", target))?;
    send_request(&mut upstream, file_name).context("failed to send the nested download request")?;

    frame::relay_stream(&mut upstream, downstream, file_name, node.addr)
        .with_context(|| format!("relaying {:?} from {} broke", file_name, target))?;
    info!("relayed {:?} from {}", file_name, target);
    Ok(())
}
