use crate::node::Node;
use crate::utils;
use crate::wire::{FileHit, Packet};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

/// Starts a flood from this node and blocks until it settles, returning
/// the merged hit list (also installed in the file tracker). This is the
/// UI's entry point; the calling thread is the aggregating worker.
pub fn originate(node: &Arc<Node>, query: &str) -> Vec<FileHit> {
    let search_id = utils::generate_search_id();
    info!("originating search {} for {:?}", search_id, query);
    let merged = run_flood(node, query, &search_id, &[]);
    info!("search {} settled with {} hits", search_id, merged.len());
    merged
}

/// Handles a SEARCH_REQ from a peer. Runs on its own worker since the
/// aggregation wait can park for the whole search timeout.
pub fn handle_search_req(
    node: &Arc<Node>,
    file_name: String,
    path: Vec<Ipv4Addr>,
    search_id: String,
    from: Ipv4Addr,
) {
    debug!(
        "search {} for {:?} arrived from {} (path {:?})",
        search_id, file_name, from, path
    );
    if path.is_empty() {
        warn!("dropping search {} from {} with an empty path", search_id, from);
        return;
    }
    if node.tracker.contains(&search_id) {
        // the flood reached us twice along different edges; answer the
        // second copy as a leaf and leave the in-flight state alone
        debug!("search {} already in flight, replying as leaf", search_id);
        send_reply(node, &file_name, &path, local_hits(node, &file_name), &search_id);
        return;
    }

    let merged = run_flood(node, &file_name, &search_id, &path);
    send_reply(node, &file_name, &path, merged, &search_id);
}

/// Handles a SEARCH_RES from a neighbor we forwarded to. The carried path
/// is only logged: the worker that forwarded this search kept its own
/// reverse path and does the replying.
pub fn handle_search_res(
    node: &Arc<Node>,
    file_name: String,
    path: Vec<Ipv4Addr>,
    hits: Vec<FileHit>,
    search_id: String,
    from: Ipv4Addr,
) {
    debug!(
        "reply for search {} ({:?}) from {} with {} hits (path {:?})",
        search_id,
        file_name,
        from,
        hits.len(),
        path
    );
    node.tracker.note_reply(&search_id, from, hits);
}

/// The forward/aggregate half of the state machine. Forwards to every
/// neighbor not on the reached path, waits until all of them replied (or
/// the timeout passes) and merges their hits with the local ones. With no
/// eligible neighbor the search is ready immediately and the result is
/// just the local hits.
///
/// `reply_path` is the reached path as received (empty at the
/// originator); forwarded packets get this node prepended.
fn run_flood(node: &Arc<Node>, file_name: &str, search_id: &str, reply_path: &[Ipv4Addr]) -> Vec<FileHit> {
    let targets = eligible_targets(node, reply_path);
    // a node whose neighbors are all on the path is a leaf and replies
    // with its local hits right away; the originator registers even with
    // no neighbors so its result still goes through finalize
    if !reply_path.is_empty() && targets.is_empty() {
        return local_hits(node, file_name);
    }

    let ready = node.tracker.register(search_id);

    let mut forwarded_path = Vec::with_capacity(reply_path.len() + 1);
    forwarded_path.push(node.addr);
    forwarded_path.extend_from_slice(reply_path);

    for &neighbor in &targets {
        node.tracker.note_forward(search_id, neighbor);
        let packet = Packet::SearchReq {
            file_name: file_name.to_string(),
            path: forwarded_path.clone(),
            search_id: search_id.to_string(),
        };
        if let Err(e) = node.send_udp(neighbor, &packet) {
            // no retry; the timeout below settles the search without them
            warn!("forwarding search {} to {} failed: {}", search_id, neighbor, e);
        }
    }
    debug!("search {} forwarded to {:?}", search_id, targets);

    wait_until_ready(node, search_id, &ready);
    node.tracker.finalize(search_id, local_hits(node, file_name))
}

/// Neighbors the flood still has to visit: everyone not already on the
/// reached path.
fn eligible_targets(node: &Arc<Node>, path: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    node.neighbors_snapshot()
        .into_iter()
        .filter(|neighbor| !path.contains(neighbor))
        .collect()
}

/// This node's own matches, as depth-0 hits sourced here.
fn local_hits(node: &Arc<Node>, query: &str) -> Vec<FileHit> {
    node.store
        .search(query)
        .into_iter()
        .map(|file| FileHit {
            file_name: file.name,
            size: file.size,
            source: node.addr,
            depth: 0,
        })
        .collect()
}

/// Parks on the readiness signal until every forwarded neighbor replied,
/// bounded by the search timeout. On timeout the search settles with
/// whatever arrived; a crashed peer must not wedge the worker forever.
fn wait_until_ready(node: &Arc<Node>, search_id: &str, ready: &Receiver<()>) {
    let deadline = Instant::now() + node.config.search_timeout;
    while !node.tracker.is_ready(search_id) {
        let now = Instant::now();
        if now >= deadline {
            warn!("search {} timed out waiting for replies", search_id);
            return;
        }
        match ready.recv_timeout(deadline - now) {
            Ok(()) => {}
            Err(RecvTimeoutError::Timeout) => {
                warn!("search {} timed out waiting for replies", search_id);
                return;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Sends the consolidated reply one hop back along the reverse path, with
/// every hit re-sourced to this node so the upstream peer downloads from
/// us and we relay.
fn send_reply(
    node: &Arc<Node>,
    file_name: &str,
    reply_path: &[Ipv4Addr],
    mut hits: Vec<FileHit>,
    search_id: &str,
) {
    let Some((next_hop, rest)) = reply_path.split_first() else {
        warn!("search {} has no reverse path to reply along", search_id);
        return;
    };
    for hit in &mut hits {
        hit.source = node.addr;
    }
    let packet = Packet::SearchRes {
        file_name: file_name.to_string(),
        path: rest.to_vec(),
        hits,
        search_id: search_id.to_string(),
    };
    if let Err(e) = node.send_udp(*next_hop, &packet) {
        warn!("reply for search {} to {} failed: {}", search_id, next_hop, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::fs;
    use std::time::Duration;

    fn lone_node(dir: &std::path::Path) -> Arc<Node> {
        let mut config = Config::new(dir.to_path_buf());
        config.advertise_ip = Some(Ipv4Addr::new(127, 0, 0, 1));
        config.broadcast_window = Duration::ZERO;
        config.search_timeout = Duration::from_millis(200);
        Node::new(config).unwrap()
    }

    #[test]
    fn test_eligible_targets_skip_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(dir.path());
        let a = Ipv4Addr::new(127, 0, 0, 2);
        let b = Ipv4Addr::new(127, 0, 0, 3);
        node.add_neighbor(a);
        node.add_neighbor(b);
        assert_eq!(eligible_targets(&node, &[a]), vec![b]);
        assert!(eligible_targets(&node, &[a, b]).is_empty());
    }

    #[test]
    fn test_local_hits_are_depth_zero_and_self_sourced() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("song.mp3"), b"data").unwrap();
        let node = lone_node(dir.path());
        let hits = local_hits(&node, "song");
        assert_eq!(
            hits,
            vec![FileHit {
                file_name: "song.mp3".to_string(),
                size: 4,
                source: node.addr,
                depth: 0,
            }]
        );
    }

    #[test]
    fn test_originate_without_neighbors_returns_local_hits() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("only.txt"), b"here").unwrap();
        let node = lone_node(dir.path());
        let hits = originate(&node, "only");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].depth, 0);
        assert_eq!(hits[0].source, node.addr);
        // the result is also tracked for the transfer engine
        assert_eq!(node.tracker.best_source("only.txt"), Some(hits[0].clone()));
    }

    #[test]
    fn test_unreachable_neighbor_settles_by_timeout() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.txt"), b"x").unwrap();
        let node = lone_node(dir.path());
        // nobody listens there; the forward is lost and the timeout settles
        node.add_neighbor(Ipv4Addr::new(127, 0, 0, 77));
        let hits = originate(&node, "t");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].depth, 0);
    }
}
