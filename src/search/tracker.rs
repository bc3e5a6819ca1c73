use crate::wire::FileHit;
use crossbeam::channel::{unbounded, Receiver, Sender};
use log::warn;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

struct ForwardEntry {
    neighbors: Vec<Ipv4Addr>,
    /// Signalled on every accepted reply so the aggregating worker can wake
    /// up instead of polling.
    signal: Sender<()>,
}

#[derive(Default)]
struct ReplyEntry {
    from: Vec<Ipv4Addr>,
    accumulated: Vec<FileHit>,
}

/// Book-keeping for in-flight searches plus the long-lived file tracker.
///
/// The forward side and the reply side live behind independent locks, taken
/// in that fixed order when an operation needs both. A search is ready once
/// every neighbor it was forwarded to has replied; a registered search that
/// was forwarded to nobody is ready immediately.
pub struct SearchTracker {
    forwards: Mutex<HashMap<String, ForwardEntry>>,
    replies: Mutex<HashMap<String, ReplyEntry>>,
    files: Mutex<HashMap<String, FileHit>>,
}

impl SearchTracker {
    pub fn new() -> SearchTracker {
        SearchTracker {
            forwards: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the per-search state and hands back the readiness signal the
    /// aggregating worker waits on.
    pub fn register(&self, search_id: &str) -> Receiver<()> {
        let (signal, ready) = unbounded();
        self.forwards.lock().unwrap().insert(
            search_id.to_string(),
            ForwardEntry {
                neighbors: Vec::new(),
                signal,
            },
        );
        ready
    }

    /// True while the search has per-search state at this node.
    pub fn contains(&self, search_id: &str) -> bool {
        self.forwards.lock().unwrap().contains_key(search_id)
    }

    pub fn note_forward(&self, search_id: &str, neighbor: Ipv4Addr) {
        let mut forwards = self.forwards.lock().unwrap();
        match forwards.get_mut(search_id) {
            Some(entry) => entry.neighbors.push(neighbor),
            None => warn!("noting a forward for unregistered search {}", search_id),
        }
    }

    /// Records a downstream reply. Replies for unknown searches, from
    /// neighbors that were never forwarded to, or from neighbors that
    /// already replied are dropped, which keeps the replied set inside
    /// the forwarded set.
    pub fn note_reply(&self, search_id: &str, from: Ipv4Addr, hits: Vec<FileHit>) -> bool {
        let forwards = self.forwards.lock().unwrap();
        let entry = match forwards.get(search_id) {
            Some(entry) => entry,
            None => {
                warn!("dropping reply for unknown search {} from {}", search_id, from);
                return false;
            }
        };
        if !entry.neighbors.contains(&from) {
            warn!(
                "dropping reply for search {} from {} which was never forwarded to",
                search_id, from
            );
            return false;
        }

        let mut replies = self.replies.lock().unwrap();
        let reply = replies.entry(search_id.to_string()).or_default();
        if reply.from.contains(&from) {
            warn!("dropping duplicate reply for search {} from {}", search_id, from);
            return false;
        }
        reply.from.push(from);
        reply.accumulated.extend(hits);

        let signal = entry.signal.clone();
        drop(replies);
        drop(forwards);
        let _ = signal.send(());
        true
    }

    pub fn is_ready(&self, search_id: &str) -> bool {
        let forwards = self.forwards.lock().unwrap();
        let forwarded = match forwards.get(search_id) {
            Some(entry) => entry.neighbors.len(),
            None => return false,
        };
        let replies = self.replies.lock().unwrap();
        let replied = replies.get(search_id).map_or(0, |entry| entry.from.len());
        replied == forwarded
    }

    /// Tears down the per-search state, merges the accumulated downstream
    /// hits with this node's own hits and installs the result in the file
    /// tracker. Returns the merged list, ready to be replied or displayed.
    pub fn finalize(&self, search_id: &str, local_hits: Vec<FileHit>) -> Vec<FileHit> {
        self.forwards.lock().unwrap().remove(search_id);
        let accumulated = self
            .replies
            .lock()
            .unwrap()
            .remove(search_id)
            .map(|entry| entry.accumulated)
            .unwrap_or_default();

        let merged = merge(accumulated, local_hits);
        let mut files = self.files.lock().unwrap();
        for hit in &merged {
            files.insert(hit.file_name.clone(), hit.clone());
        }
        merged
    }

    /// Best known source for a file name, as recorded by the last search
    /// that saw it. The transfer engine uses this to decide between serving
    /// its own bytes and relaying.
    pub fn best_source(&self, file_name: &str) -> Option<FileHit> {
        self.files.lock().unwrap().get(file_name).cloned()
    }
}

impl Default for SearchTracker {
    fn default() -> SearchTracker {
        SearchTracker::new()
    }
}

/// The per-hop merge rule: downstream hits are one hop further away than
/// they were at the replier, the minimum depth wins per file name with the
/// first-seen hit taking ties, and the node's own hits overwrite anything
/// downstream because depth 0 always wins.
fn merge(accumulated: Vec<FileHit>, local_hits: Vec<FileHit>) -> Vec<FileHit> {
    let mut merged: Vec<FileHit> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for mut hit in accumulated {
        hit.depth += 1;
        match by_name.get(&hit.file_name) {
            Some(&i) => {
                if hit.depth < merged[i].depth {
                    merged[i] = hit;
                }
            }
            None => {
                by_name.insert(hit.file_name.clone(), merged.len());
                merged.push(hit);
            }
        }
    }
    for hit in local_hits {
        match by_name.get(&hit.file_name) {
            Some(&i) => merged[i] = hit,
            None => {
                by_name.insert(hit.file_name.clone(), merged.len());
                merged.push(hit);
            }
        }
    }
    merged
}
