use crate::node::Node;
use crate::search::engine;
use crate::transfer::session;
use crate::wire::FileHit;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

enum UiState {
    /// Prompting for a file name to search for.
    Search,
    /// A flood is running; the prompt thread is the aggregating worker.
    Wait { query: String },
    /// Showing numbered results; 1-based pick downloads, 0 goes back.
    Select { hits: Vec<FileHit> },
}

/// The interactive prompt loop. Returns cleanly on end of input.
pub fn run(node: &Arc<Node>) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut state = UiState::Search;

    loop {
        state = match state {
            UiState::Search => {
                print!("file name to search for (ctrl-d quits)> ");
                io::stdout().flush()?;
                match lines.next() {
                    Some(line) => {
                        let query = line?.trim().to_string();
                        if query.is_empty() {
                            UiState::Search
                        } else {
                            UiState::Wait { query }
                        }
                    }
                    None => return Ok(()),
                }
            }
            UiState::Wait { query } => {
                println!("searching the overlay for {:?} ...", query);
                let hits = engine::originate(node, &query);
                if hits.is_empty() {
                    println!("no results");
                    UiState::Search
                } else {
                    UiState::Select { hits }
                }
            }
            UiState::Select { hits } => {
                for (i, hit) in hits.iter().enumerate() {
                    println!(
                        "{:>3}. {}  ({} bytes, via {}, {} hops)",
                        i + 1,
                        hit.file_name,
                        hit.size,
                        hit.source,
                        hit.depth
                    );
                }
                print!("pick a number (0 searches again)> ");
                io::stdout().flush()?;
                match lines.next() {
                    Some(line) => match line?.trim().parse::<usize>() {
                        Ok(0) => UiState::Search,
                        Ok(choice) if choice <= hits.len() => {
                            match session::download(node, &hits[choice - 1]) {
                                Ok(bytes) => println!(
                                    "saved {} ({} bytes)",
                                    hits[choice - 1].file_name,
                                    bytes
                                ),
                                Err(e) => println!("download failed: {:#}", e),
                            }
                            UiState::Select { hits }
                        }
                        _ => {
                            println!("pick 0..={}", hits.len());
                            UiState::Select { hits }
                        }
                    },
                    None => return Ok(()),
                }
            }
        };
    }
}
