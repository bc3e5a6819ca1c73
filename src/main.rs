use clap::Parser;
use shoal::config::Config;
use shoal::node::{self, Node};
use shoal::ui;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(about = "LAN peer-to-peer file sharing node")]
struct Cli {
    /// Directory of files shared with other peers; downloads land here too
    dir: PathBuf,
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();

    let node = Node::new(Config::new(args.dir))?;
    node::run(&node)?;
    println!(
        "node {} up, neighbors: {:?}",
        node.addr,
        node.neighbors_snapshot()
    );

    ui::run(&node)
}
