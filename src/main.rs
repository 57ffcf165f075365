use std::{net::SocketAddr, thread};

use clap::{Parser, Subcommand};
use config::Config;
use crossbeam_channel::bounded;
use log::{error, info};
use tokio::task;
use txpool::TransactionPool;

mod config;
mod error;
mod http;
mod node;

use error::Error;
use node::{BasicProcessor, Node};

/// The command of gossipnode
#[derive(Debug, Parser)]
struct Opts {
    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Run the node
    Run {
        /// the config file path, default is `config.toml`
        #[arg(short, long, default_value_t = String::from("config.toml"))]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    pretty_env_logger::init();
    let opts = Opts::parse();

    match opts.subcmd {
        SubCommand::Run { config } => {
            if let Err(err) = run(&config).await {
                error!("❌ {}", err);
                std::process::exit(1);
            }
        }
    }
}

async fn run(config_file: &str) -> Result<(), Error> {
    // Load config.
    let Config {
        http_addr,
        p2p: p2p_config,
        txpool: txpool_config,
    } = Config::load(config_file)?;
    let http_addr: SocketAddr = http_addr.parse()?;

    // Create a new node.
    let (p2p, p2p_events) = gossip_p2p::new(p2p_config)?;
    let txpool = TransactionPool::new(txpool_config, BasicProcessor)?;
    let node = Node::new(p2p, txpool);

    let event_handler = node.clone();
    task::spawn(async move { event_handler.handle_events(p2p_events).await });

    node.start().await?;

    let (shutdown_s, shutdown_r) = bounded(1);
    let jobs = node.clone();
    let jobs_thread = thread::spawn(move || jobs.run_txpool_jobs(shutdown_r));
    let http_task = task::spawn(http::run(http_addr, node.clone()));

    tokio::signal::ctrl_c().await?;
    info!("📣 Shutting down");

    http_task.abort();
    let _ = shutdown_s.send(());
    node.stop().await?;
    if jobs_thread.join().is_err() {
        error!("❌ Transaction pool jobs panicked");
    }
    Ok(())
}
