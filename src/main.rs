use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::info;

use meshmgrd::config::Config;
use meshmgrd::manager::Manager;
use meshmgrd::push::NullPushNotifier;
use meshmgrd::store::{JsonStore, MeshStore};
use meshmgrd::virtual_node::NullBroadcaster;

#[derive(Parser)]
#[command(name = "meshmgrd")]
#[command(about = "Persistent bridge between a LoRa mesh radio and local consumers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "meshmgrd.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the radio and run the dispatch loop until interrupted
    Run,
    /// Write a default configuration file
    Init,
    /// Print the local node and connection summary, then exit
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    info!("meshmgrd v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init => {
            Config::create_default(&cli.config).await?;
            info!("configuration file created at {}", cli.config);
        }
        Commands::Run => {
            let config = Config::load(&cli.config).await?;
            run(config).await?;
        }
        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            let store = JsonStore::new(Path::new(&config.store.data_dir)).await?;
            let node_num = store.get_setting("localNodeNum").await?;
            let node_id = store.get_setting("localNodeId").await?;
            match (node_num, node_id) {
                (Some(num), Some(id)) => println!("local node: {id} (#{num})"),
                _ => println!("local node: unknown (never completed init capture)"),
            }
        }
    }

    Ok(())
}

/// Constructs the manager's collaborators (store, push, virtual-node
/// fan-out — all external per spec §1) and runs the dispatch loop until
/// the process is interrupted. The REST surface and the virtual-node
/// TCP server this process would normally also host are out of scope
/// for this crate (spec §1) and are not started here.
async fn run(config: Config) -> Result<()> {
    let store: Arc<dyn MeshStore> = Arc::new(JsonStore::new(Path::new(&config.store.data_dir)).await?);
    let push = Arc::new(NullPushNotifier);
    let virtual_node = Arc::new(NullBroadcaster);

    let (manager, handle) = Manager::connect(config, store, push, virtual_node, None);
    let dispatch = tokio::spawn(manager.run());

    tokio::select! {
        result = dispatch => { result?; }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            handle.disconnect().await;
        }
    }

    Ok(())
}
