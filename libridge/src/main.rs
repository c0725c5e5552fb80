//! libridge - bridge IoT-LAB node serial consoles to an MQTT broker
//!
//! # Usage
//!
//! ```bash
//! # bridge two nodes, identity naming
//! libridge --broker mqtt.example.org --nodes m3-1,m3-2
//!
//! # node list from a file, external names from a mapping, authenticated broker
//! LC_LIBRIDGE_USER=bridge LC_LIBRIDGE_PWD=secret \
//!     libridge -b mqtt.example.org --nodes-file nodes.txt --mapping names.json
//!
//! # print the env file for an IoT-LAB experiment script
//! libridge script-config --host mqtt.example.org --user bridge --password secret
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libridge::config::{
    load_node_file, resolve_credentials, BridgeConfig, ScriptConfig, DEFAULT_BROKER_PORT,
    DEFAULT_CLIENT_ID,
};
use libridge::multiplexer::DEFAULT_SERIAL_PORT;
use libridge::{BridgeSession, IdentifierMapper, SessionState};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "libridge")]
#[command(about = "Bridge IoT-LAB node serial consoles to an MQTT broker")]
#[command(version)]
struct Args {
    /// MQTT broker address
    #[arg(short, long)]
    broker: Option<String>,

    /// MQTT broker port
    #[arg(short, long, default_value_t = DEFAULT_BROKER_PORT)]
    port: u16,

    /// Nodes to bridge (serial-side ids, comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    nodes: Vec<String>,

    /// File listing nodes to bridge, one per line
    #[arg(long)]
    nodes_file: Option<PathBuf>,

    /// JSON object mapping serial-side ids to MQTT-side ids
    #[arg(short, long)]
    mapping: Option<PathBuf>,

    /// Broker username (LC_LIBRIDGE_USER takes precedence)
    #[arg(short, long)]
    username: Option<String>,

    /// Broker password (LC_LIBRIDGE_PWD takes precedence)
    #[arg(long)]
    password: Option<String>,

    /// MQTT client id
    #[arg(long, default_value = DEFAULT_CLIENT_ID)]
    client_id: String,

    /// MQTT keep-alive (seconds)
    #[arg(long, default_value_t = 30)]
    keep_alive: u64,

    /// QoS for subscriptions and publishes (0 or 1)
    #[arg(long, default_value_t = 0)]
    qos: u8,

    /// TCP port exposing the node serial consoles
    #[arg(long, default_value_t = DEFAULT_SERIAL_PORT)]
    serial_port: u16,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long, default_value = "60")]
    stats_interval: u64,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the environment file used to run the bridge as an experiment script
    ScriptConfig {
        #[arg(long)]
        host: String,
        #[arg(long, default_value_t = DEFAULT_BROKER_PORT)]
        port: u16,
        #[arg(long, default_value_t = 0)]
        verbose: u8,
        #[arg(long)]
        user: String,
        #[arg(long)]
        password: String,
        #[arg(long, default_value = "testbed")]
        topic: String,
        #[arg(long)]
        iotlab_user: Option<String>,
        #[arg(long)]
        iotlab_password: Option<String>,
        /// Write the file to a temporary path, print the path and keep the
        /// file until Ctrl+C
        #[arg(long)]
        write: bool,
    },

    /// Validate a mapping file and show how nodes will be named on MQTT
    CheckMapping {
        /// Mapping file path
        mapping: PathBuf,

        /// Nodes to translate (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        nodes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Some(cmd) = args.command.take() {
        return match cmd {
            Commands::ScriptConfig {
                host,
                port,
                verbose,
                user,
                password,
                topic,
                iotlab_user,
                iotlab_password,
                write,
            } => {
                let script = ScriptConfig {
                    host,
                    port,
                    verbose,
                    username_bridge: user,
                    password_bridge: password,
                    topic,
                    username_iotlab: iotlab_user,
                    password_iotlab: iotlab_password,
                };
                if write {
                    cmd_write_script_config(&script).await
                } else {
                    print!("{}", script.render());
                    Ok(())
                }
            }
            Commands::CheckMapping { mapping, nodes } => cmd_check_mapping(mapping, nodes),
        };
    }

    let stats_interval = args.stats_interval;
    let config = build_config(args)?;
    let mapper = match &config.mapping_path {
        Some(path) => IdentifierMapper::from_file(path).context("invalid identifier mapping")?,
        None => IdentifierMapper::identity(),
    };

    let session = libridge::session_from_config(&config, mapper)?;
    info!(
        broker = %config.broker_host,
        port = config.broker_port,
        nodes = config.nodes.len(),
        "libridge v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    if stats_interval > 0 {
        spawn_stats_reporter(session.clone(), Duration::from_secs(stats_interval));
    }

    let bridge = session.loop_forever();
    tokio::pin!(bridge);
    tokio::select! {
        result = &mut bridge => return result.context("bridge session ended"),
        signal = tokio::signal::ctrl_c() => signal.context("failed to listen for Ctrl+C")?,
    }

    info!("shutting down");
    session.stop();
    bridge.await?;
    info!(stats = ?session.stats(), "final statistics");
    Ok(())
}

fn build_config(args: Args) -> Result<BridgeConfig> {
    let broker = args
        .broker
        .context("missing broker address (use --broker)")?;

    let mut nodes: std::collections::BTreeSet<String> = args
        .nodes
        .into_iter()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    if let Some(path) = &args.nodes_file {
        nodes.extend(load_node_file(path)?);
    }

    let mut config = BridgeConfig::new(broker, nodes);
    config.broker_port = args.port;
    config.client_id = args.client_id;
    config.keep_alive_secs = args.keep_alive;
    config.qos = args.qos;
    config.serial_port = args.serial_port;
    config.mapping_path = args.mapping;
    config.credentials = resolve_credentials(args.username, args.password)?;

    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn cmd_check_mapping(path: PathBuf, nodes: Vec<String>) -> Result<()> {
    let mapper = IdentifierMapper::from_file(&path)
        .with_context(|| format!("invalid mapping file {}", path.display()))?;
    let node_set = nodes.iter().cloned().collect();
    mapper
        .check_nodes(&node_set)
        .with_context(|| format!("mapping {} does not fit the nodes", path.display()))?;
    println!("{}: {} entries, one-to-one", path.display(), mapper.len());
    for node in &nodes {
        println!("  {} -> {}", node, mapper.to_external(node));
    }
    Ok(())
}

async fn cmd_write_script_config(script: &ScriptConfig) -> Result<()> {
    let file = script
        .write_temp()
        .context("failed to write script config")?;
    println!("{}", file.path().display());
    info!(path = %file.path().display(), "script config written, removed on Ctrl+C");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    drop(file);
    Ok(())
}

fn spawn_stats_reporter(session: BridgeSession, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            match session.state() {
                SessionState::Stopped => break,
                SessionState::Running => info!(stats = ?session.stats(), "bridge statistics"),
                state => warn!(%state, stats = ?session.stats(), "bridge not connected"),
            }
        }
    });
}
