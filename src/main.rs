//! meshctl: peer node for a decentralized WebRTC mesh.
//!
//! This binary wires the channel subsystem to a `clap`-based CLI surface.
//! `run` is the long-lived node process; the other subcommands are one-shot
//! inspection/control commands.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use meshctl::channel::{ChannelState, ChannelTuning, Initiation, NodeChannel, Politeness};
use meshctl::{Account, AccountManager, Address, ChannelManager, Config};
use meshctl::signalling::{SignallingTransport, WebSocketSignalling};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "meshctl")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Peer node for a decentralized WebRTC mesh")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the node, accepting inbound negotiation and keeping channels alive.
    Run {
        /// Render a live status table instead of plain logs.
        #[arg(long)]
        stream: bool,
    },
    /// Print the version.
    V,
    /// Print channel counts by state.
    Status,
    /// Render a live status table, refreshed every 100 ms.
    Stream,
    /// List known channels.
    List {
        /// List node channels.
        #[arg(long)]
        nodes: bool,
        /// List account channels.
        #[arg(long)]
        accounts: bool,
        /// Skip this many entries.
        #[arg(long)]
        skip: Option<usize>,
        /// Take at most this many entries.
        #[arg(long)]
        take: Option<usize>,
    },
    /// Initiate a connection to a node's signalling endpoint.
    Connect {
        /// Signalling URL of the node to connect to.
        #[arg(long)]
        node: String,
    },
    /// Exit a running node (no-op without a supervising daemon).
    Exit,
}

fn main() {
    meshctl::logging::init();

    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            log::error!("{e:#}");
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::V => {
            println!("meshctl {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Run { stream } => run_node(stream),
        Command::Status => print_status(&ChannelManager::new(load_local_signer()?)),
        Command::Stream => stream_status(&ChannelManager::new(load_local_signer()?)),
        Command::List { nodes, accounts, skip, take } => {
            let manager = ChannelManager::new(load_local_signer()?);
            print_list(&manager, nodes, accounts, skip, take)
        }
        Command::Connect { node } => connect(&node),
        Command::Exit => {
            println!("no running instance to signal; exiting");
            Ok(())
        }
    }
}

fn load_local_signer() -> Result<Address> {
    let config_dir = Config::config_dir()?;
    if let Some(key) = Config::signing_key_from_env()? {
        return Ok(Address::from_verifying_key(&key.verifying_key()));
    }
    let manager = AccountManager::load_or_create(&config_dir)?;
    Ok(manager.address().clone())
}

fn load_account_manager() -> Result<AccountManager> {
    let config_dir = Config::config_dir()?;
    if let Some(key) = Config::signing_key_from_env()? {
        let address = Address::from_verifying_key(&key.verifying_key());
        return Ok(AccountManager::new(Account::Local { address, signing_key: Some(key), mnemonic_index: None }));
    }
    AccountManager::load_or_create(&config_dir)
}

/// Run the long-lived node process: load identity, construct the manager,
/// and idle until interrupted. A real signalling server accepting inbound
/// offers and dispatching them to `ChannelManager::create_node_channel` /
/// `create_account_channel` is the host integration point this binary
/// leaves to the embedding application.
fn run_node(stream: bool) -> Result<()> {
    let config = Config::load()?;
    let account_manager = load_account_manager()?;
    let manager = ChannelManager::new(account_manager.address().clone());

    log::info!("meshctl node starting; signer={} port={}", account_manager.address(), config.port);
    println!("meshctl node running as {}", account_manager.address());

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        let mut shutdown = tokio::signal::ctrl_c();
        loop {
            if stream {
                print_stream_frame(&manager);
            }
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_millis(100)) => {}
                _ = &mut shutdown => break,
            }
        }
    });

    println!("shutting down");
    runtime.block_on(manager.dispose());
    Ok(())
}

fn print_status(manager: &ChannelManager) -> Result<()> {
    let mut counts: std::collections::BTreeMap<&'static str, usize> = std::collections::BTreeMap::new();
    for channel in manager.get_node_channels() {
        *counts.entry(state_label(channel.state())).or_insert(0) += 1;
    }
    for channel in manager.get_account_channels() {
        *counts.entry(state_label(channel.state())).or_insert(0) += 1;
    }
    if counts.is_empty() {
        println!("no channels");
    }
    for (state, count) in counts {
        println!("{state}: {count}");
    }
    Ok(())
}

fn stream_status(manager: &ChannelManager) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        let mut shutdown = tokio::signal::ctrl_c();
        loop {
            print_stream_frame(manager);
            tokio::select! {
                () = tokio::time::sleep(meshctl::constants::STREAM_REFRESH_INTERVAL) => {}
                _ = &mut shutdown => break,
            }
        }
    });
    Ok(())
}

fn print_stream_frame(manager: &ChannelManager) {
    print!("\x1b[2J\x1b[H");
    let _ = print_list(manager, true, true, None, None);
}

fn print_list(
    manager: &ChannelManager,
    nodes: bool,
    accounts: bool,
    skip: Option<usize>,
    take: Option<usize>,
) -> Result<()> {
    let show_all = !nodes && !accounts;
    let mut rows = Vec::new();

    if nodes || show_all {
        for channel in manager.get_node_channels() {
            rows.push(format!(
                "node   {:<42} state={:<10} stable={:<5} politeness={:<8} {}",
                channel.remote_signer().to_string(),
                state_label(channel.state()),
                channel.is_stable(),
                politeness_label(channel.politeness()),
                format_latency(channel.latency_ms()),
            ));
        }
    }
    if accounts || show_all {
        for channel in manager.get_account_channels() {
            rows.push(format!(
                "account {:<41} signer={:<42} state={:<10} stable={:<5} politeness={:<8} {}",
                channel.account().to_string(),
                channel.remote_signer().to_string(),
                state_label(channel.state()),
                channel.is_stable(),
                politeness_label(channel.politeness()),
                format_latency(channel.latency_ms()),
            ));
        }
    }

    let skip = skip.unwrap_or(0);
    let iter = rows.into_iter().skip(skip);
    let iter: Box<dyn Iterator<Item = String>> = match take {
        Some(n) => Box::new(iter.take(n)),
        None => Box::new(iter),
    };

    let mut printed = false;
    for row in iter {
        println!("{row}");
        printed = true;
    }
    if !printed {
        println!("no channels");
    }
    Ok(())
}

fn format_latency(latency_ms: u64) -> String {
    let high = std::time::Duration::from_millis(latency_ms) > meshctl::constants::DEFAULT_MAX_LATENCY;
    if high {
        format!("\x1b[31mlatency={latency_ms}ms\x1b[0m")
    } else {
        format!("latency={latency_ms}ms")
    }
}

fn state_label(state: ChannelState) -> &'static str {
    match state {
        ChannelState::Initiating => "initiating",
        ChannelState::Connecting => "connecting",
        ChannelState::Signalling => "signalling",
        ChannelState::Rejected => "rejected",
        ChannelState::Failed => "failed",
        ChannelState::Open => "open",
        ChannelState::Closing => "closing",
        ChannelState::Closed => "closed",
        ChannelState::Disposing => "disposing",
        ChannelState::Disposed => "disposed",
    }
}

fn politeness_label(politeness: Politeness) -> &'static str {
    match politeness {
        Politeness::Polite => "polite",
        Politeness::Impolite => "impolite",
    }
}

fn connect(node: &str) -> Result<()> {
    let config_dir = Config::config_dir()?;
    let account_manager = AccountManager::load_or_create(&config_dir)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        let signalling: Arc<dyn SignallingTransport> = Arc::new(WebSocketSignalling::new(node));

        // The remote signer identity is only learned once negotiation
        // exchanges envelopes; a standalone `connect` has nothing to key the
        // channel by yet, so it uses the empty-address sentinel.
        let remote_signer = Address::empty();
        let channel = NodeChannel::new(
            account_manager.address().clone(),
            remote_signer,
            signalling,
            Politeness::Impolite,
            Initiation::InitiatedByUs,
            ChannelTuning::default(),
        );

        channel.start_peer_connection().context("failed to start peer connection")?;
        channel.handle().open_async().await.context("failed to open channel")?;

        println!("negotiating with {node}; state={}", state_label(channel.state()));
        Ok(())
    })
}
