//! baleful - compositional iptables policy engine
//!
//! # Usage
//!
//! ```bash
//! baleful profiles                      # List available node profiles
//! baleful show -p edge                  # Print the commands `start` would run
//! baleful start -p edge --head          # Install rules at the top of each chain
//! baleful policy -p edge                # Apply the profile's default policies
//! baleful status -p edge                # Installed state and counters per rule
//! baleful lock -p edge                  # Drop everything but lock-surviving rules
//! baleful panic                         # Drop everything
//! baleful interfaces                    # Addresses and gateways per interface
//! baleful --dry-run -f edge.json start  # Run against an in-memory backend
//! ```

use baleful::audit;
use baleful::config::{self, AppConfig};
use baleful::core::backend::{PacketFilterBackend, Position};
use baleful::core::error::BackendErrorPattern;
use baleful::core::iface::{NetworkInfoProvider, SystemNetworkInfo};
use baleful::core::iptables::{self, IptablesBackend};
use baleful::core::memory::MemoryBackend;
use baleful::core::node::{Node, Report};
use baleful::core::profiles;
use baleful::core::rule::Family;
use baleful::library::{App, Hop};
use baleful::utils;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "baleful", version = build::PKG_VERSION, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Compositional iptables policy engine", long_about = None)]
struct Cli {
    /// Node profile name (default: the configured default profile)
    #[arg(short, long, global = true, conflicts_with = "file")]
    profile: Option<String>,

    /// Node profile file
    #[arg(short, long, global = true, value_name = "PATH")]
    file: Option<PathBuf>,

    /// Run against an in-memory backend and print the resulting tables
    #[arg(long, global = true)]
    dry_run: bool,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the iptables commands `policy` and `start` would run
    Show {
        /// Plan for insertion at the head of each chain
        #[arg(long)]
        head: bool,
        /// Show the LOG-targeted copy of the rule set instead
        #[arg(long)]
        log: bool,
    },
    /// Install the node's rules
    Start {
        /// Insert at the head of each chain instead of the configured position
        #[arg(long)]
        head: bool,
    },
    /// Remove the node's rules
    Stop,
    /// Drop all traffic except rules marked to survive lock-down
    Lock,
    /// Drop all traffic
    Panic,
    /// Remove every rule from every table, keeping default policies
    Flush,
    /// Apply the node's default chain policies
    Policy,
    /// Show whether each rule is installed, with counters
    Status,
    /// List the application fragments
    Apps,
    /// List the hop topologies
    Hops,
    /// List the stored node profiles
    Profiles,
    /// List network interfaces with their addresses and gateways
    Interfaces,
}

fn main() -> ExitCode {
    let _ = utils::ensure_dirs();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Logs to the state directory when possible, stderr otherwise.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "baleful=warn",
        1 => "baleful=info",
        _ => "baleful=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let log_file = utils::get_log_path().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });

    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .init(),
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn load_node(cli: &Cli, config: &AppConfig) -> baleful::Result<Node> {
    let profile = match (&cli.file, &cli.profile) {
        (Some(path), _) => profiles::load_profile_file(path).await?,
        (None, name) => {
            profiles::load_profile(name.as_deref().unwrap_or(&config.default_profile)).await?
        }
    };
    profile.build_node()
}

/// Panic and flush must work without a usable profile.
async fn load_node_or_bare(cli: &Cli, config: &AppConfig) -> Node {
    match load_node(cli, config).await {
        Ok(node) => node,
        Err(e) => {
            tracing::warn!("No usable profile ({e}), continuing without one");
            let hostname = nix::unistd::gethostname()
                .ok()
                .and_then(|name| name.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string());
            Node::new(hostname)
        }
    }
}

async fn finish(node: &Node, report: &Report, config: &AppConfig, dry_run: bool) -> ExitCode {
    if config.audit_enabled {
        audit::log_report(node, report, dry_run).await;
    }
    println!("{report}");
    print_hints(report);
    if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_interfaces(provider: &dyn NetworkInfoProvider) -> baleful::Result<()> {
    let mut gateways = Vec::new();
    for family in Family::iter() {
        gateways.extend(provider.gateways(family)?);
    }

    for name in provider.interfaces()? {
        println!("{name}");
        for family in Family::iter() {
            for address in provider.addresses(&name, family)? {
                match address.subnet() {
                    Some(subnet) => println!("  {:<6} {} ({subnet})", family.to_string(), address.addr),
                    None => println!("  {:<6} {}", family.to_string(), address.addr),
                }
            }
        }
        for gateway in gateways.iter().filter(|g| g.interface == name) {
            println!("  via    {}", gateway.addr);
        }
    }
    Ok(())
}

/// One translated hint per distinct failure class.
fn print_hints(report: &Report) {
    let mut seen = std::collections::BTreeSet::new();
    for failure in &report.failures {
        let translation = BackendErrorPattern::match_error(&failure.error.to_string());
        if !seen.insert(translation.user_message.clone()) {
            continue;
        }
        eprintln!("\n{}", translation.user_message);
        for suggestion in &translation.suggestions {
            eprintln!("  - {suggestion}");
        }
        if let Some(url) = &translation.help_url {
            eprintln!("  See {url}");
        }
    }
}

async fn handle_cli(cli: Cli) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let config = config::load_config().await;

    match cli.command {
        Commands::Apps => {
            for app in App::iter() {
                println!("  {:<16} {}", app.to_string(), app.description());
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Hops => {
            for hop in Hop::iter() {
                println!("  {:<16} {}", hop.to_string(), hop.description());
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Profiles => {
            println!("Available profiles (* = default):");
            for name in profiles::list_profiles().await? {
                let marker = if name == config.default_profile { '*' } else { ' ' };
                println!("  {marker} {name}");
            }
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Interfaces => {
            print_interfaces(&SystemNetworkInfo)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Show { head, log } => {
            let node = load_node(&cli, &config).await?;
            if log {
                let position = if head { Position::HEAD } else { config.insert_at };
                for rule in &node.log_rules() {
                    println!("{}", iptables::command_line(rule, position));
                }
            } else {
                println!("# {} (fingerprint {})", node.hostname(), node.fingerprint());
                for line in node.plan(head.then_some(Position::HEAD)) {
                    println!("{line}");
                }
            }
            return Ok(ExitCode::SUCCESS);
        }
        _ => {}
    }

    if !cli.dry_run && !nix::unistd::getuid().is_root() {
        tracing::warn!("Not running as root, iptables calls will likely be refused");
        eprintln!("Note: not running as root; use --dry-run to preview without privileges.");
    }

    let mut memory = MemoryBackend::new();
    let mut live;
    let backend: &mut dyn PacketFilterBackend = if cli.dry_run {
        &mut memory
    } else {
        live = IptablesBackend::from_config(&config);
        &mut live
    };

    let code = match cli.command {
        Commands::Start { head } => {
            let mut node = load_node(&cli, &config).await?;
            let position = if head { Position::HEAD } else { config.insert_at };
            let report = node.start(backend, Some(position));
            finish(&node, &report, &config, cli.dry_run).await
        }
        Commands::Stop => {
            let mut node = load_node(&cli, &config).await?;
            let report = node.stop(backend);
            finish(&node, &report, &config, cli.dry_run).await
        }
        Commands::Lock => {
            let mut node = load_node(&cli, &config).await?;
            let report = node.lock(backend);
            finish(&node, &report, &config, cli.dry_run).await
        }
        Commands::Policy => {
            let node = load_node(&cli, &config).await?;
            let report = node.set_policy(backend);
            finish(&node, &report, &config, cli.dry_run).await
        }
        Commands::Panic => {
            let mut node = load_node_or_bare(&cli, &config).await;
            let report = node.panic(backend);
            finish(&node, &report, &config, cli.dry_run).await
        }
        Commands::Flush => {
            let mut node = load_node_or_bare(&cli, &config).await;
            let report = node.flush(backend);
            finish(&node, &report, &config, cli.dry_run).await
        }
        Commands::Status => {
            let node = load_node(&cli, &config).await?;
            let statuses = node.status(backend)?;
            let installed = statuses.iter().filter(|s| s.installed).count();
            println!("{}: {installed}/{} rules installed", node.hostname(), statuses.len());
            for status in statuses {
                let mark = if status.installed { "✓" } else { "✗" };
                let counters = status
                    .counters
                    .map(|c| format!("{:>8} {:>10}", c.packets, c.bytes))
                    .unwrap_or_else(|| format!("{:>8} {:>10}", "-", "-"));
                println!(
                    "  {mark} {counters}  {}",
                    utils::truncate_string(&status.rule.to_string(), 100)
                );
            }
            ExitCode::SUCCESS
        }
        Commands::Show { .. }
        | Commands::Apps
        | Commands::Hops
        | Commands::Profiles
        | Commands::Interfaces => {
            ExitCode::SUCCESS
        }
    };

    if cli.dry_run {
        print!("{}", memory.render());
    }

    Ok(code)
}
