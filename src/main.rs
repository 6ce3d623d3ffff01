//! fwpath - firewall path doctor
//!
//! Command-line front end for diagnosing and repairing iptables forwarding
//! between tunnel interfaces (tun/tap) and container bridges.
//!
//! # Usage
//!
//! ```bash
//! fwpath tables                         # All four tables with counters
//! fwpath chain filter FORWARD           # One chain
//! fwpath rules --interface tun0         # Every rule mentioning tun0
//! fwpath diagnose tun0 br-1234567890ab  # Path analysis and recommendations
//! fwpath fix tun0 br-1234567890ab --show-diff
//! fwpath tunnel tun0                    # Tunnel addresses, rules, bridges
//! fwpath routes | fwpath connections
//! fwpath config init
//! ```
//!
//! Every read command accepts `--json`.

use clap::{Parser, Subcommand};
use fwpath::config::{self, AppConfig};
use fwpath::core::diagnose::{ConnectivityAnalysis, Diagnostician};
use fwpath::core::matcher::PathMatch;
use fwpath::core::parser::{ChainListing, TableListing};
use fwpath::core::remediate::{RemediationEngine, RemediationResult, StepStatus};
use fwpath::core::snapshot::{self, TableReport};
use fwpath::{Error, FirewallBackend, IptablesBackend, Result, Table, utils};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "fwpath", version, long_version = build::CLAP_LONG_VERSION)]
#[command(about = "Diagnose and repair iptables forwarding between tunnels and container bridges", long_about = None)]
struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Write logs to this file instead of stderr
    #[arg(long, global = true, value_name = "PATH")]
    log_file: Option<PathBuf>,
    /// Config file (default: $XDG_CONFIG_HOME/fwpath/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show raw, mangle, nat and filter tables
    Tables {
        /// Only this table
        #[arg(short, long)]
        table: Option<Table>,
        #[arg(long)]
        json: bool,
    },
    /// Show a single chain
    Chain {
        table: Table,
        chain: String,
        #[arg(long)]
        json: bool,
    },
    /// Show every rule that references an interface
    Rules {
        #[arg(short, long)]
        interface: String,
        #[arg(long)]
        json: bool,
    },
    /// Analyze connectivity between a tunnel and a bridge
    Diagnose {
        tunnel: String,
        bridge: String,
        #[arg(long)]
        json: bool,
    },
    /// Apply the missing rules for a tunnel and a bridge
    Fix {
        tunnel: String,
        bridge: String,
        #[arg(long)]
        json: bool,
        /// Print a diff of the filter table before and after
        #[arg(long)]
        show_diff: bool,
    },
    /// Show addresses, rules and connected bridges of a tunnel
    Tunnel {
        name: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the routing table
    Routes {
        #[arg(long)]
        json: bool,
    },
    /// Show listening sockets
    Connections {
        #[arg(long)]
        json: bool,
    },
    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Print the effective configuration
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_file.as_deref());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("✗ Failed to create Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(handle_cli(cli.command, cli.config.as_deref())) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!("Command failed: {:?}", e);
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool, log_file: Option<&Path>) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file.map(std::fs::File::create) {
        Some(Ok(file)) => builder.with_ansi(false).with_writer(file).init(),
        Some(Err(e)) => {
            builder.with_writer(std::io::stderr).init();
            warn!("Cannot open log file, logging to stderr: {}", e);
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
}

fn report_error(error: &Error) {
    let translation = error.translate();
    eprintln!("✗ {}", translation.user_message);
    for suggestion in &translation.suggestions {
        eprintln!("  • {suggestion}");
    }
    if let Error::InterfaceNotFound(name) = error {
        let similar = utils::similar_interfaces(name);
        if !similar.is_empty() {
            eprintln!("  • Did you mean: {}", similar.join(", "));
        }
    }
    if let Some(url) = &translation.help_url {
        eprintln!("  See: {url}");
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn handle_cli(command: Commands, config_path: Option<&Path>) -> Result<()> {
    let config = config::load_config(config_path).await;
    let backend = IptablesBackend::new(&config);

    match command {
        Commands::Tables { table, json } => {
            let reports = match table {
                Some(table) => vec![TableReport {
                    table,
                    listing: Some(snapshot::read_table(&backend, table).await?),
                    error: None,
                }],
                None => snapshot::read_all_tables(&backend).await,
            };
            if json {
                return print_json(&reports);
            }
            for report in &reports {
                print_table_report(report);
            }
        }
        Commands::Chain { table, chain, json } => {
            let listing = snapshot::read_chain(&backend, table, &chain).await?;
            if json {
                return print_json(&listing);
            }
            println!("# {table}");
            print_chain(&listing);
        }
        Commands::Rules { interface, json } => {
            fwpath::validators::require_interface("interface", &interface)?;
            let reports = snapshot::read_all_tables(&backend).await;
            let rules = snapshot::rules_for_interface(&reports, &interface);
            if json {
                return print_json(&rules);
            }
            if rules.is_empty() {
                println!("No rules reference {interface}");
            }
            let mut current = None;
            for rule in rules {
                let key = (rule.table, rule.chain.as_str());
                if current != Some(key) {
                    println!("{} / {}", rule.table, rule.chain);
                    current = Some(key);
                }
                println!("  {}  [{} pkts, {} bytes]", rule.describe(), rule.packets, rule.bytes);
            }
            for report in reports.iter().filter(|r| r.error.is_some()) {
                println!("⚠ {} table unavailable", report.table);
            }
        }
        Commands::Diagnose {
            tunnel,
            bridge,
            json,
        } => {
            let analysis = Diagnostician::new(&backend, &config)
                .analyze(&tunnel, &bridge)
                .await?;
            if json {
                return print_json(&analysis);
            }
            print_analysis(&analysis);
        }
        Commands::Fix {
            tunnel,
            bridge,
            json,
            show_diff,
        } => {
            let before = if show_diff {
                Some(backend.list_table(Table::Filter).await?)
            } else {
                None
            };
            let result = RemediationEngine::new(&backend, &config)
                .fix(&tunnel, &bridge)
                .await?;
            if json {
                print_json(&result)?;
            } else {
                print_remediation(&result);
            }
            if let Some(before) = before {
                let after = backend.list_table(Table::Filter).await?;
                match snapshot::listing_diff(&before, &after) {
                    Some(diff) => print!("\n{diff}"),
                    None => println!("\nFilter table unchanged"),
                }
            }
        }
        Commands::Tunnel { name, json } => {
            let report = snapshot::tunnel_report(&backend, &config, &name).await?;
            if json {
                return print_json(&report);
            }
            println!("{} ({})", report.name, report.kind);
            println!("  Local address: {}", display_opt(report.local_address));
            println!("  Peer address:  {}", display_opt(report.peer_address));
            println!("  Connected bridges: {}", join_or_none(&report.connected_bridges));
            println!("  Related rules:");
            for rule in &report.related_rules {
                println!("    {} / {}: {}", rule.table, rule.chain, rule.describe());
            }
            for error in &report.errors {
                println!("  ⚠ {error}");
            }
        }
        Commands::Routes { json } => {
            let routes = backend.list_routes().await?;
            if json {
                return print_json(&routes);
            }
            for route in &routes {
                println!(
                    "{:<20} via {:<16} dev {:<16} src {:<16} metric {}",
                    route.destination.to_string(),
                    display_opt(route.gateway),
                    route.interface.as_deref().unwrap_or("-"),
                    display_opt(route.source),
                    display_opt(route.metric),
                );
            }
        }
        Commands::Connections { json } => {
            let connections = backend.list_connections().await?;
            if json {
                return print_json(&connections);
            }
            for conn in &connections {
                println!(
                    "{:<5} {:<8} {:<28} {}",
                    conn.protocol, conn.state, conn.local_address, conn.peer_address
                );
            }
        }
        Commands::Config { action } => handle_config(action, config_path, &config).await?,
    }
    Ok(())
}

async fn handle_config(action: ConfigAction, path: Option<&Path>, current: &AppConfig) -> Result<()> {
    match action {
        ConfigAction::Init { force } => {
            let path = path
                .map(Path::to_path_buf)
                .or_else(config::default_config_path)
                .ok_or_else(|| Error::Internal("cannot determine config directory".to_string()))?;
            if path.exists() && !force {
                return Err(Error::InvalidInput {
                    field: "config".to_string(),
                    message: format!("{} already exists (use --force)", path.display()),
                });
            }
            config::save_config(&AppConfig::default(), &path).await?;
            println!("✓ Wrote {}", path.display());
        }
        ConfigAction::Show => print_json(current)?,
    }
    Ok(())
}

fn display_opt<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}

fn print_table_report(report: &TableReport) {
    println!("# {}", report.table);
    match (&report.listing, &report.error) {
        (Some(listing), _) => print_listing(listing),
        (None, Some(error)) => println!("⚠ unavailable: {error}\n"),
        (None, None) => println!(),
    }
}

fn print_listing(listing: &TableListing) {
    for chain in &listing.chains {
        print_chain(chain);
    }
    if !listing.skipped.is_empty() {
        println!("({} unparsable line(s) skipped)\n", listing.skipped.len());
    }
}

fn print_chain(chain: &ChainListing) {
    match (&chain.policy, chain.references) {
        (Some(policy), _) => println!(
            "Chain {} (policy {}, {} packets, {} bytes)",
            chain.name, policy, chain.policy_packets, chain.policy_bytes
        ),
        (None, Some(refs)) => println!("Chain {} ({} references)", chain.name, refs),
        (None, None) => println!("Chain {}", chain.name),
    }
    for rule in &chain.rules {
        let extra = if rule.extra.is_empty() {
            String::new()
        } else {
            format!("  {}", rule.extra)
        };
        println!(
            "  {:>3} {:>10} {:>12}  {:<12} {:<5} {:<16} {:<16} {:<18} {:<18}{}",
            rule.line_number,
            rule.packets,
            rule.bytes,
            rule.target,
            rule.protocol,
            rule.in_interface,
            rule.out_interface,
            rule.source,
            rule.destination,
            extra
        );
    }
    println!();
}

fn path_line(path: &PathMatch) -> String {
    match (path.first_match(), &path.shadowed_by) {
        (Some(accept), Some(blocker)) => format!(
            "⚠ ACCEPT at line {} is preceded by {}",
            accept.line_number,
            blocker.describe()
        ),
        (Some(accept), None) => format!("✓ {}", accept.describe()),
        (None, _) => "✗ no permitting rule".to_string(),
    }
}

fn print_analysis(analysis: &ConnectivityAnalysis) {
    let join_addrs = |addrs: &[std::net::IpAddr]| {
        join_or_none(&addrs.iter().map(ToString::to_string).collect::<Vec<_>>())
    };

    println!("{} <-> {}", analysis.tunnel, analysis.bridge);
    println!("  {} addresses: {}", analysis.tunnel, join_addrs(&analysis.tunnel_addresses));
    println!("  {} addresses: {}", analysis.bridge, join_addrs(&analysis.bridge_addresses));
    println!();
    println!("Forward  {}: {}", analysis.tunnel_to_bridge.pair, path_line(&analysis.tunnel_to_bridge));
    println!("Return   {}: {}", analysis.bridge_to_tunnel.pair, path_line(&analysis.bridge_to_tunnel));
    println!("Isolation ({}): {}", analysis.isolation.chain, analysis.isolation.status);
    println!();

    println!("Packet path:");
    for step in &analysis.path {
        println!(
            "  {:>2}. [{}/{}] {} ({})",
            step.step, step.table, step.chain, step.description, step.action
        );
    }
    println!();

    let stats = &analysis.statistics;
    println!(
        "Traffic{}: {} -> {}: {} pkts / {} bytes, {} -> {}: {} pkts / {} bytes, forwarded {}, dropped {}",
        if stats.estimated { " (estimated)" } else { "" },
        analysis.tunnel,
        analysis.bridge,
        stats.tunnel_to_bridge_packets,
        stats.tunnel_to_bridge_bytes,
        analysis.bridge,
        analysis.tunnel,
        stats.bridge_to_tunnel_packets,
        stats.bridge_to_tunnel_bytes,
        stats.forwarded_packets,
        stats.dropped_packets
    );
    println!();

    println!("Recommendations:");
    for rec in &analysis.recommendations {
        println!("  • {rec}");
    }
    if !analysis.errors.is_empty() {
        println!();
        for error in &analysis.errors {
            println!("⚠ {error}");
        }
    }
}

fn print_remediation(result: &RemediationResult) {
    println!("Fix {}", result.pair);
    for step in &result.steps {
        let mark = match step.status {
            StepStatus::Applied => "✓",
            StepStatus::AlreadySatisfied => "=",
            StepStatus::Skipped => "-",
            StepStatus::Failed => "✗",
        };
        println!("  {mark} {}: {} ({})", step.step, step.status, step.detail);
    }
    if result.applied_commands.is_empty() {
        println!("Nothing to change");
    } else {
        println!("Applied:");
        for command in &result.applied_commands {
            println!("  {command}");
        }
    }
}
