// # dnatd - NAT reconciliation daemon
//
// Thin wiring layer. The daemon parses the command line, prepares the
// kernel, plugs the UDP-probe resolver and the nft backend into the
// reconciliation engine and runs it until a signal arrives. All NAT
// logic lives in dnat-core.
//
// ## Configuration
//
// - positional FILE: legacy rules file, one
//   `kind,port1,port2,domain[,protocol]` per line
// - `--toml FILE`: structured TOML rules file (`[[rules]]` tables)
// - `DNAT_LOG_LEVEL`: trace|debug|info|warn|error (default: info)
// - `DNAT_LOCAL_IP`: fixed local (inside) address; skips the outbound
//   interface probe
//
// ## Example
//
// ```bash
// echo 'SINGLE,8080,80,home.example.com,tcp' > /etc/dnat/rules.conf
// dnatd /etc/dnat/rules.conf
// ```

use std::env;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use dnat_backend_nft::NftApplier;
use dnat_core::config::{EXAMPLE_LEGACY, EXAMPLE_TOML, RuleSource};
use dnat_core::traits::AddressResolver;
use dnat_core::ReconcileEngine;
use dnat_resolver::UdpProbeResolver;
use tracing::{Level, debug, error, info};
use tracing_subscriber::FmtSubscriber;

/// Log level environment variable
const LOG_LEVEL_ENV: &str = "DNAT_LOG_LEVEL";

/// Local address override environment variable
const LOCAL_IP_ENV: &str = "DNAT_LOCAL_IP";

/// Kernel switch that must be on for any forwarded packet to move
const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum DnatExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<DnatExitCode> for ExitCode {
    fn from(code: DnatExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "dnatd",
    version,
    about = "Keeps an nftables NAT rule set in sync with dynamic-DNS hosts"
)]
#[command(group(ArgGroup::new("rules").required(true).multiple(true)))]
struct Args {
    /// Legacy rules file (one kind,port1,port2,domain[,protocol] per line)
    #[arg(value_name = "FILE", group = "rules")]
    config: Option<PathBuf>,

    /// Structured TOML rules file
    #[arg(long, value_name = "FILE", group = "rules")]
    toml: Option<PathBuf>,
}

impl Args {
    /// The rule source to reconcile against. The legacy path wins when
    /// both are given.
    fn rule_source(&self) -> Option<RuleSource> {
        if let Some(path) = &self.config {
            return Some(RuleSource::Legacy(path.clone()));
        }
        self.toml.clone().map(RuleSource::Toml)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = match parse_log_level(&env::var(LOG_LEVEL_ENV).unwrap_or_default()) {
        Some(level) => level,
        None => {
            eprintln!(
                "{LOG_LEVEL_ENV} must be one of trace, debug, info, warn, error"
            );
            return DnatExitCode::ConfigError.into();
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {err}");
        return DnatExitCode::ConfigError.into();
    }

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to create tokio runtime: {err}");
            return DnatExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(args)).into()
}

fn parse_log_level(raw: &str) -> Option<Level> {
    match raw.to_lowercase().as_str() {
        "" => Some(Level::INFO),
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

async fn run_daemon(args: Args) -> DnatExitCode {
    let Some(source) = args.rule_source() else {
        // clap's required group already rejects this; belt and braces.
        error!("a rules file is required (positional path or --toml)");
        return DnatExitCode::ConfigError;
    };

    if let Err(err) = enable_ip_forwarding().await {
        error!("{err:#}");
        return DnatExitCode::ConfigError;
    }

    let resolver: Box<dyn AddressResolver> = match local_override_from_env() {
        Ok(Some(ip)) => {
            info!("using {LOCAL_IP_ENV} override {ip} as the local address");
            Box::new(UdpProbeResolver::with_local_override(ip))
        }
        Ok(None) => Box::new(UdpProbeResolver::new()),
        Err(err) => {
            error!("{err:#}");
            return DnatExitCode::ConfigError;
        }
    };

    let applier = Box::new(NftApplier::new());
    let (engine, mut events) = ReconcileEngine::new(source.clone(), resolver, applier);

    // Drain engine events so slow consumers never stall the loop.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!("engine event: {event:?}");
        }
    });

    info!("dnatd starting, reconciling {source}");
    match engine.run().await {
        Ok(()) => {
            info!("clean shutdown");
            DnatExitCode::CleanShutdown
        }
        Err(err) => {
            error!("daemon stopped: {err}");
            if err.is_fatal() {
                show_config_example(&source);
                DnatExitCode::ConfigError
            } else {
                DnatExitCode::RuntimeError
            }
        }
    }
}

/// Flip the kernel forwarding switch. Rule loading needs the same
/// privileges, so failing here is the earliest and clearest signal that
/// the daemon cannot do its job.
async fn enable_ip_forwarding() -> Result<()> {
    tokio::fs::write(IP_FORWARD_PATH, "1").await.with_context(|| {
        format!("cannot enable kernel forwarding; run `echo 1 > {IP_FORWARD_PATH}` and retry")
    })?;
    debug!("kernel forwarding enabled via {IP_FORWARD_PATH}");
    Ok(())
}

fn local_override_from_env() -> Result<Option<IpAddr>> {
    match env::var(LOCAL_IP_ENV) {
        Ok(raw) => {
            let ip = raw
                .parse()
                .with_context(|| format!("{LOCAL_IP_ENV} holds `{raw}`, not an IP address"))?;
            Ok(Some(ip))
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).context(format!("cannot read {LOCAL_IP_ENV}")),
    }
}

/// Show the operator what a well-formed rules file looks like, in the
/// format they chose, before exiting on a fatal config error.
fn show_config_example(source: &RuleSource) {
    match source {
        RuleSource::Legacy(path) => {
            info!(
                "write forwarding rules to {}, for example:\n{EXAMPLE_LEGACY}",
                path.display()
            );
        }
        RuleSource::Toml(path) => {
            info!(
                "write forwarding rules to {}, for example:\n{EXAMPLE_TOML}",
                path.display()
            );
        }
    }
}
