//! Stratus - cloud-bursting worker provisioner
//!
//! ## Usage
//!
//! ```bash
//! # Run the pool until Ctrl+C, with two warm workers
//! stratus run --config pool.json --warm ubuntu-small=2
//!
//! # Provision workers and wait for them to connect
//! stratus provision --config pool.json --template ubuntu-small --count 3 --wait
//!
//! # Check templates against the provider catalogue
//! stratus templates --config pool.json --verify
//!
//! # Servers owned by the pool
//! stratus servers list --config pool.json
//! stratus servers reconcile --config pool.json
//! ```
//!
//! On exit `run` retires every agent it created and waits for the deletes.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stratus_provisioner::{
    verify_template, CloudPool, HetznerClient, PoolConfig, SshProbeConnector, SweepDriver,
    SystemClock, TEMPLATE_LABEL,
};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Upper bound for the final cleanup of `run`
const SHUTDOWN_TIMEOUT_SECS: u64 = 120;

/// Stratus: elastic pool of cloud workers
#[derive(Parser)]
#[command(name = "stratus")]
#[command(about = "Provision cloud workers on demand and tear them down when idle", long_about = None)]
struct Cli {
    /// Also write a daily rolling log file into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sweep driver until Ctrl+C
    Run {
        /// Pool configuration file (JSON)
        #[arg(long)]
        config: PathBuf,

        /// Pre-provision workers, e.g. `--warm ubuntu-small=2` (repeatable)
        #[arg(long, value_parser = parse_warm)]
        warm: Vec<(String, usize)>,
    },

    /// Provision workers from a template
    ///
    /// Without --wait the command exits after a single sweep. Servers it
    /// created are then unmanaged until a `run` or `servers reconcile` of
    /// the same pool deletes them.
    Provision {
        #[arg(long)]
        config: PathBuf,

        /// Template name
        #[arg(long)]
        template: String,

        #[arg(long, default_value_t = 1)]
        count: usize,

        /// Keep sweeping until every worker is READY or GONE.
        /// Without it, created servers are left unmanaged on exit
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 600)]
        timeout_secs: u64,
    },

    /// Print resolved templates
    Templates {
        #[arg(long)]
        config: PathBuf,

        /// Check location, image and server type with the provider
        #[arg(long)]
        verify: bool,
    },

    /// Servers owned by the pool
    Servers {
        #[command(subcommand)]
        action: ServersAction,
    },
}

#[derive(Subcommand)]
enum ServersAction {
    /// List servers carrying the pool label
    List {
        #[arg(long)]
        config: PathBuf,
    },

    /// Delete every server carrying the pool label
    Reconcile {
        #[arg(long)]
        config: PathBuf,
    },
}

fn parse_warm(arg: &str) -> Result<(String, usize), String> {
    let (template, count) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected <template>=<count>, got '{}'", arg))?;
    let count = count
        .parse()
        .map_err(|e| format!("invalid count in '{}': {}", arg, e))?;
    Ok((template.to_string(), count))
}

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "stratus.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "stratus=info,info".into()))
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref());

    match cli.command {
        Commands::Run { config, warm } => run(&config, warm).await,
        Commands::Provision {
            config,
            template,
            count,
            wait,
            timeout_secs,
        } => provision(&config, &template, count, wait, timeout_secs).await,
        Commands::Templates { config, verify } => templates(&config, verify).await,
        Commands::Servers { action } => match action {
            ServersAction::List { config } => list_servers(&config).await,
            ServersAction::Reconcile { config } => reconcile(&config).await,
        },
    }
}

fn load(path: &Path) -> anyhow::Result<PoolConfig> {
    PoolConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

fn hetzner(config: &PoolConfig) -> anyhow::Result<Arc<HetznerClient>> {
    let client = HetznerClient::new(&config.api_url, config.token()?, config.call_timeout())?
        .with_label_selector(config.account().label_selector());
    Ok(Arc::new(client))
}

fn build_pool(config: &PoolConfig) -> anyhow::Result<Arc<CloudPool>> {
    let pool = config.build_pool(
        hetzner(config)?,
        Arc::new(SshProbeConnector::new()),
        Arc::new(SystemClock),
    )?;
    Ok(Arc::new(pool))
}

async fn run(path: &Path, warm: Vec<(String, usize)>) -> anyhow::Result<()> {
    let config = load(path)?;
    let pool = build_pool(&config)?;

    for (template, count) in warm {
        pool.provision(&template, count).await?;
        info!(%template, count, "Warm workers requested");
    }

    info!(pool = %config.name, "🚀 Pool running. Ctrl+C to stop (workers are retired on exit)");

    let driver = SweepDriver::new(Arc::clone(&pool), config.sweep_interval());
    driver
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Cannot listen for Ctrl+C");
            }
        })
        .await;

    let handles = pool.handles().await;
    if handles.is_empty() {
        return Ok(());
    }

    info!(agents = handles.len(), "🛑 Retiring all workers");
    for handle in &handles {
        pool.retire(handle);
    }
    pool.sweep_until_settled(
        &handles,
        Duration::from_secs(1),
        Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
    )
    .await
    .context("retiring workers on shutdown")?;

    info!("✅ All workers retired");
    Ok(())
}

async fn provision(
    path: &Path,
    template: &str,
    count: usize,
    wait: bool,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let config = load(path)?;
    let pool = build_pool(&config)?;
    let handles = pool.provision(template, count).await?;

    if wait {
        pool.sweep_until_settled(
            &handles,
            Duration::from_secs(2),
            Duration::from_secs(timeout_secs),
        )
        .await?;
    } else {
        pool.sweep().await;
    }

    let mut snapshots = Vec::with_capacity(handles.len());
    for handle in &handles {
        snapshots.push(handle.snapshot().await);
    }
    println!("{}", serde_json::to_string_pretty(&snapshots)?);
    Ok(())
}

async fn templates(path: &Path, verify: bool) -> anyhow::Result<()> {
    let config = load(path)?;
    let templates = config.resolve_templates()?;
    let provider = if verify { Some(hetzner(&config)?) } else { None };

    println!(
        "{:<20} {:<10} {:<10} {:<20} {:>5} {:>8} {:>6}  {}",
        "NAME", "LOCATION", "TYPE", "IMAGE", "EXEC", "BOOT(s)", "KEEP", "LABELS"
    );
    for template in &templates {
        println!(
            "{:<20} {:<10} {:<10} {:<20} {:>5} {:>8} {:>6}  {}",
            template.name(),
            template.location(),
            template.server_type(),
            template.image(),
            template.num_executors(),
            template.boot_deadline_secs(),
            template.keep_around_minutes(),
            template.label_str(),
        );

        if let Some(provider) = &provider {
            for check in verify_template(&**provider, template).await {
                let verdict = match check.exists {
                    Some(true) => "ok",
                    Some(false) => "MISSING",
                    None => "unverified",
                };
                println!("    {:<12} {:<20} {}", check.kind.to_string(), check.name, verdict);
                if check.exists == Some(false) {
                    warn!(template = %template.name(), kind = %check.kind, name = %check.name, "Unknown to provider");
                }
            }
        }
    }
    Ok(())
}

async fn list_servers(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let servers = build_pool(&config)?.owned_servers().await?;

    println!("{:<12} {:<28} {:<12} {:<40} {}", "ID", "NAME", "STATUS", "ADDRESS", "TEMPLATE");
    for server in &servers {
        println!(
            "{:<12} {:<28} {:<12} {:<40} {}",
            server.id.to_string(),
            server.name,
            server.status.to_string(),
            server.address.as_deref().unwrap_or("-"),
            server.labels.get(TEMPLATE_LABEL).map(String::as_str).unwrap_or("-"),
        );
    }
    Ok(())
}

async fn reconcile(path: &Path) -> anyhow::Result<()> {
    let config = load(path)?;
    let pool = build_pool(&config)?;

    // A fresh pool tracks no agents, so every owned server is an orphan
    let report = pool
        .sweep()
        .await
        .context("sweep already running")?;

    info!(
        deleted = report.orphans_deleted,
        failed = report.orphan_failures,
        "Reconciliation finished"
    );
    if report.orphan_failures > 0 {
        anyhow::bail!("{} server(s) could not be deleted", report.orphan_failures);
    }
    Ok(())
}
