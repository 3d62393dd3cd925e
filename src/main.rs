use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use custodia::config::Config;
use custodia::policy::{load_policies, ExecutionContext, Policy, PolicyData, RunOptions};
use custodia::provider::http::HttpSession;
use custodia::provider::stub::StubSession;
use custodia::provider::SessionFactory;
use custodia::resource::{Cache, FileCache, MemoryCache, Registry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

/// Cloud governance engine
#[derive(Parser, Debug)]
#[command(name = "custodia", version = custodia::VERSION, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Region to query
    #[arg(short, long, global = true)]
    region: Option<String>,

    /// Account the run is attributed to
    #[arg(long, global = true)]
    account_id: Option<String>,

    /// Provider gateway endpoint
    #[arg(long, global = true)]
    endpoint: Option<String>,

    /// Bearer token for the gateway
    #[arg(long, global = true)]
    token: Option<String>,

    /// Extra resource catalog files
    #[arg(long, global = true)]
    catalog: Vec<PathBuf>,

    /// Replay recorded provider responses from a directory
    #[arg(long, global = true)]
    replay: Option<PathBuf>,

    /// Persistent cache lifetime in minutes (0 disables)
    #[arg(long, global = true)]
    cache_period: Option<u64>,

    /// Select resources without running actions
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every policy in a file
    Run { file: PathBuf },
    /// Print the provider permissions each policy needs
    Permissions { file: PathBuf },
    /// List registered resource kinds
    Kinds,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let tracing_level = level.to_tracing_level()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Failed to open log file {:?}: {}", log_path, e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::from_level(tracing_level).into()))
        .with_writer(non_blocking.with_max_level(tracing_level))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("custodia started with log level: {:?}", level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("custodia").join("custodia.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".custodia").join("custodia.log");
    }
    PathBuf::from("custodia.log")
}

fn load_registry(args: &Args) -> Result<Arc<Registry>> {
    let mut registry = Registry::builtin().context("Failed to load built-in resource catalogs")?;
    for path in &args.catalog {
        registry
            .load_catalog_file(path)
            .with_context(|| format!("Failed to load catalog {:?}", path))?;
    }
    Ok(Arc::new(registry))
}

fn build_session(args: &Args, config: &Config, registry: &Registry) -> Result<Arc<dyn SessionFactory>> {
    if let Some(dir) = &args.replay {
        let session = StubSession::from_flight_data(dir)
            .with_context(|| format!("Failed to load flight data from {:?}", dir))?
            .with_services(registry.services());
        return Ok(Arc::new(session));
    }

    let Some(endpoint) = config.effective_endpoint(args.endpoint.as_deref()) else {
        bail!("No endpoint configured; pass --endpoint or --replay");
    };
    let token = config.effective_token(args.token.as_deref());
    let session = HttpSession::new(&endpoint, token, registry.services().clone())
        .with_context(|| format!("Failed to create session for {}", endpoint))?;
    Ok(Arc::new(session))
}

fn build_cache(args: &Args, config: &Config) -> Arc<dyn Cache> {
    let period = config.effective_cache_period(args.cache_period);
    if period == 0 {
        return Arc::new(MemoryCache::new());
    }
    let path = config.cache_path.clone().unwrap_or_else(FileCache::default_path);
    tracing::debug!("using file cache {:?} ({} minutes)", path, period);
    Arc::new(FileCache::new(path, period))
}

fn read_policies(file: &Path) -> Result<Vec<PolicyData>> {
    load_policies(file).with_context(|| format!("Failed to load policies from {:?}", file))
}

async fn run_policies(args: &Args, config: &mut Config, file: &Path) -> Result<()> {
    let registry = load_registry(args)?;
    let session = build_session(args, config, &registry)?;
    let cache = build_cache(args, config);
    let options = RunOptions {
        account_id: config.effective_account(args.account_id.as_deref()),
        region: config.effective_region(args.region.as_deref()),
        dry_run: args.dry_run,
    };

    let policies = read_policies(file)?;
    let mut failures = 0;
    for data in policies {
        let name = data.name.clone();
        let ctx = ExecutionContext::new(data, &options, session.clone(), registry.clone()).with_cache(cache.clone());
        let policy = Policy::new(ctx);
        policy
            .validate()
            .with_context(|| format!("Invalid policy {}", name))?;

        match policy.run().await {
            Ok(run) => println!("{}", serde_json::to_string(&run)?),
            Err(e) => {
                tracing::error!("policy:{} failed: {}", name, e);
                eprintln!("Error: policy {} failed: {}", name, e);
                failures += 1;
            }
        }
    }

    // Remember the region and account for the next run
    config.region = Some(options.region);
    if !options.account_id.is_empty() {
        config.account_id = Some(options.account_id);
    }
    if let Err(e) = config.save() {
        tracing::warn!("Failed to save config: {}", e);
    }

    if failures > 0 {
        bail!("{} policies failed", failures);
    }
    Ok(())
}

fn print_permissions(args: &Args, config: &Config, file: &Path) -> Result<()> {
    let registry = load_registry(args)?;
    // Permissions never reach the provider
    let session: Arc<dyn SessionFactory> = Arc::new(StubSession::new());
    let options = RunOptions {
        account_id: config.effective_account(args.account_id.as_deref()),
        region: config.effective_region(args.region.as_deref()),
        dry_run: true,
    };

    for data in read_policies(file)? {
        let name = data.name.clone();
        let policy = Policy::new(ExecutionContext::new(data, &options, session.clone(), registry.clone()));
        let perms = policy
            .permissions()
            .with_context(|| format!("Invalid policy {}", name))?;
        let summary = serde_json::json!({"policy": name, "permissions": perms});
        println!("{}", serde_json::to_string(&summary)?);
    }
    Ok(())
}

fn print_kinds(args: &Args) -> Result<()> {
    let registry = load_registry(args)?;
    for kind in registry.kinds() {
        println!("{}", kind);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);
    let mut config = Config::load();

    match &args.command {
        Command::Run { file } => run_policies(&args, &mut config, file).await,
        Command::Permissions { file } => print_permissions(&args, &config, file),
        Command::Kinds => print_kinds(&args),
    }
}
