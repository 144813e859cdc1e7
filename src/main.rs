use clap::Parser;
use meshsync::config::{Config, LoggingConfig, StorageBackend};
use meshsync::shutdown::ShutdownManager;
use meshsync::{
    AppError, MemoryStore, Role, SessionSettings, SledStore, SnapshotStore, SyncSession,
    TcpTransport,
};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "meshsyncd")]
#[command(about = "Peer-mesh replica synchronization daemon", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "meshsync.toml")]
    config: String,

    /// Override node.role (hub | spoke)
    #[arg(long)]
    role: Option<Role>,

    #[arg(long)]
    namespace: Option<String>,

    #[arg(long)]
    local_id: Option<String>,

    #[arg(long)]
    listen_addr: Option<String>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(long)]
    generate_config: bool,

    /// Log in through the hub after start (bootstraps an empty replica)
    #[arg(long, requires = "login_password")]
    login_email: Option<String>,

    #[arg(long, requires = "login_email")]
    login_password: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::default();
        match config.save_to_file(&args.config) {
            Ok(_) => {
                println!("✅ Generated default config at: {}", args.config);
                return;
            }
            Err(e) => {
                eprintln!("❌ Failed to generate config: {}", e);
                std::process::exit(1);
            }
        }
    }

    let mut config = match Config::load_or_create(&args.config) {
        Ok(cfg) => {
            println!("✓ Loaded configuration from {}", args.config);
            cfg
        }
        Err(e) => {
            eprintln!("❌ Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    apply_overrides(&mut config, &args);
    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {}", e);
        std::process::exit(1);
    }

    let _log_guard = setup_logging(&config.logging, args.verbose);

    let version = env!("CARGO_PKG_VERSION");
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    tracing::info!("🚀 meshsyncd v{} ({})", version, git_hash);
    tracing::info!(
        "📡 Role: {} | Namespace: {} | Local id: {}",
        config.node.role,
        meshsync::identity::normalize_namespace(&config.node.namespace),
        config.node.local_id
    );

    if let Err(e) = run(config, args).await {
        tracing::error!("❌ {}", e);
        std::process::exit(1);
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(role) = args.role {
        config.node.role = role;
    }
    if let Some(namespace) = &args.namespace {
        config.node.namespace = namespace.clone();
    }
    if let Some(local_id) = &args.local_id {
        config.node.local_id = local_id.clone();
    }
    if let Some(addr) = &args.listen_addr {
        config.network.listen_address = Some(addr.clone());
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn SnapshotStore>, AppError> {
    match config.storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("⚠️ In-memory storage: the replica is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sled => {
            let path = config.db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let path = path.to_string_lossy().to_string();
            tracing::info!("💾 Opening replica at {}", path);
            Ok(Arc::new(SledStore::open(&path)?))
        }
    }
}

async fn run(config: Config, args: Args) -> Result<(), AppError> {
    let store = open_store(&config)?;
    let transport = Arc::new(TcpTransport::new(
        config.network.listen_address.clone(),
        config.network.routes.clone(),
    ));

    let settings = SessionSettings::from_config(&config);
    let (handle, session_task) = SyncSession::spawn(settings, transport, store).await?;

    let mut shutdown_manager = ShutdownManager::new();
    let shutdown_token = shutdown_manager.token();

    handle.start()?;

    // Status changes to the log
    let mut status_rx = handle.status_watch();
    let status_token = shutdown_token.clone();
    shutdown_manager.register_task(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = status_token.cancelled() => break,
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *status_rx.borrow_and_update();
                    tracing::info!("📶 Sync status: {:?}", status);
                }
            }
        }
    }));

    // Dataset changes to the log
    let mut changes = handle.subscribe();
    let changes_token = shutdown_token.clone();
    shutdown_manager.register_task(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = changes_token.cancelled() => break,
                change = changes.recv() => match change {
                    Ok(change) => tracing::debug!(
                        "📝 Collections changed: {:?} ({:?})",
                        change.collections,
                        change.origin
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Change feed lagged by {}", n);
                    }
                    Err(_) => break,
                }
            }
        }
    }));

    if let (Some(email), Some(password)) = (args.login_email, args.login_password) {
        let login_handle = handle.clone();
        tokio::spawn(async move {
            match login_handle.remote_login(email.clone(), password).await {
                Ok(user) => tracing::info!("🔓 Logged in as {} ({})", email, user.id),
                Err(e) => tracing::error!("❌ Remote login for {} failed: {}", email, e),
            }
        });
    }

    // The session stops last so the watchers above see the final status
    let session_handle = handle.clone();
    let session_token = shutdown_token.clone();
    shutdown_manager.register_task(tokio::spawn(async move {
        session_token.cancelled().await;
        if let Err(e) = session_handle.shutdown().await {
            tracing::debug!("Session already stopped: {}", e);
        }
        let _ = session_task.await;
    }));

    shutdown_manager.wait_for_shutdown().await;
    Ok(())
}

fn setup_logging(
    config: &LoggingConfig,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "trace" } else { &config.level };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Detect if running under systemd/journald
    let is_systemd =
        std::env::var("JOURNAL_STREAM").is_ok() || std::env::var("INVOCATION_ID").is_ok();

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

    if config.output == "file" {
        let path = std::path::Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| std::path::Path::new("."));
        let prefix = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "meshsyncd.log".to_string());

        let appender = tracing_appender::rolling::daily(dir, prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let builder = fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(false);
        if config.format == "json" {
            builder.json().init();
        } else {
            builder
                .with_target(false)
                .with_timer(CustomTimer {
                    hostname: short_hostname,
                })
                .compact()
                .init();
        }
        return Some(guard);
    }

    match config.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_thread_ids(false)
                .init();
        }
        _ => {
            if is_systemd {
                // journald already adds timestamp and hostname
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .without_time()
                    .compact()
                    .init();
            } else {
                fmt()
                    .with_env_filter(filter)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_timer(CustomTimer {
                        hostname: short_hostname,
                    })
                    .compact()
                    .init();
            }
        }
    }
    None
}

// UTC time plus short hostname: "2025-12-10 18:09:43.150 [server1]"
struct CustomTimer {
    hostname: String,
}

impl tracing_subscriber::fmt::time::FormatTime for CustomTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(
            w,
            "{}.{:03} [{}]",
            now.format("%Y-%m-%d %H:%M:%S"),
            now.timestamp_subsec_millis(),
            self.hostname
        )
    }
}
