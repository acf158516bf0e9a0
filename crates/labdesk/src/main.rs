use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};

use log::{LevelFilter, debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use labdesk::api::{AppState, create_app};
use labdesk::audit::{AuditPublisher, AuditStore, DEFAULT_AUDIT_CAPACITY, SqliteAuditStore};
use labdesk::auth::{AuthConfig, AuthState, Role};
use labdesk::container::{ContainerRuntime, ContainerRuntimeApi, RuntimeType};
use labdesk::db::Database;
use labdesk::desktop::{DesktopServiceConfig, DesktopSessionService, IdleReaper};

const APP_NAME: &str = "labdesk";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext) -> Result<()> {
    handle_serve(&ctx).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {}", ctx.paths);

    match cli.command {
        Command::Serve => async_main(ctx),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Token(cmd) => handle_token(&ctx, cmd),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "labdesk - per-learner lab desktop orchestrator.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Emit file and line diagnostics in log output
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP API server
    Serve,
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Mint a signed token for local testing
    Token(TokenCommand),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone, Args)]
struct TokenCommand {
    /// Numeric LMS user id placed in `sub`
    user_id: String,
    /// Display name
    #[arg(long, default_value = "Learner")]
    name: String,
    /// Grant the admin role
    #[arg(long)]
    admin: bool,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths, &common)?;
        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("labdesk={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Service modules log through the `log` facade.
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn ensure_directories(&self) -> Result<()> {
        if self.common.dry_run {
            info!(
                "dry-run: would ensure data dir {}",
                self.paths.data_dir.display()
            );
            return Ok(());
        }

        fs::create_dir_all(&self.paths.data_dir).with_context(|| {
            format!("creating data directory {}", self.paths.data_dir.display())
        })?;
        Ok(())
    }

    fn audit_database_path(&self) -> Result<PathBuf> {
        match self.config.audit.database_path {
            Some(ref path) => expand_str_path(path),
            None => Ok(self.paths.data_dir.join("labdesk.db")),
        }
    }
}

#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                let expanded = expand_path(path)?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config: {}, data: {}",
            self.config_file.display(),
            self.data_dir.display()
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    server: ServerConfig,
    container: ContainerRuntimeConfig,
    desktop: DesktopConfig,
    auth: AuthConfig,
    audit: AuditConfig,
    logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ServerConfig {
    host: String,
    port: u16,
    /// Host placed in the desktop URLs handed to browsers.
    public_host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            public_host: "localhost".to_string(),
        }
    }
}

/// Container runtime selection. Auto-detected when `runtime` is unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ContainerRuntimeConfig {
    runtime: Option<RuntimeType>,
    binary: Option<String>,
}

impl ContainerRuntimeConfig {
    fn build(&self) -> ContainerRuntime {
        match (self.runtime, &self.binary) {
            (Some(runtime), Some(binary)) => ContainerRuntime::with_binary(runtime, binary.clone()),
            (Some(runtime), None) => ContainerRuntime::with_type(runtime),
            (None, Some(binary)) => ContainerRuntime::with_binary(RuntimeType::default(), binary.clone()),
            (None, None) => ContainerRuntime::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct DesktopConfig {
    image: String,
    memory_limit: Option<String>,
    cpu_limit: Option<String>,
    shm_size: Option<String>,
    cap_drop: Vec<String>,
    cap_add: Vec<String>,
    no_new_privileges: bool,
    container_port: u16,
    base_port: u16,
    vnc_password: Option<String>,
    resolution: String,
    os_type: String,
    readiness_marker: String,
    readiness_timeout_secs: u64,
    readiness_interval_ms: u64,
    log_tail_lines: u32,
    /// Sessions older than this are reclaimed.
    max_age_secs: u64,
    reaper_interval_secs: u64,
    stop_on_shutdown: bool,
    rediscover_on_startup: bool,
}

impl Default for DesktopConfig {
    fn default() -> Self {
        let base = DesktopServiceConfig::default();
        Self {
            image: base.image,
            memory_limit: base.memory_limit,
            cpu_limit: base.cpu_limit,
            shm_size: base.shm_size,
            cap_drop: base.cap_drop,
            cap_add: base.cap_add,
            no_new_privileges: base.no_new_privileges,
            container_port: base.container_port,
            base_port: base.base_port,
            vnc_password: base.vnc_password,
            resolution: base.resolution,
            os_type: base.os_type,
            readiness_marker: base.readiness_marker,
            readiness_timeout_secs: base.readiness_timeout.as_secs(),
            readiness_interval_ms: base.readiness_interval.as_millis() as u64,
            log_tail_lines: base.log_tail_lines,
            max_age_secs: 2 * 60 * 60,
            reaper_interval_secs: 60,
            stop_on_shutdown: true,
            rediscover_on_startup: true,
        }
    }
}

impl DesktopConfig {
    fn service_config(&self, public_host: &str) -> DesktopServiceConfig {
        DesktopServiceConfig {
            image: self.image.clone(),
            memory_limit: self.memory_limit.clone(),
            cpu_limit: self.cpu_limit.clone(),
            shm_size: self.shm_size.clone(),
            cap_drop: self.cap_drop.clone(),
            cap_add: self.cap_add.clone(),
            no_new_privileges: self.no_new_privileges,
            container_port: self.container_port,
            base_port: self.base_port,
            vnc_password: self.vnc_password.clone(),
            resolution: self.resolution.clone(),
            os_type: self.os_type.clone(),
            public_host: public_host.to_string(),
            readiness_marker: self.readiness_marker.clone(),
            readiness_timeout: Duration::from_secs(self.readiness_timeout_secs),
            readiness_interval: Duration::from_millis(self.readiness_interval_ms.max(1)),
            log_tail_lines: self.log_tail_lines,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct AuditConfig {
    enabled: bool,
    /// Defaults to `labdesk.db` in the data directory.
    database_path: Option<String>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    if ctx.common.dry_run {
        info!(
            "dry-run: would write default config to {}",
            ctx.paths.config_file.display()
        );
        return Ok(());
    }

    write_default_config(&ctx.paths.config_file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would reset config at {}",
                    ctx.paths.config_file.display()
                );
                return Ok(());
            }
            write_default_config(&ctx.paths.config_file)
        }
    }
}

fn handle_token(ctx: &RuntimeContext, cmd: TokenCommand) -> Result<()> {
    ctx.config
        .auth
        .validate()
        .context("invalid auth configuration")?;

    let auth = AuthState::new(ctx.config.auth.clone());
    let role = if cmd.admin { Role::Admin } else { Role::User };
    let token = auth
        .generate_token(&cmd.user_id, &cmd.name, role)
        .map_err(|e| anyhow!("generating token: {e}"))?;

    println!("{token}");
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext) -> Result<()> {
    let cfg = &ctx.config;

    cfg.auth.validate().context("invalid auth configuration")?;
    if cfg.auth.dev_mode {
        warn!("Running in development mode: X-Dev-User and dev: tokens are accepted");
    }

    let runtime = cfg.container.build();
    info!(
        "Using {} container runtime ({})",
        runtime.runtime_type(),
        runtime.binary()
    );
    match runtime.health_check().await {
        Ok(version) => info!("Container runtime reachable: {}", version.trim()),
        Err(e) => warn!("Container runtime health check failed: {}", e),
    }
    let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(runtime);

    let (audit, audit_store, audit_writer) = if cfg.audit.enabled {
        let db_path = ctx.audit_database_path()?;
        info!("Audit database: {}", db_path.display());
        let db = Database::new(&db_path).await?;
        let store = Arc::new(SqliteAuditStore::new(db.pool().clone()));
        let (publisher, writer) = AuditPublisher::spawn(
            store.clone() as Arc<dyn AuditStore>,
            DEFAULT_AUDIT_CAPACITY,
        );
        (publisher, Some(store), Some(writer))
    } else {
        info!("Audit trail disabled");
        (AuditPublisher::disabled(), None, None)
    };

    let service = Arc::new(DesktopSessionService::new(
        runtime,
        cfg.desktop.service_config(&cfg.server.public_host),
        audit,
    ));

    if cfg.desktop.rediscover_on_startup {
        let report = service.rediscover().await;
        info!(
            "Rediscovery: {} adopted, {} removed, {} skipped",
            report.adopted, report.removed, report.skipped
        );
    }

    let reaper = IdleReaper::new(
        service.clone(),
        Duration::from_secs(cfg.desktop.max_age_secs),
    )
    .spawn(Duration::from_secs(cfg.desktop.reaper_interval_secs.max(1)));

    let mut state = AppState::new(service.clone(), AuthState::new(cfg.auth.clone()));
    if let Some(store) = audit_store {
        state = state.with_audit(store);
    }
    let app = create_app(state);

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .context("parsing server address")?;
    info!("Listening on http://{}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    reaper.abort();

    if cfg.desktop.stop_on_shutdown {
        let stopped = service.shutdown_all().await;
        info!("Stopped {} desktop session(s)", stopped);
    } else {
        info!("Leaving desktop containers running for rediscovery");
    }

    // Dropping the last publisher closes the channel; let the writer drain.
    drop(service);
    if let Some(writer) = audit_writer
        && tokio::time::timeout(Duration::from_secs(5), writer)
            .await
            .is_err()
    {
        warn!("Audit writer did not drain within 5s");
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

fn load_or_init_config(paths: &AppPaths, common: &CommonOpts) -> Result<AppConfig> {
    if !paths.config_file.exists() {
        if common.dry_run {
            info!(
                "dry-run: would create default config at {}",
                paths.config_file.display()
            );
        } else {
            write_default_config(&paths.config_file)?;
        }
    }

    read_config(&paths.config_file)
}

fn read_config(path: &Path) -> Result<AppConfig> {
    let env_prefix = env_prefix();
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix(env_prefix.as_str()).separator("__"))
        .build()?;

    Ok(built.try_deserialize()?)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = default_config_header(path);
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_header(path: &Path) -> String {
    let mut buffer = String::new();
    buffer.push_str("# Configuration for ");
    buffer.push_str(APP_NAME);
    buffer.push('\n');
    buffer.push_str("# File: ");
    buffer.push_str(&path.display().to_string());
    buffer.push('\n');
    buffer.push_str("# Every key can be overridden with LABDESK__SECTION__KEY.\n");
    buffer.push('\n');
    buffer
}

fn expand_path(path: PathBuf) -> Result<PathBuf> {
    if let Some(text) = path.to_str() {
        expand_str_path(text)
    } else {
        Ok(path)
    }
}

fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(text).context("expanding path")?;
    Ok(PathBuf::from(expanded.to_string()))
}

fn default_config_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        let mut path = PathBuf::from(dir);
        path.push(APP_NAME);
        return Ok(path);
    }

    if let Some(mut dir) = dirs::config_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine configuration directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join(APP_NAME));
    }

    if let Some(mut dir) = dirs::data_dir() {
        dir.push(APP_NAME);
        return Ok(dir);
    }

    dirs::home_dir()
        .map(|home| home.join(".local").join("share").join(APP_NAME))
        .ok_or_else(|| anyhow!("unable to determine data directory"))
}

fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        write_default_config(&path).unwrap();
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for labdesk"));

        let cfg = read_config(&path).unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.desktop.base_port, 6900);
        assert_eq!(cfg.desktop.max_age_secs, 7200);
        assert_eq!(cfg.desktop.cap_drop, vec!["ALL".to_string()]);
        assert!(cfg.audit.enabled);
        assert!(!cfg.auth.dev_mode);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[server]
public_host = "labs.example.edu"

[container]
runtime = "podman"

[desktop]
base_port = 7000
readiness_interval_ms = 500
"#,
        )
        .unwrap();

        let cfg = read_config(&path).unwrap();
        assert_eq!(cfg.container.runtime, Some(RuntimeType::Podman));

        let service = cfg.desktop.service_config(&cfg.server.public_host);
        assert_eq!(service.base_port, 7000);
        assert_eq!(service.public_host, "labs.example.edu");
        assert_eq!(service.readiness_interval, Duration::from_millis(500));
        // Untouched keys keep their defaults.
        assert_eq!(service.container_port, 6901);
    }

    #[test]
    fn env_prefix_is_uppercase() {
        assert_eq!(env_prefix(), "LABDESK");
    }
}
