use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::http::HeaderValue;
use std::path::Path;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use triangulate::{
    api,
    cli::{output::Output, Cli, Commands, EscalationCommands},
    utils::toml_config::{ConfigError, LogFormat, ServerConfig},
    ApiMetrics, AppState, ConfigManager, EscalationQueue, FileEscalationQueue, Gateways,
    Orchestrator, TriangulateConfig,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let Cli {
        config,
        verbose,
        no_color,
        command,
    } = Cli::parse_args();
    let output = if no_color {
        Output::no_color()
    } else {
        Output::new()
    };

    match command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config, verbose, &output).await,
        Commands::Config { validate } => config_command(&config, validate, &output),
        Commands::Escalations(cmd) => escalations_command(&config, cmd, &output).await,
    }
}

// ============= Server =============

async fn serve(config_path: &Path, verbose: bool, output: &Output) -> anyhow::Result<()> {
    let config_manager = match ConfigManager::new(config_path) {
        Ok(manager) => manager,
        Err(ConfigError::FileNotFound(path)) => {
            output.warning(&format!(
                "{} not found, starting with built-in defaults",
                path.display()
            ));
            output.hint("Pass --config <path> to load a configuration file");
            ConfigManager::from_config(TriangulateConfig::default())
        }
        Err(e) => return Err(e).context("failed to load configuration"),
    };
    let config = config_manager.config();

    init_tracing(&config.server, verbose);
    output.banner();

    for warning in config.validate_with_warnings()? {
        warn!("{}", warning);
    }

    if config_manager.path().exists() {
        config_manager
            .watch()
            .context("failed to watch configuration file")?;
    }

    let gateways = Gateways::from_config(&config)?;
    info!(gateways = ?gateways, "Gateways configured");

    let queue: Arc<dyn EscalationQueue> = Arc::new(
        FileEscalationQueue::open(&config.escalation.queue_dir)
            .await
            .context("failed to open escalation queue")?,
    );

    let config_manager = Arc::new(config_manager);
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&config_manager),
        gateways,
        queue,
    ));
    let metrics = Arc::new(ApiMetrics::new().context("failed to register metrics")?);
    let state = AppState::new(config_manager, orchestrator, metrics);

    let app = api::routes::build_app(state)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(config.server.max_body_bytes))
        .layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    output.success(&format!("Listening on http://{}", addr));
    info!(%addr, "Server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failure")?;

    info!("Server stopped");
    Ok(())
}

fn init_tracing(server: &ServerConfig, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        server.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "triangulate={level},triangulate_server={level},tower_http={level}"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    match server.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Any origin when none are configured.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
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
                warn!("Failed to listen for SIGTERM: {}", e);
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

// ============= Operator Commands =============

fn config_command(config_path: &Path, validate: bool, output: &Output) -> anyhow::Result<()> {
    output.header("Configuration");
    output.kv("file", &config_path.display().to_string());

    let config = match TriangulateConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            output.error(&e.to_string());
            return Err(e.into());
        }
    };

    output.kv("listen", &format!("{}:{}", config.server.host, config.server.port));
    output.kv("escalation queue", &config.escalation.queue_dir.display().to_string());
    output.kv(
        "thresholds",
        &format!(
            "high >= {}, medium >= {}",
            config.confidence.high_threshold, config.confidence.medium_threshold
        ),
    );
    output.kv(
        "contradiction",
        &format!(
            "delta {}, penalty {}",
            config.merge.contradiction_delta, config.merge.contradiction_penalty
        ),
    );

    if validate {
        let warnings = config.validate_with_warnings()?;
        if warnings.is_empty() {
            output.success("Configuration is valid");
        } else {
            for warning in &warnings {
                output.warning(&warning.message);
            }
            output.success(&format!("Configuration is valid ({} warning(s))", warnings.len()));
        }
    }
    Ok(())
}

/// Load the config for offline commands, falling back to defaults.
fn load_or_default(config_path: &Path, output: &Output) -> anyhow::Result<TriangulateConfig> {
    match TriangulateConfig::load(config_path) {
        Ok(config) => Ok(config),
        Err(ConfigError::FileNotFound(path)) => {
            output.info(&format!("{} not found, using defaults", path.display()));
            Ok(TriangulateConfig::default())
        }
        Err(e) => Err(e).context("failed to load configuration"),
    }
}

async fn escalations_command(
    config_path: &Path,
    command: EscalationCommands,
    output: &Output,
) -> anyhow::Result<()> {
    let config = load_or_default(config_path, output)?;
    let queue = FileEscalationQueue::open(&config.escalation.queue_dir)
        .await
        .context("failed to open escalation queue")?;

    match command {
        EscalationCommands::List { status } => {
            let items = queue.list(status).await?;
            output.header(&format!("Escalations ({})", items.len()));
            if items.is_empty() {
                output.info("Queue is empty");
                return Ok(());
            }
            output.escalation_header();
            for item in &items {
                output.escalation_row(item);
            }
        }
        EscalationCommands::Show { id } => {
            let item = queue.get(id).await?;
            output.escalation_detail(&item);
        }
        EscalationCommands::Transition { id, status, note } => {
            match queue.transition(id, status, note).await {
                Ok(item) => output.success(&format!("Escalation {} is now {}", item.id, item.status)),
                Err(e) => {
                    output.error(&e.to_string());
                    return Err(e.into());
                }
            }
        }
        EscalationCommands::Stats => {
            let stats = queue.stats().await?;
            output.queue_stats(&stats);
        }
    }
    Ok(())
}
