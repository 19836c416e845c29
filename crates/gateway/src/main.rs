use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use sa_engine::provider::{MockAdapter, MockBehavior, OpenAiCompatAdapter, ProviderAdapter};
use sa_engine::{
    Config, EventBus, FileTimeGuard, FsStorage, Identifier, PendingTurnTable, PermissionGate,
    SessionEngine, SessionStore, ToolRegistry,
};
use sa_gateway::app_state::AppState;
use sa_gateway::cli::{Cli, Command};
use sa_gateway::routes::build_router;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        None => run_server("config.toml".into(), None).await,
        Some(Command::Serve { config, port }) => run_server(config, port).await,
    }
}

/// Initializes the `tracing` subscriber with env-filter + json formatting,
/// plus an OTLP export layer when `OTEL_EXPORTER_OTLP_ENDPOINT` is set so
/// local runs and tests never require a collector.
fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sa_gateway=debug"));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json());

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        match build_otel_layer() {
            Ok(otel_layer) => {
                registry.with(otel_layer).init();
                return;
            }
            Err(err) => {
                eprintln!("failed to initialize OTLP exporter, continuing without it: {err}");
            }
        }
    }
    registry.init();
}

fn build_otel_layer() -> anyhow::Result<impl tracing_subscriber::Layer<tracing_subscriber::Registry>> {
    use opentelemetry::trace::TracerProvider as _;

    let exporter = opentelemetry_otlp::SpanExporter::builder().with_tonic().build()?;
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build();
    let tracer = provider.tracer("sa-gateway");
    opentelemetry::global::set_tracer_provider(provider);
    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

async fn run_server(config_path: std::path::PathBuf, port_override: Option<u16>) -> anyhow::Result<()> {
    let mut config = Config::load(&config_path);
    if let Some(port) = port_override {
        config.server.port = port;
    }
    let config = Arc::new(config);

    let workspace_root = config
        .workspace
        .path
        .canonicalize()
        .unwrap_or_else(|_| config.workspace.path.clone());
    std::fs::create_dir_all(&config.workspace.state_path).ok();

    let events = Arc::new(EventBus::default());
    let ids = Arc::new(Identifier::new());
    let storage = Arc::new(FsStorage::new(config.workspace.state_path.clone(), events.clone()));
    let store = Arc::new(SessionStore::new(storage, events.clone(), ids.clone()));
    store.load_all().await.context("loading persisted sessions")?;

    let permission_gate = Arc::new(PermissionGate::new(events.clone()));
    let file_guard = Arc::new(FileTimeGuard::new());
    let tools = Arc::new(ToolRegistry::new(
        workspace_root.clone(),
        file_guard,
        permission_gate.clone(),
        ids.clone(),
    ));

    let providers: HashMap<String, Arc<dyn ProviderAdapter>> = build_providers();
    let pending = Arc::new(PendingTurnTable::new());

    let engine = Arc::new(SessionEngine::new(
        store.clone(),
        tools,
        providers,
        events.clone(),
        ids,
        pending,
        config.permissions.auto_share,
    ));

    let state = AppState::new(
        config.clone(),
        engine,
        store,
        events,
        permission_gate,
        workspace_root,
    );

    let app = build_router(state)
        .layer(ConcurrencyLimitLayer::new(64))
        .layer(build_cors_layer(&config.server.cors));

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "gateway listening");
    axum::serve(listener, app).await.context("axum server error")?;
    Ok(())
}

/// `mock` is always available for local development and tests. An
/// OpenAI-compatible provider is registered additionally when the
/// corresponding environment variables are present.
fn build_providers() -> HashMap<String, Arc<dyn ProviderAdapter>> {
    let mut providers: HashMap<String, Arc<dyn ProviderAdapter>> = HashMap::new();
    providers.insert(
        "mock".to_string(),
        Arc::new(MockAdapter::new("mock", MockBehavior::UppercaseEcho)),
    );

    if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        providers.insert(
            "openai".to_string(),
            Arc::new(OpenAiCompatAdapter::new("openai", base_url, api_key, model)),
        );
    }

    providers
}

/// Build a [`CorsLayer`] from the configured allowed origins.
fn build_cors_layer(cors: &sa_engine::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();
    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
