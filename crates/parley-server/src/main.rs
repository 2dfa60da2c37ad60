mod janitor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::auth::{AppState, AppStateInner};
use parley_api::middleware::decode_token;
use parley_chat::notify::{NotificationDispatcher, TracingNotifier, WebhookNotifier};
use parley_chat::{ChatConfig, ChatService};
use parley_db::Database;
use parley_gateway::connection;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

/// How often stale typing rows are swept out of the store.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,parley_api=debug,parley_chat=debug,parley_db=debug,parley_gateway=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret = std::env::var("PARLEY_JWT_SECRET").unwrap_or_default();
    if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
        eprintln!("FATAL: PARLEY_JWT_SECRET is unset or still a placeholder.");
        eprintln!("       It must match the identity provider's signing secret.");
        eprintln!("       Set it in your .env file and restart.");
        std::process::exit(1);
    }

    let db_path: PathBuf = std::env::var("PARLEY_DB_PATH")
        .unwrap_or_else(|_| "parley.db".into())
        .into();
    let host = std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("PARLEY_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;
    let chat_config = ChatConfig::from_env();

    // Init database
    let db = Arc::new(Database::open(&db_path)?);

    // Push notifications go to a webhook when one is configured
    let notifier: Arc<dyn NotificationDispatcher> = match std::env::var("PARLEY_NOTIFY_URL") {
        Ok(url) if !url.is_empty() => {
            info!("Notifications will be POSTed to {}", url);
            Arc::new(WebhookNotifier::new(url)?)
        }
        _ => Arc::new(TracingNotifier),
    };

    let chat = ChatService::new(db, notifier, chat_config);

    // Background janitor for stale typing rows
    tokio::spawn(janitor::run_presence_janitor(chat.clone(), JANITOR_INTERVAL));

    let app_state: AppState = Arc::new(AppStateInner { chat, jwt_secret });

    let ws_route = Router::new()
        .route("/gateway", get(ws_upgrade))
        .with_state(app_state.clone());

    let app = Router::new()
        .merge(parley_api::router(app_state))
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// The token travels as a query parameter because browsers cannot set
/// headers on a WebSocket upgrade.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match decode_token(&state.jwt_secret, &query.token) {
        Ok(claims) => claims,
        Err(status) => return status.into_response(),
    };

    let chat = state.chat.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, chat, claims))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
