//! # Staffline Binary
//!
//! The entry point that assembles the relay based on compile-time features.

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use sl_api::handlers::AppState;
use sl_config::Settings;
use sl_core::models::UserId;
use sl_core::Relay;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Feature-gated imports: the binary is compiled to order.
#[cfg(feature = "db-sqlite")]
use sl_db_sqlite::SqliteStore;

#[cfg(feature = "auth-simple")]
use sl_auth_simple::SimpleOperatorAuth;

#[cfg(feature = "transport-http")]
use sl_transport_http::HttpTransport;

#[cfg(not(all(feature = "db-sqlite", feature = "auth-simple", feature = "transport-http")))]
compile_error!("staffline needs a store, an auth and a transport plugin; enable the default features");

/// Installs the subscriber. An unparseable level falls back to `info`.
fn init_tracing(settings: &Settings) {
    let (filter, invalid) = match EnvFilter::try_new(&settings.log_level) {
        Ok(filter) => (filter, false),
        Err(_) => (EnvFilter::new("info"), true),
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if settings.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
    if invalid {
        warn!(level = %settings.log_level, "invalid log level, using info");
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    init_tracing(&settings);
    let addr = settings.listen_addr()?;
    let Settings {
        database_url,
        gateway_url,
        gateway_token,
        bot_id,
        operator_key_hash,
        ..
    } = settings;

    // 1. Initialize Database Implementation
    let store = Arc::new(
        SqliteStore::new(&database_url)
            .await
            .with_context(|| format!("opening {database_url}"))?,
    );

    // 2. Initialize Gateway Transport
    let transport = HttpTransport::new(gateway_url, gateway_token, UserId(bot_id))?;

    // 3. Relay core; recovery runs before anything is served.
    let relay = Relay::new(Arc::new(transport), store.clone(), store);
    let worker = relay.start().await.context("relay startup failed")?;

    // 4. Wrap in AppState (Using dynamic dispatch for maximum flexibility)
    let state = web::Data::new(AppState {
        relay,
        auth: Box::new(SimpleOperatorAuth::new()),
        operator_key_hash,
    });
    if state.operator_key_hash.is_none() {
        warn!("no operator key hash configured, operator routes are disabled");
    }

    info!(%addr, "🚀 Staffline listening");

    HttpServer::new(move || {
        App::new()
            .wrap(sl_api::middleware::standard_middleware())
            .wrap(sl_api::middleware::cors_policy())
            .app_data(state.clone())
            .configure(sl_api::configure_routes)
    })
    .bind(addr)?
    .run()
    .await?;

    worker.abort();
    info!("Staffline stopped");
    Ok(())
}
