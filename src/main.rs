use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;

use llmgate::config::{GatewayConfig, VendorSeedFile};
use llmgate::server::config_routes;
use llmgate::store::StoreBackend;
use llmgate::util::{cors_config_from_env, init_tracing, AppState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let config = GatewayConfig::parse();
    tracing::debug!(?config, "Configuration loaded");

    let spec = config.store_spec()?;
    let store = spec
        .open()
        .await
        .with_context(|| format!("failed to open store '{}'", config.store))?;
    tracing::info!("Vendor store: {}", store.name());

    let state = AppState::from_config(&config, store)?;

    if let Some(path) = config.vendors_file.as_deref() {
        let specs = VendorSeedFile::load(path)?.into_specs();
        let total = specs.len();
        let applied = state.registry.seed(specs).await;
        tracing::info!("Seeded {}/{} vendors from {}", applied, total, path);
    }
    if state.admin_token.is_none() {
        tracing::info!("Admin routes disabled (no LLMGATE_ADMIN_TOKEN)");
    }

    let bind_addr = config.bind_addr.clone();
    tracing::info!("llmgate listening on {}", bind_addr);

    let data = web::Data::new(state);
    HttpServer::new(move || {
        App::new()
            .wrap(cors_config_from_env())
            .app_data(data.clone())
            .configure(config_routes)
    })
    .bind(&bind_addr)
    .with_context(|| format!("failed to bind {bind_addr}"))?
    .run()
    .await
    .context("server error")
}
