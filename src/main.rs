use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use fleet_inventory::AppState;
use fleet_inventory::config::Config;
use fleet_inventory::handlers::{devices, filters, groups, health, tenants};
use fleet_inventory::migrations::Migrator;
use fleet_inventory::monitoring::MonitoringClient;
use fleet_inventory::reporting::ReportingClient;
use fleet_inventory::service::{InventoryService, ScopeLimits};
use fleet_inventory::store::MongoStore;

// exit codes: 1 configuration, 3 database/migration, 4 server runtime
const EXIT_CONFIG: i32 = 1;
const EXIT_DATABASE: i32 = 3;
const EXIT_SERVER: i32 = 4;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("fleet_inventory=debug,tower_http=debug")
        }))
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e:#}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    if let Err(code) = run(config).await {
        std::process::exit(code);
    }
}

async fn run(config: Config) -> Result<(), i32> {
    let client = config.mongo_client().await.map_err(|e| {
        tracing::error!("database connection failed: {e:#}");
        EXIT_DATABASE
    })?;

    let migrator = Migrator::new(client.clone(), &config.db_name, config.automigrate);
    migrator.migrate_all().await.map_err(|e| {
        tracing::error!("migrations failed: {e}");
        EXIT_DATABASE
    })?;

    let store = MongoStore::new(client, &config.db_name);
    let setup = async {
        store.refresh_layout().await?;
        store.ensure_indexes(&config.db_name).await
    };
    setup.await.map_err(|e| {
        tracing::error!("store initialization failed: {e}");
        EXIT_DATABASE
    })?;

    let limits = ScopeLimits {
        attributes: config.limit_attributes,
        tags: config.limit_tags,
    };
    let mut service = InventoryService::new(store, limits);
    if config.enable_reporting {
        let Some(addr) = &config.orchestrator_addr else {
            tracing::error!("enable_reporting is set but orchestrator_addr is not");
            return Err(EXIT_CONFIG);
        };
        let reporting = ReportingClient::new(addr).map_err(|e| {
            tracing::error!("reporting client setup failed: {e}");
            EXIT_CONFIG
        })?;
        service = service.with_reporting(reporting);
        tracing::info!("reporting reindex enabled via {addr}");
    }
    if let Some(addr) = &config.devicemonitor_addr {
        let monitoring = MonitoringClient::new(addr).map_err(|e| {
            tracing::error!("monitoring client setup failed: {e}");
            EXIT_CONFIG
        })?;
        service = service.with_monitoring(monitoring);
    }

    let state = AppState {
        service: Arc::new(service),
    };

    let app = Router::new()
        // Device management
        .route(
            "/devices",
            get(devices::list_devices).post(devices::add_device),
        )
        .route("/devices/attributes", patch(devices::patch_device_attributes))
        .route(
            "/devices/{id}",
            get(devices::get_device).delete(devices::delete_device),
        )
        .route(
            "/devices/{id}/group",
            get(groups::get_device_group).put(groups::put_device_group),
        )
        .route(
            "/devices/{id}/group/{name}",
            delete(groups::delete_device_group),
        )
        .route(
            "/devices/{id}/tags",
            patch(devices::patch_tags).put(devices::put_tags),
        )
        .route("/devices/{id}/alerts", get(devices::get_device_alerts))
        // Groups
        .route("/groups", get(groups::list_groups))
        .route("/groups/{name}", delete(groups::delete_group))
        .route(
            "/groups/{name}/devices",
            get(groups::list_devices_by_group)
                .patch(groups::assign_group_devices)
                .delete(groups::clear_group_devices),
        )
        // Search
        .route("/filters/search", post(filters::search_devices))
        .route("/filters/attributes", get(filters::get_filters_attributes))
        // Internal
        .route("/tenants", post(tenants::create_tenant))
        .route(
            "/tenants/{tenant_id}/devices/status/{status}",
            post(tenants::update_devices_status),
        )
        // Health
        .route("/health", get(health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("fleet-inventory listening on {}", config.listen);
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .map_err(|e| {
            tracing::error!("cannot bind {}: {e}", config.listen);
            EXIT_SERVER
        })?;
    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!("server failed: {e}");
        EXIT_SERVER
    })?;

    Ok(())
}
