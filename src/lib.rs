pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod migrations;
pub mod models;
pub mod monitoring;
pub mod query_builder;
pub mod reporting;
pub mod service;
pub mod store;
pub mod tenant;

use std::sync::Arc;

use service::InventoryService;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<InventoryService>,
}
