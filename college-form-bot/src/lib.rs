pub mod config;
pub mod service;

pub use config::ServiceConfig;
pub use service::{AppState, build_router, create_app_state, spawn_idle_purge};
