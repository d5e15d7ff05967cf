pub mod access;
pub mod api;
pub mod billing;
pub mod cache;
pub mod core;
pub mod entities;
pub mod provider;
pub mod security;
pub mod sweepers;

pub use crate::core::config::AppConfig;
pub use crate::core::shared::state::AppState;
