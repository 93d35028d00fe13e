pub mod backplane;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod stores;
pub mod websocket;

pub use error::{AppError, AppResult};
pub use state::AppState;
