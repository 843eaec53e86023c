mod app_error;
mod config;
pub mod errcode;
mod tracing_config;

pub use app_error::{AppError, AppResult};
pub use config::Properties;
pub use tracing_config::setup_local_tracing;
