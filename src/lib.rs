pub mod log;
pub mod replica;
pub mod service;

pub use log::LogWriter;
pub use service::{AppError, AppResult, Properties};
