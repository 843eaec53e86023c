pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Journal stream failure latched by the file layer; `code` is the
    /// negative wire errno recorded there.
    #[error("journal i/o failure: {path}: error code {code}")]
    JournalIo { path: String, code: i32 },

    #[error("transmitter parameter error: {0}")]
    TransmitterConfig(String),

    #[error("corrupt log file: {0}")]
    CorruptLog(String),
}
