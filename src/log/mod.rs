//! Metaserver transaction log.
//!
//! This module is the durability and replication pipeline of the
//! metaserver: metadata mutations are ordered, batched into checksummed
//! blocks, appended to a rotating on-disk journal, and shipped to replica
//! followers. Requests are acknowledged only once their block is both
//! locally durable and replicated.

pub mod block_checksum;
mod digest_sink;
mod file_journal;
pub mod inspect;
mod log_writer;
mod request;

pub use digest_sink::{DigestSink, DigestState, IntBase};
pub use file_journal::{make_log_name, FileJournal};
pub use log_writer::{AppendState, CommitObserver, LogWriter, StartOptions};
pub use request::{
    ControlKind, LogQueueCounter, LogRecord, LogRequest, LogWriterControl, RequestBody,
    RequestQueue,
};

/// Log sequence number: dense, gap-free, monotone 64-bit identifier of a
/// single metadata record. Also used for block and file numbering.
pub type Seq = i64;

/// Version stamp written into every log file header.
pub const LOG_FILE_VERSION: i32 = 1;

pub(crate) const LOG_FILE_PREFIX: &str = "log";

/// Whether a request contributes a record to the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    /// Never logged; the request is handed straight back to the caller.
    Never,
    /// Logged only when the request succeeded so far (`status == 0`).
    IfOk,
    /// Always logged, regardless of status.
    Always,
}

/// The committed prefix of the log: the four-tuple advertised in every
/// block's commit marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitState {
    pub seq: Seq,
    pub fid_seed: i64,
    pub err_checksum: i64,
    pub status: i32,
}

impl Default for CommitState {
    fn default() -> Self {
        Self {
            seq: -1,
            fid_seed: -1,
            err_checksum: 0,
            status: 0,
        }
    }
}

/// Thread-safe wakeup of the event loop that delivers completed requests.
pub trait EventLoop: Send + Sync {
    fn wakeup(&self);
}

/// Sink completed requests are submitted back through.
pub trait RequestSink {
    fn submit(&mut self, request: Box<LogRequest>);
}

pub(crate) fn iso_timestamp_utc() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S%.6fZ")
        .to_string()
}
