//! Replica transmitter contract.
//!
//! The writer hands every flushed block to the transmitter, which ships it
//! to follower metaservers and reports replication progress back through
//! the [`CommitObserver`]. Quorum logic lives with the transmitter; the
//! writer only reacts to the acknowledged watermark.

use crate::log::{CommitObserver, Seq};
use crate::service::{AppResult, Properties};

pub trait LogTransmitter: Send {
    /// Applies the `<prefix>*` settings. A failure here aborts writer
    /// startup (and is logged but ignored on runtime re-application).
    fn set_parameters(&mut self, prefix: &str, params: &Properties) -> AppResult<()>;

    /// Receives the callback replication progress is reported through.
    fn set_commit_observer(&mut self, observer: CommitObserver) {
        let _ = observer;
    }

    fn is_up(&self) -> bool;

    /// Submits one framed block covering records up to `end_seq`.
    /// `checksum` covers the first `checksum_len` bytes of `block`.
    /// Returns 0 when the block was accepted for transmission.
    fn transmit_block(
        &mut self,
        end_seq: Seq,
        record_count: i32,
        block: &[u8],
        checksum: u32,
        checksum_len: usize,
    ) -> i32;
}

/// Transmitter for single-node deployments: every block counts as
/// replicated the moment it is submitted.
#[derive(Debug, Default)]
pub struct NullTransmitter {
    observer: Option<CommitObserver>,
}

impl NullTransmitter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogTransmitter for NullTransmitter {
    fn set_parameters(&mut self, _prefix: &str, _params: &Properties) -> AppResult<()> {
        Ok(())
    }

    fn set_commit_observer(&mut self, observer: CommitObserver) {
        self.observer = Some(observer);
    }

    fn is_up(&self) -> bool {
        true
    }

    fn transmit_block(
        &mut self,
        end_seq: Seq,
        _record_count: i32,
        _block: &[u8],
        _checksum: u32,
        _checksum_len: usize,
    ) -> i32 {
        if let Some(observer) = &self.observer {
            observer.notify(end_seq);
        }
        0
    }
}
