//! Buffered journal sink.
//!
//! Serialization funnels through this sink, which keeps three things
//! consistent over the same byte stream: the in-memory window holding the
//! block being assembled, the streaming whole-file digest, and a rolling
//! per-block checksum observer that can be switched on and off. In async
//! mode bytes only accumulate in the window; in sync mode they pass
//! through to the [`FileJournal`], so a block is written out atomically by
//! flipping the mode and flushing once.

use bytes::BytesMut;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use super::{block_checksum, FileJournal};

const INITIAL_BUFFER_CAPACITY: usize = 1 << 20;

/// Integer formatting base for textual log records: decimal for the file
/// header, hexadecimal for everything after `setintbase/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntBase {
    Dec,
    Hex,
}

/// Snapshot of the streaming digest, used to resume an existing log file
/// in append mode. The replayer reconstructs it by folding in the file
/// contents it has already scanned.
#[derive(Debug, Clone, Default)]
pub struct DigestState(Sha256);

impl DigestState {
    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }
}

#[derive(Debug)]
pub struct DigestSink {
    journal: FileJournal,
    window: BytesMut,
    digest: Sha256,
    block_checksum: u32,
    update_block_checksum: bool,
    sync: bool,
    base: IntBase,
}

impl DigestSink {
    pub fn new(journal: FileJournal) -> Self {
        Self {
            journal,
            window: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            digest: Sha256::new(),
            block_checksum: block_checksum::NULL_CHECKSUM,
            update_block_checksum: false,
            sync: false,
            base: IntBase::Dec,
        }
    }

    pub fn journal(&self) -> &FileJournal {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut FileJournal {
        &mut self.journal
    }

    /// Appends bytes to the window; in sync mode they are written through
    /// to the journal immediately.
    pub fn write_all(&mut self, bytes: &[u8]) {
        self.window.extend_from_slice(bytes);
        if self.sync {
            self.flush();
        }
    }

    pub fn write_str(&mut self, text: &str) {
        self.write_all(text.as_bytes());
    }

    /// Formats an integer in the current base. Hex mode renders negative
    /// values as their two's-complement u64 bit pattern, matching what the
    /// log replayer parses.
    pub fn write_int(&mut self, value: i64) {
        let text = match self.base {
            IntBase::Dec => format!("{}", value),
            IntBase::Hex => format!("{:x}", value as u64),
        };
        self.write_str(&text);
    }

    /// In sync mode, pushes the window through the digest, the block
    /// checksum observer (when armed), and the journal. In async mode the
    /// window just keeps accumulating the current block.
    pub fn flush(&mut self) {
        if !self.sync || self.window.is_empty() {
            return;
        }
        if self.update_block_checksum {
            self.block_checksum = block_checksum::update(self.block_checksum, &self.window);
        }
        self.digest.update(&self.window);
        self.journal.write_all(&self.window);
        self.window.clear();
    }

    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// The unwritten window: everything appended since the last flush.
    pub fn buffered(&self) -> &[u8] {
        &self.window
    }

    pub fn buffered_len(&self) -> usize {
        self.window.len()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.window.capacity()
    }

    /// Discards the unwritten window (backing out a rejected block).
    pub fn clear_buffer(&mut self) {
        self.window.clear();
    }

    pub fn set_base(&mut self, base: IntBase) {
        self.base = base;
    }

    pub fn base(&self) -> IntBase {
        self.base
    }

    pub fn block_checksum(&self) -> u32 {
        self.block_checksum
    }

    pub fn set_block_checksum(&mut self, checksum: u32) {
        self.block_checksum = checksum;
    }

    pub fn set_update_block_checksum(&mut self, enabled: bool) {
        self.update_block_checksum = enabled;
    }

    /// Begins a new block: async mode, observer armed, checksum seeded.
    pub fn start_block(&mut self, seed: u32) {
        self.sync = false;
        self.update_block_checksum = true;
        self.block_checksum = seed;
    }

    /// Hex digest of everything written through to the journal so far.
    pub fn digest_hex(&self) -> String {
        let digest = self.digest.clone().finalize();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{:02x}", byte);
        }
        hex
    }

    pub fn digest_state(&self) -> DigestState {
        DigestState(self.digest.clone())
    }

    pub fn set_digest_state(&mut self, state: DigestState) {
        self.digest = state.0;
    }

    pub fn reset_digest(&mut self) {
        self.digest = Sha256::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::make_log_name;
    use std::fmt::Write as _;
    use std::fs;
    use tempfile::TempDir;

    fn open_sink(dir: &TempDir) -> (DigestSink, std::path::PathBuf) {
        let path = make_log_name(dir.path(), 0);
        let mut journal = FileJournal::new();
        journal.open_new(&path);
        (DigestSink::new(journal), path)
    }

    #[test]
    fn async_writes_accumulate_until_sync_flush() {
        let dir = TempDir::new().unwrap();
        let (mut sink, path) = open_sink(&dir);

        sink.write_str("mkdir/a\n");
        sink.write_str("mkdir/b\n");
        assert_eq!(sink.buffered(), b"mkdir/a\nmkdir/b\n");
        assert_eq!(fs::read(&path).unwrap(), b"");

        sink.set_sync(true);
        sink.flush();
        assert_eq!(sink.buffered_len(), 0);
        assert_eq!(fs::read(&path).unwrap(), b"mkdir/a\nmkdir/b\n");

        // Sync mode passes subsequent writes straight through.
        sink.write_str("mkdir/c\n");
        assert_eq!(fs::read(&path).unwrap(), b"mkdir/a\nmkdir/b\nmkdir/c\n");
    }

    #[test]
    fn digest_tracks_only_flushed_bytes() {
        let dir = TempDir::new().unwrap();
        let (mut sink, _path) = open_sink(&dir);

        sink.write_str("kept\n");
        sink.set_sync(true);
        sink.flush();
        let after_kept = sink.digest_hex();

        sink.set_sync(false);
        sink.write_str("discarded\n");
        sink.clear_buffer();
        assert_eq!(sink.digest_hex(), after_kept);

        let mut expected = Sha256::new();
        expected.update(b"kept\n");
        let expected = expected.finalize();
        let mut hex = String::new();
        for byte in expected {
            let _ = write!(hex, "{:02x}", byte);
        }
        assert_eq!(after_kept, hex);
    }

    #[test]
    fn digest_state_round_trips() {
        let dir = TempDir::new().unwrap();
        let (mut sink, _path) = open_sink(&dir);
        sink.set_sync(true);
        sink.write_str("first half ");
        let snapshot = sink.digest_state();
        sink.write_str("second half");
        let full = sink.digest_hex();

        let (mut resumed, _path) = open_sink(&dir);
        resumed.set_digest_state(snapshot);
        resumed.set_sync(true);
        resumed.write_str("second half");
        assert_eq!(resumed.digest_hex(), full);
    }

    #[test]
    fn int_base_controls_rendering() {
        let dir = TempDir::new().unwrap();
        let (mut sink, _path) = open_sink(&dir);

        sink.write_int(255);
        sink.set_base(IntBase::Hex);
        sink.write_int(255);
        sink.write_str("/");
        sink.write_int(-1);
        assert_eq!(sink.buffered(), b"255ff/ffffffffffffffff");
    }

    #[test]
    fn block_checksum_observer_folds_flushed_bytes_when_armed() {
        let dir = TempDir::new().unwrap();
        let (mut sink, _path) = open_sink(&dir);

        sink.start_block(block_checksum::NULL_CHECKSUM);
        sink.write_str("payload\n");
        sink.set_sync(true);
        sink.flush();
        assert_eq!(
            sink.block_checksum(),
            block_checksum::update(block_checksum::NULL_CHECKSUM, b"payload\n")
        );

        // Disarmed, the observer keeps its value across flushes.
        sink.set_update_block_checksum(false);
        let frozen = sink.block_checksum();
        sink.write_str("trailer\n");
        assert_eq!(sink.block_checksum(), frozen);
    }
}
