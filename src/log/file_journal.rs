//! Ownership of the current on-disk log file: append, fsync discipline,
//! and the stable `last` link maintained across rotations.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use tracing::error;

use crate::service::errcode::{self, wire_errno_of};

use super::{Seq, LOG_FILE_PREFIX};

/// Builds the numbered log file path `<dir>/log.<num>`.
pub fn make_log_name(dir: &Path, num: Seq) -> PathBuf {
    dir.join(format!("{}.{}", LOG_FILE_PREFIX, num))
}

/// The journal file handle. I/O failures are latched as a negative wire
/// errno and keep the stream bad until the next rotation opens a fresh
/// file; every write in between is dropped.
#[derive(Debug, Default)]
pub struct FileJournal {
    file: Option<File>,
    path: PathBuf,
    sync: bool,
    panic_on_io_error: bool,
    error: i32,
}

impl FileJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Latched error code; zero when the stream is healthy.
    pub fn error(&self) -> i32 {
        self.error
    }

    pub fn is_good(&self) -> bool {
        self.error == 0 && self.file.is_some()
    }

    pub fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    pub fn set_panic_on_io_error(&mut self, flag: bool) {
        self.panic_on_io_error = flag;
    }

    /// Latches a failure that did not come from the descriptor itself; the
    /// stream stays bad until the next rotation.
    pub fn mark_failed(&mut self) {
        if self.error == 0 {
            self.error = -errcode::EIO;
        }
    }

    /// Creates (or truncates) a fresh log file and clears the error latch.
    pub fn open_new(&mut self, path: &Path) {
        self.close();
        self.error = 0;
        self.path = path.to_path_buf();
        match OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
        {
            Ok(file) => self.file = Some(file),
            Err(err) => self.io_error(&err, "failed to create log file"),
        }
    }

    /// Opens an existing log file positioned at its end; returns the size,
    /// or -1 with the error latched.
    pub fn open_append(&mut self, path: &Path) -> i64 {
        self.close();
        self.error = 0;
        self.path = path.to_path_buf();
        let opened = OpenOptions::new().write(true).open(path).and_then(|mut file| {
            let size = file.seek(SeekFrom::End(0))?;
            Ok((file, size))
        });
        match opened {
            Ok((file, size)) => {
                self.file = Some(file);
                size as i64
            }
            Err(err) => {
                self.io_error(&err, "failed to open log file for append");
                -1
            }
        }
    }

    /// Writes the whole range; short writes are retried, failures latched.
    pub fn write_all(&mut self, bytes: &[u8]) {
        if !self.is_good() || bytes.is_empty() {
            return;
        }
        let result = match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => return,
        };
        if let Err(err) = result {
            self.io_error(&err, "log write failed");
        }
    }

    /// Fsyncs iff the `sync` parameter is enabled.
    pub fn maybe_fsync(&mut self) {
        if !self.sync || !self.is_good() {
            return;
        }
        let result = match self.file.as_ref() {
            Some(file) => file.sync_all(),
            None => return,
        };
        if let Err(err) = result {
            self.io_error(&err, "log fsync failed");
        }
    }

    /// Closes the current file; idempotent.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Atomically repoints the stable `last` link at the just-closed file:
    /// a staging symlink is renamed over the link path.
    pub fn link_latest(&mut self, target: &Path, link_path: &Path) {
        let target_name: PathBuf = match target.file_name() {
            Some(name) => PathBuf::from(name),
            None => target.to_path_buf(),
        };
        let staging = link_path.with_extension("tmp");
        let result = (|| {
            let _ = fs::remove_file(&staging);
            symlink(&target_name, &staging)?;
            fs::rename(&staging, link_path)
        })();
        if let Err(err) = result {
            let context = format!("failed to link to: {}", link_path.display());
            self.io_error(&err, &context);
        }
    }

    fn io_error(&mut self, err: &std::io::Error, context: &str) {
        let code = wire_errno_of(err);
        self.error = -code.max(1);
        error!(
            "transaction log writer error: {}: {}: {}",
            self.path.display(),
            context,
            err
        );
        if self.panic_on_io_error {
            panic!(
                "transaction log io failure: {}: {}",
                self.path.display(),
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn make_log_name_is_numbered() {
        let name = make_log_name(Path::new("/tmp/meta"), 42);
        assert_eq!(name, PathBuf::from("/tmp/meta/log.42"));
    }

    #[test]
    fn open_write_close_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = make_log_name(dir.path(), 0);
        let mut journal = FileJournal::new();
        assert!(!journal.is_good());

        journal.open_new(&path);
        assert!(journal.is_good());
        journal.write_all(b"version/1\n");
        journal.close();
        assert!(!journal.is_open());
        journal.close();

        assert_eq!(fs::read(&path).unwrap(), b"version/1\n");
    }

    #[test]
    fn append_reports_size_and_rejects_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = make_log_name(dir.path(), 0);
        fs::write(&path, b"abc\n").unwrap();

        let mut journal = FileJournal::new();
        assert_eq!(journal.open_append(&path), 4);
        assert!(journal.is_good());
        journal.write_all(b"def\n");
        journal.close();
        assert_eq!(fs::read(&path).unwrap(), b"abc\ndef\n");

        let missing = make_log_name(dir.path(), 9);
        assert_eq!(journal.open_append(&missing), -1);
        assert_eq!(journal.error(), -errcode::ENOENT);
    }

    #[test]
    fn mark_failed_clears_on_reopen() {
        let dir = TempDir::new().unwrap();
        let path = make_log_name(dir.path(), 0);
        let mut journal = FileJournal::new();
        journal.open_new(&path);
        journal.mark_failed();
        assert!(!journal.is_good());
        journal.write_all(b"dropped");
        journal.open_new(&path);
        assert!(journal.is_good());
        journal.close();
        assert_eq!(fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn link_latest_repoints_the_stable_link() {
        let dir = TempDir::new().unwrap();
        let first = make_log_name(dir.path(), 0);
        let second = make_log_name(dir.path(), 1);
        fs::write(&first, b"a").unwrap();
        fs::write(&second, b"b").unwrap();
        let link = dir.path().join("last");

        let mut journal = FileJournal::new();
        journal.link_latest(&first, &link);
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("log.0"));
        journal.link_latest(&second, &link);
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("log.1"));
        assert_eq!(fs::read(&link).unwrap(), b"b");
    }
}
