//! Offline verification of transaction log files.
//!
//! Walks a log file line by line, recomputing every block checksum and the
//! whole-file digest. No record is replayed; only the framing is checked.
//! A torn tail (crash before the block trailer made it out) is reported,
//! not treated as corruption.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::service::{AppError, AppResult};

use super::{block_checksum, Seq};

/// One verified block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_seq: Seq,
    /// Committed sequence advertised by the block's commit marker.
    pub committed_seq: Seq,
    /// Last record sequence covered by the block.
    pub last_record_seq: Seq,
    /// Record lines in the block body (header lines for block 0).
    pub record_lines: usize,
}

#[derive(Debug)]
pub struct LogFileSummary {
    pub blocks: Vec<BlockInfo>,
    /// Whether the file ends with the orderly-close trailer.
    pub closed: bool,
    /// Digest advertised by the close trailer, when present.
    pub trailer_digest: Option<String>,
    /// Record lines after the last complete block (torn tail).
    pub trailing_records: usize,
}

pub fn verify_log_file(path: &Path) -> AppResult<LogFileSummary> {
    let bytes = fs::read(path)?;
    verify_log_bytes(&bytes)
}

pub fn verify_log_bytes(bytes: &[u8]) -> AppResult<LogFileSummary> {
    let lines: Vec<&[u8]> = bytes.split_inclusive(|&byte| byte == b'\n').collect();
    let closed = is_closed(&lines);
    let walk_end = if closed { lines.len() - 2 } else { lines.len() };

    let mut blocks = Vec::new();
    let mut rolling_checksum = block_checksum::NULL_CHECKSUM;
    let mut pending_commit: Option<(Seq, Seq)> = None;
    let mut record_lines = 0usize;

    for line in &lines[..walk_end] {
        if let Some((committed_seq, last_record_seq)) = pending_commit {
            if !line.ends_with(b"\n") {
                break;
            }
            let (block_seq, declared) = parse_trailer(line).ok_or_else(|| {
                AppError::CorruptLog(format!(
                    "block {} has no trailer after its commit marker",
                    blocks.len()
                ))
            })?;
            let slash = line.iter().position(|&byte| byte == b'/').unwrap_or(0);
            let computed = block_checksum::update(rolling_checksum, &line[..=slash]);
            if computed != declared {
                return Err(AppError::CorruptLog(format!(
                    "block {} checksum mismatch: computed {:x}, stored {:x}",
                    block_seq, computed, declared
                )));
            }
            blocks.push(BlockInfo {
                block_seq,
                committed_seq,
                last_record_seq,
                record_lines,
            });
            rolling_checksum = block_checksum::line_feed_checksum();
            pending_commit = None;
            record_lines = 0;
            continue;
        }
        if let Some(stripped) = line.strip_prefix(b"c/") {
            let marker = parse_commit_marker(stripped).ok_or_else(|| {
                AppError::CorruptLog("malformed commit marker line".to_string())
            })?;
            rolling_checksum = block_checksum::update(rolling_checksum, line);
            pending_commit = Some(marker);
            continue;
        }
        rolling_checksum = block_checksum::update(rolling_checksum, line);
        record_lines += 1;
    }

    if closed && (pending_commit.is_some() || record_lines > 0) {
        return Err(AppError::CorruptLog(
            "records after the final block trailer".to_string(),
        ));
    }

    let trailer_digest = if closed {
        let digest_line = lines[lines.len() - 1];
        let declared = digest_line
            .strip_prefix(b"checksum/")
            .map(|rest| rest.strip_suffix(b"\n").unwrap_or(rest))
            .and_then(|rest| std::str::from_utf8(rest).ok())
            .ok_or_else(|| AppError::CorruptLog("malformed close trailer".to_string()))?;
        let covered = bytes.len() - digest_line.len();
        let mut digest = Sha256::new();
        digest.update(&bytes[..covered]);
        let digest = digest.finalize();
        let mut computed = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(computed, "{:02x}", byte);
        }
        if computed != declared {
            return Err(AppError::CorruptLog(format!(
                "file digest mismatch: computed {}, stored {}",
                computed, declared
            )));
        }
        Some(computed)
    } else {
        None
    };

    Ok(LogFileSummary {
        blocks,
        closed,
        trailer_digest,
        trailing_records: record_lines + usize::from(pending_commit.is_some()),
    })
}

fn is_closed(lines: &[&[u8]]) -> bool {
    lines.len() >= 2
        && lines[lines.len() - 2].starts_with(b"time/")
        && lines[lines.len() - 1].starts_with(b"checksum/")
        && lines[lines.len() - 1].ends_with(b"\n")
}

/// `<blockSeq>/<checksum>\n`, both hexadecimal.
fn parse_trailer(line: &[u8]) -> Option<(Seq, u32)> {
    let body = line.strip_suffix(b"\n")?;
    let slash = body.iter().position(|&byte| byte == b'/')?;
    let block_seq = parse_hex(&body[..slash])?;
    let checksum = parse_hex(&body[slash + 1..])?;
    if checksum < 0 || checksum > i64::from(u32::MAX) {
        return None;
    }
    Some((block_seq, checksum as u32))
}

/// The `c/` marker carries five `/`-terminated fields:
/// committed, fid seed, error checksum, status, last record sequence.
fn parse_commit_marker(rest: &[u8]) -> Option<(Seq, Seq)> {
    let body = rest.strip_suffix(b"\n").unwrap_or(rest);
    let fields: Vec<&[u8]> = body.split(|&byte| byte == b'/').collect();
    if fields.len() != 6 || !fields[5].is_empty() {
        return None;
    }
    for field in &fields[..5] {
        parse_hex(field)?;
    }
    let committed = parse_hex(fields[0])?;
    let last_record = parse_hex(fields[4])?;
    Some((committed, last_record))
}

fn parse_hex(text: &[u8]) -> Option<i64> {
    if text.is_empty() {
        return None;
    }
    let text = std::str::from_utf8(text).ok()?;
    u64::from_str_radix(text, 16).ok().map(|value| value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;

    /// Builds a minimal well-formed file: header block, one data block,
    /// close trailer.
    fn sample_file() -> Vec<u8> {
        let mut bytes = Vec::new();
        let header = b"version/1\nchecksum/last-line\nsetintbase/16\ntime/2026-08-02T00:00:00.000000Z\nc/63/63/0/0/64/\n";
        bytes.extend_from_slice(header);
        let header_checksum =
            block_checksum::update(block_checksum::update(block_checksum::NULL_CHECKSUM, header), b"0/");
        bytes.extend_from_slice(format!("0/{:x}\n", header_checksum).as_bytes());

        let body = b"mkdir/a\nmkdir/b\nc/63/63/0/0/66/\n";
        let mut checksum = block_checksum::update(block_checksum::line_feed_checksum(), body);
        bytes.extend_from_slice(body);
        checksum = block_checksum::update(checksum, b"1/");
        bytes.extend_from_slice(format!("1/{:x}\n", checksum).as_bytes());

        bytes.extend_from_slice(b"time/2026-08-02T00:00:01.000000Z\n");
        let mut digest = Sha256::new();
        digest.update(&bytes);
        let digest = digest.finalize();
        let mut hex = String::new();
        for byte in digest {
            let _ = write!(hex, "{:02x}", byte);
        }
        bytes.extend_from_slice(format!("checksum/{}\n", hex).as_bytes());
        bytes
    }

    #[test]
    fn verifies_a_well_formed_file() {
        let summary = verify_log_bytes(&sample_file()).expect("verify");
        assert!(summary.closed);
        assert_eq!(summary.trailing_records, 0);
        assert_eq!(summary.blocks.len(), 2);
        assert_eq!(summary.blocks[0].block_seq, 0);
        assert_eq!(summary.blocks[0].record_lines, 4);
        assert_eq!(summary.blocks[1].block_seq, 1);
        assert_eq!(summary.blocks[1].record_lines, 2);
        assert_eq!(summary.blocks[1].committed_seq, 0x63);
        assert_eq!(summary.blocks[1].last_record_seq, 0x66);
        assert!(summary.trailer_digest.is_some());
    }

    #[test]
    fn detects_a_corrupted_record() {
        let mut bytes = sample_file();
        let position = bytes
            .windows(7)
            .position(|window| window == b"mkdir/a")
            .unwrap();
        bytes[position] = b'x';
        match verify_log_bytes(&bytes) {
            Err(AppError::CorruptLog(message)) => {
                assert!(message.contains("checksum mismatch"), "{message}")
            }
            other => panic!("expected corruption, got {:?}", other.map(|s| s.blocks)),
        }
    }

    #[test]
    fn detects_a_digest_mismatch() {
        let mut bytes = sample_file();
        let len = bytes.len();
        // Flip a digit inside the trailing digest.
        let digit = &mut bytes[len - 2];
        *digit = if *digit == b'0' { b'1' } else { b'0' };
        assert!(matches!(
            verify_log_bytes(&bytes),
            Err(AppError::CorruptLog(_))
        ));
    }

    #[test]
    fn torn_tail_is_reported_not_rejected() {
        let mut bytes = sample_file();
        // Drop the close trailer and append an unterminated record.
        let keep = bytes
            .windows(24)
            .position(|window| window == b"time/2026-08-02T00:00:01")
            .unwrap();
        bytes.truncate(keep);
        bytes.extend_from_slice(b"mkdir/partial");
        let summary = verify_log_bytes(&bytes).expect("verify");
        assert!(!summary.closed);
        assert_eq!(summary.blocks.len(), 2);
        assert_eq!(summary.trailing_records, 1);
    }
}
