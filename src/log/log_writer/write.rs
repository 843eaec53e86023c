//! Serialization half of the worker: the batching loop, block framing,
//! externally framed block splicing, and log file rotation.

use std::time::Instant;

use rand::Rng;
use tracing::{debug, error, warn};

use crate::log::{
    block_checksum, iso_timestamp_utc, make_log_name, ControlKind, IntBase, LogRequest,
    RequestBody, RequestQueue, Seq, LOG_FILE_VERSION,
};
use crate::service::errcode;
use crate::service::Properties;

use super::Worker;

impl Worker {
    pub(super) fn is_stream_good(&self) -> bool {
        self.sink.journal().is_good()
    }

    fn is_simulate_failure(&mut self) -> bool {
        let interval = self.params.failure_simulation_interval;
        interval > 0 && self.rng.gen_range(0..interval) == 0
    }

    fn log_error(request: &mut LogRequest) {
        request.logseq = -1;
        request.status = -errcode::ELOGFAILED;
        request.status_msg = "transaction log write error".into();
    }

    /// Serializes the queue in block-sized batches. Every request passes
    /// through exactly once and is returned for ack processing.
    pub(super) fn write(&mut self, mut queue: RequestQueue) -> RequestQueue {
        let mut processed = RequestQueue::new();
        while !queue.is_empty() {
            if !self.is_stream_good() {
                // Recover by rotating away from the bad file; a file with
                // no records yet is recreated in place instead.
                if self.cur_log_start_seq < self.next_log_seq {
                    self.start_next_log();
                } else {
                    self.new_log(self.next_log_seq);
                }
            }
            self.sink.set_sync(false);
            self.last_log_seq = self.next_log_seq;
            let batch_start = processed.len();
            let mut end_block_seq = self.next_log_seq + self.params.max_block_size;
            let simulate_failure = self.is_simulate_failure();
            let transmitter_up = self.observer.is_up();
            let mut failure_fired = false;
            let mut write_block_pending = false;

            while let Some(mut request) = queue.pop_front() {
                if request.is_control() {
                    let end_batch = self.control(&mut request);
                    let is_write_block = request
                        .control()
                        .map_or(false, |control| control.kind == ControlKind::WriteBlock);
                    processed.push_back(request);
                    if end_batch {
                        write_block_pending = is_write_block;
                        break;
                    }
                    end_block_seq = self.next_log_seq + self.params.max_block_size;
                    continue;
                }
                if !self.is_stream_good() || !transmitter_up {
                    processed.push_back(request);
                    continue;
                }
                if request.wants_log() {
                    if simulate_failure {
                        error!(seqno = request.seqno, "log writer: simulating write error");
                        failure_fired = true;
                        processed.push_back(request);
                        break;
                    }
                    self.last_log_seq += 1;
                    request.logseq = self.last_log_seq;
                    let serialized = match &request.body {
                        RequestBody::Record(record) => {
                            record.write_log(&mut self.sink, self.params.omit_defaults)
                        }
                        RequestBody::Control(_) => unreachable!("control handled above"),
                    };
                    if !serialized {
                        panic!("log writer: invalid request");
                    }
                    if !self.is_stream_good() {
                        self.last_log_seq -= 1;
                        Self::log_error(&mut request);
                    }
                }
                processed.push_back(request);
                if end_block_seq <= self.last_log_seq {
                    break;
                }
                if self.sink.buffered_len() * 4 > self.sink.buffer_capacity() * 3 {
                    break;
                }
            }

            if self.next_log_seq < self.last_log_seq && transmitter_up && self.is_stream_good() {
                self.flush_block(self.last_log_seq);
            }
            if self.is_stream_good() && !simulate_failure && transmitter_up {
                self.next_log_seq = self.last_log_seq;
            } else {
                self.last_log_seq = self.next_log_seq;
                for request in processed.iter_mut_from(batch_start) {
                    if !request.is_control() && request.wants_log() {
                        Self::log_error(request);
                    }
                }
                if failure_fired {
                    // Treat the simulated failure like a real one: the
                    // stream goes bad and the next batch rotates.
                    self.sink.journal_mut().mark_failed();
                }
            }
            if write_block_pending {
                if let Some(request) = processed.back_mut() {
                    self.write_block(request);
                }
            }
        }
        if self.cur_log_start_seq < self.next_log_seq
            && self.is_stream_good()
            && self.cur_log_start_time.elapsed() >= self.params.rotate_interval
        {
            self.start_next_log();
        }
        processed
    }

    /// Handles a control request; returns true when the current batch must
    /// flush before the queue continues.
    fn control(&mut self, request: &mut LogRequest) -> bool {
        debug!(request = ?request, "log writer control");
        let Some(kind) = request.control().map(|control| control.kind) else {
            return false;
        };
        let end_batch = match kind {
            ControlKind::Nop => false,
            ControlKind::NewLog => {
                if self.cur_log_start_seq < self.last_log_seq {
                    self.start_next_log();
                }
                true
            }
            ControlKind::WriteBlock => return true,
            ControlKind::SetParameters => {
                if let Some(control) = request.control() {
                    let prefix = control.params_prefix.clone();
                    let params = control.params.clone();
                    self.apply_parameters(&prefix, &params);
                }
                // Never starts a new record block.
                return false;
            }
        };
        let committed = self.in_flight_committed.seq;
        let last_log_seq = self.last_log_seq;
        let log_name = self.log_name.clone();
        if let Some(control) = request.control_mut() {
            control.committed = committed;
            control.last_log_seq = last_log_seq;
            control.log_name = log_name;
        }
        end_batch && self.is_stream_good()
    }

    fn apply_parameters(&mut self, prefix: &str, params: &Properties) {
        if let Err(err) = self
            .params
            .apply(prefix, params, self.transmitter.as_mut())
        {
            warn!(%err, "log writer: parameter update failed");
        }
        self.sink.journal_mut().set_sync(self.params.sync);
        self.sink
            .journal_mut()
            .set_panic_on_io_error(self.params.panic_on_io_error);
    }

    /// Frames and flushes the current block: commit marker line, trailer
    /// line, transmission, write-through, fsync, and the next block's seed.
    pub(super) fn flush_block(&mut self, log_seq: Seq) {
        self.next_block_seq += 1;
        let committed = self.in_flight_committed;
        self.sink.write_str("c/");
        self.sink.write_int(committed.seq);
        self.sink.write_str("/");
        self.sink.write_int(committed.fid_seed);
        self.sink.write_str("/");
        self.sink.write_int(committed.err_checksum);
        self.sink.write_str("/");
        self.sink.write_int(i64::from(committed.status));
        self.sink.write_str("/");
        self.sink.write_int(log_seq);
        self.sink.write_str("/\n");
        let tx_len = self.sink.buffered_len();
        let tx_checksum =
            block_checksum::update(self.sink.block_checksum(), &self.sink.buffered()[..tx_len]);
        self.sink.set_block_checksum(tx_checksum);
        self.sink.write_int(self.next_block_seq);
        self.sink.write_str("/");
        let trailer_checksum =
            block_checksum::update(tx_checksum, &self.sink.buffered()[tx_len..]);
        self.sink.set_block_checksum(trailer_checksum);
        self.sink.set_update_block_checksum(false);
        self.sink.write_int(i64::from(trailer_checksum));
        self.sink.write_str("\n");
        // The header block carries only schema the followers already have;
        // everything else is transmitted.
        if self.next_block_seq > 0 {
            let status = self.transmitter.transmit_block(
                log_seq,
                (log_seq - self.next_log_seq) as i32,
                &self.sink.buffered()[..tx_len],
                tx_checksum,
                tx_len,
            );
            if status != 0 {
                error!(seq = log_seq, status, "block transmit failure");
                self.observer.set_up(false);
            }
        }
        self.sink.set_sync(true);
        self.sink.flush();
        self.sink.journal_mut().maybe_fsync();
        self.sink.start_block(self.next_block_checksum);
    }

    /// Splices an externally framed block `[block_start_seq, block_end_seq]`
    /// into the journal, re-stamping the trailer so the on-disk checksum
    /// chain and downstream replay both stay consistent.
    ///
    /// A transmit failure here flips the transmitter down but does not fail
    /// the local write; the block is durable either way.
    pub(super) fn write_block(&mut self, request: &mut LogRequest) {
        let Some((start_seq, end_seq, external_checksum, payload_len, lines_empty, last_line_len)) =
            request.control().map(|control| {
                (
                    control.block_start_seq,
                    control.block_end_seq,
                    control.block_checksum,
                    control.block_data.len(),
                    control.block_lines.is_empty(),
                    control.block_lines.last().copied().unwrap_or(0),
                )
            })
        else {
            debug_assert!(false, "write block: not a control request");
            request.status = -errcode::EFAULT;
            return;
        };
        if payload_len == 0 {
            debug_assert!(false, "write block: invalid block length");
            request.status = -errcode::EFAULT;
            return;
        }
        if lines_empty {
            debug_assert!(false, "write block: no log lines");
            request.status = -errcode::EFAULT;
            return;
        }
        if self.last_log_seq != self.next_log_seq {
            debug_assert!(false, "write block: invalid invocation");
            request.status = -errcode::EFAULT;
            return;
        }
        if start_seq != self.last_log_seq {
            request.status = -errcode::EINVAL;
            request.status_msg = "invalid block start sequence".into();
            return;
        }
        if !self.is_stream_good() {
            request.status = -errcode::EIO;
            request.status_msg = "log write error".into();
            return;
        }
        self.sink.set_sync(false);
        self.sink.set_update_block_checksum(false);
        let seed_checksum = self.sink.block_checksum();
        // Fold in the externally computed payload checksum; the payload
        // bytes themselves are never rescanned.
        let combined = block_checksum::combine(seed_checksum, external_checksum, payload_len);
        self.sink.set_block_checksum(combined);
        let position = self.sink.buffered_len();
        if let Some(control) = request.control() {
            self.sink.write_all(&control.block_data);
        }
        let written = self.sink.buffered_len() - position;
        self.next_block_seq += 1;
        self.sink.write_int(self.next_block_seq);
        self.sink.write_str("/");
        let trailer_start = position + written;
        let trailer_checksum = block_checksum::update(
            self.sink.block_checksum(),
            &self.sink.buffered()[trailer_start..],
        );
        self.sink.set_block_checksum(trailer_checksum);
        self.sink.write_int(i64::from(trailer_checksum));
        self.sink.write_str("\n");
        let trailer = self.sink.buffered()[trailer_start..].to_vec();
        // Downstream replay needs the trailer stitched into the block image.
        let block_committed = match request.control_mut() {
            Some(control) => {
                control.block_data.extend_from_slice(&trailer);
                if let Some(last) = control.block_lines.last_mut() {
                    *last += trailer.len();
                }
                let committed = parse_commit_seq(&control.block_data[..payload_len], last_line_len);
                control.block_committed = committed.unwrap_or(-1);
                control.block_committed
            }
            None => -1,
        };
        if block_committed < 0 {
            self.sink.clear_buffer();
            self.sink.set_block_checksum(seed_checksum);
            self.next_block_seq -= 1;
            request.status = -errcode::EIO;
            request.status_msg = "log write: invalid block format".into();
            return;
        }
        let status = self.transmitter.transmit_block(
            end_seq,
            (end_seq - start_seq) as i32,
            &self.sink.buffered()[position..position + written],
            external_checksum,
            written,
        );
        if status != 0 {
            error!(
                start = start_seq,
                end = end_seq,
                status,
                "write block: block transmit failure"
            );
            self.observer.set_up(false);
        }
        self.sink.set_sync(true);
        self.sink.flush();
        self.sink.journal_mut().maybe_fsync();
        if self.is_stream_good() {
            self.last_log_seq = end_seq;
            self.next_log_seq = end_seq;
            if let Some(control) = request.control_mut() {
                control.block_seq = self.next_block_seq;
            }
            request.status = 0;
            self.sink.start_block(self.next_block_checksum);
        } else {
            request.status = -errcode::EIO;
            request.status_msg = "log write error".into();
        }
    }

    /// Creates the next numbered log file and makes its header durable.
    /// The header block is flushed immediately so an empty file never sits
    /// on disk, and never transmitted (its block sequence is 0).
    pub(super) fn new_log(&mut self, log_seq: Seq) {
        self.cur_log_start_time = Instant::now();
        self.next_block_seq = -1;
        self.set_log_name(log_seq);
        let path = self.log_name.clone();
        self.sink.journal_mut().open_new(&path);
        if !self.sink.journal().is_good() {
            return;
        }
        self.sink.start_block(block_checksum::NULL_CHECKSUM);
        self.sink.reset_digest();
        self.sink.set_base(IntBase::Dec);
        self.sink.set_sync(false);
        self.sink
            .write_str(&format!("version/{}\n", LOG_FILE_VERSION));
        self.sink.write_str("checksum/last-line\n");
        self.sink.write_str("setintbase/16\n");
        self.sink
            .write_str(&format!("time/{}\n", iso_timestamp_utc()));
        self.sink.set_base(IntBase::Hex);
        self.flush_block(self.last_log_seq);
        if self.is_stream_good() {
            self.next_log_seq = self.last_log_seq;
        } else {
            self.last_log_seq = self.next_log_seq;
        }
    }

    pub(super) fn set_log_name(&mut self, log_seq: Seq) {
        self.cur_log_start_seq = log_seq;
        self.next_log_seq = log_seq;
        self.last_log_seq = log_seq;
        self.log_name = make_log_name(&self.params.log_dir, self.log_num);
    }

    /// Flushes the residual block, stamps the close trailer (`time/` plus
    /// the whole-file digest), fsyncs, closes, and repoints the `last`
    /// link at the finished file.
    pub(super) fn close_log(&mut self) {
        if self.is_stream_good() {
            if self.last_log_seq != self.next_log_seq {
                self.flush_block(self.last_log_seq);
                if !self.is_stream_good() {
                    self.last_log_seq = self.next_log_seq;
                    return;
                }
            }
            self.sink.set_update_block_checksum(false);
            self.sink.set_sync(true);
            self.sink
                .write_str(&format!("time/{}\n", iso_timestamp_utc()));
            let digest = self.sink.digest_hex();
            self.sink.write_str(&format!("checksum/{}\n", digest));
            self.sink.flush();
        } else {
            self.last_log_seq = self.next_log_seq;
        }
        self.sink.journal_mut().maybe_fsync();
        if self.sink.journal().is_open() {
            self.sink.journal_mut().close();
            let target = self.log_name.clone();
            let link = self.params.last_log_path();
            self.sink.journal_mut().link_latest(&target, &link);
        }
    }

    pub(super) fn start_next_log(&mut self) {
        self.close_log();
        self.log_num += 1;
        self.new_log(self.last_log_seq);
    }
}

/// Extracts the committed sequence from the block payload's final line,
/// which must be the commit marker `c/<hex>/...`.
fn parse_commit_seq(payload: &[u8], last_line_len: usize) -> Option<Seq> {
    if last_line_len == 0 || last_line_len > payload.len() {
        return None;
    }
    let line = &payload[payload.len() - last_line_len..];
    let rest = line.strip_prefix(b"c/")?;
    let end = rest.iter().position(|&byte| byte == b'/')?;
    if end == 0 {
        return None;
    }
    let text = std::str::from_utf8(&rest[..end]).ok()?;
    let value = u64::from_str_radix(text, 16).ok()?;
    Some(value as Seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commit_seq_reads_the_marker() {
        let payload = b"mkdir/a\nc/63/63/0/0/67/\n";
        assert_eq!(parse_commit_seq(payload, 16), Some(0x63));
    }

    #[test]
    fn parse_commit_seq_rejects_malformed_lines() {
        assert_eq!(parse_commit_seq(b"mkdir/a\n", 8), None);
        assert_eq!(parse_commit_seq(b"c/xyzq/\n", 8), None);
        assert_eq!(parse_commit_seq(b"c//1/\n", 6), None);
        assert_eq!(parse_commit_seq(b"c/1", 9), None);
    }
}
