//! The writer's worker thread: waits for flushed batches or replication
//! acknowledgements, serializes batches, and settles the pending-ack
//! queue against the transmitter's watermark.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, info};

use crate::log::{
    block_checksum, CommitState, DigestSink, EventLoop, FileJournal, IntBase, RequestQueue, Seq,
};
use crate::replica::LogTransmitter;
use crate::service::{AppError, AppResult};

use super::{CommitObserver, Shared, StartOptions, WriterParams};

pub(super) struct Worker {
    pub(super) shared: Arc<Shared>,
    pub(super) observer: CommitObserver,
    pub(super) main_loop: Arc<dyn EventLoop>,
    pub(super) transmitter: Box<dyn LogTransmitter>,
    pub(super) params: WriterParams,
    pub(super) sink: DigestSink,
    pub(super) pending_ack: RequestQueue,
    pub(super) in_flight_committed: CommitState,
    pub(super) next_log_seq: Seq,
    pub(super) last_log_seq: Seq,
    pub(super) next_block_seq: Seq,
    pub(super) next_block_checksum: u32,
    pub(super) cur_log_start_seq: Seq,
    pub(super) cur_log_start_time: Instant,
    pub(super) log_num: Seq,
    pub(super) log_name: PathBuf,
    pub(super) rng: SmallRng,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<Shared>,
        observer: CommitObserver,
        main_loop: Arc<dyn EventLoop>,
        transmitter: Box<dyn LogTransmitter>,
        params: WriterParams,
    ) -> Self {
        let mut journal = FileJournal::new();
        journal.set_sync(params.sync);
        journal.set_panic_on_io_error(params.panic_on_io_error);
        Self {
            shared,
            observer,
            main_loop,
            transmitter,
            params,
            sink: DigestSink::new(journal),
            pending_ack: RequestQueue::new(),
            in_flight_committed: CommitState::default(),
            next_log_seq: -1,
            last_log_seq: -1,
            next_block_seq: -1,
            next_block_checksum: block_checksum::line_feed_checksum(),
            cur_log_start_seq: -1,
            cur_log_start_time: Instant::now(),
            log_num: 0,
            log_name: PathBuf::new(),
            rng: SmallRng::from_entropy(),
        }
    }

    /// Opens (or resumes) the log file on the caller's thread so `start`
    /// reports the file name and any failure synchronously.
    pub(super) fn startup(&mut self, options: &StartOptions) -> AppResult<PathBuf> {
        self.log_num = options.log_num;
        self.in_flight_committed = options.committed;
        if let Some(append) = &options.append {
            self.set_log_name(options.log_seq);
            self.cur_log_start_time = Instant::now();
            self.cur_log_start_seq = append.start_seq;
            self.sink.set_digest_state(append.digest.clone());
            let size = self.sink.journal_mut().open_append(&self.log_name);
            if !self.sink.journal().is_good() {
                return Err(self.startup_error());
            }
            if size == 0 {
                self.sink.journal_mut().close();
                return Err(AppError::InvalidArgument(format!(
                    "log append: invalid empty file: {}",
                    self.log_name.display()
                )));
            }
            info!(
                idx = self.log_num,
                start = self.cur_log_start_seq,
                cur = self.next_log_seq,
                block = append.last_block_seq,
                hex = append.hex,
                size,
                file = %self.log_name.display(),
                "log append"
            );
            self.sink
                .set_base(if append.hex { IntBase::Hex } else { IntBase::Dec });
            self.next_block_seq = append.last_block_seq;
            if append.last_block_seq < 0 || !append.hex {
                // Old-format segment: close it out and start a fresh one.
                self.start_next_log();
            } else {
                self.sink.start_block(self.next_block_checksum);
            }
        } else {
            self.new_log(options.log_seq);
        }
        if !self.is_stream_good() {
            return Err(self.startup_error());
        }
        Ok(self.log_name.clone())
    }

    fn startup_error(&self) -> AppError {
        AppError::JournalIo {
            path: self.log_name.display().to_string(),
            code: self.sink.journal().error(),
        }
    }

    /// The worker loop. Each wakeup drains the input queue, writes a
    /// batch, and settles the pending-ack queue; on stop the watermark is
    /// raised over everything locally durable so the queues drain, then
    /// the current file is closed out.
    pub(super) fn run(&mut self) {
        loop {
            let (queue, stop) = self.wait_for_work();
            let processed = if queue.is_empty() {
                RequestQueue::new()
            } else {
                self.write(queue)
            };
            if stop {
                self.observer.raise_transmit_committed(self.next_log_seq);
            }
            self.process_pending_ack(processed);
            if stop {
                break;
            }
        }
        self.close_log();
        debug!("log writer worker exiting");
    }

    fn wait_for_work(&mut self) -> (RequestQueue, bool) {
        let shared = Arc::clone(&self.shared);
        let mut state = shared.state.lock();
        while !state.stop && state.in_queue.is_empty() && !state.ack_pending {
            shared.worker_wake.wait(&mut state);
        }
        state.ack_pending = false;
        let queue = std::mem::take(&mut state.in_queue);
        let pending_committed = state.pending_committed;
        let stop = state.stop;
        drop(state);
        if !queue.is_empty() {
            self.in_flight_committed = pending_committed;
        }
        (queue, stop)
    }

    /// Merges the just-processed requests into the pending-ack queue, then
    /// moves the replicated prefix to the main-thread out queue and wakes
    /// the delivery loop.
    pub(super) fn process_pending_ack(&mut self, mut done: RequestQueue) {
        self.pending_ack.append(&mut done);
        if self.pending_ack.is_empty() {
            return;
        }
        let transmit_committed = self.observer.transmit_committed();
        let mut done = if transmit_committed < self.next_log_seq {
            let boundary = self
                .pending_ack
                .iter()
                .position(|request| transmit_committed < request.logseq);
            match boundary {
                Some(0) => return,
                Some(boundary) => self.pending_ack.split_front(boundary),
                None => std::mem::take(&mut self.pending_ack),
            }
        } else {
            std::mem::take(&mut self.pending_ack)
        };
        if done.is_empty() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.out_queue.append(&mut done);
        }
        self.main_loop.wakeup();
    }
}
