//! Metadata transaction log writer.
//!
//! The pipeline: producer threads [`enqueue`](LogWriter::enqueue) requests
//! and later [`schedule_flush`](LogWriter::schedule_flush) them; a
//! dedicated worker thread drains the input queue, serializes each
//! loggable request into the current block, frames the block with a commit
//! marker and checksum trailer, appends it to the journal file, and hands
//! the same bytes to the replica transmitter. Once the transmitter's
//! acknowledged watermark covers a request's sequence, the worker moves it
//! to the output queue and wakes the main event loop, whose handler calls
//! [`deliver_completed`](LogWriter::deliver_completed).
//!
//! Exactly two threads touch this state: the producer side owns the
//! pending queue, the committed tuple and the delivery counters; the
//! worker owns the file, the digest sink, the transmitter and all
//! serializer sequences. They meet only at the mutex-protected in/out
//! queues and the snapshot of the committed tuple taken at flush time.

mod params;
mod worker;
mod write;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::replica::LogTransmitter;
use crate::service::errcode;
use crate::service::{AppError, AppResult, Properties};

use super::{
    CommitState, DigestState, EventLoop, LogAction, LogRequest, RequestQueue, RequestSink, Seq,
};

use params::WriterParams;
use worker::Worker;

const WORKER_STACK_SIZE: usize = 64 << 10;

/// Resuming state of the log file a previous incarnation left behind.
#[derive(Debug, Clone)]
pub struct AppendState {
    /// Digest snapshot covering the existing file contents.
    pub digest: DigestState,
    /// First sequence of the file being appended.
    pub start_seq: Seq,
    /// Block sequence of the file's last block.
    pub last_block_seq: Seq,
    /// Whether the file was written with hexadecimal integers.
    pub hex: bool,
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Index of the current log file (`log.<num>`).
    pub log_num: Seq,
    /// Next log sequence to assign.
    pub log_seq: Seq,
    /// Committed tuple recovered by the caller.
    pub committed: CommitState,
    /// Present when resuming an existing file instead of creating one.
    pub append: Option<AppendState>,
    pub params_prefix: String,
    pub params: Properties,
}

#[derive(Debug, Default)]
struct SharedState {
    in_queue: RequestQueue,
    out_queue: RequestQueue,
    pending_committed: CommitState,
    stop: bool,
    ack_pending: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<SharedState>,
    worker_wake: Condvar,
}

impl Shared {
    fn wake_worker(&self) {
        self.worker_wake.notify_one();
    }

    fn request_ack_pass(&self) {
        let mut state = self.state.lock();
        state.ack_pending = true;
        self.worker_wake.notify_one();
    }
}

#[derive(Debug)]
struct ObserverState {
    transmit_committed: AtomicI64,
    transmitter_up: AtomicBool,
    shared: Arc<Shared>,
}

/// Callback the replica transmitter reports replication progress through.
///
/// Raising the watermark wakes the worker so the pending-ack queue can
/// drain; an acknowledgement also implies the transmitter is up again.
#[derive(Debug, Clone)]
pub struct CommitObserver {
    inner: Arc<ObserverState>,
}

impl CommitObserver {
    fn new(shared: Arc<Shared>) -> Self {
        Self {
            inner: Arc::new(ObserverState {
                transmit_committed: AtomicI64::new(-1),
                transmitter_up: AtomicBool::new(false),
                shared,
            }),
        }
    }

    /// Reports that every record up to `seq` is replicated.
    pub fn notify(&self, seq: Seq) {
        let previous = self.inner.transmit_committed.fetch_max(seq, Ordering::AcqRel);
        self.inner.transmitter_up.store(true, Ordering::Release);
        if previous < seq {
            self.inner.shared.request_ack_pass();
        }
    }

    pub(crate) fn transmit_committed(&self) -> Seq {
        self.inner.transmit_committed.load(Ordering::Acquire)
    }

    pub(crate) fn raise_transmit_committed(&self, seq: Seq) {
        self.inner.transmit_committed.fetch_max(seq, Ordering::AcqRel);
    }

    pub(crate) fn is_up(&self) -> bool {
        self.inner.transmitter_up.load(Ordering::Acquire)
    }

    pub(crate) fn set_up(&self, up: bool) {
        self.inner.transmitter_up.store(up, Ordering::Release);
    }

    fn reset(&self, up: bool) {
        self.inner.transmit_committed.store(-1, Ordering::Release);
        self.inner.transmitter_up.store(up, Ordering::Release);
    }
}

pub struct LogWriter {
    next_seq: Seq,
    pending_count: i64,
    committed: CommitState,
    max_done_log_seq: Seq,
    pending_queue: RequestQueue,
    shared: Arc<Shared>,
    observer: CommitObserver,
    main_loop: Option<Arc<dyn EventLoop>>,
    worker: Option<thread::JoinHandle<()>>,
    stopped: bool,
}

impl Default for LogWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl LogWriter {
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let observer = CommitObserver::new(Arc::clone(&shared));
        Self {
            next_seq: -1,
            pending_count: 0,
            committed: CommitState::default(),
            max_done_log_seq: -1,
            pending_queue: RequestQueue::new(),
            shared,
            observer,
            main_loop: None,
            worker: None,
            stopped: false,
        }
    }

    /// Opens (fresh mode) or resumes (append mode) the current log file and
    /// starts the worker thread. Returns the current log file path.
    pub fn start(
        &mut self,
        mut transmitter: Box<dyn LogTransmitter>,
        main_loop: Arc<dyn EventLoop>,
        options: StartOptions,
    ) -> AppResult<std::path::PathBuf> {
        if self.worker.is_some() {
            return Err(AppError::InvalidArgument(
                "log writer is already running".into(),
            ));
        }
        if options.log_num < 0 || options.log_seq < 0 {
            return Err(AppError::InvalidArgument(
                "negative log number or sequence".into(),
            ));
        }
        if let Some(append) = &options.append {
            if options.log_seq < append.start_seq {
                return Err(AppError::InvalidArgument(
                    "log sequence below append start".into(),
                ));
            }
        }
        let mut params = WriterParams::default();
        params.apply(&options.params_prefix, &options.params, transmitter.as_mut())?;
        transmitter.set_commit_observer(self.observer.clone());
        self.observer.reset(transmitter.is_up());
        self.committed = options.committed;
        self.stopped = false;
        {
            let mut state = self.shared.state.lock();
            state.stop = false;
            state.ack_pending = false;
            state.pending_committed = self.committed;
        }
        let mut worker = Worker::new(
            Arc::clone(&self.shared),
            self.observer.clone(),
            Arc::clone(&main_loop),
            transmitter,
            params,
        );
        let log_name = worker.startup(&options)?;
        let handle = thread::Builder::new()
            .name("log-writer".into())
            .stack_size(WORKER_STACK_SIZE)
            .spawn(move || worker.run())
            .map_err(AppError::Io)?;
        self.worker = Some(handle);
        self.main_loop = Some(main_loop);
        Ok(log_name)
    }

    /// Accepts a request into the pipeline.
    ///
    /// The request is handed back (`Err`) when it does not need logging,
    /// in which case the caller completes it directly, or when the writer
    /// is stopped, in which case its status already carries the failure.
    pub fn enqueue(&mut self, mut request: Box<LogRequest>) -> Result<(), Box<LogRequest>> {
        self.next_seq += 1;
        request.seqno = self.next_seq;
        if self.stopped {
            request.status = -errcode::ELOGFAILED;
            request.status_msg = "log writer is not running".into();
            return Err(request);
        }
        let no_record = match request.log_action {
            LogAction::Never => true,
            LogAction::IfOk => request.status != 0,
            LogAction::Always => false,
        };
        let counter_idle = request
            .log_queue_counter()
            .map_or(true, |counter| counter.get() <= 0);
        if no_record && (self.pending_count <= 0 || counter_idle) {
            return Err(request);
        }
        if let Some(counter) = request.log_queue_counter() {
            counter.increment();
        }
        request.commit_pending = true;
        self.pending_count += 1;
        if self.pending_count <= 0 {
            panic!("log writer: invalid pending count");
        }
        self.pending_queue.push_back(request);
        Ok(())
    }

    /// Records the outcome of a committed request and advances the
    /// committed tuple the next block trailer advertises.
    pub fn request_committed(&mut self, request: &mut LogRequest, fid_seed: i64) {
        if !request.commit_pending {
            return;
        }
        if let Some(counter) = request.log_queue_counter() {
            counter.decrement();
        }
        request.commit_pending = false;
        if request.logseq < 0 {
            return;
        }
        if request.suspended {
            panic!("request committed: invalid suspended state");
        }
        if self.committed.seq >= 0 && self.committed.seq + 1 != request.logseq {
            panic!("request committed: invalid out of order log sequence");
        }
        let status = if request.status < 0 {
            errcode::sys_to_wire_errno(-request.status)
        } else {
            0
        };
        self.committed.err_checksum += i64::from(status);
        self.committed.seq = request.logseq;
        self.committed.fid_seed = fid_seed;
        self.committed.status = status;
    }

    pub fn committed(&self) -> CommitState {
        self.committed
    }

    pub fn set_committed(&mut self, committed: CommitState) {
        self.committed = committed;
    }

    pub fn committed_log_seq(&self) -> Seq {
        self.committed.seq
    }

    pub fn pending_count(&self) -> i64 {
        self.pending_count
    }

    pub fn max_done_log_seq(&self) -> Seq {
        self.max_done_log_seq
    }

    /// Handle the transmitter acknowledges replication progress through.
    pub fn commit_observer(&self) -> CommitObserver {
        self.observer.clone()
    }

    /// Splices the pending queue into the worker's input and wakes it,
    /// snapshotting the committed tuple for the next block trailer. Cheap
    /// no-op when nothing is pending; no lock is taken then.
    pub fn schedule_flush(&mut self) {
        if self.pending_queue.is_empty() {
            return;
        }
        {
            let mut state = self.shared.state.lock();
            state.pending_committed = self.committed;
            state.in_queue.append(&mut self.pending_queue);
        }
        self.shared.wake_worker();
    }

    /// Delivery half of the pipeline: the main event loop's handler steals
    /// the out queue and submits each completed request, in replicated
    /// order, to the sink.
    pub fn deliver_completed(&mut self, sink: &mut dyn RequestSink) {
        if self.pending_count <= 0 {
            return;
        }
        let mut done = {
            let mut state = self.shared.state.lock();
            std::mem::take(&mut state.out_queue)
        };
        while let Some(request) = done.pop_front() {
            if request.logseq >= 0 {
                if request.logseq <= self.max_done_log_seq {
                    panic!("log writer: invalid log sequence number");
                }
                self.max_done_log_seq = request.logseq;
            }
            self.pending_count -= 1;
            if self.pending_count < 0 {
                panic!("log writer: request completion invalid pending count");
            }
            sink.submit(request);
        }
    }

    /// Stops the worker and joins it. Requests that are locally durable but
    /// not yet replicated are acknowledged on the way out (drain policy);
    /// requests never flushed remain the caller's responsibility.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.worker.take() else {
            return;
        };
        self.stopped = true;
        {
            let mut state = self.shared.state.lock();
            state.stop = true;
        }
        self.shared.wake_worker();
        if handle.join().is_err() && !thread::panicking() {
            panic!("log writer: worker thread panicked");
        }
        self.main_loop = None;
    }

    /// Called in a forked child: poisons the handle so the child cannot
    /// keep writing. Journal descriptors are opened close-on-exec, so the
    /// child holds no usable descriptor once it execs.
    pub fn child_at_fork(&mut self) {
        self.stopped = true;
        self.worker = None;
        self.main_loop = None;
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
