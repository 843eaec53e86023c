//! The request model seen by the log writer.
//!
//! Requests are opaque to the writer beyond the bookkeeping fields below;
//! serialization is delegated back to the owning subsystem through
//! [`LogRecord`]. The writer owns a request only while it sits in the
//! pipeline and hands it back through the submit sink on completion, so
//! request lifetime never outlives delivery and no reference counting sits
//! on the hot path.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use bytes::BytesMut;

use crate::service::Properties;

use super::{DigestSink, LogAction, Seq};

/// Per-subsystem count of requests parked in the log pipeline.
///
/// Only the producer thread touches the value; the atomic just lets the
/// requests that carry it move across to the worker.
#[derive(Debug, Default)]
pub struct LogQueueCounter(AtomicI32);

impl LogQueueCounter {
    pub fn get(&self) -> i32 {
        self.0.load(Ordering::Relaxed)
    }

    pub(crate) fn increment(&self) {
        if self.0.fetch_add(1, Ordering::Relaxed) + 1 <= 0 {
            panic!("request enqueue: invalid log queue counter");
        }
    }

    pub(crate) fn decrement(&self) {
        if self.0.fetch_sub(1, Ordering::Relaxed) - 1 < 0 {
            panic!("request committed: invalid log queue counter");
        }
    }
}

/// Serialization hook: a loggable request appends its record lines to the
/// sink, each terminated by `\n`. The `c` line prefix is reserved for the
/// block commit marker.
pub trait LogRecord: Send + fmt::Debug {
    /// Returns false only when the request cannot legally be rendered as a
    /// log record; the writer treats that as an invariant violation.
    fn write_log(&self, out: &mut DigestSink, omit_defaults: bool) -> bool;

    /// Optional in-flight counter of the owning subsystem.
    fn log_queue_counter(&self) -> Option<&LogQueueCounter> {
        None
    }
}

#[derive(Debug)]
pub enum RequestBody {
    /// Ordinary metadata mutation, serialized through [`LogRecord`].
    Record(Box<dyn LogRecord>),
    /// Log-writer control message, consumed by the worker itself.
    Control(LogWriterControl),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Nop,
    NewLog,
    WriteBlock,
    SetParameters,
}

/// Control message payload. `WriteBlock` carries an externally framed
/// block; `SetParameters` carries a property map to re-apply.
#[derive(Debug)]
pub struct LogWriterControl {
    pub kind: ControlKind,
    pub params_prefix: String,
    pub params: Properties,
    pub block_start_seq: Seq,
    pub block_end_seq: Seq,
    pub block_checksum: u32,
    pub block_data: BytesMut,
    /// Byte length of each line in `block_data`.
    pub block_lines: Vec<usize>,
    // Reply fields, populated by the worker.
    pub block_seq: Seq,
    pub block_committed: Seq,
    pub committed: Seq,
    pub last_log_seq: Seq,
    pub log_name: PathBuf,
}

impl LogWriterControl {
    pub fn new(kind: ControlKind) -> Self {
        Self {
            kind,
            params_prefix: String::new(),
            params: Properties::new(),
            block_start_seq: -1,
            block_end_seq: -1,
            block_checksum: 0,
            block_data: BytesMut::new(),
            block_lines: Vec::new(),
            block_seq: -1,
            block_committed: -1,
            committed: -1,
            last_log_seq: -1,
            log_name: PathBuf::new(),
        }
    }

    pub fn write_block(
        start_seq: Seq,
        end_seq: Seq,
        checksum: u32,
        data: BytesMut,
        lines: Vec<usize>,
    ) -> Self {
        let mut control = Self::new(ControlKind::WriteBlock);
        control.block_start_seq = start_seq;
        control.block_end_seq = end_seq;
        control.block_checksum = checksum;
        control.block_data = data;
        control.block_lines = lines;
        control
    }

    pub fn set_parameters(prefix: impl Into<String>, params: Properties) -> Self {
        let mut control = Self::new(ControlKind::SetParameters);
        control.params_prefix = prefix.into();
        control.params = params;
        control
    }
}

/// One request threading through the writer pipeline.
#[derive(Debug)]
pub struct LogRequest {
    pub log_action: LogAction,
    /// Zero on success, negative wire errno on failure.
    pub status: i32,
    pub status_msg: String,
    /// Assigned when a record is emitted; -1 otherwise.
    pub logseq: Seq,
    /// Enqueue sequence, strictly increasing.
    pub seqno: Seq,
    pub suspended: bool,
    /// True while the request sits in the pending/in/out/pending-ack
    /// pipeline.
    pub commit_pending: bool,
    pub body: RequestBody,
}

impl LogRequest {
    pub fn new_record(log_action: LogAction, record: Box<dyn LogRecord>) -> Box<Self> {
        Box::new(Self {
            log_action,
            status: 0,
            status_msg: String::new(),
            logseq: -1,
            seqno: -1,
            suspended: false,
            commit_pending: false,
            body: RequestBody::Record(record),
        })
    }

    /// Control messages always traverse the queue, whatever its state.
    pub fn new_control(control: LogWriterControl) -> Box<Self> {
        Box::new(Self {
            log_action: LogAction::Always,
            status: 0,
            status_msg: String::new(),
            logseq: -1,
            seqno: -1,
            suspended: false,
            commit_pending: false,
            body: RequestBody::Control(control),
        })
    }

    pub fn is_control(&self) -> bool {
        matches!(self.body, RequestBody::Control(_))
    }

    pub fn control(&self) -> Option<&LogWriterControl> {
        match &self.body {
            RequestBody::Control(control) => Some(control),
            RequestBody::Record(_) => None,
        }
    }

    pub fn control_mut(&mut self) -> Option<&mut LogWriterControl> {
        match &mut self.body {
            RequestBody::Control(control) => Some(control),
            RequestBody::Record(_) => None,
        }
    }

    /// Whether this request contributes a log record right now.
    pub(crate) fn wants_log(&self) -> bool {
        match self.log_action {
            LogAction::Always => true,
            LogAction::IfOk => self.status == 0,
            LogAction::Never => false,
        }
    }

    pub(crate) fn log_queue_counter(&self) -> Option<&LogQueueCounter> {
        match &self.body {
            RequestBody::Record(record) => record.log_queue_counter(),
            RequestBody::Control(_) => None,
        }
    }
}

/// FIFO of requests owned by the pipeline, with O(1) tail splice and a
/// split operation for the pending-ack boundary.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<Box<LogRequest>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn push_back(&mut self, request: Box<LogRequest>) {
        self.items.push_back(request);
    }

    /// Splices `other` onto the tail, leaving it empty.
    pub fn append(&mut self, other: &mut RequestQueue) {
        self.items.append(&mut other.items);
    }

    pub fn pop_front(&mut self) -> Option<Box<LogRequest>> {
        self.items.pop_front()
    }

    pub fn front(&self) -> Option<&LogRequest> {
        self.items.front().map(Box::as_ref)
    }

    pub fn back_mut(&mut self) -> Option<&mut LogRequest> {
        self.items.back_mut().map(Box::as_mut)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogRequest> {
        self.items.iter().map(Box::as_ref)
    }

    pub(crate) fn iter_mut_from(
        &mut self,
        start: usize,
    ) -> impl Iterator<Item = &mut Box<LogRequest>> {
        self.items.range_mut(start..)
    }

    /// Splits off and returns the first `n` requests.
    pub fn split_front(&mut self, n: usize) -> RequestQueue {
        let rest = self.items.split_off(n);
        RequestQueue {
            items: std::mem::replace(&mut self.items, rest),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn control_request(seqno: Seq) -> Box<LogRequest> {
        let mut request = LogRequest::new_control(LogWriterControl::new(ControlKind::Nop));
        request.seqno = seqno;
        request
    }

    #[test]
    fn append_preserves_fifo_order() {
        let mut first = RequestQueue::new();
        first.push_back(control_request(1));
        first.push_back(control_request(2));
        let mut second = RequestQueue::new();
        second.push_back(control_request(3));

        first.append(&mut second);
        assert!(second.is_empty());
        let order: Vec<Seq> = first.iter().map(|request| request.seqno).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn split_front_keeps_the_tail() {
        let mut queue = RequestQueue::new();
        for seqno in 1..=4 {
            queue.push_back(control_request(seqno));
        }
        let head = queue.split_front(2);
        let head: Vec<Seq> = head.iter().map(|request| request.seqno).collect();
        let tail: Vec<Seq> = queue.iter().map(|request| request.seqno).collect();
        assert_eq!(head, vec![1, 2]);
        assert_eq!(tail, vec![3, 4]);
    }

    #[test]
    fn counter_tracks_in_flight_requests() {
        let counter = LogQueueCounter::default();
        counter.increment();
        counter.increment();
        assert_eq!(counter.get(), 2);
        counter.decrement();
        assert_eq!(counter.get(), 1);
    }

    #[test]
    #[should_panic(expected = "invalid log queue counter")]
    fn counter_underflow_panics() {
        let counter = LogQueueCounter::default();
        counter.decrement();
    }
}
