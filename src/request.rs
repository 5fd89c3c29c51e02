// request.rs

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::flags::EventMask;
use crate::pair::Side;

/// Final (or pending) outcome of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Pending,
    TimedOut,
    Cancelled,
    /// Out-of-band data was lost because the inbound buffer was full.
    BufferOverrun,
}

impl Status {
    pub fn is_pending(self) -> bool {
        self == Status::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        RequestId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a caller asks an endpoint to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoRequest {
    Read { len: usize },
    Write(Vec<u8>),
    /// Single byte sent ahead of queued writes.
    ImmediateChar(u8),
    /// Completes once every write queued before it has been transmitted.
    Flush,
    WaitEvent,
    /// Out-of-band bytes injected into the endpoint's own inbound stream.
    Insert(Vec<u8>),
}

/// Request payload while it sits in a queue.
#[derive(Debug)]
pub(crate) enum Operation {
    Read { buf: Vec<u8> },
    Write { data: Vec<u8> },
    ImmediateChar(u8),
    Flush,
    WaitEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    Read,
    Write,
    Wait,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Read, QueueKind::Write, QueueKind::Wait];

    pub fn index(self) -> usize {
        match self {
            QueueKind::Read => 0,
            QueueKind::Write => 1,
            QueueKind::Wait => 2,
        }
    }
}

/// How long a read may stay pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadTimeout {
    /// Wait until the requested length arrives.
    #[default]
    Blocking,
    /// Complete at once with whatever is buffered.
    Immediate,
    /// Complete as soon as any byte arrives, or time out after `total`.
    FirstByte { total: Duration },
    /// Total deadline of `per_byte * len + constant` (zero disables) and an
    /// optional quiet-period limit between bytes.
    Bounded {
        interval: Option<Duration>,
        per_byte: Duration,
        constant: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeouts {
    pub read: ReadTimeout,
    pub write_per_byte: Duration,
    pub write_constant: Duration,
}

const TOKEN_QUEUED: u8 = 0;
const TOKEN_CLAIMED: u8 = 1;
const TOKEN_CANCEL_REQUESTED: u8 = 2;
const TOKEN_CANCELLED: u8 = 3;
const TOKEN_DONE: u8 = 4;

/// Shared between the owner of a request and the engine. Whoever moves it
/// to a terminal state owns the completion.
#[derive(Debug)]
pub struct CancelToken {
    state: AtomicU8,
}

impl CancelToken {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(TOKEN_QUEUED),
        }
    }

    /// Owner-side cancel. Returns false if the request already finished.
    pub fn cancel(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let next = match current {
                TOKEN_QUEUED => TOKEN_CANCELLED,
                TOKEN_CLAIMED => TOKEN_CANCEL_REQUESTED,
                TOKEN_CANCEL_REQUESTED | TOKEN_CANCELLED => return true,
                _ => return false,
            };
            match self
                .state
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            TOKEN_CANCELLED | TOKEN_CANCEL_REQUESTED
        )
    }

    pub fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == TOKEN_DONE
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(TOKEN_QUEUED, TOKEN_CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Back to `Queued`. If the owner cancelled during the claim the token
    /// goes straight to `Done` and the caller owns the cancellation.
    fn restore(&self) -> bool {
        match self
            .state
            .compare_exchange(TOKEN_CLAIMED, TOKEN_QUEUED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(actual) => {
                assert_eq!(actual, TOKEN_CANCEL_REQUESTED, "restore of unclaimed request");
                self.state.store(TOKEN_DONE, Ordering::Release);
                false
            }
        }
    }

    /// Take ownership of a request cancelled while it was queued.
    fn take_cancelled(&self) -> bool {
        self.state
            .compare_exchange(TOKEN_CANCELLED, TOKEN_DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish(&self) {
        let prev = self.state.swap(TOKEN_DONE, Ordering::AcqRel);
        assert_ne!(prev, TOKEN_DONE, "request completed twice");
    }
}

/// Detached cancellation hook of a claimed request.
///
/// Must be handed back through [`CancelHook::restore`] or
/// [`CancelHook::finish`]; dropping it while armed means the engine lost
/// track of a request.
#[must_use]
#[derive(Debug)]
pub(crate) struct CancelHook {
    token: Arc<CancelToken>,
    armed: bool,
}

impl CancelHook {
    /// Give the hook back to a request that stays pending. Fails when the
    /// owner cancelled during the claim window; the request must then be
    /// completed as cancelled.
    pub fn restore(mut self) -> bool {
        self.armed = false;
        self.token.restore()
    }

    /// Mark the request as completed by the engine.
    pub fn finish(mut self) {
        self.armed = false;
        self.token.finish();
    }
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        if self.armed && !std::thread::panicking() {
            panic!("claimed cancel hook dropped without restore or finish");
        }
    }
}

/// A request waiting in one of an endpoint's queues.
#[derive(Debug)]
pub(crate) struct Pending {
    pub id: RequestId,
    pub op: Operation,
    pub token: Arc<CancelToken>,
    /// Bytes transferred so far.
    pub done: usize,
    pub armed: bool,
    pub wait_one: bool,
    pub deadline: Option<Instant>,
    pub interval: Option<Duration>,
    pub interval_deadline: Option<Instant>,
}

/// `now + per_byte * len + constant`, or `None` for a zero total. A total
/// too large to represent never expires.
fn deadline_after(now: Instant, per_byte: Duration, len: usize, constant: Duration) -> Option<Instant> {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    let total = per_byte.checked_mul(len)?.checked_add(constant)?;
    if total.is_zero() {
        return None;
    }
    now.checked_add(total)
}

impl Pending {
    pub fn new(op: Operation) -> Self {
        Self {
            id: RequestId::next(),
            op,
            token: Arc::new(CancelToken::new()),
            done: 0,
            armed: false,
            wait_one: false,
            deadline: None,
            interval: None,
            interval_deadline: None,
        }
    }

    pub fn claim(&self) -> Option<CancelHook> {
        if self.token.claim() {
            Some(CancelHook {
                token: Arc::clone(&self.token),
                armed: true,
            })
        } else {
            None
        }
    }

    /// Remove a request the owner cancelled while it was queued.
    pub fn claim_for_removal(&self) -> bool {
        self.token.take_cancelled()
    }

    pub fn length(&self) -> usize {
        match &self.op {
            Operation::Read { buf } => buf.len(),
            Operation::Write { data } => data.len(),
            Operation::ImmediateChar(_) => 1,
            Operation::Flush | Operation::WaitEvent => 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.length() - self.done
    }

    /// Bytes still to be transmitted by a write-side request.
    pub fn unsent(&self) -> &[u8] {
        match &self.op {
            Operation::Write { data } => &data[self.done..],
            Operation::ImmediateChar(c) => &std::slice::from_ref(c)[self.done..],
            _ => &[],
        }
    }

    /// Space still to be filled by a read.
    pub fn unfilled(&mut self) -> &mut [u8] {
        match &mut self.op {
            Operation::Read { buf } => &mut buf[self.done..],
            _ => &mut [],
        }
    }

    /// Arm the timeout when the request becomes the pending front of its
    /// queue. Returns the status it must complete with right away, if any.
    pub fn arm(&mut self, timeouts: &Timeouts, now: Instant) -> Status {
        if self.armed {
            return Status::Pending;
        }
        self.armed = true;

        match &self.op {
            Operation::Read { buf } => match timeouts.read {
                ReadTimeout::Blocking => {}
                ReadTimeout::Immediate => return Status::Success,
                ReadTimeout::FirstByte { total } => {
                    self.wait_one = true;
                    self.deadline = now.checked_add(total);
                }
                ReadTimeout::Bounded {
                    interval,
                    per_byte,
                    constant,
                } => {
                    self.deadline = deadline_after(now, per_byte, buf.len(), constant);
                    self.interval = interval.filter(|i| !i.is_zero());
                }
            },
            Operation::Write { .. } | Operation::ImmediateChar(_) => {
                self.deadline = deadline_after(
                    now,
                    timeouts.write_per_byte,
                    self.length(),
                    timeouts.write_constant,
                );
            }
            Operation::Flush | Operation::WaitEvent => {}
        }
        Status::Pending
    }

    /// Apply progress made in the current pass to the timeout policy.
    pub fn note_progress(&mut self, now: Instant) -> Status {
        if self.wait_one {
            return Status::Success;
        }
        if let Some(interval) = self.interval {
            self.interval_deadline = now.checked_add(interval);
        }
        Status::Pending
    }

    pub fn expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now) || self.interval_deadline.is_some_and(|d| d <= now)
    }

    pub fn into_completion(self, side: Side, status: Status, events: EventMask) -> Completion {
        let data = match self.op {
            Operation::Read { mut buf } => {
                buf.truncate(self.done);
                buf
            }
            _ => Vec::new(),
        };
        Completion {
            id: self.id,
            side,
            status,
            transferred: self.done,
            data,
            events,
        }
    }
}

/// Handle returned to the submitter of a queued request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    pub id: RequestId,
    pub side: Side,
    pub(crate) token: Arc<CancelToken>,
}

impl RequestHandle {
    /// Flag the request as cancelled without taking the pair lock. The
    /// cancellation is resolved the next time the engine looks at it.
    pub fn request_cancel(&self) -> bool {
        self.token.cancel()
    }

    pub fn is_finished(&self) -> bool {
        self.token.is_done()
    }
}

/// A request handed back to the device layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: RequestId,
    pub side: Side,
    pub status: Status,
    pub transferred: usize,
    /// Bytes delivered to a read.
    pub data: Vec<u8>,
    /// Events reported to a waiter.
    pub events: EventMask,
}
