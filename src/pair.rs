// pair.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::flags::{EventMask, Holding, LineErrors, ModemStatus, PurgeFlags};
use crate::flow::{HandFlow, SpecialChars, XChar};
use crate::pacing::{LineControl, PacingLimiter};
use crate::params::PortOptions;
use crate::queue::RequestQueue;
use crate::request::{
    Completion, IoRequest, Operation, Pending, QueueKind, RequestHandle, Status, Timeouts,
};
use crate::ring_buffer::RingBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::A, Side::B];

    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModemError {
    #[error("port {0} is not open")]
    NotOpen(Side),
    #[error("port {0} is already open in exclusive mode")]
    Busy(Side),
    #[error("port {0} cannot open while its peer is closed")]
    NotConnected(Side),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("completion channel closed")]
    Closed,
}

/// Configuration of one endpoint.
#[derive(Debug, Clone)]
pub struct PortConfig {
    pub buffer_size: usize,
    /// Period of the pacing timer.
    pub pacing_tick: Duration,
    pub options: PortOptions,
    pub line: LineControl,
    pub chars: SpecialChars,
    pub handflow: HandFlow,
    pub timeouts: Timeouts,
    /// In-band status reporting escape character.
    pub escape: Option<u8>,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            buffer_size: 4096,
            pacing_tick: Duration::from_millis(10),
            options: PortOptions::default(),
            line: LineControl::default(),
            chars: SpecialChars::default(),
            handflow: HandFlow::default(),
            timeouts: Timeouts::default(),
            escape: None,
        }
    }
}

/// Performance counters of one endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfStats {
    pub received: u64,
    pub transmitted: u64,
    pub overrun: u64,
    /// Character times the line has used or idled away while paced.
    pub sent_frames: u64,
}

/// Snapshot returned by [`PortPair::comm_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommStatus {
    /// Line errors accumulated since the previous call.
    pub errors: LineErrors,
    pub holding: Holding,
    /// Bytes waiting in the inbound buffer.
    pub in_queue: usize,
    /// Bytes queued for transmission.
    pub out_queue: usize,
}

/// Result of [`PortPair::submit`].
#[derive(Debug)]
pub struct Dispatch {
    /// Status of the submitted request; `Pending` while it is queued.
    pub status: Status,
    pub handle: RequestHandle,
    /// Every request finished by this call, the submitted one included.
    pub completed: Vec<Completion>,
}

/// One side of the pair.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub side: Side,
    pub ring: RingBuffer,
    pub queues: [RequestQueue; 3],
    pub open_count: usize,
    pub options: PortOptions,
    pub line: LineControl,
    pub chars: SpecialChars,
    pub handflow: HandFlow,
    pub timeouts: Timeouts,
    pub escape: Option<u8>,
    pub pacing: PacingLimiter,
    pub pacing_tick: Duration,
    pub modem_status: ModemStatus,
    pub wait_mask: EventMask,
    pub events: EventMask,
    pub holding: Holding,
    pub errors: LineErrors,
    pub stats: PerfStats,
    pub rts: bool,
    pub dtr: bool,
    /// XON/XOFF owed to the peer.
    pub send_xon_xoff: Option<XChar>,
    /// Receive side asked the peer to pause.
    pub flow_paused: bool,
    /// Outbound direction became unblocked and should be retried.
    pub try_write: bool,
    pub clock: Arc<dyn Clock>,
}

impl Endpoint {
    fn new(side: Side, config: PortConfig, clock: Arc<dyn Clock>) -> Self {
        let mut pacing = PacingLimiter::new(&config.line, config.pacing_tick);
        pacing.set_enabled(config.options.emulate_baud_rate);
        Self {
            side,
            ring: RingBuffer::new(config.buffer_size),
            queues: Default::default(),
            open_count: 0,
            options: config.options,
            line: config.line,
            chars: config.chars,
            handflow: config.handflow,
            timeouts: config.timeouts,
            escape: config.escape,
            pacing,
            pacing_tick: config.pacing_tick,
            modem_status: ModemStatus::empty(),
            wait_mask: EventMask::empty(),
            events: EventMask::empty(),
            holding: Holding::empty(),
            errors: LineErrors::empty(),
            stats: PerfStats::default(),
            rts: false,
            dtr: false,
            send_xon_xoff: None,
            flow_paused: false,
            try_write: false,
            clock,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_count > 0
    }

    pub fn queue(&self, kind: QueueKind) -> &RequestQueue {
        &self.queues[kind.index()]
    }

    pub fn queue_mut(&mut self, kind: QueueKind) -> &mut RequestQueue {
        &mut self.queues[kind.index()]
    }

    /// Bytes still to be transmitted by queued writes.
    pub fn amount_in_write_queue(&self) -> usize {
        self.queue(QueueKind::Write).iter().map(|r| r.unsent().len()).sum()
    }

    /// Front pending read together with the ring it drains.
    pub fn inbound(&mut self) -> (Option<&mut Pending>, &mut RingBuffer) {
        (self.queues[QueueKind::Read.index()].front_mut(), &mut self.ring)
    }

    pub fn has_output(&self) -> bool {
        self.send_xon_xoff.is_some() || !self.queue(QueueKind::Write).is_empty()
    }

    /// Complete every request in `kind` as cancelled. A claimed front only
    /// gets flagged and is resolved when its claim ends.
    pub fn cancel_queue(&mut self, kind: QueueKind, out: &mut Vec<Completion>) {
        let side = self.side;
        for req in self.queue_mut(kind).cancel_all() {
            debug!("port {}: cancelled request {}", side, req.id);
            out.push(req.into_completion(side, Status::Cancelled, EventMask::empty()));
        }
    }

    fn reset_line_state(&mut self) {
        self.ring.clear();
        self.events = EventMask::empty();
        self.holding.remove(Holding::WAITING_FOR_XON);
        self.send_xon_xoff = None;
        self.flow_paused = false;
        self.try_write = false;
        self.pacing.stop();
    }
}

/// A linked pair of virtual serial endpoints.
///
/// All mutation goes through `&mut self`; wrap the pair in a lock (see
/// [`NullModem`](crate::NullModem)) to share it between threads. Every
/// operation returns the requests it finished.
#[derive(Debug)]
pub struct PortPair {
    pub(crate) endpoints: [Endpoint; 2],
}

impl PortPair {
    pub fn new(a: PortConfig, b: PortConfig) -> Self {
        Self::with_clock(a, b, Arc::new(SystemClock))
    }

    pub fn with_clock(a: PortConfig, b: PortConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoints: [
                Endpoint::new(Side::A, a, Arc::clone(&clock)),
                Endpoint::new(Side::B, b, clock),
            ],
        }
    }

    pub(crate) fn endpoint(&self, side: Side) -> &Endpoint {
        &self.endpoints[side.index()]
    }

    pub(crate) fn endpoint_mut(&mut self, side: Side) -> &mut Endpoint {
        &mut self.endpoints[side.index()]
    }

    /// Mutable access to `side` and its peer at once.
    pub(crate) fn split_mut(&mut self, side: Side) -> (&mut Endpoint, &mut Endpoint) {
        let [a, b] = &mut self.endpoints;
        match side {
            Side::A => (a, b),
            Side::B => (b, a),
        }
    }

    pub fn is_open(&self, side: Side) -> bool {
        self.endpoint(side).is_open()
    }

    pub fn open(&mut self, side: Side) -> Result<Vec<Completion>, ModemError> {
        let (ep, peer) = self.split_mut(side);
        if ep.is_open() && ep.options.exclusive_mode {
            return Err(ModemError::Busy(side));
        }
        if ep.options.plug_in_mode && !peer.is_open() {
            return Err(ModemError::NotConnected(side));
        }

        ep.open_count += 1;
        let mut out = Vec::new();
        if ep.open_count == 1 {
            ep.reset_line_state();
            ep.errors = LineErrors::empty();
            ep.rts = true;
            ep.dtr = true;
            info!("port {} opened", side);
            self.settle(&mut out);
        }
        Ok(out)
    }

    pub fn close(&mut self, side: Side) -> Result<Vec<Completion>, ModemError> {
        let ep = self.endpoint_mut(side);
        if !ep.is_open() {
            return Err(ModemError::NotOpen(side));
        }

        ep.open_count -= 1;
        let mut out = Vec::new();
        if ep.open_count == 0 {
            for kind in QueueKind::ALL {
                ep.cancel_queue(kind, &mut out);
            }
            ep.reset_line_state();
            ep.rts = false;
            ep.dtr = false;
            ep.wait_mask = EventMask::empty();
            info!("port {} closed", side);
            self.settle(&mut out);
            // Writes held by the peer now drain into the void.
            self.run_pair(side.peer(), &mut out);
        }
        Ok(out)
    }

    /// Queue a request on `side` and run the transfer engine.
    pub fn submit(&mut self, side: Side, request: IoRequest) -> Result<Dispatch, ModemError> {
        let ep = self.endpoint_mut(side);
        if !ep.is_open() {
            return Err(ModemError::NotOpen(side));
        }

        let mut completed = Vec::new();
        let (req, kind) = match request {
            IoRequest::Insert(bytes) => {
                let req = Pending::new(Operation::Flush);
                let handle = self.handle_for(side, &req);
                let status = crate::engine::insert(self.endpoint_mut(side), &bytes, &mut completed);
                if let Some(hook) = req.claim() {
                    hook.finish();
                }
                self.run_pair(side.peer(), &mut completed);
                return Ok(Dispatch {
                    status,
                    handle,
                    completed,
                });
            }
            IoRequest::Read { len } => (Pending::new(Operation::Read { buf: vec![0u8; len] }), QueueKind::Read),
            IoRequest::Write(data) => (Pending::new(Operation::Write { data }), QueueKind::Write),
            IoRequest::ImmediateChar(c) => (Pending::new(Operation::ImmediateChar(c)), QueueKind::Write),
            IoRequest::Flush => (Pending::new(Operation::Flush), QueueKind::Write),
            IoRequest::WaitEvent => (Pending::new(Operation::WaitEvent), QueueKind::Wait),
        };

        let handle = self.handle_for(side, &req);
        let id = req.id;
        let ep = self.endpoint_mut(side);

        match kind {
            QueueKind::Wait => {
                if !ep.queue(QueueKind::Wait).is_empty() {
                    return Err(ModemError::InvalidRequest(format!(
                        "port {} already has a pending wait",
                        side
                    )));
                }
                if ep.wait_mask.is_empty() {
                    return Err(ModemError::InvalidRequest(format!("port {} has an empty wait mask", side)));
                }
                ep.queue_mut(QueueKind::Wait).push_back(req);
                crate::signal::wait_complete(ep, &mut completed);
            }
            _ if req.length() == 0 && !matches!(req.op, Operation::Flush) => {
                if let Some(hook) = req.claim() {
                    hook.finish();
                }
                completed.push(req.into_completion(side, Status::Success, EventMask::empty()));
            }
            QueueKind::Read => {
                ep.queue_mut(QueueKind::Read).push_back(req);
                self.run_pair(side.peer(), &mut completed);
            }
            QueueKind::Write => {
                if matches!(req.op, Operation::ImmediateChar(_)) {
                    ep.queue_mut(QueueKind::Write).push_priority(req);
                } else {
                    ep.queue_mut(QueueKind::Write).push_back(req);
                }
                self.run_pair(side, &mut completed);
            }
        }

        let status = completed
            .iter()
            .find(|c| c.id == id)
            .map_or(Status::Pending, |c| c.status);
        Ok(Dispatch {
            status,
            handle,
            completed,
        })
    }

    fn handle_for(&self, side: Side, req: &Pending) -> RequestHandle {
        RequestHandle {
            id: req.id,
            side,
            token: Arc::clone(&req.token),
        }
    }

    /// Cancel a request on behalf of its owner.
    pub fn cancel(&mut self, handle: &RequestHandle) -> Vec<Completion> {
        let mut out = Vec::new();
        if !handle.request_cancel() {
            return out;
        }
        let side = handle.side;
        let ep = self.endpoint_mut(side);
        for kind in QueueKind::ALL {
            for req in ep.queue_mut(kind).take_cancelled() {
                debug!("port {}: request {} cancelled by owner", side, req.id);
                out.push(req.into_completion(side, Status::Cancelled, EventMask::empty()));
            }
        }
        self.run_pair(side, &mut out);
        out
    }

    pub fn configure(&mut self, side: Side, options: PortOptions) -> Vec<Completion> {
        let ep = self.endpoint_mut(side);
        ep.pacing.set_enabled(options.emulate_baud_rate);
        ep.options = options;
        let mut out = Vec::new();
        self.settle(&mut out);
        self.run_pair(side, &mut out);
        out
    }

    pub fn options(&self, side: Side) -> &PortOptions {
        &self.endpoint(side).options
    }

    /// Timer entry point: advance `side`'s pacing, expire overdue requests
    /// and retry transfers.
    pub fn on_timer_tick(&mut self, side: Side) -> Vec<Completion> {
        let mut out = Vec::new();
        let ep = self.endpoint_mut(side);
        let now = ep.clock.now();
        ep.pacing.on_tick();
        for kind in [QueueKind::Read, QueueKind::Write] {
            loop {
                let found = ep.queue(kind).iter().position(|r| r.expired(now));
                let Some(index) = found else { break };
                let Some((req, cancelled)) = ep.queue_mut(kind).remove_settled(index) else {
                    break;
                };
                let status = if cancelled { Status::Cancelled } else { Status::TimedOut };
                debug!("port {}: request {} finished {:?} on timer", side, req.id, status);
                out.push(req.into_completion(side, status, EventMask::empty()));
            }
        }
        self.run_pair(side, &mut out);
        out
    }

    /// Smallest pacing period of the two endpoints.
    pub fn tick_interval(&self) -> Duration {
        self.endpoints
            .iter()
            .map(|ep| ep.pacing_tick)
            .min()
            .unwrap_or(Duration::from_millis(10))
    }

    pub fn purge(&mut self, side: Side, flags: PurgeFlags) -> Vec<Completion> {
        let mut out = Vec::new();
        let ep = self.endpoint_mut(side);
        if flags.contains(PurgeFlags::TXABORT) {
            ep.cancel_queue(QueueKind::Write, &mut out);
        }
        if flags.contains(PurgeFlags::RXABORT) {
            ep.cancel_queue(QueueKind::Read, &mut out);
        }
        if flags.contains(PurgeFlags::RXCLEAR) {
            ep.ring.clear();
            crate::engine::update_handflow(ep);
            self.settle(&mut out);
            self.run_pair(side.peer(), &mut out);
        }
        out
    }

    /// Line errors since the last call, plus queue and holding state.
    pub fn comm_status(&mut self, side: Side) -> CommStatus {
        let ep = self.endpoint_mut(side);
        CommStatus {
            errors: std::mem::take(&mut ep.errors),
            holding: ep.holding,
            in_queue: ep.ring.busy() + ep.ring.pending_insert_len(),
            out_queue: ep.amount_in_write_queue(),
        }
    }

    pub fn stats(&self, side: Side) -> PerfStats {
        let ep = self.endpoint(side);
        PerfStats {
            sent_frames: ep.pacing.sent_frames(),
            ..ep.stats
        }
    }

    pub fn clear_stats(&mut self, side: Side) {
        let ep = self.endpoint_mut(side);
        ep.stats = PerfStats::default();
        ep.pacing.clear_sent_frames();
    }

    pub fn set_special_chars(&mut self, side: Side, chars: SpecialChars) {
        self.endpoint_mut(side).chars = chars;
    }

    pub fn special_chars(&self, side: Side) -> SpecialChars {
        self.endpoint(side).chars
    }

    /// Replace handshake and flow settings. Holding and receive-side flow
    /// control are re-evaluated right away.
    pub fn set_handflow(&mut self, side: Side, handflow: HandFlow) -> Vec<Completion> {
        let mut out = Vec::new();
        let ep = self.endpoint_mut(side);
        if !handflow.auto_transmit {
            ep.holding.remove(Holding::WAITING_FOR_XON);
        }
        if ep.flow_paused {
            if ep.handflow.rts_handshake && !handflow.rts_handshake {
                ep.rts = true;
            }
            if ep.handflow.dtr_handshake && !handflow.dtr_handshake {
                ep.dtr = true;
            }
            if !handflow.receive_flow_enabled() {
                ep.flow_paused = false;
            }
        }
        ep.handflow = handflow;
        crate::signal::update_modem_holding(ep);
        crate::engine::update_handflow(ep);
        self.settle(&mut out);
        for s in Side::BOTH {
            self.run_pair(s, &mut out);
        }
        out
    }

    pub fn handflow(&self, side: Side) -> &HandFlow {
        &self.endpoint(side).handflow
    }

    pub fn set_timeouts(&mut self, side: Side, timeouts: Timeouts) {
        self.endpoint_mut(side).timeouts = timeouts;
    }

    pub fn timeouts(&self, side: Side) -> Timeouts {
        self.endpoint(side).timeouts
    }

    pub fn set_line_control(&mut self, side: Side, line: LineControl) {
        let ep = self.endpoint_mut(side);
        ep.line = line;
        let tick = ep.pacing_tick;
        ep.pacing.set_line(&line, tick);
    }

    pub fn line_control(&self, side: Side) -> LineControl {
        self.endpoint(side).line
    }

    pub fn set_escape_char(&mut self, side: Side, escape: Option<u8>) {
        self.endpoint_mut(side).escape = escape;
    }

    pub fn wait_mask(&self, side: Side) -> EventMask {
        self.endpoint(side).wait_mask
    }

    pub fn holding(&self, side: Side) -> Holding {
        self.endpoint(side).holding
    }

    /// Output lines (RTS, DTR) of `side`.
    pub fn control_lines(&self, side: Side) -> (bool, bool) {
        let ep = self.endpoint(side);
        (ep.rts, ep.dtr)
    }
}
