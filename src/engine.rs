// engine.rs
//
// Moves bytes from one endpoint's writes into the other endpoint's reads and
// inbound buffer. A pass handles a single direction; `run_pair` keeps
// alternating directions while either side has been unblocked.

use log::{debug, trace, warn};

use crate::flags::{EventMask, Holding, LineErrors};
use crate::flow::{FlowFilter, XChar};
use crate::pair::{Endpoint, PortPair, Side};
use crate::request::{CancelHook, Completion, Operation, Pending, QueueKind, Status};
use crate::ring_buffer::RingBuffer;
use crate::signal;

/// A front request taken out of reach of its owner's cancel for the
/// duration of a pass.
struct Claim {
    hook: CancelHook,
    /// Bytes moved since the claim was taken.
    progress: usize,
}

fn claim_front(ep: &mut Endpoint, kind: QueueKind, out: &mut Vec<Completion>) -> Option<Claim> {
    let side = ep.side;
    let mut cancelled = Vec::new();
    let hook = ep.queue_mut(kind).claim_front(&mut cancelled);
    for req in cancelled {
        debug!("port {}: dropping cancelled request {}", side, req.id);
        out.push(req.into_completion(side, Status::Cancelled, EventMask::empty()));
    }
    hook.map(|hook| Claim { hook, progress: 0 })
}

fn finish_front(ep: &mut Endpoint, kind: QueueKind, claim: Claim, status: Status, out: &mut Vec<Completion>) {
    claim.hook.finish();
    let side = ep.side;
    if let Some(req) = ep.queue_mut(kind).pop_front() {
        trace!("port {}: request {} done, {} bytes", side, req.id, req.done);
        out.push(req.into_completion(side, status, EventMask::empty()));
    }
}

/// End the claim on a front request that could not finish. It is armed for
/// timeout and handed back to its owner, unless the timeout policy or an
/// owner cancel finishes it right here.
fn stop_front(ep: &mut Endpoint, kind: QueueKind, claim: Claim, out: &mut Vec<Completion>) {
    let now = ep.clock.now();
    let timeouts = ep.timeouts;
    let side = ep.side;
    let queue = ep.queue_mut(kind);

    let mut status = match queue.front_mut() {
        Some(front) => {
            let mut status = front.arm(&timeouts, now);
            if status.is_pending() && claim.progress > 0 {
                status = front.note_progress(now);
            }
            status
        }
        None => unreachable!("claimed request left the queue of port {}", side),
    };

    if status.is_pending() {
        if claim.hook.restore() {
            return;
        }
        status = Status::Cancelled;
    } else {
        claim.hook.finish();
    }

    if let Some(req) = queue.pop_front() {
        out.push(req.into_completion(side, status, EventMask::empty()));
    }
}

/// Move buffered bytes into a read until it is full or the ring, insert slot
/// included, is drained.
fn drain_ring(ring: &mut RingBuffer, read: &mut Pending) -> usize {
    let mut total = 0;
    loop {
        let n = ring.read(read.unfilled());
        if n == 0 {
            return total;
        }
        read.done += n;
        total += n;
    }
}

/// Re-evaluate receive-side flow control after the inbound buffer level
/// changed.
pub(crate) fn update_handflow(ep: &mut Endpoint) {
    let hf = &ep.handflow;
    if !hf.receive_flow_enabled() {
        return;
    }
    let capacity = ep.ring.capacity();
    let busy = ep.ring.busy();

    if !ep.flow_paused && busy > hf.xoff_threshold(capacity) {
        ep.flow_paused = true;
        if hf.auto_receive {
            ep.send_xon_xoff = Some(XChar::Xoff);
            ep.try_write = true;
        }
        if hf.rts_handshake {
            ep.rts = false;
        }
        if hf.dtr_handshake {
            ep.dtr = false;
        }
        debug!("port {}: receive paused at {} bytes", ep.side, busy);
    } else if ep.flow_paused && busy <= hf.xon_threshold(capacity) {
        ep.flow_paused = false;
        if hf.auto_receive {
            if ep.send_xon_xoff == Some(XChar::Xoff) {
                // XOFF never left; nothing to undo.
                ep.send_xon_xoff = None;
            } else {
                ep.send_xon_xoff = Some(XChar::Xon);
                ep.try_write = true;
            }
        }
        if hf.rts_handshake {
            ep.rts = true;
        }
        if hf.dtr_handshake {
            ep.dtr = true;
        }
        debug!("port {}: receive resumed at {} bytes", ep.side, busy);
    }
}

/// Apply an XON/XOFF received by `ep`.
fn set_xon_xoff_holding(ep: &mut Endpoint, last: Option<XChar>) {
    if !ep.handflow.auto_transmit {
        return;
    }
    match last {
        Some(XChar::Xoff) => ep.holding.insert(Holding::WAITING_FOR_XON),
        Some(XChar::Xon) if ep.holding.contains(Holding::WAITING_FOR_XON) => {
            ep.holding.remove(Holding::WAITING_FOR_XON);
            ep.try_write = true;
        }
        _ => {}
    }
}

/// Data was lost on its way into `ep`.
pub(crate) fn alert_overrun(ep: &mut Endpoint, out: &mut Vec<Completion>) {
    ep.errors.insert(LineErrors::QUEUE_OVERRUN);
    if ep.handflow.error_char {
        ep.ring.write_mandatory(ep.chars.error);
    }
    if ep.handflow.abort_on_error {
        ep.cancel_queue(QueueKind::Read, out);
        ep.cancel_queue(QueueKind::Write, out);
    }
    signal::raise_events(ep, EventMask::ERR, out);
}

/// Inject out-of-band bytes into `ep`'s own inbound stream: pending reads
/// first, then the ring, then the insert slot. Without room the bytes are
/// lost and an overrun is raised.
pub(crate) fn insert(ep: &mut Endpoint, bytes: &[u8], out: &mut Vec<Completion>) -> Status {
    let mut rest = bytes;

    while !rest.is_empty() {
        let Some(mut claim) = claim_front(ep, QueueKind::Read, out) else {
            break;
        };
        let (front, ring) = ep.inbound();
        let Some(front) = front else {
            unreachable!("claimed read left the queue");
        };
        let drained = drain_ring(ring, front);
        let mut copied = 0;
        if ring.is_drained() {
            let dst = front.unfilled();
            copied = rest.len().min(dst.len());
            dst[..copied].copy_from_slice(&rest[..copied]);
            front.done += copied;
            rest = &rest[copied..];
        }
        claim.progress += drained + copied;

        if front.remaining() == 0 {
            finish_front(ep, QueueKind::Read, claim, Status::Success, out);
        } else {
            stop_front(ep, QueueKind::Read, claim, out);
            break;
        }
    }

    let mut status = Status::Success;
    if !rest.is_empty() {
        let written = ep.ring.write(rest);
        let rest = &rest[written..];
        if !rest.is_empty() && (ep.options.emulate_overrun || !ep.ring.insert_pending(rest)) {
            warn!("port {}: {} inserted bytes lost", ep.side, rest.len());
            alert_overrun(ep, out);
            status = Status::BufferOverrun;
        }
    }
    update_handflow(ep);
    status
}

/// One pass of the direction `wr -> rd`.
struct Transfer<'a> {
    rd: &'a mut Endpoint,
    wr: &'a mut Endpoint,
    busy_beg: usize,
    read: Option<Claim>,
    write: Option<Claim>,
    was_write: bool,
}

impl<'a> Transfer<'a> {
    fn new(rd: &'a mut Endpoint, wr: &'a mut Endpoint) -> Self {
        let busy_beg = rd.ring.busy();
        Self {
            rd,
            wr,
            busy_beg,
            read: None,
            write: None,
            was_write: false,
        }
    }

    fn run(mut self, out: &mut Vec<Completion>) {
        if self.wr.has_output() {
            self.wr.pacing.start();
        }

        self.drain_reads(out);
        self.after_drain(out);
        self.run_direct(out);
        if let Some(claim) = self.read.take() {
            stop_front(self.rd, QueueKind::Read, claim, out);
        }
        self.run_buffered(out);

        if self.was_write && self.wr.queue(QueueKind::Write).is_empty() {
            signal::raise_events(self.wr, EventMask::TXEMPTY, out);
        }
        if !self.wr.has_output() {
            self.wr.pacing.stop();
        }
    }

    fn allowance(&self) -> usize {
        self.wr.pacing.remaining_allowance().unwrap_or(usize::MAX)
    }

    /// Anything but a missing XON keeps the XON/XOFF byte from going out.
    fn xchar_allowed(&self) -> bool {
        (self.wr.holding & !Holding::WAITING_FOR_XON).is_empty()
    }

    fn write_front_is_flush(&self) -> bool {
        self.wr
            .queue(QueueKind::Write)
            .front()
            .is_some_and(|r| matches!(r.op, Operation::Flush))
    }

    /// Satisfy pending reads from the inbound ring.
    fn drain_reads(&mut self, out: &mut Vec<Completion>) {
        loop {
            if self.read.is_none() {
                self.read = claim_front(self.rd, QueueKind::Read, out);
            }
            let Some(claim) = self.read.as_mut() else {
                return;
            };
            let (front, ring) = self.rd.inbound();
            let Some(front) = front else {
                unreachable!("claimed read left the queue");
            };
            claim.progress += drain_ring(ring, front);
            if front.remaining() > 0 {
                return;
            }
            if let Some(claim) = self.read.take() {
                finish_front(self.rd, QueueKind::Read, claim, Status::Success, out);
            }
        }
    }

    fn after_drain(&mut self, out: &mut Vec<Completion>) {
        let busy = self.rd.ring.busy();
        if busy < self.busy_beg {
            update_handflow(self.rd);
            signal::refresh_inputs(self.wr, self.rd, out);
            self.busy_beg = busy;
        }
    }

    /// Bookkeeping for bytes that crossed to the reader.
    fn on_rx_chars(&mut self, filter: &FlowFilter, n: usize, out: &mut Vec<Completion>) {
        if n == 0 {
            return;
        }
        self.wr.pacing.consume(n);
        set_xon_xoff_holding(self.rd, filter.last_xon_xoff);

        let mut events = EventMask::empty();
        events.set(EventMask::RXCHAR, filter.rx_char);
        events.set(EventMask::RXFLAG, filter.rx_flag);
        signal::raise_events(self.rd, events, out);

        self.rd.stats.received += n as u64;
        self.wr.stats.transmitted += n as u64;
    }

    /// Copy straight from writes into reads while the ring is empty.
    fn run_direct(&mut self, out: &mut Vec<Completion>) {
        loop {
            self.drain_reads(out);
            if self.read.is_none() {
                return;
            }

            if let Some(x) = self.wr.send_xon_xoff {
                if !self.xchar_allowed() {
                    self.wr.pacing.discard();
                    return;
                }
                if self.allowance() == 0 {
                    return;
                }
                let byte = [self.wr.chars.byte_for(x)];
                let (written, filter) = self.copy_direct(&byte);
                if written == 0 {
                    return;
                }
                self.wr.send_xon_xoff = None;
                self.on_rx_chars(&filter, written, out);
                continue;
            }

            if self.write.is_none() {
                self.write = claim_front(self.wr, QueueKind::Write, out);
            }
            if self.write.is_none() {
                return;
            }
            if self.write_front_is_flush() {
                if let Some(claim) = self.write.take() {
                    finish_front(self.wr, QueueKind::Write, claim, Status::Success, out);
                }
                continue;
            }
            if !self.wr.holding.is_empty() {
                self.wr.pacing.discard();
                return;
            }
            let allow = self.allowance();
            if allow == 0 {
                return;
            }

            let (written, filter) = self.copy_write_direct(allow);
            if written == 0 {
                return;
            }
            self.was_write = true;
            self.on_rx_chars(&filter, written, out);
            self.finish_write_if_done(out);
        }
    }

    /// Direct copy of `src` into the front read. Returns the number of
    /// source bytes taken.
    fn copy_direct(&mut self, src: &[u8]) -> (usize, FlowFilter) {
        let mut filter = FlowFilter::new(&self.rd.chars, self.rd.escape);
        let (front, ring) = self.rd.inbound();
        let Some(front) = front else {
            return (0, filter);
        };
        let (read_done, write_done) = filter.copy_direct(src, front.unfilled(), ring);
        front.done += read_done;
        if let Some(claim) = self.read.as_mut() {
            claim.progress += read_done;
        }
        (write_done, filter)
    }

    fn copy_write_direct(&mut self, allow: usize) -> (usize, FlowFilter) {
        let mut filter = FlowFilter::new(&self.rd.chars, self.rd.escape);
        let (Some(read), ring) = self.rd.inbound() else {
            return (0, filter);
        };
        let Some(write) = self.wr.queue_mut(QueueKind::Write).front_mut() else {
            return (0, filter);
        };
        let unsent = write.unsent();
        let src = &unsent[..unsent.len().min(allow)];
        let (read_done, write_done) = filter.copy_direct(src, read.unfilled(), ring);
        read.done += read_done;
        write.done += write_done;

        if let Some(claim) = self.read.as_mut() {
            claim.progress += read_done;
        }
        if let Some(claim) = self.write.as_mut() {
            claim.progress += write_done;
        }
        (write_done, filter)
    }

    fn finish_write_if_done(&mut self, out: &mut Vec<Completion>) {
        let done = self
            .wr
            .queue(QueueKind::Write)
            .front()
            .is_some_and(|r| r.remaining() == 0);
        if done {
            if let Some(claim) = self.write.take() {
                finish_front(self.wr, QueueKind::Write, claim, Status::Success, out);
            }
        }
    }

    /// RX80FULL and flow control after bytes entered the ring.
    fn after_buffer_write(&mut self, out: &mut Vec<Completion>) {
        let end = self.rd.ring.busy();
        if end <= self.busy_beg {
            return;
        }
        let size80 = self.rd.ring.size80();
        if end > size80 && self.busy_beg <= size80 {
            signal::raise_events(self.rd, EventMask::RX80FULL, out);
        }
        update_handflow(self.rd);
        signal::refresh_inputs(self.wr, self.rd, out);
        self.busy_beg = end;
    }

    /// Overrun emulation drops what does not fit instead of holding the
    /// writer.
    fn overrun_applies(&self) -> bool {
        self.rd.options.emulate_overrun && self.rd.ring.is_full() && self.wr.holding.is_empty()
    }

    fn run_buffered(&mut self, out: &mut Vec<Completion>) {
        if let Some(x) = self.wr.send_xon_xoff {
            if !self.xchar_allowed() {
                self.wr.pacing.discard();
            } else if self.allowance() > 0 {
                let byte = [self.wr.chars.byte_for(x)];
                let mut filter = FlowFilter::new(&self.rd.chars, self.rd.escape);
                let mut sent = filter.copy_to_buffer(&byte, &mut self.rd.ring);
                self.on_rx_chars(&filter, sent, out);
                self.after_buffer_write(out);
                if sent == 0 && self.rd.options.emulate_overrun && self.rd.ring.is_full() {
                    let mut filter = FlowFilter::new(&self.rd.chars, self.rd.escape);
                    sent = filter.discard(&byte);
                    self.rd.stats.overrun += sent as u64;
                    self.on_rx_chars(&filter, sent, out);
                    alert_overrun(self.rd, out);
                }
                if sent > 0 {
                    self.wr.send_xon_xoff = None;
                }
            }
        }

        loop {
            if self.write.is_none() {
                self.write = claim_front(self.wr, QueueKind::Write, out);
            }
            if self.write.is_none() {
                return;
            }
            if self.write_front_is_flush() {
                if let Some(claim) = self.write.take() {
                    finish_front(self.wr, QueueKind::Write, claim, Status::Success, out);
                }
                continue;
            }

            if !self.wr.holding.is_empty() {
                self.wr.pacing.discard();
            } else if self.allowance() > 0 {
                if !self.rd.is_open() {
                    self.write_to_void();
                } else {
                    self.write_to_buffer(out);
                    if self.overrun_applies() && self.allowance() > 0 {
                        self.write_overrun(out);
                    }
                }
            }

            let done = self
                .wr
                .queue(QueueKind::Write)
                .front()
                .is_some_and(|r| r.remaining() == 0);
            let Some(claim) = self.write.take() else {
                return;
            };
            if done {
                finish_front(self.wr, QueueKind::Write, claim, Status::Success, out);
            } else {
                stop_front(self.wr, QueueKind::Write, claim, out);
                return;
            }
        }
    }

    /// Take as much of the front write as the ring accepts.
    fn write_to_buffer(&mut self, out: &mut Vec<Completion>) {
        let allow = self.allowance();
        let mut filter = FlowFilter::new(&self.rd.chars, self.rd.escape);
        let Some(write) = self.wr.queue_mut(QueueKind::Write).front_mut() else {
            return;
        };
        let unsent = write.unsent();
        let src = &unsent[..unsent.len().min(allow)];
        let taken = filter.copy_to_buffer(src, &mut self.rd.ring);
        write.done += taken;
        if let Some(claim) = self.write.as_mut() {
            claim.progress += taken;
        }
        if taken > 0 {
            self.was_write = true;
            self.on_rx_chars(&filter, taken, out);
            self.after_buffer_write(out);
        }
    }

    /// Consume what no longer fits and record it as lost.
    fn write_overrun(&mut self, out: &mut Vec<Completion>) {
        let allow = self.allowance();
        let mut filter = FlowFilter::new(&self.rd.chars, self.rd.escape);
        let Some(write) = self.wr.queue_mut(QueueKind::Write).front_mut() else {
            return;
        };
        let unsent = write.unsent();
        let lost = filter.discard(&unsent[..unsent.len().min(allow)]);
        write.done += lost;
        if let Some(claim) = self.write.as_mut() {
            claim.progress += lost;
        }
        if lost == 0 {
            return;
        }
        debug!("port {}: overrun, {} bytes lost", self.rd.side, lost);
        self.was_write = true;
        self.rd.stats.overrun += lost as u64;
        self.on_rx_chars(&filter, lost, out);
        alert_overrun(self.rd, out);
    }

    /// Nobody is listening on the other end; the line still carries the
    /// bytes at the configured pace.
    fn write_to_void(&mut self) {
        let allow = self.allowance();
        let Some(write) = self.wr.queue_mut(QueueKind::Write).front_mut() else {
            return;
        };
        let n = write.remaining().min(allow);
        write.done += n;
        if let Some(claim) = self.write.as_mut() {
            claim.progress += n;
        }
        if n > 0 {
            self.was_write = true;
            self.wr.pacing.consume(n);
            self.wr.stats.transmitted += n as u64;
        }
    }
}

impl PortPair {
    /// Run both directions, starting with `first_writer` as the source, until
    /// neither side can make further progress.
    pub(crate) fn run_pair(&mut self, first_writer: Side, out: &mut Vec<Completion>) {
        let mut writer = first_writer;
        loop {
            self.endpoint_mut(writer).try_write = false;
            let (wr, rd) = self.split_mut(writer);
            Transfer::new(rd, wr).run(out);
            self.refresh_inputs(out);

            if self.endpoint(writer.peer()).try_write {
                writer = writer.peer();
            } else if !self.endpoint(writer).try_write {
                break;
            }
        }
    }
}
