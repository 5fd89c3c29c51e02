// signal.rs
//
// Modem status of each endpoint is derived from the output lines of both
// endpoints through a pin map, the way a null-modem cable cross-wires them.

use log::{debug, warn};

use crate::flags::{EventMask, Holding, ModemStatus};
use crate::flow::LSRMST_MST;
use crate::pair::{Endpoint, PortPair, Side};
use crate::request::{Completion, QueueKind, Status};

/// Signal an input pin is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinLine {
    RemoteRts,
    RemoteDtr,
    /// High while the peer is open.
    RemoteOpen,
    LocalRts,
    LocalDtr,
    LocalOpen,
    /// Always high.
    On,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSource {
    pub line: PinLine,
    pub invert: bool,
}

impl PinSource {
    pub const fn new(line: PinLine) -> Self {
        Self { line, invert: false }
    }

    pub const fn inverted(line: PinLine) -> Self {
        Self { line, invert: true }
    }

    fn level(self, local: &Endpoint, remote: &Endpoint) -> bool {
        let level = match self.line {
            PinLine::RemoteRts => remote.rts,
            PinLine::RemoteDtr => remote.dtr,
            PinLine::RemoteOpen => remote.is_open(),
            PinLine::LocalRts => local.rts,
            PinLine::LocalDtr => local.dtr,
            PinLine::LocalOpen => local.is_open(),
            PinLine::On => true,
        };
        level != self.invert
    }
}

/// Wiring of an endpoint's input pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinMap {
    pub cts: PinSource,
    pub dsr: PinSource,
    /// `None` makes carrier detect follow DSR.
    pub dcd: Option<PinSource>,
    pub ri: PinSource,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            cts: PinSource::new(PinLine::RemoteRts),
            dsr: PinSource::new(PinLine::RemoteDtr),
            dcd: None,
            ri: PinSource::inverted(PinLine::On),
        }
    }
}

const INPUT_PINS: ModemStatus = ModemStatus::from_bits(
    ModemStatus::CTS.bits() | ModemStatus::DSR.bits() | ModemStatus::RING.bits() | ModemStatus::RLSD.bits(),
);

fn input_status(local: &Endpoint, remote: &Endpoint) -> ModemStatus {
    let pins = &local.options.pins;
    let mut status = ModemStatus::empty();
    status.set(ModemStatus::CTS, pins.cts.level(local, remote));
    status.set(ModemStatus::DSR, pins.dsr.level(local, remote));
    status.set(ModemStatus::RING, pins.ri.level(local, remote));
    if let Some(dcd) = pins.dcd {
        status.set(ModemStatus::RLSD, dcd.level(local, remote));
    }
    status
}

/// Recompute `local`'s inputs from the current output lines.
pub(crate) fn refresh_inputs(local: &mut Endpoint, remote: &Endpoint, out: &mut Vec<Completion>) {
    let bits = input_status(local, remote);
    set_modem_status(local, bits, INPUT_PINS, out);
}

/// Merge `bits` under `mask` into the modem status and react to the change.
pub(crate) fn set_modem_status(ep: &mut Endpoint, bits: ModemStatus, mask: ModemStatus, out: &mut Vec<Completion>) {
    let old = ep.modem_status;
    let mut status = (old & !mask) | (bits & mask);
    if ep.options.pins.dcd.is_none() {
        let dsr = status.contains(ModemStatus::DSR);
        status.set(ModemStatus::RLSD, dsr);
    }
    ep.modem_status = status;

    let changed = old ^ status;
    if changed.is_empty() {
        return;
    }
    debug!("port {}: modem status {:#04x} (changed {:#04x})", ep.side, status.bits(), changed.bits());

    update_modem_holding(ep);

    if let Some(escape) = ep.escape {
        let report = [escape, LSRMST_MST, status.bits() | (changed.bits() >> 4)];
        if crate::engine::insert(ep, &report, out) != Status::Success {
            warn!("port {}: lost modem status report", ep.side);
        }
    }

    let mut events = EventMask::empty();
    events.set(EventMask::CTS, changed.contains(ModemStatus::CTS));
    events.set(EventMask::DSR, changed.contains(ModemStatus::DSR));
    events.set(EventMask::RING, changed.contains(ModemStatus::RING));
    events.set(EventMask::RLSD, changed.contains(ModemStatus::RLSD));
    raise_events(ep, events, out);
}

/// Handshake holds follow the modem status. Releasing one arms a retry of
/// the outbound direction.
pub(crate) fn update_modem_holding(ep: &mut Endpoint) {
    let hf = &ep.handflow;
    let mut holding = ep.holding;
    holding.set(
        Holding::WAITING_FOR_CTS,
        hf.cts_handshake && !ep.modem_status.contains(ModemStatus::CTS),
    );
    holding.set(
        Holding::WAITING_FOR_DSR,
        hf.dsr_handshake && !ep.modem_status.contains(ModemStatus::DSR),
    );
    holding.set(
        Holding::WAITING_FOR_DCD,
        hf.dcd_handshake && !ep.modem_status.contains(ModemStatus::RLSD),
    );
    if !(ep.holding & !holding).is_empty() {
        ep.try_write = true;
    }
    ep.holding = holding;
}

/// Record events the waiter asked for and complete it if any are set.
pub(crate) fn raise_events(ep: &mut Endpoint, events: EventMask, out: &mut Vec<Completion>) {
    ep.events |= events & ep.wait_mask;
    wait_complete(ep, out);
}

pub(crate) fn wait_complete(ep: &mut Endpoint, out: &mut Vec<Completion>) {
    let fired = ep.events & ep.wait_mask;
    if fired.is_empty() {
        return;
    }
    let side = ep.side;
    if let Some((req, cancelled)) = ep.queue_mut(QueueKind::Wait).remove_settled(0) {
        if cancelled {
            out.push(req.into_completion(side, Status::Cancelled, EventMask::empty()));
        } else {
            ep.events = EventMask::empty();
            out.push(req.into_completion(side, Status::Success, fired));
        }
    }
}

impl PortPair {
    /// Force modem status bits of `side`, e.g. from a device layer.
    pub fn set_modem_status(&mut self, side: Side, bits: ModemStatus, mask: ModemStatus) -> Vec<Completion> {
        let mut out = Vec::new();
        set_modem_status(self.endpoint_mut(side), bits, mask, &mut out);
        self.settle(&mut out);
        out
    }

    pub fn modem_status(&self, side: Side) -> ModemStatus {
        self.endpoint(side).modem_status
    }

    /// Drive the output lines of `side`. `None` leaves a line unchanged.
    pub fn set_control_lines(&mut self, side: Side, rts: Option<bool>, dtr: Option<bool>) -> Vec<Completion> {
        let ep = self.endpoint_mut(side);
        if let Some(rts) = rts {
            ep.rts = rts;
        }
        if let Some(dtr) = dtr {
            ep.dtr = dtr;
        }
        let mut out = Vec::new();
        self.settle(&mut out);
        out
    }

    /// Replace the wait mask. Pending events are dropped and an outstanding
    /// waiter completes with an empty mask.
    pub fn set_wait_mask(&mut self, side: Side, mask: EventMask) -> Vec<Completion> {
        let mut out = Vec::new();
        let ep = self.endpoint_mut(side);
        ep.wait_mask = mask;
        ep.events = EventMask::empty();
        if let Some((req, cancelled)) = ep.queue_mut(QueueKind::Wait).remove_settled(0) {
            let status = if cancelled { Status::Cancelled } else { Status::Success };
            out.push(req.into_completion(side, status, EventMask::empty()));
        }
        out
    }

    /// Recompute the inputs of both endpoints from their output lines.
    pub(crate) fn refresh_inputs(&mut self, out: &mut Vec<Completion>) {
        for side in Side::BOTH {
            let (local, remote) = self.split_mut(side);
            refresh_inputs(local, remote, out);
        }
    }

    /// Propagate line changes and retry whatever they unblocked.
    pub(crate) fn settle(&mut self, out: &mut Vec<Completion>) {
        self.refresh_inputs(out);
        for side in Side::BOTH {
            if self.endpoint(side).try_write {
                self.run_pair(side, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::HandFlow;
    use crate::pair::PortConfig;
    use crate::request::IoRequest;

    fn open_pair(config: PortConfig) -> PortPair {
        let mut pair = PortPair::new(config.clone(), config);
        pair.open(Side::A).unwrap();
        pair.open(Side::B).unwrap();
        pair
    }

    #[test]
    fn test_default_wiring_crosses_rts_and_dtr() {
        let mut pair = open_pair(PortConfig::default());
        let status = pair.modem_status(Side::B);
        assert!(status.contains(ModemStatus::CTS | ModemStatus::DSR | ModemStatus::RLSD));
        assert!(!status.contains(ModemStatus::RING));

        pair.set_control_lines(Side::A, Some(false), None);
        let status = pair.modem_status(Side::B);
        assert!(!status.contains(ModemStatus::CTS));
        assert!(status.contains(ModemStatus::DSR));

        pair.set_control_lines(Side::A, None, Some(false));
        let status = pair.modem_status(Side::B);
        assert!(!status.contains(ModemStatus::DSR));
        assert!(!status.contains(ModemStatus::RLSD), "carrier follows DSR");
    }

    #[test]
    fn test_explicit_dcd_pin_does_not_mirror_dsr() {
        let mut config = PortConfig::default();
        config.options.pins.dcd = Some(PinSource::new(PinLine::RemoteOpen));
        let mut pair = open_pair(config);
        pair.set_control_lines(Side::A, None, Some(false));
        let status = pair.modem_status(Side::B);
        assert!(!status.contains(ModemStatus::DSR));
        assert!(status.contains(ModemStatus::RLSD));
    }

    #[test]
    fn test_cts_change_completes_waiter() {
        let mut pair = open_pair(PortConfig::default());
        pair.set_wait_mask(Side::B, EventMask::CTS);
        let dispatch = pair.submit(Side::B, IoRequest::WaitEvent).unwrap();
        assert_eq!(dispatch.status, Status::Pending);

        let done = pair.set_control_lines(Side::A, Some(false), None);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].events, EventMask::CTS);
        assert_eq!(done[0].status, Status::Success);
    }

    #[test]
    fn test_modem_status_report_is_escaped_into_inbound_stream() {
        let config = PortConfig {
            escape: Some(0xFF),
            ..PortConfig::default()
        };
        let mut pair = open_pair(config);
        pair.set_control_lines(Side::A, Some(false), None);

        let dispatch = pair.submit(Side::B, IoRequest::Read { len: 3 }).unwrap();
        assert_eq!(dispatch.status, Status::Success);
        let report = &dispatch.completed[0].data;
        let status = pair.modem_status(Side::B).bits();
        assert_eq!(report, &vec![0xFF, LSRMST_MST, status | (ModemStatus::CTS.bits() >> 4)]);
    }

    #[test]
    fn test_cts_handshake_holds_and_releases() {
        let config = PortConfig {
            handflow: HandFlow {
                cts_handshake: true,
                ..HandFlow::default()
            },
            ..PortConfig::default()
        };
        let mut pair = open_pair(config);
        pair.set_control_lines(Side::B, Some(false), None);
        assert!(pair.holding(Side::A).contains(Holding::WAITING_FOR_CTS));

        let write = pair.submit(Side::A, IoRequest::Write(b"held".to_vec())).unwrap();
        assert_eq!(write.status, Status::Pending);
        let read = pair.submit(Side::B, IoRequest::Read { len: 4 }).unwrap();
        assert_eq!(read.status, Status::Pending);

        let done = pair.set_control_lines(Side::B, Some(true), None);
        assert!(pair.holding(Side::A).is_empty());
        let data: Vec<u8> = done.iter().flat_map(|c| c.data.clone()).collect();
        assert_eq!(data, b"held");
        assert_eq!(done.len(), 2);
    }
}
