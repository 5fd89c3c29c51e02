// flow.rs

use crate::ring_buffer::RingBuffer;

/// Escape tag: the escape character itself appeared in the data.
pub const LSRMST_ESCAPE: u8 = 0x00;
/// Escape tag: line status followed by the data byte it applies to.
pub const LSRMST_LSR_DATA: u8 = 0x01;
/// Escape tag: line status with no data byte.
pub const LSRMST_LSR_NODATA: u8 = 0x02;
/// Escape tag: modem status report.
pub const LSRMST_MST: u8 = 0x03;

pub const DEFAULT_XON: u8 = 0x11;
pub const DEFAULT_XOFF: u8 = 0x13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XChar {
    Xon,
    Xoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialChars {
    pub xon: u8,
    pub xoff: u8,
    /// Character that raises RXFLAG when received.
    pub event: u8,
    /// Substituted for lost data on overrun when enabled in [`HandFlow`].
    pub error: u8,
}

impl Default for SpecialChars {
    fn default() -> Self {
        Self {
            xon: DEFAULT_XON,
            xoff: DEFAULT_XOFF,
            event: 0,
            error: 0,
        }
    }
}

impl SpecialChars {
    pub fn byte_for(&self, x: XChar) -> u8 {
        match x {
            XChar::Xon => self.xon,
            XChar::Xoff => self.xoff,
        }
    }
}

/// Handshake and flow-control settings of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HandFlow {
    /// Hold transmission while CTS is low.
    pub cts_handshake: bool,
    /// Hold transmission while DSR is low.
    pub dsr_handshake: bool,
    /// Hold transmission while carrier detect is low.
    pub dcd_handshake: bool,
    /// Honour XON/XOFF received from the peer.
    pub auto_transmit: bool,
    /// Send XOFF/XON to the peer as the inbound buffer fills and drains.
    pub auto_receive: bool,
    /// Drive RTS low while the inbound buffer is above the XOFF threshold.
    pub rts_handshake: bool,
    /// Drive DTR low while the inbound buffer is above the XOFF threshold.
    pub dtr_handshake: bool,
    /// Replace lost data with [`SpecialChars::error`] on overrun.
    pub error_char: bool,
    /// Cancel pending reads and writes on overrun.
    pub abort_on_error: bool,
    /// Resume once the buffer holds at most this many bytes (default half).
    pub xon_limit: Option<usize>,
    /// Pause once free space drops below this many bytes (default 1/8).
    pub xoff_limit: Option<usize>,
}

impl HandFlow {
    pub fn xon_threshold(&self, capacity: usize) -> usize {
        self.xon_limit.unwrap_or(capacity >> 1)
    }

    pub fn xoff_threshold(&self, capacity: usize) -> usize {
        capacity.saturating_sub(self.xoff_limit.unwrap_or(capacity >> 3))
    }

    pub fn receive_flow_enabled(&self) -> bool {
        self.auto_receive || self.rts_handshake || self.dtr_handshake
    }
}

/// Transient scan state for one chunk of bytes crossing to an endpoint.
#[derive(Debug, Clone)]
pub struct FlowFilter {
    xon: u8,
    xoff: u8,
    event_char: u8,
    escape: Option<u8>,
    pub last_xon_xoff: Option<XChar>,
    pub rx_char: bool,
    pub rx_flag: bool,
}

impl FlowFilter {
    pub fn new(chars: &SpecialChars, escape: Option<u8>) -> Self {
        Self {
            xon: chars.xon,
            xoff: chars.xoff,
            event_char: chars.event,
            escape,
            last_xon_xoff: None,
            rx_char: false,
            rx_flag: false,
        }
    }

    pub fn scan(&mut self, byte: u8) {
        self.rx_char = true;
        if byte == self.xoff {
            self.last_xon_xoff = Some(XChar::Xoff);
        } else if byte == self.xon {
            self.last_xon_xoff = Some(XChar::Xon);
        }
        if byte == self.event_char {
            self.rx_flag = true;
        }
    }

    fn escapes(&self, byte: u8) -> bool {
        self.escape == Some(byte)
    }

    /// Copy from a pending write straight into a pending read.
    ///
    /// Returns `(read_done, write_done)`. When an escaped byte needs two
    /// slots and only one is left, the tag goes to the ring's insert slot;
    /// callers only copy directly while the ring is drained, so it is
    /// delivered next.
    pub fn copy_direct(&mut self, src: &[u8], dst: &mut [u8], ring: &mut RingBuffer) -> (usize, usize) {
        let mut read_done = 0;
        let mut write_done = 0;

        for &byte in src {
            if read_done == dst.len() {
                break;
            }
            if self.escapes(byte) {
                if dst.len() - read_done >= 2 {
                    dst[read_done] = byte;
                    dst[read_done + 1] = LSRMST_ESCAPE;
                    read_done += 2;
                } else if ring.insert_pending(&[LSRMST_ESCAPE]) {
                    dst[read_done] = byte;
                    read_done += 1;
                } else {
                    break;
                }
            } else {
                dst[read_done] = byte;
                read_done += 1;
            }
            self.scan(byte);
            write_done += 1;
        }

        (read_done, write_done)
    }

    /// Copy into the ring buffer; returns the number of source bytes taken.
    pub fn copy_to_buffer(&mut self, src: &[u8], ring: &mut RingBuffer) -> usize {
        let mut write_done = 0;

        for &byte in src {
            if self.escapes(byte) {
                if ring.available_space() < 2 {
                    break;
                }
                ring.write(&[byte, LSRMST_ESCAPE]);
            } else if ring.write(&[byte]) == 0 {
                break;
            }
            self.scan(byte);
            write_done += 1;
        }

        write_done
    }

    /// Consume bytes that have nowhere to go. They still count as received
    /// for flow control and events; the caller records them as overrun.
    pub fn discard(&mut self, src: &[u8]) -> usize {
        for &byte in src {
            self.scan(byte);
        }
        src.len()
    }
}
