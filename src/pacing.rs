// pacing.rs

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    OnePointFive,
    Two,
}

/// Baud rate and frame shape, used to work out how many characters fit into
/// one pacing tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineControl {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for LineControl {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl LineControl {
    /// Frame length in half-bits, so 1.5 stop bits stay exact.
    pub fn frame_half_bits(&self) -> u64 {
        let parity = match self.parity {
            Parity::None => 0,
            _ => 1,
        };
        let stop = match self.stop_bits {
            StopBits::One => 2,
            StopBits::OnePointFive => 3,
            StopBits::Two => 4,
        };
        2 * (1 + u64::from(self.data_bits) + parity) + stop
    }
}

/// Token bucket emulating the throughput of a real line.
///
/// The allowance only grows on [`on_tick`](Self::on_tick) while the limiter
/// is running. Fractions of a frame are carried over between ticks.
#[derive(Debug, Clone)]
pub struct PacingLimiter {
    enabled: bool,
    running: bool,
    credit: usize,
    sent_frames: u64,
    /// Numerator carried between ticks, in `baud * tick_us * 2` units.
    carry: u64,
    per_tick: u64,
    divisor: u64,
}

impl PacingLimiter {
    pub fn new(line: &LineControl, tick: Duration) -> Self {
        let mut limiter = Self {
            enabled: false,
            running: false,
            credit: 0,
            sent_frames: 0,
            carry: 0,
            per_tick: 0,
            divisor: 1,
        };
        limiter.set_line(line, tick);
        limiter
    }

    pub fn set_line(&mut self, line: &LineControl, tick: Duration) {
        self.per_tick = u64::from(line.baud_rate) * tick.as_micros() as u64 * 2;
        self.divisor = (1_000_000 * line.frame_half_bits()).max(1);
        self.carry = 0;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            self.enabled = enabled;
            self.stop();
        }
    }

    /// Begin accruing allowance. No-op while disabled or already running.
    pub fn start(&mut self) {
        if self.enabled && !self.running {
            self.running = true;
            self.carry = 0;
        }
    }

    /// Stop accruing and forget whatever was accrued.
    pub fn stop(&mut self) {
        self.running = false;
        self.credit = 0;
        self.carry = 0;
    }

    pub fn on_tick(&mut self) {
        if !self.enabled || !self.running {
            return;
        }
        let total = self.carry + self.per_tick;
        let frames = total / self.divisor;
        self.carry = total % self.divisor;
        self.credit = self.credit.saturating_add(frames as usize);
    }

    /// `None` means unlimited.
    pub fn remaining_allowance(&self) -> Option<usize> {
        self.enabled.then_some(self.credit)
    }

    pub fn consume(&mut self, n: usize) {
        self.sent_frames += n as u64;
        if self.enabled {
            self.credit = self.credit.saturating_sub(n);
        }
    }

    /// Forfeit the allowance while the writer is held, as the line would
    /// have sat idle for that time.
    pub fn discard(&mut self) {
        self.sent_frames += self.credit as u64;
        self.credit = 0;
    }

    pub fn sent_frames(&self) -> u64 {
        self.sent_frames
    }

    pub fn clear_sent_frames(&mut self) {
        self.sent_frames = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(baud: u32, tick_ms: u64) -> PacingLimiter {
        let line = LineControl {
            baud_rate: baud,
            ..LineControl::default()
        };
        let mut p = PacingLimiter::new(&line, Duration::from_millis(tick_ms));
        p.set_enabled(true);
        p
    }

    #[test]
    fn test_disabled_is_unlimited() {
        let mut p = PacingLimiter::new(&LineControl::default(), Duration::from_millis(10));
        assert_eq!(p.remaining_allowance(), None);
        p.consume(100);
        assert_eq!(p.sent_frames(), 100);
    }

    #[test]
    fn test_allowance_accrues_only_while_running() {
        let mut p = limiter(500, 100);
        p.on_tick();
        assert_eq!(p.remaining_allowance(), Some(0));

        p.start();
        p.on_tick();
        assert_eq!(p.remaining_allowance(), Some(5));
        p.consume(3);
        p.on_tick();
        assert_eq!(p.remaining_allowance(), Some(7));

        p.stop();
        assert_eq!(p.remaining_allowance(), Some(0));
    }

    #[test]
    fn test_fractional_frames_are_carried() {
        // 300 baud, 10-bit frames, 10 ms tick: 0.3 frames per tick.
        let mut p = limiter(300, 10);
        p.start();
        for _ in 0..9 {
            p.on_tick();
        }
        assert_eq!(p.remaining_allowance(), Some(2));
        p.on_tick();
        assert_eq!(p.remaining_allowance(), Some(3));
    }

    #[test]
    fn test_discard_counts_as_sent() {
        let mut p = limiter(500, 100);
        p.start();
        p.on_tick();
        p.discard();
        assert_eq!(p.remaining_allowance(), Some(0));
        assert_eq!(p.sent_frames(), 5);
    }

    #[test]
    fn test_frame_shapes() {
        let mut line = LineControl::default();
        assert_eq!(line.frame_half_bits(), 20);
        line.parity = Parity::Even;
        line.stop_bits = StopBits::OnePointFive;
        line.data_bits = 7;
        assert_eq!(line.frame_half_bits(), 2 * 9 + 3);
    }
}
