// ring_buffer.rs

/// Maximum number of out-of-band bytes that can wait for ring space.
pub const INSERT_SLOT_CAPACITY: usize = 16;

/// Fixed-capacity inbound buffer of one endpoint.
///
/// Reads and writes never block: both move as many bytes as fit or are
/// available and report the count. A write that does not fit is the caller's
/// business (overrun handling lives in the engine, not here).
#[derive(Debug)]
pub struct RingBuffer {
    data: Vec<u8>,
    head: usize,
    busy: usize,
    size80: usize,
    /// Out-of-band bytes that did not fit; they enter the ring ahead of any
    /// later data as soon as space is freed.
    pending_insert: Vec<u8>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            data: vec![0u8; capacity],
            head: 0,
            busy: 0,
            size80: capacity * 4 / 5,
            pending_insert: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes currently held, not counting the pending insert slot.
    pub fn busy(&self) -> usize {
        self.busy
    }

    /// High-water mark used for the RX80FULL event.
    pub fn size80(&self) -> usize {
        self.size80
    }

    pub fn is_full(&self) -> bool {
        self.busy >= self.capacity()
    }

    /// True when neither the ring nor the pending insert slot hold anything.
    pub fn is_drained(&self) -> bool {
        self.busy == 0 && self.pending_insert.is_empty()
    }

    pub fn available_space(&self) -> usize {
        self.capacity() - self.busy
    }

    pub fn pending_insert_len(&self) -> usize {
        self.pending_insert.len()
    }

    pub fn clear(&mut self) {
        self.head = 0;
        self.busy = 0;
        self.pending_insert.clear();
    }

    pub fn write(&mut self, bytes: &[u8]) -> usize {
        let to_write = bytes.len().min(self.available_space());
        for &b in &bytes[..to_write] {
            self.push(b);
        }
        to_write
    }

    /// Store a byte even if the buffer is full by overwriting the most
    /// recently written byte.
    pub fn write_mandatory(&mut self, byte: u8) {
        if self.is_full() {
            let last = (self.head + self.busy - 1) % self.capacity();
            self.data[last] = byte;
        } else {
            self.push(byte);
        }
    }

    /// Park out-of-band bytes until the ring has room for them.
    ///
    /// Returns false (and keeps nothing) when the slot cannot hold them all.
    pub fn insert_pending(&mut self, bytes: &[u8]) -> bool {
        if self.pending_insert.len() + bytes.len() > INSERT_SLOT_CAPACITY {
            return false;
        }
        self.pending_insert.extend_from_slice(bytes);
        self.flush_pending_insert();
        true
    }

    pub fn read(&mut self, into: &mut [u8]) -> usize {
        let to_read = into.len().min(self.busy);
        let cap = self.capacity();
        for slot in into.iter_mut().take(to_read) {
            *slot = self.data[self.head];
            self.head = (self.head + 1) % cap;
        }
        self.busy -= to_read;
        if self.busy == 0 {
            self.head = 0;
        }
        self.flush_pending_insert();
        to_read
    }

    fn push(&mut self, byte: u8) {
        let tail = (self.head + self.busy) % self.capacity();
        self.data[tail] = byte;
        self.busy += 1;
    }

    fn flush_pending_insert(&mut self) {
        if self.pending_insert.is_empty() {
            return;
        }
        let moved = self.pending_insert.len().min(self.available_space());
        let bytes: Vec<u8> = self.pending_insert.drain(..moved).collect();
        for b in bytes {
            self.push(b);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_operations() {
        let mut buffer = RingBuffer::new(10);

        let written = buffer.write(&[1, 2, 3, 4, 5]);
        assert_eq!(written, 5);
        assert_eq!(buffer.busy(), 5);
        assert!(!buffer.is_full());

        let mut out = [0u8; 3];
        assert_eq!(buffer.read(&mut out), 3);
        assert_eq!(out, [1, 2, 3]);
        assert_eq!(buffer.busy(), 2);

        // Fill to capacity; the write wraps around the end of storage.
        let written = buffer.write(&[6, 7, 8, 9, 10, 11, 12, 13, 14]);
        assert_eq!(written, 8);
        assert!(buffer.is_full());
        assert_eq!(buffer.available_space(), 0);

        let mut out = [0u8; 16];
        assert_eq!(buffer.read(&mut out), 10);
        assert_eq!(&out[..10], &[4, 5, 6, 7, 8, 9, 10, 11, 12, 13]);
        assert!(buffer.is_drained());
    }

    #[test]
    fn test_size80_is_eighty_percent() {
        assert_eq!(RingBuffer::new(64).size80(), 51);
        assert_eq!(RingBuffer::new(10).size80(), 8);
    }

    #[test]
    fn test_mandatory_write_replaces_last_byte_when_full() {
        let mut buffer = RingBuffer::new(4);
        buffer.write(&[1, 2, 3, 4]);
        buffer.write_mandatory(0xEE);
        assert_eq!(buffer.busy(), 4);

        let mut out = [0u8; 4];
        buffer.read(&mut out);
        assert_eq!(out, [1, 2, 3, 0xEE]);

        buffer.write_mandatory(0x55);
        assert_eq!(buffer.busy(), 1);
    }

    #[test]
    fn test_pending_insert_enters_ahead_of_later_data() {
        let mut buffer = RingBuffer::new(4);
        buffer.write(&[1, 2, 3, 4]);
        assert!(buffer.insert_pending(&[0xFF, 0x03, 0x30]));
        assert_eq!(buffer.pending_insert_len(), 3);
        assert!(!buffer.is_drained());

        let mut out = [0u8; 2];
        buffer.read(&mut out);
        assert_eq!(out, [1, 2]);
        assert_eq!(buffer.pending_insert_len(), 1);

        // Newer data must queue behind the rest of the insert.
        assert_eq!(buffer.write(&[9]), 0);

        let mut out = [0u8; 8];
        let n = buffer.read(&mut out);
        assert_eq!(&out[..n], &[3, 4, 0xFF, 0x03]);
        let n = buffer.read(&mut out);
        assert_eq!(&out[..n], &[0x30]);
        assert!(buffer.is_drained());
    }

    #[test]
    fn test_insert_slot_overflow_is_refused() {
        let mut buffer = RingBuffer::new(1);
        buffer.write(&[0]);
        assert!(!buffer.insert_pending(&[0u8; INSERT_SLOT_CAPACITY + 1]));
        assert_eq!(buffer.pending_insert_len(), 0);
    }
}
