//! Virtual null-modem library
//!
//! Two linked serial endpoints: whatever one side writes, the other reads.
//! The pair emulates modem control lines, hardware and XON/XOFF flow
//! control, baud-rate pacing and receive overrun, entirely in memory.

pub mod clock;
mod engine;
pub mod flags;
pub mod flow;
pub mod modem;
pub mod pacing;
pub mod pair;
pub mod params;
mod queue;
pub mod request;
pub mod ring_buffer;
pub mod signal;
pub mod transport;

// Re-export main types for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use flags::{EventMask, Holding, LineErrors, ModemStatus, PurgeFlags};
pub use flow::{HandFlow, SpecialChars};
pub use modem::{NullModem, PendingIo};
pub use pacing::{LineControl, Parity, StopBits};
pub use pair::{CommStatus, Dispatch, ModemError, PerfStats, PortConfig, PortPair, Side};
pub use params::PortOptions;
pub use request::{Completion, IoRequest, ReadTimeout, RequestHandle, RequestId, Status, Timeouts};
pub use signal::{PinLine, PinMap, PinSource};
pub use transport::{Transport, TransportError, VirtualPort};
