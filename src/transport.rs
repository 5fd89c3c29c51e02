// transport.rs

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;

use crate::modem::{NullModem, PendingIo};
use crate::pair::{ModemError, Side};
use crate::request::{Completion, IoRequest, ReadTimeout, Status, Timeouts};

/// Error types for the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("modem error: {0}")]
    Modem(#[from] ModemError),
    #[error("Timeout occurred")]
    Timeout,
    #[error("Request cancelled")]
    Cancelled,
}

/// Byte-stream interface of a serial port.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send all of `data`, or fail with [`TransportError::Timeout`].
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive at least one byte into `buffer`. Returns what arrived before
    /// the first gap, up to the buffer size.
    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, TransportError>;

    fn set_timeout(&mut self, timeout: Duration);
}

/// One endpoint of a [`NullModem`] seen as a [`Transport`].
pub struct VirtualPort {
    modem: Arc<NullModem>,
    side: Side,
    timeout: Duration,
}

impl VirtualPort {
    /// Open `side` and configure it for stream use with a 5 s timeout.
    pub fn open(modem: Arc<NullModem>, side: Side) -> Result<Self, TransportError> {
        modem.open(side)?;
        let mut port = Self {
            modem,
            side,
            timeout: Duration::from_secs(5),
        };
        port.set_timeout(port.timeout);
        Ok(port)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn modem(&self) -> &Arc<NullModem> {
        &self.modem
    }

    /// Wait for a request. The engine's own timeout normally finishes it;
    /// this guard covers a modem whose timer is not running.
    async fn complete(&self, pending: PendingIo) -> Result<Completion, TransportError> {
        let handle = pending.handle().clone();
        let guard = self.timeout * 2 + Duration::from_millis(50);
        let mut wait = Box::pin(pending.wait());
        match tokio::time::timeout(guard, &mut wait).await {
            Ok(done) => Ok(done?),
            Err(_) => {
                debug!("port {}: request {} overdue, cancelling", self.side, handle.id);
                self.modem.cancel(&handle);
                Ok(wait.await?)
            }
        }
    }
}

impl Drop for VirtualPort {
    fn drop(&mut self) {
        if let Err(e) = self.modem.close(self.side) {
            debug!("port {}: close on drop failed: {}", self.side, e);
        }
    }
}

#[async_trait]
impl Transport for VirtualPort {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        debug!("port {}: send {} bytes", self.side, data.len());
        let pending = self.modem.submit(self.side, IoRequest::Write(data.to_vec()))?;
        let done = self.complete(pending).await?;
        match done.status {
            Status::Success => Ok(()),
            Status::Cancelled if done.transferred == data.len() => Ok(()),
            Status::Cancelled => Err(TransportError::Cancelled),
            _ => Err(TransportError::Timeout),
        }
    }

    async fn receive(&self, buffer: &mut [u8]) -> Result<usize, TransportError> {
        let pending = self.modem.submit(self.side, IoRequest::Read { len: buffer.len() })?;
        let done = self.complete(pending).await?;
        let n = done.data.len();
        buffer[..n].copy_from_slice(&done.data);

        match done.status {
            Status::Success => Ok(n),
            _ if n > 0 => Ok(n),
            Status::Cancelled => Err(TransportError::Cancelled),
            _ => Err(TransportError::Timeout),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        self.modem.set_timeouts(
            self.side,
            Timeouts {
                read: ReadTimeout::FirstByte { total: timeout },
                write_per_byte: Duration::ZERO,
                write_constant: timeout,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pair::PortConfig;

    fn ports() -> (VirtualPort, VirtualPort) {
        let modem = Arc::new(NullModem::new(PortConfig::default(), PortConfig::default()));
        modem.start();
        let a = VirtualPort::open(modem.clone(), Side::A).unwrap();
        let b = VirtualPort::open(modem, Side::B).unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_send_then_receive() {
        let (a, b) = ports();
        a.send(b"ping").await.unwrap();

        let mut buffer = [0u8; 16];
        let n = b.receive(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..n], b"ping");
    }

    #[tokio::test]
    async fn test_receive_returns_first_chunk() {
        let (a, b) = ports();
        let reader = tokio::spawn(async move {
            let mut buffer = [0u8; 64];
            let n = b.receive(&mut buffer).await.unwrap();
            buffer[..n].to_vec()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.send(b"abc").await.unwrap();
        assert_eq!(reader.await.unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_receive_times_out_without_data() {
        let (_a, mut b) = ports();
        b.set_timeout(Duration::from_millis(30));
        let mut buffer = [0u8; 4];
        let err = b.receive(&mut buffer).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout), "{err:?}");
    }

    #[tokio::test]
    async fn test_guard_cancels_when_timer_is_stopped() {
        let modem = Arc::new(NullModem::new(PortConfig::default(), PortConfig::default()));
        let _a = VirtualPort::open(modem.clone(), Side::A).unwrap();
        let mut b = VirtualPort::open(modem, Side::B).unwrap();
        b.set_timeout(Duration::from_millis(10));

        let mut buffer = [0u8; 4];
        let err = b.receive(&mut buffer).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled), "{err:?}");
    }

    #[tokio::test]
    async fn test_exclusive_port_refuses_second_transport() {
        let mut config = PortConfig::default();
        config.options.exclusive_mode = true;
        let modem = Arc::new(NullModem::new(config, PortConfig::default()));
        let _first = VirtualPort::open(modem.clone(), Side::A).unwrap();
        let err = VirtualPort::open(modem, Side::A).err().unwrap();
        assert!(matches!(err, TransportError::Modem(ModemError::Busy(Side::A))));
    }
}
