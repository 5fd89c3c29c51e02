// modem.rs

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, trace};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::flags::PurgeFlags;
use crate::pair::{CommStatus, ModemError, PortConfig, PortPair, Side};
use crate::request::{Completion, IoRequest, RequestHandle, RequestId, Status, Timeouts};

struct Inner {
    pair: PortPair,
    waiters: HashMap<RequestId, oneshot::Sender<Completion>>,
}

impl Inner {
    fn route(&mut self, completed: Vec<Completion>) {
        for completion in completed {
            match self.waiters.remove(&completion.id) {
                Some(tx) => {
                    trace!("port {}: routing {} ({:?})", completion.side, completion.id, completion.status);
                    // The submitter may have stopped waiting.
                    let _ = tx.send(completion);
                }
                None => debug!("port {}: no waiter for {}", completion.side, completion.id),
            }
        }
    }
}

/// A request handed to the pair, waiting for its completion.
#[derive(Debug)]
pub struct PendingIo {
    handle: RequestHandle,
    rx: oneshot::Receiver<Completion>,
}

impl PendingIo {
    pub fn id(&self) -> RequestId {
        self.handle.id
    }

    pub fn handle(&self) -> &RequestHandle {
        &self.handle
    }

    /// Resolve once the engine completes the request. Fails with
    /// [`ModemError::Closed`] if the modem is dropped first.
    pub async fn wait(self) -> Result<Completion, ModemError> {
        self.rx.await.map_err(|_| ModemError::Closed)
    }
}

/// Thread-safe handle to a [`PortPair`].
///
/// Every call takes the pair lock, runs the engine and routes each finished
/// request to whoever submitted it. A background task drives the pacing and
/// timeout timer once [`start`](Self::start) is called.
pub struct NullModem {
    inner: Arc<Mutex<Inner>>,
    running: Arc<AtomicBool>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl NullModem {
    pub fn new(a: PortConfig, b: PortConfig) -> Self {
        Self::from_pair(PortPair::new(a, b))
    }

    pub fn from_pair(pair: PortPair) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                pair,
                waiters: HashMap::new(),
            })),
            running: Arc::new(AtomicBool::new(false)),
            ticker: Mutex::new(None),
        }
    }

    /// Spawn the timer task on the current tokio runtime.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return; // Already running
        }
        let period = self.inner.lock().pair.tick_interval();
        let inner = Arc::downgrade(&self.inner);
        let running = self.running.clone();
        info!("null modem timer started, period {:?}", period);
        *self.ticker.lock() = Some(tokio::spawn(run_ticker(inner, running, period)));
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn open(&self, side: Side) -> Result<(), ModemError> {
        let mut inner = self.inner.lock();
        let completed = inner.pair.open(side)?;
        inner.route(completed);
        Ok(())
    }

    pub fn close(&self, side: Side) -> Result<(), ModemError> {
        let mut inner = self.inner.lock();
        let completed = inner.pair.close(side)?;
        inner.route(completed);
        Ok(())
    }

    pub fn submit(&self, side: Side, request: IoRequest) -> Result<PendingIo, ModemError> {
        let mut inner = self.inner.lock();
        let dispatch = inner.pair.submit(side, request)?;
        let (tx, rx) = oneshot::channel();

        if dispatch.status == Status::Pending {
            inner.waiters.insert(dispatch.handle.id, tx);
        } else if let Some(own) = dispatch.completed.iter().find(|c| c.id == dispatch.handle.id) {
            let _ = tx.send(own.clone());
        } else {
            // Out-of-band inserts finish without a queued completion.
            let _ = tx.send(Completion {
                id: dispatch.handle.id,
                side,
                status: dispatch.status,
                transferred: 0,
                data: Vec::new(),
                events: Default::default(),
            });
        }
        let own = dispatch.handle.id;
        inner.route(dispatch.completed.into_iter().filter(|c| c.id != own).collect());

        Ok(PendingIo {
            handle: dispatch.handle,
            rx,
        })
    }

    /// Cancel on behalf of the submitter. The request is flagged before the
    /// pair lock is taken so that a pass already holding it sees the cancel.
    pub fn cancel(&self, handle: &RequestHandle) {
        if !handle.request_cancel() {
            return;
        }
        let mut inner = self.inner.lock();
        let completed = inner.pair.cancel(handle);
        inner.route(completed);
    }

    /// Run a mutation on the pair and route whatever it finished.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut PortPair) -> Vec<Completion>,
    {
        let mut inner = self.inner.lock();
        let completed = f(&mut inner.pair);
        inner.route(completed);
    }

    /// Read-only access to the pair.
    pub fn with_pair<R>(&self, f: impl FnOnce(&PortPair) -> R) -> R {
        f(&self.inner.lock().pair)
    }

    pub fn purge(&self, side: Side, flags: PurgeFlags) {
        self.update(|pair| pair.purge(side, flags));
    }

    pub fn set_timeouts(&self, side: Side, timeouts: Timeouts) {
        self.inner.lock().pair.set_timeouts(side, timeouts);
    }

    pub fn comm_status(&self, side: Side) -> CommStatus {
        self.inner.lock().pair.comm_status(side)
    }

    /// One timer period for both endpoints.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();
        for side in Side::BOTH {
            let completed = inner.pair.on_timer_tick(side);
            inner.route(completed);
        }
    }
}

impl Drop for NullModem {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticker(inner: Weak<Mutex<Inner>>, running: Arc<AtomicBool>, period: std::time::Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while running.load(Ordering::Relaxed) {
        interval.tick().await;
        let Some(shared) = inner.upgrade() else {
            break;
        };
        let mut guard = shared.lock();
        for side in Side::BOTH {
            let completed = guard.pair.on_timer_tick(side);
            guard.route(completed);
        }
    }
    debug!("null modem timer stopped");
}
