//! Update cycle controller.
//!
//! [`Scale::run_cycle`] is what a scheduler calls at a fixed cadence. It
//! connects, runs one [`Session`], folds every frame into the measurement
//! store and hands back an owned copy of the store. It never fails: any
//! error is reported to the observer, remembered in [`Scale::last_error`],
//! and the readings from earlier cycles are returned untouched.
//!
//! Only one cycle touches the link at a time. A caller arriving while a cycle
//! is running waits for that cycle and gets its result instead of starting a
//! second connection.
//!
//! A caller may also drop `run_cycle` half-way (a `timeout` or `select!`
//! around it). The link is then disconnected from a background task on the
//! current runtime, and the next cycle does not connect until that
//! disconnect has finished.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::Instant;

use crate::bluetooth::{Connector, DeviceAddress, GattLink};
use crate::config::{Roster, SessionTiming};
use crate::decoder::{decode_frame, Decoded};
use crate::errors::{BluetoothError, Result, ScaleError};
use crate::observer::{FrameSource, LogObserver, SessionEvent, SessionObserver, SessionPhase};
use crate::session::{Session, SessionReport};
use crate::store::{MeasurementStore, Measurements};

pub struct Scale<C: Connector> {
    address: DeviceAddress,
    roster: Roster,
    timing: SessionTiming,
    connector: C,
    observer: Arc<dyn SessionObserver>,
    store: Mutex<MeasurementStore>,
    flight: watch::Sender<Flight>,
    /// Held for as long as a link may be open, background release included.
    link_slot: Arc<AsyncMutex<()>>,
    last_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flight {
    running: bool,
    /// Cycles finished so far.
    completed: u64,
}

impl<C: Connector> Scale<C> {
    pub fn new(address: DeviceAddress, roster: Roster, connector: C) -> Self {
        let store = MeasurementStore::new(&roster);
        let (flight, _) = watch::channel(Flight::default());
        Self {
            address,
            roster,
            timing: SessionTiming::default(),
            connector,
            observer: Arc::new(LogObserver),
            store: Mutex::new(store),
            flight,
            link_slot: Arc::new(AsyncMutex::new(())),
            last_error: Mutex::new(None),
        }
    }

    pub fn with_timing(mut self, timing: SessionTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Owned copy of the current readings.
    pub fn snapshot(&self) -> Measurements {
        lock(&self.store).snapshot_all()
    }

    /// Message of the most recent failed cycle, cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn is_busy(&self) -> bool {
        self.flight.borrow().running
    }

    /// Run one full update cycle and return the readings.
    pub async fn run_cycle(&self) -> Measurements {
        let mut joined = None;
        self.flight.send_if_modified(|flight| {
            if flight.running {
                joined = Some(flight.completed);
                false
            } else {
                flight.running = true;
                true
            }
        });

        if let Some(completed) = joined {
            self.observer.on_event(&SessionEvent::CycleJoined);
            let mut done = self.flight.subscribe();
            let _ = done.wait_for(|flight| flight.completed > completed).await;
            return self.snapshot();
        }

        let _flight = FlightGuard(&self.flight);
        let outcome = self.attempt().await;

        let error = match outcome {
            Ok(report) => {
                self.observer.on_event(&SessionEvent::CycleFinished(&report));
                (!report.received_data()).then(|| ScaleError::NoDataReceived.to_string())
            }
            Err(e) => {
                self.observer.on_event(&SessionEvent::CycleFailed(&e));
                Some(e.to_string())
            }
        };
        *lock(&self.last_error) = error;

        self.phase(SessionPhase::Idle);
        self.snapshot()
    }

    async fn attempt(&self) -> Result<SessionReport> {
        let deadline = self.timing.cycle_budget.map(|budget| (Instant::now() + budget, budget));

        self.phase(SessionPhase::Connecting);
        let slot = Arc::clone(&self.link_slot).lock_owned().await;
        let link = bounded(deadline, self.open_link()).await?;
        let mut link = LinkGuard {
            held: Some((link, slot)),
            observer: Arc::clone(&self.observer),
        };
        self.phase(SessionPhase::Connected);

        let session = Session::new(&self.roster, &self.timing, self.observer.as_ref());
        let mut sink = |source: FrameSource, data: &[u8]| self.ingest(source, data);
        let outcome = match link.get() {
            Ok(open) => bounded(deadline, session.run(open, &mut sink)).await,
            Err(e) => Err(e),
        };

        self.phase(SessionPhase::Cleanup);
        if let Err(e) = link.release().await {
            self.observer.on_event(&SessionEvent::DisconnectFailed(&e));
        }

        outcome
    }

    async fn open_link(&self) -> Result<C::Link> {
        let peer = self
            .connector
            .resolve(&self.address)
            .await?
            .ok_or_else(|| BluetoothError::Unreachable {
                mac: self.address.to_string(),
            })?;
        Ok(self.connector.connect(peer).await?)
    }

    fn ingest(&self, source: FrameSource, data: &[u8]) {
        let decoded = decode_frame(data, &self.roster);
        if let Decoded::Reading(reading) = &decoded {
            lock(&self.store).apply(reading.user_id, &reading.update());
        }
        self.observer.on_event(&SessionEvent::Frame {
            source,
            data,
            decoded: &decoded,
        });
    }

    fn phase(&self, phase: SessionPhase) {
        self.observer.on_event(&SessionEvent::Phase(phase));
    }
}

/// Run `fut` under the cycle deadline, if there is one.
async fn bounded<T>(
    deadline: Option<(Instant, Duration)>,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some((at, budget)) => tokio::time::timeout_at(at, fut)
            .await
            .unwrap_or(Err(ScaleError::CycleTimeout(budget))),
        None => fut.await,
    }
}

/// Ends the flight however the cycle ends, waking joined callers.
struct FlightGuard<'a>(&'a watch::Sender<Flight>);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|flight| {
            flight.running = false;
            flight.completed += 1;
        });
    }
}

/// The open link of one cycle, together with the link slot.
///
/// `release` disconnects in place. If the guard is dropped unreleased, the
/// disconnect is spawned onto the current runtime and the slot stays taken
/// until it completes. Outside a runtime the link is simply dropped.
struct LinkGuard<L: GattLink + 'static> {
    held: Option<(L, OwnedMutexGuard<()>)>,
    observer: Arc<dyn SessionObserver>,
}

impl<L: GattLink + 'static> LinkGuard<L> {
    fn get(&mut self) -> Result<&mut L> {
        match self.held.as_mut() {
            Some((link, _)) => Ok(link),
            None => Err(BluetoothError::Connection("link already released".into()).into()),
        }
    }

    async fn release(&mut self) -> std::result::Result<(), BluetoothError> {
        let result = match self.held.as_mut() {
            Some((link, _)) => link.disconnect().await,
            None => Ok(()),
        };
        self.held = None;
        result
    }
}

impl<L: GattLink + 'static> Drop for LinkGuard<L> {
    fn drop(&mut self) {
        let Some((mut link, slot)) = self.held.take() else {
            return;
        };
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        self.observer.on_event(&SessionEvent::CycleAbandoned);
        let observer = Arc::clone(&self.observer);
        runtime.spawn(async move {
            if let Err(e) = link.disconnect().await {
                observer.on_event(&SessionEvent::DisconnectFailed(&e));
            }
            drop(slot);
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
