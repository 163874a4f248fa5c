//! Scripted scale used by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use _core::protocol::{CMD_USER_QUERY, INIT_COMMAND, MEASUREMENT_CHARACTERISTIC_UUID};
use _core::{
    BluetoothError, Connector, DeviceAddress, Gender, GattLink, NotificationStream, Roster,
    SessionEvent, SessionObserver, SessionPhase, UserProfile, WriteMode,
};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};

/// How the fake scale behaves.
#[derive(Debug, Default, Clone)]
pub struct Script {
    pub unreachable: bool,
    pub missing_characteristic: bool,
    pub init_fails: bool,
    pub subscribe_fails: bool,
    /// Query writes never complete.
    pub stall_queries: bool,
    /// Frames notified after the query for a user id.
    pub replies: HashMap<u8, Vec<Vec<u8>>>,
    /// Value returned by a direct read. `None` makes the read fail.
    pub read_value: Option<Vec<u8>>,
}

impl Script {
    pub fn reply(mut self, user_id: u8, frame: Vec<u8>) -> Self {
        self.replies.entry(user_id).or_default().push(frame);
        self
    }
}

/// What the fake scale saw.
#[derive(Debug, Default, Clone)]
pub struct Trace {
    pub resolves: usize,
    pub connects: usize,
    pub writes: Vec<(Vec<u8>, WriteMode)>,
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub reads: usize,
    pub disconnects: usize,
}

pub struct FakeConnector {
    pub script: Arc<Mutex<Script>>,
    pub trace: Arc<Mutex<Trace>>,
}

impl FakeConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            trace: Arc::new(Mutex::new(Trace::default())),
        }
    }

    pub fn trace(&self) -> Trace {
        self.trace.lock().unwrap().clone()
    }

    pub fn set_script(&self, script: Script) {
        *self.script.lock().unwrap() = script;
    }

    pub fn link(&self) -> FakeLink {
        FakeLink {
            script: self.script.lock().unwrap().clone(),
            trace: Arc::clone(&self.trace),
            notify: None,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    type Peer = ();
    type Link = FakeLink;

    async fn resolve(&self, _address: &DeviceAddress) -> Result<Option<()>, BluetoothError> {
        self.trace.lock().unwrap().resolves += 1;
        let unreachable = self.script.lock().unwrap().unreachable;
        Ok((!unreachable).then_some(()))
    }

    async fn connect(&self, _peer: ()) -> Result<FakeLink, BluetoothError> {
        self.trace.lock().unwrap().connects += 1;
        if self.script.lock().unwrap().missing_characteristic {
            return Err(BluetoothError::CharacteristicMissing {
                uuid: MEASUREMENT_CHARACTERISTIC_UUID,
            });
        }
        Ok(self.link())
    }
}

pub struct FakeLink {
    script: Script,
    trace: Arc<Mutex<Trace>>,
    notify: Option<UnboundedSender<Vec<u8>>>,
}

impl FakeLink {
    pub fn trace(&self) -> Trace {
        self.trace.lock().unwrap().clone()
    }
}

#[async_trait]
impl GattLink for FakeLink {
    async fn write(&mut self, data: &[u8], mode: WriteMode) -> Result<(), BluetoothError> {
        self.trace.lock().unwrap().writes.push((data.to_vec(), mode));

        if data == INIT_COMMAND.as_slice() {
            if self.script.init_fails {
                return Err(BluetoothError::Gatt("init rejected".into()));
            }
            return Ok(());
        }

        if self.script.stall_queries {
            futures::future::pending::<()>().await;
        }

        if data.first() == Some(&CMD_USER_QUERY) {
            if let (Some(tx), Some(frames)) = (&self.notify, self.script.replies.get(&data[2])) {
                for frame in frames {
                    let _ = tx.unbounded_send(frame.clone());
                }
            }
        }
        Ok(())
    }

    async fn subscribe(&mut self) -> Result<NotificationStream, BluetoothError> {
        self.trace.lock().unwrap().subscribes += 1;
        if self.script.subscribe_fails {
            return Err(BluetoothError::NotifyRegistration("cccd write rejected".into()));
        }
        let (tx, rx) = unbounded();
        self.notify = Some(tx);
        Ok(Box::pin(rx))
    }

    async fn unsubscribe(&mut self) -> Result<(), BluetoothError> {
        self.trace.lock().unwrap().unsubscribes += 1;
        self.notify = None;
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>, BluetoothError> {
        self.trace.lock().unwrap().reads += 1;
        self.script
            .read_value
            .clone()
            .ok_or_else(|| BluetoothError::Gatt("read not permitted".into()))
    }

    async fn disconnect(&mut self) -> Result<(), BluetoothError> {
        self.trace.lock().unwrap().disconnects += 1;
        self.notify = None;
        Ok(())
    }
}

/// Observer keeping phases and counts of joined and abandoned cycles.
#[derive(Default)]
pub struct Recorder {
    pub phases: Mutex<Vec<SessionPhase>>,
    pub joined: Mutex<usize>,
    pub abandoned: Mutex<usize>,
}

impl Recorder {
    pub fn phases(&self) -> Vec<SessionPhase> {
        self.phases.lock().unwrap().clone()
    }

    pub fn joined(&self) -> usize {
        *self.joined.lock().unwrap()
    }

    pub fn abandoned(&self) -> usize {
        *self.abandoned.lock().unwrap()
    }
}

impl SessionObserver for Recorder {
    fn on_event(&self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::Phase(phase) => self.phases.lock().unwrap().push(*phase),
            SessionEvent::CycleJoined => *self.joined.lock().unwrap() += 1,
            SessionEvent::CycleAbandoned => *self.abandoned.lock().unwrap() += 1,
            _ => {}
        }
    }
}

pub fn address() -> DeviceAddress {
    "C8:B2:1E:00:11:22".parse().unwrap()
}

/// Pedro (1, male, 50, 181) and Sofia (2, female, 53, 167).
pub fn family() -> Roster {
    Roster::new(vec![
        UserProfile::new(1, "Pedro", Gender::Male, 50, 181),
        UserProfile::new(2, "Sofia", Gender::Female, 53, 167),
    ])
    .unwrap()
}

/// 11-byte frame: user id at offset 2, weight (tenths of kg) at offset 7.
pub fn weight_frame(user_id: u8, weight_tenths: u16) -> Vec<u8> {
    let [lo, hi] = weight_tenths.to_le_bytes();
    vec![0x00, 0x00, user_id, 0x00, 0x00, 0x00, 0x00, lo, hi, 0x00, 0x00]
}

/// 17-byte frame with body fat, water and muscle after the weight.
pub fn full_frame(user_id: u8, weight: u16, fat: u16, water: u16, muscle: u16) -> Vec<u8> {
    let mut frame = vec![0x00, 0x00, user_id, 0x00, 0x00, 0x00, 0x00];
    for raw in [weight, fat, water, muscle] {
        frame.extend_from_slice(&raw.to_le_bytes());
    }
    frame.extend_from_slice(&[0x00, 0x00]);
    frame
}
