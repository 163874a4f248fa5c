//! Side channel for session diagnostics.
//!
//! The session and controller never log directly. They report
//! [`SessionEvent`]s to an injected [`SessionObserver`]; [`LogObserver`] turns
//! them into `log` records.

use log::{debug, info, warn};

use crate::decoder::{Decoded, FieldOutcome};
use crate::errors::{BluetoothError, ScaleError};
use crate::protocol::hex_dump;
use crate::session::{FallbackRead, SessionReport};

/// Bytes of an undecodable frame included in log output.
const DUMP_PREFIX: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Connected,
    NotifyReady,
    Querying { index: usize, user_id: u8 },
    Linger,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Notification,
    DirectRead,
}

#[derive(Debug)]
pub enum SessionEvent<'a> {
    Phase(SessionPhase),
    InitFailed(&'a BluetoothError),
    QueryFailed {
        user_id: u8,
        error: &'a BluetoothError,
    },
    Frame {
        source: FrameSource,
        data: &'a [u8],
        decoded: &'a Decoded,
    },
    UnsubscribeFailed(&'a BluetoothError),
    NoData,
    FallbackReadFailed(&'a BluetoothError),
    DisconnectFailed(&'a BluetoothError),
    /// A cycle was requested while another one was running.
    CycleJoined,
    /// The caller dropped a cycle with the link still open. The link is
    /// disconnected in the background.
    CycleAbandoned,
    CycleFinished(&'a SessionReport),
    CycleFailed(&'a ScaleError),
}

pub trait SessionObserver: Send + Sync {
    fn on_event(&self, event: &SessionEvent<'_>);
}

/// Default observer writing through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn on_event(&self, event: &SessionEvent<'_>) {
        match event {
            SessionEvent::Phase(phase) => debug!("session phase: {:?}", phase),
            SessionEvent::InitFailed(e) => warn!("init command failed, continuing: error={}", e),
            SessionEvent::QueryFailed { user_id, error } => {
                warn!("user query failed: user={}, error={}", user_id, error)
            }
            SessionEvent::Frame {
                source,
                data,
                decoded,
            } => log_frame(*source, data, decoded),
            SessionEvent::UnsubscribeFailed(e) => debug!("stop notify failed: error={}", e),
            SessionEvent::NoData => warn!("no data received from scale, trying direct read"),
            SessionEvent::FallbackReadFailed(e) => debug!("direct read failed: error={}", e),
            SessionEvent::DisconnectFailed(e) => warn!("disconnect failed: error={}", e),
            SessionEvent::CycleJoined => debug!("update already in progress, waiting for it"),
            SessionEvent::CycleAbandoned => {
                warn!("update cancelled by caller, disconnecting in background")
            }
            SessionEvent::CycleFinished(report) => {
                let fallback = match &report.fallback {
                    FallbackRead::NotNeeded => "not needed".to_string(),
                    FallbackRead::Delivered(len) => format!("{len} bytes"),
                    FallbackRead::Failed(msg) => format!("failed ({msg})"),
                };
                info!(
                    "update finished: notifications={}, queries_sent={}, queries_failed={}, fallback={}",
                    report.notifications, report.queries_sent, report.queries_failed, fallback
                );
            }
            SessionEvent::CycleFailed(e) => warn!("update failed, keeping previous readings: error={}", e),
        }
    }
}

fn log_frame(source: FrameSource, data: &[u8], decoded: &Decoded) {
    debug!(
        "frame received: source={:?}, len={}, bytes={}",
        source,
        data.len(),
        hex_dump(data)
    );
    match decoded {
        Decoded::TooShort { len } => debug!("frame too short: len={}", len),
        Decoded::NoWeight => {
            let prefix = &data[..data.len().min(DUMP_PREFIX)];
            warn!(
                "no plausible weight in frame: len={}, first_bytes={}",
                data.len(),
                hex_dump(prefix)
            );
        }
        Decoded::Reading(reading) => {
            info!(
                "weight decoded: user={}, weight={} kg, bmi={}, offset={}, attribution={:?}",
                reading.user_id,
                reading.weight_kg,
                reading.bmi,
                reading.weight_offset,
                reading.attribution
            );
            for (name, outcome) in [
                ("body_fat", reading.body_fat),
                ("water", reading.water),
                ("muscle", reading.muscle),
            ] {
                match outcome {
                    FieldOutcome::Accepted(v) => debug!("{}: {}%", name, v),
                    FieldOutcome::OutOfRange(v) => debug!("{} skipped, out of range: {}", name, v),
                    FieldOutcome::Absent => {}
                }
            }
        }
    }
}
