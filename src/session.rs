//! One request/response exchange with a connected scale.
//!
//! Sequence: init, settle, subscribe, one query per roster user (each
//! followed by a fixed wait), linger, unsubscribe, and a direct read when no
//! notification arrived at all. Notifications are handed to the frame sink in
//! arrival order while the session waits out each delay.
//!
//! The session does not own the link's lifetime: connecting and disconnecting
//! are the caller's job, so the link is released on every exit path.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep_until, Instant};

use crate::bluetooth::{GattLink, NotificationStream, WriteMode};
use crate::config::{Roster, SessionTiming};
use crate::errors::{Result, ScaleError};
use crate::observer::{FrameSource, SessionEvent, SessionObserver, SessionPhase};
use crate::protocol::{user_query, INIT_COMMAND};

/// Receives every frame the session gets hold of.
pub type FrameSink<'a> = dyn FnMut(FrameSource, &[u8]) + Send + 'a;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackRead {
    NotNeeded,
    /// Direct read returned this many bytes.
    Delivered(usize),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub notifications: usize,
    pub queries_sent: usize,
    pub queries_failed: usize,
    pub fallback: FallbackRead,
}

impl SessionReport {
    /// Whether any bytes at all came back from the scale.
    pub fn received_data(&self) -> bool {
        self.notifications > 0 || matches!(self.fallback, FallbackRead::Delivered(_))
    }
}

pub struct Session<'a> {
    roster: &'a Roster,
    timing: &'a SessionTiming,
    observer: &'a dyn SessionObserver,
}

impl<'a> Session<'a> {
    pub fn new(roster: &'a Roster, timing: &'a SessionTiming, observer: &'a dyn SessionObserver) -> Self {
        Self {
            roster,
            timing,
            observer,
        }
    }

    /// Drive the exchange over an open link.
    ///
    /// Only a failed subscription aborts the session; init, query and
    /// fallback failures are reported and skipped.
    pub async fn run<L>(&self, link: &mut L, sink: &mut FrameSink<'_>) -> Result<SessionReport>
    where
        L: GattLink + ?Sized,
    {
        if let Err(e) = link.write(&INIT_COMMAND, WriteMode::WithResponse).await {
            self.observer.on_event(&SessionEvent::InitFailed(&e));
        }
        tokio::time::sleep(self.timing.settle).await;

        let mut notifications = link.subscribe().await.map_err(ScaleError::from)?;
        self.phase(SessionPhase::NotifyReady);

        let mut report = SessionReport {
            notifications: 0,
            queries_sent: 0,
            queries_failed: 0,
            fallback: FallbackRead::NotNeeded,
        };

        for (index, profile) in self.roster.iter().enumerate() {
            self.phase(SessionPhase::Querying {
                index,
                user_id: profile.id,
            });
            match link.write(&user_query(profile), WriteMode::WithoutResponse).await {
                Ok(()) => report.queries_sent += 1,
                Err(error) => {
                    report.queries_failed += 1;
                    self.observer.on_event(&SessionEvent::QueryFailed {
                        user_id: profile.id,
                        error: &error,
                    });
                }
            }
            report.notifications +=
                drain_for(&mut notifications, self.timing.query_interval, sink).await;
        }

        self.phase(SessionPhase::Linger);
        report.notifications += drain_for(&mut notifications, self.timing.linger, sink).await;

        drop(notifications);
        if let Err(e) = link.unsubscribe().await {
            self.observer.on_event(&SessionEvent::UnsubscribeFailed(&e));
        }

        if report.notifications == 0 {
            self.observer.on_event(&SessionEvent::NoData);
            report.fallback = match link.read().await {
                Ok(data) => {
                    sink(FrameSource::DirectRead, &data);
                    FallbackRead::Delivered(data.len())
                }
                Err(e) => {
                    self.observer.on_event(&SessionEvent::FallbackReadFailed(&e));
                    FallbackRead::Failed(e.to_string())
                }
            };
        }

        Ok(report)
    }

    fn phase(&self, phase: SessionPhase) {
        self.observer.on_event(&SessionEvent::Phase(phase));
    }
}

/// Feed notifications to `sink` until `window` has elapsed. Returns how many
/// arrived.
async fn drain_for(
    notifications: &mut NotificationStream,
    window: Duration,
    sink: &mut FrameSink<'_>,
) -> usize {
    let deadline = Instant::now() + window;
    let mut received = 0;
    let mut open = true;

    while open {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            next = notifications.next() => match next {
                Some(data) => {
                    received += 1;
                    sink(FrameSource::Notification, &data);
                }
                None => open = false,
            },
        }
    }
    // a closed stream still gets its full wait
    sleep_until(deadline).await;
    received
}
