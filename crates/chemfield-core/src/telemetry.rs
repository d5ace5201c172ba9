//! Tick observers and versioned event records.

use std::io::Write;
use std::sync::mpsc::{SyncSender, TrySendError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{ReactionEvent, Tick, TickReport};

slotmap::new_key_type! {
    /// Handle returned when registering a tick observer.
    pub struct SubscriberId;
}

/// Sink invoked after each completed tick.
pub trait TickObserver: Send {
    fn on_tick(&mut self, report: &TickReport);

    /// Observers reporting false are removed after the current notification.
    fn is_connected(&self) -> bool {
        true
    }
}

/// No-op observer.
#[derive(Debug, Default)]
pub struct NullObserver;

impl TickObserver for NullObserver {
    fn on_tick(&mut self, _report: &TickReport) {}
}

/// Forwards reports into a bounded channel, dropping batches the receiver has not drained.
#[derive(Debug)]
pub(crate) struct ChannelObserver {
    sender: SyncSender<TickReport>,
    connected: bool,
    dropped: u64,
}

impl ChannelObserver {
    pub(crate) fn new(sender: SyncSender<TickReport>) -> Self {
        Self {
            sender,
            connected: true,
            dropped: 0,
        }
    }
}

impl TickObserver for ChannelObserver {
    fn on_tick(&mut self, report: &TickReport) {
        match self.sender.try_send(report.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                warn!(
                    tick = report.tick.0,
                    dropped = self.dropped,
                    "subscriber channel full; dropping tick batch"
                );
            }
            Err(TrySendError::Disconnected(_)) => self.connected = false,
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Writes every reaction event as one JSON line.
#[derive(Debug)]
pub struct JsonLinesObserver<W> {
    writer: W,
    failed: bool,
    written: u64,
}

impl<W: Write + Send> JsonLinesObserver<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            failed: false,
            written: 0,
        }
    }

    /// Records written so far.
    #[must_use]
    pub const fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_report(&mut self, report: &TickReport) -> Result<(), RecordError> {
        for event in &report.events {
            let record = ReactionEventRecord::new(report.tick, event.clone());
            serde_json::to_writer(&mut self.writer, &record)?;
            self.writer.write_all(b"\n")?;
            self.written += 1;
        }
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> TickObserver for JsonLinesObserver<W> {
    fn on_tick(&mut self, report: &TickReport) {
        if self.failed {
            return;
        }
        if let Err(err) = self.write_report(report) {
            warn!(tick = report.tick.0, error = %err, "event writer failed; detaching");
            self.failed = true;
        }
    }

    fn is_connected(&self) -> bool {
        !self.failed
    }
}

/// Current schema version for serialized reaction events.
pub const EVENT_RECORD_VERSION: u16 = 1;

/// Errors raised while encoding or decoding event records.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record serialization failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported record version {found}, expected {expected}")]
    UnsupportedVersion { found: u16, expected: u16 },
}

/// Versioned, self-describing form of a [`ReactionEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionEventRecord {
    pub version: u16,
    pub tick: Tick,
    pub event: ReactionEvent,
}

impl ReactionEventRecord {
    #[must_use]
    pub fn new(tick: Tick, event: ReactionEvent) -> Self {
        Self {
            version: EVENT_RECORD_VERSION,
            tick,
            event,
        }
    }

    pub fn to_json(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a record, rejecting unknown schema versions.
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_str(json)?;
        if record.version != EVENT_RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion {
                found: record.version,
                expected: EVENT_RECORD_VERSION,
            });
        }
        Ok(record)
    }
}
