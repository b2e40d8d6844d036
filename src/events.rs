//! Published events and the channel they travel on
//!
//! Subsystems never call back into the orchestrator; they hold an [`Emitter`] and push
//! events into an `mpsc` channel. Emission never blocks on the consumer and never fails
//! the producer: a consumer that went away is simply not told anymore.
//!
//! Every clone of an [`Emitter`] shares one gate. [`Emitter::emit_terminal`] closes it,
//! so nothing a subsystem emits afterwards reaches the stream.

use std::sync::mpsc::{channel as mpsc_channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::trace;
use serde::{Deserialize, Serialize, Serializer};

use crate::monitoring::{AnomalyReport, TelemetryBatch, Violation};

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// Everything an execution reports upward
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    /// A flushed slice of output, at most one flush-chunk in size
    #[serde(rename_all = "camelCase")]
    Output {
        #[serde(rename = "type")]
        stream: StreamKind,
        #[serde(serialize_with = "lossy_utf8")]
        data: Vec<u8>,
    },
    /// Terminal: the process exited or was killed by a signal
    #[serde(rename_all = "camelCase")]
    Exit {
        code: Option<i32>,
        signal: Option<String>,
        #[serde(serialize_with = "lossy_utf8")]
        final_stdout: Vec<u8>,
        #[serde(serialize_with = "lossy_utf8")]
        final_stderr: Vec<u8>,
    },
    /// Terminal: the process could not be supervised to completion
    Error { message: String },
    /// A descriptor resolved outside the jail root and whitelist
    Violation(Violation),
    /// Telemetry samples delivered together
    TelemetryBatch(TelemetryBatch),
    /// Verdict from the telemetry guard
    Anomaly(AnomalyReport),
}

impl Event {
    /// Exit and Error end an execution; exactly one of them is published per run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::Exit { .. } | Event::Error { .. })
    }
}

/// An event tagged with the execution it belongs to
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub run_id: String,
    #[serde(flatten)]
    pub event: Event,
}

/// Producer side shared by every orchestrator-owned subsystem
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<EventEnvelope>,
}

impl EventSink {
    /// Fire-and-forget publish
    pub fn publish(&self, envelope: EventEnvelope) {
        if self.tx.send(envelope).is_err() {
            trace!("Event receiver dropped; event discarded");
        }
    }
}

/// Per-execution handle that stamps the run id on each event
#[derive(Debug, Clone)]
pub struct Emitter {
    run_id: Arc<str>,
    sink: EventSink,
    open: Arc<RwLock<bool>>,
}

impl Emitter {
    pub fn new(run_id: &str, sink: EventSink) -> Self {
        Self {
            run_id: Arc::from(run_id),
            sink,
            open: Arc::new(RwLock::new(true)),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn publish(&self, event: Event) {
        self.sink.publish(EventEnvelope {
            run_id: self.run_id.to_string(),
            event,
        });
    }

    /// Publish unless the terminal event already went out
    pub fn emit(&self, event: Event) {
        let open = self.open.read().unwrap_or_else(|poison| poison.into_inner());
        if !*open {
            trace!("Run {} already ended; late event dropped", self.run_id);
            return;
        }
        self.publish(event);
    }

    /// Close the gate and publish the run's last event.
    ///
    /// Waits for in-flight emissions, so the terminal event is always last.
    /// Returns `false` when the gate was already closed.
    pub fn emit_terminal(&self, event: Event) -> bool {
        let mut open = self.open.write().unwrap_or_else(|poison| poison.into_inner());
        if !*open {
            return false;
        }
        *open = false;
        self.publish(event);
        true
    }

    pub fn is_open(&self) -> bool {
        *self.open.read().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Consumer side
pub struct EventStream {
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Block for the next event; `None` once every producer is gone
    pub fn recv(&self) -> Option<EventEnvelope> {
        self.receiver.recv().ok()
    }

    /// Try to receive the next event without blocking
    pub fn try_recv(&self) -> Option<EventEnvelope> {
        match self.receiver.try_recv() {
            Ok(envelope) => Some(envelope),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<EventEnvelope> {
        match self.receiver.recv_timeout(timeout) {
            Ok(envelope) => Some(envelope),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Collect events until a terminal one arrives or `timeout` passes without any event
    pub fn collect_until_terminal(&self, timeout: Duration) -> Vec<EventEnvelope> {
        let mut events = Vec::new();
        while let Some(envelope) = self.recv_timeout(timeout) {
            let terminal = envelope.event.is_terminal();
            events.push(envelope);
            if terminal {
                break;
            }
        }
        events
    }

    /// Drain whatever is queued right now
    pub fn drain(&self) -> Vec<EventEnvelope> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

pub struct EventIter {
    receiver: Receiver<EventEnvelope>,
}

impl Iterator for EventIter {
    type Item = EventEnvelope;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

impl IntoIterator for EventStream {
    type Item = EventEnvelope;
    type IntoIter = EventIter;

    fn into_iter(self) -> Self::IntoIter {
        EventIter {
            receiver: self.receiver,
        }
    }
}

/// Create a connected sink/stream pair
pub fn channel() -> (EventSink, EventStream) {
    let (tx, rx) = mpsc_channel();
    (EventSink { tx }, EventStream { receiver: rx })
}
