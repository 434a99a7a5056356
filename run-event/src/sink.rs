//! Output sink: single-method consumer of sink events.
//!
//! A sink write must never abort execution; implementations swallow their own
//! errors and the runtime treats every `write` as infallible.

use std::sync::mpsc;
use std::sync::Mutex;

use serde_json::Value;

use crate::event::SinkEvent;

/// Single-method event sink. `write(type, data)` carries one serialized event.
///
/// Implementations must fail silently: a rendering or transport error never
/// propagates back into the runtime.
pub trait OutputSink: Send + Sync {
    fn write(&self, kind: &str, data: Value);

    /// Convenience: serialize and write a typed event. The `type` key is
    /// stripped from the payload since it travels as `kind`.
    fn write_event(&self, event: &SinkEvent) {
        let Ok(mut value) = event.to_value() else {
            return;
        };
        if let Some(obj) = value.as_object_mut() {
            obj.remove("type");
        }
        self.write(event.kind(), value);
    }
}

/// Sink that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write(&self, _kind: &str, _data: Value) {}
}

/// Sink that forwards events over a standard channel, dropping on disconnect.
pub struct ChannelSink {
    tx: mpsc::Sender<(String, Value)>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::Receiver<(String, Value)>) {
        let (tx, rx) = mpsc::channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn write(&self, kind: &str, data: Value) {
        let _ = self.tx.send((kind.to_string(), data));
    }
}

/// Sink that records events in memory; read them back with `take`.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<(String, Value)>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains and returns everything written so far.
    pub fn take(&self) -> Vec<(String, Value)> {
        match self.events.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        }
    }

    /// Kinds written so far, in order, without draining.
    pub fn kinds(&self) -> Vec<String> {
        match self.events.lock() {
            Ok(guard) => guard.iter().map(|(k, _)| k.clone()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl OutputSink for CollectSink {
    fn write(&self, kind: &str, data: Value) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push((kind.to_string(), data));
        }
    }
}
