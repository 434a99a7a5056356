//! Run event protocol: sink events and the streaming output envelope.
//!
//! This crate defines the wire shape of the events a runtime pushes into an
//! output sink and of the envelope items produced by a streaming run. It does
//! not depend on skein; skein converts its stages into [`ProgressEntry`] items
//! and its lifecycle/skill/plan happenings into [`SinkEvent`]s.

pub mod envelope;
pub mod event;
pub mod sink;

pub use envelope::{PlanSummary, ProgressEntry, RunStatus, StreamEnvelope};
pub use event::SinkEvent;
pub use sink::{ChannelSink, CollectSink, NullSink, OutputSink};
