//! Asynchronous detection-event publishing.
//!
//! The pipeline enqueues `DetectionBatch`es into a drop-oldest `EventQueue`;
//! a worker thread drains it at a fixed cadence and POSTs each batch as JSON
//! to the collector. Delivery is best effort: failures are counted, never
//! retried.

pub mod publisher;
pub mod queue;
pub mod sink;
pub mod wire;

pub use publisher::{EventPublisher, PublisherConfig, PublisherStats};
pub use queue::{EventQueue, QueuedBatch, DEFAULT_QUEUE_CAPACITY};
pub use sink::{EventSink, HttpSink};
pub use wire::to_wire_json;
