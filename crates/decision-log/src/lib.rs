//! Append-only structured JSON-lines audit trail for authorization
//! decisions.
//!
//! Enforcement is synchronous and latency-sensitive, so the trail is
//! built around a lossy, non-blocking hand-off: [`DecisionSink::record`]
//! is a plain function call that queues the entry and returns, and a
//! background task folds whatever has accumulated into batched writes.
//! A full queue sheds entries (and counts them) rather than ever stalling
//! a decision. The active file can be size-rotated, keeping one previous
//! generation next to it.
//!
//! [`EnforceRecord::capture`] bridges from the enforcement core: it takes
//! the request values and the `enforce_ex` outcome and produces the
//! serialisable record.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use decision_log::{DecisionEntry, DecisionEventType, DecisionSink, DecisionSource, EnforceRecord};
//! use gatewarden::{Enforcer, Model, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let enforcer = Enforcer::from_files("model.conf", "policy.csv")?;
//! let (sink, _handle) = DecisionSink::spawn("/var/log/gatewarden/decisions.jsonl").await?;
//!
//! let request: Vec<Value> = vec!["alice".into(), "data1".into(), "read".into()];
//! let (allowed, explain) = enforcer.enforce_ex(request.clone())?;
//!
//! // No .await: safe to call right where the decision was made.
//! sink.record(
//!     DecisionEntry::new(
//!         DecisionEventType::Enforce,
//!         DecisionSource::new("api-gateway"),
//!         serde_json::json!({}),
//!     )
//!     .with_enforcement(EnforceRecord::capture(&request, allowed, &explain)),
//! );
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

// Re-export primary public types at the crate root for convenience.
pub use entry::{DecisionEntry, DecisionEventType, DecisionSource, EnforceRecord};
pub use sink::{DecisionSink, SinkConfig};
pub use writer::{DecisionWriteError, DecisionWriter};
