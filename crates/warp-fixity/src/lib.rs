//! warp-fixity: Fixity verification and scheduling
//!
//! Tracks whether stored objects still match their recorded checksums:
//! - Verifies object content against recorded digests, in a fixed algorithm order
//! - Keeps an append-only revision history of check results per object
//! - Schedules periodic re-checks against a relative threshold
//! - Drives checks through resumable batch runs or a back-pressured work queue
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  BatchOrchestrator                 FixityDaemon (tokio)     │
//! │  fixed / periodic / generate       enrol → reclaim → admit  │
//! │        │                                   │       │        │
//! │        ▼                                   ▼       ▼        │
//! │  PopulationCursor                     QueueGate  QueueWorker│
//! │  (missing, periodic due)                   │       │        │
//! ├────────┼───────────────────────────────────┼───────┼────────┤
//! │        └──────────────┐   ┌────────────────┘       │        │
//! │                       ▼   ▼                        ▼        │
//! │                     FixityService ◀────────────────┘        │
//! │            HashVerifier   SchedulingPolicy   SourceRegistry │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RecordStore (memory, sled)   ObjectSource   WorkQueue      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod batch;
pub mod candidates;
pub mod clock;
pub mod config;
pub mod cursor;
pub mod daemon;
pub mod error;
pub mod hash;
pub mod metrics;
pub mod queue;
pub mod record;
pub mod schedule;
pub mod service;
pub mod source;
pub mod stats;
pub mod store;
pub mod telemetry;

pub use batch::{BatchCheckpoint, BatchMode, BatchOrchestrator, BatchPhase, BatchResults, BatchRun, Termination};
pub use candidates::{AllObjectsSource, CandidateSource, FixedListSource, SourceRegistry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::FixityConfig;
pub use cursor::{CursorKind, CursorState, PopulationCursor, Progress};
pub use daemon::{DaemonState, FixityDaemon, TickReport};
pub use error::{Error, Result};
pub use hash::{AlgorithmSet, Checksums, HashAlgorithm, HashVerifier, VerificationOutcome};
pub use metrics::{FixityMetrics, MetricsSnapshot};
pub use queue::{
    DrainReport, MemoryWorkQueue, QueueGate, QueueItem, QueueWorker, SledWorkQueue, WorkOutcome,
    WorkQueue, SATURATION_FACTOR,
};
pub use record::{FixityRecord, FixityState, ObjectId, RecordDraft, RecordId, Revision, RevisionId, Timestamp, NEVER};
pub use schedule::{DurationUnit, RelativeDuration, SchedulingPass, SchedulingPolicy};
pub use service::{CheckOutcome, FixityService};
pub use source::{FsObjectSource, Manifest, ManifestEntry, MemoryObjectSource, ObjectSource};
pub use stats::{FixityStats, PeriodicStats};
pub use store::{MemoryRecordStore, RecordFilter, RecordStore, SledRecordStore};
pub use telemetry::{init_logging, LogConfig, LogFormat, LogLevel, LogOutput};
