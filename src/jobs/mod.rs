//! Jobs: persistence and lifecycle.
//!
//! - [`models`]: job, checkpoint and document records
//! - [`store`]: the `JobStore` seam and its SQLite implementation
//! - [`manager`]: submission, status, cancellation and recovery

pub mod manager;
pub mod models;
pub mod store;

pub use manager::{
    JobListing, JobManager, JobStatusReport, ManagerConfig, PhaseProgress, RecoveryReport,
};
pub use models::{
    Checkpoint, Coordinate, Document, DocumentSummary, JobRecord, JobSnapshot, JobStatus,
};
pub use store::{JobStore, SqliteJobStore};
