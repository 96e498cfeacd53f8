//! Container-backed job execution: specs, live job tracking, log capture and
//! transactional step runs.

pub mod manager;
pub mod registry;
pub mod spec;
pub mod state;
pub mod transaction;

pub use manager::{CommandOutcome, RetentionPolicy, SandboxJobManager, SandboxRunner};
pub use registry::{InMemoryJobRegistry, JobRegistry};
pub use spec::{Mount, NetworkMode, SandboxJobSpec};
pub use state::{JobStatus, SandboxJobState};
pub use transaction::{SandboxTransaction, TransactionOutcome, TransactionStep};
