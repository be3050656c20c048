//! Core coordination: leases, tick guards, load selection and the scheduler.

pub mod error;
pub mod lease;
pub mod load;
pub mod scheduler;
pub mod tick_guard;

pub use error::{AppResult, LockError, SchedulerError, StoreError};
pub use lease::{ClaimRole, DistributedLease, LeaseClaim, LeaseOptions};
pub use load::{
    backoff_delay, BestCandidateSelector, LoadReporter, LoadSample, LoadScore, DEFAULT_RANKED_SET_KEY,
};
pub use scheduler::{
    EntryId, EntrySnapshot, EntryStatus, Job, Scheduler, SchedulerEntry, SchedulerParts, TickOutcome,
};
pub use tick_guard::{fence_key, first_run_fence, run_key, tick_key, TickGuard, TickGuardOptions};
