//! Infrastructure adapters: the shared store, alert delivery, load sampling
//! and fire-time schedules.

pub mod alert;
pub mod sampler;
pub mod schedule;
pub mod store;

pub use alert::{AlertDispatcher, AlertError, AlertPayload, Alerter, LogAlerter, RecordingAlerter};
#[cfg(feature = "webhook")]
pub use alert::WebhookAlerter;
pub use sampler::{FixedSampler, LoadSampler};
#[cfg(feature = "system-sampler")]
pub use sampler::SysinfoSampler;
pub use schedule::{EverySchedule, Schedule};
pub use store::{InMemoryStore, LeaseStore, SharedStore};
