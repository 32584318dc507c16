//! `jobwatch-core` — job lifecycle domain building blocks.
//!
//! This crate contains **pure domain** primitives (no IO, no async): identities,
//! the job record state machine, result and notification records.

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod notification;
pub mod result;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{JobIdentity, NotificationId, TempId, TenantId};
pub use job::{JobKind, JobPayload, JobRecord, JobStatus};
pub use notification::{NotificationLevel, NotificationRecord};
pub use result::{EntityPrediction, ResultRecord};
