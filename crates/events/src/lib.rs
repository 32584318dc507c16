//! `jobwatch-events`
//!
//! **Responsibility:** transport-agnostic event plumbing for job tracking.
//!
//! - [`EventBus`] / [`Subscription`] — pub/sub contract; [`InMemoryEventBus`] for tests/dev
//!   and for in-process push feeds.
//! - [`EventEnvelope`] — tenant + sequence metadata around a payload.
//! - [`FeedSnapshot`] / [`JobTransition`] — the job-domain events.
//! - [`Projection`] / [`ProjectionRunner`] — idempotent read-model builders.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod job_events;
pub mod projection;
pub mod runner;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::InMemoryEventBus;
pub use job_events::{FeedSnapshot, JobTransition};
pub use projection::Projection;
pub use runner::{ApplyOutcome, ProjectionCursor, ProjectionError, ProjectionRunner};
pub use tenant::TenantScoped;
