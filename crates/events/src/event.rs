use chrono::{DateTime, Utc};

/// Something that happened to a job, as observed by this client.
///
/// Payloads are immutable once published. `event_type` is the stable name
/// used in logs; `version` lets consumers reject shapes they do not know.
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// e.g. `"job.transitioned"`.
    fn event_type(&self) -> &'static str;

    fn version(&self) -> u32;

    /// Client observation time.
    fn occurred_at(&self) -> DateTime<Utc>;
}
