//! Durable, read/unread notification records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{JobIdentity, NotificationId, TenantId};

/// Severity/tone of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Success,
    Info,
    Warning,
    Error,
}

impl NotificationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for NotificationLevel {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(DomainError::validation(format!("unknown notification level '{other}'"))),
        }
    }
}

/// Append-only notification; only `read_at` is ever mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub tenant_id: TenantId,
    /// Job whose terminal transition produced this record (dedupe key).
    pub job_id: JobIdentity,
    pub title: String,
    pub detail: String,
    pub level: NotificationLevel,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl NotificationRecord {
    pub fn is_unread(&self) -> bool {
        self.read_at.is_none()
    }

    /// Set `read_at` unless already read; returns whether anything changed.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.read_at.is_some() {
            return false;
        }
        self.read_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_text_round_trips() {
        for level in [
            NotificationLevel::Success,
            NotificationLevel::Info,
            NotificationLevel::Warning,
            NotificationLevel::Error,
        ] {
            assert_eq!(level.as_str().parse::<NotificationLevel>().unwrap(), level);
        }
        assert!("loud".parse::<NotificationLevel>().is_err());
    }

    #[test]
    fn mark_read_keeps_first_timestamp() {
        let mut n = NotificationRecord {
            id: NotificationId::new(),
            tenant_id: TenantId::new(),
            job_id: JobIdentity::generate(),
            title: "Training complete".into(),
            detail: "Retail v3".into(),
            level: NotificationLevel::Success,
            created_at: Utc::now(),
            read_at: None,
        };
        assert!(n.is_unread());

        let first = Utc::now();
        assert!(n.mark_read(first));
        assert!(!n.mark_read(first + chrono::Duration::seconds(5)));
        assert_eq!(n.read_at, Some(first));
    }
}
