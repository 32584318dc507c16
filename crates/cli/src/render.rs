//! Plain-text rendering of the merged job view.

use std::fmt::Write;

use jobwatch_core::NotificationRecord;
use jobwatch_engine::eta::format_duration;
use jobwatch_engine::{FeedHealth, JobView};

pub fn render_view(view: &JobView) -> String {
    let mut out = String::new();

    match &view.feed {
        FeedHealth::Connecting => out.push_str("feed: connecting\n"),
        FeedHealth::Live { last_refreshed } => {
            let _ = writeln!(out, "feed: live (refreshed {})", last_refreshed.format("%H:%M:%S"));
        }
        FeedHealth::Stale {
            last_refreshed,
            error,
            retry_in,
        } => {
            let since = last_refreshed
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string());
            let _ = writeln!(
                out,
                "feed: STALE since {since}, retrying in {} ({error})",
                format_duration(*retry_in)
            );
        }
    }

    for row in &view.provisional {
        let mut flags = String::new();
        if row.stale {
            flags.push_str(" [stale]");
        }
        if row.legacy {
            flags.push_str(" [legacy]");
        }
        let _ = writeln!(out, "  ~ {:<10} {:<12} {}{flags}", row.kind, "submitting", row.label);
    }

    for row in &view.jobs {
        let eta = row
            .eta
            .map(|d| format!(" ~{} left", format_duration(d)))
            .unwrap_or_default();
        let cancel = if row.cancel_pending { " [canceling]" } else { "" };
        let _ = writeln!(
            out,
            "  {} {:<10} {:<12} {}{eta}{cancel}",
            row.record.id, row.record.kind, row.record.status, row.record.payload.label
        );
    }

    if view.is_empty() {
        out.push_str("  (no jobs)\n");
    }
    out
}

pub fn render_notification(n: &NotificationRecord) -> String {
    format!("[{:?}] {}: {}", n.level, n.title, n.detail)
}
