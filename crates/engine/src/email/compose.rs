use jobwatch_core::{JobKind, JobStatus};
use jobwatch_events::JobTransition;

use crate::eta::format_duration;

/// Subject and bodies of one completion email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedEmail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Completion email for `transition`; `None` unless the job completed.
pub fn compose(transition: &JobTransition) -> Option<ComposedEmail> {
    if transition.to != JobStatus::Completed {
        return None;
    }
    let record = &transition.record;
    let completed_at = record
        .completed_at
        .unwrap_or(transition.observed_at)
        .format("%Y-%m-%d %H:%M:%S UTC")
        .to_string();

    let (subject, title, summary, intro, mut items) = match record.kind {
        JobKind::Training => (
            "Model training complete",
            "Training complete",
            "Your model training finished successfully.",
            "Your training job has completed.",
            vec![format!("Model: {}", record.payload.label)],
        ),
        JobKind::Prediction => (
            "Prediction complete",
            "Prediction complete",
            "Your prediction job finished successfully.",
            "Your prediction job has completed.",
            vec![
                format!("Model: {}", record.payload.label),
                format!("Mode: {}", record.payload.mode.as_deref().unwrap_or("single")),
            ],
        ),
    };
    items.push(format!("Completed at: {completed_at}"));
    if let Some(rows) = record.payload.row_count {
        items.push(format!("Rows: {rows}"));
    }
    if let Some(ms) = record.duration_ms {
        items.push(format!("Duration: {}", format_duration(std::time::Duration::from_millis(ms))));
    }

    let mut text = String::from(intro);
    for item in &items {
        text.push('\n');
        text.push_str(item);
    }

    let rows: String = items
        .iter()
        .map(|item| format!("<tr><td style=\"padding:6px 0;\">{}</td></tr>", escape(item)))
        .collect();
    let html = format!(
        "<html><body style=\"font-family:Arial,sans-serif;\">\
         <h2>{title}</h2><p>{summary}</p>\
         <table cellpadding=\"0\" cellspacing=\"0\">{rows}</table>\
         <p style=\"color:#666;\">Open the dashboard to review results.</p>\
         </body></html>"
    );

    Some(ComposedEmail {
        subject: subject.to_string(),
        text,
        html,
    })
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::tests::transition;
    use jobwatch_core::TenantId;

    #[test]
    fn training_email_lists_model_and_duration() {
        let t = transition(TenantId::new(), "t1", JobKind::Training, JobStatus::Completed);
        let email = compose(&t).unwrap();
        assert_eq!(email.subject, "Model training complete");
        assert!(email.text.starts_with("Your training job has completed.\nModel: Churn model"));
        assert!(email.text.contains("Completed at: "));
        assert!(email.text.contains("Duration: 1m 35s"));
        assert!(email.html.contains("<h2>Training complete</h2>"));
    }

    #[test]
    fn prediction_email_lists_mode_and_rows() {
        let t = transition(TenantId::new(), "p1", JobKind::Prediction, JobStatus::Completed);
        let email = compose(&t).unwrap();
        assert_eq!(email.subject, "Prediction complete");
        assert!(email.text.contains("Mode: batch"));
        assert!(email.text.contains("Rows: 1200"));
    }

    #[test]
    fn only_completions_get_an_email() {
        let tenant = TenantId::new();
        assert!(compose(&transition(tenant, "f", JobKind::Training, JobStatus::Failed)).is_none());
        assert!(compose(&transition(tenant, "r", JobKind::Prediction, JobStatus::Processing)).is_none());
    }

    #[test]
    fn labels_are_escaped_in_html() {
        let mut t = transition(TenantId::new(), "x", JobKind::Training, JobStatus::Completed);
        t.record.payload.label = "<b>A & B</b>".into();
        let email = compose(&t).unwrap();
        assert!(email.html.contains("Model: &lt;b&gt;A &amp; B&lt;/b&gt;"));
        assert!(email.text.contains("Model: <b>A & B</b>"));
    }
}
