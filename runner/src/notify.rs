use crate::{aggregate::RunSummary, config::NotifyConfig};
use reqwest::blocking::Client;
use std::time::Duration;
use tracing::error;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// Posts the run summary to a Slack-style incoming webhook.
pub struct Notifier {
    client: Client,
    config: NotifyConfig,
}

impl Notifier {
    pub fn new(config: NotifyConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(WEBHOOK_TIMEOUT).build()?;

        Ok(Self { client, config })
    }

    /// Best-effort: a false return means the announcement was lost, not the
    /// results.
    pub fn publish(&self, summary: &RunSummary) -> bool {
        let mut payload = serde_json::json!({ "text": format_message(summary) });
        if let Some(channel) = &self.config.channel {
            payload["channel"] = serde_json::json!(channel);
        }

        match self
            .client
            .post(&self.config.webhook_url)
            .json(&payload)
            .send()
        {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                error!(status = %response.status(), "Webhook rejected the notification");
                false
            }
            Err(e) => {
                error!(error = %e, "Failed to reach the webhook");
                false
            }
        }
    }
}

fn format_message(summary: &RunSummary) -> String {
    let mut message = format!(
        "Lightcurve fitting run finished: {} fits attempted, {} succeeded, {} failed, {} timed out.",
        summary.total, summary.succeeded, summary.failed, summary.timed_out
    );

    let fitted = summary
        .items
        .iter()
        .filter(|item| matches!(item.outcome, crate::aggregate::Outcome::Succeeded))
        .map(|item| format!("{} ({})", item.candidate, item.model))
        .collect::<Vec<_>>();
    if !fitted.is_empty() {
        message.push_str(&format!(" New fits: {}.", fitted.join(", ")));
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{ItemReport, Outcome};
    use chrono::Utc;

    fn test_summary() -> RunSummary {
        RunSummary {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total: 4,
            succeeded: 1,
            failed: 1,
            timed_out: 2,
            items: vec![
                ItemReport {
                    candidate: "ZTFaaa".to_owned(),
                    model: "Bu2019lm".to_owned(),
                    outcome: Outcome::Succeeded,
                    job_id: Some(1),
                },
                ItemReport {
                    candidate: "ZTFbbb".to_owned(),
                    model: "TrPi2018".to_owned(),
                    outcome: Outcome::Failed,
                    job_id: None,
                },
            ],
        }
    }

    #[test]
    fn message_lists_counts_and_new_fits() {
        let message = format_message(&test_summary());

        assert!(message.contains("4 fits attempted"));
        assert!(message.contains("1 succeeded"));
        assert!(message.contains("2 timed out"));
        assert!(message.contains("ZTFaaa (Bu2019lm)"));
        assert!(!message.contains("ZTFbbb (TrPi2018)"));
    }
}
