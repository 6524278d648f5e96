//! Aggregate outcomes into the end-of-run summary.
use serde::Serialize;
use std::fmt;

use crate::model::{Outcome, OutcomeKind, RecipientId};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FailedRecipient {
    pub recipient: RecipientId,
    pub error: String,
}

/// Built once all outcomes are known. Independent of outcome order.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DispatchReport {
    pub total: usize,
    /// Includes `delivered_after_retry`.
    pub delivered: usize,
    pub delivered_after_retry: usize,
    pub forbidden: usize,
    pub failed: usize,
    pub forbidden_recipients: Vec<RecipientId>,
    pub failures: Vec<FailedRecipient>,
}

impl DispatchReport {
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let mut report = DispatchReport {
            total: outcomes.len(),
            delivered: 0,
            delivered_after_retry: 0,
            forbidden: 0,
            failed: 0,
            forbidden_recipients: Vec::new(),
            failures: Vec::new(),
        };
        for outcome in outcomes {
            match &outcome.kind {
                OutcomeKind::Delivered => report.delivered += 1,
                OutcomeKind::DeliveredAfterRetry => {
                    report.delivered += 1;
                    report.delivered_after_retry += 1;
                }
                OutcomeKind::Forbidden { .. } => {
                    report.forbidden += 1;
                    report.forbidden_recipients.push(outcome.recipient);
                }
                OutcomeKind::Failed { error } => {
                    report.failed += 1;
                    report.failures.push(FailedRecipient {
                        recipient: outcome.recipient,
                        error: error.clone(),
                    });
                }
            }
        }
        report.forbidden_recipients.sort_unstable();
        report
            .failures
            .sort_by(|a, b| a.recipient.cmp(&b.recipient).then_with(|| a.error.cmp(&b.error)));
        report
    }

    pub fn delivered_first_try(&self) -> usize {
        self.delivered - self.delivered_after_retry
    }

    /// Every recipient landed in exactly one bucket.
    pub fn is_complete(&self) -> bool {
        self.delivered_first_try() + self.delivered_after_retry + self.forbidden + self.failed == self.total
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "--- SUMMARY ---")?;
        writeln!(f, "Recipients found: {}", self.total)?;
        writeln!(
            f,
            "Delivered: {} (including {} after retry)",
            self.delivered, self.delivered_after_retry
        )?;
        writeln!(f, "Forbidden/blocked: {}", self.forbidden)?;
        writeln!(f, "Failed: {}", self.failed)?;
        if !self.forbidden_recipients.is_empty() {
            let ids: Vec<String> = self.forbidden_recipients.iter().map(|r| r.to_string()).collect();
            writeln!(f, "Forbidden recipients: {}", ids.join(", "))?;
        }
        if !self.failures.is_empty() {
            writeln!(f, "Failed recipients:")?;
            for failure in &self.failures {
                writeln!(f, "  [{}] {}", failure.recipient, failure.error)?;
            }
        }
        Ok(())
    }
}
