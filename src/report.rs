//! End-of-phase summaries.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::chain::ErrorClass;

/// Result of processing one wallet in a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalletOutcome {
    Success,
    Failed(ErrorClass),
    /// Nothing to do for this wallet; the reason is shown in the summary.
    Skipped(&'static str),
}

#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub phase: &'static str,
    pub started_at: DateTime<Utc>,
    pub success: u64,
    pub failed: u64,
    pub skipped: u64,
    pub errors: BTreeMap<ErrorClass, u64>,
    pub skip_reasons: BTreeMap<&'static str, u64>,
    /// Phase-specific lines such as totals transferred.
    pub notes: Vec<(String, String)>,
    pub dry_run: bool,
}

impl PhaseReport {
    pub fn new(phase: &'static str) -> Self {
        Self {
            phase,
            started_at: Utc::now(),
            success: 0,
            failed: 0,
            skipped: 0,
            errors: BTreeMap::new(),
            skip_reasons: BTreeMap::new(),
            notes: Vec::new(),
            dry_run: false,
        }
    }

    pub fn record(&mut self, outcome: &WalletOutcome) {
        match outcome {
            WalletOutcome::Success => self.success += 1,
            WalletOutcome::Failed(class) => {
                self.failed += 1;
                *self.errors.entry(*class).or_insert(0) += 1;
            }
            WalletOutcome::Skipped(reason) => {
                self.skipped += 1;
                *self.skip_reasons.entry(*reason).or_insert(0) += 1;
            }
        }
    }

    pub fn note(&mut self, key: impl Into<String>, value: impl ToString) {
        self.notes.push((key.into(), value.to_string()));
    }

    pub fn total(&self) -> u64 {
        self.success + self.failed + self.skipped
    }

    /// Successes over attempted (non-skipped) wallets, in percent.
    pub fn success_rate(&self) -> Option<f64> {
        let attempted = self.success + self.failed;
        (attempted > 0).then(|| self.success as f64 / attempted as f64 * 100.0)
    }

    fn rate_text(&self) -> String {
        match self.success_rate() {
            Some(rate) => format!("{rate:.2}%"),
            None => "n/a".to_string(),
        }
    }

    /// Print the summary in a readable format.
    pub fn print(&self) {
        let elapsed = Utc::now() - self.started_at;
        let mode = if self.dry_run { " (dry run)" } else { "" };

        println!("\n=== {} SUMMARY{} ===", self.phase.to_uppercase(), mode);
        println!("Elapsed: {}s", elapsed.num_seconds());
        println!("Wallets: {}", self.total());
        println!("  ✓ Success: {}", self.success);
        println!("  ✗ Failed: {}", self.failed);
        println!("  - Skipped: {}", self.skipped);
        println!("  Success Rate: {}", self.rate_text());
        println!();

        if !self.errors.is_empty() {
            println!("Error Breakdown:");
            let mut errors: Vec<_> = self.errors.iter().collect();
            errors.sort_by_key(|(_, count)| std::cmp::Reverse(**count));
            for (class, count) in errors {
                println!("  {}: {}", class, count);
            }
            println!();
        }

        if !self.skip_reasons.is_empty() {
            println!("Skipped:");
            for (reason, count) in &self.skip_reasons {
                println!("  {}: {}", reason, count);
            }
            println!();
        }

        for (key, value) in &self.notes {
            println!("{}: {}", key, value);
        }
        println!("=======================\n");
    }

    /// Compact text for the notifier.
    pub fn to_message(&self) -> String {
        let mut message = format!(
            "walletfleet {}{}: {} ok, {} failed, {} skipped (success rate {})",
            self.phase,
            if self.dry_run { " [dry run]" } else { "" },
            self.success,
            self.failed,
            self.skipped,
            self.rate_text(),
        );
        if !self.errors.is_empty() {
            let breakdown: Vec<String> = self
                .errors
                .iter()
                .map(|(class, count)| format!("{class}={count}"))
                .collect();
            message.push_str(&format!("\nerrors: {}", breakdown.join(", ")));
        }
        for (key, value) in &self.notes {
            message.push_str(&format!("\n{key}: {value}"));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_counts_and_rate() {
        let mut report = PhaseReport::new("fund");
        report.record(&WalletOutcome::Success);
        report.record(&WalletOutcome::Success);
        report.record(&WalletOutcome::Success);
        report.record(&WalletOutcome::Failed(ErrorClass::Throttle));
        report.record(&WalletOutcome::Skipped("already funded"));

        assert_eq!(report.total(), 5);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.success_rate(), Some(75.0));
        assert_eq!(report.errors.get(&ErrorClass::Throttle), Some(&1));
        assert_eq!(report.skip_reasons.get("already funded"), Some(&1));
    }

    #[test]
    fn test_rate_undefined_when_everything_skipped() {
        let mut report = PhaseReport::new("consolidate");
        report.record(&WalletOutcome::Skipped("zero balance"));
        assert_eq!(report.success_rate(), None);
        assert!(report.to_message().contains("n/a"));
    }

    #[test]
    fn test_message_includes_breakdown_and_notes() {
        let mut report = PhaseReport::new("refund");
        report.record(&WalletOutcome::Failed(ErrorClass::Reverted));
        report.note("Refunded", "0.5 ETH");
        let message = report.to_message();
        assert!(message.contains("refund"));
        assert!(message.contains("reverted=1"));
        assert!(message.contains("Refunded: 0.5 ETH"));
    }
}
