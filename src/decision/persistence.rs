//! Spread persistence gate.
//!
//! A spread must satisfy its threshold for a configured duration before
//! an action fires. Two modes:
//!
//! - strict: a continuous window; any non-qualifying sample resets it.
//! - relaxed: at least one qualifying sample per 1-second bucket, with a
//!   single missing bucket tolerated.
//!
//! Durations of ≤1 s are evaluated instantaneously. Callers pass the
//! clock explicitly so boundary behavior is testable.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Opens: spread must be ≥ threshold.
    Ge,
    /// Closes: normalized spread must be ≤ threshold.
    Le,
}

impl Comparison {
    fn satisfied(&self, value: Decimal, threshold: Decimal) -> bool {
        match self {
            Comparison::Ge => value >= threshold,
            Comparison::Le => value <= threshold,
        }
    }
}

#[derive(Debug, Default)]
struct PersistenceState {
    // relaxed mode
    last_bucket: Option<i64>,
    count: u64,
    pass_logged: bool,
    // strict mode
    window_start: Option<f64>,
    has_passed: bool,
}

/// Keyed persistence tracker. Keys isolate venue combinations (and the
/// close channel) so one symbol's pairs never interfere.
#[derive(Debug, Default)]
pub struct PersistenceGate {
    states: HashMap<String, PersistenceState>,
}

impl PersistenceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample; returns whether the gate passes at `now_secs`.
    #[allow(clippy::too_many_arguments)]
    pub fn check(
        &mut self,
        key: &str,
        value: Decimal,
        threshold: Decimal,
        required_seconds: f64,
        strict: bool,
        comparison: Comparison,
        now_secs: f64,
    ) -> bool {
        if required_seconds <= 1.0 {
            self.states.remove(key);
            return comparison.satisfied(value, threshold);
        }

        if strict {
            self.check_strict(key, value, threshold, required_seconds, comparison, now_secs)
        } else {
            self.check_relaxed(key, value, threshold, required_seconds, comparison, now_secs)
        }
    }

    fn check_strict(
        &mut self,
        key: &str,
        value: Decimal,
        threshold: Decimal,
        required_seconds: f64,
        comparison: Comparison,
        now_secs: f64,
    ) -> bool {
        let state = self.states.entry(key.to_string()).or_default();

        if !comparison.satisfied(value, threshold) {
            if state.window_start.is_some() {
                debug!("⚠️ [{key}] 持续性中断(严格) - 样本未达阈值, 计时清零");
            }
            state.window_start = None;
            state.has_passed = false;
            return false;
        }

        let start = *state.window_start.get_or_insert(now_secs);
        if now_secs - start >= required_seconds {
            if !state.has_passed {
                debug!("🎉 [{key}] 持续性通过(严格) - 已连续{required_seconds}秒, 允许交易");
                state.has_passed = true;
            }
            true
        } else {
            false
        }
    }

    fn check_relaxed(
        &mut self,
        key: &str,
        value: Decimal,
        threshold: Decimal,
        required_seconds: f64,
        comparison: Comparison,
        now_secs: f64,
    ) -> bool {
        if !comparison.satisfied(value, threshold) {
            self.reset(key);
            return false;
        }

        let state = self.states.entry(key.to_string()).or_default();
        let current_bucket = now_secs.floor() as i64;
        match state.last_bucket {
            None => {
                state.count = 1;
                state.pass_logged = false;
            }
            Some(last) if current_bucket == last => {
                // Same second, no progress and no reset.
            }
            // A single missing bucket keeps the run alive; only distinct
            // qualifying buckets count as progress.
            Some(last) if current_bucket - last <= 2 => {
                state.count += 1;
                state.pass_logged = false;
            }
            Some(last) => {
                debug!(
                    "⚠️ [{key}] 持续性中断(宽松) - 时间间隔{}秒, 进度{}秒被重置",
                    current_bucket - last,
                    state.count
                );
                state.count = 1;
                state.pass_logged = false;
            }
        }
        state.last_bucket = Some(current_bucket);

        if (state.count as f64) < required_seconds {
            return false;
        }
        if !state.pass_logged {
            debug!(
                "🎉 [{key}] 持续性通过(宽松) - 已连续{}秒, 允许交易",
                state.count
            );
            state.pass_logged = true;
        }
        true
    }

    pub fn reset(&mut self, key: &str) {
        self.states.remove(key);
    }

    pub fn reset_prefix(&mut self, prefix: &str) {
        self.states.retain(|key, _| !key.starts_with(prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const THRESHOLD: Decimal = Decimal::ONE;

    fn gate() -> PersistenceGate {
        PersistenceGate::new()
    }

    #[test]
    fn instantaneous_when_one_second_or_less() {
        let mut gate = gate();
        assert!(gate.check("k", dec!(1.5), THRESHOLD, 1.0, true, Comparison::Ge, 0.0));
        assert!(!gate.check("k", dec!(0.5), THRESHOLD, 1.0, true, Comparison::Ge, 0.0));
        assert!(gate.check("k", dec!(0.5), THRESHOLD, 0.0, false, Comparison::Le, 0.0));
    }

    #[test]
    fn strict_passes_after_exact_duration() {
        let mut gate = gate();
        // Qualifying samples from t=0; passes once elapsed ≥ 3 s.
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 0.0));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 1.5));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 2.9));
        assert!(gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 3.0));
        assert!(gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 4.0));
    }

    #[test]
    fn strict_single_bad_sample_resets_window() {
        let mut gate = gate();
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 0.0));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 2.0));
        // One non-qualifying tick wipes the progress.
        assert!(!gate.check("k", dec!(0.5), THRESHOLD, 3.0, true, Comparison::Ge, 2.5));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 3.0));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 5.9));
        assert!(gate.check("k", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 6.0));
    }

    #[test]
    fn relaxed_counts_distinct_buckets() {
        let mut gate = gate();
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 10.1));
        // Same bucket: no progress.
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 10.9));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 11.2));
        assert!(gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 12.4));
    }

    #[test]
    fn relaxed_tolerates_one_missing_bucket() {
        let mut gate = gate();
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 10.0));
        // Bucket 11 missing entirely; bucket 12 keeps the run alive with
        // two distinct qualifying buckets so far.
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 12.0));
        assert!(gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 13.0));
    }

    #[test]
    fn relaxed_two_missing_buckets_reset() {
        let mut gate = gate();
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 10.0));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 11.0));
        // Buckets 12 and 13 missing: progress resets to 1.
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 14.0));
        assert!(!gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 15.0));
        assert!(gate.check("k", dec!(2), THRESHOLD, 3.0, false, Comparison::Ge, 16.0));
    }

    #[test]
    fn le_comparison_gates_closes() {
        let mut gate = gate();
        assert!(!gate.check("k", dec!(0.5), THRESHOLD, 2.0, true, Comparison::Le, 0.0));
        assert!(gate.check("k", dec!(0.5), THRESHOLD, 2.0, true, Comparison::Le, 2.0));
        // Value above threshold fails the close channel.
        assert!(!gate.check("k", dec!(1.5), THRESHOLD, 2.0, true, Comparison::Le, 2.5));
    }

    #[test]
    fn reset_prefix_clears_only_matching_keys() {
        let mut gate = gate();
        gate.check("SYM_a_b", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 0.0);
        gate.check("OTHER_a_b", dec!(2), THRESHOLD, 3.0, true, Comparison::Ge, 0.0);
        gate.reset_prefix("SYM");
        assert!(!gate.states.contains_key("SYM_a_b"));
        assert!(gate.states.contains_key("OTHER_a_b"));
    }
}
