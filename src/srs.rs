//! Leitner box transitions driven by correctness and response latency.
//!
//! A fact moves up one box only when it is answered correctly *and* fast.
//! Slow but correct answers hold or lose ground, and anything slower than the
//! regress threshold counts as a miss:
//!
//! | elapsed                     | new box          |
//! |-----------------------------|------------------|
//! | wrong                       | 1                |
//! | `<= advance`                | box + 1          |
//! | `advance < e <= stay`       | box              |
//! | `stay < e <= regress`       | max(1, box - 2)  |
//! | `> regress`                 | 1                |

use crate::config::SchedulerConfig;
use crate::models::Fact;
use chrono::{DateTime, Duration, Utc};

/// Box a fact lands in after one review.
pub fn compute_new_box(fact: &Fact, elapsed_ms: u32, correct: bool, config: &SchedulerConfig) -> u32 {
    if !correct {
        return 1;
    }

    let current = fact.box_level.max(1);

    if elapsed_ms <= config.advance_ms {
        current + 1
    } else if elapsed_ms <= config.stay_ms {
        current
    } else if elapsed_ms <= config.regress_ms {
        current.saturating_sub(2).max(1)
    } else {
        1
    }
}

/// Wait before a fact in `box_level` is due again. Boxes past the table use its last entry.
pub fn review_interval(box_level: u32, config: &SchedulerConfig) -> Duration {
    let idx = (box_level.max(1) as usize - 1).min(config.box_times_secs.len().saturating_sub(1));
    let secs = config.box_times_secs.get(idx).copied().unwrap_or(60);
    Duration::seconds(secs as i64)
}

pub fn next_due_time(now: DateTime<Utc>, box_level: u32, config: &SchedulerConfig) -> DateTime<Utc> {
    now + review_interval(box_level, config)
}

/// Incremental mean of response times over `seen` prior reviews plus this one.
pub fn updated_average(previous: Option<f64>, seen: u32, elapsed_ms: u32) -> f64 {
    match previous {
        Some(avg) if seen > 0 => (avg * seen as f64 + elapsed_ms as f64) / (seen as f64 + 1.0),
        _ => elapsed_ms as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fact_in_box(box_level: u32) -> Fact {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        let mut fact = Fact::new("mul:7:8", "mul", vec![7, 8], 56, 1, now);
        fact.box_level = box_level;
        fact
    }

    #[test]
    fn test_wrong_answer_always_resets() {
        let config = SchedulerConfig::default();
        for box_level in 1..=12 {
            for elapsed in [0, 1000, 3000, 6000, 20000] {
                assert_eq!(compute_new_box(&fact_in_box(box_level), elapsed, false, &config), 1);
            }
        }
    }

    #[test]
    fn test_fast_answer_promotes_without_ceiling() {
        let config = SchedulerConfig::default();
        for box_level in 1..=20 {
            let new_box = compute_new_box(&fact_in_box(box_level), config.advance_ms, true, &config);
            assert_eq!(new_box, box_level + 1);
        }
    }

    #[test]
    fn test_slow_answer_never_drops_below_one() {
        let config = SchedulerConfig::default();
        for box_level in 1..=6 {
            for elapsed in (config.stay_ms + 1)..=config.regress_ms {
                assert!(compute_new_box(&fact_in_box(box_level), elapsed, true, &config) >= 1);
            }
        }
        assert_eq!(compute_new_box(&fact_in_box(2), 6000, true, &config), 1);
    }

    #[test]
    fn test_latency_bands() {
        let config = SchedulerConfig::default();
        let fact = fact_in_box(4);

        assert_eq!(compute_new_box(&fact, 2500, true, &config), 5);
        assert_eq!(compute_new_box(&fact, 4000, true, &config), 4);
        assert_eq!(compute_new_box(&fact, 6000, true, &config), 2);
        assert_eq!(compute_new_box(&fact, 10000, true, &config), 1);
    }

    #[test]
    fn test_zero_box_is_clamped() {
        let config = SchedulerConfig::default();
        assert_eq!(compute_new_box(&fact_in_box(0), 4000, true, &config), 1);
    }

    #[test]
    fn test_review_interval_grows_and_saturates() {
        let config = SchedulerConfig::default();
        assert_eq!(review_interval(1, &config), Duration::minutes(1));
        assert!(review_interval(4, &config) > review_interval(3, &config));
        assert_eq!(review_interval(11, &config), review_interval(50, &config));
    }

    #[test]
    fn test_updated_average() {
        assert_eq!(updated_average(None, 0, 1200), 1200.0);
        assert_eq!(updated_average(Some(1000.0), 1, 2000), 1500.0);
        assert_eq!(updated_average(Some(900.0), 0, 3000), 3000.0);
    }
}
