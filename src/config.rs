use crate::error::{Result, SchedulerError};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

/// Review interval per box, in seconds. Box N waits `DEFAULT_BOX_TIMES[N - 1]`.
pub const DEFAULT_BOX_TIMES: [u64; 11] = [
    MINUTE,      // 1
    10 * MINUTE, // 2
    DAY,         // 3
    3 * DAY,     // 4
    7 * DAY,     // 5
    14 * DAY,    // 6
    30 * DAY,    // 7
    90 * DAY,    // 8
    180 * DAY,   // 9
    365 * DAY,   // 10
    730 * DAY,   // 11
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Correct answers at or under this many ms promote the fact.
    pub advance_ms: u32,
    /// Correct answers at or under this many ms keep the box.
    pub stay_ms: u32,
    /// Correct answers at or under this many ms drop two boxes; slower is a miss.
    pub regress_ms: u32,
    pub box_times_secs: Vec<u64>,
    pub shuffle_thresholds: Vec<usize>,
    pub session_length: usize,
    pub min_session_facts: usize,
    pub provision_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            advance_ms: 3000,
            stay_ms: 5000,
            regress_ms: 9000,
            box_times_secs: DEFAULT_BOX_TIMES.to_vec(),
            shuffle_thresholds: vec![20, 10, 7, 5, 4, 3],
            session_length: 20,
            min_session_facts: 1,
            provision_batch: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.advance_ms < self.stay_ms && self.stay_ms < self.regress_ms) {
            return Err(SchedulerError::InvalidConfig(format!(
                "latency thresholds must increase: advance={} stay={} regress={}",
                self.advance_ms, self.stay_ms, self.regress_ms
            )));
        }
        if self.box_times_secs.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "box interval table is empty".to_string(),
            ));
        }
        if self.box_times_secs.contains(&0) {
            return Err(SchedulerError::InvalidConfig(
                "box intervals must be positive".to_string(),
            ));
        }
        if self.session_length > 0 && self.min_session_facts > self.session_length {
            return Err(SchedulerError::InvalidConfig(format!(
                "min_session_facts ({}) exceeds session_length ({})",
                self.min_session_facts, self.session_length
            )));
        }
        Ok(())
    }

    /// Defaults overridden by `FACT_DRILL_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.advance_ms = env_or("FACT_DRILL_ADVANCE_MS", config.advance_ms)?;
        config.stay_ms = env_or("FACT_DRILL_STAY_MS", config.stay_ms)?;
        config.regress_ms = env_or("FACT_DRILL_REGRESS_MS", config.regress_ms)?;
        config.session_length = env_or("FACT_DRILL_SESSION_LENGTH", config.session_length)?;
        config.min_session_facts =
            env_or("FACT_DRILL_MIN_SESSION_FACTS", config.min_session_facts)?;
        config.provision_batch = env_or("FACT_DRILL_PROVISION_BATCH", config.provision_batch)?;
        if let Ok(raw) = env::var("FACT_DRILL_SHUFFLE_THRESHOLDS") {
            config.shuffle_thresholds = parse_list(&raw)?;
        }
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub user_id: String,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://facts.db?mode=rwc".to_string()),
            bind_addr: env::var("FACT_DRILL_BIND").unwrap_or_else(|_| "127.0.0.1:3000".to_string()),
            user_id: env::var("FACT_DRILL_USER").unwrap_or_else(|_| "local".to_string()),
        }
    }
}

fn env_or<T: FromStr>(key: &str, fallback: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SchedulerError::InvalidConfig(format!("{key}: cannot parse '{raw}'"))),
        Err(_) => Ok(fallback),
    }
}

fn parse_list(raw: &str) -> Result<Vec<usize>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| SchedulerError::InvalidConfig(format!("bad threshold '{s}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_unordered_thresholds() {
        let config = SchedulerConfig {
            stay_ms: 2000,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_rejects_empty_box_table() {
        let config = SchedulerConfig {
            box_times_secs: Vec::new(),
            ..SchedulerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_minimum_above_session_length() {
        let config = SchedulerConfig {
            session_length: 5,
            min_session_facts: 6,
            ..SchedulerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(SchedulerError::InvalidConfig(_))
        ));

        let zero_length = SchedulerConfig {
            session_length: 0,
            ..SchedulerConfig::default()
        };
        assert!(zero_length.validate().is_ok());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("5, 4,3").unwrap(), vec![5, 4, 3]);
        assert!(parse_list("5,x").is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"session_length": 8}"#).unwrap();
        assert_eq!(config.session_length, 8);
        assert_eq!(config.advance_ms, 3000);
    }
}
