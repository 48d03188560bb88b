use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Mul,
}

impl Operation {
    pub fn prefix(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Mul => "mul",
        }
    }

    pub fn apply(&self, left: i64, right: i64) -> i64 {
        match self {
            Operation::Add => left + right,
            Operation::Mul => left * right,
        }
    }
}

/// One arithmetic fact and its spaced-repetition progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub id: String, // e.g. "mul:7:8"
    pub pack: String,
    pub operands: Vec<i64>,
    pub answer: i64,
    pub level: u32,
    pub difficulty: u32,
    #[serde(rename = "box")]
    pub box_level: u32,
    pub next_due_time: DateTime<Utc>,
    pub last_reviewed: Option<DateTime<Utc>>,
    pub was_last_review_correct: bool,
    pub last_elapsed_time: u32, // ms
    pub avg_response_time: Option<f64>, // ms
    pub seen: u32,
    pub correct: u32,
    pub incorrect: u32,
}

impl Fact {
    /// A fact that has never been reviewed, due immediately.
    pub fn new(
        id: impl Into<String>,
        pack: impl Into<String>,
        operands: Vec<i64>,
        answer: i64,
        level: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            pack: pack.into(),
            operands,
            answer,
            level,
            difficulty: 0,
            box_level: 1,
            next_due_time: now,
            last_reviewed: None,
            was_last_review_correct: false,
            last_elapsed_time: 0,
            avg_response_time: None,
            seen: 0,
            correct: 0,
            incorrect: 0,
        }
    }

    pub fn is_new(&self) -> bool {
        self.seen == 0
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_due_time
    }

    pub fn is_mastered(&self) -> bool {
        self.box_level > 3
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackMeta {
    pub total_facts: u32,
    pub next_seq_to_introduce: u32,
    pub is_completed: bool,
    pub last_activity: Option<DateTime<Utc>>,
}

/// The scheduling-relevant slice of a learner profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserConfig {
    pub id: String,
    pub active_pack: String,
    pub active_group: u32,
    pub table: Option<i64>,
    pub max_new_cards_per_day: u32,
    pub new_cards_seen_today: u32,
    pub last_new_card_date: Option<NaiveDate>,
}

impl UserConfig {
    pub fn new(id: impl Into<String>, active_pack: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            active_pack: active_pack.into(),
            active_group: 1,
            table: None,
            max_new_cards_per_day: 10,
            new_cards_seen_today: 0,
            last_new_card_date: None,
        }
    }

    /// New facts the learner may still be introduced to on `today`.
    pub fn remaining_new_today(&self, today: NaiveDate) -> u32 {
        if self.last_new_card_date == Some(today) {
            self.max_new_cards_per_day
                .saturating_sub(self.new_cards_seen_today)
        } else {
            self.max_new_cards_per_day
        }
    }

    /// Whether `fact` belongs to the learner's pack and table selection.
    pub fn selects(&self, fact: &Fact) -> bool {
        fact.pack == self.active_pack && self.table.map_or(true, |t| fact.operands.contains(&t))
    }

    /// Raises `active_group` so every introduced fact in the selection is reachable.
    /// Returns true when the group moved.
    pub fn cover_introduced_groups(&mut self, facts: &[Fact]) -> bool {
        let highest = facts
            .iter()
            .filter(|f| self.selects(f))
            .map(|f| f.level)
            .max();
        match highest {
            Some(level) if level > self.active_group => {
                self.active_group = level;
                true
            }
            _ => false,
        }
    }

    /// Counts one newly introduced fact, rolling the counter over on a new day.
    pub fn record_new_card(&mut self, today: NaiveDate) {
        if self.last_new_card_date == Some(today) {
            self.new_cards_seen_today += 1;
        } else {
            self.new_cards_seen_today = 1;
            self.last_new_card_date = Some(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, d).unwrap()
    }

    #[test]
    fn test_remaining_new_today_same_day() {
        let mut user = UserConfig::new("u1", "mul");
        user.max_new_cards_per_day = 5;
        user.new_cards_seen_today = 3;
        user.last_new_card_date = Some(day(10));

        assert_eq!(user.remaining_new_today(day(10)), 2);
    }

    #[test]
    fn test_remaining_new_today_resets_on_new_day() {
        let mut user = UserConfig::new("u1", "mul");
        user.max_new_cards_per_day = 5;
        user.new_cards_seen_today = 5;
        user.last_new_card_date = Some(day(10));

        assert_eq!(user.remaining_new_today(day(11)), 5);
    }

    #[test]
    fn test_remaining_never_underflows() {
        let mut user = UserConfig::new("u1", "mul");
        user.max_new_cards_per_day = 2;
        user.new_cards_seen_today = 7;
        user.last_new_card_date = Some(day(10));

        assert_eq!(user.remaining_new_today(day(10)), 0);
    }

    #[test]
    fn test_record_new_card() {
        let mut user = UserConfig::new("u1", "mul");
        user.record_new_card(day(10));
        user.record_new_card(day(10));
        assert_eq!(user.new_cards_seen_today, 2);

        user.record_new_card(day(11));
        assert_eq!(user.new_cards_seen_today, 1);
        assert_eq!(user.last_new_card_date, Some(day(11)));
    }

    fn fact(id: &str, operands: Vec<i64>, level: u32) -> Fact {
        let now = chrono::Utc::now();
        Fact::new(id, "mul", operands, 0, level, now)
    }

    #[test]
    fn test_selects_by_pack_and_table() {
        let mut user = UserConfig::new("u1", "mul");
        user.table = Some(7);

        assert!(user.selects(&fact("mul:7:2", vec![7, 2], 3)));
        assert!(!user.selects(&fact("mul:6:2", vec![6, 2], 2)));

        let mut other = fact("add:7:2", vec![7, 2], 2);
        other.pack = "add".to_string();
        assert!(!user.selects(&other));
    }

    #[test]
    fn test_cover_introduced_groups_only_raises() {
        let mut user = UserConfig::new("u1", "mul");
        let facts = vec![fact("mul:1:1", vec![1, 1], 1), fact("mul:1:4", vec![1, 4], 2)];

        assert!(user.cover_introduced_groups(&facts));
        assert_eq!(user.active_group, 2);
        assert!(!user.cover_introduced_groups(&facts[..1]));
        assert_eq!(user.active_group, 2);
    }

    #[test]
    fn test_cover_introduced_groups_respects_table() {
        let mut user = UserConfig::new("u1", "mul");
        user.table = Some(2);
        let facts = vec![fact("mul:1:2", vec![1, 2], 1), fact("mul:9:9", vec![9, 9], 3)];

        assert!(!user.cover_introduced_groups(&facts));
        assert_eq!(user.active_group, 1);
    }
}
