use crate::models::{Fact, PackMeta};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashSet;

/// Fact ids belonging to one pack. Build once per pack and pass it around.
#[derive(Debug, Clone, Default)]
pub struct PackIndex {
    ids: HashSet<String>,
}

impl PackIndex {
    pub fn new(ids: impl IntoIterator<Item = String>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    pub fn from_facts(pack: &str, facts: &[Fact]) -> Self {
        Self::new(
            facts
                .iter()
                .filter(|f| f.pack == pack)
                .map(|f| f.id.clone()),
        )
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DueCounts {
    pub due_today: usize,
    pub due_tomorrow: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ReviewLoad {
    pub unique_cards: usize,
    pub estimated_reviews: usize,
    pub average_repetitions: f64,
}

fn percent_of_pack<F>(facts: &[Fact], meta: Option<&PackMeta>, index: &PackIndex, pred: F) -> u32
where
    F: Fn(&Fact) -> bool,
{
    let Some(meta) = meta else { return 0 };
    if meta.total_facts == 0 || index.is_empty() {
        return 0;
    }

    let count = facts
        .iter()
        .filter(|f| index.contains(&f.id) && pred(*f))
        .count();

    let pct = (100.0 * count as f64 / meta.total_facts as f64).round() as u32;
    pct.min(100)
}

/// Share of the whole pack (not just introduced facts) sitting above box 3.
pub fn percent_pack_mastered(facts: &[Fact], meta: Option<&PackMeta>, index: &PackIndex) -> u32 {
    percent_of_pack(facts, meta, index, Fact::is_mastered)
}

pub fn percent_pack_discovered(facts: &[Fact], meta: Option<&PackMeta>, index: &PackIndex) -> u32 {
    percent_of_pack(facts, meta, index, |f| f.seen > 0)
}

pub fn percent_pack_introduced(meta: &PackMeta) -> u32 {
    if meta.total_facts == 0 {
        return 0;
    }
    let pct = (100.0 * meta.next_seq_to_introduce as f64 / meta.total_facts as f64).round() as u32;
    pct.min(100)
}

/// `due_tomorrow` includes everything in `due_today`.
pub fn count_due_cards_in_pack(
    facts: &[Fact],
    meta: Option<&PackMeta>,
    index: &PackIndex,
    now: DateTime<Utc>,
) -> DueCounts {
    let mut counts = DueCounts {
        due_today: 0,
        due_tomorrow: 0,
    };
    if meta.is_none() {
        return counts;
    }

    let tomorrow = now + Duration::hours(24);
    for fact in facts.iter().filter(|f| index.contains(&f.id)) {
        if fact.next_due_time <= now {
            counts.due_today += 1;
        }
        if fact.next_due_time <= tomorrow {
            counts.due_tomorrow += 1;
        }
    }
    counts
}

/// Repetitions still expected before a fact leaves the learning boxes.
pub fn remaining_repetitions(box_level: u32) -> usize {
    match box_level {
        0 | 1 => 3,
        2 => 2,
        _ => 1,
    }
}

pub fn estimate_review_load(facts: &[Fact]) -> ReviewLoad {
    let unique_cards = facts.len();
    let estimated_reviews: usize = facts
        .iter()
        .map(|f| remaining_repetitions(f.box_level))
        .sum();
    let average_repetitions = if unique_cards == 0 {
        0.0
    } else {
        estimated_reviews as f64 / unique_cards as f64
    };

    ReviewLoad {
        unique_cards,
        estimated_reviews,
        average_repetitions,
    }
}
