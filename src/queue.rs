use crate::config::SchedulerConfig;
use crate::models::{Fact, UserConfig};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

struct QueueEntry {
    seq: u64,
    fact: Fact,
}

impl QueueEntry {
    fn key(&self) -> (DateTime<Utc>, u64) {
        (self.fact.next_due_time, self.seq)
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // Reversed so the max-heap pops the earliest due fact first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

/// Min-priority queue of facts by `next_due_time`, ties broken by insertion order.
#[derive(Default)]
pub struct FactQueue {
    heap: BinaryHeap<QueueEntry>,
    next_seq: u64,
}

impl FactQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fact: Fact) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry { seq, fact });
    }

    pub fn pop(&mut self) -> Option<Fact> {
        self.heap.pop().map(|entry| entry.fact)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.heap.iter().any(|entry| entry.fact.id == id)
    }

    /// Facts in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.heap.iter().map(|entry| &entry.fact)
    }

    /// Shuffles the contents and rebuilds the heap, so facts with equal due
    /// times come out in a fresh random order.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut facts: Vec<Fact> = std::mem::take(&mut self.heap)
            .into_vec()
            .into_iter()
            .map(|entry| entry.fact)
            .collect();
        facts.shuffle(rng);
        self.next_seq = 0;
        for fact in facts {
            self.push(fact);
        }
    }
}

impl FromIterator<Fact> for FactQueue {
    fn from_iter<I: IntoIterator<Item = Fact>>(iter: I) -> Self {
        let mut queue = FactQueue::new();
        for fact in iter {
            queue.push(fact);
        }
        queue
    }
}

pub struct QueueBuild {
    pub queue: FactQueue,
    pub session_facts: Vec<Fact>,
    pub needs_provisioning: bool,
}

impl QueueBuild {
    fn empty() -> Self {
        Self {
            queue: FactQueue::new(),
            session_facts: Vec::new(),
            needs_provisioning: false,
        }
    }
}

/// Picks the working set for one session.
///
/// Per group, in order: due reviews, then learning facts (box <= 3, not yet
/// due), then new facts capped by the daily allotment. Later groups are only
/// visited while capacity remains.
pub fn build_queue(
    facts: &[Fact],
    user: &UserConfig,
    session_length: usize,
    now: DateTime<Utc>,
    config: &SchedulerConfig,
) -> QueueBuild {
    if session_length == 0 {
        return QueueBuild::empty();
    }

    let pool: Vec<&Fact> = facts.iter().filter(|f| user.selects(f)).collect();
    let mut new_allotment = user.remaining_new_today(now.date_naive()) as usize;

    let mut session_facts: Vec<Fact> = Vec::new();
    let mut included: HashSet<String> = HashSet::new();

    for group in 1..=user.active_group.max(1) {
        if session_facts.len() >= session_length {
            break;
        }

        let in_group: Vec<&Fact> = pool
            .iter()
            .copied()
            .filter(|f| f.level.max(1) == group)
            .collect();

        let due = in_group
            .iter()
            .filter(|f| f.seen > 0 && f.is_due(now));
        let learning = in_group
            .iter()
            .filter(|f| f.seen > 0 && f.box_level <= 3 && !f.is_due(now));

        for fact in due.chain(learning) {
            if session_facts.len() >= session_length {
                break;
            }
            if included.insert(fact.id.clone()) {
                session_facts.push((*fact).clone());
            }
        }

        let capacity = session_length - session_facts.len();
        let new_limit = capacity.min(new_allotment);
        let mut added_new = 0;
        for fact in in_group.iter().filter(|f| f.is_new()) {
            if added_new >= new_limit {
                break;
            }
            if included.insert(fact.id.clone()) {
                session_facts.push((*fact).clone());
                added_new += 1;
            }
        }
        new_allotment -= added_new;

        log::debug!(
            "group {}: {} facts selected so far ({} new allowed remaining)",
            group,
            session_facts.len(),
            new_allotment
        );
    }

    let needs_provisioning = session_facts.len() < config.min_session_facts.max(1);
    let queue = session_facts.iter().cloned().collect();

    QueueBuild {
        queue,
        session_facts,
        needs_provisioning,
    }
}
