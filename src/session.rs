use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::mastery::estimate_review_load;
use crate::models::{Fact, UserConfig};
use crate::queue::{build_queue, FactQueue};
use crate::srs::{compute_new_box, next_due_time, updated_average};
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// What the scheduler asks for when the pool runs short. `active_group` and
/// `table` describe the learner's selection so new facts land where
/// `build_queue` can reach them.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub pack_name: String,
    pub count: usize,
    pub active_group: u32,
    pub table: Option<i64>,
}

/// Adds facts to the learner's pool when a session cannot be filled.
pub trait Provisioner: Send + Sync {
    /// Resolves to the number of facts added.
    fn provision_facts(
        &self,
        request: ProvisionRequest,
    ) -> impl Future<Output = anyhow::Result<usize>> + Send;
}

/// Callbacks into the surrounding application. All default to no-ops.
pub trait SessionObserver: Send + Sync {
    fn session_active(&self, _active: bool) {}
    fn session_finished(&self, _report: &SessionReport) {}
    fn profile_updated(&self, _user: &UserConfig) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl SessionObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Active,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStart {
    Started,
    /// Provisioning ran; reload the pool and start again.
    AwaitingFacts { provisioned: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub correct: u32,
    pub incorrect: u32,
    pub answered: u32,
    pub unique_facts: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct SessionController<P, O = NoopObserver> {
    config: SchedulerConfig,
    provisioner: P,
    observer: O,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    user: Option<UserConfig>,
    facts: Option<Vec<Fact>>,
    state: SessionState,
    queue: FactQueue,
    current_fact: Option<Fact>,
    is_queue_empty: bool,
    triggered_thresholds: BTreeSet<usize>,
    shuffle_count: usize,
    estimated_reviews: usize,
    estimated_unique_facts: usize,
    provisioning_attempted: bool,
    session_id: Uuid,
    started_at: DateTime<Utc>,
    session_correct: u32,
    session_incorrect: u32,
    changed: Vec<Fact>,
    last_report: Option<SessionReport>,
}

impl<P: Provisioner, O: SessionObserver> SessionController<P, O> {
    pub fn new(config: SchedulerConfig, provisioner: P, observer: O) -> Result<Self> {
        config.validate()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let started_at = clock.now();

        Ok(Self {
            config,
            provisioner,
            observer,
            clock,
            rng: StdRng::from_entropy(),
            user: None,
            facts: None,
            state: SessionState::Idle,
            queue: FactQueue::new(),
            current_fact: None,
            is_queue_empty: true,
            triggered_thresholds: BTreeSet::new(),
            shuffle_count: 0,
            estimated_reviews: 0,
            estimated_unique_facts: 0,
            provisioning_attempted: false,
            session_id: Uuid::nil(),
            started_at,
            session_correct: 0,
            session_incorrect: 0,
            changed: Vec::new(),
            last_report: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn load(&mut self, user: UserConfig, facts: Vec<Fact>) {
        self.user = Some(user);
        self.facts = Some(facts);
    }

    /// Swaps in a refreshed pool, e.g. after provisioning. The live queue is untouched.
    pub fn replace_pool(&mut self, facts: Vec<Fact>) {
        self.facts = Some(facts);
    }

    /// Re-arms provisioning after a `CannotBuildSession`.
    pub fn retry_provisioning(&mut self) {
        self.provisioning_attempted = false;
    }

    pub async fn start_session(&mut self) -> Result<SessionStart> {
        let (Some(user), Some(facts)) = (self.user.as_ref(), self.facts.as_ref()) else {
            return Err(SchedulerError::NotReady);
        };

        let now = self.clock.now();
        let build = build_queue(facts, user, self.config.session_length, now, &self.config);

        if build.needs_provisioning {
            if self.provisioning_attempted {
                log::warn!(
                    "pack {} still has too few facts after provisioning ({} selected)",
                    user.active_pack,
                    build.session_facts.len()
                );
                return Err(SchedulerError::CannotBuildSession);
            }

            let request = ProvisionRequest {
                pack_name: user.active_pack.clone(),
                count: self.config.provision_batch,
                active_group: user.active_group.max(1),
                table: user.table,
            };
            self.provisioning_attempted = true;
            log::info!("requesting {} facts for pack {}", request.count, request.pack_name);

            return match self.provisioner.provision_facts(request).await {
                Ok(provisioned) => Ok(SessionStart::AwaitingFacts { provisioned }),
                Err(e) => {
                    self.provisioning_attempted = false;
                    log::warn!("provisioning failed: {:#}", e);
                    Err(SchedulerError::ProvisioningFailed(e.into()))
                }
            };
        }

        // A restart abandons the live session the same way end_session does.
        if self.state == SessionState::Active {
            self.end_session();
        }

        let load = estimate_review_load(&build.session_facts);
        self.provisioning_attempted = false;
        self.queue = build.queue;
        self.current_fact = None;
        self.estimated_reviews = load.estimated_reviews;
        self.estimated_unique_facts = load.unique_cards;
        self.triggered_thresholds.clear();
        self.shuffle_count = 0;
        self.session_correct = 0;
        self.session_incorrect = 0;
        self.session_id = Uuid::new_v4();
        self.started_at = now;
        self.last_report = None;
        self.state = SessionState::Active;

        log::info!(
            "session {} started with {} facts (~{} reviews)",
            self.session_id,
            load.unique_cards,
            load.estimated_reviews
        );
        self.observer.session_active(true);
        self.get_next_fact();

        Ok(SessionStart::Started)
    }

    /// Dequeues the earliest-due fact and makes it current.
    pub fn get_next_fact(&mut self) -> Option<&Fact> {
        self.current_fact = self.queue.pop();
        self.is_queue_empty = self.queue.is_empty();

        if self.current_fact.is_none() && self.state == SessionState::Active {
            self.finish();
        }
        self.current_fact.as_ref()
    }

    /// Grades the current fact, reschedules it and advances to the next one.
    ///
    /// Only the current fact may be answered; anything else is rejected with
    /// `FactNotTracked` and leaves the session unchanged.
    pub fn submit_answer(&mut self, fact_id: &str, correct: bool, elapsed_ms: u32) -> Result<Fact> {
        if self.state != SessionState::Active {
            return Err(SchedulerError::NotReady);
        }

        let mut fact = match self.current_fact.take() {
            Some(f) if f.id == fact_id => f,
            other => {
                self.current_fact = other;
                log::warn!("rejected answer for untracked fact {}", fact_id);
                return Err(SchedulerError::FactNotTracked(fact_id.to_string()));
            }
        };

        let now = self.clock.now();
        let old_box = fact.box_level.max(1);
        let new_box = compute_new_box(&fact, elapsed_ms, correct, &self.config);
        self.adjust_estimate(old_box, new_box);

        let first_review = fact.seen == 0;
        fact.avg_response_time = Some(updated_average(fact.avg_response_time, fact.seen, elapsed_ms));
        fact.box_level = new_box;
        fact.seen += 1;
        if correct {
            fact.correct += 1;
            self.session_correct += 1;
        } else {
            fact.incorrect += 1;
            self.session_incorrect += 1;
        }
        fact.next_due_time = next_due_time(now, new_box, &self.config);
        fact.was_last_review_correct = correct;
        fact.last_elapsed_time = elapsed_ms;
        fact.last_reviewed = Some(now);

        log::debug!(
            "fact {} box {} -> {} ({} ms, correct={})",
            fact.id,
            old_box,
            new_box,
            elapsed_ms,
            correct
        );

        // Box 4 and up leaves the live queue; due-based selection picks it up later.
        if new_box <= 3 {
            self.queue.push(fact.clone());
        }

        if first_review {
            if let Some(user) = self.user.as_mut() {
                user.record_new_card(now.date_naive());
                self.observer.profile_updated(user);
            }
        }

        self.maybe_shuffle();
        self.record_change(&fact);
        self.get_next_fact();

        Ok(fact)
    }

    /// Drops the live session without reporting it.
    pub fn end_session(&mut self) {
        let was_active = self.state == SessionState::Active;
        self.queue = FactQueue::new();
        self.current_fact = None;
        self.is_queue_empty = true;
        self.state = SessionState::Idle;
        if was_active {
            log::info!("session {} abandoned", self.session_id);
            self.observer.session_active(false);
        }
    }

    /// Facts updated since the last call, latest version of each.
    pub fn take_changed_facts(&mut self) -> Vec<Fact> {
        std::mem::take(&mut self.changed)
    }

    /// Hands back facts from `take_changed_facts` that could not be persisted.
    /// Entries recorded since then are newer and win.
    pub fn restore_changed_facts(&mut self, facts: Vec<Fact>) {
        for fact in facts {
            if !self.changed.iter().any(|f| f.id == fact.id) {
                self.changed.push(fact);
            }
        }
    }

    fn adjust_estimate(&mut self, old_box: u32, new_box: u32) {
        if new_box > old_box {
            self.estimated_reviews = self.estimated_reviews.saturating_sub(1);
        } else if old_box - new_box == 1 {
            self.estimated_reviews += 1;
        } else if old_box - new_box >= 2 {
            self.estimated_reviews += 2;
        }
    }

    fn maybe_shuffle(&mut self) {
        let size = self.queue.len();
        if self.config.shuffle_thresholds.contains(&size) && self.triggered_thresholds.insert(size) {
            self.queue.shuffle(&mut self.rng);
            self.shuffle_count += 1;
            log::debug!("queue shuffled at size {}", size);
        }
    }

    fn record_change(&mut self, fact: &Fact) {
        if let Some(pool) = self.facts.as_mut() {
            match pool.iter_mut().find(|f| f.id == fact.id) {
                Some(slot) => *slot = fact.clone(),
                None => pool.push(fact.clone()),
            }
        }
        match self.changed.iter_mut().find(|f| f.id == fact.id) {
            Some(slot) => *slot = fact.clone(),
            None => self.changed.push(fact.clone()),
        }
    }

    fn finish(&mut self) {
        self.state = SessionState::Exhausted;
        let report = SessionReport {
            session_id: self.session_id,
            correct: self.session_correct,
            incorrect: self.session_incorrect,
            answered: self.session_correct + self.session_incorrect,
            unique_facts: self.estimated_unique_facts,
            started_at: self.started_at,
            finished_at: self.clock.now(),
        };
        log::info!(
            "session {} finished: {} correct, {} incorrect",
            report.session_id,
            report.correct,
            report.incorrect
        );
        self.observer.session_finished(&report);
        self.observer.session_active(false);
        self.last_report = Some(report);
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_fact(&self) -> Option<&Fact> {
        self.current_fact.as_ref()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_queue_empty(&self) -> bool {
        self.is_queue_empty
    }

    pub fn estimated_reviews(&self) -> usize {
        self.estimated_reviews
    }

    pub fn estimated_unique_facts(&self) -> usize {
        self.estimated_unique_facts
    }

    /// Queue sizes that have already triggered a shuffle this session.
    pub fn triggered_thresholds(&self) -> Vec<usize> {
        self.triggered_thresholds.iter().copied().collect()
    }

    pub fn shuffle_count(&self) -> usize {
        self.shuffle_count
    }

    pub fn last_report(&self) -> Option<&SessionReport> {
        self.last_report.as_ref()
    }

    pub fn user(&self) -> Option<&UserConfig> {
        self.user.as_ref()
    }

    pub fn facts(&self) -> &[Fact] {
        self.facts.as_deref().unwrap_or(&[])
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod session_tests;
