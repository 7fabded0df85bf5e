//! Contest periods and the background loop that moves them through their phases.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::StoreError;
use crate::queue::JudgeQueue;
use crate::store::Store;
use crate::submission::Submission;

pub const REJUDGE_MESSAGE: &str = "wait system test";

/// What happens to pretest-only verdicts when a period ends.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PretestPolicy {
    /// Every pretest-judged submission is judged again on the full data.
    All,
    /// Only the last submission per user and problem is judged again.
    Last,
    /// Pretests are the final verdict.
    #[default]
    No,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Contest {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pretest: PretestPolicy,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Period {
    pub id: u64,
    pub contest_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub ended: bool,
    /// Set while submissions of the period may still be waiting for a verdict.
    #[serde(default)]
    pub judging: bool,
    #[serde(default)]
    pub is_virtual: bool,
}

impl Period {
    pub fn is_started(&self, now: DateTime<Utc>) -> bool {
        now >= self.start
    }

    pub fn is_over(&self, now: DateTime<Utc>) -> bool {
        now > self.end
    }

    pub fn is_running(&self, now: DateTime<Utc>) -> bool {
        self.is_started(now) && !self.is_over(now)
    }
}

/// Applies the contest's pretest policy to the submissions of an ended period.
/// Returns the ids to judge again, in submission order.
///
/// Compile and judge errors are left alone. Every other pretest submission
/// loses its score and its pretest flag. Under `last`, the latest submission
/// that passed pretests is kept per user and problem, or the latest one at all
/// when none passed.
pub fn roll_over(policy: PretestPolicy, submissions: &mut [Submission]) -> Vec<u64> {
    if policy == PretestPolicy::No {
        return Vec::new();
    }
    submissions.sort_by_key(|s| (s.submitted_at, s.id));

    let mut rejudge = Vec::new();
    let mut latest: BTreeMap<(String, String), (bool, u64)> = BTreeMap::new();
    for s in submissions.iter_mut().filter(|s| s.just_pretest) {
        s.just_pretest = false;
        if s.is_ce_or_je() {
            continue;
        }
        let passed = s.simple_result == "pretest passed";
        s.zero_out();
        match policy {
            PretestPolicy::All => rejudge.push(s.id),
            _ => {
                let key = (s.user.clone(), s.problem_id.clone());
                let keep = match latest.get(&key) {
                    Some((kept_passed, _)) => passed || !kept_passed,
                    None => true,
                };
                if keep {
                    latest.insert(key, (passed, s.id));
                }
            }
        }
    }
    rejudge.extend(latest.into_values().map(|(_, id)| id));
    rejudge.sort_unstable();
    rejudge
}

/// The four passes of the period loop, each usable on its own.
#[derive(Clone)]
pub struct PeriodLifecycle {
    store: Arc<dyn Store>,
    queue: JudgeQueue,
    interval: Duration,
}

impl PeriodLifecycle {
    pub fn new(store: Arc<dyn Store>, queue: JudgeQueue, interval: Duration) -> Self {
        Self {
            store,
            queue,
            interval,
        }
    }

    fn period_submissions(&self, period_id: u64) -> Result<Vec<Submission>, StoreError> {
        Ok(self
            .store
            .submissions()?
            .into_iter()
            .filter(|s| s.period_id == Some(period_id))
            .collect())
    }

    /// Ends running periods whose end has passed and rolls over their pretests.
    pub fn end_due(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        for period in self.store.periods()? {
            if !period.running || !period.is_over(now) {
                continue;
            }
            self.store.update_period(period.id, &mut |p| {
                p.running = false;
                p.ended = true;
            })?;
            info!(period_id = period.id, "period ended");

            let policy = match self.store.load_contest(&period.contest_id) {
                Ok(contest) => contest.pretest,
                Err(e) => {
                    warn!(period_id = period.id, "contest of period unavailable: {}", e);
                    continue;
                }
            };
            let mut submissions = self.period_submissions(period.id)?;
            let rejudge = roll_over(policy, &mut submissions);
            for s in submissions {
                // Only the rolled-over fields; a worker may hold other fields.
                self.store.update_submission(s.id, &mut |stored| {
                    stored.just_pretest = s.just_pretest;
                    stored.simple_result = s.simple_result.clone();
                    stored.result.simple_result = s.result.simple_result.clone();
                    stored.result.total_score = s.result.total_score;
                    stored.result.group_results = s.result.group_results.clone();
                })?;
            }
            for id in rejudge {
                self.queue.rejudge(self.store.as_ref(), id, REJUDGE_MESSAGE)?;
            }
        }
        Ok(())
    }

    /// Starts periods whose start has arrived.
    pub fn start_due(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        for period in self.store.periods()? {
            if period.running || period.ended || !period.is_running(now) {
                continue;
            }
            self.store.update_period(period.id, &mut |p| {
                p.running = true;
                p.judging = true;
            })?;
            info!(period_id = period.id, "period started");
        }
        Ok(())
    }

    /// Clears the judging flag of ended periods with nothing left to judge.
    pub fn clear_judging(&self) -> Result<(), StoreError> {
        for period in self.store.periods()? {
            if period.running || !period.ended || !period.judging {
                continue;
            }
            let waiting = self
                .period_submissions(period.id)?
                .iter()
                .any(|s| !s.completed);
            if !waiting {
                self.store.update_period(period.id, &mut |p| p.judging = false)?;
                info!(period_id = period.id, "period fully judged");
            }
        }
        Ok(())
    }

    /// Re-arms ended periods whose start was moved into the future.
    pub fn reset_rescheduled(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        for period in self.store.periods()? {
            if period.running || !period.ended || period.judging || period.is_started(now) {
                continue;
            }
            self.store.update_period(period.id, &mut |p| p.ended = false)?;
            info!(period_id = period.id, "period rescheduled");
        }
        Ok(())
    }

    /// Runs one pass on the blocking pool, then pauses.
    async fn step(&self, pass: fn(&Self) -> Result<(), StoreError>) -> Result<(), StoreError> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || pass(&this))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))??;
        tokio::time::sleep(self.interval).await;
        Ok(())
    }

    async fn pass(&self) -> Result<(), StoreError> {
        self.step(|l| l.end_due(Utc::now())).await?;
        self.step(|l| l.start_due(Utc::now())).await?;
        self.step(Self::clear_judging).await?;
        self.step(|l| l.reset_rescheduled(Utc::now())).await
    }

    /// Runs forever. A failed pass is logged and retried after a longer pause.
    pub async fn run(self) {
        loop {
            if let Err(e) = self.pass().await {
                error!("period loop failed: {}", e);
                tokio::time::sleep(self.interval * 12).await;
            }
        }
    }
}
