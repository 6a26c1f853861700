//! Progress store: the only writer of [`StudentState`].
//!
//! Mutators never fail. Each one updates the in-memory state, which is the
//! source of truth for the session, and then hands a snapshot to the
//! persistence layer. A local write error is logged, never propagated.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, warn};

use crate::clock::Clock;
use crate::curriculum::Curriculum;
use crate::error::SyncError;
use crate::models::{
    round2, AchievementRecord, Certificate, ChallengeAttempt, DailyActivity, MasteryStatus,
    ModuleProgress, StudentState, WorkflowStep, TOTAL_WORKFLOW_STEPS,
};
use crate::persistence::ProgressPersistence;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct OverallProgress {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub percentage: f64,
}

/// What a step completion changed.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepChange {
    pub step_added: bool,
    pub previous: MasteryStatus,
    pub status: MasteryStatus,
}

impl StepChange {
    /// The module moved into `Completed` with this step.
    pub fn completed_module(&self) -> bool {
        self.previous < MasteryStatus::Completed && self.status == MasteryStatus::Completed
    }
}

pub struct ProgressStore {
    state: StudentState,
    curriculum: Arc<Curriculum>,
    clock: Arc<dyn Clock>,
    persistence: ProgressPersistence,
}

impl ProgressStore {
    /// Opens the learner's state from the local copy. A missing copy is a
    /// fresh start; an unreadable one is logged and also treated as fresh.
    pub fn open(
        student_id: &str,
        curriculum: Arc<Curriculum>,
        clock: Arc<dyn Clock>,
        persistence: ProgressPersistence,
    ) -> Self {
        let state = match persistence.load() {
            Ok(Some(state)) if state.student_id == student_id => state,
            Ok(Some(other)) => {
                warn!(expected = student_id, found = %other.student_id, "stored progress belongs to another learner, starting fresh");
                StudentState::new(student_id, clock.now())
            }
            Ok(None) => StudentState::new(student_id, clock.now()),
            Err(e) => {
                error!(student = student_id, error = %e, "stored progress is unreadable, starting fresh");
                StudentState::new(student_id, clock.now())
            }
        };
        Self { state, curriculum, clock, persistence }
    }

    pub fn state(&self) -> &StudentState {
        &self.state
    }

    pub fn curriculum(&self) -> &Curriculum {
        &self.curriculum
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn persistence(&self) -> &ProgressPersistence {
        &self.persistence
    }

    // --- mutators ---

    /// Idempotent per step: a repeat only refreshes the access time.
    pub fn complete_step(&mut self, module_id: &str, step: WorkflowStep) -> StepChange {
        let now = self.clock.now();
        let progress = self
            .state
            .module_progress
            .entry(module_id.to_string())
            .or_insert_with(|| ModuleProgress::new(module_id, now));

        let previous = progress.status;
        let step_added = progress.complete_step(step, now);
        let status = progress.status;
        self.state.last_access_at = now;

        if step_added {
            let day = self.today_mut();
            day.steps_completed += 1;
            day.modules_touched.insert(module_id.to_string());
        }

        self.persist();
        StepChange { step_added, previous, status }
    }

    /// Completed -> Mastered. Any other starting status is a no-op.
    pub fn mark_mastered(&mut self, module_id: &str) -> bool {
        let Some(progress) = self.state.module_progress.get_mut(module_id) else {
            return false;
        };
        if progress.status != MasteryStatus::Completed {
            return false;
        }
        progress.status = MasteryStatus::Mastered;
        progress.challenge_completed = true;
        self.persist();
        true
    }

    /// Appends to the module's attempt log. Modules without a progress
    /// record (no step completed yet) do not record attempts.
    pub fn record_challenge_attempt(&mut self, module_id: &str, attempt: ChallengeAttempt) -> bool {
        let Some(progress) = self.state.module_progress.get_mut(module_id) else {
            return false;
        };
        progress.challenge_attempts.push(attempt);
        self.persist();
        true
    }

    pub fn add_time_spent(&mut self, module_id: &str, minutes: u32) -> bool {
        let Some(progress) = self.state.module_progress.get_mut(module_id) else {
            return false;
        };
        progress.time_spent_minutes = progress.time_spent_minutes.saturating_add(minutes);
        self.state.total_time_spent_minutes =
            self.state.total_time_spent_minutes.saturating_add(minutes);
        let day = self.today_mut();
        day.time_spent_minutes = day.time_spent_minutes.saturating_add(minutes);
        day.modules_touched.insert(module_id.to_string());
        self.persist();
        true
    }

    pub fn mark_onboarding_complete(&mut self) {
        if !self.state.onboarding_complete {
            self.state.onboarding_complete = true;
            self.persist();
        }
    }

    /// Creates the record once; later calls for the same id are no-ops.
    pub fn record_achievement(&mut self, achievement_id: &str, points: u32) -> bool {
        if self.state.achievements.contains_key(achievement_id) {
            return false;
        }
        let record = AchievementRecord { earned_at: self.clock.now(), points };
        self.state.achievements.insert(achievement_id.to_string(), record);
        self.persist();
        true
    }

    pub fn append_certificate(&mut self, certificate: Certificate) {
        self.state.certificates.push(certificate);
        self.persist();
    }

    /// Wipes all progress, locally and pending.
    pub fn reset(&mut self) {
        if let Err(e) = self.persistence.clear() {
            error!(error = %e, "failed to clear local progress copy");
        }
        self.state = StudentState::new(&self.state.student_id, self.clock.now());
    }

    pub async fn force_sync_now(&self) -> Result<(), SyncError> {
        self.persistence.force_sync_now().await
    }

    fn today_mut(&mut self) -> &mut DailyActivity {
        let today = self.clock.today();
        self.state.daily_activity.entry(today).or_default()
    }

    fn persist(&self) {
        if let Err(e) = self.persistence.save(&self.state) {
            error!(student = %self.state.student_id, error = %e, "failed to write local progress copy");
        }
    }

    // --- readers ---

    pub fn module(&self, module_id: &str) -> Option<&ModuleProgress> {
        self.state.module_progress.get(module_id)
    }

    pub fn status(&self, module_id: &str) -> MasteryStatus {
        self.state.status(module_id)
    }

    pub fn completion_percentage(&self, module_id: &str) -> f64 {
        self.module(module_id).map(|p| p.completion_percentage).unwrap_or(0.0)
    }

    pub fn is_step_complete(&self, module_id: &str, step: WorkflowStep) -> bool {
        self.module(module_id).is_some_and(|p| p.is_step_complete(step))
    }

    pub fn step_progress(&self, module_id: &str) -> BTreeMap<WorkflowStep, bool> {
        WorkflowStep::ALL
            .into_iter()
            .map(|s| (s, self.is_step_complete(module_id, s)))
            .collect()
    }

    /// Step completion across every curriculum module.
    pub fn overall_progress(&self) -> OverallProgress {
        let total_steps = self.curriculum.len() * TOTAL_WORKFLOW_STEPS;
        let completed_steps: usize = self
            .curriculum
            .modules()
            .iter()
            .filter_map(|m| self.module(&m.id))
            .map(|p| p.completed_steps.len())
            .sum();
        let percentage = if total_steps == 0 {
            0.0
        } else {
            round2(completed_steps as f64 * 100.0 / total_steps as f64)
        };
        OverallProgress { total_steps, completed_steps, percentage }
    }

    pub fn completed_module_count(&self) -> usize {
        self.state.module_progress.values().filter(|p| p.status.is_done()).count()
    }

    pub fn current_streak(&self) -> u32 {
        current_streak(&self.state.daily_activity, self.clock.today())
    }

    pub fn longest_streak(&self) -> u32 {
        longest_streak(&self.state.daily_activity)
    }
}

/// Consecutive active days ending at `today`. No entry today means 0.
pub fn current_streak(activity: &BTreeMap<NaiveDate, DailyActivity>, today: NaiveDate) -> u32 {
    let mut streak = 0;
    let mut day = Some(today);
    while let Some(d) = day {
        if !activity.contains_key(&d) {
            break;
        }
        streak += 1;
        day = d.pred_opt();
    }
    streak
}

/// Longest run of consecutive active days anywhere in the log.
pub fn longest_streak(activity: &BTreeMap<NaiveDate, DailyActivity>) -> u32 {
    let mut longest = 0;
    let mut run = 0;
    let mut prev: Option<NaiveDate> = None;
    for &day in activity.keys() {
        run = match prev {
            Some(p) if p.succ_opt() == Some(day) => run + 1,
            _ => 1,
        };
        longest = longest.max(run);
        prev = Some(day);
    }
    longest
}
