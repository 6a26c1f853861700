//! One learner's session: the progress store plus the engines that read
//! it, wired together the way a step completion flows through them.

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::achievements::{Achievement, AchievementEngine};
use crate::assessment::{AssessmentResult, SkillAssessment};
use crate::clock::Clock;
use crate::curriculum::{Challenge, Curriculum};
use crate::error::{NotEligible, NotFound, SyncError};
use crate::models::{Certificate, CertificateType, WorkflowStep};
use crate::persistence::{LocalStore, PersistenceConfig, ProgressPersistence, RemoteSync, SyncHandle, SyncStatus};
use crate::prerequisites::PrerequisiteEngine;
use crate::progress::{ProgressStore, StepChange};
use crate::recommendations::RecommendationEngine;

pub type UnlockCallback = Box<dyn Fn(&[String]) + Send + Sync>;
pub type AchievementCallback = Box<dyn Fn(&[Achievement]) + Send + Sync>;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct StepOutcome {
    #[serde(flatten)]
    pub change: StepChange,
    pub newly_unlocked: Vec<String>,
    pub achievements: Vec<Achievement>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ChallengeOutcome {
    #[serde(flatten)]
    pub result: AssessmentResult,
    pub achievements: Vec<Achievement>,
}

pub struct LearningPath {
    store: ProgressStore,
    achievements: AchievementEngine,
    assessment: SkillAssessment,
    on_unlock: Option<UnlockCallback>,
    on_achievement: Option<AchievementCallback>,
}

impl LearningPath {
    /// Opens the session for `student_id`, restoring any saved progress
    /// from `local`.
    pub fn open(
        student_id: &str,
        curriculum: Arc<Curriculum>,
        local: Arc<dyn LocalStore>,
        remote: Option<Arc<dyn RemoteSync>>,
        config: PersistenceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let persistence = ProgressPersistence::new(local, remote, config);
        Self::with_persistence(student_id, curriculum, persistence, clock)
    }

    pub fn with_persistence(
        student_id: &str,
        curriculum: Arc<Curriculum>,
        persistence: ProgressPersistence,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store: ProgressStore::open(student_id, curriculum, clock, persistence),
            achievements: AchievementEngine::default(),
            assessment: SkillAssessment::new(),
            on_unlock: None,
            on_achievement: None,
        }
    }

    pub fn on_unlock(mut self, f: impl Fn(&[String]) + Send + Sync + 'static) -> Self {
        self.on_unlock = Some(Box::new(f));
        self
    }

    pub fn on_achievement(mut self, f: impl Fn(&[Achievement]) + Send + Sync + 'static) -> Self {
        self.on_achievement = Some(Box::new(f));
        self
    }

    pub fn student_id(&self) -> &str {
        &self.store.state().student_id
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    pub fn curriculum(&self) -> &Curriculum {
        self.store.curriculum()
    }

    pub fn prerequisites(&self) -> PrerequisiteEngine<'_> {
        PrerequisiteEngine::new(self.store.curriculum(), self.store.state())
    }

    pub fn recommendations(&self) -> RecommendationEngine<'_> {
        RecommendationEngine::new(&self.store)
    }

    pub fn achievements(&self) -> &AchievementEngine {
        &self.achievements
    }

    pub fn assessment(&self) -> &SkillAssessment {
        &self.assessment
    }

    /// Records the step, then re-evaluates achievements and, if the module
    /// just became Completed, looks for newly unlocked dependents.
    pub fn complete_step(&mut self, module_id: &str, step: WorkflowStep) -> Result<StepOutcome, NotFound> {
        self.store.curriculum().lookup(module_id)?;
        let change = self.store.complete_step(module_id, step);

        let newly_unlocked = if change.completed_module() {
            info!(student = %self.student_id(), module = module_id, "module completed");
            self.prerequisites().check_for_newly_unlocked(module_id)
        } else {
            Vec::new()
        };
        let achievements = self.achievements.check_for_new(&mut self.store);

        self.notify(&newly_unlocked, &achievements);
        Ok(StepOutcome { change, newly_unlocked, achievements })
    }

    /// Accrues time on a started module. Returns whatever that earned.
    pub fn add_time_spent(&mut self, module_id: &str, minutes: u32) -> Result<Vec<Achievement>, NotFound> {
        self.store.curriculum().lookup(module_id)?;
        if !self.store.add_time_spent(module_id, minutes) {
            return Ok(Vec::new());
        }
        let achievements = self.achievements.check_for_new(&mut self.store);
        self.notify(&[], &achievements);
        Ok(achievements)
    }

    /// Evaluates the catalog without a triggering mutation, e.g. when a
    /// learner comes back after a break.
    pub fn resume(&mut self) -> Vec<Achievement> {
        let achievements = self.achievements.check_for_new(&mut self.store);
        self.notify(&[], &achievements);
        achievements
    }

    pub fn mark_onboarding_complete(&mut self) {
        self.store.mark_onboarding_complete();
    }

    pub fn challenge_for(&mut self, module_id: &str) -> Result<Challenge, NotFound> {
        self.assessment.challenge_for(&self.store, module_id).cloned()
    }

    pub fn next_hint(&mut self, challenge_id: &str) -> Result<Option<String>, NotFound> {
        self.assessment.next_hint(&self.store, challenge_id)
    }

    pub fn submit_challenge(&mut self, challenge_id: &str, answer: &str, time_spent_seconds: u32) -> ChallengeOutcome {
        let result = self.assessment.submit(&mut self.store, challenge_id, answer, time_spent_seconds);
        let achievements = if result.recorded {
            self.achievements.check_for_new(&mut self.store)
        } else {
            Vec::new()
        };
        self.notify(&[], &achievements);
        ChallengeOutcome { result, achievements }
    }

    pub fn is_eligible_for_certificate(&self, kind: CertificateType) -> bool {
        self.achievements.is_eligible_for_certificate(&self.store, kind)
    }

    /// Checks eligibility, then issues a fresh certificate.
    pub fn issue_certificate(&mut self, kind: CertificateType, student_name: &str) -> Result<Certificate, NotEligible> {
        if !self.is_eligible_for_certificate(kind) {
            return Err(NotEligible { certificate_type: kind });
        }
        Ok(self.achievements.generate_certificate(&mut self.store, kind, student_name))
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.store.persistence().status()
    }

    pub async fn force_sync_now(&self) -> Result<(), SyncError> {
        self.store.force_sync_now().await
    }

    /// For flushing without keeping the session borrowed across the
    /// remote round trip.
    pub fn sync_handle(&self) -> SyncHandle {
        self.store.persistence().handle()
    }

    pub fn reset(&mut self) {
        info!(student = %self.student_id(), "progress reset");
        self.store.reset();
    }

    fn notify(&self, unlocked: &[String], achievements: &[Achievement]) {
        if !unlocked.is_empty() {
            info!(student = %self.student_id(), modules = ?unlocked, "modules unlocked");
            if let Some(cb) = &self.on_unlock {
                cb(unlocked);
            }
        }
        if !achievements.is_empty() {
            if let Some(cb) = &self.on_achievement {
                cb(achievements);
            }
        }
    }
}
