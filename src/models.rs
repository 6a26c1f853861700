use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of canonical workflow steps in every module.
pub const TOTAL_WORKFLOW_STEPS: usize = 6;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Beginner,
    Intermediate,
    Advanced,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Beginner, Tier::Intermediate, Tier::Advanced];

    pub fn previous(self) -> Option<Tier> {
        match self {
            Tier::Beginner => None,
            Tier::Intermediate => Some(Tier::Beginner),
            Tier::Advanced => Some(Tier::Intermediate),
        }
    }

    pub fn next(self) -> Option<Tier> {
        match self {
            Tier::Beginner => Some(Tier::Intermediate),
            Tier::Intermediate => Some(Tier::Advanced),
            Tier::Advanced => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tier::Beginner => "Beginner",
            Tier::Intermediate => "Intermediate",
            Tier::Advanced => "Advanced",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStep {
    Introduction,
    Mathematics,
    Intuition,
    Implementation,
    Visualization,
    Practice,
}

impl WorkflowStep {
    pub const ALL: [WorkflowStep; TOTAL_WORKFLOW_STEPS] = [
        WorkflowStep::Introduction,
        WorkflowStep::Mathematics,
        WorkflowStep::Intuition,
        WorkflowStep::Implementation,
        WorkflowStep::Visualization,
        WorkflowStep::Practice,
    ];
}

/// Lifecycle of one module for one learner. Variant order is the
/// progression order; status only ever moves forward.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MasteryStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
    Mastered,
}

impl MasteryStatus {
    /// Completed or Mastered: the state that satisfies a prerequisite.
    pub fn is_done(self) -> bool {
        matches!(self, MasteryStatus::Completed | MasteryStatus::Mastered)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeAttempt {
    pub challenge_id: String,
    pub module_id: String,
    pub timestamp: DateTime<Utc>,
    pub correct: bool,
    pub time_spent_seconds: u32,
    pub hints_used: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleProgress {
    pub module_id: String,
    pub status: MasteryStatus,
    pub completed_steps: Vec<WorkflowStep>,
    pub completion_percentage: f64,
    pub last_accessed_at: DateTime<Utc>,
    pub time_spent_minutes: u32,
    pub challenge_attempts: Vec<ChallengeAttempt>,
    pub challenge_completed: bool,
}

impl ModuleProgress {
    pub fn new(module_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            module_id: module_id.to_string(),
            status: MasteryStatus::NotStarted,
            completed_steps: Vec::new(),
            completion_percentage: 0.0,
            last_accessed_at: now,
            time_spent_minutes: 0,
            challenge_attempts: Vec::new(),
            challenge_completed: false,
        }
    }

    /// Records `step` and advances status. Returns false if the step was
    /// already recorded (only `last_accessed_at` changes then).
    pub fn complete_step(&mut self, step: WorkflowStep, now: DateTime<Utc>) -> bool {
        self.last_accessed_at = now;
        if self.completed_steps.contains(&step) {
            return false;
        }
        self.completed_steps.push(step);
        self.normalize();
        true
    }

    pub fn is_step_complete(&self, step: WorkflowStep) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Re-derives the percentage and the step-driven part of the status.
    /// Never moves status backwards.
    pub fn normalize(&mut self) {
        let mut seen = BTreeSet::new();
        self.completed_steps.retain(|s| seen.insert(*s));
        self.completion_percentage = step_percentage(self.completed_steps.len());

        let derived = match self.completed_steps.len() {
            0 => MasteryStatus::NotStarted,
            n if n >= TOTAL_WORKFLOW_STEPS => MasteryStatus::Completed,
            _ => MasteryStatus::InProgress,
        };
        self.status = self.status.max(derived);
    }

    /// The most recent `n` attempts, newest first.
    pub fn recent_attempts(&self, n: usize) -> impl Iterator<Item = &ChallengeAttempt> {
        self.challenge_attempts.iter().rev().take(n)
    }
}

pub fn step_percentage(completed: usize) -> f64 {
    round2(completed as f64 * 100.0 / TOTAL_WORKFLOW_STEPS as f64)
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AchievementRecord {
    pub earned_at: DateTime<Utc>,
    pub points: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailyActivity {
    pub steps_completed: u32,
    pub time_spent_minutes: u32,
    pub modules_touched: BTreeSet<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CertificateType {
    BeginnerComplete,
    IntermediateComplete,
    AdvancedComplete,
    MasterComplete,
}

impl CertificateType {
    /// Tiers that must be complete for eligibility.
    pub fn required_tiers(self) -> &'static [Tier] {
        match self {
            CertificateType::BeginnerComplete => &[Tier::Beginner],
            CertificateType::IntermediateComplete => &[Tier::Intermediate],
            CertificateType::AdvancedComplete => &[Tier::Advanced],
            CertificateType::MasterComplete => &Tier::ALL,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub certificate_type: CertificateType,
    pub student_name: String,
    pub issued_at: DateTime<Utc>,
    pub serial_number: String,
    pub download_ref: String,
    pub share_ref: String,
}

/// Aggregate root for one learner. Always persisted and replicated whole.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StudentState {
    pub student_id: String,
    #[serde(default)]
    pub onboarding_complete: bool,
    pub last_access_at: DateTime<Utc>,
    #[serde(default)]
    pub total_time_spent_minutes: u32,
    #[serde(default)]
    pub module_progress: BTreeMap<String, ModuleProgress>,
    #[serde(default)]
    pub achievements: BTreeMap<String, AchievementRecord>,
    #[serde(default)]
    pub daily_activity: BTreeMap<NaiveDate, DailyActivity>,
    #[serde(default)]
    pub certificates: Vec<Certificate>,
}

impl StudentState {
    pub fn new(student_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            student_id: student_id.to_string(),
            onboarding_complete: false,
            last_access_at: now,
            total_time_spent_minutes: 0,
            module_progress: BTreeMap::new(),
            achievements: BTreeMap::new(),
            daily_activity: BTreeMap::new(),
            certificates: Vec::new(),
        }
    }

    pub fn status(&self, module_id: &str) -> MasteryStatus {
        self.module_progress
            .get(module_id)
            .map(|p| p.status)
            .unwrap_or_default()
    }

    /// Re-derives every module's percentage after loading from storage.
    pub fn normalize(&mut self) {
        for progress in self.module_progress.values_mut() {
            progress.normalize();
        }
    }
}

// --- HTTP request bodies ---

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CompleteStepReq {
    pub module_id: String,
    pub step: WorkflowStep,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TimeSpentReq {
    pub module_id: String,
    pub minutes: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmitChallengeReq {
    pub answer: String,
    pub time_spent_seconds: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IssueCertificateReq {
    pub certificate_type: CertificateType,
    pub student_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn percentage_tracks_step_count() {
        let mut p = ModuleProgress::new("m1", at("2024-03-01T10:00:00Z"));
        for (i, step) in WorkflowStep::ALL.iter().enumerate() {
            p.complete_step(*step, at("2024-03-01T10:00:00Z"));
            assert_eq!(p.completion_percentage, step_percentage(i + 1));
        }
        assert_eq!(p.completion_percentage, 100.0);
        assert_eq!(step_percentage(1), 16.67);
        assert_eq!(step_percentage(3), 50.0);
    }

    #[test]
    fn repeated_step_only_refreshes_access_time() {
        let mut p = ModuleProgress::new("m1", at("2024-03-01T10:00:00Z"));
        assert!(p.complete_step(WorkflowStep::Intuition, at("2024-03-01T10:00:00Z")));
        assert!(!p.complete_step(WorkflowStep::Intuition, at("2024-03-02T10:00:00Z")));
        assert_eq!(p.completed_steps.len(), 1);
        assert_eq!(p.last_accessed_at, at("2024-03-02T10:00:00Z"));
    }

    #[test]
    fn normalize_never_regresses_mastered() {
        let mut p = ModuleProgress::new("m1", at("2024-03-01T10:00:00Z"));
        p.status = MasteryStatus::Mastered;
        p.completed_steps.clear();
        p.normalize();
        assert_eq!(p.status, MasteryStatus::Mastered);
    }

    #[test]
    fn state_round_trips_through_json() {
        let now = at("2024-03-01T10:15:30.123456789Z");
        let mut state = StudentState::new("learner-1", now);
        let mut p = ModuleProgress::new("m1", now);
        p.complete_step(WorkflowStep::Introduction, now);
        p.challenge_attempts.push(ChallengeAttempt {
            challenge_id: "m1_challenge".into(),
            module_id: "m1".into(),
            timestamp: now,
            correct: true,
            time_spent_seconds: 42,
            hints_used: 1,
        });
        state.module_progress.insert("m1".into(), p);
        state.achievements.insert(
            "first_steps".into(),
            AchievementRecord { earned_at: now, points: 10 },
        );
        let mut day = DailyActivity::default();
        day.steps_completed = 1;
        day.modules_touched.insert("m1".into());
        state.daily_activity.insert(now.date_naive(), day);

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"2024-03-01\""));
        assert!(json.contains("\"lastAccessAt\":\"2024-03-01T10:15:30.123456789Z\""));
        let back: StudentState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
