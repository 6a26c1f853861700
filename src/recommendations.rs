//! "What next" for a learner: a fixed fallback chain plus pacing advice.
//!
//! Read-only. The chain is evaluated top to bottom and always produces a
//! recommendation; the last rule cannot miss because a curriculum is never
//! empty.

use serde::Serialize;

use crate::assessment::needs_review;
use crate::curriculum::{Curriculum, Module};
use crate::models::{MasteryStatus, ModuleProgress, StudentState, Tier};
use crate::prerequisites::PrerequisiteEngine;
use crate::progress::ProgressStore;

const FAST_TIME_RATIO: f64 = 0.7;
const SLOW_TIME_RATIO: f64 = 1.5;
const HIGH_SUCCESS_RATE: f64 = 0.9;
const LOW_SUCCESS_RATE: f64 = 0.5;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    Module,
    Challenge,
    Review,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Medium,
    High,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub module_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_id: Option<String>,
    pub reason: String,
    pub priority: Priority,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Pace {
    Easier,
    Current,
    Harder,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AdaptiveSuggestion {
    pub suggestion: Pace,
    pub reason: String,
}

pub struct RecommendationEngine<'a> {
    curriculum: &'a Curriculum,
    state: &'a StudentState,
    prereqs: PrerequisiteEngine<'a>,
    store: &'a ProgressStore,
}

fn success_ratio(p: &ModuleProgress) -> f64 {
    if p.challenge_attempts.is_empty() {
        return 0.0;
    }
    let ok = p.challenge_attempts.iter().filter(|a| a.correct).count();
    ok as f64 / p.challenge_attempts.len() as f64
}

impl<'a> RecommendationEngine<'a> {
    pub fn new(store: &'a ProgressStore) -> Self {
        let curriculum = store.curriculum();
        let state = store.state();
        Self { curriculum, state, prereqs: PrerequisiteEngine::new(curriculum, state), store }
    }

    fn progress(&self, module_id: &str) -> Option<&'a ModuleProgress> {
        self.state.module_progress.get(module_id)
    }

    /// Curriculum modules paired with their progress record, if any.
    fn tracked(&self) -> impl Iterator<Item = (&'a Module, &'a ModuleProgress)> + '_ {
        self.curriculum
            .modules()
            .iter()
            .filter_map(move |m| self.progress(&m.id).map(|p| (m, p)))
    }

    /// Every module of the tier is done. Vacuously true for an empty tier.
    fn tier_done(&self, tier: Tier) -> bool {
        self.curriculum.modules_in(tier).all(|m| self.state.status(&m.id).is_done())
    }

    /// Lowest tier that still has an incomplete module; the top tier once
    /// everything is done.
    pub fn recommended_tier(&self) -> Tier {
        Tier::ALL
            .into_iter()
            .find(|t| !self.tier_done(*t))
            .unwrap_or(Tier::Advanced)
    }

    pub fn next(&self) -> Recommendation {
        self.continue_in_progress()
            .or_else(|| self.continue_tier())
            .or_else(|| self.take_challenge())
            .or_else(|| self.advance_tier())
            .or_else(|| self.review())
            .unwrap_or_else(|| self.starting_point())
    }

    fn continue_in_progress(&self) -> Option<Recommendation> {
        let (module, _) = self
            .tracked()
            .filter(|(_, p)| p.status == MasteryStatus::InProgress)
            .max_by_key(|(_, p)| p.last_accessed_at)?;
        Some(Recommendation {
            kind: RecommendationKind::Module,
            module_id: module.id.clone(),
            challenge_id: None,
            reason: format!("Continue where you left off with {}", module.name),
            priority: Priority::High,
        })
    }

    fn continue_tier(&self) -> Option<Recommendation> {
        let tier = self.recommended_tier();
        let module = self.curriculum.modules_in(tier).find(|m| {
            self.state.status(&m.id) == MasteryStatus::NotStarted && self.prereqs.prerequisites_met(&m.id)
        })?;
        Some(Recommendation {
            kind: RecommendationKind::Module,
            module_id: module.id.clone(),
            challenge_id: None,
            reason: format!("Continue mastering the {tier} tier with {}", module.name),
            priority: Priority::High,
        })
    }

    fn take_challenge(&self) -> Option<Recommendation> {
        self.tracked()
            .filter(|(_, p)| p.status == MasteryStatus::Completed && !p.challenge_completed)
            .find_map(|(m, _)| {
                let challenge = self.curriculum.challenge_for_module(&m.id).ok()?;
                Some(Recommendation {
                    kind: RecommendationKind::Challenge,
                    module_id: m.id.clone(),
                    challenge_id: Some(challenge.id.clone()),
                    reason: format!("Master {} by completing the practice challenge", m.name),
                    priority: Priority::Medium,
                })
            })
    }

    fn advance_tier(&self) -> Option<Recommendation> {
        let tier = self.recommended_tier();
        if !self.tier_done(tier) {
            return None;
        }
        let next = tier.next()?;
        let module = self.curriculum.modules_in(next).next()?;
        Some(Recommendation {
            kind: RecommendationKind::Module,
            module_id: module.id.clone(),
            challenge_id: None,
            reason: format!("Advance to the {next} tier with {}", module.name),
            priority: Priority::High,
        })
    }

    fn review(&self) -> Option<Recommendation> {
        let (module, _) = self.tracked().find(|(_, p)| needs_review(p))?;
        Some(Recommendation {
            kind: RecommendationKind::Review,
            module_id: module.id.clone(),
            challenge_id: None,
            reason: format!("Review {} to strengthen your understanding", module.name),
            priority: Priority::Low,
        })
    }

    fn starting_point(&self) -> Recommendation {
        let module = self.curriculum.entry_module();
        Recommendation {
            kind: RecommendationKind::Module,
            module_id: module.id.clone(),
            challenge_id: None,
            reason: format!("Start your learning journey with {}", module.name),
            priority: Priority::High,
        }
    }

    pub fn reason_for(&self, module_id: &str) -> String {
        let Some(module) = self.curriculum.module(module_id) else {
            return "Continue your learning journey".to_string();
        };
        match self.state.status(module_id) {
            MasteryStatus::InProgress => format!("Continue where you left off with {}", module.name),
            MasteryStatus::NotStarted if self.prereqs.prerequisites_met(module_id) => {
                format!("Start learning {} - all prerequisites completed", module.name)
            }
            MasteryStatus::NotStarted => format!("Complete prerequisites to unlock {}", module.name),
            MasteryStatus::Completed => {
                format!("Master {} by completing the practice challenge", module.name)
            }
            MasteryStatus::Mastered => format!("Review {} to reinforce your knowledge", module.name),
        }
    }

    /// Unlocked modules not yet done, easiest tier first.
    pub fn suggested_modules(&self, count: usize) -> Vec<&'a Module> {
        let mut available: Vec<&Module> = self
            .prereqs
            .unlocked_modules()
            .into_iter()
            .filter(|m| !self.state.status(&m.id).is_done())
            .collect();
        available.sort_by_key(|m| m.tier);
        available.truncate(count);
        available
    }

    fn done_modules(&self) -> Vec<(&'a Module, &'a ModuleProgress)> {
        self.tracked().filter(|(_, p)| p.status.is_done()).collect()
    }

    fn time_ratio(module: &Module, p: &ModuleProgress) -> Option<f64> {
        (module.estimated_minutes > 0)
            .then(|| f64::from(p.time_spent_minutes) / f64::from(module.estimated_minutes))
    }

    /// Fast and accurate across at least three done modules.
    pub fn should_suggest_advanced(&self) -> bool {
        let done = self.done_modules();
        if done.len() < 3 {
            return false;
        }
        let n = done.len() as f64;
        let avg_ratio = done.iter().filter_map(|(m, p)| Self::time_ratio(m, p)).sum::<f64>() / n;
        let avg_success = done.iter().map(|(_, p)| success_ratio(p)).sum::<f64>() / n;
        avg_ratio < FAST_TIME_RATIO && avg_success > HIGH_SUCCESS_RATE
    }

    /// Advisory only; nothing is applied automatically.
    pub fn adaptive_difficulty(&self) -> AdaptiveSuggestion {
        if self.should_suggest_advanced() {
            return AdaptiveSuggestion {
                suggestion: Pace::Harder,
                reason: "Your performance is excellent! Consider exploring advanced topics.".into(),
            };
        }

        let done = self.done_modules();
        if done.len() < 2 {
            return AdaptiveSuggestion {
                suggestion: Pace::Current,
                reason: "Continue at your current pace to build a strong foundation.".into(),
            };
        }

        let struggling: usize = done
            .iter()
            .map(|(m, p)| {
                let slow = Self::time_ratio(m, p).is_some_and(|r| r > SLOW_TIME_RATIO);
                let inaccurate = !p.challenge_attempts.is_empty() && success_ratio(p) < LOW_SUCCESS_RATE;
                usize::from(slow) + usize::from(inaccurate)
            })
            .sum();

        if struggling as f64 >= done.len() as f64 / 2.0 {
            AdaptiveSuggestion {
                suggestion: Pace::Easier,
                reason: "Consider reviewing prerequisite concepts to strengthen your foundation.".into(),
            }
        } else {
            AdaptiveSuggestion {
                suggestion: Pace::Current,
                reason: "You're making steady progress. Keep up the good work!".into(),
            }
        }
    }

    /// At most three short tips.
    pub fn personalized_tips(&self) -> Vec<String> {
        let mut tips = Vec::new();

        match self.store.current_streak() {
            0 => tips.push("Start a learning streak by practicing daily!".to_string()),
            s if s >= 7 => tips.push(format!("Amazing {s}-day streak! Keep the momentum going.")),
            _ => {}
        }

        if self.tracked().any(|(_, p)| p.status == MasteryStatus::Completed && !p.challenge_completed) {
            tips.push("Complete practice challenges to master your modules!".to_string());
        }

        if self.should_suggest_advanced() {
            tips.push("Your performance is excellent! Consider the advanced tier next.".to_string());
        }

        let pct = self.store.overall_progress().percentage;
        tips.push(
            match pct {
                p if p < 25.0 => "Focus on completing beginner modules to build a strong foundation.",
                p if p < 50.0 => "You're making great progress! Keep exploring new modules.",
                p if p < 75.0 => "You're over halfway there! Advanced modules await.",
                _ => "You're almost done with the whole track! Finish strong!",
            }
            .to_string(),
        );

        tips.truncate(3);
        tips
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{ChallengeAttempt, WorkflowStep};
    use crate::persistence::{MemoryStore, ProgressPersistence};
    use chrono::Duration;
    use std::sync::Arc;

    const BEGINNER: [&str; 5] = ["linear_regression", "logistic_regression", "knn", "kmeans", "naive_bayes"];

    fn fixture() -> (ProgressStore, ManualClock) {
        let clock = ManualClock::new("2024-03-01T12:00:00Z".parse().unwrap());
        let store = ProgressStore::open(
            "learner",
            Arc::new(Curriculum::builtin()),
            Arc::new(clock.clone()),
            ProgressPersistence::local(Arc::new(MemoryStore::new())),
        );
        (store, clock)
    }

    fn finish(store: &mut ProgressStore, id: &str) {
        for step in WorkflowStep::ALL {
            store.complete_step(id, step);
        }
    }

    fn attempt(store: &mut ProgressStore, id: &str, correct: bool) {
        let a = ChallengeAttempt {
            challenge_id: format!("{id}_challenge"),
            module_id: id.into(),
            timestamp: store.clock().now(),
            correct,
            time_spent_seconds: 30,
            hints_used: 0,
        };
        store.record_challenge_attempt(id, a);
    }

    #[test]
    fn fresh_learner_starts_at_first_beginner_module() {
        let (store, _) = fixture();
        let rec = RecommendationEngine::new(&store).next();
        assert_eq!(rec.module_id, "linear_regression");
        assert_eq!(rec.kind, RecommendationKind::Module);
    }

    #[test]
    fn most_recent_in_progress_wins() {
        let (mut store, clock) = fixture();
        store.complete_step("knn", WorkflowStep::Introduction);
        clock.advance(Duration::minutes(5));
        store.complete_step("kmeans", WorkflowStep::Introduction);
        let rec = RecommendationEngine::new(&store).next();
        assert_eq!(rec.module_id, "kmeans");
        assert_eq!(rec.priority, Priority::High);
    }

    #[test]
    fn challenge_after_tier_is_done() {
        let (mut store, _) = fixture();
        for id in BEGINNER {
            finish(&mut store, id);
        }
        // decision_tree is the first open Intermediate module
        let engine = RecommendationEngine::new(&store);
        assert_eq!(engine.recommended_tier(), Tier::Intermediate);
        assert_eq!(engine.next().module_id, "decision_tree");

        for id in ["decision_tree", "ann"] {
            finish(&mut store, id);
        }
        for id in ["svm", "cnn", "rnn", "transformer"] {
            finish(&mut store, id);
        }
        let rec = RecommendationEngine::new(&store).next();
        assert_eq!(rec.kind, RecommendationKind::Challenge);
        assert_eq!(rec.module_id, "linear_regression");
        assert_eq!(rec.challenge_id.as_deref(), Some("linear_regression_challenge"));
    }

    #[test]
    fn reasons_follow_status() {
        let (mut store, _) = fixture();
        finish(&mut store, "knn");
        let engine = RecommendationEngine::new(&store);
        assert!(engine.reason_for("knn").starts_with("Master"));
        assert!(engine.reason_for("svm").starts_with("Complete prerequisites"));
        assert!(engine.reason_for("kmeans").starts_with("Start learning"));
        assert_eq!(engine.reason_for("ghost"), "Continue your learning journey");

        let suggested: Vec<_> = engine.suggested_modules(3).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(suggested, ["linear_regression", "logistic_regression", "kmeans"]);
    }

    #[test]
    fn adaptive_pacing() {
        let (mut store, _) = fixture();
        assert_eq!(RecommendationEngine::new(&store).adaptive_difficulty().suggestion, Pace::Current);

        // fast and always right
        for id in ["knn", "kmeans", "naive_bayes"] {
            finish(&mut store, id);
            store.add_time_spent(id, 30);
            attempt(&mut store, id, true);
        }
        assert_eq!(RecommendationEngine::new(&store).adaptive_difficulty().suggestion, Pace::Harder);

        // slow and mostly wrong
        for id in ["knn", "kmeans", "naive_bayes"] {
            store.add_time_spent(id, 400);
            attempt(&mut store, id, false);
            attempt(&mut store, id, false);
        }
        assert_eq!(RecommendationEngine::new(&store).adaptive_difficulty().suggestion, Pace::Easier);
    }

    #[test]
    fn tips_are_capped() {
        let (mut store, _) = fixture();
        let tips = RecommendationEngine::new(&store).personalized_tips();
        assert_eq!(tips.len(), 2);
        assert!(tips[0].contains("streak"));

        finish(&mut store, "knn");
        let tips = RecommendationEngine::new(&store).personalized_tips();
        assert!(tips.len() <= 3);
        assert!(tips.iter().any(|t| t.contains("challenges")));
    }
}
