//! Practice challenges: lookup, hints, answer checking and scoring.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};

use crate::curriculum::Challenge;
use crate::error::NotFound;
use crate::models::{ChallengeAttempt, MasteryStatus};
use crate::progress::ProgressStore;

const FAST_SECONDS: u32 = 60;
const SLOW_SECONDS: u32 = 300;
const HINT_PENALTY: u32 = 10;

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AssessmentResult {
    pub correct: bool,
    pub score: u32,
    pub feedback: String,
    /// Offered after a wrong answer while the hint is still unused.
    pub hints: Vec<String>,
    pub explanation: String,
    /// The attempt was appended to the learner's history.
    pub recorded: bool,
    pub mastered: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PerformanceAnalysis {
    pub score: u32,
    pub success_rate: u32,
    pub average_time_seconds: u32,
    pub total_attempts: usize,
    pub needs_review: bool,
    pub strengths: Vec<&'static str>,
    pub improvements: Vec<&'static str>,
}

/// Per-session hint counters. Each challenge has at most one hint.
#[derive(Debug, Default)]
pub struct SkillAssessment {
    hints_used: HashMap<String, u32>,
}

/// Normalized exact match: surrounding whitespace and case are ignored.
pub fn answer_matches(challenge: &Challenge, answer: &str) -> bool {
    answer.trim().to_lowercase() == challenge.correct_answer.trim().to_lowercase()
}

/// 100, minus 10 per hint, minus a time penalty, plus 10 for a fast answer
/// without hints. Clamped to 0..=100; a wrong answer scores 0.
pub fn score(correct: bool, time_spent_seconds: u32, hints_used: u32) -> u32 {
    if !correct {
        return 0;
    }
    let penalty = match time_spent_seconds {
        t if t > SLOW_SECONDS => 30,
        t if t > FAST_SECONDS * 2 => 20,
        t if t > FAST_SECONDS => 10,
        _ => 0,
    };
    let bonus = if time_spent_seconds < FAST_SECONDS && hints_used == 0 { 10 } else { 0 };
    let raw = 100i64 - i64::from(hints_used) * i64::from(HINT_PENALTY) - penalty + bonus;
    raw.clamp(0, 100) as u32
}

fn feedback(correct: bool, score: u32) -> &'static str {
    if !correct {
        return "Not quite right. Review the hints and try again!";
    }
    match score {
        100.. => "Perfect! Outstanding performance with no hints needed.",
        90..=99 => "Excellent work! You have a strong understanding of this module.",
        80..=89 => "Great job! You've mastered the core concepts.",
        70..=79 => "Good work! Consider reviewing the material to strengthen your understanding.",
        _ => "Correct! There's room for improvement. Try to solve it faster with fewer hints.",
    }
}

impl SkillAssessment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the module's challenge and resets its hint counter.
    pub fn challenge_for<'s>(
        &mut self,
        store: &'s ProgressStore,
        module_id: &str,
    ) -> Result<&'s Challenge, NotFound> {
        let challenge = store.curriculum().challenge_for_module(module_id)?;
        self.hints_used.insert(challenge.id.clone(), 0);
        Ok(challenge)
    }

    pub fn has_challenge(&self, store: &ProgressStore, module_id: &str) -> bool {
        store.curriculum().challenge_for_module(module_id).is_ok()
    }

    pub fn hints_used(&self, challenge_id: &str) -> u32 {
        self.hints_used.get(challenge_id).copied().unwrap_or(0)
    }

    /// The challenge's hint, once. `Ok(None)` when it is used up or the
    /// challenge has none.
    pub fn next_hint(&mut self, store: &ProgressStore, challenge_id: &str) -> Result<Option<String>, NotFound> {
        let challenge = store.curriculum().challenge(challenge_id)?;
        Ok(self.take_hint(challenge))
    }

    fn take_hint(&mut self, challenge: &Challenge) -> Option<String> {
        let used = self.hints_used.entry(challenge.id.clone()).or_insert(0);
        if *used >= 1 {
            return None;
        }
        let hint = challenge.hint.clone()?;
        *used = 1;
        Some(hint)
    }

    /// Checks the answer, records the attempt and promotes a Completed
    /// module to Mastered on a correct answer. An unknown challenge id
    /// yields a zero-score result and changes nothing.
    pub fn submit(
        &mut self,
        store: &mut ProgressStore,
        challenge_id: &str,
        answer: &str,
        time_spent_seconds: u32,
    ) -> AssessmentResult {
        let challenge = match store.curriculum().challenge(challenge_id) {
            Ok(c) => c.clone(),
            Err(e) => {
                debug!(challenge = challenge_id, "submission for unknown challenge");
                return AssessmentResult {
                    correct: false,
                    score: 0,
                    feedback: "Challenge not found".to_string(),
                    hints: Vec::new(),
                    explanation: e.reason,
                    recorded: false,
                    mastered: false,
                };
            }
        };

        let correct = answer_matches(&challenge, answer);
        let hints_used = self.hints_used(&challenge.id);
        let score = score(correct, time_spent_seconds, hints_used);

        let attempt = ChallengeAttempt {
            challenge_id: challenge.id.clone(),
            module_id: challenge.module_id.clone(),
            timestamp: store.clock().now(),
            correct,
            time_spent_seconds,
            hints_used,
        };
        let recorded = store.record_challenge_attempt(&challenge.module_id, attempt);

        let mastered = correct
            && store.status(&challenge.module_id) == MasteryStatus::Completed
            && store.mark_mastered(&challenge.module_id);
        if mastered {
            info!(student = %store.state().student_id, module = %challenge.module_id, "module mastered");
        }

        let explanation = if correct {
            challenge.explanation.clone()
        } else {
            format!("The correct answer is \"{}\". {}", challenge.correct_answer, challenge.explanation)
        };
        let hints = if correct { Vec::new() } else { self.take_hint(&challenge).into_iter().collect() };

        AssessmentResult {
            correct,
            score,
            feedback: feedback(correct, score).to_string(),
            hints,
            explanation,
            recorded,
            mastered,
        }
    }

    /// Attempts for the module, most recent first.
    pub fn challenge_history(&self, store: &ProgressStore, module_id: &str) -> Vec<ChallengeAttempt> {
        let mut history = store
            .module(module_id)
            .map(|p| p.challenge_attempts.clone())
            .unwrap_or_default();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history
    }

    pub fn is_challenge_completed(&self, store: &ProgressStore, module_id: &str) -> bool {
        store.module(module_id).is_some_and(|p| p.challenge_completed)
    }

    /// Score of the most recent attempt; 0 without attempts.
    pub fn performance_score(&self, store: &ProgressStore, module_id: &str) -> u32 {
        let Some(latest) = store.module(module_id).and_then(|p| p.challenge_attempts.last()) else {
            return 0;
        };
        if !latest.correct {
            return 0;
        }
        let t = latest.time_spent_seconds;
        let penalty = match t {
            t if t > SLOW_SECONDS => 20,
            t if t > FAST_SECONDS => 10,
            _ => 0,
        };
        let bonus = if t < FAST_SECONDS && latest.hints_used == 0 { 10 } else { 0 };
        let raw = 100i64 - i64::from(latest.hints_used) * i64::from(HINT_PENALTY) - penalty + bonus;
        raw.clamp(0, 100) as u32
    }

    /// Over the last three attempts: more than half failed, more than two
    /// hints on average, or slower than five minutes on average.
    pub fn should_suggest_review(&self, store: &ProgressStore, module_id: &str) -> bool {
        store.module(module_id).is_some_and(needs_review)
    }

    /// Whole percent of correct attempts.
    pub fn success_rate(&self, store: &ProgressStore, module_id: &str) -> u32 {
        let Some(p) = store.module(module_id).filter(|p| !p.challenge_attempts.is_empty()) else {
            return 0;
        };
        let ok = p.challenge_attempts.iter().filter(|a| a.correct).count();
        (ok as f64 * 100.0 / p.challenge_attempts.len() as f64).round() as u32
    }

    /// Mean seconds per attempt, rounded.
    pub fn average_time(&self, store: &ProgressStore, module_id: &str) -> u32 {
        let Some(p) = store.module(module_id).filter(|p| !p.challenge_attempts.is_empty()) else {
            return 0;
        };
        let total: f64 = p.challenge_attempts.iter().map(|a| f64::from(a.time_spent_seconds)).sum();
        (total / p.challenge_attempts.len() as f64).round() as u32
    }

    pub fn performance_analysis(&self, store: &ProgressStore, module_id: &str) -> PerformanceAnalysis {
        let history = self.challenge_history(store, module_id);
        let success_rate = self.success_rate(store, module_id);
        let average_time_seconds = self.average_time(store, module_id);
        let latest_hints = history.first().map(|a| a.hints_used);

        let mut strengths = Vec::new();
        if success_rate >= 80 {
            strengths.push("High success rate on challenges");
        }
        if !history.is_empty() && average_time_seconds < FAST_SECONDS {
            strengths.push("Quick problem-solving ability");
        }
        if latest_hints == Some(0) {
            strengths.push("Independent problem solving");
        }

        let mut improvements = Vec::new();
        if success_rate < 60 {
            improvements.push("Review core concepts and theory");
        }
        if average_time_seconds > SLOW_SECONDS {
            improvements.push("Practice to improve speed");
        }
        if latest_hints.is_some_and(|h| h > 2) {
            improvements.push("Strengthen understanding to reduce hint dependency");
        }

        PerformanceAnalysis {
            score: self.performance_score(store, module_id),
            success_rate,
            average_time_seconds,
            total_attempts: history.len(),
            needs_review: self.should_suggest_review(store, module_id),
            strengths,
            improvements,
        }
    }
}

/// Weak recent performance, shared with the recommendation chain.
pub fn needs_review(progress: &crate::models::ModuleProgress) -> bool {
    let recent: Vec<&ChallengeAttempt> = progress.recent_attempts(3).collect();
    if recent.is_empty() {
        return false;
    }
    let n = recent.len() as f64;
    let failure_rate = recent.iter().filter(|a| !a.correct).count() as f64 / n;
    let avg_hints = recent.iter().map(|a| f64::from(a.hints_used)).sum::<f64>() / n;
    let avg_time = recent.iter().map(|a| f64::from(a.time_spent_seconds)).sum::<f64>() / n;
    failure_rate > 0.5 || avg_hints > 2.0 || avg_time > f64::from(SLOW_SECONDS)
}
