//! Achievement catalog and certificates.
//!
//! The catalog is a table of named predicates over a read-only view of the
//! learner's progress. Awarding goes through the progress store, which
//! creates each record at most once, so evaluation order never matters.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::curriculum::Curriculum;
use crate::error::NotFound;
use crate::models::{Certificate, CertificateType, StudentState, Tier, WorkflowStep};
use crate::progress::{current_streak, longest_streak, ProgressStore};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AchievementCategory {
    Milestone,
    Streak,
    Mastery,
    Challenge,
}

/// Read-only view the predicates are evaluated against.
pub struct Facts<'a> {
    pub curriculum: &'a Curriculum,
    pub state: &'a StudentState,
    pub now: DateTime<Utc>,
    pub today: NaiveDate,
    pub local_hour: u32,
}

impl<'a> Facts<'a> {
    pub fn of(store: &'a ProgressStore) -> Self {
        let clock = store.clock();
        Self {
            curriculum: store.curriculum(),
            state: store.state(),
            now: clock.now(),
            today: clock.today(),
            local_hour: clock.local_hour(),
        }
    }

    fn completed_modules(&self) -> usize {
        self.state.module_progress.values().filter(|p| p.status.is_done()).count()
    }

    fn tier_counts(&self, tier: Tier) -> (usize, usize) {
        self.curriculum.modules_in(tier).fold((0, 0), |(done, total), m| {
            (done + usize::from(self.state.status(&m.id).is_done()), total + 1)
        })
    }

    /// An empty tier is never complete.
    pub fn tier_complete(&self, tier: Tier) -> bool {
        let (done, total) = self.tier_counts(tier);
        total > 0 && done == total
    }

    fn all_counts(&self) -> (usize, usize) {
        let done = self
            .curriculum
            .modules()
            .iter()
            .filter(|m| self.state.status(&m.id).is_done())
            .count();
        (done, self.curriculum.len())
    }

    fn current_streak(&self) -> usize {
        current_streak(&self.state.daily_activity, self.today) as usize
    }

    fn challenges_completed(&self) -> usize {
        self.state.module_progress.values().filter(|p| p.challenge_completed).count()
    }

    /// Modules whose first attempt was correct without hints.
    fn perfect_first_attempts(&self) -> usize {
        self.state
            .module_progress
            .values()
            .filter_map(|p| p.challenge_attempts.first())
            .filter(|a| a.correct && a.hints_used == 0)
            .count()
    }

    fn modules_with_step(&self, step: WorkflowStep) -> usize {
        self.curriculum
            .modules()
            .iter()
            .filter(|m| {
                self.state
                    .module_progress
                    .get(&m.id)
                    .is_some_and(|p| p.is_step_complete(step))
            })
            .count()
    }

    fn days_since_last_access(&self) -> i64 {
        (self.now - self.state.last_access_at).num_days()
    }
}

type Predicate = fn(&Facts<'_>) -> bool;
type Measure = fn(&Facts<'_>) -> (usize, usize);

pub struct AchievementDef {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub points: u32,
    pub category: AchievementCategory,
    condition: Predicate,
    progress: Option<Measure>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Achievement {
    pub id: String,
    pub title: String,
    pub description: String,
    pub points: u32,
    pub category: AchievementCategory,
    pub earned_at: Option<DateTime<Utc>>,
}

impl AchievementDef {
    fn view(&self, earned_at: Option<DateTime<Utc>>) -> Achievement {
        Achievement {
            id: self.id.to_string(),
            title: self.title.to_string(),
            description: self.description.to_string(),
            points: self.points,
            category: self.category,
            earned_at,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LearningStats {
    pub completed_modules: usize,
    pub completed_steps: usize,
    pub completed_challenges: usize,
    pub current_streak: u32,
    pub longest_streak: u32,
    /// Minutes.
    pub total_time_spent: u32,
    /// Mean minutes over completed modules with any recorded time.
    pub average_completion_time: u32,
}

pub struct AchievementEngine {
    catalog: Vec<AchievementDef>,
}

impl Default for AchievementEngine {
    fn default() -> Self {
        Self::new(builtin_catalog())
    }
}

impl AchievementEngine {
    pub fn new(catalog: Vec<AchievementDef>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &[AchievementDef] {
        &self.catalog
    }

    fn def(&self, id: &str) -> Result<&AchievementDef, NotFound> {
        self.catalog
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| NotFound::new(format!("no achievement with id {id}")))
    }

    /// Awards every catalog entry whose condition now holds and that the
    /// learner does not have yet. Returns only the new awards.
    pub fn check_for_new(&self, store: &mut ProgressStore) -> Vec<Achievement> {
        let due: Vec<&AchievementDef> = {
            let facts = Facts::of(store);
            self.catalog
                .iter()
                .filter(|d| !facts.state.achievements.contains_key(d.id))
                .filter(|d| (d.condition)(&facts))
                .collect()
        };

        let mut awarded = Vec::with_capacity(due.len());
        for def in due {
            if store.record_achievement(def.id, def.points) {
                info!(student = %store.state().student_id, achievement = def.id, points = def.points, "achievement earned");
                let earned_at = store.state().achievements.get(def.id).map(|r| r.earned_at);
                awarded.push(def.view(earned_at));
            }
        }
        awarded
    }

    pub fn total_points(&self, store: &ProgressStore) -> u32 {
        store.state().achievements.values().map(|r| r.points).sum()
    }

    pub fn total_possible_points(&self) -> u32 {
        self.catalog.iter().map(|d| d.points).sum()
    }

    /// Share of the catalog already earned, whole percent.
    pub fn earned_percentage(&self, store: &ProgressStore) -> u32 {
        if self.catalog.is_empty() {
            return 0;
        }
        let earned = self.earned(store).len();
        (earned as f64 * 100.0 / self.catalog.len() as f64).round() as u32
    }

    /// Most recent first.
    pub fn earned(&self, store: &ProgressStore) -> Vec<Achievement> {
        let records = &store.state().achievements;
        let mut earned: Vec<Achievement> = self
            .catalog
            .iter()
            .filter_map(|d| records.get(d.id).map(|r| d.view(Some(r.earned_at))))
            .collect();
        earned.sort_by(|a, b| b.earned_at.cmp(&a.earned_at));
        earned
    }

    pub fn locked(&self, store: &ProgressStore) -> Vec<Achievement> {
        let records = &store.state().achievements;
        self.catalog
            .iter()
            .filter(|d| !records.contains_key(d.id))
            .map(|d| d.view(None))
            .collect()
    }

    /// 100 once earned; otherwise the measured share for countable
    /// achievements and 0 for the rest.
    pub fn achievement_progress(&self, store: &ProgressStore, id: &str) -> Result<u32, NotFound> {
        let def = self.def(id)?;
        if store.state().achievements.contains_key(id) {
            return Ok(100);
        }
        let Some(measure) = def.progress else {
            return Ok(0);
        };
        let (current, target) = measure(&Facts::of(store));
        if target == 0 {
            return Ok(0);
        }
        Ok(((current as f64 * 100.0 / target as f64).round() as u32).min(100))
    }

    pub fn is_eligible_for_certificate(&self, store: &ProgressStore, kind: CertificateType) -> bool {
        let facts = Facts::of(store);
        kind.required_tiers().iter().all(|t| facts.tier_complete(*t))
    }

    /// Always issues a new certificate. Eligibility is the caller's check.
    pub fn generate_certificate(
        &self,
        store: &mut ProgressStore,
        kind: CertificateType,
        student_name: &str,
    ) -> Certificate {
        let issued_at = store.clock().now();
        let id = Uuid::new_v4();
        let serial_number = format!(
            "ML-{}-{}",
            issued_at.timestamp_millis(),
            id.simple().to_string()[..8].to_uppercase()
        );
        let student_name = match student_name.trim() {
            "" => "Student".to_string(),
            name => name.to_string(),
        };
        let certificate = Certificate {
            id,
            certificate_type: kind,
            student_name,
            issued_at,
            download_ref: format!("/api/certificates/{serial_number}/download"),
            share_ref: format!("/certificates/{serial_number}"),
            serial_number,
        };
        info!(student = %store.state().student_id, serial = %certificate.serial_number, "certificate issued");
        store.append_certificate(certificate.clone());
        certificate
    }

    /// Most recent first.
    pub fn certificates<'s>(&self, store: &'s ProgressStore) -> Vec<&'s Certificate> {
        let mut certs: Vec<&Certificate> = store.state().certificates.iter().collect();
        certs.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        certs
    }

    pub fn learning_stats(&self, store: &ProgressStore) -> LearningStats {
        let state = store.state();
        let done: Vec<_> = state.module_progress.values().filter(|p| p.status.is_done()).collect();
        let timed: Vec<u32> = done.iter().map(|p| p.time_spent_minutes).filter(|t| *t > 0).collect();
        let average_completion_time = if timed.is_empty() {
            0
        } else {
            (timed.iter().map(|t| f64::from(*t)).sum::<f64>() / timed.len() as f64).round() as u32
        };
        LearningStats {
            completed_modules: done.len(),
            completed_steps: store.overall_progress().completed_steps,
            completed_challenges: done.iter().filter(|p| p.challenge_completed).count(),
            current_streak: store.current_streak(),
            longest_streak: longest_streak(&state.daily_activity),
            total_time_spent: state.total_time_spent_minutes,
            average_completion_time,
        }
    }
}

/// The fifteen built-in achievements.
///
/// `early_bird` and `night_owl` look at the local hour when the catalog is
/// evaluated, not when the step was taken.
pub fn builtin_catalog() -> Vec<AchievementDef> {
    use AchievementCategory::*;

    vec![
        AchievementDef {
            id: "first_steps",
            title: "First Steps",
            description: "Complete your first module",
            points: 10,
            category: Milestone,
            condition: |f| f.completed_modules() >= 1,
            progress: Some(|f: &Facts<'_>| (f.completed_modules().min(1), 1)),
        },
        AchievementDef {
            id: "beginner_master",
            title: "Beginner Master",
            description: "Complete all Beginner modules",
            points: 50,
            category: Mastery,
            condition: |f| f.tier_complete(Tier::Beginner),
            progress: Some(|f: &Facts<'_>| f.tier_counts(Tier::Beginner)),
        },
        AchievementDef {
            id: "intermediate_expert",
            title: "Intermediate Expert",
            description: "Complete all Intermediate modules",
            points: 100,
            category: Mastery,
            condition: |f| f.tier_complete(Tier::Intermediate),
            progress: Some(|f: &Facts<'_>| f.tier_counts(Tier::Intermediate)),
        },
        AchievementDef {
            id: "advanced_guru",
            title: "Advanced Guru",
            description: "Complete all Advanced modules",
            points: 200,
            category: Mastery,
            condition: |f| f.tier_complete(Tier::Advanced),
            progress: Some(|f: &Facts<'_>| f.tier_counts(Tier::Advanced)),
        },
        AchievementDef {
            id: "ml_master",
            title: "ML Master",
            description: "Complete every module",
            points: 500,
            category: Mastery,
            condition: |f| Tier::ALL.iter().all(|t| f.tier_complete(*t)),
            progress: Some(|f: &Facts<'_>| f.all_counts()),
        },
        AchievementDef {
            id: "week_streak",
            title: "Week Warrior",
            description: "Learn for 7 consecutive days",
            points: 30,
            category: Streak,
            condition: |f| f.current_streak() >= 7,
            progress: Some(|f: &Facts<'_>| (f.current_streak(), 7)),
        },
        AchievementDef {
            id: "month_streak",
            title: "Month Marathon",
            description: "Learn for 30 consecutive days",
            points: 150,
            category: Streak,
            condition: |f| f.current_streak() >= 30,
            progress: Some(|f: &Facts<'_>| (f.current_streak(), 30)),
        },
        AchievementDef {
            id: "challenge_champion",
            title: "Challenge Champion",
            description: "Pass 10 practice challenges",
            points: 75,
            category: Challenge,
            condition: |f| f.challenges_completed() >= 10,
            progress: Some(|f: &Facts<'_>| (f.challenges_completed(), 10)),
        },
        AchievementDef {
            id: "perfect_score",
            title: "Perfect Score",
            description: "Pass 5 challenges on the first try without hints",
            points: 100,
            category: Challenge,
            condition: |f| f.perfect_first_attempts() >= 5,
            progress: Some(|f: &Facts<'_>| (f.perfect_first_attempts(), 5)),
        },
        AchievementDef {
            id: "speed_learner",
            title: "Speed Learner",
            description: "Complete a module in under 2 hours",
            points: 50,
            category: Milestone,
            condition: |f| {
                f.state.module_progress.values().any(|p| {
                    p.status.is_done() && p.time_spent_minutes > 0 && p.time_spent_minutes < 120
                })
            },
            progress: None,
        },
        AchievementDef {
            id: "theory_master",
            title: "Theory Master",
            description: "Complete the mathematics step of every module",
            points: 80,
            category: Milestone,
            condition: |f| f.modules_with_step(WorkflowStep::Mathematics) == f.curriculum.len(),
            progress: Some(|f: &Facts<'_>| (f.modules_with_step(WorkflowStep::Mathematics), f.curriculum.len())),
        },
        AchievementDef {
            id: "data_scientist",
            title: "Data Scientist",
            description: "Complete the visualization step of 5 modules",
            points: 60,
            category: Milestone,
            condition: |f| f.modules_with_step(WorkflowStep::Visualization) >= 5,
            progress: Some(|f: &Facts<'_>| (f.modules_with_step(WorkflowStep::Visualization), 5)),
        },
        AchievementDef {
            id: "early_bird",
            title: "Early Bird",
            description: "Learn before 8 AM",
            points: 20,
            category: Milestone,
            condition: |f| f.local_hour < 8,
            progress: None,
        },
        AchievementDef {
            id: "night_owl",
            title: "Night Owl",
            description: "Learn after 10 PM",
            points: 20,
            category: Milestone,
            condition: |f| f.local_hour >= 22,
            progress: None,
        },
        AchievementDef {
            id: "comeback_kid",
            title: "Comeback Kid",
            description: "Return to learning after a 7-day break",
            points: 25,
            category: Milestone,
            condition: |f| f.days_since_last_access() >= 7,
            progress: None,
        },
    ]
}
