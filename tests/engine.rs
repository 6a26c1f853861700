use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use learnpath_runtime::curriculum::{ChallengeDifficulty, ChallengeKind};
use learnpath_runtime::models::{CertificateType, MasteryStatus, Tier, WorkflowStep};
use learnpath_runtime::persistence::{LocalStore, MemoryStore, PersistenceConfig};
use learnpath_runtime::{Challenge, Curriculum, LearningPath, ManualClock, Module, NotEligible};

fn noon() -> DateTime<Utc> {
    "2024-03-01T12:00:00Z".parse().unwrap()
}

fn two_modules() -> Arc<Curriculum> {
    let m = |id: &str, prereqs: &[&str]| Module {
        id: id.into(),
        name: id.to_uppercase(),
        tier: Tier::Beginner,
        prerequisites: prereqs.iter().map(|p| p.to_string()).collect(),
        estimated_minutes: 60,
    };
    let challenge = Challenge {
        id: "m1_check".into(),
        module_id: "m1".into(),
        kind: ChallengeKind::MultipleChoice,
        question: "Which loss does linear regression minimise?".into(),
        options: vec!["MSE".into(), "Hinge".into()],
        correct_answer: "MSE".into(),
        hint: Some("Think squared residuals.".into()),
        explanation: "Ordinary least squares minimises squared error.".into(),
        difficulty: ChallengeDifficulty::Easy,
    };
    Arc::new(Curriculum::new(vec![m("m1", &[]), m("m2", &["m1"])], vec![challenge]).unwrap())
}

fn open(local: Arc<MemoryStore>, clock: &ManualClock) -> LearningPath {
    LearningPath::open(
        "learner-1",
        two_modules(),
        local,
        None,
        PersistenceConfig::default(),
        Arc::new(clock.clone()),
    )
}

fn complete_module(path: &mut LearningPath, module_id: &str) {
    for step in WorkflowStep::ALL {
        path.complete_step(module_id, step).unwrap();
    }
}

#[test]
fn completing_a_module_unlocks_dependents_and_awards_once() {
    let clock = ManualClock::new(noon());
    let unlocked = Arc::new(Mutex::new(Vec::<String>::new()));
    let awarded = Arc::new(Mutex::new(Vec::<String>::new()));
    let mut path = open(Arc::new(MemoryStore::new()), &clock)
        .on_unlock({
            let unlocked = unlocked.clone();
            move |ids| unlocked.lock().unwrap().extend(ids.iter().cloned())
        })
        .on_achievement({
            let awarded = awarded.clone();
            move |earned| awarded.lock().unwrap().extend(earned.iter().map(|a| a.id.clone()))
        });

    assert!(path.prerequisites().is_locked("m2"));

    for step in &WorkflowStep::ALL[..3] {
        let outcome = path.complete_step("m1", *step).unwrap();
        assert!(outcome.newly_unlocked.is_empty());
    }
    assert_eq!(path.store().completion_percentage("m1"), 50.0);
    assert_eq!(path.store().status("m1"), MasteryStatus::InProgress);

    let mut last = None;
    for step in &WorkflowStep::ALL[3..] {
        last = Some(path.complete_step("m1", *step).unwrap());
    }
    let outcome = last.unwrap();
    assert_eq!(outcome.newly_unlocked, vec!["m2".to_string()]);
    assert!(outcome.achievements.iter().any(|a| a.id == "first_steps" && a.points == 10));
    assert_eq!(path.store().status("m1"), MasteryStatus::Completed);
    assert!(path.prerequisites().prerequisites_met("m2"));

    // repeats change nothing and award nothing
    let again = path.complete_step("m1", WorkflowStep::Practice).unwrap();
    assert!(!again.change.step_added);
    assert!(again.newly_unlocked.is_empty() && again.achievements.is_empty());
    assert!(path.resume().is_empty());

    assert_eq!(*unlocked.lock().unwrap(), vec!["m2".to_string()]);
    assert_eq!(awarded.lock().unwrap().iter().filter(|id| *id == "first_steps").count(), 1);
    assert_eq!(path.achievements().total_points(path.store()), 10);
}

#[test]
fn unknown_module_is_rejected_without_mutation() {
    let clock = ManualClock::new(noon());
    let mut path = open(Arc::new(MemoryStore::new()), &clock);

    assert!(path.complete_step("nope", WorkflowStep::Introduction).is_err());
    assert!(path.add_time_spent("nope", 5).is_err());
    assert!(path.store().state().module_progress.is_empty());
}

#[test]
fn correct_answer_on_completed_module_masters_it() {
    let clock = ManualClock::new(noon());
    let mut path = open(Arc::new(MemoryStore::new()), &clock);

    // no progress record yet: scored but not recorded
    let early = path.submit_challenge("m1_check", "mse", 30);
    assert!(early.result.correct && !early.result.recorded);

    complete_module(&mut path, "m1");
    path.challenge_for("m1").unwrap();

    let wrong = path.submit_challenge("m1_check", "hinge", 400);
    assert!(!wrong.result.correct);
    assert_eq!(wrong.result.hints, vec!["Think squared residuals.".to_string()]);
    assert!(wrong.result.explanation.starts_with("The correct answer is \"MSE\""));
    assert_eq!(path.store().status("m1"), MasteryStatus::Completed);

    let right = path.submit_challenge("m1_check", "  mse ", 45);
    assert!(right.result.correct && right.result.mastered);
    assert_eq!(path.store().status("m1"), MasteryStatus::Mastered);
    assert!(path.assessment().is_challenge_completed(path.store(), "m1"));
    assert_eq!(path.assessment().challenge_history(path.store(), "m1").len(), 2);

    let missing = path.submit_challenge("ghost", "x", 1);
    assert_eq!(missing.result.feedback, "Challenge not found");
    assert!(!missing.result.recorded);
}

#[test]
fn certificate_requires_complete_tier() {
    let clock = ManualClock::new(noon());
    let mut path = open(Arc::new(MemoryStore::new()), &clock);

    complete_module(&mut path, "m1");
    assert_eq!(
        path.issue_certificate(CertificateType::BeginnerComplete, "Ada"),
        Err(NotEligible { certificate_type: CertificateType::BeginnerComplete })
    );

    complete_module(&mut path, "m2");
    let cert = path.issue_certificate(CertificateType::BeginnerComplete, "").unwrap();
    assert_eq!(cert.student_name, "Student");
    assert!(cert.serial_number.starts_with("ML-"));
    assert_eq!(cert.download_ref, format!("/api/certificates/{}/download", cert.serial_number));
    // no intermediate modules exist, so that tier can never be certified
    assert!(!path.is_eligible_for_certificate(CertificateType::IntermediateComplete));
    assert_eq!(path.store().state().certificates.len(), 1);
}

#[test]
fn progress_survives_reopen_and_reset_clears_it() {
    let clock = ManualClock::new(noon());
    let local = Arc::new(MemoryStore::new());

    {
        let mut path = open(local.clone(), &clock);
        complete_module(&mut path, "m1");
        path.add_time_spent("m1", 25).unwrap();
    }

    clock.advance(Duration::days(1));
    let mut path = open(local.clone(), &clock);
    assert_eq!(path.store().status("m1"), MasteryStatus::Completed);
    assert_eq!(path.store().state().total_time_spent_minutes, 25);
    assert!(path.store().state().achievements.contains_key("first_steps"));

    path.complete_step("m2", WorkflowStep::Introduction).unwrap();
    assert_eq!(path.store().current_streak(), 2);

    path.reset();
    assert!(path.store().state().module_progress.is_empty());
    assert!(local.read("ml_learning_path_progress").unwrap().is_none());
}

#[test]
fn returning_after_a_week_earns_comeback() {
    let clock = ManualClock::new(noon());
    let local = Arc::new(MemoryStore::new());
    open(local.clone(), &clock).complete_step("m1", WorkflowStep::Introduction).unwrap();

    clock.advance(Duration::days(8));
    let mut path = open(local, &clock);
    let earned = path.resume();
    assert!(earned.iter().any(|a| a.id == "comeback_kid"));
}
