//! Unlock queries over the curriculum graph and one learner's progress.
//!
//! Everything here is a pure read. Callers decide what to do with a newly
//! unlocked module (notify, log); this module never mutates progress.

use serde::Serialize;

use crate::curriculum::{Curriculum, Module, PrerequisiteEdge};
use crate::models::{MasteryStatus, StudentState, Tier};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NavigationResult {
    pub allowed: bool,
    pub reason: Option<String>,
    /// Ids of unmet prerequisites, declaration order.
    pub missing: Vec<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    pub status: MasteryStatus,
    pub locked: bool,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DependencyGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<PrerequisiteEdge>,
}

#[derive(Clone, Copy)]
pub struct PrerequisiteEngine<'a> {
    curriculum: &'a Curriculum,
    state: &'a StudentState,
}

impl<'a> PrerequisiteEngine<'a> {
    pub fn new(curriculum: &'a Curriculum, state: &'a StudentState) -> Self {
        Self { curriculum, state }
    }

    fn done(&self, id: &str) -> bool {
        self.state.status(id).is_done()
    }

    /// True when every prerequisite is Completed or Mastered. Vacuously true
    /// for modules without prerequisites.
    pub fn prerequisites_met(&self, module_id: &str) -> bool {
        self.curriculum.prerequisites(module_id).iter().all(|p| self.done(p))
    }

    pub fn missing_prerequisites(&self, module_id: &str) -> Vec<&'a Module> {
        self.curriculum
            .prerequisites(module_id)
            .iter()
            .filter(|p| !self.done(p))
            .filter_map(|p| self.curriculum.module(p))
            .collect()
    }

    /// Dependents of `just_completed` that are still NotStarted and whose
    /// prerequisites are now all met. Call once per completion event.
    pub fn check_for_newly_unlocked(&self, just_completed: &str) -> Vec<String> {
        self.curriculum
            .dependents(just_completed)
            .into_iter()
            .filter(|m| self.state.status(&m.id) == MasteryStatus::NotStarted)
            .filter(|m| self.prerequisites_met(&m.id))
            .map(|m| m.id.clone())
            .collect()
    }

    /// The lowest tier is always open. Any other tier opens once every
    /// module of the tier right below it is done.
    pub fn tier_unlocked(&self, tier: Tier) -> bool {
        match tier.previous() {
            None => true,
            Some(prev) => self.curriculum.modules_in(prev).all(|m| self.done(&m.id)),
        }
    }

    /// Highest tier that is unlocked.
    pub fn current_tier(&self) -> Tier {
        Tier::ALL
            .into_iter()
            .rev()
            .find(|t| self.tier_unlocked(*t))
            .unwrap_or(Tier::Beginner)
    }

    pub fn prerequisites(&self, module_id: &str) -> Vec<&'a Module> {
        self.curriculum
            .prerequisites(module_id)
            .iter()
            .filter_map(|p| self.curriculum.module(p))
            .collect()
    }

    pub fn dependents(&self, module_id: &str) -> Vec<&'a Module> {
        self.curriculum.dependents(module_id)
    }

    /// Transitive prerequisites, nearest first.
    pub fn prerequisite_chain(&self, module_id: &str) -> Vec<&'a Module> {
        self.curriculum
            .prerequisite_closure(module_id)
            .iter()
            .filter_map(|id| self.curriculum.module(id))
            .collect()
    }

    pub fn unlocked_modules(&self) -> Vec<&'a Module> {
        self.curriculum
            .modules()
            .iter()
            .filter(|m| self.prerequisites_met(&m.id))
            .collect()
    }

    pub fn is_locked(&self, module_id: &str) -> bool {
        !self.prerequisites_met(module_id)
    }

    pub fn locked_reason(&self, module_id: &str) -> Option<String> {
        let missing = self.missing_prerequisites(module_id);
        match missing.as_slice() {
            [] => None,
            [only] => Some(format!("Complete {} to unlock this module", only.name)),
            many => Some(format!(
                "Complete {} prerequisite modules to unlock this module",
                many.len()
            )),
        }
    }

    pub fn can_navigate(&self, module_id: &str) -> NavigationResult {
        if !self.curriculum.contains(module_id) {
            return NavigationResult {
                allowed: false,
                reason: Some(format!("no module with id {module_id} in the curriculum")),
                missing: Vec::new(),
            };
        }
        let missing: Vec<String> =
            self.missing_prerequisites(module_id).iter().map(|m| m.id.clone()).collect();
        NavigationResult {
            allowed: missing.is_empty(),
            reason: self.locked_reason(module_id),
            missing,
        }
    }

    /// Whole percent of the tier's modules that are done. An empty tier is 0.
    pub fn tier_completion(&self, tier: Tier) -> f64 {
        let (done, total) = self
            .curriculum
            .modules_in(tier)
            .fold((0usize, 0usize), |(d, t), m| (d + usize::from(self.done(&m.id)), t + 1));
        if total == 0 {
            return 0.0;
        }
        (done as f64 * 100.0 / total as f64).round()
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        let nodes = self
            .curriculum
            .modules()
            .iter()
            .map(|m| GraphNode {
                id: m.id.clone(),
                name: m.name.clone(),
                tier: m.tier,
                status: self.state.status(&m.id),
                locked: self.is_locked(&m.id),
            })
            .collect();
        DependencyGraph { nodes, edges: self.curriculum.edges() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModuleProgress, WorkflowStep};
    use chrono::Utc;

    fn module(id: &str, tier: Tier, prereqs: &[&str]) -> Module {
        Module {
            id: id.into(),
            name: id.to_uppercase(),
            tier,
            prerequisites: prereqs.iter().map(|p| p.to_string()).collect(),
            estimated_minutes: 60,
        }
    }

    fn complete(state: &mut StudentState, id: &str) {
        let now = Utc::now();
        let mut p = ModuleProgress::new(id, now);
        for step in WorkflowStep::ALL {
            p.complete_step(step, now);
        }
        state.module_progress.insert(id.into(), p);
    }

    fn diamond() -> Curriculum {
        Curriculum::new(
            vec![
                module("a", Tier::Beginner, &[]),
                module("b", Tier::Beginner, &[]),
                module("c", Tier::Intermediate, &["a", "b"]),
                module("d", Tier::Advanced, &["c"]),
            ],
            vec![],
        )
        .unwrap()
    }

    #[test]
    fn roots_are_always_met() {
        let c = diamond();
        let state = StudentState::new("s", Utc::now());
        let engine = PrerequisiteEngine::new(&c, &state);
        assert!(engine.prerequisites_met("a"));
        assert!(engine.prerequisites_met("b"));
        assert!(!engine.prerequisites_met("c"));
        assert_eq!(engine.unlocked_modules().len(), 2);
    }

    #[test]
    fn unlock_fires_on_last_prerequisite() {
        let c = diamond();
        let mut state = StudentState::new("s", Utc::now());

        complete(&mut state, "a");
        let engine = PrerequisiteEngine::new(&c, &state);
        assert!(engine.check_for_newly_unlocked("a").is_empty());
        assert_eq!(engine.locked_reason("c").as_deref(), Some("Complete B to unlock this module"));

        complete(&mut state, "b");
        let engine = PrerequisiteEngine::new(&c, &state);
        assert_eq!(engine.check_for_newly_unlocked("b"), vec!["c".to_string()]);
        assert!(engine.locked_reason("c").is_none());
    }

    #[test]
    fn started_dependents_are_not_reported() {
        let c = diamond();
        let mut state = StudentState::new("s", Utc::now());
        complete(&mut state, "a");
        let mut started = ModuleProgress::new("c", Utc::now());
        started.complete_step(WorkflowStep::Introduction, Utc::now());
        state.module_progress.insert("c".into(), started);
        complete(&mut state, "b");

        let engine = PrerequisiteEngine::new(&c, &state);
        assert!(engine.check_for_newly_unlocked("b").is_empty());
    }

    #[test]
    fn missing_keeps_declaration_order() {
        let c = diamond();
        let state = StudentState::new("s", Utc::now());
        let engine = PrerequisiteEngine::new(&c, &state);
        let ids: Vec<_> = engine.missing_prerequisites("c").iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(
            engine.locked_reason("c").as_deref(),
            Some("Complete 2 prerequisite modules to unlock this module")
        );

        let nav = engine.can_navigate("c");
        assert!(!nav.allowed);
        assert_eq!(nav.missing, vec!["a", "b"]);
        assert!(!engine.can_navigate("ghost").allowed);
    }

    #[test]
    fn tiers_open_in_order() {
        let c = diamond();
        let mut state = StudentState::new("s", Utc::now());
        {
            let engine = PrerequisiteEngine::new(&c, &state);
            assert!(engine.tier_unlocked(Tier::Beginner));
            assert!(!engine.tier_unlocked(Tier::Intermediate));
            assert_eq!(engine.current_tier(), Tier::Beginner);
        }
        complete(&mut state, "a");
        assert_eq!(PrerequisiteEngine::new(&c, &state).tier_completion(Tier::Beginner), 50.0);
        complete(&mut state, "b");
        let engine = PrerequisiteEngine::new(&c, &state);
        assert!(engine.tier_unlocked(Tier::Intermediate));
        assert!(!engine.tier_unlocked(Tier::Advanced));
        assert_eq!(engine.current_tier(), Tier::Intermediate);
        assert_eq!(engine.tier_completion(Tier::Beginner), 100.0);
    }

    #[test]
    fn chain_and_graph() {
        let c = diamond();
        let state = StudentState::new("s", Utc::now());
        let engine = PrerequisiteEngine::new(&c, &state);
        let mut chain: Vec<_> = engine.prerequisite_chain("d").iter().map(|m| m.id.clone()).collect();
        chain.sort();
        assert_eq!(chain, ["a", "b", "c"]);

        let graph = engine.dependency_graph();
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.edges.len(), 3);
        assert!(graph.nodes.iter().find(|n| n.id == "d").unwrap().locked);
    }
}
