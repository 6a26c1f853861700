//! Curriculum graph: the immutable module and challenge tables.
//!
//! The prerequisite relation is an adjacency map of id -> ids. It is
//! validated once at construction (dangling ids, duplicates, cycles), so
//! every later traversal can assume a finite DAG.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{CurriculumError, NotFound};
use crate::models::Tier;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Module {
    pub id: String,
    pub name: String,
    pub tier: Tier,
    /// Declaration order is kept; duplicates are dropped at load.
    #[serde(default)]
    pub prerequisites: Vec<String>,
    /// Expected minutes to work through all steps.
    #[serde(default = "default_estimated_minutes")]
    pub estimated_minutes: u32,
}

fn default_estimated_minutes() -> u32 { 120 }

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    MultipleChoice,
    Code,
    ParameterTuning,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeDifficulty {
    Easy,
    Medium,
    Hard,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Challenge {
    pub id: String,
    pub module_id: String,
    pub kind: ChallengeKind,
    pub question: String,
    #[serde(default)]
    pub options: Vec<String>,
    pub correct_answer: String,
    #[serde(default)]
    pub hint: Option<String>,
    #[serde(default)]
    pub explanation: String,
    pub difficulty: ChallengeDifficulty,
}

/// Edge `from` (prerequisite) -> `to` (dependent).
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PrerequisiteEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct Curriculum {
    modules: Vec<Module>,
    index: HashMap<String, usize>,
    challenges: Vec<Challenge>,
    challenge_index: HashMap<String, usize>,
}

impl Curriculum {
    pub fn new(modules: Vec<Module>, challenges: Vec<Challenge>) -> Result<Self, CurriculumError> {
        if modules.is_empty() {
            return Err(CurriculumError::Empty);
        }

        let mut index = HashMap::with_capacity(modules.len());
        let mut modules = modules;
        for (i, m) in modules.iter_mut().enumerate() {
            if index.insert(m.id.clone(), i).is_some() {
                return Err(CurriculumError::DuplicateModule(m.id.clone()));
            }
            let mut seen = HashSet::new();
            m.prerequisites.retain(|p| seen.insert(p.clone()));
        }

        for m in &modules {
            if let Some(missing) = m.prerequisites.iter().find(|p| !index.contains_key(*p)) {
                return Err(CurriculumError::DanglingPrerequisite {
                    module: m.id.clone(),
                    prerequisite: missing.clone(),
                });
            }
        }

        let mut challenge_index = HashMap::with_capacity(challenges.len());
        for (i, c) in challenges.iter().enumerate() {
            if !index.contains_key(&c.module_id) {
                return Err(CurriculumError::DanglingChallenge {
                    challenge: c.id.clone(),
                    module: c.module_id.clone(),
                });
            }
            challenge_index.insert(c.id.clone(), i);
        }

        let curriculum = Self { modules, index, challenges, challenge_index };
        curriculum.validate_acyclic()?;
        Ok(curriculum)
    }

    /// Walks the transitive closure from every module; a module found in
    /// its own closure is a cycle.
    fn validate_acyclic(&self) -> Result<(), CurriculumError> {
        for m in &self.modules {
            if self.prerequisite_closure(&m.id).iter().any(|id| id == &m.id) {
                return Err(CurriculumError::Cycle(m.id.clone()));
            }
        }
        Ok(())
    }

    /// All transitive prerequisites of `id`, nearest first. Guarded by a
    /// visited set so it terminates even on a cyclic graph.
    pub fn prerequisite_closure(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut visited: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![id];

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            for prereq in self.prerequisites(current) {
                if !chain.contains(prereq) {
                    chain.push(prereq.clone());
                }
                stack.push(prereq);
            }
        }
        chain
    }

    pub fn module(&self, id: &str) -> Option<&Module> {
        self.index.get(id).map(|&i| &self.modules[i])
    }

    pub fn lookup(&self, id: &str) -> Result<&Module, NotFound> {
        self.module(id)
            .ok_or_else(|| NotFound::new(format!("no module with id {id} in the curriculum")))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Modules in declaration order.
    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn modules_in(&self, tier: Tier) -> impl Iterator<Item = &Module> {
        self.modules.iter().filter(move |m| m.tier == tier)
    }

    /// Lowest tier that has at least one module.
    pub fn lowest_tier(&self) -> Tier {
        Tier::ALL
            .into_iter()
            .find(|t| self.modules_in(*t).next().is_some())
            .unwrap_or(Tier::Beginner)
    }

    /// First module of the lowest populated tier: the default starting point.
    pub fn entry_module(&self) -> &Module {
        self.modules_in(self.lowest_tier()).next().unwrap_or(&self.modules[0])
    }

    /// Declared prerequisites; empty for unknown ids.
    pub fn prerequisites(&self, id: &str) -> &[String] {
        self.module(id).map(|m| m.prerequisites.as_slice()).unwrap_or(&[])
    }

    /// Modules that list `id` as a direct prerequisite.
    pub fn dependents(&self, id: &str) -> Vec<&Module> {
        self.modules
            .iter()
            .filter(|m| m.prerequisites.iter().any(|p| p == id))
            .collect()
    }

    pub fn edges(&self) -> Vec<PrerequisiteEdge> {
        self.modules
            .iter()
            .flat_map(|m| {
                m.prerequisites.iter().map(move |p| PrerequisiteEdge {
                    from: p.clone(),
                    to: m.id.clone(),
                })
            })
            .collect()
    }

    pub fn challenges(&self) -> &[Challenge] {
        &self.challenges
    }

    pub fn challenge(&self, challenge_id: &str) -> Result<&Challenge, NotFound> {
        self.challenge_index
            .get(challenge_id)
            .map(|&i| &self.challenges[i])
            .ok_or_else(|| NotFound::new(format!("no challenge with id {challenge_id}")))
    }

    pub fn challenge_for_module(&self, module_id: &str) -> Result<&Challenge, NotFound> {
        if !self.contains(module_id) {
            return Err(NotFound::new(format!("no module with id {module_id} in the curriculum")));
        }
        self.challenges
            .iter()
            .find(|c| c.module_id == module_id)
            .ok_or_else(|| NotFound::new(format!("module {module_id} has no challenge")))
    }

    /// The eleven-module machine learning track.
    pub fn builtin() -> Self {
        const BEGINNER: [&str; 5] =
            ["linear_regression", "logistic_regression", "knn", "kmeans", "naive_bayes"];
        const CORE: [&str; 2] = ["decision_tree", "svm"];

        let module = |id: &str, name: &str, tier: Tier, prereqs: &[&str], minutes: u32| Module {
            id: id.into(),
            name: name.into(),
            tier,
            prerequisites: prereqs.iter().map(|p| p.to_string()).collect(),
            estimated_minutes: minutes,
        };

        let modules = vec![
            module("linear_regression", "Linear Regression", Tier::Beginner, &[], 140),
            module("logistic_regression", "Logistic Regression", Tier::Beginner, &[], 140),
            module("knn", "k-Nearest Neighbors", Tier::Beginner, &[], 120),
            module("kmeans", "K-Means Clustering", Tier::Beginner, &[], 120),
            module("naive_bayes", "Naive Bayes Classifier", Tier::Beginner, &[], 130),
            module("decision_tree", "Decision Tree", Tier::Intermediate, &BEGINNER, 150),
            module("svm", "Support Vector Machine", Tier::Advanced, &BEGINNER, 180),
            module("ann", "Artificial Neural Network", Tier::Intermediate, &CORE, 200),
            module("cnn", "Convolutional Neural Network", Tier::Advanced, &CORE, 220),
            module("rnn", "Recurrent Neural Network", Tier::Advanced, &CORE, 220),
            module("transformer", "Transformer Network", Tier::Advanced, &CORE, 240),
        ];

        let challenge = |module_id: &str,
                         question: &str,
                         options: &[&str],
                         answer: &str,
                         hint: &str,
                         explanation: &str,
                         difficulty: ChallengeDifficulty| Challenge {
            id: format!("{module_id}_challenge"),
            module_id: module_id.into(),
            kind: ChallengeKind::MultipleChoice,
            question: question.into(),
            options: options.iter().map(|o| o.to_string()).collect(),
            correct_answer: answer.into(),
            hint: Some(hint.into()),
            explanation: explanation.into(),
            difficulty,
        };

        use ChallengeDifficulty::*;
        let challenges = vec![
            challenge(
                "linear_regression",
                "Which loss does ordinary least squares minimize?",
                &["Mean Absolute Error", "Mean Squared Error (MSE)", "Cross-Entropy", "Hinge Loss"],
                "Mean Squared Error (MSE)",
                "Least squares: the average of squared residuals.",
                "Least squares minimizes the mean of squared differences between predictions and targets.",
                Easy,
            ),
            challenge(
                "logistic_regression",
                "Which function turns the linear score into a probability?",
                &["ReLU", "Sigmoid", "Tanh", "Softmax"],
                "Sigmoid",
                "It maps any real number into (0, 1).",
                "The sigmoid 1/(1+e^-z) maps any real score into (0, 1), which reads as a class probability.",
                Easy,
            ),
            challenge(
                "knn",
                "What happens to the decision boundary as K grows?",
                &[
                    "It becomes more complex and overfits",
                    "It becomes smoother and more generalized",
                    "It remains unchanged",
                ],
                "It becomes smoother and more generalized",
                "More neighbors means averaging over more points.",
                "Averaging over more neighbors damps the effect of single noisy points: more bias, less variance.",
                Medium,
            ),
            challenge(
                "kmeans",
                "What must be chosen before running K-Means?",
                &["The learning rate", "The number of clusters (K)", "The kernel"],
                "The number of clusters (K)",
                "It is in the name of the algorithm.",
                "K is fixed up front; heuristics such as the elbow method help pick it.",
                Easy,
            ),
            challenge(
                "naive_bayes",
                "What does Naive Bayes assume about features?",
                &[
                    "They are normally distributed",
                    "They are conditionally independent given the class",
                    "They are linearly related",
                ],
                "They are conditionally independent given the class",
                "P(x1, x2 | y) = P(x1 | y) P(x2 | y).",
                "Features are treated as independent given the class, which keeps the likelihood a simple product.",
                Medium,
            ),
            challenge(
                "decision_tree",
                "Which quantity is commonly used to score a split?",
                &["Cosine similarity", "Information gain", "Euclidean distance"],
                "Information gain",
                "It measures the reduction in entropy.",
                "Splits are chosen to maximize the drop in entropy, i.e. the information gain.",
                Medium,
            ),
            challenge(
                "svm",
                "What does a support vector machine optimize?",
                &["The number of support vectors", "The margin between classes", "The tree depth"],
                "The margin between classes",
                "Look at the distance from the boundary to the closest points.",
                "The maximum-margin hyperplane tends to generalize better than any other separating boundary.",
                Medium,
            ),
            challenge(
                "ann",
                "Which algorithm computes gradients for every layer?",
                &["Backpropagation", "Dropout", "Batch normalization"],
                "Backpropagation",
                "The chain rule applied from the output backwards.",
                "Backpropagation applies the chain rule layer by layer to get the gradient of the loss for every weight.",
                Medium,
            ),
            challenge(
                "cnn",
                "Why do convolutional layers need fewer parameters?",
                &["They skip the bias", "Weight sharing across positions", "They use no activations"],
                "Weight sharing across positions",
                "The same kernel slides over the whole input.",
                "One kernel is reused at every spatial position, so the parameter count does not grow with the input size.",
                Hard,
            ),
            challenge(
                "rnn",
                "Which training problem is typical for long sequences in plain RNNs?",
                &["Vanishing or exploding gradients", "Label leakage", "Dead kernels"],
                "Vanishing or exploding gradients",
                "Repeated multiplication through time.",
                "Gradients are multiplied through every time step and shrink or blow up over long sequences.",
                Hard,
            ),
            challenge(
                "transformer",
                "Which mechanism lets a transformer relate all positions at once?",
                &["Recurrence", "Self-attention", "Pooling"],
                "Self-attention",
                "Queries, keys and values.",
                "Self-attention scores every pair of positions in parallel, with no sequential bottleneck.",
                Hard,
            ),
        ];

        match Self::new(modules, challenges) {
            Ok(c) => c,
            Err(e) => unreachable!("built-in curriculum is valid: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn module(id: &str, tier: Tier, prereqs: &[&str]) -> Module {
        Module {
            id: id.into(),
            name: id.to_uppercase(),
            tier,
            prerequisites: prereqs.iter().map(|p| p.to_string()).collect(),
            estimated_minutes: 60,
        }
    }

    #[test]
    fn builtin_is_valid() {
        let c = Curriculum::builtin();
        assert_eq!(c.len(), 11);
        assert_eq!(c.modules_in(Tier::Beginner).count(), 5);
        assert_eq!(c.modules_in(Tier::Intermediate).count(), 2);
        assert_eq!(c.modules_in(Tier::Advanced).count(), 4);
        assert_eq!(c.challenges().len(), 11);
        assert!(c.challenge_for_module("svm").is_ok());
        assert_eq!(c.entry_module().id, "linear_regression");
    }

    #[test]
    fn rejects_cycles() {
        let err = Curriculum::new(
            vec![
                module("a", Tier::Beginner, &["c"]),
                module("b", Tier::Beginner, &["a"]),
                module("c", Tier::Beginner, &["b"]),
            ],
            vec![],
        )
        .unwrap_err();
        assert!(matches!(err, CurriculumError::Cycle(_)));
    }

    #[test]
    fn rejects_self_loop() {
        let err = Curriculum::new(vec![module("a", Tier::Beginner, &["a"])], vec![]).unwrap_err();
        assert_eq!(err, CurriculumError::Cycle("a".into()));
    }

    #[test]
    fn rejects_dangling_and_duplicate_ids() {
        let err = Curriculum::new(vec![module("a", Tier::Beginner, &["ghost"])], vec![]).unwrap_err();
        assert_eq!(
            err,
            CurriculumError::DanglingPrerequisite { module: "a".into(), prerequisite: "ghost".into() }
        );

        let err = Curriculum::new(
            vec![module("a", Tier::Beginner, &[]), module("a", Tier::Beginner, &[])],
            vec![],
        )
        .unwrap_err();
        assert_eq!(err, CurriculumError::DuplicateModule("a".into()));

        assert_eq!(Curriculum::new(vec![], vec![]).unwrap_err(), CurriculumError::Empty);
    }

    #[test]
    fn closure_follows_diamonds_once() {
        let c = Curriculum::new(
            vec![
                module("root", Tier::Beginner, &[]),
                module("left", Tier::Beginner, &["root"]),
                module("right", Tier::Beginner, &["root"]),
                module("top", Tier::Intermediate, &["left", "right", "left"]),
            ],
            vec![],
        )
        .unwrap();
        assert_eq!(c.prerequisites("top"), ["left".to_string(), "right".to_string()]);
        let mut chain = c.prerequisite_closure("top");
        chain.sort();
        assert_eq!(chain, vec!["left", "right", "root"]);
        assert_eq!(c.dependents("root").len(), 2);
        assert_eq!(c.edges().len(), 4);
    }

    #[test]
    fn missing_lookups_carry_a_reason() {
        let c = Curriculum::builtin();
        let err = c.challenge_for_module("nope").unwrap_err();
        assert!(err.reason.contains("nope"));
        assert!(c.challenge("nope_challenge").is_err());
    }
}
