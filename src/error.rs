use thiserror::Error;

/// Misconfigured curriculum. Fatal at startup: the graph must be fixed,
/// not worked around.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CurriculumError {
    #[error("curriculum has no modules")]
    Empty,
    #[error("module {0} is declared more than once")]
    DuplicateModule(String),
    #[error("invalid prerequisite {prerequisite} for {module}")]
    DanglingPrerequisite { module: String, prerequisite: String },
    #[error("circular dependency detected for {0}")]
    Cycle(String),
    #[error("challenge {challenge} refers to unknown module {module}")]
    DanglingChallenge { challenge: String, module: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("local store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to (de)serialize progress: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote sync failed: {0}")]
    Remote(String),
    #[error("remote sync request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A key missing from one of the static catalogs. Returned as a value so
/// callers can check optimistically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct NotFound {
    pub reason: String,
}

impl NotFound {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Certificate requested before its tiers are complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("not eligible for a {certificate_type:?} certificate yet")]
pub struct NotEligible {
    pub certificate_type: crate::models::CertificateType,
}
