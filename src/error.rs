use std::path::PathBuf;
use thiserror::Error;

/// Failures inside the sandbox executor.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("permission command rejected: {0}")]
    CommandRejected(String),
    #[error("permission command failed: {0}")]
    CommandFailed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the sandbox executor.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("token handshake failed: {0}")]
    Handshake(String),
    #[error("token file error: {0}")]
    TokenFile(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum LanguageError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid language file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("unknown template slot {{{slot}}} in `{template}`")]
    UnknownSlot { slot: String, template: String },
    #[error("unbalanced braces in `{0}`")]
    Malformed(String),
    #[error("language {language} has no branch {branch}")]
    MissingBranch { language: String, branch: String },
    #[error("duplicate language branch {0}")]
    Duplicate(String),
}

#[derive(Debug, Error)]
pub enum ProblemError {
    #[error("group {0} is used by a testcase but not declared")]
    UndeclaredGroup(String),
    #[error("group {group} depends on undeclared group {dependency}")]
    UnknownDependency { group: String, dependency: String },
    #[error("group dependencies form a cycle through {0}")]
    DependencyCycle(String),
    #[error("problem has no checker")]
    MissingChecker,
    #[error("interactive problem has no interactor")]
    MissingInteractor,
    #[error("runner source for {0} is missing")]
    MissingRunner(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt record {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("lock error: {0}")]
    Lock(String),
    #[error("store task failed: {0}")]
    Task(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Anything that aborts grading a submission. Surfaces as a judge error verdict.
#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("sandbox: {0}")]
    Client(#[from] ClientError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("problem: {0}")]
    Problem(#[from] ProblemError),
    #[error("language: {0}")]
    Language(#[from] LanguageError),
    #[error("unknown language {0}")]
    UnknownLanguage(String),
    #[error("checker: {0}")]
    Checker(String),
    #[error("sandbox filesystem: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejections at submission intake.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("too many pending submissions")]
    TooManyPending,
    #[error("source is larger than {0} KB")]
    TooLarge(u64),
    #[error("problem {0} does not exist")]
    UnknownProblem(String),
    #[error("language {0} does not exist")]
    UnknownLanguage(String),
    #[error("language {0} is not allowed for this problem")]
    LanguageNotAllowed(String),
    #[error("contest {0} does not exist")]
    UnknownContest(String),
    #[error("period {0} does not belong to the contest")]
    ForeignPeriod(u64),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}
