//! Submission intake: validation, persistence and enqueueing.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::error::{StoreError, SubmitError};
use crate::language::LanguageRegistry;
use crate::period::PretestPolicy;
use crate::queue::JudgeQueue;
use crate::store::{NewSubmission, Store};
use crate::submission::{Submission, TEST_PROBLEM};

/// Stem of every stored submission source.
pub const SOURCE_STEM: &str = "Main";

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub user: String,
    pub problem_id: String,
    pub language: String,
    pub code: String,
    #[serde(default)]
    pub contest_id: Option<String>,
    /// The contest period the user is taking part in, if any.
    #[serde(default)]
    pub period_id: Option<u64>,
    /// Input for a custom test run.
    #[serde(default)]
    pub stdin: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct IntakeLimits {
    pub pending_limit: usize,
    pub max_code_kb: u64,
}

#[derive(Clone)]
pub struct Intake {
    store: Arc<dyn Store>,
    queue: JudgeQueue,
    languages: Arc<LanguageRegistry>,
    limits: IntakeLimits,
}

impl Intake {
    pub fn new(
        store: Arc<dyn Store>,
        queue: JudgeQueue,
        languages: Arc<LanguageRegistry>,
        limits: IntakeLimits,
    ) -> Self {
        Self {
            store,
            queue,
            languages,
            limits,
        }
    }

    /// Validates, persists and enqueues a submission.
    pub fn submit(&self, req: SubmitRequest) -> Result<Submission, SubmitError> {
        let pending = self
            .store
            .submissions()?
            .iter()
            .filter(|s| s.user == req.user && !s.completed)
            .count();
        if pending >= self.limits.pending_limit {
            return Err(SubmitError::TooManyPending);
        }
        if req.code.len() as u64 > self.limits.max_code_kb * 1024 {
            return Err(SubmitError::TooLarge(self.limits.max_code_kb));
        }
        let custom = req.problem_id == TEST_PROBLEM;
        let problem = if custom {
            None
        } else {
            match self.store.load_problem(&req.problem_id) {
                Ok(problem) => Some(problem),
                Err(StoreError::NotFound { .. }) => {
                    return Err(SubmitError::UnknownProblem(req.problem_id));
                }
                Err(e) => return Err(e.into()),
            }
        };
        let lang = self
            .languages
            .get(&req.language)
            .ok_or_else(|| SubmitError::UnknownLanguage(req.language.clone()))?;
        if problem.as_ref().is_some_and(|p| !p.lang_allowed(&req.language)) {
            return Err(SubmitError::LanguageNotAllowed(req.language));
        }

        let (period_id, just_pretest) = match (&req.contest_id, custom) {
            (Some(cid), false) => self.live_period(cid, req.period_id)?,
            _ => (None, false),
        };
        let submission = self.store.create_submission(NewSubmission {
            user: req.user,
            problem_id: req.problem_id,
            language: req.language,
            source_name: format!("{}{}", SOURCE_STEM, lang.source_ext()),
            code: req.code,
            contest_id: if custom { None } else { req.contest_id },
            period_id,
            just_pretest,
            submitted_at: Utc::now(),
            stdin: if custom { Some(req.stdin.unwrap_or_default()) } else { None },
        })?;
        let position = self.queue.enqueue(self.store.as_ref(), submission.id)?;
        info!(submission_id = submission.id, user = %submission.user, "submission accepted");
        Ok(Submission {
            queue_position: position,
            ..submission
        })
    }

    /// The running period a contest submission counts for, and whether only
    /// pretests are judged in it.
    fn live_period(
        &self,
        contest_id: &str,
        period_id: Option<u64>,
    ) -> Result<(Option<u64>, bool), SubmitError> {
        let contest = match self.store.load_contest(contest_id) {
            Ok(contest) => contest,
            Err(StoreError::NotFound { .. }) => {
                return Err(SubmitError::UnknownContest(contest_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(period_id) = period_id else {
            return Ok((None, false));
        };
        let Some(period) = self.store.periods()?.into_iter().find(|p| p.id == period_id) else {
            return Ok((None, false));
        };
        if period.contest_id != contest.id {
            return Err(SubmitError::ForeignPeriod(period_id));
        }
        if !period.is_running(Utc::now()) {
            return Ok((None, false));
        }
        Ok((Some(period_id), contest.pretest != PretestPolicy::No))
    }

    pub fn enqueue(&self, id: u64) -> Result<u64, StoreError> {
        self.queue.enqueue(self.store.as_ref(), id)
    }

    pub fn queue_position(&self, id: u64) -> Result<u64, StoreError> {
        let submission = self.store.load_submission(id)?;
        Ok(self.queue.position(&submission))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageSpec;
    use crate::period::{Contest, Period};
    use crate::problem::ProblemInfo;
    use crate::store::FsStore;
    use crate::submission::TEST_INPUT;

    fn languages() -> Arc<LanguageRegistry> {
        let spec: LanguageSpec = serde_json::from_value(serde_json::json!({
            "default_branch": "python3",
            "branches": {"python3": {}, "pypy3": {}},
            "source_ext": ".py",
            "require_compile": false,
            "exec_cmd": ["python3", "{exec}"]
        }))
        .unwrap();
        let spec = Arc::new(spec);
        let mut registry = LanguageRegistry::default();
        for branch in ["python3", "pypy3"] {
            registry.insert(crate::language::Language::new("python", branch, spec.clone()).unwrap());
        }
        Arc::new(registry)
    }

    fn setup(pending_limit: usize) -> (tempfile::TempDir, Arc<FsStore>, Intake) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsStore::open(dir.path()).unwrap());
        let mut problem: ProblemInfo = serde_json::from_str(r#"{"name": "A + B"}"#).unwrap();
        problem.languages.insert("pypy3".to_string(), false);
        store.save_problem("a001", &problem).unwrap();
        let intake = Intake::new(
            store.clone(),
            JudgeQueue::new(),
            languages(),
            IntakeLimits {
                pending_limit,
                max_code_kb: 1,
            },
        );
        (dir, store, intake)
    }

    fn request(problem: &str, language: &str) -> SubmitRequest {
        SubmitRequest {
            user: "alice".to_string(),
            problem_id: problem.to_string(),
            language: language.to_string(),
            code: "print(1)".to_string(),
            contest_id: None,
            period_id: None,
            stdin: None,
        }
    }

    #[test]
    fn test_accepted_submission_is_queued() {
        let (_dir, store, intake) = setup(5);
        let s = intake.submit(request("a001", "python3")).unwrap();
        assert_eq!(s.source, "Main.py");
        assert_eq!(s.queue_position, 1);
        assert_eq!(intake.queue_position(s.id).unwrap(), 1);
        assert_eq!(store.load_submission(s.id).unwrap().queue_position, 1);
    }

    #[test]
    fn test_rejections() {
        let (_dir, _store, intake) = setup(1);
        assert!(matches!(
            intake.submit(request("zzz", "python3")),
            Err(SubmitError::UnknownProblem(_))
        ));
        assert!(matches!(
            intake.submit(request("a001", "brainfuck")),
            Err(SubmitError::UnknownLanguage(_))
        ));
        assert!(matches!(
            intake.submit(request("a001", "pypy3")),
            Err(SubmitError::LanguageNotAllowed(_))
        ));
        let mut big = request("a001", "python3");
        big.code = "#".repeat(1025);
        assert!(matches!(intake.submit(big), Err(SubmitError::TooLarge(1))));

        intake.submit(request("a001", "python3")).unwrap();
        assert!(matches!(
            intake.submit(request("a001", "python3")),
            Err(SubmitError::TooManyPending)
        ));
    }

    #[test]
    fn test_custom_run_keeps_input() {
        let (_dir, store, intake) = setup(5);
        let mut req = request(TEST_PROBLEM, "python3");
        req.stdin = Some("3 4\n".to_string());
        let s = intake.submit(req).unwrap();
        let input = std::fs::read_to_string(store.submission_dir(s.id).join(TEST_INPUT)).unwrap();
        assert_eq!(input, "3 4\n");
    }

    #[test]
    fn test_running_period_marks_pretest() {
        let (_dir, store, intake) = setup(5);
        store
            .save_contest(&Contest {
                id: "c1".to_string(),
                name: "Round 1".to_string(),
                pretest: PretestPolicy::All,
            })
            .unwrap();
        let now = Utc::now();
        store
            .save_period(&Period {
                id: 1,
                contest_id: "c1".to_string(),
                start: now - chrono::Duration::hours(1),
                end: now + chrono::Duration::hours(1),
                running: true,
                ended: false,
                judging: true,
                is_virtual: false,
            })
            .unwrap();
        let mut req = request("a001", "python3");
        req.contest_id = Some("c1".to_string());
        req.period_id = Some(1);
        let s = intake.submit(req).unwrap();
        assert_eq!(s.period_id, Some(1));
        assert!(s.just_pretest);
        assert_eq!(s.contest_id.as_deref(), Some("c1"));
    }
}
