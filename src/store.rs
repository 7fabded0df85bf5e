use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreError;
use crate::lock::FileLock;
use crate::period::{Contest, Period};
use crate::problem::ProblemInfo;
use crate::submission::{Submission, SubmissionResult, SubmissionStatus, TEST_INPUT};

/// Fields supplied when a submission is created.
#[derive(Debug, Clone)]
pub struct NewSubmission {
    pub user: String,
    pub problem_id: String,
    pub language: String,
    pub source_name: String,
    pub code: String,
    pub contest_id: Option<String>,
    pub period_id: Option<u64>,
    pub just_pretest: bool,
    pub submitted_at: DateTime<Utc>,
    /// Input for a custom test run.
    pub stdin: Option<String>,
}

/// Persistent entities the judging core reads and writes.
///
/// Every read-modify-write happens under the record's file lock; callers pass
/// a closure rather than saving a possibly stale copy.
pub trait Store: Send + Sync {
    fn load_submission(&self, id: u64) -> Result<Submission, StoreError>;
    fn update_submission(
        &self,
        id: u64,
        f: &mut dyn FnMut(&mut Submission),
    ) -> Result<Submission, StoreError>;
    fn create_submission(&self, draft: NewSubmission) -> Result<Submission, StoreError>;
    fn submissions(&self) -> Result<Vec<Submission>, StoreError>;
    fn submission_dir(&self, id: u64) -> PathBuf;

    fn load_problem(&self, pid: &str) -> Result<ProblemInfo, StoreError>;
    fn problem_dir(&self, pid: &str) -> PathBuf;

    fn load_contest(&self, cid: &str) -> Result<Contest, StoreError>;
    fn periods(&self) -> Result<Vec<Period>, StoreError>;
    fn update_period(
        &self,
        id: u64,
        f: &mut dyn FnMut(&mut Period),
    ) -> Result<Period, StoreError>;

    /// Writes a judge error trace and returns where it landed.
    fn write_log(&self, log_id: &str, text: &str) -> Result<PathBuf, StoreError>;
}

/// Runs `op` on the blocking pool. Store calls take file locks and touch the
/// disk, so async callers go through here.
pub async fn blocking<T, F>(store: &Arc<dyn Store>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
}

/// JSON files under one data directory.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

fn read_json<T: DeserializeOwned>(path: &Path, kind: &'static str, id: &str) -> Result<T, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                kind,
                id: id.to_string(),
            });
        }
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_str(&text).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Fails fast for absent records so locking does not create their directories.
fn ensure_exists(path: &Path, kind: &'static str, id: &str) -> Result<(), StoreError> {
    if path.exists() {
        Ok(())
    } else {
        Err(StoreError::NotFound {
            kind,
            id: id.to_string(),
        })
    }
}

/// Writes through a temporary sibling and renames it into place.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let text = serde_json::to_string_pretty(value).map_err(|source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, text).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

impl FsStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        for sub in ["submissions", "problems", "contests", "periods", "logs"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn token_path(&self) -> PathBuf {
        self.root.join("TOKEN")
    }

    fn submission_file(&self, id: u64) -> PathBuf {
        self.submission_dir(id).join("submission.json")
    }

    fn period_file(&self, id: u64) -> PathBuf {
        self.root.join("periods").join(format!("{}.json", id))
    }

    fn next_submission_id(&self) -> Result<u64, StoreError> {
        let counter = self.root.join("submissions").join("next_id");
        let _lock = FileLock::acquire(&counter)?;
        let next = match fs::read_to_string(&counter) {
            Ok(text) => text.trim().parse::<u64>().unwrap_or(1),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 1,
            Err(e) => return Err(StoreError::io(&counter, e)),
        };
        fs::write(&counter, (next + 1).to_string()).map_err(|e| StoreError::io(&counter, e))?;
        Ok(next)
    }

    /// Saves a period record, creating it if needed.
    pub fn save_period(&self, period: &Period) -> Result<(), StoreError> {
        let path = self.period_file(period.id);
        let _lock = FileLock::acquire(&path)?;
        write_json(&path, period)
    }

    pub fn save_contest(&self, contest: &Contest) -> Result<(), StoreError> {
        let path = self.root.join("contests").join(format!("{}.json", contest.id));
        let _lock = FileLock::acquire(&path)?;
        write_json(&path, contest)
    }

    pub fn save_problem(&self, pid: &str, info: &ProblemInfo) -> Result<(), StoreError> {
        let path = self.problem_dir(pid).join("info.json");
        let _lock = FileLock::acquire(&path)?;
        write_json(&path, info)
    }
}

impl Store for FsStore {
    fn load_submission(&self, id: u64) -> Result<Submission, StoreError> {
        let path = self.submission_file(id);
        ensure_exists(&path, "submission", &id.to_string())?;
        let _lock = FileLock::acquire(&path)?;
        read_json(&path, "submission", &id.to_string())
    }

    fn update_submission(
        &self,
        id: u64,
        f: &mut dyn FnMut(&mut Submission),
    ) -> Result<Submission, StoreError> {
        let path = self.submission_file(id);
        ensure_exists(&path, "submission", &id.to_string())?;
        let _lock = FileLock::acquire(&path)?;
        let mut submission: Submission = read_json(&path, "submission", &id.to_string())?;
        f(&mut submission);
        write_json(&path, &submission)?;
        Ok(submission)
    }

    fn create_submission(&self, draft: NewSubmission) -> Result<Submission, StoreError> {
        let id = self.next_submission_id()?;
        let dir = self.submission_dir(id);
        fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let source = dir.join(&draft.source_name);
        fs::write(&source, &draft.code).map_err(|e| StoreError::io(&source, e))?;
        if let Some(stdin) = &draft.stdin {
            let input = dir.join(TEST_INPUT);
            fs::write(&input, stdin).map_err(|e| StoreError::io(&input, e))?;
        }
        let submission = Submission {
            id,
            user: draft.user,
            problem_id: draft.problem_id,
            language: draft.language,
            source: draft.source_name,
            contest_id: draft.contest_id,
            period_id: draft.period_id,
            submitted_at: draft.submitted_at,
            status: SubmissionStatus::Pending,
            completed: false,
            simple_result: "waiting".to_string(),
            result: SubmissionResult::default(),
            ce_message: String::new(),
            queue_position: 0,
            just_pretest: draft.just_pretest,
        };
        let path = self.submission_file(id);
        let _lock = FileLock::acquire(&path)?;
        write_json(&path, &submission)?;
        debug!(submission_id = id, "submission created");
        Ok(submission)
    }

    fn submissions(&self) -> Result<Vec<Submission>, StoreError> {
        let dir = self.root.join("submissions");
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut ids: Vec<u64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
            .collect();
        ids.sort_unstable();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match self.load_submission(id) {
                Ok(s) => out.push(s),
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    fn submission_dir(&self, id: u64) -> PathBuf {
        self.root.join("submissions").join(id.to_string())
    }

    fn load_problem(&self, pid: &str) -> Result<ProblemInfo, StoreError> {
        let path = self.problem_dir(pid).join("info.json");
        ensure_exists(&path, "problem", pid)?;
        let _lock = FileLock::acquire(&path)?;
        read_json(&path, "problem", pid)
    }

    fn problem_dir(&self, pid: &str) -> PathBuf {
        self.root.join("problems").join(pid)
    }

    fn load_contest(&self, cid: &str) -> Result<Contest, StoreError> {
        let path = self.root.join("contests").join(format!("{}.json", cid));
        ensure_exists(&path, "contest", cid)?;
        let _lock = FileLock::acquire(&path)?;
        read_json(&path, "contest", cid)
    }

    fn periods(&self) -> Result<Vec<Period>, StoreError> {
        let dir = self.root.join("periods");
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        let mut ids: Vec<u64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name();
                let name = name.to_str()?;
                name.strip_suffix(".json")?.parse().ok()
            })
            .collect();
        ids.sort_unstable();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let path = self.period_file(id);
            let _lock = FileLock::acquire(&path)?;
            out.push(read_json(&path, "period", &id.to_string())?);
        }
        Ok(out)
    }

    fn update_period(
        &self,
        id: u64,
        f: &mut dyn FnMut(&mut Period),
    ) -> Result<Period, StoreError> {
        let path = self.period_file(id);
        ensure_exists(&path, "period", &id.to_string())?;
        let _lock = FileLock::acquire(&path)?;
        let mut period: Period = read_json(&path, "period", &id.to_string())?;
        f(&mut period);
        write_json(&path, &period)?;
        Ok(period)
    }

    fn write_log(&self, log_id: &str, text: &str) -> Result<PathBuf, StoreError> {
        let path = self.root.join("logs").join(format!("{}.log", log_id));
        fs::write(&path, text).map_err(|e| StoreError::io(&path, e))?;
        Ok(path)
    }
}
