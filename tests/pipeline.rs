//! End-to-end grading through a scripted executor.
//!
//! The scripted executor reads the staged "program" as a one-word script:
//! `sum` prints the sum of the input numbers, `first` prints the first one,
//! `loop` runs out of time and anything else crashes.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use mikan::client::Sandbox;
use mikan::error::ClientError;
use mikan::judge::{JudgeContext, JudgeSettings};
use mikan::language::{Language, LanguageRegistry, LanguageSpec};
use mikan::period::{Contest, Period, PeriodLifecycle, PretestPolicy};
use mikan::problem::ProblemInfo;
use mikan::queue::JudgeQueue;
use mikan::sandbox::SandboxMount;
use mikan::store::{FsStore, NewSubmission, Store};
use mikan::submission::{Submission, SubmissionStatus};
use mikan::types::{
    CallRequest, CallResult, DEV_NULL, InteractJudgeRequest, InteractReport, JudgeRequest,
    RunOutcome, RunReport,
};
use mikan::verdict::Verdict;
use mikan::worker::process;

struct ScriptedSandbox {
    mount: SandboxMount,
}

fn report(result: RunOutcome, exit_code: i32, signal: i32) -> RunReport {
    RunReport {
        cpu_time_ms: 10,
        real_time_ms: 12,
        memory_bytes: 2 * 1024 * 1024,
        signal,
        exit_code,
        error: String::new(),
        result,
        error_id: 0,
        result_id: result.id(),
        judger_log: String::new(),
    }
}

fn tokens(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl Sandbox for ScriptedSandbox {
    async fn call(&self, req: CallRequest) -> Result<CallResult, ClientError> {
        let (return_code, stderr) = match req.cmd.first().map(String::as_str) {
            Some("g++") => {
                let source = fs::read_to_string(self.mount.host(&req.cmd[1])).unwrap_or_default();
                if source.contains("syntax error") {
                    (1, "Main.cpp:1:1: error: expected ';'".to_string())
                } else {
                    fs::write(self.mount.host(&req.cmd[3]), source).unwrap();
                    (0, String::new())
                }
            }
            Some("python3") if req.cmd[1].ends_with("checker.py") => {
                let output = tokens(&self.mount.host(&req.cmd[3]));
                let answer = tokens(&self.mount.host(&req.cmd[4]));
                if output == answer {
                    (0, "ok".to_string())
                } else {
                    (1, "wrong answer".to_string())
                }
            }
            _ => (0, String::new()),
        };
        Ok(CallResult {
            stdout: String::new(),
            stderr,
            return_code,
        })
    }

    async fn judge(&self, req: JudgeRequest) -> Result<RunReport, ClientError> {
        let program = req.cmd.last().cloned().unwrap_or_default();
        let script = fs::read_to_string(self.mount.host(&program)).unwrap_or_default();
        let numbers: Vec<i64> = tokens(&self.mount.host(&req.in_file))
            .iter()
            .filter_map(|t| t.parse().ok())
            .collect();
        let (result, output) = match script.trim() {
            "sum" => (report(RunOutcome::AC, 0, 0), numbers.iter().sum::<i64>().to_string()),
            "first" => (
                report(RunOutcome::AC, 0, 0),
                numbers.first().copied().unwrap_or_default().to_string(),
            ),
            "loop" => (report(RunOutcome::TLE, 137, 9), String::new()),
            _ => (report(RunOutcome::RE, 139, 11), String::new()),
        };
        if req.out_file != DEV_NULL {
            fs::write(self.mount.host(&req.out_file), format!("{}\n", output)).unwrap();
        }
        Ok(result)
    }

    async fn interact_judge(
        &self,
        req: InteractJudgeRequest,
    ) -> Result<InteractReport, ClientError> {
        fs::write(
            self.mount.host(&req.interact_err_file),
            "wrong output format Unexpected end of file",
        )
        .unwrap();
        Ok(InteractReport {
            result: report(RunOutcome::AC, 0, 0),
            interact_result: report(RunOutcome::RE, 2, 0),
        })
    }
}

fn language(name: &str, branch: &str, spec: serde_json::Value) -> Language {
    let spec: LanguageSpec = serde_json::from_value(spec).unwrap();
    Language::new(name, branch, Arc::new(spec)).unwrap()
}

fn languages() -> LanguageRegistry {
    let mut registry = LanguageRegistry::default();
    registry.insert(language(
        "python",
        "python3",
        serde_json::json!({
            "default_branch": "python3",
            "branches": {"python3": {}},
            "source_ext": ".py",
            "require_compile": false,
            "exec_cmd": ["python3", "{exec}"]
        }),
    ));
    registry.insert(language(
        "cpp",
        "C++17",
        serde_json::json!({
            "default_branch": "C++17",
            "branches": {"C++17": {"std": "c++17"}},
            "source_ext": ".cpp",
            "require_compile": true,
            "compile_cmd": ["g++", "{source}", "-o", "{exec}", "-std={std}"],
            "exec_cmd": ["{exec}"],
            "seccomp_rule": "c_cpp"
        }),
    ));
    registry
}

struct Judge {
    _dir: tempfile::TempDir,
    store: Arc<FsStore>,
    ctx: JudgeContext,
}

impl Judge {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsStore::open(dir.path().join("data")).unwrap());
        let sandbox_root = dir.path().join("sandbox");
        fs::create_dir_all(&sandbox_root).unwrap();
        let ctx = JudgeContext {
            store: store.clone(),
            sandbox: Arc::new(ScriptedSandbox {
                mount: SandboxMount::new(&sandbox_root),
            }),
            languages: Arc::new(languages()),
            settings: JudgeSettings {
                sandbox_root,
                testlib: dir.path().join("testlib.h"),
                save_period: 1,
                compile_timeout_secs: 30.0,
            },
        };
        Self {
            _dir: dir,
            store,
            ctx,
        }
    }

    /// Writes a problem whose cases are `(group, input, answer)` triples.
    fn problem(&self, pid: &str, info: serde_json::Value, cases: &[(&str, &str, &str)]) {
        let mut info: ProblemInfo = serde_json::from_value(info).unwrap();
        let dir = self.store.problem_dir(pid);
        fs::create_dir_all(dir.join("testcases")).unwrap();
        for (i, (group, input, answer)) in cases.iter().enumerate() {
            let case = i + 1;
            fs::write(dir.join("testcases").join(format!("{}.in", case)), input).unwrap();
            fs::write(dir.join("testcases").join(format!("{}.out", case)), answer).unwrap();
            info.testcases.push(
                serde_json::from_value(serde_json::json!({
                    "in_file": format!("{}.in", case),
                    "out_file": format!("{}.out", case),
                    "group": group,
                }))
                .unwrap(),
            );
        }
        fs::write(dir.join("checker.py"), "# token checker").unwrap();
        fs::write(dir.join("interactor.py"), "# interactor").unwrap();
        self.store.save_problem(pid, &info).unwrap();
    }

    async fn submit(&self, pid: &str, language: &str, code: &str) -> Submission {
        self.grade(draft(pid, language, code)).await
    }

    async fn grade(&self, draft: NewSubmission) -> Submission {
        let submission = self.store.create_submission(draft).unwrap();
        process(&self.ctx, submission.id).await;
        self.store.load_submission(submission.id).unwrap()
    }

    fn sandbox_is_empty(&self) -> bool {
        fs::read_dir(&self.ctx.settings.sandbox_root)
            .unwrap()
            .next()
            .is_none()
    }
}

fn draft(pid: &str, language: &str, code: &str) -> NewSubmission {
    let ext = if language == "C++17" { "cpp" } else { "py" };
    NewSubmission {
        user: "alice".to_string(),
        problem_id: pid.to_string(),
        language: language.to_string(),
        source_name: format!("Main.{}", ext),
        code: code.to_string(),
        contest_id: None,
        period_id: None,
        just_pretest: false,
        submitted_at: Utc::now(),
        stdin: None,
    }
}

fn two_groups() -> serde_json::Value {
    serde_json::json!({
        "name": "A + B",
        "checker": ["checker.py", "python3"],
        "groups": {
            "g1": {"score": 40},
            "g2": {"score": 60, "dependency": ["g1"]}
        }
    })
}

const TWO_GROUP_CASES: &[(&str, &str, &str)] =
    &[("g1", "1 2\n", "3\n"), ("g2", "3 0\n", "3\n"), ("g2", "5 5\n", "10\n")];

#[tokio::test]
async fn test_accepted_submission() {
    let judge = Judge::new();
    judge.problem("a001", two_groups(), TWO_GROUP_CASES);
    let s = judge.submit("a001", "python3", "sum").await;

    assert!(s.completed);
    assert_eq!(s.status, SubmissionStatus::Judged);
    assert_eq!(s.simple_result, "AC");
    assert_eq!(s.result.total_score, 100.0);
    assert!(s.result.results.iter().all(|r| r.result == Verdict::OK));
    assert!(s.result.protected);
    assert!(s.result.results[0].output.is_none());
    assert!(judge.sandbox_is_empty());
}

#[tokio::test]
async fn test_wrong_answer_skips_dependent_group() {
    let judge = Judge::new();
    judge.problem("a001", two_groups(), TWO_GROUP_CASES);
    let s = judge.submit("a001", "python3", "first").await;

    let verdicts: Vec<Verdict> = s.result.results.iter().map(|r| r.result).collect();
    assert_eq!(verdicts, vec![Verdict::WA, Verdict::SKIP, Verdict::SKIP]);
    assert_eq!(s.result.group_results["g1"].result, Verdict::WA);
    assert_eq!(s.result.total_score, 0.0);
    assert_eq!(s.simple_result, "NA 0%");
}

#[tokio::test]
async fn test_average_group_earns_partial_score() {
    let judge = Judge::new();
    judge.problem(
        "a002",
        serde_json::json!({
            "checker": ["checker.py", "python3"],
            "public_testcase": true,
            "groups": {"g": {"score": 100, "rule": "avg"}}
        }),
        &[("g", "3 0\n", "3\n"), ("g", "1 2\n", "3\n")],
    );
    let s = judge.submit("a002", "python3", "first").await;

    assert_eq!(s.result.group_results["g"].result, Verdict::PARTIAL);
    assert_eq!(s.result.total_score, 50.0);
    assert_eq!(s.simple_result, "NA 50%");
    assert!(!s.result.protected);
    assert_eq!(s.result.results[0].output.as_deref(), Some("3\n"));
    assert_eq!(s.result.results[0].input.as_deref(), Some("3 0\n"));
}

#[tokio::test]
async fn test_runtime_limits() {
    let judge = Judge::new();
    judge.problem("a001", two_groups(), TWO_GROUP_CASES);

    let s = judge.submit("a001", "python3", "loop").await;
    assert_eq!(s.result.results[0].result, Verdict::TLE);
    assert_eq!(s.result.results[0].time_ms, 1000);

    let s = judge.submit("a001", "python3", "crash").await;
    assert_eq!(s.result.results[0].result, Verdict::RE);
    assert_eq!(s.result.results[0].info, "Segmentation fault");
}

#[tokio::test]
async fn test_compile_error() {
    let judge = Judge::new();
    judge.problem("a001", two_groups(), TWO_GROUP_CASES);

    let s = judge.submit("a001", "C++17", "syntax error").await;
    assert!(s.completed);
    assert!(s.result.ce);
    assert_eq!(s.simple_result, "CE");
    assert!(s.ce_message.contains("expected ';'"));
    assert!(s.result.results.is_empty());

    let s = judge.submit("a001", "C++17", "sum").await;
    assert_eq!(s.simple_result, "AC");
}

#[tokio::test]
async fn test_interactor_verdict() {
    let judge = Judge::new();
    judge.problem(
        "i001",
        serde_json::json!({
            "checker": ["checker.py", "python3"],
            "interactor": ["interactor.py", "python3"],
            "is_interact": true
        }),
        &[("default", "1\n", "1\n"), ("default", "2\n", "2\n")],
    );
    let s = judge.submit("i001", "python3", "sum").await;

    assert_eq!(s.result.results[0].result, Verdict::PE);
    assert!(s.result.results[0].info.starts_with("wrong output format"));
    assert_eq!(s.result.results[1].result, Verdict::SKIP);
    assert_eq!(s.result.total_score, 0.0);
}

#[tokio::test]
async fn test_unknown_language_is_judge_error() {
    let judge = Judge::new();
    judge.problem("a001", two_groups(), TWO_GROUP_CASES);

    let s = judge.submit("a001", "cobol", "sum").await;
    assert!(s.completed);
    assert_eq!(s.status, SubmissionStatus::JudgeError);
    assert_eq!(s.simple_result, "JE");
    assert!(s.result.log_uuid.is_some());
}

#[tokio::test]
async fn test_judge_error_after_staging_cleans_sandbox() {
    let judge = Judge::new();
    // Case group `g3` is not declared.
    judge.problem("a003", two_groups(), &[("g1", "1 2\n", "3\n"), ("g3", "1 1\n", "2\n")]);

    let s = judge.submit("a003", "python3", "sum").await;
    assert!(s.completed);
    assert_eq!(s.status, SubmissionStatus::JudgeError);
    assert!(s.result.log_uuid.is_some());
    assert!(judge.sandbox_is_empty());
}

#[tokio::test]
async fn test_pretest_then_full_judge_after_period() {
    let judge = Judge::new();
    let cases = [("g1", "1 2\n", "3\n"), ("g2", "3 0\n", "3\n"), ("g2", "5 5\n", "10\n")];
    judge.problem("a001", two_groups(), &cases);
    let mut info = judge.store.load_problem("a001").unwrap();
    info.testcases[0].pretest = true;
    judge.store.save_problem("a001", &info).unwrap();

    judge
        .store
        .save_contest(&Contest {
            id: "c1".to_string(),
            name: "Round 1".to_string(),
            pretest: PretestPolicy::All,
        })
        .unwrap();
    let start = Utc::now() - Duration::hours(2);
    judge
        .store
        .save_period(&Period {
            id: 1,
            contest_id: "c1".to_string(),
            start,
            end: start + Duration::hours(1),
            running: true,
            ended: false,
            judging: true,
            is_virtual: false,
        })
        .unwrap();

    let mut pretest = draft("a001", "python3", "sum");
    pretest.contest_id = Some("c1".to_string());
    pretest.period_id = Some(1);
    pretest.just_pretest = true;
    let s = judge.grade(pretest).await;

    assert!(s.completed);
    assert_eq!(s.simple_result, "pretest passed");
    assert_eq!(s.result.results[0].result, Verdict::OK);
    for skipped in &s.result.results[1..] {
        assert_eq!(skipped.result, Verdict::OK);
        assert_eq!(skipped.info, "Skipped: only pretests are judged");
    }

    let queue = JudgeQueue::new();
    let lifecycle = PeriodLifecycle::new(
        judge.store.clone(),
        queue.clone(),
        std::time::Duration::from_millis(1),
    );
    lifecycle.end_due(Utc::now()).unwrap();
    let waiting = judge.store.load_submission(s.id).unwrap();
    assert!(!waiting.completed);
    assert!(!waiting.just_pretest);

    let id = queue.pop().await.unwrap();
    assert_eq!(id, s.id);
    process(&judge.ctx, id).await;
    queue.finish(judge.store.as_ref(), id).unwrap();
    assert!(queue.is_empty());

    let s = judge.store.load_submission(id).unwrap();
    assert!(s.completed);
    assert_eq!(s.simple_result, "AC");
    assert_eq!(s.result.total_score, 100.0);
    assert!(s.result.results.iter().all(|r| r.result == Verdict::OK));
    assert!(s.result.results.iter().all(|r| !r.info.starts_with("Skipped")));
    assert!(judge.sandbox_is_empty());
}
