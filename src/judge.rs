//! Grading of one submission: compile, run every case, score, persist.

use metrics::{counter, histogram};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::Sandbox;
use crate::error::{JudgeError, ProblemError};
use crate::grader::Grader;
use crate::language::{Language, LanguageRegistry};
use crate::paths::{Access, Environment, RunSpec, SandboxPath};
use crate::problem::ProblemInfo;
use crate::runner::{CaseContext, CaseOutcome, Gate, SECCOMP_SIGNAL, exit_code_message, gate, run_case};
use crate::scoring::{CaseScore, Scoreboard, simple_verdict};
use crate::store::{Store, blocking};
use crate::submission::{
    CaseResult, Submission, SubmissionResult, SubmissionStatus, TEST_INPUT, TEST_OUTPUT,
};
use crate::types::{RunOutcome, RunReport, SandboxRole};
use crate::utils::read_truncated;
use crate::verdict::Verdict;

/// Limits of a custom test run.
pub const CUSTOM_TIME_LIMIT_MS: u64 = 10_000;
pub const CUSTOM_MEMORY_LIMIT_MB: u64 = 1000;

const RUNNER_STEM: &str = "Runner";

#[derive(Debug, Clone)]
pub struct JudgeSettings {
    /// Host directory holding the per-grading sandbox roots.
    pub sandbox_root: PathBuf,
    pub testlib: PathBuf,
    /// Cases processed between intermediate saves.
    pub save_period: usize,
    pub compile_timeout_secs: f64,
}

/// Everything a worker needs to grade submissions.
#[derive(Clone)]
pub struct JudgeContext {
    pub store: Arc<dyn Store>,
    pub sandbox: Arc<dyn Sandbox>,
    pub languages: Arc<LanguageRegistry>,
    pub settings: JudgeSettings,
}

/// Grades submission `id` and persists the verdict. The sandbox root lives
/// exactly as long as this call.
pub async fn judge_submission(ctx: &JudgeContext, id: u64) -> Result<(), JudgeError> {
    let submission = blocking(&ctx.store, move |store| store.load_submission(id)).await?;
    let lang = ctx
        .languages
        .get(&submission.language)
        .ok_or_else(|| JudgeError::UnknownLanguage(submission.language.clone()))?;
    let env = Environment::create(&ctx.settings.sandbox_root, ctx.sandbox.clone())?;
    info!(
        submission_id = id,
        problem = %submission.problem_id,
        sandbox = env.dirname(),
        "judging"
    );

    let outcome = if submission.is_custom_test() {
        custom_test(ctx, &env, lang, &submission).await?
    } else {
        grade_problem(ctx, &env, lang, &submission).await?
    };
    counter!("submissions_judged_total", "outcome" => outcome.clone()).increment(1);
    info!(submission_id = id, outcome = %outcome, "judged");
    Ok(())
}

async fn set_status(
    store: &Arc<dyn Store>,
    id: u64,
    status: SubmissionStatus,
) -> Result<(), JudgeError> {
    blocking(store, move |store| store.update_submission(id, &mut |s| s.status = status)).await?;
    Ok(())
}

/// Persists a finished verdict and marks the submission completed.
async fn save_verdict(
    store: &Arc<dyn Store>,
    id: u64,
    result: SubmissionResult,
    ce_message: String,
) -> Result<(), JudgeError> {
    blocking(store, move |store| {
        store.update_submission(id, &mut |s| {
            s.simple_result = result.simple_result.clone();
            s.result = result.clone();
            s.ce_message = ce_message.clone();
            s.status = SubmissionStatus::Judged;
            s.completed = true;
        })
    })
    .await?;
    Ok(())
}

/// One-line summary of a custom run.
pub fn custom_summary(report: &RunReport, lang: &Language) -> String {
    match report.result {
        RunOutcome::JE => format!("JE: {}", report.error),
        RunOutcome::TLE => "TLE: The custom test execution time exceeded the 10 second limit".to_string(),
        RunOutcome::MLE => "MLE: The custom test execution memory exceeded the 1GB limit".to_string(),
        RunOutcome::OLE => "OLE: Output too large".to_string(),
        RunOutcome::RE if report.signal == SECCOMP_SIGNAL => {
            "RE: Violation of seccomp rules".to_string()
        }
        RunOutcome::RE => {
            let message = exit_code_message(report.exit_code)
                .map(str::to_string)
                .unwrap_or_else(|| report.exit_code.to_string());
            format!("RE: {}: signal {}", message, report.signal)
        }
        RunOutcome::AC => {
            let time = (report.cpu_time_ms as f64 - lang.base_time_ms).max(0.0).ceil();
            let memory = (report.memory_bytes as f64 - lang.base_memory_bytes).max(0.0).ceil();
            format!("OK: {}ms, {}B", time, memory)
        }
    }
}

async fn custom_test(
    ctx: &JudgeContext,
    env: &Environment,
    lang: &Language,
    submission: &Submission,
) -> Result<String, JudgeError> {
    let dir = ctx.store.submission_dir(submission.id);
    set_status(&ctx.store, submission.id, SubmissionStatus::Compiling).await?;

    let source = env.send_file(&dir.join(&submission.source))?;
    let (exec, ce) = lang
        .compile(&source, env, None, ctx.settings.compile_timeout_secs)
        .await?;
    let simple = if !ce.is_empty() {
        "CE".to_string()
    } else {
        set_status(&ctx.store, submission.id, SubmissionStatus::RunningCases).await?;
        let input = dir.join(TEST_INPUT);
        let in_path = if input.exists() {
            env.send_rand_file(&input)?
        } else {
            env.create_rand_file(".in")?
        };
        let out_path = env.create_rand_file(".out")?;
        env.grant(&in_path, Access::Read, Some(SandboxRole::Running));
        env.grant(&out_path, Access::Write, Some(SandboxRole::Running));
        let report = env
            .run(RunSpec {
                cmd: lang.get_execmd(&exec)?,
                tl_ms: CUSTOM_TIME_LIMIT_MS,
                ml_mb: CUSTOM_MEMORY_LIMIT_MB,
                stdin: Some(&in_path),
                stdout: Some(&out_path),
                stderr: None,
                seccomp: Some(lang.seccomp_rule()),
                role: SandboxRole::Running,
            })
            .await?;
        debug!(submission_id = submission.id, result = report.result.as_str(), "custom run finished");
        if report.result == RunOutcome::AC {
            env.get_file(&out_path, &dir.join(TEST_OUTPUT))?;
        }
        custom_summary(&report, lang)
    };

    let outcome = if ce.is_empty() { "custom" } else { "CE" }.to_string();
    let result = SubmissionResult {
        ce: !ce.is_empty(),
        simple_result: simple,
        ..Default::default()
    };
    save_verdict(&ctx.store, submission.id, result, ce).await?;
    Ok(outcome)
}

/// Stages library files and the runner harness, then compiles the submission.
async fn compile_submission(
    ctx: &JudgeContext,
    env: &Environment,
    lang: &Language,
    submission: &Submission,
    problem: &ProblemInfo,
    problem_dir: &Path,
) -> Result<(SandboxPath, String), JudgeError> {
    let files = problem_dir.join("file");
    for name in &problem.library {
        let staged = env.send_file(&files.join(name))?;
        env.grant(&staged, Access::Execute, None);
    }
    let source = env.send_file(&ctx.store.submission_dir(submission.id).join(&submission.source))?;
    let runner = if problem.runner_enabled {
        let name = problem
            .runner_source
            .get(&submission.language)
            .ok_or_else(|| ProblemError::MissingRunner(submission.language.clone()))?;
        Some(env.send_file_as(
            &files.join(name),
            &format!("{}{}", RUNNER_STEM, lang.source_ext()),
        )?)
    } else {
        None
    };
    lang.compile(&source, env, runner.as_ref(), ctx.settings.compile_timeout_secs)
        .await
}

async fn grade_problem(
    ctx: &JudgeContext,
    env: &Environment,
    lang: &Language,
    submission: &Submission,
) -> Result<String, JudgeError> {
    let id = submission.id;
    let pid = submission.problem_id.clone();
    let problem = blocking(&ctx.store, move |store| store.load_problem(&pid)).await?;
    let problem_dir = ctx.store.problem_dir(&submission.problem_id);
    let group_order = problem.validate()?;
    let protected = (!problem.public_testcase || submission.period_id.is_some())
        && !problem.is_owner(&submission.user);

    set_status(&ctx.store, id, SubmissionStatus::Compiling).await?;
    let (exec, ce) = compile_submission(ctx, env, lang, submission, &problem, &problem_dir).await?;
    if !ce.is_empty() {
        let result = SubmissionResult {
            ce: true,
            protected,
            simple_result: "CE".to_string(),
            ..Default::default()
        };
        save_verdict(&ctx.store, id, result, ce).await?;
        return Ok("CE".to_string());
    }

    set_status(&ctx.store, id, SubmissionStatus::RunningCases).await?;
    let grader = Grader::prepare(
        &problem,
        &problem_dir,
        env,
        &ctx.languages,
        &ctx.settings.testlib,
        ctx.settings.compile_timeout_secs,
    )
    .await?;
    let exec_cmd = lang.get_execmd(&exec)?;
    let case_ctx = CaseContext {
        env,
        lang,
        exec_cmd: &exec_cmd,
        grader: &grader,
        tl_ms: problem.time_limit_for(&submission.language),
        ml_mb: problem.memorylimit,
        top_score: problem.top_score,
    };

    let cases = problem.ordered_cases(&group_order);
    let mut board = Scoreboard::new(&problem.all_groups(), problem.top_score);
    for case in &cases {
        board.expect_case(&case.case.group);
    }
    let mut results = vec![CaseResult::pending(); cases.len()];
    let mut unsaved = 0;
    for (i, case) in cases.iter().enumerate() {
        if unsaved >= ctx.settings.save_period {
            let partial = results.clone();
            let groups = board.snapshot();
            blocking(&ctx.store, move |store| {
                store.update_submission(id, &mut |s| {
                    s.result.results = partial.clone();
                    s.result.group_results = groups.clone();
                    s.result.protected = protected;
                    s.completed = false;
                })
            })
            .await?;
            unsaved = 0;
        }
        let group = case.case.group.as_str();
        let input = case.input(&problem_dir);
        let answer = case.answer(&problem_dir);
        let outcome = match gate(
            submission.just_pretest,
            case.case.pretest,
            board.dependencies_satisfied(group),
            board.is_settled(group),
        ) {
            Gate::PretestOnly => CaseOutcome::skipped(
                Verdict::OK,
                problem.top_score,
                "Skipped: only pretests are judged",
            ),
            Gate::Skip => CaseOutcome::skipped(Verdict::SKIP, 0.0, "Skipped"),
            Gate::Run => {
                let outcome = run_case(&case_ctx, &input, &answer).await?;
                histogram!("judge_case_time_ms").record(outcome.time_ms as f64);
                outcome
            }
        };
        debug!(submission_id = id, case = i, verdict = %outcome.verdict, "case done");

        board.record(
            group,
            CaseScore {
                verdict: outcome.verdict,
                time_ms: outcome.time_ms,
                mem_kb: outcome.mem_kb,
                score: outcome.score,
            },
        );
        let mut result = CaseResult {
            time_ms: outcome.time_ms,
            mem_kb: outcome.mem_kb,
            result: outcome.verdict,
            info: outcome.info,
            has_output: outcome.has_output,
            score: outcome.score,
            sample: Some(case.case.sample),
            input: None,
            output: None,
            ans: None,
        };
        if !protected {
            result.input = Some(read_truncated(&input)?);
            result.ans = Some(read_truncated(&answer)?);
            result.output = outcome.user_output;
        }
        results[i] = result;
        unsaved += 1;
    }

    let summary = board.finalize();
    let simple = simple_verdict(false, summary.not_accepted, summary.total, submission.just_pretest);
    let result = SubmissionResult {
        ce: false,
        results,
        group_results: summary.groups,
        total_score: summary.total,
        protected,
        simple_result: simple,
        je: None,
        log_uuid: None,
    };
    save_verdict(&ctx.store, id, result, String::new()).await?;
    Ok(if summary.not_accepted { "NA" } else { "AC" }.to_string())
}
