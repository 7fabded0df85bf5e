//! One test case: stage, execute under limits, classify, check.

use std::path::Path;
use tracing::debug;

use crate::error::JudgeError;
use crate::grader::{CheckOutcome, Grader, interpret};
use crate::language::Language;
use crate::paths::{Access, Environment, InteractSpec, RunSpec};
use crate::types::{RunOutcome, RunReport, SandboxRole};
use crate::utils::read_truncated;
use crate::verdict::Verdict;

/// Exit status a program gets when it exceeds the file size limit.
pub const OUTPUT_LIMIT_EXIT: i32 = 153;
/// SIGSYS, delivered when a seccomp filter kills the program.
pub const SECCOMP_SIGNAL: i32 = 31;

/// Human-readable messages for well-known runtime exit codes.
pub fn exit_code_message(code: i32) -> Option<&'static str> {
    match code {
        1 => Some("Program was interrupted by the monitor, possibly because it did not exit normally"),
        127 => Some("Unable to allocate memory"),
        132 => Some("Illegal instruction"),
        134 => Some("Program called abort"),
        135 => Some("Misaligned memory access"),
        136 => Some("Arithmetic overflow or division by zero"),
        137 => Some("Program was killed"),
        139 => Some("Segmentation fault"),
        143 => Some("Program was terminated"),
        _ => None,
    }
}

/// What the interactor reported alongside the solution's run.
#[derive(Debug, Clone)]
pub struct InteractorRun {
    pub report: RunReport,
    pub message: String,
}

/// Classifies a finished run before any checker is involved. `None` means the
/// run was clean and its output should be checked.
///
/// Precedence: judge errors, then resource limits (TLE, MLE, OLE), then the
/// interactor's verdict, then the solution's own runtime error.
pub fn classify_run(
    report: &RunReport,
    interactor: Option<&InteractorRun>,
    tl_ms: u64,
    ml_mb: u64,
    top_score: f64,
) -> Option<CheckOutcome> {
    let verdict = |verdict: Verdict, info: &str| {
        Some(CheckOutcome {
            verdict,
            score: 0.0,
            info: info.to_string(),
        })
    };

    if report.result == RunOutcome::JE {
        return verdict(Verdict::JE, &report.error);
    }
    if report.result == RunOutcome::TLE || report.real_time_ms as f64 >= 0.95 * tl_ms as f64 {
        return verdict(Verdict::TLE, "Execution time is too long");
    }
    if report.result == RunOutcome::MLE || report.memory_bytes >= ml_mb * 1024 * 1024 {
        return verdict(Verdict::MLE, "Memory usage is too large");
    }
    if report.result == RunOutcome::OLE || report.exit_code == OUTPUT_LIMIT_EXIT {
        return verdict(Verdict::OLE, "Output too large");
    }
    if let Some(interactor) = interactor {
        let r = &interactor.report;
        if r.result == RunOutcome::JE {
            return verdict(Verdict::JE, &r.error);
        }
        if r.signal != 0 {
            return verdict(Verdict::JE, "Interactor crashed");
        }
        if r.exit_code != 0 {
            let mut outcome = interpret(r.exit_code, "", &interactor.message, top_score);
            if outcome.verdict == Verdict::OK {
                outcome.verdict = Verdict::FAIL;
            }
            return Some(outcome);
        }
    }
    if report.result == RunOutcome::RE || report.exit_code != 0 || report.signal != 0 {
        if report.signal == SECCOMP_SIGNAL {
            return verdict(Verdict::RE, "Violation of seccomp rules");
        }
        let info = exit_code_message(report.exit_code).unwrap_or("Runtime Error");
        return verdict(Verdict::RE, info);
    }
    None
}

/// Everything a case needs that stays fixed across one grading.
pub struct CaseContext<'a> {
    pub env: &'a Environment,
    pub lang: &'a Language,
    pub exec_cmd: &'a [String],
    pub grader: &'a Grader,
    pub tl_ms: u64,
    pub ml_mb: u64,
    pub top_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CaseOutcome {
    pub verdict: Verdict,
    pub info: String,
    pub time_ms: u64,
    pub mem_kb: u64,
    pub score: f64,
    pub has_output: bool,
    /// Truncated copy of what the program printed.
    pub user_output: Option<String>,
}

impl CaseOutcome {
    pub fn skipped(verdict: Verdict, score: f64, info: &str) -> Self {
        Self {
            verdict,
            info: info.to_string(),
            time_ms: 0,
            mem_kb: 0,
            score,
            has_output: false,
            user_output: None,
        }
    }
}

/// Which short-circuit applies to a case before anything is staged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Run,
    /// Only pretests are judged; the case counts as a full pass.
    PretestOnly,
    /// A dependency group failed, or this `min` group already has a zero verdict.
    Skip,
}

pub fn gate(just_pretest: bool, is_pretest: bool, dependencies_ok: bool, settled: bool) -> Gate {
    if just_pretest && !is_pretest {
        Gate::PretestOnly
    } else if !dependencies_ok || settled {
        Gate::Skip
    } else {
        Gate::Run
    }
}

/// Runs one case whose input and answer live at the given host paths.
pub async fn run_case(
    ctx: &CaseContext<'_>,
    input: &Path,
    answer: &Path,
) -> Result<CaseOutcome, JudgeError> {
    let env = ctx.env;
    let in_path = env.send_rand_file(input)?;
    let out_path = env.create_rand_file(".out")?;

    let spec = |role| RunSpec {
        cmd: ctx.exec_cmd.to_vec(),
        tl_ms: ctx.tl_ms,
        ml_mb: ctx.ml_mb,
        stdin: Some(&in_path),
        stdout: Some(&out_path),
        stderr: None,
        seccomp: Some(ctx.lang.seccomp_rule()),
        role,
    };

    let (report, interactor) = match ctx.grader.interactor() {
        Some(interactor_cmd) => {
            env.grant(&in_path, Access::Read, Some(SandboxRole::Judge));
            env.grant(&out_path, Access::Write, Some(SandboxRole::Judge));
            let err_path = env.path("interr.txt");
            env.touch(&err_path)?;
            env.grant(&err_path, Access::Write, Some(SandboxRole::Judge));
            let mut interactor_cmd = interactor_cmd.to_vec();
            interactor_cmd.extend([in_path.to_string(), out_path.to_string()]);
            let reports = env
                .interact_run(InteractSpec {
                    run: RunSpec {
                        stdin: None,
                        stdout: None,
                        ..spec(SandboxRole::Running)
                    },
                    interactor: interactor_cmd,
                    interactor_stderr: Some(&err_path),
                    interactor_role: SandboxRole::Judge,
                })
                .await?;
            let message = std::fs::read_to_string(err_path.host()).unwrap_or_default();
            (
                reports.result,
                Some(InteractorRun {
                    report: reports.interact_result,
                    message,
                }),
            )
        }
        None => {
            env.grant(&in_path, Access::Read, Some(SandboxRole::Running));
            env.grant(&out_path, Access::Write, Some(SandboxRole::Running));
            let report = env.run(spec(SandboxRole::Running)).await?;
            (report, None)
        }
    };

    let time_ms = (report.cpu_time_ms as f64 - ctx.lang.base_time_ms).max(0.0).ceil() as u64;
    let mem_kb = ((report.memory_bytes as f64 - ctx.lang.base_memory_bytes).max(0.0) / 1024.0)
        .ceil() as u64;
    debug!(time_ms, mem_kb, result = report.result.as_str(), "case executed");

    if let Some(outcome) = classify_run(
        &report,
        interactor.as_ref(),
        ctx.tl_ms,
        ctx.ml_mb,
        ctx.top_score,
    ) {
        let time_ms = if outcome.verdict == Verdict::TLE {
            ctx.tl_ms
        } else {
            time_ms
        };
        return Ok(CaseOutcome {
            verdict: outcome.verdict,
            info: outcome.info,
            time_ms,
            mem_kb,
            score: outcome.score,
            has_output: false,
            user_output: None,
        });
    }

    let ans_path = env.send_rand_file(answer)?;
    let checked = {
        let _scope = env.widen(
            &[&ans_path, &in_path, &out_path],
            Access::Read,
            Some(SandboxRole::Judge),
        );
        ctx.grader
            .check(env, &in_path, &out_path, &ans_path, ctx.top_score)
            .await?
    };
    let user_output = read_truncated(&out_path.host())?;

    Ok(CaseOutcome {
        verdict: checked.verdict,
        info: checked.info,
        time_ms,
        mem_kb,
        score: checked.score,
        has_output: true,
        user_output: Some(user_output),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(result: RunOutcome, real_time_ms: u64, memory_bytes: u64, exit_code: i32, signal: i32) -> RunReport {
        RunReport {
            cpu_time_ms: real_time_ms,
            real_time_ms,
            memory_bytes,
            signal,
            exit_code,
            error: String::new(),
            result,
            error_id: 0,
            result_id: result.id(),
            judger_log: String::new(),
        }
    }

    fn verdict_of(r: &RunReport) -> Option<Verdict> {
        classify_run(r, None, 1000, 256, 100.0).map(|o| o.verdict)
    }

    #[test]
    fn test_time_threshold() {
        assert_eq!(verdict_of(&report(RunOutcome::AC, 949, 0, 0, 0)), None);
        assert_eq!(verdict_of(&report(RunOutcome::AC, 950, 0, 0, 0)), Some(Verdict::TLE));
        assert_eq!(verdict_of(&report(RunOutcome::AC, 1000, 0, 0, 0)), Some(Verdict::TLE));
        assert_eq!(verdict_of(&report(RunOutcome::TLE, 10, 0, 0, 0)), Some(Verdict::TLE));
    }

    #[test]
    fn test_memory_threshold() {
        let limit = 256 * 1024 * 1024;
        assert_eq!(verdict_of(&report(RunOutcome::AC, 1, limit - 1, 0, 0)), None);
        assert_eq!(verdict_of(&report(RunOutcome::AC, 1, limit, 0, 0)), Some(Verdict::MLE));
    }

    #[test]
    fn test_output_limit_and_runtime_errors() {
        assert_eq!(verdict_of(&report(RunOutcome::RE, 1, 0, 153, 0)), Some(Verdict::OLE));
        assert_eq!(verdict_of(&report(RunOutcome::OLE, 1, 0, 0, 0)), Some(Verdict::OLE));
        let segv = classify_run(&report(RunOutcome::RE, 1, 0, 139, 0), None, 1000, 256, 100.0).unwrap();
        assert_eq!(segv.verdict, Verdict::RE);
        assert_eq!(segv.info, "Segmentation fault");
        let seccomp = classify_run(&report(RunOutcome::RE, 1, 0, 0, 31), None, 1000, 256, 100.0).unwrap();
        assert_eq!(seccomp.info, "Violation of seccomp rules");
        assert_eq!(verdict_of(&report(RunOutcome::JE, 0, 0, 0, 0)), Some(Verdict::JE));
    }

    #[test]
    fn test_interactor_verdict_beats_solution_exit() {
        let interactor = InteractorRun {
            report: report(RunOutcome::RE, 1, 0, 2, 0),
            message: "wrong output format".to_string(),
        };
        let solution = report(RunOutcome::RE, 1, 0, 1, 0);
        let outcome = classify_run(&solution, Some(&interactor), 1000, 256, 100.0).unwrap();
        assert_eq!(outcome.verdict, Verdict::PE);
        assert_eq!(outcome.info, "wrong output format");
    }

    #[test]
    fn test_solution_timeout_beats_interactor() {
        let interactor = InteractorRun {
            report: report(RunOutcome::AC, 1, 0, 0, 0),
            message: String::new(),
        };
        let solution = report(RunOutcome::TLE, 3000, 0, 0, 9);
        let outcome = classify_run(&solution, Some(&interactor), 1000, 256, 100.0).unwrap();
        assert_eq!(outcome.verdict, Verdict::TLE);
    }

    #[test]
    fn test_gates() {
        assert_eq!(gate(true, false, true, false), Gate::PretestOnly);
        assert_eq!(gate(true, true, true, false), Gate::Run);
        assert_eq!(gate(false, false, false, false), Gate::Skip);
        assert_eq!(gate(false, false, true, true), Gate::Skip);
        assert_eq!(gate(false, false, true, false), Gate::Run);
    }
}
