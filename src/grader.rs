//! Checker and interactor staging plus the testlib verdict protocol.

use std::path::Path;
use tracing::{debug, warn};

use crate::error::{JudgeError, ProblemError};
use crate::language::LanguageRegistry;
use crate::paths::{Access, Environment, SandboxPath};
use crate::problem::{ProblemInfo, ProgramRef};
use crate::types::SandboxRole;
use crate::verdict::Verdict;

pub const CHECKER_TIMEOUT_SECS: f64 = 30.0;

/// testlib exit codes
mod testlib_exit_codes {
    pub const OK: i32 = 0;
    pub const WRONG_ANSWER: i32 = 1;
    pub const PRESENTATION_ERROR: i32 = 2;
    pub const FAIL: i32 = 3;
    pub const DIRT: i32 = 4;
    pub const POINTS: i32 = 7;
}

const PARTIALLY_CORRECT: &str = "partially correct";

#[derive(Debug, Clone, PartialEq)]
pub struct CheckOutcome {
    pub verdict: Verdict,
    pub score: f64,
    pub info: String,
}

fn scored(score: f64, top_score: f64, info: String) -> CheckOutcome {
    let score = score.clamp(0.0, top_score);
    CheckOutcome {
        verdict: if score >= top_score {
            Verdict::OK
        } else {
            Verdict::PARTIAL
        },
        score,
        info,
    }
}

fn flat(verdict: Verdict, score: f64, info: String) -> CheckOutcome {
    CheckOutcome {
        verdict,
        score,
        info,
    }
}

/// Maps a checker's (or interactor's) exit code and message to a case verdict.
///
/// A message starting with `partially correct X` always wins: `X <= 1` is a
/// fraction of `top_score`, anything larger is an absolute score.
pub fn interpret(return_code: i32, stdout: &str, stderr: &str, top_score: f64) -> CheckOutcome {
    let message = if stderr.trim().is_empty() { stdout } else { stderr };
    let info = message.to_string();
    let trimmed = message.trim_start();

    if let Some(rest) = trimmed.strip_prefix(PARTIALLY_CORRECT) {
        let value = rest
            .split_whitespace()
            .next()
            .and_then(|t| t.parse::<f64>().ok())
            .unwrap_or(0.0);
        let score = if value <= 1.0 { value * top_score } else { value };
        return scored(score, top_score, info);
    }

    match return_code {
        testlib_exit_codes::OK => flat(Verdict::OK, top_score, info),
        testlib_exit_codes::WRONG_ANSWER => flat(Verdict::WA, 0.0, info),
        testlib_exit_codes::PRESENTATION_ERROR | testlib_exit_codes::DIRT => {
            flat(Verdict::PE, 0.0, info)
        }
        testlib_exit_codes::FAIL => flat(Verdict::FAIL, 0.0, info),
        testlib_exit_codes::POINTS => {
            let score = trimmed
                .split_whitespace()
                .nth(1)
                .and_then(|t| t.parse::<f64>().ok())
                .unwrap_or(0.0);
            scored(score, top_score, info)
        }
        other => {
            warn!("unknown checker exit code: {}", other);
            flat(Verdict::FAIL, 0.0, info)
        }
    }
}

/// Compiled checker and, for interactive problems, interactor of one grading.
#[derive(Debug, Clone)]
pub struct Grader {
    checker: Vec<String>,
    interactor: Option<Vec<String>>,
}

impl Grader {
    pub fn new(checker: Vec<String>, interactor: Option<Vec<String>>) -> Self {
        Self {
            checker,
            interactor,
        }
    }

    /// Stages and compiles the problem's checker (and interactor) inside `env`,
    /// restricted to the judge role.
    pub async fn prepare(
        problem: &ProblemInfo,
        problem_dir: &Path,
        env: &Environment,
        languages: &LanguageRegistry,
        testlib: &Path,
        compile_timeout_secs: f64,
    ) -> Result<Self, JudgeError> {
        let checker_ref = problem.checker.as_ref().ok_or(ProblemError::MissingChecker)?;
        let checker = stage_program(
            "checker",
            checker_ref,
            problem_dir,
            env,
            languages,
            testlib,
            compile_timeout_secs,
        )
        .await?;
        let interactor = if problem.is_interact {
            let interactor_ref = problem
                .interactor
                .as_ref()
                .ok_or(ProblemError::MissingInteractor)?;
            Some(
                stage_program(
                    "interactor",
                    interactor_ref,
                    problem_dir,
                    env,
                    languages,
                    testlib,
                    compile_timeout_secs,
                )
                .await?,
            )
        } else {
            None
        };
        Ok(Self {
            checker,
            interactor,
        })
    }

    pub fn interactor(&self) -> Option<&[String]> {
        self.interactor.as_deref()
    }

    /// Runs the checker as the judge role. A checker timeout is FAIL.
    pub async fn check(
        &self,
        env: &Environment,
        input: &SandboxPath,
        output: &SandboxPath,
        answer: &SandboxPath,
        top_score: f64,
    ) -> Result<CheckOutcome, JudgeError> {
        let mut cmd = self.checker.clone();
        cmd.extend([input.to_string(), output.to_string(), answer.to_string()]);
        let out = env
            .call(cmd, SandboxRole::Judge, "", Some(CHECKER_TIMEOUT_SECS))
            .await?;
        if out.is_timeout() {
            return Ok(flat(Verdict::FAIL, 0.0, "Checker timed out".to_string()));
        }
        debug!(return_code = out.return_code, "checker finished");
        Ok(interpret(out.return_code, &out.stdout, &out.stderr, top_score))
    }
}

async fn stage_program(
    what: &str,
    program: &ProgramRef,
    problem_dir: &Path,
    env: &Environment,
    languages: &LanguageRegistry,
    testlib: &Path,
    compile_timeout_secs: f64,
) -> Result<Vec<String>, JudgeError> {
    let lang = languages
        .get(program.lang())
        .ok_or_else(|| JudgeError::UnknownLanguage(program.lang().to_string()))?;
    let source = env.send_file(&problem_dir.join(program.file()))?;
    let header = env.path("testlib.h");
    if testlib.exists() && !header.exists() {
        let header = env.send_file_as(testlib, "testlib.h")?;
        env.grant(&header, Access::Read, Some(SandboxRole::Compile));
    }
    let (exec, ce) = lang.compile(&source, env, None, compile_timeout_secs).await?;
    if !ce.is_empty() {
        return Err(JudgeError::Checker(format!("{} failed to compile: {}", what, ce)));
    }
    env.grant(&exec, Access::Execute, Some(SandboxRole::Judge));
    Ok(lang.get_execmd(&exec)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_table() {
        assert_eq!(interpret(0, "", "ok 3 numbers", 100.0).verdict, Verdict::OK);
        assert_eq!(interpret(0, "", "ok", 100.0).score, 100.0);
        assert_eq!(interpret(1, "", "wrong answer", 100.0).verdict, Verdict::WA);
        assert_eq!(interpret(2, "", "", 100.0).verdict, Verdict::PE);
        assert_eq!(interpret(3, "", "", 100.0).verdict, Verdict::FAIL);
        assert_eq!(interpret(4, "", "", 100.0).verdict, Verdict::PE);
        assert_eq!(interpret(42, "", "", 100.0).verdict, Verdict::FAIL);
    }

    #[test]
    fn test_partially_correct_fraction_from_stdout() {
        let outcome = interpret(0, "partially correct 0.5", "", 100.0);
        assert_eq!(outcome.verdict, Verdict::PARTIAL);
        assert_eq!(outcome.score, 50.0);
    }

    #[test]
    fn test_partially_correct_absolute_score() {
        let outcome = interpret(7, "", "partially correct 30 of 100", 100.0);
        assert_eq!(outcome.verdict, Verdict::PARTIAL);
        assert_eq!(outcome.score, 30.0);
        let full = interpret(7, "", "partially correct 1", 100.0);
        assert_eq!(full.verdict, Verdict::OK);
    }

    #[test]
    fn test_points_exit_code() {
        let outcome = interpret(7, "", "points 37.5", 100.0);
        assert_eq!(outcome.verdict, Verdict::PARTIAL);
        assert_eq!(outcome.score, 37.5);
        let capped = interpret(7, "", "points 250", 100.0);
        assert_eq!(capped.verdict, Verdict::OK);
        assert_eq!(capped.score, 100.0);
    }
}
