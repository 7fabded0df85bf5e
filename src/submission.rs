use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::verdict::Verdict;

/// Problem id reserved for free-form custom runs.
pub const TEST_PROBLEM: &str = "test";
/// Input and output file names of a custom run, beside the source.
pub const TEST_INPUT: &str = "in.txt";
pub const TEST_OUTPUT: &str = "out.txt";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    #[default]
    Pending,
    Compiling,
    RunningCases,
    Judged,
    #[serde(rename = "JE")]
    JudgeError,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "PENDING",
            SubmissionStatus::Compiling => "COMPILING",
            SubmissionStatus::RunningCases => "RUNNING_CASES",
            SubmissionStatus::Judged => "JUDGED",
            SubmissionStatus::JudgeError => "JE",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaseResult {
    pub time_ms: u64,
    pub mem_kb: u64,
    pub result: Verdict,
    pub info: String,
    pub has_output: bool,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<bool>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    /// What the program printed.
    #[serde(rename = "out", default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ans: Option<String>,
}

impl CaseResult {
    pub fn pending() -> Self {
        Self {
            time_ms: 0,
            mem_kb: 0,
            result: Verdict::PENDING,
            info: "Waiting for judge".to_string(),
            has_output: false,
            score: 0.0,
            sample: None,
            input: None,
            output: None,
            ans: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupResult {
    pub result: Verdict,
    pub time: u64,
    pub mem: u64,
    pub gainscore: f64,
}

/// Structured verdict persisted with a submission.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SubmissionResult {
    #[serde(rename = "CE", default)]
    pub ce: bool,
    #[serde(default)]
    pub results: Vec<CaseResult>,
    #[serde(default)]
    pub group_results: BTreeMap<String, GroupResult>,
    #[serde(default)]
    pub total_score: f64,
    #[serde(default)]
    pub protected: bool,
    #[serde(default)]
    pub simple_result: String,
    #[serde(rename = "JE", default, skip_serializing_if = "Option::is_none")]
    pub je: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_uuid: Option<String>,
}

/// One judging unit, stored as `submissions/<id>/submission.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: u64,
    pub user: String,
    pub problem_id: String,
    pub language: String,
    /// Source file name inside the submission directory.
    pub source: String,
    #[serde(default)]
    pub contest_id: Option<String>,
    #[serde(default)]
    pub period_id: Option<u64>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub status: SubmissionStatus,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub simple_result: String,
    #[serde(default)]
    pub result: SubmissionResult,
    #[serde(default)]
    pub ce_message: String,
    #[serde(default)]
    pub queue_position: u64,
    #[serde(default)]
    pub just_pretest: bool,
}

impl Submission {
    pub fn is_custom_test(&self) -> bool {
        self.problem_id == TEST_PROBLEM
    }

    /// Completed with a compile error or a judge error.
    pub fn is_ce_or_je(&self) -> bool {
        self.result.ce || self.result.je == Some(true)
    }

    /// Throws away the score while keeping the per-case details.
    pub fn zero_out(&mut self) {
        self.simple_result = "ignored".to_string();
        self.result.simple_result = "ignored".to_string();
        self.result.total_score = 0.0;
        for group in self.result.group_results.values_mut() {
            group.gainscore = 0.0;
        }
    }

    /// Marks the submission as a judge error with a log artifact id.
    pub fn mark_judge_error(&mut self, log_id: &str) {
        self.result.je = Some(true);
        self.result.log_uuid = Some(log_id.to_string());
        self.result.simple_result = "JE".to_string();
        self.simple_result = "JE".to_string();
        self.status = SubmissionStatus::JudgeError;
        self.completed = true;
    }
}
