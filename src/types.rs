use serde::{Deserialize, Serialize};
use std::fmt;

/// Return code the sandbox reports for a `/call` that ran out of time.
pub const CALL_TIMEOUT_CODE: i32 = 777777;

pub const DEV_NULL: &str = "/dev/null";

fn dev_null() -> String {
    DEV_NULL.to_string()
}

/// Syscall filter family applied to a judged program.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SeccompRule {
    CCpp,
    CCppFileIo,
    #[default]
    General,
    Golang,
    Node,
    None,
}

/// Well-known sandbox users. The numeric value is both the uid and the gid.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRole {
    Root,
    Judge,
    Compile,
    Running,
    Nobody,
}

impl SandboxRole {
    pub fn id(self) -> u32 {
        match self {
            SandboxRole::Root => 0,
            SandboxRole::Judge => 1500,
            SandboxRole::Compile => 1600,
            SandboxRole::Running => 1700,
            SandboxRole::Nobody => 65534,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxRole::Root => "root",
            SandboxRole::Judge => "judge",
            SandboxRole::Compile => "compile",
            SandboxRole::Running => "running",
            SandboxRole::Nobody => "nobody",
        }
    }
}

impl fmt::Display for SandboxRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InitOp {
    Init,
    Check,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InitRequest {
    pub token: String,
    pub op: InitOp,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CallRequest {
    pub cmd: Vec<String>,
    pub user: SandboxRole,
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub timeout: Option<f64>, // in seconds
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cmds: Vec<Vec<String>>, // permission commands to run as root first
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CallResult {
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
}

impl CallResult {
    pub fn timed_out() -> Self {
        Self {
            stdout: "TLE".to_string(),
            stderr: "TLE".to_string(),
            return_code: CALL_TIMEOUT_CODE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.return_code == CALL_TIMEOUT_CODE && self.stdout == "TLE" && self.stderr == "TLE"
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JudgeRequest {
    pub cmd: Vec<String>,
    pub tl: u64, // in milliseconds
    pub ml: u64, // in megabytes
    #[serde(default = "dev_null")]
    pub in_file: String,
    #[serde(default = "dev_null")]
    pub out_file: String,
    #[serde(default = "dev_null")]
    pub err_file: String,
    #[serde(default, alias = "seccomp_rule_name")]
    pub seccomp_rule: Option<SeccompRule>,
    pub uid: u32,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cmds: Vec<Vec<String>>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct InteractJudgeRequest {
    pub cmd: Vec<String>,
    pub interact_cmd: Vec<String>,
    pub tl: u64,
    pub ml: u64,
    #[serde(default = "dev_null")]
    pub in_file: String,
    #[serde(default = "dev_null")]
    pub out_file: String,
    #[serde(default = "dev_null")]
    pub err_file: String,
    #[serde(default = "dev_null")]
    pub interact_err_file: String,
    #[serde(default, alias = "seccomp_rule_name")]
    pub seccomp_rule: Option<SeccompRule>,
    pub uid: u32,
    pub interact_uid: u32,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub cmds: Vec<Vec<String>>,
}

/// Normalized classification of one sandboxed run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    AC,
    TLE,
    MLE,
    OLE,
    RE,
    JE,
}

impl RunOutcome {
    pub fn id(self) -> i32 {
        match self {
            RunOutcome::AC => 0,
            RunOutcome::TLE => 1,
            RunOutcome::MLE => 2,
            RunOutcome::OLE => 3,
            RunOutcome::RE => 4,
            RunOutcome::JE => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunOutcome::AC => "AC",
            RunOutcome::TLE => "TLE",
            RunOutcome::MLE => "MLE",
            RunOutcome::OLE => "OLE",
            RunOutcome::RE => "RE",
            RunOutcome::JE => "JE",
        }
    }
}

/// Internal failure codes carried in `RunReport::error_id`.
pub mod error_id {
    pub const SUCCESS: i32 = 0;
    pub const INVALID_REQUEST: i32 = -1;
    pub const SPAWN_FAILED: i32 = -2;
    pub const WAIT_FAILED: i32 = -3;
    pub const IO_FAILED: i32 = -4;
    pub const NO_RUSAGE: i32 = -5;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunReport {
    pub cpu_time_ms: u64,
    pub real_time_ms: u64,
    pub memory_bytes: u64,
    pub signal: i32,
    pub exit_code: i32,
    pub error: String,
    pub result: RunOutcome,
    pub error_id: i32,
    pub result_id: i32,
    #[serde(default)]
    pub judger_log: String,
}

impl RunReport {
    pub fn system_error(error_id: i32, error: impl Into<String>) -> Self {
        Self {
            cpu_time_ms: 0,
            real_time_ms: 0,
            memory_bytes: 0,
            signal: 0,
            exit_code: 0,
            error: error.into(),
            result: RunOutcome::JE,
            error_id,
            result_id: RunOutcome::JE.id(),
            judger_log: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InteractReport {
    pub result: RunReport,
    pub interact_result: RunReport,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn judge_request_defaults_files_to_dev_null() {
        let req: JudgeRequest = serde_json::from_str(
            r#"{"cmd":["/sandbox/x/a"],"tl":1000,"ml":256,"uid":1700,"seccomp_rule_name":"c_cpp"}"#,
        )
        .unwrap();
        assert_eq!(req.in_file, DEV_NULL);
        assert_eq!(req.out_file, DEV_NULL);
        assert_eq!(req.err_file, DEV_NULL);
        assert_eq!(req.seccomp_rule, Some(SeccompRule::CCpp));
        assert!(req.cmds.is_empty());
    }

    #[test]
    fn seccomp_rule_names_match_wire_format() {
        assert_eq!(
            serde_json::to_string(&SeccompRule::CCppFileIo).unwrap(),
            "\"c_cpp_file_io\""
        );
        assert_eq!(serde_json::to_string(&SandboxRole::Compile).unwrap(), "\"compile\"");
    }

    #[test]
    fn timeout_sentinel_is_recognised() {
        assert!(CallResult::timed_out().is_timeout());
        let normal = CallResult {
            stdout: "TLE".into(),
            stderr: "TLE".into(),
            return_code: 0,
        };
        assert!(!normal.is_timeout());
    }
}
