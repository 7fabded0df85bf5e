use crate::types::{RunOutcome, RunReport, error_id};

/// SIGXFSZ shows up as 128 + 25 when a program hits the file size limit.
const FILE_SIZE_EXIT: i32 = 153;

/// Raw measurements of one finished process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Measured {
    pub cpu_time_ms: u64,
    pub real_time_ms: u64,
    pub memory_bytes: u64,
    /// Exit status, or 128 + signal for killed processes.
    pub exit_code: i32,
    pub signal: i32,
    pub output_bytes: u64,
    /// The wall clock limit fired.
    pub timed_out: bool,
}

/// Limits a run is measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub tl_ms: u64,
    pub ml_mb: u64,
    pub output_bytes: u64,
}

pub fn classify(m: &Measured, limits: &Limits) -> RunOutcome {
    if m.timed_out || m.real_time_ms >= limits.tl_ms || m.cpu_time_ms > limits.tl_ms {
        RunOutcome::TLE
    } else if m.memory_bytes > limits.ml_mb * 1024 * 1024 {
        RunOutcome::MLE
    } else if m.output_bytes > limits.output_bytes || m.exit_code == FILE_SIZE_EXIT {
        RunOutcome::OLE
    } else if m.exit_code != 0 || m.signal != 0 {
        RunOutcome::RE
    } else {
        RunOutcome::AC
    }
}

/// Splits a status code into exit code and terminating signal.
pub fn split_status(code: i32) -> (i32, i32) {
    if code > 128 && code <= 128 + 64 {
        (code, code - 128)
    } else {
        (code, 0)
    }
}

pub fn report(m: &Measured, limits: &Limits, judger_log: String) -> RunReport {
    let result = classify(m, limits);
    RunReport {
        cpu_time_ms: m.cpu_time_ms,
        real_time_ms: m.real_time_ms,
        memory_bytes: m.memory_bytes,
        signal: m.signal,
        exit_code: m.exit_code,
        error: String::new(),
        result,
        error_id: error_id::SUCCESS,
        result_id: result.id(),
        judger_log,
    }
}
