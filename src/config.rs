use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

/// Configuration for the judging core daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub judge: JudgeConfig,
    pub sandbox: SandboxConfig,
    pub paths: PathsConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JudgeConfig {
    /// Number of concurrent grading workers.
    pub workers: usize,
    /// Seconds between contest period lifecycle passes.
    pub poll_interval_secs: u64,
    /// Persist intermediate results every this many cases.
    pub save_period: usize,
    /// Maximum incomplete submissions a user may have in flight.
    pub pending_limit: usize,
    /// Maximum source size in KB.
    pub max_code_kb: u64,
    /// Measure per-language startup overhead before serving.
    pub calibrate_languages: bool,
    /// Wall clock limit for compiler invocations.
    pub compile_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    pub url: String,
    /// Host directory that the sandbox executor mounts as `/sandbox`.
    pub root: PathBuf,
    pub init_timeout_secs: u64,
    /// Fixed shared token. When unset, one is negotiated and kept in `data/TOKEN`.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub data: PathBuf,
    pub langs: PathBuf,
    pub testlib: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

impl AppConfig {
    /// Defaults, then an optional settings file (`MIKAN_CONFIG`, default `Settings`),
    /// then `MIKAN__SECTION__KEY` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("MIKAN_CONFIG").unwrap_or_else(|_| "Settings".to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("judge.workers", 1)?
            .set_default("judge.poll_interval_secs", 5)?
            .set_default("judge.save_period", 3)?
            .set_default("judge.pending_limit", 1)?
            .set_default("judge.max_code_kb", 100)?
            .set_default("judge.calibrate_languages", false)?
            .set_default("judge.compile_timeout_secs", 30)?
            .set_default("sandbox.url", "http://localhost:9132")?
            .set_default("sandbox.root", "sandbox")?
            .set_default("sandbox.init_timeout_secs", 10)?
            .set_default("paths.data", "data")?
            .set_default("paths.langs", "langs")?
            .set_default("paths.testlib", "testlib/testlib.h")?
            .set_default("server.port", 8080)?
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("MIKAN").separator("__"))
            .build()?
            .try_deserialize()
    }
}

/// Configuration for the sandbox executor daemon.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxdConfig {
    pub port: u16,
    /// Host directory exposed to sandboxed programs as `/sandbox`.
    pub root: PathBuf,
    /// Wall clock limit as a multiple of the CPU time limit.
    pub wall_time_factor: u64,
    /// Captured standard output beyond this many bytes is an output limit breach.
    pub output_limit_bytes: u64,
}

impl SandboxdConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var("SANDBOXD_CONFIG").unwrap_or_else(|_| "Sandboxd".to_string());
        Config::builder()
            .set_default("port", 9132)?
            .set_default("root", "sandbox")?
            .set_default("wall_time_factor", 3)?
            .set_default("output_limit_bytes", 100 * 1024 * 1024)?
            .add_source(File::with_name(&path).required(false))
            .add_source(Environment::with_prefix("SANDBOXD").separator("__"))
            .build()?
            .try_deserialize()
    }
}
