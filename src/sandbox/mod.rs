//! The privileged sandbox executor: runs judged programs in hakoniwa
//! containers and helper commands on the host, behind a token.

pub mod classify;
pub mod executor;
pub mod seccomp;

use metrics_exporter_prometheus::PrometheusHandle;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use self::executor::Executor;
use crate::config::SandboxdConfig;
use crate::error::SandboxError;
use crate::paths::SANDBOX_MOUNT;

/// Maps in-sandbox paths (`/sandbox/...`) to the host directory behind them.
#[derive(Debug, Clone)]
pub struct SandboxMount {
    root: PathBuf,
}

impl SandboxMount {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn strip(path: &str) -> Option<&str> {
        let rest = path.strip_prefix(SANDBOX_MOUNT)?;
        if rest.is_empty() {
            Some("")
        } else {
            rest.strip_prefix('/')
        }
    }

    pub fn is_inside(path: &str) -> bool {
        Self::strip(path).is_some_and(|rest| !rest.split('/').any(|part| part == ".."))
    }

    /// Host form of `path`. Paths outside the mount are returned unchanged.
    pub fn host(&self, path: &str) -> PathBuf {
        match Self::strip(path) {
            Some("") => self.root.clone(),
            Some(rest) => self.root.join(rest),
            None => PathBuf::from(path),
        }
    }

    /// Host form of an argument, for commands that run outside the container.
    pub fn host_arg(&self, arg: &str) -> String {
        if Self::strip(arg).is_some() {
            self.host(arg).to_string_lossy().into_owned()
        } else {
            arg.to_string()
        }
    }
}

/// Shared state of the executor's HTTP surface.
#[derive(Clone)]
pub struct SandboxState {
    pub config: Arc<SandboxdConfig>,
    pub executor: Arc<Executor>,
    /// Token bound by the judging core, if any.
    pub token: Arc<RwLock<Option<String>>>,
    pub prometheus_handle: PrometheusHandle,
}

impl SandboxState {
    pub fn new(config: SandboxdConfig, prometheus_handle: PrometheusHandle) -> Self {
        let executor = Executor::new(&config);
        Self {
            config: Arc::new(config),
            executor: Arc::new(executor),
            token: Arc::new(RwLock::new(None)),
            prometheus_handle,
        }
    }

    pub fn current_token(&self) -> Option<String> {
        self.token.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Binds `token` if none is bound yet. Returns whether it was bound.
    pub fn bind_token(&self, token: &str) -> bool {
        let mut bound = self.token.write().unwrap_or_else(|e| e.into_inner());
        if bound.is_some() {
            return false;
        }
        *bound = Some(token.to_string());
        true
    }
}

const PERMISSION_COMMANDS: &[&str] = &["chmod", "chgrp", "chown"];

/// Checks a queued permission command: an allowed program, then mode or
/// owner, then targets inside the mount.
pub fn validate_command(cmd: &[String]) -> Result<(), SandboxError> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(SandboxError::CommandRejected("empty command".to_string()));
    };
    if !PERMISSION_COMMANDS.contains(&program.as_str()) {
        return Err(SandboxError::CommandRejected(program.clone()));
    }
    let Some((_, targets)) = args.split_first() else {
        return Err(SandboxError::CommandRejected(cmd.join(" ")));
    };
    if targets.is_empty() || !targets.iter().all(|t| SandboxMount::is_inside(t)) {
        return Err(SandboxError::CommandRejected(cmd.join(" ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mount_translation() {
        let mount = SandboxMount::new("/srv/box");
        assert_eq!(mount.host("/sandbox/d1/a.cpp"), PathBuf::from("/srv/box/d1/a.cpp"));
        assert_eq!(mount.host("/sandbox"), PathBuf::from("/srv/box"));
        assert_eq!(mount.host("/dev/null"), PathBuf::from("/dev/null"));
        assert_eq!(mount.host_arg("-O2"), "-O2");
        assert_eq!(mount.host_arg("/sandboxed"), "/sandboxed");
    }

    #[test]
    fn test_permission_commands() {
        assert!(validate_command(&cmd(&["chmod", "740", "/sandbox/d1/x"])).is_ok());
        assert!(validate_command(&cmd(&["chgrp", "1500", "/sandbox/d1/x"])).is_ok());
        assert!(validate_command(&cmd(&["rm", "-rf", "/sandbox/d1"])).is_err());
        assert!(validate_command(&cmd(&["chmod", "777", "/etc/passwd"])).is_err());
        assert!(validate_command(&cmd(&["chmod", "777", "/sandbox/../etc"])).is_err());
        assert!(validate_command(&cmd(&["chmod", "777"])).is_err());
        assert!(validate_command(&[]).is_err());
    }
}
