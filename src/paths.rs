use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::client::Sandbox;
use crate::error::ClientError;
use crate::types::{
    CallRequest, CallResult, DEV_NULL, InteractJudgeRequest, InteractReport, JudgeRequest,
    RunReport, SandboxRole, SeccompRule,
};
use crate::utils::gen_random_id;

/// Where the executor exposes the shared sandbox root.
pub const SANDBOX_MOUNT: &str = "/sandbox";

/// A file inside a submission's working directory, addressable from both sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPath {
    root: PathBuf,
    dirname: String,
    inner: PathBuf,
}

impl SandboxPath {
    pub fn new(root: impl Into<PathBuf>, dirname: impl Into<String>, inner: impl AsRef<Path>) -> Self {
        Self {
            root: root.into(),
            dirname: dirname.into(),
            inner: inner.as_ref().to_path_buf(),
        }
    }

    /// Location on the host filesystem.
    pub fn host(&self) -> PathBuf {
        join_inner(self.root.join(&self.dirname), &self.inner)
    }

    /// Location as seen by sandboxed programs.
    pub fn sandboxed(&self) -> PathBuf {
        join_inner(Path::new(SANDBOX_MOUNT).join(&self.dirname), &self.inner)
    }

    pub fn inner(&self) -> &Path {
        &self.inner
    }

    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    pub fn file_name(&self) -> String {
        self.inner
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        self.inner
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn parent(&self) -> SandboxPath {
        let parent = self.inner.parent().unwrap_or_else(|| Path::new(""));
        SandboxPath::new(self.root.clone(), self.dirname.clone(), parent)
    }

    pub fn exists(&self) -> bool {
        self.host().exists()
    }
}

fn join_inner(base: PathBuf, inner: &Path) -> PathBuf {
    if inner.as_os_str().is_empty() {
        base
    } else {
        base.join(inner)
    }
}

impl fmt::Display for SandboxPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sandboxed().display())
    }
}

/// Permission capability applied to a sandbox path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Protected,
    Read,
    Write,
    Execute,
}

impl Access {
    /// Mode bits for the capability. Role-scoped grants open the group bits only.
    pub fn mode(self, scoped: bool) -> u32 {
        match (self, scoped) {
            (Access::Protected, _) => 0o700,
            (Access::Read, false) => 0o744,
            (Access::Write, false) => 0o766,
            (Access::Execute, false) => 0o755,
            (Access::Read, true) => 0o740,
            (Access::Write, true) => 0o760,
            (Access::Execute, true) => 0o750,
        }
    }
}

/// Parameters of one limited run.
pub struct RunSpec<'a> {
    pub cmd: Vec<String>,
    pub tl_ms: u64,
    pub ml_mb: u64,
    pub stdin: Option<&'a SandboxPath>,
    pub stdout: Option<&'a SandboxPath>,
    pub stderr: Option<&'a SandboxPath>,
    pub seccomp: Option<SeccompRule>,
    pub role: SandboxRole,
}

/// A limited run of a solution talking to an interactor over crossed pipes.
pub struct InteractSpec<'a> {
    pub run: RunSpec<'a>,
    pub interactor: Vec<String>,
    pub interactor_stderr: Option<&'a SandboxPath>,
    pub interactor_role: SandboxRole,
}

/// Private working directory of one grading, torn down on drop.
///
/// Permission changes are queued and ride along with the next request to the
/// executor, which applies them as root before running anything.
pub struct Environment {
    sandbox: Arc<dyn Sandbox>,
    root: PathBuf,
    dirname: String,
    pending: Mutex<Vec<Vec<String>>>,
}

impl Environment {
    pub fn create(root: &Path, sandbox: Arc<dyn Sandbox>) -> io::Result<Self> {
        let dirname = gen_random_id(16);
        let dir = root.join(&dirname);
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o777))?;
        Ok(Self {
            sandbox,
            root: root.to_path_buf(),
            dirname,
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn dirname(&self) -> &str {
        &self.dirname
    }

    pub fn path(&self, inner: impl AsRef<Path>) -> SandboxPath {
        SandboxPath::new(self.root.clone(), self.dirname.clone(), inner)
    }

    pub fn cwd(&self) -> SandboxPath {
        self.path("")
    }

    fn queue(&self, cmd: Vec<String>) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(cmd);
    }

    fn take_pending(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Commands queued but not yet delivered to the executor.
    pub fn pending(&self) -> Vec<Vec<String>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Queues a permission change. `role` restricts the grant to that role's group.
    pub fn grant(&self, path: &SandboxPath, access: Access, role: Option<SandboxRole>) {
        let target = path.sandboxed().to_string_lossy().into_owned();
        if let Some(role) = role {
            self.queue(vec![
                "chgrp".to_string(),
                role.id().to_string(),
                target.clone(),
            ]);
        }
        self.queue(vec![
            "chmod".to_string(),
            format!("{:o}", access.mode(role.is_some())),
            target,
        ]);
    }

    pub fn protect(&self, path: &SandboxPath) {
        self.grant(path, Access::Protected, None);
    }

    /// Widens access to `paths` until the returned guard drops.
    pub fn widen<'a>(
        &'a self,
        paths: &[&SandboxPath],
        access: Access,
        role: Option<SandboxRole>,
    ) -> PermissionScope<'a> {
        for path in paths {
            self.grant(path, access, role);
        }
        PermissionScope {
            env: self,
            paths: paths.iter().map(|p| (*p).clone()).collect(),
        }
    }

    /// Copies a host file in under its own name, protected.
    pub fn send_file(&self, src: &Path) -> io::Result<SandboxPath> {
        let name = src
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?
            .to_string_lossy()
            .into_owned();
        self.send_file_as(src, &name)
    }

    pub fn send_file_as(&self, src: &Path, name: &str) -> io::Result<SandboxPath> {
        let dest = self.path(name);
        if let Some(parent) = dest.host().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dest.host())?;
        self.protect(&dest);
        Ok(dest)
    }

    /// Copies a host file in under a random name that keeps the extension.
    pub fn send_rand_file(&self, src: &Path) -> io::Result<SandboxPath> {
        let ext = src
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        self.send_file_as(src, &format!("{}{}", gen_random_id(12), ext))
    }

    /// Creates an empty protected file with a random name.
    pub fn create_rand_file(&self, ext: &str) -> io::Result<SandboxPath> {
        let path = self.path(format!("{}{}", gen_random_id(12), ext));
        fs::File::create(path.host())?;
        self.protect(&path);
        Ok(path)
    }

    /// Ensures `path` exists as an empty file.
    pub fn touch(&self, path: &SandboxPath) -> io::Result<()> {
        if let Some(parent) = path.host().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.host())?;
        Ok(())
    }

    /// Moves a nested file to the top of the working directory.
    pub fn simple_path(&self, path: &SandboxPath) -> io::Result<SandboxPath> {
        if path.inner().components().count() <= 1 {
            return Ok(path.clone());
        }
        let dest = self.path(path.file_name());
        fs::rename(path.host(), dest.host())?;
        Ok(dest)
    }

    /// Copies a file out of the working directory.
    pub fn get_file(&self, path: &SandboxPath, dest: &Path) -> io::Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(path.host(), dest)?;
        Ok(())
    }

    pub async fn call(
        &self,
        cmd: Vec<String>,
        role: SandboxRole,
        stdin: &str,
        timeout: Option<f64>,
    ) -> Result<CallResult, ClientError> {
        let req = CallRequest {
            cmd,
            user: role,
            stdin: stdin.to_string(),
            timeout,
            cwd: Some(self.cwd().to_string()),
            cmds: self.take_pending(),
        };
        self.sandbox.call(req).await
    }

    pub async fn run(&self, spec: RunSpec<'_>) -> Result<RunReport, ClientError> {
        let req = JudgeRequest {
            cmd: spec.cmd,
            tl: spec.tl_ms,
            ml: spec.ml_mb,
            in_file: sandbox_or_null(spec.stdin),
            out_file: sandbox_or_null(spec.stdout),
            err_file: sandbox_or_null(spec.stderr),
            seccomp_rule: spec.seccomp,
            uid: spec.role.id(),
            cwd: Some(self.cwd().to_string()),
            cmds: self.take_pending(),
        };
        self.sandbox.judge(req).await
    }

    pub async fn interact_run(&self, spec: InteractSpec<'_>) -> Result<InteractReport, ClientError> {
        let run = spec.run;
        let req = InteractJudgeRequest {
            cmd: run.cmd,
            interact_cmd: spec.interactor,
            tl: run.tl_ms,
            ml: run.ml_mb,
            in_file: sandbox_or_null(run.stdin),
            out_file: sandbox_or_null(run.stdout),
            err_file: sandbox_or_null(run.stderr),
            interact_err_file: sandbox_or_null(spec.interactor_stderr),
            seccomp_rule: run.seccomp,
            uid: run.role.id(),
            interact_uid: spec.interactor_role.id(),
            cwd: Some(self.cwd().to_string()),
            cmds: self.take_pending(),
        };
        self.sandbox.interact_judge(req).await
    }
}

impl SandboxPath {
    pub fn join(&self, name: impl AsRef<Path>) -> SandboxPath {
        SandboxPath::new(self.root.clone(), self.dirname.clone(), self.inner.join(name))
    }
}

fn sandbox_or_null(path: Option<&SandboxPath>) -> String {
    path.map(|p| p.to_string())
        .unwrap_or_else(|| DEV_NULL.to_string())
}

impl Drop for Environment {
    fn drop(&mut self) {
        let dir = self.root.join(&self.dirname);
        if let Err(e) = fs::remove_dir_all(&dir) {
            warn!(dir = %dir.display(), "failed to remove sandbox directory: {}", e);
        }
    }
}

/// Re-protects widened paths when dropped.
pub struct PermissionScope<'a> {
    env: &'a Environment,
    paths: Vec<SandboxPath>,
}

impl Drop for PermissionScope<'_> {
    fn drop(&mut self) {
        for path in &self.paths {
            self.env.protect(path);
        }
    }
}
