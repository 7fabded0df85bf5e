use hakoniwa::{Container, ExitStatus, Namespace, Rlimit, Runctl, Stdio};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::Stdio as HostStdio;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::classify::{self, Limits, Measured};
use super::seccomp;
use super::{SandboxMount, validate_command};
use crate::config::SandboxdConfig;
use crate::error::SandboxError;
use crate::paths::SANDBOX_MOUNT;
use crate::types::{
    CallRequest, CallResult, InteractJudgeRequest, InteractReport, JudgeRequest, RunReport,
    SeccompRule, error_id,
};

const PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const MIB: u64 = 1024 * 1024;

/// One program to start inside a container.
struct Job<'a> {
    cmd: &'a [String],
    cwd: Option<&'a str>,
    uid: u32,
    tl_ms: u64,
    ml_mb: u64,
    rule: SeccompRule,
}

pub struct Executor {
    mount: SandboxMount,
    wall_time_factor: u64,
    output_limit: u64,
}

impl Executor {
    pub fn new(config: &SandboxdConfig) -> Self {
        Self {
            mount: SandboxMount::new(config.root.clone()),
            wall_time_factor: config.wall_time_factor.max(1),
            output_limit: config.output_limit_bytes,
        }
    }

    /// Runs queued permission commands as root, outside any container.
    pub async fn run_commands(&self, cmds: &[Vec<String>]) -> Result<(), SandboxError> {
        for cmd in cmds {
            validate_command(cmd)?;
            let args: Vec<String> = cmd[1..].iter().map(|a| self.mount.host_arg(a)).collect();
            let status = Command::new(&cmd[0]).args(&args).status().await?;
            if !status.success() {
                return Err(SandboxError::CommandFailed(cmd.join(" ")));
            }
        }
        Ok(())
    }

    /// Runs a helper command on the host as the requested role.
    pub async fn call(&self, req: CallRequest) -> Result<CallResult, SandboxError> {
        self.run_commands(&req.cmds).await?;
        let Some((program, args)) = req.cmd.split_first() else {
            return Err(SandboxError::InvalidRequest("empty command".to_string()));
        };
        let id = req.user.id();
        let mut command = Command::new(self.mount.host_arg(program));
        command
            .args(args.iter().map(|a| self.mount.host_arg(a)))
            .uid(id)
            .gid(id)
            .stdin(HostStdio::piped())
            .stdout(HostStdio::piped())
            .stderr(HostStdio::piped())
            .kill_on_drop(true);
        match &req.cwd {
            Some(cwd) => command.current_dir(self.mount.host(cwd)),
            None => command.current_dir(self.mount.root()),
        };

        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let input = req.stdin.into_bytes();
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
            });
        }
        let output = child.wait_with_output();
        let output = match req.timeout {
            Some(secs) if secs > 0.0 => {
                match tokio::time::timeout(Duration::from_secs_f64(secs), output).await {
                    Ok(output) => output?,
                    Err(_) => {
                        debug!(cmd = %req.cmd.join(" "), "call timed out");
                        return Ok(CallResult::timed_out());
                    }
                }
            }
            _ => output.await?,
        };
        let return_code = output
            .status
            .code()
            .unwrap_or_else(|| 128 + output.status.signal().unwrap_or(0));
        Ok(CallResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            return_code,
        })
    }

    fn container(&self, job: &Job) -> Result<Container, String> {
        let mut container = Container::new();
        container
            .unshare(Namespace::Cgroup)
            .unshare(Namespace::Ipc)
            .unshare(Namespace::Uts)
            .unshare(Namespace::Network);
        container
            .rootfs("/")
            .map_err(|e| format!("unable to mount root fs: {}", e))?;
        container.bindmount_rw(&self.mount.root().to_string_lossy(), SANDBOX_MOUNT);
        container.runctl(Runctl::GetProcPidStatus);
        // Identity maps keep the role's file permissions meaningful on the mount.
        container.uidmaps(&[(job.uid, job.uid, 1)]);
        container.gidmaps(&[(job.uid, job.uid, 1)]);

        let cpu_secs = job.tl_ms.div_ceil(1000) + 1;
        container.setrlimit(Rlimit::Cpu, cpu_secs, cpu_secs);
        if matches!(job.rule, SeccompRule::CCpp | SeccompRule::CCppFileIo) {
            let bytes = job.ml_mb * MIB * 2;
            container.setrlimit(Rlimit::As, bytes, bytes);
        }
        container.setrlimit(Rlimit::Fsize, self.output_limit, self.output_limit);
        if let Some(filter) = seccomp::filter_for(job.rule) {
            container.seccomp_filter(filter);
        }
        Ok(container)
    }

    fn wall_limit(&self, tl_ms: u64) -> Duration {
        Duration::from_millis(tl_ms * self.wall_time_factor)
    }

    fn limits(&self, tl_ms: u64, ml_mb: u64) -> Limits {
        Limits {
            tl_ms,
            ml_mb,
            output_bytes: self.output_limit,
        }
    }

    fn spawn(&self, job: &Job) -> Result<hakoniwa::Child, RunReport> {
        let Some((program, args)) = job.cmd.split_first() else {
            return Err(RunReport::system_error(error_id::INVALID_REQUEST, "empty command"));
        };
        let mut container = self
            .container(job)
            .map_err(|e| RunReport::system_error(error_id::SPAWN_FAILED, e))?;
        let mut cmd = container.command(program);
        cmd.args(args)
            .current_dir(job.cwd.unwrap_or(SANDBOX_MOUNT))
            .env("PATH", PATH)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.wait_timeout(self.wall_limit(job.tl_ms).as_secs().max(1));
        cmd.spawn().map_err(|e| {
            RunReport::system_error(
                error_id::SPAWN_FAILED,
                format!("failed to spawn process: {}", e),
            )
        })
    }

    fn measure(&self, status: &ExitStatus, tl_ms: u64, output_bytes: u64) -> Option<Measured> {
        let rusage = status.rusage.as_ref()?;
        let (exit_code, signal) = classify::split_status(status.code);
        let real_time = rusage.real_time;
        Some(Measured {
            cpu_time_ms: (rusage.user_time + rusage.system_time).as_millis() as u64,
            real_time_ms: real_time.as_millis() as u64,
            memory_bytes: rusage.max_rss.max(0) as u64 * 1024,
            exit_code,
            signal,
            output_bytes,
            timed_out: real_time >= self.wall_limit(tl_ms),
        })
    }

    fn finish(
        &self,
        status: hakoniwa::Result<ExitStatus>,
        output_bytes: u64,
        tl_ms: u64,
        ml_mb: u64,
    ) -> RunReport {
        let status = match status {
            Ok(status) => status,
            Err(e) => {
                return RunReport::system_error(
                    error_id::WAIT_FAILED,
                    format!("failed to wait for process: {}", e),
                );
            }
        };
        match self.measure(&status, tl_ms, output_bytes) {
            Some(measured) => classify::report(&measured, &self.limits(tl_ms, ml_mb), status.reason),
            None => {
                warn!("failed to get resource usage: {}", status.reason);
                RunReport::system_error(error_id::NO_RUSAGE, status.reason)
            }
        }
    }

    /// Runs one program with stdin from `in_file` and stdout/stderr captured to files.
    pub fn judge(&self, req: &JudgeRequest) -> RunReport {
        let input = match fs::read(self.mount.host(&req.in_file)) {
            Ok(input) => input,
            Err(e) => {
                return RunReport::system_error(
                    error_id::IO_FAILED,
                    format!("failed to read {}: {}", req.in_file, e),
                );
            }
        };
        let job = Job {
            cmd: &req.cmd,
            cwd: req.cwd.as_deref(),
            uid: req.uid,
            tl_ms: req.tl,
            ml_mb: req.ml,
            rule: req.seccomp_rule.unwrap_or_default(),
        };
        let mut child = match self.spawn(&job) {
            Ok(child) => child,
            Err(report) => return report,
        };

        let writer = child.stdin.take().map(|mut stdin| {
            thread::spawn(move || {
                // The program may exit without reading everything.
                let _ = stdin.write_all(&input);
            })
        });
        let out = child
            .stdout
            .take()
            .map(|s| capture(s, self.mount.host(&req.out_file), self.output_limit));
        let err = child
            .stderr
            .take()
            .map(|s| capture(s, self.mount.host(&req.err_file), self.output_limit));

        let status = child.wait();
        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let output_bytes = match join_capture(out) {
            Ok(n) => n,
            Err(e) => return RunReport::system_error(error_id::IO_FAILED, e),
        };
        if let Err(e) = join_capture(err) {
            return RunReport::system_error(error_id::IO_FAILED, e);
        }
        self.finish(status, output_bytes, req.tl, req.ml)
    }

    /// Runs a program against an interactor, each one's stdout feeding the other's stdin.
    pub fn interact_judge(&self, req: &InteractJudgeRequest) -> InteractReport {
        let job = Job {
            cmd: &req.cmd,
            cwd: req.cwd.as_deref(),
            uid: req.uid,
            tl_ms: req.tl,
            ml_mb: req.ml,
            rule: req.seccomp_rule.unwrap_or_default(),
        };
        let interactor_job = Job {
            cmd: &req.interact_cmd,
            cwd: req.cwd.as_deref(),
            uid: req.interact_uid,
            tl_ms: req.tl,
            ml_mb: req.ml,
            rule: SeccompRule::None,
        };

        let mut program = match self.spawn(&job) {
            Ok(child) => child,
            Err(report) => return InteractReport::both(report),
        };
        let mut interactor = match self.spawn(&interactor_job) {
            Ok(child) => child,
            Err(report) => {
                // EOF on stdin; the wall clock limit bounds the rest.
                drop(program.stdin.take());
                let _ = program.wait();
                return InteractReport::both(report);
            }
        };

        let to_interactor = match (program.stdout.take(), interactor.stdin.take()) {
            (Some(from), Some(to)) => Some(relay(from, to)),
            _ => None,
        };
        let to_program = match (interactor.stdout.take(), program.stdin.take()) {
            (Some(from), Some(to)) => Some(relay(from, to)),
            _ => None,
        };
        let program_err = program
            .stderr
            .take()
            .map(|s| capture(s, self.mount.host(&req.err_file), self.output_limit));
        let interactor_err = interactor
            .stderr
            .take()
            .map(|s| capture(s, self.mount.host(&req.interact_err_file), self.output_limit));

        let program_status = program.wait();
        let interactor_status = interactor.wait();
        let relayed = to_interactor.and_then(|h| h.join().ok()).unwrap_or(0);
        if let Some(h) = to_program {
            let _ = h.join();
        }
        let mut io_error = None;
        for handle in [program_err, interactor_err] {
            if let Err(e) = join_capture(handle) {
                io_error = Some(e);
            }
        }
        if let Some(e) = io_error {
            return InteractReport::both(RunReport::system_error(error_id::IO_FAILED, e));
        }

        InteractReport {
            result: self.finish(program_status, relayed, req.tl, req.ml),
            interact_result: self.finish(interactor_status, 0, req.tl, req.ml),
        }
    }
}

impl InteractReport {
    fn both(report: RunReport) -> Self {
        Self {
            result: report.clone(),
            interact_result: report,
        }
    }
}

/// Drains `from` into the file at `path`, writing at most `limit` bytes.
/// Returns the total number of bytes the program produced.
fn capture<R>(mut from: R, path: impl AsRef<Path>, limit: u64) -> JoinHandle<Result<u64, String>>
where
    R: Read + Send + 'static,
{
    let path = path.as_ref().to_path_buf();
    thread::spawn(move || {
        let mut file =
            File::create(&path).map_err(|e| format!("failed to open {}: {}", path.display(), e))?;
        let mut buf = [0u8; 64 * 1024];
        let mut total = 0u64;
        loop {
            let n = match from.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            let room = limit.saturating_sub(total).min(n as u64) as usize;
            if room > 0 {
                file.write_all(&buf[..room])
                    .map_err(|e| format!("failed to write {}: {}", path.display(), e))?;
            }
            total += n as u64;
        }
        Ok(total)
    })
}

fn join_capture(handle: Option<JoinHandle<Result<u64, String>>>) -> Result<u64, String> {
    match handle {
        Some(handle) => handle
            .join()
            .unwrap_or_else(|_| Err("output capture thread panicked".to_string())),
        None => Ok(0),
    }
}

/// Copies one process's output into the other's input until either side closes.
fn relay<R, W>(mut from: R, mut to: W) -> JoinHandle<u64>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0u8; 8 * 1024];
        let mut total = 0u64;
        loop {
            let n = match from.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            total += n as u64;
            if to.write_all(&buf[..n]).and_then(|_| to.flush()).is_err() {
                break;
            }
        }
        total
    })
}
