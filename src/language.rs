use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{JudgeError, LanguageError};
use crate::paths::{Access, Environment, RunSpec, SandboxPath};
use crate::types::{RunOutcome, SandboxRole, SeccompRule};

/// Descriptor loaded from `langs/<name>.json`.
#[derive(Debug, Deserialize, Clone)]
pub struct LanguageSpec {
    pub default_branch: String,
    /// Branch name to template arguments, e.g. `"C++17": {"std": "c++17"}`.
    pub branches: BTreeMap<String, BTreeMap<String, String>>,
    pub source_ext: String,
    #[serde(default)]
    pub base_name: Option<String>,
    pub require_compile: bool,
    #[serde(default)]
    pub compile_cmd: Vec<String>,
    #[serde(default)]
    pub compile_runner_cmd: Option<Vec<String>>,
    pub exec_cmd: Vec<String>,
    #[serde(default = "default_exec_name")]
    pub exec_name: String,
    #[serde(default)]
    pub seccomp_rule: SeccompRule,
}

fn default_exec_name() -> String {
    "{stem}".to_string()
}

const COMPILE_SLOTS: &[&str] = &["source", "exec"];
const RUNNER_SLOTS: &[&str] = &["source", "exec", "runner", "runner_exec"];
const EXEC_SLOTS: &[&str] = &["exec", "stem", "folder"];
const EXEC_NAME_SLOTS: &[&str] = &["stem"];

/// Substitutes `{name}` placeholders. `{{` and `}}` produce literal braces.
pub fn render(template: &str, slots: &HashMap<&str, String>) -> Result<String, LanguageError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(ch) => name.push(ch),
                        None => return Err(LanguageError::Malformed(template.to_string())),
                    }
                }
                let value = slots.get(name.as_str()).ok_or_else(|| LanguageError::UnknownSlot {
                    slot: name.clone(),
                    template: template.to_string(),
                })?;
                out.push_str(value);
            }
            '}' => return Err(LanguageError::Malformed(template.to_string())),
            _ => out.push(c),
        }
    }
    Ok(out)
}

/// One branch of a language, e.g. `C++17` of `cpp`.
#[derive(Debug, Clone)]
pub struct Language {
    pub name: String,
    pub branch: String,
    kwargs: BTreeMap<String, String>,
    spec: Arc<LanguageSpec>,
    /// Startup overhead subtracted from reported CPU time, in milliseconds.
    pub base_time_ms: f64,
    /// Startup overhead subtracted from reported memory, in bytes.
    pub base_memory_bytes: f64,
}

impl Language {
    pub fn new(name: &str, branch: &str, spec: Arc<LanguageSpec>) -> Result<Self, LanguageError> {
        let kwargs = spec
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| LanguageError::MissingBranch {
                language: name.to_string(),
                branch: branch.to_string(),
            })?;
        let lang = Self {
            name: name.to_string(),
            branch: branch.to_string(),
            kwargs,
            spec,
            base_time_ms: 0.0,
            base_memory_bytes: 0.0,
        };
        lang.validate()?;
        Ok(lang)
    }

    fn slots(&self, extra: &[(&'static str, String)]) -> HashMap<&str, String> {
        let mut slots: HashMap<&str, String> = self
            .kwargs
            .iter()
            .map(|(k, v)| (k.as_str(), v.clone()))
            .collect();
        for (k, v) in extra {
            slots.insert(*k, v.clone());
        }
        slots
    }

    fn render_all(
        &self,
        templates: &[String],
        extra: &[(&'static str, String)],
    ) -> Result<Vec<String>, LanguageError> {
        let slots = self.slots(extra);
        templates.iter().map(|t| render(t, &slots)).collect()
    }

    /// Renders every template against placeholder values so bad slots fail at load.
    fn validate(&self) -> Result<(), LanguageError> {
        let dummy = |names: &[&'static str]| -> Vec<(&'static str, String)> {
            names.iter().map(|n| (*n, String::from("x"))).collect()
        };
        if self.spec.require_compile {
            self.render_all(&self.spec.compile_cmd, &dummy(COMPILE_SLOTS))?;
        }
        if let Some(runner) = &self.spec.compile_runner_cmd {
            self.render_all(runner, &dummy(RUNNER_SLOTS))?;
        }
        self.render_all(&self.spec.exec_cmd, &dummy(EXEC_SLOTS))?;
        render(&self.spec.exec_name, &self.slots(&dummy(EXEC_NAME_SLOTS)))?;
        if let Some(base) = &self.spec.base_name {
            render(base, &self.slots(&[]))?;
        }
        Ok(())
    }

    pub fn source_ext(&self) -> &str {
        &self.spec.source_ext
    }

    pub fn seccomp_rule(&self) -> SeccompRule {
        self.spec.seccomp_rule
    }

    pub fn supports_runner(&self) -> bool {
        self.spec.compile_runner_cmd.is_some()
    }

    fn exec_path(&self, env: &Environment, source: &SandboxPath) -> Result<SandboxPath, LanguageError> {
        let name = render(&self.spec.exec_name, &self.slots(&[("stem", source.stem())]))?;
        Ok(env.path(name))
    }

    /// Compiles `source` inside `env`. Returns the executable and a compile error
    /// message, which is empty on success.
    pub async fn compile(
        &self,
        source: &SandboxPath,
        env: &Environment,
        runner: Option<&SandboxPath>,
        timeout_secs: f64,
    ) -> Result<(SandboxPath, String), JudgeError> {
        if !self.spec.require_compile {
            env.grant(source, Access::Execute, None);
            return Ok((source.clone(), String::new()));
        }
        if runner.is_some() && !self.supports_runner() {
            return Ok((source.clone(), "Runner not supported".to_string()));
        }

        let mut target = self.exec_path(env, source)?;
        let mut companion = None;
        env.grant(source, Access::Execute, Some(SandboxRole::Compile));

        let cmd = match (runner, &self.spec.compile_runner_cmd) {
            (Some(runner), Some(template)) => {
                let runner_exec = self.exec_path(env, runner)?;
                let cmd = self.render_all(
                    template,
                    &[
                        ("source", source.to_string()),
                        ("exec", target.to_string()),
                        ("runner", runner.to_string()),
                        ("runner_exec", runner_exec.to_string()),
                    ],
                )?;
                env.grant(runner, Access::Execute, Some(SandboxRole::Compile));
                companion = Some(target);
                target = runner_exec;
                cmd
            }
            _ => self.render_all(
                &self.spec.compile_cmd,
                &[("source", source.to_string()), ("exec", target.to_string())],
            )?,
        };

        env.touch(&target)?;
        env.grant(&target, Access::Write, Some(SandboxRole::Compile));
        let out = env
            .call(cmd, SandboxRole::Compile, "", Some(timeout_secs))
            .await?;
        if out.is_timeout() {
            warn!(language = %self.branch, "compilation timed out");
            return Ok((target, "Compiling TLE".to_string()));
        }
        if let Some(companion) = companion {
            if companion.exists() {
                let companion = env.simple_path(&companion)?;
                env.grant(&companion, Access::Execute, None);
            }
        }
        let target = env.simple_path(&target)?;
        env.grant(&target, Access::Execute, None);
        if out.return_code != 0 {
            let message = if !out.stderr.is_empty() {
                out.stderr
            } else if !out.stdout.is_empty() {
                out.stdout
            } else {
                format!("compiler exited with code {}", out.return_code)
            };
            return Ok((target, message));
        }
        Ok((target, String::new()))
    }

    /// Command line that runs a compiled (or interpreted) program.
    pub fn get_execmd(&self, exec: &SandboxPath) -> Result<Vec<String>, LanguageError> {
        self.render_all(
            &self.spec.exec_cmd,
            &[
                ("exec", exec.to_string()),
                ("stem", exec.stem()),
                ("folder", exec.parent().to_string()),
            ],
        )
    }

    fn base_source(&self, langs_dir: &Path) -> Result<PathBuf, LanguageError> {
        let base = match &self.spec.base_name {
            Some(template) => render(template, &self.slots(&[]))?,
            None => format!("base_{}", self.name),
        };
        Ok(langs_dir
            .join(&self.name)
            .join(format!("{}{}", base, self.spec.source_ext)))
    }

    /// Measures the startup overhead of a trivial program in this language.
    /// Failures leave the baseline at zero.
    pub async fn calibrate(&mut self, env: &Environment, langs_dir: &Path) -> Result<(), JudgeError> {
        let source_path = self.base_source(langs_dir)?;
        if !source_path.exists() {
            warn!(language = %self.branch, "calibration skipped: {} not found", source_path.display());
            return Ok(());
        }
        let source = env.send_file(&source_path)?;
        let (exec, ce) = self.compile(&source, env, None, 30.0).await?;
        if !ce.is_empty() {
            warn!(language = %self.branch, "calibration skipped: compile error");
            return Ok(());
        }
        let report = env
            .run(RunSpec {
                cmd: self.get_execmd(&exec)?,
                tl_ms: 10_000,
                ml_mb: 1024,
                stdin: None,
                stdout: None,
                stderr: None,
                seccomp: Some(self.seccomp_rule()),
                role: SandboxRole::Running,
            })
            .await?;
        if report.result != RunOutcome::AC {
            warn!(language = %self.branch, "calibration failed: {}", report.result.as_str());
            return Ok(());
        }
        self.base_time_ms = (report.cpu_time_ms * 9 / 10) as f64;
        self.base_memory_bytes = report.memory_bytes as f64;
        info!(
            language = %self.branch,
            base_time_ms = self.base_time_ms,
            base_memory_bytes = self.base_memory_bytes,
            "calibrated"
        );
        Ok(())
    }
}

/// All language branches, keyed by branch name.
#[derive(Debug, Default, Clone)]
pub struct LanguageRegistry {
    langs: BTreeMap<String, Language>,
    dir: PathBuf,
}

impl LanguageRegistry {
    pub fn load(dir: &Path) -> Result<Self, LanguageError> {
        let entries = fs::read_dir(dir).map_err(|source| LanguageError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut langs = BTreeMap::new();
        for path in files {
            let text = fs::read_to_string(&path).map_err(|source| LanguageError::Read {
                path: path.clone(),
                source,
            })?;
            let spec: LanguageSpec =
                serde_json::from_str(&text).map_err(|source| LanguageError::Parse {
                    path: path.clone(),
                    source,
                })?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !spec.branches.contains_key(&spec.default_branch) {
                return Err(LanguageError::MissingBranch {
                    language: name,
                    branch: spec.default_branch.clone(),
                });
            }
            let spec = Arc::new(spec);
            for branch in spec.branches.keys() {
                let lang = Language::new(&name, branch, spec.clone())?;
                if langs.insert(branch.clone(), lang).is_some() {
                    return Err(LanguageError::Duplicate(branch.clone()));
                }
            }
        }
        info!(count = langs.len(), "loaded language branches");
        Ok(Self {
            langs,
            dir: dir.to_path_buf(),
        })
    }

    pub fn get(&self, branch: &str) -> Option<&Language> {
        self.langs.get(branch)
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.langs.contains_key(branch)
    }

    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.langs.keys().map(String::as_str)
    }

    /// Calibrates every branch inside `env`.
    pub async fn calibrate(&mut self, env: &Environment) {
        let dir = self.dir.clone();
        for lang in self.langs.values_mut() {
            if let Err(e) = lang.calibrate(env, &dir).await {
                warn!(language = %lang.branch, "calibration error: {}", e);
            }
        }
    }

    pub fn insert(&mut self, lang: Language) {
        self.langs.insert(lang.branch.clone(), lang);
    }
}
