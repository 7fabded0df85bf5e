use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::ProblemError;

pub const DEFAULT_GROUP: &str = "default";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum GroupRule {
    #[default]
    Min,
    Avg,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupConfig {
    #[serde(default = "default_score")]
    pub score: f64,
    #[serde(default)]
    pub rule: GroupRule,
    #[serde(default)]
    pub dependency: Vec<String>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            score: default_score(),
            rule: GroupRule::Min,
            dependency: Vec::new(),
        }
    }
}

fn default_score() -> f64 {
    100.0
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

fn default_timelimit() -> u64 {
    1000
}

fn default_memorylimit() -> u64 {
    256
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Testcase {
    pub in_file: String,
    pub out_file: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub sample: bool,
    #[serde(default)]
    pub pretest: bool,
}

/// A program shipped with the problem, as `[file, language branch]`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgramRef(pub String, pub String);

impl ProgramRef {
    pub fn file(&self) -> &str {
        &self.0
    }

    pub fn lang(&self) -> &str {
        &self.1
    }
}

/// Contents of `problems/<pid>/info.json`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProblemInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_timelimit")]
    pub timelimit: u64,
    #[serde(default = "default_memorylimit")]
    pub memorylimit: u64,
    #[serde(default)]
    pub testcases: Vec<Testcase>,
    #[serde(default)]
    pub testcases_gen: Vec<Testcase>,
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
    #[serde(default)]
    pub checker: Option<ProgramRef>,
    #[serde(default)]
    pub interactor: Option<ProgramRef>,
    #[serde(default)]
    pub is_interact: bool,
    #[serde(default)]
    pub library: Vec<String>,
    #[serde(default)]
    pub runner_enabled: bool,
    #[serde(default)]
    pub runner_source: BTreeMap<String, String>,
    #[serde(default = "default_score")]
    pub top_score: f64,
    #[serde(default)]
    pub public_testcase: bool,
    #[serde(default)]
    pub users: Vec<String>,
    /// Branches allowed to submit. Absent branches are allowed.
    #[serde(default)]
    pub languages: BTreeMap<String, bool>,
    #[serde(default)]
    pub language_multipliers: BTreeMap<String, f64>,
}

/// A testcase in evaluation order, remembering which directory holds its files.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderedCase {
    pub case: Testcase,
    pub generated: bool,
}

impl OrderedCase {
    pub fn dir(&self, problem_dir: &Path) -> PathBuf {
        if self.generated {
            problem_dir.join("testcases_gen")
        } else {
            problem_dir.join("testcases")
        }
    }

    pub fn input(&self, problem_dir: &Path) -> PathBuf {
        self.dir(problem_dir).join(&self.case.in_file)
    }

    pub fn answer(&self, problem_dir: &Path) -> PathBuf {
        self.dir(problem_dir).join(&self.case.out_file)
    }
}

impl ProblemInfo {
    /// Groups including the implicit `default` group.
    pub fn all_groups(&self) -> BTreeMap<String, GroupConfig> {
        let mut groups = self.groups.clone();
        groups.entry(DEFAULT_GROUP.to_string()).or_default();
        groups
    }

    /// Checks structural invariants and returns the group evaluation order, in
    /// which every group comes after all of its dependencies.
    pub fn validate(&self) -> Result<Vec<String>, ProblemError> {
        let groups = self.all_groups();
        for case in self.testcases.iter().chain(&self.testcases_gen) {
            if !groups.contains_key(&case.group) {
                return Err(ProblemError::UndeclaredGroup(case.group.clone()));
            }
        }
        if self.checker.is_none() {
            return Err(ProblemError::MissingChecker);
        }
        if self.is_interact && self.interactor.is_none() {
            return Err(ProblemError::MissingInteractor);
        }
        for (name, group) in &groups {
            for dep in &group.dependency {
                if !groups.contains_key(dep) {
                    return Err(ProblemError::UnknownDependency {
                        group: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; ties resolve alphabetically so the order is stable.
        let mut remaining: BTreeMap<&str, BTreeSet<&str>> = groups
            .iter()
            .map(|(name, g)| {
                (
                    name.as_str(),
                    g.dependency.iter().map(String::as_str).collect(),
                )
            })
            .collect();
        let mut order = Vec::with_capacity(groups.len());
        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .find(|(_, deps)| deps.is_empty())
                .map(|(name, _)| *name);
            let Some(ready) = ready else {
                let stuck = remaining.keys().next().copied().unwrap_or_default();
                return Err(ProblemError::DependencyCycle(stuck.to_string()));
            };
            remaining.remove(ready);
            for deps in remaining.values_mut() {
                deps.remove(ready);
            }
            order.push(ready.to_string());
        }
        Ok(order)
    }

    /// Testcases then generated testcases, regrouped by `group_order`.
    pub fn ordered_cases(&self, group_order: &[String]) -> Vec<OrderedCase> {
        let all: Vec<OrderedCase> = self
            .testcases
            .iter()
            .map(|c| OrderedCase {
                case: c.clone(),
                generated: false,
            })
            .chain(self.testcases_gen.iter().map(|c| OrderedCase {
                case: c.clone(),
                generated: true,
            }))
            .collect();
        group_order
            .iter()
            .flat_map(|group| all.iter().filter(move |c| &c.case.group == group).cloned())
            .collect()
    }

    pub fn lang_allowed(&self, branch: &str) -> bool {
        self.languages.get(branch).copied().unwrap_or(true)
    }

    pub fn time_limit_for(&self, branch: &str) -> u64 {
        let factor = self.language_multipliers.get(branch).copied().unwrap_or(1.0);
        (self.timelimit as f64 * factor).round() as u64
    }

    pub fn is_owner(&self, user: &str) -> bool {
        self.users.iter().any(|u| u == user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn problem(json: &str) -> ProblemInfo {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_metadata_defaults() {
        let p = problem(r#"{"checker": ["checker.cpp", "C++17"]}"#);
        assert_eq!(p.timelimit, 1000);
        assert_eq!(p.memorylimit, 256);
        assert_eq!(p.top_score, 100.0);
        assert_eq!(p.checker.as_ref().unwrap().lang(), "C++17");
        assert!(p.all_groups().contains_key(DEFAULT_GROUP));
        assert_eq!(p.validate().unwrap(), vec!["default"]);
    }

    #[test]
    fn test_dependencies_come_first() {
        let p = problem(
            r#"{
                "checker": ["c.cpp", "C++17"],
                "groups": {
                    "a": {"score": 30, "dependency": ["z"]},
                    "z": {"score": 70}
                }
            }"#,
        );
        let order = p.validate().unwrap();
        let pos = |g: &str| order.iter().position(|x| x == g).unwrap();
        assert!(pos("z") < pos("a"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let p = problem(
            r#"{
                "checker": ["c.cpp", "C++17"],
                "groups": {
                    "a": {"dependency": ["b"]},
                    "b": {"dependency": ["a"]}
                }
            }"#,
        );
        assert!(matches!(p.validate(), Err(ProblemError::DependencyCycle(_))));
    }

    #[test]
    fn test_undeclared_group_is_rejected() {
        let p = problem(
            r#"{
                "checker": ["c.cpp", "C++17"],
                "testcases": [{"in_file": "1.in", "out_file": "1.out", "group": "ghost"}]
            }"#,
        );
        assert!(matches!(p.validate(), Err(ProblemError::UndeclaredGroup(g)) if g == "ghost"));
    }

    #[test]
    fn test_generated_cases_follow_and_regroup() {
        let p = problem(
            r#"{
                "checker": ["c.cpp", "C++17"],
                "groups": {"s1": {"score": 40}, "s2": {"score": 60, "dependency": ["s1"]}},
                "testcases": [
                    {"in_file": "a.in", "out_file": "a.out", "group": "s2"},
                    {"in_file": "b.in", "out_file": "b.out", "group": "s1"}
                ],
                "testcases_gen": [{"in_file": "g.in", "out_file": "g.out", "group": "s1"}]
            }"#,
        );
        let order = p.validate().unwrap();
        let cases = p.ordered_cases(&order);
        let names: Vec<&str> = cases.iter().map(|c| c.case.in_file.as_str()).collect();
        assert_eq!(names, vec!["b.in", "g.in", "a.in"]);
        assert!(cases[1].generated);
        assert_eq!(
            cases[1].input(Path::new("/p")),
            PathBuf::from("/p/testcases_gen/g.in")
        );
    }

    #[test]
    fn test_language_rules() {
        let p = problem(
            r#"{
                "checker": ["c.cpp", "C++17"],
                "timelimit": 1000,
                "languages": {"Python3": false},
                "language_multipliers": {"Java": 2.5}
            }"#,
        );
        assert!(!p.lang_allowed("Python3"));
        assert!(p.lang_allowed("C++17"));
        assert_eq!(p.time_limit_for("Java"), 2500);
        assert_eq!(p.time_limit_for("C++17"), 1000);
    }
}
