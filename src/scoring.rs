//! Per-group aggregation of case verdicts into group results and a total score.

use std::collections::BTreeMap;

use crate::problem::{GroupConfig, GroupRule};
use crate::submission::GroupResult;
use crate::utils::format_score;
use crate::verdict::Verdict;

#[derive(Debug, Clone)]
struct GroupState {
    weight: f64,
    rule: GroupRule,
    dependency: Vec<String>,
    result: Verdict,
    time: u64,
    mem: u64,
    gainscore: f64,
    count: usize,
    target: usize,
}

impl GroupState {
    fn new(config: &GroupConfig, top_score: f64) -> Self {
        Self {
            weight: config.score,
            rule: config.rule,
            dependency: config.dependency.clone(),
            result: Verdict::OK,
            time: 0,
            mem: 0,
            gainscore: match config.rule {
                GroupRule::Min => top_score,
                GroupRule::Avg => 0.0,
            },
            count: 0,
            target: 0,
        }
    }

    fn as_result(&self, result: Verdict) -> GroupResult {
        GroupResult {
            result,
            time: self.time,
            mem: self.mem,
            gainscore: self.gainscore,
        }
    }
}

/// The parts of a case outcome that feed group aggregation.
#[derive(Debug, Clone, Copy)]
pub struct CaseScore {
    pub verdict: Verdict,
    pub time_ms: u64,
    pub mem_kb: u64,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct Scoreboard {
    groups: BTreeMap<String, GroupState>,
    top_score: f64,
    any_failure: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreSummary {
    pub groups: BTreeMap<String, GroupResult>,
    pub total: f64,
    /// True when any case was not OK or any group ended PARTIAL.
    pub not_accepted: bool,
}

impl Scoreboard {
    pub fn new(groups: &BTreeMap<String, GroupConfig>, top_score: f64) -> Self {
        Self {
            groups: groups
                .iter()
                .map(|(name, config)| (name.clone(), GroupState::new(config, top_score)))
                .collect(),
            top_score,
            any_failure: false,
        }
    }

    /// Counts a case that will be reported for `group`.
    pub fn expect_case(&mut self, group: &str) {
        if let Some(g) = self.groups.get_mut(group) {
            g.target += 1;
        }
    }

    /// False once a dependency of `group` has a zero verdict.
    pub fn dependencies_satisfied(&self, group: &str) -> bool {
        let Some(g) = self.groups.get(group) else {
            return true;
        };
        g.dependency.iter().all(|dep| {
            self.groups
                .get(dep)
                .map(|d| !d.result.is_zero())
                .unwrap_or(true)
        })
    }

    /// A `min` group with a zero verdict cannot earn anything more.
    pub fn is_settled(&self, group: &str) -> bool {
        self.groups
            .get(group)
            .is_some_and(|g| g.rule == GroupRule::Min && g.result.is_zero())
    }

    pub fn record(&mut self, group: &str, case: CaseScore) {
        if case.verdict != Verdict::OK {
            self.any_failure = true;
        }
        let Some(g) = self.groups.get_mut(group) else {
            return;
        };
        g.time = g.time.max(case.time_ms);
        g.mem = g.mem.max(case.mem_kb);
        if case.verdict != Verdict::OK && g.result == Verdict::OK {
            g.result = match g.rule {
                GroupRule::Min => case.verdict,
                GroupRule::Avg => Verdict::PARTIAL,
            };
        }
        match g.rule {
            GroupRule::Min => g.gainscore = g.gainscore.min(case.score),
            GroupRule::Avg => g.gainscore += case.score,
        }
        g.count += 1;
    }

    /// Intermediate view: groups still waiting for cases read as PENDING.
    pub fn snapshot(&self) -> BTreeMap<String, GroupResult> {
        self.groups
            .iter()
            .map(|(name, g)| {
                let result = if g.count < g.target && !g.result.is_zero() {
                    Verdict::PENDING
                } else {
                    g.result
                };
                (name.clone(), g.as_result(result))
            })
            .collect()
    }

    pub fn finalize(mut self) -> ScoreSummary {
        let mut total = 0.0;
        let mut not_accepted = self.any_failure;
        for g in self.groups.values_mut() {
            if g.count > 0 {
                if g.rule == GroupRule::Avg {
                    g.gainscore /= g.count as f64;
                }
                g.gainscore = g.gainscore * g.weight / self.top_score;
                total += g.gainscore;
            } else if g.rule == GroupRule::Avg {
                g.gainscore = g.weight;
                total += g.gainscore;
            } else {
                g.gainscore = 0.0;
            }
            if g.result == Verdict::PARTIAL {
                not_accepted = true;
            }
        }
        ScoreSummary {
            groups: self
                .groups
                .iter()
                .map(|(name, g)| (name.clone(), g.as_result(g.result)))
                .collect(),
            total,
            not_accepted,
        }
    }
}

/// The one-line verdict shown in submission lists.
pub fn simple_verdict(ce: bool, not_accepted: bool, total: f64, just_pretest: bool) -> String {
    if ce {
        "CE".to_string()
    } else if not_accepted {
        format!("NA {}%", format_score(total))
    } else if just_pretest {
        "pretest passed".to_string()
    } else {
        "AC".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(spec: &[(&str, f64, GroupRule, &[&str])]) -> BTreeMap<String, GroupConfig> {
        spec.iter()
            .map(|(name, score, rule, deps)| {
                (
                    name.to_string(),
                    GroupConfig {
                        score: *score,
                        rule: *rule,
                        dependency: deps.iter().map(|d| d.to_string()).collect(),
                    },
                )
            })
            .collect()
    }

    fn case(verdict: Verdict, score: f64, time_ms: u64, mem_kb: u64) -> CaseScore {
        CaseScore {
            verdict,
            time_ms,
            mem_kb,
            score,
        }
    }

    #[test]
    fn test_all_accepted_single_group() {
        let mut board = Scoreboard::new(&groups(&[("default", 100.0, GroupRule::Min, &[])]), 100.0);
        board.record("default", case(Verdict::OK, 100.0, 10, 2048));
        board.record("default", case(Verdict::OK, 100.0, 12, 2048));
        let summary = board.finalize();
        let g = &summary.groups["default"];
        assert_eq!(g.gainscore, 100.0);
        assert_eq!(g.time, 12);
        assert_eq!(g.mem, 2048);
        assert_eq!(summary.total, 100.0);
        assert_eq!(simple_verdict(false, summary.not_accepted, summary.total, false), "AC");
    }

    #[test]
    fn test_wrong_answer_zeroes_min_group() {
        let mut board = Scoreboard::new(&groups(&[("default", 100.0, GroupRule::Min, &[])]), 100.0);
        board.record("default", case(Verdict::OK, 100.0, 5, 100));
        board.record("default", case(Verdict::WA, 0.0, 5, 100));
        let summary = board.finalize();
        assert_eq!(summary.groups["default"].result, Verdict::WA);
        assert_eq!(summary.groups["default"].gainscore, 0.0);
        assert_eq!(summary.total, 0.0);
        assert_eq!(simple_verdict(false, summary.not_accepted, summary.total, false), "NA 0%");
    }

    #[test]
    fn test_failed_dependency_blocks_group() {
        let mut board = Scoreboard::new(
            &groups(&[
                ("s1", 40.0, GroupRule::Min, &[]),
                ("s2", 60.0, GroupRule::Min, &["s1"]),
            ]),
            100.0,
        );
        assert!(board.dependencies_satisfied("s2"));
        board.record("s1", case(Verdict::WA, 0.0, 1, 1));
        assert!(!board.dependencies_satisfied("s2"));
        assert!(board.is_settled("s1"));
        board.record("s2", case(Verdict::SKIP, 0.0, 0, 0));
        let summary = board.finalize();
        assert_eq!(summary.groups["s1"].result, Verdict::WA);
        assert_eq!(summary.groups["s1"].gainscore, 0.0);
        assert_eq!(summary.groups["s2"].result, Verdict::SKIP);
        assert_eq!(summary.groups["s2"].gainscore, 0.0);
        assert_eq!(summary.total, 0.0);
    }

    #[test]
    fn test_average_group() {
        let mut board = Scoreboard::new(&groups(&[("g", 100.0, GroupRule::Avg, &[])]), 100.0);
        board.record("g", case(Verdict::OK, 100.0, 1, 1));
        board.record("g", case(Verdict::PARTIAL, 50.0, 1, 1));
        board.record("g", case(Verdict::WA, 0.0, 1, 1));
        let summary = board.finalize();
        assert_eq!(summary.groups["g"].gainscore, 50.0);
        assert_eq!(summary.groups["g"].result, Verdict::PARTIAL);
        assert_eq!(summary.total, 50.0);
        assert_eq!(simple_verdict(false, summary.not_accepted, summary.total, false), "NA 50%");
    }

    #[test]
    fn test_weights_rescale_scores() {
        let mut board = Scoreboard::new(
            &groups(&[
                ("a", 30.0, GroupRule::Min, &[]),
                ("b", 70.0, GroupRule::Min, &[]),
                ("default", 100.0, GroupRule::Min, &[]),
            ]),
            100.0,
        );
        board.record("a", case(Verdict::OK, 100.0, 1, 1));
        board.record("b", case(Verdict::PARTIAL, 50.0, 1, 1));
        let summary = board.finalize();
        assert_eq!(summary.groups["a"].gainscore, 30.0);
        assert_eq!(summary.groups["b"].gainscore, 35.0);
        assert_eq!(summary.groups["default"].gainscore, 0.0);
        assert_eq!(summary.total, 65.0);
    }

    #[test]
    fn test_empty_average_group_earns_weight() {
        let board = Scoreboard::new(&groups(&[("g", 20.0, GroupRule::Avg, &[])]), 100.0);
        let summary = board.finalize();
        assert_eq!(summary.groups["g"].gainscore, 20.0);
        assert_eq!(summary.total, 20.0);
    }

    #[test]
    fn test_snapshot_marks_incomplete_groups_pending() {
        let mut board = Scoreboard::new(&groups(&[("default", 100.0, GroupRule::Min, &[])]), 100.0);
        board.expect_case("default");
        board.expect_case("default");
        board.record("default", case(Verdict::OK, 100.0, 3, 3));
        assert_eq!(board.snapshot()["default"].result, Verdict::PENDING);
        board.record("default", case(Verdict::OK, 100.0, 3, 3));
        assert_eq!(board.snapshot()["default"].result, Verdict::OK);
    }

    #[test]
    fn test_pretest_verdict() {
        assert_eq!(simple_verdict(false, false, 100.0, true), "pretest passed");
        assert_eq!(simple_verdict(true, true, 0.0, true), "CE");
    }
}
