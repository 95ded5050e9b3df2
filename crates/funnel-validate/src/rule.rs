use std::collections::BTreeMap;

use funnel_core::{Phase, PivotBudget, RunStatus};

use crate::types::{AuditCategory, Finding, RunAudit, Severity};

pub trait Rule: Send + Sync {
    fn id(&self) -> &str;
    fn category(&self) -> AuditCategory;
    fn eval(&self, input: &RunAudit) -> Vec<Finding>;

    fn finding(&self, input: &RunAudit, severity: Severity, message: String) -> Finding {
        Finding {
            rule_id: self.id().to_string(),
            category: self.category(),
            severity,
            run_id: input.run.id.to_string(),
            message,
        }
    }
}

/// At most one unresolved checkpoint, and one exactly while suspended.
pub struct SingleOpenCheckpoint;

impl Rule for SingleOpenCheckpoint {
    fn id(&self) -> &str {
        "single_open_checkpoint"
    }

    fn category(&self) -> AuditCategory {
        AuditCategory::Lifecycle
    }

    fn eval(&self, input: &RunAudit) -> Vec<Finding> {
        let open = input.checkpoints.iter().filter(|c| !c.resolved).count();
        let suspended = input.run.status == RunStatus::SuspendedForInput;
        let mut out = vec![];
        if open > 1 {
            out.push(self.finding(input, Severity::Fail, format!("{open} unresolved checkpoints")));
        }
        if suspended && open == 0 {
            out.push(self.finding(input, Severity::Fail, "suspended without an open checkpoint".into()));
        }
        if !suspended && open > 0 {
            out.push(self.finding(input, Severity::Fail, format!("{} run has an open checkpoint", input.run.status)));
        }
        out
    }
}

/// Versions of each phase run 1..=n, and every artifact is classified for its own phase.
pub struct GaplessVersions;

impl Rule for GaplessVersions {
    fn id(&self) -> &str {
        "gapless_versions"
    }

    fn category(&self) -> AuditCategory {
        AuditCategory::Structural
    }

    fn eval(&self, input: &RunAudit) -> Vec<Finding> {
        let mut by_phase: BTreeMap<Phase, Vec<u32>> = BTreeMap::new();
        let mut out = vec![];
        for a in &input.artifacts {
            by_phase.entry(a.phase).or_default().push(a.version);
            if a.signal.phase() != a.phase {
                out.push(self.finding(
                    input,
                    Severity::Fail,
                    format!("{}@v{} carries signal {}", a.phase, a.version, a.signal),
                ));
            }
        }
        for (phase, mut versions) in by_phase {
            versions.sort_unstable();
            let expected: Vec<u32> = (1..=versions.len() as u32).collect();
            if versions != expected {
                out.push(self.finding(input, Severity::Fail, format!("{phase} versions {versions:?} are not gapless")));
            }
        }
        out
    }
}

/// Terminal runs sit in a terminal phase with a reason; live runs sit in a work phase.
pub struct TerminalConsistency;

impl Rule for TerminalConsistency {
    fn id(&self) -> &str {
        "terminal_consistency"
    }

    fn category(&self) -> AuditCategory {
        AuditCategory::Lifecycle
    }

    fn eval(&self, input: &RunAudit) -> Vec<Finding> {
        let run = &input.run;
        let mut out = vec![];
        match (run.is_terminal(), run.phase.is_terminal()) {
            (true, false) => out.push(self.finding(input, Severity::Fail, format!("terminal run parked in {}", run.phase))),
            (false, true) => out.push(self.finding(input, Severity::Fail, format!("{} run in terminal phase {}", run.status, run.phase))),
            _ => {}
        }
        if run.is_terminal() && run.terminal_reason.is_none() {
            out.push(self.finding(input, Severity::Warn, "terminal run has no recorded reason".into()));
        }
        out
    }
}

/// `pivot_count` equals the pivot history and stays within the budget.
pub struct PivotAccounting;

impl Rule for PivotAccounting {
    fn id(&self) -> &str {
        "pivot_accounting"
    }

    fn category(&self) -> AuditCategory {
        AuditCategory::Budget
    }

    fn eval(&self, input: &RunAudit) -> Vec<Finding> {
        let run = &input.run;
        let mut out = vec![];
        if run.pivot_count as usize != run.pivot_history.len() {
            out.push(self.finding(
                input,
                Severity::Fail,
                format!("pivot_count {} but {} recorded pivots", run.pivot_count, run.pivot_history.len()),
            ));
        }
        if let Some(PivotBudget::Capped(max)) = input.max_pivots {
            if run.pivot_count > max {
                out.push(self.finding(input, Severity::Fail, format!("pivot_count {} exceeds budget {max}", run.pivot_count)));
            }
        }
        out
    }
}

pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(SingleOpenCheckpoint),
        Box::new(GaplessVersions),
        Box::new(TerminalConsistency),
        Box::new(PivotAccounting),
    ]
}

/// Run every rule; findings come back most severe first.
pub fn audit(rules: &[Box<dyn Rule>], input: &RunAudit) -> Vec<Finding> {
    let mut findings: Vec<Finding> = rules.iter().flat_map(|r| r.eval(input)).collect();
    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
    findings
}
