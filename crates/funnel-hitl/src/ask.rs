use funnel_core::{decision_action, Action, Checkpoint, CheckpointKind, Decision, RunId, Target};

/// ASK packet handed to the human deciding a checkpoint (markdown).
pub fn format_ask(run_id: &RunId, decision_needed: &str, options: &[(String, String)], recommendation: &str) -> String {
    let mut s = String::new();
    s.push_str(&format!("# ASK: {}\n\n", run_id.as_str()));
    s.push_str(&format!("**Decision needed:** {}\n\n", decision_needed));
    s.push_str("## Options\n");
    for (i, (label, consequence)) in options.iter().enumerate() {
        s.push_str(&format!("- [{}] `{}`: {}\n", i + 1, label, consequence));
    }
    s.push('\n');
    s.push_str(&format!("**Recommended:** {}\n", recommendation));
    s
}

pub fn describe_action(action: &Action) -> String {
    match (action, action.target()) {
        (_, Target::Terminal(outcome)) => format!("run ends as {}", outcome.phase()),
        (Action::Advance { next }, _) => format!("advance to {next}"),
        (Action::LoopBack { target, pivot } | Action::DowngradeAndRetest { target, pivot }, _) => {
            format!("re-enter {target} as {pivot} (uses one pivot)")
        }
        (Action::RequestHumanDecision { .. }, _) => "ask again".to_string(),
        (Action::Terminate { .. }, _) => "run ends".to_string(),
    }
}

/// Each option of `checkpoint` with the action picking it leads to.
pub fn option_consequences(checkpoint: &Checkpoint) -> Vec<(String, String)> {
    checkpoint
        .options
        .iter()
        .map(|d| {
            let consequence = decision_action(checkpoint, *d)
                .map(|a| describe_action(&a))
                .unwrap_or_else(|e| format!("unavailable ({e})"));
            (d.label().to_string(), consequence)
        })
        .collect()
}

pub fn recommend(checkpoint: &Checkpoint) -> Decision {
    match checkpoint.kind {
        CheckpointKind::GateApproval if checkpoint.options.contains(&Decision::Approve) => Decision::Approve,
        _ => checkpoint.options.first().copied().unwrap_or(Decision::Kill),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_ask() {
        let run_id = RunId::from_str("run1");
        let options = vec![
            ("APPROVE".to_string(), "run ends as VALIDATED".to_string()),
            ("KILL".to_string(), "run ends as KILLED".to_string()),
        ];
        let expected = "# ASK: run1\n\n**Decision needed:** Approve VIABILITY?\n\n## Options\n- [1] `APPROVE`: run ends as VALIDATED\n- [2] `KILL`: run ends as KILLED\n\n**Recommended:** APPROVE\n";
        assert_eq!(format_ask(&run_id, "Approve VIABILITY?", &options, "APPROVE"), expected);
    }

    #[test]
    fn describes_pivots_and_endings() {
        use funnel_core::{Outcome, Phase, PivotType};
        assert_eq!(describe_action(&Action::Terminate { outcome: Outcome::Killed }), "run ends as KILLED");
        assert_eq!(describe_action(&Action::Advance { next: Phase::Validated }), "run ends as VALIDATED");
        assert_eq!(
            describe_action(&Action::LoopBack { target: Phase::Feasibility, pivot: PivotType::CostPivot }),
            "re-enter FEASIBILITY as COST_PIVOT (uses one pivot)"
        );
    }
}
