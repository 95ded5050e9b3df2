use anyhow::Result;

use funnel_core::PivotBudget;
use funnel_storage::Storage;
use funnel_validate::{audit, default_rules, Finding, RunAudit};

/// Audit every stored run. Runs stamped with a different policy hash are
/// checked without a pivot budget.
pub fn doctor(store: &dyn Storage, policy_hash: &str, max_pivots: PivotBudget) -> Result<Vec<Finding>> {
    let rules = default_rules();
    let mut findings = vec![];
    for run in store.list_runs()? {
        let input = RunAudit {
            artifacts: store.artifacts_for_run(&run.id)?,
            checkpoints: store.checkpoints_for_run(&run.id)?,
            max_pivots: (run.policy_hash == policy_hash).then_some(max_pivots),
            run,
        };
        findings.extend(audit(&rules, &input));
    }
    Ok(findings)
}
