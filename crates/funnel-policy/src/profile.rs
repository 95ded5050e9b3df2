use anyhow::{anyhow, Result};
use funnel_core::{Phase, PhasePolicy};

pub const PROFILES: [&str; 3] = ["standard", "strict", "fast"];

/// Built-in per-phase knobs a pack starts from before its own overrides.
///
/// - `standard`: only VIABILITY gates success.
/// - `strict`: every phase gates success; fewer agent retries.
/// - `fast`: no gates; more retries, shorter budgets.
pub fn phase_defaults(profile: &str) -> Result<Vec<PhasePolicy>> {
    let (retry_limit, time_budget_secs) = match profile {
        "standard" => (2, 120),
        "strict" => (1, 300),
        "fast" => (3, 60),
        other => return Err(anyhow!("unknown policy profile `{other}` (expected one of {})", PROFILES.join(", "))),
    };
    let gate = |phase: Phase| match profile {
        "strict" => true,
        "fast" => false,
        _ => phase == Phase::Viability,
    };
    Ok(Phase::WORK
        .iter()
        .map(|phase| PhasePolicy {
            phase: *phase,
            gate_required_even_on_success: gate(*phase),
            retry_limit,
            time_budget_secs,
        })
        .collect())
}
