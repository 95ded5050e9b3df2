use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use funnel_core::{Action, Phase, PivotBudget, RouteRule, RoutingPolicy, RoutingTable, Signal};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::profile::phase_defaults;

/// YAML routing policy: the pivot budget, per-phase knobs and route overrides
/// layered on the standard table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PolicyPack {
    pub name: String,
    /// Required. A count or `unbounded`.
    #[serde(default)]
    pub max_pivots: Option<PivotBudget>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub phases: BTreeMap<Phase, PhaseOverride>,
    #[serde(default)]
    pub routes: Vec<RouteOverride>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseOverride {
    #[serde(default)]
    pub gate_required_even_on_success: Option<bool>,
    #[serde(default)]
    pub retry_limit: Option<u32>,
    #[serde(default)]
    pub time_budget_secs: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RouteOverride {
    pub phase: Phase,
    pub signal: String,
    pub action: Action,
}

/// A validated pack ready to hand to the orchestrator.
#[derive(Clone, Debug)]
pub struct CompiledPolicy {
    pub name: String,
    pub hash: String,
    pub routing: RoutingPolicy,
}

impl PolicyPack {
    /// The built-in pack. The pivot budget still has to be chosen by the caller.
    pub fn standard(max_pivots: PivotBudget) -> Self {
        Self {
            name: "standard".into(),
            max_pivots: Some(max_pivots),
            profile: Some("standard".into()),
            phases: BTreeMap::new(),
            routes: vec![],
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let pack: PolicyPack = serde_yaml::from_str(text).context("parse policy pack yaml")?;
        validate_policy_pack(&pack)?;
        Ok(pack)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serialize policy pack")
    }
}

pub fn load_policy_pack(path: &Path) -> Result<PolicyPack> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read policy pack: {}", path.display()))?;
    PolicyPack::from_yaml(&s).with_context(|| format!("policy pack {}", path.display()))
}

pub fn validate_policy_pack(pack: &PolicyPack) -> Result<()> {
    if pack.name.trim().is_empty() {
        return Err(anyhow!("policy pack missing name"));
    }
    if pack.max_pivots.is_none() {
        return Err(anyhow!("policy pack must set max_pivots (a count or `unbounded`)"));
    }
    if let Some(phase) = pack.phases.keys().find(|p| p.is_terminal()) {
        return Err(anyhow!("phase override for terminal phase {phase}"));
    }
    compile_policy(pack).map(|_| ())
}

pub fn canonical_json(pack: &PolicyPack) -> Result<serde_json::Value> {
    let v = serde_json::to_value(pack).context("policy pack to json")?;
    Ok(sort_json(v))
}

/// Recursively sort object keys for stable hashing.
fn sort_json(v: serde_json::Value) -> serde_json::Value {
    match v {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(entries.into_iter().map(|(k, v)| (k, sort_json(v))).collect())
        }
        serde_json::Value::Array(arr) => serde_json::Value::Array(arr.into_iter().map(sort_json).collect()),
        other => other,
    }
}

/// Stamped on every run so a run can be traced to the policy that routed it.
pub fn policy_hash(pack: &PolicyPack) -> Result<String> {
    let bytes = serde_json::to_vec(&canonical_json(pack)?)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn compile_policy(pack: &PolicyPack) -> Result<CompiledPolicy> {
    let max_pivots = pack
        .max_pivots
        .ok_or_else(|| anyhow!("policy pack `{}` must set max_pivots", pack.name))?;
    let profile = pack.profile.as_deref().unwrap_or("standard");
    let mut phases = phase_defaults(profile)?;
    for policy in phases.iter_mut() {
        if let Some(o) = pack.phases.get(&policy.phase) {
            if let Some(g) = o.gate_required_even_on_success {
                policy.gate_required_even_on_success = g;
            }
            if let Some(r) = o.retry_limit {
                policy.retry_limit = r;
            }
            if let Some(t) = o.time_budget_secs {
                policy.time_budget_secs = t;
            }
        }
    }

    let mut table = RoutingTable::standard();
    for route in &pack.routes {
        let signal = Signal::parse(route.phase, &route.signal)
            .with_context(|| format!("route override for {}", route.phase))?;
        table.override_rule(RouteRule { signal, action: route.action.clone() });
    }

    let routing = RoutingPolicy { max_pivots, phases, table };
    routing.validate().with_context(|| format!("policy pack `{}`", pack.name))?;
    Ok(CompiledPolicy { name: pack.name.clone(), hash: policy_hash(pack)?, routing })
}
