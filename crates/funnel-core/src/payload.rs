use serde::{Deserialize, Serialize};

use crate::model::Phase;

/// Founder brief captured during onboarding.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct OnboardingBrief {
    pub business_idea: String,
    #[serde(default)]
    pub target_customer: Option<String>,
    #[serde(default)]
    pub problem_statement: Option<String>,
    #[serde(default)]
    pub open_questions: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryFindings {
    #[serde(default)]
    pub segments: Vec<String>,
    #[serde(default)]
    pub interviews: u32,
    /// Share of interviewees who confirmed the problem, 0.0..=1.0.
    #[serde(default)]
    pub problem_resonance: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct DesirabilityEvidence {
    #[serde(default)]
    pub experiments: Vec<String>,
    #[serde(default)]
    pub signups: u32,
    #[serde(default)]
    pub conversion_rate: f64,
    /// Signups that never came back after the first touch.
    #[serde(default)]
    pub zombie_ratio: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FeasibilityAssessment {
    #[serde(default)]
    pub required_features: Vec<String>,
    /// Features that must be cut for the product to be buildable.
    #[serde(default)]
    pub downgraded_features: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub monthly_run_cost: f64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ViabilityModel {
    #[serde(default)]
    pub cac: f64,
    #[serde(default)]
    pub ltv: f64,
    #[serde(default)]
    pub gross_margin: f64,
}

impl ViabilityModel {
    pub fn ltv_cac_ratio(&self) -> Option<f64> {
        if self.cac > 0.0 {
            Some(self.ltv / self.cac)
        } else {
            None
        }
    }
}

/// Fallback payload written when a phase could not produce a classification.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DegradedReport {
    pub phase: Phase,
    pub attempts: u32,
    pub last_error: String,
}

/// Phase-specific structured data carried by a `PhaseArtifact`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhasePayload {
    Onboarding(OnboardingBrief),
    Discovery(DiscoveryFindings),
    Desirability(DesirabilityEvidence),
    Feasibility(FeasibilityAssessment),
    Viability(ViabilityModel),
    Degraded(DegradedReport),
}

impl PhasePayload {
    pub fn phase(&self) -> Phase {
        match self {
            PhasePayload::Onboarding(_) => Phase::Onboarding,
            PhasePayload::Discovery(_) => Phase::Discovery,
            PhasePayload::Desirability(_) => Phase::Desirability,
            PhasePayload::Feasibility(_) => Phase::Feasibility,
            PhasePayload::Viability(_) => Phase::Viability,
            PhasePayload::Degraded(r) => r.phase,
        }
    }

    /// An empty payload of the right variant, used by scripted agents.
    pub fn empty_for(phase: Phase) -> Option<PhasePayload> {
        Some(match phase {
            Phase::Onboarding => PhasePayload::Onboarding(OnboardingBrief::default()),
            Phase::Discovery => PhasePayload::Discovery(DiscoveryFindings::default()),
            Phase::Desirability => PhasePayload::Desirability(DesirabilityEvidence::default()),
            Phase::Feasibility => PhasePayload::Feasibility(FeasibilityAssessment::default()),
            Phase::Viability => PhasePayload::Viability(ViabilityModel::default()),
            Phase::Validated | Phase::Killed => return None,
        })
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, PhasePayload::Degraded(_))
    }

    /// One-line description for events and status output.
    pub fn summary(&self) -> String {
        match self {
            PhasePayload::Onboarding(b) => format!("brief: {}", b.business_idea),
            PhasePayload::Discovery(d) => format!(
                "{} interviews across {} segments, resonance {:.2}",
                d.interviews,
                d.segments.len(),
                d.problem_resonance
            ),
            PhasePayload::Desirability(d) => format!(
                "{} signups, conversion {:.2}, zombie ratio {:.2}",
                d.signups, d.conversion_rate, d.zombie_ratio
            ),
            PhasePayload::Feasibility(f) => format!(
                "{} required features, {} downgraded, {} blockers",
                f.required_features.len(),
                f.downgraded_features.len(),
                f.blockers.len()
            ),
            PhasePayload::Viability(v) => match v.ltv_cac_ratio() {
                Some(r) => format!("LTV/CAC {:.2}, margin {:.2}", r, v.gross_margin),
                None => format!("margin {:.2}", v.gross_margin),
            },
            PhasePayload::Degraded(r) => format!("degraded after {} attempts: {}", r.attempts, r.last_error),
        }
    }
}
