use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::model::Phase;

macro_rules! phase_signal {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        #[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
        pub enum $name {
            $($variant,)+
            Unknown,
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+ $name::Unknown];

            pub fn label(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                    $name::Unknown => "UNKNOWN",
                }
            }

            fn parse(label: &str) -> Option<Self> {
                Self::ALL.iter().copied().find(|s| s.label() == label)
            }
        }
    };
}

phase_signal!(OnboardingSignal {
    Complete => "COMPLETE",
    Incomplete => "INCOMPLETE",
});

phase_signal!(DiscoverySignal {
    StrongFit => "STRONG_FIT",
    WeakFit => "WEAK_FIT",
    NoFit => "NO_FIT",
});

phase_signal!(DesirabilitySignal {
    StrongCommitment => "STRONG_COMMITMENT",
    WeakInterest => "WEAK_INTEREST",
    NoInterest => "NO_INTEREST",
});

phase_signal!(FeasibilitySignal {
    GreenFeasible => "GREEN_FEASIBLE",
    OrangeConstrained => "ORANGE_CONSTRAINED",
    RedImpossible => "RED_IMPOSSIBLE",
});

phase_signal!(ViabilitySignal {
    Profitable => "PROFITABLE",
    Marginal => "MARGINAL",
    Underwater => "UNDERWATER",
});

/// Classification of a phase artifact, tagged by the phase that produced it.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Signal {
    Onboarding(OnboardingSignal),
    Discovery(DiscoverySignal),
    Desirability(DesirabilitySignal),
    Feasibility(FeasibilitySignal),
    Viability(ViabilitySignal),
}

impl Signal {
    pub fn phase(self) -> Phase {
        match self {
            Signal::Onboarding(_) => Phase::Onboarding,
            Signal::Discovery(_) => Phase::Discovery,
            Signal::Desirability(_) => Phase::Desirability,
            Signal::Feasibility(_) => Phase::Feasibility,
            Signal::Viability(_) => Phase::Viability,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Signal::Onboarding(s) => s.label(),
            Signal::Discovery(s) => s.label(),
            Signal::Desirability(s) => s.label(),
            Signal::Feasibility(s) => s.label(),
            Signal::Viability(s) => s.label(),
        }
    }

    pub fn is_unknown(self) -> bool {
        self.label() == "UNKNOWN"
    }

    /// The UNKNOWN signal of a work phase.
    pub fn unknown(phase: Phase) -> Result<Signal, ConfigError> {
        Ok(match phase {
            Phase::Onboarding => Signal::Onboarding(OnboardingSignal::Unknown),
            Phase::Discovery => Signal::Discovery(DiscoverySignal::Unknown),
            Phase::Desirability => Signal::Desirability(DesirabilitySignal::Unknown),
            Phase::Feasibility => Signal::Feasibility(FeasibilitySignal::Unknown),
            Phase::Viability => Signal::Viability(ViabilitySignal::Unknown),
            Phase::Validated | Phase::Killed => return Err(ConfigError::NotAWorkPhase(phase)),
        })
    }

    /// Every signal value of a work phase, in declaration order.
    pub fn all_for(phase: Phase) -> Vec<Signal> {
        match phase {
            Phase::Onboarding => OnboardingSignal::ALL.iter().map(|s| Signal::Onboarding(*s)).collect(),
            Phase::Discovery => DiscoverySignal::ALL.iter().map(|s| Signal::Discovery(*s)).collect(),
            Phase::Desirability => DesirabilitySignal::ALL.iter().map(|s| Signal::Desirability(*s)).collect(),
            Phase::Feasibility => FeasibilitySignal::ALL.iter().map(|s| Signal::Feasibility(*s)).collect(),
            Phase::Viability => ViabilitySignal::ALL.iter().map(|s| Signal::Viability(*s)).collect(),
            Phase::Validated | Phase::Killed => vec![],
        }
    }

    pub fn all() -> Vec<Signal> {
        Phase::WORK.iter().flat_map(|p| Signal::all_for(*p)).collect()
    }

    /// Parse a label in the context of a phase, e.g. (`FEASIBILITY`, `"ORANGE_CONSTRAINED"`).
    pub fn parse(phase: Phase, label: &str) -> Result<Signal, ConfigError> {
        let label = label.trim().to_ascii_uppercase();
        let found = match phase {
            Phase::Onboarding => OnboardingSignal::parse(&label).map(Signal::Onboarding),
            Phase::Discovery => DiscoverySignal::parse(&label).map(Signal::Discovery),
            Phase::Desirability => DesirabilitySignal::parse(&label).map(Signal::Desirability),
            Phase::Feasibility => FeasibilitySignal::parse(&label).map(Signal::Feasibility),
            Phase::Viability => ViabilitySignal::parse(&label).map(Signal::Viability),
            Phase::Validated | Phase::Killed => None,
        };
        found.ok_or(ConfigError::UnknownLabel { what: "signal", label })
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.phase(), self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_work_phase_has_unknown() {
        for phase in Phase::WORK {
            let all = Signal::all_for(phase);
            assert!(all.iter().any(|s| s.is_unknown()), "{phase} lacks UNKNOWN");
            assert!(all.iter().all(|s| s.phase() == phase));
        }
        assert!(Signal::unknown(Phase::Killed).is_err());
    }

    #[test]
    fn parse_is_phase_scoped() {
        let s = Signal::parse(Phase::Feasibility, "orange_constrained").unwrap();
        assert_eq!(s, Signal::Feasibility(FeasibilitySignal::OrangeConstrained));
        assert!(Signal::parse(Phase::Viability, "ORANGE_CONSTRAINED").is_err());
    }

    #[test]
    fn serializes_with_phase_tag() {
        let json = serde_json::to_string(&Signal::Viability(ViabilitySignal::Underwater)).unwrap();
        assert_eq!(json, r#"{"VIABILITY":"UNDERWATER"}"#);
    }
}
