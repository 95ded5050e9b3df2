use crate::commands::Action;
use crate::error::{FunnelError, FunnelResult};
use crate::model::{PivotOrigin, RunStatus};
use crate::outcomes::ResumePlan;
use crate::snapshot::RunSnapshot;
use crate::types::{PivotRecord, ValidationRun};

/// Derive the next executable step from persisted state alone.
///
/// Calling this twice on the same snapshot yields the same plan; it never
/// asks for a phase to be re-run when its artifact already exists.
pub fn plan_resume(snap: &RunSnapshot) -> FunnelResult<ResumePlan> {
    let run = &snap.run;
    let inconsistent = |detail: String| FunnelError::Inconsistent { run_id: run.id.clone(), detail };

    if let Some(cp) = &snap.open_checkpoint {
        if cp.resolved || cp.run_id != run.id {
            return Err(inconsistent(format!("checkpoint {} passed as open but is not", cp.id)));
        }
    }

    match run.status {
        RunStatus::Terminal => match &snap.open_checkpoint {
            Some(cp) => Err(inconsistent(format!("terminal run still has open checkpoint {}", cp.id))),
            None => Ok(ResumePlan::Finished { phase: run.phase }),
        },
        RunStatus::SuspendedForInput => match &snap.open_checkpoint {
            Some(cp) => Ok(ResumePlan::AwaitDecision { checkpoint_id: cp.id.clone() }),
            None => Err(inconsistent("suspended without an open checkpoint".into())),
        },
        RunStatus::Running => {
            if let Some(cp) = &snap.open_checkpoint {
                return Err(inconsistent(format!("running with open checkpoint {}", cp.id)));
            }
            match &snap.current_artifact {
                Some(a) if a.phase == run.phase && a.version == run.current_version => Ok(ResumePlan::RouteArtifact {
                    phase: run.phase,
                    version: run.current_version,
                }),
                Some(a) => Err(inconsistent(format!(
                    "artifact {}@v{} does not match current {}@v{}",
                    a.phase, a.version, run.phase, run.current_version
                ))),
                None => Ok(ResumePlan::ExecutePhase { phase: run.phase, version: run.current_version }),
            }
        }
    }
}

/// Apply a movement action to a copy of `run`.
///
/// `next_version` is the version the target phase's next artifact will carry
/// (latest stored version of that phase plus one). Human decisions are not
/// movements; they go through a checkpoint.
pub fn apply_action(
    run: &ValidationRun,
    action: &Action,
    trigger: &str,
    origin: PivotOrigin,
    next_version: u32,
    now_unix: i64,
) -> FunnelResult<ValidationRun> {
    run.ensure_not_terminal()?;
    let mut next = run.clone();
    match action {
        Action::Advance { next: phase } => next.enter_phase(*phase, next_version, now_unix)?,
        Action::LoopBack { target, pivot } | Action::DowngradeAndRetest { target, pivot } => {
            next.record_pivot(PivotRecord {
                from_phase: run.phase,
                to_phase: *target,
                pivot: *pivot,
                trigger: trigger.to_string(),
                origin,
                downgrade: matches!(action, Action::DowngradeAndRetest { .. }),
                at_unix: now_unix,
            });
            next.enter_phase(*target, next_version, now_unix)?;
        }
        Action::Terminate { outcome } => {
            next.terminate(*outcome, format!("{} at {}", trigger, run.phase), now_unix)?;
        }
        Action::RequestHumanDecision { .. } => {
            return Err(FunnelError::Conflict(format!(
                "run {}: human decisions must be applied through a checkpoint",
                run.id
            )));
        }
    }
    Ok(next)
}
