use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use funnel_core::{CheckpointId, RunId, ValidationRun};
use funnel_executor::{AgentError, AgentOutput, AgentRegistry, PhaseAgent, PhaseInput};
use funnel_runner::scenario::{simulate, Script};
use funnel_runner::{Runner, StepOutcome};
use funnel_storage::Storage;

#[derive(Parser)]
#[command(name = "funnel", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initialize a project (creates .funnel/, config, db)
    Init,

    /// Audit persisted runs for broken invariants
    Doctor,

    /// Start a run at ONBOARDING
    Start {
        #[arg(long)]
        context: String,
        /// Idempotency token; repeating it returns the same run
        #[arg(long)]
        token: Option<String>,
    },

    /// Show one run, or list all runs
    Status {
        #[arg(long)]
        run: Option<String>,
    },

    /// Step a run until it needs a decision or ends
    Drive {
        #[arg(long)]
        run: String,
        /// Agent script answering each phase
        #[arg(long)]
        script: PathBuf,
    },

    /// Answer an open checkpoint
    Resolve {
        #[arg(long)]
        checkpoint: String,
        #[arg(long)]
        decision: String,
    },

    /// Print the next step a run would take after a restart
    Resume {
        #[arg(long)]
        run: String,
    },

    /// Kill a run administratively
    Cancel {
        #[arg(long)]
        run: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },

    /// Simulate a fixture scenario directory in memory
    Scenario { dir: PathBuf },
}

/// Stand-in for commands that never execute a phase.
struct NoAgent;

impl PhaseAgent for NoAgent {
    fn run(&self, input: &PhaseInput, _budget: Duration) -> Result<AgentOutput, AgentError> {
        Err(AgentError::Fatal(format!("no agent for {}; use `funnel drive --script`", input.phase)))
    }
}

fn open(root: PathBuf) -> anyhow::Result<Runner> {
    Runner::open(root, AgentRegistry::uniform(Arc::new(NoAgent)))
}

fn print_run(run: &ValidationRun) {
    println!(
        "{} {} {} v{} pivots={}",
        run.id, run.phase, run.status, run.current_version, run.pivot_count
    );
}

fn finish(r: &Runner, run: &ValidationRun) -> anyhow::Result<()> {
    if let Some(path) = r.finish(run)? {
        println!("manifest: {}", path.display());
    }
    Ok(())
}

fn print_ask(r: &Runner, run_id: &RunId) -> anyhow::Result<()> {
    let open = r.store.open_checkpoint(run_id)?.context("run suspended without a checkpoint")?;
    let ask = open.presented_context.get("ask_md").and_then(|v| v.as_str()).unwrap_or_default();
    println!("checkpoint {}\n\n{}", open.id, ask);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let root = std::env::current_dir()?;

    match cli.cmd {
        Command::Init => {
            Runner::init_project(&root)?;
            println!("Initialized funnel in {}", root.display());
        }
        Command::Doctor => {
            let r = open(root)?;
            let findings = r.doctor()?;
            for f in &findings {
                println!("[{:?}] {} {}: {}", f.severity, f.run_id, f.rule_id, f.message);
            }
            if findings.is_empty() {
                println!("OK");
            }
        }
        Command::Start { context, token } => {
            let r = open(root)?;
            let run = r.orchestrator.start_run(&context, token)?;
            print_run(&run);
        }
        Command::Status { run: Some(id) } => {
            let r = open(root)?;
            let state = r.orchestrator.run_state(&RunId::from_str(id))?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Command::Status { run: None } => {
            let r = open(root)?;
            let runs = r.store.list_runs()?;
            println!("Runs: {}", runs.len());
            for run in &runs {
                print_run(run);
            }
        }
        Command::Drive { run, script } => {
            let script = Script::load(&script)?;
            let agents = AgentRegistry::uniform(Arc::new(script.agent()?));
            let r = Runner::open(root, agents)?;
            let report = r.orchestrator.drive(&RunId::from_str(run))?;
            println!("{} steps", report.steps);
            match &report.last {
                StepOutcome::Suspended { run, .. } => {
                    print_run(run);
                    print_ask(&r, &run.id)?;
                }
                StepOutcome::Waiting { .. } => print_ask(&r, &report.run_id)?,
                StepOutcome::Moved { run, .. } | StepOutcome::Finished { run } => {
                    print_run(run);
                    finish(&r, run)?;
                }
            }
            if report.hit_step_limit {
                println!("stopped at the step limit; run `funnel drive` again to continue");
            }
        }
        Command::Resolve { checkpoint, decision } => {
            let r = open(root)?;
            let run = r.orchestrator.resolve(&CheckpointId::from_str(checkpoint), &decision)?;
            print_run(&run);
            finish(&r, &run)?;
        }
        Command::Resume { run } => {
            let r = open(root)?;
            let plan = r.orchestrator.resume(&RunId::from_str(run))?;
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        Command::Cancel { run, reason } => {
            let r = open(root)?;
            let run = r.orchestrator.cancel(&RunId::from_str(run), &reason)?;
            print_run(&run);
            finish(&r, &run)?;
        }
        Command::Scenario { dir } => {
            let res = simulate(&dir)?;
            print_run(&res.run);
            for a in &res.artifacts {
                println!("  {}@v{} {}: {}", a.phase, a.version, a.signal.label(), a.payload.summary());
            }
            for c in &res.checkpoints {
                println!("  checkpoint {} {:?} -> {:?}", c.phase, c.option_labels(), c.decision.map(|d| d.label()));
            }
        }
    }

    Ok(())
}
