//! CLI binary for running and validating Rulebook activities.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use rulebook_formula::{format_number, DiceEvaluator};
use rulebook_pipeline::{
    Activity, ActivityEvent, AutoPrompter, CombatState, ConsolePrompter, Entity,
    ExecutionContext, MemoryStore, PipelineRunner, Prompter, ResetTrigger, Role, RulesConfig,
    RunOptions, RunStatus, Severity,
};

#[derive(Parser)]
#[command(name = "rulebook", version, about = "Tabletop activity pipeline runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an activity against a world file
    Run {
        /// Path to the activity .json file
        activity: PathBuf,

        /// World file: `{"entities": [...], "combat": {...}}`
        #[arg(short, long)]
        world: PathBuf,

        /// Acting entity id (default: the first entity in the world)
        #[arg(short, long)]
        actor: Option<String>,

        /// Selected target ids
        #[arg(short, long = "target")]
        targets: Vec<String>,

        /// Put the run in combat with this entity as the active combatant
        #[arg(long)]
        combat_turn: Option<String>,

        /// Rules configuration .json file
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Seed the dice for a reproducible run
        #[arg(long)]
        seed: Option<u64>,

        /// Run as the game master
        #[arg(long)]
        gm: bool,

        /// Answer every prompt automatically
        #[arg(long)]
        auto: bool,

        /// Start at this operation
        #[arg(long)]
        from: Option<String>,

        /// Write the updated activity and world to this directory
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Validate an activity .json file
    Validate {
        /// Path to the activity .json file
        activity: PathBuf,
    },

    /// Show the operations of an activity in execution order
    Info {
        /// Path to the activity .json file
        activity: PathBuf,
    },

    /// Reset ledger resources of a saved activity
    Reset {
        /// Directory the activity was saved to
        dir: PathBuf,

        /// never, turn, shortRest, longRest, or combatEnd
        #[arg(long)]
        trigger: String,
    },
}

/// Entities and encounter state the activity runs against.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct World {
    entities: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    combat: Option<CombatState>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();

    match cli.command {
        Commands::Run {
            activity,
            world,
            actor,
            targets,
            combat_turn,
            rules,
            seed,
            gm,
            auto,
            from,
            save,
        } => {
            let options = RunArgs {
                actor,
                targets,
                combat_turn,
                rules,
                seed,
                gm,
                auto,
                from,
                save,
            };
            cmd_run(&activity, &world, options).await?;
        }
        Commands::Validate { activity } => {
            cmd_validate(&activity)?;
        }
        Commands::Info { activity } => {
            cmd_info(&activity)?;
        }
        Commands::Reset { dir, trigger } => {
            cmd_reset(&dir, &trigger).await?;
        }
    }

    Ok(())
}

fn load_activity_file(path: &Path) -> anyhow::Result<Activity> {
    let source = std::fs::read_to_string(path)?;
    Ok(Activity::from_json(&source)?)
}

fn cmd_validate(path: &Path) -> anyhow::Result<()> {
    let activity = load_activity_file(path)?;
    let diagnostics = rulebook_pipeline::validate(&activity);

    if diagnostics.is_empty() {
        println!("Activity is valid");
        return Ok(());
    }

    let mut has_error = false;
    for diag in &diagnostics {
        let severity = match diag.severity {
            Severity::Error => {
                has_error = true;
                "ERROR"
            }
            Severity::Warning => "WARN",
            Severity::Info => "INFO",
        };
        let at = diag.operation.as_deref().unwrap_or("-");
        println!("[{}] {} ({}): {}", severity, diag.rule, at, diag.message);
    }

    if has_error {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_info(path: &Path) -> anyhow::Result<()> {
    let activity = load_activity_file(path)?;

    println!("Activity: {} ({})", activity.name, activity.id);
    println!("Operations: {}", activity.operations.len());
    if !activity.ledger.is_empty() {
        println!("Resources: {}", activity.ledger.len());
    }
    if let Some(pending) = &activity.pending {
        println!("Waiting on: {} ({})", pending.operation_id, pending.prompt.title);
    }

    println!("\nExecution order:");
    for (position, index) in activity.execution_order().into_iter().enumerate() {
        let op = &activity.operations[index];
        let mut flags = Vec::new();
        if !op.execute_immediately {
            flags.push("deferred".to_string());
        }
        if !op.costs.is_free() {
            flags.push(format!(
                "costs {}/{} stamina",
                blank_as_zero(&op.costs.actions),
                blank_as_zero(&op.costs.stamina)
            ));
        }
        if op.performance.combat_only {
            flags.push("combat only".to_string());
        }
        println!(
            "  {:>2}. {} [{}] priority={}{}",
            position + 1,
            op.label(),
            op.kind.name(),
            op.priority,
            if flags.is_empty() {
                String::new()
            } else {
                format!(" ({})", flags.join(", "))
            }
        );
    }

    for record in activity.ledger.iter() {
        println!(
            "  resource {}: {} {}/{}",
            record.id,
            record.resource_name,
            format_number(record.value),
            format_number(record.maximum)
        );
    }

    Ok(())
}

fn blank_as_zero(formula: &str) -> &str {
    if formula.trim().is_empty() {
        "0"
    } else {
        formula
    }
}

async fn cmd_reset(dir: &Path, trigger: &str) -> anyhow::Result<()> {
    let trigger: ResetTrigger = trigger.parse().map_err(anyhow::Error::msg)?;
    let Some(mut activity) = rulebook_pipeline::load_activity(dir).await? else {
        anyhow::bail!("No saved activity in {}", dir.display());
    };

    let reset = activity.reset_resources(trigger);
    rulebook_pipeline::save_activity(&activity, dir).await?;

    if reset.is_empty() {
        println!("Nothing to reset");
    } else {
        println!("Reset: {}", reset.join(", "));
    }
    Ok(())
}

struct RunArgs {
    actor: Option<String>,
    targets: Vec<String>,
    combat_turn: Option<String>,
    rules: Option<PathBuf>,
    seed: Option<u64>,
    gm: bool,
    auto: bool,
    from: Option<String>,
    save: Option<PathBuf>,
}

async fn cmd_run(activity_path: &Path, world_path: &Path, args: RunArgs) -> anyhow::Result<()> {
    let mut activity = load_activity_file(activity_path)?;
    let world: World = serde_json::from_str(&std::fs::read_to_string(world_path)?)?;

    let actor = match args.actor.or_else(|| world.entities.first().map(|e| e.id.clone())) {
        Some(actor) => actor,
        None => anyhow::bail!("The world has no entities"),
    };
    let rules = match &args.rules {
        Some(path) => RulesConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => RulesConfig::default(),
    };
    let combat = match args.combat_turn {
        Some(active) => Some(CombatState {
            active_combatant: active,
            round: world.combat.as_ref().map(|c| c.round).unwrap_or(1),
        }),
        None => world.combat,
    };
    let evaluator = match args.seed {
        Some(seed) => DiceEvaluator::seeded(seed),
        None => DiceEvaluator::default(),
    };

    println!("Running activity: {}", activity.name);
    println!("Actor: {}", actor);
    if !args.targets.is_empty() {
        println!("Targets: {}", args.targets.join(", "));
    }

    let store = Arc::new(MemoryStore::with_entities(world.entities));
    let mut ctx = ExecutionContext::new(actor, store.clone())
        .with_targets(args.targets)
        .with_rules(rules)
        .with_evaluator(Arc::new(evaluator));
    if let Some(combat) = combat.clone() {
        println!("Combat: round {}, {}'s turn", combat.round, combat.active_combatant);
        ctx = ctx.with_combat(combat);
    }
    if args.gm {
        ctx = ctx.with_role(Role::GameMaster);
    }

    let printer = tokio::spawn(print_events(ctx.events.subscribe()));
    let runner = PipelineRunner::new(ctx);
    let prompter: Box<dyn Prompter> = if args.auto {
        Box::new(AutoPrompter)
    } else {
        Box::new(ConsolePrompter)
    };
    let options = RunOptions {
        start_operation: args.from,
    };
    let report = runner
        .run_with_prompter(&mut activity, options, prompter.as_ref())
        .await?;

    // Closing the channel ends the printer.
    drop(runner);
    let _ = printer.await;

    match &report.status {
        RunStatus::Completed => println!("\nActivity completed"),
        RunStatus::Halted => println!("\nActivity halted"),
        RunStatus::Suspended { prompt, .. } => println!("\nWaiting on: {}", prompt.title),
    }
    println!("Steps: {}", report.steps.len());
    for halt in &report.halts {
        let target = halt
            .target
            .as_deref()
            .map(|t| format!(" [{t}]"))
            .unwrap_or_default();
        println!("  halted at {}{}: {}", halt.operation, target, halt.reason);
    }

    if let Some(dir) = &args.save {
        let path = rulebook_pipeline::save_activity(&activity, dir).await?;
        let world = World {
            entities: store.all().await,
            combat,
        };
        std::fs::write(dir.join("world.json"), serde_json::to_string_pretty(&world)?)?;
        println!("Saved: {}", path.display());
    }

    Ok(())
}

/// Print user-facing events as they arrive; everything else goes to the log.
async fn print_events(mut events: tokio::sync::broadcast::Receiver<ActivityEvent>) {
    use tokio::sync::broadcast::error::RecvError;

    loop {
        match events.recv().await {
            Ok(ActivityEvent::Notification { message, .. }) => println!("  {message}"),
            Ok(ActivityEvent::OperationSkipped { operation, reason }) => {
                println!("  (skipped {operation}: {reason})")
            }
            Ok(event) => {
                if let Ok(json) = serde_json::to_string(&event) {
                    tracing::debug!(event = %json, "Activity event");
                }
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "Event printer fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
