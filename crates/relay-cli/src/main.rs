//! CLI binary for driving Relay pipelines from worker processes.
//!
//! Every command prints JSON on stdout. Logs go to stderr.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use relay_engine::{
    AwaitOutcome, GitIntegrator, HookManager, IdentityMeta, IdentityRegistry, MergeOutcome,
    MergeQueue, NodeStatus, Phase, PipelineGraph, RelayConfig, SignalFilter, SignalType,
    TransitionEngine, TransitionRequest,
};
use relay_types::RelayError;
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relay", version, about = "Crash-resilient pipeline execution for agent workers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// State directory holding signals, identities, hooks and the merge queue
    #[arg(long, global = true, env = "RELAY_STATE_DIR", default_value = ".relay")]
    state_dir: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline .dot file
    Validate {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },

    /// Show the nodes and edges of a pipeline
    Info { pipeline: PathBuf },

    /// Status counts, stuck nodes and completion
    Status { pipeline: PathBuf },

    /// Nodes ready for dispatch, in declaration order
    Dispatchable { pipeline: PathBuf },

    /// Move a node to a new status
    Transition {
        pipeline: PathBuf,
        node: String,
        /// Target status (pending, active, impl_complete, validated, failed, merge_ready, merged, stuck)
        to: NodeStatus,
        /// Identity requesting the transition
        #[arg(long)]
        actor: String,
        /// Evidence file, required when validating
        #[arg(long)]
        evidence: Option<PathBuf>,
    },

    /// Audit history of one node
    History { node: String },

    /// Snapshot the graph, or list snapshots with --list
    Checkpoint {
        pipeline: PathBuf,
        #[arg(long)]
        list: bool,
    },

    /// Inter-process signals
    Signal {
        #[command(subcommand)]
        action: SignalAction,
    },

    /// Worker identity registry
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Crash-resumption hooks
    Hook {
        #[command(subcommand)]
        action: HookAction,
    },

    /// Serial merge queue
    Merge {
        /// Pipeline whose nodes the queue moves to merge_ready and merged
        #[arg(long)]
        pipeline: PathBuf,

        /// Repository the queue integrates into (overrides config)
        #[arg(long)]
        repo_root: Option<PathBuf>,

        /// Test command run against each rebased branch (overrides config)
        #[arg(long)]
        test_command: Option<String>,

        #[command(subcommand)]
        action: MergeAction,
    },
}

#[derive(Subcommand)]
enum SignalAction {
    Emit {
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        /// Signal type, e.g. IMPL_COMPLETE
        #[arg(long = "type")]
        signal_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Wait for a matching signal and consume it
    Await {
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long = "type")]
        signal_type: Option<String>,
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },
    List {
        /// List consumed signals instead of pending ones
        #[arg(long)]
        processed: bool,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    Register {
        role: String,
        name: String,
        #[arg(long)]
        pid: Option<u32>,
        #[arg(long)]
        session: Option<String>,
        #[arg(long)]
        worktree: Option<String>,
        #[arg(long)]
        node: Option<String>,
        #[arg(long)]
        predecessor: Option<String>,
    },
    Heartbeat {
        role: String,
        name: String,
    },
    /// Active identities without a recent heartbeat, or with a dead pid
    Stale {
        /// Overrides the configured stale timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    Crash {
        id: String,
    },
    Terminate {
        id: String,
    },
    List,
    Show {
        id: String,
    },
    Lineage {
        id: String,
    },
}

#[derive(Subcommand)]
enum HookAction {
    Create {
        identity: String,
        #[arg(long, default_value = "planning")]
        phase: Phase,
    },
    Update {
        identity: String,
        phase: Phase,
        #[arg(long)]
        summary: String,
        #[arg(long)]
        instructions: Option<String>,
    },
    Show {
        identity: String,
    },
    /// Print the resumption brief without consuming the hook
    Brief {
        identity: String,
    },
    /// Consume a predecessor's hook on behalf of its successor
    Resume {
        predecessor: String,
        successor: String,
    },
}

#[derive(Subcommand)]
enum MergeAction {
    Enqueue {
        identity: String,
        branch: String,
        node: String,
    },
    /// Integrate the head of the queue
    Next,
    List {
        /// Include archived entries
        #[arg(long)]
        archived: bool,
    },
    /// Re-queue a conflict entry after it was fixed
    Resolve {
        branch: String,
    },
    /// Abandon a conflict entry
    Skip {
        branch: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            let (kind, code) = match err.downcast_ref::<RelayError>() {
                Some(relay) => (relay.kind(), relay.exit_code()),
                None => ("other", 2),
            };
            tracing::debug!(error = ?err, "Command failed");
            println!("{}", json!({ "error": kind, "message": format!("{err:#}") }));
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = RelayConfig::load(&cli.state_dir)?;
    config.layout().ensure()?;

    match cli.command {
        Commands::Validate { pipeline } => cmd_validate(&pipeline),
        Commands::Info { pipeline } => cmd_info(&pipeline),
        Commands::Status { pipeline } => {
            let graph = PipelineGraph::load(&pipeline)?;
            emit_json(&relay_engine::summarize(&graph))
        }
        Commands::Dispatchable { pipeline } => {
            let graph = PipelineGraph::load(&pipeline)?;
            emit_json(&relay_engine::dispatchable(&graph))
        }
        Commands::Transition {
            pipeline,
            node,
            to,
            actor,
            evidence,
        } => {
            let mut req = TransitionRequest::new(node, to, actor);
            if let Some(path) = evidence {
                req = req.with_evidence(path);
            }
            let record = TransitionEngine::from_config(&config).transition(&pipeline, &req)?;
            emit_json(&record)
        }
        Commands::History { node } => {
            let engine = TransitionEngine::from_config(&config);
            emit_json(&engine.audit().history(&node)?)
        }
        Commands::Checkpoint { pipeline, list } => cmd_checkpoint(&config, &pipeline, list),
        Commands::Signal { action } => cmd_signal(&config, action).await,
        Commands::Identity { action } => cmd_identity(&config, action),
        Commands::Hook { action } => cmd_hook(&config, action),
        Commands::Merge {
            pipeline,
            repo_root,
            test_command,
            action,
        } => {
            let mut config = config;
            if let Some(root) = repo_root {
                config.repo_root = root;
            }
            if test_command.is_some() {
                config.test_command = test_command;
            }
            cmd_merge(&config, &pipeline, action).await
        }
    }
}

fn emit_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(ExitCode::SUCCESS)
}

fn cmd_validate(path: &Path) -> anyhow::Result<ExitCode> {
    let graph = PipelineGraph::load(path)?;
    let report = relay_engine::validate(&graph);
    for diag in report.errors.iter().chain(&report.warnings) {
        tracing::info!(rule = %diag.rule, severity = ?diag.severity, "{}", diag.message);
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "valid": report.is_valid(),
            "errors": report.errors,
            "warnings": report.warnings,
        }))?
    );
    Ok(if report.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

fn cmd_info(path: &Path) -> anyhow::Result<ExitCode> {
    let graph = PipelineGraph::load(path)?;
    let nodes: Vec<_> = graph
        .all_nodes()
        .map(|n| {
            json!({
                "id": n.id,
                "kind": n.kind.as_str(),
                "status": n.status.as_str(),
                "worker_role": n.worker_role,
                "retry_count": n.retry_count,
                "implemented_by": n.implemented_by,
            })
        })
        .collect();
    let edges: Vec<_> = graph
        .all_edges()
        .iter()
        .map(|e| json!({ "from": e.from, "to": e.to, "condition": e.condition }))
        .collect();
    emit_json(&json!({
        "name": graph.name,
        "spec_ref": graph.spec_ref,
        "checkpoint_seq": graph.checkpoint_seq,
        "nodes": nodes,
        "edges": edges,
    }))
}

fn cmd_checkpoint(config: &RelayConfig, pipeline: &Path, list: bool) -> anyhow::Result<ExitCode> {
    let dir = config.layout().checkpoints_dir();
    if list {
        let all: Vec<_> = relay_engine::list_checkpoints(pipeline, &dir)?
            .into_iter()
            .map(|(seq, path)| json!({ "seq": seq, "path": path }))
            .collect();
        return emit_json(&all);
    }
    let path = relay_engine::save_checkpoint(pipeline, &dir, &config.lock_policy())?;
    emit_json(&json!({ "checkpoint": path }))
}

async fn cmd_signal(config: &RelayConfig, action: SignalAction) -> anyhow::Result<ExitCode> {
    let dir = config.layout().signals_dir();
    match action {
        SignalAction::Emit {
            from,
            to,
            signal_type,
            payload,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| anyhow::anyhow!("--payload is not valid JSON: {e}"))?;
            let path = relay_engine::emit(&dir, &from, &to, SignalType::from(signal_type.as_str()), payload)?;
            emit_json(&json!({ "path": path }))
        }
        SignalAction::Await {
            from,
            to,
            signal_type,
            timeout_secs,
        } => {
            let filter = SignalFilter {
                from,
                to,
                signal_type: signal_type.as_deref().map(SignalType::from),
            };
            let outcome = relay_engine::await_signal(
                &dir,
                |s| filter.matches(s),
                Duration::from_secs(timeout_secs),
                config.poll_interval(),
            )
            .await?;
            match outcome {
                AwaitOutcome::Received(received) => emit_json(&received),
                AwaitOutcome::Timeout { waited } => {
                    println!("{}", json!({ "timeout": true, "waited_ms": waited.as_millis() as u64 }));
                    Ok(ExitCode::from(1))
                }
            }
        }
        SignalAction::List { processed } => {
            let signals = if processed {
                relay_engine::signal::processed(&dir).await?
            } else {
                relay_engine::signal::pending(&dir).await?
            };
            let all: Vec<_> = signals
                .into_iter()
                .map(|(file, signal)| json!({ "file": file, "signal": signal }))
                .collect();
            emit_json(&all)
        }
    }
}

fn cmd_identity(config: &RelayConfig, action: IdentityAction) -> anyhow::Result<ExitCode> {
    let registry = IdentityRegistry::from_config(config);
    match action {
        IdentityAction::Register {
            role,
            name,
            pid,
            session,
            worktree,
            node,
            predecessor,
        } => {
            let meta = IdentityMeta {
                session_ref: session,
                pid,
                worktree_path: worktree,
                hook_ref: None,
                node_id: node,
                predecessor_id: predecessor,
            };
            emit_json(&registry.register(&role, &name, meta)?)
        }
        IdentityAction::Heartbeat { role, name } => emit_json(&registry.heartbeat(&role, &name)?),
        IdentityAction::Stale { timeout_secs } => {
            let timeout = timeout_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.stale_timeout());
            let mut stale = registry.find_stale(timeout)?;
            for dead in registry.find_dead()? {
                if !stale.iter().any(|i| i.id == dead.id) {
                    stale.push(dead);
                }
            }
            emit_json(&stale)
        }
        IdentityAction::Crash { id } => emit_json(&registry.mark_crashed(&id)?),
        IdentityAction::Terminate { id } => emit_json(&registry.mark_terminated(&id)?),
        IdentityAction::List => emit_json(&registry.list()?),
        IdentityAction::Show { id } => emit_json(&registry.get(&id)?),
        IdentityAction::Lineage { id } => emit_json(&registry.lineage(&id)?),
    }
}

fn cmd_hook(config: &RelayConfig, action: HookAction) -> anyhow::Result<ExitCode> {
    let hooks = HookManager::from_config(config);
    match action {
        HookAction::Create { identity, phase } => emit_json(&hooks.create(&identity, phase)?),
        HookAction::Update {
            identity,
            phase,
            summary,
            instructions,
        } => emit_json(&hooks.update_phase(&identity, phase, &summary, instructions.as_deref())?),
        HookAction::Show { identity } => {
            let hook = hooks
                .read(&identity)?
                .ok_or_else(|| RelayError::HookNotFound(identity.clone()))?;
            emit_json(&hook)
        }
        HookAction::Brief { identity } => {
            let hook = hooks
                .read(&identity)?
                .ok_or_else(|| RelayError::HookNotFound(identity.clone()))?;
            emit_json(&json!({ "brief": relay_engine::build_resumption_brief(&hook) }))
        }
        HookAction::Resume {
            predecessor,
            successor,
        } => {
            let brief = hooks.resume_from(&predecessor, &successor)?;
            emit_json(&json!({ "predecessor": predecessor, "successor": successor, "brief": brief }))
        }
    }
}

async fn cmd_merge(config: &RelayConfig, pipeline: &Path, action: MergeAction) -> anyhow::Result<ExitCode> {
    let integrator = Arc::new(GitIntegrator::new(
        config.repo_root.clone(),
        config.test_command.clone(),
    ));
    let queue = MergeQueue::new(config, pipeline, integrator)
        .with_registry(IdentityRegistry::from_config(config));

    match action {
        MergeAction::Enqueue {
            identity,
            branch,
            node,
        } => emit_json(&queue.enqueue(&identity, &branch, &node)?),
        MergeAction::Next => {
            let outcome = queue.process_next().await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(match outcome {
                MergeOutcome::Conflict { .. } | MergeOutcome::Blocked { .. } => ExitCode::from(1),
                _ => ExitCode::SUCCESS,
            })
        }
        MergeAction::List { archived } => {
            if archived {
                emit_json(&queue.archived()?)
            } else {
                emit_json(&queue.list()?)
            }
        }
        MergeAction::Resolve { branch } => emit_json(&queue.resolve(&branch)?),
        MergeAction::Skip { branch } => emit_json(&queue.skip(&branch)?),
    }
}
