use super::RunOptions;
use crate::agent::task::ProcessingStatus;
use crate::agent::{CheckpointAnalyzer, KeywordTagger, TaskEvent, TaskRunner, TaskSnapshot};
use crate::config::{Config, get_config_path, load_config, save_config};
use crate::providers::scripted::ScriptedModelService;
use crate::providers::{AgentProfile, Message};
use crate::session::{FileSnapshotStore, SnapshotStore, read_snapshot};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub(super) async fn run_task(
    config: &Config,
    opts: RunOptions,
    out: &mut impl Write,
) -> Result<()> {
    let service = Arc::new(ScriptedModelService::from_file(&opts.script)?);
    let checkpoint = config.checkpoint.clone();
    let mut runner = TaskRunner::new(config, service, KeywordTagger::default, move || {
        CheckpointAnalyzer::new(checkpoint.clone())
    });

    let save_dir = opts
        .save_dir
        .or_else(|| config.storage.save_on_exit.then(|| config.snapshot_path()));
    if let Some(dir) = save_dir {
        let store = FileSnapshotStore::new(dir)?;
        runner = runner.with_snapshot_store(Arc::new(store));
    }

    let mut agent = AgentProfile::new(opts.agent, opts.model);
    agent.models = opts.alt_models;

    let mut handle = if let Some(path) = &opts.resume {
        let snapshot = read_snapshot(path)?;
        let handle = runner.resume(agent, snapshot)?;
        if let Some(text) = opts.message {
            handle.add_message(Message::user(text))?;
        }
        handle
    } else {
        let text = opts
            .message
            .context("either --message or --resume is required")?;
        runner.start(agent, vec![Message::user(text)])?
    };
    info!("Task {} running", handle.task_id());

    let mut terminal = None;
    loop {
        tokio::select! {
            event = handle.next_event() => {
                let Some(event) = event else { break };
                writeln!(out, "{}", serde_json::to_string(&event)?)?;
                if event.is_terminal() {
                    terminal = Some(event);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, aborting task {}", handle.task_id());
                handle.abort();
            }
        }
    }
    for event in handle.join().await {
        writeln!(out, "{}", serde_json::to_string(&event)?)?;
    }
    out.flush()?;

    match terminal {
        Some(TaskEvent::Completed { reason, snapshot }) => {
            info!(
                "Task {} finished ({}) after {} requests",
                snapshot.task_id, reason, snapshot.request_count
            );
            Ok(())
        }
        Some(TaskEvent::Failed { error, snapshot }) => {
            bail!("task {} failed: {}", snapshot.task_id, error)
        }
        _ => bail!("task ended without reporting an outcome"),
    }
}

pub(super) fn describe_snapshot(snapshot: &TaskSnapshot) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Task:        {}", snapshot.task_id);
    let _ = writeln!(text, "Started:     {}", snapshot.started_at.to_rfc3339());
    let _ = writeln!(text, "Requests:    {}", snapshot.request_count);
    let _ = writeln!(text, "Messages:    {}", snapshot.messages.len());
    if snapshot.run_indefinitely {
        let _ = writeln!(text, "Mode:        run indefinitely");
    }

    let cognition = &snapshot.cognition;
    let _ = writeln!(
        text,
        "Cognition:   {} every {} messages{}",
        on_off(cognition.enabled),
        cognition.frequency,
        processing_note(&cognition.status)
    );
    if !cognition.disabled_models.is_empty() {
        let _ = writeln!(
            text,
            "  disabled:  {}",
            cognition.disabled_models.join(", ")
        );
    }
    for (model, score) in &cognition.model_scores {
        let _ = writeln!(text, "  score:     {} {:.2}", model, score);
    }

    let memory = &snapshot.memory;
    let topics = memory
        .topic_state
        .get("topics")
        .and_then(serde_json::Value::as_object)
        .map_or(0, serde_json::Map::len);
    let _ = writeln!(
        text,
        "Memory:      {} ({} topics){}",
        on_off(memory.enabled),
        topics,
        processing_note(&memory.status)
    );
    text
}

fn on_off(enabled: bool) -> &'static str {
    if enabled { "enabled" } else { "disabled" }
}

fn processing_note(status: &ProcessingStatus) -> String {
    match status.elapsed(Utc::now()).and_then(|d| d.to_std().ok()) {
        Some(age) => format!(
            ", analysis in flight for {}",
            humantime::format_duration(Duration::from_secs(age.as_secs()))
        ),
        None => String::new(),
    }
}

pub(super) fn snapshot_show(file: &Path, json: bool) -> Result<()> {
    let snapshot = read_snapshot(file)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print!("{}", describe_snapshot(&snapshot));
    }
    Ok(())
}

pub(super) async fn snapshot_list(config: &Config, dir: Option<PathBuf>) -> Result<()> {
    let store = FileSnapshotStore::new(dir.unwrap_or_else(|| config.snapshot_path()))?;
    let ids = store.list().await?;
    if ids.is_empty() {
        println!("No snapshots in {}", store.dir().display());
    }
    for id in ids {
        println!("{}", id);
    }
    Ok(())
}

pub(super) fn config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub(super) fn config_validate(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate()?;
    println!("\u{2713} Configuration is valid");
    Ok(())
}

pub(super) fn config_init(config_path: Option<&Path>, force: bool) -> Result<()> {
    let path = match config_path {
        Some(p) => p.to_path_buf(),
        None => get_config_path()?,
    };
    if path.exists() && !force {
        bail!(
            "config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    save_config(&Config::default(), Some(&path))?;
    println!("\u{2713} Created config at {}", path.display());
    Ok(())
}
