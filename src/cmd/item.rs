//! Local tracker management — `foreman item`, `foreman artifact`.

use anyhow::{Context, Result, bail};
use console::style;
use std::collections::BTreeSet;
use std::path::Path;

use foreman::config::Config;
use foreman::tracker::{DbHandle, PrimaryState, ReviewState, WorkItem};

use crate::{ArtifactCommands, ItemCommands};

fn open_tracker(project_dir: &Path) -> Result<DbHandle> {
    let config = Config::new(project_dir.to_path_buf(), false)?;
    if !config.tracker_db.exists() {
        bail!(
            "No tracker database at {}. Run `foreman init` first.",
            config.tracker_db.display()
        );
    }
    DbHandle::open(&config.tracker_db)
}

fn state_style(state: PrimaryState) -> console::StyledObject<&'static str> {
    let s = style(state.as_str());
    match state {
        PrimaryState::Ready => s.green(),
        PrimaryState::InProgress => s.cyan(),
        PrimaryState::Blocked => s.red(),
        PrimaryState::Closed => s.dim(),
        PrimaryState::Proposed | PrimaryState::Curated => s.yellow(),
    }
}

fn print_item_line(item: &WorkItem) {
    println!(
        "  {:<8} {:<12} p{:<3} {}",
        style(&item.id).bold(),
        state_style(item.primary_state),
        item.priority,
        item.title
    );
}

pub async fn cmd_item(project_dir: &Path, command: ItemCommands) -> Result<()> {
    let db = open_tracker(project_dir)?;

    match command {
        ItemCommands::Add {
            title,
            description,
            priority,
            state,
            depends_on,
        } => {
            let state: PrimaryState = state.parse().map_err(anyhow::Error::msg)?;
            if matches!(state, PrimaryState::InProgress | PrimaryState::Closed) {
                bail!("New items must start as proposed, curated, ready or blocked");
            }
            let deps: BTreeSet<String> = depends_on.into_iter().collect();
            let item = db
                .call(move |db| db.create_item(&title, &description, state, priority, &deps))
                .await?;
            println!("Created {} ({})", style(&item.id).bold(), item.primary_state);
        }
        ItemCommands::List { state } => {
            let items = match state {
                Some(state) => {
                    let state: PrimaryState = state.parse().map_err(anyhow::Error::msg)?;
                    db.call(move |db| db.list_items(state)).await?
                }
                None => db.call(|db| db.list_all_items()).await?,
            };
            if items.is_empty() {
                println!("No items.");
                return Ok(());
            }
            for item in &items {
                print_item_line(item);
            }
        }
        ItemCommands::Show { id } => {
            let lookup = id.clone();
            let (item, comments, artifact) = db
                .call(move |db| {
                    let item = db.get_item(&lookup)?;
                    let comments = db.list_comments(&lookup)?;
                    let artifact = db.artifact_for_item(&lookup)?;
                    Ok((item, comments, artifact))
                })
                .await?;
            let item = item.with_context(|| format!("Item {} not found", id))?;

            println!();
            println!("{} {}", style(&item.id).bold().cyan(), item.title);
            println!("─────────────────────────");
            println!("State: {}", state_style(item.primary_state));
            println!("Phase: {}", item.phase);
            println!("Priority: {}", item.priority);
            if !item.labels.is_empty() {
                let labels: Vec<&str> = item.labels.iter().map(String::as_str).collect();
                println!("Labels: {}", labels.join(", "));
            }
            if !item.dependency_refs.is_empty() {
                let deps: Vec<&str> = item.dependency_refs.iter().map(String::as_str).collect();
                println!("Depends on: {}", deps.join(", "));
            }
            if let Some(checkpoint) = &item.checkpoint {
                println!("Checkpoint: {}", checkpoint.stage);
            }
            if item.fix_iterations > 0 || item.merge_retries > 0 {
                println!(
                    "Fix iterations: {}  Merge retries: {}",
                    item.fix_iterations, item.merge_retries
                );
            }
            if let Some(artifact) = artifact {
                println!(
                    "Artifact: {} ({}{})",
                    artifact.id,
                    artifact.review_state,
                    if artifact.mergeable { "" } else { ", conflicted" }
                );
            }
            if !item.description.is_empty() {
                println!();
                println!("{}", item.description);
            }
            if !comments.is_empty() {
                println!();
                println!("Comments:");
                for comment in comments {
                    println!(
                        "  {} {}",
                        style(comment.created_at.format("%Y-%m-%d %H:%M")).dim(),
                        comment.body
                    );
                }
            }
            println!();
        }
    }

    Ok(())
}

pub async fn cmd_artifact(project_dir: &Path, command: ArtifactCommands) -> Result<()> {
    let db = open_tracker(project_dir)?;

    match command {
        ArtifactCommands::Add { item, size } => {
            let artifact = db
                .call(move |db| {
                    db.get_item(&item)?
                        .with_context(|| format!("Item {} not found", item))?;
                    db.create_artifact(&item, size)
                })
                .await?;
            println!(
                "Created {} for {} ({})",
                style(&artifact.id).bold(),
                artifact.parent_item_id,
                artifact.review_state
            );
        }
        ArtifactCommands::Set {
            id,
            state,
            mergeable,
        } => {
            if state.is_none() && mergeable.is_none() {
                bail!("Nothing to update: pass --state and/or --mergeable");
            }
            let state: Option<ReviewState> =
                state.map(|s| s.parse()).transpose().map_err(anyhow::Error::msg)?;
            let artifact = db
                .call(move |db| {
                    db.get_artifact(&id)?
                        .with_context(|| format!("Artifact {} not found", id))?;
                    if let Some(mergeable) = mergeable {
                        db.set_artifact_mergeable(&id, mergeable)?;
                    }
                    if let Some(state) = state {
                        db.set_artifact_state(&id, state)?;
                    }
                    db.get_artifact(&id)?
                        .with_context(|| format!("Artifact {} not found", id))
                })
                .await?;
            println!(
                "{} is {}{}",
                style(&artifact.id).bold(),
                artifact.review_state,
                if artifact.mergeable { "" } else { " (conflicted)" }
            );
        }
    }

    Ok(())
}
