//! Directory-backed signal mailbox.
//!
//! Writers drop `*.json` files into `.foreman/signals/`. The control loop
//! drains them oldest-first by file name, deleting each file before acting
//! on it so a crash mid-dispatch never replays a message.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::types::SignalMessage;
use crate::errors::SignalParseError;
use crate::util::write_atomic;

/// Orders messages sent from one process within the same microsecond.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

pub struct Mailbox {
    dir: PathBuf,
}

impl Mailbox {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pending signal files, oldest first.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let pattern = self.dir.join("*.json");
        let pattern = pattern.to_string_lossy();
        let mut files: Vec<PathBuf> = glob::glob(&pattern)
            .with_context(|| format!("Invalid signal glob {}", pattern))?
            .filter_map(|entry| entry.ok())
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| !n.to_string_lossy().starts_with('.'))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Read every pending message and delete its file. Malformed files are
    /// logged and deleted too; they never reach dispatch.
    pub fn drain(&self) -> Result<Vec<SignalMessage>> {
        let mut messages = Vec::new();
        for path in self.pending()? {
            let parsed = read_signal(&path);
            if let Err(e) = std::fs::remove_file(&path)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                // Leaving it would replay the message next iteration.
                tracing::error!(path = %path.display(), error = %e, "Failed to delete signal file; skipping it");
                continue;
            }
            match parsed {
                Ok(msg) => {
                    tracing::debug!(id = %msg.id, action = %msg.action, "Signal received");
                    messages.push(msg);
                }
                Err(e) => tracing::warn!(error = %e, "Dropping malformed signal"),
            }
        }
        Ok(messages)
    }

    /// Write a message atomically under a time-ordered name. Returns the path.
    pub fn send(&self, mut message: SignalMessage) -> Result<PathBuf> {
        let now = Utc::now();
        if message.id.is_empty() {
            let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
            message.id = format!(
                "{}-{}-{:06}",
                now.format("%Y%m%dT%H%M%S%6f"),
                std::process::id(),
                seq
            );
        }
        message.created_at.get_or_insert(now);
        let path = self.dir.join(format!("{}.json", message.id));
        let json = serde_json::to_vec_pretty(&message).context("Failed to serialize signal")?;
        write_atomic(&path, &json)?;
        tracing::debug!(path = %path.display(), action = %message.action, "Signal written");
        Ok(path)
    }
}

/// Parse one signal file, filling `id` and `created_at` when omitted.
pub fn read_signal(path: &Path) -> Result<SignalMessage, SignalParseError> {
    let content = std::fs::read_to_string(path).map_err(|source| SignalParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut message: SignalMessage =
        serde_json::from_str(&content).map_err(|source| SignalParseError::Json {
            path: path.to_path_buf(),
            source,
        })?;
    if message.id.is_empty() {
        message.id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    if message.created_at.is_none() {
        message.created_at = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);
    }
    message.validate()?;
    Ok(message)
}
