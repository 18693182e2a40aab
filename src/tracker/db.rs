use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use super::Tracker;
use super::models::*;

/// Async-safe handle to the local tracker database.
///
/// Wraps `TrackerDb` behind `Arc<Mutex>` and runs all access on tokio's
/// blocking thread pool via `spawn_blocking`, so synchronous SQLite I/O never
/// stalls the control loop's runtime threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<TrackerDb>>,
}

impl DbHandle {
    pub fn new(db: TrackerDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Open the database at `path` and wrap it in a handle.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(TrackerDb::new(path)?))
    }

    /// Run a closure with access to the database on a blocking thread.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&TrackerDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("Tracker DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("Tracker DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For CLI commands and tests,
    /// never from the control loop.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, TrackerDb>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Tracker DB lock poisoned: {}", e))
    }
}

#[async_trait]
impl Tracker for DbHandle {
    async fn list_items(&self, state: PrimaryState) -> Result<Vec<WorkItem>> {
        self.call(move |db| db.list_items(state)).await
    }

    async fn get_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let id = id.to_string();
        self.call(move |db| db.get_item(&id)).await
    }

    async fn compare_and_set_state(
        &self,
        id: &str,
        expected: PrimaryState,
        next: PrimaryState,
    ) -> Result<bool> {
        let id = id.to_string();
        self.call(move |db| db.compare_and_set_state(&id, expected, next))
            .await
    }

    async fn save_progress(&self, item: &WorkItem) -> Result<()> {
        let item = item.clone();
        self.call(move |db| db.save_progress(&item)).await
    }

    async fn add_label(&self, id: &str, label: &str) -> Result<()> {
        let (id, label) = (id.to_string(), label.to_string());
        self.call(move |db| db.add_label(&id, &label)).await
    }

    async fn remove_label(&self, id: &str, label: &str) -> Result<()> {
        let (id, label) = (id.to_string(), label.to_string());
        self.call(move |db| db.remove_label(&id, &label)).await
    }

    async fn add_comment(&self, id: &str, body: &str) -> Result<()> {
        let (id, body) = (id.to_string(), body.to_string());
        self.call(move |db| db.add_comment(&id, &body)).await
    }

    async fn list_comments(&self, id: &str) -> Result<Vec<Comment>> {
        let id = id.to_string();
        self.call(move |db| db.list_comments(&id)).await
    }

    async fn list_artifacts(&self, state: ReviewState) -> Result<Vec<ChangeArtifact>> {
        self.call(move |db| db.list_artifacts(state)).await
    }

    async fn artifact_for_item(&self, item_id: &str) -> Result<Option<ChangeArtifact>> {
        let item_id = item_id.to_string();
        self.call(move |db| db.artifact_for_item(&item_id)).await
    }

    async fn merge_artifact(&self, artifact_id: &str) -> Result<MergeOutcome> {
        let artifact_id = artifact_id.to_string();
        self.call(move |db| db.merge_artifact(&artifact_id)).await
    }
}

const ITEM_COLUMNS: &str = "id, title, description, state, phase, dependency_refs, checkpoint, labels, priority, fix_iterations, merge_retries, created_at, updated_at";

const ARTIFACT_COLUMNS: &str = "id, parent_item_id, review_state, size_metric, mergeable, last_updated";

pub struct TrackerDb {
    conn: Connection,
}

impl TrackerDb {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open tracker database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory tracker database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                PRAGMA journal_mode = WAL;

                CREATE TABLE IF NOT EXISTS items (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    title TEXT NOT NULL,
                    description TEXT NOT NULL DEFAULT '',
                    state TEXT NOT NULL DEFAULT 'proposed',
                    phase TEXT NOT NULL DEFAULT 'none',
                    dependency_refs TEXT NOT NULL DEFAULT '[]',
                    checkpoint TEXT,
                    labels TEXT NOT NULL DEFAULT '[]',
                    priority INTEGER NOT NULL DEFAULT 0,
                    fix_iterations INTEGER NOT NULL DEFAULT 0,
                    merge_retries INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS comments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    item_id TEXT NOT NULL,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS artifacts (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    parent_item_id TEXT NOT NULL,
                    review_state TEXT NOT NULL DEFAULT 'awaiting_review',
                    size_metric INTEGER NOT NULL DEFAULT 0,
                    mergeable INTEGER NOT NULL DEFAULT 1,
                    last_updated TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_items_state ON items(state);
                CREATE INDEX IF NOT EXISTS idx_comments_item ON comments(item_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_parent ON artifacts(parent_item_id);
                CREATE INDEX IF NOT EXISTS idx_artifacts_state ON artifacts(review_state);
                ",
            )
            .context("Failed to create tracker tables")?;
        Ok(())
    }

    // ── Item CRUD ─────────────────────────────────────────────────────

    pub fn create_item(
        &self,
        title: &str,
        description: &str,
        state: PrimaryState,
        priority: i32,
        dependency_refs: &BTreeSet<String>,
    ) -> Result<WorkItem> {
        let now = Utc::now().to_rfc3339();
        let deps = serde_json::to_string(dependency_refs).context("Failed to encode dependencies")?;
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        // Placeholder id is unique per insert; replaced with the seq-derived id below.
        let placeholder = format!("pending-{}", uuid::Uuid::new_v4());
        tx.execute(
            "INSERT INTO items (id, title, description, state, priority, dependency_refs, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![placeholder, title, description, state.as_str(), priority, deps, now],
        )
        .context("Failed to insert item")?;
        let seq = tx.last_insert_rowid();
        let id = format!("fm-{}", seq);
        tx.execute("UPDATE items SET id = ?1 WHERE seq = ?2", params![id, seq])
            .context("Failed to assign item id")?;
        tx.commit().context("Failed to commit item insert")?;
        self.get_item(&id)?.context("Item not found after insert")
    }

    pub fn list_items(&self, state: PrimaryState) -> Result<Vec<WorkItem>> {
        let sql = format!(
            "SELECT {} FROM items WHERE state = ?1 ORDER BY priority, seq",
            ITEM_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_items")?;
        let rows = stmt
            .query_map(params![state.as_str()], ItemRow::from_row)
            .context("Failed to query items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read item row")?.into_item()?);
        }
        Ok(items)
    }

    pub fn list_all_items(&self) -> Result<Vec<WorkItem>> {
        let sql = format!("SELECT {} FROM items ORDER BY seq", ITEM_COLUMNS);
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_all_items")?;
        let rows = stmt
            .query_map([], ItemRow::from_row)
            .context("Failed to query items")?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row.context("Failed to read item row")?.into_item()?);
        }
        Ok(items)
    }

    pub fn get_item(&self, id: &str) -> Result<Option<WorkItem>> {
        let sql = format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ItemRow::from_row)
            .optional()
            .context("Failed to query item")?;
        row.map(ItemRow::into_item).transpose()
    }

    pub fn compare_and_set_state(
        &self,
        id: &str,
        expected: PrimaryState,
        next: PrimaryState,
    ) -> Result<bool> {
        let count = self
            .conn
            .execute(
                "UPDATE items SET state = ?1, updated_at = ?2 WHERE id = ?3 AND state = ?4",
                params![next.as_str(), Utc::now().to_rfc3339(), id, expected.as_str()],
            )
            .context("Failed to update item state")?;
        Ok(count == 1)
    }

    pub fn save_progress(&self, item: &WorkItem) -> Result<()> {
        let checkpoint = item
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("Failed to encode checkpoint")?;
        let count = self
            .conn
            .execute(
                "UPDATE items SET phase = ?1, checkpoint = ?2, fix_iterations = ?3, merge_retries = ?4, updated_at = ?5
                 WHERE id = ?6",
                params![
                    item.phase.as_str(),
                    checkpoint,
                    item.fix_iterations,
                    item.merge_retries,
                    Utc::now().to_rfc3339(),
                    item.id
                ],
            )
            .context("Failed to save item progress")?;
        if count == 0 {
            anyhow::bail!("Item {} not found", item.id);
        }
        Ok(())
    }

    pub fn add_label(&self, id: &str, label: &str) -> Result<()> {
        self.update_labels(id, |labels| {
            labels.insert(label.to_string());
        })
    }

    pub fn remove_label(&self, id: &str, label: &str) -> Result<()> {
        self.update_labels(id, |labels| {
            labels.remove(label);
        })
    }

    fn update_labels(&self, id: &str, f: impl FnOnce(&mut BTreeSet<String>)) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let raw: Option<String> = tx
            .query_row("SELECT labels FROM items WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .context("Failed to read labels")?;
        let Some(raw) = raw else {
            anyhow::bail!("Item {} not found", id);
        };
        let mut labels: BTreeSet<String> =
            serde_json::from_str(&raw).context("Failed to parse labels JSON")?;
        f(&mut labels);
        tx.execute(
            "UPDATE items SET labels = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&labels).context("Failed to encode labels")?,
                Utc::now().to_rfc3339(),
                id
            ],
        )
        .context("Failed to write labels")?;
        tx.commit().context("Failed to commit label update")?;
        Ok(())
    }

    // ── Comments ──────────────────────────────────────────────────────

    pub fn add_comment(&self, id: &str, body: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO comments (item_id, body, created_at) VALUES (?1, ?2, ?3)",
                params![id, body, Utc::now().to_rfc3339()],
            )
            .context("Failed to insert comment")?;
        Ok(())
    }

    pub fn list_comments(&self, id: &str) -> Result<Vec<Comment>> {
        let mut stmt = self
            .conn
            .prepare("SELECT item_id, body, created_at FROM comments WHERE item_id = ?1 ORDER BY id")
            .context("Failed to prepare list_comments")?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query comments")?;
        let mut comments = Vec::new();
        for row in rows {
            let (item_id, body, created_at) = row.context("Failed to read comment row")?;
            comments.push(Comment {
                item_id,
                body,
                created_at: parse_timestamp(&created_at)?,
            });
        }
        Ok(comments)
    }

    // ── Artifacts ─────────────────────────────────────────────────────

    pub fn create_artifact(&self, parent_item_id: &str, size_metric: u64) -> Result<ChangeArtifact> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        let placeholder = format!("pending-{}", uuid::Uuid::new_v4());
        tx.execute(
            "INSERT INTO artifacts (id, parent_item_id, size_metric, last_updated) VALUES (?1, ?2, ?3, ?4)",
            params![placeholder, parent_item_id, size_metric as i64, Utc::now().to_rfc3339()],
        )
        .context("Failed to insert artifact")?;
        let seq = tx.last_insert_rowid();
        let id = format!("cr-{}", seq);
        tx.execute("UPDATE artifacts SET id = ?1 WHERE seq = ?2", params![id, seq])
            .context("Failed to assign artifact id")?;
        tx.commit().context("Failed to commit artifact insert")?;
        self.get_artifact(&id)?
            .context("Artifact not found after insert")
    }

    pub fn get_artifact(&self, id: &str) -> Result<Option<ChangeArtifact>> {
        let sql = format!("SELECT {} FROM artifacts WHERE id = ?1", ARTIFACT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], ArtifactRow::from_row)
            .optional()
            .context("Failed to query artifact")?;
        row.map(ArtifactRow::into_artifact).transpose()
    }

    pub fn set_artifact_state(&self, id: &str, state: ReviewState) -> Result<ChangeArtifact> {
        self.conn
            .execute(
                "UPDATE artifacts SET review_state = ?1, last_updated = ?2 WHERE id = ?3",
                params![state.as_str(), Utc::now().to_rfc3339(), id],
            )
            .context("Failed to update artifact state")?;
        self.get_artifact(id)?
            .context("Artifact not found after update")
    }

    pub fn set_artifact_mergeable(&self, id: &str, mergeable: bool) -> Result<()> {
        self.conn
            .execute(
                "UPDATE artifacts SET mergeable = ?1, last_updated = ?2 WHERE id = ?3",
                params![mergeable, Utc::now().to_rfc3339(), id],
            )
            .context("Failed to update artifact mergeability")?;
        Ok(())
    }

    pub fn list_artifacts(&self, state: ReviewState) -> Result<Vec<ChangeArtifact>> {
        let sql = format!(
            "SELECT {} FROM artifacts WHERE review_state = ?1 ORDER BY seq",
            ARTIFACT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql).context("Failed to prepare list_artifacts")?;
        let rows = stmt
            .query_map(params![state.as_str()], ArtifactRow::from_row)
            .context("Failed to query artifacts")?;
        let mut artifacts = Vec::new();
        for row in rows {
            artifacts.push(row.context("Failed to read artifact row")?.into_artifact()?);
        }
        Ok(artifacts)
    }

    pub fn artifact_for_item(&self, item_id: &str) -> Result<Option<ChangeArtifact>> {
        let sql = format!(
            "SELECT {} FROM artifacts WHERE parent_item_id = ?1 ORDER BY seq DESC LIMIT 1",
            ARTIFACT_COLUMNS
        );
        let row = self
            .conn
            .query_row(&sql, params![item_id], ArtifactRow::from_row)
            .optional()
            .context("Failed to query artifact for item")?;
        row.map(ArtifactRow::into_artifact).transpose()
    }

    pub fn merge_artifact(&self, id: &str) -> Result<MergeOutcome> {
        let artifact = self.get_artifact(id)?.context("Artifact not found")?;
        match artifact.review_state {
            ReviewState::Merged => return Ok(MergeOutcome::Merged),
            ReviewState::Approved => {}
            other => anyhow::bail!("Artifact {} is {} and cannot be merged", id, other),
        }
        if !artifact.mergeable {
            return Ok(MergeOutcome::Conflict(format!(
                "artifact {} has merge conflicts",
                id
            )));
        }
        self.set_artifact_state(id, ReviewState::Merged)?;
        Ok(MergeOutcome::Merged)
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

/// Intermediate row struct for reading items before converting the
/// string/JSON columns into typed values.
struct ItemRow {
    id: String,
    title: String,
    description: String,
    state: String,
    phase: String,
    dependency_refs: String,
    checkpoint: Option<String>,
    labels: String,
    priority: i32,
    fix_iterations: u32,
    merge_retries: u32,
    created_at: String,
    updated_at: String,
}

impl ItemRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            state: row.get(3)?,
            phase: row.get(4)?,
            dependency_refs: row.get(5)?,
            checkpoint: row.get(6)?,
            labels: row.get(7)?,
            priority: row.get(8)?,
            fix_iterations: row.get(9)?,
            merge_retries: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_item(self) -> Result<WorkItem> {
        let primary_state = PrimaryState::from_str(&self.state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse item state")?;
        let phase = Phase::from_str(&self.phase)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse item phase")?;
        let dependency_refs = serde_json::from_str(&self.dependency_refs)
            .context("Failed to parse dependency_refs JSON")?;
        let checkpoint = self
            .checkpoint
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .context("Failed to parse checkpoint JSON")?;
        let labels = serde_json::from_str(&self.labels).context("Failed to parse labels JSON")?;

        Ok(WorkItem {
            id: self.id,
            title: self.title,
            description: self.description,
            primary_state,
            phase,
            dependency_refs,
            checkpoint,
            labels,
            priority: self.priority,
            fix_iterations: self.fix_iterations,
            merge_retries: self.merge_retries,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

struct ArtifactRow {
    id: String,
    parent_item_id: String,
    review_state: String,
    size_metric: i64,
    mergeable: bool,
    last_updated: String,
}

impl ArtifactRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            parent_item_id: row.get(1)?,
            review_state: row.get(2)?,
            size_metric: row.get(3)?,
            mergeable: row.get(4)?,
            last_updated: row.get(5)?,
        })
    }

    fn into_artifact(self) -> Result<ChangeArtifact> {
        let review_state = ReviewState::from_str(&self.review_state)
            .map_err(|e| anyhow::anyhow!(e))
            .context("Failed to parse artifact review state")?;
        Ok(ChangeArtifact {
            id: self.id,
            parent_item_id: self.parent_item_id,
            review_state,
            size_metric: self.size_metric.max(0) as u64,
            mergeable: self.mergeable,
            last_updated: parse_timestamp(&self.last_updated)?,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
