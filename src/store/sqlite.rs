//! Embedded SQLite backend.
//!
//! The connection lives behind `Arc<Mutex>` and every access runs on tokio's
//! blocking thread pool via `spawn_blocking`, keeping synchronous SQLite I/O
//! off async worker threads. Typed errors (Conflict, NotFound, corrupt
//! columns) travel through the anyhow chain and are recovered at the handle
//! boundary.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{Connection, Row, params};
use serde_json::Value;

use crate::domain::{Event, Project, ProtocolRun, ProtocolStatus, StepRun, StepStatus};
use crate::errors::{OrchestratorError, Result};

use super::{
    EventContext, NewProject, NewProtocolRun, NewStepRun, SCHEMA, StepPatch, Store,
    clamp_recent_limit, decode_json, decode_policy, decode_runtime_state, encode_json,
    encode_policy, encode_runtime_state, event_metadata, parse_protocol_status, parse_step_status,
};

/// Async-safe handle to the orchestrator database.
#[derive(Clone)]
struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure against the database on a blocking thread. All data
    /// passed into `f` must be owned (`'static`). Typed orchestrator errors
    /// raised inside `f` are recovered from the anyhow chain here.
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")
        .map_err(OrchestratorError::storage)?;
        outcome.map_err(|e| match e.downcast::<OrchestratorError>() {
            Ok(typed) => typed,
            Err(other) => OrchestratorError::storage(other),
        })
    }
}

/// Embedded store backed by a single SQLite connection.
#[derive(Clone)]
pub struct SqliteStore {
    handle: DbHandle,
}

impl SqliteStore {
    /// Open (or create) the database at the given path and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database {}", path.display()))
            .map_err(OrchestratorError::storage)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests and throwaway runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("failed to open in-memory database")
            .map_err(OrchestratorError::storage)?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Db { conn };
        db.init().map_err(OrchestratorError::storage)?;
        Ok(Self {
            handle: DbHandle::new(db),
        })
    }
}

struct Db {
    conn: Connection,
}

// Raw row shapes: JSON columns stay as text until decoded, so a corrupt
// column reports the owning entity and id.

struct ProjectRow {
    id: i64,
    name: String,
    git_url: String,
    base_branch: String,
    local_path: Option<String>,
    ci_provider: Option<String>,
    secrets: Option<String>,
    default_models: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ProjectRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            git_url: row.get(2)?,
            base_branch: row.get(3)?,
            local_path: row.get(4)?,
            ci_provider: row.get(5)?,
            secrets: row.get(6)?,
            default_models: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_project(self) -> anyhow::Result<Project> {
        Ok(Project {
            secrets: decode_json("Project", self.id, "secrets", self.secrets)?,
            default_models: decode_json("Project", self.id, "default_models", self.default_models)?,
            id: self.id,
            name: self.name,
            git_url: self.git_url,
            base_branch: self.base_branch,
            local_path: self.local_path,
            ci_provider: self.ci_provider,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const PROJECT_COLUMNS: &str = "id, name, git_url, base_branch, local_path, ci_provider, secrets, default_models, created_at, updated_at";

struct RunRow {
    id: i64,
    project_id: i64,
    protocol_name: String,
    status: String,
    base_branch: String,
    worktree_path: Option<String>,
    protocol_root: Option<String>,
    description: Option<String>,
    template_config: Option<String>,
    template_source: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            protocol_name: row.get(2)?,
            status: row.get(3)?,
            base_branch: row.get(4)?,
            worktree_path: row.get(5)?,
            protocol_root: row.get(6)?,
            description: row.get(7)?,
            template_config: row.get(8)?,
            template_source: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_run(self) -> anyhow::Result<ProtocolRun> {
        Ok(ProtocolRun {
            status: parse_protocol_status(self.id, &self.status)?,
            template_config: decode_json(
                "ProtocolRun",
                self.id,
                "template_config",
                self.template_config,
            )?,
            template_source: decode_json(
                "ProtocolRun",
                self.id,
                "template_source",
                self.template_source,
            )?,
            id: self.id,
            project_id: self.project_id,
            protocol_name: self.protocol_name,
            base_branch: self.base_branch,
            worktree_path: self.worktree_path,
            protocol_root: self.protocol_root,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const RUN_COLUMNS: &str = "id, project_id, protocol_name, status, base_branch, worktree_path, protocol_root, description, template_config, template_source, created_at, updated_at";

struct StepRow {
    id: i64,
    protocol_run_id: i64,
    step_index: i64,
    step_name: String,
    step_type: String,
    status: String,
    retries: i64,
    model: Option<String>,
    engine_id: Option<String>,
    policy: Option<String>,
    runtime_state: Option<String>,
    summary: Option<String>,
    created_at: String,
    updated_at: String,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            protocol_run_id: row.get(1)?,
            step_index: row.get(2)?,
            step_name: row.get(3)?,
            step_type: row.get(4)?,
            status: row.get(5)?,
            retries: row.get(6)?,
            model: row.get(7)?,
            engine_id: row.get(8)?,
            policy: row.get(9)?,
            runtime_state: row.get(10)?,
            summary: row.get(11)?,
            created_at: row.get(12)?,
            updated_at: row.get(13)?,
        })
    }

    fn into_step(self) -> anyhow::Result<StepRun> {
        Ok(StepRun {
            status: parse_step_status(self.id, &self.status)?,
            policy: decode_policy(self.id, self.policy)?,
            runtime_state: decode_runtime_state(self.id, self.runtime_state)?,
            id: self.id,
            protocol_run_id: self.protocol_run_id,
            step_index: self.step_index,
            step_name: self.step_name,
            step_type: self.step_type,
            retries: self.retries,
            model: self.model,
            engine_id: self.engine_id,
            summary: self.summary,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const STEP_COLUMNS: &str = "id, protocol_run_id, step_index, step_name, step_type, status, retries, model, engine_id, policy, runtime_state, summary, created_at, updated_at";

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Option<String>, Event)> {
    let id: i64 = row.get(0)?;
    let metadata: Option<String> = row.get(5)?;
    Ok((
        id,
        metadata,
        Event {
            id,
            protocol_run_id: row.get(1)?,
            step_run_id: row.get(2)?,
            event_type: row.get(3)?,
            message: row.get(4)?,
            metadata: None,
            created_at: row.get(6)?,
            protocol_name: None,
            project_id: None,
            project_name: None,
        },
    ))
}

fn finish_event((id, metadata, mut event): (i64, Option<String>, Event)) -> anyhow::Result<Event> {
    event.metadata = decode_json("Event", id, "metadata", metadata)?;
    Ok(event)
}

const EVENT_COLUMNS: &str = "id, protocol_run_id, step_run_id, event_type, message, metadata, created_at";

fn not_found(entity: &'static str, id: i64) -> anyhow::Error {
    anyhow::Error::new(OrchestratorError::NotFound { entity, id })
}

fn conflict(entity: &'static str, id: i64, expected: String) -> anyhow::Error {
    anyhow::Error::new(OrchestratorError::Conflict {
        entity,
        id,
        expected,
    })
}

impl Db {
    fn init(&self) -> anyhow::Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("failed to enable foreign keys")?;
        self.conn
            .execute_batch(SCHEMA)
            .context("failed to apply schema")?;
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────

    fn create_project(&self, new: &NewProject) -> anyhow::Result<Project> {
        self.conn
            .execute(
                "INSERT INTO projects (name, git_url, base_branch, local_path, ci_provider, secrets, default_models)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    new.name,
                    new.git_url,
                    new.base_branch,
                    new.local_path,
                    new.ci_provider,
                    encode_json(&new.secrets),
                    encode_json(&new.default_models),
                ],
            )
            .context("failed to insert project")?;
        self.get_project(self.conn.last_insert_rowid())
    }

    fn get_project(&self, id: i64) -> anyhow::Result<Project> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"))
            .context("failed to prepare get_project")?;
        let mut rows = stmt
            .query_map(params![id], ProjectRow::from_row)
            .context("failed to query project")?;
        match rows.next() {
            Some(row) => row.context("failed to read project row")?.into_project(),
            None => Err(not_found("Project", id)),
        }
    }

    fn list_projects(&self) -> anyhow::Result<Vec<Project>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id"))
            .context("failed to prepare list_projects")?;
        let rows = stmt
            .query_map([], ProjectRow::from_row)
            .context("failed to query projects")?;
        let mut projects = Vec::new();
        for row in rows {
            projects.push(row.context("failed to read project row")?.into_project()?);
        }
        Ok(projects)
    }

    fn update_project_local_path(&self, id: i64, local_path: &str) -> anyhow::Result<Project> {
        let changed = self
            .conn
            .execute(
                "UPDATE projects SET local_path = ?1, updated_at = datetime('now') WHERE id = ?2",
                params![local_path, id],
            )
            .context("failed to update project local_path")?;
        if changed == 0 {
            return Err(not_found("Project", id));
        }
        self.get_project(id)
    }

    // ── Protocol runs ─────────────────────────────────────────────────

    fn create_protocol_run(&self, new: &NewProtocolRun) -> anyhow::Result<ProtocolRun> {
        self.conn
            .execute(
                "INSERT INTO protocol_runs (project_id, protocol_name, status, base_branch, worktree_path, protocol_root, description, template_config, template_source)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    new.project_id,
                    new.protocol_name,
                    new.status.as_str(),
                    new.base_branch,
                    new.worktree_path,
                    new.protocol_root,
                    new.description,
                    encode_json(&new.template_config),
                    encode_json(&new.template_source),
                ],
            )
            .context("failed to insert protocol run")?;
        self.get_protocol_run(self.conn.last_insert_rowid())
    }

    fn get_protocol_run(&self, id: i64) -> anyhow::Result<ProtocolRun> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {RUN_COLUMNS} FROM protocol_runs WHERE id = ?1"))
            .context("failed to prepare get_protocol_run")?;
        let mut rows = stmt
            .query_map(params![id], RunRow::from_row)
            .context("failed to query protocol run")?;
        match rows.next() {
            Some(row) => row.context("failed to read protocol run row")?.into_run(),
            None => Err(not_found("ProtocolRun", id)),
        }
    }

    fn find_protocol_run_by_name(&self, name: &str) -> anyhow::Result<Option<ProtocolRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM protocol_runs WHERE protocol_name = ?1 ORDER BY id DESC LIMIT 1"
            ))
            .context("failed to prepare find_protocol_run_by_name")?;
        let mut rows = stmt
            .query_map(params![name], RunRow::from_row)
            .context("failed to query protocol run by name")?;
        match rows.next() {
            Some(row) => Ok(Some(
                row.context("failed to read protocol run row")?.into_run()?,
            )),
            None => Ok(None),
        }
    }

    fn list_protocol_runs(&self, project_id: Option<i64>) -> anyhow::Result<Vec<ProtocolRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM protocol_runs WHERE (?1 IS NULL OR project_id = ?1) ORDER BY id"
            ))
            .context("failed to prepare list_protocol_runs")?;
        let rows = stmt
            .query_map(params![project_id], RunRow::from_row)
            .context("failed to query protocol runs")?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row.context("failed to read protocol run row")?.into_run()?);
        }
        Ok(runs)
    }

    fn update_protocol_status(
        &self,
        id: i64,
        status: ProtocolStatus,
        expected: Option<ProtocolStatus>,
    ) -> anyhow::Result<ProtocolRun> {
        let changed = match expected {
            Some(expected) => self
                .conn
                .execute(
                    "UPDATE protocol_runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2 AND status = ?3",
                    params![status.as_str(), id, expected.as_str()],
                )
                .context("failed to update protocol status")?,
            None => self
                .conn
                .execute(
                    "UPDATE protocol_runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![status.as_str(), id],
                )
                .context("failed to update protocol status")?,
        };
        if changed == 0 {
            return match (self.protocol_run_exists(id)?, expected) {
                (true, Some(expected)) => {
                    Err(conflict("ProtocolRun", id, expected.as_str().to_string()))
                }
                _ => Err(not_found("ProtocolRun", id)),
            };
        }
        self.get_protocol_run(id)
    }

    fn protocol_run_exists(&self, id: i64) -> anyhow::Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM protocol_runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("failed to check protocol run existence")?;
        Ok(count > 0)
    }

    fn update_protocol_paths(
        &self,
        id: i64,
        worktree_path: Option<&str>,
        protocol_root: Option<&str>,
    ) -> anyhow::Result<ProtocolRun> {
        let changed = self
            .conn
            .execute(
                "UPDATE protocol_runs SET worktree_path = COALESCE(?1, worktree_path), protocol_root = COALESCE(?2, protocol_root), updated_at = datetime('now') WHERE id = ?3",
                params![worktree_path, protocol_root, id],
            )
            .context("failed to update protocol paths")?;
        if changed == 0 {
            return Err(not_found("ProtocolRun", id));
        }
        self.get_protocol_run(id)
    }

    fn update_protocol_template(
        &self,
        id: i64,
        template_config: &Option<Value>,
        template_source: &Option<Value>,
    ) -> anyhow::Result<ProtocolRun> {
        let changed = self
            .conn
            .execute(
                "UPDATE protocol_runs SET template_config = ?1, template_source = COALESCE(?2, template_source), updated_at = datetime('now') WHERE id = ?3",
                params![encode_json(template_config), encode_json(template_source), id],
            )
            .context("failed to update protocol template")?;
        if changed == 0 {
            return Err(not_found("ProtocolRun", id));
        }
        self.get_protocol_run(id)
    }

    // ── Step runs ─────────────────────────────────────────────────────

    fn create_step_run(&self, new: &NewStepRun) -> anyhow::Result<StepRun> {
        self.conn
            .execute(
                "INSERT INTO step_runs (protocol_run_id, step_index, step_name, step_type, status, retries, model, engine_id, policy, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    new.protocol_run_id,
                    new.step_index,
                    new.step_name,
                    new.step_type,
                    new.status.as_str(),
                    new.retries,
                    new.model,
                    new.engine_id,
                    encode_policy(&new.policy),
                    new.summary,
                ],
            )
            .context("failed to insert step run")?;
        self.get_step_run(self.conn.last_insert_rowid())
    }

    fn get_step_run(&self, id: i64) -> anyhow::Result<StepRun> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {STEP_COLUMNS} FROM step_runs WHERE id = ?1"))
            .context("failed to prepare get_step_run")?;
        let mut rows = stmt
            .query_map(params![id], StepRow::from_row)
            .context("failed to query step run")?;
        match rows.next() {
            Some(row) => row.context("failed to read step run row")?.into_step(),
            None => Err(not_found("StepRun", id)),
        }
    }

    fn list_step_runs(&self, protocol_run_id: i64) -> anyhow::Result<Vec<StepRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM step_runs WHERE protocol_run_id = ?1 ORDER BY step_index, id"
            ))
            .context("failed to prepare list_step_runs")?;
        let rows = stmt
            .query_map(params![protocol_run_id], StepRow::from_row)
            .context("failed to query step runs")?;
        let mut steps = Vec::new();
        for row in rows {
            steps.push(row.context("failed to read step run row")?.into_step()?);
        }
        Ok(steps)
    }

    fn latest_step_run(&self, protocol_run_id: i64) -> anyhow::Result<Option<StepRun>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STEP_COLUMNS} FROM step_runs WHERE protocol_run_id = ?1 ORDER BY id DESC LIMIT 1"
            ))
            .context("failed to prepare latest_step_run")?;
        let mut rows = stmt
            .query_map(params![protocol_run_id], StepRow::from_row)
            .context("failed to query latest step run")?;
        match rows.next() {
            Some(row) => Ok(Some(row.context("failed to read step run row")?.into_step()?)),
            None => Ok(None),
        }
    }

    fn update_step_status(
        &self,
        id: i64,
        status: StepStatus,
        patch: &StepPatch,
        expected: Option<StepStatus>,
    ) -> anyhow::Result<StepRun> {
        let set_runtime_state = patch.runtime_state.is_some();
        let runtime_state = patch
            .runtime_state
            .as_ref()
            .and_then(encode_runtime_state);
        let base = "UPDATE step_runs SET
                status = ?1,
                retries = COALESCE(?2, retries),
                summary = COALESCE(?3, summary),
                model = COALESCE(?4, model),
                engine_id = COALESCE(?5, engine_id),
                runtime_state = CASE WHEN ?6 THEN ?7 ELSE runtime_state END,
                updated_at = datetime('now')
            WHERE id = ?8";
        let changed = match expected {
            Some(expected) => self
                .conn
                .execute(
                    &format!("{base} AND status = ?9"),
                    params![
                        status.as_str(),
                        patch.retries,
                        patch.summary,
                        patch.model,
                        patch.engine_id,
                        set_runtime_state,
                        runtime_state,
                        id,
                        expected.as_str(),
                    ],
                )
                .context("failed to update step status")?,
            None => self
                .conn
                .execute(
                    base,
                    params![
                        status.as_str(),
                        patch.retries,
                        patch.summary,
                        patch.model,
                        patch.engine_id,
                        set_runtime_state,
                        runtime_state,
                        id,
                    ],
                )
                .context("failed to update step status")?,
        };
        if changed == 0 {
            return match (self.step_run_exists(id)?, expected) {
                (true, Some(expected)) => Err(conflict("StepRun", id, expected.as_str().to_string())),
                _ => Err(not_found("StepRun", id)),
            };
        }
        self.get_step_run(id)
    }

    fn step_run_exists(&self, id: i64) -> anyhow::Result<bool> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM step_runs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .context("failed to check step run existence")?;
        Ok(count > 0)
    }

    // ── Events ────────────────────────────────────────────────────────

    fn append_event(
        &self,
        protocol_run_id: i64,
        event_type: &str,
        message: &str,
        ctx: &EventContext,
    ) -> anyhow::Result<Event> {
        self.conn
            .execute(
                "INSERT INTO events (protocol_run_id, step_run_id, event_type, message, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    protocol_run_id,
                    ctx.step_run_id,
                    event_type,
                    message,
                    event_metadata(ctx),
                ],
            )
            .context("failed to insert event")?;
        let id = self.conn.last_insert_rowid();
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"))
            .context("failed to prepare get_event")?;
        let mut rows = stmt
            .query_map(params![id], event_from_row)
            .context("failed to query event")?;
        match rows.next() {
            Some(row) => finish_event(row.context("failed to read event row")?),
            None => Err(not_found("Event", id)),
        }
    }

    fn list_events(&self, protocol_run_id: i64) -> anyhow::Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE protocol_run_id = ?1 ORDER BY id DESC"
            ))
            .context("failed to prepare list_events")?;
        let rows = stmt
            .query_map(params![protocol_run_id], event_from_row)
            .context("failed to query events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(finish_event(row.context("failed to read event row")?)?);
        }
        Ok(events)
    }

    fn list_recent_events(
        &self,
        limit: i64,
        project_id: Option<i64>,
    ) -> anyhow::Result<Vec<Event>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT e.id, e.protocol_run_id, e.step_run_id, e.event_type, e.message, e.metadata, e.created_at,
                        r.protocol_name, r.project_id, p.name
                 FROM events e
                 JOIN protocol_runs r ON r.id = e.protocol_run_id
                 JOIN projects p ON p.id = r.project_id
                 WHERE (?1 IS NULL OR r.project_id = ?1)
                 ORDER BY e.id DESC
                 LIMIT ?2",
            )
            .context("failed to prepare list_recent_events")?;
        let rows = stmt
            .query_map(params![project_id, limit], |row| {
                let (id, metadata, mut event) = event_from_row(row)?;
                event.protocol_name = row.get(7)?;
                event.project_id = row.get(8)?;
                event.project_name = row.get(9)?;
                Ok((id, metadata, event))
            })
            .context("failed to query recent events")?;
        let mut events = Vec::new();
        for row in rows {
            events.push(finish_event(row.context("failed to read event row")?)?);
        }
        Ok(events)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_project(&self, new: NewProject) -> Result<Project> {
        self.handle.call(move |db| db.create_project(&new)).await
    }

    async fn get_project(&self, id: i64) -> Result<Project> {
        self.handle.call(move |db| db.get_project(id)).await
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        self.handle.call(|db| db.list_projects()).await
    }

    async fn update_project_local_path(&self, id: i64, local_path: String) -> Result<Project> {
        self.handle
            .call(move |db| db.update_project_local_path(id, &local_path))
            .await
    }

    async fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun> {
        self.handle
            .call(move |db| db.create_protocol_run(&new))
            .await
    }

    async fn get_protocol_run(&self, id: i64) -> Result<ProtocolRun> {
        self.handle.call(move |db| db.get_protocol_run(id)).await
    }

    async fn find_protocol_run_by_name(&self, name: String) -> Result<Option<ProtocolRun>> {
        self.handle
            .call(move |db| db.find_protocol_run_by_name(&name))
            .await
    }

    async fn list_protocol_runs(&self, project_id: i64) -> Result<Vec<ProtocolRun>> {
        self.handle
            .call(move |db| db.list_protocol_runs(Some(project_id)))
            .await
    }

    async fn list_all_protocol_runs(&self) -> Result<Vec<ProtocolRun>> {
        self.handle.call(|db| db.list_protocol_runs(None)).await
    }

    async fn update_protocol_status(
        &self,
        id: i64,
        status: ProtocolStatus,
        expected: Option<ProtocolStatus>,
    ) -> Result<ProtocolRun> {
        self.handle
            .call(move |db| db.update_protocol_status(id, status, expected))
            .await
    }

    async fn update_protocol_paths(
        &self,
        id: i64,
        worktree_path: Option<String>,
        protocol_root: Option<String>,
    ) -> Result<ProtocolRun> {
        self.handle
            .call(move |db| {
                db.update_protocol_paths(id, worktree_path.as_deref(), protocol_root.as_deref())
            })
            .await
    }

    async fn update_protocol_template(
        &self,
        id: i64,
        template_config: Option<Value>,
        template_source: Option<Value>,
    ) -> Result<ProtocolRun> {
        self.handle
            .call(move |db| db.update_protocol_template(id, &template_config, &template_source))
            .await
    }

    async fn create_step_run(&self, new: NewStepRun) -> Result<StepRun> {
        self.handle.call(move |db| db.create_step_run(&new)).await
    }

    async fn get_step_run(&self, id: i64) -> Result<StepRun> {
        self.handle.call(move |db| db.get_step_run(id)).await
    }

    async fn list_step_runs(&self, protocol_run_id: i64) -> Result<Vec<StepRun>> {
        self.handle
            .call(move |db| db.list_step_runs(protocol_run_id))
            .await
    }

    async fn latest_step_run(&self, protocol_run_id: i64) -> Result<Option<StepRun>> {
        self.handle
            .call(move |db| db.latest_step_run(protocol_run_id))
            .await
    }

    async fn update_step_status(
        &self,
        id: i64,
        status: StepStatus,
        patch: StepPatch,
        expected: Option<StepStatus>,
    ) -> Result<StepRun> {
        self.handle
            .call(move |db| db.update_step_status(id, status, &patch, expected))
            .await
    }

    async fn append_event(
        &self,
        protocol_run_id: i64,
        event_type: String,
        message: String,
        ctx: EventContext,
    ) -> Result<Event> {
        self.handle
            .call(move |db| db.append_event(protocol_run_id, &event_type, &message, &ctx))
            .await
    }

    async fn list_events(&self, protocol_run_id: i64) -> Result<Vec<Event>> {
        self.handle
            .call(move |db| db.list_events(protocol_run_id))
            .await
    }

    async fn list_recent_events(
        &self,
        limit: usize,
        project_id: Option<i64>,
    ) -> Result<Vec<Event>> {
        let limit = clamp_recent_limit(limit);
        self.handle
            .call(move |db| db.list_recent_events(limit, project_id))
            .await
    }
}
