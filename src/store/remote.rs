//! Remote libsql/sqld backend.
//!
//! Speaks the same SQL dialect and schema as the embedded backend over a
//! client-server connection, so deployments can move between a local file and
//! a hosted database without data model changes. Row decoding goes through
//! the shared column codecs in the parent module.

use anyhow::Context;
use async_trait::async_trait;
use libsql::{Builder, Connection, Row, params};
use serde_json::Value;

use crate::domain::{Event, Project, ProtocolRun, ProtocolStatus, StepRun, StepStatus};
use crate::errors::{OrchestratorError, Result};

use super::{
    EventContext, NewProject, NewProtocolRun, NewStepRun, SCHEMA, StepPatch, Store,
    clamp_recent_limit, decode_json, decode_policy, decode_runtime_state, encode_json,
    encode_policy, encode_runtime_state, event_metadata, parse_protocol_status, parse_step_status,
};

/// Store backed by a remote sqld instance.
#[derive(Clone)]
pub struct RemoteStore {
    conn: Connection,
}

impl RemoteStore {
    /// Connect to a remote database and apply the schema.
    pub async fn connect(url: &str, auth_token: &str) -> Result<Self> {
        let db = Builder::new_remote(url.to_string(), auth_token.to_string())
            .build()
            .await
            .with_context(|| format!("failed to open remote database {}", url))
            .map_err(OrchestratorError::storage)?;
        let conn = db
            .connect()
            .context("failed to connect to remote database")
            .map_err(OrchestratorError::storage)?;
        conn.execute_batch(SCHEMA)
            .await
            .context("failed to apply schema")
            .map_err(OrchestratorError::storage)?;
        Ok(Self { conn })
    }
}

fn recover<T>(res: anyhow::Result<T>) -> Result<T> {
    res.map_err(|e| match e.downcast::<OrchestratorError>() {
        Ok(typed) => typed,
        Err(other) => OrchestratorError::storage(other),
    })
}

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

const PROJECT_COLUMNS: &str = "id, name, git_url, base_branch, local_path, ci_provider, secrets, default_models, created_at, updated_at";

fn project_from_row(row: &Row) -> anyhow::Result<Project> {
    let id: i64 = row.get(0).context("project id")?;
    let secrets: Option<String> = row.get(6).context("project secrets")?;
    let default_models: Option<String> = row.get(7).context("project default_models")?;
    Ok(Project {
        secrets: decode_json("Project", id, "secrets", secrets)?,
        default_models: decode_json("Project", id, "default_models", default_models)?,
        id,
        name: row.get(1).context("project name")?,
        git_url: row.get(2).context("project git_url")?,
        base_branch: row.get(3).context("project base_branch")?,
        local_path: row.get(4).context("project local_path")?,
        ci_provider: row.get(5).context("project ci_provider")?,
        created_at: row.get(8).context("project created_at")?,
        updated_at: row.get(9).context("project updated_at")?,
    })
}

const RUN_COLUMNS: &str = "id, project_id, protocol_name, status, base_branch, worktree_path, protocol_root, description, template_config, template_source, created_at, updated_at";

fn run_from_row(row: &Row) -> anyhow::Result<ProtocolRun> {
    let id: i64 = row.get(0).context("protocol run id")?;
    let status: String = row.get(3).context("protocol run status")?;
    let template_config: Option<String> = row.get(8).context("protocol run template_config")?;
    let template_source: Option<String> = row.get(9).context("protocol run template_source")?;
    Ok(ProtocolRun {
        status: parse_protocol_status(id, &status)?,
        template_config: decode_json("ProtocolRun", id, "template_config", template_config)?,
        template_source: decode_json("ProtocolRun", id, "template_source", template_source)?,
        id,
        project_id: row.get(1).context("protocol run project_id")?,
        protocol_name: row.get(2).context("protocol run protocol_name")?,
        base_branch: row.get(4).context("protocol run base_branch")?,
        worktree_path: row.get(5).context("protocol run worktree_path")?,
        protocol_root: row.get(6).context("protocol run protocol_root")?,
        description: row.get(7).context("protocol run description")?,
        created_at: row.get(10).context("protocol run created_at")?,
        updated_at: row.get(11).context("protocol run updated_at")?,
    })
}

const STEP_COLUMNS: &str = "id, protocol_run_id, step_index, step_name, step_type, status, retries, model, engine_id, policy, runtime_state, summary, created_at, updated_at";

fn step_from_row(row: &Row) -> anyhow::Result<StepRun> {
    let id: i64 = row.get(0).context("step run id")?;
    let status: String = row.get(5).context("step run status")?;
    let policy: Option<String> = row.get(9).context("step run policy")?;
    let runtime_state: Option<String> = row.get(10).context("step run runtime_state")?;
    Ok(StepRun {
        status: parse_step_status(id, &status)?,
        policy: decode_policy(id, policy)?,
        runtime_state: decode_runtime_state(id, runtime_state)?,
        id,
        protocol_run_id: row.get(1).context("step run protocol_run_id")?,
        step_index: row.get(2).context("step run step_index")?,
        step_name: row.get(3).context("step run step_name")?,
        step_type: row.get(4).context("step run step_type")?,
        retries: row.get(6).context("step run retries")?,
        model: row.get(7).context("step run model")?,
        engine_id: row.get(8).context("step run engine_id")?,
        summary: row.get(11).context("step run summary")?,
        created_at: row.get(12).context("step run created_at")?,
        updated_at: row.get(13).context("step run updated_at")?,
    })
}

const EVENT_COLUMNS: &str = "id, protocol_run_id, step_run_id, event_type, message, metadata, created_at";

fn event_from_row(row: &Row, joined: bool) -> anyhow::Result<Event> {
    let id: i64 = row.get(0).context("event id")?;
    let metadata: Option<String> = row.get(5).context("event metadata")?;
    let mut event = Event {
        id,
        protocol_run_id: row.get(1).context("event protocol_run_id")?,
        step_run_id: row.get(2).context("event step_run_id")?,
        event_type: row.get(3).context("event event_type")?,
        message: row.get(4).context("event message")?,
        metadata: decode_json("Event", id, "metadata", metadata)?,
        created_at: row.get(6).context("event created_at")?,
        protocol_name: None,
        project_id: None,
        project_name: None,
    };
    if joined {
        event.protocol_name = row.get(7).context("event protocol_name")?;
        event.project_id = row.get(8).context("event project_id")?;
        event.project_name = row.get(9).context("event project_name")?;
    }
    Ok(event)
}

impl RemoteStore {
    async fn fetch_project(&self, id: i64) -> anyhow::Result<Project> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"),
                params![id],
            )
            .await
            .context("failed to query project")?;
        match rows.next().await.context("failed to read project row")? {
            Some(row) => project_from_row(&row),
            None => Err(not_found("Project", id)),
        }
    }

    async fn fetch_protocol_run(&self, id: i64) -> anyhow::Result<ProtocolRun> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM protocol_runs WHERE id = ?1"),
                params![id],
            )
            .await
            .context("failed to query protocol run")?;
        match rows
            .next()
            .await
            .context("failed to read protocol run row")?
        {
            Some(row) => run_from_row(&row),
            None => Err(not_found("ProtocolRun", id)),
        }
    }

    async fn fetch_step_run(&self, id: i64) -> anyhow::Result<StepRun> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {STEP_COLUMNS} FROM step_runs WHERE id = ?1"),
                params![id],
            )
            .await
            .context("failed to query step run")?;
        match rows.next().await.context("failed to read step run row")? {
            Some(row) => step_from_row(&row),
            None => Err(not_found("StepRun", id)),
        }
    }

    async fn last_insert_rowid(&self) -> anyhow::Result<i64> {
        let mut rows = self
            .conn
            .query("SELECT last_insert_rowid()", ())
            .await
            .context("failed to query last insert rowid")?;
        match rows.next().await.context("failed to read rowid")? {
            Some(row) => row.get(0).context("rowid"),
            None => Err(anyhow::anyhow!("last_insert_rowid returned no row")),
        }
    }

    async fn row_exists(&self, table: &str, id: i64) -> anyhow::Result<bool> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT COUNT(*) FROM {table} WHERE id = ?1"),
                params![id],
            )
            .await
            .context("failed to check row existence")?;
        match rows.next().await.context("failed to read count row")? {
            Some(row) => {
                let count: i64 = row.get(0).context("count")?;
                Ok(count > 0)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl Store for RemoteStore {
    async fn create_project(&self, new: NewProject) -> Result<Project> {
        recover(async {
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
                .await
                .context("failed to insert project")?;
            let id = self.last_insert_rowid().await?;
            self.fetch_project(id).await
        }
        .await)
    }

    async fn get_project(&self, id: i64) -> Result<Project> {
        recover(self.fetch_project(id).await)
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        recover(async {
            let mut rows = self
                .conn
                .query(
                    &format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY id"),
                    (),
                )
                .await
                .context("failed to query projects")?;
            let mut projects = Vec::new();
            while let Some(row) = rows.next().await.context("failed to read project row")? {
                projects.push(project_from_row(&row)?);
            }
            Ok(projects)
        }
        .await)
    }

    async fn update_project_local_path(&self, id: i64, local_path: String) -> Result<Project> {
        recover(async {
            let changed = self
                .conn
                .execute(
                    "UPDATE projects SET local_path = ?1, updated_at = datetime('now') WHERE id = ?2",
                    params![local_path, id],
                )
                .await
                .context("failed to update project local_path")?;
            if changed == 0 {
                return Err(not_found("Project", id));
            }
            self.fetch_project(id).await
        }
        .await)
    }

    async fn create_protocol_run(&self, new: NewProtocolRun) -> Result<ProtocolRun> {
        recover(async {
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
                .await
                .context("failed to insert protocol run")?;
            let id = self.last_insert_rowid().await?;
            self.fetch_protocol_run(id).await
        }
        .await)
    }

    async fn get_protocol_run(&self, id: i64) -> Result<ProtocolRun> {
        recover(self.fetch_protocol_run(id).await)
    }

    async fn find_protocol_run_by_name(&self, name: String) -> Result<Option<ProtocolRun>> {
        recover(async {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM protocol_runs WHERE protocol_name = ?1 ORDER BY id DESC LIMIT 1"
                    ),
                    params![name],
                )
                .await
                .context("failed to query protocol run by name")?;
            match rows
                .next()
                .await
                .context("failed to read protocol run row")?
            {
                Some(row) => Ok(Some(run_from_row(&row)?)),
                None => Ok(None),
            }
        }
        .await)
    }

    async fn list_protocol_runs(&self, project_id: i64) -> Result<Vec<ProtocolRun>> {
        recover(async {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {RUN_COLUMNS} FROM protocol_runs WHERE project_id = ?1 ORDER BY id"
                    ),
                    params![project_id],
                )
                .await
                .context("failed to query protocol runs")?;
            let mut runs = Vec::new();
            while let Some(row) = rows
                .next()
                .await
                .context("failed to read protocol run row")?
            {
                runs.push(run_from_row(&row)?);
            }
            Ok(runs)
        }
        .await)
    }

    async fn list_all_protocol_runs(&self) -> Result<Vec<ProtocolRun>> {
        recover(async {
            let mut rows = self
                .conn
                .query(
                    &format!("SELECT {RUN_COLUMNS} FROM protocol_runs ORDER BY id"),
                    (),
                )
                .await
                .context("failed to query protocol runs")?;
            let mut runs = Vec::new();
            while let Some(row) = rows
                .next()
                .await
                .context("failed to read protocol run row")?
            {
                runs.push(run_from_row(&row)?);
            }
            Ok(runs)
        }
        .await)
    }

    async fn update_protocol_status(
        &self,
        id: i64,
        status: ProtocolStatus,
        expected: Option<ProtocolStatus>,
    ) -> Result<ProtocolRun> {
        recover(async {
            let changed = match expected {
                Some(expected) => self
                    .conn
                    .execute(
                        "UPDATE protocol_runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2 AND status = ?3",
                        params![status.as_str(), id, expected.as_str()],
                    )
                    .await
                    .context("failed to update protocol status")?,
                None => self
                    .conn
                    .execute(
                        "UPDATE protocol_runs SET status = ?1, updated_at = datetime('now') WHERE id = ?2",
                        params![status.as_str(), id],
                    )
                    .await
                    .context("failed to update protocol status")?,
            };
            if changed == 0 {
                return match (self.row_exists("protocol_runs", id).await?, expected) {
                    (true, Some(expected)) => {
                        Err(conflict("ProtocolRun", id, expected.as_str().to_string()))
                    }
                    _ => Err(not_found("ProtocolRun", id)),
                };
            }
            self.fetch_protocol_run(id).await
        }
        .await)
    }

    async fn update_protocol_paths(
        &self,
        id: i64,
        worktree_path: Option<String>,
        protocol_root: Option<String>,
    ) -> Result<ProtocolRun> {
        recover(async {
            let changed = self
                .conn
                .execute(
                    "UPDATE protocol_runs SET worktree_path = COALESCE(?1, worktree_path), protocol_root = COALESCE(?2, protocol_root), updated_at = datetime('now') WHERE id = ?3",
                    params![worktree_path, protocol_root, id],
                )
                .await
                .context("failed to update protocol paths")?;
            if changed == 0 {
                return Err(not_found("ProtocolRun", id));
            }
            self.fetch_protocol_run(id).await
        }
        .await)
    }

    async fn update_protocol_template(
        &self,
        id: i64,
        template_config: Option<Value>,
        template_source: Option<Value>,
    ) -> Result<ProtocolRun> {
        recover(async {
            let changed = self
                .conn
                .execute(
                    "UPDATE protocol_runs SET template_config = ?1, template_source = COALESCE(?2, template_source), updated_at = datetime('now') WHERE id = ?3",
                    params![
                        encode_json(&template_config),
                        encode_json(&template_source),
                        id
                    ],
                )
                .await
                .context("failed to update protocol template")?;
            if changed == 0 {
                return Err(not_found("ProtocolRun", id));
            }
            self.fetch_protocol_run(id).await
        }
        .await)
    }

    async fn create_step_run(&self, new: NewStepRun) -> Result<StepRun> {
        recover(async {
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
                .await
                .context("failed to insert step run")?;
            let id = self.last_insert_rowid().await?;
            self.fetch_step_run(id).await
        }
        .await)
    }

    async fn get_step_run(&self, id: i64) -> Result<StepRun> {
        recover(self.fetch_step_run(id).await)
    }

    async fn list_step_runs(&self, protocol_run_id: i64) -> Result<Vec<StepRun>> {
        recover(async {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {STEP_COLUMNS} FROM step_runs WHERE protocol_run_id = ?1 ORDER BY step_index, id"
                    ),
                    params![protocol_run_id],
                )
                .await
                .context("failed to query step runs")?;
            let mut steps = Vec::new();
            while let Some(row) = rows.next().await.context("failed to read step run row")? {
                steps.push(step_from_row(&row)?);
            }
            Ok(steps)
        }
        .await)
    }

    async fn latest_step_run(&self, protocol_run_id: i64) -> Result<Option<StepRun>> {
        recover(async {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {STEP_COLUMNS} FROM step_runs WHERE protocol_run_id = ?1 ORDER BY id DESC LIMIT 1"
                    ),
                    params![protocol_run_id],
                )
                .await
                .context("failed to query latest step run")?;
            match rows.next().await.context("failed to read step run row")? {
                Some(row) => Ok(Some(step_from_row(&row)?)),
                None => Ok(None),
            }
        }
        .await)
    }

    async fn update_step_status(
        &self,
        id: i64,
        status: StepStatus,
        patch: StepPatch,
        expected: Option<StepStatus>,
    ) -> Result<StepRun> {
        recover(async {
            let set_runtime_state = patch.runtime_state.is_some() as i64;
            let runtime_state = patch.runtime_state.as_ref().and_then(encode_runtime_state);
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
                            patch.summary.clone(),
                            patch.model.clone(),
                            patch.engine_id.clone(),
                            set_runtime_state,
                            runtime_state,
                            id,
                            expected.as_str(),
                        ],
                    )
                    .await
                    .context("failed to update step status")?,
                None => self
                    .conn
                    .execute(
                        base,
                        params![
                            status.as_str(),
                            patch.retries,
                            patch.summary.clone(),
                            patch.model.clone(),
                            patch.engine_id.clone(),
                            set_runtime_state,
                            runtime_state,
                            id,
                        ],
                    )
                    .await
                    .context("failed to update step status")?,
            };
            if changed == 0 {
                return match (self.row_exists("step_runs", id).await?, expected) {
                    (true, Some(expected)) => {
                        Err(conflict("StepRun", id, expected.as_str().to_string()))
                    }
                    _ => Err(not_found("StepRun", id)),
                };
            }
            self.fetch_step_run(id).await
        }
        .await)
    }

    async fn append_event(
        &self,
        protocol_run_id: i64,
        event_type: String,
        message: String,
        ctx: EventContext,
    ) -> Result<Event> {
        recover(async {
            self.conn
                .execute(
                    "INSERT INTO events (protocol_run_id, step_run_id, event_type, message, metadata)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        protocol_run_id,
                        ctx.step_run_id,
                        event_type,
                        message,
                        event_metadata(&ctx),
                    ],
                )
                .await
                .context("failed to insert event")?;
            let id = self.last_insert_rowid().await?;
            let mut rows = self
                .conn
                .query(
                    &format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?1"),
                    params![id],
                )
                .await
                .context("failed to query event")?;
            match rows.next().await.context("failed to read event row")? {
                Some(row) => event_from_row(&row, false),
                None => Err(not_found("Event", id)),
            }
        }
        .await)
    }

    async fn list_events(&self, protocol_run_id: i64) -> Result<Vec<Event>> {
        recover(async {
            let mut rows = self
                .conn
                .query(
                    &format!(
                        "SELECT {EVENT_COLUMNS} FROM events WHERE protocol_run_id = ?1 ORDER BY id DESC"
                    ),
                    params![protocol_run_id],
                )
                .await
                .context("failed to query events")?;
            let mut events = Vec::new();
            while let Some(row) = rows.next().await.context("failed to read event row")? {
                events.push(event_from_row(&row, false)?);
            }
            Ok(events)
        }
        .await)
    }

    async fn list_recent_events(
        &self,
        limit: usize,
        project_id: Option<i64>,
    ) -> Result<Vec<Event>> {
        let limit = clamp_recent_limit(limit);
        recover(async {
            let mut rows = self
                .conn
                .query(
                    "SELECT e.id, e.protocol_run_id, e.step_run_id, e.event_type, e.message, e.metadata, e.created_at,
                            r.protocol_name, r.project_id, p.name
                     FROM events e
                     JOIN protocol_runs r ON r.id = e.protocol_run_id
                     JOIN projects p ON p.id = r.project_id
                     WHERE (?1 IS NULL OR r.project_id = ?1)
                     ORDER BY e.id DESC
                     LIMIT ?2",
                    params![project_id, limit],
                )
                .await
                .context("failed to query recent events")?;
            let mut events = Vec::new();
            while let Some(row) = rows.next().await.context("failed to read event row")? {
                events.push(event_from_row(&row, true)?);
            }
            Ok(events)
        }
        .await)
    }
}
