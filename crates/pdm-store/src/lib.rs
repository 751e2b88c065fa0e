//! Project row source + transactional merge application for Postgres and memory.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use pdm_core::{
    DealId, MergePlan, MergeStep, ProjectDependent, ProjectId, ProjectRecord, StepOutcome,
};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::{PgPool, Postgres, Row, Transaction};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, Instrument};

pub const CRATE_NAME: &str = "pdm-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reading snapshot {path}: {source}")]
    SnapshotRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing snapshot {path}: {source}")]
    SnapshotParse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("foreign key violation: {0}")]
    ForeignKey(String),
}

/// Bulk read of projects plus the mutations a merge needs.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    /// Every project joined with its deal id, ordered by project id.
    async fn fetch_projects(&self) -> Result<Vec<ProjectRecord>, StoreError>;

    /// Apply all steps of one plan atomically, returning one outcome per step.
    async fn apply_plan(&self, plan: &MergePlan) -> Result<Vec<StepOutcome>, StoreError>;
}

const FETCH_PROJECTS_SQL: &str = r#"
    SELECT p.project_id::bigint       AS project_id,
           p.project_name             AS project_name,
           p.city                     AS city,
           p.state                    AS state,
           p.stage                    AS stage,
           dp.deal_pipeline_id::bigint AS deal_pipeline_id
      FROM core.project p
      LEFT JOIN pipeline.deal_pipeline dp ON dp.project_id = p.project_id
     ORDER BY p.project_id
"#;

/// Where to connect: a full URL, or the discrete `DB_*` settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    Url(String),
    Parts {
        server: String,
        port: u16,
        database: String,
        user: String,
        password: String,
        encrypt: bool,
    },
}

impl DatabaseTarget {
    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        match self {
            DatabaseTarget::Url(url) => Ok(url.parse::<PgConnectOptions>()?),
            DatabaseTarget::Parts {
                server,
                port,
                database,
                user,
                password,
                encrypt,
            } => Ok(PgConnectOptions::new()
                .host(server)
                .port(*port)
                .database(database)
                .username(user)
                .password(password)
                .ssl_mode(if *encrypt {
                    PgSslMode::Require
                } else {
                    PgSslMode::Prefer
                })),
        }
    }

    /// Loggable description without credentials.
    pub fn describe(&self) -> String {
        match self {
            DatabaseTarget::Url(_) => "DATABASE_URL".to_string(),
            DatabaseTarget::Parts {
                server,
                port,
                database,
                ..
            } => format!("{server}:{port}/{database}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PgPoolConfig {
    pub max_connections: u32,
    pub idle_timeout: Duration,
}

impl Default for PgPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgProjectStore {
    pool: PgPool,
}

impl PgProjectStore {
    pub async fn connect(target: &DatabaseTarget, config: PgPoolConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(0)
            .idle_timeout(config.idle_timeout)
            .connect_with(target.connect_options()?)
            .await?;
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

async fn dependent_exists(
    tx: &mut Transaction<'_, Postgres>,
    kind: ProjectDependent,
    project_id: ProjectId,
) -> Result<bool, StoreError> {
    let sql = format!("SELECT 1 FROM {} WHERE project_id = $1 LIMIT 1", kind.table());
    let row = sqlx::query(&sql)
        .bind(project_id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(row.is_some())
}

async fn apply_pg_step(
    tx: &mut Transaction<'_, Postgres>,
    step: MergeStep,
) -> Result<StepOutcome, StoreError> {
    match step {
        MergeStep::MoveAttachments { from_deal, to_deal } => {
            let done = sqlx::query(
                r#"
                UPDATE pipeline.deal_pipeline_attachment
                   SET deal_pipeline_id = $1
                 WHERE deal_pipeline_id = $2
                "#,
            )
            .bind(to_deal)
            .bind(from_deal)
            .execute(&mut **tx)
            .await?;
            Ok(StepOutcome::AttachmentsMoved {
                rows: done.rows_affected(),
            })
        }
        MergeStep::ReconcileDependent {
            kind,
            from_project,
            to_project,
        } => {
            let keeper_has = dependent_exists(tx, kind, to_project).await?;
            let duplicate_has = dependent_exists(tx, kind, from_project).await?;
            if !duplicate_has {
                return Ok(StepOutcome::DependentAbsent { kind });
            }
            if keeper_has {
                let sql = format!("DELETE FROM {} WHERE project_id = $1", kind.table());
                sqlx::query(&sql).bind(from_project).execute(&mut **tx).await?;
                Ok(StepOutcome::DependentDropped { kind })
            } else {
                let sql = format!(
                    "UPDATE {} SET project_id = $1 WHERE project_id = $2",
                    kind.table()
                );
                sqlx::query(&sql)
                    .bind(to_project)
                    .bind(from_project)
                    .execute(&mut **tx)
                    .await?;
                Ok(StepOutcome::DependentRepointed { kind })
            }
        }
        MergeStep::DeleteDeal { deal_id } => {
            let done = sqlx::query("DELETE FROM pipeline.deal_pipeline WHERE deal_pipeline_id = $1")
                .bind(deal_id)
                .execute(&mut **tx)
                .await?;
            Ok(StepOutcome::DealDeleted {
                rows: done.rows_affected(),
            })
        }
        MergeStep::DeleteProject { project_id } => {
            let done = sqlx::query("DELETE FROM core.project WHERE project_id = $1")
                .bind(project_id)
                .execute(&mut **tx)
                .await?;
            Ok(StepOutcome::ProjectDeleted {
                rows: done.rows_affected(),
            })
        }
    }
}

#[async_trait]
impl ProjectStore for PgProjectStore {
    async fn fetch_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let rows = sqlx::query(FETCH_PROJECTS_SQL)
            .fetch_all(&self.pool)
            .instrument(tracing::info_span!("fetch_projects"))
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let name: Option<String> = row.try_get("project_name")?;
            out.push(ProjectRecord {
                id: row.try_get("project_id")?,
                name: name.unwrap_or_default(),
                city: row.try_get("city")?,
                state: row.try_get("state")?,
                stage: row.try_get("stage")?,
                deal_id: row.try_get("deal_pipeline_id")?,
            });
        }
        debug!(projects = out.len(), "fetched project snapshot");
        Ok(out)
    }

    async fn apply_plan(&self, plan: &MergePlan) -> Result<Vec<StepOutcome>, StoreError> {
        let span = tracing::info_span!("apply_plan", keeper_id = plan.keeper_id);
        async {
            let mut tx = self.pool.begin().await?;
            let mut outcomes = Vec::with_capacity(plan.steps.len());
            for step in &plan.steps {
                outcomes.push(apply_pg_step(&mut tx, *step).await?);
            }
            tx.commit().await?;
            Ok::<_, StoreError>(outcomes)
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRow {
    pub attachment_id: i64,
    pub deal_id: DealId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependentRow {
    pub kind: ProjectDependent,
    pub project_id: ProjectId,
}

/// Full table contents for the in-memory store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub projects: Vec<ProjectRecord>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRow>,
    #[serde(default)]
    pub dependents: Vec<DependentRow>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotFile {
    Projects(Vec<ProjectRecord>),
    Full(StoreSnapshot),
}

impl StoreSnapshot {
    fn apply(&mut self, step: MergeStep) -> Result<StepOutcome, StoreError> {
        match step {
            MergeStep::MoveAttachments { from_deal, to_deal } => {
                let mut rows = 0;
                for attachment in self.attachments.iter_mut().filter(|a| a.deal_id == from_deal) {
                    attachment.deal_id = to_deal;
                    rows += 1;
                }
                Ok(StepOutcome::AttachmentsMoved { rows })
            }
            MergeStep::ReconcileDependent {
                kind,
                from_project,
                to_project,
            } => {
                let has = |project_id: ProjectId| {
                    self.dependents
                        .iter()
                        .any(|d| d.kind == kind && d.project_id == project_id)
                };
                let keeper_has = has(to_project);
                if !has(from_project) {
                    return Ok(StepOutcome::DependentAbsent { kind });
                }
                if keeper_has {
                    self.dependents
                        .retain(|d| !(d.kind == kind && d.project_id == from_project));
                    Ok(StepOutcome::DependentDropped { kind })
                } else {
                    for row in self
                        .dependents
                        .iter_mut()
                        .filter(|d| d.kind == kind && d.project_id == from_project)
                    {
                        row.project_id = to_project;
                    }
                    Ok(StepOutcome::DependentRepointed { kind })
                }
            }
            MergeStep::DeleteDeal { deal_id } => {
                if self.attachments.iter().any(|a| a.deal_id == deal_id) {
                    return Err(StoreError::ForeignKey(format!(
                        "deal {deal_id} is still referenced by attachments"
                    )));
                }
                let mut rows = 0;
                for project in self
                    .projects
                    .iter_mut()
                    .filter(|p| p.deal_id == Some(deal_id))
                {
                    project.deal_id = None;
                    rows += 1;
                }
                Ok(StepOutcome::DealDeleted { rows })
            }
            MergeStep::DeleteProject { project_id } => {
                let Some(index) = self.projects.iter().position(|p| p.id == project_id) else {
                    return Ok(StepOutcome::ProjectDeleted { rows: 0 });
                };
                if let Some(deal_id) = self.projects[index].deal_id {
                    return Err(StoreError::ForeignKey(format!(
                        "project {project_id} is still referenced by deal {deal_id}"
                    )));
                }
                if let Some(row) = self.dependents.iter().find(|d| d.project_id == project_id) {
                    return Err(StoreError::ForeignKey(format!(
                        "project {project_id} is still referenced by {}",
                        row.kind.label()
                    )));
                }
                self.projects.remove(index);
                Ok(StepOutcome::ProjectDeleted { rows: 1 })
            }
        }
    }
}

/// In-process store with the same referential rules as the database.
///
/// Each plan is applied to a working copy that only replaces the state once
/// every step succeeded.
#[derive(Debug, Default)]
pub struct MemoryProjectStore {
    state: Mutex<StoreSnapshot>,
}

impl MemoryProjectStore {
    pub fn new(snapshot: StoreSnapshot) -> Self {
        Self {
            state: Mutex::new(snapshot),
        }
    }

    pub fn from_projects(projects: Vec<ProjectRecord>) -> Self {
        Self::new(StoreSnapshot {
            projects,
            ..Default::default()
        })
    }

    /// Load either a full snapshot object or a bare array of projects.
    pub async fn from_json_file(path: &Path) -> Result<Self, StoreError> {
        let text = fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::SnapshotRead {
                path: path.display().to_string(),
                source,
            })?;
        let parsed: SnapshotFile =
            serde_json::from_str(&text).map_err(|source| StoreError::SnapshotParse {
                path: path.display().to_string(),
                source,
            })?;
        Ok(match parsed {
            SnapshotFile::Projects(projects) => Self::from_projects(projects),
            SnapshotFile::Full(snapshot) => Self::new(snapshot),
        })
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl ProjectStore for MemoryProjectStore {
    async fn fetch_projects(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let mut projects = self.state.lock().await.projects.clone();
        projects.sort_by_key(|p| p.id);
        Ok(projects)
    }

    async fn apply_plan(&self, plan: &MergePlan) -> Result<Vec<StepOutcome>, StoreError> {
        let mut state = self.state.lock().await;
        let mut working = state.clone();
        let outcomes = plan
            .steps
            .iter()
            .map(|step| working.apply(*step))
            .collect::<Result<Vec<_>, _>>()?;
        *state = working;
        Ok(outcomes)
    }
}
