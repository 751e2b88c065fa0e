//! Three-pass duplicate merge pipeline over the project store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pdm_core::{
    MergePlan, MergeStep, Pass, ProjectDependent, ProjectId, ProjectRecord, ResolvedGroup,
    StepOutcome,
};
use pdm_match::{group_for_pass, resolve_group, DuplicateListing};
use pdm_store::{DatabaseTarget, PgPoolConfig, PgProjectStore, ProjectStore};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pdm-merge";

const DB_VARS: [&str; 4] = ["DB_SERVER", "DB_DATABASE", "DB_USER", "DB_PASSWORD"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("database is not configured: set DATABASE_URL or {}", .missing.join(", "))]
    MissingDatabase { missing: Vec<&'static str> },
    #[error("invalid DB_PORT value {0:?}")]
    InvalidPort(String),
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    database: Result<DatabaseTarget, Vec<&'static str>>,
    pub dry_run: bool,
    pub reports_dir: PathBuf,
    pub write_reports: bool,
    pub pool: PgPoolConfig,
}

fn flag(value: Option<String>) -> Option<bool> {
    value.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
}

impl MergeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database = match get("DATABASE_URL") {
            Some(url) => Ok(DatabaseTarget::Url(url)),
            None => {
                let missing: Vec<&'static str> =
                    DB_VARS.into_iter().filter(|key| get(*key).is_none()).collect();
                if missing.is_empty() {
                    let port = match get("DB_PORT") {
                        Some(raw) => raw
                            .trim()
                            .parse()
                            .map_err(|_| ConfigError::InvalidPort(raw.clone()))?,
                        None => 5432,
                    };
                    Ok(DatabaseTarget::Parts {
                        server: get("DB_SERVER").unwrap_or_default(),
                        port,
                        database: get("DB_DATABASE").unwrap_or_default(),
                        user: get("DB_USER").unwrap_or_default(),
                        password: get("DB_PASSWORD").unwrap_or_default(),
                        encrypt: flag(get("DB_ENCRYPT")).unwrap_or(false),
                    })
                } else {
                    Err(missing)
                }
            }
        };

        Ok(Self {
            database,
            dry_run: flag(get("MERGE_DRY_RUN")).unwrap_or(false),
            reports_dir: get("PDM_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            write_reports: flag(get("PDM_WRITE_REPORTS")).unwrap_or(true),
            pool: PgPoolConfig::default(),
        })
    }

    /// Fails when neither `DATABASE_URL` nor every `DB_*` setting is present.
    pub fn database(&self) -> Result<&DatabaseTarget, ConfigError> {
        self.database
            .as_ref()
            .map_err(|missing| ConfigError::MissingDatabase {
                missing: missing.clone(),
            })
    }
}

/// Ordered steps folding each duplicate into the keeper.
///
/// The keeper is skipped if it appears among `duplicates`.
pub fn plan_merge(keeper: &ProjectRecord, duplicates: &[ProjectRecord]) -> MergePlan {
    let mut steps = Vec::new();
    let mut removed_ids = Vec::new();
    for duplicate in duplicates.iter().filter(|d| d.id != keeper.id) {
        if let (Some(from_deal), Some(to_deal)) = (duplicate.deal_id, keeper.deal_id) {
            steps.push(MergeStep::MoveAttachments { from_deal, to_deal });
        }
        steps.extend(ProjectDependent::ALL.into_iter().map(|kind| {
            MergeStep::ReconcileDependent {
                kind,
                from_project: duplicate.id,
                to_project: keeper.id,
            }
        }));
        if let Some(deal_id) = duplicate.deal_id {
            steps.push(MergeStep::DeleteDeal { deal_id });
        }
        steps.push(MergeStep::DeleteProject {
            project_id: duplicate.id,
        });
        removed_ids.push(duplicate.id);
    }
    MergePlan {
        keeper_id: keeper.id,
        removed_ids,
        steps,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovedProject {
    pub id: ProjectId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupOutcome {
    pub keeper_id: ProjectId,
    pub keeper_name: String,
    pub removed: Vec<RemovedProject>,
    pub applied: bool,
    pub outcomes: Vec<StepOutcome>,
}

pub struct MergeExecutor<'a> {
    store: &'a dyn ProjectStore,
    dry_run: bool,
}

impl<'a> MergeExecutor<'a> {
    pub fn new(store: &'a dyn ProjectStore, dry_run: bool) -> Self {
        Self { store, dry_run }
    }

    pub async fn merge(&self, group: &ResolvedGroup) -> Result<GroupOutcome> {
        let keeper = &group.keeper;
        let plan = plan_merge(keeper, &group.duplicates);
        let removed = group
            .duplicates
            .iter()
            .filter(|d| plan.removed_ids.contains(&d.id))
            .map(|d| RemovedProject {
                id: d.id,
                name: d.name.clone(),
            })
            .collect::<Vec<_>>();

        if self.dry_run {
            for duplicate in &removed {
                info!(
                    "  [DRY RUN] Would merge ProjectId={} ({}) into {} ({})",
                    duplicate.id, duplicate.name, keeper.id, keeper.name
                );
            }
            return Ok(GroupOutcome {
                keeper_id: keeper.id,
                keeper_name: keeper.name.clone(),
                removed,
                applied: false,
                outcomes: Vec::new(),
            });
        }

        let outcomes = self
            .store
            .apply_plan(&plan)
            .await
            .with_context(|| format!("merging {:?} into project {}", plan.removed_ids, keeper.id))?;
        for outcome in &outcomes {
            if let StepOutcome::ProjectDeleted { rows: 0 } = outcome {
                warn!(keeper_id = keeper.id, "duplicate project was already gone");
            }
        }

        Ok(GroupOutcome {
            keeper_id: keeper.id,
            keeper_name: keeper.name.clone(),
            removed,
            applied: true,
            outcomes,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub pass: Pass,
    pub label: String,
    pub candidates: usize,
    pub groups: Vec<GroupOutcome>,
}

impl PassSummary {
    pub fn merged(&self) -> usize {
        self.groups.iter().map(|g| g.removed.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub merged: usize,
    pub passes: Vec<PassSummary>,
}

impl MergeRunSummary {
    pub fn headline(&self) -> String {
        if self.dry_run {
            format!(
                "[DRY RUN] Would have merged {} duplicate project(s). Run without MERGE_DRY_RUN=1 to apply.",
                self.merged
            )
        } else {
            format!("Merged {} duplicate project(s).", self.merged)
        }
    }

    pub fn to_markdown(&self) -> String {
        let mut lines = vec![
            "# Duplicate Merge Run".to_string(),
            String::new(),
            format!("- Run ID: `{}`", self.run_id),
            format!("- Started: {}", self.started_at),
            format!("- Finished: {}", self.finished_at),
            format!("- Dry run: {}", self.dry_run),
            format!("- Merged projects: {}", self.merged),
            String::new(),
        ];
        for pass in &self.passes {
            lines.push(format!(
                "## Pass {} ({}): {} group(s)",
                pass.pass.number(),
                pass.label,
                pass.groups.len()
            ));
            lines.push(String::new());
            for group in &pass.groups {
                let removed = group
                    .removed
                    .iter()
                    .map(|r| format!("#{} {}", r.id, r.name))
                    .collect::<Vec<_>>()
                    .join("; ");
                lines.push(format!(
                    "- keep #{} {} ← {}",
                    group.keeper_id, group.keeper_name, removed
                ));
            }
            lines.push(String::new());
        }
        lines.join("\n")
    }
}

fn log_group(pass: Pass, group: &ResolvedGroup) {
    let keeper = &group.keeper;
    match pass {
        Pass::Exact => info!(
            "  Merge \"{}\" → keep ProjectId={}, remove {}",
            keeper.name,
            keeper.id,
            group
                .duplicates
                .iter()
                .map(|d| d.id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        Pass::Normalized => info!(
            "  Merge group → keep ProjectId={} ({}), remove {}",
            keeper.id,
            keeper.name,
            group
                .duplicates
                .iter()
                .map(|d| d.name.as_str())
                .collect::<Vec<_>>()
                .join("; ")
        ),
        Pass::CityState => info!(
            "  Merge {} ({}, {}) → keep ProjectId={}",
            std::iter::once(keeper)
                .chain(group.duplicates.iter())
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(" / "),
            keeper.city().unwrap_or_default(),
            keeper.state().unwrap_or_default(),
            keeper.id
        ),
    }
}

pub struct MergePipeline<'a> {
    store: &'a dyn ProjectStore,
    dry_run: bool,
}

impl<'a> MergePipeline<'a> {
    pub fn new(store: &'a dyn ProjectStore, dry_run: bool) -> Self {
        Self { store, dry_run }
    }

    /// Group and merge pass by pass, re-reading projects before each pass.
    ///
    /// Ids removed by an earlier pass are excluded from later snapshots, which
    /// keeps dry runs consistent with what a real run would see.
    pub async fn run(&self) -> Result<MergeRunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let executor = MergeExecutor::new(self.store, self.dry_run);
        let mut removed: HashSet<ProjectId> = HashSet::new();
        let mut passes = Vec::with_capacity(Pass::ALL.len());

        for pass in Pass::ALL {
            let snapshot = self
                .store
                .fetch_projects()
                .await
                .with_context(|| format!("fetching projects for pass {}", pass.number()))?
                .into_iter()
                .filter(|p| !removed.contains(&p.id))
                .collect::<Vec<_>>();
            let groups = group_for_pass(pass, &snapshot);
            info!(
                pass = pass.number(),
                candidates = snapshot.len(),
                "Pass {} ({}): {} groups",
                pass.number(),
                pass.label(),
                groups.len()
            );

            let mut outcomes = Vec::with_capacity(groups.len());
            for group in &groups {
                let Some(resolved) = resolve_group(group) else {
                    continue;
                };
                log_group(pass, &resolved);
                let outcome = executor.merge(&resolved).await?;
                removed.extend(outcome.removed.iter().map(|r| r.id));
                outcomes.push(outcome);
            }

            passes.push(PassSummary {
                pass,
                label: pass.label().to_string(),
                candidates: snapshot.len(),
                groups: outcomes,
            });
        }

        let merged = passes.iter().map(PassSummary::merged).sum();
        Ok(MergeRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.dry_run,
            merged,
            passes,
        })
    }
}

/// Write `merge_run.json` and `merge_summary.md` under `<root>/<run_id>/`.
pub async fn write_run_reports(reports_root: &Path, summary: &MergeRunSummary) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing merge run summary")?;
    fs::write(run_dir.join("merge_run.json"), json)
        .await
        .context("writing merge_run.json")?;
    fs::write(run_dir.join("merge_summary.md"), summary.to_markdown())
        .await
        .context("writing merge_summary.md")?;
    Ok(run_dir)
}

/// Run all passes against `store`, writing reports when enabled.
pub async fn run_merge(store: &dyn ProjectStore, config: &MergeConfig) -> Result<MergeRunSummary> {
    if config.dry_run {
        info!("dry run: no rows will be changed");
    }
    let summary = MergePipeline::new(store, config.dry_run).run().await?;
    if config.write_reports {
        let dir = write_run_reports(&config.reports_dir, &summary).await?;
        info!(reports = %dir.display(), "run reports written");
    }
    info!("{}", summary.headline());
    Ok(summary)
}

pub async fn connect_store(config: &MergeConfig) -> Result<PgProjectStore> {
    let target = config.database()?;
    info!(database = %target.describe(), "connecting");
    PgProjectStore::connect(target, config.pool)
        .await
        .with_context(|| format!("connecting to {}", target.describe()))
}

pub async fn list_potential_duplicates(store: &dyn ProjectStore) -> Result<DuplicateListing> {
    let projects = store
        .fetch_projects()
        .await
        .context("fetching projects for duplicate listing")?;
    let listing = DuplicateListing::build(&projects);
    info!(
        projects = projects.len(),
        exact_groups = listing.exact_groups.len(),
        likely_pairs = listing.likely_pairs.len(),
        city_state_pairs = listing.city_state_pairs.len(),
        "duplicate listing built"
    );
    Ok(listing)
}
