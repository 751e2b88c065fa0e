//! Core domain model for portfolio project deduplication.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pdm-core";

pub type ProjectId = i64;
pub type DealId = i64;

/// One row of the project table joined with its deal, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub deal_id: Option<DealId>,
}

impl ProjectRecord {
    pub fn new(id: ProjectId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            city: None,
            state: None,
            stage: None,
            deal_id: None,
        }
    }

    pub fn with_location(mut self, city: impl Into<String>, state: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self.state = Some(state.into());
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn with_deal(mut self, deal_id: DealId) -> Self {
        self.deal_id = Some(deal_id);
        self
    }

    pub fn city(&self) -> Option<&str> {
        non_empty(self.city.as_deref())
    }

    pub fn state(&self) -> Option<&str> {
        non_empty(self.state.as_deref())
    }

    pub fn stage(&self) -> Option<&str> {
        non_empty(self.stage.as_deref())
    }

    pub fn is_rejected(&self) -> bool {
        self.stage
            .as_deref()
            .unwrap_or_default()
            .to_lowercase()
            == "rejected"
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Dependent tables that hold at most one row per project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectDependent {
    UnderContract,
    ClosedProperty,
    CommercialListed,
    CommercialAcreage,
}

impl ProjectDependent {
    pub const ALL: [ProjectDependent; 4] = [
        ProjectDependent::UnderContract,
        ProjectDependent::ClosedProperty,
        ProjectDependent::CommercialListed,
        ProjectDependent::CommercialAcreage,
    ];

    pub fn table(self) -> &'static str {
        match self {
            ProjectDependent::UnderContract => "pipeline.under_contract",
            ProjectDependent::ClosedProperty => "pipeline.closed_property",
            ProjectDependent::CommercialListed => "pipeline.commercial_listed",
            ProjectDependent::CommercialAcreage => "pipeline.commercial_acreage",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ProjectDependent::UnderContract => "under contract",
            ProjectDependent::ClosedProperty => "closed property",
            ProjectDependent::CommercialListed => "commercial listing",
            ProjectDependent::CommercialAcreage => "commercial acreage",
        }
    }
}

/// Outcome of comparing two project names, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Normalized,
    Contains,
    WordOverlap,
    None,
}

/// The three successive grouping passes, strictest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pass {
    Exact,
    Normalized,
    CityState,
}

impl Pass {
    pub const ALL: [Pass; 3] = [Pass::Exact, Pass::Normalized, Pass::CityState];

    pub fn number(self) -> u8 {
        match self {
            Pass::Exact => 1,
            Pass::Normalized => 2,
            Pass::CityState => 3,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Pass::Exact => "exact duplicate name",
            Pass::Normalized => "normalized/containing name",
            Pass::CityState => "exact city+state, similar name",
        }
    }
}

/// Two or more projects judged to be the same real-world entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub members: Vec<ProjectRecord>,
}

impl DuplicateGroup {
    pub fn ids(&self) -> Vec<ProjectId> {
        self.members.iter().map(|m| m.id).collect()
    }
}

/// A group after keeper election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedGroup {
    pub keeper: ProjectRecord,
    pub duplicates: Vec<ProjectRecord>,
}

/// A single mutation applied while folding a duplicate into its keeper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum MergeStep {
    /// Repoint every attachment of `from_deal` to `to_deal`.
    MoveAttachments { from_deal: DealId, to_deal: DealId },
    /// Repoint the duplicate's row, or drop it if the keeper already has one.
    ReconcileDependent {
        kind: ProjectDependent,
        from_project: ProjectId,
        to_project: ProjectId,
    },
    DeleteDeal { deal_id: DealId },
    DeleteProject { project_id: ProjectId },
}

/// Ordered mutations for one resolved group, applied as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePlan {
    pub keeper_id: ProjectId,
    pub removed_ids: Vec<ProjectId>,
    pub steps: Vec<MergeStep>,
}

/// What a store did for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    AttachmentsMoved { rows: u64 },
    DependentRepointed { kind: ProjectDependent },
    DependentDropped { kind: ProjectDependent },
    DependentAbsent { kind: ProjectDependent },
    DealDeleted { rows: u64 },
    ProjectDeleted { rows: u64 },
}
