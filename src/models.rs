//! Core data models for the research pipeline

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::{Add, AddAssign};
use std::str::FromStr;

//
// ================= Routing =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    DirectResponse,
    ResearchWorkflow,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub route: Route,
    pub rationale: String,
    pub status: StageStatus,
}

//
// ================= Catalog =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub const ALL: [Quarter; 4] = [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4];
}

impl FromStr for Quarter {
    type Err = String;

    /// Accepts "Q3", "q3", "3" and "Q3 " style input.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix('Q')
            .or_else(|| trimmed.strip_prefix('q'))
            .unwrap_or(trimmed);

        match digits {
            "1" => Ok(Quarter::Q1),
            "2" => Ok(Quarter::Q2),
            "3" => Ok(Quarter::Q3),
            "4" => Ok(Quarter::Q4),
            _ => Err(format!("invalid quarter: {}", s)),
        }
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quarter::Q1 => "Q1",
            Quarter::Q2 => "Q2",
            Quarter::Q3 => "Q3",
            Quarter::Q4 => "Q4",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankEntity {
    pub id: i64,
    pub name: String,
    pub symbol: String,
    #[serde(default)]
    pub aliases: BTreeSet<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub sources: BTreeSet<String>,
}

//
// ================= Extraction =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Success,
    NeedsClarification,
    Error,
}

/// Quarters requested for one entity in one fiscal year
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityPeriods {
    pub entity_id: i64,
    pub fiscal_year: i32,
    pub quarters: BTreeSet<Quarter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeriodSpec {
    /// One fiscal year and quarter set shared by every entity
    ApplyAll {
        fiscal_year: i32,
        quarters: BTreeSet<Quarter>,
    },
    /// Periods keyed by entity and fiscal year
    EntitySpecific { periods: Vec<EntityPeriods> },
}

impl PeriodSpec {
    /// Every `(entity, year, quarter)` these periods imply for the given entities,
    /// in entity order.
    pub fn targets(&self, entity_ids: &BTreeSet<i64>) -> Vec<(i64, i32, Quarter)> {
        let mut out = Vec::new();

        match self {
            PeriodSpec::ApplyAll {
                fiscal_year,
                quarters,
            } => {
                for entity_id in entity_ids {
                    for quarter in quarters {
                        out.push((*entity_id, *fiscal_year, *quarter));
                    }
                }
            }
            PeriodSpec::EntitySpecific { periods } => {
                for entity_id in entity_ids {
                    for record in periods.iter().filter(|p| p.entity_id == *entity_id) {
                        for quarter in &record.quarters {
                            out.push((*entity_id, record.fiscal_year, *quarter));
                        }
                    }
                }
            }
        }

        out
    }
}

/// Clarifier output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub status: ExtractionStatus,
    pub entity_ids: BTreeSet<i64>,
    pub entity_detail: BTreeMap<i64, BankEntity>,
    pub intent: String,
    pub periods: Option<PeriodSpec>,
    /// Questions for the user, in the order the phases raised them
    pub clarifications: Vec<String>,
    pub combinations: Vec<Combination>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExtractionResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ExtractionStatus::Error,
            entity_ids: BTreeSet::new(),
            entity_detail: BTreeMap::new(),
            intent: String::new(),
            periods: None,
            clarifications: Vec::new(),
            combinations: Vec::new(),
            error: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Combination {
    pub entity_id: i64,
    pub fiscal_year: i32,
    pub quarter: Quarter,
    pub intent: String,
}

//
// ================= Planning =================
//

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceSelection {
    pub source_id: String,
    pub query_intent: String,
}

//
// ================= Worker Stream =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerMessageKind {
    Start,
    Data,
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerMessage {
    pub source_id: String,
    pub kind: WorkerMessageKind,
    pub content: String,
}

impl WorkerMessage {
    pub fn start(source_id: &str) -> Self {
        Self::new(source_id, WorkerMessageKind::Start, String::new())
    }

    pub fn data(source_id: &str, content: impl Into<String>) -> Self {
        Self::new(source_id, WorkerMessageKind::Data, content.into())
    }

    pub fn done(source_id: &str) -> Self {
        Self::new(source_id, WorkerMessageKind::Done, String::new())
    }

    pub fn error(source_id: &str, content: impl Into<String>) -> Self {
        Self::new(source_id, WorkerMessageKind::Error, content.into())
    }

    fn new(source_id: &str, kind: WorkerMessageKind, content: String) -> Self {
        Self {
            source_id: source_id.to_string(),
            kind,
            content,
        }
    }
}

/// Inline note shown in place of a source's output when it failed
pub fn source_error_note(source_id: &str, detail: &str) -> String {
    format!("⚠ error in {}: {}", source_id, detail)
}

//
// ================= Pipeline Output =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMessageKind {
    AgentText,
    SourceStart,
    SourceText,
    SummaryStart,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineMessage {
    pub kind: PipelineMessageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    pub content: String,
}

impl PipelineMessage {
    pub fn agent_text(content: impl Into<String>) -> Self {
        Self {
            kind: PipelineMessageKind::AgentText,
            source_id: None,
            content: content.into(),
        }
    }

    pub fn summary_start() -> Self {
        Self {
            kind: PipelineMessageKind::SummaryStart,
            source_id: None,
            content: String::new(),
        }
    }

    /// Client-visible form of a worker message. `done` has no client form.
    pub fn from_worker(message: &WorkerMessage) -> Option<Self> {
        let kind = match message.kind {
            WorkerMessageKind::Start => PipelineMessageKind::SourceStart,
            WorkerMessageKind::Data | WorkerMessageKind::Error => PipelineMessageKind::SourceText,
            WorkerMessageKind::Done => return None,
        };

        Some(Self {
            kind,
            source_id: Some(message.source_id.clone()),
            content: message.content.clone(),
        })
    }
}

//
// ================= Usage =================
//

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl Usage {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total_tokens() == 0 && self.cost == 0.0
    }
}

impl Add for Usage {
    type Output = Usage;

    fn add(self, rhs: Usage) -> Usage {
        Usage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            cost: self.cost + rhs.cost,
        }
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Usage) {
        *self = *self + rhs;
    }
}
