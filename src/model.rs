use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Effective settings of a run; echoed in the JSON outcome.
#[derive(Debug, Clone, Serialize)]
pub struct RunConfig {
    pub base_url: String,
    pub push_url: Option<String>,
    pub user_agent: String,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    pub max_idle_polls: u32,
    pub staleness: StalenessScope,
    pub push_enabled: bool,
}

/// Which timestamp a `queued` slot's staleness is measured against.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum StalenessScope {
    /// Last accepted update for the slot itself.
    #[default]
    Slot,
    /// Last accepted update anywhere in the run.
    Run,
}

/// Opaque run identifier. The server sends it as a string or as an integer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RunId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => RunId(s),
            Raw::Int(n) => RunId(n.to_string()),
        })
    }
}

/// One (test case, tool) unit of work within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub case_id: String,
    pub tool_id: String,
}

impl SlotKey {
    pub fn new(case_id: impl Into<String>, tool_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            tool_id: tool_id.into(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.case_id, self.tool_id)
    }
}

/// Server-reported status of a slot. Unknown values are carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SlotStatus {
    Queued,
    Evaluating,
    Scored,
    Other(String),
}

impl SlotStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SlotStatus::Queued => "queued",
            SlotStatus::Evaluating => "evaluating",
            SlotStatus::Scored => "scored",
            SlotStatus::Other(s) => s,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SlotStatus::Queued)
    }

    pub fn is_scored(&self) -> bool {
        matches!(self, SlotStatus::Scored)
    }

    /// Generation finished: the slot is being evaluated or already scored.
    pub fn is_completed(&self) -> bool {
        matches!(self, SlotStatus::Evaluating | SlotStatus::Scored)
    }
}

impl From<String> for SlotStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "queued" => SlotStatus::Queued,
            "evaluating" => SlotStatus::Evaluating,
            "scored" => SlotStatus::Scored,
            _ => SlotStatus::Other(s),
        }
    }
}

impl From<SlotStatus> for String {
    fn from(s: SlotStatus) -> Self {
        match s {
            SlotStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scores come back as numbers on the push channel and as strings from the status endpoint.
fn de_score<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(f64),
        Text(String),
    }
    Ok(match Option::<Raw>::deserialize(deserializer)? {
        Some(Raw::Num(v)) => Some(v),
        Some(Raw::Text(s)) => s.trim().parse::<f64>().ok(),
        None => None,
    })
}

/// Status record as it appears on the wire; every field may be missing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WireUpdate {
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub run_item_id: Option<i64>,
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub status: Option<SlotStatus>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "de_score")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    #[error("status update is missing `{0}`")]
    MissingField(&'static str),
}

/// A validated status update for one slot of one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusUpdate {
    pub run_id: RunId,
    #[serde(flatten)]
    pub slot: SlotKey,
    pub status: SlotStatus,
    pub image_url: Option<String>,
    pub score: Option<f64>,
    pub run_item_id: Option<i64>,
}

impl TryFrom<WireUpdate> for StatusUpdate {
    type Error = UpdateError;

    fn try_from(w: WireUpdate) -> Result<Self, Self::Error> {
        let run_id = w.run_id.ok_or(UpdateError::MissingField("run_id"))?;
        let case_id = w.case_id.ok_or(UpdateError::MissingField("case_id"))?;
        let tool_id = w.tool_id.ok_or(UpdateError::MissingField("tool_id"))?;
        let status = w.status.ok_or(UpdateError::MissingField("status"))?;
        Ok(StatusUpdate {
            run_id,
            slot: SlotKey { case_id, tool_id },
            status,
            image_url: w.image_url,
            score: w.score,
            run_item_id: w.run_item_id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(flatten)]
    update: WireUpdate,
}

/// Parse one push-channel frame. `Ok(None)` means a well-formed message that
/// is not a status update.
pub fn parse_push_message(text: &str) -> Result<Option<WireUpdate>, serde_json::Error> {
    let env: PushEnvelope = serde_json::from_str(text)?;
    match env.kind.as_deref() {
        None | Some("update") => Ok(Some(env.update)),
        Some(_) => Ok(None),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub template_url: Option<String>,
    #[serde(default)]
    pub avatar_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartRunRequest<'a> {
    pub case_ids: &'a [String],
    pub tool_ids: &'a [String],
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateRequest {
    pub run_item_id: i64,
    pub stars: u8,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateResponse {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Events emitted by the run monitor for presentation layers.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    RunStarted {
        run_id: RunId,
        total_slots: usize,
    },
    SlotUpdated {
        update: StatusUpdate,
        /// Applied by the stale-`queued` refresh rather than a real change.
        forced: bool,
    },
    RunFullyScored {
        run_id: RunId,
    },
    PollingStoppedInactive {
        run_id: RunId,
    },
    Info(InfoEvent),
}

/// Structured info events, rendered by the CLI layer.
#[derive(Debug, Clone)]
pub enum InfoEvent {
    PushConnected { url: String },
    PushClosed { reason: Option<String> },
    PushUnavailable { reason: String },
    AwaitingScores,
}

impl InfoEvent {
    /// Render a human-readable message for the CLI.
    pub fn to_message(&self) -> String {
        match self {
            InfoEvent::PushConnected { url } => format!("Push channel connected: {url}"),
            InfoEvent::PushClosed { reason: Some(r) } => format!("Push channel closed: {r}"),
            InfoEvent::PushClosed { reason: None } => "Push channel closed".to_string(),
            InfoEvent::PushUnavailable { reason } => {
                format!("Push channel unavailable, relying on polling: {reason}")
            }
            InfoEvent::AwaitingScores => "All items completed. Waiting for final scores...".into(),
        }
    }
}

/// Latest known state of one slot, as exposed in snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub case_id: String,
    pub tool_id: String,
    pub status: Option<SlotStatus>,
    pub score: Option<f64>,
    pub image_url: Option<String>,
    pub run_item_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub timestamp_utc: String,
    pub run_id: RunId,
    pub total_slots: usize,
    pub scored: usize,
    pub fully_scored: bool,
    pub polling_stopped_inactive: bool,
    pub cancelled: bool,
    pub config: RunConfig,
    pub slots: Vec<SlotView>,
}
