use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::validate::RawVariable;
use crate::variable::CaseVariable;

/// Environment key for the on-disk case folder name (id plus optional slug).
pub const ENV_CASE_FOLDER_NAME: &str = "CASE_FOLDER_NAME";
/// Environment key for the case-local extracted-data directory.
pub const ENV_CASE_DATA_ROOT: &str = "CASE_DATA_ROOT";

/// Coupling framework variant passed to the toolchain's case-creation script.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    Nuopc,
    Mct,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nuopc => "nuopc",
            Self::Mct => "mct",
        }
    }
}

impl std::fmt::Display for Driver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a case's input data comes from: a downloadable URL or the content
/// digest of an already-uploaded dataset.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum DataReference {
    Url(String),
    Digest(String),
}

impl DataReference {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Url(s) | Self::Digest(s) => s,
        }
    }

    /// Key of the shared extracted-data directory. Cases referencing the
    /// same uploaded digest share one directory; URL-referenced cases get a
    /// per-case directory keyed by case id.
    pub fn data_cache_key<'a>(&'a self, case_id: &'a str) -> &'a str {
        match self {
            Self::Digest(digest) => digest,
            Self::Url(_) => case_id,
        }
    }
}

/// Ordered lifecycle states. The create phase ends at `Configured`, the run
/// phase at `Submitted`; `Failed` is terminal but a failed case may be
/// recreated under the same id.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Initialised,
    Created,
    Updated,
    Setup,
    Configured,
    Building,
    Built,
    InputDataReady,
    FatesParamsUpdated,
    Rebuilt,
    FatesIndicesSet,
    Submitted,
    Failed,
}

impl CaseStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Initialised => 0,
            Self::Created => 1,
            Self::Updated => 2,
            Self::Setup => 3,
            Self::Configured => 4,
            Self::Building => 5,
            Self::Built => 6,
            Self::InputDataReady => 7,
            Self::FatesParamsUpdated => 8,
            Self::Rebuilt => 9,
            Self::FatesIndicesSet => 10,
            Self::Submitted => 11,
            Self::Failed => 12,
        }
    }

    /// Transitions only ever skip forward. `Failed` is reachable from any
    /// live state; nothing leaves `Failed` (a failed case is recreated, not
    /// resumed). Equal rank is allowed for repeated parameter-edit steps.
    pub fn can_advance_to(&self, next: CaseStatus) -> bool {
        if *self == Self::Failed {
            return false;
        }
        if next == Self::Failed {
            return true;
        }
        next.rank() >= self.rank()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Submitted | Self::Failed)
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Initialised => "INITIALISED",
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Setup => "SETUP",
            Self::Configured => "CONFIGURED",
            Self::Building => "BUILDING",
            Self::Built => "BUILT",
            Self::InputDataReady => "INPUT_DATA_READY",
            Self::FatesParamsUpdated => "FATES_PARAMS_UPDATED",
            Self::Rebuilt => "REBUILT",
            Self::FatesIndicesSet => "FATES_INDICES_SET",
            Self::Submitted => "SUBMITTED",
            Self::Failed => "FAILED",
        };
        f.write_str(text)
    }
}

/// Immutable inbound case request. Only used to derive the identity and the
/// initial validated variable set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseDefinition {
    pub compset: String,
    #[serde(default)]
    pub resolution: Option<String>,
    pub driver: Driver,
    pub data_reference: DataReference,
    #[serde(default)]
    pub variables: Vec<RawVariable>,
    pub version_tag: String,
    /// Optional human-readable name; only slugified into the folder name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Persisted case record. `id`, definition fields, and `variables` are
/// write-once; only `status` and the task handles are updated in place.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseRecord {
    pub id: String,
    pub compset: String,
    #[serde(default)]
    pub resolution: Option<String>,
    pub driver: Driver,
    pub variables: Vec<CaseVariable>,
    pub data_reference: DataReference,
    pub version_tag: String,
    pub status: CaseStatus,
    pub created_at_unix_ms: u64,
    #[serde(default)]
    pub create_task_id: Option<String>,
    #[serde(default)]
    pub run_task_id: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl CaseRecord {
    /// Assemble the initial record for a freshly validated definition.
    /// `folder_name` comes from the identity module; `data_root` is the
    /// service-wide extracted-data root the env paths hang off.
    pub fn new(
        definition: &CaseDefinition,
        variables: Vec<CaseVariable>,
        id: String,
        folder_name: String,
        data_root: &Path,
        created_at_unix_ms: u64,
    ) -> Self {
        let data_dir = data_root.join(definition.data_reference.data_cache_key(&id));
        let mut env = BTreeMap::new();
        env.insert(ENV_CASE_FOLDER_NAME.to_owned(), folder_name);
        env.insert(
            ENV_CASE_DATA_ROOT.to_owned(),
            data_dir.to_string_lossy().to_string(),
        );
        Self {
            id,
            compset: definition.compset.clone(),
            resolution: definition.resolution.clone(),
            driver: definition.driver,
            variables,
            data_reference: definition.data_reference.clone(),
            version_tag: definition.version_tag.clone(),
            status: CaseStatus::Initialised,
            created_at_unix_ms,
            create_task_id: None,
            run_task_id: None,
            env,
        }
    }

    pub fn folder_name(&self) -> &str {
        self.env
            .get(ENV_CASE_FOLDER_NAME)
            .map(String::as_str)
            .unwrap_or(&self.id)
    }

    pub fn data_dir(&self) -> Option<&str> {
        self.env.get(ENV_CASE_DATA_ROOT).map(String::as_str)
    }
}

/// Background task states as reported by the external executor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
    Revoked,
    Received,
    Rejected,
    Retry,
    Ignored,
}

/// Live view of one background task, computed on every read. An absent
/// handle yields the empty view without querying the executor.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: Option<String>,
    pub status: Option<TaskStatus>,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl TaskView {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Outbound composition of a persisted record with its live task views.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseWithTaskInfo {
    #[serde(flatten)]
    pub case: CaseRecord,
    pub create_task: TaskView,
    pub run_task: TaskView,
}
