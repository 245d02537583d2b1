use serde::{Deserialize, Serialize};

/// Association of a human-friendly site name with a case id. Many links may
/// exist per site; the service keeps at most one per driver at link time
/// rather than through a storage constraint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SiteLink {
    pub name: String,
    pub case_id: String,
}

impl SiteLink {
    pub fn new(name: impl Into<String>, case_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            case_id: case_id.into(),
        }
    }
}
