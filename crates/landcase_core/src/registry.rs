use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::RegistryError;
use crate::variable::{VariableCategory, VariableType};

/// One entry of a choice list. Comparison during validation is by `value`;
/// `label` is display-only.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ChoiceOption {
    pub value: Value,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VariableValidation {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub pattern_error: Option<String>,
    #[serde(default)]
    pub choices: Option<Vec<ChoiceOption>>,
}

/// Declarative descriptor of one allowed configuration variable. Field names
/// follow the externally maintained registry document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct VariableConfig {
    pub name: String,
    pub category: VariableCategory,
    #[serde(rename = "type")]
    pub var_type: VariableType,
    #[serde(default)]
    pub allow_multiple: bool,
    #[serde(default)]
    pub allow_custom: bool,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub validation: Option<VariableValidation>,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub append_input_path: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// Immutable catalog of allowed variables, in document order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableRegistry {
    configs: Vec<VariableConfig>,
}

impl VariableRegistry {
    pub fn from_configs(configs: Vec<VariableConfig>) -> Self {
        Self { configs }
    }

    /// Load the registry document. A missing document yields an empty
    /// registry ("no variables allowed"), not an error; an unreadable or
    /// malformed document is an error.
    pub fn from_path(path: &Path) -> Result<Self, RegistryError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|err| RegistryError::Unreadable {
            path: path.to_string_lossy().to_string(),
            detail: err.to_string(),
        })?;
        let configs: Vec<VariableConfig> = serde_json::from_str(&contents)
            .map_err(|err| RegistryError::Parse(err.to_string()))?;
        Ok(Self { configs })
    }

    /// Lookup by variable name. Allocation: none. Complexity: O(n).
    pub fn get(&self, name: &str) -> Option<&VariableConfig> {
        self.configs.iter().find(|config| config.name == name)
    }

    pub fn all(&self) -> &[VariableConfig] {
        &self.configs
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}

/// Shared process-wide registry handle. Reads are lock-free; the document is
/// treated as immutable for the process lifetime, so `reload` exists for
/// process start and tests, not for hot invalidation.
pub struct RegistryHandle {
    path: PathBuf,
    inner: ArcSwap<VariableRegistry>,
}

impl RegistryHandle {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let registry = VariableRegistry::from_path(&path)?;
        Ok(Self {
            path,
            inner: ArcSwap::from_pointee(registry),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current registry snapshot. Allocation: one Arc clone. Complexity: O(1).
    pub fn get(&self) -> Arc<VariableRegistry> {
        self.inner.load_full()
    }

    /// Re-read the document from disk and swap the snapshot in.
    pub fn reload(&self) -> Result<(), RegistryError> {
        let registry = VariableRegistry::from_path(&self.path)?;
        self.inner.store(Arc::new(registry));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn temp_doc(name: &str, contents: &str) -> PathBuf {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("landcase_registry_{name}_{now}.json"));
        std::fs::write(&path, contents).expect("write registry doc");
        path
    }

    #[test]
    fn missing_document_yields_empty_registry() {
        let registry = VariableRegistry::from_path(Path::new("/nonexistent/vars.json"))
            .expect("missing doc is not an error");
        assert!(registry.is_empty());
    }

    #[test]
    fn malformed_document_is_an_error() {
        let path = temp_doc("malformed", "{not json");
        let err = VariableRegistry::from_path(&path).expect_err("must fail");
        assert!(matches!(err, RegistryError::Parse(_)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn document_fields_parse_with_defaults() {
        let path = temp_doc(
            "fields",
            r#"[
              {"name": "STOP_N", "category": "ctsm_xml", "type": "integer",
               "validation": {"min": 1, "max": 600}},
              {"name": "DATM_CLMNCEP_YR_START", "category": "ctsm_xml", "type": "integer"}
            ]"#,
        );
        let registry = VariableRegistry::from_path(&path).expect("parse");
        let stop_n = registry.get("STOP_N").expect("STOP_N present");
        assert_eq!(stop_n.var_type, VariableType::Integer);
        assert!(!stop_n.allow_multiple);
        assert_eq!(
            stop_n.validation.as_ref().and_then(|v| v.min),
            Some(1.0_f64)
        );
        assert!(registry.get("UNKNOWN").is_none());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn handle_reload_swaps_snapshot() {
        let path = temp_doc("reload", "[]");
        let handle = RegistryHandle::load(&path).expect("load");
        assert!(handle.get().is_empty());

        std::fs::write(
            &path,
            json!([{"name": "STOP_OPTION", "category": "ctsm_xml", "type": "char"}]).to_string(),
        )
        .expect("rewrite doc");
        handle.reload().expect("reload");
        assert!(handle.get().get("STOP_OPTION").is_some());
        let _ = std::fs::remove_file(&path);
    }
}
