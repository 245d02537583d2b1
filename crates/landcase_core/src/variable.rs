use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Free-form namelist text accepted verbatim, bypassing the schema.
pub const EXTRA_NAMELIST_VARIABLE: &str = "user_nl_clm_extra";

/// Plant-functional-type index list; a comma-separated string form is
/// split and parsed to integers before normal validation.
pub const PFT_INDEX_VARIABLE: &str = "included_pft_indices";

/// Value types as declared in the toolchain's XML files, plus `date`
/// (a char in yyyy-mm-dd form on the toolchain side).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    Char,
    Integer,
    Float,
    Logical,
    Date,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariableCategory {
    CtsmXml,
    UserNlClm,
    UserNlClmHistoryFile,
    Fates,
    FatesParam,
    Passthrough,
}

/// Runtime value with its shape made explicit. Scalar variants hold exactly
/// one coerced element; list variants are produced only for registry entries
/// with `allow_multiple`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VariableValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    BoolList(Vec<bool>),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    StrList(Vec<String>),
}

impl VariableValue {
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            Self::BoolList(_) | Self::IntList(_) | Self::FloatList(_) | Self::StrList(_)
        )
    }

    /// Scalar count: 1 for scalars, list length for lists.
    pub fn len(&self) -> usize {
        match self {
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) => 1,
            Self::BoolList(v) => v.len(),
            Self::IntList(v) => v.len(),
            Self::FloatList(v) => v.len(),
            Self::StrList(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// View as a uniform scalar sequence for per-element processing.
    /// Allocation: one Vec of scalar clones. Complexity: O(n).
    pub fn scalars(&self) -> Vec<VariableValue> {
        match self {
            Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_) => vec![self.clone()],
            Self::BoolList(v) => v.iter().map(|b| Self::Bool(*b)).collect(),
            Self::IntList(v) => v.iter().map(|i| Self::Int(*i)).collect(),
            Self::FloatList(v) => v.iter().map(|f| Self::Float(*f)).collect(),
            Self::StrList(v) => v.iter().map(|s| Self::Str(s.clone())).collect(),
        }
    }

    /// Rebuild a value from coerced scalars. With `multiple` the scalars are
    /// packed into the matching list variant (the validator guarantees a
    /// uniform element type); otherwise the single scalar is returned as-is.
    pub fn from_scalars(mut scalars: Vec<VariableValue>, multiple: bool) -> VariableValue {
        if !multiple && scalars.len() == 1 {
            return scalars.remove(0);
        }
        match scalars.first() {
            Some(Self::Bool(_)) => Self::BoolList(
                scalars
                    .into_iter()
                    .filter_map(|s| match s {
                        Self::Bool(b) => Some(b),
                        _ => None,
                    })
                    .collect(),
            ),
            Some(Self::Int(_)) => Self::IntList(
                scalars
                    .into_iter()
                    .filter_map(|s| match s {
                        Self::Int(i) => Some(i),
                        _ => None,
                    })
                    .collect(),
            ),
            Some(Self::Float(_)) => Self::FloatList(
                scalars
                    .into_iter()
                    .filter_map(|s| match s {
                        Self::Float(f) => Some(f),
                        _ => None,
                    })
                    .collect(),
            ),
            _ => Self::StrList(
                scalars
                    .into_iter()
                    .filter_map(|s| match s {
                        Self::Str(text) => Some(text),
                        _ => None,
                    })
                    .collect(),
            ),
        }
    }

    /// Plain text rendering used for toolchain XML changes and command
    /// arguments; list elements are comma-joined. Namelist quoting is a
    /// separate concern and lives with the namelist writer.
    pub fn render_plain(&self) -> String {
        match self {
            Self::Bool(b) => (if *b { "TRUE" } else { "FALSE" }).to_owned(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Str(s) => s.clone(),
            _ => self
                .scalars()
                .iter()
                .map(VariableValue::render_plain)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Coerce one raw JSON scalar to the declared type. Returns a scalar
/// `VariableValue` or a human-readable reason for the per-variable error.
pub fn coerce_scalar(raw: &Value, var_type: VariableType) -> Result<VariableValue, String> {
    match var_type {
        VariableType::Char | VariableType::Date => match raw {
            Value::String(s) => Ok(VariableValue::Str(s.clone())),
            Value::Number(n) => Ok(VariableValue::Str(n.to_string())),
            other => Err(format!("{other} is not a valid string")),
        },
        VariableType::Integer => match raw {
            Value::Number(n) => n
                .as_i64()
                .map(VariableValue::Int)
                .ok_or_else(|| format!("{n} is not a valid integer")),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(VariableValue::Int)
                .map_err(|_| format!("{s} is not a valid integer")),
            other => Err(format!("{other} is not a valid integer")),
        },
        VariableType::Float => match raw {
            Value::Number(n) => n
                .as_f64()
                .map(VariableValue::Float)
                .ok_or_else(|| format!("{n} is not a valid float")),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(VariableValue::Float)
                .map_err(|_| format!("{s} is not a valid float")),
            other => Err(format!("{other} is not a valid float")),
        },
        VariableType::Logical => match raw {
            Value::Bool(b) => Ok(VariableValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(|i| VariableValue::Bool(i != 0))
                .ok_or_else(|| format!("{n} is not a valid boolean")),
            Value::String(s) => parse_bool_text(s)
                .map(VariableValue::Bool)
                .ok_or_else(|| format!("{s} is not a valid boolean")),
            other => Err(format!("{other} is not a valid boolean")),
        },
    }
}

/// Truthy-string forms accepted by the toolchain environment files.
fn parse_bool_text(text: &str) -> Option<bool> {
    if let Ok(number) = text.trim().parse::<i64>() {
        return Some(number != 0);
    }
    match text.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" | "t" | "true" => Some(true),
        "n" | "no" | "f" | "false" => Some(false),
        _ => None,
    }
}

/// One validated configuration variable. Category and type are copied from
/// the registry entry at validation time so execution stages do not query
/// the registry again for shape information.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CaseVariable {
    pub name: String,
    pub value: VariableValue,
    pub category: VariableCategory,
    #[serde(rename = "type")]
    pub var_type: VariableType,
}
