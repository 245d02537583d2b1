use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ValidationError;
use crate::registry::{VariableConfig, VariableRegistry};
use crate::variable::{
    coerce_scalar, CaseVariable, VariableCategory, VariableType, VariableValue,
    EXTRA_NAMELIST_VARIABLE, PFT_INDEX_VARIABLE,
};

/// One inbound `(name, value)` variable request, before validation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RawVariable {
    pub name: String,
    pub value: Value,
}

impl RawVariable {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Validate the whole variable set against the registry.
///
/// Validation is atomic: every request is checked and every failure is
/// reported together; a single failure rejects the entire set. On success
/// the output is sorted by name so the identity hash does not depend on
/// client-supplied order.
pub fn validate_variables(
    raw: &[RawVariable],
    registry: &VariableRegistry,
) -> Result<Vec<CaseVariable>, ValidationError> {
    let mut validated = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();

    for request in raw {
        // The one escape hatch for arbitrary text; never schema-checked.
        if request.name == EXTRA_NAMELIST_VARIABLE {
            match &request.value {
                Value::String(text) => validated.push(CaseVariable {
                    name: request.name.clone(),
                    value: VariableValue::Str(text.clone()),
                    category: VariableCategory::Passthrough,
                    var_type: VariableType::Char,
                }),
                other => errors.push(format!(
                    "variable {}: {other} is not free-form namelist text",
                    request.name
                )),
            }
            continue;
        }

        let Some(config) = registry.get(&request.name) else {
            errors.push(format!("variable {} is not allowed", request.name));
            continue;
        };

        match validate_one(request, config) {
            Ok(variable) => validated.push(variable),
            Err(mut messages) => errors.append(&mut messages),
        }
    }

    if !errors.is_empty() {
        return Err(ValidationError::new(errors));
    }

    validated.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(validated)
}

fn validate_one(request: &RawVariable, config: &VariableConfig) -> Result<CaseVariable, Vec<String>> {
    let raw_value = if request.name == PFT_INDEX_VARIABLE {
        split_pft_indices(&request.name, &request.value)?
    } else {
        request.value.clone()
    };

    let elements = match raw_value {
        Value::Array(items) => {
            if !config.allow_multiple && items.len() > 1 {
                return Err(vec![format!(
                    "variable {} expects a single value, got {}",
                    config.name,
                    items.len()
                )]);
            }
            if items.is_empty() {
                return Err(vec![format!("variable {} has no value", config.name)]);
            }
            items
        }
        other => vec![other],
    };

    let mut scalars = Vec::with_capacity(elements.len());
    let mut errors = Vec::new();
    for element in &elements {
        match coerce_scalar(element, config.var_type) {
            Ok(scalar) => match check_rules(&scalar, config) {
                Ok(()) => scalars.push(scalar),
                Err(message) => errors.push(message),
            },
            Err(reason) => errors.push(format!("variable {}: {reason}", config.name)),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(CaseVariable {
        name: config.name.clone(),
        value: VariableValue::from_scalars(scalars, config.allow_multiple),
        category: config.category,
        var_type: config.var_type,
    })
}

/// A comma-separated PFT index string is split and parsed to integers before
/// normal processing; any unparsable component rejects the variable.
fn split_pft_indices(name: &str, value: &Value) -> Result<Value, Vec<String>> {
    let Value::String(text) = value else {
        return Ok(value.clone());
    };
    let mut indices = Vec::new();
    let mut errors = Vec::new();
    for part in text.split(',') {
        match part.trim().parse::<i64>() {
            Ok(index) => indices.push(Value::from(index)),
            Err(_) => errors.push(format!(
                "variable {name}: {part} is not a valid integer index"
            )),
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }
    Ok(Value::Array(indices))
}

/// Apply the registry's validation rules to one coerced scalar.
///
/// A choice list (without `allow_custom`) is exclusive: the value must equal
/// one choice value and bounds/pattern are not consulted. Numeric bounds
/// apply only to numeric types, the pattern only to string types.
fn check_rules(scalar: &VariableValue, config: &VariableConfig) -> Result<(), String> {
    let Some(validation) = config.validation.as_ref() else {
        return Ok(());
    };

    if let Some(choices) = validation.choices.as_ref() {
        if !choices.is_empty() && !config.allow_custom {
            let matched = choices.iter().any(|choice| {
                coerce_scalar(&choice.value, config.var_type)
                    .map(|coerced| &coerced == scalar)
                    .unwrap_or(false)
            });
            if !matched {
                return Err(format!(
                    "{} is not a valid choice for {}",
                    scalar.render_plain(),
                    config.name
                ));
            }
            return Ok(());
        }
    }

    let numeric = match scalar {
        VariableValue::Int(i) => Some(*i as f64),
        VariableValue::Float(f) => Some(*f),
        _ => None,
    };
    if let Some(value) = numeric {
        if let Some(min) = validation.min {
            if value < min {
                return Err(format!(
                    "variable {} must be at least {min}, got {}",
                    config.name,
                    scalar.render_plain()
                ));
            }
        }
        if let Some(max) = validation.max {
            if value > max {
                return Err(format!(
                    "variable {} must be at most {max}, got {}",
                    config.name,
                    scalar.render_plain()
                ));
            }
        }
    }

    if let (VariableValue::Str(text), Some(pattern)) = (scalar, validation.pattern.as_deref()) {
        let regex = Regex::new(pattern)
            .map_err(|_| format!("variable {} has an invalid pattern rule", config.name))?;
        if !regex.is_match(text) {
            return Err(match validation.pattern_error.as_deref() {
                Some(message) => message.to_owned(),
                None => format!(
                    "variable {} value {text} does not match the expected pattern",
                    config.name
                ),
            });
        }
    }

    Ok(())
}
