use landcase_core::{NamelistEntry, VariableType, VariableValue};

/// Render one namelist value the way the model reads it: char/date values
/// single-quoted, numbers bare, logicals as `.true.`/`.false.`; list
/// elements comma-joined.
pub fn render_namelist_value(value: &VariableValue, var_type: VariableType) -> String {
    value
        .scalars()
        .iter()
        .map(|scalar| render_scalar(scalar, var_type))
        .collect::<Vec<_>>()
        .join(",")
}

fn render_scalar(scalar: &VariableValue, var_type: VariableType) -> String {
    match (var_type, scalar) {
        (VariableType::Logical, VariableValue::Bool(b)) => {
            (if *b { ".true." } else { ".false." }).to_owned()
        }
        (VariableType::Char | VariableType::Date, _) => format!("'{}'", scalar.render_plain()),
        _ => scalar.render_plain(),
    }
}

/// Render one full namelist line (without trailing newline).
pub fn render_namelist_entry(entry: &NamelistEntry) -> String {
    match entry {
        NamelistEntry::Var {
            name,
            value,
            var_type,
        } => format!("{name} = {}", render_namelist_value(value, *var_type)),
        NamelistEntry::Verbatim(text) => text.clone(),
    }
}
