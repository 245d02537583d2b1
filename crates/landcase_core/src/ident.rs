use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::case::{DataReference, Driver};
use crate::variable::CaseVariable;

/// Hex digits of the case id: 128 bits of a Sha256 digest. The id is an
/// identifier, not a security boundary; accidental collision of distinct
/// configurations is treated as impossible.
const CASE_ID_HEX_LEN: usize = 32;

const FIELD_SEPARATOR: char = '\u{1f}';

#[derive(Serialize)]
struct IdentityPair<'a> {
    name: &'a str,
    value: &'a crate::variable::VariableValue,
}

/// Derive the content-addressed case id.
///
/// Pure function of the normalized definition: identical logical inputs
/// always produce the identical id. `variables` must already be name-sorted
/// by the validator so client-supplied order cannot change the digest.
/// Allocation: one canonical String + digest. Complexity: O(total input).
pub fn compute_case_id(
    compset: &str,
    resolution: Option<&str>,
    variables: &[CaseVariable],
    data_reference: &DataReference,
    driver: Driver,
    version_tag: &str,
) -> String {
    let pairs: Vec<IdentityPair<'_>> = variables
        .iter()
        .map(|variable| IdentityPair {
            name: &variable.name,
            value: &variable.value,
        })
        .collect();
    let variables_json =
        serde_json::to_string(&pairs).unwrap_or_else(|_| String::from("[]"));

    let mut canonical = String::new();
    for part in [
        compset,
        resolution.unwrap_or(""),
        &variables_json,
        data_reference.as_str(),
        driver.as_str(),
        version_tag,
    ] {
        canonical.push_str(part);
        canonical.push(FIELD_SEPARATOR);
    }

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..CASE_ID_HEX_LEN].to_owned()
}

/// On-disk folder name: the id, optionally suffixed with a slugified
/// human-readable name for discoverability.
pub fn case_folder_name(case_id: &str, name: Option<&str>) -> String {
    match name.map(slugify).filter(|slug| !slug.is_empty()) {
        Some(slug) => format!("{case_id}_{slug}"),
        None => case_id.to_owned(),
    }
}

/// Filesystem-safe slug: lowercase alphanumerics kept, runs of anything
/// else collapsed to single underscores.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_separator = true;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_was_separator = false;
        } else if !last_was_separator {
            slug.push('_');
            last_was_separator = true;
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    slug
}
