use std::collections::HashMap;

use crate::UploadError;

/// Extracts from `options` the entries whose keys carry the given prefix.
/// In the returned map the prefix is removed from the key.
pub fn extract_dictionary(
    options: &HashMap<String, String>,
    prefix: &str,
) -> HashMap<String, String> {
    options
        .iter()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .map(|stripped| (stripped.to_string(), value.clone()))
        })
        .collect()
}

/// Returns the non-empty value of a required option.
pub(crate) fn required<'a>(
    options: &'a HashMap<String, String>,
    name: &'static str,
) -> Result<&'a str, UploadError> {
    match options.get(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(UploadError::MissingParameter(name)),
    }
}
