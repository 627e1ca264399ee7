use std::path::Path;

use roxy_shared::error::ProxyError;

/// Loads the parameter-scanner's candidate name list: one name per line,
/// UTF-8, no escaping (§6). Blank lines are skipped so a trailing newline
/// in the dictionary file doesn't become an empty candidate.
pub fn load_dictionary(path: &Path) -> Result<Vec<String>, ProxyError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        ProxyError::Fatal(format!("could not read param dictionary at {}: {e}", path.display()))
    })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}
