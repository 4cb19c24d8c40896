//! Check-cache file I/O: `etc/<config>/checks.3.txt` and its manual sidecar.
//!
//! Plain text, two tokens per line: decimal hash, decimal integer value.
//! Lines starting with `#` are comments. The manual sidecar uses `<hash> ?`
//! for checks a cross-compiled run could not execute and instead staged for
//! out-of-band execution.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

/// Load a `<hash> <value>` cache file. Missing files load as empty rather
/// than erroring — a fresh checkout has no prior run to draw from.
pub fn load(path: &Path) -> io::Result<HashMap<String, i32>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let content = fs::read_to_string(path)?;
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(hash), Some(value)) = (parts.next(), parts.next()) else { continue };
        if let Ok(value) = value.parse::<i32>() {
            map.insert(hash.to_string(), value);
        }
    }
    Ok(map)
}

/// Append newly resolved `(hash, value)` pairs. Existing entries are
/// rewritten in full so a repeated run never duplicates a hash line.
pub fn save(path: &Path, values: &HashMap<String, i32>) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut hashes: Vec<&String> = values.keys().collect();
    hashes.sort();
    let mut content = String::from("# generated check cache, do not hand-edit\n");
    for hash in hashes {
        content.push_str(&format!("{hash} {}\n", values[hash]));
    }
    fs::write(path, content)
}

/// Load the manual-probe sidecar: hashes pending a target-side run, recorded
/// as `<hash> ?`.
pub fn load_manual(path: &Path) -> io::Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.split_whitespace();
            let hash = parts.next()?;
            if parts.next() == Some("?") {
                Some(hash.to_string())
            } else {
                None
            }
        })
        .collect())
}

pub fn append_manual(path: &Path, hashes: &[String]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut existing = load_manual(path)?;
    for h in hashes {
        if !existing.contains(h) {
            existing.push(h.clone());
        }
    }
    let mut content = String::from("# checks requiring manual (target-side) execution\n");
    for h in &existing {
        content.push_str(&format!("{h} ?\n"));
    }
    fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_cache_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checks.3.txt");
        let mut values = HashMap::new();
        values.insert("abc123".to_string(), 1);
        values.insert("def456".to_string(), 0);
        save(&path, &values).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded, values);
    }

    #[test]
    fn missing_cache_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing.txt");
        assert!(load(&path).unwrap().is_empty());
    }

    #[test]
    fn manual_sidecar_round_trips_pending_hashes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("checks.3.manual.txt");
        append_manual(&path, &["h1".to_string()]).unwrap();
        append_manual(&path, &["h2".to_string()]).unwrap();

        let pending = load_manual(&path).unwrap();
        assert_eq!(pending, vec!["h1".to_string(), "h2".to_string()]);
    }
}
