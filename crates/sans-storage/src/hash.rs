//! Per-extension deterministic file hashing, grounded on
//! `original_source/sans/sans/hash_utils.py`.
//!
//! Two rules exist because report *inputs* (the literal script/config the
//! user handed in) are hashed byte-for-byte to detect drift in what the
//! user supplied, while *artifacts the bundle itself produced* are hashed
//! after canonicalization so regenerating the same artifact from
//! equivalent-but-differently-formatted source data hashes identically.

use crate::error::StorageError;
use sans_core::canon::sha256_hex;
use std::path::Path;

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Parses a CSV with `csv::ReaderBuilder` and re-serializes it with `\n`
/// line terminators, so CRLF- and LF-sourced CSVs with identical cells hash
/// identically.
fn canonicalize_csv(path: &Path) -> Result<Vec<u8>, StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StorageError::Io(e.to_string()))?;
    let mut out = Vec::new();
    {
        let mut writer = csv::WriterBuilder::new().terminator(csv::Terminator::Any(b'\n')).from_writer(&mut out);
        for record in reader.records() {
            let record = record.map_err(|e| StorageError::Io(e.to_string()))?;
            writer.write_record(&record).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        writer.flush().map_err(|e| StorageError::Io(e.to_string()))?;
    }
    Ok(out)
}

fn canonicalize_text(path: &Path) -> Result<Vec<u8>, StorageError> {
    let text = std::fs::read_to_string(path).map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(normalize_line_endings(&text).into_bytes())
}

/// `compute_canonical_json_sha256`: parse as JSON, re-serialize with sorted
/// keys and compact separators, hash. Returns `None` on any parse failure
/// (the caller falls back to a raw-bytes hash), mirroring the original's
/// best-effort `try/except` fallthrough.
pub fn compute_canonical_json_sha256(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let value: serde_json::Value = serde_json::from_str(&text).ok()?;
    sans_core::canon::to_canonical_string(&value).ok().map(|s| sha256_hex(s.as_bytes()))
}

fn raw_hash(path: &Path) -> Result<String, StorageError> {
    let data = std::fs::read(path).map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(sha256_hex(&data))
}

/// `compute_input_hash`: canonical-JSON hash for `.json`, raw bytes for
/// everything else. Used for report `inputs[]` entries only.
pub fn compute_input_hash(path: &Path) -> Result<String, StorageError> {
    if path.extension().and_then(|e| e.to_str()).map(|s| s.eq_ignore_ascii_case("json")).unwrap_or(false) {
        if let Some(hash) = compute_canonical_json_sha256(path) {
            return Ok(hash);
        }
    }
    raw_hash(path)
}

/// `compute_artifact_hash`: `.csv` canonicalized, `.json` canonicalized,
/// `.sas`/`.txt`/`.md`/`.toml`/`.yaml`/`.yml` line-ending-normalized,
/// everything else (including `.xpt`) raw bytes. Used for report
/// `artifacts[]`/`outputs[]` entries, which the bundle itself produced.
pub fn compute_artifact_hash(path: &Path) -> Result<String, StorageError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    if ext == "csv" {
        if let Ok(bytes) = canonicalize_csv(path) {
            return Ok(sha256_hex(&bytes));
        }
    }
    if ext == "json" {
        if let Some(hash) = compute_canonical_json_sha256(path) {
            return Ok(hash);
        }
    }
    if matches!(ext.as_str(), "sas" | "txt" | "md" | "toml" | "yaml" | "yml") {
        if let Ok(bytes) = canonicalize_text(path) {
            return Ok(sha256_hex(&bytes));
        }
    }
    raw_hash(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn csv_with_crlf_hashes_same_as_lf() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::File::create(&a).unwrap().write_all(b"col\r\n1\r\n2\r\n").unwrap();
        std::fs::File::create(&b).unwrap().write_all(b"col\n1\n2\n").unwrap();
        assert_eq!(compute_artifact_hash(&a).unwrap(), compute_artifact_hash(&b).unwrap());
    }

    #[test]
    fn json_artifact_hash_ignores_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, r#"{"x":1,"y":2}"#).unwrap();
        std::fs::write(&b, r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(compute_artifact_hash(&a).unwrap(), compute_artifact_hash(&b).unwrap());
    }

    #[test]
    fn input_hash_does_not_canonicalize_csv() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.csv");
        let b = dir.path().join("b.csv");
        std::fs::File::create(&a).unwrap().write_all(b"col\r\n1\r\n").unwrap();
        std::fs::File::create(&b).unwrap().write_all(b"col\n1\n").unwrap();
        assert_ne!(compute_input_hash(&a).unwrap(), compute_input_hash(&b).unwrap());
    }
}
