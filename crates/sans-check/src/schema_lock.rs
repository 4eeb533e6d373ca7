//! `schema.lock.json` (§4.H): the schema-ingress gate that lets a datasource
//! with no concrete column types in its own IR declaration still type-check,
//! by supplying column types from a previously written lock file.
//!
//! Grounded on `original_source/sans/sans/schema_lock.py`: same version tag,
//! same canonicalization (top-level keys sorted, `datasources` list order
//! preserved, each entry's `rules` sorted, `columns` order preserved),
//! same best-effort `git rev-parse HEAD` provenance stamp.

use crate::error::CheckError;
use crate::typecheck::SchemaEnv;
use indexmap::IndexMap;
use sans_core::ir::{DatasourceDecl, DatasourceKind, IrDoc};
use sans_core::Type;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::mpsc;
use std::time::Duration;

pub const SCHEMA_LOCK_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRules {
    pub extra_columns: String,
    pub missing_columns: String,
}

impl Default for LockRules {
    fn default() -> Self {
        LockRules {
            extra_columns: "ignore".to_string(),
            missing_columns: "error".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDatasource {
    pub columns: Vec<LockColumn>,
    pub kind: String,
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub rules: LockRules,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreatedBy {
    pub sans_version: String,
    pub git_sha: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaLock {
    pub created_by: CreatedBy,
    pub datasources: Vec<LockDatasource>,
    pub schema_lock_version: u32,
}

impl SchemaLock {
    pub fn by_name(&self) -> IndexMap<&str, &LockDatasource> {
        self.datasources.iter().map(|d| (d.name.as_str(), d)).collect()
    }

    pub fn to_column_types(entry: &LockDatasource) -> SchemaEnv {
        let mut out = SchemaEnv::new();
        for col in &entry.columns {
            let t = Type::parse_name(&col.ty).unwrap_or(Type::Unknown);
            out.insert(col.name.clone(), t);
        }
        out
    }

    pub fn required_columns(entry: &LockDatasource) -> Vec<&str> {
        entry.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Reads and parses `path`, rejecting any version other than 1.
pub fn load_schema_lock(path: &Path) -> Result<SchemaLock, CheckError> {
    let text = std::fs::read_to_string(path).map_err(|_| CheckError::SchemaLockNotFound {
        path: path.display().to_string(),
    })?;
    let lock: SchemaLock = serde_json::from_str(&text).map_err(|_| CheckError::SchemaLockInvalid {
        name: String::new(),
        column: String::new(),
    })?;
    if lock.schema_lock_version != SCHEMA_LOCK_VERSION {
        return Err(CheckError::SchemaLockInvalid {
            name: String::new(),
            column: String::new(),
        });
    }
    Ok(lock)
}

/// Best-effort `git rev-parse HEAD`, bounded to ~2 seconds and truncated to
/// 40 characters. Any failure (no git, not a repo, timeout) yields `""`.
pub fn git_sha() -> String {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let result = Command::new("git").args(["rev-parse", "HEAD"]).output();
        let _ = tx.send(result);
    });
    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(Ok(out)) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .trim()
            .chars()
            .take(40)
            .collect(),
        _ => String::new(),
    }
}

/// Builds a lock payload covering every CSV/inline-CSV datasource in
/// `referenced_names`, preferring concrete types already present on the
/// datasource declaration, falling back to a previously loaded lock, and
/// finally to an untyped column list.
pub fn build_schema_lock(
    ir: &IrDoc,
    referenced_names: &std::collections::BTreeSet<String>,
    schema_lock_used: Option<&SchemaLock>,
    sans_version: &str,
) -> SchemaLock {
    let lock_entries: BTreeMap<&str, &LockDatasource> = schema_lock_used
        .map(|l| l.datasources.iter().map(|d| (d.name.as_str(), d)).collect())
        .unwrap_or_default();

    let mut datasources = Vec::new();
    for name in referenced_names {
        let Some(ds) = ir.datasources.get(name) else { continue };
        if !matches!(ds.kind, DatasourceKind::Csv | DatasourceKind::InlineCsv) {
            continue;
        }
        let path_str = ds
            .path
            .as_deref()
            .map(|p| p.replace('\\', "/"))
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| format!("{name}.csv"));

        let columns_order: Vec<String>;
        let mut column_types: BTreeMap<String, String> = BTreeMap::new();

        if let Some(types) = &ds.column_types {
            columns_order = ds
                .columns
                .clone()
                .unwrap_or_else(|| types.keys().cloned().collect::<std::collections::BTreeSet<_>>().into_iter().collect());
            for c in &columns_order {
                let t = types.get(c).map(|t| t.name().to_string()).unwrap_or_else(|| "unknown".to_string());
                column_types.insert(c.clone(), t);
            }
        } else if let Some(entry) = lock_entries.get(name.as_str()) {
            columns_order = SchemaLock::required_columns(entry).into_iter().map(String::from).collect();
            for col in &entry.columns {
                column_types.insert(col.name.clone(), col.ty.to_ascii_lowercase());
            }
        } else if let Some(cols) = &ds.columns {
            columns_order = cols.clone();
            for c in cols {
                column_types.insert(c.clone(), "unknown".to_string());
            }
        } else {
            continue;
        }

        if columns_order.is_empty() {
            continue;
        }

        let columns_payload: Vec<LockColumn> = columns_order
            .iter()
            .map(|c| LockColumn {
                name: c.clone(),
                ty: column_types.get(c).cloned().unwrap_or_else(|| "unknown".to_string()),
            })
            .collect();

        datasources.push(LockDatasource {
            columns: columns_payload,
            kind: match ds.kind {
                DatasourceKind::Csv => "csv".to_string(),
                DatasourceKind::InlineCsv => "inline_csv".to_string(),
            },
            name: name.clone(),
            path: path_str,
            rules: LockRules::default(),
        });
    }

    SchemaLock {
        created_by: CreatedBy {
            sans_version: sans_version.to_string(),
            git_sha: git_sha(),
        },
        datasources,
        schema_lock_version: SCHEMA_LOCK_VERSION,
    }
}

/// Canonical JSON for hashing and for the on-disk file: top-level keys
/// sorted, `datasources` list order preserved, each entry's `rules` sorted,
/// `columns` order preserved.
pub fn canonical_lock_json(lock: &SchemaLock) -> Result<String, CheckError> {
    let value = serde_json::json!({
        "created_by": {
            "git_sha": lock.created_by.git_sha,
            "sans_version": lock.created_by.sans_version,
        },
        "datasources": lock.datasources.iter().map(|d| serde_json::json!({
            "columns": d.columns.iter().map(|c| serde_json::json!({"name": c.name, "type": c.ty})).collect::<Vec<_>>(),
            "kind": d.kind,
            "name": d.name,
            "path": d.path,
            "rules": {
                "extra_columns": d.rules.extra_columns,
                "missing_columns": d.rules.missing_columns,
            },
        })).collect::<Vec<_>>(),
        "schema_lock_version": lock.schema_lock_version,
    });
    sans_core::canon::to_canonical_string(&value).map_err(CheckError::Core)
}

pub fn compute_lock_sha256(lock: &SchemaLock) -> Result<String, CheckError> {
    let canonical = canonical_lock_json(lock)?;
    Ok(sans_core::canon::sha256_hex(canonical.as_bytes()))
}

pub fn write_schema_lock(lock: &SchemaLock, path: &Path) -> Result<(), CheckError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CheckError::Core(sans_core::CoreError::Io(e.to_string())))?;
    }
    let canonical = canonical_lock_json(lock)?;
    std::fs::write(path, canonical).map_err(|e| CheckError::Core(sans_core::CoreError::Io(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap as IMap;
    use std::collections::BTreeSet;

    fn sample_ir() -> IrDoc {
        let mut ir = IrDoc::new();
        let mut types: IMap<String, Type> = IMap::new();
        types.insert("a".to_string(), Type::Int);
        types.insert("b".to_string(), Type::String);
        ir.datasources.insert(
            "in".to_string(),
            DatasourceDecl {
                kind: DatasourceKind::Csv,
                path: Some("data/in.csv".to_string()),
                columns: Some(vec!["a".to_string(), "b".to_string()]),
                column_types: Some(types),
                inline_text: None,
                inline_sha256: None,
            },
        );
        ir
    }

    #[test]
    fn build_lock_preserves_column_order_and_types() {
        let ir = sample_ir();
        let mut referenced = BTreeSet::new();
        referenced.insert("in".to_string());
        let lock = build_schema_lock(&ir, &referenced, None, "sans-rs/0.1.0");
        assert_eq!(lock.datasources.len(), 1);
        let entry = &lock.datasources[0];
        assert_eq!(entry.columns[0].name, "a");
        assert_eq!(entry.columns[0].ty, "int");
        assert_eq!(entry.columns[1].ty, "string");
        assert_eq!(entry.path, "data/in.csv");
    }

    #[test]
    fn canonical_json_sorts_top_level_keys_but_preserves_column_order() {
        let ir = sample_ir();
        let mut referenced = BTreeSet::new();
        referenced.insert("in".to_string());
        let lock = build_schema_lock(&ir, &referenced, None, "sans-rs/0.1.0");
        let json = canonical_lock_json(&lock).unwrap();
        let a_pos = json.find("\"a\"").unwrap();
        let b_pos = json.find("\"b\"").unwrap();
        assert!(a_pos < b_pos);
    }

    #[test]
    fn hash_is_deterministic_across_rebuilds() {
        let ir = sample_ir();
        let mut referenced = BTreeSet::new();
        referenced.insert("in".to_string());
        let lock1 = build_schema_lock(&ir, &referenced, None, "sans-rs/0.1.0");
        let lock2 = build_schema_lock(&ir, &referenced, None, "sans-rs/0.1.0");
        assert_eq!(
            compute_lock_sha256(&lock1).unwrap(),
            compute_lock_sha256(&lock2).unwrap()
        );
    }

    #[test]
    fn load_missing_file_fails_not_found() {
        let err = load_schema_lock(Path::new("/nonexistent/schema.lock.json")).unwrap_err();
        assert_eq!(err.code(), "E_SCHEMA_LOCK_NOT_FOUND");
    }

    #[test]
    fn non_csv_datasource_is_skipped() {
        let mut ir = IrDoc::new();
        ir.datasources.insert(
            "in".to_string(),
            DatasourceDecl {
                kind: DatasourceKind::Csv,
                path: None,
                columns: None,
                column_types: None,
                inline_text: None,
                inline_sha256: None,
            },
        );
        let mut referenced = BTreeSet::new();
        referenced.insert("in".to_string());
        let lock = build_schema_lock(&ir, &referenced, None, "sans-rs/0.1.0");
        assert!(lock.datasources.is_empty());
    }
}
