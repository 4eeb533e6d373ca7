//! The reference execution runtime: per-op executors over the closed
//! `OpParams` set, CSV I/O, and `execute_plan` orchestration. Grounded on
//! `original_source/sans/sans/runtime.py`.
//!
//! The runtime drives [`sans_core::validate::ValidatedIr::order`] directly —
//! the same topological order structural validation already computed — so
//! there is no second dependency resolution pass here.

use crate::bundle;
use crate::error::StorageError;
use crate::eval::{self, EvalContext, Formats, Row};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use sans_core::ir::{
    AggOp, CastType, IrDoc, Metric, OnError, OpParams, SortKey, Step,
};
use sans_core::types::Literal;
use sans_core::validate::ValidatedIr;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::Path;

pub type Table = Vec<Row>;

/// Per-step evidence recorded into `runtime.evidence.json`, mirroring
/// `runtime.py::execute_plan`'s `step_evidence` entries.
#[derive(Debug, Clone, Serialize)]
pub struct StepEvidence {
    pub step_index: usize,
    pub step_id: String,
    pub transform_id: String,
    pub op: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub row_counts: IndexMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assert_result: Option<bool>,
}

#[derive(Debug)]
pub struct SavedOutput {
    pub table: String,
    pub path: std::path::PathBuf,
    pub rows: usize,
    pub columns: Vec<String>,
}

pub struct ExecutionResult {
    pub outputs: Vec<SavedOutput>,
    pub step_evidence: Vec<StepEvidence>,
}

// ---------------------------------------------------------------------
// Cell parsing / CSV I/O, grounded on `_parse_value`/`_load_csv`/`_write_csv`.
// ---------------------------------------------------------------------

/// Mirrors `_parse_value`: empty string is `NULL`; a value with a leading
/// zero and more than one digit stays a string (zip codes, study IDs);
/// otherwise tries `i64`, then `Decimal`, else falls back to the raw string.
pub fn parse_csv_value(raw: &str) -> Literal {
    if raw.is_empty() {
        return Literal::Null;
    }
    let is_all_digits = raw.chars().all(|c| c.is_ascii_digit());
    if is_all_digits && raw.len() > 1 && raw.starts_with('0') {
        return Literal::String(raw.to_string());
    }
    let looks_like_int = is_all_digits || (raw.starts_with('-') && raw[1..].chars().all(|c| c.is_ascii_digit()) && raw.len() > 1);
    if looks_like_int {
        if let Ok(i) = raw.parse::<i64>() {
            return Literal::Int(i);
        }
    }
    if let Ok(d) = raw.parse::<Decimal>() {
        return Literal::Decimal(d);
    }
    Literal::String(raw.to_string())
}

pub fn load_csv(path: &Path) -> Result<Table, StorageError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| StorageError::Io(e.to_string()))?;
    let headers: Vec<String> = reader.headers().map_err(|e| StorageError::Io(e.to_string()))?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| StorageError::Io(e.to_string()))?;
        if record.is_empty() {
            continue;
        }
        let mut row = Row::new();
        for (i, header) in headers.iter().enumerate() {
            let value = record.get(i).map(parse_csv_value).unwrap_or(Literal::Null);
            row.insert(header.clone(), value);
        }
        rows.push(row);
    }
    Ok(rows)
}

fn literal_to_csv_cell(lit: &Literal) -> String {
    match lit {
        Literal::Null => String::new(),
        Literal::Bool(b) => b.to_string(),
        Literal::Int(i) => i.to_string(),
        Literal::Decimal(d) => d.to_string(),
        Literal::String(s) => s.clone(),
    }
}

pub fn write_csv(path: &Path, rows: &[Row]) -> Result<(), StorageError> {
    if rows.is_empty() {
        std::fs::write(path, "").map_err(|e| StorageError::Io(e.to_string()))?;
        return Ok(());
    }
    let headers: Vec<String> = rows[0].keys().cloned().collect();
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_path(path)
        .map_err(|e| StorageError::Io(e.to_string()))?;
    writer.write_record(&headers).map_err(|e| StorageError::Io(e.to_string()))?;
    for row in rows {
        let record: Vec<String> = headers.iter().map(|h| row.get(h).map(literal_to_csv_cell).unwrap_or_default()).collect();
        writer.write_record(&record).map_err(|e| StorageError::Io(e.to_string()))?;
    }
    writer.flush().map_err(|e| StorageError::Io(e.to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------
// Sorting, grounded on `_sort_key_value`/`_sort_rows`/`_check_sorted`.
// ---------------------------------------------------------------------

fn sort_key_value(v: &Literal) -> (u8, &Literal) {
    if matches!(v, Literal::Null) {
        (0, v)
    } else {
        (1, v)
    }
}

fn compare_sort_keys(a: &[Literal], b: &[Literal]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let (xt, _) = sort_key_value(x);
        let (yt, _) = sort_key_value(y);
        let ord = xt.cmp(&yt).then_with(|| {
            if xt == 0 {
                Ordering::Equal
            } else {
                eval::compare_sas(x, y)
            }
        });
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Descending sort is refused at v0.1, matching `_sort_rows`'s explicit
/// `SANS_RUNTIME_SORT_UNSUPPORTED` guard.
pub fn sort_rows(rows: &[Row], by: &[SortKey], nodupkey: bool) -> Result<Table, StorageError> {
    if by.is_empty() {
        return Ok(rows.to_vec());
    }
    for key in by {
        if key.desc {
            return Err(StorageError::UnsupportedExprNode("descending sort is not supported in v0.1 runtime".to_string()));
        }
    }
    let cols: Vec<&str> = by.iter().map(|k| k.col.as_str()).collect();
    let mut indexed: Vec<(usize, &Row)> = rows.iter().enumerate().collect();
    indexed.sort_by(|(_, a), (_, b)| {
        let ak: Vec<Literal> = cols.iter().map(|c| a.get(*c).cloned().unwrap_or(Literal::Null)).collect();
        let bk: Vec<Literal> = cols.iter().map(|c| b.get(*c).cloned().unwrap_or(Literal::Null)).collect();
        compare_sort_keys(&ak, &bk)
    });

    if !nodupkey {
        return Ok(indexed.into_iter().map(|(_, r)| r.clone()).collect());
    }
    let mut out = Vec::new();
    let mut last_key: Option<Vec<Literal>> = None;
    for (_, row) in indexed {
        let key: Vec<Literal> = cols.iter().map(|c| row.get(*c).cloned().unwrap_or(Literal::Null)).collect();
        if last_key.as_deref() == Some(key.as_slice()) {
            continue;
        }
        last_key = Some(key);
        out.push(row.clone());
    }
    Ok(out)
}

fn check_sorted(rows: &[Row], by: &[String]) -> bool {
    if by.is_empty() || rows.len() < 2 {
        return true;
    }
    let mut prev: Option<Vec<Literal>> = None;
    for row in rows {
        let key: Vec<Literal> = by.iter().map(|c| row.get(c).cloned().unwrap_or(Literal::Null)).collect();
        if let Some(p) = &prev {
            if compare_sort_keys(&key, p) == Ordering::Less {
                return false;
            }
        }
        prev = Some(key);
    }
    true
}

// ---------------------------------------------------------------------
// Column names, grounded on `_sanitize_column_name`.
// ---------------------------------------------------------------------

pub fn sanitize_column_name(value: &Literal) -> String {
    let text = match value {
        Literal::Null => String::new(),
        other => literal_to_csv_cell(other),
    };
    let text = text.trim();
    let mut sanitized = String::new();
    let mut last_was_sep = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            sanitized.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            sanitized.push('_');
            last_was_sep = true;
        }
    }
    let sanitized = sanitized.trim_matches('_').to_string();
    let mut sanitized = if sanitized.is_empty() { "COL".to_string() } else { sanitized };
    if sanitized.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
        sanitized = format!("COL_{sanitized}");
    }
    sanitized
}

// ---------------------------------------------------------------------
// Casting, grounded on §4.K's CAST contract (fail/null + trim).
// ---------------------------------------------------------------------

pub fn cast_value(value: &Literal, to: CastType, on_error: OnError, trim: bool, col: &str) -> Result<Literal, StorageError> {
    if matches!(value, Literal::Null) {
        return Ok(Literal::Null);
    }
    let text = match value {
        Literal::String(s) if trim => s.trim().to_string(),
        other => literal_to_csv_cell(other),
    };
    let converted = match to {
        CastType::Str => Some(Literal::String(text.clone())),
        CastType::Bool => match text.to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Literal::Bool(true)),
            "false" | "0" => Some(Literal::Bool(false)),
            _ => None,
        },
        CastType::Int => match value {
            Literal::Int(i) => Some(Literal::Int(*i)),
            Literal::Decimal(d) => d.to_string().parse::<i64>().ok().map(Literal::Int).or_else(|| {
                if d.fract().is_zero() {
                    d.trunc().to_string().parse::<i64>().ok().map(Literal::Int)
                } else {
                    None
                }
            }),
            _ => text.parse::<i64>().ok().map(Literal::Int),
        },
        CastType::Decimal => match value {
            Literal::Int(i) => Some(Literal::Decimal(Decimal::from(*i))),
            Literal::Decimal(d) => Some(Literal::Decimal(*d)),
            _ => text.parse::<Decimal>().ok().map(Literal::Decimal),
        },
        CastType::Date | CastType::Datetime => Some(Literal::String(text.clone())),
    };
    match converted {
        Some(v) => Ok(v),
        None => match on_error {
            OnError::Null => Ok(Literal::Null),
            OnError::Fail => Err(StorageError::CastFailed { col: col.to_string(), to: to_name(to).to_string(), value: text }),
        },
    }
}

fn to_name(to: CastType) -> &'static str {
    match to {
        CastType::Int => "int",
        CastType::Decimal => "decimal",
        CastType::Str => "str",
        CastType::Bool => "bool",
        CastType::Date => "date",
        CastType::Datetime => "datetime",
    }
}

// ---------------------------------------------------------------------
// Aggregate, grounded on `_execute_aggregate`.
// ---------------------------------------------------------------------

fn group_key(row: &Row, cols: &[String]) -> Vec<Literal> {
    cols.iter().map(|c| row.get(c).cloned().unwrap_or(Literal::Null)).collect()
}

fn metric_value(op: AggOp, values: &[Literal]) -> Result<Literal, StorageError> {
    let present: Vec<&Literal> = values.iter().filter(|v| !matches!(v, Literal::Null)).collect();
    match op {
        AggOp::Count => Ok(Literal::Int(values.len() as i64)),
        AggOp::N => Ok(Literal::Int(present.len() as i64)),
        AggOp::Sum | AggOp::Mean => {
            if present.is_empty() {
                return Ok(Literal::Null);
            }
            let mut total = Decimal::ZERO;
            let mut all_int = true;
            for v in &present {
                match v {
                    Literal::Int(i) => total += Decimal::from(*i),
                    Literal::Decimal(d) => {
                        all_int = false;
                        total += d;
                    }
                    other => return Err(StorageError::UnsupportedExprNode(format!("cannot aggregate non-numeric value {other:?}"))),
                }
            }
            if op == AggOp::Sum {
                Ok(if all_int { Literal::Int(total.trunc().to_string().parse().unwrap_or(0)) } else { Literal::Decimal(total) })
            } else {
                Ok(Literal::Decimal(total / Decimal::from(present.len() as u64)))
            }
        }
        AggOp::Min | AggOp::Max => {
            if present.is_empty() {
                return Ok(Literal::Null);
            }
            let mut best = present[0];
            for v in &present[1..] {
                let ord = eval::compare_sas(v, best);
                if (op == AggOp::Min && ord == Ordering::Less) || (op == AggOp::Max && ord == Ordering::Greater) {
                    best = v;
                }
            }
            Ok(best.clone())
        }
    }
}

pub fn execute_aggregate(rows: &[Row], group_by: &[String], metrics: &[Metric]) -> Result<Table, StorageError> {
    let mut groups: IndexMap<Vec<Literal>, Vec<&Row>> = IndexMap::new();
    for row in rows {
        groups.entry(group_key(row, group_by)).or_default().push(row);
    }
    let mut keys: Vec<&Vec<Literal>> = groups.keys().collect();
    keys.sort_by(|a, b| compare_sort_keys(a, b));

    let mut out = Vec::with_capacity(keys.len());
    for key in keys {
        let group_rows = &groups[key];
        let mut row = Row::new();
        for (col, value) in group_by.iter().zip(key.iter()) {
            row.insert(col.clone(), value.clone());
        }
        for metric in metrics {
            let values: Vec<Literal> = group_rows.iter().map(|r| r.get(&metric.col).cloned().unwrap_or(Literal::Null)).collect();
            row.insert(metric.name.clone(), metric_value(metric.op, &values)?);
        }
        out.push(row);
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// Transpose, grounded on `_execute_transpose`.
// ---------------------------------------------------------------------

pub fn execute_transpose(rows: &[Row], by: &[String], id_col: &str, var_cols: &[String]) -> Result<Table, StorageError> {
    if id_col.is_empty() || var_cols.is_empty() {
        return Err(StorageError::TransposeMissingArgs);
    }
    if !check_sorted(rows, by) {
        return Err(StorageError::OrderRequired { table: String::new(), by: by.to_vec() });
    }
    let var_col = &var_cols[0];

    let mut outputs: Vec<Row> = Vec::new();
    let mut id_col_values: IndexMap<String, Literal> = IndexMap::new();
    let mut id_cols_order: Vec<String> = Vec::new();
    let mut current_key: Option<Vec<Literal>> = None;
    let mut current_row: Option<Row> = None;

    for row in rows {
        let key = group_key(row, by);
        if current_key.as_ref() != Some(&key) {
            if let Some(r) = current_row.take() {
                outputs.push(r);
            }
            current_key = Some(key.clone());
            let mut base = Row::new();
            for (col, value) in by.iter().zip(key.iter()) {
                base.insert(col.clone(), value.clone());
            }
            current_row = Some(base);
        }
        let id_val = row.get(id_col).cloned().unwrap_or(Literal::Null);
        let is_blank = match &id_val {
            Literal::Null => true,
            Literal::String(s) => s.trim().is_empty(),
            _ => false,
        };
        if is_blank {
            return Err(StorageError::TransposeIdMissing(id_col.to_string()));
        }
        let col_name = sanitize_column_name(&id_val);
        if let Some(existing) = id_col_values.get(&col_name) {
            if *existing != id_val {
                return Err(StorageError::TransposeIdCollision { value: literal_to_csv_cell(&id_val), existing: literal_to_csv_cell(existing) });
            }
        } else {
            id_col_values.insert(col_name.clone(), id_val.clone());
            id_cols_order.push(col_name.clone());
        }
        let var_value = row.get(var_col).cloned().unwrap_or(Literal::Null);
        current_row.as_mut().unwrap().insert(col_name, var_value);
    }
    if let Some(r) = current_row.take() {
        outputs.push(r);
    }

    let columns: Vec<String> = by.iter().cloned().chain(id_cols_order).collect();
    Ok(outputs
        .into_iter()
        .map(|row| columns.iter().map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Literal::Null))).collect())
        .collect())
}

// ---------------------------------------------------------------------
// DATA step MERGE, grounded on `_execute_data_step`'s `mode == "merge"`
// branch. `retain`/explicit-`output`/`first.`/`last.` statements are not
// part of the closed grammar this front-end lowers, so the row built per BY
// key here is just the union of every participating table's columns.
// ---------------------------------------------------------------------

pub fn execute_data_step_merge(
    tables: &IndexMap<String, Table>,
    table_names: &[String],
    by: &[String],
) -> Result<Table, StorageError> {
    let mut input_rows: Vec<&Table> = Vec::with_capacity(table_names.len());
    for name in table_names {
        let rows = tables.get(name).ok_or_else(|| StorageError::TableUndefined { table: name.clone() })?;
        if !check_sorted(rows, by) {
            return Err(StorageError::OrderRequired { table: name.clone(), by: by.to_vec() });
        }
        input_rows.push(rows);
    }

    let mut grouped: Vec<IndexMap<Vec<Literal>, Vec<&Row>>> = Vec::with_capacity(input_rows.len());
    let mut all_keys: IndexMap<Vec<Literal>, ()> = IndexMap::new();
    for rows in &input_rows {
        let mut groups: IndexMap<Vec<Literal>, Vec<&Row>> = IndexMap::new();
        for row in rows.iter() {
            let key = group_key(row, by);
            groups.entry(key.clone()).or_default().push(row);
            all_keys.entry(key).or_insert(());
        }
        grouped.push(groups);
    }

    for key in all_keys.keys() {
        let multi: Vec<&String> = table_names
            .iter()
            .zip(&grouped)
            .filter(|(_, g)| g.get(key).map(|v| v.len()).unwrap_or(0) > 1)
            .map(|(name, _)| name)
            .collect();
        if multi.len() > 1 {
            let key_desc = by
                .iter()
                .zip(key.iter())
                .map(|(col, val)| format!("{col}={}", literal_to_csv_cell(val)))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StorageError::MergeManyMany {
                key_desc,
                left: multi[0].clone(),
                right: multi[1].clone(),
            });
        }
    }

    let all_columns: Vec<String> = {
        let mut seen = indexmap::IndexSet::new();
        for rows in &input_rows {
            for row in rows.iter() {
                for col in row.keys() {
                    seen.insert(col.clone());
                }
            }
        }
        seen.into_iter().collect()
    };

    let mut ordered_keys: Vec<&Vec<Literal>> = all_keys.keys().collect();
    ordered_keys.sort_by(|a, b| compare_sort_keys(a, b));

    let mut out = Vec::new();
    for key in ordered_keys {
        let max_count = grouped.iter().map(|g| g.get(key).map(|v| v.len()).unwrap_or(0)).max().unwrap_or(0).max(1);
        for idx in 0..max_count {
            let mut row = Row::new();
            for col in &all_columns {
                row.insert(col.clone(), Literal::Null);
            }
            for (col, val) in by.iter().zip(key.iter()) {
                row.insert(col.clone(), val.clone());
            }
            for group in &grouped {
                if let Some(rows) = group.get(key) {
                    let src = rows.get(idx).or_else(|| rows.last());
                    if let Some(src) = src {
                        for (k, v) in src.iter() {
                            row.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            out.push(row);
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// SQL select, grounded on `_execute_sql_select`. The closed IR carries no
// alias/join-type: joins are equi-inner, select is a plain projection list,
// group_by/metrics reuse the same Metric/AggOp machinery as `aggregate`.
// ---------------------------------------------------------------------

pub fn execute_sql_select(
    tables: &IndexMap<String, Table>,
    from: &str,
    joins: &[sans_core::ir::SqlJoin],
    select: &[String],
    group_by: &[String],
    metrics: &[Metric],
) -> Result<Table, StorageError> {
    let mut current: Table = tables
        .get(from)
        .ok_or_else(|| StorageError::TableUndefined { table: from.to_string() })?
        .clone();

    for join in joins {
        let right = tables
            .get(&join.table)
            .ok_or_else(|| StorageError::TableUndefined { table: join.table.clone() })?;

        let mut left_counts: IndexMap<String, usize> = IndexMap::new();
        for row in &current {
            if let Some(v) = row.get(&join.left_col) {
                *left_counts.entry(literal_to_csv_cell(v)).or_insert(0) += 1;
            }
        }
        let mut right_counts: IndexMap<String, usize> = IndexMap::new();
        for row in right {
            if let Some(v) = row.get(&join.right_col) {
                *right_counts.entry(literal_to_csv_cell(v)).or_insert(0) += 1;
            }
        }
        for (key, lc) in &left_counts {
            if *lc > 1 {
                if let Some(rc) = right_counts.get(key) {
                    if *rc > 1 {
                        return Err(StorageError::MergeManyMany {
                            key_desc: format!("{}={}", join.left_col, key),
                            left: from.to_string(),
                            right: join.table.clone(),
                        });
                    }
                }
            }
        }

        let mut joined = Vec::new();
        for left_row in &current {
            let left_key = left_row.get(&join.left_col);
            for right_row in right {
                let right_key = right_row.get(&join.right_col);
                if left_key == right_key && left_key.is_some() {
                    let mut combined = left_row.clone();
                    for (k, v) in right_row {
                        combined.insert(k.clone(), v.clone());
                    }
                    joined.push(combined);
                }
            }
        }
        current = joined;
    }

    if !group_by.is_empty() || !metrics.is_empty() {
        return execute_aggregate(&current, group_by, metrics);
    }

    Ok(current
        .into_iter()
        .map(|row| {
            select
                .iter()
                .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Literal::Null)))
                .collect::<Row>()
        })
        .collect())
}

// ---------------------------------------------------------------------
// Assertions, grounded on the `assert`-op executor inside `execute_plan`.
// ---------------------------------------------------------------------

pub fn execute_assert(
    predicate: &sans_core::expr::Expr,
    tables: &IndexMap<String, Table>,
    formats: &Formats,
) -> Result<bool, StorageError> {
    let ctx = EvalContext { tables: Some(tables), formats: Some(formats) };
    let result = eval::eval_expr_with(predicate, &Row::new(), &ctx)?;
    Ok(matches!(result, Literal::Bool(true)) || matches!(result, Literal::Int(i) if i != 0))
}

// ---------------------------------------------------------------------
// Orchestration, grounded on `execute_plan`.
// ---------------------------------------------------------------------

/// Runs every step of `ir` in `validated.order`, binding datasources from
/// `bindings` (table name -> source CSV path), and saves each `save` step's
/// table under `out_dir` with its path checked by
/// [`bundle::validate_save_path_under_outputs`]. XPT output is refused with
/// [`StorageError::Unsupported`] — encoding `.xpt` bytes is not implemented
/// in this build.
pub fn execute_plan(
    ir: &IrDoc,
    validated: &ValidatedIr,
    bindings: &IndexMap<String, std::path::PathBuf>,
    out_dir: &Path,
    output_format: &str,
) -> Result<ExecutionResult, StorageError> {
    let outputs_base = out_dir.join(bundle::OUTPUTS);
    std::fs::create_dir_all(&outputs_base).map_err(|e| StorageError::Io(e.to_string()))?;

    let mut tables: IndexMap<String, Table> = IndexMap::new();
    let mut formats: Formats = Formats::new();
    let mut saved = Vec::new();
    let mut evidence = Vec::new();

    for (name, path) in bindings {
        tables.insert(name.clone(), load_csv(path)?);
    }

    for &step_idx in &validated.order {
        let step = &ir.steps[step_idx];
        run_step(step, step_idx, &mut tables, &mut formats, &outputs_base, out_dir, &mut saved, &mut evidence)?;
    }

    if output_format.eq_ignore_ascii_case("xpt") {
        return Err(StorageError::Unsupported("XPT output format".to_string()));
    }

    Ok(ExecutionResult { outputs: saved, step_evidence: evidence })
}

#[allow(clippy::too_many_arguments)]
fn run_step(
    step: &Step,
    step_idx: usize,
    tables: &mut IndexMap<String, Table>,
    formats: &mut Formats,
    outputs_base: &Path,
    bundle_root: &Path,
    saved: &mut Vec<SavedOutput>,
    evidence: &mut Vec<StepEvidence>,
) -> Result<(), StorageError> {
    let transform_id = step.transform_id()?;
    let op_name = step.op().to_string();

    let mut assert_result = None;
    let mut row_counts = IndexMap::new();

    match &step.params {
        OpParams::Datasource(_) => {
            // Binding already loaded the table; nothing to compute.
        }
        OpParams::Identity(_) => {
            let input = first_input(step, tables)?;
            let rows = tables[input].clone();
            bind_output(step, tables, &mut row_counts, rows);
        }
        OpParams::Filter(p) => {
            let input = first_input(step, tables)?.to_string();
            let ctx = EvalContext { tables: None, formats: Some(formats) };
            let mut out = Vec::new();
            for row in &tables[&input] {
                let keep = eval::eval_expr_with(&p.predicate, row, &ctx)?;
                if matches!(keep, Literal::Bool(true)) {
                    out.push(row.clone());
                }
            }
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Compute(p) => {
            let input = first_input(step, tables)?.to_string();
            let ctx = EvalContext { tables: None, formats: Some(formats) };
            let mut out = Vec::with_capacity(tables[&input].len());
            for row in &tables[&input] {
                let mut new_row = row.clone();
                for assign in &p.assignments {
                    let value = eval::eval_expr_with(&assign.expr, &new_row, &ctx)?;
                    new_row.insert(assign.target.clone(), value);
                }
                out.push(new_row);
            }
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Select(p) => {
            let input = first_input(step, tables)?.to_string();
            let out = match p {
                sans_core::ir::SelectParams::Cols { cols } => tables[&input]
                    .iter()
                    .map(|row| cols.iter().map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Literal::Null))).collect())
                    .collect(),
                sans_core::ir::SelectParams::Drop { drop } => tables[&input]
                    .iter()
                    .map(|row| row.iter().filter(|(k, _)| !drop.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
                    .collect(),
            };
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Drop(p) => {
            let input = first_input(step, tables)?.to_string();
            let out = tables[&input]
                .iter()
                .map(|row| row.iter().filter(|(k, _)| !p.cols.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
                .collect();
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Rename(p) => {
            let input = first_input(step, tables)?.to_string();
            let mut out = Vec::new();
            for row in &tables[&input] {
                let mut new_row = Row::new();
                for (k, v) in row {
                    let new_key = p.mapping.iter().find(|e| &e.from == k).map(|e| e.to.clone()).unwrap_or_else(|| k.clone());
                    new_row.insert(new_key, v.clone());
                }
                out.push(new_row);
            }
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Sort(p) => {
            let input = first_input(step, tables)?.to_string();
            let out = sort_rows(&tables[&input], &p.by, p.nodupkey.unwrap_or(false))?;
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Cast(p) => {
            let input = first_input(step, tables)?.to_string();
            let mut out = Vec::with_capacity(tables[&input].len());
            for row in &tables[&input] {
                let mut new_row = row.clone();
                for entry in &p.casts {
                    let current = new_row.get(&entry.col).cloned().unwrap_or(Literal::Null);
                    let casted = cast_value(&current, entry.to, entry.on_error, entry.trim, &entry.col)?;
                    new_row.insert(entry.col.clone(), casted);
                }
                out.push(new_row);
            }
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Aggregate(p) => {
            let input = first_input(step, tables)?.to_string();
            let out = execute_aggregate(&tables[&input], &p.group_by, &p.metrics)?;
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Transpose(p) => {
            let input = first_input(step, tables)?.to_string();
            let out = execute_transpose(&tables[&input], &p.by, &p.id_col, &p.var_cols)
                .map_err(|e| retarget_order_required(e, &input))?;
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::SqlSelect(p) => {
            let out = execute_sql_select(tables, &p.from, &p.joins, &p.select, &p.group_by, &p.metrics)?;
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::DataStep(p) => {
            let out = match p.mode {
                sans_core::ir::DataStepMode::Merge => execute_data_step_merge(tables, &step.inputs, &p.by)?,
            };
            bind_output(step, tables, &mut row_counts, out);
        }
        OpParams::Format(p) => {
            let key = p.name.trim_start_matches('$').to_ascii_lowercase();
            let key = if p.name.starts_with('$') { format!("${key}") } else { key };
            formats.insert(key, p.clone());
            // No table of rows to produce; the output name is a placeholder
            // catalog table, bound empty so the closed op-output-arity
            // contract holds for `format` like every other table-producing
            // op.
            bind_output(step, tables, &mut row_counts, Vec::new());
        }
        OpParams::Save(p) => {
            let input = first_input(step, tables)?.to_string();
            let resolved = bundle::validate_save_path_under_outputs(&p.path, outputs_base, bundle_root)?;
            if let Some(parent) = resolved.parent() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
            }
            let rows = &tables[&input];
            write_csv(&resolved, rows)?;
            let columns: Vec<String> = rows.first().map(|r| r.keys().cloned().collect()).unwrap_or_default();
            row_counts.insert(input.clone(), rows.len());
            saved.push(SavedOutput { table: p.name.clone().unwrap_or_else(|| input.clone()), path: resolved, rows: rows.len(), columns });
        }
        OpParams::Assert(p) => {
            let result = execute_assert(&p.predicate, tables, formats)?;
            assert_result = Some(result);
            if !result {
                let severity = p.severity.as_deref().unwrap_or("error");
                if severity != "warn" {
                    return Err(StorageError::AssertionFailed { message: format!("assertion '{}' failed", step.id) });
                }
            }
        }
        OpParams::LetScalar(_) | OpParams::Const(_) => {
            // Compile-time-only bindings; no-op at runtime.
        }
    }

    evidence.push(StepEvidence {
        step_index: step_idx,
        step_id: step.id.clone(),
        transform_id,
        op: op_name,
        inputs: step.inputs.clone(),
        outputs: step.outputs.clone(),
        row_counts,
        assert_result,
    });
    Ok(())
}

fn retarget_order_required(err: StorageError, table: &str) -> StorageError {
    match err {
        StorageError::OrderRequired { by, .. } => StorageError::OrderRequired { table: table.to_string(), by },
        other => other,
    }
}

/// Binds a step's computed rows to its declared output table, recording the
/// row count alongside for the step's evidence entry.
fn bind_output(step: &Step, tables: &mut IndexMap<String, Table>, row_counts: &mut IndexMap<String, usize>, rows: Table) {
    if let Some(name) = step.outputs.first() {
        row_counts.insert(name.clone(), rows.len());
        tables.insert(name.clone(), rows);
    }
}

fn first_input<'a>(step: &'a Step, tables: &IndexMap<String, Table>) -> Result<&'a str, StorageError> {
    let name = step
        .inputs
        .first()
        .ok_or_else(|| StorageError::TableUndefined { table: step.id.clone() })?;
    if !tables.contains_key(name) {
        return Err(StorageError::TableUndefined { table: name.clone() });
    }
    Ok(name.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_csv_value_preserves_leading_zero() {
        assert_eq!(parse_csv_value("007"), Literal::String("007".to_string()));
    }

    #[test]
    fn parse_csv_value_reads_plain_int() {
        assert_eq!(parse_csv_value("42"), Literal::Int(42));
    }

    #[test]
    fn parse_csv_value_reads_decimal() {
        assert_eq!(parse_csv_value("3.5"), Literal::Decimal(Decimal::new(35, 1)));
    }

    #[test]
    fn parse_csv_value_empty_is_null() {
        assert_eq!(parse_csv_value(""), Literal::Null);
    }

    #[test]
    fn sanitize_strips_non_alnum_and_collapses() {
        assert_eq!(sanitize_column_name(&Literal::String("Visit 1 (wk)".to_string())), "Visit_1_wk");
    }

    #[test]
    fn sanitize_prefixes_leading_digit() {
        assert_eq!(sanitize_column_name(&Literal::String("1mg".to_string())), "COL_1mg");
    }

    #[test]
    fn sort_rejects_descending() {
        let rows = vec![];
        let by = vec![SortKey { col: "a".to_string(), desc: true }];
        assert!(sort_rows(&rows, &by, false).is_err());
    }

    #[test]
    fn aggregate_ignores_nulls_in_mean() {
        let mut r1 = Row::new();
        r1.insert("g".to_string(), Literal::Int(1));
        r1.insert("v".to_string(), Literal::Int(10));
        let mut r2 = Row::new();
        r2.insert("g".to_string(), Literal::Int(1));
        r2.insert("v".to_string(), Literal::Null);
        let metrics = vec![Metric { name: "avg_v".to_string(), op: AggOp::Mean, col: "v".to_string() }];
        let out = execute_aggregate(&[r1, r2], &["g".to_string()], &metrics).unwrap();
        assert_eq!(out[0].get("avg_v"), Some(&Literal::Decimal(Decimal::from(10))));
    }
}
