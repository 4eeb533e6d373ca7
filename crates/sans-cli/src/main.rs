//! The `sans` binary: subcommand dispatch, process exit-code mapping, and
//! environment/path resolution, in the shape `lmlang-cli::main` uses —
//! each subcommand maps to a `run_<subcommand>(args) -> i32` function that
//! turns the terminal `Result`'s error into an exit-code bucket and prints
//! either a report summary or a single "failed: ..." diagnostic line.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use indexmap::IndexMap;
use sans_check::schema::{propagate_schemas, Schemas};
use sans_check::schema_lock::{build_schema_lock, canonical_lock_json, write_schema_lock, SchemaLock};
use sans_check::typecheck::SchemaEnv;
use sans_check::CheckError;
use sans_core::diagnostic::{Diagnostic, ExitBucket};
use sans_core::ir::{ds_input, DatasourceKind, IrDoc};
use sans_core::validate::{validate_structural, ValidateOptions, ValidatedIr};
use sans_storage::bundle::{self, BundleMode, DatasourceInput, FileEntry, Report};
use sans_storage::{hash, runtime, verify};

#[derive(Parser)]
#[command(name = "sans", about = "Deterministic SANS compiler and execution engine")]
struct Cli {
    /// Install a tracing-subscriber fmt layer gated by RUST_LOG. Never
    /// changes behavior, only diagnostic verbosity.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse, lower, validate, and type-check a script without executing it.
    Check(CompileArgs),
    /// Compile and execute a script, producing a full bundle with outputs.
    Run(RunArgs),
    /// Execute a canonical `sans.ir` document directly.
    RunIr(RunIrArgs),
    /// Lower a script to the canonical `sans.ir` JSON shape and print it.
    EmitIr(CompileArgs),
    /// Validate a canonical `sans.ir` document structurally and by type.
    IrValidate(IrValidateArgs),
    /// Build and print (or write) a `schema.lock.json` for a script.
    SchemaLock(CompileArgs),
    /// Validate a script structurally, without running the type checker.
    Validate(CompileArgs),
    /// Recompute and check every hash inside an existing bundle.
    Verify(VerifyArgs),
    /// Print a script back in its canonical form.
    Fmt(FmtArgs),
}

#[derive(clap::Args)]
struct CompileArgs {
    /// Path to the `.sans` or legacy SAS script.
    script: PathBuf,
    /// Parse `script` with the legacy SAS-dialect front-end instead of `.sans`.
    #[arg(long)]
    legacy_sas: bool,
    /// Where to write generated artifacts (schema-lock output, emitted IR).
    #[arg(long)]
    out: Option<PathBuf>,
    /// Promote dangling-table and ingress-typing warnings to fatal errors.
    #[arg(long)]
    strict: bool,
    #[arg(long = "no-strict", conflicts_with = "strict")]
    no_strict: bool,
    /// Schema lock to load (relative paths resolve against the script's directory).
    #[arg(long = "schema-lock")]
    schema_lock: Option<PathBuf>,
    /// Where to write a freshly built schema lock after a successful check.
    #[arg(long = "emit-schema-lock")]
    emit_schema_lock: Option<PathBuf>,
    /// Stop after producing the schema lock; skip type-checking.
    #[arg(long)]
    lock_only: bool,
}

#[derive(clap::Args)]
struct RunArgs {
    script: PathBuf,
    #[arg(long)]
    legacy_sas: bool,
    /// Bundle output directory (required: `run` always produces a bundle).
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    strict: bool,
    #[arg(long = "no-strict", conflicts_with = "strict")]
    no_strict: bool,
    #[arg(long = "schema-lock")]
    schema_lock: Option<PathBuf>,
    #[arg(long = "emit-schema-lock")]
    emit_schema_lock: Option<PathBuf>,
    /// `name=path,name2=path2` datasource bindings.
    #[arg(long)]
    tables: Option<String>,
    /// Directory to scan non-recursively for `*.csv` datasource bindings.
    #[arg(long = "inputs-dir")]
    inputs_dir: Option<PathBuf>,
    #[arg(long = "bundle-mode", default_value = "full")]
    bundle_mode: String,
    #[arg(long, default_value = "csv")]
    format: String,
}

#[derive(clap::Args)]
struct RunIrArgs {
    /// Path to a canonical `sans.ir` JSON document.
    ir: PathBuf,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    strict: bool,
    #[arg(long = "no-strict", conflicts_with = "strict")]
    no_strict: bool,
    #[arg(long = "schema-lock")]
    schema_lock: Option<PathBuf>,
    #[arg(long)]
    tables: Option<String>,
    #[arg(long = "inputs-dir")]
    inputs_dir: Option<PathBuf>,
    #[arg(long = "bundle-mode", default_value = "full")]
    bundle_mode: String,
    #[arg(long, default_value = "csv")]
    format: String,
}

#[derive(clap::Args)]
struct IrValidateArgs {
    ir: PathBuf,
    #[arg(long)]
    strict: bool,
    #[arg(long = "no-strict", conflicts_with = "strict")]
    no_strict: bool,
    #[arg(long = "schema-lock")]
    schema_lock: Option<PathBuf>,
}

#[derive(clap::Args)]
struct VerifyArgs {
    /// Path to a bundle directory written by `run`/`run-ir`.
    bundle: PathBuf,
    #[arg(long)]
    tables: Option<String>,
    #[arg(long = "inputs-dir")]
    inputs_dir: Option<PathBuf>,
    #[arg(long = "schema-lock")]
    schema_lock: Option<PathBuf>,
}

#[derive(clap::Args)]
struct FmtArgs {
    script: PathBuf,
    #[arg(long)]
    legacy_sas: bool,
    /// Rewrite `script` in place instead of printing to stdout.
    #[arg(long)]
    write: bool,
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Commands::Check(args) => run_check(args),
        Commands::Run(args) => run_run(args),
        Commands::RunIr(args) => run_run_ir(args),
        Commands::EmitIr(args) => run_emit_ir(args),
        Commands::IrValidate(args) => run_ir_validate(args),
        Commands::SchemaLock(args) => run_schema_lock(args),
        Commands::Validate(args) => run_validate(args),
        Commands::Verify(args) => run_verify(args),
        Commands::Fmt(args) => run_fmt(args),
    };
    process::exit(code);
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn report_failure(d: &Diagnostic) -> i32 {
    eprintln!("failed: {} ({})", d.message, d.code);
    d.exit_bucket().code()
}

fn strict_of(strict: bool, no_strict: bool) -> bool {
    strict && !no_strict
}

// ---------------------------------------------------------------------
// Shared compile/validate/typecheck pipeline.
// ---------------------------------------------------------------------

struct Pipeline {
    ir: IrDoc,
    validated: ValidatedIr,
    lock_used: Option<SchemaLock>,
    lock_used_path: Option<PathBuf>,
    warnings: Vec<Diagnostic>,
    schemas: Option<Schemas>,
}

fn compile_script(script: &Path, legacy_sas: bool) -> Result<(IrDoc, Vec<Diagnostic>), Diagnostic> {
    let source = std::fs::read_to_string(script)
        .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to read '{}': {e}", script.display())))?;
    let file = script.to_string_lossy().to_string();
    if legacy_sas {
        sans_frontend::lower_sas_source(&source, &file).map_err(|e| e.to_diagnostic())
    } else {
        sans_frontend::compile_sans_source(&source, &file).map_err(|e| e.to_diagnostic())
    }
}

fn resolve_against_dir(base: &Path, maybe_path: &Path) -> PathBuf {
    if maybe_path.is_absolute() {
        maybe_path.to_path_buf()
    } else {
        base.join(maybe_path)
    }
}

/// `--schema-lock` and lock auto-discovery both resolve against the
/// script's directory, never the process CWD (§6.3).
fn discover_schema_lock(script: &Path) -> Option<PathBuf> {
    let dir = script.parent().unwrap_or_else(|| Path::new("."));
    let stem = script.file_stem()?.to_string_lossy().to_string();
    for candidate in [dir.join(format!("{stem}.schema.lock.json")), dir.join("schema.lock.json")] {
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn load_lock_for_script(script: &Path, arg: Option<&Path>) -> Result<(Option<SchemaLock>, Option<PathBuf>), Diagnostic> {
    let dir = script.parent().unwrap_or_else(|| Path::new("."));
    let path = match arg {
        Some(p) => Some(resolve_against_dir(dir, p)),
        None => discover_schema_lock(script),
    };
    match &path {
        Some(p) => {
            let lock = sans_check::load_schema_lock(p).map_err(|e| e.to_diagnostic())?;
            Ok((Some(lock), Some(p.clone())))
        }
        None => Ok((None, None)),
    }
}

/// Builds the per-datasource type environment `propagate_schemas` needs:
/// concrete types already on the declaration win, a loaded schema lock
/// fills in the rest, everything else is left `UNKNOWN`.
fn datasource_schema_envs(ir: &IrDoc, lock: Option<&SchemaLock>) -> IndexMap<String, SchemaEnv> {
    let lock_by_name = lock.map(|l| l.by_name()).unwrap_or_default();
    let mut out = IndexMap::new();
    for (name, decl) in &ir.datasources {
        let env = if let Some(types) = &decl.column_types {
            let mut env = SchemaEnv::new();
            for (col, ty) in types {
                env.insert(col.clone(), *ty);
            }
            env
        } else if let Some(entry) = lock_by_name.get(name.as_str()) {
            SchemaLock::to_column_types(entry)
        } else {
            SchemaEnv::new()
        };
        out.insert(name.clone(), env);
    }
    out
}

/// §3.6 invariant 6: in strict mode, every referenced datasource must end
/// up with a fully concrete column-type map after schema-lock application.
fn check_no_unknown_at_ingress(ir: &IrDoc, envs: &IndexMap<String, SchemaEnv>) -> Result<(), Diagnostic> {
    for name in ir.datasources.keys() {
        let env = envs.get(name);
        let concrete = env.map(|e| !e.is_empty() && e.values().all(|t| !t.is_unknown())).unwrap_or(false);
        if !concrete {
            let err = CheckError::SchemaRequired {
                name: name.clone(),
                searched: "datasource column_types, --schema-lock".to_string(),
            };
            return Err(err.to_diagnostic());
        }
    }
    Ok(())
}

fn run_pipeline(
    script: &Path,
    legacy_sas: bool,
    strict: bool,
    schema_lock_arg: Option<&Path>,
    typecheck: bool,
) -> Result<Pipeline, Diagnostic> {
    let (ir, mut warnings) = compile_script(script, legacy_sas)?;
    let validated = validate_structural(&ir, ValidateOptions { strict }).map_err(|e| e.to_diagnostic())?;
    warnings.extend(validated.warnings.clone());

    let (lock_used, lock_used_path) = load_lock_for_script(script, schema_lock_arg)?;

    let mut schemas = None;
    if typecheck {
        let envs = datasource_schema_envs(&ir, lock_used.as_ref());
        if strict {
            check_no_unknown_at_ingress(&ir, &envs)?;
        }
        schemas = Some(propagate_schemas(&ir, &validated, &envs).map_err(|e| e.to_diagnostic())?);
    }

    Ok(Pipeline { ir, validated, lock_used, lock_used_path, warnings, schemas })
}

fn print_json(value: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string()));
}

fn warnings_exit_code(warnings: &[Diagnostic]) -> i32 {
    if warnings.is_empty() {
        ExitBucket::Ok.code()
    } else {
        ExitBucket::OkWithWarnings.code()
    }
}

// ---------------------------------------------------------------------
// check / validate / emit-ir / schema-lock
// ---------------------------------------------------------------------

fn run_check(args: CompileArgs) -> i32 {
    let strict = strict_of(args.strict, args.no_strict);
    let pipeline = match run_pipeline(&args.script, args.legacy_sas, strict, args.schema_lock.as_deref(), !args.lock_only) {
        Ok(p) => p,
        Err(d) => return report_failure(&d),
    };

    if let Some(emit_path) = &args.emit_schema_lock {
        if let Err(d) = emit_schema_lock(&pipeline, emit_path) {
            return report_failure(&d);
        }
    }

    print_json(&serde_json::json!({
        "status": "ok",
        "steps": pipeline.ir.steps.len(),
        "datasources": pipeline.ir.datasources.len(),
        "schema_lock_used": pipeline.lock_used_path.as_ref().map(|p| p.display().to_string()),
        "warnings": pipeline.warnings,
    }));
    warnings_exit_code(&pipeline.warnings)
}

fn run_validate(args: CompileArgs) -> i32 {
    let strict = strict_of(args.strict, args.no_strict);
    let pipeline = match run_pipeline(&args.script, args.legacy_sas, strict, args.schema_lock.as_deref(), false) {
        Ok(p) => p,
        Err(d) => return report_failure(&d),
    };
    print_json(&serde_json::json!({
        "status": "ok",
        "steps": pipeline.ir.steps.len(),
        "warnings": pipeline.warnings,
    }));
    warnings_exit_code(&pipeline.warnings)
}

fn run_emit_ir(args: CompileArgs) -> i32 {
    let strict = strict_of(args.strict, args.no_strict);
    let pipeline = match run_pipeline(&args.script, args.legacy_sas, strict, args.schema_lock.as_deref(), !args.lock_only) {
        Ok(p) => p,
        Err(d) => return report_failure(&d),
    };
    let value = pipeline.ir.to_canonical_value();
    let text = serde_json::to_string_pretty(&value).unwrap_or_default();
    match &args.out {
        Some(path) => match std::fs::write(path, &text) {
            Ok(()) => {
                println!("wrote {}", path.display());
                warnings_exit_code(&pipeline.warnings)
            }
            Err(e) => report_failure(&Diagnostic::new("SANS_IO_ERROR", format!("failed to write '{}': {e}", path.display()))),
        },
        None => {
            println!("{text}");
            warnings_exit_code(&pipeline.warnings)
        }
    }
}

fn emit_schema_lock(pipeline: &Pipeline, out_path: &Path) -> Result<(), Diagnostic> {
    let referenced: BTreeSet<String> = pipeline.ir.datasources.keys().cloned().collect();
    let lock = build_schema_lock(&pipeline.ir, &referenced, pipeline.lock_used.as_ref(), sans_core::ENGINE_VERSION);
    write_schema_lock(&lock, out_path).map_err(|e| e.to_diagnostic())
}

fn run_schema_lock(args: CompileArgs) -> i32 {
    let strict = strict_of(args.strict, args.no_strict);
    let pipeline = match run_pipeline(&args.script, args.legacy_sas, strict, args.schema_lock.as_deref(), false) {
        Ok(p) => p,
        Err(d) => return report_failure(&d),
    };
    let referenced: BTreeSet<String> = pipeline.ir.datasources.keys().cloned().collect();
    let lock = build_schema_lock(&pipeline.ir, &referenced, pipeline.lock_used.as_ref(), sans_core::ENGINE_VERSION);

    match args.emit_schema_lock.as_ref().or(args.out.as_ref()) {
        Some(path) => match write_schema_lock(&lock, path) {
            Ok(()) => {
                println!("wrote {}", path.display());
                0
            }
            Err(e) => report_failure(&e.to_diagnostic()),
        },
        None => match canonical_lock_json(&lock) {
            Ok(json) => {
                println!("{json}");
                0
            }
            Err(e) => report_failure(&e.to_diagnostic()),
        },
    }
}

// ---------------------------------------------------------------------
// ir-validate
// ---------------------------------------------------------------------

fn load_ir_file(path: &Path) -> Result<IrDoc, Diagnostic> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to read '{}': {e}", path.display())))?;
    let value: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| Diagnostic::new("SANS_PARSE_IR_JSON", format!("'{}' is not valid JSON: {e}", path.display())))?;
    IrDoc::from_canonical_value(&value).map_err(|e| e.to_diagnostic())
}

fn run_ir_validate(args: IrValidateArgs) -> i32 {
    let strict = strict_of(args.strict, args.no_strict);
    let ir = match load_ir_file(&args.ir) {
        Ok(ir) => ir,
        Err(d) => return report_failure(&d),
    };
    let validated = match validate_structural(&ir, ValidateOptions { strict }) {
        Ok(v) => v,
        Err(e) => return report_failure(&e.to_diagnostic()),
    };
    let lock = match &args.schema_lock {
        Some(p) => match sans_check::load_schema_lock(p) {
            Ok(l) => Some(l),
            Err(e) => return report_failure(&e.to_diagnostic()),
        },
        None => None,
    };
    let envs = datasource_schema_envs(&ir, lock.as_ref());
    if strict {
        if let Err(d) = check_no_unknown_at_ingress(&ir, &envs) {
            return report_failure(&d);
        }
    }
    if let Err(e) = propagate_schemas(&ir, &validated, &envs) {
        return report_failure(&e.to_diagnostic());
    }
    print_json(&serde_json::json!({
        "status": "ok",
        "steps": ir.steps.len(),
        "warnings": validated.warnings,
    }));
    warnings_exit_code(&validated.warnings)
}

// ---------------------------------------------------------------------
// run / run-ir: execute and bundle.
// ---------------------------------------------------------------------

/// Parses `--tables name=path,...`, scans `--inputs-dir` non-recursively
/// for `*.csv` (rejecting symlinks and case-colliding stems), and finally
/// falls back to the datasource's own declared `path`.
fn resolve_datasource_bindings(
    ir: &IrDoc,
    tables_arg: Option<&str>,
    inputs_dir: Option<&Path>,
    base_dir: &Path,
) -> Result<IndexMap<String, PathBuf>, Diagnostic> {
    let mut bindings: IndexMap<String, PathBuf> = IndexMap::new();

    if let Some(dir) = inputs_dir {
        let dir = resolve_against_dir(base_dir, dir);
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to scan --inputs-dir '{}': {e}", dir.display())))?;
        let mut seen_lower: BTreeMap<String, String> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(|e| Diagnostic::new("SANS_IO_ERROR", e.to_string()))?;
            let path = entry.path();
            let meta = entry
                .metadata()
                .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to stat '{}': {e}", path.display())))?;
            if meta.file_type().is_symlink() {
                return Err(Diagnostic::new(
                    "SANS_IO_ERROR",
                    format!("--inputs-dir must not contain symlinks: '{}'", path.display()),
                ));
            }
            if !meta.is_file() {
                continue;
            }
            let is_csv = path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("csv")).unwrap_or(false);
            if !is_csv {
                continue;
            }
            let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
            let lower = stem.to_ascii_lowercase();
            if let Some(existing) = seen_lower.insert(lower, stem.clone()) {
                if existing != stem {
                    return Err(Diagnostic::new(
                        "SANS_IO_ERROR",
                        format!("--inputs-dir has case-colliding datasource names: '{existing}' and '{stem}'"),
                    ));
                }
            }
            bindings.insert(stem, path);
        }
    }

    if let Some(spec) = tables_arg {
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (name, path) = entry
                .split_once('=')
                .ok_or_else(|| Diagnostic::new("SANS_IO_ERROR", format!("invalid --tables entry '{entry}', expected name=path")))?;
            bindings.insert(name.trim().to_string(), resolve_against_dir(base_dir, Path::new(path.trim())));
        }
    }

    for (name, decl) in &ir.datasources {
        if bindings.contains_key(name) {
            continue;
        }
        if matches!(decl.kind, DatasourceKind::Csv) {
            if let Some(path) = &decl.path {
                let candidate = resolve_against_dir(base_dir, Path::new(path));
                if candidate.is_file() {
                    bindings.insert(name.clone(), candidate);
                }
            }
        }
    }

    Ok(bindings)
}

fn parse_bundle_mode(s: &str) -> Result<BundleMode, Diagnostic> {
    match s {
        "full" => Ok(BundleMode::Full),
        "thin" => Ok(BundleMode::Thin),
        other => Err(Diagnostic::new("SANS_IO_ERROR", format!("invalid --bundle-mode '{other}', expected full or thin"))),
    }
}

/// `artifacts/schema.evidence.json`: the per-table column-type map
/// `propagate_schemas` inferred, exactly as `compiler.py` writes it — every
/// table and column name sorted so the artifact (not just its hash) is
/// byte-stable, not only the report's `schema_evidence_*` fields.
fn schema_evidence_payload(schemas: Option<&Schemas>) -> serde_json::Value {
    let tables: BTreeMap<String, BTreeMap<String, &'static str>> = match schemas {
        Some(s) => s
            .tables
            .iter()
            .map(|(name, env)| (name.clone(), env.iter().map(|(col, ty)| (col.clone(), ty.name())).collect()))
            .collect(),
        None => BTreeMap::new(),
    };
    serde_json::json!({"schema_version": "0.1", "tables": tables})
}

fn write_artifact(out_dir: &Path, rel_path: &str, text: &str) -> Result<FileEntry, Diagnostic> {
    let full = out_dir.join(rel_path);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Diagnostic::new("SANS_IO_ERROR", e.to_string()))?;
    }
    std::fs::write(&full, text).map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to write '{rel_path}': {e}")))?;
    let sha256 = hash::compute_artifact_hash(&full).map_err(|e| e.to_diagnostic())?;
    Ok(FileEntry { path: rel_path.to_string(), name: None, sha256 })
}

/// Materializes every datasource (CSV by copy/reference, inline CSV by
/// writing its literal text) under `inputs/data/`, binding each to the
/// `__datasource__`-prefixed key `execute_plan` expects, and records the
/// `datasource_inputs[]` report entries for the chosen bundle mode.
fn materialize_datasources(
    ir: &IrDoc,
    bindings_by_name: &IndexMap<String, PathBuf>,
    out_dir: &Path,
    bundle_mode: BundleMode,
) -> Result<(IndexMap<String, PathBuf>, Vec<DatasourceInput>), Diagnostic> {
    let data_dir = out_dir.join(bundle::INPUTS_DATA);
    let mut ds_bindings = IndexMap::new();
    let mut datasource_inputs = Vec::new();

    for (name, decl) in &ir.datasources {
        match decl.kind {
            DatasourceKind::Csv => {
                let source_path = bindings_by_name.get(name).cloned().ok_or_else(|| {
                    Diagnostic::new(
                        "SANS_RUNTIME_TABLE_UNDEFINED",
                        format!("no binding for datasource '{name}'; use --tables or --inputs-dir"),
                    )
                })?;
                let size = std::fs::metadata(&source_path)
                    .map(|m| m.len())
                    .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to stat '{}': {e}", source_path.display())))?;
                let sha256 = hash::compute_input_hash(&source_path).map_err(|e| e.to_diagnostic())?;

                let embedded_rel = if matches!(bundle_mode, BundleMode::Full) {
                    let dest = data_dir.join(format!("{name}.csv"));
                    std::fs::copy(&source_path, &dest)
                        .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to embed datasource '{name}': {e}")))?;
                    Some(bundle::bundle_relative_path(&dest, out_dir).map_err(|e| e.to_diagnostic())?)
                } else {
                    None
                };

                datasource_inputs.push(DatasourceInput {
                    datasource: name.clone(),
                    path: embedded_rel,
                    sha256,
                    size_bytes: size,
                    embedded: matches!(bundle_mode, BundleMode::Full),
                });
                ds_bindings.insert(ds_input(name), source_path);
            }
            DatasourceKind::InlineCsv => {
                let text = decl.inline_text.clone().unwrap_or_default();
                let dest = data_dir.join(format!("{name}.csv"));
                std::fs::write(&dest, &text)
                    .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to materialize inline datasource '{name}': {e}")))?;
                let sha256 = hash::compute_input_hash(&dest).map_err(|e| e.to_diagnostic())?;
                datasource_inputs.push(DatasourceInput {
                    datasource: name.clone(),
                    path: Some(bundle::bundle_relative_path(&dest, out_dir).map_err(|e| e.to_diagnostic())?),
                    sha256,
                    size_bytes: text.len() as u64,
                    embedded: true,
                });
                ds_bindings.insert(ds_input(name), dest);
            }
        }
    }

    Ok((ds_bindings, datasource_inputs))
}

#[allow(clippy::too_many_arguments)]
fn execute_and_bundle(
    ir: &IrDoc,
    validated: &ValidatedIr,
    bindings_by_name: &IndexMap<String, PathBuf>,
    out_dir: &Path,
    bundle_mode: BundleMode,
    format: &str,
    plan_path: &str,
    inputs: Vec<FileEntry>,
    lock_used_path: Option<&Path>,
    lock_sha256: Option<String>,
    warnings: &[Diagnostic],
    schemas: Option<&Schemas>,
) -> Result<Report, Diagnostic> {
    bundle::ensure_bundle_layout(out_dir).map_err(|e| e.to_diagnostic())?;

    let (ds_bindings, datasource_inputs) = materialize_datasources(ir, bindings_by_name, out_dir, bundle_mode)?;

    let plan_value = ir.to_canonical_value();
    let plan_entry = write_artifact(out_dir, "artifacts/plan.ir.json", &serde_json::to_string_pretty(&plan_value).unwrap())?;

    let schema_payload = schema_evidence_payload(schemas);
    let schema_entry = write_artifact(
        out_dir,
        "artifacts/schema.evidence.json",
        &serde_json::to_string_pretty(&schema_payload).unwrap(),
    )?;

    let exec = runtime::execute_plan(ir, validated, &ds_bindings, out_dir, format).map_err(|e| e.to_diagnostic())?;

    let evidence_entry = write_artifact(
        out_dir,
        "artifacts/runtime.evidence.json",
        &serde_json::to_string_pretty(&exec.step_evidence).unwrap(),
    )?;

    let mut outputs = Vec::new();
    for saved in &exec.outputs {
        let rel = bundle::bundle_relative_path(&saved.path, out_dir).map_err(|e| e.to_diagnostic())?;
        let sha256 = hash::compute_artifact_hash(&saved.path).map_err(|e| e.to_diagnostic())?;
        outputs.push(FileEntry { path: rel, name: Some(saved.table.clone()), sha256 });
    }

    let status = if warnings.is_empty() { "ok" } else { "ok_with_warnings" };
    let exit_code_bucket = warnings_exit_code(warnings);

    let report = Report {
        report_schema_version: "0.3".to_string(),
        status: status.to_string(),
        exit_code_bucket,
        primary_error: None,
        diagnostics: warnings.iter().map(|d| serde_json::to_value(d).unwrap()).collect(),
        inputs,
        artifacts: vec![plan_entry, schema_entry, evidence_entry],
        outputs,
        datasource_inputs,
        plan_path: plan_path.to_string(),
        engine: serde_json::json!({"version": sans_core::ENGINE_VERSION, "ir_version": sans_core::IR_VERSION}),
        settings: serde_json::json!({"format": format, "bundle_mode": format!("{bundle_mode:?}").to_lowercase()}),
        timing: serde_json::json!({}),
        bundle_mode: Some(bundle_mode),
        schema_lock_sha256: lock_sha256,
        schema_lock_used_path: lock_used_path.map(|p| p.display().to_string()),
        schema_lock_emit_path: None,
        report_sha256: None,
    };
    let report = bundle::finalize_report(report).map_err(|e| e.to_diagnostic())?;
    bundle::write_report(&report, out_dir).map_err(|e| e.to_diagnostic())?;
    Ok(report)
}

fn print_report_summary(report: &Report) {
    print_json(&serde_json::json!({
        "status": report.status,
        "exit_code_bucket": report.exit_code_bucket,
        "outputs": report.outputs.iter().map(|o| &o.path).collect::<Vec<_>>(),
        "report_sha256": report.report_sha256,
    }));
}

fn run_run(args: RunArgs) -> i32 {
    let strict = strict_of(args.strict, args.no_strict);
    let pipeline = match run_pipeline(&args.script, args.legacy_sas, strict, args.schema_lock.as_deref(), true) {
        Ok(p) => p,
        Err(d) => return report_failure(&d),
    };
    let script_dir = args.script.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let bindings = match resolve_datasource_bindings(&pipeline.ir, args.tables.as_deref(), args.inputs_dir.as_deref(), &script_dir) {
        Ok(b) => b,
        Err(d) => return report_failure(&d),
    };
    let bundle_mode = match parse_bundle_mode(&args.bundle_mode) {
        Ok(m) => m,
        Err(d) => return report_failure(&d),
    };

    let source_text = std::fs::read_to_string(&args.script).unwrap_or_default();
    let script_name = args.script.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "script".to_string());
    let source_rel = format!("inputs/source/{script_name}");
    let source_entry = match write_artifact(&args.out, &source_rel, &source_text) {
        Ok(e) => FileEntry { path: e.path, name: None, sha256: hash_source_as_input(&args.out, &source_rel) },
        Err(d) => return report_failure(&d),
    };
    let mut inputs = vec![source_entry];
    if !args.legacy_sas {
        let expanded = sans_frontend::print_ir(&pipeline.ir);
        match write_artifact(&args.out, "inputs/source/expanded.sans", &expanded) {
            Ok(e) => inputs.push(FileEntry { path: e.path, name: None, sha256: hash_source_as_input(&args.out, "inputs/source/expanded.sans") }),
            Err(d) => return report_failure(&d),
        }
    }

    let lock_sha256 = pipeline.lock_used.as_ref().and_then(|l| sans_check::compute_lock_sha256(l).ok());

    match execute_and_bundle(
        &pipeline.ir,
        &pipeline.validated,
        &bindings,
        &args.out,
        bundle_mode,
        &args.format,
        &source_rel,
        inputs,
        pipeline.lock_used_path.as_deref(),
        lock_sha256,
        &pipeline.warnings,
        pipeline.schemas.as_ref(),
    ) {
        Ok(report) => {
            if let Some(emit_path) = &args.emit_schema_lock {
                if let Err(d) = emit_schema_lock(&pipeline, emit_path) {
                    return report_failure(&d);
                }
            }
            print_report_summary(&report);
            report.exit_code_bucket
        }
        Err(d) => report_failure(&d),
    }
}

/// `write_artifact` already hashes with the artifact rule (CSV/JSON
/// canonicalization); report `inputs[]` entries use the narrower
/// `compute_input_hash` rule instead, so the script/expanded-source bytes
/// are re-hashed here under that rule rather than reusing the artifact hash.
fn hash_source_as_input(out_dir: &Path, rel_path: &str) -> String {
    hash::compute_input_hash(&out_dir.join(rel_path)).unwrap_or_default()
}

fn run_run_ir(args: RunIrArgs) -> i32 {
    let strict = strict_of(args.strict, args.no_strict);
    let ir = match load_ir_file(&args.ir) {
        Ok(ir) => ir,
        Err(d) => return report_failure(&d),
    };
    let validated = match validate_structural(&ir, ValidateOptions { strict }) {
        Ok(v) => v,
        Err(e) => return report_failure(&e.to_diagnostic()),
    };
    let warnings = validated.warnings.clone();

    let ir_dir = args.ir.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let (lock_used, lock_used_path) = match load_lock_for_script(&args.ir, args.schema_lock.as_deref()) {
        Ok(v) => v,
        Err(d) => return report_failure(&d),
    };
    let envs = datasource_schema_envs(&ir, lock_used.as_ref());
    if strict {
        if let Err(d) = check_no_unknown_at_ingress(&ir, &envs) {
            return report_failure(&d);
        }
    }
    let schemas = match propagate_schemas(&ir, &validated, &envs) {
        Ok(s) => s,
        Err(e) => return report_failure(&e.to_diagnostic()),
    };

    let bindings = match resolve_datasource_bindings(&ir, args.tables.as_deref(), args.inputs_dir.as_deref(), &ir_dir) {
        Ok(b) => b,
        Err(d) => return report_failure(&d),
    };
    let bundle_mode = match parse_bundle_mode(&args.bundle_mode) {
        Ok(m) => m,
        Err(d) => return report_failure(&d),
    };

    let ir_text = std::fs::read_to_string(&args.ir).unwrap_or_default();
    let ir_name = args.ir.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "sans.ir.json".to_string());
    let source_rel = format!("inputs/source/{ir_name}");
    let source_entry = match write_artifact(&args.out, &source_rel, &ir_text) {
        Ok(e) => FileEntry { path: e.path, name: None, sha256: hash_source_as_input(&args.out, &source_rel) },
        Err(d) => return report_failure(&d),
    };

    let lock_sha256 = lock_used.as_ref().and_then(|l| sans_check::compute_lock_sha256(l).ok());

    match execute_and_bundle(
        &ir,
        &validated,
        &bindings,
        &args.out,
        bundle_mode,
        &args.format,
        &source_rel,
        vec![source_entry],
        lock_used_path.as_deref(),
        lock_sha256,
        &warnings,
        Some(&schemas),
    ) {
        Ok(report) => {
            print_report_summary(&report);
            report.exit_code_bucket
        }
        Err(d) => report_failure(&d),
    }
}

// ---------------------------------------------------------------------
// verify
// ---------------------------------------------------------------------

fn run_verify(args: VerifyArgs) -> i32 {
    let bindings = match resolve_verify_bindings(&args) {
        Ok(b) => b,
        Err(d) => return report_failure(&d),
    };
    match verify::verify_bundle(&args.bundle, &bindings, args.schema_lock.as_deref()) {
        Ok(outcome) if outcome.ok => {
            println!("ok");
            0
        }
        Ok(outcome) => {
            eprintln!("failed: {}", outcome.failures.join("; "));
            ExitBucket::OtherFailure.code()
        }
        Err(e) => report_failure(&e.to_diagnostic()),
    }
}

fn resolve_verify_bindings(args: &VerifyArgs) -> Result<BTreeMap<String, PathBuf>, Diagnostic> {
    let mut out = BTreeMap::new();
    // `--inputs-dir` first, `--tables` second, so an explicit binding always
    // wins over a directory-scan hit — matches `resolve_datasource_bindings`.
    if let Some(dir) = &args.inputs_dir {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| Diagnostic::new("SANS_IO_ERROR", format!("failed to scan --inputs-dir '{}': {e}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| Diagnostic::new("SANS_IO_ERROR", e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("csv")).unwrap_or(false) {
                let stem = path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
                out.insert(stem, path);
            }
        }
    }
    if let Some(spec) = &args.tables {
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (name, path) = entry
                .split_once('=')
                .ok_or_else(|| Diagnostic::new("SANS_IO_ERROR", format!("invalid --tables entry '{entry}', expected name=path")))?;
            out.insert(name.trim().to_string(), PathBuf::from(path.trim()));
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------
// fmt
// ---------------------------------------------------------------------

fn run_fmt(args: FmtArgs) -> i32 {
    let (ir, _) = match compile_script(&args.script, args.legacy_sas) {
        Ok(v) => v,
        Err(d) => return report_failure(&d),
    };
    let printed = sans_frontend::print_ir(&ir);
    if args.write {
        match std::fs::write(&args.script, &printed) {
            Ok(()) => {
                println!("wrote {}", args.script.display());
                0
            }
            Err(e) => report_failure(&Diagnostic::new("SANS_IO_ERROR", format!("failed to write '{}': {e}", args.script.display()))),
        }
    } else {
        print!("{printed}");
        0
    }
}
