//! Static type inference, per-table schema propagation, and the
//! `schema.lock.json` ingress gate layered on top of `sans-core`'s
//! structural validator.

pub mod error;
pub mod schema;
pub mod schema_lock;
pub mod typecheck;

pub use error::CheckError;
pub use schema::{propagate_schemas, Schemas};
pub use schema_lock::{
    build_schema_lock, canonical_lock_json, compute_lock_sha256, git_sha, load_schema_lock,
    write_schema_lock, SchemaLock, SCHEMA_LOCK_VERSION,
};
pub use typecheck::{infer_expr_type, SchemaEnv};
