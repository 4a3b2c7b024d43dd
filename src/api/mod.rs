//! Purpose: Define the stable public Rust API boundary for zfs-bootstrap.
//! Exports: Core types and operations needed by the CLI and library callers.
//! Role: Public, additive-only surface over the core modules.
//! Invariants: Callers build a `ModuleConfig` once and pass it in; nothing here reads ambient state.

mod handle;

pub use crate::core::config::ModuleConfig;
pub use crate::core::diag::{
    CommandNotifier, NoopNotifier, RollbackNotifier, init_error_hint, kernel_version,
    notify_rollback, shares_object_ino,
};
pub use crate::core::error::{Error, ErrorKind, shell_exit_code, to_exit_code};
pub use crate::core::exec::{
    ExecAttempt, ExecBackend, ExecOutcome, ExecRequest, OsExecBackend, SkipDiagnostic, execvpe,
    execvpe_with,
};
pub use crate::core::module::{
    ModuleBackend, ModuleState, OsModuleBackend, WaitPolicy, ensure_ready, module_state,
};
pub use handle::{ApiResult, Handle, with_init_hint};
