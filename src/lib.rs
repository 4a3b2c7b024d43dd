//! Purpose: Bootstrap layer that user-space ZFS tools run before talking to the kernel.
//! Exports: `core` (readiness, exec, device gateway, diagnostics, errors) and `api`.
//! Role: Library backing the `zfs-bootstrap` binary and other clients.
//! Invariants: Nothing here reads the process environment except `core::config` and `core::exec::execvpe`.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod notice;
