//! Purpose: Hold top-level CLI command dispatch for `zfs-bootstrap`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Configuration is built once here from env plus flags, then passed down.
//! Invariants: `exec` only returns on failure; its exit code follows shell conventions.

use super::*;

use std::ffi::{CStr, CString};

use zfs_bootstrap::api::{
    ExecAttempt, ExecBackend, ExecOutcome, ExecRequest, ModuleConfig, OsExecBackend,
    OsModuleBackend, SkipDiagnostic, ensure_ready, execvpe_with, init_error_hint, kernel_version,
    module_state, shares_object_ino, shell_exit_code, with_init_hint,
};
use zfs_bootstrap::core::module::CONTROL_DEVICE;
use zfs_bootstrap::notice::skip_notice;

pub(super) fn dispatch_command(command: Command, color_mode: ColorMode) -> Result<RunOutcome, Error> {
    match command {
        Command::Completion { shell } => {
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            clap_complete::aot::generate(shell, &mut cmd, "zfs-bootstrap", &mut io::stdout());
            Ok(RunOutcome::ok())
        }
        Command::Ready {
            module,
            load,
            timeout,
        } => {
            let config = module_config(module, load, timeout);
            ensure_ready(&config.module_name, &config.wait_policy()).map_err(with_init_hint)?;
            emit_json(
                json!({
                    "module": config.module_name,
                    "state": "ready",
                    "device": CONTROL_DEVICE,
                    "timeout_secs": config.timeout_seconds,
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::State { module } => {
            let config = module_config(module, false, None);
            let state = module_state(&OsModuleBackend::default(), &config.module_name);
            emit_json(
                json!({ "module": config.module_name, "state": state }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Exec { name, args } => {
            let mut argv = Vec::with_capacity(args.len() + 1);
            argv.push(name.clone());
            argv.extend(args);
            let request = ExecRequest::inherit_env(name, argv);
            let backend = NoticeExecBackend { color_mode };
            let search_path = std::env::var_os("PATH");
            match execvpe_with(&backend, &request, search_path.as_deref()) {
                ExecOutcome::Replaced => Ok(RunOutcome::ok()),
                ExecOutcome::Failed(err) => {
                    let code = shell_exit_code(&err);
                    emit_error(&err, color_mode);
                    Ok(RunOutcome::with_code(code))
                }
            }
        }
        Command::Hint { errno } => {
            emit_json(
                json!({ "errno": errno, "hint": init_error_hint(errno) }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Version { module } => {
            let config = module_config(module, false, None);
            let kernel = match kernel_version(&config.module_name) {
                Ok(version) => Value::String(version),
                Err(err) => {
                    tracing::debug!(error = %err, "kernel module version unavailable");
                    Value::Null
                }
            };
            emit_json(
                json!({
                    "name": "zfs-bootstrap",
                    "version": env!("CARGO_PKG_VERSION"),
                    "kernel": { "module": config.module_name, "version": kernel },
                }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
        Command::Shares { mountpoint } => {
            let ino = shares_object_ino(&mountpoint)?;
            emit_json(
                json!({ "mountpoint": mountpoint.display().to_string(), "shares_ino": ino }),
                color_mode,
            );
            Ok(RunOutcome::ok())
        }
    }
}

fn module_config(module: Option<String>, load: bool, timeout: Option<i64>) -> ModuleConfig {
    let mut config = ModuleConfig::from_env();
    if let Some(module) = module {
        config = config.with_module(module);
    }
    if load {
        config = config.with_loading(true);
    }
    if let Some(timeout) = timeout {
        config = config.with_timeout(timeout);
    }
    config
}

/// OS exec that also reports skipped search-path entries as stderr notices.
struct NoticeExecBackend {
    color_mode: ColorMode,
}

impl ExecBackend for NoticeExecBackend {
    fn execve(&self, path: &CStr, argv: &[CString], envp: &[CString]) -> ExecAttempt {
        OsExecBackend.execve(path, argv, envp)
    }

    fn stat_ok(&self, path: &CStr) -> bool {
        OsExecBackend.stat_ok(path)
    }

    fn report_skip(&self, skip: &SkipDiagnostic) {
        OsExecBackend.report_skip(skip);
        emit_notice(&skip_notice(skip, notice_time_now()), self.color_mode);
    }
}
