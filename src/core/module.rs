//! Purpose: Make sure the kernel module is loaded and its control device can be opened.
//! Exports: `ensure_ready`, `ensure_ready_with`, `module_state`, `ModuleBackend`, `OsModuleBackend`,
//! `WaitPolicy`, `WaitPhase`, `ModuleState`, `run_process`.
//! Role: Bootstrap gate every other kernel interaction depends on.
//! Invariants: The loader runs at most once per call; open errors other than ENOENT are never retried.
//! Invariants: A timeout is only reported once the monotonic elapsed time reaches the policy timeout.
//! Invariants: Waiting spins (yield) for `BUSY_WAIT` and then polls every `POLL_INTERVAL`.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::error::{Error, ErrorKind};

pub const CONTROL_DEVICE: &str = "/dev/zfs";
pub const DEV_DIR: &str = "/dev";

#[cfg(target_os = "macos")]
pub const LOADER_PATH: &str = "/sbin/kextload";
#[cfg(not(target_os = "macos"))]
pub const LOADER_PATH: &str = "/sbin/modprobe";

/// Spin phase length; after this the wait falls back to sleeping.
pub const BUSY_WAIT: Duration = Duration::from_millis(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    NotPresent,
    Ready,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitPolicy {
    load_enabled: bool,
    timeout: Duration,
}

impl WaitPolicy {
    pub fn new(load_enabled: bool, timeout: Duration) -> Self {
        let max = Duration::from_secs(crate::core::config::MAX_TIMEOUT_SECS);
        Self {
            load_enabled,
            timeout: timeout.min(max),
        }
    }

    pub fn load_enabled(&self) -> bool {
        self.load_enabled
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn busy_wait(&self) -> Duration {
        BUSY_WAIT
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitPhase {
    Spin,
    Poll,
}

impl WaitPhase {
    pub fn at(elapsed: Duration) -> Self {
        if elapsed < BUSY_WAIT {
            WaitPhase::Spin
        } else {
            WaitPhase::Poll
        }
    }
}

/// System seams used by the coordinator; tests substitute a scripted clock and device.
pub trait ModuleBackend {
    fn module_present(&self, module: &str) -> bool;
    /// Runs the external loader; `Ok(Some(0))` is success, `Ok(None)` means killed by a signal.
    fn run_loader(&self, module: &str) -> io::Result<Option<i32>>;
    fn open_device(&self, path: &Path) -> io::Result<()>;
    fn now(&self) -> Instant;
    fn yield_now(&self);
    fn sleep(&self, duration: Duration);
}

#[derive(Clone, Debug)]
pub struct OsModuleBackend {
    dev_dir: PathBuf,
    loader: PathBuf,
}

impl Default for OsModuleBackend {
    fn default() -> Self {
        Self {
            dev_dir: PathBuf::from(DEV_DIR),
            loader: PathBuf::from(LOADER_PATH),
        }
    }
}

impl OsModuleBackend {
    pub fn with_dev_dir(mut self, dev_dir: impl Into<PathBuf>) -> Self {
        self.dev_dir = dev_dir.into();
        self
    }

    pub fn with_loader(mut self, loader: impl Into<PathBuf>) -> Self {
        self.loader = loader.into();
        self
    }
}

impl ModuleBackend for OsModuleBackend {
    fn module_present(&self, module: &str) -> bool {
        self.dev_dir.join(module).exists()
    }

    fn run_loader(&self, module: &str) -> io::Result<Option<i32>> {
        run_process(&self.loader, &[module])
    }

    fn open_device(&self, path: &Path) -> io::Result<()> {
        // Dropping the handle closes the descriptor.
        OpenOptions::new().read(true).write(true).open(path).map(drop)
    }

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Run a program to completion and report its exit code.
pub fn run_process(program: &Path, args: &[&str]) -> io::Result<Option<i32>> {
    let status = Command::new(program).args(args).status()?;
    Ok(status.code())
}

pub fn module_state<B: ModuleBackend>(backend: &B, module: &str) -> ModuleState {
    if backend.module_present(module) {
        ModuleState::Ready
    } else {
        ModuleState::NotPresent
    }
}

pub fn ensure_ready(module: &str, policy: &WaitPolicy) -> Result<(), Error> {
    ensure_ready_with(
        &OsModuleBackend::default(),
        module,
        Path::new(CONTROL_DEVICE),
        policy,
    )
}

pub fn ensure_ready_with<B: ModuleBackend>(
    backend: &B,
    module: &str,
    device: &Path,
    policy: &WaitPolicy,
) -> Result<(), Error> {
    if module.is_empty() || module.contains('/') {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("invalid module name {module:?}"))
            .with_hint("Module names are bare names such as `zfs`."));
    }

    if module_state(backend, module) == ModuleState::NotPresent {
        if policy.load_enabled() {
            load_module(backend, module)?;
        }
        if module_state(backend, module) == ModuleState::NotPresent {
            return Err(Error::new(ErrorKind::ModuleNotLoaded)
                .with_message(format!("kernel module {module} is not loaded"))
                .with_path(Path::new(DEV_DIR).join(module)));
        }
    }

    wait_for_device(backend, device, policy.timeout())
}

fn load_module<B: ModuleBackend>(backend: &B, module: &str) -> Result<(), Error> {
    tracing::info!(module, "requesting kernel module load");
    match backend.run_loader(module) {
        Ok(Some(0)) => Ok(()),
        Ok(code) => {
            let status = code.map_or_else(|| "signal".to_string(), |code| code.to_string());
            tracing::warn!(module, %status, "module loader failed");
            Err(Error::new(ErrorKind::LoadAttemptFailed)
                .with_message(format!("module loader exited with status {status}")))
        }
        Err(err) => {
            tracing::warn!(module, error = %err, "module loader could not be started");
            Err(Error::new(ErrorKind::LoadAttemptFailed)
                .with_message("module loader could not be started")
                .with_source(err))
        }
    }
}

/// Device creation is asynchronous, so a freshly loaded module may not have
/// its node yet. Spin briefly for the common case, then poll.
fn wait_for_device<B: ModuleBackend>(
    backend: &B,
    device: &Path,
    timeout: Duration,
) -> Result<(), Error> {
    let start = backend.now();
    let mut phase = WaitPhase::Spin;
    loop {
        match backend.open_device(device) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(open_error(device, err)),
        }

        let elapsed = backend.now().saturating_duration_since(start);
        let next = WaitPhase::at(elapsed);
        if next != phase {
            tracing::debug!(device = %device.display(), ?elapsed, "control device still missing, polling");
            phase = next;
        }
        match phase {
            WaitPhase::Spin => backend.yield_now(),
            WaitPhase::Poll => backend.sleep(POLL_INTERVAL),
        }

        if backend.now().saturating_duration_since(start) >= timeout {
            return Err(Error::new(ErrorKind::DeviceTimeout)
                .with_message(format!(
                    "control device did not appear within {}s",
                    timeout.as_secs()
                ))
                .with_path(device));
        }
    }
}

fn open_error(device: &Path, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ if err.raw_os_error().is_some() => ErrorKind::Os,
        _ => ErrorKind::Io,
    };
    let mut mapped = Error::new(kind)
        .with_message("failed to open control device")
        .with_path(device);
    if let Some(errno) = err.raw_os_error() {
        mapped = mapped.with_errno(errno);
    }
    mapped.with_source(err)
}
