//! Purpose: Library handle that brings up the kernel module and owns the control device.
//! Exports: `Handle`, `ApiResult`, `with_init_hint`.
//! Role: Entry point for collaborators that issue commands after bootstrap.
//! Invariants: A `Handle` only exists once the module is ready and the device is open.
//! Invariants: Bootstrap failures carry a remediation hint instead of a bare error code.
#![allow(clippy::result_large_err)]

use std::path::Path;

use crate::core::config::ModuleConfig;
use crate::core::device::ControlDevice;
use crate::core::diag::init_error_hint;
use crate::core::error::{Error, ErrorKind};
use crate::core::module::{CONTROL_DEVICE, ModuleBackend, OsModuleBackend, ensure_ready_with};

pub type ApiResult<T> = Result<T, Error>;

#[derive(Debug)]
pub struct Handle {
    module: String,
    device: ControlDevice,
}

impl Handle {
    pub fn init(config: &ModuleConfig) -> ApiResult<Self> {
        Self::init_with(&OsModuleBackend::default(), config, Path::new(CONTROL_DEVICE))
    }

    pub fn init_with<B: ModuleBackend>(
        backend: &B,
        config: &ModuleConfig,
        device: &Path,
    ) -> ApiResult<Self> {
        tracing::debug!(module = %config.module_name, load = config.load_enabled, timeout = config.timeout_seconds, "initializing");
        ensure_ready_with(backend, &config.module_name, device, &config.wait_policy())
            .map_err(with_init_hint)?;
        let device = ControlDevice::open(device).map_err(with_init_hint)?;
        Ok(Self {
            module: config.module_name.clone(),
            device,
        })
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn device(&self) -> &ControlDevice {
        &self.device
    }

    #[cfg(unix)]
    pub fn ioctl(&self, request: u64, payload: &mut [u8]) -> ApiResult<i32> {
        self.device.ioctl(request, payload)
    }
}

pub fn with_init_hint(err: Error) -> Error {
    if err.hint().is_some() || err.kind() == ErrorKind::Usage {
        return err;
    }
    match err.errno() {
        Some(errno) => {
            let hint = init_error_hint(errno);
            err.with_hint(hint)
        }
        None => err,
    }
}
