// Thin command gateway over the control device descriptor.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};

#[derive(Debug)]
pub struct ControlDevice {
    file: File,
    path: PathBuf,
}

impl ControlDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|err| device_error(path, "failed to open control device", err))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Hand an opaque command buffer to the driver. The payload layout is
    /// owned by the caller; it is passed to the kernel unchanged.
    #[cfg(unix)]
    pub fn ioctl(&self, request: u64, payload: &mut [u8]) -> Result<i32, Error> {
        use std::os::fd::AsRawFd;
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                request as _,
                payload.as_mut_ptr() as *mut libc::c_void,
            )
        };
        if rc < 0 {
            return Err(device_error(
                &self.path,
                "control device command failed",
                io::Error::last_os_error(),
            ));
        }
        Ok(rc)
    }
}

fn device_error(path: &Path, message: &str, err: io::Error) -> Error {
    let kind = match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
        _ if err.raw_os_error().is_some() => ErrorKind::Os,
        _ => ErrorKind::Io,
    };
    let mut mapped = Error::new(kind).with_message(message).with_path(path);
    if let Some(errno) = err.raw_os_error() {
        mapped = mapped.with_errno(errno);
    }
    mapped.with_source(err)
}
