//! Purpose: Small diagnostic collaborators around the kernel module.
//! Exports: `init_error_hint`, `kernel_version`, `shares_object_ino`, `RollbackNotifier`,
//! `NoopNotifier`, `CommandNotifier`, `notify_rollback`.
//! Role: Remediation text, version query, share-directory identity, desktop refresh hook.
//! Invariants: Hints are keyed by POSIX error code and never expose raw codes to users.
//! Invariants: Notifier failures are logged and never fail the calling operation.

use std::path::{Path, PathBuf};

use crate::core::error::{Error, ErrorKind};
use crate::core::module::run_process;

pub const SHARES_DIR: &str = ".zfs/shares/";

#[cfg(target_os = "macos")]
const LOAD_COMMAND: &str = "/sbin/kextload zfs.kext";
#[cfg(not(target_os = "macos"))]
const LOAD_COMMAND: &str = "/sbin/modprobe zfs";

/// Remediation text for a failed library initialisation.
pub fn init_error_hint(errno: i32) -> String {
    match errno {
        libc::ENXIO => format!(
            "The ZFS modules are not loaded.\nTry running '{LOAD_COMMAND}' as root to load them."
        ),
        libc::ENOENT => "/dev/zfs and /proc/self/mounts are required.\n\
             Try running 'udevadm trigger' and 'mount -t proc proc /proc' as root."
            .to_string(),
        libc::ENOEXEC => format!(
            "The ZFS modules cannot be auto-loaded.\n\
             Try running '{LOAD_COMMAND}' as root to manually load them."
        ),
        libc::EACCES => "Permission denied the ZFS utilities must be run as root.".to_string(),
        _ => "Failed to initialize the libzfs library.".to_string(),
    }
}

/// Version string reported by the loaded kernel module.
#[cfg(target_os = "macos")]
pub fn kernel_version(module: &str) -> Result<String, Error> {
    let name = format!("{module}.kext_version");
    let c_name = std::ffi::CString::new(name.clone())
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("invalid module name"))?;
    let mut buf = vec![0u8; 128];
    let mut len = buf.len();
    let rc = unsafe {
        libc::sysctlbyname(
            c_name.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            &mut len,
            std::ptr::null_mut(),
            0,
        )
    };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        return Err(version_error(&name, err));
    }
    buf.truncate(len);
    let end = buf.iter().position(|byte| *byte == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).trim_end().to_string())
}

#[cfg(not(target_os = "macos"))]
pub fn kernel_version(module: &str) -> Result<String, Error> {
    kernel_version_at(&Path::new("/sys/module").join(module).join("version"))
}

#[cfg(not(target_os = "macos"))]
fn kernel_version_at(path: &Path) -> Result<String, Error> {
    std::fs::read_to_string(path)
        .map(|text| text.trim_end().to_string())
        .map_err(|err| version_error(&path.display().to_string(), err))
}

fn version_error(source: &str, err: std::io::Error) -> Error {
    let kind = if err.kind() == std::io::ErrorKind::NotFound {
        ErrorKind::ModuleNotLoaded
    } else {
        ErrorKind::Io
    };
    let mut mapped = Error::new(kind).with_message(format!("cannot read kernel version from {source}"));
    if let Some(errno) = err.raw_os_error() {
        mapped = mapped.with_errno(errno);
    }
    mapped.with_source(err)
}

/// Inode of `<mountpoint>/.zfs/shares/`, used to recognise the shares
/// directory while computing dataset differences.
pub fn shares_object_ino(mountpoint: &Path) -> Result<u64, Error> {
    let path = mountpoint.join(SHARES_DIR);
    let metadata = std::fs::metadata(&path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("Cannot stat {}", path.display()))
            .with_path(&path)
            .with_source(err)
    })?;
    Ok(inode(&metadata))
}

#[cfg(unix)]
fn inode(metadata: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

#[cfg(not(unix))]
fn inode(_metadata: &std::fs::Metadata) -> u64 {
    0
}

/// Desktop-integration hook run after a rollback changed a mounted filesystem.
pub trait RollbackNotifier {
    fn filesystem_changed(&self, mountpoint: &Path);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl RollbackNotifier for NoopNotifier {
    fn filesystem_changed(&self, mountpoint: &Path) {
        tracing::trace!(mountpoint = %mountpoint.display(), "no rollback notifier configured");
    }
}

/// Runs `<program> <mountpoint>` and waits for it.
#[derive(Clone, Debug)]
pub struct CommandNotifier {
    program: PathBuf,
}

impl CommandNotifier {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl RollbackNotifier for CommandNotifier {
    fn filesystem_changed(&self, mountpoint: &Path) {
        let arg = mountpoint.to_string_lossy();
        match run_process(&self.program, &[arg.as_ref()]) {
            Ok(Some(0)) => {}
            Ok(code) => {
                tracing::warn!(program = %self.program.display(), ?code, "rollback notifier failed")
            }
            Err(err) => {
                tracing::warn!(program = %self.program.display(), error = %err, "rollback notifier could not start")
            }
        }
    }
}

/// Datasets without a mountpoint have nothing to refresh.
pub fn notify_rollback<N: RollbackNotifier + ?Sized>(notifier: &N, mountpoint: Option<&Path>) {
    if let Some(mountpoint) = mountpoint {
        notifier.filesystem_changed(mountpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: RefCell<Vec<PathBuf>>,
    }

    impl RollbackNotifier for RecordingNotifier {
        fn filesystem_changed(&self, mountpoint: &Path) {
            self.seen.borrow_mut().push(mountpoint.to_path_buf());
        }
    }

    #[test]
    fn hints_cover_bootstrap_failures() {
        assert!(init_error_hint(libc::ENXIO).contains("not loaded"));
        assert!(init_error_hint(libc::ENXIO).contains(LOAD_COMMAND));
        assert!(init_error_hint(libc::ENOENT).contains("/dev/zfs"));
        assert!(init_error_hint(libc::ENOEXEC).contains("cannot be auto-loaded"));
        assert!(init_error_hint(libc::EACCES).contains("run as root"));
        assert_eq!(
            init_error_hint(libc::EIO),
            "Failed to initialize the libzfs library."
        );
    }

    #[test]
    fn shares_inode_matches_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let shares = temp.path().join(".zfs").join("shares");
        std::fs::create_dir_all(&shares).expect("mkdir");
        let ino = shares_object_ino(temp.path()).expect("ino");
        assert_eq!(ino, inode(&std::fs::metadata(&shares).expect("stat")));
    }

    #[test]
    fn shares_inode_reports_unstatable_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = shares_object_ino(temp.path()).expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.message().unwrap_or_default().starts_with("Cannot stat "));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn kernel_version_is_trimmed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("version");
        std::fs::write(&path, "2.2.4-1\n").expect("write");
        assert_eq!(kernel_version_at(&path).expect("version"), "2.2.4-1");
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn kernel_version_missing_module() {
        let err = kernel_version("definitely-not-a-module").expect_err("missing");
        assert_eq!(err.kind(), ErrorKind::ModuleNotLoaded);
    }

    #[test]
    fn rollback_notifies_only_mounted_datasets() {
        let notifier = RecordingNotifier::default();
        notify_rollback(&notifier, None);
        notify_rollback(&notifier, Some(Path::new("/tank/home")));
        assert_eq!(*notifier.seen.borrow(), vec![PathBuf::from("/tank/home")]);
        notify_rollback(&NoopNotifier, Some(Path::new("/tank")));
    }

    #[cfg(unix)]
    #[test]
    fn command_notifier_passes_mountpoint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let marker = temp.path().join("seen");
        let script = temp.path().join("notify.sh");
        std::fs::write(
            &script,
            format!("#!/bin/sh\nprintf '%s' \"$1\" > '{}'\n", marker.display()),
        )
        .expect("write");
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
        }
        CommandNotifier::new(&script).filesystem_changed(Path::new("/tank/data"));
        assert_eq!(std::fs::read_to_string(&marker).expect("marker"), "/tank/data");
    }
}
