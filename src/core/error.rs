use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Io,
    ModuleNotLoaded,
    LoadAttemptFailed,
    DeviceTimeout,
    Os,
    PermissionDenied,
    NotFound,
    ExecFormatRetryFailed,
    ArgumentListTooLong,
    OutOfMemory,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    path: Option<PathBuf>,
    errno: Option<i32>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            path: None,
            errno: None,
            source: None,
        }
    }

    /// Classify a raw OS error code the way the executor reports it.
    pub fn from_errno(errno: i32) -> Self {
        let kind = match errno {
            libc::ENOENT => ErrorKind::NotFound,
            libc::EACCES => ErrorKind::PermissionDenied,
            libc::E2BIG => ErrorKind::ArgumentListTooLong,
            libc::ENOMEM => ErrorKind::OutOfMemory,
            _ => ErrorKind::Os,
        };
        Self::new(kind).with_errno(errno)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn path(&self) -> Option<&std::path::Path> {
        self.path.as_deref()
    }

    /// POSIX-equivalent error code for this failure.
    pub fn errno(&self) -> Option<i32> {
        if self.errno.is_some() {
            return self.errno;
        }
        match self.kind {
            ErrorKind::ModuleNotLoaded => Some(libc::ENXIO),
            ErrorKind::LoadAttemptFailed => Some(libc::ENOEXEC),
            ErrorKind::DeviceTimeout | ErrorKind::NotFound => Some(libc::ENOENT),
            ErrorKind::PermissionDenied => Some(libc::EACCES),
            ErrorKind::ArgumentListTooLong => Some(libc::E2BIG),
            ErrorKind::OutOfMemory => Some(libc::ENOMEM),
            _ => None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_errno(mut self, errno: i32) -> Self {
        self.errno = Some(errno);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " (path: {})", path.display())?;
        }
        if let Some(errno) = self.errno {
            write!(f, " ({})", io::Error::from_raw_os_error(errno))?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Io => 3,
        ErrorKind::ModuleNotLoaded => 4,
        ErrorKind::LoadAttemptFailed => 5,
        ErrorKind::DeviceTimeout => 6,
        ErrorKind::Os => 7,
        ErrorKind::PermissionDenied => 8,
        ErrorKind::NotFound => 9,
        ErrorKind::ExecFormatRetryFailed => 10,
        ErrorKind::ArgumentListTooLong => 11,
        ErrorKind::OutOfMemory => 12,
    }
}

/// Exit status a shell would report when it cannot run a command.
pub fn shell_exit_code(err: &Error) -> i32 {
    match err.errno() {
        Some(libc::ENOENT) => 127,
        _ => 126,
    }
}
