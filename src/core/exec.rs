//! Purpose: `execvpe`-style process replacement with a `PATH` search and shell fallback.
//! Exports: `execvpe`, `execvpe_with`, `ExecRequest`, `ExecOutcome`, `ExecAttempt`, `ExecBackend`,
//! `PathSearchState`, `SkipDiagnostic`, `OsExecBackend`.
//! Role: Launches helper programs with the same resolution rules on every platform.
//! Invariants: A name containing `/` is tried exactly once and `PATH` is never consulted.
//! Invariants: Entries longer than `MAX_CANDIDATE_LEN` are skipped with a diagnostic, never truncated.
//! Invariants: ENOEXEC triggers one `/bin/sh` retry whose outcome ends the search.
//! Invariants: `permission_seen` only ever goes from false to true within a search.

use std::collections::VecDeque;
use std::ffi::{CStr, CString, OsStr, OsString};

use crate::core::error::{Error, ErrorKind};

/// Longest candidate (`dir` + `/` + `name` + NUL) that will be attempted.
pub const MAX_CANDIDATE_LEN: usize = 1024;
pub const DEFAULT_PATH: &str = "/usr/bin:/bin";
pub const SHELL_PATH: &CStr = c"/bin/sh";
const SHELL_ARGV0: &CStr = c"sh";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecRequest {
    name: OsString,
    argv: Vec<OsString>,
    envp: Vec<(OsString, OsString)>,
}

impl ExecRequest {
    pub fn new<N, A, K, V>(name: N, argv: A, envp: impl IntoIterator<Item = (K, V)>) -> Self
    where
        N: Into<OsString>,
        A: IntoIterator,
        A::Item: Into<OsString>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        Self {
            name: name.into(),
            argv: argv.into_iter().map(Into::into).collect(),
            envp: envp
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// Request that inherits the caller's environment.
    pub fn inherit_env<N, A>(name: N, argv: A) -> Self
    where
        N: Into<OsString>,
        A: IntoIterator,
        A::Item: Into<OsString>,
    {
        Self::new(name, argv, std::env::vars_os())
    }

    pub fn name(&self) -> &OsStr {
        &self.name
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn envp(&self) -> &[(OsString, OsString)] {
        &self.envp
    }
}

/// Result of a search. `Replaced` only surfaces from backends that do not
/// really replace the process image; the OS backend never returns it.
#[must_use]
#[derive(Debug)]
pub enum ExecOutcome {
    Replaced,
    Failed(Error),
}

impl ExecOutcome {
    pub fn into_error(self) -> Option<Error> {
        match self {
            ExecOutcome::Replaced => None,
            ExecOutcome::Failed(err) => Some(err),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecAttempt {
    Replaced,
    Failed(i32),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SkipDiagnostic {
    pub entry: String,
    pub candidate_len: usize,
}

pub trait ExecBackend {
    fn execve(&self, path: &CStr, argv: &[CString], envp: &[CString]) -> ExecAttempt;
    fn stat_ok(&self, path: &CStr) -> bool;

    fn report_skip(&self, skip: &SkipDiagnostic) {
        tracing::warn!(entry = %skip.entry, len = skip.candidate_len, "execvp: path too long, skipping entry");
    }
}

pub struct PathSearchState {
    segments: VecDeque<Vec<u8>>,
    permission_seen: bool,
}

impl PathSearchState {
    /// Splits a colon list; empty segments (leading, trailing, doubled) mean `.`.
    pub fn new(search_path: &[u8]) -> Self {
        let segments = search_path
            .split(|byte| *byte == b':')
            .map(|segment| {
                if segment.is_empty() {
                    b".".to_vec()
                } else {
                    segment.to_vec()
                }
            })
            .collect();
        Self {
            segments,
            permission_seen: false,
        }
    }

    fn literal() -> Self {
        Self {
            segments: VecDeque::new(),
            permission_seen: false,
        }
    }

    pub fn permission_seen(&self) -> bool {
        self.permission_seen
    }

    pub fn remaining(&self) -> usize {
        self.segments.len()
    }

    fn next_segment(&mut self) -> Option<Vec<u8>> {
        self.segments.pop_front()
    }

    fn note_permission_denied(&mut self) {
        self.permission_seen = true;
    }

    fn exhausted(&self) -> Error {
        let errno = if self.permission_seen {
            libc::EACCES
        } else {
            libc::ENOENT
        };
        Error::from_errno(errno)
    }
}

enum Step {
    Continue,
    Done(ExecOutcome),
}

struct Prepared {
    name: Vec<u8>,
    argv: Vec<CString>,
    envp: Vec<CString>,
}

impl Prepared {
    fn new(request: &ExecRequest) -> Result<Self, Error> {
        let name = os_bytes(&request.name);
        if name.contains(&0) {
            return Err(nul_error("program name"));
        }
        let argv = request
            .argv
            .iter()
            .map(|arg| CString::new(os_bytes(arg)).map_err(|_| nul_error("argument")))
            .collect::<Result<Vec<_>, _>>()?;
        let envp = request
            .envp
            .iter()
            .map(|(key, value)| {
                let mut entry = os_bytes(key);
                entry.push(b'=');
                entry.extend_from_slice(&os_bytes(value));
                CString::new(entry).map_err(|_| nul_error("environment entry"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { name, argv, envp })
    }
}

fn nul_error(what: &str) -> Error {
    Error::new(ErrorKind::Os)
        .with_errno(libc::EINVAL)
        .with_message(format!("{what} contains a NUL byte"))
}

#[cfg(unix)]
fn os_bytes(value: &OsStr) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    value.as_bytes().to_vec()
}

#[cfg(not(unix))]
fn os_bytes(value: &OsStr) -> Vec<u8> {
    value.to_string_lossy().as_bytes().to_vec()
}

/// Replace the current process image, searching `PATH` (or `DEFAULT_PATH`).
/// Only returns on failure.
pub fn execvpe(request: &ExecRequest) -> ExecOutcome {
    let search_path = std::env::var_os("PATH");
    execvpe_with(&OsExecBackend, request, search_path.as_deref())
}

pub fn execvpe_with<B: ExecBackend>(
    backend: &B,
    request: &ExecRequest,
    search_path: Option<&OsStr>,
) -> ExecOutcome {
    let prepared = match Prepared::new(request) {
        Ok(prepared) => prepared,
        Err(err) => return ExecOutcome::Failed(err),
    };

    if prepared.name.is_empty() {
        return ExecOutcome::Failed(Error::from_errno(libc::ENOENT));
    }

    if prepared.name.contains(&b'/') {
        let mut state = PathSearchState::literal();
        // NUL bytes were rejected in `Prepared::new`.
        let Ok(candidate) = CString::new(prepared.name.clone()) else {
            return ExecOutcome::Failed(nul_error("program name"));
        };
        return match attempt(backend, &prepared, &candidate, &mut state) {
            Step::Done(outcome) => outcome,
            Step::Continue => ExecOutcome::Failed(state.exhausted().with_path(path_of(&candidate))),
        };
    }

    let search_path = search_path
        .map(os_bytes)
        .unwrap_or_else(|| DEFAULT_PATH.as_bytes().to_vec());
    let mut state = PathSearchState::new(&search_path);

    while let Some(segment) = state.next_segment() {
        let candidate_len = segment.len() + prepared.name.len() + 2;
        if candidate_len > MAX_CANDIDATE_LEN {
            backend.report_skip(&SkipDiagnostic {
                entry: String::from_utf8_lossy(&segment).into_owned(),
                candidate_len,
            });
            continue;
        }

        let mut bytes = Vec::with_capacity(candidate_len);
        bytes.extend_from_slice(&segment);
        bytes.push(b'/');
        bytes.extend_from_slice(&prepared.name);
        // PATH entries come from the environment and cannot hold NUL.
        let Ok(candidate) = CString::new(bytes) else {
            continue;
        };

        if let Step::Done(outcome) = attempt(backend, &prepared, &candidate, &mut state) {
            return outcome;
        }
    }

    ExecOutcome::Failed(state.exhausted().with_message(format!(
        "no runnable {} in search path",
        String::from_utf8_lossy(&prepared.name)
    )))
}

fn attempt<B: ExecBackend>(
    backend: &B,
    prepared: &Prepared,
    candidate: &CStr,
    state: &mut PathSearchState,
) -> Step {
    let errno = match backend.execve(candidate, &prepared.argv, &prepared.envp) {
        ExecAttempt::Replaced => return Step::Done(ExecOutcome::Replaced),
        ExecAttempt::Failed(errno) => errno,
    };

    match errno {
        libc::ENAMETOOLONG | libc::ELOOP | libc::ENOENT | libc::ENOTDIR => Step::Continue,
        libc::ENOEXEC => Step::Done(shell_retry(backend, prepared, candidate)),
        libc::EACCES => {
            // Either an unreadable directory on the way (stat fails) or a
            // non-executable file; only the latter is remembered.
            if backend.stat_ok(candidate) {
                state.note_permission_denied();
            }
            Step::Continue
        }
        _ => {
            tracing::debug!(candidate = %candidate.to_string_lossy(), errno, "exec failed");
            Step::Done(ExecOutcome::Failed(
                Error::from_errno(errno).with_path(path_of(candidate)),
            ))
        }
    }
}

/// Run a file without a recognised binary format through the shell:
/// `sh <candidate> <argv[1..]>`.
fn shell_retry<B: ExecBackend>(backend: &B, prepared: &Prepared, candidate: &CStr) -> ExecOutcome {
    let mut argv = Vec::with_capacity(prepared.argv.len() + 1);
    argv.push(SHELL_ARGV0.to_owned());
    argv.push(candidate.to_owned());
    argv.extend(prepared.argv.iter().skip(1).cloned());

    tracing::debug!(candidate = %candidate.to_string_lossy(), "not an executable format, retrying with shell");
    match backend.execve(SHELL_PATH, &argv, &prepared.envp) {
        ExecAttempt::Replaced => ExecOutcome::Replaced,
        ExecAttempt::Failed(errno) => ExecOutcome::Failed(
            Error::new(ErrorKind::ExecFormatRetryFailed)
                .with_errno(errno)
                .with_message(format!(
                    "{} could not run the script",
                    SHELL_PATH.to_string_lossy()
                ))
                .with_path(path_of(candidate)),
        ),
    }
}

fn path_of(candidate: &CStr) -> std::path::PathBuf {
    std::path::PathBuf::from(candidate.to_string_lossy().into_owned())
}

#[derive(Clone, Copy, Debug, Default)]
pub struct OsExecBackend;

#[cfg(unix)]
impl ExecBackend for OsExecBackend {
    fn execve(&self, path: &CStr, argv: &[CString], envp: &[CString]) -> ExecAttempt {
        let argv_ptrs = null_terminated(argv);
        let envp_ptrs = null_terminated(envp);
        unsafe {
            libc::execve(path.as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr());
        }
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        ExecAttempt::Failed(errno)
    }

    fn stat_ok(&self, path: &CStr) -> bool {
        use std::os::unix::ffi::OsStrExt;
        std::fs::metadata(OsStr::from_bytes(path.to_bytes())).is_ok()
    }
}

#[cfg(unix)]
fn null_terminated(values: &[CString]) -> Vec<*const libc::c_char> {
    values
        .iter()
        .map(|value| value.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Without a replace-exec primitive the child is spawned and waited for, and
/// the caller exits with the child's status. Unlike a real exec, the pid
/// changes and the caller's destructors never run.
#[cfg(not(unix))]
impl ExecBackend for OsExecBackend {
    fn execve(&self, path: &CStr, argv: &[CString], envp: &[CString]) -> ExecAttempt {
        let program = path.to_string_lossy().into_owned();
        let args = argv.iter().skip(1).map(|arg| arg.to_string_lossy().into_owned());
        let vars = envp.iter().filter_map(|entry| {
            let entry = entry.to_string_lossy().into_owned();
            entry
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        });
        let status = std::process::Command::new(program)
            .args(args)
            .env_clear()
            .envs(vars)
            .status();
        match status {
            Ok(status) => std::process::exit(status.code().unwrap_or(1)),
            Err(err) => ExecAttempt::Failed(match err.kind() {
                std::io::ErrorKind::NotFound => libc::ENOENT,
                std::io::ErrorKind::PermissionDenied => libc::EACCES,
                std::io::ErrorKind::OutOfMemory => libc::ENOMEM,
                _ => libc::EIO,
            }),
        }
    }

    fn stat_ok(&self, path: &CStr) -> bool {
        std::fs::metadata(path.to_string_lossy().as_ref()).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct ScriptedBackend {
        results: HashMap<String, ExecAttempt>,
        statable: HashSet<String>,
        attempts: RefCell<Vec<(String, Vec<String>)>>,
        skips: RefCell<Vec<SkipDiagnostic>>,
    }

    impl ScriptedBackend {
        fn with(mut self, path: &str, result: ExecAttempt) -> Self {
            self.results.insert(path.to_string(), result);
            self
        }

        fn statable(mut self, path: &str) -> Self {
            self.statable.insert(path.to_string());
            self
        }

        fn attempted(&self) -> Vec<String> {
            self.attempts
                .borrow()
                .iter()
                .map(|(path, _)| path.clone())
                .collect()
        }
    }

    impl ExecBackend for ScriptedBackend {
        fn execve(&self, path: &CStr, argv: &[CString], _envp: &[CString]) -> ExecAttempt {
            let path = path.to_string_lossy().into_owned();
            let argv = argv
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned())
                .collect();
            self.attempts.borrow_mut().push((path.clone(), argv));
            self.results
                .get(&path)
                .copied()
                .unwrap_or(ExecAttempt::Failed(libc::ENOENT))
        }

        fn stat_ok(&self, path: &CStr) -> bool {
            self.statable.contains(path.to_string_lossy().as_ref())
        }

        fn report_skip(&self, skip: &SkipDiagnostic) {
            self.skips.borrow_mut().push(skip.clone());
        }
    }

    fn request(name: &str) -> ExecRequest {
        ExecRequest::new(name, [name, "x", "y"], [("HOME", "/root")])
    }

    fn run(backend: &ScriptedBackend, name: &str, path: &str) -> ExecOutcome {
        execvpe_with(backend, &request(name), Some(OsStr::new(path)))
    }

    fn failed(outcome: ExecOutcome) -> Error {
        match outcome {
            ExecOutcome::Failed(err) => err,
            ExecOutcome::Replaced => panic!("expected failure"),
        }
    }

    #[test]
    fn stops_at_first_successful_entry() {
        let backend = ScriptedBackend::default().with("/b/prog", ExecAttempt::Replaced);
        let outcome = run(&backend, "prog", "/a:/b:/c");
        assert!(matches!(outcome, ExecOutcome::Replaced));
        assert_eq!(backend.attempted(), vec!["/a/prog", "/b/prog"]);
    }

    #[test]
    fn permission_denied_is_remembered_across_entries() {
        let backend = ScriptedBackend::default()
            .with("/a/prog", ExecAttempt::Failed(libc::EACCES))
            .statable("/a/prog");
        let err = failed(run(&backend, "prog", "/a:/b"));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.errno(), Some(libc::EACCES));
        assert_eq!(backend.attempted(), vec!["/a/prog", "/b/prog"]);
    }

    #[test]
    fn permission_denied_without_stat_counts_as_not_found() {
        let backend =
            ScriptedBackend::default().with("/a/prog", ExecAttempt::Failed(libc::EACCES));
        let err = failed(run(&backend, "prog", "/a:/b"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.errno(), Some(libc::ENOENT));
    }

    #[test]
    fn all_missing_is_not_found() {
        let backend = ScriptedBackend::default();
        let err = failed(run(&backend, "prog", "/a:/b"));
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert_eq!(backend.attempted(), vec!["/a/prog", "/b/prog"]);
    }

    #[test]
    fn transient_errors_continue_the_search() {
        let backend = ScriptedBackend::default()
            .with("/a/prog", ExecAttempt::Failed(libc::ENOTDIR))
            .with("/b/prog", ExecAttempt::Failed(libc::ELOOP))
            .with("/c/prog", ExecAttempt::Failed(libc::ENAMETOOLONG))
            .with("/d/prog", ExecAttempt::Replaced);
        let outcome = run(&backend, "prog", "/a:/b:/c:/d");
        assert!(matches!(outcome, ExecOutcome::Replaced));
        assert_eq!(backend.attempted().len(), 4);
    }

    #[test]
    fn oversized_entry_is_skipped_with_diagnostic() {
        let long = format!("/{}", "x".repeat(MAX_CANDIDATE_LEN));
        let path = format!("{long}:/b");
        let backend = ScriptedBackend::default().with("/b/prog", ExecAttempt::Replaced);
        let outcome = run(&backend, "prog", &path);
        assert!(matches!(outcome, ExecOutcome::Replaced));
        assert_eq!(backend.attempted(), vec!["/b/prog"]);
        let skips = backend.skips.borrow();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].entry, long);
        assert_eq!(skips[0].candidate_len, long.len() + "prog".len() + 2);
    }

    #[test]
    fn entry_at_the_length_limit_is_attempted() {
        let dir = format!("/{}", "d".repeat(MAX_CANDIDATE_LEN - "prog".len() - 3));
        assert_eq!(dir.len() + "prog".len() + 2, MAX_CANDIDATE_LEN);
        let backend = ScriptedBackend::default();
        let _ = run(&backend, "prog", &dir);
        assert_eq!(backend.attempted().len(), 1);
        assert!(backend.skips.borrow().is_empty());
    }

    #[test]
    fn exec_format_error_retries_once_with_shell() {
        let backend = ScriptedBackend::default()
            .with("/a/prog", ExecAttempt::Failed(libc::ENOEXEC))
            .with("/bin/sh", ExecAttempt::Failed(libc::EACCES));
        let err = failed(run(&backend, "prog", "/a:/b"));
        assert_eq!(err.kind(), ErrorKind::ExecFormatRetryFailed);
        assert_eq!(err.errno(), Some(libc::EACCES));

        let attempts = backend.attempts.borrow();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].0, "/bin/sh");
        assert_eq!(attempts[1].1, vec!["sh", "/a/prog", "x", "y"]);
    }

    #[test]
    fn exec_format_retry_success_replaces() {
        let backend = ScriptedBackend::default()
            .with("/a/prog", ExecAttempt::Failed(libc::ENOEXEC))
            .with("/bin/sh", ExecAttempt::Replaced);
        let outcome = run(&backend, "prog", "/a:/b");
        assert!(matches!(outcome, ExecOutcome::Replaced));
        assert_eq!(backend.attempted(), vec!["/a/prog", "/bin/sh"]);
    }

    #[test]
    fn terminal_errors_stop_the_search() {
        for (errno, kind) in [
            (libc::E2BIG, ErrorKind::ArgumentListTooLong),
            (libc::ENOMEM, ErrorKind::OutOfMemory),
            (libc::ETXTBSY, ErrorKind::Os),
            (libc::EIO, ErrorKind::Os),
        ] {
            let backend = ScriptedBackend::default()
                .with("/a/prog", ExecAttempt::Failed(errno))
                .with("/b/prog", ExecAttempt::Replaced);
            let err = failed(run(&backend, "prog", "/a:/b"));
            assert_eq!(err.kind(), kind);
            assert_eq!(err.errno(), Some(errno));
            assert_eq!(backend.attempted(), vec!["/a/prog"]);
        }
    }

    #[test]
    fn name_with_separator_is_tried_literally_once() {
        let backend = ScriptedBackend::default().with("/a/prog", ExecAttempt::Replaced);
        let err = failed(run(&backend, "./prog", "/a"));
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert_eq!(backend.attempted(), vec!["./prog"]);
    }

    #[test]
    fn literal_permission_denied_is_eacces() {
        let backend = ScriptedBackend::default()
            .with("/opt/tool", ExecAttempt::Failed(libc::EACCES))
            .statable("/opt/tool");
        let err = failed(run(&backend, "/opt/tool", "/a"));
        assert_eq!(err.errno(), Some(libc::EACCES));
        assert_eq!(backend.attempted(), vec!["/opt/tool"]);
    }

    #[test]
    fn empty_segments_mean_current_directory() {
        let backend = ScriptedBackend::default();
        let _ = run(&backend, "prog", ":/a::/b:");
        assert_eq!(
            backend.attempted(),
            vec!["./prog", "/a/prog", "./prog", "/b/prog", "./prog"]
        );
    }

    #[test]
    fn missing_path_uses_default_list() {
        let backend = ScriptedBackend::default();
        let _ = execvpe_with(&backend, &request("prog"), None);
        assert_eq!(backend.attempted(), vec!["/usr/bin/prog", "/bin/prog"]);
    }

    #[test]
    fn empty_name_fails_without_attempts() {
        let backend = ScriptedBackend::default();
        let err = failed(run(&backend, "", "/a"));
        assert_eq!(err.errno(), Some(libc::ENOENT));
        assert!(backend.attempted().is_empty());
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let backend = ScriptedBackend::default();
        let request = ExecRequest::new("prog", ["prog", "a\0b"], Vec::<(String, String)>::new());
        let err = failed(execvpe_with(&backend, &request, Some(OsStr::new("/a"))));
        assert_eq!(err.errno(), Some(libc::EINVAL));
        assert!(backend.attempted().is_empty());
    }

    #[test]
    fn environment_is_rendered_as_key_value_pairs() {
        let request = ExecRequest::new("prog", ["prog"], [("A", "1"), ("B", "x=y")]);
        let prepared = Prepared::new(&request).expect("prepared");
        let rendered: Vec<_> = prepared
            .envp
            .iter()
            .map(|entry| entry.to_string_lossy().into_owned())
            .collect();
        assert_eq!(rendered, vec!["A=1", "B=x=y"]);
    }

    #[test]
    fn search_state_splits_segments() {
        let state = PathSearchState::new(b"/a::/b");
        assert_eq!(state.remaining(), 3);
        assert!(!state.permission_seen());
    }

    #[cfg(unix)]
    #[test]
    fn os_backend_reports_missing_program() {
        let temp = tempfile::tempdir().expect("tempdir");
        let request = ExecRequest::new("no-such-helper", ["no-such-helper"], Vec::<(String, String)>::new());
        let outcome = execvpe_with(&OsExecBackend, &request, Some(temp.path().as_os_str()));
        let err = failed(outcome);
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn os_backend_reports_non_executable_file() {
        use std::os::unix::fs::PermissionsExt;
        let temp = tempfile::tempdir().expect("tempdir");
        let script = temp.path().join("helper");
        std::fs::write(&script, "echo hi\n").expect("write");
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644))
            .expect("chmod");
        let request = ExecRequest::new("helper", ["helper"], Vec::<(String, String)>::new());
        let outcome = execvpe_with(&OsExecBackend, &request, Some(temp.path().as_os_str()));
        let err = failed(outcome);
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}
