//! Command resolution and exec.

use std::ffi::{CStr, CString};

use brig_proto::Run;
use nix::errno::Errno;
use nix::unistd::execve;

use crate::boot::DEFAULT_PATH;
use crate::error::GuestError;

/// Interpreter for files the kernel refuses to exec directly.
pub const SHELL: &CStr = c"/bin/sh";

/// Paths to try for `cmd`. Commands containing `/` are used as given; an
/// empty search-path entry means the working directory.
pub fn candidates(cmd: &str, path: &str) -> Vec<String> {
    if cmd.contains('/') {
        return vec![cmd.to_owned()];
    }
    path.split(':')
        .map(|dir| match dir.trim_end_matches('/') {
            "" if dir.is_empty() => format!("./{cmd}"),
            trimmed => format!("{trimmed}/{cmd}"),
        })
        .collect()
}

/// Tries each candidate with `exec`, which only returns on failure.
///
/// An `ENOEXEC` candidate is retried once through [`SHELL`] and the search
/// ends there. Once `EACCES` has been seen it is the reported error, so a
/// permission problem is not masked by later `ENOENT`s.
pub fn search<F>(cmd: &str, args: &[String], path: &str, mut exec: F) -> Errno
where
    F: FnMut(&CStr, &[CString]) -> Errno,
{
    let Ok(argv) = std::iter::once(cmd)
        .chain(args.iter().map(String::as_str))
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
    else {
        return Errno::EINVAL;
    };

    let mut last = Errno::ENOENT;
    let mut record = |err: Errno| {
        if last != Errno::EACCES {
            last = err;
        }
    };

    for candidate in candidates(cmd, path) {
        let Ok(file) = CString::new(candidate) else {
            continue;
        };
        let err = exec(&file, &argv);
        if err == Errno::ENOEXEC {
            let mut shell_argv = Vec::with_capacity(argv.len() + 1);
            shell_argv.push(SHELL.to_owned());
            shell_argv.push(file);
            shell_argv.extend_from_slice(&argv[1..]);
            record(exec(SHELL, &shell_argv));
            break;
        }
        record(err);
    }
    last
}

/// `KEY=VALUE` entries for the child's environment.
fn envp(env: &std::collections::BTreeMap<String, String>) -> Vec<CString> {
    env.iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect()
}

/// Replaces the current process with `run`'s command. Only returns on failure.
pub fn exec(run: &Run) -> GuestError {
    let env = run.effective_env(std::env::vars());
    let path = env.get("PATH").map_or(DEFAULT_PATH, String::as_str);
    let envp = envp(&env);

    let errno = search(&run.cmd, &run.args, path, |file, argv| {
        match execve(file, argv, &envp) {
            Ok(never) => match never {},
            Err(e) => e,
        }
    });
    GuestError::Exec {
        cmd: run.cmd.clone(),
        source: errno.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every attempt and answers from a script.
    fn attempt(
        cmd: &str,
        path: &str,
        answers: &[(&str, Errno)],
    ) -> (Errno, Vec<Vec<String>>) {
        let mut calls = Vec::new();
        let err = search(cmd, &["a".to_owned()], path, |file, argv| {
            let file = file.to_string_lossy().into_owned();
            let mut call = vec![file.clone()];
            call.extend(argv.iter().map(|a| a.to_string_lossy().into_owned()));
            calls.push(call);
            answers
                .iter()
                .find(|(f, _)| *f == file)
                .map_or(Errno::ENOENT, |&(_, e)| e)
        });
        (err, calls)
    }

    #[test]
    fn candidate_paths() {
        assert_eq!(candidates("ls", "/bin:/usr/bin/"), ["/bin/ls", "/usr/bin/ls"]);
        assert_eq!(candidates("ls", "/bin::/usr/bin"), ["/bin/ls", "./ls", "/usr/bin/ls"]);
        assert_eq!(candidates("ls", "/"), ["/ls"]);
        assert_eq!(candidates("./run.sh", "/bin"), ["./run.sh"]);
    }

    #[test]
    fn searches_every_entry_until_one_fails_differently() {
        let (err, calls) = attempt("tool", "/bin:/usr/bin", &[]);
        assert_eq!(err, Errno::ENOENT);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], ["/bin/tool", "tool", "a"]);
        assert_eq!(calls[1], ["/usr/bin/tool", "tool", "a"]);
    }

    #[test]
    fn noexec_falls_back_to_the_shell_once() {
        let (err, calls) = attempt(
            "script",
            "/bin:/usr/bin",
            &[("/bin/script", Errno::ENOEXEC), ("/bin/sh", Errno::ENOENT)],
        );
        assert_eq!(err, Errno::ENOENT);
        assert_eq!(
            calls,
            [
                vec!["/bin/script", "script", "a"],
                vec!["/bin/sh", "/bin/sh", "/bin/script", "a"],
            ]
        );
    }

    #[test]
    fn permission_denied_is_sticky() {
        let (err, calls) = attempt("tool", "/bin:/usr/bin", &[("/bin/tool", Errno::EACCES)]);
        assert_eq!(err, Errno::EACCES);
        assert_eq!(calls.len(), 2);
    }

    #[test]
    fn slash_commands_are_not_searched() {
        let (err, calls) = attempt("/opt/x", "/bin:/usr/bin", &[("/opt/x", Errno::EISDIR)]);
        assert_eq!(err, Errno::EISDIR);
        assert_eq!(calls, [vec!["/opt/x", "/opt/x", "a"]]);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let (err, calls) = attempt("bad\0cmd", "/bin", &[]);
        assert_eq!(err, Errno::EINVAL);
        assert!(calls.is_empty());
    }

    #[test]
    fn env_entries() {
        let run = Run::new("env", Vec::<String>::new()).env("A", "1");
        let env = run.effective_env([("PATH", "/bin")]);
        let entries = envp(&env);
        assert_eq!(entries, [c"A=1".to_owned(), c"PATH=/bin".to_owned()]);
    }
}
