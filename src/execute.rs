// SPDX-License-Identifier: GPL-3.0-or-later

//! Launching the real compiler.
//!
//! The compiler runs as a synchronous child process with stdout and stderr
//! redirected to files. Its PID is published so the fatal-signal handler
//! can forward termination to it. When caching is abandoned the original
//! command replaces this process entirely.

use crate::context::Context;
use crate::stats::{Failure, StatKind};
use crate::tmpfiles;
use log::debug;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Search PATH for an executable called `name`, skipping anything that is
/// this program under another name.
pub fn find_executable(name: &str, exclude_name: &str) -> Option<PathBuf> {
    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let self_path = std::env::current_exe().ok().and_then(|p| p.canonicalize().ok());
    let path_variable = std::env::var_os("PATH")?;
    for directory in std::env::split_paths(&path_variable) {
        let candidate = directory.join(name);
        if !is_executable(&candidate) {
            continue;
        }
        let resolved = candidate.canonicalize().unwrap_or_else(|_| candidate.clone());
        if resolved
            .file_name()
            .is_some_and(|base| base.to_string_lossy() == exclude_name)
        {
            // A symlink back into the cache; keep searching for the real
            // compiler further along PATH.
            continue;
        }
        if Some(&resolved) == self_path.as_ref() {
            continue;
        }
        return Some(candidate);
    }
    None
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(path) {
            Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

/// Resolve `ctx.orig_args[0]` to the real compiler executable.
pub fn find_compiler(ctx: &mut Context) -> Result<(), Failure> {
    let mut base = Path::new(&ctx.orig_args[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if ctx.orig_args[0].contains('/') && ctx.config.compiler.is_empty() {
        // A full path was given; trust it.
        return Ok(());
    }
    if !ctx.config.compiler.is_empty() {
        base = ctx.config.compiler.clone();
    }

    let compiler = find_executable(&base, crate::MYNAME).ok_or_else(|| {
        debug!("Could not find compiler \"{base}\" in PATH");
        Failure::new(StatKind::CouldNotFindCompiler)
    })?;

    if let Ok(self_path) = std::env::current_exe() {
        let resolved = compiler.canonicalize().unwrap_or_else(|_| compiler.clone());
        if self_path.canonicalize().ok().as_ref() == Some(&resolved) {
            // Executing ourselves would recurse forever; this is a setup
            // error that must surface to the user.
            eprintln!(
                "{}: error: recursive invocation (the name of the {} binary must be \"{}\")",
                crate::MYNAME,
                crate::MYNAME,
                crate::MYNAME
            );
            return Err(Failure::with_exit_code(StatKind::InternalError, 1));
        }
    }

    ctx.orig_args[0] = compiler.to_string_lossy().into_owned();
    Ok(())
}

/// Run `args` with stdout and stderr redirected to the given files.
/// Returns the exit code; termination by signal maps to 128 + signal.
pub fn execute(args: &[String], stdout_path: &Path, stderr_path: &Path) -> Result<i32, Failure> {
    debug!("Executing {}", args.join(" "));

    let stdout = File::create(stdout_path).map_err(io_failure)?;
    let stderr = File::create(stderr_path).map_err(io_failure)?;

    let mut child = Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|error| {
            debug!("Failed to execute {}: {error}", args[0]);
            if error.kind() == std::io::ErrorKind::NotFound {
                Failure::new(StatKind::CouldNotFindCompiler)
            } else {
                Failure::new(StatKind::InternalError)
            }
        })?;

    tmpfiles::set_compiler_pid(child.id() as i32);
    let status = child.wait();
    tmpfiles::clear_compiler_pid();

    let status = status.map_err(io_failure)?;
    match status.code() {
        Some(code) => Ok(code),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                Ok(128 + status.signal().unwrap_or(0))
            }
            #[cfg(not(unix))]
            {
                Ok(-1)
            }
        }
    }
}

fn io_failure(error: std::io::Error) -> Failure {
    debug!("I/O error while running compiler: {error}");
    Failure::new(StatKind::InternalError)
}

/// Replace this process with the original compiler invocation. Only
/// returns if exec itself failed.
#[cfg(unix)]
pub fn exec_original(args: &[String]) -> i32 {
    use std::os::unix::process::CommandExt;
    let error = Command::new(&args[0]).args(&args[1..]).exec();
    eprintln!("{}: execv of {} failed: {error}", crate::MYNAME, args[0]);
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_executable_in_path() {
        let found = find_executable("sh", crate::MYNAME);
        assert!(found.is_some());
        assert!(found.unwrap().ends_with("sh"));
    }

    #[test]
    fn test_find_executable_full_path() {
        assert!(find_executable("/bin/sh", crate::MYNAME).is_some());
        assert!(find_executable("/bin/does-not-exist", crate::MYNAME).is_none());
    }

    #[test]
    fn test_find_executable_missing() {
        assert!(find_executable("definitely-no-such-binary-here", crate::MYNAME).is_none());
    }

    #[test]
    fn test_execute_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let stdout_path = dir.path().join("stdout");
        let stderr_path = dir.path().join("stderr");

        let args = vec![
            "sh".to_string(),
            "-c".to_string(),
            "echo out; echo err >&2".to_string(),
        ];
        let code = execute(&args, &stdout_path, &stderr_path).unwrap();
        assert_eq!(code, 0);
        assert_eq!(std::fs::read(&stdout_path).unwrap(), b"out\n");
        assert_eq!(std::fs::read(&stderr_path).unwrap(), b"err\n");
    }

    #[test]
    fn test_execute_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let stdout_path = dir.path().join("stdout");
        let stderr_path = dir.path().join("stderr");

        let args = vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()];
        let code = execute(&args, &stdout_path, &stderr_path).unwrap();
        assert_eq!(code, 3);
    }

    #[test]
    fn test_execute_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let stdout_path = dir.path().join("stdout");
        let stderr_path = dir.path().join("stderr");

        let args = vec!["/no/such/compiler".to_string()];
        let error = execute(&args, &stdout_path, &stderr_path).unwrap_err();
        assert_eq!(error.stat, StatKind::CouldNotFindCompiler);
    }
}
