// SPDX-License-Identifier: GPL-3.0-or-later

//! Guaranteed cleanup of temporary files on any exit path.
//!
//! A process-wide registry holds every temporary file that must not survive
//! the process. The registry is a linked list of C strings so that the
//! fatal-signal handler can walk it with nothing but async-signal-safe
//! calls. Mutation happens only with fatal signals blocked; the handler
//! only reads.

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow, Signal};
use std::ffi::CString;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicPtr, Ordering};

struct Node {
    path: CString,
    next: *mut Node,
}

// Head of the pending-file list. Nodes are intentionally leaked; the list
// lives as long as the process.
static PENDING: AtomicPtr<Node> = AtomicPtr::new(ptr::null_mut());

// PID of a running compiler child, 0 when none. The signal handler forwards
// SIGTERM to it and waits for it before re-raising.
static COMPILER_PID: AtomicI32 = AtomicI32::new(0);

const FATAL_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
];

fn fatal_signal_set() -> SigSet {
    let mut set = SigSet::empty();
    for signal in FATAL_SIGNALS {
        set.add(*signal);
    }
    set
}

/// Block fatal signals for the calling thread.
pub fn block_fatal_signals() {
    let _ = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&fatal_signal_set()), None);
}

/// Restore delivery of fatal signals.
pub fn unblock_fatal_signals() {
    let _ = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&fatal_signal_set()), None);
}

/// Register a path for deletion at process exit or on a fatal signal.
pub fn add_pending(path: &Path) {
    let Ok(cpath) = CString::new(path.as_os_str().as_encoded_bytes()) else {
        return;
    };
    let node = Box::into_raw(Box::new(Node {
        path: cpath,
        next: ptr::null_mut(),
    }));

    block_fatal_signals();
    // Single-threaded writer; the swap ordering only has to be visible to
    // the signal handler on this thread.
    unsafe {
        (*node).next = PENDING.load(Ordering::SeqCst);
    }
    PENDING.store(node, Ordering::SeqCst);
    unblock_fatal_signals();
}

fn unlink_all() {
    let mut node = PENDING.load(Ordering::SeqCst);
    while !node.is_null() {
        unsafe {
            libc::unlink((*node).path.as_ptr());
            node = (*node).next;
        }
    }
}

/// Delete every registered file. Called on the normal exit path; the files
/// stay registered so a later signal cannot resurrect them.
pub fn cleanup_pending() {
    block_fatal_signals();
    unlink_all();
    unblock_fatal_signals();
}

/// Record the PID of the running compiler so the signal handler can forward
/// termination to it.
pub fn set_compiler_pid(pid: i32) {
    COMPILER_PID.store(pid, Ordering::SeqCst);
}

pub fn clear_compiler_pid() {
    COMPILER_PID.store(0, Ordering::SeqCst);
}

/// Install handlers for INT/TERM/HUP/QUIT. The handler forwards SIGTERM to
/// the compiler child, unlinks every pending temporary file, waits for the
/// child, then re-raises the signal with the default disposition.
pub fn setup_signal_handlers() {
    for signal in [
        signal_hook::consts::SIGINT,
        signal_hook::consts::SIGTERM,
        signal_hook::consts::SIGHUP,
        signal_hook::consts::SIGQUIT,
    ] {
        // Only async-signal-safe calls below: kill, waitpid, unlink.
        let result = unsafe {
            signal_hook::low_level::register(signal, move || {
                let pid = COMPILER_PID.load(Ordering::SeqCst);
                if signal == signal_hook::consts::SIGTERM && pid != 0 {
                    let mut status = 0;
                    if unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) } == 0 {
                        unsafe { libc::kill(pid, libc::SIGTERM) };
                    }
                }

                unlink_all();

                let pid = COMPILER_PID.load(Ordering::SeqCst);
                if pid != 0 {
                    let mut status = 0;
                    unsafe { libc::waitpid(pid, &mut status, 0) };
                }

                let _ = signal_hook::low_level::emulate_default_handler(signal);
            })
        };
        if let Err(error) = result {
            log::warn!("Failed to register handler for signal {signal}: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_files_are_unlinked() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept");
        let doomed_one = dir.path().join("doomed1");
        let doomed_two = dir.path().join("doomed2");
        std::fs::write(&kept, b"x").unwrap();
        std::fs::write(&doomed_one, b"x").unwrap();
        std::fs::write(&doomed_two, b"x").unwrap();

        add_pending(&doomed_one);
        add_pending(&doomed_two);
        cleanup_pending();

        assert!(kept.exists());
        assert!(!doomed_one.exists());
        assert!(!doomed_two.exists());
    }

    #[test]
    fn test_cleanup_tolerates_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("never-created");
        add_pending(&missing);
        cleanup_pending();
    }
}
