/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Termination handling. The supervisor must kill its child whenever it goes
//! away itself, including on fatal signals, so a single shared handler covers
//! every signal whose default action is termination. SIGALRM doubles as the
//! idle watchdog: an interval timer fires every 90 seconds and shuts the
//! grain down if no keep-alive arrived within two consecutive windows.
//!
//! The handler runs with all signals masked and only touches process-wide
//! atomics and `write(2)`; everything on that path must stay
//! async-signal-safe.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::sigaction;
use nix::sys::signal::SaFlags;
use nix::sys::signal::SigAction;
use nix::sys::signal::SigHandler;
use nix::sys::signal::SigSet;
use nix::sys::signal::Signal;

/// Pid of the sandboxed child. 0 means no child. Written only by the
/// supervisor's main flow, read from signal context, so it must be a
/// word-sized atomic.
static CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Set by every keep-alive RPC, cleared by the SIGALRM handler. If it is
/// already clear when the alarm fires, the grain is idle and we exit.
static KEEP_ALIVE: AtomicBool = AtomicBool::new(true);

pub const LOG_PREFIX: &str = "** SANDSTORM SUPERVISOR: ";

/// Seconds between SIGALRM firings, giving a keep-alive grace window of
/// 90-180 s. Clients are expected to ping every 60 s.
const WATCHDOG_INTERVAL_SECS: i64 = 90;

/// All signals that by default terminate the process.
const DEATH_SIGNALS: [Signal; 20] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGFPE,
    Signal::SIGSEGV,
    Signal::SIGTERM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGBUS,
    Signal::SIGIO,
    Signal::SIGPROF,
    Signal::SIGSYS,
    Signal::SIGTRAP,
    Signal::SIGVTALRM,
    Signal::SIGXCPU,
    Signal::SIGXFSZ,
    Signal::SIGSTKFLT,
    Signal::SIGPWR,
];

pub fn set_child_pid(pid: libc::pid_t) {
    CHILD_PID.store(pid, Ordering::SeqCst);
}

pub fn child_pid() -> libc::pid_t {
    CHILD_PID.load(Ordering::SeqCst)
}

pub fn clear_child_pid() {
    CHILD_PID.store(0, Ordering::SeqCst);
}

pub fn note_keep_alive() {
    KEEP_ALIVE.store(true, Ordering::SeqCst);
}

/// Write a message to stderr without allocating.
fn log_safely(text: &str) {
    let mut bytes = text.as_bytes();
    while !bytes.is_empty() {
        let n = unsafe { libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len()) };
        if n <= 0 {
            return;
        }
        bytes = &bytes[n as usize..];
    }
}

/// Log a literal supervisor protocol line. Safe to call from signal context.
macro_rules! sandstorm_log {
    ($text:literal) => {
        $crate::watchdog::log_literal(concat!("** SANDSTORM SUPERVISOR: ", $text, "\n"))
    };
}
pub(crate) use sandstorm_log;

#[doc(hidden)]
pub fn log_literal(line: &'static str) {
    log_safely(line);
}

/// Log a runtime-formatted supervisor protocol line. Allocates; not for
/// signal context.
pub fn log_line(text: &str) {
    log_safely(LOG_PREFIX);
    log_safely(text);
    log_safely("\n");
}

pub fn kill_child() {
    let pid = CHILD_PID.swap(0, Ordering::SeqCst);
    if pid != 0 {
        unsafe { libc::kill(pid, libc::SIGKILL) };
    }
    // No waitpid here: when we exit, the child is adopted by init, which
    // reaps it.
}

pub fn kill_child_and_exit(status: i32) -> ! {
    kill_child();
    unsafe { libc::_exit(status) }
}

extern "C" fn handle_death_signal(signo: libc::c_int) {
    match signo {
        libc::SIGALRM => {
            if KEEP_ALIVE.swap(false, Ordering::SeqCst) {
                sandstorm_log!("Grain still in use; staying up for now.");
            } else {
                sandstorm_log!("Grain no longer in use; shutting down.");
                kill_child_and_exit(0);
            }
        }
        libc::SIGINT | libc::SIGTERM => {
            sandstorm_log!("Grain supervisor terminated by signal.");
            kill_child_and_exit(0);
        }
        _ => {
            sandstorm_log!("Grain supervisor crashed due to signal.");
            kill_child_and_exit(1);
        }
    }
}

/// Install the shared termination handler and arm the idle timer.
///
/// The handler runs with all signals masked; it completes or exits quickly,
/// so there is no point making it interruptible. The interval timer is not
/// inherited over fork, and the child resets all dispositions before exec.
pub fn install() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_death_signal),
        SaFlags::empty(),
        SigSet::all(),
    );

    unsafe {
        sigaction(Signal::SIGALRM, &action).context("while installing SIGALRM handler")?;
        for signal in DEATH_SIGNALS {
            sigaction(signal, &action)
                .with_context(|| format!("while installing {} handler", signal))?;
        }
    }

    let interval = libc::timeval {
        tv_sec: WATCHDOG_INTERVAL_SECS,
        tv_usec: 0,
    };
    let timer = libc::itimerval {
        it_interval: interval,
        it_value: interval,
    };
    Errno::result(unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) })
        .context("while arming the watchdog timer")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_pid_roundtrip() {
        set_child_pid(1234);
        assert_eq!(child_pid(), 1234);
        clear_child_pid();
        assert_eq!(child_pid(), 0);
    }

    #[test]
    fn keep_alive_two_phase() {
        // First alarm after a keep-alive clears the flag but stays up; the
        // second one (with no ping in between) would shut down.
        note_keep_alive();
        assert!(KEEP_ALIVE.swap(false, Ordering::SeqCst));
        assert!(!KEEP_ALIVE.swap(false, Ordering::SeqCst));
        note_keep_alive();
        assert!(KEEP_ALIVE.swap(false, Ordering::SeqCst));
    }
}
