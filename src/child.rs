/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Fork and exec of the sandboxed app.
//!
//! The supervisor and its child share a socket pair carrying the app's RPC
//! traffic. The child becomes pid 1 of the new pid namespace (the earlier
//! unshare took effect at fork time), finishes the parts of the sandbox that
//! must happen post-fork, and execs the app with the socket on descriptor 3.

use std::ffi::CString;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::OwnedFd;

use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use nix::mount::mount;
use nix::mount::umount2;
use nix::mount::MntFlags;
use nix::mount::MsFlags;
use nix::sys::signal::sigprocmask;
use nix::sys::signal::SigSet;
use nix::sys::signal::SigmaskHow;
use nix::sys::socket::socketpair;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockType;
use nix::unistd::execve;
use nix::unistd::fork;
use nix::unistd::ForkResult;
use nix::unistd::Pid;

use crate::config::Config;
use crate::sandbox;
use crate::watchdog;

/// The descriptor number the app expects its RPC socket on.
const API_FD: libc::c_int = 3;

/// Create the API socket pair and fork. In the parent, returns the child's
/// pid and the supervisor's end of the pair; the child never returns.
pub fn spawn(config: &Config, mount_proc: bool, is_iptables_available: bool) -> Result<(Pid, OwnedFd)> {
    let (supervisor_end, child_end) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_CLOEXEC,
    )
    .context("while creating the API socket pair")?;

    match unsafe { fork() }.context("while forking the sandbox child")? {
        ForkResult::Parent { child } => {
            watchdog::set_child_pid(child.as_raw());
            drop(child_end);
            Ok((child, supervisor_end))
        }
        ForkResult::Child => {
            // Just to be safe, even though it's CLOEXEC.
            drop(supervisor_end);
            run_child(config, child_end, mount_proc, is_iptables_available)
        }
    }
}

fn run_child(
    config: &Config,
    api_fd: OwnedFd,
    mount_proc: bool,
    is_iptables_available: bool,
) -> ! {
    if let Err(e) = enter_sandbox_and_exec(config, api_fd, mount_proc, is_iptables_available) {
        watchdog::log_line(&format!("Failed to start app: {:#}", e));
        unsafe { libc::abort() }
    }
    unreachable!("exec returned without error")
}

/// proc must be mounted after fork to get the correct pid namespace. A copy
/// of proc has to stay mounted the whole time or the permission to mount it
/// at all is lost.
fn finish_mounting_proc(mount_proc: bool) -> Result<()> {
    if !mount_proc {
        return Ok(());
    }

    let old_proc = std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open("proc")
        .context("while grabbing the staged proc")?;

    // Move the stale instance onto the namespace root, which is mostly
    // inaccessible, then mount the real thing in its place.
    mount(Some("proc"), "/", None::<&str>, MsFlags::MS_MOVE, None::<&str>)
        .context("while moving the staged proc out of the way")?;
    mount(
        Some("proc"),
        "proc",
        Some("proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None::<&str>,
    )
    .context("while mounting the fresh proc")?;

    Errno::result(unsafe { libc::fchdir(old_proc.as_raw_fd()) })
        .context("while entering the old proc")?;
    umount2(".", MntFlags::MNT_DETACH).context("while detaching the old proc")?;
    std::env::set_current_dir("/").context("while returning to /")?;
    Ok(())
}

/// exec() keeps ignored signal dispositions and the signal mask, and the
/// supervisor installed handlers the app must not inherit as holes.
fn reset_signal_state() -> Result<()> {
    for signo in 1..=64 {
        // The only possible error is an invalid or unblockable signal
        // number, which is of no concern.
        unsafe { libc::signal(signo, libc::SIG_DFL) };
    }
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .context("while unblocking all signals")?;
    Ok(())
}

fn enter_sandbox_and_exec(
    config: &Config,
    api_fd: OwnedFd,
    mount_proc: bool,
    is_iptables_available: bool,
) -> Result<std::convert::Infallible> {
    std::env::set_current_dir("/").context("while entering the sandbox root")?;

    sandbox::net::setup(is_iptables_available)?;
    finish_mounting_proc(mount_proc)?;
    sandbox::drop_credentials()?;
    sandbox::seccomp::install(sandbox::seccomp::Options {
        devmode: config.devmode,
        dump: config.seccomp_dump,
    })?;
    reset_signal_state()?;

    // Put the API socket on the descriptor the app expects, without CLOEXEC.
    if api_fd.as_raw_fd() == API_FD {
        Errno::result(unsafe { libc::fcntl(API_FD, libc::F_SETFD, 0) })
            .context("while clearing CLOEXEC on the API socket")?;
        std::mem::forget(api_fd);
    } else {
        Errno::result(unsafe { libc::dup2(api_fd.as_raw_fd(), API_FD) })
            .context("while moving the API socket to fd 3")?;
        drop(api_fd);
    }

    // The supervisor's stdout is its readiness channel; the app must not see
    // it. Give the app a second stderr instead.
    Errno::result(unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) })
        .context("while pointing stdout at the log")?;

    let argv: Vec<CString> = config
        .command
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect::<Result<_, _>>()
        .context("NUL byte in command")?;
    let envp: Vec<CString> = config
        .environment
        .iter()
        .map(|entry| CString::new(entry.as_bytes()))
        .collect::<Result<_, _>>()
        .context("NUL byte in environment")?;

    execve(&argv[0], &argv, &envp)
        .with_context(|| format!("while executing {}", config.command[0]))
}
