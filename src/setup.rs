/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Pre-sandbox process hygiene: signal mask, no-new-privs, inherited file
//! descriptors, and the on-disk paths the grain needs.

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::sigprocmask;
use nix::sys::signal::SigSet;
use nix::sys::signal::SigmaskHow;
use nix::sys::stat::umask;
use nix::sys::stat::Mode;
use nix::unistd::access;
use nix::unistd::mkdir;
use nix::unistd::AccessFlags;

use crate::config::Config;

/// Shared staging mount point used while assembling the app root. One is
/// enough for all grains because every bind lands in a private mount
/// namespace anyway.
pub const STAGING_DIR: &str = "/tmp/sandstorm-grain";

/// Reset the signal mask to empty in case the parent process left one.
pub fn reset_signal_mask() -> Result<()> {
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .context("while resetting the signal mask")?;
    Ok(())
}

/// Once privileges are dropped they can never be regained through e.g.
/// execing a suid-root binary. Sandboxed apps should not need that.
pub fn enable_no_new_privs() -> Result<()> {
    Errno::result(unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) })
        .context("while setting no_new_privs")?;
    Ok(())
}

/// Close all file descriptors other than stdin/stdout/stderr, in case we were
/// launched by a parent that forgot CLOEXEC on its private descriptors. The
/// sandboxed process must not inherit those.
///
/// Closing is deferred until the `/proc/self/fd` scan completes: the scan
/// itself holds a descriptor, and the directory contents should not change
/// mid-listing.
pub fn close_inherited_fds() -> Result<()> {
    let mut fds = Vec::new();
    for entry in
        std::fs::read_dir("/proc/self/fd").context("while listing /proc/self/fd")?
    {
        let entry = entry.context("while listing /proc/self/fd")?;
        let name = entry.file_name();
        let fd: libc::c_int = name
            .to_str()
            .and_then(|s| s.parse().ok())
            .with_context(|| format!("file in /proc/self/fd had non-numeric name: {:?}", name))?;
        if fd > libc::STDERR_FILENO {
            fds.push(fd);
        }
    }

    for fd in fds {
        // Ignore close errors; one of these is the directory fd that
        // read_dir already closed.
        unsafe { libc::close(fd) };
    }
    Ok(())
}

/// Create or verify the pkg, var, and staging directories, and the log file.
pub fn check_paths(config: &Config) -> Result<()> {
    // Be explicit about permissions for now.
    umask(Mode::empty());

    access(&config.pkg_path, AccessFlags::R_OK | AccessFlags::X_OK)
        .with_context(|| format!("no such package: {}", config.pkg_path.display()))?;

    if config.is_new {
        match mkdir(&config.var_path, Mode::from_bits_truncate(0o770)) {
            Ok(()) => {}
            Err(Errno::EEXIST) => bail!("Grain already exists: {}", config.grain_id),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("while creating {}", config.var_path.display()));
            }
        }
        mkdir(&config.sandbox_dir(), Mode::from_bits_truncate(0o770))
            .with_context(|| format!("while creating {}", config.sandbox_dir().display()))?;
    } else {
        match access(
            &config.var_path,
            AccessFlags::R_OK | AccessFlags::W_OK | AccessFlags::X_OK,
        ) {
            Ok(()) => {}
            Err(Errno::ENOENT) => bail!("No such grain: {}", config.grain_id),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("while checking {}", config.var_path.display()));
            }
        }
    }

    match mkdir(STAGING_DIR, Mode::from_bits_truncate(0o770)) {
        Ok(()) | Err(Errno::EEXIST) => {}
        Err(e) => return Err(e).with_context(|| format!("while creating {}", STAGING_DIR)),
    }

    // Create the log file while we're still able to.
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .custom_flags(libc::O_CLOEXEC)
        .open(config.var_path.join("log"))
        .with_context(|| format!("while creating {}/log", config.var_path.display()))?;

    Ok(())
}

/// Point stdin at /dev/null and stderr at the grain log.
///
/// Stdin could inadvertently carry other powers (a tty, say). Stdout is left
/// alone here: in the supervisor it is the readiness channel to the launcher,
/// and the child replaces it with a dup of stderr just before exec.
///
/// Must run after the root pivot, while the cwd is the grain's var directory.
pub fn setup_stdio(config: &Config) -> Result<()> {
    if config.keep_stdio {
        return Ok(());
    }

    let dev_null = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("/dev/null")
        .context("while opening /dev/null")?;
    Errno::result(unsafe { libc::dup2(dev_null.as_raw_fd(), libc::STDIN_FILENO) })
        .context("while replacing stdin")?;

    let log = OpenOptions::new()
        .append(true)
        .custom_flags(libc::O_CLOEXEC)
        .open("log")
        .context("while opening the grain log")?;
    Errno::result(unsafe { libc::dup2(log.as_raw_fd(), libc::STDERR_FILENO) })
        .context("while redirecting stderr to the grain log")?;

    Ok(())
}

/// Scan the running-modules list for ip_tables. Must happen before entering
/// any namespace since it needs the host's /proc.
pub fn check_if_ip_tables_loaded() -> Result<bool> {
    let modules =
        std::fs::read_to_string("/proc/modules").context("while reading /proc/modules")?;
    Ok(modules.lines().any(|line| line.starts_with("ip_tables ")))
}
