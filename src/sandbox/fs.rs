/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The outer namespaces and the app-visible root filesystem.
//!
//! The root of the mount namespace becomes the app package itself, with
//! `tmp`, `dev`, `var`, and `proc/cpuinfo` overlaid when the package carries
//! the corresponding entries. The supervisor keeps one extra vantage point:
//! an open handle to the grain's var directory, detached from the mount tree
//! so the app can never reach it, which becomes the supervisor's cwd after
//! the pivot.

use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use nix::mount::mount;
use nix::mount::umount2;
use nix::mount::MntFlags;
use nix::mount::MsFlags;
use nix::sched::unshare;
use nix::sched::CloneFlags;
use nix::sys::stat::mknod;
use nix::sys::stat::Mode;
use nix::sys::stat::SFlag;
use nix::unistd::pivot_root;
use nix::unistd::sethostname;
use nix::unistd::Gid;
use nix::unistd::Uid;

use crate::config::Config;
use crate::setup::STAGING_DIR;

/// The single uid/gid everything inside the user namespace maps to. Masking
/// the real ids costs nothing.
const SANDBOX_UID: u32 = 1000;

/// Bind `src` onto `dst` with the given extra mount flags.
///
/// Contrary to the mount(2) documentation claiming otherwise after 2.6.26,
/// mountflags are ignored on the initial bind. A subsequent remount is
/// required to set them.
pub fn bind(src: &Path, dst: &Path, flags: MsFlags) -> Result<()> {
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("while binding {} to {}", src.display(), dst.display()))?;
    mount(
        Some(src),
        dst,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_NOSUID | flags,
        None::<&str>,
    )
    .with_context(|| format!("while remounting {} on {}", src.display(), dst.display()))?;
    Ok(())
}

fn write_setgroups_if_present(contents: &str) -> Result<()> {
    match std::fs::write("/proc/self/setgroups", contents) {
        Ok(()) => Ok(()),
        // Kernels predating the setgroups control don't have the file.
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).context("while writing /proc/self/setgroups"),
    }
}

fn write_userns_map(which: &str, contents: &str) -> Result<()> {
    std::fs::write(format!("/proc/self/{}_map", which), contents)
        .with_context(|| format!("while writing the {} map", which))
}

/// Unshare every namespace except network (the child does that one itself,
/// post-fork).
///
/// Unsharing the pid namespace is a little odd in that it does not affect
/// this process, only later children created by it. That is intentional: the
/// supervisor stays in the outer pid namespace so it can observe its child.
pub fn unshare_outer() -> Result<()> {
    let uid = Uid::current();
    let gid = Gid::current();

    unshare(
        CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWPID,
    )
    .context("while unsharing into new namespaces")?;

    write_setgroups_if_present("deny\n")?;
    write_userns_map("uid", &format!("{} {} 1\n", SANDBOX_UID, uid))?;
    write_userns_map("gid", &format!("{} {} 1\n", SANDBOX_UID, gid))?;

    // To really unshare the mount namespace, all mounts must also be made
    // private, so nothing we do below leaks back to the host.
    // This is basically equivalent to `mount --make-rprivate /`
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("while making / private")?;

    // A dummy host/domain name so the grain can't see the real one.
    sethostname("sandbox").context("while setting hostname")?;
    Errno::result(unsafe { libc::setdomainname("sandbox".as_ptr().cast(), 7) })
        .context("while setting domainname")?;

    Ok(())
}

/// Creating a real device node with mknod won't work on any current kernel
/// from inside a user namespace, so bind-mount the host node over a plain
/// file instead.
fn make_char_device_node(name: &str, real_name: &str) -> Result<()> {
    let dst = Path::new("dev").join(name);
    mknod(&dst, SFlag::S_IFREG, Mode::from_bits_truncate(0o666), 0)
        .with_context(|| format!("while creating dev/{}", name))?;
    mount(
        Some(&Path::new("/dev").join(real_name)),
        &dst,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .with_context(|| format!("while binding /dev/{} to dev/{}", real_name, name))?;
    Ok(())
}

fn open_dir_handle(path: &str) -> Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open(path)
        .with_context(|| format!("while opening directory handle for {}", path))
}

/// Assemble the app root and pivot into it.
///
/// Post-condition: `/` is the package tree, the cwd is the grain's var
/// directory (reachable only through this process), and the old root is
/// gone. Returns whether proc should still be finish-mounted after fork.
pub fn setup_filesystem(config: &Config) -> Result<bool> {
    let staging = Path::new(STAGING_DIR);

    // Stage the supervisor's own directory first and immediately detach it,
    // keeping only a descriptor for a later fchdir. Detached, it is not
    // reachable from the mount tree the app will live in.
    bind(
        &config.var_path,
        staging,
        MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
    )?;
    let supervisor_dir = open_dir_handle(STAGING_DIR)?;
    umount2(staging, MntFlags::MNT_DETACH).context("while detaching the supervisor dir")?;

    // The package itself becomes the future root.
    bind(
        &config.pkg_path,
        staging,
        MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
    )?;
    std::env::set_current_dir(staging).context("while entering the staging dir")?;

    // Overlay tmp, dev, var, and cpuinfo, but only where the package asks
    // for them by carrying the corresponding entry.
    if Path::new("tmp").exists() {
        // A fresh tmpfs per run. Not shared and not the host /tmp: tmpfs has
        // no quota control beyond the size cap, and a private instance
        // disappears with the mount namespace so nothing needs cleanup.
        mount(
            Some("sandstorm-tmp"),
            "tmp",
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("size=16m,nr_inodes=4k,mode=770"),
        )
        .context("while mounting the sandbox tmp")?;
    }
    if Path::new("dev").exists() {
        mount(
            Some("sandstorm-dev"),
            "dev",
            Some("tmpfs"),
            MsFlags::MS_NOATIME | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
            Some("size=1m,nr_inodes=16,mode=755"),
        )
        .context("while mounting the sandbox dev")?;
        make_char_device_node("null", "null")?;
        make_char_device_node("zero", "zero")?;
        make_char_device_node("random", "urandom")?;
        make_char_device_node("urandom", "urandom")?;
        mount(
            Some("dev"),
            "dev",
            None::<&str>,
            MsFlags::MS_REMOUNT
                | MsFlags::MS_BIND
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_RDONLY,
            None::<&str>,
        )
        .context("while sealing the sandbox dev read-only")?;
    }
    if Path::new("var").exists() {
        bind(&config.sandbox_dir(), Path::new("var"), MsFlags::MS_NODEV)?;
    }
    if Path::new("proc/cpuinfo").exists() {
        bind(
            Path::new("/proc/cpuinfo"),
            Path::new("proc/cpuinfo"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        )?;
    }

    // A reference to the old root, needed to unmount it after the pivot.
    let old_root = open_dir_handle("/")?;

    let mut mount_proc = config.mount_proc;
    if mount_proc {
        if Path::new("proc").exists() {
            // Bind it now to retain permission to mount proc at all. This
            // instance is associated with the wrong pid namespace; the child
            // replaces it after fork (a fresh mount is impossible here since
            // the new pid namespace has no member yet).
            mount(
                Some("/proc"),
                "proc",
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )
            .context("while staging /proc")?;
        } else {
            mount_proc = false;
        }
    }

    // Passing the same directory for new root and put_old leaves the old
    // root mounted on top of the new one, with no path that names it. The
    // handle grabbed above is the only way back in, so: step into the old
    // root, detach it, then step into the supervisor dir.
    pivot_root(staging, staging).context("while pivoting the root")?;
    Errno::result(unsafe { libc::fchdir(old_root.as_raw_fd()) })
        .context("while entering the old root")?;
    umount2(".", MntFlags::MNT_DETACH).context("while detaching the old root")?;
    Errno::result(unsafe { libc::fchdir(supervisor_dir.as_raw_fd()) })
        .context("while entering the supervisor dir")?;

    // Now '.' is the grain's var and '/' is the sandbox root.
    Ok(mount_proc)
}
