/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Sandbox construction: namespaces and the app-visible filesystem, the
//! virtual network, the syscall filter, and the final credential drop.

use anyhow::Context;
use anyhow::Result;
use nix::sys::stat::umask;
use nix::sys::stat::Mode;

pub mod fs;
pub mod net;
pub mod netfilter;
pub mod seccomp;

/// Drop all Linux "capabilities". (POSIX capabilities, not object
/// capabilities, hence the quotes.)
///
/// This must be performed post-fork in both the supervisor and the child,
/// because the child needs capabilities for one final unshare.
pub fn drop_credentials() -> Result<()> {
    caps::clear(None, caps::CapSet::Effective).context("while clearing effective caps")?;
    caps::clear(None, caps::CapSet::Permitted).context("while clearing permitted caps")?;
    caps::clear(None, caps::CapSet::Inheritable).context("while clearing inheritable caps")?;

    // Grain data is private to the user, with full access granted to the
    // group so a dedicated sandbox account can share an admin group with a
    // real user.
    umask(Mode::from_bits_truncate(0o007));
    Ok(())
}
