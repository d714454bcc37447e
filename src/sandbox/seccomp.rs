/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The syscall filter. Default allow, with denials for families of syscalls
//! the sandbox has no business making. Each denial class returns a different
//! errno, and a seccompiler filter carries exactly one action, so the classes
//! compile to separate BPF programs stacked on the same process; the syscall
//! sets are disjoint, so exactly one filter's denial can apply to any call.
//!
//! Installed after the very last use the process itself makes of the denied
//! calls (unshare, mount, capset and friends).

use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::Result;
use seccompiler::apply_filter;
use seccompiler::BpfProgram;
use seccompiler::SeccompAction;
use seccompiler::SeccompCmpArgLen;
use seccompiler::SeccompCmpOp;
use seccompiler::SeccompCondition;
use seccompiler::SeccompFilter;
use seccompiler::SeccompRule;
use seccompiler::TargetArch;

/// Filter behavior toggles, straight from the CLI.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Allow most of ptrace for debugging, keeping only the seccomp-bypass
    /// vector closed.
    pub devmode: bool,
    /// Log the compiled programs before loading them.
    pub dump: bool,
}

fn target_arch() -> Result<TargetArch> {
    std::env::consts::ARCH
        .try_into()
        .ok()
        .context("current architecture not supported by seccompiler")
}

fn unconditional(syscalls: &[libc::c_long]) -> BTreeMap<i64, Vec<SeccompRule>> {
    syscalls.iter().map(|&nr| (nr, vec![])).collect()
}

fn compile(
    rules: BTreeMap<i64, Vec<SeccompRule>>,
    errno: i32,
) -> Result<BpfProgram> {
    SeccompFilter::new(
        rules,
        // Allow everything not listed.
        SeccompAction::Allow,
        SeccompAction::Errno(errno as u32),
        target_arch()?,
    )
    .context("while creating the seccomp filter")?
    .try_into()
    .context("while compiling the seccomp filter to BPF")
}

/// Syscalls that simply do not exist as far as the sandbox is concerned.
fn enosys_program() -> Result<BpfProgram> {
    let mut syscalls = vec![
        // Kernel keyrings are a cross-sandbox information channel.
        libc::SYS_add_key,
        libc::SYS_request_key,
        libc::SYS_keyctl,
        libc::SYS_syslog,
        libc::SYS_personality,
        libc::SYS_acct,
        // Nested sandboxing could be useful but the attack surface is large.
        libc::SYS_unshare,
        libc::SYS_mount,
        libc::SYS_pivot_root,
        libc::SYS_quotactl,
        // AIO is scary.
        libc::SYS_io_setup,
        libc::SYS_io_destroy,
        libc::SYS_io_getevents,
        libc::SYS_io_submit,
        libc::SYS_io_cancel,
        // Scary VM syscalls.
        libc::SYS_remap_file_pages,
        libc::SYS_mbind,
        libc::SYS_get_mempolicy,
        libc::SYS_set_mempolicy,
        libc::SYS_migrate_pages,
        libc::SYS_move_pages,
        libc::SYS_vmsplice,
        // Scary futex operations.
        libc::SYS_set_robust_list,
        libc::SYS_get_robust_list,
        // Utterly terrifying profiling operations.
        libc::SYS_perf_event_open,
    ];
    #[cfg(target_arch = "x86_64")]
    syscalls.extend([
        libc::SYS_uselib,
        // 16-bit code is unnecessary in the sandbox, and modify_ldt is a
        // historic source of interesting information leaks.
        libc::SYS_modify_ldt,
        // set_thread_area is only useful for 32-bit programs; 64-bit
        // programs use arch_prctl instead.
        libc::SYS_set_thread_area,
    ]);
    compile(unconditional(&syscalls), libc::ENOSYS)
}

/// ptrace and user-namespace creation: denied outright rather than hidden.
fn eperm_program(devmode: bool) -> Result<BpfProgram> {
    let mut rules = BTreeMap::new();

    if devmode {
        // Allow most of ptrace for debugging, but the requests that can
        // overwrite the syscall number register would bypass seccomp
        // entirely.
        let poke_requests = [
            libc::PTRACE_POKEUSER,
            libc::PTRACE_SETREGS,
            libc::PTRACE_SETFPREGS,
            libc::PTRACE_SETREGSET,
        ];
        let mut ptrace_rules = Vec::new();
        for request in poke_requests {
            ptrace_rules.push(
                SeccompRule::new(vec![SeccompCondition::new(
                    0,
                    SeccompCmpArgLen::Qword,
                    SeccompCmpOp::Eq,
                    request as u64,
                )
                .context("while building a ptrace condition")?])
                .context("while building a ptrace rule")?,
            );
        }
        rules.insert(libc::SYS_ptrace, ptrace_rules);
    } else {
        rules.insert(libc::SYS_ptrace, vec![]);
    }

    rules.insert(
        libc::SYS_clone,
        vec![SeccompRule::new(vec![SeccompCondition::new(
            0,
            SeccompCmpArgLen::Qword,
            SeccompCmpOp::MaskedEq(libc::CLONE_NEWUSER as u64),
            libc::CLONE_NEWUSER as u64,
        )
        .context("while building the clone condition")?])
        .context("while building the clone rule")?],
    );

    compile(rules, libc::EPERM)
}

/// Restrict the set of allowable network protocol families.
fn eafnosupport_program() -> Result<BpfProgram> {
    let mut families: Vec<u64> = vec![
        libc::AF_AX25 as u64,
        libc::AF_IPX as u64,
        libc::AF_APPLETALK as u64,
        libc::AF_NETROM as u64,
        libc::AF_BRIDGE as u64,
        libc::AF_ATMPVC as u64,
        libc::AF_X25 as u64,
        libc::AF_ROSE as u64,
        libc::AF_DECnet as u64,
        libc::AF_NETBEUI as u64,
        libc::AF_SECURITY as u64,
        libc::AF_KEY as u64,
    ];
    families.sort_unstable();

    let mut socket_rules = vec![SeccompRule::new(vec![SeccompCondition::new(
        0,
        SeccompCmpArgLen::Dword,
        SeccompCmpOp::Ge,
        libc::AF_NETLINK as u64 + 1,
    )
    .context("while building the socket family bound")?])
    .context("while building the socket family rule")?];
    for family in families {
        socket_rules.push(
            SeccompRule::new(vec![SeccompCondition::new(
                0,
                SeccompCmpArgLen::Dword,
                SeccompCmpOp::Eq,
                family,
            )
            .context("while building a socket family condition")?])
            .context("while building a socket family rule")?,
        );
    }

    let mut rules = BTreeMap::new();
    rules.insert(libc::SYS_socket, socket_rules);
    compile(rules, libc::EAFNOSUPPORT)
}

pub fn build_programs(options: Options) -> Result<Vec<BpfProgram>> {
    Ok(vec![
        enosys_program()?,
        eperm_program(options.devmode)?,
        eafnosupport_program()?,
    ])
}

/// Compile and load the filter stack.
pub fn install(options: Options) -> Result<()> {
    let programs = build_programs(options)?;
    if options.dump {
        for (i, program) in programs.iter().enumerate() {
            tracing::debug!("seccomp program {}: {} instructions", i, program.len());
        }
    }
    for program in &programs {
        apply_filter(program).context("while loading a seccomp filter")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programs_compile() {
        let programs = build_programs(Options::default()).unwrap();
        assert_eq!(programs.len(), 3);
        for program in programs {
            assert!(!program.is_empty());
        }
    }

    #[test]
    fn devmode_programs_compile() {
        build_programs(Options {
            devmode: true,
            dump: false,
        })
        .unwrap();
    }
}
