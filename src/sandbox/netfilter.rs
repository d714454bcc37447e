/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The ip_tables setsockopt interface, straight from the kernel uapi headers:
//! a packed list of structs of varying types with internal offsets. There is
//! no libc coverage for these, so the layouts live here, `repr(C)` and
//! byte-for-byte what the kernel expects on 64-bit.
//!
//! [`install_redirect_rules`] replaces the contents of the `nat` table with a
//! minimal ruleset that rewrites every non-loopback IPv4 TCP/UDP packet the
//! sandbox emits to a single local port:
//!
//! ```text
//! iptables -t nat -A OUTPUT -p tcp -j DNAT --to 127.0.0.1:<port>
//! iptables -t nat -A OUTPUT -p udp -j DNAT --to 127.0.0.1:<port>
//! ```

use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;

use crate::wire;

const IPT_BASE_CTL: libc::c_int = 64;
const IPT_SO_SET_REPLACE: libc::c_int = IPT_BASE_CTL;
const IPT_SO_GET_INFO: libc::c_int = IPT_BASE_CTL;

const XT_TABLE_MAXNAMELEN: usize = 32;
const XT_EXTENSION_MAXNAMELEN: usize = 29;
const XT_FUNCTION_MAXNAMELEN: usize = 30;

const NF_INET_PRE_ROUTING: usize = 0;
const NF_INET_LOCAL_IN: usize = 1;
const NF_INET_FORWARD: usize = 2;
const NF_INET_LOCAL_OUT: usize = 3;
const NF_INET_POST_ROUTING: usize = 4;
const NF_INET_NUMHOOKS: usize = 5;

const NF_ACCEPT: i32 = 1;
/// Verdict encoding for standard targets.
const ACCEPT_VERDICT: i32 = -NF_ACCEPT - 1;

const NF_NAT_RANGE_MAP_IPS: u32 = 1 << 0;
const NF_NAT_RANGE_PROTO_SPECIFIED: u32 = 1 << 1;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct XtCounters {
    pub pcnt: u64,
    pub bcnt: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IptGetinfo {
    pub name: [u8; XT_TABLE_MAXNAMELEN],
    pub valid_hooks: u32,
    pub hook_entry: [u32; NF_INET_NUMHOOKS],
    pub underflow: [u32; NF_INET_NUMHOOKS],
    pub num_entries: u32,
    pub size: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IptReplace {
    pub name: [u8; XT_TABLE_MAXNAMELEN],
    pub valid_hooks: u32,
    pub num_entries: u32,
    pub size: u32,
    pub hook_entry: [u32; NF_INET_NUMHOOKS],
    pub underflow: [u32; NF_INET_NUMHOOKS],
    pub num_counters: u32,
    /// Userspace buffer the kernel writes the old entry counters into.
    pub counters: *mut XtCounters,
}

/// Packet match portion of an entry. All-zero matches everything.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct IptIp {
    pub src: u32,
    pub dst: u32,
    pub smsk: u32,
    pub dmsk: u32,
    pub iniface: [u8; 16],
    pub outiface: [u8; 16],
    pub iniface_mask: [u8; 16],
    pub outiface_mask: [u8; 16],
    pub proto: u16,
    pub flags: u8,
    pub invflags: u8,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct IptEntry {
    pub ip: IptIp,
    pub nfcache: u32,
    pub target_offset: u16,
    pub next_offset: u16,
    pub comefrom: u32,
    pub counters: XtCounters,
}

/// Header shared by every target; 8-aligned like the kernel union it stands
/// in for.
#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct XtEntryTarget {
    pub target_size: u16,
    pub name: [u8; XT_EXTENSION_MAXNAMELEN],
    pub revision: u8,
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct XtStandardTarget {
    pub target: XtEntryTarget,
    pub verdict: i32,
}

#[repr(C, align(8))]
#[derive(Clone, Copy)]
pub struct XtErrorTarget {
    pub target: XtEntryTarget,
    pub errorname: [u8; XT_FUNCTION_MAXNAMELEN],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NfNatIpv4Range {
    pub flags: u32,
    /// Network byte order.
    pub min_ip: u32,
    pub max_ip: u32,
    pub min_port: u16,
    pub max_port: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct NfNatIpv4MultiRangeCompat {
    pub rangesize: u32,
    pub range: [NfNatIpv4Range; 1],
}

fn copy_name(dst: &mut [u8], name: &str) {
    dst[..name.len()].copy_from_slice(name.as_bytes());
}

/// Read the existing layout of the nat table; required to fill out a valid
/// replace request.
pub fn read_nat_table_info(fd: RawFd) -> Result<IptGetinfo> {
    let mut info: IptGetinfo = unsafe { mem::zeroed() };
    copy_name(&mut info.name, "nat");
    let mut len = mem::size_of::<IptGetinfo>() as libc::socklen_t;
    Errno::result(unsafe {
        libc::getsockopt(
            fd,
            libc::IPPROTO_IP,
            IPT_SO_GET_INFO,
            &mut info as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })
    .context("while reading the nat table layout")?;
    ensure!(
        len as usize == mem::size_of::<IptGetinfo>(),
        "kernel returned a truncated nat table info"
    );
    Ok(info)
}

/// Append an entry with a standard accept verdict; `setup` fills in the
/// packet match, and an empty one accepts every packet.
fn add_accept_entry(
    msg: &mut wire::Message,
    setup: impl FnOnce(&mut IptEntry),
) -> wire::Slot<IptEntry> {
    let entry = msg.add::<IptEntry>();
    msg.update(entry, setup);
    let target = msg.add::<XtStandardTarget>();
    let target_size = msg.offset_to_end(target) as u16;
    msg.update(target, |t| {
        t.target.target_size = target_size;
        t.verdict = ACCEPT_VERDICT;
    });
    let target_offset = msg.offset_between(entry, target) as u16;
    let next_offset = msg.offset_to_end(entry) as u16;
    msg.update(entry, |e| {
        e.target_offset = target_offset;
        e.next_offset = next_offset;
    });
    entry
}

/// Append an entry that DNATs every packet of `proto` to 127.0.0.1:`port`.
fn add_dnat_entry(msg: &mut wire::Message, proto: u16, port: u16) -> wire::Slot<IptEntry> {
    let entry = msg.add::<IptEntry>();
    msg.update(entry, |e| e.ip.proto = proto);

    let target = msg.add::<XtEntryTarget>();
    let range = msg.add::<NfNatIpv4MultiRangeCompat>();
    msg.update(range, |r| {
        r.rangesize = 1;
        r.range[0].flags = NF_NAT_RANGE_PROTO_SPECIFIED | NF_NAT_RANGE_MAP_IPS;
        r.range[0].min_ip = u32::from(Ipv4Addr::LOCALHOST).to_be();
        r.range[0].max_ip = u32::from(Ipv4Addr::LOCALHOST).to_be();
        r.range[0].min_port = port.to_be();
        r.range[0].max_port = port.to_be();
    });

    let target_size = msg.offset_to_end(target) as u16;
    msg.update(target, |t| {
        t.target_size = target_size;
        copy_name(&mut t.name, "DNAT");
    });
    let target_offset = msg.offset_between(entry, target) as u16;
    let next_offset = msg.offset_to_end(entry) as u16;
    msg.update(entry, |e| {
        e.target_offset = target_offset;
        e.next_offset = next_offset;
    });
    entry
}

/// Build the replace request for the nat table.
///
/// Rule order: accept anything destined for 127.0.0.0/8, DNAT TCP, DNAT UDP,
/// accept everything, then the error sentinel every table ends with.
/// LOCAL_OUT enters at the accept-local rule; every other hook, and every
/// underflow, enters at the unconditional accept.
pub fn build_redirect_ruleset(
    info: &IptGetinfo,
    counters: *mut XtCounters,
    port: u16,
) -> Vec<u8> {
    let mut msg = wire::Message::with_alignment(8);

    let replace = msg.add::<IptReplace>();
    // The entries array begins directly after the replace header.
    let entries_base = msg.end();

    let accept_local = add_accept_entry(&mut msg, |e| {
        e.ip.dst = u32::from(Ipv4Addr::new(127, 0, 0, 0)).to_be();
        e.ip.dmsk = u32::from(Ipv4Addr::new(255, 0, 0, 0)).to_be();
    });
    add_dnat_entry(&mut msg, libc::IPPROTO_TCP as u16, port);
    add_dnat_entry(&mut msg, libc::IPPROTO_UDP as u16, port);
    let accept_all = add_accept_entry(&mut msg, |_| {});

    let error = msg.add::<IptEntry>();
    let error_target = msg.add::<XtErrorTarget>();
    let target_size = msg.offset_to_end(error_target) as u16;
    msg.update(error_target, |t| {
        t.target.target_size = target_size;
        copy_name(&mut t.target.name, "ERROR");
        copy_name(&mut t.errorname, "ERROR");
    });
    let target_offset = msg.offset_between(error, error_target) as u16;
    let next_offset = msg.offset_to_end(error) as u16;
    msg.update(error, |e| {
        e.target_offset = target_offset;
        e.next_offset = next_offset;
    });

    let accept_local_off = (accept_local.offset() - entries_base) as u32;
    let accept_all_off = (accept_all.offset() - entries_base) as u32;
    let entries_size = (msg.end() - entries_base) as u32;

    let valid_hooks = info.valid_hooks;
    let num_counters = info.num_entries;
    msg.update(replace, |r| {
        copy_name(&mut r.name, "nat");
        r.valid_hooks = valid_hooks;
        r.num_entries = 5;
        r.size = entries_size;
        r.num_counters = num_counters;
        r.counters = counters;
        r.hook_entry[NF_INET_PRE_ROUTING] = accept_all_off;
        r.hook_entry[NF_INET_LOCAL_IN] = accept_all_off;
        r.hook_entry[NF_INET_FORWARD] = accept_all_off;
        r.hook_entry[NF_INET_LOCAL_OUT] = accept_local_off;
        r.hook_entry[NF_INET_POST_ROUTING] = accept_all_off;
        for hook in 0..NF_INET_NUMHOOKS {
            r.underflow[hook] = accept_all_off;
        }
    });

    msg.finish()
}

/// Replace the nat table so all outbound TCP/UDP is rewritten to
/// 127.0.0.1:`port`. `fd` is an IPv4 datagram socket inside the sandbox's
/// network namespace.
pub fn install_redirect_rules(fd: RawFd, port: u16) -> Result<()> {
    let info = read_nat_table_info(fd)?;

    // The kernel insists on a place to write out the counters of the
    // existing entries, even though they are of no interest here.
    let mut old_counters =
        vec![XtCounters { pcnt: 0, bcnt: 0 }; info.num_entries as usize];
    let request = build_redirect_ruleset(&info, old_counters.as_mut_ptr(), port);

    Errno::result(unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            IPT_SO_SET_REPLACE,
            request.as_ptr() as *const libc::c_void,
            request.len() as libc::socklen_t,
        )
    })
    .context("while replacing the nat table")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_at<T: Copy>(buf: &[u8], offset: usize) -> T {
        assert!(offset + mem::size_of::<T>() <= buf.len());
        unsafe { (buf.as_ptr().add(offset) as *const T).read_unaligned() }
    }

    fn target_name(buf: &[u8], entry_off: usize, target_off: u16) -> String {
        let target: XtEntryTarget = read_at(buf, entry_off + target_off as usize);
        let len = target.name.iter().position(|&b| b == 0).unwrap();
        String::from_utf8(target.name[..len].to_vec()).unwrap()
    }

    fn fake_info() -> IptGetinfo {
        let mut info: IptGetinfo = unsafe { mem::zeroed() };
        info.name[..3].copy_from_slice(b"nat");
        // PRE_ROUTING | LOCAL_IN | LOCAL_OUT | POST_ROUTING, as the nat
        // table reports on current kernels.
        info.valid_hooks = 0b11011;
        info.num_entries = 4;
        info
    }

    #[test]
    fn layouts_match_the_kernel_abi() {
        assert_eq!(mem::size_of::<IptIp>(), 84);
        assert_eq!(mem::size_of::<IptEntry>(), 112);
        assert_eq!(mem::size_of::<XtEntryTarget>(), 32);
        assert_eq!(mem::size_of::<XtStandardTarget>(), 40);
        assert_eq!(mem::size_of::<XtErrorTarget>(), 64);
        assert_eq!(mem::size_of::<NfNatIpv4Range>(), 16);
        assert_eq!(mem::size_of::<NfNatIpv4MultiRangeCompat>(), 20);
        assert_eq!(mem::size_of::<IptGetinfo>(), 84);
        assert_eq!(mem::size_of::<IptReplace>(), 96);
    }

    #[test]
    fn ruleset_walks_cleanly() {
        let info = fake_info();
        let buf = build_redirect_ruleset(&info, std::ptr::null_mut(), 23136);

        let replace: IptReplace = read_at(&buf, 0);
        assert_eq!(&replace.name[..4], b"nat\0");
        assert_eq!(replace.valid_hooks, info.valid_hooks);
        assert_eq!(replace.num_entries, 5);
        assert_eq!(replace.num_counters, info.num_entries);

        let entries_base = mem::size_of::<IptReplace>();
        assert_eq!(replace.size as usize, buf.len() - entries_base);

        // Walk the chain by next_offset and collect every entry boundary.
        let mut offsets = Vec::new();
        let mut pos = entries_base;
        while pos < buf.len() {
            let entry: IptEntry = read_at(&buf, pos);
            assert!(entry.target_offset as usize >= mem::size_of::<IptEntry>());
            assert!(entry.next_offset > entry.target_offset);
            let target: XtEntryTarget = read_at(&buf, pos + entry.target_offset as usize);
            assert_eq!(
                entry.target_offset + target.target_size,
                entry.next_offset,
                "target must fill the entry exactly"
            );
            offsets.push(pos - entries_base);
            pos += entry.next_offset as usize;
        }
        assert_eq!(pos, buf.len());
        assert_eq!(offsets.len(), 5);

        // accept-local, DNAT tcp, DNAT udp, accept-all, error.
        let accept_local: IptEntry = read_at(&buf, entries_base + offsets[0]);
        assert_eq!(accept_local.ip.dst, u32::from(Ipv4Addr::new(127, 0, 0, 0)).to_be());
        assert_eq!(accept_local.ip.dmsk, u32::from(Ipv4Addr::new(255, 0, 0, 0)).to_be());

        let tcp: IptEntry = read_at(&buf, entries_base + offsets[1]);
        assert_eq!(tcp.ip.proto, libc::IPPROTO_TCP as u16);
        assert_eq!(target_name(&buf, entries_base + offsets[1], tcp.target_offset), "DNAT");
        let udp: IptEntry = read_at(&buf, entries_base + offsets[2]);
        assert_eq!(udp.ip.proto, libc::IPPROTO_UDP as u16);

        let error: IptEntry = read_at(&buf, entries_base + offsets[4]);
        assert_eq!(target_name(&buf, entries_base + offsets[4], error.target_offset), "ERROR");
    }

    #[test]
    fn standard_targets_satisfy_the_kernel_size_check() {
        // For a standard (empty-named) target the kernel requires
        // target_offset + sizeof(xt_standard_target) == next_offset.
        let buf = build_redirect_ruleset(&fake_info(), std::ptr::null_mut(), 23136);
        let entries_base = mem::size_of::<IptReplace>();
        let first: IptEntry = read_at(&buf, entries_base);
        assert_eq!(
            first.target_offset as usize + mem::size_of::<XtStandardTarget>(),
            first.next_offset as usize,
        );
    }

    #[test]
    fn dnat_target_size_covers_the_aligned_range() {
        // The DNAT extension declares a 20-byte targinfo; the kernel checks
        // target_size == sizeof(header) + XT_ALIGN(20).
        let buf = build_redirect_ruleset(&fake_info(), std::ptr::null_mut(), 23136);
        let entries_base = mem::size_of::<IptReplace>();
        let first: IptEntry = read_at(&buf, entries_base);
        let tcp_off = entries_base + first.next_offset as usize;
        let tcp: IptEntry = read_at(&buf, tcp_off);
        let target: XtEntryTarget = read_at(&buf, tcp_off + tcp.target_offset as usize);
        assert_eq!(target.target_size as usize, mem::size_of::<XtEntryTarget>() + 24);

        let range: NfNatIpv4MultiRangeCompat = read_at(
            &buf,
            tcp_off + tcp.target_offset as usize + mem::size_of::<XtEntryTarget>(),
        );
        assert_eq!(range.rangesize, 1);
        assert_eq!(range.range[0].min_ip, u32::from(Ipv4Addr::LOCALHOST).to_be());
        assert_eq!(range.range[0].min_port, 23136u16.to_be());
        assert_eq!(
            range.range[0].flags,
            NF_NAT_RANGE_MAP_IPS | NF_NAT_RANGE_PROTO_SPECIFIED
        );
    }

    #[test]
    fn hooks_enter_at_the_right_rules() {
        let buf = build_redirect_ruleset(&fake_info(), std::ptr::null_mut(), 23136);
        let replace: IptReplace = read_at(&buf, 0);

        // Everything but LOCAL_OUT skips straight to the accept-all rule,
        // which is also the underflow for every hook.
        assert_eq!(replace.hook_entry[NF_INET_LOCAL_OUT], 0);
        let accept_all = replace.hook_entry[NF_INET_PRE_ROUTING];
        assert!(accept_all > 0);
        assert_eq!(replace.hook_entry[NF_INET_LOCAL_IN], accept_all);
        assert_eq!(replace.hook_entry[NF_INET_FORWARD], accept_all);
        assert_eq!(replace.hook_entry[NF_INET_POST_ROUTING], accept_all);
        for hook in 0..NF_INET_NUMHOOKS {
            assert_eq!(replace.underflow[hook], accept_all);
        }
    }
}
