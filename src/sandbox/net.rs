/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The private network namespace the app runs in.
//!
//! The app is given what looks like ordinary IPv4 networking: a loopback
//! interface, a dummy interface with an address, and a default route through
//! it. The dummy interface never carries a packet; it exists so the kernel
//! believes external packets have a legal exit, at which point the nat rules
//! (see [`crate::sandbox::netfilter`]) rewrite everything non-loopback to a
//! single local port where a gateway proxies it according to policy.

use std::io::IoSlice;
use std::mem;
use std::net::Ipv4Addr;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;

use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use nix::errno::Errno;
use nix::sched::unshare;
use nix::sched::CloneFlags;
use nix::sys::socket::sendmsg;
use nix::sys::socket::setsockopt;
use nix::sys::socket::socket;
use nix::sys::socket::sockopt;
use nix::sys::socket::AddressFamily;
use nix::sys::socket::MsgFlags;
use nix::sys::socket::NetlinkAddr;
use nix::sys::socket::SockFlag;
use nix::sys::socket::SockProtocol;
use nix::sys::socket::SockType;

use crate::sandbox::netfilter;
use crate::wire;

/// Where all of the app's outbound TCP/UDP traffic ends up.
pub const REDIRECT_PORT: u16 = 23136;

const DUMMY_IFNAME: &str = "dummy0";
const DUMMY_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 250, 2);
/// Any address in 192.168.250.0/24 would do; the interface is never really
/// transited.
const GATEWAY_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 250, 1);

/// Netlink message layouts. libc covers `sockaddr_nl` but not these.
mod nl {
    pub const NLMSG_ALIGNTO: usize = 4;

    pub const NLM_F_REQUEST: u16 = 0x001;
    pub const NLM_F_ACK: u16 = 0x004;
    pub const NLM_F_EXCL: u16 = 0x200;
    pub const NLM_F_CREATE: u16 = 0x400;

    pub const NLMSG_ERROR: u16 = 0x2;
    pub const RTM_NEWLINK: u16 = 16;

    pub const IFLA_IFNAME: u16 = 3;
    pub const IFLA_LINKINFO: u16 = 18;
    pub const IFLA_INFO_KIND: u16 = 1;

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct NlMsgHdr {
        pub nlmsg_len: u32,
        pub nlmsg_type: u16,
        pub nlmsg_flags: u16,
        pub nlmsg_seq: u32,
        pub nlmsg_pid: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct IfInfoMsg {
        pub ifi_family: u8,
        pub ifi_pad: u8,
        pub ifi_type: u16,
        pub ifi_index: i32,
        pub ifi_flags: u32,
        pub ifi_change: u32,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct RtAttr {
        pub rta_len: u16,
        pub rta_type: u16,
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    pub struct NlMsgErr {
        pub error: i32,
        pub msg: NlMsgHdr,
    }
}

fn ifreq_for(name: &str) -> libc::ifreq {
    let mut req: libc::ifreq = unsafe { mem::zeroed() };
    debug_assert!(name.len() < req.ifr_name.len());
    for (dst, src) in req.ifr_name.iter_mut().zip(name.as_bytes()) {
        *dst = *src as libc::c_char;
    }
    req
}

/// Assign `addr` to the interface and bring it up with the given flags.
fn configure_interface(fd: RawFd, name: &str, addr: Ipv4Addr, flags: libc::c_int) -> Result<()> {
    let mut req = ifreq_for(name);
    {
        // ifr_ifru is a union; the address request wants a sockaddr_in in it.
        let sin = unsafe { &mut *(&mut req.ifr_ifru as *mut _ as *mut libc::sockaddr_in) };
        sin.sin_family = libc::AF_INET as libc::sa_family_t;
        sin.sin_addr.s_addr = u32::from(addr).to_be();
    }
    Errno::result(unsafe { libc::ioctl(fd, libc::SIOCSIFADDR, &req) })
        .with_context(|| format!("while setting the address of {}", name))?;

    let mut req = ifreq_for(name);
    req.ifr_ifru.ifru_flags = flags as libc::c_short;
    Errno::result(unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &req) })
        .with_context(|| format!("while bringing up {}", name))?;
    Ok(())
}

/// Create an interface named `dummy0` of type `dummy` with a raw rtnetlink
/// request, then check the kernel's ack.
fn create_dummy_interface() -> Result<()> {
    let sock = socket(
        AddressFamily::Netlink,
        SockType::Raw,
        SockFlag::empty(),
        SockProtocol::NetlinkRoute,
    )
    .context("while opening a netlink socket")?;
    setsockopt(&sock, sockopt::SndBuf, &32768).context("while sizing the netlink send buffer")?;
    setsockopt(&sock, sockopt::RcvBuf, &1048576)
        .context("while sizing the netlink receive buffer")?;

    let mut msg = wire::Message::with_alignment(nl::NLMSG_ALIGNTO);

    let header = msg.add::<nl::NlMsgHdr>();
    msg.update(header, |h| {
        h.nlmsg_type = nl::RTM_NEWLINK;
        h.nlmsg_flags = nl::NLM_F_REQUEST | nl::NLM_F_ACK | nl::NLM_F_CREATE | nl::NLM_F_EXCL;
    });

    msg.add::<nl::IfInfoMsg>(); // left zeroed

    let ifname_attr = msg.add::<nl::RtAttr>();
    msg.update(ifname_attr, |a| {
        a.rta_len = (mem::size_of::<nl::RtAttr>() + DUMMY_IFNAME.len() + 1) as u16;
        a.rta_type = nl::IFLA_IFNAME;
    });
    msg.add_str(DUMMY_IFNAME);

    let linkinfo_attr = msg.add::<nl::RtAttr>();
    msg.update(linkinfo_attr, |a| a.rta_type = nl::IFLA_LINKINFO);

    // IFLA_LINKINFO nests another attribute; its string value is not
    // NUL-terminated.
    let kind_attr = msg.add::<nl::RtAttr>();
    msg.update(kind_attr, |a| {
        a.rta_len = (mem::size_of::<nl::RtAttr>() + "dummy".len()) as u16;
        a.rta_type = nl::IFLA_INFO_KIND;
    });
    msg.add_bytes(b"dummy");

    let linkinfo_len = msg.offset_to_end(linkinfo_attr) as u16;
    msg.update(linkinfo_attr, |a| a.rta_len = linkinfo_len);
    let total_len = msg.offset_to_end(header) as u32;
    msg.update(header, |h| h.nlmsg_len = total_len);

    let request = msg.finish();
    let kernel = NetlinkAddr::new(0, 0);
    sendmsg(
        sock.as_raw_fd(),
        &[IoSlice::new(&request)],
        &[],
        MsgFlags::empty(),
        Some(&kernel),
    )
    .context("while sending the netlink link request")?;

    let mut reply = [0u8; 1024];
    let n = nix::sys::socket::recv(sock.as_raw_fd(), &mut reply, MsgFlags::empty())
        .context("while reading the netlink ack")?;
    ensure!(
        n >= mem::size_of::<nl::NlMsgHdr>() + mem::size_of::<nl::NlMsgErr>(),
        "truncated netlink ack"
    );
    let header: nl::NlMsgHdr = unsafe { (reply.as_ptr() as *const nl::NlMsgHdr).read_unaligned() };
    ensure!(
        header.nlmsg_type == nl::NLMSG_ERROR,
        "unexpected netlink reply type {}",
        header.nlmsg_type
    );
    let err: nl::NlMsgErr = unsafe {
        (reply.as_ptr().add(mem::size_of::<nl::NlMsgHdr>()) as *const nl::NlMsgErr)
            .read_unaligned()
    };
    if err.error != 0 {
        return Err(Errno::from_raw(-err.error))
            .context("netlink refused to create the dummy interface");
    }
    Ok(())
}

/// Route external addresses through dummy0 so the nat rules get a crack at
/// them.
fn add_default_route(fd: RawFd) -> Result<()> {
    let mut route: libc::rtentry = unsafe { mem::zeroed() };
    route.rt_flags = libc::RTF_UP | libc::RTF_GATEWAY;
    route.rt_dst.sa_family = libc::AF_INET as libc::sa_family_t;
    {
        let gateway = unsafe { &mut *(&mut route.rt_gateway as *mut _ as *mut libc::sockaddr_in) };
        gateway.sin_family = libc::AF_INET as libc::sa_family_t;
        gateway.sin_addr.s_addr = u32::from(GATEWAY_ADDR).to_be();
    }
    Errno::result(unsafe { libc::ioctl(fd, libc::SIOCADDRT, &route) })
        .context("while adding the default route")?;
    Ok(())
}

/// Enter a new network namespace and set it up.
///
/// `is_iptables_available` must have been probed before the sandbox was
/// constructed; without the ip_tables module the redirection rules cannot be
/// installed, so only loopback comes up and outbound connections fail from
/// the app's own stack.
pub fn setup(is_iptables_available: bool) -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNET).context("while unsharing the network namespace")?;

    let sock = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::empty(),
        None,
    )
    .context("while opening a socket for interface ioctls")?;
    let fd = sock.as_raw_fd();

    configure_interface(
        fd,
        "lo",
        Ipv4Addr::LOCALHOST,
        libc::IFF_LOOPBACK | libc::IFF_UP | libc::IFF_RUNNING,
    )?;

    if !is_iptables_available {
        tracing::warn!(
            "ip_tables kernel module not loaded; cannot set up transparent network forwarding"
        );
        return Ok(());
    }

    create_dummy_interface()?;
    configure_interface(
        fd,
        DUMMY_IFNAME,
        DUMMY_ADDR,
        libc::IFF_UP | libc::IFF_RUNNING,
    )?;
    add_default_route(fd)?;
    netfilter::install_redirect_rules(fd, REDIRECT_PORT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netlink_request_layout() {
        // Rebuild the link request the way create_dummy_interface does and
        // check the attribute chain parses back.
        let mut msg = wire::Message::with_alignment(nl::NLMSG_ALIGNTO);
        let header = msg.add::<nl::NlMsgHdr>();
        msg.add::<nl::IfInfoMsg>();
        let ifname_attr = msg.add::<nl::RtAttr>();
        msg.update(ifname_attr, |a| {
            a.rta_len = (mem::size_of::<nl::RtAttr>() + DUMMY_IFNAME.len() + 1) as u16;
            a.rta_type = nl::IFLA_IFNAME;
        });
        msg.add_str(DUMMY_IFNAME);
        let linkinfo_attr = msg.add::<nl::RtAttr>();
        msg.update(linkinfo_attr, |a| a.rta_type = nl::IFLA_LINKINFO);
        let kind_attr = msg.add::<nl::RtAttr>();
        msg.update(kind_attr, |a| {
            a.rta_len = (mem::size_of::<nl::RtAttr>() + "dummy".len()) as u16;
            a.rta_type = nl::IFLA_INFO_KIND;
        });
        msg.add_bytes(b"dummy");
        let linkinfo_len = msg.offset_to_end(linkinfo_attr) as u16;
        msg.update(linkinfo_attr, |a| a.rta_len = linkinfo_len);
        let total = msg.offset_to_end(header) as u32;
        msg.update(header, |h| h.nlmsg_len = total);

        let ifname_off = ifname_attr.offset();
        let linkinfo_off = linkinfo_attr.offset();
        let bytes = msg.finish();

        assert_eq!(bytes.len() as u32, total);
        // Attributes start right after the two fixed headers.
        assert_eq!(
            ifname_off,
            mem::size_of::<nl::NlMsgHdr>() + mem::size_of::<nl::IfInfoMsg>()
        );
        // The name attribute's aligned length lands exactly on IFLA_LINKINFO.
        let ifname: nl::RtAttr = unsafe {
            (bytes.as_ptr().add(ifname_off) as *const nl::RtAttr).read_unaligned()
        };
        let aligned = (ifname.rta_len as usize + 3) & !3;
        assert_eq!(ifname_off + aligned, linkinfo_off);
        // The nested LINKINFO attribute covers everything through the end.
        let linkinfo: nl::RtAttr = unsafe {
            (bytes.as_ptr().add(linkinfo_off) as *const nl::RtAttr).read_unaligned()
        };
        assert_eq!(linkinfo_off + linkinfo.rta_len as usize, bytes.len());
        // And the name payload is where the kernel will look for it.
        let name_start = ifname_off + mem::size_of::<nl::RtAttr>();
        assert_eq!(&bytes[name_start..name_start + 7], b"dummy0\0");
    }
}
