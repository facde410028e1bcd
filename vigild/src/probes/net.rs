//! Ping reachability check.
//!
//! One raw ICMP socket per target, opened at startup (raw sockets need
//! the privileges we still have then). Each cycle sends up to
//! `ping-count` echo requests and accepts the first matching reply;
//! stray replies for other pingers on the same host are filtered by the
//! identifier field.
//!
//! Raw ICMP is not something the higher-level wrappers cover, so the
//! socket I/O is done directly against libc.

use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use vigil_common::config::Config;
use vigil_common::descriptor::{Descriptor, Payload};
use vigil_common::errcode::{EDONTKNOW, ENOERR};

use crate::device::WatchdogDevice;
use crate::probes::ProbeSetupError;

const ICMP_ECHO: u8 = 8;
const ICMP_ECHOREPLY: u8 = 0;
/// Echo payload bytes; 64-byte packets like every ping since the 4.3BSD one.
const DATA_LEN: usize = 56;

/// RFC 1071 internet checksum.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build one echo request with the given identifier and sequence.
pub fn build_echo_request(ident: u16, seq: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 8 + DATA_LEN];
    packet[0] = ICMP_ECHO;
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&seq.to_be_bytes());
    for (i, byte) in packet[8..].iter_mut().enumerate() {
        *byte = i as u8;
    }
    let sum = checksum(&packet);
    packet[2..4].copy_from_slice(&sum.to_be_bytes());
    packet
}

/// Extract the sequence number from a raw reply datagram (IP header
/// included) if it is an echo reply carrying our identifier.
pub fn parse_echo_reply(buf: &[u8], ident: u16) -> Option<u16> {
    let ihl = usize::from(buf.first()? & 0x0f) * 4;
    let icmp = buf.get(ihl..ihl + 8)?;
    if icmp[0] != ICMP_ECHOREPLY {
        return None;
    }
    if u16::from_be_bytes([icmp[4], icmp[5]]) != ident {
        return None;
    }
    Some(u16::from_be_bytes([icmp[6], icmp[7]]))
}

fn icmp_ident() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// Resolve the target and open its raw socket.
pub fn open(d: &mut Descriptor) -> Result<(), ProbeSetupError> {
    let addr: Ipv4Addr = d.name.parse().map_err(|e| ProbeSetupError::Resolve {
        target: d.name.clone(),
        reason: format!("{e}"),
    })?;

    // SAFETY: plain socket(2) call; the fd is owned immediately below.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_RAW, libc::IPPROTO_ICMP) };
    if fd < 0 {
        return Err(ProbeSetupError::Socket {
            target: d.name.clone(),
            source: std::io::Error::last_os_error(),
        });
    }
    // SAFETY: fd was just returned by socket(2) and is not owned elsewhere.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
    d.payload = Payload::Ping {
        addr,
        sock: Some(sock),
        seq: 0,
    };
    Ok(())
}

/// Drop the target's socket.
pub fn close(d: &mut Descriptor) {
    if let Payload::Ping { sock, .. } = &mut d.payload {
        *sock = None;
    }
}

fn send_request(fd: i32, addr: Ipv4Addr, packet: &[u8]) -> bool {
    // SAFETY: sockaddr_in is plain-old-data; all-zeros is valid.
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.octets());

    // SAFETY: packet and sa are valid for the duration of the call.
    let sent = unsafe {
        libc::sendto(
            fd,
            packet.as_ptr().cast(),
            packet.len(),
            0,
            std::ptr::addr_of!(sa).cast(),
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    sent == packet.len() as isize
}

fn await_reply(fd: i32, ident: u16, deadline: Instant) -> bool {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return false;
        }

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: pfd is valid for the duration of the call.
        let ready = unsafe { libc::poll(&mut pfd, 1, remaining.as_millis() as libc::c_int) };
        if ready == 0 {
            return false;
        }
        if ready < 0 {
            if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return false;
        }

        let mut buf = [0u8; 1500];
        // SAFETY: buf is valid and its length is passed along.
        let got = unsafe { libc::recv(fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
        if got <= 0 {
            return false;
        }
        if parse_echo_reply(&buf[..got as usize], ident).is_some() {
            return true;
        }
        // A reply for some other pinger; keep listening.
    }
}

/// Ping the target, accepting the first reply within the cycle budget.
pub fn check(device: &WatchdogDevice, d: &mut Descriptor, cfg: &Config) -> i32 {
    let name = d.name.clone();
    let Payload::Ping { addr, sock, seq } = &mut d.payload else {
        return ENOERR;
    };
    let Some(sock) = sock.as_ref() else {
        return EDONTKNOW;
    };

    let fd = sock.as_raw_fd();
    let ident = icmp_ident();
    let count = cfg.ping_count.max(1);
    let wait = Duration::from_millis(((cfg.interval.max(1) as u64 * 1000) / count as u64).max(1000));

    for attempt in 0..count {
        device.keep_alive();
        *seq = seq.wrapping_add(1);
        let packet = build_echo_request(ident, *seq);
        if !send_request(fd, *addr, &packet) {
            error!(
                "ping send to {name} failed ({})",
                std::io::Error::last_os_error()
            );
            continue;
        }
        if await_reply(fd, ident, Instant::now() + wait) {
            debug!("ping reply from {name} (attempt {})", attempt + 1);
            return ENOERR;
        }
    }

    error!("no response from ping (target: {name})");
    libc::ENETUNREACH
}

// ─── Tests ──────────────────────────────────────────────────────────
