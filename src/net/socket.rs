//! The socket table: user-visible endpoints for UDP datagrams, raw ICMP
//! flows, and TCP connections.
//!
//! Each socket has a single receive slot: a newly demultiplexed packet
//! replaces an unread one. Receivers sleep on the socket's wait channel;
//! the interrupt-side demux wakes them.

use core::mem;

use super::tcp::{self, TcpState};
use super::{IpHdr, Mbuf, Net, UdpHdr};
use crate::lock::{Spinlock, SpinlockGuard};
use crate::param::NSOCK;
use crate::proc::{myproc, WaitChannel};

pub const SOCK_DGRAM: i32 = 1;
pub const SOCK_STREAM: i32 = 2;
pub const SOCK_RAW: i32 = 3;

/// First ephemeral local port; the socket index is added to it.
const EPHEMERAL_BASE: u16 = 10000;

pub(super) struct Socket {
    pub used: bool,
    pub typ: i32,

    // Addresses and ports are kept in network order.
    pub local_ip: u32,
    pub local_port: u16,
    pub remote_ip: u32,
    pub remote_port: u16,

    /// Single-slot receive queue.
    pub rxq: Option<Mbuf>,

    /// TCP connection state.
    pub state: TcpState,

    // TCP sequence variables.
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub rcv_nxt: u32,
    pub iss: u32,
    pub irs: u32,
}

impl Socket {
    const fn closed() -> Self {
        Self {
            used: false,
            typ: 0,
            local_ip: 0,
            local_port: 0,
            remote_ip: 0,
            remote_port: 0,
            rxq: None,
            state: TcpState::Closed,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            iss: 0,
            irs: 0,
        }
    }
}

pub struct SocketTable {
    pub(super) sockets: Spinlock<[Socket; NSOCK]>,

    /// One wait channel per socket, for receive and connect waiters.
    pub(super) channels: [WaitChannel; NSOCK],
}

impl SocketTable {
    pub const fn new() -> Self {
        Self {
            sockets: Spinlock::new("sockets", [const { Socket::closed() }; NSOCK]),
            channels: [const { WaitChannel::new() }; NSOCK],
        }
    }

    /// Allocate a socket of the given type; the descriptor is the table
    /// index.
    pub fn open(&self, typ: i32) -> Result<i32, ()> {
        if typ != SOCK_DGRAM && typ != SOCK_STREAM && typ != SOCK_RAW {
            return Err(());
        }
        let mut sockets = self.sockets.lock();
        for (i, s) in sockets.iter_mut().enumerate() {
            if !s.used {
                *s = Socket::closed();
                s.used = true;
                s.typ = typ;
                s.local_ip = super::LOCAL_IP;
                return Ok(i as i32);
            }
        }
        Err(())
    }

    pub(super) fn lock(&self) -> SpinlockGuard<'_, [Socket; NSOCK]> {
        self.sockets.lock()
    }

    /// Demultiplex a UDP datagram by destination port. The datagram
    /// replaces any previous unread one; the sender's address is recorded
    /// for the reply path.
    pub(super) fn udp_rx(&self, mut m: Mbuf, ip: &IpHdr) {
        let Some(udp) = super::read_hdr::<UdpHdr>(m.data()) else {
            return;
        };

        let mut sockets = self.sockets.lock();
        for (i, s) in sockets.iter_mut().enumerate() {
            if s.used && s.typ == SOCK_DGRAM && s.local_port == udp.dport {
                m.pull(mem::size_of::<UdpHdr>());
                s.rxq = Some(m);
                s.remote_ip = ip.src;
                s.remote_port = udp.sport;
                self.channels[i].wakeup();
                return;
            }
        }
    }

    /// Deliver an ICMP echo reply to a raw socket whose remote address is
    /// unset or matches the sender. The first match wins.
    pub(super) fn deliver_raw(&self, m: Mbuf, src: u32) {
        let mut sockets = self.sockets.lock();
        for (i, s) in sockets.iter_mut().enumerate() {
            if s.used && s.typ == SOCK_RAW && (s.remote_ip == 0 || s.remote_ip == src) {
                s.rxq = Some(m);
                self.channels[i].wakeup();
                return;
            }
        }
    }
}

fn check_fd(sockets: &[Socket; NSOCK], fd: i32) -> Result<usize, ()> {
    let idx = usize::try_from(fd).map_err(|_| ())?;
    if idx >= NSOCK || !sockets[idx].used {
        return Err(());
    }
    Ok(idx)
}

/// Bind the remote address and, for stream sockets, run the three-way
/// handshake: send SYN, then sleep until the connection is established.
pub(super) fn connect(net: &Net, fd: i32, ip: u32, port: u16) -> Result<(), ()> {
    let mut sockets = net.sockets.lock();
    let idx = connect_start_locked(net, &mut sockets, fd, ip, port)?;

    if sockets[idx].typ == SOCK_STREAM {
        loop {
            match sockets[idx].state {
                TcpState::Established => break,
                TcpState::Closed => return Err(()),
                _ => {
                    let p = myproc();
                    // SAFETY: null-checked; p is the current process.
                    if !p.is_null() && unsafe { (*p).killed() } {
                        return Err(());
                    }
                    net.sockets.channels[idx].sleep(&mut sockets);
                }
            }
        }
    }
    Ok(())
}

/// The non-waiting half of connect: record the peer and send the SYN.
/// Split out so the state machine can be driven without a scheduler.
pub(super) fn connect_start_locked(
    net: &Net,
    sockets: &mut [Socket; NSOCK],
    fd: i32,
    ip: u32,
    port: u16,
) -> Result<usize, ()> {
    let idx = check_fd(sockets, fd)?;
    let s = &mut sockets[idx];

    s.remote_ip = ip;
    s.remote_port = super::htons(port);
    s.local_port = super::htons(EPHEMERAL_BASE + idx as u16);

    if s.typ == SOCK_STREAM {
        use core::sync::atomic::Ordering;
        s.iss = net.tcp_iss.fetch_add(1, Ordering::Relaxed);
        s.snd_nxt = s.iss;
        s.snd_una = s.iss;
        s.state = TcpState::SynSent;
        tcp::tcp_send(net, s, tcp::TCP_SYN, &[]);
    }
    Ok(idx)
}

/// Send on a socket: a datagram for UDP, a data segment for an
/// established TCP connection, or an echo request (leading four bytes are
/// id and sequence) for a raw socket.
pub(super) fn send(net: &Net, fd: i32, data: &[u8]) -> Result<usize, ()> {
    if data.len() > 1500 {
        return Err(());
    }

    let mut sockets = net.sockets.lock();
    let idx = check_fd(&sockets, fd)?;
    let s = &mut sockets[idx];

    match s.typ {
        SOCK_DGRAM => {
            let (dip, sport, dport) = (s.remote_ip, s.local_port, s.remote_port);
            drop(sockets);
            net.udp_send(dip, super::ntohs(sport), super::ntohs(dport), data);
            Ok(data.len())
        }
        SOCK_STREAM => {
            if s.state != TcpState::Established {
                return Err(());
            }
            tcp::tcp_send(net, s, tcp::TCP_ACK | tcp::TCP_PSH, data);
            Ok(data.len())
        }
        SOCK_RAW => {
            if data.len() < 4 {
                return Err(());
            }
            let id = u16::from_be_bytes([data[0], data[1]]);
            let seq = u16::from_be_bytes([data[2], data[3]]);
            let dip = s.remote_ip;
            drop(sockets);
            net.icmp_send(dip, id, seq, &data[4..]);
            Ok(data.len())
        }
        _ => Err(()),
    }
}

/// Blocking receive: sleep until the socket's single receive slot fills,
/// then copy out at most `dst.len()` bytes.
pub(super) fn recv(net: &Net, fd: i32, dst: &mut [u8]) -> Result<usize, ()> {
    let mut sockets = net.sockets.lock();
    let idx = check_fd(&sockets, fd)?;

    loop {
        if let Some(m) = sockets[idx].rxq.take() {
            let n = m.len().min(dst.len());
            dst[..n].copy_from_slice(&m.data()[..n]);
            return Ok(n);
        }
        let p = myproc();
        // SAFETY: null-checked; p is the current process.
        if !p.is_null() && unsafe { (*p).killed() } {
            return Err(());
        }
        net.sockets.channels[idx].sleep(&mut sockets);
    }
}

/// The non-waiting half of recv, for contexts that must not sleep.
#[cfg(test)]
pub(super) fn try_recv(net: &Net, fd: i32, dst: &mut [u8]) -> Result<usize, ()> {
    let mut sockets = net.sockets.lock();
    let idx = check_fd(&sockets, fd)?;
    match sockets[idx].rxq.take() {
        Some(m) => {
            let n = m.len().min(dst.len());
            dst[..n].copy_from_slice(&m.data()[..n]);
            Ok(n)
        }
        None => Err(()),
    }
}

/// Close a socket. An established stream starts an orderly shutdown by
/// sending FIN and entering FIN_WAIT_1; the table entry is reclaimed when
/// the state machine reaches CLOSED.
pub(super) fn close(net: &Net, fd: i32) -> Result<(), ()> {
    let mut sockets = net.sockets.lock();
    let idx = check_fd(&sockets, fd)?;
    let s = &mut sockets[idx];

    if s.typ == SOCK_STREAM {
        match s.state {
            TcpState::Established => {
                tcp::tcp_send(net, s, tcp::TCP_FIN | tcp::TCP_ACK, &[]);
                s.state = TcpState::FinWait1;
                s.rxq = None;
                return Ok(());
            }
            TcpState::CloseWait => {
                tcp::tcp_send(net, s, tcp::TCP_FIN | tcp::TCP_ACK, &[]);
                s.state = TcpState::LastAck;
                s.rxq = None;
                return Ok(());
            }
            _ => {}
        }
    }

    s.rxq = None;
    s.used = false;
    s.state = TcpState::Closed;
    Ok(())
}
