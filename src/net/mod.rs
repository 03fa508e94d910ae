//! The network stack: packet buffers, Ethernet/ARP/IPv4 dispatch, ICMP
//! echo, UDP, TCP, and the socket table.
//!
//! Frames flow bottom-to-top on receive — the NIC hands each completed
//! buffer to `Net::rx` — and top-to-bottom on transmit, where headers are
//! composed in front of the payload and the frame is handed to the
//! device. Ethernet destinations are broadcast on transmit; ARP
//! resolution is out of scope on the bridged networks this runs on.

use core::mem;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::Once;
use zerocopy::{AsBytes, FromBytes};

mod e1000;
mod mbuf;
mod pci;
mod socket;
mod tcp;

pub use e1000::E1000;
pub use mbuf::{Mbuf, MbufPool, MBUF_SIZE};
pub use socket::{SocketTable, SOCK_DGRAM, SOCK_RAW, SOCK_STREAM};
pub use tcp::TcpState;

/// A device that can put one frame on the wire. Dropping the buffer when
/// the ring is full is acceptable; there is no retransmission here.
pub trait NetDevice: Sync {
    fn transmit(&self, m: Mbuf);
}

pub const ETHADDR_LEN: usize = 6;

pub const ETHTYPE_IP: u16 = 0x0800;
pub const ETHTYPE_ARP: u16 = 0x0806;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

const ARP_HRD_ETHER: u16 = 1;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;

const ICMP_ECHO_REPLY: u8 = 0;
const ICMP_ECHO_REQUEST: u8 = 8;

/// The station's address on the development bridge, network order.
pub const LOCAL_IP: u32 = htonl(0x0A00_0215); // 10.0.2.15
pub const LOCAL_MAC: [u8; ETHADDR_LEN] = [0x52, 0x54, 0x00, 0x12, 0x34, 0x56];
const BROADCAST_MAC: [u8; ETHADDR_LEN] = [0xFF; ETHADDR_LEN];

// Endianness conversion. Header fields always hold network-order values.

pub const fn htons(v: u16) -> u16 {
    v.to_be()
}

pub const fn ntohs(v: u16) -> u16 {
    u16::from_be(v)
}

pub const fn htonl(v: u32) -> u32 {
    v.to_be()
}

pub const fn ntohl(v: u32) -> u32 {
    u32::from_be(v)
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct EthHdr {
    pub dhost: [u8; ETHADDR_LEN],
    pub shost: [u8; ETHADDR_LEN],
    pub ethtype: u16,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct ArpHdr {
    hrd: u16,
    pro: u16,
    hln: u8,
    pln: u8,
    op: u16,
    sha: [u8; ETHADDR_LEN],
    sip: u32,
    tha: [u8; ETHADDR_LEN],
    tip: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct IpHdr {
    /// Version and header length.
    pub vhl: u8,
    pub tos: u8,
    pub len: u16,
    pub id: u16,
    pub off: u16,
    pub ttl: u8,
    pub p: u8,
    pub sum: u16,
    pub src: u32,
    pub dst: u32,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct IcmpHdr {
    pub typ: u8,
    pub code: u8,
    pub sum: u16,
    pub id: u16,
    pub seq: u16,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct UdpHdr {
    pub sport: u16,
    pub dport: u16,
    pub len: u16,
    pub sum: u16,
}

#[repr(C, packed)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct TcpHdr {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    /// Data offset in 32-bit words, in the high nibble.
    pub off: u8,
    pub flags: u8,
    pub win: u16,
    pub sum: u16,
    pub urp: u16,
}

/// Read a header out of the front of a byte slice.
pub fn read_hdr<T: AsBytes + FromBytes + Default>(bytes: &[u8]) -> Option<T> {
    if bytes.len() < mem::size_of::<T>() {
        return None;
    }
    let mut t = T::default();
    t.as_bytes_mut()
        .copy_from_slice(&bytes[..mem::size_of::<T>()]);
    Some(t)
}

/// Write a header into the front of a byte slice.
pub fn write_hdr<T: AsBytes>(bytes: &mut [u8], t: &T) {
    bytes[..mem::size_of::<T>()].copy_from_slice(t.as_bytes());
}

/// Internet ones-complement checksum over the given byte slices (all but
/// the last must be of even length). Store the result with `htons`.
pub fn checksum_parts(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    for part in parts {
        let mut chunks = part.chunks_exact(2);
        for w in &mut chunks {
            sum += u16::from_be_bytes([w[0], w[1]]) as u32;
        }
        if let [last] = chunks.remainder() {
            sum += (*last as u32) << 8;
        }
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn checksum(bytes: &[u8]) -> u16 {
    checksum_parts(&[bytes])
}

/// TCP checksum: the IP pseudo-header (source, destination, zero,
/// protocol, TCP length) followed by the TCP header and payload.
pub fn tcp_checksum(src: u32, dst: u32, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.to_ne_bytes());
    pseudo[4..8].copy_from_slice(&dst.to_ne_bytes());
    pseudo[9] = IP_PROTO_TCP;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    checksum_parts(&[&pseudo, segment])
}

pub struct Net {
    pub pool: MbufPool,

    pub(in crate::net) sockets: SocketTable,

    /// Initial-sequence-number source for new TCP connections.
    pub(in crate::net) tcp_iss: AtomicU32,

    device: Once<&'static dyn NetDevice>,

    pub e1000: E1000,
}

impl Net {
    pub const fn new() -> Self {
        Self {
            pool: MbufPool::new(),
            sockets: SocketTable::new(),
            tcp_iss: AtomicU32::new(1000),
            device: Once::new(),
            e1000: E1000::new(),
        }
    }

    /// Probe the NIC and wire it up as the stack's device. Boot only.
    pub fn init(&'static self) {
        self.e1000.init(&self.pool);
        let _ = self.device.call_once(|| &self.e1000 as &dyn NetDevice);
    }

    /// Use a different device; hosted tests bind an in-memory one.
    #[cfg(test)]
    pub fn bind_device(&self, device: &'static dyn NetDevice) {
        let _ = self.device.call_once(|| device);
    }

    pub(in crate::net) fn transmit(&self, m: Mbuf) {
        if let Some(device) = self.device.get() {
            device.transmit(m);
        }
    }

    /// Entry point for received frames, from the NIC interrupt.
    pub fn rx(&self, mut m: Mbuf) {
        let Some(eth) = read_hdr::<EthHdr>(m.data()) else {
            return;
        };
        m.pull(mem::size_of::<EthHdr>());

        match ntohs(eth.ethtype) {
            ETHTYPE_IP => self.ip_rx(m),
            ETHTYPE_ARP => self.arp_rx(m),
            _ => {}
        }
    }

    /// Answer ARP requests for the station IP.
    fn arp_rx(&self, m: Mbuf) {
        let Some(arp) = read_hdr::<ArpHdr>(m.data()) else {
            return;
        };

        if ntohs(arp.hrd) != ARP_HRD_ETHER
            || ntohs(arp.pro) != ETHTYPE_IP
            || arp.hln as usize != ETHADDR_LEN
            || arp.pln as usize != mem::size_of::<u32>()
        {
            return;
        }

        if ntohs(arp.op) == ARP_OP_REQUEST {
            let Some(mut reply) = self
                .pool
                .alloc(mem::size_of::<EthHdr>() + mem::size_of::<ArpHdr>())
            else {
                return;
            };

            let reply_arp = ArpHdr {
                hrd: htons(ARP_HRD_ETHER),
                pro: htons(ETHTYPE_IP),
                hln: ETHADDR_LEN as u8,
                pln: mem::size_of::<u32>() as u8,
                op: htons(ARP_OP_REPLY),
                sha: LOCAL_MAC,
                // We are the target: answer with the requested IP.
                sip: arp.tip,
                tha: arp.sha,
                tip: arp.sip,
            };
            write_hdr(reply.push(mem::size_of::<ArpHdr>()), &reply_arp);
            self.push_eth(&mut reply, arp.sha, ETHTYPE_ARP);
            self.transmit(reply);
        }
    }

    fn ip_rx(&self, mut m: Mbuf) {
        let Some(ip) = read_hdr::<IpHdr>(m.data()) else {
            return;
        };

        if ip.vhl >> 4 != 4 {
            return;
        }

        // IPv4 without options: a fixed 20-byte header.
        m.pull(mem::size_of::<IpHdr>());

        match ip.p {
            IP_PROTO_ICMP => self.icmp_rx(m, &ip),
            IP_PROTO_UDP => self.sockets.udp_rx(m, &ip),
            IP_PROTO_TCP => tcp::tcp_rx(self, m, &ip),
            _ => {}
        }
    }

    /// ICMP: deliver echo replies to raw sockets, answer echo requests.
    fn icmp_rx(&self, m: Mbuf, ip: &IpHdr) {
        let Some(icmp) = read_hdr::<IcmpHdr>(m.data()) else {
            return;
        };

        match icmp.typ {
            ICMP_ECHO_REPLY => {
                self.sockets.deliver_raw(m, ip.src);
            }
            ICMP_ECHO_REQUEST => {
                // Echo everything after the ICMP header back, with the
                // same id and sequence number.
                let icmp_len = m.len();
                let Some(mut reply) = self.pool.alloc(
                    mem::size_of::<EthHdr>() + mem::size_of::<IpHdr>() + icmp_len,
                ) else {
                    return;
                };

                reply
                    .put(icmp_len)
                    .copy_from_slice(m.data());
                let reply_icmp = IcmpHdr {
                    typ: ICMP_ECHO_REPLY,
                    code: 0,
                    sum: 0,
                    id: icmp.id,
                    seq: icmp.seq,
                };
                write_hdr(reply.data_mut(), &reply_icmp);
                let sum = htons(checksum(reply.data()));
                reply.data_mut()[2..4].copy_from_slice(&sum.to_ne_bytes());

                self.push_ip(&mut reply, IP_PROTO_ICMP, ip.dst, ip.src);
                self.push_eth(&mut reply, BROADCAST_MAC, ETHTYPE_IP);
                self.transmit(reply);
            }
            _ => {}
        }
    }

    /// Send an ICMP echo request, for raw sockets.
    pub(in crate::net) fn icmp_send(&self, dip: u32, id: u16, seq: u16, data: &[u8]) {
        let Some(mut m) = self.pool.alloc(
            mem::size_of::<EthHdr>() + mem::size_of::<IpHdr>() + mem::size_of::<IcmpHdr>() + data.len(),
        ) else {
            return;
        };

        m.put(mem::size_of::<IcmpHdr>() + data.len());
        let icmp = IcmpHdr {
            typ: ICMP_ECHO_REQUEST,
            code: 0,
            sum: 0,
            id: htons(id),
            seq: htons(seq),
        };
        write_hdr(m.data_mut(), &icmp);
        m.data_mut()[mem::size_of::<IcmpHdr>()..].copy_from_slice(data);
        let sum = htons(checksum(m.data()));
        m.data_mut()[2..4].copy_from_slice(&sum.to_ne_bytes());

        self.push_ip(&mut m, IP_PROTO_ICMP, LOCAL_IP, dip);
        self.push_eth(&mut m, BROADCAST_MAC, ETHTYPE_IP);
        self.transmit(m);
    }

    /// Send a UDP datagram.
    pub(in crate::net) fn udp_send(&self, dip: u32, sport: u16, dport: u16, data: &[u8]) {
        let Some(mut m) = self.pool.alloc(
            mem::size_of::<EthHdr>() + mem::size_of::<IpHdr>() + mem::size_of::<UdpHdr>() + data.len(),
        ) else {
            return;
        };

        m.put(data.len()).copy_from_slice(data);
        let udp = UdpHdr {
            sport: htons(sport),
            dport: htons(dport),
            len: htons((mem::size_of::<UdpHdr>() + data.len()) as u16),
            sum: 0,
        };
        write_hdr(m.push(mem::size_of::<UdpHdr>()), &udp);

        self.push_ip(&mut m, IP_PROTO_UDP, LOCAL_IP, dip);
        self.push_eth(&mut m, BROADCAST_MAC, ETHTYPE_IP);
        self.transmit(m);
    }

    /// Prepend the IPv4 header; `m` currently holds the transport
    /// segment.
    pub(in crate::net) fn push_ip(&self, m: &mut Mbuf, proto: u8, src: u32, dst: u32) {
        let total = mem::size_of::<IpHdr>() + m.len();
        let mut ip = IpHdr {
            vhl: (4 << 4) | 5,
            tos: 0,
            len: htons(total as u16),
            id: 0,
            off: 0,
            ttl: 64,
            p: proto,
            sum: 0,
            src,
            dst,
        };
        // The checksum covers the 20-byte header with the sum field zero.
        ip.sum = htons(checksum(&ip.as_bytes()[..mem::size_of::<IpHdr>()]));
        write_hdr(m.push(mem::size_of::<IpHdr>()), &ip);
    }

    /// Prepend the Ethernet header.
    pub(in crate::net) fn push_eth(&self, m: &mut Mbuf, dhost: [u8; ETHADDR_LEN], ethtype: u16) {
        let eth = EthHdr {
            dhost,
            shost: LOCAL_MAC,
            ethtype: htons(ethtype),
        };
        write_hdr(m.push(mem::size_of::<EthHdr>()), &eth);
    }

    // Socket-level operations, dispatched from the system-call layer.

    pub fn socket(&self, typ: i32) -> Result<i32, ()> {
        self.sockets.open(typ)
    }

    pub fn connect(&self, fd: i32, ip: u32, port: u16) -> Result<(), ()> {
        socket::connect(self, fd, ip, port)
    }

    pub fn send(&self, fd: i32, data: &[u8]) -> Result<usize, ()> {
        socket::send(self, fd, data)
    }

    pub fn recv(&self, fd: i32, dst: &mut [u8]) -> Result<usize, ()> {
        socket::recv(self, fd, dst)
    }

    pub fn close_socket(&self, fd: i32) -> Result<(), ()> {
        socket::close(self, fd)
    }
}
