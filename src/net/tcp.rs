//! The TCP state machine, an RFC 793 subset.
//!
//! Each socket carries snd.una, snd.nxt, rcv.nxt, iss and irs plus the
//! connection state; transitions run on received segments. Outbound
//! segments always carry snd.nxt as the sequence number and (when ACK is
//! set) rcv.nxt as the acknowledgement; snd.nxt advances by one for SYN
//! and FIN and by the payload length otherwise. Retransmission and
//! windowing are out of scope: the advertised window is a constant and no
//! timers run.

use core::mem;
use core::sync::atomic::Ordering;

use super::socket::{Socket, SOCK_STREAM};
use super::{
    htonl, htons, ntohl, ntohs, read_hdr, tcp_checksum, write_hdr, IpHdr, Mbuf, Net, TcpHdr,
    BROADCAST_MAC, ETHTYPE_IP, IP_PROTO_TCP,
};

pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

/// Advertised receive window; no flow control is attempted.
const TCP_WINDOW: u16 = 8192;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

/// Compose and transmit one segment for `sock`, advancing snd.nxt.
/// The socket table lock is held by the caller.
pub(super) fn tcp_send(net: &Net, sock: &mut Socket, flags: u8, data: &[u8]) {
    let Some(mut m) = net.pool.alloc(
        mem::size_of::<super::EthHdr>() + mem::size_of::<IpHdr>() + mem::size_of::<TcpHdr>()
            + data.len(),
    ) else {
        return;
    };

    m.put(data.len()).copy_from_slice(data);
    let tcp = TcpHdr {
        sport: sock.local_port,
        dport: sock.remote_port,
        seq: htonl(sock.snd_nxt),
        ack: if flags & TCP_ACK != 0 {
            htonl(sock.rcv_nxt)
        } else {
            0
        },
        off: ((mem::size_of::<TcpHdr>() / 4) as u8) << 4,
        flags,
        win: htons(TCP_WINDOW),
        sum: 0,
        urp: 0,
    };
    write_hdr(m.push(mem::size_of::<TcpHdr>()), &tcp);

    let sum = htons(tcp_checksum(sock.local_ip, sock.remote_ip, m.data()));
    m.data_mut()[16..18].copy_from_slice(&sum.to_ne_bytes());

    net.push_ip(&mut m, IP_PROTO_TCP, sock.local_ip, sock.remote_ip);
    net.push_eth(&mut m, BROADCAST_MAC, ETHTYPE_IP);

    // SYN and FIN each consume one sequence number; data consumes its
    // length.
    if flags & TCP_SYN != 0 {
        sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
    }
    if flags & TCP_FIN != 0 {
        sock.snd_nxt = sock.snd_nxt.wrapping_add(1);
    }
    sock.snd_nxt = sock.snd_nxt.wrapping_add(data.len() as u32);

    net.transmit(m);
}

/// Handle a received TCP segment: demultiplex to a stream socket and run
/// the state machine.
pub(super) fn tcp_rx(net: &Net, mut m: Mbuf, ip: &IpHdr) {
    let Some(tcp) = read_hdr::<TcpHdr>(m.data()) else {
        return;
    };

    let seq = ntohl(tcp.seq);
    let ack = ntohl(tcp.ack);
    let flags = tcp.flags;
    let header_len = ((tcp.off >> 4) as usize) * 4;

    let mut sockets = net.sockets.lock();
    for (i, sock) in sockets.iter_mut().enumerate() {
        if !sock.used || sock.typ != SOCK_STREAM {
            continue;
        }
        if sock.local_port != tcp.dport
            || (sock.remote_port != 0 && sock.remote_port != tcp.sport)
            || (sock.remote_ip != 0 && sock.remote_ip != ip.src)
        {
            continue;
        }

        let mut wake = false;
        match sock.state {
            TcpState::Closed => {}

            TcpState::Listen => {
                if flags & TCP_SYN != 0 {
                    sock.remote_ip = ip.src;
                    sock.remote_port = tcp.sport;
                    sock.rcv_nxt = seq.wrapping_add(1);
                    sock.irs = seq;
                    sock.iss = net.tcp_iss.fetch_add(1, Ordering::Relaxed);
                    sock.snd_nxt = sock.iss;
                    sock.state = TcpState::SynReceived;
                    tcp_send(net, sock, TCP_SYN | TCP_ACK, &[]);
                }
            }

            TcpState::SynSent => {
                if flags & (TCP_SYN | TCP_ACK) == TCP_SYN | TCP_ACK {
                    sock.rcv_nxt = seq.wrapping_add(1);
                    sock.irs = seq;
                    sock.snd_una = ack;
                    sock.state = TcpState::Established;
                    tcp_send(net, sock, TCP_ACK, &[]);
                    wake = true;
                } else if flags & TCP_SYN != 0 {
                    // Simultaneous open.
                    sock.rcv_nxt = seq.wrapping_add(1);
                    sock.irs = seq;
                    sock.state = TcpState::SynReceived;
                    tcp_send(net, sock, TCP_ACK, &[]);
                }
            }

            TcpState::SynReceived => {
                if flags & TCP_ACK != 0 {
                    sock.snd_una = ack;
                    sock.state = TcpState::Established;
                    wake = true;
                }
            }

            TcpState::Established => {
                if flags & TCP_FIN != 0 {
                    sock.rcv_nxt = seq.wrapping_add(1);
                    sock.state = TcpState::CloseWait;
                    tcp_send(net, sock, TCP_ACK, &[]);
                    wake = true;
                } else if flags & TCP_ACK != 0 {
                    sock.snd_una = ack;

                    // Deliver in-order payload into the single receive
                    // slot and acknowledge it.
                    let data_len = m.len().saturating_sub(header_len);
                    if data_len > 0 && seq == sock.rcv_nxt {
                        m.pull(header_len);
                        sock.rxq = Some(m);
                        sock.rcv_nxt = sock.rcv_nxt.wrapping_add(data_len as u32);
                        tcp_send(net, sock, TCP_ACK, &[]);
                        net.sockets.channels[i].wakeup();
                        return;
                    }
                }
            }

            TcpState::FinWait1 => {
                if flags & TCP_FIN != 0 {
                    sock.rcv_nxt = seq.wrapping_add(1);
                    tcp_send(net, sock, TCP_ACK, &[]);
                    sock.state = if flags & TCP_ACK != 0 {
                        TcpState::TimeWait
                    } else {
                        TcpState::Closing
                    };
                } else if flags & TCP_ACK != 0 {
                    sock.state = TcpState::FinWait2;
                }
            }

            TcpState::FinWait2 => {
                if flags & TCP_FIN != 0 {
                    sock.rcv_nxt = seq.wrapping_add(1);
                    tcp_send(net, sock, TCP_ACK, &[]);
                    sock.state = TcpState::TimeWait;
                }
            }

            TcpState::CloseWait => {
                // Waiting for the application to close.
            }

            TcpState::Closing => {
                if flags & TCP_ACK != 0 {
                    sock.state = TcpState::TimeWait;
                }
            }

            TcpState::LastAck => {
                if flags & TCP_ACK != 0 {
                    sock.state = TcpState::Closed;
                    sock.used = false;
                }
            }

            TcpState::TimeWait => {
                // No 2MSL timer runs; leave immediately.
                sock.state = TcpState::Closed;
                sock.used = false;
            }
        }

        if wake {
            net.sockets.channels[i].wakeup();
        }
        return;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use zerocopy::AsBytes;

    use super::super::socket::{connect_start_locked, try_recv};
    use super::super::{
        checksum, EthHdr, IcmpHdr, NetDevice, UdpHdr, ETHTYPE_ARP, ICMP_ECHO_REPLY,
        ICMP_ECHO_REQUEST, LOCAL_IP,
    };
    use super::*;

    /// Captures transmitted frames for inspection.
    struct MockDevice {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    impl MockDevice {
        fn new() -> Self {
            Self {
                frames: Mutex::new(Vec::new()),
            }
        }

        fn pop(&self) -> Option<Vec<u8>> {
            let mut frames = self.frames.lock().unwrap();
            if frames.is_empty() {
                None
            } else {
                Some(frames.remove(0))
            }
        }
    }

    impl NetDevice for MockDevice {
        fn transmit(&self, m: Mbuf) {
            self.frames.lock().unwrap().push(m.data().to_vec());
        }
    }

    fn test_net() -> (&'static Net, &'static MockDevice) {
        let net = Box::leak(Box::new(Net::new()));
        let dev = Box::leak(Box::new(MockDevice::new()));
        net.bind_device(dev);
        (net, dev)
    }

    const ETH: usize = mem::size_of::<EthHdr>();
    const IP: usize = mem::size_of::<IpHdr>();
    const TCP: usize = mem::size_of::<TcpHdr>();

    /// Wrap a transport segment in Ethernet+IP and feed it to the stack.
    fn feed_ip(net: &Net, proto: u8, src: u32, payload: &[u8]) {
        let mut m = net.pool.alloc(ETH + IP).unwrap();
        m.put(payload.len()).copy_from_slice(payload);
        net.push_ip(&mut m, proto, src, LOCAL_IP);
        net.push_eth(&mut m, [0x02; 6], super::super::ETHTYPE_IP);
        net.rx(m);
    }

    fn parse_tcp(frame: &[u8]) -> (TcpHdr, Vec<u8>) {
        let tcp: TcpHdr = read_hdr(&frame[ETH + IP..]).unwrap();
        let data = frame[ETH + IP + TCP..].to_vec();
        (tcp, data)
    }

    fn make_tcp(src_ip: u32, sport: u16, dport: u16, seq: u32, ack: u32, flags: u8, data: &[u8]) -> Vec<u8> {
        let tcp = TcpHdr {
            sport,
            dport,
            seq: htonl(seq),
            ack: htonl(ack),
            off: ((TCP / 4) as u8) << 4,
            flags,
            win: htons(8192),
            sum: 0,
            urp: 0,
        };
        let mut seg = tcp.as_bytes().to_vec();
        seg.extend_from_slice(data);
        let sum = htons(tcp_checksum(src_ip, LOCAL_IP, &seg));
        seg[16..18].copy_from_slice(&sum.to_ne_bytes());
        seg
    }

    const PEER_IP: u32 = htonl(0x0A00_0202); // 10.0.2.2

    #[test]
    fn handshake_data_and_fin_sequence_numbers() {
        let (net, dev) = test_net();

        let fd = net.socket(SOCK_STREAM).unwrap();
        let (iss, local_port) = {
            let mut sockets = net.sockets.lock();
            let idx = connect_start_locked(net, &mut sockets, fd, PEER_IP, 7).unwrap();
            (sockets[idx].iss, sockets[idx].local_port)
        };

        // The SYN went out with seq = iss, and snd.nxt advanced by one.
        let syn = dev.pop().expect("no SYN sent");
        let (tcp, _) = parse_tcp(&syn);
        assert_eq!(tcp.flags, TCP_SYN);
        assert_eq!(ntohl(tcp.seq), iss);
        {
            let sockets = net.sockets.lock();
            assert_eq!(sockets[fd as usize].snd_nxt, iss.wrapping_add(1));
            assert_eq!(sockets[fd as usize].state, TcpState::SynSent);
        }

        // Server answers SYN|ACK.
        let srv_iss = 5000u32;
        let seg = make_tcp(
            PEER_IP,
            htons(7),
            local_port,
            srv_iss,
            iss.wrapping_add(1),
            TCP_SYN | TCP_ACK,
            &[],
        );
        feed_ip(net, IP_PROTO_TCP, PEER_IP, &seg);

        // The stack acknowledged and is established, with matching
        // sequence variables on both sides.
        let ack = dev.pop().expect("no ACK sent");
        let (tcp, _) = parse_tcp(&ack);
        assert_eq!(tcp.flags, TCP_ACK);
        assert_eq!(ntohl(tcp.ack), srv_iss.wrapping_add(1));
        {
            let sockets = net.sockets.lock();
            let s = &sockets[fd as usize];
            assert_eq!(s.state, TcpState::Established);
            assert_eq!(s.snd_nxt, iss.wrapping_add(1));
            assert_eq!(s.rcv_nxt, srv_iss.wrapping_add(1));
            assert!(s.snd_una <= s.snd_nxt);
        }

        // send("hi") advances snd.nxt by the payload length.
        assert_eq!(net.send(fd, b"hi"), Ok(2));
        let data_seg = dev.pop().expect("no data sent");
        let (tcp, payload) = parse_tcp(&data_seg);
        assert_eq!(payload, b"hi");
        assert_eq!(ntohl(tcp.seq), iss.wrapping_add(1));
        {
            let sockets = net.sockets.lock();
            assert_eq!(sockets[fd as usize].snd_nxt, iss.wrapping_add(3));
        }

        // Server echoes two bytes; they land in the receive slot and are
        // acknowledged.
        let seg = make_tcp(
            PEER_IP,
            htons(7),
            local_port,
            srv_iss.wrapping_add(1),
            iss.wrapping_add(3),
            TCP_ACK,
            b"hi",
        );
        feed_ip(net, IP_PROTO_TCP, PEER_IP, &seg);

        let ack = dev.pop().expect("no data ACK sent");
        let (tcp, _) = parse_tcp(&ack);
        assert_eq!(tcp.flags, TCP_ACK);
        assert_eq!(ntohl(tcp.ack), srv_iss.wrapping_add(3));

        let mut buf = [0u8; 16];
        assert_eq!(try_recv(net, fd, &mut buf), Ok(2));
        assert_eq!(&buf[..2], b"hi");

        // close sends FIN (one more sequence number) and moves to
        // FIN_WAIT_1.
        assert_eq!(net.close_socket(fd), Ok(()));
        let fin = dev.pop().expect("no FIN sent");
        let (tcp, _) = parse_tcp(&fin);
        assert!(tcp.flags & TCP_FIN != 0);
        {
            let sockets = net.sockets.lock();
            assert_eq!(sockets[fd as usize].state, TcpState::FinWait1);
            assert_eq!(sockets[fd as usize].snd_nxt, iss.wrapping_add(4));
        }
    }

    #[test]
    fn listen_accepts_a_syn() {
        let (net, dev) = test_net();

        let fd = net.socket(SOCK_STREAM).unwrap();
        let local_port = {
            let mut sockets = net.sockets.lock();
            let idx = fd as usize;
            sockets[idx].local_port = htons(80);
            sockets[idx].state = TcpState::Listen;
            sockets[idx].local_port
        };

        let seg = make_tcp(PEER_IP, htons(3000), local_port, 42, 0, TCP_SYN, &[]);
        feed_ip(net, IP_PROTO_TCP, PEER_IP, &seg);

        let synack = dev.pop().expect("no SYN|ACK sent");
        let (tcp, _) = parse_tcp(&synack);
        assert_eq!(tcp.flags, TCP_SYN | TCP_ACK);
        assert_eq!(ntohl(tcp.ack), 43);
        {
            let sockets = net.sockets.lock();
            assert_eq!(sockets[fd as usize].state, TcpState::SynReceived);
            assert_eq!(sockets[fd as usize].rcv_nxt, 43);
        }

        // The final ACK of the handshake establishes the connection.
        let seg = make_tcp(PEER_IP, htons(3000), local_port, 43, 1001, TCP_ACK, &[]);
        feed_ip(net, IP_PROTO_TCP, PEER_IP, &seg);
        {
            let sockets = net.sockets.lock();
            assert_eq!(sockets[fd as usize].state, TcpState::Established);
        }
    }

    #[test]
    fn established_fin_enters_close_wait_and_acks() {
        let (net, dev) = test_net();

        let fd = net.socket(SOCK_STREAM).unwrap();
        let local_port = {
            let mut sockets = net.sockets.lock();
            let idx =
                connect_start_locked(net, &mut sockets, fd, PEER_IP, 7).unwrap();
            sockets[idx].local_port
        };
        let _ = dev.pop(); // SYN

        let iss_plus = {
            let sockets = net.sockets.lock();
            sockets[fd as usize].snd_nxt
        };
        let seg = make_tcp(PEER_IP, htons(7), local_port, 9000, iss_plus, TCP_SYN | TCP_ACK, &[]);
        feed_ip(net, IP_PROTO_TCP, PEER_IP, &seg);
        let _ = dev.pop(); // ACK

        let seg = make_tcp(PEER_IP, htons(7), local_port, 9001, iss_plus, TCP_FIN, &[]);
        feed_ip(net, IP_PROTO_TCP, PEER_IP, &seg);

        let ack = dev.pop().expect("FIN not acknowledged");
        let (tcp, _) = parse_tcp(&ack);
        assert_eq!(tcp.flags, TCP_ACK);
        assert_eq!(ntohl(tcp.ack), 9002);
        {
            let sockets = net.sockets.lock();
            assert_eq!(sockets[fd as usize].state, TcpState::CloseWait);
        }
    }

    #[test]
    fn arp_request_gets_a_reply_with_requested_ip() {
        let (net, dev) = test_net();

        let req = super::super::ArpHdr {
            hrd: htons(1),
            pro: htons(super::super::ETHTYPE_IP),
            hln: 6,
            pln: 4,
            op: htons(1),
            sha: [0x02; 6],
            sip: PEER_IP,
            tha: [0; 6],
            tip: LOCAL_IP,
        };
        let mut m = net.pool.alloc(ETH).unwrap();
        m.put(mem::size_of::<super::super::ArpHdr>())
            .copy_from_slice(req.as_bytes());
        net.push_eth(&mut m, [0xFF; 6], ETHTYPE_ARP);
        net.rx(m);

        let frame = dev.pop().expect("no ARP reply");
        let reply: super::super::ArpHdr = read_hdr(&frame[ETH..]).unwrap();
        assert_eq!(ntohs(reply.op), 2);
        // The reply's sender IP is the request's target IP.
        assert_eq!({ reply.sip }, LOCAL_IP);
        assert_eq!({ reply.tip }, PEER_IP);
        assert_eq!(reply.tha, [0x02; 6]);
    }

    #[test]
    fn icmp_echo_round_trip_preserves_id_seq_payload() {
        let (net, dev) = test_net();

        let payload = b"ox6 ping payload";
        let icmp = IcmpHdr {
            typ: ICMP_ECHO_REQUEST,
            code: 0,
            sum: 0,
            id: htons(0x1234),
            seq: htons(7),
        };
        let mut seg = icmp.as_bytes().to_vec();
        seg.extend_from_slice(payload);
        let sum = htons(checksum(&seg));
        seg[2..4].copy_from_slice(&sum.to_ne_bytes());

        feed_ip(net, super::super::IP_PROTO_ICMP, PEER_IP, &seg);

        let frame = dev.pop().expect("no echo reply");
        let reply: IcmpHdr = read_hdr(&frame[ETH + IP..]).unwrap();
        assert_eq!(reply.typ, ICMP_ECHO_REPLY);
        assert_eq!({ reply.id }, htons(0x1234));
        assert_eq!({ reply.seq }, htons(7));
        assert_eq!(&frame[ETH + IP + mem::size_of::<IcmpHdr>()..], payload);

        // And the reply checksum verifies.
        assert_eq!(checksum(&frame[ETH + IP..]), 0);
    }

    #[test]
    fn udp_demux_replaces_unread_datagram() {
        let (net, _dev) = test_net();

        let fd = net.socket(super::super::SOCK_DGRAM).unwrap();
        let local_port = {
            let mut sockets = net.sockets.lock();
            connect_start_locked(net, &mut sockets, fd, PEER_IP, 9999).unwrap();
            sockets[fd as usize].local_port
        };

        for pay in [&b"first"[..], &b"second"[..]] {
            let udp = UdpHdr {
                sport: htons(9999),
                dport: local_port,
                len: htons((mem::size_of::<UdpHdr>() + pay.len()) as u16),
                sum: 0,
            };
            let mut seg = udp.as_bytes().to_vec();
            seg.extend_from_slice(pay);
            feed_ip(net, super::super::IP_PROTO_UDP, PEER_IP, &seg);
        }

        // The second datagram replaced the first in the single slot.
        let mut buf = [0u8; 32];
        assert_eq!(try_recv(net, fd, &mut buf), Ok(6));
        assert_eq!(&buf[..6], b"second");
        assert!(try_recv(net, fd, &mut buf).is_err());
    }

    #[test]
    fn checksum_is_ones_complement() {
        // A header whose checksum field is filled verifies to zero.
        let mut hdr = [0u8; 20];
        hdr[0] = 0x45;
        hdr[9] = 17;
        let sum = checksum(&hdr);
        hdr[10..12].copy_from_slice(&htons(sum).to_ne_bytes());
        assert_eq!(checksum(&hdr), 0);
    }
}
