use std::{
    io::ErrorKind,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::network::codec::{self, MAX_MESSAGE_SIZE};
use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::{network::messages::Message, NonBlockingSocket};

/// Large enough for any datagram a peer may send us, including foreign traffic we will reject.
const RECV_BUFFER_SIZE: usize = 4096;
/// A packet larger than this may be fragmented, so ideally we wouldn't send packets larger than
/// this.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A simple non-blocking UDP socket to use with Rampart Rollback sessions.
///
/// Outbound messages are framed with [`codec::encode`]. Inbound datagrams that fail
/// [`codec::decode`] are logged and dropped; the protocol never sees them.
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
    /// Receive buffer - reused across recv_from calls
    recv_buffer: Box<[u8; RECV_BUFFER_SIZE]>,
    /// Datagrams that failed to decode since the socket was created.
    malformed: u64,
}

impl UdpNonBlockingSocket {
    /// Binds an UDP Socket to 0.0.0.0:port and set it to non-blocking mode.
    pub fn bind_to_port(port: u16) -> Result<Self, std::io::Error> {
        Self::bind_to(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds to an explicit local address and sets the socket to non-blocking mode.
    pub fn bind_to(addr: SocketAddr) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            recv_buffer: Box::new([0; RECV_BUFFER_SIZE]),
            malformed: 0,
        })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.socket.local_addr()
    }

    /// Number of received datagrams that were dropped because they did not decode.
    #[must_use]
    pub fn malformed_count(&self) -> u64 {
        self.malformed
    }

    fn send_encoded_packet(&self, buf: &[u8], addr: &SocketAddr) {
        // Large datagrams fragment, and any lost fragment loses the whole packet. They come from
        // oversized inputs or a long unacknowledged window, which is worth telling the user about.
        if buf.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::NetworkProtocol,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                buf.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }

        // UDP is best-effort; a failed send is just another lost packet.
        if let Err(e) = self.socket.send_to(buf, addr) {
            tracing::debug!(%addr, error = %e, "failed to send UDP packet");
        }
    }
}

impl NonBlockingSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
        match codec::encode(msg) {
            Ok(buf) => {
                debug_assert!(buf.len() <= MAX_MESSAGE_SIZE);
                self.send_encoded_packet(&buf, addr);
            },
            Err(e) => {
                report_violation!(
                    ViolationSeverity::Error,
                    ViolationKind::Encoding,
                    "Failed to serialize message: {}",
                    e
                );
            },
        }
    }

    fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
        // Pre-allocate for typical case of 1-4 messages per poll
        let mut received_messages = Vec::with_capacity(4);
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((number_of_bytes, src_addr)) => {
                    let Some(datagram) = self.recv_buffer.get(..number_of_bytes) else {
                        continue;
                    };
                    match codec::decode(datagram) {
                        Ok(msg) => received_messages.push((src_addr, msg)),
                        Err(e) => {
                            self.malformed += 1;
                            tracing::debug!(
                                addr = %src_addr,
                                bytes = number_of_bytes,
                                error = %e,
                                "dropping malformed datagram"
                            );
                        },
                    }
                },
                // there are no more messages
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return received_messages,
                // datagram socket sometimes get this error as a result of calling the send_to method
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_violation!(
                        ViolationSeverity::Error,
                        ViolationKind::NetworkProtocol,
                        "Unexpected socket error: {:?}: {}",
                        err.kind(),
                        err
                    );
                    return received_messages;
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::network::messages::{MessageBody, MessageHeader, QualityReply};

    // UDP delivery timing varies across platforms, so poll a few times.
    #[track_caller]
    fn wait_for_messages(
        socket: &mut UdpNonBlockingSocket,
        expected_count: usize,
        max_retries: u32,
    ) -> Vec<(SocketAddr, Message)> {
        let mut all_received = Vec::new();
        for _ in 0..max_retries {
            all_received.extend(socket.receive_all_messages());
            if all_received.len() >= expected_count {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        all_received
    }

    fn loopback_socket() -> (UdpNonBlockingSocket, SocketAddr) {
        let socket =
            UdpNonBlockingSocket::bind_to(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
                .unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn keep_alive(magic: u16, sequence: u16) -> Message {
        Message {
            header: MessageHeader { magic, sequence },
            body: MessageBody::KeepAlive,
        }
    }

    #[test]
    fn test_udp_socket_is_non_blocking() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        assert!(socket.receive_all_messages().is_empty());
        assert!(socket.receive_all_messages().is_empty());
    }

    #[test]
    fn test_udp_socket_send_and_receive() {
        let (mut socket1, addr1) = loopback_socket();
        let (mut socket2, addr2) = loopback_socket();

        let msg = Message {
            header: MessageHeader {
                magic: 0x1234,
                sequence: 9,
            },
            body: MessageBody::QualityReply(QualityReply { pong: 77 }),
        };
        socket1.send_to(&msg, &addr2);

        let received = wait_for_messages(&mut socket2, 1, 20);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, addr1);
        assert_eq!(received[0].1, msg);
    }

    #[test]
    fn test_udp_socket_receive_multiple_messages() {
        let (mut socket1, _) = loopback_socket();
        let (mut socket2, addr2) = loopback_socket();

        socket1.send_to(&keep_alive(0x1111, 1), &addr2);
        socket1.send_to(&keep_alive(0x1111, 2), &addr2);

        let received = wait_for_messages(&mut socket2, 2, 20);
        assert_eq!(received.len(), 2);
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        let (mut socket, addr) = loopback_socket();
        let raw = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();

        // Unknown type code, then a valid keepalive.
        raw.send_to(&[0xEE, 0, 0, 0, 0, 0], addr).unwrap();
        raw.send_to(&codec::encode(&keep_alive(5, 1)).unwrap(), addr)
            .unwrap();

        let received = wait_for_messages(&mut socket, 1, 20);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, keep_alive(5, 1));
        assert_eq!(socket.malformed_count(), 1);
    }

    #[test]
    fn test_udp_socket_send_to_invalid_address() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let invalid_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        // Logged, never panics.
        socket.send_to(&keep_alive(0x1234, 0), &invalid_addr);
    }

    #[test]
    #[allow(clippy::assertions_on_constants)]
    fn test_buffer_sizes_relationship() {
        assert!(RECV_BUFFER_SIZE >= MAX_MESSAGE_SIZE);
        assert!(MAX_MESSAGE_SIZE > IDEAL_MAX_UDP_PACKET_SIZE);
    }
}
