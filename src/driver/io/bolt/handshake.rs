use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use rustls::ClientConfig;
use socket2::{Socket as Socket2, TcpKeepalive};

use super::super::deadline::DeadlineIO;
use super::socket::{BufTcpStream, Socket};
use super::{BoltConnection, TcpConnection};
use crate::address::Address;
use crate::driver::config::KeepAliveConfig;
use crate::error::{DriverError, Result};

const BOLT_MAGIC_PREAMBLE: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];
const BOLT_VERSION_OFFER: [u8; 16] = [
    0, 0, 0, 5, // BOLT 5.0
    0, 0, 4, 4, // BOLT 4.4
    0, 0, 0, 3, // BOLT 3
    0, 0, 0, 0, // -
];

/// Establish a connection to `address`: TCP connect, socket options, optional
/// TLS, then the Bolt version handshake.
pub(crate) fn open(
    address: Arc<Address>,
    deadline: Option<Instant>,
    connect_timeout: Option<Duration>,
    keep_alive: Option<KeepAliveConfig>,
    tls_config: Option<Arc<ClientConfig>>,
) -> Result<TcpConnection> {
    debug!("C: <OPEN> {address}");
    let raw_socket = DriverError::wrap_connect(connect(&address, deadline, connect_timeout))?;
    let raw_socket = set_tcp_keepalive(raw_socket, keep_alive).map_err(|err| {
        DriverError::invalid_config(format!("failed to set tcp keepalive: {err}"))
    })?;
    let local_port = raw_socket
        .local_addr()
        .map(|addr| addr.port())
        .unwrap_or_default();

    let buffered = BufTcpStream::new(&raw_socket)?;
    let mut stream = Socket::new(buffered, address.unresolved_host(), tls_config)?;

    let version = {
        let mut io = DeadlineIO::new(&mut stream, deadline, Some(&raw_socket));

        debug!("C: <MAGIC> {BOLT_MAGIC_PREAMBLE:02X?}");
        let res = io.write_all(&BOLT_MAGIC_PREAMBLE);
        let res = io.rewrite_error(DriverError::wrap_write(res));
        wrap_socket_io(&raw_socket, res)?;

        debug!("C: <HANDSHAKE> {BOLT_VERSION_OFFER:02X?}");
        let res = io.write_all(&BOLT_VERSION_OFFER);
        let res = io.rewrite_error(DriverError::wrap_write(res));
        wrap_socket_io(&raw_socket, res)?;

        let res = io.flush();
        let res = io.rewrite_error(DriverError::wrap_write(res));
        wrap_socket_io(&raw_socket, res)?;

        let mut chosen = [0u8; 4];
        let res = io.read_exact(&mut chosen);
        let res = io.rewrite_error(DriverError::wrap_read(res));
        wrap_socket_io(&raw_socket, res)?;
        debug!("S: <HANDSHAKE> {chosen:02X?}");
        wrap_socket_io(&raw_socket, decode_version_offer(&chosen))?
    };

    Ok(BoltConnection::new(
        version,
        stream,
        Arc::new(Some(raw_socket)),
        Some(local_port),
        address,
    ))
}

fn connect(
    address: &Address,
    deadline: Option<Instant>,
    connect_timeout: Option<Duration>,
) -> io::Result<TcpStream> {
    match combined_connect_timeout(connect_timeout, deadline) {
        None => TcpStream::connect(address),
        Some(_) => each_addr(address, |addr| {
            let timeout = combined_connect_timeout(connect_timeout, deadline)
                .expect("timeout cannot disappear");
            TcpStream::connect_timeout(addr?, timeout)
        }),
    }
}

fn combined_connect_timeout(
    connect_timeout: Option<Duration>,
    deadline: Option<Instant>,
) -> Option<Duration> {
    let time_left = deadline.map(|deadline| {
        deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .unwrap_or(Duration::from_nanos(1))
    });
    match (connect_timeout, time_left) {
        (None, None) => None,
        (Some(timeout), None) => Some(timeout),
        (None, Some(left)) => Some(left),
        (Some(timeout), Some(left)) => Some(timeout.min(left)),
    }
}

// mirrors the fallback logic of std::net::TcpStream::connect over all
// resolved addresses
fn each_addr<A: ToSocketAddrs, F, T>(addr: A, mut f: F) -> io::Result<T>
where
    F: FnMut(io::Result<&SocketAddr>) -> io::Result<T>,
{
    let addrs = match addr.to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(e) => return f(Err(e)),
    };
    let mut last_err = None;
    for addr in addrs {
        match f(Ok(&addr)) {
            Ok(l) => return Ok(l),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any addresses",
        )
    }))
}

fn set_tcp_keepalive(
    socket: TcpStream,
    keep_alive: Option<KeepAliveConfig>,
) -> io::Result<TcpStream> {
    let keep_alive = match keep_alive {
        None => return Ok(socket),
        Some(KeepAliveConfig::Default) => TcpKeepalive::new(),
        Some(KeepAliveConfig::CustomTime(time)) => TcpKeepalive::new().with_time(time),
    };
    let socket = Socket2::from(socket);
    socket.set_tcp_keepalive(&keep_alive)?;
    Ok(socket.into())
}

fn wrap_socket_io<T>(socket: &TcpStream, res: Result<T>) -> Result<T> {
    match res {
        Ok(res) => Ok(res),
        Err(err) => {
            debug!("  closing socket because {}", &err);
            let _ = socket.shutdown(Shutdown::Both);
            Err(err)
        }
    }
}

// [bolt-version-support] keep in sync with BOLT_VERSION_OFFER
fn decode_version_offer(offer: &[u8; 4]) -> Result<(u8, u8)> {
    match offer {
        [0, 0, 0, 0] => Err(DriverError::invalid_config("server version not supported")),
        [_, _, 0, 5] => Ok((5, 0)),
        [_, _, 4, 4] => Ok((4, 4)),
        [_, _, 0, 3] => Ok((3, 0)),
        [72, 84, 84, 80] => {
            // "HTTP"
            Err(DriverError::invalid_config(format!(
                "unexpected server handshake response {offer:?} (looks like HTTP)"
            )))
        }
        _ => Err(DriverError::invalid_config(format!(
            "unexpected server handshake response {offer:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    // [bolt-version-support] keep in sync with BOLT_VERSION_OFFER
    #[rstest]
    #[case([0, 0, 0, 3], (3, 0))]
    #[case([0, 0, 4, 4], (4, 4))]
    #[case([0, 0, 0, 5], (5, 0))]
    fn decode_offered_versions(
        #[case] mut offer: [u8; 4],
        #[case] expected: (u8, u8),
        #[values([0, 0], [1, 2], [255, 254])] garbage: [u8; 2],
    ) {
        offer[0..2].copy_from_slice(&garbage);
        assert_eq!(decode_version_offer(&offer).unwrap(), expected);
    }

    #[test]
    fn zero_reply_means_unsupported() {
        let res = decode_version_offer(&[0, 0, 0, 0]);
        let Err(DriverError::InvalidConfig { message }) = res else {
            panic!("expected InvalidConfig error, got {res:?}");
        };
        assert!(message.contains("server version not supported"));
    }

    #[test]
    fn http_reply_is_called_out() {
        let res = decode_version_offer(b"HTTP");
        let Err(DriverError::InvalidConfig { message }) = res else {
            panic!("expected InvalidConfig error, got {res:?}");
        };
        assert!(message.contains("looks like HTTP"));
    }

    #[rstest]
    #[case([0, 0, 0, 1])]
    #[case([0, 0, 0, 2])]
    #[case([0, 0, 0, 4])] // 4.0 was not offered
    #[case([0, 0, 3, 4])] // 4.3 was not offered
    #[case([0, 0, 1, 5])] // 5.1 was not offered
    #[case([0, 0, 0, 6])]
    fn unoffered_versions_are_rejected(#[case] offer: [u8; 4]) {
        let res = decode_version_offer(&offer);
        let Err(DriverError::InvalidConfig { message }) = res else {
            panic!("expected InvalidConfig error, got {res:?}");
        };
        assert!(message.contains("unexpected server handshake response"));
    }

    #[test]
    fn offer_starts_with_magic_layout() {
        assert_eq!(BOLT_MAGIC_PREAMBLE, [0x60, 0x60, 0xB0, 0x17]);
        // four big-endian u32 proposals, highest version first, zero padded
        assert_eq!(BOLT_VERSION_OFFER.len(), 16);
        assert_eq!(&BOLT_VERSION_OFFER[0..4], &[0, 0, 0, 5]);
        assert_eq!(&BOLT_VERSION_OFFER[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn combined_timeout_prefers_tighter_bound() {
        let deadline = Instant::now() + Duration::from_secs(1000);
        let combined =
            combined_connect_timeout(Some(Duration::from_secs(5)), Some(deadline)).unwrap();
        assert_eq!(combined, Duration::from_secs(5));
        let combined =
            combined_connect_timeout(Some(Duration::from_secs(5000)), Some(deadline)).unwrap();
        assert!(combined <= Duration::from_secs(1000));
        assert!(combined_connect_timeout(None, None).is_none());
    }
}
