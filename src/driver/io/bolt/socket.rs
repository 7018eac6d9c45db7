use std::io::{BufReader, BufWriter, Read, Result as IoResult, Write};
use std::net::TcpStream;
use std::sync::Arc;

use rustls::{ClientConfig, ClientConnection, StreamOwned};
use rustls_pki_types::ServerName;

use crate::error::{DriverError, Result};

/// A TCP stream split into an independently buffered reader and writer half.
#[derive(Debug)]
pub(crate) struct BufTcpStream {
    read: BufReader<TcpStream>,
    write: BufWriter<TcpStream>,
}

impl BufTcpStream {
    pub(crate) fn new(socket: &TcpStream) -> Result<Self> {
        Ok(Self {
            read: BufReader::new(DriverError::wrap_connect(socket.try_clone())?),
            write: BufWriter::new(DriverError::wrap_connect(socket.try_clone())?),
        })
    }
}

impl Read for BufTcpStream {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        self.read.read(buf)
    }

    #[inline]
    fn read_exact(&mut self, buf: &mut [u8]) -> IoResult<()> {
        self.read.read_exact(buf)
    }
}

impl Write for BufTcpStream {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.write.write(buf)
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> IoResult<()> {
        self.write.write_all(buf)
    }

    #[inline]
    fn flush(&mut self) -> IoResult<()> {
        self.write.flush()
    }
}

/// Plain or TLS-wrapped stream; the TLS handshake runs before any Bolt bytes.
#[derive(Debug)]
pub(crate) enum Socket<T: Read + Write> {
    Plain(T),
    Tls(Box<StreamOwned<ClientConnection, T>>),
}

impl<T: Read + Write> Socket<T> {
    pub(crate) fn new(io: T, host_name: &str, tls_config: Option<Arc<ClientConfig>>) -> Result<Self> {
        let Some(tls_config) = tls_config else {
            return Ok(Self::Plain(io));
        };
        let host_name = ServerName::try_from(host_name)
            .map_err(|e| DriverError::invalid_config(format!("tls refused hostname {host_name}: {e}")))?
            .to_owned();
        let connection = ClientConnection::new(tls_config, host_name).map_err(|e| {
            DriverError::invalid_config(format!("failed to initialize tls stream: {e}"))
        })?;
        Ok(Self::Tls(Box::new(StreamOwned::new(connection, io))))
    }
}

impl<T: Read + Write> Read for Socket<T> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        match self {
            Socket::Plain(io) => io.read(buf),
            Socket::Tls(io) => io.read(buf),
        }
    }

    #[inline]
    fn read_exact(&mut self, buf: &mut [u8]) -> IoResult<()> {
        match self {
            Socket::Plain(io) => io.read_exact(buf),
            Socket::Tls(io) => io.read_exact(buf),
        }
    }
}

impl<T: Read + Write> Write for Socket<T> {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        match self {
            Socket::Plain(io) => io.write(buf),
            Socket::Tls(io) => io.write(buf),
        }
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> IoResult<()> {
        match self {
            Socket::Plain(io) => io.write_all(buf),
            Socket::Tls(io) => io.write_all(buf),
        }
    }

    #[inline]
    fn flush(&mut self) -> IoResult<()> {
        match self {
            Socket::Plain(io) => io.flush(),
            Socket::Tls(io) => io.flush(),
        }
    }
}
