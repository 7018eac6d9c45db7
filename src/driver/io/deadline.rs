use std::fmt::Debug;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{DriverError, Result};

enum ErrorDuring {
    GetTimeout,
    SetTimeout,
    Io,
}

/// Arms the underlying socket's read/write timeout so that blocking I/O on
/// `stream` observes `deadline`; the previous timeout is restored afterwards.
///
/// `stream` may be a wrapper (buffer, TLS) around `socket`; the timeout is
/// applied to the raw socket while the I/O runs through the wrapper.
pub(crate) struct DeadlineIO<'tcp, S> {
    stream: S,
    deadline: Option<Instant>,
    socket: Option<&'tcp TcpStream>,
    error_during: Option<ErrorDuring>,
}

impl<'tcp, S: Read + Write> DeadlineIO<'tcp, S> {
    pub(crate) fn new(stream: S, deadline: Option<Instant>, socket: Option<&'tcp TcpStream>) -> Self {
        Self {
            stream,
            deadline,
            socket,
            error_during: None,
        }
    }

    fn track<T>(&mut self, res: io::Result<T>, during: ErrorDuring) -> io::Result<T> {
        if res.is_err() {
            self.error_during = Some(during);
        }
        res
    }

    fn with_deadline<T, F: FnOnce(&mut Self) -> io::Result<T>>(&mut self, work: F) -> io::Result<T> {
        let (Some(deadline), Some(socket)) = (self.deadline, self.socket) else {
            let res = work(self);
            return self.track(res, ErrorDuring::Io);
        };
        let previous = self.track(socket.read_timeout(), ErrorDuring::GetTimeout)?;
        let timeout = deadline
            .checked_duration_since(Instant::now())
            // deadline already passed: a tiny timeout makes blocking calls
            // fail promptly instead of hanging
            .unwrap_or(Duration::from_nanos(1));
        if let Some(previous) = previous {
            if timeout >= previous {
                let res = work(self);
                return self.track(res, ErrorDuring::Io);
            }
        }
        self.track(set_timeouts(socket, Some(timeout)), ErrorDuring::SetTimeout)?;
        let res = work(self);
        let res = self.track(res, ErrorDuring::Io);
        if let Err(err) = set_timeouts(socket, previous) {
            warn!("failed to restore socket timeout: {err}");
        }
        res
    }

    /// I/O failures caused by timeout plumbing (not the transfer itself) are
    /// configuration problems; rewrite them accordingly.
    pub(crate) fn rewrite_error<T>(&self, res: Result<T>) -> Result<T> {
        if res.is_ok() {
            return res;
        }
        match self.error_during {
            Some(ErrorDuring::GetTimeout) => res.map_err(|e| {
                DriverError::invalid_config(format!("failed to read configured timeout: {e}"))
            }),
            Some(ErrorDuring::SetTimeout) => res.map_err(|e| {
                DriverError::invalid_config(format!("failed to configure timeout: {e}"))
            }),
            Some(ErrorDuring::Io) | None => res,
        }
    }
}

fn set_timeouts(socket: &TcpStream, timeout: Option<Duration>) -> io::Result<()> {
    socket.set_read_timeout(timeout)?;
    socket.set_write_timeout(timeout)
}

impl<S> Debug for DeadlineIO<'_, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineIO")
            .field("deadline", &self.deadline)
            .field("socket", &self.socket)
            .finish()
    }
}

impl<S: Read + Write> Read for DeadlineIO<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_deadline(|this| this.stream.read(buf))
    }
}

impl<S: Read + Write> Write for DeadlineIO<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_deadline(|this| this.stream.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_deadline(|this| this.stream.flush())
    }
}
