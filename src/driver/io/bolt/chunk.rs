use std::cmp;
use std::io::{self, Read, Write};

use log::trace;
use usize_cast::IntoUsize;

const MAX_CHUNK_SIZE: usize = 0xFFFF;

/// Write one Bolt message as a sequence of `u16`-length-prefixed chunks,
/// terminated by a zero-length chunk.
///
/// The caller must not interleave chunks of different messages on the same
/// stream; this writes the complete message in one go.
pub(crate) fn write_chunked<W: Write>(writer: &mut W, message: &[u8]) -> io::Result<()> {
    for chunk in message.chunks(MAX_CHUNK_SIZE) {
        let size = (chunk.len() as u16).to_be_bytes();
        trace!("C: <RAW> {:02X?}", size);
        writer.write_all(&size)?;
        trace!("C: <RAW> {:02X?}", chunk);
        writer.write_all(chunk)?;
    }
    trace!("C: <RAW> [00, 00]");
    writer.write_all(&[0, 0])
}

/// Reassembles the chunked stream: yields chunk payloads, transparently
/// skipping chunk headers.
///
/// Message framing is driven by the reader on top (the message decoder reads
/// exactly one message's worth of bytes); the zero-length terminator of a
/// message is consumed as an empty chunk when the next message is read.
pub(crate) struct Dechunker<R: Read> {
    reader: R,
    chunk_left: usize,
    broken: bool,
}

impl<R: Read> Dechunker<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            reader,
            chunk_left: 0,
            broken: false,
        }
    }

    fn next_chunk_header(&mut self) -> io::Result<()> {
        let mut size = [0; 2];
        self.reader.read_exact(&mut size)?;
        trace!("S: <RAW> {:02X?}", size);
        self.chunk_left = u16::from_be_bytes(size).into_usize();
        Ok(())
    }

    fn mark_broken<T>(&mut self, res: io::Result<T>) -> io::Result<T> {
        if res.is_err() {
            self.broken = true;
        }
        res
    }
}

impl<R: Read> Read for Dechunker<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        assert!(!self.broken, "attempted to read from a broken dechunker");
        while self.chunk_left == 0 {
            let res = self.next_chunk_header();
            self.mark_broken(res)?;
        }
        let request = cmp::min(buf.len(), self.chunk_left);
        let buf = &mut buf[..request];
        let res = self.reader.read_exact(buf).map(|()| request);
        let read = self.mark_broken(res)?;
        trace!("S: <RAW> {:02X?}", buf);
        self.chunk_left -= read;
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunked(message: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        write_chunked(&mut out, message).unwrap();
        out
    }

    fn dechunk(wire: &[u8], len: usize) -> Vec<u8> {
        let mut dechunker = Dechunker::new(wire);
        let mut message = vec![0; len];
        dechunker.read_exact(&mut message).unwrap();
        message
    }

    #[test]
    fn empty_message_is_just_the_terminator() {
        assert_eq!(chunked(&[]), vec![0, 0]);
    }

    #[test]
    fn small_message_is_one_chunk() {
        assert_eq!(chunked(&[1, 2, 3]), vec![0, 3, 1, 2, 3, 0, 0]);
    }

    #[test]
    fn large_message_spans_chunks() {
        let message = vec![0xAB; MAX_CHUNK_SIZE + 1];
        let out = chunked(&message);
        assert_eq!(&out[..2], &[0xFF, 0xFF]);
        let second_header = 2 + MAX_CHUNK_SIZE;
        assert_eq!(&out[second_header..second_header + 2], &[0, 1]);
        assert_eq!(&out[out.len() - 2..], &[0, 0]);
        assert_eq!(out.len(), 2 + MAX_CHUNK_SIZE + 2 + 1 + 2);
    }

    #[test]
    fn dechunker_joins_chunks() {
        // two chunks: [1, 2] + [3]
        let wire = vec![0, 2, 1, 2, 0, 1, 3, 0, 0];
        assert_eq!(dechunk(&wire, 3), vec![1, 2, 3]);
    }

    #[test]
    fn dechunker_skips_terminator_of_previous_message() {
        let mut wire = chunked(&[1, 2]);
        wire.extend(chunked(&[3, 4]));
        let mut dechunker = Dechunker::new(wire.as_slice());
        let mut first = [0; 2];
        dechunker.read_exact(&mut first).unwrap();
        let mut second = [0; 2];
        dechunker.read_exact(&mut second).unwrap();
        assert_eq!(first, [1, 2]);
        assert_eq!(second, [3, 4]);
    }

    #[test]
    fn dechunker_round_trip() {
        let message: Vec<u8> = (0..=255).cycle().take(3 * MAX_CHUNK_SIZE / 2).collect();
        let wire = chunked(&message);
        assert_eq!(dechunk(&wire, message.len()), message);
    }

    #[test]
    fn dechunker_propagates_truncation() {
        // announces 4 bytes, delivers 2
        let wire = vec![0, 4, 1, 2];
        let mut dechunker = Dechunker::new(wire.as_slice());
        let mut buf = [0; 4];
        assert!(dechunker.read_exact(&mut buf).is_err());
    }
}
