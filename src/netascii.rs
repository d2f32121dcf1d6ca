use std::collections::VecDeque;
use std::io::{self, Cursor, Read, Write};

use crate::target::ReadTarget;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Encodes bytes coming from a reader into netascii: LF becomes CR LF and a
/// literal CR becomes CR NUL.
///
/// The expansion can exceed the caller's buffer, so overflow bytes are
/// parked in a residual queue and drained by the next read. Reporting the
/// transformed size requires materializing the whole encoded stream into
/// memory once; that is the only way netascii can honor the `tsize`
/// extension.
pub struct NetasciiReader<R> {
    inner: R,
    residual: VecDeque<u8>,
    slurped: Option<Cursor<Vec<u8>>>,
}

impl<R: Read> NetasciiReader<R> {
    pub fn new(inner: R) -> Self {
        NetasciiReader {
            inner,
            residual: VecDeque::new(),
            slurped: None,
        }
    }
}

impl<R: Read> Read for NetasciiReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(cursor) = self.slurped.as_mut() {
            return cursor.read(buf);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        // Serve leftovers from the previous call before touching the source.
        let mut out = Vec::with_capacity(buf.len() + 1);
        while out.len() < buf.len() {
            match self.residual.pop_front() {
                Some(b) => out.push(b),
                None => break,
            }
        }

        if out.len() < buf.len() {
            let mut raw = vec![0u8; buf.len() - out.len()];
            let n = self.inner.read(&mut raw)?;
            for &b in &raw[..n] {
                match b {
                    LF => out.extend_from_slice(&[CR, LF]),
                    CR => out.extend_from_slice(&[CR, 0]),
                    other => out.push(other),
                }
            }
        }

        let produced = out.len().min(buf.len());
        buf[..produced].copy_from_slice(&out[..produced]);
        self.residual.extend(out.drain(produced..));
        Ok(produced)
    }
}

impl<R: Read> ReadTarget for NetasciiReader<R> {
    fn size(&mut self) -> io::Result<Option<u64>> {
        if let Some(cursor) = self.slurped.as_ref() {
            return Ok(Some(cursor.get_ref().len() as u64));
        }
        // The encoded size cannot be derived from the raw size; transform
        // the whole stream and serve subsequent reads from the copy.
        let mut all = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = self.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            all.extend_from_slice(&chunk[..n]);
        }
        let size = all.len() as u64;
        self.slurped = Some(Cursor::new(all));
        Ok(Some(size))
    }
}

/// Decodes netascii arriving from the wire back into plain bytes: CR LF
/// becomes LF and CR NUL becomes a literal CR.
///
/// A CR that ends a write cannot be resolved until the next byte arrives,
/// so it is held in `pending_cr` across calls; `flush` writes it through
/// as-is.
pub struct NetasciiWriter<W> {
    inner: W,
    pending_cr: bool,
}

impl<W: Write> NetasciiWriter<W> {
    pub fn new(inner: W) -> Self {
        NetasciiWriter {
            inner,
            pending_cr: false,
        }
    }
}

impl<W: Write> Write for NetasciiWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut out = Vec::with_capacity(buf.len());
        for &b in buf {
            if self.pending_cr {
                self.pending_cr = false;
                match b {
                    LF => out.push(LF),
                    0 => out.push(CR),
                    CR => {
                        out.push(CR);
                        self.pending_cr = true;
                    }
                    other => {
                        // Bare CR in the stream: pass both bytes through.
                        out.push(CR);
                        out.push(other);
                    }
                }
            } else if b == CR {
                self.pending_cr = true;
            } else {
                out.push(b);
            }
        }
        self.inner.write_all(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending_cr {
            self.pending_cr = false;
            self.inner.write_all(&[CR])?;
        }
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(raw: &[u8]) -> Vec<u8> {
        let mut reader = NetasciiReader::new(Cursor::new(raw.to_vec()));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    }

    fn decode(wire: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut writer = NetasciiWriter::new(&mut out);
        writer.write_all(wire).unwrap();
        writer.flush().unwrap();
        out
    }

    #[test]
    fn encodes_lf_and_cr() {
        assert_eq!(encode(b"A\nB\rC"), b"A\r\nB\r\0C");
    }

    #[test]
    fn encode_passes_plain_bytes_through() {
        assert_eq!(encode(b"no escapes here"), b"no escapes here");
    }

    #[test]
    fn one_byte_reads_drain_the_residual() {
        let mut reader = NetasciiReader::new(Cursor::new(b"A\nB\rC".to_vec()));
        let mut out = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = reader.read(&mut byte).unwrap();
            if n == 0 {
                break;
            }
            out.push(byte[0]);
        }
        assert_eq!(out, b"A\r\nB\r\0C");
    }

    #[test]
    fn size_reports_encoded_length_and_is_idempotent() {
        let mut reader = NetasciiReader::new(Cursor::new(b"A\nB\rC".to_vec()));
        assert_eq!(reader.size().unwrap(), Some(7));
        assert_eq!(reader.size().unwrap(), Some(7));

        // Reads after sizing serve the full encoded stream.
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"A\r\nB\r\0C");
    }

    #[test]
    fn decodes_crlf_and_crnul() {
        assert_eq!(decode(b"A\r\nB\r\0C"), b"A\nB\rC");
    }

    #[test]
    fn decode_defers_cr_across_writes() {
        let mut out = Vec::new();
        let mut writer = NetasciiWriter::new(&mut out);
        writer.write_all(b"A\r").unwrap();
        writer.write_all(b"\nB\r").unwrap();
        writer.write_all(b"\0C").unwrap();
        writer.flush().unwrap();
        assert_eq!(out, b"A\nB\rC");
    }

    #[test]
    fn decode_passes_bare_cr_through() {
        assert_eq!(decode(b"a\rb"), b"a\rb");
    }

    #[test]
    fn flush_writes_out_a_trailing_cr() {
        assert_eq!(decode(b"end\r"), b"end\r");
    }

    #[test]
    fn round_trip_through_both_adapters() {
        let raw = b"line one\nline two\rmixed\r\n";
        assert_eq!(decode(&encode(raw)), raw);
    }
}
