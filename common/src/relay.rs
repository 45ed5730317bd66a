//! Unidirectional byte forwarding between two descriptors.

use std::{
    fmt,
    io::{self, Read, Write},
    thread,
};

/// How a relay task ended
#[derive(Debug)]
pub enum RelayEnd {
    /// The source reached end-of-stream
    Eof,
    /// Reading the source failed
    ReadFailed(io::Error),
    /// Writing the destination failed; the bytes of that chunk may be lost
    WriteFailed(io::Error),
}

/// Summary of one finished relay task
#[derive(Debug)]
pub struct RelayReport {
    pub label: &'static str,
    pub bytes: u64,
    pub end:   RelayEnd,
}

impl RelayReport {
    /// True when the task stopped at end-of-stream
    pub fn clean(&self) -> bool {
        matches!(self.end, RelayEnd::Eof)
    }
}

impl fmt::Display for RelayReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.end {
            RelayEnd::Eof => write!(f, "{}: {} bytes, end of stream", self.label, self.bytes),
            RelayEnd::ReadFailed(e) => {
                write!(f, "{}: {} bytes, read failed: {}", self.label, self.bytes, e)
            }
            RelayEnd::WriteFailed(e) => {
                write!(f, "{}: {} bytes, write failed: {}", self.label, self.bytes, e)
            }
        }
    }
}

/// Copies `source` into `destination` in chunks of at most `chunk_size`
/// bytes until the source ends or either side fails.
///
/// Takes ownership of both ends and closes them when it returns, whatever
/// the reason.
pub fn forward<R, W>(
    label: &'static str,
    mut source: R,
    mut destination: W,
    chunk_size: usize,
) -> RelayReport
where
    R: Read,
    W: Write,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut bytes = 0u64;

    let end = loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break RelayEnd::Eof,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break RelayEnd::ReadFailed(e),
        };
        if let Err(e) = destination.write_all(&buf[..n]).and_then(|()| destination.flush()) {
            break RelayEnd::WriteFailed(e);
        }
        bytes += n as u64;
        tracing::trace!("{}: forwarded {} bytes", label, n);
    };

    drop(source);
    drop(destination);

    let report = RelayReport { label, bytes, end };
    tracing::debug!("Relay finished, {}", report);
    report
}

/// Runs [`forward`] on its own thread
pub fn spawn<R, W>(
    label: &'static str,
    source: R,
    destination: W,
    chunk_size: usize,
) -> io::Result<thread::JoinHandle<RelayReport>>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name(format!("relay {label}"))
        .spawn(move || forward(label, source, destination, chunk_size))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::{
        pipe::{OsPipes, PipeFactory},
        testing::CaptureWriter,
    };

    #[test]
    fn forwards_everything_until_eof() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let sink = CaptureWriter::new();

        let report = forward("test", Cursor::new(payload.clone()), sink.clone(), 1024);

        assert!(report.clean());
        assert_eq!(report.bytes, payload.len() as u64);
        assert_eq!(sink.contents(), payload);
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_stops_the_task() {
        let report = forward("test", Cursor::new(b"data".to_vec()), BrokenSink, 1024);

        assert_eq!(report.bytes, 0);
        assert!(matches!(
            report.end,
            RelayEnd::WriteFailed(ref e) if e.kind() == io::ErrorKind::BrokenPipe
        ));
    }

    #[test]
    fn short_writes_are_completed() {
        struct Trickle(CaptureWriter);

        impl Write for Trickle {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.write(&buf[..buf.len().min(3)])
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let sink = CaptureWriter::new();
        let source = Cursor::new(b"ping\npong\n".to_vec());
        let report = forward("test", source, Trickle(sink.clone()), 1024);
        assert!(report.clean());
        assert_eq!(sink.contents(), b"ping\npong\n");
    }

    #[test]
    fn relay_closes_its_destination() {
        let (source_read, source_write) = OsPipes.pipe().unwrap();
        let (dest_read, dest_write) = OsPipes.pipe().unwrap();
        let mut source_write = std::fs::File::from(source_write);
        let mut dest_read = std::fs::File::from(dest_read);

        let relay = spawn(
            "pipe",
            std::fs::File::from(source_read),
            std::fs::File::from(dest_write),
            16,
        )
        .unwrap();

        source_write.write_all(b"ping\n").unwrap();
        drop(source_write);

        // EOF on the destination proves the relay dropped its write end
        let mut out = Vec::new();
        dest_read.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"ping\n");

        let report = relay.join().unwrap();
        assert!(report.clean());
        assert_eq!(report.bytes, 5);
    }
}
