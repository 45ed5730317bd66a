use std::{
    fs::File,
    io::{self, Read, Write},
    os::fd::OwnedFd,
};

/// Source of unidirectional OS pipes, as (read end, write end)
pub trait PipeFactory {
    fn pipe(&self) -> nix::Result<(OwnedFd, OwnedFd)>;
}

/// `pipe(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPipes;

impl PipeFactory for OsPipes {
    fn pipe(&self) -> nix::Result<(OwnedFd, OwnedFd)> {
        nix::unistd::pipe()
    }
}

/// Two unidirectional pipe ends used as one bidirectional byte channel.
///
/// Both ends are owned: dropping the pair closes each of them exactly once.
#[derive(Debug)]
pub struct DescriptorPair {
    reader: File,
    writer: File,
}

impl DescriptorPair {
    pub fn new(reader: impl Into<OwnedFd>, writer: impl Into<OwnedFd>) -> Self {
        Self {
            reader: File::from(reader.into()),
            writer: File::from(writer.into()),
        }
    }

    /// Creates a connected pair of channels: whatever is written to one
    /// side can be read from the other
    pub fn connected(pipes: &impl PipeFactory) -> nix::Result<(Self, Self)> {
        let (a_read, b_write) = pipes.pipe()?;
        let (b_read, a_write) = pipes.pipe()?;
        Ok((Self::new(a_read, a_write), Self::new(b_read, b_write)))
    }
}

impl Read for DescriptorPair {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Write for DescriptorPair {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}
