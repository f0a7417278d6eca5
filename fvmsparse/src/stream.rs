// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Byte-level reader and writer contracts.
//!
//! Readers are random access ([`ReadAt`] + [`FileLen`]). A read either fills
//! the caller's buffer completely (via [`ReadAt::read_exact_at`]) or fails with
//! an [`io::Error`] describing what went wrong. Writers are plain [`Write`]
//! streams that are always written monotonically, so pipes work as sinks, or
//! [`WriteAt`] when the output is addressed by offset.

use std::{
    fs::File,
    io::{self, Read, Write},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

/// Read a value from a stream.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Write a value to a stream.
pub trait ToWriter<W: Write>: Sized {
    type Error;

    fn to_writer(&self, writer: W) -> Result<(), Self::Error>;
}

/// Query the total size of a file-like type in bytes.
pub trait FileLen {
    fn file_len(&self) -> io::Result<u64>;
}

macro_rules! file_len_blanket_impl {
    ($type:ty) => {
        impl<F: ?Sized + FileLen> FileLen for $type {
            fn file_len(&self) -> io::Result<u64> {
                (**self).file_len()
            }
        }
    };
}

file_len_blanket_impl!(&F);
file_len_blanket_impl!(Arc<F>);
file_len_blanket_impl!(Box<F>);

/// Reads at specific offsets. Implementations must not depend on a shared file
/// position.
pub trait ReadAt: FileLen {
    /// Read up to `buf.len()` bytes at `offset`. Returning fewer bytes than
    /// requested means that EOF was reached.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fill all of `buf` with the data at `offset` or fail.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let mut filled = 0;

        while filled < buf.len() {
            let n = self.read_at(&mut buf[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "Expected to read {} bytes at {offset}, but reached EOF after {filled} bytes",
                        buf.len(),
                    ),
                ));
            }

            filled += n;
        }

        Ok(())
    }
}

macro_rules! read_at_blanket_impl {
    ($type:ty) => {
        impl<R: ?Sized + ReadAt> ReadAt for $type {
            fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
                (**self).read_at(buf, offset)
            }

            fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
                (**self).read_exact_at(buf, offset)
            }
        }
    };
}

read_at_blanket_impl!(&R);
read_at_blanket_impl!(Arc<R>);
read_at_blanket_impl!(Box<R>);

/// Writes at specific offsets. The behavior is unspecified if writes overlap.
pub trait WriteAt: FileLen {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            let n = self.write_at(buf, offset)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("Failed to write {} bytes at {offset}", buf.len()),
                ));
            }

            buf = &buf[n..];
            offset += n as u64;
        }

        Ok(())
    }

    fn file_flush(&self) -> io::Result<()>;
}

macro_rules! write_at_blanket_impl {
    ($type:ty) => {
        impl<W: ?Sized + WriteAt> WriteAt for $type {
            fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
                (**self).write_at(buf, offset)
            }

            fn write_all_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
                (**self).write_all_at(buf, offset)
            }

            fn file_flush(&self) -> io::Result<()> {
                (**self).file_flush()
            }
        }
    };
}

write_at_blanket_impl!(&W);
write_at_blanket_impl!(Arc<W>);
write_at_blanket_impl!(Box<W>);

/// In-memory buffers are the simplest readers.
impl FileLen for [u8] {
    fn file_len(&self) -> io::Result<u64> {
        Ok(self.len() as u64)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let Some(data) = usize::try_from(offset).ok().and_then(|o| self.get(o..)) else {
            return Ok(0);
        };

        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);

        Ok(n)
    }
}

impl FileLen for Vec<u8> {
    fn file_len(&self) -> io::Result<u64> {
        self.as_slice().file_len()
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

/// A reader that only exposes a window of another reader. Reads that extend
/// past the end of the window are truncated, so [`ReadAt::read_exact_at`]
/// fails for them.
pub struct SectionReaderAt<R> {
    inner: R,
    start: u64,
    size: u64,
}

impl<R: ReadAt> SectionReaderAt<R> {
    pub fn new(inner: R, start: u64, size: u64) -> io::Result<Self> {
        if start.checked_add(size).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Section overflows: {start} + {size}"),
            ));
        }

        Ok(Self { inner, start, size })
    }
}

impl<R> FileLen for SectionReaderAt<R> {
    fn file_len(&self) -> io::Result<u64> {
        Ok(self.size)
    }
}

impl<R: ReadAt> ReadAt for SectionReaderAt<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let to_read = self.size.saturating_sub(offset).min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        self.inner.read_at(&mut buf[..to_read], self.start + offset)
    }
}

/// A reader that presents an in-order stream as [`ReadAt`]. Reads are served
/// from the current stream position, so forward reads are cheap and backwards
/// reads require the stream to be reopened via the `open` callback.
pub struct SequentialReaderAt<R> {
    open: Box<dyn Fn() -> io::Result<R>>,
    state: Mutex<(R, u64)>,
    size: u64,
}

impl<R: Read> SequentialReaderAt<R> {
    pub fn new(open: Box<dyn Fn() -> io::Result<R>>, size: u64) -> io::Result<Self> {
        let reader = open()?;

        Ok(Self {
            open,
            state: Mutex::new((reader, 0)),
            size,
        })
    }
}

impl<R> FileLen for SequentialReaderAt<R> {
    fn file_len(&self) -> io::Result<u64> {
        Ok(self.size)
    }
}

impl<R: Read> ReadAt for SequentialReaderAt<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let to_read = self.size.saturating_sub(offset).min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (reader, pos) = &mut *state;

        if offset < *pos {
            *reader = (self.open)()?;
            *pos = 0;
        }

        let skip = offset - *pos;
        let skipped = io::copy(&mut reader.by_ref().take(skip), &mut io::sink())?;
        *pos += skipped;
        if skipped != skip {
            return Ok(0);
        }

        let mut filled = 0;
        while filled < to_read {
            let n = reader.read(&mut buf[filled..to_read])?;
            if n == 0 {
                break;
            }

            filled += n;
        }

        *pos += filled as u64;

        Ok(filled)
    }
}

/// A [`Read`] view over a [`ReadAt`] with its own position.
pub struct UserPosFile<F> {
    file: F,
    offset: u64,
}

impl<F> UserPosFile<F> {
    pub fn new(file: F, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl<F: ReadAt> Read for UserPosFile<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// Regular files support reads at offsets.
impl ReadAt for File {
    /// Read data from offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(self, buf, offset)
    }

    /// Read data from offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }
}

/// Regular files support writes at offsets.
impl WriteAt for File {
    /// Write data to offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_write(self, buf, offset)
    }

    /// Write data to offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::write_at(self, buf, offset)
    }

    fn file_flush(&self) -> io::Result<()> {
        (&*self).flush()
    }
}

impl FileLen for File {
    fn file_len(&self) -> io::Result<u64> {
        self.metadata().map(|m| m.len())
    }
}

/// A writer wrapper that counts the number of bytes written.
pub struct CountingWriter<W> {
    inner: W,
    offset: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, offset: 0 }
    }

    pub fn count(&self) -> u64 {
        self.offset
    }

    pub fn finish(self) -> (W, u64) {
        (self.inner, self.offset)
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Returns an I/O error with the [`io::ErrorKind::Interrupted`] type if
/// `cancel_signal` is true. This should be called frequently in I/O loops for
/// cancellation to be responsive.
#[inline]
pub fn check_cancel(cancel_signal: &AtomicBool) -> io::Result<()> {
    if cancel_signal.load(Ordering::SeqCst) {
        return Err(io::Error::new(
            io::ErrorKind::Interrupted,
            "Received cancel signal",
        ));
    }

    Ok(())
}

/// Copy exactly `size` bytes from `reader` at `reader_offset` to `writer` at
/// `writer_offset`. The operation is cancelled on the next loop iteration if
/// `cancel_signal` is set to `true`.
pub fn copy_n_at(
    reader: &(impl ReadAt + ?Sized),
    reader_offset: u64,
    writer: &(impl WriteAt + ?Sized),
    writer_offset: u64,
    size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    let mut buf = [0u8; 16384];
    let mut copied = 0;

    while copied < size {
        check_cancel(cancel_signal)?;

        let to_read = (size - copied).min(buf.len() as u64) as usize;
        reader.read_exact_at(&mut buf[..to_read], reader_offset + copied)?;
        writer.write_all_at(&buf[..to_read], writer_offset + copied)?;

        copied += to_read as u64;
    }

    Ok(())
}
