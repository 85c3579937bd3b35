// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A bounded in-memory duplex byte channel.
//!
//! One [`pipe`] is a single direction: a writer that blocks while the
//! buffer is full and a reader that blocks while it is empty. A pair of
//! pipes connects a transmission control to its transport (or to a peer
//! transmission control in tests) without any real IO. Dropping either
//! end closes the channel: the reader then drains what is buffered and
//! sees end-of-file, the writer fails with `BrokenPipe`.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::io::Read;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Byte source feeding segments into a transmission control.
///
/// The single method is deliberately deadline-oriented: the input
/// worker reads a header and then its data under separate timeouts, and
/// must never block past either.
pub trait InputTransport: Send {
    /// Fills `buf` completely, waiting up to `timeout` for the bytes to
    /// arrive.
    ///
    /// Fails with `TimedOut` when the deadline expires and with
    /// `UnexpectedEof` when the source is closed before enough bytes
    /// are available; buffered bytes are not consumed on failure.
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()>;
}

struct PipeState {
    buf: VecDeque<u8>,
    capacity: usize,
    write_closed: bool,
    read_closed: bool,
}

struct PipeShared {
    state: Mutex<PipeState>,
    changed: Condvar,
}

/// Creates a one-directional bounded byte channel.
pub fn pipe(capacity: usize) -> (PipeReader, PipeWriter) {
    assert!(capacity > 0, "pipe capacity must be non-zero");
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            buf: VecDeque::new(),
            capacity,
            write_closed: false,
            read_closed: false,
        }),
        changed: Condvar::new(),
    });
    (
        PipeReader {
            shared: shared.clone(),
        },
        PipeWriter { shared },
    )
}

/// The receiving end of a [`pipe`].
pub struct PipeReader {
    shared: Arc<PipeShared>,
}

/// The sending end of a [`pipe`].
pub struct PipeWriter {
    shared: Arc<PipeShared>,
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if !state.buf.is_empty() {
                let n = buf.len().min(state.buf.len());
                for (dst, src) in buf[..n].iter_mut().zip(state.buf.drain(..n)) {
                    *dst = src;
                }
                self.shared.changed.notify_all();
                return Ok(n);
            }
            if state.write_closed {
                return Ok(0);
            }
            self.shared.changed.wait(&mut state);
        }
    }
}

impl InputTransport for PipeReader {
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            // Wait for the full amount so a timeout never tears a
            // partially-consumed frame off the stream.
            if state.buf.len() >= buf.len() {
                let n = buf.len();
                for (dst, src) in buf.iter_mut().zip(state.buf.drain(..n)) {
                    *dst = src;
                }
                self.shared.changed.notify_all();
                return Ok(());
            }
            if state.write_closed {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(io::ErrorKind::TimedOut.into());
            }
            let _ = self.shared.changed.wait_for(&mut state, deadline - now);
        }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.read_closed = true;
        self.shared.changed.notify_all();
    }
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut state = self.shared.state.lock();
        loop {
            if state.read_closed {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let room = state.capacity - state.buf.len();
            if room > 0 {
                let n = room.min(data.len());
                state.buf.extend(&data[..n]);
                self.shared.changed.notify_all();
                return Ok(n);
            }
            self.shared.changed.wait(&mut state);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.write_closed = true;
        self.shared.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn bytes_flow_in_order() {
        let (mut reader, mut writer) = pipe(8);
        let feeder = thread::spawn(move || {
            for chunk in [&[1u8, 2, 3][..], &[4, 5][..], &[6, 7, 8, 9][..]] {
                writer.write_all(chunk).unwrap();
            }
        });
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        feeder.join().unwrap();
        assert_eq!(out, (1..=9).collect::<Vec<u8>>());
    }

    #[test]
    fn write_blocks_until_read_makes_room() {
        let (mut reader, mut writer) = pipe(4);
        writer.write_all(&[0; 4]).unwrap();
        let feeder = thread::spawn(move || writer.write_all(&[1; 4]));
        let mut buf = [0; 4];
        reader.read_exact(&mut buf).unwrap();
        feeder.join().unwrap().unwrap();
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1; 4]);
    }

    #[test]
    fn read_exact_timeout_expires_without_consuming() {
        let (mut reader, mut writer) = pipe(16);
        writer.write_all(&[7; 3]).unwrap();
        let mut buf = [0; 4];
        let err = reader
            .read_exact_timeout(&mut buf, Duration::from_millis(50))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        // The three buffered bytes are still there for a later read.
        writer.write_all(&[8]).unwrap();
        reader
            .read_exact_timeout(&mut buf, Duration::from_millis(50))
            .unwrap();
        assert_eq!(buf, [7, 7, 7, 8]);
    }

    #[test]
    fn dropping_the_writer_is_eof() {
        let (mut reader, mut writer) = pipe(16);
        writer.write_all(&[1, 2]).unwrap();
        drop(writer);
        let mut buf = [0; 2];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        let err = reader
            .read_exact_timeout(&mut buf, Duration::from_millis(10))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn dropping_the_reader_breaks_the_writer() {
        let (reader, mut writer) = pipe(2);
        drop(reader);
        let err = writer.write_all(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn full_pipe_unblocks_when_reader_drops() {
        let (reader, mut writer) = pipe(2);
        writer.write_all(&[0; 2]).unwrap();
        let dropper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            drop(reader);
        });
        let err = writer.write_all(&[1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        dropper.join().unwrap();
    }
}
