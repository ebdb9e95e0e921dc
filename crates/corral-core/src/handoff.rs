//! One-shot handoff over a named pipe.
//!
//! The confined child publishes a single message (its cgroup name) and the
//! parent reads it to end-of-stream. Each pipe instance carries exactly one
//! message, so there is no framing.
//!
//! The parent creates the pipe and opens its read end non-blocking before
//! the child exists. The child's write-open therefore never stalls, and the
//! parent polls with a deadline instead of blocking forever. Reading
//! end-of-stream after at least one byte means the writer closed, which is
//! when the message is complete.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use corral_common::error::{CorralError, Result};

/// Upper bound on a handoff message.
const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Interval between non-blocking read attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Parent-owned named pipe, unlinked on drop.
#[derive(Debug)]
pub struct HandoffChannel {
    path: PathBuf,
}

impl HandoffChannel {
    /// Creates the named pipe at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created, or if something
    /// other than a pipe already occupies the path.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CorralError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        make_fifo(&path)?;
        tracing::debug!(path = %path.display(), "handoff pipe created");
        Ok(Self { path })
    }

    /// Returns the pipe path the child must write to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the read end without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be opened.
    pub fn open_reader(&self) -> Result<HandoffReader> {
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| CorralError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        Ok(HandoffReader {
            file,
            path: self.path.clone(),
            buf: Vec::new(),
        })
    }
}

impl Drop for HandoffChannel {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "handoff pipe removed"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove handoff pipe");
            }
        }
    }
}

/// Non-blocking read end of a handoff pipe.
#[derive(Debug)]
pub struct HandoffReader {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
}

impl HandoffReader {
    /// Reads whatever is available and returns the message once the writer
    /// has closed.
    ///
    /// Returns `Ok(None)` while no writer has connected, or while the
    /// writer is still connected.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails, the message exceeds the size
    /// bound, or it is not UTF-8.
    pub fn try_recv(&mut self) -> Result<Option<String>> {
        let mut chunk = [0_u8; 512];
        loop {
            match self.file.read(&mut chunk) {
                Ok(0) if self.buf.is_empty() => return Ok(None),
                Ok(0) => return self.take_message().map(Some),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if self.buf.len() > MAX_MESSAGE_BYTES {
                        return Err(CorralError::Config {
                            message: format!(
                                "handoff message on {} exceeds {MAX_MESSAGE_BYTES} bytes",
                                self.path.display()
                            ),
                        });
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(CorralError::Io {
                        path: self.path.clone(),
                        source: e,
                    });
                }
            }
        }
    }

    fn take_message(&mut self) -> Result<String> {
        String::from_utf8(std::mem::take(&mut self.buf)).map_err(|_| CorralError::Config {
            message: format!("handoff message on {} is not UTF-8", self.path.display()),
        })
    }
}

/// Child-side write end of a handoff pipe.
///
/// Opened early and written once; the message is complete when the writer
/// is consumed by [`HandoffWriter::send`].
#[derive(Debug)]
pub struct HandoffWriter {
    file: File,
    path: PathBuf,
}

impl HandoffWriter {
    /// Opens `path` for writing, creating the pipe if it is absent.
    ///
    /// Blocks until a reader has the pipe open.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created or opened.
    pub fn open(path: &Path) -> Result<Self> {
        make_fifo(path)?;
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| CorralError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Writes the message and closes the write end.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn send(mut self, message: &str) -> Result<()> {
        self.file
            .write_all(message.as_bytes())
            .map_err(|e| CorralError::Io {
                path: self.path.clone(),
                source: e,
            })?;
        tracing::debug!(path = %self.path.display(), bytes = message.len(), "handoff message sent");
        Ok(())
    }
}

/// Publishes `message` on the pipe at `path` in one step.
///
/// # Errors
///
/// Returns an error if the pipe cannot be created, opened, or written.
pub fn send(path: &Path, message: &str) -> Result<()> {
    HandoffWriter::open(path)?.send(message)
}

/// Creates a FIFO at `path`, treating an existing FIFO as success.
fn make_fifo(path: &Path) -> Result<()> {
    use nix::sys::stat::Mode;

    match nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => {
            let meta = std::fs::symlink_metadata(path).map_err(|e| CorralError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;
            if meta.file_type().is_fifo() {
                Ok(())
            } else {
                Err(CorralError::Config {
                    message: format!("{} exists and is not a named pipe", path.display()),
                })
            }
        }
        Err(e) => Err(CorralError::Io {
            path: path.to_path_buf(),
            source: e.into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn recv_within(reader: &mut HandoffReader, limit: Duration) -> Result<Option<String>> {
        let started = Instant::now();
        loop {
            match reader.try_recv()? {
                Some(message) => return Ok(Some(message)),
                None if started.elapsed() >= limit => return Ok(None),
                None => std::thread::sleep(POLL_INTERVAL),
            }
        }
    }

    #[test]
    fn message_round_trips_byte_for_byte() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = HandoffChannel::create(dir.path().join("h.fifo")).expect("create");
        let mut reader = channel.open_reader().expect("reader");
        let path = channel.path().to_path_buf();

        let writer = std::thread::spawn(move || send(&path, "k3j9a0b1c2d3e4f5g6h7i8j9k0l1m2n3"));
        let received = recv_within(&mut reader, Duration::from_secs(5))
            .expect("receive")
            .expect("message before deadline");
        writer.join().expect("join").expect("send");

        assert_eq!(received, "k3j9a0b1c2d3e4f5g6h7i8j9k0l1m2n3");
    }

    #[test]
    fn try_recv_is_empty_before_writer_connects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = HandoffChannel::create(dir.path().join("idle.fifo")).expect("create");
        let mut reader = channel.open_reader().expect("reader");
        assert!(reader.try_recv().expect("poll").is_none());
    }

    #[test]
    fn nothing_arrives_without_writer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = HandoffChannel::create(dir.path().join("slow.fifo")).expect("create");
        let mut reader = channel.open_reader().expect("reader");
        let received = recv_within(&mut reader, Duration::from_millis(50)).expect("poll");
        assert!(received.is_none());
    }

    #[test]
    fn message_survives_writer_exit_before_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = HandoffChannel::create(dir.path().join("early.fifo")).expect("create");
        let mut reader = channel.open_reader().expect("reader");
        send(channel.path(), "done").expect("send");
        assert_eq!(reader.try_recv().expect("poll").as_deref(), Some("done"));
    }

    #[test]
    fn writer_tolerates_existing_pipe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("reuse.fifo");
        make_fifo(&path).expect("first mkfifo");
        make_fifo(&path).expect("existing pipe is fine");
    }

    #[test]
    fn existing_regular_file_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plain");
        std::fs::write(&path, b"x").expect("write");
        assert!(matches!(
            HandoffChannel::create(&path),
            Err(CorralError::Config { .. })
        ));
    }

    #[test]
    fn drop_unlinks_pipe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gone.fifo");
        drop(HandoffChannel::create(&path).expect("create"));
        assert!(!path.exists());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let channel = HandoffChannel::create(dir.path().join("big.fifo")).expect("create");
        let mut reader = channel.open_reader().expect("reader");
        let path = channel.path().to_path_buf();

        let writer = std::thread::spawn(move || {
            let _ = send(&path, &"x".repeat(MAX_MESSAGE_BYTES + 1024));
        });
        let result = recv_within(&mut reader, Duration::from_secs(5));
        drop(reader);
        writer.join().expect("join");
        assert!(result.is_err());
    }
}
