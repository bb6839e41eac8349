//! OS named pipes (FIFOs) used to hand a second input stream to a subprocess

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use parking_lot::Mutex;
use tokio::net::unix::pipe;

/// A FIFO on disk, removed on [`NamedPipe::close`] or drop
#[derive(Debug)]
pub struct NamedPipe {
    path: PathBuf,
    removed: Mutex<bool>,
}

impl NamedPipe {
    /// Create `pipe-{id}.fifo` inside `dir` with mode 0666
    pub fn create(dir: &Path, id: &str) -> io::Result<Self> {
        let path = dir.join(format!("pipe-{}.fifo", id));
        mkfifo(&path, Mode::from_bits_truncate(0o666)).map_err(io::Error::from)?;
        tracing::debug!("Created named pipe {}", path.display());
        Ok(Self {
            path,
            removed: Mutex::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the async writing end.
    ///
    /// The FIFO is opened read-write so the open does not wait for a reader.
    pub fn open_sender(&self) -> io::Result<pipe::Sender> {
        pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&self.path)
    }

    /// Open a blocking read end for a child process.
    ///
    /// Call after [`NamedPipe::open_sender`], otherwise the open blocks until
    /// a writer shows up.
    pub fn open_reader_file(&self) -> io::Result<File> {
        OpenOptions::new().read(true).open(&self.path)
    }

    /// Remove the FIFO from disk; subsequent calls are no-ops
    pub fn close(&self) -> io::Result<()> {
        let mut removed = self.removed.lock();
        if *removed {
            return Ok(());
        }
        *removed = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Drop for NamedPipe {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to remove named pipe {}: {}", self.path.display(), e);
        }
    }
}
