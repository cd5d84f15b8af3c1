//! Synchronization primitives exchanged with clients and the kernel
//!
//! A [`Fence`] wraps a sync-file descriptor. It signals once the producer
//! (client rendering, or a kernel commit) is done with the associated buffer.
//! Fences are move-only: handing the same fence to several consumers requires
//! an explicit [`Fence::duplicate`] or [`Fence::duplicate_n`].

use std::{
    io,
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    time::{Duration, Instant},
};

use rustix::event::{poll, PollFd, PollFlags};

/// Error returned when waiting on a [`Fence`]
#[derive(Debug, thiserror::Error)]
pub enum FenceError {
    /// The fence did not signal in time
    #[error("Fence did not signal within {0:?}")]
    Timeout(Duration),
    /// Polling the fence failed
    #[error("Failed to poll fence: {0}")]
    Io(#[from] io::Error),
}

/// Owned sync-file fence
#[must_use = "dropping a fence closes it and loses the synchronization point"]
#[derive(Debug)]
pub struct Fence(OwnedFd);

impl Fence {
    /// Creates a fence from an owned sync-file descriptor
    #[inline]
    pub fn new(fd: OwnedFd) -> Fence {
        Fence(fd)
    }

    /// Creates an independent handle referring to the same synchronization point
    pub fn duplicate(&self) -> io::Result<Fence> {
        self.0.try_clone().map(Fence)
    }

    /// Creates `n` independent handles for `n` consumers
    pub fn duplicate_n(&self, n: usize) -> io::Result<Vec<Fence>> {
        (0..n).map(|_| self.duplicate()).collect()
    }

    /// Returns true if the fence has already signaled
    pub fn is_signaled(&self) -> bool {
        let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
        matches!(poll(&mut fds, 0), Ok(n) if n > 0)
    }

    /// Blocks until the fence signals or `timeout` expires
    pub fn wait(&self, timeout: Duration) -> Result<(), FenceError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(i32::MAX as u128) as i32;
            let mut fds = [PollFd::new(&self.0, PollFlags::IN)];
            match poll(&mut fds, millis) {
                Ok(0) => return Err(FenceError::Timeout(timeout)),
                Ok(_) => return Ok(()),
                Err(rustix::io::Errno::INTR) | Err(rustix::io::Errno::AGAIN) => continue,
                Err(err) => return Err(FenceError::Io(err.into())),
            }
        }
    }

    /// Gives up ownership of the underlying file descriptor
    #[inline]
    pub fn into_owned_fd(self) -> OwnedFd {
        self.0
    }
}

impl From<OwnedFd> for Fence {
    #[inline]
    fn from(fd: OwnedFd) -> Self {
        Fence(fd)
    }
}

impl AsFd for Fence {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl AsRawFd for Fence {
    #[inline]
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}
