//! Component D: the self-pipe used to wake the scheduler thread out of its
//! blocking multiplexer wait when a worker thread decides a future.

use std::io;
use std::os::unix::io::RawFd;

use log::warn;

/// The two ends of a wakeup channel: `read` is watched by the scheduler's
/// multiplexer, `write` is handed out to anything that needs to interrupt
/// it (a dispatched future's producer thread).
#[derive(Debug, Clone, Copy)]
pub(crate) struct WakeupChannel {
    pub(crate) read: RawFd,
    pub(crate) write: RawFd,
}

impl WakeupChannel {
    /// Creates a pipe with both ends non-blocking, mirroring the original
    /// self-pipe trick: a `write` never blocks the caller, and a `read`
    /// that races an empty pipe returns `EAGAIN` instead of blocking the
    /// scheduler a second time.
    pub(crate) fn create() -> io::Result<Self> {
        let mut fds = [0; 2];
        // SAFETY: `fds` is a valid pointer to two `c_int`s for `pipe` to
        // populate.
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let channel = WakeupChannel { read: fds[0], write: fds[1] };
        set_nonblocking(channel.read)?;
        set_nonblocking(channel.write)?;
        Ok(channel)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: `fd` is a valid, open file descriptor owned by this process.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Writes a single byte to the wakeup channel's write end, interrupting a
/// scheduler thread blocked in the multiplexer. Safe to call from any
/// thread, any number of times; a full pipe buffer (the scheduler hasn't
/// drained it yet) is not an error, it just means the wakeup is already
/// pending.
pub(crate) fn signal(write_fd: RawFd) {
    let byte: u8 = 1;
    // SAFETY: `write_fd` is a valid fd for the lifetime of the scheduler
    // that owns it; writing one byte cannot touch memory outside `byte`.
    let n = unsafe { libc::write(write_fd, &byte as *const u8 as *const libc::c_void, 1) };
    if n < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::WouldBlock {
            warn!("wakeup channel write failed: {}", err);
        }
    }
}

/// Drains every byte currently buffered in the wakeup channel's read end.
/// Called by the scheduler right after a multiplexer wait that reported
/// the read end readable, so the next wait doesn't immediately return
/// again on a stale signal.
pub(crate) fn drain(read_fd: RawFd) {
    let mut buf = [0u8; 64];
    loop {
        // SAFETY: `buf` is a valid, 64-byte buffer for `read` to fill.
        let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                warn!("wakeup channel drain failed: {}", err);
            }
            return;
        }
        if (n as usize) < buf.len() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_then_drain_round_trips() {
        let channel = WakeupChannel::create().unwrap();
        signal(channel.write);
        signal(channel.write);
        drain(channel.read);
        // A second drain on an empty, non-blocking pipe must not hang.
        drain(channel.read);
    }
}
