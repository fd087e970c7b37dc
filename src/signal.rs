//! Funnels delivered signals into a pipe the event loop can poll.
//!
//! The handler does the only async-signal-safe thing it can: write the
//! signal number, as a fixed-width integer, to the pipe. Everything else
//! happens in the supervisor, in ordinary application code.

use std::convert::TryFrom;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;

pub const HANDLED_SIGNALS: [Signal; 4] = [
    Signal::SIGCHLD,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGTERM,
];

static PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signum: libc::c_int) {
    let fd = PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }

    // A write this small is atomic up to PIPE_BUF, and nothing
    // async-signal-safe can report a failure, so the result is dropped.
    let bytes = signum.to_ne_bytes();
    unsafe {
        libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

/// The read side of the self-pipe. One writer (the handler), one reader
/// (the event loop).
pub struct SignalPipe {
    read_fd: RawFd,
}

impl SignalPipe {
    /// Creates the pipe, then installs one handler for every signal in
    /// [`HANDLED_SIGNALS`]. The pipe has to exist before the first
    /// handler is in place. Both ends are close-on-exec so the program
    /// the child execs does not inherit them.
    pub fn install() -> Result<Self> {
        let (read_fd, write_fd) = unistd::pipe().context("failed to create signal pipe")?;
        for &fd in &[read_fd, write_fd] {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .context("failed to set FD_CLOEXEC on the signal pipe")?;
        }
        PIPE_WRITE_FD.store(write_fd, Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for signal in &HANDLED_SIGNALS {
            unsafe { sigaction(*signal, &action) }
                .with_context(|| format!("failed to install a handler for {}", signal))?;
        }

        Ok(Self { read_fd })
    }

    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Reads the next delivered signal off the pipe, blocking until one
    /// arrives.
    pub fn next(&self) -> Result<Signal> {
        let mut bytes = [0u8; mem::size_of::<libc::c_int>()];
        let mut filled = 0;
        while filled < bytes.len() {
            match unistd::read(self.read_fd, &mut bytes[filled..]) {
                Ok(0) => bail!("signal pipe closed unexpectedly"),
                Ok(n) => filled += n,
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("failed to read from the signal pipe"),
            }
        }

        let signum = libc::c_int::from_ne_bytes(bytes);
        Signal::try_from(signum).with_context(|| format!("unexpected signal number {}", signum))
    }
}

/// Restores the default disposition of every handled signal. Cleanup
/// calls this first so teardown cannot be interrupted by its own
/// handlers.
pub fn disarm() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in &HANDLED_SIGNALS {
        if let Err(err) = unsafe { sigaction(*signal, &action) } {
            log::warn!("failed to restore the default handler for {}: {}", signal, err);
        }
    }
}
