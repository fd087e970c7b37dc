//! The event loop: couples the helper's lifetime to its host and to the
//! direct child.
//!
//! Three file descriptors are polled with no timeout: stdin and stdout
//! for the host hanging up, and the signal pipe for anything the kernel
//! delivered. Host hangup is the canonical "my launcher went away" signal
//! from a supervising process that could not send a kill, so it outranks
//! whatever is queued on the pipe.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::process::terminator;
use crate::signal::SignalPipe;

pub struct Supervisor<'a> {
    signals: &'a SignalPipe,
    child: Pid,
    grace: Duration,
}

impl<'a> Supervisor<'a> {
    pub fn new(signals: &'a SignalPipe, child: Pid, grace: Duration) -> Self {
        Self {
            signals,
            child,
            grace,
        }
    }

    /// Runs until the child exits, the host goes away or a termination
    /// signal arrives. The return value is the helper's exit code.
    pub fn run(&self) -> Result<i32> {
        loop {
            // No requested events on the stdio fds: POLLHUP and POLLERR
            // are always reported, and reading host data is not our job.
            let mut fds = [
                PollFd::new(libc::STDIN_FILENO, PollFlags::empty()),
                PollFd::new(self.signals.read_fd(), PollFlags::POLLIN),
                PollFd::new(libc::STDOUT_FILENO, PollFlags::empty()),
            ];
            match poll(&mut fds, -1) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err).context("poll failed"),
            }

            if hangup(&fds[0]) || hangup(&fds[2]) {
                log::debug!("host closed its end; shutting down");
                terminator::graceful_kill(self.child, self.grace);
                return Ok(0);
            }

            // One signal per iteration; the pipe serializes the rest.
            if readable(&fds[1]) {
                if let Some(code) = self.dispatch(self.signals.next()?)? {
                    return Ok(code);
                }
            }
        }
    }

    fn dispatch(&self, signal: Signal) -> Result<Option<i32>> {
        match signal {
            Signal::SIGCHLD => {
                let status = wait_any()?;
                let code = exit_code(self.child, status);
                if code.is_none() {
                    log::debug!("ignoring {:?} for a process that is not the child", status);
                }
                Ok(code)
            }
            Signal::SIGINT | Signal::SIGQUIT | Signal::SIGTERM => {
                // Cleanup runs on every exit and owns descendant killing;
                // no direct kill here.
                log::debug!("shutting down on {}", signal);
                Ok(Some(libc::EXIT_FAILURE))
            }
            other => bail!("unexpected {} on the signal pipe", other),
        }
    }
}

fn wait_any() -> Result<WaitStatus> {
    loop {
        match waitpid(None::<Pid>, None) {
            Ok(status) => return Ok(status),
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err).context("wait failed"),
        }
    }
}

/// The helper's exit code for a wait status, or `None` when the status
/// belongs to a process other than the direct child.
fn exit_code(child: Pid, status: WaitStatus) -> Option<i32> {
    match status {
        WaitStatus::Exited(pid, code) if pid == child => {
            log::debug!("{} exited with {}", pid, code);
            Some(code)
        }
        WaitStatus::Signaled(pid, signal, _) if pid == child => {
            log::debug!("{} was killed by {}", pid, signal);
            Some(libc::EXIT_FAILURE)
        }
        _ => None,
    }
}

fn hangup(fd: &PollFd) -> bool {
    // POLLNVAL covers a host that handed us an already-closed fd.
    fd.revents()
        .map(|revents| {
            revents.intersects(PollFlags::POLLHUP | PollFlags::POLLERR | PollFlags::POLLNVAL)
        })
        .unwrap_or(false)
}

fn readable(fd: &PollFd) -> bool {
    fd.revents()
        .map(|revents| revents.contains(PollFlags::POLLIN))
        .unwrap_or(false)
}
