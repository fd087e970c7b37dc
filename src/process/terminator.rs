use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Ends the direct child: SIGTERM, a bounded grace period, SIGKILL.
///
/// Only the direct child is signalled here. Descendants are collected
/// through the cgroup procfiles during cleanup, which survives double
/// forks and new sessions where process-tree walks do not.
pub fn graceful_kill(pid: Pid, grace: Duration) {
    log::debug!("sending SIGTERM to {}", pid);
    send(pid, Signal::SIGTERM);

    if grace > Duration::from_micros(0) {
        thread::sleep(grace);
    }

    log::debug!("sending SIGKILL to {}", pid);
    send(pid, Signal::SIGKILL);
}

fn send(pid: Pid, signal: Signal) {
    match kill(pid, signal) {
        // Already gone is exactly what we wanted.
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => log::warn!("failed to send {} to {}: {}", signal, pid, err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    use nix::sys::wait::{waitpid, WaitStatus};

    #[test]
    fn terminates_within_the_grace_period() {
        let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);

        graceful_kill(pid, Duration::from_millis(100));

        match waitpid(pid, None).expect("wait for sleep") {
            WaitStatus::Signaled(_, signal, _) => assert_eq!(signal, Signal::SIGTERM),
            status => panic!("unexpected wait status {:?}", status),
        }
    }

    #[test]
    fn a_zero_grace_escalates_immediately() {
        let child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        let pid = Pid::from_raw(child.id() as i32);

        graceful_kill(pid, Duration::from_micros(0));

        match waitpid(pid, None).expect("wait for sleep") {
            WaitStatus::Signaled(_, signal, _) => {
                assert!(signal == Signal::SIGTERM || signal == Signal::SIGKILL)
            }
            status => panic!("unexpected wait status {:?}", status),
        }
    }

    #[test]
    fn signalling_a_dead_pid_is_harmless() {
        let child = Command::new("true").spawn().expect("spawn true");
        let pid = Pid::from_raw(child.id() as i32);
        waitpid(pid, None).expect("reap true");

        // The pid no longer exists; both sends hit ESRCH and are ignored.
        graceful_kill(pid, Duration::from_micros(0));
    }
}
