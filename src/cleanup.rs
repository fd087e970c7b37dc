//! Teardown that has to happen on every exit path: kill whatever is
//! still inside the cgroups, then remove the directories this process
//! created.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal as nix_signal;
use nix::sys::signal::Signal;

use crate::cgroups::Manager;
use crate::signal;

const KILL_ROUNDS: usize = 10;
const KILL_ROUND_DELAY: Duration = Duration::from_millis(1);

/// Owns the cgroup registry for the rest of the process lifetime and
/// tears it down exactly once.
///
/// `main` calls [`Cleaner::run`] explicitly before `process::exit`
/// (which skips destructors); the `Drop` impl covers unwinding paths.
/// Either way the second caller finds the flag already set.
pub struct Cleaner {
    manager: Manager,
    done: AtomicBool,
}

impl Cleaner {
    pub fn new(manager: Manager) -> Self {
        Self {
            manager,
            done: AtomicBool::new(false),
        }
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    pub fn run(&self) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }

        // First things first: teardown must not be re-entered by the
        // handlers it is cleaning up after.
        signal::disarm();

        let clear = self.sweep(KILL_ROUNDS, Some(KILL_ROUND_DELAY))
            || self.sweep(KILL_ROUNDS, None);
        if !clear {
            log::warn!("processes are still listed in this helper's cgroups; leaving them behind");
        }

        self.manager.remove();
    }

    // One bounded burst of kill-everything-listed. Returns true once the
    // procfiles are empty.
    fn sweep(&self, rounds: usize, delay: Option<Duration>) -> bool {
        for _ in 0..rounds {
            let pids = match self.manager.get_all_pids() {
                Ok(pids) => pids,
                Err(err) => {
                    // Nothing left to do if the lists cannot be read;
                    // the directories may be gone already.
                    log::warn!("failed to read cgroup process lists: {:#}", err);
                    return true;
                }
            };
            if pids.is_empty() {
                return true;
            }

            log::debug!("killing {} leftover process(es)", pids.len());
            for pid in pids {
                match nix_signal::kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => log::warn!("failed to SIGKILL {}: {}", pid, err),
                }
            }

            if let Some(delay) = delay {
                thread::sleep(delay);
            }
        }
        false
    }
}

impl Drop for Cleaner {
    fn drop(&mut self) {
        self.run();
    }
}
