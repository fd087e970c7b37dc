use std::ffi::CString;

use anyhow::{Context, Result};
use nix::unistd::{self, ForkResult, Pid};

use crate::cgroups::Manager;
use crate::opts::Config;

/// Forks the contained child and returns its pid to the parent.
///
/// The child joins every cgroup, drops privileges and execs the program;
/// it never returns here. Attachment happens on the child side of the
/// fork so the process is inside the cgroups before arbitrary code runs.
/// The parent keeps its own privileges: it still has to write procfiles
/// and remove cgroup directories during cleanup.
pub fn spawn(config: &Config, manager: &Manager) -> Result<Pid> {
    match unsafe { unistd::fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            log::debug!("spawned {} as {}", config.program, child);
            Ok(child)
        }
        ForkResult::Child => {
            if let Err(err) = exec_in_cgroups(config, manager) {
                eprintln!("cgtether: {:#}", err);
            }
            // Exit without unwinding: cleanup belongs to the parent.
            std::process::exit(libc::EXIT_FAILURE);
        }
    }
}

fn exec_in_cgroups(config: &Config, manager: &Manager) -> Result<()> {
    manager
        .add_task(unistd::getpid())
        .context("failed to join cgroups")?;

    // Group first: once the real uid is dropped this process may no
    // longer be permitted to change groups.
    if let Some(gid) = config.gid {
        unistd::setgid(gid).with_context(|| format!("setgid({}) failed", gid))?;
    }
    if let Some(uid) = config.uid {
        unistd::setuid(uid).with_context(|| format!("setuid({}) failed", uid))?;
    }

    let program =
        CString::new(config.program.as_str()).context("program name contains a NUL byte")?;
    let args = config
        .args
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect::<Result<Vec<_>, _>>()
        .context("argument contains a NUL byte")?;

    unistd::execvp(&program, &args)
        .with_context(|| format!("failed to exec {:?}", config.program))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nix::sys::wait::{waitpid, WaitStatus};

    fn command(args: &[&str]) -> Config {
        Config {
            cgroup_path: None,
            controllers: Vec::new(),
            grace: Duration::from_micros(0),
            uid: None,
            gid: None,
            program: args[0].to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }

    #[test]
    fn child_exit_status_is_observable() {
        let manager = Manager::new(None, &[]);
        let child = spawn(&command(&["/bin/sh", "-c", "exit 7"]), &manager).expect("spawn");

        match waitpid(child, None).expect("wait for child") {
            WaitStatus::Exited(pid, code) => {
                assert_eq!(pid, child);
                assert_eq!(code, 7);
            }
            status => panic!("unexpected wait status {:?}", status),
        }
    }

    #[test]
    fn exec_failure_surfaces_as_a_nonzero_exit() {
        let manager = Manager::new(None, &[]);
        let child = spawn(&command(&["/no/such/program-cgtether"]), &manager).expect("spawn");

        match waitpid(child, None).expect("wait for child") {
            WaitStatus::Exited(_, code) => assert_ne!(code, 0),
            status => panic!("unexpected wait status {:?}", status),
        }
    }
}
