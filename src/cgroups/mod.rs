//! Creation, configuration and teardown of the per-controller cgroup
//! directories this helper owns.
//!
//! The layout is the classic v1 one: `<root>/<controller>/<path>`, with
//! `<root>` fixed at [`DEFAULT_CGROUP_ROOT`]. The helper refuses to
//! attach to a directory it did not create, so it can never co-tenant
//! with, or later delete, somebody else's cgroup.

use std::cell::Cell;
use std::fs::{self, DirBuilder};
use std::io::{self, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::unistd::Pid;

pub const CGROUP_PROCS: &str = "cgroup.procs";
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// A controller as named on the command line, with its settings in
/// declaration order. Declaration order is write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub name: String,
    pub settings: Vec<(String, String)>,
}

impl ControllerConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            settings: Vec::new(),
        }
    }
}

#[derive(Debug)]
struct Controller {
    settings: Vec<(String, String)>,
    dir: PathBuf,
    // Set once this process has made the directory; `remove` only ever
    // touches directories whose flag is set.
    created: Cell<bool>,
}

impl Controller {
    fn new(root: &Path, cgroup_path: &str, config: &ControllerConfig) -> Self {
        Self {
            settings: config.settings.clone(),
            dir: root.join(&config.name).join(cgroup_path),
            created: Cell::new(false),
        }
    }

    fn procs_path(&self) -> PathBuf {
        self.dir.join(CGROUP_PROCS)
    }

    fn create(&self) -> Result<()> {
        if self.dir.exists() {
            bail!(
                "cgroup {:?} already exists; choose a deeper path or clean it up",
                self.dir
            );
        }
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&self.dir)
            .with_context(|| format!("failed to create cgroup {:?}", self.dir))?;
        self.created.set(true);
        Ok(())
    }

    fn apply(&self) -> Result<()> {
        for (key, value) in &self.settings {
            log::debug!("set {}={} in {:?}", key, value, self.dir);
            self.write_control(key, value)?;
        }
        Ok(())
    }

    fn add_task(&self, pid: Pid) -> Result<()> {
        self.write_control(CGROUP_PROCS, &pid.to_string())
    }

    // Control files are materialized by the kernel when the directory is
    // made; they are never created or truncated from here.
    fn write_control(&self, file: &str, data: &str) -> Result<()> {
        let path = self.dir.join(file);
        let mut handle = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("cgroup file {:?} is not writable", path))?;
        handle
            .write_all(data.as_bytes())
            .with_context(|| format!("short write to cgroup file {:?}", path))?;
        Ok(())
    }

    fn pids(&self) -> Result<Vec<Pid>> {
        let procs = self.procs_path();
        let content = match fs::read_to_string(&procs) {
            Ok(content) => content,
            // The controller may already have been torn down externally.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {:?}", procs))
            }
        };

        let mut pids = Vec::new();
        for entry in content.split_whitespace() {
            let raw: i32 = entry
                .parse()
                .with_context(|| format!("invalid pid {:?} in {:?}", entry, procs))?;
            pids.push(Pid::from_raw(raw));
        }
        Ok(pids)
    }

    fn remove(&self) {
        if !self.created.get() {
            return;
        }
        if let Err(err) = fs::remove_dir(&self.dir) {
            log::debug!("leaving cgroup {:?} behind: {}", self.dir, err);
        }
    }
}

/// The ordered controller registry. Construction computes paths only;
/// nothing touches the filesystem until [`Manager::create`].
#[derive(Debug)]
pub struct Manager {
    controllers: Vec<Controller>,
}

impl Manager {
    pub fn new(cgroup_path: Option<&str>, configs: &[ControllerConfig]) -> Self {
        Self::with_root(Path::new(DEFAULT_CGROUP_ROOT), cgroup_path, configs)
    }

    pub fn with_root(root: &Path, cgroup_path: Option<&str>, configs: &[ControllerConfig]) -> Self {
        let controllers = match cgroup_path {
            Some(path) => configs
                .iter()
                .map(|config| Controller::new(root, path, config))
                .collect(),
            None => Vec::new(),
        };

        Self { controllers }
    }

    /// Creates every controller directory, in declaration order, with
    /// mode 0755. A pre-existing leaf is a hard error and is left alone.
    pub fn create(&self) -> Result<()> {
        for controller in &self.controllers {
            log::debug!("create cgroup {:?}", controller.dir);
            controller.create()?;
        }
        Ok(())
    }

    /// Writes every controller's settings, in declaration order.
    pub fn apply(&self) -> Result<()> {
        for controller in &self.controllers {
            controller.apply()?;
        }
        Ok(())
    }

    /// Adds a task specified by its pid to every controller's cgroup.
    pub fn add_task(&self, pid: Pid) -> Result<()> {
        for controller in &self.controllers {
            controller.add_task(pid)?;
        }
        Ok(())
    }

    /// Gets the pids currently inside any of the cgroups. Missing
    /// procfiles count as empty.
    pub fn get_all_pids(&self) -> Result<Vec<Pid>> {
        let mut pids = Vec::new();
        for controller in &self.controllers {
            for pid in controller.pids()? {
                if !pids.contains(&pid) {
                    pids.push(pid);
                }
            }
        }
        Ok(pids)
    }

    /// Removes the cgroup directories this process created, best-effort.
    pub fn remove(&self) {
        for controller in &self.controllers {
            controller.remove();
        }
    }
}
