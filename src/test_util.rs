#![cfg(test)]

use std::env;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

/// Per-test scratch directory standing in for the cgroup mount root.
///
/// Stale state left by an aborted run would trip the pre-existing-leaf
/// refusal, so construction clears the path before recreating it. The
/// directory is removed again when the value goes out of scope.
pub struct TestRoot {
    path: PathBuf,
}

impl TestRoot {
    pub fn new(test_name: &str) -> Self {
        let path = env::temp_dir().join("cgtether-tests").join(test_name);
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).expect("create test root");
        Self { path }
    }
}

impl Drop for TestRoot {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

impl Deref for TestRoot {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.path
    }
}

/// Writes a fixture file, creating intermediate directories as needed.
pub fn seed_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create fixture parent");
    }
    fs::write(&path, contents).expect("write fixture file");
    path
}
