use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

#[derive(Debug)]
pub struct WorkspaceLockedError;

impl std::fmt::Display for WorkspaceLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "workspace locked by another process")
    }
}

impl std::error::Error for WorkspaceLockedError {}

#[derive(Debug)]
pub struct WorkspaceLock {
    #[allow(dead_code)]
    file: fs::File,
    path: PathBuf,
}

/// Creates `<root>/.pushwork/{automerge/}` so the repository has somewhere
/// to persist its opaque storage on first use.
pub fn ensure_control_dir(control_dir: &Path) -> Result<()> {
    let automerge_dir = control_dir.join("automerge");
    fs::create_dir_all(&automerge_dir)
        .with_context(|| format!("create {}", automerge_dir.display()))?;
    Ok(())
}

impl WorkspaceLock {
    pub fn try_lock(control_dir: &Path) -> Result<Self> {
        fs::create_dir_all(control_dir)
            .with_context(|| format!("create {}", control_dir.display()))?;
        let lock_path = control_dir.join(".lock");
        let file = open_lock_file(&lock_path)?;
        lock_file(&file).context("lock")?;

        Ok(Self {
            file,
            path: lock_path,
        })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(unix)]
fn lock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;

    let rc = unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    let raw = err.raw_os_error();
    if err.kind() == std::io::ErrorKind::WouldBlock || raw == Some(11) || raw == Some(35) {
        return Err(WorkspaceLockedError.into());
    }
    Err(err).context("flock")
}

#[cfg(unix)]
fn unlock_file(file: &fs::File) -> Result<()> {
    use std::os::fd::AsRawFd;
    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }
    const LOCK_UN: i32 = 8;
    let rc = unsafe { flock(file.as_raw_fd(), LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error()).context("flock unlock")
    }
}

#[cfg(windows)]
fn lock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(windows)]
fn unlock_file(_file: &fs::File) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .with_context(|| format!("open {}", lock_path.display()))
}

#[cfg(windows)]
fn open_lock_file(lock_path: &Path) -> Result<fs::File> {
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(lock_path);
    match file {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(WorkspaceLockedError.into()),
        Err(e) => Err(e).with_context(|| format!("open {}", lock_path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_control_dir_creates_automerge_subdir() {
        let tmp = std::env::temp_dir().join("pushwork-workspace-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        ensure_control_dir(&tmp).unwrap();
        assert!(tmp.join("automerge").is_dir());
    }

    #[test]
    fn workspace_lock_is_exclusive_and_released_on_drop() {
        let tmp = std::env::temp_dir().join("pushwork-workspace-lock-test");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let lock1 = WorkspaceLock::try_lock(&tmp).unwrap();
        let err = WorkspaceLock::try_lock(&tmp).unwrap_err();
        let mut found = false;
        for cause in err.chain() {
            if cause.is::<WorkspaceLockedError>() {
                found = true;
                break;
            }
        }
        assert!(found, "expected WorkspaceLockedError, got: {err:#}");

        drop(lock1);
        let _lock2 = WorkspaceLock::try_lock(&tmp).unwrap();
    }
}
