use crate::error::RecorderError;
use chrono::Utc;
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// `<target><suffix>`, next to the target itself.
pub(crate) fn sidecar_path(target: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(target.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Advisory exclusive lock held for as long as a recorder has its target open.
pub(crate) struct TargetLock {
    file: File,
    path: PathBuf,
}

impl TargetLock {
    pub(crate) fn acquire(lock_path: PathBuf, target: &Path) -> Result<Self, RecorderError> {
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(RecorderError::Locked {
                target: target.to_path_buf(),
            });
        }

        let owner = format!(
            "owner_pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339()
        );
        file.set_len(0)?;
        file.write_all(owner.as_bytes())?;
        file.flush()?;

        Ok(Self {
            file,
            path: lock_path,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
