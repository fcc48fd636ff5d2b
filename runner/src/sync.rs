use chrono::Local;
use std::{
    fs,
    io::{Error, ErrorKind},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

pub const SEMAPHORE_FILE: &str = "pwgsemaphore.txt";

/// Marker present in a slot directory while POWHEG runs in it.
///
/// A marker found before a run means the previous run never returned. It is a crash
/// signal only, no locking is implied.
#[derive(Debug)]
pub struct Semaphore {
    path: PathBuf,
}

impl Semaphore {
    pub fn path(slot_dir: &Path) -> PathBuf {
        slot_dir.join(SEMAPHORE_FILE)
    }

    pub fn exists(slot_dir: &Path) -> bool {
        Self::path(slot_dir).exists()
    }

    /// Create the marker with the current time
    pub fn create(slot_dir: &Path) -> Result<Self, Error> {
        let path = Self::path(slot_dir);
        let created = Local::now().format("%d/%m/%Y, %H:%M:%S");
        fs::write(&path, format!("created: {created}\n"))?;
        debug!("Created semaphore {}", path.display());

        Ok(Self { path })
    }

    pub fn remove(self) -> Result<(), Error> {
        remove_marker(&self.path)
    }
}

/// Remove the marker of `slot_dir` if there is one
pub fn remove_semaphore(slot_dir: &Path) -> Result<(), Error> {
    remove_marker(&Semaphore::path(slot_dir))
}

fn remove_marker(path: &Path) -> Result<(), Error> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed semaphore {}", path.display());
            Ok(())
        }
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => {
            warn!(error = ?error, "Failed to remove semaphore {}", path.display());
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lifecycle() {
        let dir = TempDir::with_prefix("pwhg").unwrap();
        assert!(!Semaphore::exists(dir.path()));

        let semaphore = Semaphore::create(dir.path()).unwrap();
        let content = fs::read_to_string(dir.path().join(SEMAPHORE_FILE)).unwrap();
        assert!(content.starts_with("created: "));
        // dd/mm/YYYY, HH:MM:SS
        assert_eq!(content.trim_end().len(), "created: ".len() + 20);
        assert!(Semaphore::exists(dir.path()));

        semaphore.remove().unwrap();
        assert!(!Semaphore::exists(dir.path()));
        remove_semaphore(dir.path()).unwrap();
    }
}
