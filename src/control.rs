//! External on/off switch
//!
//! The engine polls a [`ControlFlag`] before each cycle and wave, and workers
//! poll it between items. A flag that cannot be read counts as disabled.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// A boolean set outside the harvester
pub trait ControlFlag: Send + Sync {
    fn is_enabled(&self) -> bool;
}

/// In-process switch, shared by cloning
#[derive(Debug, Clone)]
pub struct SharedSwitch {
    enabled: Arc<AtomicBool>,
}

impl SharedSwitch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

impl ControlFlag for SharedSwitch {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Flag read from a file on every poll
///
/// `1`, `true`, `on` and `enabled` (any case, surrounding whitespace ignored)
/// enable the harvester; any other content, a missing file or a read error
/// disables it.
#[derive(Debug, Clone)]
pub struct FileFlag {
    path: PathBuf,
}

impl FileFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ControlFlag for FileFlag {
    fn is_enabled(&self) -> bool {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => matches!(
                content.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "on" | "enabled"
            ),
            Err(e) => {
                debug!("Control flag {} unreadable: {}", self.path.display(), e);
                false
            }
        }
    }
}

/// Enabled only while every inner flag is
pub struct AllOf(pub Vec<Arc<dyn ControlFlag>>);

impl ControlFlag for AllOf {
    fn is_enabled(&self) -> bool {
        self.0.iter().all(|flag| flag.is_enabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_shared_switch() {
        let switch = SharedSwitch::new(true);
        let clone = switch.clone();
        assert!(clone.is_enabled());

        switch.disable();
        assert!(!clone.is_enabled());
    }

    #[test]
    fn test_file_flag_values() {
        let mut file = NamedTempFile::new().unwrap();
        let flag = FileFlag::new(file.path());

        write!(file, " On\n").unwrap();
        file.flush().unwrap();
        assert!(flag.is_enabled());

        file.as_file().set_len(0).unwrap();
        assert!(!flag.is_enabled());
    }

    #[test]
    fn test_missing_file_is_disabled() {
        let flag = FileFlag::new("/nonexistent/harvest.flag");
        assert!(!flag.is_enabled());
    }

    #[test]
    fn test_all_of() {
        let a = SharedSwitch::new(true);
        let b = SharedSwitch::new(false);
        let both = AllOf(vec![Arc::new(a), Arc::new(b.clone())]);
        assert!(!both.is_enabled());

        b.enable();
        assert!(both.is_enabled());
    }
}
