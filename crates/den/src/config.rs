//! Router configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::door::DEFAULT_LONG_WAIT;
use crate::error::{DenError, Result};
use crate::tier::TierPlan;

/// Default cache size in frames.
pub const DEFAULT_CACHE_FRAMES: usize = 1000;

/// Default archive size in frames: no archive.
pub const DEFAULT_ARCHIVE_FRAMES: usize = 0;

/// How the router treats the archive root at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArchiveMode {
    /// Memory only; nothing is read or written on disk.
    #[default]
    None,
    /// Remove any archive at the root and start a fresh one.
    Create,
    /// Validate, recover and load the archive, then keep writing to it.
    Append,
    /// Validate, recover and load the archive; reject new frames.
    Load,
}

impl ArchiveMode {
    /// Returns true if the mode touches the archive root.
    pub fn uses_root(self) -> bool {
        self != Self::None
    }

    /// Returns true if the mode reads an existing archive.
    pub fn loads_existing(self) -> bool {
        matches!(self, Self::Append | Self::Load)
    }

    /// Returns true if frames may be accepted.
    pub fn accepts_frames(self) -> bool {
        self != Self::Load
    }
}

/// Size limits for one tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TierLimits {
    /// Count-bounded.
    ///
    /// For the cache `chunks` is the desired chunk count (default
    /// `ceil(sqrt(frames))`). For the archive it is the desired chunk-group
    /// count (default 10) and `frames == 0` disables the archive.
    Frames {
        /// Frame limit.
        frames: usize,
        /// Desired unit count.
        chunks: Option<usize>,
    },
    /// Time-bounded on data time.
    Time {
        /// Span after which the open unit closes.
        flush: Duration,
        /// Span of history kept.
        trim: Duration,
    },
}

impl TierLimits {
    /// Count-bounded limits with the default unit count.
    pub fn frames(frames: usize) -> Self {
        Self::Frames {
            frames,
            chunks: None,
        }
    }

    /// Count-bounded limits with an explicit unit count.
    pub fn frames_in(frames: usize, chunks: usize) -> Self {
        Self::Frames {
            frames,
            chunks: Some(chunks),
        }
    }

    /// Time-bounded limits.
    pub fn time(flush: Duration, trim: Duration) -> Self {
        Self::Time { flush, trim }
    }
}

/// Configuration for a partition router.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Archive root directory. Required unless the mode is [`ArchiveMode::None`].
    pub root: Option<PathBuf>,

    /// Archive access mode. Default: [`ArchiveMode::None`].
    pub mode: ArchiveMode,

    /// Cache limits. Default: 1000 frames.
    pub cache: TierLimits,

    /// Archive limits. Default: 0 frames (no archive).
    pub archive: TierLimits,

    /// Door wait or hold time after which a warning is logged. Default: 5 seconds.
    pub long_wait: Duration,

    /// Owner recorded in summary files.
    pub username: Option<String>,

    /// The router answers routed queries; time-bounded limits are rejected.
    pub synchronized: bool,

    /// Tolerate backward-going time when the cache holds exactly one frame
    /// and there is no archive. Default: true.
    pub latest_value_mode: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            root: None,
            mode: ArchiveMode::None,
            cache: TierLimits::frames(DEFAULT_CACHE_FRAMES),
            archive: TierLimits::frames(DEFAULT_ARCHIVE_FRAMES),
            long_wait: DEFAULT_LONG_WAIT,
            username: None,
            synchronized: false,
            latest_value_mode: true,
        }
    }
}

impl RouterConfig {
    /// Sets the archive root and mode.
    pub fn with_archive_root(mut self, root: impl AsRef<Path>, mode: ArchiveMode) -> Self {
        self.root = Some(root.as_ref().to_path_buf());
        self.mode = mode;
        self
    }

    /// Sets the cache limits.
    pub fn with_cache(mut self, limits: TierLimits) -> Self {
        self.cache = limits;
        self
    }

    /// Sets the archive limits.
    pub fn with_archive(mut self, limits: TierLimits) -> Self {
        self.archive = limits;
        self
    }

    /// Sets the long-wait warning threshold.
    pub fn with_long_wait(mut self, long_wait: Duration) -> Self {
        self.long_wait = long_wait;
        self
    }

    /// Sets the username recorded in summaries.
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Marks the router as synchronized.
    pub fn with_synchronized(mut self, synchronized: bool) -> Self {
        self.synchronized = synchronized;
        self
    }

    /// Enables or disables latest-value mode.
    pub fn with_latest_value_mode(mut self, enabled: bool) -> Self {
        self.latest_value_mode = enabled;
        self
    }

    /// Returns the archive root if the mode uses one.
    pub fn archive_root(&self) -> Option<&Path> {
        if self.mode.uses_root() {
            self.root.as_deref()
        } else {
            None
        }
    }

    /// Checks the configuration and computes the tier plan.
    ///
    /// Without an archive root the archive limits are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`DenError::InvalidConfig`] if a root is required but missing,
    /// or if the limits are invalid.
    pub fn plan(&self) -> Result<TierPlan> {
        if self.mode.uses_root() && self.root.is_none() {
            return Err(DenError::InvalidConfig(format!(
                "archive mode {:?} requires an archive root",
                self.mode
            )));
        }
        let archive = self.mode.uses_root().then_some(&self.archive);
        TierPlan::new(&self.cache, archive, self.synchronized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RouterConfig::default();
        assert_eq!(config.mode, ArchiveMode::None);
        assert_eq!(config.long_wait, DEFAULT_LONG_WAIT);
        assert!(config.latest_value_mode);
        assert!(config.archive_root().is_none());
        let plan = config.plan().unwrap();
        assert!(plan.archive.is_none());
    }

    #[test]
    fn test_mode_requires_root() {
        let config = RouterConfig {
            mode: ArchiveMode::Append,
            ..RouterConfig::default()
        };
        assert!(matches!(config.plan(), Err(DenError::InvalidConfig(_))));
    }

    #[test]
    fn test_builders() {
        let config = RouterConfig::default()
            .with_archive_root("/tmp/den", ArchiveMode::Create)
            .with_cache(TierLimits::frames_in(100, 10))
            .with_archive(TierLimits::frames(1000))
            .with_username("operator")
            .with_latest_value_mode(false);
        assert_eq!(config.archive_root(), Some(Path::new("/tmp/den")));
        assert_eq!(config.username.as_deref(), Some("operator"));
        assert!(!config.latest_value_mode);
        assert!(config.plan().unwrap().archive.is_some());
        assert!(ArchiveMode::Load.loads_existing());
        assert!(!ArchiveMode::Load.accepts_frames());
    }
}
