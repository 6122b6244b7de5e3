//! The configuration surface: a small builder for the handful of knobs that
//! live outside the immutable on-disk [`crate::header::Header`].
//!
//! Deliberately kept tiny. `row_size` and `skew_ms` are header-level, fixed
//! at `create` time, and never configured per-`open` — they are not
//! duplicated here.

use crate::error::{Error, Result};

const DEFAULT_MAX_OPEN_RETRIES: u32 = 1;

/// Resolved configuration for one [`crate::file_manager::FileManager`].
#[derive(Debug, Clone, Copy)]
pub struct FrozenDbConfig {
    pub(crate) sync_on_append: bool,
    pub(crate) max_open_retries: u32,
}

impl Default for FrozenDbConfig {
    fn default() -> Self {
        Self {
            sync_on_append: false,
            max_open_retries: DEFAULT_MAX_OPEN_RETRIES,
        }
    }
}

/// Builds a [`FrozenDbConfig`], validating each knob as it is set rather
/// than at `build` time.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrozenDbConfigBuilder {
    sync_on_append: Option<bool>,
    max_open_retries: Option<u32>,
}

impl FrozenDbConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the background writer calls `fsync` after every append.
    /// Off by default: callers writing many small rows in a row typically
    /// want to fsync themselves at a coarser granularity.
    pub fn sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = Some(value);
        self
    }

    /// How many times `open` retries acquiring the write lock, on top of
    /// the first attempt, before giving up with `WriteError`. Useful when a
    /// prior `Handle` in the same process is mid-`close`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if `value` is 0 (the first attempt
    /// always happens; 0 retries on top of it is the default, expressed by
    /// not calling this builder method at all).
    pub fn max_open_retries(mut self, value: u32) -> Result<Self> {
        if value == 0 {
            return Err(Error::invalid_input(
                "max_open_retries must be at least 1; omit the call for the default",
            ));
        }
        self.max_open_retries = Some(value);
        Ok(self)
    }

    pub fn build(self) -> FrozenDbConfig {
        FrozenDbConfig {
            sync_on_append: self.sync_on_append.unwrap_or(false),
            max_open_retries: self.max_open_retries.unwrap_or(DEFAULT_MAX_OPEN_RETRIES),
        }
    }
}
