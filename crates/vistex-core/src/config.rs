//! Streaming Configuration

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{StreamingError, StreamingResult};

/// Virtual texture streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Depth of the multi-buffered feedback readback ring
    pub max_cached_frames: u32,
    /// Entries in the shared indirection table
    pub max_indirection_count: u32,
    /// Page size in texels, without borders
    pub page_size: u32,
    /// Border texels on each side of a page (4 is the minimum for block compression)
    pub border_size: u32,
    /// Screen pixels per feedback block side
    pub feedback_block_size: u32,
    /// Pages handed to the loader per frame
    pub max_requests_per_frame: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_cached_frames: 2,
            max_indirection_count: 32768,
            page_size: 256,
            border_size: 4,
            feedback_block_size: 24,
            max_requests_per_frame: 4,
        }
    }
}

impl StreamingConfig {
    /// Side of one atlas slot: the page plus its borders
    pub fn page_size_with_borders(&self) -> u32 {
        self.page_size + 2 * self.border_size
    }

    /// Parse a configuration from JSON, missing fields take their defaults
    pub fn from_json_str(json: &str) -> StreamingResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|err| StreamingError::InvalidConfig(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_json_file(path: &Path) -> StreamingResult<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|err| StreamingError::InvalidConfig(format!("{}: {err}", path.display())))?;
        Self::from_json_str(&json)
    }

    /// Serialize to pretty JSON
    pub fn to_json_string(&self) -> StreamingResult<String> {
        serde_json::to_string_pretty(self).map_err(|err| StreamingError::InvalidConfig(err.to_string()))
    }

    /// Check that the values can drive a manager
    pub fn validate(&self) -> StreamingResult<()> {
        if self.max_cached_frames == 0 {
            return Err(StreamingError::InvalidConfig(
                "max_cached_frames must be at least 1".into(),
            ));
        }
        if self.max_indirection_count == 0 {
            return Err(StreamingError::InvalidConfig(
                "max_indirection_count must be at least 1".into(),
            ));
        }
        if self.page_size == 0 {
            return Err(StreamingError::InvalidConfig("page_size must be non-zero".into()));
        }
        if self.feedback_block_size == 0 {
            return Err(StreamingError::InvalidConfig(
                "feedback_block_size must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
