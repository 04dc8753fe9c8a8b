use serde::Deserialize;

use crate::Error;

/// Tunables of a [crate::PersistentFs].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VfsConfig {
    /// Maximum number of ancestors walked when resolving an id. Longer
    /// chains are treated as corruption.
    #[serde(default = "default_depth_limit")]
    pub depth_limit: usize,

    /// Files longer than this are never cached in the record store.
    #[serde(default = "default_content_cache_threshold")]
    pub content_cache_threshold: u64,

    /// Whether callers may ask for content of read-only delegates to be
    /// cached.
    #[serde(default = "default_cache_read_only_content")]
    pub cache_read_only_content: bool,

    /// Internal or test execution. Disables caching of read-only content.
    #[serde(default)]
    pub internal_mode: bool,
}

fn default_depth_limit() -> usize {
    75
}

fn default_content_cache_threshold() -> u64 {
    20 * 1024 * 1024
}

fn default_cache_read_only_content() -> bool {
    true
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            depth_limit: default_depth_limit(),
            content_cache_threshold: default_content_cache_threshold(),
            cache_read_only_content: default_cache_read_only_content(),
            internal_mode: false,
        }
    }
}

impl TryFrom<url::Url> for VfsConfig {
    type Error = Error;

    fn try_from(url: url::Url) -> Result<Self, Self::Error> {
        serde_qs::from_str(url.query().unwrap_or_default())
            .map_err(|e| Error::InvalidRequest(format!("failed to parse parameters: {}", e)))
    }
}
