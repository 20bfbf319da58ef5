//! Configuration
//!
//! Host-tunable knobs, loadable from a TOML file with per-field defaults so
//! a partial config stays valid.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ConfigError;

// =============================================================================
// CONFIGURATION STRUCTURE
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HighlightConfig {
    /// Host default perception radius in regions. The effective radius for a
    /// viewer is the minimum of this and the viewer's configured radius.
    #[serde(default = "default_view_radius")]
    pub view_radius: u32,

    /// Ticks between animation recolor updates.
    #[serde(default = "default_animation_interval")]
    pub animation_interval_ticks: u64,

    /// Host registry id of the invisible proxy entity kind; the protocol
    /// adapter maps it to the wire value for its host version.
    #[serde(default = "default_proxy_kind")]
    pub proxy_kind: u16,

    /// Prefix for derived group names.
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
}

fn default_view_radius() -> u32 {
    10
}
fn default_animation_interval() -> u64 {
    5
}
fn default_proxy_kind() -> u16 {
    0
}
fn default_group_prefix() -> String {
    "lm".to_string()
}

impl Default for HighlightConfig {
    fn default() -> Self {
        Self {
            view_radius: default_view_radius(),
            animation_interval_ticks: default_animation_interval(),
            proxy_kind: default_proxy_kind(),
            group_prefix: default_group_prefix(),
        }
    }
}

impl HighlightConfig {
    /// Load from a TOML file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        info!(
            view_radius = config.view_radius,
            animation_interval = config.animation_interval_ticks,
            "Loaded highlight config"
        );
        Ok(config)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HighlightConfig::default();
        assert_eq!(config.view_radius, 10);
        assert_eq!(config.animation_interval_ticks, 5);
        assert_eq!(config.proxy_kind, 0);
        assert_eq!(config.group_prefix, "lm");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: HighlightConfig = toml::from_str("view_radius = 4").unwrap();
        assert_eq!(config.view_radius, 4);
        assert_eq!(config.animation_interval_ticks, 5);
        assert_eq!(config.group_prefix, "lm");
    }

    #[test]
    fn test_full_toml() {
        let config: HighlightConfig = toml::from_str(
            r#"
            view_radius = 6
            animation_interval_ticks = 2
            proxy_kind = 41
            group_prefix = "hl"
            "#,
        )
        .unwrap();
        assert_eq!(config.view_radius, 6);
        assert_eq!(config.animation_interval_ticks, 2);
        assert_eq!(config.proxy_kind, 41);
        assert_eq!(config.group_prefix, "hl");
    }

    #[test]
    fn test_empty_toml_is_all_defaults() {
        let config: HighlightConfig = toml::from_str("").unwrap();
        assert_eq!(config.view_radius, HighlightConfig::default().view_radius);
    }
}
