//! Group options
//!
//! Value-type options attached to a color group. Structural equality matters:
//! (color, options) pairs key the group payload cache, and the packed byte
//! feeds group-name derivation, so two option sets are interchangeable
//! exactly when every field matches.

use serde::{Deserialize, Serialize};

// =============================================================================
// RULE POLICY
// =============================================================================

/// Scope of a per-group rule (name label visibility, collision).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RulePolicy {
    Always,
    Never,
    OwnGroupOnly,
    OtherGroupsOnly,
}

impl RulePolicy {
    fn bits(self) -> u8 {
        match self {
            Self::Always => 0,
            Self::Never => 1,
            Self::OwnGroupOnly => 2,
            Self::OtherGroupsOnly => 3,
        }
    }
}

// =============================================================================
// HIGHLIGHT OPTIONS
// =============================================================================

/// Options carried by a color group's create message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HighlightOptions {
    /// Whether members of the group may collide with each other.
    pub allow_self_collision: bool,
    /// Whether members see invisible members of the same group.
    pub see_through_invisibility: bool,
    /// Who sees member name labels.
    pub name_label: RulePolicy,
    /// Who collides with members.
    pub collision: RulePolicy,
}

impl HighlightOptions {
    /// No collision with anyone; labels stay visible.
    pub fn no_collision() -> Self {
        Self {
            collision: RulePolicy::Never,
            ..Self::default()
        }
    }

    /// Name labels hidden from everyone.
    pub fn hide_name_label() -> Self {
        Self {
            name_label: RulePolicy::Never,
            ..Self::default()
        }
    }

    /// No collision and no name labels.
    pub fn ghost() -> Self {
        Self {
            collision: RulePolicy::Never,
            name_label: RulePolicy::Never,
            ..Self::default()
        }
    }

    /// Pack every field into one byte. Injective: two option sets share a
    /// packed byte only if they are equal, which keeps derived group names
    /// unique per option set.
    pub fn packed(&self) -> u8 {
        (self.allow_self_collision as u8)
            | (self.see_through_invisibility as u8) << 1
            | self.name_label.bits() << 2
            | self.collision.bits() << 4
    }
}

impl Default for HighlightOptions {
    fn default() -> Self {
        Self {
            allow_self_collision: false,
            see_through_invisibility: false,
            name_label: RulePolicy::Always,
            collision: RulePolicy::Always,
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = HighlightOptions::default();
        assert!(!options.allow_self_collision);
        assert!(!options.see_through_invisibility);
        assert_eq!(options.name_label, RulePolicy::Always);
        assert_eq!(options.collision, RulePolicy::Always);
        assert_eq!(options.packed(), 0);
    }

    #[test]
    fn test_presets() {
        assert_eq!(HighlightOptions::no_collision().collision, RulePolicy::Never);
        assert_eq!(HighlightOptions::no_collision().name_label, RulePolicy::Always);
        assert_eq!(HighlightOptions::hide_name_label().name_label, RulePolicy::Never);
        let ghost = HighlightOptions::ghost();
        assert_eq!(ghost.collision, RulePolicy::Never);
        assert_eq!(ghost.name_label, RulePolicy::Never);
    }

    #[test]
    fn test_packed_is_injective() {
        // Enumerate the whole option space and check for packed collisions
        let policies = [
            RulePolicy::Always,
            RulePolicy::Never,
            RulePolicy::OwnGroupOnly,
            RulePolicy::OtherGroupsOnly,
        ];
        let mut seen = std::collections::HashMap::new();
        for &allow_self_collision in &[false, true] {
            for &see_through_invisibility in &[false, true] {
                for &name_label in &policies {
                    for &collision in &policies {
                        let options = HighlightOptions {
                            allow_self_collision,
                            see_through_invisibility,
                            name_label,
                            collision,
                        };
                        if let Some(previous) = seen.insert(options.packed(), options) {
                            panic!("packed collision: {previous:?} vs {options:?}");
                        }
                    }
                }
            }
        }
        assert_eq!(seen.len(), 64);
    }

    #[test]
    fn test_packed_layout() {
        let options = HighlightOptions {
            allow_self_collision: true,
            see_through_invisibility: false,
            name_label: RulePolicy::Never,
            collision: RulePolicy::OwnGroupOnly,
        };
        assert_eq!(options.packed(), 0b10_01_0_1);
    }
}
