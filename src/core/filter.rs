//! Outbound state-sync patch filter
//!
//! The host keeps sending its own state-sync messages for entities we
//! highlight; without interception those would clear the highlight bit on
//! every unrelated attribute change. A `StatePatchFilter` sits on the
//! viewer's outbound path and ORs the required flag bits into any state-sync
//! message for a highlighted target, reading whatever flag byte the message
//! carries at that moment so last-writer-wins is preserved for every other
//! bit.
//!
//! The filter runs on I/O threads; the lookup goes through a lock-free read
//! of the entity manager's record table and the pass-through path performs
//! no allocation.

use std::sync::Arc;

use super::protocol::{ProtocolAdapter, StateSyncMessage};
use super::types::{TargetId, ViewerId};

/// Accessor resolving a target id to the patched flag byte it should carry,
/// or `None` when the target is not highlighted for this viewer.
pub type FlagLookup = Arc<dyn Fn(TargetId) -> Option<u8> + Send + Sync>;

/// Per-viewer interceptor over outbound entity state-sync messages.
pub struct StatePatchFilter {
    viewer: ViewerId,
    lookup: FlagLookup,
}

impl StatePatchFilter {
    pub fn new(viewer: ViewerId, lookup: FlagLookup) -> Self {
        Self { viewer, lookup }
    }

    pub fn viewer(&self) -> ViewerId {
        self.viewer
    }

    /// Inspect one outbound message. Returns `None` when the message should
    /// pass through unchanged (not a highlighted target, or the flag byte
    /// already carries every required bit), otherwise the rebuilt message.
    pub fn apply(
        &self,
        adapter: &dyn ProtocolAdapter,
        message: &StateSyncMessage,
    ) -> Option<StateSyncMessage> {
        let required = (self.lookup)(message.target_id)?;

        match adapter.read_flags_attribute(message) {
            Some(current) => {
                let merged = current | required;
                if merged == current {
                    None
                } else {
                    Some(adapter.write_flags_attribute(message, merged))
                }
            }
            // No flags attribute in this message: append one, but only when
            // there is actually something to patch in.
            None if required != 0 => Some(adapter.write_flags_attribute(message, required)),
            None => None,
        }
    }
}

impl std::fmt::Debug for StatePatchFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatePatchFilter")
            .field("viewer", &self.viewer)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::mocks::RecordingAdapter;
    use crate::core::protocol::{
        Attribute, AttributeValue, FLAGS_ATTRIBUTE, HIGHLIGHT_FLAG,
    };

    const VIEWER: ViewerId = ViewerId(1);
    const GLOWING: TargetId = TargetId(7);

    fn filter_for_glowing() -> StatePatchFilter {
        StatePatchFilter::new(
            VIEWER,
            Arc::new(|target| (target == GLOWING).then_some(HIGHLIGHT_FLAG)),
        )
    }

    fn message_with_flags(target: TargetId, flags: u8) -> StateSyncMessage {
        StateSyncMessage::new(
            target,
            vec![Attribute {
                index: FLAGS_ATTRIBUTE,
                value: AttributeValue::Byte(flags),
            }],
        )
    }

    #[test]
    fn test_patches_highlighted_target() {
        let adapter = RecordingAdapter::new();
        let filter = filter_for_glowing();

        let patched = filter
            .apply(&adapter, &message_with_flags(GLOWING, 0b0001_0000))
            .expect("message must be rebuilt");
        assert_eq!(
            patched.byte_attribute(FLAGS_ATTRIBUTE),
            Some(0b0101_0000)
        );
    }

    #[test]
    fn test_passes_through_non_highlighted_target() {
        let adapter = RecordingAdapter::new();
        let filter = filter_for_glowing();

        let message = message_with_flags(TargetId(8), 0b0001_0000);
        assert!(filter.apply(&adapter, &message).is_none());
        // Caller keeps the original message byte-identical
        assert_eq!(message.byte_attribute(FLAGS_ATTRIBUTE), Some(0b0001_0000));
    }

    #[test]
    fn test_no_rebuild_when_bit_already_present() {
        let adapter = RecordingAdapter::new();
        let filter = filter_for_glowing();

        let message = message_with_flags(GLOWING, HIGHLIGHT_FLAG | 0x01);
        assert!(filter.apply(&adapter, &message).is_none());
    }

    #[test]
    fn test_appends_flags_attribute_when_absent() {
        let adapter = RecordingAdapter::new();
        let filter = filter_for_glowing();

        let message = StateSyncMessage::new(
            GLOWING,
            vec![Attribute {
                index: 5,
                value: AttributeValue::Raw(vec![1, 2]),
            }],
        );
        let patched = filter.apply(&adapter, &message).expect("appended");
        assert_eq!(patched.attributes.len(), 2);
        assert_eq!(patched.byte_attribute(FLAGS_ATTRIBUTE), Some(HIGHLIGHT_FLAG));
    }

    #[test]
    fn test_zero_patch_with_absent_attribute_passes_through() {
        let adapter = RecordingAdapter::new();
        let filter = StatePatchFilter::new(VIEWER, Arc::new(|_| Some(0)));

        let message = StateSyncMessage::new(GLOWING, Vec::new());
        assert!(filter.apply(&adapter, &message).is_none());
    }

    #[test]
    fn test_reads_current_message_value_not_a_cached_one() {
        let adapter = RecordingAdapter::new();
        let filter = filter_for_glowing();

        // Same target, two different in-flight flag bytes: each patch is
        // computed from the byte present in that message.
        let first = filter
            .apply(&adapter, &message_with_flags(GLOWING, 0b0000_0001))
            .unwrap();
        let second = filter
            .apply(&adapter, &message_with_flags(GLOWING, 0b0010_0000))
            .unwrap();
        assert_eq!(first.byte_attribute(FLAGS_ATTRIBUTE), Some(0b0100_0001));
        assert_eq!(second.byte_attribute(FLAGS_ATTRIBUTE), Some(0b0110_0000));
    }
}
