//! Wire message construction and the protocol adapter seam
//!
//! The crate never encodes host wire formats itself. Everything outbound is
//! built through [`ProtocolAdapter`], one concrete implementation per
//! supported host version; all version-sensitive code stays behind this
//! single seam. The shipped [`QueueAdapter`] encodes the structured
//! [`WireCommand`] model as JSON and enqueues bytes on per-viewer channels,
//! which is enough for thin hosts and for driving the full pipeline in
//! integration setups.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::color::HighlightColor;
use super::error::AdapterError;
use super::filter::StatePatchFilter;
use super::options::HighlightOptions;
use super::types::{TargetId, ViewerId, WorldPos};

// =============================================================================
// FLAG CONSTANTS
// =============================================================================

/// Bit in the entity flag byte that renders the highlight outline.
pub const HIGHLIGHT_FLAG: u8 = 1 << 6;

/// Bit in the entity flag byte that hides the entity model.
pub const INVISIBLE_FLAG: u8 = 1 << 5;

/// Attribute index carrying the entity flag byte in a state-sync message.
pub const FLAGS_ATTRIBUTE: u8 = 0;

// =============================================================================
// MESSAGES
// =============================================================================

/// An opaque, fully encoded wire payload. Cheap to clone; the bytes are
/// shared, which is what makes the group payload caches worthwhile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    bytes: Arc<[u8]>,
}

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Direction of a group membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipMode {
    Add,
    Remove,
}

/// Host registry id of an entity kind used for proxy spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyKind(pub u16);

// =============================================================================
// STATE-SYNC MESSAGES
// =============================================================================

/// One attribute of an entity state-sync message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub index: u8,
    pub value: AttributeValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    Byte(u8),
    Raw(Vec<u8>),
}

/// A decoded view of an outbound entity state-sync message, the one message
/// shape the outbound filter needs to inspect and patch. The host's I/O
/// layer produces these for its own sync traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSyncMessage {
    pub target_id: TargetId,
    pub attributes: Vec<Attribute>,
}

impl StateSyncMessage {
    pub fn new(target_id: TargetId, attributes: Vec<Attribute>) -> Self {
        Self { target_id, attributes }
    }

    /// Read a byte attribute by index, if present.
    pub fn byte_attribute(&self, index: u8) -> Option<u8> {
        self.attributes.iter().find_map(|attr| match attr.value {
            AttributeValue::Byte(value) if attr.index == index => Some(value),
            _ => None,
        })
    }

    /// Copy of this message with the byte attribute replaced, or appended if
    /// the message did not carry it.
    pub fn with_byte_attribute(&self, index: u8, value: u8) -> Self {
        let mut attributes = self.attributes.clone();
        match attributes
            .iter_mut()
            .find(|attr| attr.index == index && matches!(attr.value, AttributeValue::Byte(_)))
        {
            Some(attr) => attr.value = AttributeValue::Byte(value),
            None => attributes.push(Attribute {
                index,
                value: AttributeValue::Byte(value),
            }),
        }
        Self {
            target_id: self.target_id,
            attributes,
        }
    }
}

// =============================================================================
// WIRE COMMAND MODEL
// =============================================================================

/// Structured model of every message the crate asks an adapter to build.
/// [`QueueAdapter`] serializes these as JSON; host-native adapters emit
/// their own wire bytes instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireCommand {
    FlagPatch {
        target_id: TargetId,
        flags: u8,
    },
    GroupCreate {
        name: String,
        color_code: char,
        options: HighlightOptions,
    },
    GroupMembership {
        name: String,
        mode: MembershipMode,
        members: Vec<String>,
    },
    ProxySpawn {
        target_id: TargetId,
        uuid: Uuid,
        x: f64,
        y: f64,
        z: f64,
        kind: u16,
    },
    Despawn {
        target_ids: Vec<TargetId>,
    },
    StateSync(StateSyncMessage),
}

pub(crate) fn encode_command(command: &WireCommand) -> Result<Message, AdapterError> {
    serde_json::to_vec(command)
        .map(Message::new)
        .map_err(|e| AdapterError::Encode(e.to_string()))
}

// =============================================================================
// PROTOCOL ADAPTER
// =============================================================================

/// The single seam to the host's protocol stack.
///
/// Builders are pure construction, `send` is a non-blocking enqueue that may
/// fail for a dead connection. The flags-attribute accessors have compiled
/// defaults over [`StateSyncMessage`]; hosts with a different attribute
/// layout override them.
pub trait ProtocolAdapter: Send + Sync {
    fn build_flag_patch(&self, target: TargetId, flags: u8) -> Result<Message, AdapterError>;

    fn build_group_create(
        &self,
        name: &str,
        color: HighlightColor,
        options: &HighlightOptions,
    ) -> Result<Message, AdapterError>;

    fn build_group_membership(
        &self,
        name: &str,
        mode: MembershipMode,
        members: &[String],
    ) -> Result<Message, AdapterError>;

    fn build_proxy_spawn(
        &self,
        target: TargetId,
        uuid: Uuid,
        position: WorldPos,
        kind: ProxyKind,
    ) -> Result<Message, AdapterError>;

    fn build_despawn(&self, targets: &[TargetId]) -> Result<Message, AdapterError>;

    /// Fire-and-forget enqueue of already built messages for one viewer.
    fn send(&self, viewer: ViewerId, messages: &[Message]) -> Result<(), AdapterError>;

    fn install_outbound_filter(
        &self,
        viewer: ViewerId,
        filter: Arc<StatePatchFilter>,
    ) -> Result<(), AdapterError>;

    fn remove_outbound_filter(&self, viewer: ViewerId) -> Result<(), AdapterError>;

    fn read_flags_attribute(&self, message: &StateSyncMessage) -> Option<u8> {
        message.byte_attribute(FLAGS_ATTRIBUTE)
    }

    fn write_flags_attribute(&self, message: &StateSyncMessage, flags: u8) -> StateSyncMessage {
        message.with_byte_attribute(FLAGS_ATTRIBUTE, flags)
    }
}

// =============================================================================
// QUEUE ADAPTER
// =============================================================================

/// Shipped adapter: JSON-encodes [`WireCommand`]s and enqueues the bytes on
/// one unbounded channel per attached viewer. The I/O layer drains each
/// receiver on its own thread; nothing here blocks the tick thread.
pub struct QueueAdapter {
    queues: DashMap<ViewerId, Sender<Vec<u8>>>,
    filters: DashMap<ViewerId, Arc<StatePatchFilter>>,
}

impl QueueAdapter {
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            filters: DashMap::new(),
        }
    }

    /// Attach a viewer's connection and hand back the queue to drain.
    pub fn attach_viewer(&self, viewer: ViewerId) -> Receiver<Vec<u8>> {
        let (tx, rx) = unbounded();
        self.queues.insert(viewer, tx);
        rx
    }

    /// Drop a viewer's queue and any installed filter.
    pub fn detach_viewer(&self, viewer: ViewerId) {
        self.queues.remove(&viewer);
        self.filters.remove(&viewer);
    }

    pub fn is_attached(&self, viewer: ViewerId) -> bool {
        self.queues.contains_key(&viewer)
    }

    /// Entry point for the host's own state-sync traffic: runs the viewer's
    /// outbound filter (if any) and enqueues the possibly patched message.
    pub fn dispatch_state_sync(
        &self,
        viewer: ViewerId,
        message: &StateSyncMessage,
    ) -> Result<(), AdapterError> {
        let patched = self
            .filters
            .get(&viewer)
            .and_then(|filter| filter.apply(self, message));
        let outbound = patched.as_ref().unwrap_or(message);
        let encoded = encode_command(&WireCommand::StateSync(outbound.clone()))?;
        self.send(viewer, &[encoded])
    }

    fn queue_for(&self, viewer: ViewerId) -> Result<Sender<Vec<u8>>, AdapterError> {
        self.queues
            .get(&viewer)
            .map(|q| q.clone())
            .ok_or(AdapterError::Disconnected(viewer))
    }
}

impl Default for QueueAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolAdapter for QueueAdapter {
    fn build_flag_patch(&self, target: TargetId, flags: u8) -> Result<Message, AdapterError> {
        encode_command(&WireCommand::FlagPatch {
            target_id: target,
            flags,
        })
    }

    fn build_group_create(
        &self,
        name: &str,
        color: HighlightColor,
        options: &HighlightOptions,
    ) -> Result<Message, AdapterError> {
        encode_command(&WireCommand::GroupCreate {
            name: name.to_string(),
            color_code: color.code(),
            options: *options,
        })
    }

    fn build_group_membership(
        &self,
        name: &str,
        mode: MembershipMode,
        members: &[String],
    ) -> Result<Message, AdapterError> {
        encode_command(&WireCommand::GroupMembership {
            name: name.to_string(),
            mode,
            members: members.to_vec(),
        })
    }

    fn build_proxy_spawn(
        &self,
        target: TargetId,
        uuid: Uuid,
        position: WorldPos,
        kind: ProxyKind,
    ) -> Result<Message, AdapterError> {
        encode_command(&WireCommand::ProxySpawn {
            target_id: target,
            uuid,
            x: position.x,
            y: position.y,
            z: position.z,
            kind: kind.0,
        })
    }

    fn build_despawn(&self, targets: &[TargetId]) -> Result<Message, AdapterError> {
        encode_command(&WireCommand::Despawn {
            target_ids: targets.to_vec(),
        })
    }

    fn send(&self, viewer: ViewerId, messages: &[Message]) -> Result<(), AdapterError> {
        let queue = self.queue_for(viewer)?;
        for message in messages {
            queue
                .send(message.bytes().to_vec())
                .map_err(|_| AdapterError::Disconnected(viewer))?;
        }
        Ok(())
    }

    fn install_outbound_filter(
        &self,
        viewer: ViewerId,
        filter: Arc<StatePatchFilter>,
    ) -> Result<(), AdapterError> {
        if !self.is_attached(viewer) {
            return Err(AdapterError::Disconnected(viewer));
        }
        self.filters.insert(viewer, filter);
        Ok(())
    }

    fn remove_outbound_filter(&self, viewer: ViewerId) -> Result<(), AdapterError> {
        self.filters.remove(&viewer);
        Ok(())
    }
}

// =============================================================================
// TEST MOCKS
// =============================================================================

#[cfg(test)]
pub mod mocks {
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Mock adapter recording every build and send as decoded
    /// [`WireCommand`]s, with per-viewer send failure injection.
    pub struct RecordingAdapter {
        pub built: Mutex<Vec<WireCommand>>,
        pub sent: Mutex<Vec<(ViewerId, WireCommand)>>,
        pub filters: Mutex<HashMap<ViewerId, Arc<StatePatchFilter>>>,
        failing_viewers: Mutex<HashSet<ViewerId>>,
        fail_builds: AtomicBool,
    }

    impl RecordingAdapter {
        pub fn new() -> Self {
            Self {
                built: Mutex::new(Vec::new()),
                sent: Mutex::new(Vec::new()),
                filters: Mutex::new(HashMap::new()),
                failing_viewers: Mutex::new(HashSet::new()),
                fail_builds: AtomicBool::new(false),
            }
        }

        /// Make every `send` to this viewer fail with `Disconnected`.
        pub fn fail_viewer(&self, viewer: ViewerId) {
            self.failing_viewers.lock().insert(viewer);
        }

        pub fn unfail_viewer(&self, viewer: ViewerId) {
            self.failing_viewers.lock().remove(&viewer);
        }

        /// Make every build call fail with a binding error.
        pub fn set_fail_builds(&self, fail: bool) {
            self.fail_builds.store(fail, Ordering::SeqCst);
        }

        pub fn sent_to(&self, viewer: ViewerId) -> Vec<WireCommand> {
            self.sent
                .lock()
                .iter()
                .filter(|(v, _)| *v == viewer)
                .map(|(_, cmd)| cmd.clone())
                .collect()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }

        pub fn count_sent(&self, predicate: impl Fn(&WireCommand) -> bool) -> usize {
            self.sent.lock().iter().filter(|(_, cmd)| predicate(cmd)).count()
        }

        pub fn has_filter(&self, viewer: ViewerId) -> bool {
            self.filters.lock().contains_key(&viewer)
        }

        pub fn filter_for(&self, viewer: ViewerId) -> Option<Arc<StatePatchFilter>> {
            self.filters.lock().get(&viewer).cloned()
        }

        pub fn clear_log(&self) {
            self.built.lock().clear();
            self.sent.lock().clear();
        }

        fn record_build(&self, command: WireCommand) -> Result<Message, AdapterError> {
            if self.fail_builds.load(Ordering::SeqCst) {
                return Err(AdapterError::Binding("injected build failure".to_string()));
            }
            let message = encode_command(&command)?;
            self.built.lock().push(command);
            Ok(message)
        }
    }

    impl Default for RecordingAdapter {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProtocolAdapter for RecordingAdapter {
        fn build_flag_patch(&self, target: TargetId, flags: u8) -> Result<Message, AdapterError> {
            self.record_build(WireCommand::FlagPatch {
                target_id: target,
                flags,
            })
        }

        fn build_group_create(
            &self,
            name: &str,
            color: HighlightColor,
            options: &HighlightOptions,
        ) -> Result<Message, AdapterError> {
            self.record_build(WireCommand::GroupCreate {
                name: name.to_string(),
                color_code: color.code(),
                options: *options,
            })
        }

        fn build_group_membership(
            &self,
            name: &str,
            mode: MembershipMode,
            members: &[String],
        ) -> Result<Message, AdapterError> {
            self.record_build(WireCommand::GroupMembership {
                name: name.to_string(),
                mode,
                members: members.to_vec(),
            })
        }

        fn build_proxy_spawn(
            &self,
            target: TargetId,
            uuid: Uuid,
            position: WorldPos,
            kind: ProxyKind,
        ) -> Result<Message, AdapterError> {
            self.record_build(WireCommand::ProxySpawn {
                target_id: target,
                uuid,
                x: position.x,
                y: position.y,
                z: position.z,
                kind: kind.0,
            })
        }

        fn build_despawn(&self, targets: &[TargetId]) -> Result<Message, AdapterError> {
            self.record_build(WireCommand::Despawn {
                target_ids: targets.to_vec(),
            })
        }

        fn send(&self, viewer: ViewerId, messages: &[Message]) -> Result<(), AdapterError> {
            if self.failing_viewers.lock().contains(&viewer) {
                return Err(AdapterError::Disconnected(viewer));
            }
            let mut sent = self.sent.lock();
            for message in messages {
                let command: WireCommand = serde_json::from_slice(message.bytes())
                    .map_err(|e| AdapterError::Encode(e.to_string()))?;
                sent.push((viewer, command));
            }
            Ok(())
        }

        fn install_outbound_filter(
            &self,
            viewer: ViewerId,
            filter: Arc<StatePatchFilter>,
        ) -> Result<(), AdapterError> {
            self.filters.lock().insert(viewer, filter);
            Ok(())
        }

        fn remove_outbound_filter(&self, viewer: ViewerId) -> Result<(), AdapterError> {
            self.filters.lock().remove(&viewer);
            Ok(())
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
