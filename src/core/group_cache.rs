//! Group payload cache
//!
//! Color groups are pure wire constructs: creating one and adding/removing
//! members costs a message build each time. Payloads are cached
//! process-wide, keyed by (color, options), and each payload memoizes its
//! per-identifier add/remove messages. Payloads are immutable once built and
//! the sub-caches only grow, which is what makes sharing them across all
//! viewers safe.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::color::HighlightColor;
use super::error::AdapterError;
use super::options::HighlightOptions;
use super::protocol::{MembershipMode, Message, ProtocolAdapter};

// =============================================================================
// GROUP PAYLOAD
// =============================================================================

/// One color group's constructed wire messages.
pub struct GroupPayload {
    name: String,
    create: Message,
    add_cache: DashMap<String, Message>,
    remove_cache: DashMap<String, Message>,
}

impl GroupPayload {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_message(&self) -> Message {
        self.create.clone()
    }

    /// Membership-add message for one identifier, built once.
    pub fn add_message(
        &self,
        adapter: &dyn ProtocolAdapter,
        identifier: &str,
    ) -> Result<Message, AdapterError> {
        self.membership_message(adapter, &self.add_cache, MembershipMode::Add, identifier)
    }

    /// Membership-remove message for one identifier, built once.
    pub fn remove_message(
        &self,
        adapter: &dyn ProtocolAdapter,
        identifier: &str,
    ) -> Result<Message, AdapterError> {
        self.membership_message(adapter, &self.remove_cache, MembershipMode::Remove, identifier)
    }

    fn membership_message(
        &self,
        adapter: &dyn ProtocolAdapter,
        cache: &DashMap<String, Message>,
        mode: MembershipMode,
        identifier: &str,
    ) -> Result<Message, AdapterError> {
        if let Some(message) = cache.get(identifier) {
            return Ok(message.clone());
        }
        match cache.entry(identifier.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let message =
                    adapter.build_group_membership(&self.name, mode, &[identifier.to_string()])?;
                Ok(entry.insert(message).clone())
            }
        }
    }
}

impl std::fmt::Debug for GroupPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupPayload")
            .field("name", &self.name)
            .field("cached_adds", &self.add_cache.len())
            .field("cached_removes", &self.remove_cache.len())
            .finish()
    }
}

// =============================================================================
// CACHE
// =============================================================================

/// Process-wide cache of [`GroupPayload`]s keyed by structural
/// (color, options).
pub struct GroupPayloadCache {
    uid: u32,
    prefix: String,
    groups: DashMap<(HighlightColor, HighlightOptions), Arc<GroupPayload>>,
}

impl GroupPayloadCache {
    pub fn new(uid: u32, prefix: &str) -> Self {
        Self {
            uid,
            prefix: prefix.to_string(),
            groups: DashMap::new(),
        }
    }

    /// Deterministic group name: prefix, session uid, color code, packed
    /// options. Unique per (color, options) within the session, and short
    /// enough for protocols with 16-character name limits.
    pub fn group_name(&self, color: HighlightColor, options: &HighlightOptions) -> String {
        format!(
            "{}_{:08x}{}{:02x}",
            self.prefix,
            self.uid,
            color.code(),
            options.packed()
        )
    }

    /// Cached payload for (color, options); equal keys by value return the
    /// same `Arc`.
    pub fn get_or_create(
        &self,
        adapter: &dyn ProtocolAdapter,
        color: HighlightColor,
        options: &HighlightOptions,
    ) -> Result<Arc<GroupPayload>, AdapterError> {
        let key = (color, *options);
        if let Some(payload) = self.groups.get(&key) {
            return Ok(payload.clone());
        }
        match self.groups.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let name = self.group_name(color, options);
                let create = adapter.build_group_create(&name, color, options)?;
                let payload = Arc::new(GroupPayload {
                    name,
                    create,
                    add_cache: DashMap::new(),
                    remove_cache: DashMap::new(),
                });
                Ok(entry.insert(payload).clone())
            }
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn clear(&self) {
        self.groups.clear();
    }
}

// =============================================================================
// TESTS
// =============================================================================
