//! Entity highlight manager
//!
//! Per-viewer bookkeeping for highlighted entities. Two independent wire
//! mechanisms compose a highlight: the flag patch (applied exactly once when
//! a record is created, and kept alive afterwards by the outbound filter)
//! and color group membership (layered on top, changed on recolor without
//! touching the flag byte).
//!
//! Records are only mutated after the wire operation succeeded; an adapter
//! failure is a failed no-op for that (viewer, target) pair.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::color::HighlightColor;
use super::error::{AdapterError, HighlightError};
use super::filter::StatePatchFilter;
use super::group_cache::GroupPayloadCache;
use super::options::HighlightOptions;
use super::protocol::{Message, ProtocolAdapter, HIGHLIGHT_FLAG};
use super::types::{TargetId, ViewerId};

// =============================================================================
// RECORDS
// =============================================================================

/// One highlighted entity as seen by one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityHighlightRecord {
    pub target_id: TargetId,
    /// Name the wire protocol's membership messages use for this target.
    pub identifier: String,
    pub color: Option<HighlightColor>,
    pub options: HighlightOptions,
    /// The target's flag byte as cached when the highlight was applied; the
    /// highlight bit is OR'd on top of this.
    pub other_flags: u8,
    /// Whether the outbound filter patches messages for this target.
    pub enabled: bool,
}

struct ViewerEntities {
    records: Arc<DashMap<TargetId, EntityHighlightRecord>>,
    /// Group names whose create message this viewer has already received.
    sent_groups: Mutex<HashSet<String>>,
    filter: Arc<StatePatchFilter>,
}

impl ViewerEntities {
    fn new(viewer: ViewerId) -> Self {
        let records: Arc<DashMap<TargetId, EntityHighlightRecord>> = Arc::new(DashMap::new());
        let lookup = Arc::clone(&records);
        let filter = Arc::new(StatePatchFilter::new(
            viewer,
            Arc::new(move |target| {
                let record = lookup.get(&target)?;
                if !record.enabled {
                    return None;
                }
                Some(record.other_flags | HIGHLIGHT_FLAG)
            }),
        ));
        Self {
            records,
            sent_groups: Mutex::new(HashSet::new()),
            filter,
        }
    }
}

// =============================================================================
// ENTITY HIGHLIGHTER
// =============================================================================

pub struct EntityHighlighter {
    adapter: Arc<dyn ProtocolAdapter>,
    groups: Arc<GroupPayloadCache>,
    viewers: DashMap<ViewerId, Arc<ViewerEntities>>,
}

impl EntityHighlighter {
    pub fn new(adapter: Arc<dyn ProtocolAdapter>, groups: Arc<GroupPayloadCache>) -> Self {
        Self {
            adapter,
            groups,
            viewers: DashMap::new(),
        }
    }

    pub fn group_cache(&self) -> &Arc<GroupPayloadCache> {
        &self.groups
    }

    /// Apply or update a highlight for one (viewer, target) pair.
    ///
    /// `other_flags` is the target's flag byte as known right now; it is
    /// cached on the record so the patch and the filter can OR the highlight
    /// bit into it. `color: None` keeps the outline without group coloring.
    pub fn set_highlight(
        &self,
        target: TargetId,
        identifier: &str,
        viewer: ViewerId,
        color: Option<HighlightColor>,
        other_flags: u8,
        options: HighlightOptions,
    ) -> Result<(), HighlightError> {
        if let Some(color) = color {
            if !color.is_color() {
                return Err(HighlightError::InvalidColor(color));
            }
        }

        let entry = self.viewer_entry(viewer)?;
        let existing = entry
            .records
            .get(&target)
            .map(|r| (r.color, r.options));

        match existing {
            None => {
                let patch = self
                    .adapter
                    .build_flag_patch(target, other_flags | HIGHLIGHT_FLAG)?;
                self.adapter.send(viewer, &[patch])?;
                if let Some(color) = color {
                    self.send_group_add(&entry, viewer, identifier, color, &options)?;
                }
                entry.records.insert(
                    target,
                    EntityHighlightRecord {
                        target_id: target,
                        identifier: identifier.to_string(),
                        color,
                        options,
                        other_flags,
                        enabled: true,
                    },
                );
                debug!(?viewer, ?target, ?color, "[ENTITY] Highlight applied");
            }
            Some((old_color, old_options)) => {
                if old_color == color && old_options == options {
                    return Ok(());
                }
                // The target group changed: leave the old one, join the new
                // one. Equality of (color, options) was handled above, so
                // any surviving old color names a different group.
                if let Some(old) = old_color {
                    self.send_group_remove(viewer, identifier, old, &old_options)?;
                }
                if let Some(new) = color {
                    self.send_group_add(&entry, viewer, identifier, new, &options)?;
                }
                if let Some(mut record) = entry.records.get_mut(&target) {
                    record.color = color;
                    record.options = options;
                }
                debug!(?viewer, ?target, ?color, "[ENTITY] Highlight recolored");
            }
        }
        Ok(())
    }

    /// Remove the highlight from one (viewer, target) pair, restoring the
    /// cached flag byte on the wire.
    pub fn clear_highlight(&self, target: TargetId, viewer: ViewerId) -> Result<(), HighlightError> {
        let Some(entry) = self.viewers.get(&viewer).map(|e| Arc::clone(&e)) else {
            return Ok(());
        };
        let Some((identifier, color, options, other_flags)) = entry
            .records
            .get(&target)
            .map(|r| (r.identifier.clone(), r.color, r.options, r.other_flags))
        else {
            return Ok(());
        };

        let patch = self
            .adapter
            .build_flag_patch(target, other_flags & !HIGHLIGHT_FLAG)?;
        self.adapter.send(viewer, &[patch])?;
        if let Some(color) = color {
            self.send_group_remove(viewer, &identifier, color, &options)?;
        }
        entry.records.remove(&target);
        debug!(?viewer, ?target, "[ENTITY] Highlight cleared");
        Ok(())
    }

    /// Re-send the wire state of an existing record, for a viewer whose
    /// client lost it (target respawn, connection hiccup). The record itself
    /// is unchanged; without a record this is a no-op.
    pub fn resend_highlight(&self, target: TargetId, viewer: ViewerId) -> Result<(), HighlightError> {
        let Some(entry) = self.viewers.get(&viewer).map(|e| Arc::clone(&e)) else {
            return Ok(());
        };
        let Some((identifier, color, options, other_flags)) = entry
            .records
            .get(&target)
            .map(|r| (r.identifier.clone(), r.color, r.options, r.other_flags))
        else {
            return Ok(());
        };

        let patch = self
            .adapter
            .build_flag_patch(target, other_flags | HIGHLIGHT_FLAG)?;
        self.adapter.send(viewer, &[patch])?;
        if let Some(color) = color {
            self.send_group_add(&entry, viewer, &identifier, color, &options)?;
        }
        debug!(?viewer, ?target, "[ENTITY] Highlight re-sent");
        Ok(())
    }

    /// Toggle whether the outbound filter patches messages for this target.
    /// Returns false when there is no record to toggle.
    pub fn set_enabled(&self, target: TargetId, viewer: ViewerId, enabled: bool) -> bool {
        let Some(entry) = self.viewers.get(&viewer) else {
            return false;
        };
        let result = match entry.records.get_mut(&target) {
            Some(mut record) => {
                record.enabled = enabled;
                true
            }
            None => false,
        };
        result
    }

    pub fn is_highlighted(&self, viewer: ViewerId, target: TargetId) -> bool {
        self.viewers
            .get(&viewer)
            .map(|e| e.records.contains_key(&target))
            .unwrap_or(false)
    }

    pub fn record(&self, viewer: ViewerId, target: TargetId) -> Option<EntityHighlightRecord> {
        self.viewers
            .get(&viewer)?
            .records
            .get(&target)
            .map(|r| r.clone())
    }

    pub fn highlighted_targets(&self, viewer: ViewerId) -> Vec<TargetId> {
        self.viewers
            .get(&viewer)
            .map(|e| e.records.iter().map(|r| *r.key()).collect())
            .unwrap_or_default()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Wire-level teardown for a live viewer: best-effort removal of every
    /// record, one failure does not block the rest, then the state purge.
    pub fn clear_viewer(&self, viewer: ViewerId) {
        let Some((_, entry)) = self.viewers.remove(&viewer) else {
            return;
        };
        let targets: Vec<TargetId> = entry.records.iter().map(|r| *r.key()).collect();
        for target in targets {
            let Some((identifier, color, options, other_flags)) = entry
                .records
                .get(&target)
                .map(|r| (r.identifier.clone(), r.color, r.options, r.other_flags))
            else {
                continue;
            };
            if let Err(e) = self.teardown_record(
                viewer,
                target,
                &identifier,
                color,
                &options,
                other_flags,
            ) {
                warn!(?viewer, ?target, error = %e, "[ENTITY] Teardown failed for record");
            }
            entry.records.remove(&target);
        }
        if let Err(e) = self.adapter.remove_outbound_filter(viewer) {
            warn!(?viewer, error = %e, "[ENTITY] Failed to remove outbound filter");
        }
    }

    /// State-only teardown for a disconnected viewer: no wire traffic, the
    /// connection is gone. Releases the installed filter.
    pub fn purge_viewer(&self, viewer: ViewerId) {
        if self.viewers.remove(&viewer).is_some() {
            if let Err(e) = self.adapter.remove_outbound_filter(viewer) {
                warn!(?viewer, error = %e, "[ENTITY] Failed to remove outbound filter");
            }
            debug!(?viewer, "[ENTITY] Viewer purged");
        }
    }

    /// Drop every viewer's state and filter. Host shutdown path.
    pub fn shutdown(&self) {
        let viewers: Vec<ViewerId> = self.viewers.iter().map(|e| *e.key()).collect();
        for viewer in viewers {
            self.purge_viewer(viewer);
        }
        self.groups.clear();
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn viewer_entry(&self, viewer: ViewerId) -> Result<Arc<ViewerEntities>, AdapterError> {
        if let Some(entry) = self.viewers.get(&viewer) {
            return Ok(Arc::clone(&entry));
        }
        match self.viewers.entry(viewer) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(slot) => {
                let entry = Arc::new(ViewerEntities::new(viewer));
                self.adapter
                    .install_outbound_filter(viewer, Arc::clone(&entry.filter))?;
                Ok(Arc::clone(&slot.insert(entry)))
            }
        }
    }

    fn send_group_add(
        &self,
        entry: &ViewerEntities,
        viewer: ViewerId,
        identifier: &str,
        color: HighlightColor,
        options: &HighlightOptions,
    ) -> Result<(), AdapterError> {
        let payload = self
            .groups
            .get_or_create(self.adapter.as_ref(), color, options)?;
        let add = payload.add_message(self.adapter.as_ref(), identifier)?;

        let needs_create = !entry.sent_groups.lock().contains(payload.name());
        if needs_create {
            let messages: [Message; 2] = [payload.create_message(), add];
            self.adapter.send(viewer, &messages)?;
            entry.sent_groups.lock().insert(payload.name().to_string());
        } else {
            self.adapter.send(viewer, &[add])?;
        }
        Ok(())
    }

    fn send_group_remove(
        &self,
        viewer: ViewerId,
        identifier: &str,
        color: HighlightColor,
        options: &HighlightOptions,
    ) -> Result<(), AdapterError> {
        let payload = self
            .groups
            .get_or_create(self.adapter.as_ref(), color, options)?;
        let remove = payload.remove_message(self.adapter.as_ref(), identifier)?;
        self.adapter.send(viewer, &[remove])
    }

    fn teardown_record(
        &self,
        viewer: ViewerId,
        target: TargetId,
        identifier: &str,
        color: Option<HighlightColor>,
        options: &HighlightOptions,
        other_flags: u8,
    ) -> Result<(), AdapterError> {
        let patch = self
            .adapter
            .build_flag_patch(target, other_flags & !HIGHLIGHT_FLAG)?;
        self.adapter.send(viewer, &[patch])?;
        if let Some(color) = color {
            self.send_group_remove(viewer, identifier, color, options)?;
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
