//! Cell highlight manager
//!
//! Static cells cannot carry entity flags, so each highlighted cell gets an
//! invisible proxy entity spawned at its center; coloring is then delegated
//! to the entity manager under the proxy's id. Proxies only exist inside the
//! viewer's perception radius; records created outside it stay unspawned
//! until the region loads.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use super::color::HighlightColor;
use super::config::HighlightConfig;
use super::entity::EntityHighlighter;
use super::error::HighlightError;
use super::options::HighlightOptions;
use super::protocol::{ProtocolAdapter, ProxyKind, INVISIBLE_FLAG};
use super::types::{CellPos, IdAllocator, RegionPos, TargetId, ViewerId};
use super::world::WorldView;

// =============================================================================
// RECORDS
// =============================================================================

/// One highlighted cell as seen by one viewer.
///
/// Invariant: `proxy_id.is_some()` exactly when `spawned`.
#[derive(Debug, Clone, PartialEq)]
pub struct CellHighlightRecord {
    pub cell: CellPos,
    pub color: HighlightColor,
    pub options: HighlightOptions,
    pub proxy_id: Option<TargetId>,
    pub proxy_uuid: Option<Uuid>,
    pub spawned: bool,
}

struct ViewerCells {
    cells: DashMap<CellPos, CellHighlightRecord>,
}

// =============================================================================
// CELL HIGHLIGHTER
// =============================================================================

pub struct CellHighlighter {
    adapter: Arc<dyn ProtocolAdapter>,
    entities: Arc<EntityHighlighter>,
    world: Arc<dyn WorldView>,
    ids: Arc<IdAllocator>,
    default_view_radius: u32,
    proxy_kind: ProxyKind,
    viewers: DashMap<ViewerId, Arc<ViewerCells>>,
}

impl CellHighlighter {
    pub fn new(
        adapter: Arc<dyn ProtocolAdapter>,
        entities: Arc<EntityHighlighter>,
        world: Arc<dyn WorldView>,
        ids: Arc<IdAllocator>,
        config: &HighlightConfig,
    ) -> Self {
        Self {
            adapter,
            entities,
            world,
            ids,
            default_view_radius: config.view_radius,
            proxy_kind: ProxyKind(config.proxy_kind),
            viewers: DashMap::new(),
        }
    }

    /// Apply or update a highlight for one (viewer, cell) pair. Spawns the
    /// proxy when the cell is inside the viewer's perception radius;
    /// otherwise the record waits for the region to load.
    pub fn set_highlight(
        &self,
        cell: CellPos,
        viewer: ViewerId,
        color: HighlightColor,
        options: HighlightOptions,
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }

        let entry = self
            .viewers
            .entry(viewer)
            .or_insert_with(|| {
                Arc::new(ViewerCells {
                    cells: DashMap::new(),
                })
            })
            .clone();

        let existing = entry
            .cells
            .get(&cell)
            .map(|r| (r.color, r.options, r.spawned, r.proxy_id, r.proxy_uuid));

        match existing {
            None => {
                entry.cells.insert(
                    cell,
                    CellHighlightRecord {
                        cell,
                        color,
                        options,
                        proxy_id: None,
                        proxy_uuid: None,
                        spawned: false,
                    },
                );
                if self.within_view(viewer, cell) {
                    self.spawn_proxy(&entry, viewer, cell)?;
                } else {
                    debug!(?viewer, ?cell, "[CELL] Out of perception radius, spawn deferred");
                }
            }
            Some((old_color, old_options, spawned, proxy_id, proxy_uuid)) => {
                if old_color == color && old_options == options {
                    return Ok(());
                }
                if spawned {
                    let proxy = proxy_id.expect("spawned record carries a proxy id");
                    let identifier = proxy_uuid
                        .expect("spawned record carries a proxy uuid")
                        .to_string();
                    // Recolor without respawning
                    self.entities.set_highlight(
                        proxy,
                        &identifier,
                        viewer,
                        Some(color),
                        INVISIBLE_FLAG,
                        options,
                    )?;
                }
                if let Some(mut record) = entry.cells.get_mut(&cell) {
                    record.color = color;
                    record.options = options;
                }
            }
        }
        Ok(())
    }

    /// Remove the highlight from one (viewer, cell) pair, despawning its
    /// proxy if one exists.
    pub fn clear_highlight(&self, cell: CellPos, viewer: ViewerId) -> Result<(), HighlightError> {
        let Some(entry) = self.viewers.get(&viewer).map(|e| Arc::clone(&e)) else {
            return Ok(());
        };
        let Some((spawned, proxy_id)) = entry.cells.get(&cell).map(|r| (r.spawned, r.proxy_id))
        else {
            return Ok(());
        };

        if spawned {
            let proxy = proxy_id.expect("spawned record carries a proxy id");
            self.entities.clear_highlight(proxy, viewer)?;
            let despawn = self.adapter.build_despawn(&[proxy])?;
            self.adapter.send(viewer, &[despawn])?;
        }
        entry.cells.remove(&cell);
        debug!(?viewer, ?cell, "[CELL] Highlight cleared");

        if entry.cells.is_empty() {
            self.viewers.remove_if(&viewer, |_, v| v.cells.is_empty());
        }
        Ok(())
    }

    /// Spawn every unspawned record of the freshly loaded region. Spawned
    /// records are untouched, so a repeated load is a no-op.
    pub fn on_region_load(&self, viewer: ViewerId, region: RegionPos) {
        let Some(entry) = self.viewers.get(&viewer).map(|e| Arc::clone(&e)) else {
            return;
        };
        let pending: Vec<CellPos> = entry
            .cells
            .iter()
            .filter(|r| !r.spawned && r.cell.region() == region)
            .map(|r| *r.key())
            .collect();
        for cell in pending {
            if let Err(e) = self.spawn_proxy(&entry, viewer, cell) {
                warn!(?viewer, ?cell, error = %e, "[CELL] Deferred spawn failed");
            }
        }
    }

    pub fn is_highlighted(&self, viewer: ViewerId, cell: CellPos) -> bool {
        self.viewers
            .get(&viewer)
            .map(|e| e.cells.contains_key(&cell))
            .unwrap_or(false)
    }

    pub fn record(&self, viewer: ViewerId, cell: CellPos) -> Option<CellHighlightRecord> {
        self.viewers.get(&viewer)?.cells.get(&cell).map(|r| r.clone())
    }

    pub fn highlighted_cells(&self, viewer: ViewerId) -> Vec<CellPos> {
        self.viewers
            .get(&viewer)
            .map(|e| e.cells.iter().map(|r| *r.key()).collect())
            .unwrap_or_default()
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    /// Wire-level teardown for a live viewer, one record's failure never
    /// blocking the rest.
    pub fn clear_viewer(&self, viewer: ViewerId) {
        let Some((_, entry)) = self.viewers.remove(&viewer) else {
            return;
        };
        let cells: Vec<CellPos> = entry.cells.iter().map(|r| *r.key()).collect();
        for cell in cells {
            let Some((spawned, proxy_id)) = entry.cells.get(&cell).map(|r| (r.spawned, r.proxy_id))
            else {
                continue;
            };
            if spawned {
                let proxy = proxy_id.expect("spawned record carries a proxy id");
                if let Err(e) = self.entities.clear_highlight(proxy, viewer) {
                    warn!(?viewer, ?cell, error = %e, "[CELL] Teardown failed for proxy");
                }
                match self.adapter.build_despawn(&[proxy]) {
                    Ok(despawn) => {
                        if let Err(e) = self.adapter.send(viewer, &[despawn]) {
                            warn!(?viewer, ?cell, error = %e, "[CELL] Despawn send failed");
                        }
                    }
                    Err(e) => warn!(?viewer, ?cell, error = %e, "[CELL] Despawn build failed"),
                }
            }
            entry.cells.remove(&cell);
        }
    }

    /// State-only teardown for a disconnected viewer.
    pub fn purge_viewer(&self, viewer: ViewerId) {
        if self.viewers.remove(&viewer).is_some() {
            debug!(?viewer, "[CELL] Viewer purged");
        }
    }

    pub fn shutdown(&self) {
        self.viewers.clear();
    }

    // =========================================================================
    // Internal
    // =========================================================================

    /// Perception check in region-grid space: squared region deltas against
    /// the squared effective radius, never world-coordinate distance. The
    /// effective radius is the minimum of the viewer's configured radius and
    /// the host default.
    fn within_view(&self, viewer: ViewerId, cell: CellPos) -> bool {
        let Some(position) = self.world.viewer_position(viewer) else {
            return false;
        };
        if position.world != cell.world {
            return false;
        }
        let radius = self
            .world
            .viewer_view_radius(viewer)
            .unwrap_or(self.default_view_radius)
            .min(self.default_view_radius) as i64;

        let viewer_region = position.cell().region();
        let cell_region = cell.region();
        let dx = (viewer_region.x - cell_region.x) as i64;
        let dz = (viewer_region.z - cell_region.z) as i64;
        dx * dx + dz * dz <= radius * radius
    }

    fn spawn_proxy(
        &self,
        entry: &ViewerCells,
        viewer: ViewerId,
        cell: CellPos,
    ) -> Result<(), HighlightError> {
        let Some(record) = entry.cells.get(&cell).map(|r| r.clone()) else {
            return Ok(());
        };
        if record.spawned {
            return Ok(());
        }

        let proxy = self.ids.next_target_id();
        let uuid = Uuid::new_v4();

        let spawn = self
            .adapter
            .build_proxy_spawn(proxy, uuid, cell.center(), self.proxy_kind)?;
        let invisible = self.adapter.build_flag_patch(proxy, INVISIBLE_FLAG)?;
        self.adapter.send(viewer, &[spawn, invisible])?;

        self.entities.set_highlight(
            proxy,
            &uuid.to_string(),
            viewer,
            Some(record.color),
            INVISIBLE_FLAG,
            record.options,
        )?;

        if let Some(mut record) = entry.cells.get_mut(&cell) {
            record.proxy_id = Some(proxy);
            record.proxy_uuid = Some(uuid);
            record.spawned = true;
        }
        debug!(?viewer, ?cell, ?proxy, "[CELL] Proxy spawned");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::group_cache::GroupPayloadCache;
    use crate::core::protocol::mocks::RecordingAdapter;
    use crate::core::protocol::WireCommand;
    use crate::core::types::{WorldId, WorldPos};
    use crate::core::world::mocks::MockWorld;

    const VIEWER: ViewerId = ViewerId(1);
    const W: WorldId = WorldId(1);

    struct Fixture {
        adapter: Arc<RecordingAdapter>,
        world: Arc<MockWorld>,
        cells: CellHighlighter,
    }

    fn fixture() -> Fixture {
        let adapter = Arc::new(RecordingAdapter::new());
        let world = Arc::new(MockWorld::new());
        let groups = Arc::new(GroupPayloadCache::new(0xBEEF, "lm"));
        let entities = Arc::new(EntityHighlighter::new(adapter.clone(), groups));
        let ids = Arc::new(IdAllocator::with_ids(0xBEEF, 5_000_000));
        let cells = CellHighlighter::new(
            adapter.clone(),
            entities,
            world.clone(),
            ids,
            &HighlightConfig::default(),
        );
        Fixture {
            adapter,
            world,
            cells,
        }
    }

    fn nearby_cell() -> CellPos {
        CellPos::new(W, 12, 64, 12)
    }

    fn spawn_count(adapter: &RecordingAdapter) -> usize {
        adapter.count_sent(|c| matches!(c, WireCommand::ProxySpawn { .. }))
    }

    // -------------------------------------------------------------------------
    // Spawn tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_highlight_in_view_spawns_invisible_proxy_at_center() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        f.cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();

        let sent = f.adapter.sent_to(VIEWER);
        let WireCommand::ProxySpawn { x, y, z, .. } = &sent[0] else {
            panic!("first message must be the proxy spawn, got {:?}", sent[0]);
        };
        assert_eq!((*x, *y, *z), (12.5, 64.0, 12.5));
        assert_eq!(
            sent[1],
            WireCommand::FlagPatch {
                target_id: f.cells.record(VIEWER, nearby_cell()).unwrap().proxy_id.unwrap(),
                flags: INVISIBLE_FLAG
            }
        );

        let record = f.cells.record(VIEWER, nearby_cell()).unwrap();
        assert!(record.spawned);
        assert!(record.proxy_id.is_some());
        assert!(record.proxy_uuid.is_some());
    }

    #[test]
    fn test_highlight_out_of_radius_defers_spawn() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        // Default radius is 10 regions; 300 cells away is region 18
        let far = CellPos::new(W, 300, 64, 0);
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();

        assert_eq!(spawn_count(&f.adapter), 0);
        let record = f.cells.record(VIEWER, far).unwrap();
        assert!(!record.spawned);
        assert!(record.proxy_id.is_none());
    }

    #[test]
    fn test_viewer_radius_is_capped_by_host_default() {
        let f = fixture();
        // Viewer asks for 32 regions but the host default is 10
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), Some(32));

        let far = CellPos::new(W, 300, 64, 0);
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        assert_eq!(spawn_count(&f.adapter), 0);
    }

    #[test]
    fn test_other_world_cell_never_spawns() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        let elsewhere = CellPos::new(WorldId(2), 0, 64, 0);
        f.cells
            .set_highlight(elsewhere, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        assert_eq!(spawn_count(&f.adapter), 0);
    }

    // -------------------------------------------------------------------------
    // Region load tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_region_load_spawns_exactly_once() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        let far = CellPos::new(W, 300, 64, 0);
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        assert!(!f.cells.record(VIEWER, far).unwrap().spawned);

        f.cells.on_region_load(VIEWER, far.region());
        assert_eq!(spawn_count(&f.adapter), 1);
        assert!(f.cells.record(VIEWER, far).unwrap().spawned);

        // Second load is a no-op
        f.cells.on_region_load(VIEWER, far.region());
        assert_eq!(spawn_count(&f.adapter), 1);
    }

    #[test]
    fn test_region_load_ignores_other_regions() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        let far = CellPos::new(W, 300, 64, 0);
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();

        f.cells
            .on_region_load(VIEWER, RegionPos { world: W, x: 99, z: 99 });
        assert_eq!(spawn_count(&f.adapter), 0);
    }

    // -------------------------------------------------------------------------
    // Recolor tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_recolor_does_not_respawn() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        f.cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        let proxy = f.cells.record(VIEWER, nearby_cell()).unwrap().proxy_id;

        f.cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Red, HighlightOptions::ghost())
            .unwrap();

        assert_eq!(spawn_count(&f.adapter), 1);
        let record = f.cells.record(VIEWER, nearby_cell()).unwrap();
        assert_eq!(record.color, HighlightColor::Red);
        assert_eq!(record.proxy_id, proxy, "proxy survives a recolor");
    }

    #[test]
    fn test_identical_highlight_is_a_noop() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        f.cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        let sent_before = f.adapter.sent_count();
        f.cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        assert_eq!(f.adapter.sent_count(), sent_before);
    }

    #[test]
    fn test_recolor_of_unspawned_record_stays_silent() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        let far = CellPos::new(W, 300, 64, 0);
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Red, HighlightOptions::ghost())
            .unwrap();

        assert_eq!(f.adapter.sent_count(), 0);
        assert_eq!(f.cells.record(VIEWER, far).unwrap().color, HighlightColor::Red);
    }

    // -------------------------------------------------------------------------
    // Clear tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_clear_despawns_and_drops_viewer_entry() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        f.cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        let proxy = f.cells.record(VIEWER, nearby_cell()).unwrap().proxy_id.unwrap();

        f.cells.clear_highlight(nearby_cell(), VIEWER).unwrap();

        assert_eq!(
            f.adapter
                .count_sent(|c| matches!(c, WireCommand::Despawn { target_ids } if target_ids == &[proxy])),
            1
        );
        assert!(!f.cells.is_highlighted(VIEWER, nearby_cell()));
        assert_eq!(f.cells.viewer_count(), 0, "empty viewer entry is dropped");
    }

    #[test]
    fn test_clear_unspawned_record_sends_nothing() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        let far = CellPos::new(W, 300, 64, 0);
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        f.cells.clear_highlight(far, VIEWER).unwrap();

        assert_eq!(f.adapter.sent_count(), 0);
        assert!(!f.cells.is_highlighted(VIEWER, far));
    }

    #[test]
    fn test_invalid_color_rejected() {
        let f = fixture();
        let err = f
            .cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Reset, HighlightOptions::ghost())
            .unwrap_err();
        assert_eq!(err, HighlightError::InvalidColor(HighlightColor::Reset));
        assert_eq!(f.cells.viewer_count(), 0);
    }

    // -------------------------------------------------------------------------
    // Invariant tests
    // -------------------------------------------------------------------------

    #[test]
    fn test_proxy_id_iff_spawned() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);

        let near = nearby_cell();
        let far = CellPos::new(W, 300, 64, 0);
        f.cells
            .set_highlight(near, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();
        f.cells
            .set_highlight(far, VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .unwrap();

        for cell in f.cells.highlighted_cells(VIEWER) {
            let record = f.cells.record(VIEWER, cell).unwrap();
            assert_eq!(record.proxy_id.is_some(), record.spawned);
            assert_eq!(record.proxy_uuid.is_some(), record.spawned);
        }
    }

    #[test]
    fn test_spawn_failure_leaves_record_unspawned_for_retry() {
        let f = fixture();
        f.world
            .add_viewer(VIEWER, WorldPos::new(W, 0.0, 64.0, 0.0), None);
        f.adapter.fail_viewer(VIEWER);

        assert!(f
            .cells
            .set_highlight(nearby_cell(), VIEWER, HighlightColor::Aqua, HighlightOptions::ghost())
            .is_err());
        let record = f.cells.record(VIEWER, nearby_cell()).unwrap();
        assert!(!record.spawned, "record stays retryable after a wire failure");

        // Connection back: region load completes the spawn
        f.adapter.unfail_viewer(VIEWER);
        f.cells.on_region_load(VIEWER, nearby_cell().region());
        assert!(f.cells.record(VIEWER, nearby_cell()).unwrap().spawned);
    }
}
