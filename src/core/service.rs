//! Highlight service façade
//!
//! Orchestrates the entity and cell managers behind one public surface:
//! bounded-duration highlights, animated highlights, conditional scans, zone
//! and line-of-sight queries, bulk viewer teardown/rebuild, host event
//! handlers, veto hooks and statistics.
//!
//! The service keeps its own per-viewer color maps plus reverse indices
//! (target -> viewers, cell -> viewers), maintained in lockstep with every
//! mutation. Deferred work runs on the injected [`TickScheduler`]; every
//! (viewer, key) slot holds at most one timer and one animation task, and
//! starting a new one cancels the prior one first.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::animation::HighlightAnimation;
use super::cell::CellHighlighter;
use super::color::HighlightColor;
use super::config::HighlightConfig;
use super::entity::EntityHighlighter;
use super::error::HighlightError;
use super::group_cache::GroupPayloadCache;
use super::hooks::{HighlightChange, HighlightHook, Verdict};
use super::options::HighlightOptions;
use super::protocol::ProtocolAdapter;
use super::scheduler::{TaskHandle, TickScheduler};
use super::types::{CellPos, IdAllocator, RegionPos, TargetId, ViewerId, WorldPos};
use super::world::WorldView;

/// Predicate over live targets, used by conditional highlighting and the
/// visible-entity query.
pub type EntityPredicate = Arc<dyn Fn(TargetId) -> bool + Send + Sync>;

// =============================================================================
// VIEWER STATE
// =============================================================================

/// What one viewer currently sees highlighted. Created lazily, dropped when
/// both maps are empty.
#[derive(Default)]
struct ViewerState {
    entities: DashMap<TargetId, HighlightColor>,
    cells: DashMap<CellPos, HighlightColor>,
}

// =============================================================================
// STATISTICS
// =============================================================================

/// Point-in-time aggregation over the service's viewer maps. Everything but
/// `total_operations` is recomputed on each [`HighlightService::stats`] call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HighlightStats {
    pub total_entities: usize,
    pub total_cells: usize,
    pub per_viewer_entities: HashMap<ViewerId, usize>,
    pub per_viewer_cells: HashMap<ViewerId, usize>,
    pub color_distribution: HashMap<HighlightColor, usize>,
    pub active_viewers: usize,
    pub total_operations: u64,
}

// =============================================================================
// SERVICE
// =============================================================================

pub struct HighlightService {
    me: Weak<HighlightService>,
    world: Arc<dyn WorldView>,
    scheduler: Arc<dyn TickScheduler>,
    entities: Arc<EntityHighlighter>,
    cells: Arc<CellHighlighter>,
    config: HighlightConfig,
    /// Group options every service-level highlight uses: no collision, no
    /// name labels, so a highlight never changes gameplay.
    default_options: HighlightOptions,

    by_viewer: DashMap<ViewerId, Arc<ViewerState>>,
    viewers_by_entity: DashMap<TargetId, DashSet<ViewerId>>,
    viewers_by_cell: DashMap<CellPos, DashSet<ViewerId>>,

    entity_timers: DashMap<(ViewerId, TargetId), TaskHandle>,
    cell_timers: DashMap<(ViewerId, CellPos), TaskHandle>,
    entity_animations: DashMap<(ViewerId, TargetId), TaskHandle>,
    cell_animations: DashMap<(ViewerId, CellPos), TaskHandle>,
    conditionals: DashMap<ViewerId, TaskHandle>,

    hooks: RwLock<Vec<Arc<dyn HighlightHook>>>,
    total_operations: AtomicU64,
}

impl HighlightService {
    pub fn new(
        adapter: Arc<dyn ProtocolAdapter>,
        world: Arc<dyn WorldView>,
        scheduler: Arc<dyn TickScheduler>,
        ids: Arc<IdAllocator>,
        config: HighlightConfig,
    ) -> Arc<Self> {
        let groups = Arc::new(GroupPayloadCache::new(ids.uid(), &config.group_prefix));
        let entities = Arc::new(EntityHighlighter::new(Arc::clone(&adapter), groups));
        let cells = Arc::new(CellHighlighter::new(
            adapter,
            Arc::clone(&entities),
            Arc::clone(&world),
            ids,
            &config,
        ));
        info!(
            view_radius = config.view_radius,
            animation_interval = config.animation_interval_ticks,
            "[SERVICE] Highlight service created"
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            world,
            scheduler,
            entities,
            cells,
            config,
            default_options: HighlightOptions::ghost(),
            by_viewer: DashMap::new(),
            viewers_by_entity: DashMap::new(),
            viewers_by_cell: DashMap::new(),
            entity_timers: DashMap::new(),
            cell_timers: DashMap::new(),
            entity_animations: DashMap::new(),
            cell_animations: DashMap::new(),
            conditionals: DashMap::new(),
            hooks: RwLock::new(Vec::new()),
            total_operations: AtomicU64::new(0),
        })
    }

    pub fn entity_manager(&self) -> &Arc<EntityHighlighter> {
        &self.entities
    }

    pub fn cell_manager(&self) -> &Arc<CellHighlighter> {
        &self.cells
    }

    // =========================================================================
    // ENTITY
    // =========================================================================

    /// Highlight `target` in `color` for each listed viewer.
    pub fn highlight_entity(
        &self,
        target: TargetId,
        color: HighlightColor,
        viewers: &[ViewerId],
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            if self.apply_entity(target, color, viewer) {
                self.bump();
            }
        }
        Ok(())
    }

    /// Highlight `target` for `duration_ticks`, then unhighlight through the
    /// normal veto-capable path. Re-issuing replaces any pending timer for
    /// the same (viewer, target) slot.
    pub fn highlight_entity_for(
        &self,
        target: TargetId,
        color: HighlightColor,
        duration_ticks: u64,
        viewers: &[ViewerId],
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            if self.apply_entity(target, color, viewer) {
                self.schedule_entity_unset(viewer, target, duration_ticks);
                self.bump();
            }
        }
        Ok(())
    }

    /// Remove the highlight from `target` for the listed viewers; an empty
    /// slice means every viewer currently highlighting it.
    pub fn unhighlight_entity(&self, target: TargetId, viewers: &[ViewerId]) {
        let affected: Vec<ViewerId> = if viewers.is_empty() {
            self.viewers_by_entity
                .get(&target)
                .map(|set| set.iter().map(|v| *v).collect())
                .unwrap_or_default()
        } else {
            viewers.to_vec()
        };
        for viewer in affected {
            self.remove_entity(target, viewer);
        }
    }

    // =========================================================================
    // CELL
    // =========================================================================

    /// Highlight a cell for each listed viewer. Empty cells are silently
    /// skipped: there is nothing to render a highlight around.
    pub fn highlight_cell(
        &self,
        cell: CellPos,
        color: HighlightColor,
        viewers: &[ViewerId],
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        if !self.world.cell_occupied(cell) {
            return Ok(());
        }
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            if self.apply_cell(cell, color, viewer) {
                self.bump();
            }
        }
        Ok(())
    }

    /// [`Self::highlight_cell`] with a bounded duration.
    pub fn highlight_cell_for(
        &self,
        cell: CellPos,
        color: HighlightColor,
        duration_ticks: u64,
        viewers: &[ViewerId],
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        if !self.world.cell_occupied(cell) {
            return Ok(());
        }
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            if self.apply_cell(cell, color, viewer) {
                self.schedule_cell_unset(viewer, cell, duration_ticks);
                self.bump();
            }
        }
        Ok(())
    }

    /// Remove the highlight from a cell; an empty slice means every viewer
    /// currently highlighting it.
    pub fn unhighlight_cell(&self, cell: CellPos, viewers: &[ViewerId]) {
        let affected: Vec<ViewerId> = if viewers.is_empty() {
            self.viewers_by_cell
                .get(&cell)
                .map(|set| set.iter().map(|v| *v).collect())
                .unwrap_or_default()
        } else {
            viewers.to_vec()
        };
        for viewer in affected {
            self.remove_cell(cell, viewer);
        }
    }

    // =========================================================================
    // ANIMATIONS
    // =========================================================================

    /// Run `animation` on `target` for each listed viewer: a periodic task
    /// recolors through the normal apply path, advancing the animation clock
    /// once per run. Self-stops on completion or when the target or viewer
    /// disappears.
    pub fn highlight_entity_animated(
        &self,
        target: TargetId,
        animation: Arc<dyn HighlightAnimation>,
        viewers: &[ViewerId],
    ) {
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            self.start_entity_animation(target, Arc::clone(&animation), viewer);
            self.bump();
        }
    }

    /// [`Self::highlight_entity_animated`] with a bounded duration: the
    /// one-shot unset timer is layered on top of the animation task.
    pub fn highlight_entity_animated_for(
        &self,
        target: TargetId,
        animation: Arc<dyn HighlightAnimation>,
        duration_ticks: u64,
        viewers: &[ViewerId],
    ) {
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            self.start_entity_animation(target, Arc::clone(&animation), viewer);
            self.schedule_entity_unset(viewer, target, duration_ticks);
            self.bump();
        }
    }

    /// Animated counterpart of [`Self::highlight_cell`].
    pub fn highlight_cell_animated(
        &self,
        cell: CellPos,
        animation: Arc<dyn HighlightAnimation>,
        viewers: &[ViewerId],
    ) {
        if !self.world.cell_occupied(cell) {
            return;
        }
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            self.start_cell_animation(cell, Arc::clone(&animation), viewer);
            self.bump();
        }
    }

    pub fn highlight_cell_animated_for(
        &self,
        cell: CellPos,
        animation: Arc<dyn HighlightAnimation>,
        duration_ticks: u64,
        viewers: &[ViewerId],
    ) {
        if !self.world.cell_occupied(cell) {
            return;
        }
        for &viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            self.start_cell_animation(cell, Arc::clone(&animation), viewer);
            self.schedule_cell_unset(viewer, cell, duration_ticks);
            self.bump();
        }
    }

    // =========================================================================
    // CONDITIONAL
    // =========================================================================

    /// Periodically scan entities near `viewer` and highlight new matches of
    /// `predicate`. At most one predicate per viewer; a new call replaces the
    /// prior one.
    ///
    /// Apply-only: an entity that stops matching keeps its highlight until it
    /// is cleared explicitly.
    pub fn highlight_matching(
        &self,
        predicate: EntityPredicate,
        color: HighlightColor,
        check_interval_ticks: u64,
        viewer: ViewerId,
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        if !self.world.viewer_connected(viewer) {
            return Ok(());
        }
        self.stop_conditional(viewer);

        let me = self.me.clone();
        let task = self.scheduler.run_every(
            check_interval_ticks,
            Box::new(move || {
                let Some(service) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                for target in service.world.entities_near(viewer) {
                    if !predicate(target) {
                        continue;
                    }
                    let already = service
                        .by_viewer
                        .get(&viewer)
                        .map(|s| s.entities.contains_key(&target))
                        .unwrap_or(false);
                    if !already && service.apply_entity(target, color, viewer) {
                        service.bump();
                    }
                }
                ControlFlow::Continue(())
            }),
        );
        self.conditionals.insert(viewer, task);
        self.bump();
        Ok(())
    }

    /// Cancel the viewer's conditional scan, if any.
    pub fn stop_conditional(&self, viewer: ViewerId) {
        if let Some((_, task)) = self.conditionals.remove(&viewer) {
            task.cancel();
            self.bump();
        }
    }

    // =========================================================================
    // ZONE QUERIES
    // =========================================================================

    /// Highlight every live entity within `radius` of `center`, optionally
    /// restricted to one entity kind.
    pub fn highlight_in_radius(
        &self,
        center: WorldPos,
        radius: f64,
        kind_filter: Option<u16>,
        color: HighlightColor,
        viewers: &[ViewerId],
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        for target in self.world.entities_in_radius(center, radius) {
            if kind_filter.is_some_and(|kind| self.world.target_kind(target) != Some(kind)) {
                continue;
            }
            self.highlight_entity(target, color, viewers)?;
        }
        Ok(())
    }

    /// Highlight every occupied cell within the sphere of `radius` around
    /// `center`.
    pub fn highlight_cells_in_radius(
        &self,
        center: WorldPos,
        radius: f64,
        color: HighlightColor,
        viewers: &[ViewerId],
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        let origin = center.cell();
        let reach = radius.ceil() as i32;
        for dx in -reach..=reach {
            for dy in -reach..=reach {
                for dz in -reach..=reach {
                    if ((dx * dx + dy * dy + dz * dz) as f64) > radius * radius {
                        continue;
                    }
                    let cell =
                        CellPos::new(origin.world, origin.x + dx, origin.y + dy, origin.z + dz);
                    if self.world.cell_occupied(cell) {
                        self.highlight_cell(cell, color, viewers)?;
                    }
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // LINE OF SIGHT
    // =========================================================================

    /// Highlight the entity under the viewer's crosshair for
    /// `duration_ticks`; returns the target if one was hit.
    pub fn highlight_at_crosshair(
        &self,
        viewer: ViewerId,
        max_distance: f64,
        color: HighlightColor,
        duration_ticks: u64,
    ) -> Result<Option<TargetId>, HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        let Some(target) = self.world.crosshair_entity(viewer, max_distance) else {
            return Ok(None);
        };
        self.highlight_entity_for(target, color, duration_ticks, &[viewer])?;
        Ok(Some(target))
    }

    /// Highlight the cell under the viewer's crosshair for `duration_ticks`;
    /// returns the cell if one was hit.
    pub fn highlight_crosshair_cell(
        &self,
        viewer: ViewerId,
        max_distance: f64,
        color: HighlightColor,
        duration_ticks: u64,
    ) -> Result<Option<CellPos>, HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        let Some(cell) = self.world.crosshair_cell(viewer, max_distance) else {
            return Ok(None);
        };
        if !self.world.cell_occupied(cell) {
            return Ok(None);
        }
        self.highlight_cell_for(cell, color, duration_ticks, &[viewer])?;
        Ok(Some(cell))
    }

    /// Highlight entities near the viewer that it has line of sight to,
    /// optionally filtered.
    pub fn highlight_visible_entities(
        &self,
        viewer: ViewerId,
        max_distance: f64,
        filter: Option<EntityPredicate>,
        color: HighlightColor,
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        let Some(position) = self.world.viewer_position(viewer) else {
            return Ok(());
        };
        for target in self.world.entities_in_radius(position, max_distance) {
            if filter.as_ref().is_some_and(|f| !f(target)) {
                continue;
            }
            if !self.world.has_line_of_sight(viewer, target) {
                continue;
            }
            self.highlight_entity(target, color, &[viewer])?;
        }
        Ok(())
    }

    /// Highlight the occupied cells along the viewer's sight ray.
    pub fn highlight_sight_path_cells(
        &self,
        viewer: ViewerId,
        max_distance: f64,
        color: HighlightColor,
    ) -> Result<(), HighlightError> {
        if !color.is_color() {
            return Err(HighlightError::InvalidColor(color));
        }
        for cell in self.world.sight_path(viewer, max_distance) {
            self.highlight_cell(cell, color, &[viewer])?;
        }
        Ok(())
    }

    // =========================================================================
    // BULK / VIEWER
    // =========================================================================

    /// Tear down everything the viewer sees: every entity and cell highlight
    /// through the veto-capable unhighlight path, plus any conditional scan.
    /// A record whose removal fails or is vetoed survives; otherwise the
    /// viewer disappears from the service entirely.
    pub fn clear_for_viewer(&self, viewer: ViewerId) {
        if let Some(state) = self.by_viewer.get(&viewer).map(|s| Arc::clone(&s)) {
            let targets: Vec<TargetId> = state.entities.iter().map(|r| *r.key()).collect();
            for target in targets {
                self.remove_entity(target, viewer);
            }
            let cells: Vec<CellPos> = state.cells.iter().map(|r| *r.key()).collect();
            for cell in cells {
                self.remove_cell(cell, viewer);
            }
        }
        self.stop_conditional(viewer);
        self.drop_viewer_if_empty(viewer);
        debug!(?viewer, "[SERVICE] Viewer cleared");
    }

    /// Re-send the viewer's stored highlights. Used after a reconnect, when
    /// the managers' wire-level state was purged but the service still knows
    /// what the viewer should see.
    pub fn reapply_for_viewer(&self, viewer: ViewerId) {
        if !self.world.viewer_connected(viewer) {
            return;
        }
        let Some(state) = self.by_viewer.get(&viewer).map(|s| Arc::clone(&s)) else {
            return;
        };
        let entities: Vec<(TargetId, HighlightColor)> =
            state.entities.iter().map(|r| (*r.key(), *r.value())).collect();
        for (target, color) in entities {
            if self.world.target_alive(target) {
                self.reapply_entity(target, color, viewer);
            }
        }
        let cells: Vec<(CellPos, HighlightColor)> =
            state.cells.iter().map(|r| (*r.key(), *r.value())).collect();
        for (cell, color) in cells {
            if self.world.cell_occupied(cell) {
                self.apply_cell(cell, color, viewer);
            }
        }
        debug!(?viewer, "[SERVICE] Viewer highlights reapplied");
    }

    /// Re-send one target's stored color to every viewer currently
    /// highlighting it. Used when the target itself rejoins the world.
    pub fn reapply_target_for_viewers(&self, target: TargetId) {
        let Some(viewers) = self
            .viewers_by_entity
            .get(&target)
            .map(|set| set.iter().map(|v| *v).collect::<Vec<_>>())
        else {
            return;
        };
        for viewer in viewers {
            if !self.world.viewer_connected(viewer) {
                continue;
            }
            let Some(color) = self
                .by_viewer
                .get(&viewer)
                .and_then(|s| s.entities.get(&target).map(|c| *c))
            else {
                continue;
            };
            self.reapply_entity(target, color, viewer);
        }
    }

    // =========================================================================
    // HOST EVENTS
    // =========================================================================

    /// Viewer session established: rebuild what it should see, and re-send
    /// its own avatar's highlight to everyone already highlighting it.
    pub fn on_viewer_connect(&self, viewer: ViewerId) {
        if let Some(target) = self.world.viewer_target(viewer) {
            self.reapply_target_for_viewers(target);
        }
        self.reapply_for_viewer(viewer);
    }

    /// Viewer connection gone: cancel its scheduled work and drop the
    /// managers' wire-level state without sending anything. The service's own
    /// maps survive so [`Self::on_viewer_connect`] can rebuild; call
    /// [`Self::clear_for_viewer`] instead for a permanent departure.
    pub fn on_viewer_disconnect(&self, viewer: ViewerId) {
        self.stop_conditional(viewer);
        cancel_tasks_for_viewer(&self.entity_timers, viewer, |k| k.0);
        cancel_tasks_for_viewer(&self.cell_timers, viewer, |k| k.0);
        cancel_tasks_for_viewer(&self.entity_animations, viewer, |k| k.0);
        cancel_tasks_for_viewer(&self.cell_animations, viewer, |k| k.0);
        self.entities.purge_viewer(viewer);
        self.cells.purge_viewer(viewer);
        debug!(?viewer, "[SERVICE] Viewer disconnected, wire state purged");
    }

    /// Target removed from the simulation: unhighlight it for everyone.
    pub fn on_target_destroyed(&self, target: TargetId) {
        self.unhighlight_entity(target, &[]);
    }

    /// A highlighted cell was mutated: the highlight no longer describes
    /// what is there, so drop it for everyone.
    pub fn on_cell_changed(&self, cell: CellPos) {
        self.unhighlight_cell(cell, &[]);
    }

    /// A region finished loading for the viewer: spawn its deferred cell
    /// proxies.
    pub fn on_region_load(&self, viewer: ViewerId, region: RegionPos) {
        self.cells.on_region_load(viewer, region);
    }

    // =========================================================================
    // QUERIES / STATS / HOOKS
    // =========================================================================

    pub fn highlighted_entities(&self, viewer: ViewerId) -> Vec<(TargetId, HighlightColor)> {
        self.by_viewer
            .get(&viewer)
            .map(|s| s.entities.iter().map(|r| (*r.key(), *r.value())).collect())
            .unwrap_or_default()
    }

    pub fn highlighted_cells(&self, viewer: ViewerId) -> Vec<(CellPos, HighlightColor)> {
        self.by_viewer
            .get(&viewer)
            .map(|s| s.cells.iter().map(|r| (*r.key(), *r.value())).collect())
            .unwrap_or_default()
    }

    pub fn is_entity_highlighted(&self, viewer: ViewerId, target: TargetId) -> bool {
        self.by_viewer
            .get(&viewer)
            .map(|s| s.entities.contains_key(&target))
            .unwrap_or(false)
    }

    pub fn is_cell_highlighted(&self, viewer: ViewerId, cell: CellPos) -> bool {
        self.by_viewer
            .get(&viewer)
            .map(|s| s.cells.contains_key(&cell))
            .unwrap_or(false)
    }

    pub fn stats(&self) -> HighlightStats {
        let mut stats = HighlightStats {
            active_viewers: self.by_viewer.len(),
            total_operations: self.total_operations.load(Ordering::Relaxed),
            ..HighlightStats::default()
        };
        for entry in self.by_viewer.iter() {
            let (viewer, state) = (*entry.key(), entry.value());
            stats.total_entities += state.entities.len();
            stats.total_cells += state.cells.len();
            stats.per_viewer_entities.insert(viewer, state.entities.len());
            stats.per_viewer_cells.insert(viewer, state.cells.len());
            for color in state.entities.iter().map(|r| *r.value()) {
                *stats.color_distribution.entry(color).or_insert(0) += 1;
            }
            for color in state.cells.iter().map(|r| *r.value()) {
                *stats.color_distribution.entry(color).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Register a veto hook. Every apply/unapply raises a before-apply
    /// notification; any deny suppresses both the wire traffic and the state
    /// mutation.
    pub fn add_hook(&self, hook: Arc<dyn HighlightHook>) {
        self.hooks.write().push(hook);
    }

    /// Cancel every scheduled task and drop all state. Host shutdown path;
    /// sends nothing.
    pub fn shutdown(&self) {
        for entry in self.conditionals.iter() {
            entry.value().cancel();
        }
        self.conditionals.clear();
        for map in [&self.entity_timers, &self.entity_animations] {
            for entry in map.iter() {
                entry.value().cancel();
            }
            map.clear();
        }
        for map in [&self.cell_timers, &self.cell_animations] {
            for entry in map.iter() {
                entry.value().cancel();
            }
            map.clear();
        }
        self.by_viewer.clear();
        self.viewers_by_entity.clear();
        self.viewers_by_cell.clear();
        self.cells.shutdown();
        self.entities.shutdown();
        info!("[SERVICE] Highlight service shut down");
    }

    // =========================================================================
    // Internal: apply / remove
    // =========================================================================

    /// Hook check plus the manager-level apply. State maps update only after
    /// the wire operation succeeded.
    fn apply_entity(&self, target: TargetId, color: HighlightColor, viewer: ViewerId) -> bool {
        match self.show_entity(target, color, viewer) {
            Ok(()) => {
                self.viewer_state(viewer).entities.insert(target, color);
                self.viewers_by_entity
                    .entry(target)
                    .or_default()
                    .insert(viewer);
                true
            }
            Err(HighlightError::Vetoed) => false,
            Err(e) => {
                warn!(?viewer, ?target, error = %e, "[SERVICE] Entity highlight failed");
                false
            }
        }
    }

    fn show_entity(
        &self,
        target: TargetId,
        color: HighlightColor,
        viewer: ViewerId,
    ) -> Result<(), HighlightError> {
        if !self.allowed(&HighlightChange::EntityApply {
            viewer,
            target,
            color,
        }) {
            debug!(?viewer, ?target, "[SERVICE] Entity highlight vetoed");
            return Err(HighlightError::Vetoed);
        }
        let Some(identifier) = self.world.target_identifier(target) else {
            debug!(?viewer, ?target, "[SERVICE] Target has no identifier, skipping");
            return Err(HighlightError::Vetoed);
        };
        let flags = self.world.target_flags(target).unwrap_or(0);
        self.entities
            .set_highlight(target, &identifier, viewer, Some(color), flags, self.default_options)
    }

    fn remove_entity(&self, target: TargetId, viewer: ViewerId) -> bool {
        let tracked = self
            .by_viewer
            .get(&viewer)
            .map(|s| s.entities.contains_key(&target))
            .unwrap_or(false);
        if !tracked {
            return false;
        }
        if !self.allowed(&HighlightChange::EntityClear { viewer, target }) {
            debug!(?viewer, ?target, "[SERVICE] Entity unhighlight vetoed");
            return false;
        }
        match self.entities.clear_highlight(target, viewer) {
            Ok(()) => {
                self.forget_entity(viewer, target);
                self.drop_viewer_if_empty(viewer);
                self.bump();
                true
            }
            Err(e) => {
                warn!(?viewer, ?target, error = %e, "[SERVICE] Entity unhighlight failed");
                false
            }
        }
    }

    /// Reapply for a viewer whose client may have lost the wire state: if
    /// the manager still holds a record, force a resend; otherwise rebuild
    /// it from scratch.
    fn reapply_entity(&self, target: TargetId, color: HighlightColor, viewer: ViewerId) -> bool {
        if self.entities.record(viewer, target).is_none() {
            return self.apply_entity(target, color, viewer);
        }
        if !self.allowed(&HighlightChange::EntityApply {
            viewer,
            target,
            color,
        }) {
            debug!(?viewer, ?target, "[SERVICE] Entity reapply vetoed");
            return false;
        }
        match self.entities.resend_highlight(target, viewer) {
            Ok(()) => true,
            Err(e) => {
                warn!(?viewer, ?target, error = %e, "[SERVICE] Entity reapply failed");
                false
            }
        }
    }

    fn apply_cell(&self, cell: CellPos, color: HighlightColor, viewer: ViewerId) -> bool {
        match self.show_cell(cell, color, viewer) {
            Ok(()) => {
                self.viewer_state(viewer).cells.insert(cell, color);
                self.viewers_by_cell.entry(cell).or_default().insert(viewer);
                true
            }
            Err(HighlightError::Vetoed) => false,
            Err(e) => {
                warn!(?viewer, ?cell, error = %e, "[SERVICE] Cell highlight failed");
                false
            }
        }
    }

    fn show_cell(
        &self,
        cell: CellPos,
        color: HighlightColor,
        viewer: ViewerId,
    ) -> Result<(), HighlightError> {
        if !self.allowed(&HighlightChange::CellApply { viewer, cell, color }) {
            debug!(?viewer, ?cell, "[SERVICE] Cell highlight vetoed");
            return Err(HighlightError::Vetoed);
        }
        self.cells.set_highlight(cell, viewer, color, self.default_options)
    }

    fn remove_cell(&self, cell: CellPos, viewer: ViewerId) -> bool {
        let tracked = self
            .by_viewer
            .get(&viewer)
            .map(|s| s.cells.contains_key(&cell))
            .unwrap_or(false);
        if !tracked {
            return false;
        }
        if !self.allowed(&HighlightChange::CellClear { viewer, cell }) {
            debug!(?viewer, ?cell, "[SERVICE] Cell unhighlight vetoed");
            return false;
        }
        match self.cells.clear_highlight(cell, viewer) {
            Ok(()) => {
                self.forget_cell(viewer, cell);
                self.drop_viewer_if_empty(viewer);
                self.bump();
                true
            }
            Err(e) => {
                warn!(?viewer, ?cell, error = %e, "[SERVICE] Cell unhighlight failed");
                false
            }
        }
    }

    // =========================================================================
    // Internal: bookkeeping
    // =========================================================================

    fn viewer_state(&self, viewer: ViewerId) -> Arc<ViewerState> {
        self.by_viewer.entry(viewer).or_default().clone()
    }

    fn drop_viewer_if_empty(&self, viewer: ViewerId) {
        self.by_viewer
            .remove_if(&viewer, |_, state| state.entities.is_empty() && state.cells.is_empty());
    }

    fn forget_entity(&self, viewer: ViewerId, target: TargetId) {
        if let Some(state) = self.by_viewer.get(&viewer) {
            state.entities.remove(&target);
        }
        if let Some(set) = self.viewers_by_entity.get(&target) {
            set.remove(&viewer);
        }
        self.viewers_by_entity.remove_if(&target, |_, set| set.is_empty());
        cancel_task(&self.entity_timers, &(viewer, target));
        cancel_task(&self.entity_animations, &(viewer, target));
    }

    fn forget_cell(&self, viewer: ViewerId, cell: CellPos) {
        if let Some(state) = self.by_viewer.get(&viewer) {
            state.cells.remove(&cell);
        }
        if let Some(set) = self.viewers_by_cell.get(&cell) {
            set.remove(&viewer);
        }
        self.viewers_by_cell.remove_if(&cell, |_, set| set.is_empty());
        cancel_task(&self.cell_timers, &(viewer, cell));
        cancel_task(&self.cell_animations, &(viewer, cell));
    }

    fn allowed(&self, change: &HighlightChange) -> bool {
        self.hooks
            .read()
            .iter()
            .all(|hook| hook.before_apply(change) == Verdict::Allow)
    }

    fn bump(&self) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Internal: scheduled work
    // =========================================================================

    fn schedule_entity_unset(&self, viewer: ViewerId, target: TargetId, delay_ticks: u64) {
        cancel_task(&self.entity_timers, &(viewer, target));
        let me = self.me.clone();
        let task = self.scheduler.run_after(
            delay_ticks,
            Box::new(move || {
                if let Some(service) = me.upgrade() {
                    service.unhighlight_entity(target, &[viewer]);
                }
            }),
        );
        self.entity_timers.insert((viewer, target), task);
    }

    fn schedule_cell_unset(&self, viewer: ViewerId, cell: CellPos, delay_ticks: u64) {
        cancel_task(&self.cell_timers, &(viewer, cell));
        let me = self.me.clone();
        let task = self.scheduler.run_after(
            delay_ticks,
            Box::new(move || {
                if let Some(service) = me.upgrade() {
                    service.unhighlight_cell(cell, &[viewer]);
                }
            }),
        );
        self.cell_timers.insert((viewer, cell), task);
    }

    fn start_entity_animation(
        &self,
        target: TargetId,
        animation: Arc<dyn HighlightAnimation>,
        viewer: ViewerId,
    ) {
        cancel_task(&self.entity_animations, &(viewer, target));
        let me = self.me.clone();
        let mut tick: u64 = 0;
        let task = self.scheduler.run_every(
            self.config.animation_interval_ticks,
            Box::new(move || {
                let Some(service) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                if !service.world.target_alive(target) || !service.world.viewer_connected(viewer) {
                    return ControlFlow::Break(());
                }
                service.apply_entity(target, animation.color_at(tick), viewer);
                if animation.is_complete(tick) {
                    return ControlFlow::Break(());
                }
                tick += 1;
                ControlFlow::Continue(())
            }),
        );
        self.entity_animations.insert((viewer, target), task);
    }

    fn start_cell_animation(
        &self,
        cell: CellPos,
        animation: Arc<dyn HighlightAnimation>,
        viewer: ViewerId,
    ) {
        cancel_task(&self.cell_animations, &(viewer, cell));
        let me = self.me.clone();
        let mut tick: u64 = 0;
        let task = self.scheduler.run_every(
            self.config.animation_interval_ticks,
            Box::new(move || {
                let Some(service) = me.upgrade() else {
                    return ControlFlow::Break(());
                };
                if !service.world.cell_occupied(cell) || !service.world.viewer_connected(viewer) {
                    return ControlFlow::Break(());
                }
                service.apply_cell(cell, animation.color_at(tick), viewer);
                if animation.is_complete(tick) {
                    return ControlFlow::Break(());
                }
                tick += 1;
                ControlFlow::Continue(())
            }),
        );
        self.cell_animations.insert((viewer, cell), task);
    }
}

// =============================================================================
// Task-map helpers
// =============================================================================

fn cancel_task<K: std::hash::Hash + Eq>(map: &DashMap<K, TaskHandle>, key: &K) {
    if let Some((_, task)) = map.remove(key) {
        task.cancel();
    }
}

fn cancel_tasks_for_viewer<K: std::hash::Hash + Eq>(
    map: &DashMap<K, TaskHandle>,
    viewer: ViewerId,
    viewer_of: impl Fn(&K) -> ViewerId,
) {
    map.retain(|key, task| {
        if viewer_of(key) == viewer {
            task.cancel();
            false
        } else {
            true
        }
    });
}

// =============================================================================
// TESTS
// =============================================================================
