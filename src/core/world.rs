//! World view seam
//!
//! Read-only queries against the host simulation. Everything the highlight
//! logic needs to know about viewers, entities and cells comes through this
//! trait; the concrete implementation wraps the host's spatial index and
//! session registry. Mock implementations live in `mocks` for tests.

use super::types::{CellPos, TargetId, ViewerId, WorldPos};

/// Read-only access to the host simulation.
///
/// Spatial queries are expected to be exact: `entities_in_radius` returns
/// entities within the sphere, not a bounding box.
pub trait WorldView: Send + Sync {
    /// Whether the viewer has a live, renderable session.
    fn viewer_connected(&self, viewer: ViewerId) -> bool;

    fn viewer_position(&self, viewer: ViewerId) -> Option<WorldPos>;

    /// The viewer's own configured perception radius, in regions.
    fn viewer_view_radius(&self, viewer: ViewerId) -> Option<u32>;

    /// The target id of the viewer's own avatar entity, when the host gives
    /// viewers a presence in the world.
    fn viewer_target(&self, viewer: ViewerId) -> Option<TargetId>;

    /// Whether the target still exists in the simulation.
    fn target_alive(&self, target: TargetId) -> bool;

    /// The string a group membership message names this target by.
    fn target_identifier(&self, target: TargetId) -> Option<String>;

    /// The target's current cached flag byte.
    fn target_flags(&self, target: TargetId) -> Option<u8>;

    fn target_position(&self, target: TargetId) -> Option<WorldPos>;

    /// Host registry id of the target's entity kind.
    fn target_kind(&self, target: TargetId) -> Option<u16>;

    /// Live entities within `radius` of `center`, same world only.
    fn entities_in_radius(&self, center: WorldPos, radius: f64) -> Vec<TargetId>;

    /// Live entities in the viewer's perception range, candidates for
    /// conditional scans.
    fn entities_near(&self, viewer: ViewerId) -> Vec<TargetId>;

    /// The entity under the viewer's crosshair within `max_distance`.
    fn crosshair_entity(&self, viewer: ViewerId, max_distance: f64) -> Option<TargetId>;

    /// The cell under the viewer's crosshair within `max_distance`.
    fn crosshair_cell(&self, viewer: ViewerId, max_distance: f64) -> Option<CellPos>;

    /// Cells along the viewer's line of sight, nearest first.
    fn sight_path(&self, viewer: ViewerId, max_distance: f64) -> Vec<CellPos>;

    fn has_line_of_sight(&self, viewer: ViewerId, target: TargetId) -> bool;

    /// Whether the cell holds something renderable (highlighting empty air
    /// is rejected).
    fn cell_occupied(&self, cell: CellPos) -> bool;
}

// =============================================================================
// TEST MOCKS
// =============================================================================


// =============================================================================
// TESTS
// =============================================================================
