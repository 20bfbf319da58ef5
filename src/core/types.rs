//! Core identifiers and coordinates
//!
//! Viewer/target ids are transient per-session numeric handles assigned by
//! the host; they carry no meaning across restarts. Cell coordinates are
//! integral by construction, world positions are the host's floating-point
//! space.

use std::sync::atomic::{AtomicI32, Ordering};

use serde::{Deserialize, Serialize};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// A connected session that receives wire messages and renders the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewerId(pub u64);

/// An entity, or a proxy standing in for a static cell, identified by a
/// transient per-session numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TargetId(pub i32);

/// A loaded world/dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorldId(pub u64);

// =============================================================================
// POSITIONS
// =============================================================================

/// A point in a world's continuous coordinate space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorldPos {
    pub world: WorldId,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl WorldPos {
    pub fn new(world: WorldId, x: f64, y: f64, z: f64) -> Self {
        Self { world, x, y, z }
    }

    /// The cell containing this position.
    pub fn cell(&self) -> CellPos {
        CellPos::from_world(*self)
    }

    /// 3D distance to another position (worlds are not compared).
    pub fn distance_to(&self, other: &WorldPos) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// An integer cell of the world grid.
///
/// Always whole-cell coordinates; build one from a `WorldPos` with
/// [`CellPos::from_world`], which floors each axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    pub world: WorldId,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl CellPos {
    pub fn new(world: WorldId, x: i32, y: i32, z: i32) -> Self {
        Self { world, x, y, z }
    }

    /// Normalize a continuous position to the cell containing it.
    pub fn from_world(pos: WorldPos) -> Self {
        Self {
            world: pos.world,
            x: pos.x.floor() as i32,
            y: pos.y.floor() as i32,
            z: pos.z.floor() as i32,
        }
    }

    /// Center of the cell on the horizontal axes (proxy spawn position).
    pub fn center(&self) -> WorldPos {
        WorldPos {
            world: self.world,
            x: self.x as f64 + 0.5,
            y: self.y as f64,
            z: self.z as f64 + 0.5,
        }
    }

    /// The 16x16 region column containing this cell.
    pub fn region(&self) -> RegionPos {
        RegionPos {
            world: self.world,
            x: self.x >> 4,
            z: self.z >> 4,
        }
    }
}

/// A 16x16-cell column of the world grid (cell coordinates >> 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionPos {
    pub world: WorldId,
    pub x: i32,
    pub z: i32,
}

// =============================================================================
// ID ALLOCATOR
// =============================================================================

/// Allocator for proxy target ids plus the per-session uid used in group
/// names. An explicit injected resource: constructors take it as an argument
/// instead of reaching for process-global state.
#[derive(Debug)]
pub struct IdAllocator {
    uid: u32,
    next: AtomicI32,
}

impl IdAllocator {
    /// Randomly seeded allocator. Ids start high above typical host entity
    /// id ranges to avoid collisions with real entities.
    pub fn new() -> Self {
        Self::with_ids(fastrand::u32(..), fastrand::i32(1_000_000..2_000_000_000))
    }

    /// Fully deterministic allocator (tests, replays).
    pub fn with_ids(uid: u32, first_id: i32) -> Self {
        Self {
            uid,
            next: AtomicI32::new(first_id),
        }
    }

    /// Session uid, stable for the allocator's lifetime.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Next unique target id.
    pub fn next_target_id(&self) -> TargetId {
        TargetId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TESTS
// =============================================================================
