use glam::{DVec2, DVec3};
use serde::{Deserialize, Serialize};

use crate::base::{MolId, SpeciesId, SubvolIx, Time, WallId};
use crate::geometry::GeometryModel;
use crate::species::Orient;

/// Where a molecule lives: free in the volume, or pinned to a wall's plane
/// in that wall's local 2D frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum MolPlace {
    Volume { pos: DVec3 },
    Surface { wall: WallId, uv: DVec2, orient: Orient },
}

/// A diffusing particle instance.  Slots live in [`crate::state::SimState`]'s
/// arena; a defunct molecule is logically deleted but keeps its slot until a
/// compaction pass, so ids stay stable for queued events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Molecule {
    pub id: MolId,
    pub species: SpeciesId,
    pub place: MolPlace,
    pub subvol: SubvolIx,
    pub birthday: Time,
    /// Scheduled unimolecular event time, if any.  A popped timer that does
    /// not match this exactly is stale and is discarded.
    pub next_unimol: Option<Time>,
    pub defunct: bool,
}

impl Molecule {
    pub fn world_pos(&self, geom: &GeometryModel) -> DVec3 {
        match self.place {
            MolPlace::Volume { pos } => pos,
            MolPlace::Surface { wall, uv, .. } => geom.uv_to_world(wall, uv),
        }
    }

    pub fn is_volume(&self) -> bool {
        matches!(self.place, MolPlace::Volume { .. })
    }

    pub fn wall(&self) -> Option<WallId> {
        match self.place {
            MolPlace::Surface { wall, .. } => Some(wall),
            MolPlace::Volume { .. } => None,
        }
    }

    pub fn orient(&self) -> Orient {
        match self.place {
            MolPlace::Surface { orient, .. } => orient,
            MolPlace::Volume { .. } => Orient::None,
        }
    }
}
