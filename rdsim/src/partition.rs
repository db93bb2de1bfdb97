//! Uniform spatial partition: subvolume cells owning the molecules located
//! inside them and the walls that intersect them.

use glam::DVec3;
use ndarray::Array3;
use serde::{Deserialize, Serialize};

use crate::base::{MolId, ObjectId, SimError, SimResult, SubvolIx, WallId};
use crate::geometry::{GeometryModel, EPS_GEOM};
use crate::model::ModelError;

/// One partition cell.  Molecule membership mutates continuously; wall
/// membership only at setup and after vertex moves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Subvolume {
    pub mols: Vec<MolId>,
    pub walls: Vec<WallId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Partition {
    min: DVec3,
    max: DVec3,
    cell: f64,
    shape: (usize, usize, usize),
    grid: Array3<Subvolume>,
    /// Per-cell list of geometry objects containing the cell center,
    /// precomputed for counted-volume enclosure queries.
    enclosure: Vec<Vec<ObjectId>>,
}

impl Partition {
    pub fn new(min: DVec3, max: DVec3, cell: f64) -> Result<Self, ModelError> {
        if cell <= 0.0 || min.cmpge(max).any() {
            return Err(ModelError::BadPartition {
                min: min.to_array(),
                max: max.to_array(),
                cell,
            });
        }
        let ext = max - min;
        let shape = (
            (ext.x / cell).ceil().max(1.0) as usize,
            (ext.y / cell).ceil().max(1.0) as usize,
            (ext.z / cell).ceil().max(1.0) as usize,
        );
        Ok(Partition {
            min,
            max,
            cell,
            shape,
            grid: Array3::from_elem(shape, Subvolume::default()),
            enclosure: vec![Vec::new(); shape.0 * shape.1 * shape.2],
        })
    }

    pub fn world_min(&self) -> DVec3 {
        self.min
    }

    pub fn world_max(&self) -> DVec3 {
        self.max
    }

    pub fn n_subvols(&self) -> usize {
        self.shape.0 * self.shape.1 * self.shape.2
    }

    pub fn shape(&self) -> (usize, usize, usize) {
        self.shape
    }

    fn flat(&self, c: (usize, usize, usize)) -> SubvolIx {
        c.0 + self.shape.0 * (c.1 + self.shape.1 * c.2)
    }

    fn coords(&self, ix: SubvolIx) -> (usize, usize, usize) {
        let x = ix % self.shape.0;
        let rest = ix / self.shape.0;
        (x, rest % self.shape.1, rest / self.shape.1)
    }

    fn axis_cell(&self, value: f64, origin: f64, n: usize) -> usize {
        let c = ((value - origin) / self.cell).floor() as isize;
        c.clamp(0, n as isize - 1) as usize
    }

    /// Maps a point to its owning subvolume.  Out-of-bounds positions clamp
    /// to the boundary cell; the policy is deterministic by construction.
    pub fn locate(&self, p: DVec3) -> SubvolIx {
        self.flat((
            self.axis_cell(p.x, self.min.x, self.shape.0),
            self.axis_cell(p.y, self.min.y, self.shape.1),
            self.axis_cell(p.z, self.min.z, self.shape.2),
        ))
    }

    pub fn cell_bounds(&self, ix: SubvolIx) -> (DVec3, DVec3) {
        let (x, y, z) = self.coords(ix);
        let lo = self.min + DVec3::new(x as f64, y as f64, z as f64) * self.cell;
        (lo, lo + DVec3::splat(self.cell))
    }

    pub fn cell_center(&self, ix: SubvolIx) -> DVec3 {
        let (lo, hi) = self.cell_bounds(ix);
        0.5 * (lo + hi)
    }

    pub fn subvol(&self, ix: SubvolIx) -> &Subvolume {
        let c = self.coords(ix);
        &self.grid[[c.0, c.1, c.2]]
    }

    fn subvol_mut(&mut self, ix: SubvolIx) -> &mut Subvolume {
        let c = self.coords(ix);
        &mut self.grid[[c.0, c.1, c.2]]
    }

    /// Subvolumes that must be checked for collisions within `radius` of any
    /// point in cell `ix`.  Returned in ascending index order.
    pub fn neighbors_within(&self, ix: SubvolIx, radius: f64) -> Vec<SubvolIx> {
        let (cx, cy, cz) = self.coords(ix);
        let r = (radius / self.cell).ceil() as isize;
        let mut out = Vec::new();
        for dz in -r..=r {
            for dy in -r..=r {
                for dx in -r..=r {
                    let x = cx as isize + dx;
                    let y = cy as isize + dy;
                    let z = cz as isize + dz;
                    if x < 0
                        || y < 0
                        || z < 0
                        || x >= self.shape.0 as isize
                        || y >= self.shape.1 as isize
                        || z >= self.shape.2 as isize
                    {
                        continue;
                    }
                    out.push(self.flat((x as usize, y as usize, z as usize)));
                }
            }
        }
        out.sort_unstable();
        out
    }

    /// Cells overlapped by the axis-aligned box around a displacement
    /// segment, expanded by `pad`.  Ascending index order.
    pub fn swept(&self, from: DVec3, to: DVec3, pad: f64) -> Vec<SubvolIx> {
        let lo = from.min(to) - DVec3::splat(pad);
        let hi = from.max(to) + DVec3::splat(pad);
        let c0 = (
            self.axis_cell(lo.x, self.min.x, self.shape.0),
            self.axis_cell(lo.y, self.min.y, self.shape.1),
            self.axis_cell(lo.z, self.min.z, self.shape.2),
        );
        let c1 = (
            self.axis_cell(hi.x, self.min.x, self.shape.0),
            self.axis_cell(hi.y, self.min.y, self.shape.1),
            self.axis_cell(hi.z, self.min.z, self.shape.2),
        );
        let mut out = Vec::new();
        for z in c0.2..=c1.2 {
            for y in c0.1..=c1.1 {
                for x in c0.0..=c1.0 {
                    out.push(self.flat((x, y, z)));
                }
            }
        }
        out.sort_unstable();
        out
    }

    pub fn insert_mol(&mut self, ix: SubvolIx, id: MolId) {
        self.subvol_mut(ix).mols.push(id);
    }

    pub fn remove_mol(&mut self, ix: SubvolIx, id: MolId) -> SimResult<()> {
        let sv = self.subvol_mut(ix);
        match sv.mols.iter().position(|&m| m == id) {
            Some(i) => {
                sv.mols.swap_remove(i);
                Ok(())
            }
            None => Err(SimError::PartitionMismatch(id, ix)),
        }
    }

    /// Moves a molecule's membership from `old` to `new`.  A molecule is
    /// never visible in two subvolumes: the removal is checked.
    pub fn migrate(&mut self, id: MolId, old: SubvolIx, new: SubvolIx) -> SimResult<()> {
        if old == new {
            return Ok(());
        }
        self.remove_mol(old, id)?;
        self.insert_mol(new, id);
        Ok(())
    }

    /// Registers every wall with every cell its bounding box overlaps.
    /// Called at setup and again after vertex moves.
    pub fn bin_walls(&mut self, geom: &GeometryModel) {
        for sv in self.grid.iter_mut() {
            sv.walls.clear();
        }
        for w in 0..geom.walls.len() {
            let (lo, hi) = geom.wall_aabb(w);
            for ix in self.swept(lo, hi, EPS_GEOM) {
                self.subvol_mut(ix).walls.push(w);
            }
        }
    }

    /// Precomputes, for every cell, the geometry objects containing the cell
    /// center.  Cached for counted-volume enclosure queries.
    pub fn compute_enclosure(&mut self, geom: &GeometryModel) {
        for ix in 0..self.n_subvols() {
            let center = self.cell_center(ix);
            let mut inside: Vec<ObjectId> = (0..geom.objects.len())
                .filter(|&o| geom.object_contains(o, center))
                .collect();
            inside.sort_unstable();
            self.enclosure[ix] = inside;
        }
    }

    pub fn enclosing_objects(&self, ix: SubvolIx) -> &[ObjectId] {
        &self.enclosure[ix]
    }
}
