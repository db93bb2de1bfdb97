//! Count buffers: the observable boundary.  Each buffer receives exactly one
//! (time, value) pair per configured period, with strictly increasing times.

use std::io::Write;

use serde::{Deserialize, Serialize};

use crate::base::{ObjectId, SpeciesId, Time};
use crate::geometry::GeometryModel;
use crate::molecule::MolPlace;
use crate::partition::Partition;
use crate::species::Registry;
use crate::state::SimState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountRegion {
    /// Everything in the simulated volume.
    World,
    /// Molecules enclosed by (or, for surface molecules, sitting on) one
    /// geometry object.
    Object(ObjectId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountSpec {
    pub name: String,
    /// Species pattern; wildcard species ids match.
    pub species: SpeciesId,
    pub region: CountRegion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountBuffer {
    pub spec: CountSpec,
    pub period: Time,
    pub entries: Vec<(Time, f64)>,
}

impl CountBuffer {
    pub fn new(spec: CountSpec, period: Time) -> Self {
        CountBuffer {
            spec,
            period,
            entries: Vec::new(),
        }
    }

    /// Appends an observation.  Emission times come from the scheduler's
    /// period chain, so they are strictly increasing; a violation means the
    /// queue is corrupt.
    pub fn record(&mut self, time: Time, value: f64) {
        if let Some(&(last, _)) = self.entries.last() {
            assert!(
                time > last,
                "count buffer {} received non-monotone time {} after {}",
                self.spec.name,
                time,
                last
            );
        }
        self.entries.push((time, value));
    }

    /// Columnar gdat-style text: one `time value` row per emission.
    pub fn write_gdat<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        writeln!(w, "# time {}", self.spec.name)?;
        for &(t, v) in &self.entries {
            writeln!(w, "{t:.10e} {v:.10e}")?;
        }
        Ok(())
    }
}

/// Evaluates one count spec against the current molecule population.
/// Volume molecules count toward an object when their species opts into
/// enclosed counting and their subvolume's cached enclosure list contains
/// the object; surface molecules count when they sit on one of its walls.
pub fn evaluate(
    reg: &Registry,
    geom: &GeometryModel,
    partition: &Partition,
    state: &SimState,
    spec: &CountSpec,
) -> f64 {
    let mut n = 0u64;
    for mol in state.live_molecules() {
        if !reg.species_matches(spec.species, mol.species) {
            continue;
        }
        let counted = match spec.region {
            CountRegion::World => true,
            CountRegion::Object(o) => match mol.place {
                MolPlace::Volume { .. } => {
                    reg.species[mol.species].count_enclosed
                        && partition.enclosing_objects(mol.subvol).contains(&o)
                }
                MolPlace::Surface { wall, .. } => geom.walls[wall].object == o,
            },
        };
        if counted {
            n += 1;
        }
    }
    n as f64
}
