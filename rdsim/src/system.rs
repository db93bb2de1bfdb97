//! The simulation driver: an immutable `RdSystem` (species, rules, geometry,
//! schedule policy) evolving mutable `SimState`s one queued event at a time.

use std::path::PathBuf;
use std::time::Duration;

use glam::DVec3;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
#[cfg(feature = "use_rayon")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::base::{NumEvents, NumMols, ObjectId, SimResult, SpeciesId, Time};
use crate::counts::{self, CountBuffer, CountSpec};
use crate::diffusion::diffuse;
use crate::geometry::GeometryModel;
use crate::model::ModelError;
use crate::molecule::MolPlace;
use crate::partition::Partition;
use crate::reaction::{fire_unimolecular, schedule_new_molecule};
use crate::scheduler::EventKind;
use crate::species::{Orient, Registry, SpeciesKind};
use crate::state::SimState;

/// Defunct arena slots are reclaimed after this many events.
const COMPACT_EVERY: NumEvents = 4096;

#[derive(Debug)]
pub enum StepOutcome {
    HadEventAt(Time),
    /// The popped event referenced a dead molecule or a stale timer.
    DeadEventAt(Time),
    EmptyQueue,
}

#[derive(Debug, Copy, Clone, Default, Serialize, Deserialize)]
pub struct EvolveBounds {
    /// Stop if this number of events has taken place during this evolve call.
    pub for_events: Option<NumEvents>,
    /// Stop if this number of events has been reached in total for the state.
    pub total_events: Option<NumEvents>,
    /// Stop if this amount of (simulated) time has passed during this evolve call.
    pub for_time: Option<f64>,
    /// Stop if this amount of (simulated) time has passed in total for the state.
    pub total_time: Option<f64>,
    /// Stop if the number of live molecules reaches this number.
    pub max_mols: Option<NumMols>,
    /// Stop after this amount of (real) time has passed.
    pub for_wall_time: Option<Duration>,
}

impl EvolveBounds {
    pub fn for_time(mut self, time: f64) -> Self {
        self.for_time = Some(time);
        self
    }

    pub fn for_events(mut self, events: NumEvents) -> Self {
        self.for_events = Some(events);
        self
    }

    /// Will the bounds actually bound anything, or will the evolve call run
    /// until the queue drains?
    pub fn is_strongly_bounded(&self) -> bool {
        self.for_events.is_some()
            || self.total_events.is_some()
            || self.for_time.is_some()
            || self.total_time.is_some()
            || self.for_wall_time.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvolveOutcome {
    ReachedEventsMax,
    ReachedTimeMax,
    ReachedWallTimeMax,
    ReachedMolsMax,
    ReachedEmptyQueue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReleaseShape {
    /// All molecules at one point.
    Point(DVec3),
    /// Uniform over an axis-aligned box.
    Box { min: DVec3, max: DVec3 },
    /// Uniform over the walls of one object, area-weighted.
    Surface { object: ObjectId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseSite {
    pub name: String,
    pub species: SpeciesId,
    pub count: NumMols,
    pub shape: ReleaseShape,
    /// Orientation stamped on surface molecules; ignored for volume species.
    pub orient: Orient,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountConfig {
    pub spec: CountSpec,
    pub period: Time,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    pub period: Time,
    pub path: PathBuf,
}

/// Everything fixed for the duration of a run.  States are derived from it
/// and evolved against it; the system itself only changes through
/// [`RdSystem::move_vertices`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RdSystem {
    pub registry: Registry,
    pub geometry: GeometryModel,
    /// Partition template with walls binned and enclosure cached; cloned
    /// into each new state.
    pub partition: Partition,
    /// Global time step; per-species steps derive from it.
    pub dt: Time,
    pub seed: u64,
    pub releases: Vec<ReleaseSite>,
    pub counts: Vec<CountConfig>,
    pub checkpoint: Option<CheckpointPolicy>,
}

impl RdSystem {
    /// Builds a fresh state: initial populations placed, count buffers
    /// armed, first events queued.
    pub fn new_state(&self) -> SimState {
        self.new_state_with_seed(self.seed)
    }

    pub fn new_state_with_seed(&self, seed: u64) -> SimState {
        let mut state = SimState::new(self.partition.clone(), ChaCha8Rng::seed_from_u64(seed));
        for site in &self.releases {
            self.release(&mut state, site);
        }
        for (i, cc) in self.counts.iter().enumerate() {
            state.buffers.push(CountBuffer::new(cc.spec.clone(), cc.period));
            state.queue.schedule(0.0, EventKind::Count(i));
        }
        if let Some(policy) = &self.checkpoint {
            state.queue.schedule(policy.period, EventKind::Checkpoint);
        }
        state
    }

    fn release(&self, state: &mut SimState, site: &ReleaseSite) {
        for _ in 0..site.count {
            let place = match (&self.registry.species[site.species].kind, &site.shape) {
                (SpeciesKind::Volume, ReleaseShape::Point(p)) => MolPlace::Volume { pos: *p },
                (SpeciesKind::Volume, ReleaseShape::Box { min, max }) => {
                    let u = DVec3::new(
                        state.rng.random(),
                        state.rng.random(),
                        state.rng.random(),
                    );
                    MolPlace::Volume {
                        pos: *min + u * (*max - *min),
                    }
                }
                (SpeciesKind::Surface, ReleaseShape::Surface { object }) => {
                    let (wall, uv) = self.sample_object_surface(state, *object);
                    MolPlace::Surface {
                        wall,
                        uv,
                        orient: site.orient,
                    }
                }
                // Shape/kind combinations are rejected at model build.
                _ => unreachable!("validated at build"),
            };
            let world = match place {
                MolPlace::Volume { pos } => pos,
                MolPlace::Surface { wall, uv, .. } => self.geometry.uv_to_world(wall, uv),
            };
            let subvol = state.partition.locate(world);
            let id = state.new_molecule(site.species, place, subvol, 0.0);
            schedule_new_molecule(&self.registry, state, id, 0.0, self.dt);
        }
    }

    /// Area-weighted wall choice plus a uniform barycentric point.
    fn sample_object_surface(
        &self,
        state: &mut SimState,
        object: ObjectId,
    ) -> (usize, glam::DVec2) {
        let walls = &self.geometry.objects[object].walls;
        let total: f64 = walls.iter().map(|&w| self.geometry.walls[w].area).sum();
        let mut pick: f64 = state.rng.random::<f64>() * total;
        let mut wall = *walls.last().expect("objects have at least one wall");
        for &w in walls {
            pick -= self.geometry.walls[w].area;
            if pick <= 0.0 {
                wall = w;
                break;
            }
        }
        let mut r1: f64 = state.rng.random();
        let mut r2: f64 = state.rng.random();
        if r1 + r2 > 1.0 {
            r1 = 1.0 - r1;
            r2 = 1.0 - r2;
        }
        let [a, b, c] = self.geometry.wall_corners(wall);
        let world = a + r1 * (b - a) + r2 * (c - a);
        (wall, self.geometry.world_to_uv(wall, world))
    }

    /// Pops and executes one event, advancing the state's clock to it.
    pub fn take_single_step(&self, state: &mut SimState) -> SimResult<StepOutcome> {
        let event = match state.queue.pop_next() {
            Some(e) => e,
            None => return Ok(StepOutcome::EmptyQueue),
        };
        state.set_time(event.time);
        state.add_events(1);
        if state.total_events() % COMPACT_EVERY == 0 {
            state.compact();
        }

        match event.kind {
            EventKind::Diffuse(id) => {
                if !state.is_live(id) {
                    return Ok(StepOutcome::DeadEventAt(event.time));
                }
                diffuse(&self.registry, &self.geometry, state, id, self.dt)?;
                if state.is_live(id) {
                    let sp = state.mol(id).species;
                    let dt = self.registry.time_step_for(sp, self.dt);
                    state
                        .queue
                        .schedule(event.time + dt, EventKind::Diffuse(id));
                }
            }
            EventKind::Unimolecular(id) => {
                if !state.is_live(id) {
                    return Ok(StepOutcome::DeadEventAt(event.time));
                }
                // A timer that does not match the molecule's armed time was
                // superseded and is discarded.
                if state.mol(id).next_unimol != Some(event.time) {
                    return Ok(StepOutcome::DeadEventAt(event.time));
                }
                state.mol_mut(id).next_unimol = None;
                fire_unimolecular(&self.registry, &self.geometry, state, id, self.dt)?;
            }
            EventKind::Count(i) => {
                let spec = state.buffers[i].spec.clone();
                let value =
                    counts::evaluate(&self.registry, &self.geometry, &state.partition, state, &spec);
                state.buffers[i].record(event.time, value);
                let period = state.buffers[i].period;
                state
                    .queue
                    .schedule(event.time + period, EventKind::Count(i));
            }
            EventKind::Checkpoint => {
                if let Some(policy) = &self.checkpoint {
                    // Arm the follow-up before writing so the snapshot itself
                    // carries the next checkpoint event; a resumed run then
                    // keeps checkpointing and allocates the same queue seqs.
                    state
                        .queue
                        .schedule(event.time + policy.period, EventKind::Checkpoint);
                    crate::checkpoint::save(&policy.path, self, state)?;
                }
            }
        }
        Ok(StepOutcome::HadEventAt(event.time))
    }

    pub fn evolve(&self, state: &mut SimState, bounds: EvolveBounds) -> SimResult<EvolveOutcome> {
        let mut events_max = bounds.for_events.map(|e| state.total_events() + e);
        if let Some(te) = bounds.total_events {
            events_max = Some(events_max.map_or(te, |em| em.min(te)));
        }
        let mut time_max = bounds.for_time.map(|t| state.time() + t);
        if let Some(tt) = bounds.total_time {
            time_max = Some(time_max.map_or(tt, |tm| tm.min(tt)));
        }
        let start = bounds.for_wall_time.map(|_| std::time::Instant::now());

        loop {
            if bounds.max_mols.is_some_and(|m| state.n_mols() >= m) {
                return Ok(EvolveOutcome::ReachedMolsMax);
            } else if bounds
                .for_wall_time
                .is_some_and(|t| start.unwrap().elapsed() >= t)
            {
                return Ok(EvolveOutcome::ReachedWallTimeMax);
            } else if events_max.is_some_and(|em| state.total_events() >= em) {
                return Ok(EvolveOutcome::ReachedEventsMax);
            }
            if let Some(tm) = time_max {
                // Stop the clock at the bound rather than executing past it.
                if state.queue.peek_time().is_some_and(|next| next > tm) {
                    state.set_time(tm);
                    return Ok(EvolveOutcome::ReachedTimeMax);
                }
            }
            match self.take_single_step(state)? {
                StepOutcome::HadEventAt(_) | StepOutcome::DeadEventAt(_) => {}
                StepOutcome::EmptyQueue => return Ok(EvolveOutcome::ReachedEmptyQueue),
            }
        }
    }

    #[cfg(feature = "use_rayon")]
    pub fn evolve_states(
        &self,
        states: &mut [SimState],
        bounds: EvolveBounds,
    ) -> Vec<SimResult<EvolveOutcome>> {
        states
            .par_iter_mut()
            .map(|state| self.evolve(state, bounds))
            .collect()
    }

    #[cfg(not(feature = "use_rayon"))]
    pub fn evolve_states(
        &self,
        states: &mut [SimState],
        bounds: EvolveBounds,
    ) -> Vec<SimResult<EvolveOutcome>> {
        states
            .iter_mut()
            .map(|state| self.evolve(state, bounds))
            .collect()
    }

    /// Displaces geometry vertices, then rebuilds the wall bins and
    /// enclosure caches that depend on them.  Molecule positions are not
    /// touched; surface molecules ride their (re-derived) walls.  Returns the
    /// wall pairs the move left colliding, for the caller to reject or
    /// retry with a smaller displacement.
    pub fn move_vertices(
        &mut self,
        state: &mut SimState,
        moves: &[(crate::base::VertexId, DVec3)],
    ) -> Result<Vec<(crate::base::WallId, crate::base::WallId)>, ModelError> {
        let collisions = self.geometry.apply_vertex_moves(moves)?;
        self.partition.bin_walls(&self.geometry);
        self.partition.compute_enclosure(&self.geometry);
        state.partition.bin_walls(&self.geometry);
        state.partition.compute_enclosure(&self.geometry);
        Ok(collisions)
    }
}
