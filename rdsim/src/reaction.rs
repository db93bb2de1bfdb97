//! Reaction resolution: unimolecular timers, bimolecular accept/reject
//! decisions, and product synthesis.  All decisions are memoryless given the
//! current molecule state and the run's PRNG stream.

use glam::DVec3;
use rand::Rng;

use crate::base::{MolId, RuleId, SimResult, Time};
use crate::geometry::GeometryModel;
use crate::molecule::{MolPlace, Molecule};
use crate::scheduler::EventKind;
use crate::species::{Registry, SpeciesKind};
use crate::state::SimState;

/// Offset applied to volume reaction products so they do not immediately
/// re-collide with the geometry they were born on.
pub const EPS_PLACE: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    Fired,
    NotFired,
}

/// Draws an exponential waiting time from the species' aggregate
/// unimolecular rate, or `None` if no unimolecular rule applies.
pub fn draw_unimol_time(
    reg: &Registry,
    state: &mut SimState,
    sp: usize,
    now: Time,
) -> Option<Time> {
    let total = reg.unimol_total_rate(sp, now);
    if total <= 0.0 {
        return None;
    }
    // 1 - U is in (0, 1], keeping ln finite.
    let u: f64 = 1.0 - state.rng.random::<f64>();
    Some(now - f64::ln(u) / total)
}

/// Arms (or re-arms) a molecule's unimolecular timer and queues the event.
pub fn schedule_unimol(reg: &Registry, state: &mut SimState, id: MolId, now: Time) {
    let sp = state.mol(id).species;
    if let Some(t) = draw_unimol_time(reg, state, sp, now) {
        state.mol_mut(id).next_unimol = Some(t);
        state.queue.schedule(t, EventKind::Unimolecular(id));
    }
}

/// Queues the first diffusion step and unimolecular timer for a newly
/// created molecule.
pub fn schedule_new_molecule(
    reg: &Registry,
    state: &mut SimState,
    id: MolId,
    now: Time,
    global_dt: Time,
) {
    let sp = state.mol(id).species;
    let dt = reg.time_step_for(sp, global_dt);
    state.queue.schedule(now + dt, EventKind::Diffuse(id));
    schedule_unimol(reg, state, id, now);
}

/// Fires a unimolecular rule for `id`: rule chosen by relative-rate-weighted
/// draw, reactant destroyed, products placed at the reactant's location.
pub fn fire_unimolecular(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    id: MolId,
    global_dt: Time,
) -> SimResult<ReactionOutcome> {
    let now = state.time();
    let sp = state.mol(id).species;
    let rules = reg.unimol_rules(sp);
    let total: f64 = rules.iter().map(|&r| reg.rules[r].rate_at(now)).sum();
    if total <= 0.0 {
        return Ok(ReactionOutcome::NotFired);
    }
    let mut acc = state.rng.random::<f64>() * total;
    let mut chosen = *rules.last().expect("nonzero total implies rules");
    for &r in rules {
        acc -= reg.rules[r].rate_at(now);
        if acc <= 0.0 {
            chosen = r;
            break;
        }
    }

    let reactant = state.mol(id).clone();
    state.kill(id)?;
    spawn_products(reg, geom, state, chosen, &reactant, None, global_dt)?;
    Ok(ReactionOutcome::Fired)
}

/// Do a rule's ordered reactant patterns match this molecule pair (in either
/// order), including orientation constraints?
pub fn pair_matches(reg: &Registry, rule: RuleId, a: &Molecule, b: &Molecule) -> bool {
    let r = &reg.rules[rule];
    if r.reactants.len() != 2 {
        return false;
    }
    let fits = |pat: &crate::species::Reactant, mol: &Molecule| {
        reg.species_matches(pat.species, mol.species) && pat.orient.accepts(mol.orient())
    };
    (fits(&r.reactants[0], a) && fits(&r.reactants[1], b))
        || (fits(&r.reactants[0], b) && fits(&r.reactants[1], a))
}

/// Resolves one encounter between molecules `a` and `b` at `point`.  Every
/// applicable rule contributes its clamped per-encounter probability to a
/// cumulative walk over a single uniform draw; rates too high to be honored
/// warn once per rule and cap at probability 1.
pub fn resolve_encounter(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    a: MolId,
    b: MolId,
    point: DVec3,
    rules: &[RuleId],
    global_dt: Time,
) -> SimResult<ReactionOutcome> {
    let now = state.time();
    let mut probs: Vec<(RuleId, f64)> = Vec::with_capacity(rules.len());
    for &rule in rules {
        let raw = reg.bimol_raw_probability(rule, global_dt, now);
        if raw > 1.0 && state.warned_rules.insert(rule) {
            println!(
                "Warning: reaction {} has per-encounter probability {raw:.3e} > 1; \
                 rate is too high for the time step, capping at 1.",
                reg.rules[rule].name
            );
        }
        probs.push((rule, raw.min(1.0)));
    }

    let u: f64 = state.rng.random();
    let mut acc = 0.0;
    for (rule, p) in probs {
        acc += p;
        if u < acc {
            let mol_a = state.mol(a).clone();
            let mol_b = state.mol(b).clone();
            state.kill(a)?;
            state.kill(b)?;
            let ctx = EncounterCtx {
                point,
                partner: Some(mol_b),
            };
            let reactant = ctx.surface_anchor(&mol_a).unwrap_or(mol_a);
            spawn_products(reg, geom, state, rule, &reactant, Some(&ctx), global_dt)?;
            return Ok(ReactionOutcome::Fired);
        }
    }
    Ok(ReactionOutcome::NotFired)
}

/// Geometry of a bimolecular encounter, carried into product placement.
struct EncounterCtx {
    point: DVec3,
    partner: Option<Molecule>,
}

impl EncounterCtx {
    /// Prefers a surface reactant as the placement anchor so surface
    /// products inherit its wall and orientation.
    fn surface_anchor(&self, a: &Molecule) -> Option<Molecule> {
        if !a.is_volume() {
            return Some(a.clone());
        }
        self.partner
            .as_ref()
            .filter(|p| !p.is_volume())
            .cloned()
    }

    /// Unit direction from the partner toward the anchor, for nudging
    /// free-space products off the reaction point.
    fn separation_dir(&self, anchor: &Molecule, geom: &GeometryModel) -> Option<DVec3> {
        let partner = self.partner.as_ref()?;
        let d = anchor.world_pos(geom) - partner.world_pos(geom);
        (d.length_squared() > EPS_PLACE * EPS_PLACE).then(|| d.normalize())
    }
}

/// Creates a rule's products at positions consistent with the consumed
/// reactant(s): surface products stay on the anchor reactant's wall, volume
/// products sit at the reaction point nudged off the surface (or along the
/// reactants' separation direction in free space).
fn spawn_products(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    rule: RuleId,
    anchor: &Molecule,
    encounter: Option<&EncounterCtx>,
    global_dt: Time,
) -> SimResult<()> {
    let now = state.time();
    let base_point = encounter
        .map(|e| e.point)
        .unwrap_or_else(|| anchor.world_pos(geom));
    let products = reg.rules[rule].products.clone();

    let mut volume_seq = 0usize;
    for product in products {
        let place = match reg.species[product.species].kind {
            SpeciesKind::Surface => {
                let (wall, uv) = match anchor.place {
                    MolPlace::Surface { wall, uv, .. } => (wall, uv),
                    // A volume-only reaction producing a surface molecule is
                    // rejected at model build; reaching this is a bug.
                    MolPlace::Volume { .. } => unreachable!("validated at build"),
                };
                MolPlace::Surface {
                    wall,
                    uv,
                    orient: product.orient,
                }
            }
            SpeciesKind::Volume => {
                volume_seq += 1;
                let nudge = match anchor.place {
                    MolPlace::Surface { wall, .. } => {
                        geom.walls[wall].normal * product.orient.normal_sign()
                    }
                    MolPlace::Volume { .. } => encounter
                        .and_then(|e| e.separation_dir(anchor, geom))
                        .unwrap_or(DVec3::X),
                };
                MolPlace::Volume {
                    pos: base_point + nudge * (EPS_PLACE * volume_seq as f64),
                }
            }
        };
        let world = match place {
            MolPlace::Volume { pos } => pos,
            MolPlace::Surface { wall, uv, .. } => geom.uv_to_world(wall, uv),
        };
        let subvol = state.partition.locate(world);
        let id = state.new_molecule(product.species, place, subvol, now);
        schedule_new_molecule(reg, state, id, now, global_dt);
    }
    Ok(())
}
