//! Brownian stepping with exact first-collision detection against walls and
//! reaction-radius approaches to other molecules.

use glam::{DVec2, DVec3};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::base::{MolId, RuleId, SimError, SimResult, Time, WallId};
use crate::geometry::{closest_approach, segment_tri_hit, GeometryModel, SurfaceClass, EPS_GEOM};
use crate::molecule::{MolPlace, Molecule};
use crate::reaction::{resolve_encounter, ReactionOutcome};
use crate::species::{Registry, SpeciesKind};
use crate::state::SimState;

/// Collisions closer in normalized hit time than this are simultaneous and
/// resolve by the fixed priority: walls before molecules, then lowest id.
pub const EPS_COLLIDE: f64 = 1e-12;

/// A molecule bouncing more than this many times in one step means the
/// geometry is inconsistent; the run aborts rather than looping.
const MAX_REFLECT: usize = 64;

/// Bound on wall-to-wall transfers for one surface step.
const MAX_SURF_HOPS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CollisionKind {
    Wall(WallId),
    Molecule(MolId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collision {
    /// Fraction of the displacement at which the hit occurs.
    pub t: f64,
    pub kind: CollisionKind,
}

fn rank(kind: CollisionKind) -> (u8, usize) {
    match kind {
        CollisionKind::Wall(w) => (0, w),
        CollisionKind::Molecule(m) => (1, m),
    }
}

fn better(candidate: Collision, best: Option<Collision>) -> Collision {
    match best {
        None => candidate,
        Some(b) => {
            if candidate.t < b.t - EPS_COLLIDE {
                candidate
            } else if candidate.t <= b.t + EPS_COLLIDE && rank(candidate.kind) < rank(b.kind) {
                candidate
            } else {
                b
            }
        }
    }
}

/// Gaussian trial displacement for a volume molecule: `sqrt(2 D dt)` per
/// axis, drawn from the run's single rng stream.
pub fn propose_volume_displacement(
    reg: &Registry,
    state: &mut SimState,
    sp: usize,
    dt: Time,
) -> DVec3 {
    let s = reg.step_scale(sp, dt);
    let z0: f64 = state.rng.sample(StandardNormal);
    let z1: f64 = state.rng.sample(StandardNormal);
    let z2: f64 = state.rng.sample(StandardNormal);
    DVec3::new(s * z0, s * z1, s * z2)
}

/// In-plane Gaussian trial displacement for a surface molecule.
pub fn propose_surface_displacement(
    reg: &Registry,
    state: &mut SimState,
    sp: usize,
    dt: Time,
) -> DVec2 {
    let s = reg.step_scale(sp, dt);
    let z0: f64 = state.rng.sample(StandardNormal);
    let z1: f64 = state.rng.sample(StandardNormal);
    DVec2::new(s * z0, s * z1)
}

/// Bimolecular rules applicable to this concrete pair, with the largest
/// interaction radius among them.  Surface-surface pairs require the same
/// wall unless a rule is flagged intermembrane, in which case the molecules
/// must sit on different objects.
pub fn applicable_rules(
    reg: &Registry,
    geom: &GeometryModel,
    a: &Molecule,
    b: &Molecule,
) -> (Vec<RuleId>, f64) {
    let mut out = Vec::new();
    let mut radius: f64 = 0.0;
    for &rule in reg.bimol_rules(a.species, b.species) {
        if !crate::reaction::pair_matches(reg, rule, a, b) {
            continue;
        }
        if let (Some(wa), Some(wb)) = (a.wall(), b.wall()) {
            let same_object = geom.walls[wa].object == geom.walls[wb].object;
            let ok = if reg.rules[rule].intermembrane {
                !same_object
            } else {
                wa == wb
            };
            if !ok {
                continue;
            }
        }
        radius = radius.max(reg.rules[rule].radius);
        out.push(rule);
    }
    (out, radius)
}

/// Tests the segment `p .. p + d` against walls registered in the swept
/// subvolumes and against reaction-radius approaches to nearby molecules,
/// returning the chronologically first hit.
fn first_collision(
    reg: &Registry,
    geom: &GeometryModel,
    state: &SimState,
    id: MolId,
    p: DVec3,
    d: DVec3,
    skip_mols: &[MolId],
    skip_wall: Option<WallId>,
) -> Option<Collision> {
    let cells = state.partition.swept(p, p + d, reg.max_radius());
    let mut best: Option<Collision> = None;

    let mut walls: Vec<WallId> = cells
        .iter()
        .flat_map(|&ix| state.partition.subvol(ix).walls.iter().copied())
        .collect();
    walls.sort_unstable();
    walls.dedup();
    for w in walls {
        if skip_wall == Some(w) {
            continue;
        }
        let [a, b, c] = geom.wall_corners(w);
        if let Some(t) = segment_tri_hit(p, d, a, b, c) {
            best = Some(better(
                Collision {
                    t,
                    kind: CollisionKind::Wall(w),
                },
                best,
            ));
        }
    }

    let mol = state.mol(id);
    for &ix in &cells {
        for &m in &state.partition.subvol(ix).mols {
            if m == id || skip_mols.contains(&m) || !state.is_live(m) {
                continue;
            }
            let partner = state.mol(m);
            if !partner.is_volume() {
                // Surface partners are reached through wall hits.
                continue;
            }
            let (rules, radius) = applicable_rules(reg, geom, mol, partner);
            if rules.is_empty() {
                continue;
            }
            let q = match partner.place {
                MolPlace::Volume { pos } => pos,
                MolPlace::Surface { .. } => unreachable!(),
            };
            let (t, dist2) = closest_approach(p, d, q);
            if dist2 <= radius * radius {
                best = Some(better(
                    Collision {
                        t,
                        kind: CollisionKind::Molecule(m),
                    },
                    best,
                ));
            }
        }
    }
    best
}

/// Surface molecules on wall `w` close enough to `point` to react with the
/// incoming volume molecule, nearest first.  Returns true if one fired.
fn try_surface_partners(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    id: MolId,
    w: WallId,
    point: DVec3,
    global_dt: Time,
) -> SimResult<bool> {
    let mol = state.mol(id).clone();
    let cells = state
        .partition
        .neighbors_within(state.partition.locate(point), reg.max_radius());
    let mut cands: Vec<(f64, MolId, Vec<RuleId>)> = Vec::new();
    for ix in cells {
        for &m in &state.partition.subvol(ix).mols {
            if m == id || !state.is_live(m) {
                continue;
            }
            let partner = state.mol(m);
            if partner.wall() != Some(w) {
                continue;
            }
            let (rules, radius) = applicable_rules(reg, geom, &mol, partner);
            if rules.is_empty() {
                continue;
            }
            let d2 = partner.world_pos(geom).distance_squared(point);
            if d2 <= radius * radius {
                cands.push((d2, m, rules));
            }
        }
    }
    cands.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    for (_, m, rules) in cands {
        if !state.is_live(id) || !state.is_live(m) {
            continue;
        }
        if resolve_encounter(reg, geom, state, id, m, point, &rules, global_dt)?
            == ReactionOutcome::Fired
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One Brownian step for a volume molecule: propose, collide, resolve.
pub fn diffuse_volume(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    id: MolId,
    dt: Time,
    global_dt: Time,
) -> SimResult<()> {
    let sp = state.mol(id).species;
    let disp = propose_volume_displacement(reg, state, sp, dt);
    let mut p = match state.mol(id).place {
        MolPlace::Volume { pos } => pos,
        MolPlace::Surface { .. } => unreachable!("volume step on surface molecule"),
    };
    let mut d = disp;
    let mut skip_mols: Vec<MolId> = Vec::new();
    let mut skip_wall: Option<WallId> = None;

    let mut bounces = 0usize;
    loop {
        match first_collision(reg, geom, state, id, p, d, &skip_mols, skip_wall) {
            None => break,
            Some(Collision {
                t,
                kind: CollisionKind::Molecule(m),
            }) => {
                let point = p + d * t;
                let partner = state.mol(m).clone();
                let mol = state.mol(id).clone();
                let (rules, _) = applicable_rules(reg, geom, &mol, &partner);
                if resolve_encounter(reg, geom, state, id, m, point, &rules, global_dt)?
                    == ReactionOutcome::Fired
                {
                    return Ok(());
                }
                skip_mols.push(m);
            }
            Some(Collision {
                t,
                kind: CollisionKind::Wall(w),
            }) => {
                let point = p + d * t;
                if try_surface_partners(reg, geom, state, id, w, point, global_dt)? {
                    return Ok(());
                }
                let rem = d * (1.0 - t);
                match geom.walls[w].class {
                    SurfaceClass::Reflective => {
                        let n = geom.walls[w].normal;
                        p = point;
                        d = rem - 2.0 * rem.dot(n) * n;
                    }
                    SurfaceClass::Absorptive => {
                        state.kill(id)?;
                        return Ok(());
                    }
                    SurfaceClass::Transparent => {
                        p = point;
                        d = rem;
                    }
                }
                // Only wall interactions count toward the limit; skipped
                // molecule encounters are bounded by the partner list.
                bounces += 1;
                if bounces >= MAX_REFLECT {
                    return Err(SimError::ReflectOverflow(id, MAX_REFLECT));
                }
                skip_wall = Some(w);
            }
        }
    }

    let new_pos = p + d;
    let old_ix = state.mol(id).subvol;
    let new_ix = state.partition.locate(new_pos);
    state.partition.migrate(id, old_ix, new_ix)?;
    let mol = state.mol_mut(id);
    mol.place = MolPlace::Volume { pos: new_pos };
    mol.subvol = new_ix;
    Ok(())
}

/// First edge crossed by the 2D segment `from .. from + d` leaving the
/// triangle with the given local corners.
fn exit_edge(corners: [DVec2; 3], from: DVec2, d: DVec2) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for i in 0..3 {
        let a = corners[i];
        let e = corners[(i + 1) % 3] - a;
        let denom = d.perp_dot(e);
        if denom.abs() < EPS_GEOM {
            continue;
        }
        let rel = a - from;
        let t = rel.perp_dot(e) / denom;
        let s = rel.perp_dot(d) / denom;
        if t > EPS_GEOM && t <= 1.0 && (-1e-9..=1.0 + 1e-9).contains(&s) {
            if best.map_or(true, |(_, bt)| t < bt) {
                best = Some((i, t));
            }
        }
    }
    best
}

/// Same-wall reactive partners along the 2D sub-segment, earliest approach
/// first.  Returns true if an encounter fired.
fn try_same_wall_partners(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    id: MolId,
    w: WallId,
    uv: DVec2,
    d2: DVec2,
    global_dt: Time,
) -> SimResult<bool> {
    let mol = state.mol(id).clone();
    let here = geom.uv_to_world(w, uv);
    let cells = state
        .partition
        .swept(here, geom.uv_to_world(w, uv + d2), reg.max_radius());
    let mut cands: Vec<(f64, MolId, Vec<RuleId>, DVec2)> = Vec::new();
    for ix in cells {
        for &m in &state.partition.subvol(ix).mols {
            if m == id || !state.is_live(m) {
                continue;
            }
            let partner = state.mol(m).clone();
            if partner.wall() != Some(w) {
                continue;
            }
            let (rules, radius) = applicable_rules(reg, geom, &mol, &partner);
            if rules.is_empty() {
                continue;
            }
            let quv = match partner.place {
                MolPlace::Surface { uv, .. } => uv,
                MolPlace::Volume { .. } => unreachable!(),
            };
            // 2D closest approach along the in-plane segment.
            let len2 = d2.length_squared();
            let t = if len2 < EPS_GEOM * EPS_GEOM {
                0.0
            } else {
                ((quv - uv).dot(d2) / len2).clamp(0.0, 1.0)
            };
            let dist2 = (uv + t * d2 - quv).length_squared();
            if dist2 <= radius * radius {
                cands.push((t, m, rules, uv + t * d2));
            }
        }
    }
    cands.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    for (_, m, rules, at_uv) in cands {
        if !state.is_live(id) || !state.is_live(m) {
            continue;
        }
        let point = geom.uv_to_world(w, at_uv);
        if resolve_encounter(reg, geom, state, id, m, point, &rules, global_dt)?
            == ReactionOutcome::Fired
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Intermembrane partners: surface molecules on *other* objects within the
/// interaction radius of this molecule's final position.
fn try_intermembrane_partners(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    id: MolId,
    global_dt: Time,
) -> SimResult<bool> {
    let mol = state.mol(id).clone();
    let here = mol.world_pos(geom);
    let cells = state
        .partition
        .neighbors_within(mol.subvol, reg.max_radius());
    let mut cands: Vec<(f64, MolId, Vec<RuleId>)> = Vec::new();
    for ix in cells {
        for &m in &state.partition.subvol(ix).mols {
            if m == id || !state.is_live(m) {
                continue;
            }
            let partner = state.mol(m).clone();
            if partner.is_volume() {
                continue;
            }
            let (rules, radius) = applicable_rules(reg, geom, &mol, &partner);
            let rules: Vec<RuleId> = rules
                .into_iter()
                .filter(|&r| reg.rules[r].intermembrane)
                .collect();
            if rules.is_empty() {
                continue;
            }
            let d2 = partner.world_pos(geom).distance_squared(here);
            if d2 <= radius * radius {
                cands.push((d2, m, rules));
            }
        }
    }
    cands.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    for (_, m, rules) in cands {
        if !state.is_live(id) || !state.is_live(m) {
            continue;
        }
        let point = here;
        if resolve_encounter(reg, geom, state, id, m, point, &rules, global_dt)?
            == ReactionOutcome::Fired
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// One Brownian step for a surface molecule, constrained to wall planes.
/// Leaving a triangle transfers the remaining displacement to the edge
/// neighbor; boundary edges reflect (or absorb, for absorptive walls).
pub fn diffuse_surface(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    id: MolId,
    dt: Time,
    global_dt: Time,
) -> SimResult<()> {
    let sp = state.mol(id).species;
    let mut d2 = propose_surface_displacement(reg, state, sp, dt);
    let (mut w, mut uv, orient) = match state.mol(id).place {
        MolPlace::Surface { wall, uv, orient } => (wall, uv, orient),
        MolPlace::Volume { .. } => unreachable!("surface step on volume molecule"),
    };

    for _ in 0..MAX_SURF_HOPS {
        if try_same_wall_partners(reg, geom, state, id, w, uv, d2, global_dt)? {
            return Ok(());
        }
        let target = uv + d2;
        if geom.uv_inside(w, target) {
            uv = target;
            break;
        }
        match exit_edge(geom.corners_uv(w), uv, d2) {
            None => break,
            Some((edge, t)) => {
                let cross_uv = uv + d2 * t;
                let rem = d2 * (1.0 - t);
                match geom.walls[w].neighbors[edge] {
                    Some(nw) => {
                        let wall = &geom.walls[w];
                        let world_dir = rem.x * wall.uhat + rem.y * wall.vhat;
                        let cross_world = geom.uv_to_world(w, cross_uv);
                        let n = geom.walls[nw].normal;
                        let mut proj = world_dir - world_dir.dot(n) * n;
                        let rem_len = rem.length();
                        if proj.length() > EPS_GEOM {
                            proj = proj.normalize() * rem_len;
                        }
                        let nwall = &geom.walls[nw];
                        uv = geom.world_to_uv(nw, cross_world);
                        d2 = DVec2::new(proj.dot(nwall.uhat), proj.dot(nwall.vhat));
                        w = nw;
                    }
                    None => match geom.walls[w].class {
                        SurfaceClass::Absorptive => {
                            state.kill(id)?;
                            return Ok(());
                        }
                        _ => {
                            // Reflect the remaining displacement about the
                            // boundary edge.
                            let corners = geom.corners_uv(w);
                            let e = (corners[(edge + 1) % 3] - corners[edge]).normalize();
                            uv = cross_uv;
                            d2 = 2.0 * rem.dot(e) * e - rem;
                        }
                    },
                }
            }
        }
    }

    let world = geom.uv_to_world(w, uv);
    let old_ix = state.mol(id).subvol;
    let new_ix = state.partition.locate(world);
    state.partition.migrate(id, old_ix, new_ix)?;
    let mol = state.mol_mut(id);
    mol.place = MolPlace::Surface { wall: w, uv, orient };
    mol.subvol = new_ix;

    if try_intermembrane_partners(reg, geom, state, id, global_dt)? {
        return Ok(());
    }
    Ok(())
}

/// Dispatch one diffusion step by molecule kind.
pub fn diffuse(
    reg: &Registry,
    geom: &GeometryModel,
    state: &mut SimState,
    id: MolId,
    global_dt: Time,
) -> SimResult<()> {
    let sp = state.mol(id).species;
    let dt = reg.time_step_for(sp, global_dt);
    match reg.species[sp].kind {
        SpeciesKind::Volume => diffuse_volume(reg, geom, state, id, dt, global_dt),
        SpeciesKind::Surface => diffuse_surface(reg, geom, state, id, dt, global_dt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{test_cube, test_cube_with_class};
    use crate::partition::Partition;
    use crate::species::{wildcard_species, Orient, Reactant, ReactionRule, Species};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn volume_species(name: &str, d: f64) -> Species {
        Species {
            name: name.to_string(),
            kind: SpeciesKind::Volume,
            diff_3d: d,
            diff_2d: 0.0,
            count_enclosed: false,
            custom_time_step: None,
            custom_space_step: None,
        }
    }

    fn setup() -> (Registry, GeometryModel, SimState) {
        let mut species = wildcard_species();
        species.push(volume_species("A", 1e-3));
        let reg = Registry::new(species, vec![]).unwrap();
        let geom = test_cube(glam::DVec3::ZERO, 1.0);
        let mut partition = Partition::new(glam::DVec3::ZERO, glam::DVec3::splat(1.0), 0.25).unwrap();
        partition.bin_walls(&geom);
        let state = SimState::new(partition, ChaCha8Rng::seed_from_u64(7));
        (reg, geom, state)
    }

    #[test]
    fn reflective_box_confines_molecules() {
        let (reg, geom, mut state) = setup();
        let pos = DVec3::splat(0.5);
        let sv = state.partition.locate(pos);
        let id = state.new_molecule(3, MolPlace::Volume { pos }, sv, 0.0);
        for _ in 0..500 {
            diffuse_volume(&reg, &geom, &mut state, id, 1e-2, 1e-2).unwrap();
            let p = match state.mol(id).place {
                MolPlace::Volume { pos } => pos,
                _ => unreachable!(),
            };
            assert!(
                p.cmpge(DVec3::ZERO).all() && p.cmple(DVec3::ONE).all(),
                "escaped the box: {p:?}"
            );
            // Membership stays consistent with position.
            let ix = state.partition.locate(p);
            assert_eq!(ix, state.mol(id).subvol);
            assert!(state.partition.subvol(ix).mols.contains(&id));
        }
    }

    #[test]
    fn displacement_scale_follows_diffusion_constant() {
        let (reg, _geom, mut state) = setup();
        let dt = 1e-2;
        let n = 4000;
        let mut sum2 = 0.0;
        for _ in 0..n {
            let d = propose_volume_displacement(&reg, &mut state, 3, dt);
            sum2 += d.length_squared();
        }
        let msd = sum2 / n as f64;
        // <r^2> = 6 D dt for a 3D Gaussian step.
        approx::assert_relative_eq!(msd, 6.0 * 1e-3 * dt, max_relative = 0.15);
    }

    #[test]
    fn surface_molecules_stay_on_wall_triangles() {
        let mut species = wildcard_species();
        species.push(volume_species("A", 1e-3));
        species.push(Species {
            name: "S".to_string(),
            kind: SpeciesKind::Surface,
            diff_3d: 0.0,
            // Step scale ~0.045 on unit triangles, so steps routinely
            // cross edges and transfer.
            diff_2d: 1e-1,
            count_enclosed: false,
            custom_time_step: None,
            custom_space_step: None,
        });
        let reg = Registry::new(species, vec![]).unwrap();
        let geom = test_cube(glam::DVec3::ZERO, 1.0);
        let mut partition =
            Partition::new(glam::DVec3::ZERO, glam::DVec3::splat(1.0), 0.25).unwrap();
        partition.bin_walls(&geom);
        let mut state = SimState::new(partition, ChaCha8Rng::seed_from_u64(3));

        let w0 = 0;
        let uv0 = {
            let c = geom.corners_uv(w0);
            (c[0] + c[1] + c[2]) / 3.0
        };
        let world = geom.uv_to_world(w0, uv0);
        let sv = state.partition.locate(world);
        let id = state.new_molecule(
            4,
            MolPlace::Surface {
                wall: w0,
                uv: uv0,
                orient: crate::species::Orient::Up,
            },
            sv,
            0.0,
        );
        let mut walls_seen = std::collections::BTreeSet::new();
        for _ in 0..300 {
            diffuse_surface(&reg, &geom, &mut state, id, 1e-2, 1e-2).unwrap();
            let (w, uv) = match state.mol(id).place {
                MolPlace::Surface { wall, uv, .. } => (wall, uv),
                _ => unreachable!(),
            };
            walls_seen.insert(w);
            assert!(geom.uv_inside(w, uv), "left triangle {w} at {uv:?}");
            assert_eq!(state.mol(id).subvol, state.partition.locate(state.mol(id).world_pos(&geom)));
        }
        assert!(walls_seen.len() > 1, "never transferred across an edge");
    }

    fn surface_species(name: &str, d: f64) -> Species {
        Species {
            name: name.to_string(),
            kind: SpeciesKind::Surface,
            diff_3d: 0.0,
            diff_2d: d,
            count_enclosed: false,
            custom_time_step: None,
            custom_space_step: None,
        }
    }

    fn pair_rule(rate: f64, radius: f64, intermembrane: bool) -> ReactionRule {
        ReactionRule {
            name: "pair".to_string(),
            reactants: vec![
                Reactant { species: 3, orient: Orient::None },
                Reactant { species: 4, orient: Orient::None },
            ],
            products: vec![],
            fwd_rate: Some(rate),
            rate_table: None,
            radius,
            intermembrane,
        }
    }

    #[test]
    fn many_inert_neighbors_do_not_abort_a_step() {
        let mut species = wildcard_species();
        species.push(volume_species("A", 1e-3));
        species.push(volume_species("B", 0.0));
        let reg = Registry::new(species, vec![pair_rule(0.0, 0.1, false)]).unwrap();
        let geom = test_cube(glam::DVec3::ZERO, 1.0);
        let mut partition =
            Partition::new(glam::DVec3::ZERO, glam::DVec3::ONE, 0.25).unwrap();
        partition.bin_walls(&geom);
        let mut state = SimState::new(partition, ChaCha8Rng::seed_from_u64(5));

        let center = DVec3::splat(0.5);
        let sv = state.partition.locate(center);
        let id = state.new_molecule(3, MolPlace::Volume { pos: center }, sv, 0.0);
        // Far more zero-rate partners in radius than the wall bounce limit.
        for i in 0..80 {
            let pos = center + DVec3::X * (1e-3 * (i + 1) as f64);
            let sv = state.partition.locate(pos);
            state.new_molecule(4, MolPlace::Volume { pos }, sv, 0.0);
        }
        diffuse_volume(&reg, &geom, &mut state, id, 1e-4, 1e-4).unwrap();
        assert!(state.is_live(id));
        assert_eq!(state.n_mols(), 81);
    }

    #[test]
    fn absorptive_walls_destroy_molecules() {
        let mut species = wildcard_species();
        species.push(volume_species("A", 1e-1));
        let reg = Registry::new(species, vec![]).unwrap();
        let geom = test_cube_with_class(glam::DVec3::ZERO, 1.0, SurfaceClass::Absorptive);
        let mut partition =
            Partition::new(glam::DVec3::ZERO, glam::DVec3::ONE, 0.25).unwrap();
        partition.bin_walls(&geom);
        let mut state = SimState::new(partition, ChaCha8Rng::seed_from_u64(11));
        let pos = DVec3::splat(0.5);
        let sv = state.partition.locate(pos);
        let id = state.new_molecule(3, MolPlace::Volume { pos }, sv, 0.0);
        for _ in 0..2000 {
            diffuse_volume(&reg, &geom, &mut state, id, 1e-2, 1e-2).unwrap();
            if !state.is_live(id) {
                break;
            }
        }
        assert!(!state.is_live(id), "never reached an absorptive wall");
        assert_eq!(state.n_mols(), 0);
    }

    #[test]
    fn transparent_walls_pass_molecules_through() {
        let mut species = wildcard_species();
        species.push(volume_species("A", 1e-1));
        let reg = Registry::new(species, vec![]).unwrap();
        let geom = test_cube_with_class(glam::DVec3::ZERO, 1.0, SurfaceClass::Transparent);
        let mut partition =
            Partition::new(glam::DVec3::splat(-1.0), glam::DVec3::splat(2.0), 0.25).unwrap();
        partition.bin_walls(&geom);
        let mut state = SimState::new(partition, ChaCha8Rng::seed_from_u64(13));
        let pos = DVec3::splat(0.5);
        let sv = state.partition.locate(pos);
        let id = state.new_molecule(3, MolPlace::Volume { pos }, sv, 0.0);
        let mut escaped = false;
        for _ in 0..2000 {
            diffuse_volume(&reg, &geom, &mut state, id, 1e-2, 1e-2).unwrap();
            let p = match state.mol(id).place {
                MolPlace::Volume { pos } => pos,
                _ => unreachable!(),
            };
            if !(p.cmpge(DVec3::ZERO).all() && p.cmple(DVec3::ONE).all()) {
                escaped = true;
                break;
            }
        }
        assert!(escaped, "transparent walls must not confine");
        assert!(state.is_live(id));
    }

    #[test]
    fn intermembrane_rule_fires_across_facing_membranes() {
        let mut species = wildcard_species();
        species.push(surface_species("S", 0.0));
        species.push(surface_species("T", 0.0));
        let reg = Registry::new(species, vec![pair_rule(1e12, 5e-2, true)]).unwrap();

        // Two single-triangle objects 0.01 apart, well inside the radius.
        let verts = vec![
            DVec3::ZERO,
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.0, 1.0, 0.0),
            DVec3::new(0.0, 0.0, 0.01),
            DVec3::new(1.0, 0.0, 0.01),
            DVec3::new(0.0, 1.0, 0.01),
        ];
        let geom = GeometryModel::build(
            verts,
            vec![
                ([0, 1, 2], 0, SurfaceClass::Reflective, false),
                ([3, 4, 5], 1, SurfaceClass::Reflective, false),
            ],
            vec!["lower".to_string(), "upper".to_string()],
        )
        .unwrap();
        let mut partition =
            Partition::new(glam::DVec3::splat(-0.5), glam::DVec3::splat(1.5), 0.25).unwrap();
        partition.bin_walls(&geom);
        let mut state = SimState::new(partition, ChaCha8Rng::seed_from_u64(2));

        let centroid = |w: WallId| {
            let c = geom.corners_uv(w);
            (c[0] + c[1] + c[2]) / 3.0
        };
        let uv0 = centroid(0);
        let sv0 = state.partition.locate(geom.uv_to_world(0, uv0));
        let a = state.new_molecule(
            3,
            MolPlace::Surface { wall: 0, uv: uv0, orient: Orient::None },
            sv0,
            0.0,
        );
        let uv1 = centroid(1);
        let sv1 = state.partition.locate(geom.uv_to_world(1, uv1));
        let b = state.new_molecule(
            4,
            MolPlace::Surface { wall: 1, uv: uv1, orient: Orient::None },
            sv1,
            0.0,
        );

        diffuse_surface(&reg, &geom, &mut state, a, 1e-3, 1e-3).unwrap();
        assert!(!state.is_live(a));
        assert!(!state.is_live(b));
        assert_eq!(state.n_mols(), 0);
    }

    #[test]
    fn wall_priority_beats_molecule_on_ties() {
        let wall = Collision {
            t: 0.5,
            kind: CollisionKind::Wall(9),
        };
        let molecule = Collision {
            t: 0.5,
            kind: CollisionKind::Molecule(1),
        };
        assert_eq!(better(molecule, Some(wall)), wall);
        assert_eq!(better(wall, Some(molecule)), wall);
        // A clearly earlier molecule encounter still wins.
        let early = Collision {
            t: 0.25,
            kind: CollisionKind::Molecule(1),
        };
        assert_eq!(better(early, Some(wall)), early);
    }

    #[test]
    fn exit_edge_finds_first_crossing() {
        let corners = [
            DVec2::ZERO,
            DVec2::new(1.0, 0.0),
            DVec2::new(0.0, 1.0),
        ];
        let (edge, t) = exit_edge(corners, DVec2::new(0.25, 0.25), DVec2::new(-1.0, 0.0)).unwrap();
        assert_eq!(edge, 2);
        assert!((t - 0.25).abs() < 1e-12);
        assert!(exit_edge(corners, DVec2::new(0.25, 0.25), DVec2::new(0.1, 0.1)).is_none());
    }
}
