use glam::DVec3;
use rdsim::checkpoint;
use rdsim::model::ModelDesc;
use rdsim::molecule::MolPlace;
use rdsim::state::SimState;
use rdsim::system::{EvolveBounds, RdSystem};

/// A reflective unit cube with A and B released inside, A + B -> C at the
/// given rate, and a world count of A.
fn cube_model(rate: f64) -> String {
    format!(
        r#"
name: cube
time_step: 1.0e-5
seed: 99
partition:
  min: [0.0, 0.0, 0.0]
  max: [1.0, 1.0, 1.0]
  cell: 0.25
species:
  - name: A
    diffusion: 1.0e-4
  - name: B
    diffusion: 1.0e-4
  - name: C
    diffusion: 1.0e-4
objects:
  - name: box
    vertices:
      - [0.0, 0.0, 0.0]
      - [1.0, 0.0, 0.0]
      - [0.0, 1.0, 0.0]
      - [1.0, 1.0, 0.0]
      - [0.0, 0.0, 1.0]
      - [1.0, 0.0, 1.0]
      - [0.0, 1.0, 1.0]
      - [1.0, 1.0, 1.0]
    walls:
      - [0, 2, 1]
      - [1, 2, 3]
      - [4, 5, 6]
      - [5, 7, 6]
      - [0, 1, 4]
      - [1, 5, 4]
      - [2, 6, 3]
      - [3, 6, 7]
      - [0, 4, 2]
      - [2, 4, 6]
      - [1, 3, 5]
      - [3, 7, 5]
reactions:
  - reactants: ["A", "B"]
    products: ["C"]
    rate: {rate}
    radius: 2.0e-2
releases:
  - species: A
    count: 100
    shape:
      min: [0.1, 0.1, 0.1]
      max: [0.9, 0.9, 0.9]
  - species: B
    count: 100
    shape:
      min: [0.1, 0.1, 0.1]
      max: [0.9, 0.9, 0.9]
counts:
  - name: A_world
    species: A
    period: 1.0e-3
"#
    )
}

fn system(rate: f64) -> RdSystem {
    ModelDesc::from_yaml(&cube_model(rate))
        .unwrap()
        .to_system()
        .unwrap()
}

fn census(sys: &RdSystem, state: &SimState, name: &str) -> usize {
    let id = sys.registry.species_id(name).unwrap();
    state.live_molecules().filter(|m| m.species == id).count()
}

#[test]
fn association_conserves_species_balance() {
    let sys = system(1.0e3);
    let mut state = sys.new_state();
    sys.evolve(&mut state, EvolveBounds::default().for_events(20_000))
        .unwrap();
    let (a, b, c) = (
        census(&sys, &state, "A"),
        census(&sys, &state, "B"),
        census(&sys, &state, "C"),
    );
    // A and B are consumed pairwise, each firing makes one C.
    assert_eq!(a, b);
    assert_eq!(a + c, 100);
    assert_eq!(state.n_mols() as usize, a + b + c);
}

#[test]
fn zero_rate_conserves_mass_exactly() {
    let sys = system(0.0);
    let mut state = sys.new_state();
    sys.evolve(&mut state, EvolveBounds::default().for_time(5.0e-3))
        .unwrap();
    assert_eq!(census(&sys, &state, "A"), 100);
    assert_eq!(census(&sys, &state, "B"), 100);
    assert_eq!(census(&sys, &state, "C"), 0);
    // Every count emission saw the full population.
    assert!(!state.buffers[0].entries.is_empty());
    for &(_, v) in &state.buffers[0].entries {
        assert_eq!(v, 100.0);
    }
}

#[test]
fn molecules_stay_inside_reflective_geometry() {
    let sys = system(0.0);
    let mut state = sys.new_state();
    sys.evolve(&mut state, EvolveBounds::default().for_events(30_000))
        .unwrap();
    for mol in state.live_molecules() {
        let pos = match mol.place {
            MolPlace::Volume { pos } => pos,
            MolPlace::Surface { .. } => continue,
        };
        assert!(
            pos.cmpge(DVec3::ZERO).all() && pos.cmple(DVec3::ONE).all(),
            "molecule {} escaped to {pos:?}",
            mol.id
        );
        assert_eq!(
            mol.subvol,
            state.partition.locate(pos),
            "molecule {} subvolume is stale",
            mol.id
        );
    }
}

#[test]
fn fixed_seed_reproduces_the_run_bit_for_bit() {
    let sys = system(1.0e3);
    let mut s1 = sys.new_state();
    let mut s2 = sys.new_state();
    sys.evolve(&mut s1, EvolveBounds::default().for_events(10_000))
        .unwrap();
    sys.evolve(&mut s2, EvolveBounds::default().for_events(10_000))
        .unwrap();
    let b1 = checkpoint::to_bytes(&sys, &s1).unwrap();
    let b2 = checkpoint::to_bytes(&sys, &s2).unwrap();
    assert_eq!(b1, b2);
}

#[test]
fn checkpoint_resume_continues_bit_for_bit() {
    let sys = system(1.0e3);
    let mut original = sys.new_state();
    sys.evolve(&mut original, EvolveBounds::default().for_events(5_000))
        .unwrap();

    let snapshot = checkpoint::to_bytes(&sys, &original).unwrap();
    let (restored_sys, mut restored) = checkpoint::from_bytes(&snapshot).unwrap();

    sys.evolve(&mut original, EvolveBounds::default().for_events(5_000))
        .unwrap();
    restored_sys
        .evolve(&mut restored, EvolveBounds::default().for_events(5_000))
        .unwrap();

    assert_eq!(original.time(), restored.time());
    assert_eq!(original.total_events(), restored.total_events());
    assert_eq!(original.rng, restored.rng, "rng streams diverged");
    assert_eq!(original.n_mols(), restored.n_mols());
    for (a, b) in original.live_molecules().zip(restored.live_molecules()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.species, b.species);
        assert_eq!(a.world_pos(&sys.geometry), b.world_pos(&sys.geometry));
    }
    for (a, b) in original.buffers.iter().zip(restored.buffers.iter()) {
        assert_eq!(a.entries, b.entries);
    }
}

#[test]
fn different_seeds_diverge() {
    let sys = system(0.0);
    let mut s1 = sys.new_state_with_seed(1);
    let mut s2 = sys.new_state_with_seed(2);
    sys.evolve(&mut s1, EvolveBounds::default().for_events(1_000))
        .unwrap();
    sys.evolve(&mut s2, EvolveBounds::default().for_events(1_000))
        .unwrap();
    let diverged = s1
        .live_molecules()
        .zip(s2.live_molecules())
        .any(|(a, b)| a.world_pos(&sys.geometry) != b.world_pos(&sys.geometry));
    assert!(diverged);
}
