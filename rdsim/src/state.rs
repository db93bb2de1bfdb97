//! Mutable per-run simulation state: the molecule arena, the spatial
//! partition that owns molecule locations, the event queue, and the run's
//! single PRNG stream.

use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::base::{HashSetType, MolId, NumEvents, NumMols, RuleId, SimError, SimResult, SpeciesId, SubvolIx, Time};
use crate::counts::CountBuffer;
use crate::molecule::{MolPlace, Molecule};
use crate::partition::Partition;
use crate::scheduler::EventQueue;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimState {
    mols: Vec<Molecule>,
    /// Recycled arena slots.  Only `compact` feeds this, so an id is never
    /// reused while a queued event still references it.
    free: Vec<MolId>,
    n_live: NumMols,
    pub partition: Partition,
    pub queue: EventQueue,
    pub rng: ChaCha8Rng,
    time: Time,
    events: NumEvents,
    pub buffers: Vec<CountBuffer>,
    /// Rules that have already produced a rate-too-high warning this run.
    pub warned_rules: HashSetType<RuleId>,
}

impl SimState {
    pub fn new(partition: Partition, rng: ChaCha8Rng) -> Self {
        SimState {
            mols: Vec::new(),
            free: Vec::new(),
            n_live: 0,
            partition,
            queue: EventQueue::new(),
            rng,
            time: 0.0,
            events: 0,
            buffers: Vec::new(),
            warned_rules: HashSetType::default(),
        }
    }

    pub fn time(&self) -> Time {
        self.time
    }

    pub fn set_time(&mut self, t: Time) {
        self.time = t;
    }

    pub fn total_events(&self) -> NumEvents {
        self.events
    }

    pub fn add_events(&mut self, n: NumEvents) {
        self.events += n;
    }

    /// Live (non-defunct) molecule count.
    pub fn n_mols(&self) -> NumMols {
        self.n_live
    }

    pub fn n_slots(&self) -> usize {
        self.mols.len()
    }

    /// Creates a molecule, registers it in its subvolume, and returns its id.
    pub fn new_molecule(
        &mut self,
        species: SpeciesId,
        place: MolPlace,
        subvol: SubvolIx,
        birthday: Time,
    ) -> MolId {
        let mol = |id| Molecule {
            id,
            species,
            place,
            subvol,
            birthday,
            next_unimol: None,
            defunct: false,
        };
        let id = match self.free.pop() {
            Some(id) => {
                self.mols[id] = mol(id);
                id
            }
            None => {
                let id = self.mols.len();
                self.mols.push(mol(id));
                id
            }
        };
        self.partition.insert_mol(subvol, id);
        self.n_live += 1;
        id
    }

    /// Marks a molecule defunct and removes it from its subvolume.  The slot
    /// stays allocated until `compact`.
    pub fn kill(&mut self, id: MolId) -> SimResult<()> {
        let (subvol, was_defunct) = {
            let mol = self.mols.get(id).ok_or(SimError::NoMolecule(id))?;
            (mol.subvol, mol.defunct)
        };
        if was_defunct {
            return Err(SimError::NoMolecule(id));
        }
        self.partition.remove_mol(subvol, id)?;
        self.mols[id].defunct = true;
        self.n_live -= 1;
        Ok(())
    }

    pub fn mol(&self, id: MolId) -> &Molecule {
        &self.mols[id]
    }

    pub fn mol_mut(&mut self, id: MolId) -> &mut Molecule {
        &mut self.mols[id]
    }

    pub fn try_mol(&self, id: MolId) -> SimResult<&Molecule> {
        self.mols.get(id).ok_or(SimError::NoMolecule(id))
    }

    /// Is this id live (allocated and not defunct)?
    pub fn is_live(&self, id: MolId) -> bool {
        self.mols.get(id).is_some_and(|m| !m.defunct)
    }

    pub fn live_molecules(&self) -> impl Iterator<Item = &Molecule> {
        self.mols.iter().filter(|m| !m.defunct)
    }

    /// Recycles defunct slots not referenced by any queued event.  Safe at
    /// event boundaries only; ids freed here may be handed out again.
    pub fn compact(&mut self) {
        for id in 0..self.mols.len() {
            if self.mols[id].defunct
                && !self.free.contains(&id)
                && !self.queue.references_mol(id)
            {
                self.free.push(id);
            }
        }
    }
}
