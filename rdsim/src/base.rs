use crate::model::ModelError;
use thiserror::Error;

pub type MolId = usize;
pub type SpeciesId = usize;
pub type RuleId = usize;
pub type WallId = usize;
pub type ObjectId = usize;
pub type VertexId = usize;
pub type SubvolIx = usize;
pub type NumMols = u32;
pub type NumEvents = u64;
pub type Time = f64;
pub type Rate = f64;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("molecule {0} is not registered in subvolume {1}")]
    PartitionMismatch(MolId, SubvolIx),
    #[error("there is no molecule with id {0}")]
    NoMolecule(MolId),
    #[error("molecule {0} exceeded {1} wall interactions in a single step; geometry is inconsistent")]
    ReflectOverflow(MolId, usize),
    #[error("event queue is corrupt: {0}")]
    QueueCorrupt(String),
    #[error("checkpoint decode failed: {0}")]
    Checkpoint(String),
    #[error("{0}")]
    NotImplemented(String),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RdError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Sim(#[from] SimError),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

pub type SimResult<T> = Result<T, SimError>;

use fnv::{FnvHashMap, FnvHashSet};
pub(crate) type HashSetType<T> = FnvHashSet<T>;
pub(crate) type HashMapType<K, V> = FnvHashMap<K, V>;
