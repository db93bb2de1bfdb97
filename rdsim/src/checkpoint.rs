//! Checkpointing: the full `(system, state)` pair serialized with bincode.
//! A resumed run continues bit-for-bit where the original left off, because
//! the rng, queue, arena, and partition all round-trip exactly.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::base::{SimError, SimResult};
use crate::state::SimState;
use crate::system::RdSystem;

/// Writes a checkpoint file.  The write goes to a `.tmp` sibling first and is
/// renamed into place, so a crash mid-write never clobbers a good checkpoint.
pub fn save(path: &Path, system: &RdSystem, state: &SimState) -> SimResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        bincode::serialize_into(&mut w, &(system, state))
            .map_err(|e| SimError::Checkpoint(e.to_string()))?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Reads a checkpoint file back into a system/state pair.
pub fn load(path: &Path) -> SimResult<(RdSystem, SimState)> {
    let r = BufReader::new(File::open(path)?);
    bincode::deserialize_from(r).map_err(|e| SimError::Checkpoint(e.to_string()))
}

/// In-memory round trip, used by resume logic and tests.
pub fn to_bytes(system: &RdSystem, state: &SimState) -> SimResult<Vec<u8>> {
    bincode::serialize(&(system, state)).map_err(|e| SimError::Checkpoint(e.to_string()))
}

pub fn from_bytes(bytes: &[u8]) -> SimResult<(RdSystem, SimState)> {
    bincode::deserialize(bytes).map_err(|e| SimError::Checkpoint(e.to_string()))
}
