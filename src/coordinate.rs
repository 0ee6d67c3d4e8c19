//! Distributed coordination contract
//!
//! Process launch, rank assignment, and the transport behind barriers
//! live outside this crate; the pipeline only needs the narrow surface
//! below. The single elected coordinator (rank 0) is the only writer of
//! shared state; every other rank blocks on a barrier until the
//! coordinator is done. File-existence polling is not an acceptable
//! substitute for the barrier: it races with a slow writer.

use crate::error::Result;

/// Collective coordination across the processes of one run.
pub trait ProcessGroup {
    /// This process's rank in [0, world_size).
    fn rank(&self) -> usize;

    /// Number of participating processes.
    fn world_size(&self) -> usize;

    /// Whether this process is the elected coordinator.
    fn is_coordinator(&self) -> bool {
        self.rank() == 0
    }

    /// Block until every rank reaches this point.
    ///
    /// A barrier that is not satisfied within the implementation's
    /// timeout fails with `CoordinationTimeout`, fatally for all
    /// participants: there is no partial-quorum continuation.
    fn barrier(&self) -> Result<()>;
}

/// Trivial group for single-process runs: rank 0 of 1, barriers are
/// no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl SingleProcess {
    /// Create a single-process group.
    pub fn new() -> Self {
        Self
    }
}

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_coordinator() {
        let group = SingleProcess::new();
        assert_eq!(group.rank(), 0);
        assert_eq!(group.world_size(), 1);
        assert!(group.is_coordinator());
    }

    #[test]
    fn test_single_process_barrier_is_noop() {
        assert!(SingleProcess::new().barrier().is_ok());
    }
}
