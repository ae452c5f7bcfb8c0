//! The rank-to-rank transport seam. `Matrix` never talks to MPI (or a simulated stand-in)
//! directly: it goes through this trait, so a real MPI-backed implementation can replace
//! [`crate::inprocess::InProcessHandle`] without touching the tile layer.

use slate_constants::SlateError;

/// One rank's view of a communicator spanning `size()` ranks numbered `0..size()`.
///
/// Transport calls are a critical section: implementations are not required to allow
/// more than one transport call in flight per rank at a time; callers must not call these
/// methods concurrently from multiple threads on the same handle.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> u32;
    fn size(&self) -> u32;

    /// Point-to-point send, blocking until the message is handed to the destination's
    /// transport layer (not until it is received).
    fn send(&self, dest: u32, tag: u32, payload: Vec<u8>) -> Result<(), SlateError>;

    /// Point-to-point receive, blocking until a message tagged `tag` arrives. Returns the
    /// sender's rank alongside the payload.
    fn recv(&self, tag: u32) -> Result<(u32, Vec<u8>), SlateError>;

    /// Broadcasts `payload` from `root` to every rank in `members` (which must include
    /// `root`). The root passes `Some(payload)`; every other member passes `None` and
    /// receives the broadcast payload back. Every member of `members` must call this
    /// concurrently or the call blocks.
    ///
    /// The default implementation is a root fan-out built from `send`/`recv`: correct for
    /// any backend, though a real MPI implementation would likely override it with a
    /// collective primitive.
    fn broadcast(&self, root: u32, members: &[u32], tag: u32, payload: Option<Vec<u8>>) -> Result<Vec<u8>, SlateError> {
        if !members.contains(&root) {
            return Err(SlateError::InvalidArgument(format!("broadcast root {root} is not in the member set")));
        }
        if self.rank() == root {
            let payload = payload.ok_or_else(|| {
                SlateError::InvalidArgument(format!("root {root} must supply a broadcast payload"))
            })?;
            for &member in members.iter().filter(|&&m| m != root) {
                self.send(member, tag, payload.clone())?;
            }
            Ok(payload)
        } else {
            if !members.contains(&self.rank()) {
                return Err(SlateError::InvalidArgument(format!(
                    "rank {} is not a member of this broadcast group",
                    self.rank()
                )));
            }
            let (source, bytes) = self.recv(tag)?;
            if source != root {
                return Err(SlateError::InvariantViolated(format!(
                    "broadcast expected source {root}, got {source}"
                )));
            }
            Ok(bytes)
        }
    }

    /// Blocks until every rank in `members` has called `barrier` with the same membership.
    /// Implemented as a fan-in/fan-out through the lowest-numbered member, which acts as a
    /// transient leader for this call only.
    fn barrier(&self, members: &[u32]) -> Result<(), SlateError> {
        const BARRIER_TAG: u32 = u32::MAX;
        let mut sorted: Vec<u32> = members.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let leader = *sorted
            .first()
            .ok_or_else(|| SlateError::InvalidArgument("barrier requires a non-empty member set".to_string()))?;

        if self.rank() == leader {
            for _ in sorted.iter().filter(|&&m| m != leader) {
                self.recv(BARRIER_TAG)?;
            }
            for &member in sorted.iter().filter(|&&m| m != leader) {
                self.send(member, BARRIER_TAG, Vec::new())?;
            }
        } else {
            self.send(leader, BARRIER_TAG, Vec::new())?;
            self.recv(BARRIER_TAG)?;
        }
        Ok(())
    }
}
