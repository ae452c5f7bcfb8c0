//! Rank-to-rank transport. `Communicator` is the seam; [`inprocess`] is the only backend
//! this workspace provides, simulating a cluster with OS threads and channels in a single
//! process so the rest of the stack, and its tests, never depend on a real MPI runtime.

mod broadcast_set;
mod communicator;
mod group;
pub mod inprocess;

pub use broadcast_set::{ConsumerRange, broadcast_set, local_consumer_count};
pub use communicator::Communicator;
pub use group::CommGroup;
pub use inprocess::{InProcessHandle, build_cluster};
