//! A distributed, accelerator-aware tiled dense matrix. `Matrix` is built from a tile
//! storage layer (`slate-core`), a placement policy (`slate-distribution`), a transport
//! (`slate-transport`), and per-device scratch (`slate-device`); this crate is only the
//! glue between them.

mod matrix;

pub use matrix::Matrix;

pub use slate_constants::{BroadcastTarget, GridConfig, Location, SlateError, ceil_div};
pub use slate_core::{LifetimeTracker, Tile, TilePool, TileRegistry};
pub use slate_device::{BatchRole, DeviceContext, DeviceContextSet};
pub use slate_distribution::{BlockCyclic, DynDistribution, Distribution, check_totality};
pub use slate_transport::{CommGroup, Communicator, ConsumerRange, InProcessHandle, build_cluster, broadcast_set, local_consumer_count};
