//! The user-facing distributed tiled matrix: a `Distribution` says who owns what, a
//! `Communicator` moves bytes between ranks, and `slate-core` owns the tiles themselves.
//! `Matrix` is the thing that wires all three together.

use std::ops::Range;
use std::sync::Arc;
use std::sync::Mutex;

use slate_constants::{BroadcastTarget, GridConfig, Location, SlateError, ceil_div};
use slate_core::{LifetimeTracker, Tile, TilePool, TileRegistry};
use slate_device::DeviceContextSet;
use slate_distribution::Distribution;
use slate_transport::{Communicator, ConsumerRange, broadcast_set, local_consumer_count};

/// A distributed `m x n` dense matrix tiled into `nb x nb` blocks and mapped onto ranks
/// and devices by `D`. Cloning a `Matrix` is cheap: all shared state lives behind `Arc`,
/// which is what makes [`Matrix::submatrix`] a zero-copy view rather than a new matrix.
pub struct Matrix<D: Distribution, T> {
    distribution: Arc<D>,
    comm: Arc<dyn Communicator>,
    pool: Arc<TilePool<T>>,
    registry: Arc<TileRegistry<T>>,
    lifetime: Arc<LifetimeTracker>,
    devices: Arc<Mutex<DeviceContextSet>>,
    m: u32,
    n: u32,
    nb: u32,
    /// Total tile-grid extent of the matrix this view was built or sliced from; used to
    /// derive collision-free broadcast/gather tags independent of the view's own range.
    total_nt: u32,
    row_range: Range<u32>,
    col_range: Range<u32>,
}

impl<D: Distribution, T> Clone for Matrix<D, T> {
    fn clone(&self) -> Self {
        Self {
            distribution: Arc::clone(&self.distribution),
            comm: Arc::clone(&self.comm),
            pool: Arc::clone(&self.pool),
            registry: Arc::clone(&self.registry),
            lifetime: Arc::clone(&self.lifetime),
            devices: Arc::clone(&self.devices),
            m: self.m,
            n: self.n,
            nb: self.nb,
            total_nt: self.total_nt,
            row_range: self.row_range.clone(),
            col_range: self.col_range.clone(),
        }
    }
}

impl<D: Distribution, T: Clone + Default + bytemuck::Pod + Send + Sync> Matrix<D, T> {
    /// Builds an empty `m x n` matrix with all locally owned tiles allocated (zeroed) at
    /// the host. Devices are initialized but start with no resident tile copies.
    pub fn construct(m: u32, n: u32, nb: u32, distribution: D, comm: Arc<dyn Communicator>, device_count: u32) -> Result<Self, SlateError> {
        if nb == 0 {
            return Err(SlateError::InvalidArgument("nb must be > 0".to_string()));
        }
        let mt = ceil_div(m, nb);
        let nt = ceil_div(n, nb);
        let pool = Arc::new(TilePool::new(nb, device_count));
        let registry = Arc::new(TileRegistry::new());
        let devices = Arc::new(Mutex::new(DeviceContextSet::new(device_count)));

        let matrix = Self {
            distribution: Arc::new(distribution),
            comm,
            pool,
            registry,
            lifetime: Arc::new(LifetimeTracker::new()),
            devices,
            m,
            n,
            nb,
            total_nt: nt,
            row_range: 0..mt,
            col_range: 0..nt,
        };

        for row in 0..mt {
            for col in 0..nt {
                if matrix.is_local(row, col) {
                    matrix.allocate_local_tile(row, col)?;
                }
            }
        }
        Ok(matrix)
    }

    /// Builds a matrix and copies locally owned tiles' data in from `source`, a full
    /// `m x n` column-major buffer with leading dimension `ld` that every rank supplies
    /// identically. Only tiles this rank owns are read out of `source`; the rest of the
    /// buffer is ignored on this rank.
    pub fn construct_from(
        m: u32,
        n: u32,
        nb: u32,
        ld: u32,
        source: &[T],
        distribution: D,
        comm: Arc<dyn Communicator>,
        device_count: u32,
    ) -> Result<Self, SlateError> {
        if (ld as usize) < (m as usize) {
            return Err(SlateError::InvalidArgument(format!("leading dimension {ld} must be >= m {m}")));
        }
        if source.len() < (ld as usize) * (n as usize) {
            return Err(SlateError::InvalidArgument("source buffer is smaller than ld * n".to_string()));
        }

        let matrix = Self::construct(m, n, nb, distribution, comm, device_count)?;
        for row in 0..matrix.row_range.end {
            for col in 0..matrix.col_range.end {
                if !matrix.is_local(row, col) {
                    continue;
                }
                let mb = matrix.distribution.row_height(row);
                let ncols = matrix.distribution.col_width(col);
                let row_base = (row * nb) as usize;
                let col_base = (col * nb) as usize;
                matrix.registry.with_tile_mut(row, col, Location::Host, |tile| {
                    for c in 0..ncols {
                        for r in 0..mb {
                            let index = (col_base + c as usize) * (ld as usize) + row_base + r as usize;
                            tile.set(r, c, source[index].clone());
                        }
                    }
                })?;
            }
        }
        Ok(matrix)
    }

    fn allocate_local_tile(&self, row: u32, col: u32) -> Result<(), SlateError> {
        let mb = self.distribution.row_height(row);
        let cb = self.distribution.col_width(col);
        let block = self.pool.acquire(Location::Host)?;
        let tile = Tile::from_pool_block(mb, cb, self.nb, Location::Host, block)?;
        self.registry.insert(row, col, Location::Host, tile)
    }

    pub fn rows(&self) -> u32 {
        self.m
    }

    pub fn cols(&self) -> u32 {
        self.n
    }

    pub fn nb(&self) -> u32 {
        self.nb
    }

    pub fn mt(&self) -> u32 {
        self.row_range.end - self.row_range.start
    }

    pub fn nt(&self) -> u32 {
        self.col_range.end - self.col_range.start
    }

    pub fn is_local(&self, row: u32, col: u32) -> bool {
        self.distribution.owner_rank(row, col) == self.comm.rank()
    }

    /// Counts local tiles whose owner matches this rank and whose preferred device
    /// (per the distribution) matches `location`. Sizes a `DeviceContext`'s batch
    /// pointer arrays for a given device, or the host-resident count when `location`
    /// is `Location::Host`.
    pub fn max_local_tiles(&self, location: Location) -> usize {
        let mut count = 0;
        for row in self.row_range.clone() {
            for col in self.col_range.clone() {
                if self.is_local(row, col) && self.distribution.device(row, col) == location {
                    count += 1;
                }
            }
        }
        count
    }

    /// Counts every tile this rank owns, regardless of preferred device.
    pub fn local_tile_count(&self) -> usize {
        let mut count = 0;
        for row in self.row_range.clone() {
            for col in self.col_range.clone() {
                if self.is_local(row, col) {
                    count += 1;
                }
            }
        }
        count
    }

    /// A zero-copy view over the tile rectangle `rows x cols`, which must lie within this
    /// matrix's own range. Shares the pool, registry, lifetime tracker, device contexts,
    /// and communicator with the parent.
    pub fn submatrix(&self, rows: Range<u32>, cols: Range<u32>) -> Result<Self, SlateError> {
        if rows.start < self.row_range.start || rows.end > self.row_range.end || cols.start < self.col_range.start || cols.end > self.col_range.end {
            return Err(SlateError::InvalidArgument("submatrix range exceeds parent matrix range".to_string()));
        }
        let mut view = self.clone();
        view.row_range = rows;
        view.col_range = cols;
        Ok(view)
    }

    /// Reads a single element out of the resident tile at `(row, col, location)`.
    /// Runs `f` over this rank's `DeviceContextSet`, giving access to per-device streams,
    /// the BLAS handle, and batch pointer arrays for a numerical routine built on top of
    /// this matrix.
    pub fn with_devices<R>(&self, f: impl FnOnce(&mut DeviceContextSet) -> R) -> R {
        let mut devices = self.devices.lock().expect("device context set lock poisoned");
        f(&mut devices)
    }

    pub fn tile_element(&self, row: u32, col: u32, location: Location, local_row: u32, local_col: u32) -> Result<T, SlateError> {
        self.registry.with_tile(row, col, location, |tile| tile.get(local_row, local_col))
    }

    /// Runs `f` over the resident tile at `(row, col, location)` without copying it out.
    pub fn with_tile<R>(&self, row: u32, col: u32, location: Location, f: impl FnOnce(&Tile<T>) -> R) -> Result<R, SlateError> {
        self.registry.with_tile(row, col, location, f)
    }

    pub fn with_tile_mut<R>(&self, row: u32, col: u32, location: Location, f: impl FnOnce(&mut Tile<T>) -> R) -> Result<R, SlateError> {
        self.registry.with_tile_mut(row, col, location, f)
    }

    /// Stages a device-resident copy of `(row, col)` at `device`, leaving the host copy in
    /// place. The tile must be local and already resident at the host.
    pub fn copy_to_device(&self, row: u32, col: u32, device: u32) -> Result<(), SlateError> {
        if !self.is_local(row, col) {
            return Err(SlateError::InvariantViolated(format!(
                "cannot copy non-local tile ({row}, {col}) to a device"
            )));
        }
        if self.registry.is_resident(row, col, Location::Device(device)) {
            return Ok(());
        }
        let block = self.pool.acquire(Location::Device(device))?;
        let mb = self.distribution.row_height(row);
        let cb = self.distribution.col_width(col);
        let mut device_tile = Tile::from_pool_block(mb, cb, self.nb, Location::Device(device), block)?;
        self.registry.with_tile(row, col, Location::Host, |host_tile| {
            host_tile.copy_to(&mut device_tile);
        })?;
        self.registry.insert(row, col, Location::Device(device), device_tile)?;
        tracing::trace!(row, col, device, "staged device copy");
        Ok(())
    }

    /// Like [`Matrix::copy_to_device`] but erases the host copy afterward, leaving the
    /// device as the tile's sole residency.
    pub fn move_to_device(&self, row: u32, col: u32, device: u32) -> Result<(), SlateError> {
        self.copy_to_device(row, col, device)?;
        self.erase(row, col, Location::Host)
    }

    /// Ensures `(row, col)` is resident at the host, copying down from `device` if needed,
    /// then erases the device copy.
    pub fn move_to_host(&self, row: u32, col: u32, device: u32) -> Result<(), SlateError> {
        if !self.registry.is_resident(row, col, Location::Host) {
            let mb = self.distribution.row_height(row);
            let cb = self.distribution.col_width(col);
            let block = self.pool.acquire(Location::Host)?;
            let mut host_tile = Tile::from_pool_block(mb, cb, self.nb, Location::Host, block)?;
            self.registry.with_tile(row, col, Location::Device(device), |device_tile| {
                device_tile.copy_to(&mut host_tile);
            })?;
            self.registry.insert(row, col, Location::Host, host_tile)?;
        }
        self.erase(row, col, Location::Device(device))
    }

    /// Releases the tile at `(row, col, location)` back to the pool.
    pub fn erase(&self, row: u32, col: u32, location: Location) -> Result<(), SlateError> {
        let tile = self.registry.remove(row, col, location)?;
        tile.release_to_pool(&self.pool)
    }

    /// Decrements the outstanding-use count registered for a broadcast-received tile.
    /// Returns `true` if this was the last use, meaning the tile may now be erased.
    /// Decrements the life counter for a non-local tile received by broadcast. No-op for
    /// tiles this rank owns, which are never tracked by the lifetime tracker.
    pub fn tick(&self, row: u32, col: u32) -> bool {
        if self.is_local(row, col) {
            return false;
        }
        self.lifetime.tick(row, col)
    }

    fn broadcast_tag(&self, row: u32, col: u32) -> u32 {
        row.wrapping_mul(self.total_nt).wrapping_add(col)
    }

    /// Broadcasts the host tile at `(row, col)` from its owning rank to every rank in
    /// `members` (which must include the owner). Non-owning recipients receive a new host
    /// copy with `life` outstanding uses registered in the lifetime tracker; the owner's
    /// own copy is untouched and not counted against that lifetime.
    pub fn tile_bcast(&self, row: u32, col: u32, members: &[u32], life: u32) -> Result<(), SlateError> {
        let root = self.distribution.owner_rank(row, col);
        if !members.contains(&root) {
            return Err(SlateError::InvalidArgument(format!(
                "tile_bcast owner rank {root} is not in the member set"
            )));
        }
        let tag = self.broadcast_tag(row, col);

        if self.is_local(row, col) {
            let packed = self.registry.with_tile(row, col, Location::Host, |tile| tile.pack())?;
            let bytes = bytemuck::cast_slice(&packed).to_vec();
            self.comm.broadcast(root, members, tag, Some(bytes))?;
            return Ok(());
        }

        if !members.contains(&self.comm.rank()) {
            return Ok(());
        }

        let bytes = self.comm.broadcast(root, members, tag, None)?;
        let mb = self.distribution.row_height(row);
        let cb = self.distribution.col_width(col);
        let values: &[T] = bytemuck::cast_slice(&bytes);

        let block = self.pool.acquire(Location::Host)?;
        let mut tile = Tile::from_pool_block(mb, cb, self.nb, Location::Host, block)?;
        tile.unpack(values);
        self.registry.insert(row, col, Location::Host, tile)?;
        self.lifetime.register(row, col, life);
        tracing::trace!(row, col, root, "received broadcast tile");
        Ok(())
    }

    /// Implements the full broadcast-with-lifetime algorithm: computes the broadcast set
    /// from `ranges` (the owner plus every rank that owns a consumer tile), returns
    /// immediately on ranks outside that set, and on delivery, if `target ==
    /// BroadcastTarget::Devices`, stages a copy on every local device.
    pub fn tile_bcast_over_ranges(&self, row: u32, col: u32, ranges: &[ConsumerRange], target: BroadcastTarget) -> Result<(), SlateError> {
        let members = broadcast_set(self.distribution.as_ref(), (row, col), ranges);
        let my_rank = self.comm.rank();
        if !members.contains(&my_rank) {
            return Ok(());
        }
        if members.len() == 1 {
            return Ok(());
        }

        let life = local_consumer_count(self.distribution.as_ref(), my_rank, ranges);
        self.tile_bcast(row, col, &members, life)?;

        if target == BroadcastTarget::Devices {
            let device_count = self.with_devices(|devices| devices.device_count());
            for device in 0..device_count {
                self.copy_to_device(row, col, device)?;
            }
        }
        Ok(())
    }

    /// Point-to-point send of the host tile at `(row, col)` to `dest`, tagged so the
    /// receiver's matching `recv_tile` call picks it out of any concurrent traffic.
    pub fn send_tile(&self, row: u32, col: u32, dest: u32) -> Result<(), SlateError> {
        let packed = self.registry.with_tile(row, col, Location::Host, |tile| tile.pack())?;
        let bytes = bytemuck::cast_slice(&packed).to_vec();
        self.comm.send(dest, self.broadcast_tag(row, col), bytes)
    }

    /// Receives a tile sent by [`Matrix::send_tile`] and installs it as a host copy of
    /// `(row, col)`.
    pub fn recv_tile(&self, row: u32, col: u32) -> Result<(), SlateError> {
        let mb = self.distribution.row_height(row);
        let cb = self.distribution.col_width(col);
        let (_, bytes) = self.comm.recv(self.broadcast_tag(row, col))?;
        let values: &[T] = bytemuck::cast_slice(&bytes);
        let block = self.pool.acquire(Location::Host)?;
        let mut tile = Tile::from_pool_block(mb, cb, self.nb, Location::Host, block)?;
        tile.unpack(values);
        self.registry.insert(row, col, Location::Host, tile)
    }

    /// Collects every tile in this view's range into a dense column-major buffer on rank
    /// 0. Other ranks still participate (they send their local tiles) and get back an
    /// empty buffer.
    pub fn gather(&self) -> Result<Vec<T>, SlateError> {
        let rank = self.comm.rank();
        let mut output = if rank == 0 {
            vec![T::default(); (self.m as usize) * (self.n as usize)]
        } else {
            Vec::new()
        };

        for row in self.row_range.clone() {
            for col in self.col_range.clone() {
                let owner = self.distribution.owner_rank(row, col);
                let tag = self.broadcast_tag(row, col);
                let mb = self.distribution.row_height(row);
                let cb = self.distribution.col_width(col);
                let row_base = (row * self.nb) as usize;
                let col_base = (col * self.nb) as usize;

                let packed = if owner == rank {
                    Some(self.registry.with_tile(row, col, Location::Host, |tile| tile.pack())?)
                } else {
                    None
                };

                if rank == 0 {
                    let packed = match packed {
                        Some(packed) => packed,
                        None => {
                            let (_, bytes) = self.comm.recv(tag)?;
                            bytemuck::cast_slice(&bytes).to_vec()
                        }
                    };
                    let mut iter = packed.into_iter();
                    for c in 0..cb {
                        for r in 0..mb {
                            let index = (col_base + c as usize) * (self.m as usize) + row_base + r as usize;
                            output[index] = iter.next().expect("iterator sized to mb * nb");
                        }
                    }
                } else if let Some(packed) = packed {
                    let bytes = bytemuck::cast_slice(&packed).to_vec();
                    self.comm.send(0, tag, bytes)?;
                }
            }
        }
        Ok(output)
    }
}

impl<T: Clone + Default + bytemuck::Pod + Send + Sync> Matrix<slate_distribution::BlockCyclic, T> {
    /// Builds a matrix with the default block-cyclic distribution from a validated
    /// `GridConfig`: the grid shape is rejected before anything is committed to it.
    pub fn construct_block_cyclic(m: u32, n: u32, config: GridConfig, comm: Arc<dyn Communicator>) -> Result<Self, SlateError> {
        config.validate()?;
        let distribution = slate_distribution::BlockCyclic::new(m, n, config.nb, config.p, config.q, config.device_count);
        Self::construct(m, n, config.nb, distribution, comm, config.device_count)
    }
}
