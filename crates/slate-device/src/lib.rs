//! Per-device scratch: streams, a BLAS handle, and batch pointer arrays for batched
//! kernels. The core treats all of this as opaque; it only needs to know how large the
//! batch arrays must be and that they survive submatrix view construction.

use std::marker::PhantomData;

use slate_constants::SlateError;

#[derive(Debug, PartialEq, Eq)]
pub enum ComputeStreamTag {}
#[derive(Debug, PartialEq, Eq)]
pub enum CommStreamTag {}
#[derive(Debug, PartialEq, Eq)]
pub enum BlasHandleTag {}

/// A tagged opaque handle, so a compute-stream id can never be passed where a
/// communication-stream id is expected.
#[derive(Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Handle<Tag> {
    raw: u64,
    _marker: PhantomData<Tag>,
}

impl<Tag> Copy for Handle<Tag> {}

impl<Tag> Clone for Handle<Tag> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Tag> Handle<Tag> {
    const fn new(raw: u64) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub const fn raw(self) -> u64 {
        self.raw
    }
}

pub type ComputeStreamId = Handle<ComputeStreamTag>;
pub type CommStreamId = Handle<CommStreamTag>;
pub type BlasHandleId = Handle<BlasHandleTag>;

/// The three batch-pointer roles used by batched BLAS-style kernels (e.g. `C = A*B`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRole {
    A,
    B,
    C,
}

/// Pinned-host / device-mirrored pointer arrays for one batch role. Entries are raw
/// addresses (`u64`) rather than typed pointers: the core never dereferences them, it
/// only stages them for a kernel launch that a numerical routine outside this crate owns.
#[derive(Debug, Default, Clone)]
struct BatchArray {
    host: Vec<u64>,
    device: Vec<u64>,
}

impl BatchArray {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            host: vec![0; capacity],
            device: vec![0; capacity],
        }
    }
}

/// Scratch owned by one device on this rank.
#[derive(Debug)]
pub struct DeviceContext {
    device: u32,
    compute_stream: Option<ComputeStreamId>,
    comm_stream: Option<CommStreamId>,
    blas_handle: Option<BlasHandleId>,
    batch: [BatchArray; 3],
    capacity: usize,
}

static NEXT_HANDLE: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_handle_raw() -> u64 {
    NEXT_HANDLE.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

impl DeviceContext {
    pub fn new(device: u32) -> Self {
        Self {
            device,
            compute_stream: None,
            comm_stream: None,
            blas_handle: None,
            batch: [BatchArray::default(), BatchArray::default(), BatchArray::default()],
            capacity: 0,
        }
    }

    pub const fn device(&self) -> u32 {
        self.device
    }

    pub fn init_streams(&mut self) {
        self.compute_stream = Some(Handle::new(next_handle_raw()));
        self.comm_stream = Some(Handle::new(next_handle_raw()));
        tracing::trace!(device = self.device, "initialized compute and communication streams");
    }

    pub fn init_blas_handle(&mut self) {
        self.blas_handle = Some(Handle::new(next_handle_raw()));
        tracing::trace!(device = self.device, "initialized blas handle");
    }

    pub fn compute_stream(&self) -> Option<ComputeStreamId> {
        self.compute_stream
    }

    pub fn comm_stream(&self) -> Option<CommStreamId> {
        self.comm_stream
    }

    pub fn blas_handle(&self) -> Option<BlasHandleId> {
        self.blas_handle
    }

    /// Allocates the `A*`, `B*`, `C*` pointer arrays at `capacity` entries each, on both
    /// host and device. Fails with `AllocFailed` only in the (currently unreachable in
    /// this simulated backend) case the allocator refuses; kept fallible to match the
    /// contract real accelerator backends must honor.
    pub fn init_batch_arrays(&mut self, capacity: usize) -> Result<(), SlateError> {
        for role in self.batch.iter_mut() {
            *role = BatchArray::with_capacity(capacity);
        }
        self.capacity = capacity;
        tracing::trace!(device = self.device, capacity, "allocated batch pointer arrays");
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checks the capacity invariant: this context's arrays must be at
    /// least as large as `max_local_tiles` for any matrix using it.
    pub fn ensure_capacity(&self, max_local_tiles: usize) -> Result<(), SlateError> {
        if self.capacity < max_local_tiles {
            return Err(SlateError::InvariantViolated(format!(
                "device {} batch arrays hold {} entries, matrix needs {}",
                self.device, self.capacity, max_local_tiles
            )));
        }
        Ok(())
    }

    /// Writes `addr` into the host-side batch array for `role` at `index`. Numerical
    /// routines fill the host side; `upload_batch` stages it to the simulated device
    /// mirror before a kernel launch.
    pub fn set_batch_pointer(&mut self, role: BatchRole, index: usize, addr: u64) -> Result<(), SlateError> {
        let array = &mut self.batch[role as usize];
        let slot = array.host.get_mut(index).ok_or_else(|| {
            SlateError::InvariantViolated(format!(
                "batch pointer index {index} out of range for capacity {}",
                array.host.len()
            ))
        })?;
        *slot = addr;
        Ok(())
    }

    /// Mirrors the host batch arrays to the device side, as a numerical routine would do
    /// on the compute stream immediately before a batched kernel launch.
    pub fn upload_batch(&mut self) {
        for array in self.batch.iter_mut() {
            array.device.copy_from_slice(&array.host);
        }
    }

    pub fn batch_pointers(&self, role: BatchRole) -> &[u64] {
        &self.batch[role as usize].device
    }

    pub fn destroy(&mut self) {
        self.compute_stream = None;
        self.comm_stream = None;
        self.blas_handle = None;
        for role in self.batch.iter_mut() {
            *role = BatchArray::default();
        }
        self.capacity = 0;
    }
}

/// Owns one `DeviceContext` per device local to this rank. Allocated at `Matrix`
/// construction, destroyed at teardown, and shared unchanged across submatrix views.
#[derive(Debug)]
pub struct DeviceContextSet {
    contexts: Vec<DeviceContext>,
}

impl DeviceContextSet {
    pub fn new(device_count: u32) -> Self {
        let mut contexts = Vec::with_capacity(device_count as usize);
        for device in 0..device_count {
            let mut context = DeviceContext::new(device);
            context.init_streams();
            context.init_blas_handle();
            contexts.push(context);
        }
        Self { contexts }
    }

    pub fn device_count(&self) -> u32 {
        self.contexts.len() as u32
    }

    pub fn get(&self, device: u32) -> Option<&DeviceContext> {
        self.contexts.get(device as usize)
    }

    pub fn get_mut(&mut self, device: u32) -> Option<&mut DeviceContext> {
        self.contexts.get_mut(device as usize)
    }

    pub fn init_batch_arrays_all(&mut self, capacity: usize) -> Result<(), SlateError> {
        for context in self.contexts.iter_mut() {
            context.init_batch_arrays(capacity)?;
        }
        Ok(())
    }

    pub fn destroy_all(&mut self) {
        for context in self.contexts.iter_mut() {
            context.destroy();
        }
    }
}
