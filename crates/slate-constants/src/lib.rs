use std::fmt;

/// Default tile extent (`nb`) used when a caller does not pick one explicitly.
pub const DEFAULT_TILE_EXTENT: u32 = 256;

/// Default process-grid shape (`p`, `q`) for a single-rank run.
pub const DEFAULT_PROCESS_GRID: (u32, u32) = (1, 1);

/// A tile residency. Either the host, or one of `D` accelerator devices local to this rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Location {
    Host,
    Device(u32),
}

impl Location {
    pub const fn is_host(self) -> bool {
        matches!(self, Location::Host)
    }

    pub const fn device_id(self) -> Option<u32> {
        match self {
            Location::Device(id) => Some(id),
            Location::Host => None,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Host => write!(formatter, "host"),
            Location::Device(id) => write!(formatter, "device({id})"),
        }
    }
}

/// Where a broadcast should leave copies of the tile once the transport step completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastTarget {
    /// Leave the tile resident only on the host.
    Host,
    /// After the host-to-host transport step, additionally stage the tile onto every
    /// device local to this rank.
    Devices,
}

/// The error taxonomy shared across every crate in this workspace: kinds, not call sites.
///
/// `NotResident`, `InvalidArgument`, and `InvariantViolated` are caller bugs; per the
/// propagation policy, core code asserts on these rather than returning them, but the
/// variants still exist so boundary code (deserializing a caller-supplied range, say)
/// can report them before an assertion would fire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlateError {
    AllocFailed(String),
    TransferFailed(String),
    NotResident { row: u32, col: u32, location: Location },
    InvalidArgument(String),
    InvariantViolated(String),
}

impl fmt::Display for SlateError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlateError::AllocFailed(reason) => write!(formatter, "allocation failed: {reason}"),
            SlateError::TransferFailed(reason) => write!(formatter, "transfer failed: {reason}"),
            SlateError::NotResident { row, col, location } => write!(
                formatter,
                "tile ({row}, {col}) not resident at {location}"
            ),
            SlateError::InvalidArgument(reason) => write!(formatter, "invalid argument: {reason}"),
            SlateError::InvariantViolated(reason) => {
                write!(formatter, "invariant violated: {reason}")
            }
        }
    }
}

impl std::error::Error for SlateError {}

/// Grid shape and tile extent a `Matrix` is constructed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridConfig {
    pub p: u32,
    pub q: u32,
    pub nb: u32,
    pub device_count: u32,
}

impl GridConfig {
    pub const fn new(p: u32, q: u32, nb: u32, device_count: u32) -> Self {
        Self {
            p,
            q,
            nb,
            device_count,
        }
    }

    pub fn single_rank(nb: u32, device_count: u32) -> Self {
        Self {
            p: 1,
            q: 1,
            nb,
            device_count,
        }
    }

    pub fn ranks(&self) -> u32 {
        self.p * self.q
    }

    pub fn validate(&self) -> Result<(), SlateError> {
        if self.p == 0 || self.q == 0 {
            return Err(SlateError::InvalidArgument(format!(
                "process grid dimensions must be positive, got p={}, q={}",
                self.p, self.q
            )));
        }
        if self.nb == 0 {
            return Err(SlateError::InvalidArgument(
                "tile extent nb must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GridConfig {
    fn default() -> Self {
        let (p, q) = DEFAULT_PROCESS_GRID;
        Self {
            p,
            q,
            nb: DEFAULT_TILE_EXTENT,
            device_count: 0,
        }
    }
}

/// Ceiling division, used throughout to compute `MT`/`NT` from `M`/`N`/`nb`.
pub const fn ceil_div(numerator: u32, denominator: u32) -> u32 {
    (numerator + denominator - 1) / denominator
}
