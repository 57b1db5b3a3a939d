use std::fmt;
use std::sync::Arc;

use crate::device::{DeviceMemoryAllocator, Stream, StreamBorrower};
use crate::profile::ExecutionProfile;

/// Mapping of (replica, computation) pairs to device ordinals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    replica_count: usize,
    computation_count: usize,
    devices: Vec<i32>,
}

impl DeviceAssignment {
    /// `devices` is replica-major: `devices[replica * computation_count + computation]`.
    pub fn new(replica_count: usize, computation_count: usize, devices: Vec<i32>) -> Option<Self> {
        (devices.len() == replica_count * computation_count).then_some(Self {
            replica_count,
            computation_count,
            devices,
        })
    }

    pub fn replica_count(&self) -> usize {
        self.replica_count
    }

    pub fn computation_count(&self) -> usize {
        self.computation_count
    }

    pub fn device(&self, replica: usize, computation: usize) -> Option<i32> {
        if replica >= self.replica_count || computation >= self.computation_count {
            return None;
        }
        self.devices
            .get(replica * self.computation_count + computation)
            .copied()
    }

    /// `(replica, computation)` a device ordinal is assigned to.
    pub fn logical_id(&self, device_ordinal: i32) -> Option<(usize, usize)> {
        let position = self.devices.iter().position(|&d| d == device_ordinal)?;
        Some((
            position / self.computation_count,
            position % self.computation_count,
        ))
    }
}

/// Everything the caller supplies for one invocation.
#[derive(Clone)]
pub struct RunOptions {
    pub stream: Arc<dyn Stream>,
    pub allocator: Arc<dyn DeviceMemoryAllocator>,
    pub execution_profile: Option<Arc<ExecutionProfile>>,
    pub stream_borrower: Option<Arc<dyn StreamBorrower>>,
    pub device_assignment: Option<DeviceAssignment>,
    pub run_id: u64,
}

impl RunOptions {
    pub fn new(stream: Arc<dyn Stream>, allocator: Arc<dyn DeviceMemoryAllocator>) -> Self {
        Self {
            stream,
            allocator,
            execution_profile: None,
            stream_borrower: None,
            device_assignment: None,
            run_id: 0,
        }
    }

    pub fn with_execution_profile(mut self, profile: Arc<ExecutionProfile>) -> Self {
        self.execution_profile = Some(profile);
        self
    }

    pub fn with_stream_borrower(mut self, borrower: Arc<dyn StreamBorrower>) -> Self {
        self.stream_borrower = Some(borrower);
        self
    }

    pub fn with_device_assignment(mut self, assignment: DeviceAssignment) -> Self {
        self.device_assignment = Some(assignment);
        self
    }

    pub fn with_run_id(mut self, run_id: u64) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn device_ordinal(&self) -> i32 {
        self.stream.executor().device_ordinal()
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("device_ordinal", &self.device_ordinal())
            .field("has_profile", &self.execution_profile.is_some())
            .field("has_stream_borrower", &self.stream_borrower.is_some())
            .field("device_assignment", &self.device_assignment)
            .field("run_id", &self.run_id)
            .finish()
    }
}
