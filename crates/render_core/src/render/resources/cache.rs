//! Engine resource to backend handle mapping
//!
//! Every engine-side resource that needs a backend object (geometry buffers,
//! textures, render targets) is registered once and addressed by a
//! generation-checked [`ResourceId`]. The cache is the only place a backend
//! handle lives across frame boundaries.
//!
//! # Lifecycle
//!
//! ```text
//! Unbound --get_or_create--> Bound --invalidate/release_pool--> Dirty
//!                              ^                                  |
//!                              +---------get_or_create------------+
//! any state --release--> Released (key no longer resolves)
//! ```
//!
//! # Allocation phases
//!
//! The backend cannot interleave managed eviction with pending unmanaged
//! allocations, so the cache runs a two-phase protocol. During the unmanaged
//! phase only unmanaged resources may be created; once it is finished only
//! managed resources may be. Reopening the unmanaged phase evicts the
//! backend's managed pool first.

use crate::foundation::collections::{new_key_type, SlotMap};
use crate::foundation::time::FrameStamp;
use crate::render::api::{
    BackendHandle, DeviceError, GraphicsDevice, MemoryPool, ResourceDesc, ResourceKind,
};
use thiserror::Error;

new_key_type! {
    /// Generation-checked key of a cached device resource
    pub struct ResourceId;
}

/// Lifecycle state of one cached resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Registered, never allocated
    Unbound,
    /// Backed by a live handle
    Bound,
    /// Handle lost or freed; recreated on next use
    Dirty,
    /// Unregistered; the key no longer resolves
    Released,
}

/// Which pool the cache currently accepts allocations for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPhase {
    /// Scene load: unmanaged resources only
    Unmanaged,
    /// Normal rendering: managed resources on demand
    Managed,
}

/// Local resource failures; callers skip the draw that needed the resource
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    /// The backend could not satisfy the allocation
    #[error("out of device memory for '{label}' ({requested} bytes)")]
    OutOfDeviceMemory {
        /// Resource label
        label: String,
        /// Bytes requested
        requested: u64,
    },

    /// Allocation requested outside the phase its pool belongs to
    #[error("{pool:?} allocation of '{label}' during the {phase:?} phase")]
    PoolOrder {
        /// Resource label
        label: String,
        /// Pool of the resource
        pool: MemoryPool,
        /// Phase the cache was in
        phase: AllocationPhase,
    },

    /// The key was released or never registered
    #[error("resource {0:?} was released")]
    Released(ResourceId),

    /// The device is lost
    #[error("device lost")]
    DeviceLost,

    /// Any other backend failure
    #[error("backend failure: {0}")]
    Backend(String),
}

#[derive(Debug)]
struct ResourceRecord {
    desc: ResourceDesc,
    handle: Option<BackendHandle>,
    state: ResourceState,
    last_used: Option<FrameStamp>,
    uploads: u32,
}

/// Maps engine resources to backend handles
#[derive(Debug)]
pub struct DeviceResourceCache {
    records: SlotMap<ResourceId, ResourceRecord>,
    allocated_bytes: u64,
    managed_bytes_seen: u64,
    phase: AllocationPhase,
    frame: FrameStamp,
}

impl Default for DeviceResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceResourceCache {
    /// Create an empty cache in the unmanaged phase
    pub fn new() -> Self {
        Self {
            records: SlotMap::with_key(),
            allocated_bytes: 0,
            managed_bytes_seen: 0,
            phase: AllocationPhase::Unmanaged,
            frame: FrameStamp::default(),
        }
    }

    /// Register a resource; nothing is allocated until first use
    pub fn register(&mut self, desc: ResourceDesc) -> ResourceId {
        log::trace!("Registering {:?} '{}' ({} bytes)", desc.kind, desc.label, desc.byte_size);
        self.records.insert(ResourceRecord {
            desc,
            handle: None,
            state: ResourceState::Unbound,
            last_used: None,
            uploads: 0,
        })
    }

    /// Return the live handle of `id`, allocating and uploading `data` when
    /// the resource is unbound or dirty
    pub fn get_or_create(
        &mut self,
        device: &mut dyn GraphicsDevice,
        id: ResourceId,
        data: &[u8],
    ) -> Result<BackendHandle, ResourceError> {
        let phase = self.phase;
        let frame = self.frame;
        let record = self.records.get_mut(id).ok_or(ResourceError::Released(id))?;

        if let (ResourceState::Bound, Some(handle)) = (record.state, record.handle) {
            if record.desc.pool == MemoryPool::Managed && record.last_used != Some(frame) {
                self.managed_bytes_seen += record.desc.byte_size;
            }
            record.last_used = Some(frame);
            return Ok(handle);
        }

        let allowed = match record.desc.pool {
            MemoryPool::Unmanaged => phase == AllocationPhase::Unmanaged,
            MemoryPool::Managed => phase == AllocationPhase::Managed,
        };
        if !allowed {
            return Err(ResourceError::PoolOrder {
                label: record.desc.label.clone(),
                pool: record.desc.pool,
                phase,
            });
        }

        if let Some(stale) = record.handle.take() {
            device.destroy_resource(stale);
        }

        let handle = device.create_resource(&record.desc).map_err(|e| match e {
            DeviceError::OutOfMemory { requested } => {
                ResourceError::OutOfDeviceMemory { label: record.desc.label.clone(), requested }
            }
            other => other.into(),
        })?;

        if !data.is_empty() {
            if let Err(e) = device.upload(handle, data) {
                device.destroy_resource(handle);
                return Err(e.into());
            }
        }

        log::debug!(
            "Created {:?} '{}' as {} in {:?} pool",
            record.desc.kind,
            record.desc.label,
            handle,
            record.desc.pool
        );

        record.handle = Some(handle);
        record.state = ResourceState::Bound;
        record.last_used = Some(frame);
        record.uploads += 1;
        self.allocated_bytes += record.desc.byte_size;
        if record.desc.pool == MemoryPool::Managed {
            self.managed_bytes_seen += record.desc.byte_size;
        }
        Ok(handle)
    }

    /// Live handle of `id` without allocating
    pub fn handle(&self, id: ResourceId) -> Option<BackendHandle> {
        self.records
            .get(id)
            .filter(|record| record.state == ResourceState::Bound)
            .and_then(|record| record.handle)
    }

    /// Replace the contents of a bound resource in place
    pub fn update(
        &mut self,
        device: &mut dyn GraphicsDevice,
        id: ResourceId,
        data: &[u8],
    ) -> Result<BackendHandle, ResourceError> {
        // A fresh allocation uploads as part of creation
        let was_bound = self.state(id) == ResourceState::Bound;
        let handle = self.get_or_create(device, id, data)?;
        if was_bound {
            device.upload(handle, data)?;
            if let Some(record) = self.records.get_mut(id) {
                record.uploads += 1;
            }
        }
        Ok(handle)
    }

    /// Mark `id` dirty without touching engine-side data
    pub fn invalidate(&mut self, id: ResourceId) {
        if let Some(record) = self.records.get_mut(id) {
            if record.state == ResourceState::Bound {
                record.state = ResourceState::Dirty;
                self.allocated_bytes = self.allocated_bytes.saturating_sub(record.desc.byte_size);
            }
        }
    }

    /// Free every backend handle; resources recreate on next use
    pub fn release_all(&mut self, device: &mut dyn GraphicsDevice) {
        let freed = self.release_where(device, |_| true);
        log::info!("Released all device resources ({freed} handles)");
    }

    /// Free every backend handle in `pool`
    pub fn release_pool(&mut self, device: &mut dyn GraphicsDevice, pool: MemoryPool) {
        let freed = self.release_where(device, |record| record.desc.pool == pool);
        log::debug!("Released {freed} {pool:?} handles");
    }

    /// Unregister `id`, freeing its handle. Its key never resolves again.
    pub fn release(&mut self, device: &mut dyn GraphicsDevice, id: ResourceId) {
        if let Some(record) = self.records.remove(id) {
            if let Some(handle) = record.handle {
                device.destroy_resource(handle);
            }
            if record.state == ResourceState::Bound {
                self.allocated_bytes = self.allocated_bytes.saturating_sub(record.desc.byte_size);
            }
        }
    }

    /// Current state of `id`
    pub fn state(&self, id: ResourceId) -> ResourceState {
        self.records.get(id).map_or(ResourceState::Released, |record| record.state)
    }

    /// How many times `id` has been uploaded
    pub fn upload_count(&self, id: ResourceId) -> u32 {
        self.records.get(id).map_or(0, |record| record.uploads)
    }

    /// Pool of `id`
    pub fn pool_of(&self, id: ResourceId) -> Option<MemoryPool> {
        self.records.get(id).map(|record| record.desc.pool)
    }

    /// Registered resources of the given pool
    pub fn ids_in_pool(&self, pool: MemoryPool) -> Vec<ResourceId> {
        self.records
            .iter()
            .filter(|(_, record)| record.desc.pool == pool)
            .map(|(id, _)| id)
            .collect()
    }

    /// Registered render targets
    pub fn render_targets(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.records
            .iter()
            .filter(|(_, record)| record.desc.kind == ResourceKind::RenderTarget)
            .map(|(id, _)| id)
    }

    /// Enter the unmanaged phase, evicting the backend's managed pool first
    pub fn begin_unmanaged_phase(&mut self, device: &mut dyn GraphicsDevice) {
        if self.phase != AllocationPhase::Unmanaged {
            device.evict_managed_resources();
            self.managed_bytes_seen = 0;
            self.phase = AllocationPhase::Unmanaged;
        }
        log::debug!("Resource cache entered unmanaged allocation phase");
    }

    /// Leave the unmanaged phase; managed resources may be created from now on
    pub fn finish_unmanaged_phase(&mut self) {
        self.phase = AllocationPhase::Managed;
        log::debug!("Resource cache entered managed allocation phase");
    }

    /// Current allocation phase
    pub fn phase(&self) -> AllocationPhase {
        self.phase
    }

    /// Advance the frame stamp used for usage tracking
    pub fn set_frame(&mut self, frame: FrameStamp) {
        self.frame = frame;
    }

    /// Bytes currently held by bound handles
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes
    }

    /// Managed bytes allocated or first touched in a frame since the counter
    /// was last reset
    pub fn managed_bytes_seen(&self) -> u64 {
        self.managed_bytes_seen
    }

    /// Reset the managed usage counter after an eviction
    pub fn reset_managed_bytes_seen(&mut self) {
        self.managed_bytes_seen = 0;
    }

    /// Number of registered resources
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn release_where(
        &mut self,
        device: &mut dyn GraphicsDevice,
        predicate: impl Fn(&ResourceRecord) -> bool,
    ) -> usize {
        let mut freed = 0;
        for record in self.records.values_mut().filter(|record| predicate(record)) {
            if let Some(handle) = record.handle.take() {
                device.destroy_resource(handle);
                freed += 1;
            }
            if record.state == ResourceState::Bound {
                self.allocated_bytes = self.allocated_bytes.saturating_sub(record.desc.byte_size);
                record.state = ResourceState::Dirty;
            }
        }
        freed
    }
}

impl From<DeviceError> for ResourceError {
    fn from(error: DeviceError) -> Self {
        match error {
            DeviceError::OutOfMemory { requested } => {
                Self::OutOfDeviceMemory { label: String::new(), requested }
            }
            DeviceError::DeviceLost => Self::DeviceLost,
            other => Self::Backend(other.to_string()),
        }
    }
}
