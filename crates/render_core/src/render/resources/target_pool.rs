//! Pooled offscreen render targets for shadow maps
//!
//! Targets are square, pre-allocated in the unmanaged pool at scene load and
//! handed out per frame. A checkout that cannot be served at the requested
//! size falls back to the next smaller pooled size, repeatedly, down to the
//! minimum. [`RenderTargetPool::reset`] returns every target at frame end;
//! nothing is destroyed.

use super::cache::{DeviceResourceCache, ResourceError, ResourceId};
use crate::config::ShadowConfig;
use crate::render::api::{GraphicsDevice, MemoryPool, ResourceDesc, ResourceKind};
use std::collections::BTreeMap;

/// Bytes per texel of a pooled target
const TARGET_TEXEL_BYTES: u64 = 4;

/// A target checked out for the current frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetLease {
    /// Cache key of the target
    pub id: ResourceId,
    /// Edge length in texels
    pub size: u32,
}

/// Per-size freelists of square render targets
#[derive(Debug, Default)]
pub struct RenderTargetPool {
    sizes: Vec<u32>,
    targets_per_size: u32,
    free: BTreeMap<u32, Vec<ResourceId>>,
    checked_out: Vec<TargetLease>,
}

impl RenderTargetPool {
    /// Create an empty pool laid out by `config`
    pub fn new(config: &ShadowConfig) -> Self {
        Self {
            sizes: config.pooled_sizes(),
            targets_per_size: config.targets_per_size,
            free: BTreeMap::new(),
            checked_out: Vec::new(),
        }
    }

    /// Register and allocate every pooled target. Must run inside the
    /// cache's unmanaged phase. Sizes that fail to allocate are left short;
    /// the pool simply has fewer targets of that size.
    pub fn allocate(
        &mut self,
        cache: &mut DeviceResourceCache,
        device: &mut dyn GraphicsDevice,
    ) -> Result<usize, ResourceError> {
        let mut created = 0;
        for &size in &self.sizes {
            let list = self.free.entry(size).or_default();
            while list.len() < self.targets_per_size as usize {
                let id = cache.register(ResourceDesc {
                    kind: ResourceKind::RenderTarget,
                    pool: MemoryPool::Unmanaged,
                    byte_size: u64::from(size) * u64::from(size) * TARGET_TEXEL_BYTES,
                    extent: Some((size, size)),
                    label: format!("shadow_target_{size}"),
                });
                match cache.get_or_create(device, id, &[]) {
                    Ok(_) => {
                        list.push(id);
                        created += 1;
                    }
                    Err(ResourceError::OutOfDeviceMemory { requested, .. }) => {
                        log::warn!("Shadow target pool short at {size}: {requested} bytes unavailable");
                        cache.release(device, id);
                        break;
                    }
                    Err(e) => {
                        cache.release(device, id);
                        return Err(e);
                    }
                }
            }
        }
        log::debug!("Shadow target pool holds {} targets", self.capacity());
        Ok(created)
    }

    /// Recreate targets whose handles were lost. Must run inside the cache's
    /// unmanaged phase.
    pub fn restore(
        &mut self,
        cache: &mut DeviceResourceCache,
        device: &mut dyn GraphicsDevice,
    ) -> Result<(), ResourceError> {
        self.reset();
        for id in self.free.values().flatten() {
            cache.get_or_create(device, *id, &[])?;
        }
        Ok(())
    }

    /// Check out the largest available target not larger than `requested`
    pub fn checkout(&mut self, requested: u32) -> Option<TargetLease> {
        let ceiling = requested.max(self.min_size());
        let lease = self
            .sizes
            .iter()
            .copied()
            .filter(|&size| size <= ceiling)
            .find_map(|size| {
                let id = self.free.get_mut(&size)?.pop()?;
                Some(TargetLease { id, size })
            })?;

        if lease.size < requested {
            log::trace!("Shadow target {requested} unavailable, fell back to {}", lease.size);
        }
        self.checked_out.push(lease);
        Some(lease)
    }

    /// Return one target before the frame ends
    pub fn checkin(&mut self, lease: TargetLease) {
        if let Some(index) = self.checked_out.iter().position(|held| *held == lease) {
            self.checked_out.swap_remove(index);
            self.free.entry(lease.size).or_default().push(lease.id);
        }
    }

    /// Return every checked out target
    pub fn reset(&mut self) {
        for lease in self.checked_out.drain(..) {
            self.free.entry(lease.size).or_default().push(lease.id);
        }
    }

    /// Release every target from the cache and forget them
    pub fn release(&mut self, cache: &mut DeviceResourceCache, device: &mut dyn GraphicsDevice) {
        self.reset();
        for id in std::mem::take(&mut self.free).into_values().flatten() {
            cache.release(device, id);
        }
    }

    /// Targets currently checked out
    pub fn checked_out(&self) -> usize {
        self.checked_out.len()
    }

    /// Free targets of one size
    pub fn available(&self, size: u32) -> usize {
        self.free.get(&size).map_or(0, Vec::len)
    }

    /// Total targets owned by the pool
    pub fn capacity(&self) -> usize {
        self.free.values().map(Vec::len).sum::<usize>() + self.checked_out.len()
    }

    /// Pooled sizes from largest to smallest
    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    fn min_size(&self) -> u32 {
        self.sizes.last().copied().unwrap_or(0)
    }
}
