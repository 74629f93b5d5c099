//! Headless recording backend
//!
//! [`RecordingDevice`] implements [`GraphicsDevice`] without any GPU. Every
//! call is appended to a log so integrations can run the pipeline headlessly
//! and inspect exactly what reached the backend. The device can be scripted
//! to report device loss, to fail a display mode or to run out of memory.

use crate::config::DisplayParams;
use crate::foundation::math::Mat4;
use crate::render::api::{
    BackendHandle, DeviceCaps, DeviceError, DeviceFactory, DeviceResult, DeviceStatus, DrawCall,
    GeometryBinding, GpuLight, GraphicsDevice, MemoryPool, PresentResult, ResourceDesc,
    ResourceKind, ScreenQuad, TransformSlot,
};
use crate::render::state::{ColorWriteMask, StateChange};
use std::collections::{HashMap, VecDeque};

/// One backend call as observed by the recording device
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCall {
    /// Device reset with new display parameters
    Reset(DisplayParams),
    /// Resource allocation
    CreateResource {
        /// Handle handed out
        handle: BackendHandle,
        /// Resource kind
        kind: ResourceKind,
        /// Memory pool
        pool: MemoryPool,
    },
    /// Resource upload
    Upload {
        /// Target resource
        handle: BackendHandle,
        /// Bytes uploaded
        bytes: usize,
    },
    /// Resource destruction
    DestroyResource(BackendHandle),
    /// Managed pool eviction
    EvictManaged,
    /// State transition
    ApplyState(StateChange),
    /// Render target binding
    SetRenderTarget(Option<BackendHandle>),
    /// Target clear
    Clear {
        /// Clear color
        color: [f32; 4],
        /// Channels cleared
        mask: ColorWriteMask,
    },
    /// Matrix load
    SetTransform(TransformSlot),
    /// Light slot load
    SetLight {
        /// Slot index
        slot: u32,
        /// Light, `None` when the slot was disabled
        light: Option<GpuLight>,
    },
    /// Texture binding
    BindTexture {
        /// Stage
        stage: u32,
        /// Texture, `None` when unbound
        texture: Option<BackendHandle>,
    },
    /// Geometry binding
    BindGeometry(GeometryBinding),
    /// Indexed draw
    Draw(DrawCall),
    /// Screen quad draw
    DrawScreenQuad(ScreenQuad),
    /// Scene opened
    BeginScene,
    /// Scene closed
    EndScene,
    /// Frame presented
    Present,
}

impl DeviceCall {
    /// True for calls that rasterize something
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw(_) | Self::DrawScreenQuad(_))
    }
}

#[derive(Debug, Clone)]
struct LiveResource {
    pool: MemoryPool,
    byte_size: u64,
}

/// Backend that records calls instead of rendering
#[derive(Debug)]
pub struct RecordingDevice {
    caps: DeviceCaps,
    calls: Vec<DeviceCall>,
    resources: HashMap<BackendHandle, LiveResource>,
    next_handle: u64,
    status_script: VecDeque<DeviceStatus>,
    lost: bool,
    lose_on_present: bool,
    rejected_modes: Vec<DisplayParams>,
    memory_budget: Option<u64>,
    display: DisplayParams,
}

impl RecordingDevice {
    /// Create an operational device with the given capabilities
    pub fn new(caps: DeviceCaps) -> Self {
        Self {
            caps,
            calls: Vec::new(),
            resources: HashMap::new(),
            next_handle: 1,
            status_script: VecDeque::new(),
            lost: false,
            lose_on_present: false,
            rejected_modes: Vec::new(),
            memory_budget: None,
            display: DisplayParams::default(),
        }
    }

    /// Limit total resident bytes; allocations beyond it fail
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Make resets to `params` fail
    pub fn reject_mode(&mut self, params: DisplayParams) {
        self.rejected_modes.push(params);
    }

    /// Queue statuses returned by successive cooperative-level polls; once the
    /// script runs out the device reports its real state
    pub fn script_status(&mut self, statuses: &[DeviceStatus]) {
        self.status_script.extend(statuses.iter().copied());
        if statuses.iter().any(|status| *status != DeviceStatus::Ok) {
            self.lost = true;
        }
    }

    /// Make the next present surface device loss
    pub fn lose_on_next_present(&mut self) {
        self.lose_on_present = true;
    }

    /// Change the reported capabilities
    pub fn set_caps(&mut self, caps: DeviceCaps) {
        self.caps = caps;
    }

    /// Every call received so far
    pub fn calls(&self) -> &[DeviceCall] {
        &self.calls
    }

    /// Drop the call log
    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    /// Number of indexed and screen-quad draws received
    pub fn draw_count(&self) -> usize {
        self.calls.iter().filter(|call| call.is_draw()).count()
    }

    /// Number of live resources
    pub fn live_resources(&self) -> usize {
        self.resources.len()
    }

    /// Live bytes in a pool
    pub fn resident_bytes(&self, pool: MemoryPool) -> u64 {
        self.resources
            .values()
            .filter(|resource| resource.pool == pool)
            .map(|resource| resource.byte_size)
            .sum()
    }

    /// Parameters of the last successful reset
    pub fn display(&self) -> &DisplayParams {
        &self.display
    }

    /// True while the device considers itself lost
    pub fn is_lost(&self) -> bool {
        self.lost
    }
}

impl GraphicsDevice for RecordingDevice {
    fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    fn test_cooperative_level(&mut self) -> DeviceStatus {
        if let Some(status) = self.status_script.pop_front() {
            return status;
        }
        if self.lost {
            DeviceStatus::NotReset
        } else {
            DeviceStatus::Ok
        }
    }

    fn reset(&mut self, params: &DisplayParams) -> DeviceResult<()> {
        self.calls.push(DeviceCall::Reset(params.clone()));
        if self.rejected_modes.contains(params) {
            return Err(DeviceError::Unsupported(format!(
                "display mode {}x{}x{}",
                params.width, params.height, params.color_depth
            )));
        }

        // Unmanaged memory does not survive a reset
        self.resources.retain(|_, resource| resource.pool == MemoryPool::Managed);
        self.lost = false;
        self.status_script.clear();
        self.display = params.clone();
        Ok(())
    }

    fn create_resource(&mut self, desc: &ResourceDesc) -> DeviceResult<BackendHandle> {
        if self.lost {
            return Err(DeviceError::DeviceLost);
        }
        if let Some(budget) = self.memory_budget {
            let resident: u64 = self.resources.values().map(|resource| resource.byte_size).sum();
            if resident + desc.byte_size > budget {
                return Err(DeviceError::OutOfMemory { requested: desc.byte_size });
            }
        }

        let handle = BackendHandle(self.next_handle);
        self.next_handle += 1;
        self.resources.insert(handle, LiveResource { pool: desc.pool, byte_size: desc.byte_size });
        self.calls.push(DeviceCall::CreateResource { handle, kind: desc.kind, pool: desc.pool });
        Ok(handle)
    }

    fn upload(&mut self, handle: BackendHandle, data: &[u8]) -> DeviceResult<()> {
        if !self.resources.contains_key(&handle) {
            return Err(DeviceError::InvalidHandle(handle));
        }
        self.calls.push(DeviceCall::Upload { handle, bytes: data.len() });
        Ok(())
    }

    fn destroy_resource(&mut self, handle: BackendHandle) {
        self.resources.remove(&handle);
        self.calls.push(DeviceCall::DestroyResource(handle));
    }

    fn evict_managed_resources(&mut self) {
        self.calls.push(DeviceCall::EvictManaged);
    }

    fn apply_state(&mut self, change: &StateChange) {
        self.calls.push(DeviceCall::ApplyState(*change));
    }

    fn set_render_target(&mut self, target: Option<BackendHandle>) {
        self.calls.push(DeviceCall::SetRenderTarget(target));
    }

    fn clear(&mut self, color: [f32; 4], _depth: Option<f32>, mask: ColorWriteMask) {
        self.calls.push(DeviceCall::Clear { color, mask });
    }

    fn set_transform(&mut self, slot: TransformSlot, _matrix: &Mat4) {
        self.calls.push(DeviceCall::SetTransform(slot));
    }

    fn set_light(&mut self, slot: u32, light: Option<&GpuLight>) {
        self.calls.push(DeviceCall::SetLight { slot, light: light.copied() });
    }

    fn bind_texture(&mut self, stage: u32, texture: Option<BackendHandle>) {
        self.calls.push(DeviceCall::BindTexture { stage, texture });
    }

    fn bind_geometry(&mut self, binding: &GeometryBinding) {
        self.calls.push(DeviceCall::BindGeometry(*binding));
    }

    fn draw_indexed(&mut self, call: &DrawCall) -> DeviceResult<()> {
        self.calls.push(DeviceCall::Draw(*call));
        if self.lost {
            return Err(DeviceError::DeviceLost);
        }
        Ok(())
    }

    fn draw_screen_quad(&mut self, quad: &ScreenQuad) -> DeviceResult<()> {
        self.calls.push(DeviceCall::DrawScreenQuad(*quad));
        if self.lost {
            return Err(DeviceError::DeviceLost);
        }
        Ok(())
    }

    fn begin_scene(&mut self) -> DeviceResult<()> {
        if self.lost {
            return Err(DeviceError::DeviceLost);
        }
        self.calls.push(DeviceCall::BeginScene);
        Ok(())
    }

    fn end_scene(&mut self) {
        self.calls.push(DeviceCall::EndScene);
    }

    fn present(&mut self) -> PresentResult {
        self.calls.push(DeviceCall::Present);
        if self.lose_on_present || self.lost {
            self.lose_on_present = false;
            self.lost = true;
            return PresentResult::DeviceLost;
        }
        PresentResult::Presented
    }
}

/// Factory producing [`RecordingDevice`]s
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory {
    caps: DeviceCaps,
    rejected_modes: Vec<DisplayParams>,
    memory_budget: Option<u64>,
}

impl RecordingFactory {
    /// Factory for devices with the given capabilities
    pub fn new(caps: DeviceCaps) -> Self {
        Self { caps, ..Self::default() }
    }

    /// Fail creation (and later resets) for `params`
    pub fn reject_mode(mut self, params: DisplayParams) -> Self {
        self.rejected_modes.push(params);
        self
    }

    /// Give created devices a memory budget
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }
}

impl DeviceFactory for RecordingFactory {
    type Device = RecordingDevice;

    fn create_device(&mut self, params: &DisplayParams) -> DeviceResult<RecordingDevice> {
        if self.rejected_modes.contains(params) {
            return Err(DeviceError::Unsupported(format!(
                "no adapter supports {}x{}x{}",
                params.width, params.height, params.color_depth
            )));
        }

        let mut device = RecordingDevice::new(self.caps.clone());
        device.memory_budget = self.memory_budget;
        device.rejected_modes = self.rejected_modes.clone();
        device.display = params.clone();
        Ok(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(pool: MemoryPool, byte_size: u64) -> ResourceDesc {
        ResourceDesc {
            kind: ResourceKind::VertexBuffer,
            pool,
            byte_size,
            extent: None,
            label: "test".to_string(),
        }
    }

    #[test]
    fn test_status_script_then_reset() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        device.script_status(&[DeviceStatus::Lost, DeviceStatus::NotReset]);

        assert_eq!(device.test_cooperative_level(), DeviceStatus::Lost);
        assert_eq!(device.test_cooperative_level(), DeviceStatus::NotReset);
        // Still lost until reset
        assert_eq!(device.test_cooperative_level(), DeviceStatus::NotReset);

        device.reset(&DisplayParams::default()).expect("Should reset");
        assert_eq!(device.test_cooperative_level(), DeviceStatus::Ok);
    }

    #[test]
    fn test_reset_drops_unmanaged_resources() {
        let mut device = RecordingDevice::new(DeviceCaps::default());
        device.create_resource(&desc(MemoryPool::Unmanaged, 64)).expect("Should allocate");
        device.create_resource(&desc(MemoryPool::Managed, 32)).expect("Should allocate");

        device.reset(&DisplayParams::default()).expect("Should reset");
        assert_eq!(device.live_resources(), 1);
        assert_eq!(device.resident_bytes(MemoryPool::Managed), 32);
    }

    #[test]
    fn test_memory_budget_rejects_allocation() {
        let mut device = RecordingDevice::new(DeviceCaps::default()).with_memory_budget(100);
        device.create_resource(&desc(MemoryPool::Managed, 80)).expect("Should allocate");

        let result = device.create_resource(&desc(MemoryPool::Managed, 40));
        assert_eq!(result, Err(DeviceError::OutOfMemory { requested: 40 }));
    }

    #[test]
    fn test_factory_rejects_mode() {
        let mut factory =
            RecordingFactory::new(DeviceCaps::default()).reject_mode(DisplayParams::default());
        assert!(factory.create_device(&DisplayParams::default()).is_err());
        assert!(factory.create_device(&DisplayParams::reduced()).is_ok());
    }
}
