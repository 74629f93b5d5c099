//! Frame lifecycle state machine

use crate::config::MemoryConfig;
use crate::foundation::time::{Clock, FrameStamp};
use crate::render::api::{DeviceStatus, GraphicsDevice};

/// Where the pipeline is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePhase {
    /// Between frames
    Idle,
    /// Scene resources are being allocated
    SceneLoading,
    /// At least one frame is open
    FrameActive,
}

/// Outcome of polling the device at the start of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePoll {
    /// The device is usable
    Healthy,
    /// Lost and not resettable yet
    Lost,
    /// Lost and resettable now
    NeedsReset,
}

/// Tracks frame nesting, device loss and managed-pool pressure
pub struct FrameController {
    phase: FramePhase,
    depth: u32,
    frame: FrameStamp,
    device_lost: bool,
    clock: Box<dyn Clock>,
    memory: MemoryConfig,
    last_eviction: f64,
    evictions: u32,
}

impl std::fmt::Debug for FrameController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameController")
            .field("phase", &self.phase)
            .field("depth", &self.depth)
            .field("frame", &self.frame)
            .field("device_lost", &self.device_lost)
            .field("evictions", &self.evictions)
            .finish_non_exhaustive()
    }
}

impl FrameController {
    /// Create an idle controller reading wall-clock time from `clock`
    pub fn new(memory: MemoryConfig, clock: Box<dyn Clock>) -> Self {
        let last_eviction = clock.now_seconds();
        Self {
            phase: FramePhase::Idle,
            depth: 0,
            frame: FrameStamp::default(),
            device_lost: false,
            clock,
            memory,
            last_eviction,
            evictions: 0,
        }
    }

    /// Current phase
    pub fn phase(&self) -> FramePhase {
        self.phase
    }

    /// Nested frame depth; zero between frames
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Stamp of the current or most recent frame
    pub fn frame(&self) -> FrameStamp {
        self.frame
    }

    /// True while waiting for the device to become resettable
    pub fn is_device_lost(&self) -> bool {
        self.device_lost
    }

    /// Managed-pool evictions performed so far
    pub fn evictions(&self) -> u32 {
        self.evictions
    }

    /// Enter waiting-for-reset mode; every draw is a no-op until recovery
    pub fn mark_device_lost(&mut self) {
        if !self.device_lost {
            log::warn!("Device lost at frame {}, waiting for reset", self.frame.0);
        }
        self.device_lost = true;
    }

    /// Recovery finished; the device is usable again
    pub fn mark_device_restored(&mut self) {
        if self.device_lost {
            log::info!("Device restored at frame {}", self.frame.0);
        }
        self.device_lost = false;
    }

    /// Poll the cooperative level. A device that reports `Ok` while the
    /// controller still considers it lost is reset anyway so resources are
    /// rebuilt.
    pub fn poll_device(&mut self, device: &mut dyn GraphicsDevice) -> DevicePoll {
        match device.test_cooperative_level() {
            DeviceStatus::Ok if self.device_lost => DevicePoll::NeedsReset,
            DeviceStatus::Ok => DevicePoll::Healthy,
            DeviceStatus::Lost => {
                self.mark_device_lost();
                DevicePoll::Lost
            }
            DeviceStatus::NotReset => {
                self.mark_device_lost();
                DevicePoll::NeedsReset
            }
        }
    }

    /// Decide whether the backend's managed pool should be evicted.
    /// Evicts when more than the threshold was touched since the last
    /// eviction and at least the minimum interval has passed.
    pub fn should_evict(&mut self, managed_bytes_seen: u64) -> bool {
        if managed_bytes_seen <= self.memory.evict_threshold_bytes {
            return false;
        }
        let now = self.clock.now_seconds();
        if now - self.last_eviction < self.memory.evict_min_interval_secs {
            return false;
        }
        self.last_eviction = now;
        self.evictions += 1;
        log::debug!("Managed pool pressure: {managed_bytes_seen} bytes seen, evicting");
        true
    }

    /// Start loading a scene
    pub fn begin_scene_load(&mut self) {
        self.phase = FramePhase::SceneLoading;
    }

    /// Scene resources are in place
    pub fn finish_scene_load(&mut self) {
        self.phase = FramePhase::Idle;
    }

    /// Open a frame. Returns the new stamp for an outermost frame and `None`
    /// for a nested one.
    pub fn enter_frame(&mut self) -> Option<FrameStamp> {
        self.depth += 1;
        if self.depth > 1 {
            return None;
        }
        self.frame = self.frame.next();
        self.phase = FramePhase::FrameActive;
        Some(self.frame)
    }

    /// Close a frame. Returns `true` when the outermost frame closed.
    pub fn leave_frame(&mut self) -> bool {
        match self.depth {
            0 => {
                log::warn!("EndFrame without a matching BeginFrame");
                false
            }
            1 => {
                self.depth = 0;
                self.phase = FramePhase::Idle;
                true
            }
            _ => {
                self.depth -= 1;
                false
            }
        }
    }
}
