//! Draw submission mode

use crate::render::api::{DeviceResult, DrawCall, GraphicsDevice};

/// How geometry reaches the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RenderPrim {
    /// Indexed triangle lists
    #[default]
    TriList,
    /// Every state and resource step runs but nothing is drawn
    Nil,
}

impl RenderPrim {
    /// Issue `call`, returning whether a draw reached the backend
    pub fn draw(self, device: &mut dyn GraphicsDevice, call: &DrawCall) -> DeviceResult<bool> {
        match self {
            Self::TriList => {
                if call.index_count == 0 {
                    return Ok(false);
                }
                device.draw_indexed(call)?;
                Ok(true)
            }
            Self::Nil => Ok(false),
        }
    }
}
