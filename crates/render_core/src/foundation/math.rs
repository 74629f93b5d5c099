//! Math utilities and types
//!
//! Provides the fundamental math types shared by the pipeline subsystems.

pub use nalgebra::{Matrix4, Vector3, Vector4};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Linear RGBA color
pub type Color = Vec4;

/// Math utility functions
pub mod utils {
    /// Linear interpolation
    pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
        a + (b - a) * t
    }

    /// Remap `value` from `[from_min, from_max]` into `[0, 1]`, clamped
    pub fn unit_remap(value: f32, from_min: f32, from_max: f32) -> f32 {
        let span = from_max - from_min;
        if span.abs() <= f32::EPSILON {
            return 0.0;
        }
        ((value - from_min) / span).clamp(0.0, 1.0)
    }

    /// Perceived brightness of a linear RGB color
    pub fn luminance(rgb: &super::Vec3) -> f32 {
        0.2126 * rgb.x + 0.7152 * rgb.y + 0.0722 * rgb.z
    }
}

/// Extension trait for Mat4 with camera and light-space constructors
pub trait Mat4Ext {
    /// Create a right-handed look-at view matrix
    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4;

    /// Create a perspective projection with depth mapped to `[0, 1]`
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4;

    /// Create an orthographic projection with depth mapped to `[0, 1]`
    fn orthographic(half_width: f32, half_height: f32, near: f32, far: f32) -> Mat4;

    /// Matrix mapping clip space `[-1, 1]` xy into texture space `[0, 1]`
    fn clip_to_texture() -> Mat4;
}

impl Mat4Ext for Mat4 {
    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
        let forward = (target - eye).normalize();
        // Fall back to another up axis when looking straight along `up`
        let up = if forward.cross(&up).norm_squared() < 1e-6 {
            Vec3::new(1.0, 0.0, 0.0)
        } else {
            up
        };
        let right = forward.cross(&up).normalize();
        let camera_up = right.cross(&forward);

        let translation = Mat4::new(
            1.0, 0.0, 0.0, -eye.x,
            0.0, 1.0, 0.0, -eye.y,
            0.0, 0.0, 1.0, -eye.z,
            0.0, 0.0, 0.0, 1.0,
        );

        let rotation = Mat4::new(
            right.x, right.y, right.z, 0.0,
            camera_up.x, camera_up.y, camera_up.z, 0.0,
            -forward.x, -forward.y, -forward.z, 0.0,
            0.0, 0.0, 0.0, 1.0,
        );

        rotation * translation
    }

    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        let tan_half_fovy = (fov_y * 0.5).tan();
        let mut result = Mat4::zeros();

        result[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
        result[(1, 1)] = 1.0 / tan_half_fovy;
        result[(2, 2)] = far / (near - far);
        result[(2, 3)] = -(near * far) / (far - near);
        result[(3, 2)] = -1.0;

        result
    }

    fn orthographic(half_width: f32, half_height: f32, near: f32, far: f32) -> Mat4 {
        let mut result = Mat4::identity();
        result[(0, 0)] = 1.0 / half_width;
        result[(1, 1)] = 1.0 / half_height;
        result[(2, 2)] = 1.0 / (near - far);
        result[(2, 3)] = near / (near - far);
        result
    }

    fn clip_to_texture() -> Mat4 {
        Mat4::new(
            0.5, 0.0, 0.0, 0.5,
            0.0, -0.5, 0.0, 0.5,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    }
}
