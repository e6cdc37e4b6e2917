//! Camera transforms and the input gestures that mutate them.

use nalgebra::Unit;
use winit::keyboard::KeyCode;

use crate::{Mat4, Point3, Vec3};

const EYE: [f32; 3] = [2.0, 2.0, 2.0];
const FOV_Y_DEGREES: f32 = 30.0;
const NEAR_PLANE: f32 = 0.1;
const FAR_PLANE: f32 = 100.0;

/// Model, view and projection as uploaded to the vertex shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CameraSettings {
    pub aspect: f32,
    /// Degrees per key press or repeat.
    pub rotate_step: f32,
    /// Scale per scroll notch; scrolling back applies the reciprocal.
    pub zoom_factor: f32,
}

/// A discrete camera gesture.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CameraInput {
    RotateLeft,
    RotateRight,
    RotateUp,
    RotateDown,
    ZoomIn,
    ZoomOut,
}

impl CameraInput {
    pub fn from_key(key: KeyCode) -> Option<Self> {
        match key {
            KeyCode::ArrowLeft => Some(Self::RotateLeft),
            KeyCode::ArrowRight => Some(Self::RotateRight),
            KeyCode::ArrowUp => Some(Self::RotateUp),
            KeyCode::ArrowDown => Some(Self::RotateDown),
            _ => None,
        }
    }

    pub fn from_scroll(delta_y: f32) -> Option<Self> {
        if delta_y > 0.0 {
            Some(Self::ZoomIn)
        } else if delta_y < 0.0 {
            Some(Self::ZoomOut)
        } else {
            None
        }
    }
}

/// Independent model/view/projection matrices. Only `model` changes after
/// construction, and only through [`rotate`](Self::rotate) and
/// [`zoom`](Self::zoom).
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CameraState {
    model: Mat4,
    view: Mat4,
    proj: Mat4,
    settings: CameraSettings,
}

impl CameraState {
    pub fn new(settings: CameraSettings) -> Self {
        let eye = Point3::new(EYE[0], EYE[1], EYE[2]);
        let view = Mat4::look_at_rh(&eye, &Point3::origin(), &Vec3::z());

        let mut proj = Mat4::new_perspective(
            settings.aspect,
            FOV_Y_DEGREES.to_radians(),
            NEAR_PLANE,
            FAR_PLANE,
        );
        proj[(1, 1)] *= -1.0; // Vulkan Y-flip

        // Remap OpenGL's [-1, 1] clip depth to Vulkan's [0, 1].
        let vk_depth_correction = Mat4::new(
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 0.5, 0.5, //
            0.0, 0.0, 0.0, 1.0,
        );

        Self {
            model: Mat4::identity(),
            view,
            proj: vk_depth_correction * proj,
            settings,
        }
    }

    /// Post-multiplies the model matrix by a rotation about `axis` through the origin.
    pub fn rotate(&mut self, axis: &Unit<Vec3>, angle_degrees: f32) {
        self.model *= Mat4::from_axis_angle(axis, angle_degrees.to_radians());
    }

    /// Post-multiplies the model matrix by a uniform scale: the zoom factor
    /// for a positive direction, its reciprocal for a negative one.
    pub fn zoom(&mut self, direction: f32) {
        let factor = if direction > 0.0 {
            self.settings.zoom_factor
        } else if direction < 0.0 {
            self.settings.zoom_factor.recip()
        } else {
            return;
        };
        self.model *= Mat4::new_scaling(factor);
    }

    pub fn apply(&mut self, input: CameraInput) {
        let step = self.settings.rotate_step;
        match input {
            CameraInput::RotateLeft => self.rotate(&Vec3::z_axis(), -step),
            CameraInput::RotateRight => self.rotate(&Vec3::z_axis(), step),
            CameraInput::RotateUp => self.rotate(&Vec3::x_axis(), -step),
            CameraInput::RotateDown => self.rotate(&Vec3::x_axis(), step),
            CameraInput::ZoomIn => self.zoom(1.0),
            CameraInput::ZoomOut => self.zoom(-1.0),
        }
    }

    /// Snapshot copied into a frame's uniform buffer.
    pub fn uniform(&self) -> UniformBufferObject {
        UniformBufferObject {
            model: self.model,
            view: self.view,
            proj: self.proj,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraState {
        CameraState::new(CameraSettings {
            aspect: 640.0 / 480.0,
            rotate_step: 5.0,
            zoom_factor: 1.1,
        })
    }

    #[test]
    fn starts_with_identity_model() {
        assert_eq!(camera().model, Mat4::identity());
    }

    #[test]
    fn rotation_undone_by_inverse_angle() {
        let mut cam = camera();
        cam.zoom(1.0);
        let before = cam.model;

        let axis = Unit::new_normalize(Vec3::new(1.0, 2.0, -0.5));
        cam.rotate(&axis, 37.0);
        assert!((cam.model - before).norm() > 1e-3);
        cam.rotate(&axis, -37.0);

        assert_relative_eq!(cam.model, before, epsilon = 1e-5);
    }

    #[test]
    fn zoom_undone_by_opposite_direction() {
        let mut cam = camera();
        cam.rotate(&Vec3::z_axis(), 15.0);
        let before = cam.model;

        cam.zoom(1.0);
        let stretched = cam.model.transform_vector(&Vec3::x()).norm();
        assert_relative_eq!(stretched, 1.1, epsilon = 1e-5);
        cam.zoom(-1.0);

        assert_relative_eq!(cam.model, before, epsilon = 1e-5);
    }

    #[test]
    fn zero_scroll_is_ignored() {
        let mut cam = camera();
        cam.zoom(0.0);
        assert_eq!(cam.model, Mat4::identity());
        assert_eq!(CameraInput::from_scroll(0.0), None);
    }

    #[test]
    fn opposite_arrows_cancel() {
        let mut cam = camera();
        cam.apply(CameraInput::RotateLeft);
        cam.apply(CameraInput::RotateUp);
        cam.apply(CameraInput::RotateDown);
        cam.apply(CameraInput::RotateRight);
        assert_relative_eq!(cam.model, Mat4::identity(), epsilon = 1e-5);
    }

    #[test]
    fn horizontal_arrows_keep_the_vertical_axis() {
        let mut cam = camera();
        cam.apply(CameraInput::RotateRight);
        let up = cam.model.transform_vector(&Vec3::z());
        assert_relative_eq!(up, Vec3::z(), epsilon = 1e-6);
    }

    #[test]
    fn key_and_scroll_mapping() {
        assert_eq!(CameraInput::from_key(KeyCode::ArrowLeft), Some(CameraInput::RotateLeft));
        assert_eq!(CameraInput::from_key(KeyCode::ArrowDown), Some(CameraInput::RotateDown));
        assert_eq!(CameraInput::from_key(KeyCode::KeyW), None);
        assert_eq!(CameraInput::from_scroll(2.0), Some(CameraInput::ZoomIn));
        assert_eq!(CameraInput::from_scroll(-0.5), Some(CameraInput::ZoomOut));
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let ubo = camera().uniform();
        assert!(ubo.proj[(1, 1)] < 0.0);
        assert!(ubo.proj[(0, 0)] > 0.0);
    }
}
