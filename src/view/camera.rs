//! Cameras and projections used by the render views.

use glam::{Mat4, Vec3};

/// Projection of a view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    /// Screen-space projection with the origin in the top-left corner.
    Screen {
        width: f32,
        height: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn screen(width: f32, height: f32) -> Self {
        Projection::Screen {
            width,
            height,
            near: -100.0,
            far: 100.0,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Screen {
                width,
                height,
                near,
                far,
            } => Mat4::orthographic_rh(0.0, width, height, 0.0, near, far),
        }
    }

    /// Follow a framebuffer resize. Zero-sized framebuffers are ignored.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        match self {
            Projection::Perspective { aspect, .. } => *aspect = width as f32 / height as f32,
            Projection::Screen {
                width: w,
                height: h,
                ..
            } => {
                *w = width as f32;
                *h = height as f32;
            }
        }
    }
}

/// Viewer position and orientation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 2.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
        }
    }
}

impl Camera {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            up: Vec3::Y,
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.target, self.up)
    }

    /// View matrix without translation, for geometry that follows the camera.
    pub fn rotation_matrix(&self) -> Mat4 {
        let mut view = self.view_matrix();
        view.w_axis = glam::Vec4::W;
        view
    }

    pub fn forward(&self) -> Vec3 {
        (self.target - self.position).normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_updates_aspect() {
        let mut projection = Projection::perspective(60.0, 1.0, 0.1, 100.0);
        projection.resize(1920, 1080);
        match projection {
            Projection::Perspective { aspect, .. } => assert!((aspect - 16.0 / 9.0).abs() < 1e-6),
            _ => unreachable!(),
        }
        projection.resize(0, 1080);
        assert!(matches!(projection, Projection::Perspective { .. }));
    }

    #[test]
    fn rotation_matrix_drops_translation() {
        let camera = Camera::new(Vec3::new(10.0, 5.0, 3.0), Vec3::ZERO);
        let rotation = camera.rotation_matrix();
        assert_eq!(rotation.w_axis, glam::Vec4::W);
        assert_eq!(rotation.x_axis, camera.view_matrix().x_axis);
    }
}
