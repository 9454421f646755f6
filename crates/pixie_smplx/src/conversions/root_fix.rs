use crate::common::types::RootFixConfig;
use nalgebra as na;
use smpl_utils::{
    numerical::{axis_angle_to_rotmat, rotmat_to_axis_angle},
    vector::{Matrix3d, Vector3d},
};
use std::f64::consts::PI;

/// Left-multiplies the root rotation by a half turn about X and then by a
/// half turn about Z, each only when enabled. With both enabled the zero
/// rotation becomes ``Rz(pi) * Rx(pi)``, a half turn about Y.
pub fn apply_root_fix(axis_angle: &Vector3d, config: &RootFixConfig) -> Vector3d {
    let mut rot: Matrix3d = axis_angle_to_rotmat(axis_angle);
    if config.flip_x {
        rot = na::Rotation3::from_axis_angle(&na::Vector3::x_axis(), PI).matrix() * rot;
    }
    if config.flip_z {
        rot = na::Rotation3::from_axis_angle(&na::Vector3::z_axis(), PI).matrix() * rot;
    }
    rotmat_to_axis_angle(&rot)
}
