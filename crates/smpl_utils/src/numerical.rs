use crate::vector::{Matrix3d, Vector3d};
use nalgebra as na;
use ndarray as nd;
use ndarray::prelude::*;
use std::f64::consts::PI;

/// Below this angle the rotation vector is read straight off the
/// skew-symmetric part, which is exactly zero for the identity
const SMALL_ANGLE: f64 = 1e-6;
/// Closer than this to pi the skew-symmetric part vanishes and the axis is
/// recovered from the symmetric part instead
const NEAR_PI: f64 = 1e-3;

fn skew(v: &Vector3d) -> Matrix3d {
    Matrix3d::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

/// Rodrigues formula for a single rotation vector
pub fn axis_angle_to_rotmat(axis_angle: &Vector3d) -> Matrix3d {
    let angle = axis_angle.norm();
    if angle == 0.0 {
        return Matrix3d::identity();
    }
    let k = skew(&(axis_angle / angle));
    Matrix3d::identity() + k * angle.sin() + k * k * (1.0 - angle.cos())
}

pub fn batch_rodrigues(full_pose: &nd::Array2<f64>) -> nd::Array3<f64> {
    // Calculates the rotation matrices for a batch of rotation vectors
    let mut rotations_per_join = nd::Array3::<f64>::zeros((full_pose.shape()[0], 3, 3));
    for (idx, v) in full_pose.axis_iter(nd::Axis(0)).enumerate() {
        let rot = axis_angle_to_rotmat(&Vector3d::new(v[0], v[1], v[2]));
        for ((r, c), val) in rotations_per_join.slice_mut(s![idx, .., ..]).indexed_iter_mut() {
            *val = rot[(r, c)];
        }
    }
    rotations_per_join
}

/// Converts a rotation matrix to a rotation vector (axis * angle).
///
/// The angle comes from the trace, the axis from the skew-symmetric part.
/// Near pi the skew-symmetric part is ~0 so the axis is taken from
/// ``(sym(R) - cos * I) / (1 - cos) = a * a^T``, using the column with the
/// largest diagonal entry (always >= 1/3, so there is no division by zero).
/// The sign is picked to agree with whatever is left of the skew-symmetric
/// part.
pub fn rotmat_to_axis_angle(rot: &Matrix3d) -> Vector3d {
    let cos = ((rot.trace() - 1.0) / 2.0).clamp(-1.0, 1.0);
    let angle = cos.acos();
    // axis * sin(angle)
    let skew_half = Vector3d::new(rot[(2, 1)] - rot[(1, 2)], rot[(0, 2)] - rot[(2, 0)], rot[(1, 0)] - rot[(0, 1)]) * 0.5;

    if angle < SMALL_ANGLE {
        return skew_half;
    }
    if PI - angle < NEAR_PI {
        let sym = (rot + rot.transpose()) * 0.5;
        let outer = (sym - Matrix3d::identity() * cos) / (1.0 - cos);
        let diag = outer.diagonal();
        let col = diag.imax();
        let mut axis: Vector3d = outer.column(col) / diag[col].max(f64::EPSILON).sqrt();
        axis.normalize_mut();
        if axis.dot(&skew_half) < 0.0 {
            axis = -axis;
        }
        return axis * angle;
    }
    skew_half * (angle / angle.sin())
}

/// Projects a 3x3 matrix onto the closest proper rotation using the SVD.
/// Matrices coming out of a network or stored as f32 are only approximately
/// orthonormal.
pub fn nearest_rotation(mat: &Matrix3d) -> Matrix3d {
    let svd = mat.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return *mat;
    };
    let rot = u * v_t;
    if rot.determinant() < 0.0 {
        let mut u = u;
        for i in 0..3 {
            u[(i, 2)] = -u[(i, 2)];
        }
        return u * v_t;
    }
    rot
}

/// Splits a rotation vector into its angle (radians) and unit axis. The axis
/// is undefined for the zero rotation.
pub fn decompose_axis_angle(axis_angle: &Vector3d) -> (f64, Option<na::Unit<Vector3d>>) {
    let angle = axis_angle.norm();
    (angle, na::Unit::try_new(*axis_angle, 1e-12))
}
