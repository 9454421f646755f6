use na::{Matrix3, Vector3};
extern crate nalgebra as na;

pub type Vector3d = Vector3<f64>;
pub type Matrix3d = Matrix3<f64>;

/// Builds a vector from the first 3 values of a slice
pub fn vec_from_slice(v: &[f64]) -> Vector3d {
    Vector3d::new(v[0], v[1], v[2])
}
pub fn to_fixed_vec3(v: &Vector3d) -> [f64; 3] {
    [v.x, v.y, v.z]
}
/// Builds a matrix from 9 values in row-major order, which is the order
/// ndarray iterates a (3,3) block in
pub fn mat_from_row_slice(v: &[f64]) -> Matrix3d {
    Matrix3d::from_row_slice(&v[..9])
}
pub fn mat_to_row_vec(m: &Matrix3d) -> Vec<f64> {
    m.transpose().iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_major_round_trip() {
        let values: Vec<f64> = (0..9).map(f64::from).collect();
        let m = mat_from_row_slice(&values);
        assert_eq!(m[(0, 1)], 1.0);
        assert_eq!(m[(1, 0)], 3.0);
        assert_eq!(mat_to_row_vec(&m), values);
    }

    #[test]
    fn fixed_vec() {
        let v = vec_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(to_fixed_vec3(&v), [1.0, 2.0, 3.0]);
    }
}
