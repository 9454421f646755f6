use super::rotation::matrix_block_to_axis_angle;
use crate::{
    common::types::FieldOrigin,
    error::{Error, Result},
};
use log::info;
use ndarray as nd;
use smpl_utils::array::ShapeExt;

/// A run of consecutive joints stored under one source field, e.g. the 21
/// body joints
#[derive(Clone, Copy, Debug)]
pub struct JointBlock {
    pub field: &'static str,
    pub num_joints: usize,
}

impl JointBlock {
    pub fn new(field: &'static str, num_joints: usize) -> Self {
        Self { field, num_joints }
    }

    pub fn width(&self) -> usize {
        self.num_joints * 3
    }

    /// Converts the joints to a ``(1, num_joints * 3)`` axis-angle row.
    /// Rotation matrices (trailing ``3x3``) are converted joint by joint,
    /// anything holding exactly ``num_joints * 3`` values is taken as
    /// axis-angle already.
    /// # Errors
    /// Will return ``Error::Shape`` if the array fits neither layout
    pub fn convert<S, D>(&self, array: &nd::ArrayBase<S, D>) -> Result<nd::Array2<f64>>
    where
        S: nd::Data<Elem = f64>,
        D: nd::Dimension,
    {
        if array.has_trailing_dims(&[3, 3]) {
            let values = array.flat_values();
            if values.len() != self.num_joints * 9 {
                return Err(Error::shape(self.field, array.shape(), format!("{} 3x3 rotation matrices", self.num_joints)));
            }
            let mut row = nd::Array2::<f64>::zeros((1, self.width()));
            for (joint, block) in values.chunks_exact(9).enumerate() {
                let aa = matrix_block_to_axis_angle(block);
                for (k, v) in aa.iter().enumerate() {
                    row[[0, joint * 3 + k]] = *v;
                }
            }
            return Ok(row);
        }
        if array.len() == self.width() {
            return Ok(array.to_batch_row());
        }
        Err(Error::shape(
            self.field,
            array.shape(),
            format!("{} 3x3 rotation matrices or {} axis-angle values", self.num_joints, self.width()),
        ))
    }

    /// Converts the source array when there is one, zeros otherwise. Logs the
    /// decision.
    /// # Errors
    /// Will return ``Error::Shape`` if the present array has an unusable shape
    pub fn resolve(&self, array: Option<&nd::ArrayD<f64>>) -> Result<(nd::Array2<f64>, FieldOrigin)> {
        match array {
            Some(array) => {
                let row = self.convert(array)?;
                info!("{}: converted {:?} -> {:?}", self.field, array.shape(), row.shape());
                Ok((row, FieldOrigin::Source(self.field)))
            }
            None => {
                info!("{}: not found, using zeros (1, {})", self.field, self.width());
                Ok((nd::Array2::zeros((1, self.width())), FieldOrigin::Defaulted))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use smpl_utils::{
        numerical::axis_angle_to_rotmat,
        vector::{mat_to_row_vec, Vector3d},
    };

    fn stacked(rotations: &[Vector3d], leading: &[usize]) -> nd::ArrayD<f64> {
        let values: Vec<f64> = rotations.iter().flat_map(|v| mat_to_row_vec(&axis_angle_to_rotmat(v))).collect();
        let mut shape = leading.to_vec();
        shape.extend([3, 3]);
        nd::ArrayD::from_shape_vec(nd::IxDyn(&shape), values).unwrap()
    }

    #[test]
    fn identity_body_is_zeros() {
        let body = stacked(&[Vector3d::zeros(); 21], &[21]);
        let row = JointBlock::new("body_pose", 21).convert(&body).unwrap();
        assert_eq!(row.shape(), &[1, 63]);
        assert!(row.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn joints_keep_their_order() {
        let mut rots = vec![Vector3d::zeros(); 15];
        rots[0] = Vector3d::new(0.0, 0.3, 0.0);
        rots[14] = Vector3d::new(-0.2, 0.0, 0.1);
        let hand = stacked(&rots, &[1, 15]);
        let row = JointBlock::new("left_hand_pose", 15).convert(&hand).unwrap();
        assert_eq!(row.shape(), &[1, 45]);
        assert_abs_diff_eq!(row[[0, 1]], 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(row[[0, 42]], -0.2, epsilon = 1e-9);
        assert_abs_diff_eq!(row[[0, 44]], 0.1, epsilon = 1e-9);
    }

    #[test]
    fn jaw_as_bare_matrix() {
        let jaw = stacked(&[Vector3d::new(0.2, 0.0, 0.0)], &[]);
        let row = JointBlock::new("jaw_pose", 1).convert(&jaw).unwrap();
        assert_eq!(row.shape(), &[1, 3]);
        assert_abs_diff_eq!(row[[0, 0]], 0.2, epsilon = 1e-9);
    }

    #[test]
    fn axis_angle_reshaped() {
        let flat = nd::Array1::from_iter((0..63).map(f64::from)).into_dyn();
        let row = JointBlock::new("body_pose", 21).convert(&flat).unwrap();
        assert_eq!(row.shape(), &[1, 63]);
        assert_eq!(row[[0, 62]], 62.0);
        let grid = nd::Array2::from_shape_fn((21, 3), |(j, k)| (j * 3 + k) as f64);
        assert_eq!(JointBlock::new("body_pose", 21).convert(&grid).unwrap(), row);
    }

    #[test]
    fn wrong_counts() {
        let block = JointBlock::new("body_pose", 21);
        assert!(matches!(block.convert(&stacked(&[Vector3d::zeros(); 20], &[20])), Err(Error::Shape { .. })));
        assert!(matches!(block.convert(&nd::Array1::<f64>::zeros(60)), Err(Error::Shape { .. })));
    }

    #[test]
    fn absent_is_zeros() {
        let (row, origin) = JointBlock::new("right_hand_pose", 15).resolve(None).unwrap();
        assert_eq!(row, nd::Array2::<f64>::zeros((1, 45)));
        assert_eq!(origin, FieldOrigin::Defaulted);
    }
}
