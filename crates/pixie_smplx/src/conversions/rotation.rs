use crate::error::{Error, Result};
use ndarray as nd;
use smpl_utils::{
    array::ShapeExt,
    numerical::{nearest_rotation, rotmat_to_axis_angle},
    vector::{mat_from_row_slice, vec_from_slice, Vector3d},
};

/// Axis-angle of a row-major 3x3 block. The block is projected onto the
/// closest rotation first since PIXIE stores slightly non-orthonormal float32
/// matrices.
pub fn matrix_block_to_axis_angle(block: &[f64]) -> Vector3d {
    rotmat_to_axis_angle(&nearest_rotation(&mat_from_row_slice(block)))
}

/// Reads a single rotation stored either as a 3x3 matrix (with any number of
/// leading unit dimensions) or as 3 axis-angle values
/// # Errors
/// Will return ``Error::Shape`` for anything else
pub fn to_axis_angle<S, D>(field: &str, array: &nd::ArrayBase<S, D>) -> Result<Vector3d>
where
    S: nd::Data<Elem = f64>,
    D: nd::Dimension,
{
    let values = array.flat_values();
    if array.has_trailing_dims(&[3, 3]) {
        if values.len() != 9 {
            return Err(Error::shape(field, array.shape(), "a single 3x3 rotation matrix or 3 axis-angle values"));
        }
        return Ok(matrix_block_to_axis_angle(&values));
    }
    if values.len() == 3 {
        return Ok(vec_from_slice(&values));
    }
    Err(Error::shape(field, array.shape(), "a 3x3 rotation matrix or 3 axis-angle values"))
}
