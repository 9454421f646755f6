use ndarray as nd;

/// Shape queries and reshapes that mirror what numpy code does with
/// ``arr.shape[-2:]`` and ``arr.reshape(1, -1)``
pub trait ShapeExt<T: Clone> {
    /// True if the last dimensions of the array are exactly ``dims``
    fn has_trailing_dims(&self, dims: &[usize]) -> bool;
    /// All the values in logical (row-major) order, regardless of the memory
    /// layout
    fn flat_values(&self) -> Vec<T>;
    /// Equivalent of ``arr.reshape(1, -1)``
    fn to_batch_row(&self) -> nd::Array2<T>;
}
impl<T: Clone, S: nd::Data<Elem = T>, D: nd::Dimension> ShapeExt<T> for nd::ArrayBase<S, D> {
    fn has_trailing_dims(&self, dims: &[usize]) -> bool {
        self.shape().ends_with(dims)
    }
    fn flat_values(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
    fn to_batch_row(&self) -> nd::Array2<T> {
        nd::Array1::from_vec(self.flat_values()).insert_axis(nd::Axis(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::prelude::*;

    #[test]
    fn trailing_dims() {
        let a = nd::Array3::<f64>::zeros((21, 3, 3)).into_dyn();
        assert!(a.has_trailing_dims(&[3, 3]));
        assert!(a.has_trailing_dims(&[21, 3, 3]));
        assert!(!a.has_trailing_dims(&[1, 21, 3, 3]));
        let b = nd::Array1::<f64>::zeros(3);
        assert!(!b.has_trailing_dims(&[3, 3]));
    }

    #[test]
    fn batch_row_is_row_major() {
        let a = array![[1.0, 2.0], [3.0, 4.0]];
        let row = a.t().to_batch_row();
        assert_eq!(row, array![[1.0, 3.0, 2.0, 4.0]]);
        assert_eq!(a.to_batch_row().shape(), &[1, 4]);
    }
}
