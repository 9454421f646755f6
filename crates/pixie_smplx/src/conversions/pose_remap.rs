use super::{joint_block::JointBlock, root_fix::apply_root_fix, rotation::to_axis_angle};
use crate::{
    codec::record::PoseRecord,
    common::{
        metadata::{smplx_metadata, SmplxMetadata, BETAS_SOURCES, EXPRESSION_SOURCES, ROOT_SOURCES},
        params::SmplxParams,
        types::{FieldOrigin, RootFixConfig, SmplxField},
    },
    error::{Error, Result},
};
use log::info;
use ndarray as nd;
use smpl_utils::{array::ShapeExt, vector::Vector3d};

/// Will remap a PIXIE record to the SMPL-X layout. PIXIE stores rotations as
/// matrices and names some fields differently, SMPL-X wants one axis-angle
/// row per field.
pub struct PoseRemap {
    config: RootFixConfig,
    dest_metadata: SmplxMetadata,
}
impl PoseRemap {
    pub fn new(config: RootFixConfig) -> Self {
        Self {
            config,
            dest_metadata: smplx_metadata(),
        }
    }
    /// # Errors
    /// Will return ``Error::Shape`` for the first recognized field whose shape
    /// cannot be converted
    pub fn remap(&self, source: &PoseRecord) -> Result<SmplxParams> {
        info!(
            "converting PIXIE record ({} fields), root flip X: {}, root flip Z: {}",
            source.len(),
            self.config.flip_x,
            self.config.flip_z
        );
        let mut params = SmplxParams::new_zeros(&self.dest_metadata);

        let (root, origin) = self.root_orient(source)?;
        params.set(SmplxField::GlobalOrient, root, origin);

        for (field, name) in [
            (SmplxField::BodyPose, "body_pose"),
            (SmplxField::LeftHandPose, "left_hand_pose"),
            (SmplxField::RightHandPose, "right_hand_pose"),
            (SmplxField::JawPose, "jaw_pose"),
        ] {
            let num_joints = self.dest_metadata.num_joints(field).unwrap_or_default();
            let (row, origin) = JointBlock::new(name, num_joints).resolve(source.get(name))?;
            params.set(field, row, origin);
        }

        let (betas, origin) = self.coefficients(source, SmplxField::Betas, &BETAS_SOURCES);
        params.set(SmplxField::Betas, betas, origin);
        let (expression, origin) = self.coefficients(source, SmplxField::Expression, &EXPRESSION_SOURCES);
        params.set(SmplxField::Expression, expression, origin);

        let (transl, origin) = self.translation(source)?;
        params.set(SmplxField::Transl, transl, origin);
        Ok(params)
    }

    fn root_orient(&self, source: &PoseRecord) -> Result<(nd::Array2<f64>, FieldOrigin)> {
        let (raw, origin) = match source.first_of(&ROOT_SOURCES) {
            Some((name, array)) => {
                let aa = to_axis_angle(name, array)?;
                info!("global_orient: from {name} {:?} -> axis-angle [{:.4}, {:.4}, {:.4}]", array.shape(), aa.x, aa.y, aa.z);
                (aa, FieldOrigin::Source(name))
            }
            None => {
                info!("global_orient: no global_pose or global_orient, using zeros");
                (Vector3d::zeros(), FieldOrigin::Defaulted)
            }
        };
        let fixed = apply_root_fix(&raw, &self.config);
        if self.config.flip_x || self.config.flip_z {
            info!("global_orient: after root fix [{:.4}, {:.4}, {:.4}]", fixed.x, fixed.y, fixed.z);
        }
        Ok((nd::arr2(&[[fixed.x, fixed.y, fixed.z]]), origin))
    }

    /// Shape or expression coefficients are copied as they are, only reshaped
    /// to a single row
    fn coefficients(&self, source: &PoseRecord, field: SmplxField, names: &[&'static str]) -> (nd::Array2<f64>, FieldOrigin) {
        if let Some((name, array)) = source.first_of(names) {
            let row = array.to_batch_row();
            info!("{}: from {name} {:?} -> {:?}", field.as_ref(), array.shape(), row.shape());
            return (row, FieldOrigin::Source(name));
        }
        let width = self.dest_metadata.default_width(field);
        info!("{}: not found, using zeros (1, {width})", field.as_ref());
        (nd::Array2::zeros((1, width)), FieldOrigin::Defaulted)
    }

    fn translation(&self, source: &PoseRecord) -> Result<(nd::Array2<f64>, FieldOrigin)> {
        let width = self.dest_metadata.default_width(SmplxField::Transl);
        match source.get("transl") {
            Some(array) if array.len() == width => {
                info!("transl: from transl {:?} -> (1, {width})", array.shape());
                Ok((array.to_batch_row(), FieldOrigin::Source("transl")))
            }
            Some(array) => Err(Error::shape("transl", array.shape(), format!("{width} values"))),
            None => {
                info!("transl: not found, using zeros (1, {width})");
                Ok((nd::Array2::zeros((1, width)), FieldOrigin::Defaulted))
            }
        }
    }
}

/// Converts a PIXIE record into SMPL-X parameters
/// # Errors
/// Will return ``Error::Shape`` if a recognized field has an unusable shape
pub fn convert(source: &PoseRecord, config: &RootFixConfig) -> Result<SmplxParams> {
    PoseRemap::new(*config).remap(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::prelude::*;
    use smpl_utils::numerical::{axis_angle_to_rotmat, batch_rodrigues};
    use smpl_utils::vector::Matrix3d;
    use std::f64::consts::PI;

    fn matrices(rotations: &[Vector3d]) -> nd::ArrayD<f64> {
        let poses = nd::Array2::from_shape_fn((rotations.len(), 3), |(j, k)| rotations[j][k]);
        batch_rodrigues(&poses).into_dyn()
    }

    #[test]
    fn empty_record_gives_defaults() {
        let params = convert(&PoseRecord::default(), &RootFixConfig::new(false, false)).unwrap();
        assert_eq!(params, SmplxParams::default());
    }

    #[test]
    fn empty_record_with_root_fix() {
        let params = convert(&PoseRecord::default(), &RootFixConfig::default()).unwrap();
        let root = Vector3d::new(params.global_orient[[0, 0]], params.global_orient[[0, 1]], params.global_orient[[0, 2]]);
        assert_abs_diff_eq!(
            axis_angle_to_rotmat(&root),
            Matrix3d::from_diagonal(&Vector3d::new(1.0, -1.0, -1.0)),
            epsilon = 1e-9
        );
        assert_eq!(params.origins[SmplxField::GlobalOrient], FieldOrigin::Defaulted);
        assert_eq!(params.body_pose, nd::Array2::<f64>::zeros((1, 63)));
    }

    #[test]
    fn global_pose_preferred_over_global_orient() {
        let mut record = PoseRecord::default();
        record.insert("global_pose", matrices(&[Vector3d::new(0.0, 0.4, 0.0)]));
        record.insert("global_orient", array![[9.0, 9.0, 9.0]].into_dyn());
        let params = convert(&record, &RootFixConfig::new(false, false)).unwrap();
        assert_abs_diff_eq!(params.global_orient[[0, 1]], 0.4, epsilon = 1e-9);
        assert_eq!(params.origins[SmplxField::GlobalOrient], FieldOrigin::Source("global_pose"));
    }

    #[test]
    fn pixie_root_is_upright_after_fix() {
        let mut record = PoseRecord::default();
        record.insert("global_pose", matrices(&[Vector3d::new(PI, 0.0, 0.0)]));
        let params = convert(&record, &RootFixConfig::default()).unwrap();
        for v in &params.global_orient {
            assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn shape_preferred_over_betas() {
        let mut record = PoseRecord::default();
        record.insert("shape", array![[1.0, 2.0, 3.0]].into_dyn());
        record.insert("betas", nd::Array2::from_elem((1, 10), 7.0).into_dyn());
        record.insert("expression", array![0.5, 0.25].into_dyn());
        let params = convert(&record, &RootFixConfig::default()).unwrap();
        assert_eq!(params.betas, array![[1.0, 2.0, 3.0]]);
        assert_eq!(params.origins[SmplxField::Betas], FieldOrigin::Source("shape"));
        assert_eq!(params.expression, array![[0.5, 0.25]]);
        assert_eq!(params.origins[SmplxField::Expression], FieldOrigin::Source("expression"));
    }

    #[test]
    fn transl_is_never_rotated() {
        let mut record = PoseRecord::default();
        record.insert("transl", array![0.1, 0.2, 0.3].into_dyn());
        let params = convert(&record, &RootFixConfig::new(true, true)).unwrap();
        assert_eq!(params.transl, array![[0.1, 0.2, 0.3]]);
        record.insert("transl", array![0.1, 0.2].into_dyn());
        assert!(matches!(convert(&record, &RootFixConfig::default()), Err(Error::Shape { .. })));
    }

    #[test]
    fn body_and_hands_converted_independently() {
        let mut record = PoseRecord::default();
        let mut body = vec![Vector3d::zeros(); 21];
        body[3] = Vector3d::new(0.0, 0.0, -0.6);
        record.insert("body_pose", matrices(&body));
        record.insert("right_hand_pose", nd::Array1::<f64>::from_elem(45, 0.01).into_dyn());
        let params = convert(&record, &RootFixConfig::default()).unwrap();
        assert_abs_diff_eq!(params.body_pose[[0, 11]], -0.6, epsilon = 1e-9);
        assert_eq!(params.left_hand_pose, nd::Array2::<f64>::zeros((1, 45)));
        assert_eq!(params.right_hand_pose, nd::Array2::<f64>::from_elem((1, 45), 0.01));
        assert_eq!(params.origins[SmplxField::LeftHandPose], FieldOrigin::Defaulted);
    }

    #[test]
    fn bad_body_shape_is_an_error() {
        let mut record = PoseRecord::default();
        record.insert("body_pose", nd::Array2::<f64>::zeros((20, 3)).into_dyn());
        match convert(&record, &RootFixConfig::default()) {
            Err(Error::Shape { field, shape, .. }) => {
                assert_eq!(field, "body_pose");
                assert_eq!(shape, vec![20, 3]);
            }
            other => panic!("expected a shape error, got {other:?}"),
        }
    }
}
