use super::{
    metadata::SmplxMetadata,
    types::{FieldOrigin, SmplxField},
};
use enum_map::EnumMap;
use ndarray as nd;
use strum::IntoEnumIterator;

/// Parameters in the SMPL-X layout. Every field is a ``(1, n)`` array.
#[derive(Clone, Debug, PartialEq)]
pub struct SmplxParams {
    pub global_orient: nd::Array2<f64>,
    pub body_pose: nd::Array2<f64>,
    pub left_hand_pose: nd::Array2<f64>,
    pub right_hand_pose: nd::Array2<f64>,
    pub jaw_pose: nd::Array2<f64>,
    pub betas: nd::Array2<f64>,
    pub expression: nd::Array2<f64>,
    pub transl: nd::Array2<f64>,
    /// Provenance of each field
    pub origins: EnumMap<SmplxField, FieldOrigin>,
}

impl Default for SmplxParams {
    fn default() -> Self {
        Self::new_zeros(&SmplxMetadata::default())
    }
}

impl SmplxParams {
    /// All fields zero at their default width
    pub fn new_zeros(metadata: &SmplxMetadata) -> Self {
        let zeros = |field| nd::Array2::<f64>::zeros((1, metadata.default_width(field)));
        Self {
            global_orient: zeros(SmplxField::GlobalOrient),
            body_pose: zeros(SmplxField::BodyPose),
            left_hand_pose: zeros(SmplxField::LeftHandPose),
            right_hand_pose: zeros(SmplxField::RightHandPose),
            jaw_pose: zeros(SmplxField::JawPose),
            betas: zeros(SmplxField::Betas),
            expression: zeros(SmplxField::Expression),
            transl: zeros(SmplxField::Transl),
            origins: EnumMap::default(),
        }
    }

    pub fn get(&self, field: SmplxField) -> &nd::Array2<f64> {
        match field {
            SmplxField::GlobalOrient => &self.global_orient,
            SmplxField::BodyPose => &self.body_pose,
            SmplxField::LeftHandPose => &self.left_hand_pose,
            SmplxField::RightHandPose => &self.right_hand_pose,
            SmplxField::JawPose => &self.jaw_pose,
            SmplxField::Betas => &self.betas,
            SmplxField::Expression => &self.expression,
            SmplxField::Transl => &self.transl,
        }
    }

    pub fn get_mut(&mut self, field: SmplxField) -> &mut nd::Array2<f64> {
        match field {
            SmplxField::GlobalOrient => &mut self.global_orient,
            SmplxField::BodyPose => &mut self.body_pose,
            SmplxField::LeftHandPose => &mut self.left_hand_pose,
            SmplxField::RightHandPose => &mut self.right_hand_pose,
            SmplxField::JawPose => &mut self.jaw_pose,
            SmplxField::Betas => &mut self.betas,
            SmplxField::Expression => &mut self.expression,
            SmplxField::Transl => &mut self.transl,
        }
    }

    /// Sets a field together with where it came from
    pub fn set(&mut self, field: SmplxField, value: nd::Array2<f64>, origin: FieldOrigin) {
        *self.get_mut(field) = value;
        self.origins[field] = origin;
    }

    /// Fields in output order
    pub fn iter(&self) -> impl Iterator<Item = (SmplxField, &nd::Array2<f64>)> + '_ {
        SmplxField::iter().map(move |field| (field, self.get(field)))
    }
}
