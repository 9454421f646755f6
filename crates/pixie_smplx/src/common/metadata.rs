use super::types::SmplxField;

pub const NUM_BODY_JOINTS: usize = 21;
pub const NUM_HAND_JOINTS: usize = 15;
pub const NUM_JAW_JOINTS: usize = 1;
pub const SHAPE_SPACE_DIM: usize = 10;
pub const EXPRESSION_SPACE_DIM: usize = 50;

/// Candidate source fields for each output field, most preferred first
pub const ROOT_SOURCES: [&str; 2] = ["global_pose", "global_orient"];
pub const BETAS_SOURCES: [&str; 2] = ["shape", "betas"];
pub const EXPRESSION_SOURCES: [&str; 2] = ["exp", "expression"];

/// Fields the inspection view always reports on, present or not
pub const CORE_FIELDS: [&str; 12] = [
    "global_pose",
    "global_orient",
    "body_pose",
    "left_hand_pose",
    "right_hand_pose",
    "jaw_pose",
    "betas",
    "expression",
    "shape",
    "exp",
    "transl",
    "body_cam",
];

#[derive(Clone, Debug)]
pub struct SmplxMetadata {
    pub num_body_joints: usize,
    pub num_hand_joints: usize,
    pub num_jaw_joints: usize,
    pub shape_space_dim: usize,
    pub expression_space_dim: usize,
}
impl Default for SmplxMetadata {
    fn default() -> Self {
        smplx_metadata()
    }
}
impl SmplxMetadata {
    /// Number of values an output field has when it has to be filled with
    /// zeros
    pub fn default_width(&self, field: SmplxField) -> usize {
        match field {
            SmplxField::GlobalOrient | SmplxField::Transl => 3,
            SmplxField::BodyPose => self.num_body_joints * 3,
            SmplxField::LeftHandPose | SmplxField::RightHandPose => self.num_hand_joints * 3,
            SmplxField::JawPose => self.num_jaw_joints * 3,
            SmplxField::Betas => self.shape_space_dim,
            SmplxField::Expression => self.expression_space_dim,
        }
    }
    /// Joint count of the fields converted block by block
    pub fn num_joints(&self, field: SmplxField) -> Option<usize> {
        match field {
            SmplxField::BodyPose => Some(self.num_body_joints),
            SmplxField::LeftHandPose | SmplxField::RightHandPose => Some(self.num_hand_joints),
            SmplxField::JawPose => Some(self.num_jaw_joints),
            _ => None,
        }
    }
}

pub fn smplx_metadata() -> SmplxMetadata {
    SmplxMetadata {
        num_body_joints: NUM_BODY_JOINTS,
        num_hand_joints: NUM_HAND_JOINTS,
        num_jaw_joints: NUM_JAW_JOINTS,
        shape_space_dim: SHAPE_SPACE_DIM,
        expression_space_dim: EXPRESSION_SPACE_DIM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_widths() {
        let meta = smplx_metadata();
        assert_eq!(meta.default_width(SmplxField::BodyPose), 63);
        assert_eq!(meta.default_width(SmplxField::LeftHandPose), 45);
        assert_eq!(meta.default_width(SmplxField::JawPose), 3);
        assert_eq!(meta.default_width(SmplxField::Betas), 10);
        assert_eq!(meta.default_width(SmplxField::Expression), 50);
        assert_eq!(meta.default_width(SmplxField::Transl), 3);
        assert_eq!(meta.num_joints(SmplxField::Betas), None);
    }
}
