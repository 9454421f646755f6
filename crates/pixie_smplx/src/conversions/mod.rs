pub mod joint_block;
pub mod pose_remap;
pub mod root_fix;
pub mod rotation;
