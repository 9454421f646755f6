use enum_map::Enum;
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumIter};

/// Fields of an SMPL-X parameter record, in the order they are written
#[derive(Clone, Copy, Debug, Enum, EnumIter, AsRefStr, Display, PartialEq, Eq, Hash, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SmplxField {
    GlobalOrient,
    BodyPose,
    LeftHandPose,
    RightHandPose,
    JawPose,
    Betas,
    Expression,
    Transl,
}

/// Where the value of an output field came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum FieldOrigin {
    /// Filled with zeros of the default width
    #[default]
    Defaulted,
    /// Converted or copied from the named source field
    Source(&'static str),
}

/// 180 degree corrections applied to the root orientation only. The X flip
/// turns PIXIE's camera frame into the upright frame the rig expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RootFixConfig {
    pub flip_x: bool,
    pub flip_z: bool,
}
impl Default for RootFixConfig {
    fn default() -> Self {
        Self { flip_x: true, flip_z: false }
    }
}
impl RootFixConfig {
    pub fn new(flip_x: bool, flip_z: bool) -> Self {
        Self { flip_x, flip_z }
    }
    /// Tag inserted in the output file name, ``_rootX180`` or ``_nofix``
    /// followed by ``_Z180`` when the Z flip is on
    pub fn suffix(&self) -> String {
        let mut suffix = String::from(if self.flip_x { "_rootX180" } else { "_nofix" });
        if self.flip_z {
            suffix.push_str("_Z180");
        }
        suffix
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn field_names_follow_output_order() {
        let names: Vec<String> = SmplxField::iter().map(|f| f.as_ref().to_string()).collect();
        assert_eq!(
            names,
            [
                "global_orient",
                "body_pose",
                "left_hand_pose",
                "right_hand_pose",
                "jaw_pose",
                "betas",
                "expression",
                "transl"
            ]
        );
    }

    #[test]
    fn suffixes() {
        assert_eq!(RootFixConfig::default().suffix(), "_rootX180");
        assert_eq!(RootFixConfig::new(false, false).suffix(), "_nofix");
        assert_eq!(RootFixConfig::new(true, true).suffix(), "_rootX180_Z180");
        assert_eq!(RootFixConfig::new(false, true).suffix(), "_nofix_Z180");
    }
}
