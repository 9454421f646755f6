use crate::{codec::record::PoseRecord, common::metadata::CORE_FIELDS, conversions::rotation::to_axis_angle};
use serde::Serialize;
use smpl_utils::{array::ShapeExt, numerical::decompose_axis_angle, vector::to_fixed_vec3};
use std::{
    fmt,
    path::{Path, PathBuf},
};

/// What the record holds under one of the fields the converter cares about
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldStatus {
    Array { shape: Vec<usize> },
    /// Present, but not something numbers could be read from
    NonNumeric,
    Missing,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FieldSummary {
    pub name: &'static str,
    #[serde(flatten)]
    pub status: FieldStatus,
}

/// Sanity check of the root orientation before any fix is applied
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RootSummary {
    /// ``global_pose`` holds a rotation matrix
    Matrix { angle_deg: f64, axis: Option<[f64; 3]> },
    /// Only ``global_orient`` is there, with this many values
    AxisAngle { len: usize },
    Missing,
}

/// Read-only view of a loaded record, shown before converting
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct InspectionReport {
    pub file: Option<PathBuf>,
    pub size_bytes: Option<u64>,
    pub keys: Vec<String>,
    pub fields: Vec<FieldSummary>,
    pub root: RootSummary,
}

impl InspectionReport {
    pub fn new(record: &PoseRecord) -> Self {
        let fields = CORE_FIELDS
            .iter()
            .map(|&name| {
                let status = match record.get(name) {
                    Some(array) => FieldStatus::Array { shape: array.shape().to_vec() },
                    None if record.is_opaque(name) => FieldStatus::NonNumeric,
                    None => FieldStatus::Missing,
                };
                FieldSummary { name, status }
            })
            .collect();
        Self {
            file: None,
            size_bytes: None,
            keys: record.keys().into_iter().map(str::to_string).collect(),
            fields,
            root: Self::root_summary(record),
        }
    }

    /// Adds the file name and its size on disk
    #[must_use]
    pub fn with_source(mut self, path: &Path) -> Self {
        self.size_bytes = std::fs::metadata(path).ok().map(|m| m.len());
        self.file = Some(path.to_path_buf());
        self
    }

    fn root_summary(record: &PoseRecord) -> RootSummary {
        if let Some(pose) = record.get("global_pose").filter(|a| a.has_trailing_dims(&[3, 3])) {
            if let Ok(aa) = to_axis_angle("global_pose", pose) {
                let (angle, axis) = decompose_axis_angle(&aa);
                return RootSummary::Matrix {
                    angle_deg: angle.to_degrees(),
                    axis: axis.map(|a| to_fixed_vec3(&a)),
                };
            }
        }
        match record.get("global_orient") {
            Some(orient) => RootSummary::AxisAngle { len: orient.len() },
            None => RootSummary::Missing,
        }
    }
}

impl fmt::Display for InspectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.size_bytes) {
            (Some(file), Some(size)) => writeln!(f, "file: {} ({size} bytes)", file.display())?,
            (Some(file), None) => writeln!(f, "file: {}", file.display())?,
            _ => {}
        }
        writeln!(f, "keys ({}): {}", self.keys.len(), self.keys.join(", "))?;
        for field in &self.fields {
            match &field.status {
                FieldStatus::Array { shape } => writeln!(f, "  {:<16} {shape:?}", field.name)?,
                FieldStatus::NonNumeric => writeln!(f, "  {:<16} not numeric", field.name)?,
                FieldStatus::Missing => writeln!(f, "  {:<16} not found", field.name)?,
            }
        }
        match &self.root {
            RootSummary::Matrix { angle_deg, axis: Some(axis) } => write!(
                f,
                "global_pose rotation: {angle_deg:.2} deg about [{:.4}, {:.4}, {:.4}]",
                axis[0], axis[1], axis[2]
            ),
            RootSummary::Matrix { angle_deg, axis: None } => write!(f, "global_pose rotation: {angle_deg:.2} deg"),
            RootSummary::AxisAngle { len } => write!(f, "global_orient: {len} values"),
            RootSummary::Missing => write!(f, "no root orientation"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray as nd;
    use ndarray::prelude::*;

    #[test]
    fn reports_core_fields() {
        let mut record = PoseRecord::default();
        record.insert("body_pose", nd::Array3::<f64>::zeros((21, 3, 3)).into_dyn());
        record.insert("body_cam", array![1.0, 0.0, 0.0].into_dyn());
        record.insert_opaque("name");
        let report = InspectionReport::new(&record);
        assert_eq!(report.keys, vec!["body_cam", "body_pose", "name"]);
        assert_eq!(report.fields.len(), CORE_FIELDS.len());
        let status = |name: &str| &report.fields.iter().find(|f| f.name == name).unwrap().status;
        assert_eq!(status("body_pose"), &FieldStatus::Array { shape: vec![21, 3, 3] });
        assert_eq!(status("jaw_pose"), &FieldStatus::Missing);
        assert_eq!(report.root, RootSummary::Missing);
        let text = report.to_string();
        assert!(text.lines().any(|l| l.trim_start().starts_with("jaw_pose") && l.ends_with("not found")));
    }

    #[test]
    fn present_but_not_numeric() {
        let mut record = PoseRecord::default();
        record.insert_opaque("body_cam");
        let report = InspectionReport::new(&record);
        assert_eq!(report.keys, vec!["body_cam"]);
        let cam = report.fields.iter().find(|f| f.name == "body_cam").unwrap();
        assert_eq!(cam.status, FieldStatus::NonNumeric);
        let text = report.to_string();
        assert!(text.lines().any(|l| l.trim_start().starts_with("body_cam") && l.ends_with("not numeric")));
        let json = serde_json::to_value(&report).unwrap();
        let cam = json["fields"].as_array().unwrap().iter().find(|f| f["name"] == "body_cam").unwrap();
        assert_eq!(cam["status"], "non_numeric");
    }

    #[test]
    fn root_matrix_angle_and_axis() {
        let mut record = PoseRecord::default();
        record.insert(
            "global_pose",
            array![[[1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, -1.0]]].into_dyn(),
        );
        record.insert("global_orient", array![0.0, 0.0, 0.0].into_dyn());
        match InspectionReport::new(&record).root {
            RootSummary::Matrix { angle_deg, axis: Some(axis) } => {
                assert_abs_diff_eq!(angle_deg, 180.0, epsilon = 1e-6);
                assert_abs_diff_eq!(axis[0].abs(), 1.0, epsilon = 1e-9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn identity_root_has_no_axis() {
        let mut record = PoseRecord::default();
        record.insert("global_pose", nd::Array2::<f64>::eye(3).into_dyn());
        match InspectionReport::new(&record).root {
            RootSummary::Matrix { angle_deg, axis } => {
                assert_abs_diff_eq!(angle_deg, 0.0, epsilon = 1e-9);
                assert!(axis.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_global_orient_length() {
        let mut record = PoseRecord::default();
        record.insert("global_orient", array![[0.1, 0.2, 0.3]].into_dyn());
        let report = InspectionReport::new(&record);
        assert_eq!(report.root, RootSummary::AxisAngle { len: 3 });
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["root"]["kind"], "axis_angle");
        assert_eq!(json["root"]["len"], 3);
        assert!(json["file"].is_null());
    }
}
