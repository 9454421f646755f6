// #![warn(
//     clippy::all,
//     clippy::pedantic,
// )]
// //some lints are really just too pedantic
// #![allow(clippy::must_use_candidate)]
// #![allow(clippy::module_name_repetitions)]

//! Converts pose records saved by PIXIE into the SMPL-X parameter layout.
//!
//! ```no_run
//! use pixie_smplx::{convert, PoseRecord, RootFixConfig};
//! use std::path::Path;
//!
//! let config = RootFixConfig::default();
//! let record = PoseRecord::from_file(Path::new("frame.pkl"))?;
//! let params = convert(&record, &config)?;
//! params.save(Path::new("frame_smplx.pkl"), &config)?;
//! # Ok::<(), pixie_smplx::Error>(())
//! ```

pub mod codec;
pub mod common;
pub mod conversions;
pub mod error;
pub mod inspect;

pub use codec::record::PoseRecord;
pub use common::{
    naming::{default_output_path, suffixed_output_path},
    params::SmplxParams,
    types::{FieldOrigin, RootFixConfig, SmplxField},
};
pub use conversions::pose_remap::{convert, PoseRemap};
pub use error::{Error, LoadError, Result};
pub use inspect::InspectionReport;
