use super::types::RootFixConfig;
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

/// Inserts ``suffix`` between the stem and the extension of ``path``, so
/// ``out/foo.pkl`` becomes ``out/foo<suffix>.pkl``. A path without an
/// extension gets the suffix at the end.
pub fn with_stem_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.file_stem().unwrap_or_default());
    name.push(suffix);
    if let Some(ext) = path.extension() {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}

/// Final output path for a requested destination and the active root fix
pub fn suffixed_output_path(requested: &Path, config: &RootFixConfig) -> PathBuf {
    with_stem_suffix(requested, &config.suffix())
}

/// ``<stem>_smplx.pkl`` next to the input file
pub fn default_output_path(input: &Path) -> PathBuf {
    let mut name = OsString::from(input.file_stem().unwrap_or_default());
    name.push("_smplx.pkl");
    input.with_file_name(name)
}
