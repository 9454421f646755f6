use log::debug;
use std::{
    fs,
    io::{self, Write},
    path::Path,
};
/// associating a extension with a enum
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

pub struct FileLoader {}
impl FileLoader {
    /// Reads the whole file in memory
    /// # Errors
    /// Will return an error if the path cannot be opened or read
    pub fn read(file_path: &Path) -> io::Result<Vec<u8>> {
        let bytes = fs::read(file_path)?;
        debug!("read {} bytes from {}", bytes.len(), file_path.display());
        Ok(bytes)
    }

    /// Writes the bytes to a temporary file next to ``file_path`` and renames
    /// it into place, so the destination either has the complete content or
    /// is left untouched.
    /// # Errors
    /// Will return an error if the directory is not writable or the rename
    /// fails
    pub fn write_atomic(file_path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = match file_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(file_path).map_err(|e| e.error)?;
        debug!("wrote {} bytes to {}", bytes.len(), file_path.display());
        Ok(())
    }
}

#[derive(Debug, EnumIter, PartialEq)]
pub enum FileType {
    Pickle,
    Unknown,
}
impl FileType {
    pub fn value(&self) -> &'static [&'static str] {
        match self {
            Self::Pickle => &["pkl", "pickle"],
            Self::Unknown => &[""],
        }
    }
    pub fn find_match(ext: &str) -> Self {
        Self::iter()
            .find(|filetype| filetype.value().contains(&(ext.to_lowercase()).as_str()))
            .unwrap_or(FileType::Unknown)
    }
    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map_or(FileType::Unknown, Self::find_match)
    }
}
