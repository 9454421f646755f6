use super::{
    numpy::{value_to_array, write_ndarray},
    pickle::{loads, StringEncoding, Value},
    pickle_writer::PickleWriter,
};
use crate::{
    common::{naming::suffixed_output_path, params::SmplxParams, types::RootFixConfig},
    error::{Error, LoadError, Result},
};
use log::{debug, info, warn};
use ndarray as nd;
use smpl_utils::io::{FileLoader, FileType};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
};

/// A pose record as PIXIE saves it: a dict from field names to arrays.
/// Entries that hold no numbers (strings, nested dicts, ...) are only kept by
/// name.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoseRecord {
    fields: BTreeMap<String, nd::ArrayD<f64>>,
    opaque_keys: BTreeSet<String>,
}

impl PoseRecord {
    pub fn insert(&mut self, name: impl Into<String>, array: nd::ArrayD<f64>) {
        let name = name.into();
        self.opaque_keys.remove(&name);
        self.fields.insert(name, array);
    }
    pub fn insert_opaque(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.fields.remove(&name);
        self.opaque_keys.insert(name);
    }
    pub fn get(&self, name: &str) -> Option<&nd::ArrayD<f64>> {
        self.fields.get(name)
    }
    /// First of ``names`` present in the record, with the array
    pub fn first_of(&self, names: &[&'static str]) -> Option<(&'static str, &nd::ArrayD<f64>)> {
        names.iter().find_map(|&name| self.get(name).map(|array| (name, array)))
    }
    /// Number of entries, numeric or not
    pub fn len(&self) -> usize {
        self.fields.len() + self.opaque_keys.len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Every entry name, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.fields.keys().chain(self.opaque_keys.iter()).map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
    pub fn opaque_keys(&self) -> impl Iterator<Item = &str> {
        self.opaque_keys.iter().map(String::as_str)
    }
    /// True when ``name`` is present but holds no numbers
    pub fn is_opaque(&self, name: &str) -> bool {
        self.opaque_keys.contains(name)
    }

    /// Builds the record from an unpickled top-level dict
    /// # Errors
    /// Will return an error if ``value`` is not a dict or one of its numpy
    /// arrays is malformed
    pub fn from_value(value: &Value) -> std::result::Result<Self, LoadError> {
        let Value::Dict(pairs) = value else {
            return Err(LoadError::NotAMapping(value.kind()));
        };
        let mut record = Self::default();
        for (key, entry) in pairs {
            let name = match key {
                Value::Str(s) => s.clone(),
                Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
                other => {
                    warn!("skipping entry with a {} key", other.kind());
                    continue;
                }
            };
            match value_to_array(entry).map_err(|source| LoadError::Array { field: name.clone(), source })? {
                Some(array) => {
                    debug!("{name}: array {:?}", array.shape());
                    record.insert(name, array);
                }
                None => {
                    warn!("{name}: {} value is not numeric, kept by name only", entry.kind());
                    record.insert_opaque(name);
                }
            }
        }
        Ok(record)
    }

    /// Decodes a pickle blob. Python 2 pickles store raw array buffers as
    /// legacy strings that are rarely valid ASCII, so a failed first attempt
    /// is retried with latin-1 decoding.
    /// # Errors
    /// Will return ``LoadError::Fallback`` with both reasons if neither
    /// decoding works
    pub fn from_pickle_bytes(bytes: &[u8]) -> std::result::Result<Self, LoadError> {
        let decode = |encoding| -> std::result::Result<Self, LoadError> { Self::from_value(&loads(bytes, encoding)?) };
        match decode(StringEncoding::Ascii) {
            Ok(record) => Ok(record),
            Err(default) => {
                warn!("default decoding failed ({default}), retrying with latin-1");
                decode(StringEncoding::Latin1).map_err(|latin1| LoadError::Fallback {
                    default: Box::new(default),
                    latin1: Box::new(latin1),
                })
            }
        }
    }

    /// # Errors
    /// Will return ``Error::Load`` if the file cannot be read or decoded
    pub fn from_file(path: &Path) -> Result<Self> {
        if FileType::from_path(path) != FileType::Pickle {
            warn!("{} does not have a pickle extension, trying anyway", path.display());
        }
        let load_err = |source: LoadError| Error::Load {
            path: path.to_path_buf(),
            source,
        };
        let bytes = FileLoader::read(path).map_err(|e| load_err(e.into()))?;
        let record = Self::from_pickle_bytes(&bytes).map_err(load_err)?;
        info!("loaded {} ({} entries)", path.display(), record.len());
        Ok(record)
    }
}

impl SmplxParams {
    /// Pickles the parameters as a dict of ``float64`` numpy arrays, keys in
    /// field order
    pub fn to_pickle_bytes(&self) -> Vec<u8> {
        let mut writer = PickleWriter::new();
        writer.empty_dict();
        writer.mark();
        for (field, array) in self.iter() {
            writer.unicode(field.as_ref());
            write_ndarray(&mut writer, array);
        }
        writer.set_items();
        writer.finish()
    }

    /// Writes to exactly ``path``. Nothing is left behind on failure.
    /// # Errors
    /// Will return ``Error::Write`` if the file cannot be written
    pub fn to_file(&self, path: &Path) -> Result<()> {
        FileLoader::write_atomic(path, &self.to_pickle_bytes()).map_err(|source| Error::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes next to ``requested`` with the root fix tag inserted before the
    /// extension and returns the path actually written
    /// # Errors
    /// Will return ``Error::Write`` if the file cannot be written
    pub fn save(&self, requested: &Path, config: &RootFixConfig) -> Result<PathBuf> {
        let path = suffixed_output_path(requested, config);
        self.to_file(&path)?;
        info!("saved SMPL-X parameters to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::pickle::op;
    use ndarray::prelude::*;

    #[test]
    fn top_level_must_be_a_dict() {
        let err = PoseRecord::from_value(&Value::List(vec![])).unwrap_err();
        assert!(matches!(err, LoadError::NotAMapping("list")));
    }

    #[test]
    fn mixed_entries() {
        let value = Value::Dict(vec![
            (Value::Str("transl".to_string()), Value::List(vec![Value::Float(0.0), Value::Float(1.0), Value::Int(2)])),
            (Value::Str("name".to_string()), Value::Str("frame".to_string())),
            (Value::Bytes(b"cam".to_vec()), Value::Float(2.0)),
        ]);
        let record = PoseRecord::from_value(&value).unwrap();
        assert_eq!(record.keys(), vec!["cam", "name", "transl"]);
        assert_eq!(record.opaque_keys().collect::<Vec<_>>(), vec!["name"]);
        assert_eq!(record.get("transl"), Some(&array![0.0, 1.0, 2.0].into_dyn()));
        assert!(record.get("name").is_none());
        assert!(record.is_opaque("name"));
        assert!(!record.is_opaque("transl"));
    }

    #[test]
    fn later_duplicate_wins() {
        let mut record = PoseRecord::default();
        record.insert("exp", array![1.0].into_dyn());
        record.insert_opaque("exp");
        assert!(record.get("exp").is_none());
        assert_eq!(record.len(), 1);
    }

    #[test]
    fn garbage_fails_both_ways() {
        let err = PoseRecord::from_pickle_bytes(b"not a pickle").unwrap_err();
        assert!(matches!(err, LoadError::Fallback { .. }));
    }

    #[test]
    fn deeply_nested_pickle_is_a_load_error() {
        let depth = 200_000;
        let mut data = vec![op::EMPTY_LIST; depth];
        data.extend(std::iter::repeat(op::APPEND).take(depth - 1));
        data.push(op::STOP);
        // small stack, as on a worker thread
        let handle = std::thread::Builder::new()
            .stack_size(2 << 20)
            .spawn(move || PoseRecord::from_pickle_bytes(&data).map(|_| ()).map_err(|e| e.to_string()))
            .unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.contains("nested deeper"), "{err}");
    }

    #[test]
    fn latin1_retry() {
        // {'k': 'caf\xe9'} as a Python 2 protocol 2 pickle
        let data = [
            op::PROTO, 2, op::EMPTY_DICT, op::SHORT_BINSTRING, 1, b'k',
            op::SHORT_BINSTRING, 4, b'c', b'a', b'f', 0xe9, op::SETITEM, op::STOP,
        ];
        let record = PoseRecord::from_pickle_bytes(&data).unwrap();
        assert_eq!(record.keys(), vec!["k"]);
    }

    #[test]
    fn params_round_trip_in_memory() {
        let mut params = SmplxParams::default();
        params.betas = array![[0.5, -1.5]];
        params.global_orient = array![[std::f64::consts::PI, 0.0, 1e-300]];
        let record = PoseRecord::from_pickle_bytes(&params.to_pickle_bytes()).unwrap();
        assert_eq!(record.len(), 8);
        for (field, array) in params.iter() {
            assert_eq!(record.get(field.as_ref()), Some(&array.clone().into_dyn()), "{field}");
        }
    }

    #[test]
    fn save_inserts_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let requested = dir.path().join("pose.pkl");
        let written = SmplxParams::default().save(&requested, &RootFixConfig::new(true, true)).unwrap();
        assert_eq!(written, dir.path().join("pose_rootX180_Z180.pkl"));
        assert!(written.exists());
        assert!(!requested.exists());
    }
}
