// src/persist.rs
//
// Model archives: a single binary file holding named f64 arrays plus a small
// string-to-string metadata map. Layout: a little-endian u64 header length,
// a JSON header describing every array (dtype, shape, byte offsets), then
// the raw little-endian f64 payload.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

#[derive(Serialize, Deserialize, Debug)]
struct ArrayMeta {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ArchiveHeader {
    #[serde(default)]
    metadata: HashMap<String, String>,
    arrays: HashMap<String, ArrayMeta>,
}

#[derive(Debug)]
pub enum PersistError {
    IoError(io::Error),
    JsonError(serde_json::Error),
    UnsupportedDtype(String),
    DataCorruption(String),
    InvalidHeaderLength,
    ArrayNotFound(String),
    MetadataMissing(String),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::IoError(e) => write!(f, "IO error: {}", e),
            PersistError::JsonError(e) => write!(f, "JSON error: {}", e),
            PersistError::UnsupportedDtype(s) => write!(f, "Unsupported dtype: {}", s),
            PersistError::DataCorruption(s) => write!(f, "Data corruption: {}", s),
            PersistError::InvalidHeaderLength => write!(f, "Invalid header length"),
            PersistError::ArrayNotFound(s) => write!(f, "Array not found: {}", s),
            PersistError::MetadataMissing(s) => write!(f, "Metadata entry missing: {}", s),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::IoError(ref e) => Some(e),
            PersistError::JsonError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PersistError {
    fn from(err: io::Error) -> PersistError {
        PersistError::IoError(err)
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> PersistError {
        PersistError::JsonError(err)
    }
}

/// A named f64 array staged for writing or produced by a load.
#[derive(Debug, Clone)]
pub struct NamedArray {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl NamedArray {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// In-memory form of a loaded archive.
#[derive(Debug, Default)]
pub struct Archive {
    pub metadata: HashMap<String, String>,
    arrays: HashMap<String, (Vec<usize>, Vec<f64>)>,
}

impl Archive {
    /// Remove and return the named array, erroring if it is absent.
    pub fn take(&mut self, name: &str) -> Result<(Vec<usize>, Vec<f64>), PersistError> {
        self.arrays
            .remove(name)
            .ok_or_else(|| PersistError::ArrayNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.arrays.contains_key(name)
    }

    pub fn meta(&self, key: &str) -> Result<&str, PersistError> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| PersistError::MetadataMissing(key.to_string()))
    }
}

/// Write `arrays` and `metadata` to `path`, creating parent directories as
/// needed. Arrays are laid out in name order so offsets are deterministic.
pub fn save_archive(
    path: &Path,
    metadata: &HashMap<String, String>,
    arrays: &[NamedArray],
) -> Result<(), PersistError> {
    for a in arrays {
        let expected: usize = a.shape.iter().product();
        if expected != a.data.len() {
            return Err(PersistError::DataCorruption(format!(
                "Array '{}': shape {:?} implies {} elements but {} were provided",
                a.name,
                a.shape,
                expected,
                a.data.len()
            )));
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut sorted: Vec<&NamedArray> = arrays.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut header = ArchiveHeader {
        metadata: metadata.clone(),
        arrays: HashMap::new(),
    };
    let mut offset = 0usize;
    for a in &sorted {
        let nbytes = a.data.len() * std::mem::size_of::<f64>();
        header.arrays.insert(
            a.name.clone(),
            ArrayMeta {
                dtype: "F64".to_string(),
                shape: a.shape.clone(),
                data_offsets: (offset, offset + nbytes),
            },
        );
        offset += nbytes;
    }

    let header_bytes = serde_json::to_vec(&header)?;
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&(header_bytes.len() as u64).to_le_bytes())?;
    writer.write_all(&header_bytes)?;
    for a in &sorted {
        for &val in &a.data {
            writer.write_all(&val.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Parse an archive written by `save_archive`, validating dtype and offset
/// arithmetic against the declared shapes.
pub fn load_archive(path: &Path) -> Result<Archive, PersistError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header_len_bytes = [0u8; 8];
    reader.read_exact(&mut header_len_bytes)?;
    let header_length = u64::from_le_bytes(header_len_bytes) as usize;
    if header_length == 0 {
        return Err(PersistError::InvalidHeaderLength);
    }

    let mut header_bytes = vec![0u8; header_length];
    reader.read_exact(&mut header_bytes)?;
    let header: ArchiveHeader = serde_json::from_slice(&header_bytes)?;

    let data_start = 8 + header_length;
    let mut arrays = HashMap::new();
    for (name, meta) in header.arrays {
        if meta.dtype != "F64" {
            return Err(PersistError::UnsupportedDtype(format!(
                "Array '{}' has dtype '{}', only F64 is supported",
                name, meta.dtype
            )));
        }

        let expected_elements: usize = meta.shape.iter().product();
        let expected_bytes = expected_elements * std::mem::size_of::<f64>();
        let (start, end) = meta.data_offsets;
        if end < start || end - start != expected_bytes {
            return Err(PersistError::DataCorruption(format!(
                "Array '{}': expected {} bytes from shape {:?}, offsets give {}",
                name,
                expected_bytes,
                meta.shape,
                end.saturating_sub(start)
            )));
        }

        reader.seek(SeekFrom::Start((data_start + start) as u64))?;
        let mut raw = vec![0u8; expected_bytes];
        reader.read_exact(&mut raw)?;

        let mut data = Vec::with_capacity(expected_elements);
        for chunk in raw.chunks_exact(std::mem::size_of::<f64>()) {
            // chunks_exact guarantees the conversion
            data.push(f64::from_le_bytes(chunk.try_into().unwrap()));
        }
        arrays.insert(name, (meta.shape, data));
    }

    Ok(Archive {
        metadata: header.metadata,
        arrays,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_arrays() -> Vec<NamedArray> {
        vec![
            NamedArray::new("phi.0", vec![2, 3], vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]),
            NamedArray::new("r", vec![3], vec![1.0, 2.0, 3.0]),
        ]
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.dpm");
        let mut meta = HashMap::new();
        meta.insert("model".to_string(), "pgbn".to_string());

        save_archive(&path, &meta, &sample_arrays()).unwrap();
        let mut archive = load_archive(&path).unwrap();

        assert_eq!(archive.meta("model").unwrap(), "pgbn");
        let (shape, data) = archive.take("phi.0").unwrap();
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(data, vec![0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
        let (shape, data) = archive.take("r").unwrap();
        assert_eq!(shape, vec![3]);
        assert_eq!(data, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_save_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/deeper/model.dpm");
        save_archive(&path, &HashMap::new(), &sample_arrays()).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_save_rejects_shape_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dpm");
        let arrays = vec![NamedArray::new("x", vec![2, 2], vec![1.0, 2.0, 3.0])];
        let result = save_archive(&path, &HashMap::new(), &arrays);
        assert!(matches!(result, Err(PersistError::DataCorruption(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = load_archive(Path::new("no_such_archive.dpm"));
        assert!(matches!(result, Err(PersistError::IoError(_))));
    }

    #[test]
    fn test_load_zero_header_length() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("zero.dpm");
        std::fs::write(&path, 0u64.to_le_bytes()).unwrap();
        let result = load_archive(&path);
        assert!(matches!(result, Err(PersistError::InvalidHeaderLength)));
    }

    #[test]
    fn test_load_truncated_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("trunc.dpm");
        // Claims a 100-byte header but provides none.
        std::fs::write(&path, 100u64.to_le_bytes()).unwrap();
        let result = load_archive(&path);
        assert!(matches!(result, Err(PersistError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_load_malformed_json_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("badjson.dpm");
        let json = b"{\"arrays\": {";
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json);
        std::fs::write(&path, bytes).unwrap();
        let result = load_archive(&path);
        assert!(matches!(result, Err(PersistError::JsonError(_))));
    }

    #[test]
    fn test_load_unsupported_dtype() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f32.dpm");
        let json =
            br#"{"metadata": {}, "arrays": {"x": {"dtype": "F32", "shape": [1], "data_offsets": [0, 4]}}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json);
        bytes.extend_from_slice(&[0u8; 4]);
        std::fs::write(&path, bytes).unwrap();
        let result = load_archive(&path);
        assert!(matches!(result, Err(PersistError::UnsupportedDtype(s)) if s.contains("F32")));
    }

    #[test]
    fn test_load_offset_shape_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mismatch.dpm");
        // Shape [2] needs 16 bytes; offsets claim 8.
        let json =
            br#"{"metadata": {}, "arrays": {"x": {"dtype": "F64", "shape": [2], "data_offsets": [0, 8]}}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json);
        bytes.extend_from_slice(&1.0f64.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        let result = load_archive(&path);
        assert!(matches!(result, Err(PersistError::DataCorruption(_))));
    }

    #[test]
    fn test_load_truncated_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.dpm");
        let json =
            br#"{"metadata": {}, "arrays": {"x": {"dtype": "F64", "shape": [2], "data_offsets": [0, 16]}}}"#;
        let mut bytes = (json.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(json);
        bytes.extend_from_slice(&1.0f64.to_le_bytes()); // only 8 of 16 bytes
        std::fs::write(&path, bytes).unwrap();
        let result = load_archive(&path);
        assert!(matches!(result, Err(PersistError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_take_missing_array() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.dpm");
        save_archive(&path, &HashMap::new(), &sample_arrays()).unwrap();
        let mut archive = load_archive(&path).unwrap();
        assert!(matches!(
            archive.take("phi.9"),
            Err(PersistError::ArrayNotFound(_))
        ));
    }
}
