// src/dataset.rs
//
// Local-file data loading for the demo pipelines. Images come from IDX
// (MNIST-style ubyte) files already on disk, text from one-record-per-line
// TSV files. Nothing here downloads anything.

use ndarray::Array2;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

const IDX_IMAGES_MAGIC: u32 = 2051;
const IDX_LABELS_MAGIC: u32 = 2049;

#[derive(Debug)]
pub enum DatasetError {
    IoError(io::Error),
    BadMagic { expected: u32, found: u32 },
    DimensionMismatch(String),
    ParseError(String),
    Empty(String),
}

impl std::fmt::Display for DatasetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DatasetError::IoError(e) => write!(f, "IO error: {}", e),
            DatasetError::BadMagic { expected, found } => {
                write!(f, "Bad IDX magic number: expected {}, found {}", expected, found)
            }
            DatasetError::DimensionMismatch(s) => write!(f, "Dimension mismatch: {}", s),
            DatasetError::ParseError(s) => write!(f, "Parse error: {}", s),
            DatasetError::Empty(s) => write!(f, "Empty dataset: {}", s),
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DatasetError::IoError(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DatasetError {
    fn from(err: io::Error) -> DatasetError {
        DatasetError::IoError(err)
    }
}

fn read_u32_be<R: Read>(reader: &mut R) -> Result<u32, DatasetError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Read up to `max_items` images from an `idx3-ubyte` file and return them
/// as a `pixels x n_images` count matrix: each pixel is scaled to [0, 1],
/// multiplied by 5 and ceiled, which is the count binning the demos apply
/// before handing images to a Poisson model.
pub fn load_idx_images(path: &Path, max_items: usize) -> Result<Array2<f64>, DatasetError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let magic = read_u32_be(&mut reader)?;
    if magic != IDX_IMAGES_MAGIC {
        return Err(DatasetError::BadMagic {
            expected: IDX_IMAGES_MAGIC,
            found: magic,
        });
    }

    let n_images = read_u32_be(&mut reader)? as usize;
    let n_rows = read_u32_be(&mut reader)? as usize;
    let n_cols = read_u32_be(&mut reader)? as usize;
    if n_rows == 0 || n_cols == 0 {
        return Err(DatasetError::DimensionMismatch(format!(
            "Image dimensions {}x{} are invalid",
            n_rows, n_cols
        )));
    }
    let n_take = n_images.min(max_items);
    if n_take == 0 {
        return Err(DatasetError::Empty(format!("{}", path.display())));
    }

    let n_pixels = n_rows * n_cols;
    let mut raw = vec![0u8; n_take * n_pixels];
    reader.read_exact(&mut raw)?;

    // Column j holds image j, matching the demos' transposed layout.
    let mut counts = Array2::<f64>::zeros((n_pixels, n_take));
    for j in 0..n_take {
        for v in 0..n_pixels {
            let intensity = raw[j * n_pixels + v] as f64 / 255.0;
            counts[[v, j]] = (intensity * 5.0).ceil();
        }
    }
    Ok(counts)
}

/// Read up to `max_items` labels from an `idx1-ubyte` file.
pub fn load_idx_labels(path: &Path, max_items: usize) -> Result<Vec<usize>, DatasetError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let magic = read_u32_be(&mut reader)?;
    if magic != IDX_LABELS_MAGIC {
        return Err(DatasetError::BadMagic {
            expected: IDX_LABELS_MAGIC,
            found: magic,
        });
    }

    let n_items = read_u32_be(&mut reader)? as usize;
    let n_take = n_items.min(max_items);
    if n_take == 0 {
        return Err(DatasetError::Empty(format!("{}", path.display())));
    }

    let mut raw = vec![0u8; n_take];
    reader.read_exact(&mut raw)?;
    Ok(raw.into_iter().map(|b| b as usize).collect())
}

/// One labelled text document.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelledDoc {
    pub label: usize,
    pub text: String,
}

/// Read a `label<TAB>text` corpus, one record per line. Blank lines are
/// skipped; a line without a tab or with a non-numeric label is an error.
pub fn load_tsv_corpus(path: &Path, max_items: usize) -> Result<Vec<LabelledDoc>, DatasetError> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut docs = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        if docs.len() >= max_items {
            break;
        }
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (label_str, text) = line.split_once('\t').ok_or_else(|| {
            DatasetError::ParseError(format!("Line {}: missing tab separator", line_no + 1))
        })?;
        let label: usize = label_str.trim().parse().map_err(|_| {
            DatasetError::ParseError(format!(
                "Line {}: label '{}' is not an integer",
                line_no + 1,
                label_str
            ))
        })?;
        docs.push(LabelledDoc {
            label,
            text: text.to_string(),
        });
    }

    if docs.is_empty() {
        return Err(DatasetError::Empty(format!("{}", path.display())));
    }
    Ok(docs)
}
