//! N-Caltech101 on-disk layout: `<root>/<class>/<sample>.npy`.
//!
//! Each sample is an (N, 4) little-endian float array with columns
//! `x, y, t, p`.

use super::EventStore;
use crate::error::DatasetError;
use crate::events::{Event, EventSample, EventStream, Polarity};
use byteorder::{LittleEndian, ReadBytesExt};
use regex::Regex;
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";
const EVENT_COLUMNS: usize = 4;

static DESCR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'descr'\s*:\s*'([<>|=])([fi])(\d+)'").expect("invalid DESCR_RE pattern")
});
static FORTRAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'fortran_order'\s*:\s*(True|False)").expect("invalid FORTRAN_RE pattern")
});
static SHAPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"'shape'\s*:\s*\(([^)]*)\)").expect("invalid SHAPE_RE pattern")
});

pub struct NCaltech101 {
    root: PathBuf,
    classes: Vec<String>,
    files: Vec<PathBuf>,
    labels: Vec<usize>,
}

impl NCaltech101 {
    /// Index a dataset root, taking its class directories in sorted order
    pub fn new(root: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let root = root.as_ref();
        let mut classes = Vec::new();
        for entry in read_dir(root)? {
            let entry = entry.map_err(|source| io_error(root, source))?;
            if entry.path().is_dir() {
                classes.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        classes.sort();
        Self::with_classes(root, &classes)
    }

    /// Index a dataset root against a fixed class list, so label indices
    /// agree with another split
    pub fn with_classes(root: impl AsRef<Path>, classes: &[String]) -> Result<Self, DatasetError> {
        let root = root.as_ref().to_path_buf();
        let mut files = Vec::new();
        let mut labels = Vec::new();
        for (label, class) in classes.iter().enumerate() {
            let class_dir = root.join(class);
            if !class_dir.is_dir() {
                return Err(DatasetError::MissingClass { class: class.clone(), root });
            }
            let mut class_files = Vec::new();
            for entry in read_dir(&class_dir)? {
                let path = entry.map_err(|source| io_error(&class_dir, source))?.path();
                if path.is_file() && path.extension().is_some_and(|ext| ext == "npy") {
                    class_files.push(path);
                }
            }
            class_files.sort();
            labels.extend(std::iter::repeat_n(label, class_files.len()));
            files.extend(class_files);
        }
        log::debug!(
            "Indexed {} samples in {} classes under {}",
            files.len(),
            classes.len(),
            root.display()
        );
        Ok(Self { root, classes: classes.to_vec(), files, labels })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, index: usize) -> Option<&Path> {
        self.files.get(index).map(PathBuf::as_path)
    }
}

impl EventStore for NCaltech101 {
    fn len(&self) -> usize {
        self.files.len()
    }

    fn get(&self, index: usize) -> Result<EventSample, DatasetError> {
        let path = self
            .files
            .get(index)
            .ok_or(DatasetError::IndexOutOfRange { index, len: self.files.len() })?;
        let events = read_npy_events(path)?;
        Ok(EventSample::new(events, self.labels[index]))
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }
}

fn read_dir(dir: &Path) -> Result<fs::ReadDir, DatasetError> {
    fs::read_dir(dir).map_err(|source| io_error(dir, source))
}

fn io_error(path: &Path, source: std::io::Error) -> DatasetError {
    DatasetError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, PartialEq)]
enum ElementType {
    F32,
    F64,
}

impl ElementType {
    fn size(&self) -> u64 {
        match self {
            ElementType::F32 => 4,
            ElementType::F64 => 8,
        }
    }
}

#[derive(Debug)]
struct NpyHeader {
    element: ElementType,
    rows: usize,
}

fn parse_header(header: &str) -> Result<NpyHeader, String> {
    let descr = DESCR_RE.captures(header).ok_or("missing 'descr'")?;
    if &descr[1] == ">" {
        return Err("big-endian arrays are not supported".into());
    }
    let element = match (&descr[2], &descr[3]) {
        ("f", "4") => ElementType::F32,
        ("f", "8") => ElementType::F64,
        (kind, size) => return Err(format!("unsupported dtype {kind}{size}")),
    };
    let fortran = FORTRAN_RE.captures(header).ok_or("missing 'fortran_order'")?;
    if &fortran[1] == "True" {
        return Err("Fortran-ordered arrays are not supported".into());
    }
    let shape = SHAPE_RE.captures(header).ok_or("missing 'shape'")?;
    let dims = shape[1]
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| d.parse::<usize>().map_err(|e| format!("bad dimension '{d}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    let rows = match dims.as_slice() {
        [0] => 0,
        [rows, EVENT_COLUMNS] => *rows,
        other => return Err(format!("expected shape (N, {EVENT_COLUMNS}), got {other:?}")),
    };
    Ok(NpyHeader { element, rows })
}

/// Read an (N, 4) `.npy` event array
pub fn read_npy_events(path: &Path) -> Result<EventStream, DatasetError> {
    let invalid = |reason: String| DatasetError::InvalidEventFile { path: path.to_path_buf(), reason };
    let file = File::open(path).map_err(|source| io_error(path, source))?;
    let file_len = file.metadata().map_err(|source| io_error(path, source))?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic).map_err(|source| io_error(path, source))?;
    if &magic != NPY_MAGIC {
        return Err(invalid("not an .npy file".into()));
    }
    let major = reader.read_u8().map_err(|source| io_error(path, source))?;
    let _minor = reader.read_u8().map_err(|source| io_error(path, source))?;
    let header_len = match major {
        1 => reader.read_u16::<LittleEndian>().map(usize::from),
        2 | 3 => reader.read_u32::<LittleEndian>().map(|n| n as usize),
        v => return Err(invalid(format!("unsupported format version {v}"))),
    }
    .map_err(|source| io_error(path, source))?;
    let prefix_len: u64 = if major == 1 { 10 } else { 12 };
    let data_len = file_len.saturating_sub(prefix_len);
    if header_len as u64 > data_len {
        return Err(invalid(format!("header length {header_len} exceeds the file")));
    }
    let data_len = data_len - header_len as u64;
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).map_err(|source| io_error(path, source))?;
    let header = String::from_utf8_lossy(&header);
    let NpyHeader { element, rows } = parse_header(&header).map_err(invalid)?;

    let payload = (rows as u64).checked_mul(EVENT_COLUMNS as u64 * element.size());
    if payload.is_none_or(|bytes| bytes > data_len) {
        return Err(invalid(format!("{rows} rows declared but only {data_len} bytes of data")));
    }
    let mut values = vec![0f64; rows * EVENT_COLUMNS];
    match element {
        ElementType::F32 => {
            let mut raw = vec![0f32; values.len()];
            reader.read_f32_into::<LittleEndian>(&mut raw).map_err(|source| io_error(path, source))?;
            for (dst, src) in values.iter_mut().zip(raw) {
                *dst = f64::from(src);
            }
        }
        ElementType::F64 => {
            reader.read_f64_into::<LittleEndian>(&mut values).map_err(|source| io_error(path, source))?;
        }
    }

    values
        .chunks_exact(EVENT_COLUMNS)
        .enumerate()
        .map(|(row, v)| {
            let x = coordinate(v[0]).ok_or_else(|| invalid(format!("bad x {} in row {row}", v[0])))?;
            let y = coordinate(v[1]).ok_or_else(|| invalid(format!("bad y {} in row {row}", v[1])))?;
            Ok(Event::new(x, y, v[2] as f32, Polarity::from_raw(v[3])))
        })
        .collect()
}

fn coordinate(value: f64) -> Option<u16> {
    (value.is_finite() && value >= 0.0 && value <= f64::from(u16::MAX)).then_some(value as u16)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    /// Write a v1 `.npy` file holding `rows` as an (N, 4) `<f4` array
    pub(crate) fn write_npy_f32(path: &Path, rows: &[[f32; 4]]) {
        let mut header = format!(
            "{{'descr': '<f4', 'fortran_order': False, 'shape': ({}, 4), }}",
            rows.len()
        );
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');
        let mut f = File::create(path).unwrap();
        f.write_all(NPY_MAGIC).unwrap();
        f.write_all(&[1, 0]).unwrap();
        f.write_all(&(header.len() as u16).to_le_bytes()).unwrap();
        f.write_all(header.as_bytes()).unwrap();
        for row in rows {
            for v in row {
                f.write_all(&v.to_le_bytes()).unwrap();
            }
        }
    }

    #[test]
    fn reads_events_and_maps_polarity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        write_npy_f32(&path, &[[3.0, 4.0, 0.25, 1.0], [10.0, 0.0, 0.5, -1.0]]);
        let events = read_npy_events(&path).unwrap();
        assert_eq!(
            events,
            vec![
                Event::new(3, 4, 0.25, Polarity::Positive),
                Event::new(10, 0, 0.5, Polarity::Negative),
            ]
        );
    }

    #[test]
    fn reads_f64_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.npy");
        let header = "{'descr': '<f8', 'fortran_order': False, 'shape': (1, 4), }\n";
        let mut f = File::create(&path).unwrap();
        f.write_all(NPY_MAGIC).unwrap();
        f.write_all(&[1, 0]).unwrap();
        f.write_all(&(header.len() as u16).to_le_bytes()).unwrap();
        f.write_all(header.as_bytes()).unwrap();
        for v in [7.0f64, 8.0, 1.5, 0.0] {
            f.write_all(&v.to_le_bytes()).unwrap();
        }
        drop(f);
        let events = read_npy_events(&path).unwrap();
        assert_eq!(events, vec![Event::new(7, 8, 1.5, Polarity::Negative)]);
    }

    #[test]
    fn rejects_wrong_shape_and_magic() {
        assert!(parse_header("{'descr': '<f4', 'fortran_order': False, 'shape': (5, 3), }").is_err());
        assert!(parse_header("{'descr': '<i2', 'fortran_order': False, 'shape': (5, 4), }").is_err());
        assert_eq!(
            parse_header("{'descr': '<f4', 'fortran_order': False, 'shape': (0,), }").unwrap().rows,
            0
        );

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.npy");
        fs::write(&path, b"garbage-bytes").unwrap();
        assert!(matches!(read_npy_events(&path), Err(DatasetError::InvalidEventFile { .. })));
    }

    #[test]
    fn rejects_row_counts_beyond_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        for (name, rows) in [("short.npy", "3"), ("huge.npy", "4611686018427387904")] {
            let path = dir.path().join(name);
            let header = format!("{{'descr': '<f4', 'fortran_order': False, 'shape': ({rows}, 4), }}\n");
            let mut f = File::create(&path).unwrap();
            f.write_all(NPY_MAGIC).unwrap();
            f.write_all(&[1, 0]).unwrap();
            f.write_all(&(header.len() as u16).to_le_bytes()).unwrap();
            f.write_all(header.as_bytes()).unwrap();
            for v in [1.0f32, 2.0, 0.5, 1.0] {
                f.write_all(&v.to_le_bytes()).unwrap();
            }
            drop(f);
            assert!(
                matches!(read_npy_events(&path), Err(DatasetError::InvalidEventFile { ref reason, .. }) if reason.contains("rows declared")),
                "{name}"
            );
        }
    }

    #[test]
    fn indexes_sorted_classes_and_shares_labels() {
        let dir = tempfile::tempdir().unwrap();
        for (class, n) in [("zebra", 1), ("airplane", 2)] {
            fs::create_dir(dir.path().join(class)).unwrap();
            for i in 0..n {
                write_npy_f32(&dir.path().join(class).join(format!("{i}.npy")), &[[0.0, 0.0, 0.0, 1.0]]);
            }
        }
        fs::write(dir.path().join("README.txt"), "not a class").unwrap();

        let store = NCaltech101::new(dir.path()).unwrap();
        assert_eq!(store.classes(), &["airplane".to_string(), "zebra".to_string()]);
        assert_eq!(store.len(), 3);
        assert_eq!(store.get(0).unwrap().label, 0);
        assert_eq!(store.get(2).unwrap().label, 1);

        let reversed = vec!["zebra".to_string(), "airplane".to_string()];
        let other = NCaltech101::with_classes(dir.path(), &reversed).unwrap();
        assert_eq!(other.get(0).unwrap().label, 0);
        assert_eq!(other.path(0).unwrap().parent().unwrap().file_name().unwrap(), "zebra");

        let missing = vec!["faces".to_string()];
        assert!(matches!(
            NCaltech101::with_classes(dir.path(), &missing),
            Err(DatasetError::MissingClass { .. })
        ));
    }
}
