//! FILENAME: core/persistence/src/cube_file.rs
//! PURPOSE: Reading and writing cube value files.
//! CONTEXT: The text file is authoritative. It holds a header, an optional
//! alias remap section and one line per stored cell. The binary file is a
//! cache of the same content, tagged with format version, byte order and the
//! timestamp of the text file it was written with. Any mismatch or damage in
//! the binary file makes the loader fall back to the text file.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use engine::{CellPath, CellValue, Cube, ElementId};
use engine::{log_debug, log_warn};
use rustc_hash::FxHashMap;

use crate::PersistenceError;

pub const CUBE_FILE_VERSION: u32 = 1;

const BINARY_MAGIC: &[u8; 4] = b"CUBB";
const BYTE_ORDER_TAG: u32 = 0x0102_0304;

const SECTION_CUBE: &str = "[CUBE]";
const SECTION_ALIAS: &str = "[ALIAS]";
const SECTION_NUMERIC: &str = "[NUMERIC]";
const SECTION_STRING: &str = "[STRING]";

/// Element `from` of dimension `dimension` is now called `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElementAlias {
    pub dimension: usize,
    pub from: ElementId,
    pub to: ElementId,
}

/// Logical content of a cube file.
#[derive(Debug, Clone, PartialEq)]
pub struct CubeFile {
    pub name: String,
    pub dim_count: usize,
    pub timestamp: DateTime<Utc>,
    pub aliases: Vec<ElementAlias>,
    pub numeric: Vec<(CellPath, f64)>,
    pub text: Vec<(CellPath, String)>,
}

impl CubeFile {
    pub fn new(name: impl Into<String>, dim_count: usize) -> Self {
        CubeFile {
            name: name.into(),
            dim_count,
            timestamp: now_micros(),
            aliases: Vec::new(),
            numeric: Vec::new(),
            text: Vec::new(),
        }
    }

    /// Current stored cells of a cube, sorted by path.
    pub fn from_cube(cube: &Cube) -> Self {
        let snapshot = cube.snapshot();
        let mut file = CubeFile::new(cube.name(), cube.dim_count());
        for (path, value) in snapshot.numeric.entries_sorted() {
            match value {
                CellValue::Number(n) => file.numeric.push((path, n)),
                other => log_debug!("FILE", "cube '{}': {:?} at {:?} not saved", cube.name(), other, path),
            }
        }
        for (path, value) in snapshot.text.entries_sorted() {
            if let CellValue::Text(s) = value {
                file.text.push((path, s));
            }
        }
        file
    }

    /// Cells with the alias remap applied.
    pub fn into_cells(self) -> Vec<(CellPath, CellValue)> {
        let remap: FxHashMap<(usize, ElementId), ElementId> =
            self.aliases.iter().map(|a| ((a.dimension, a.from), a.to)).collect();
        let apply = |mut path: CellPath| {
            if !remap.is_empty() {
                for (dim, element) in path.iter_mut().enumerate() {
                    if let Some(to) = remap.get(&(dim, *element)) {
                        *element = *to;
                    }
                }
            }
            path
        };
        let mut cells = Vec::with_capacity(self.numeric.len() + self.text.len());
        cells.extend(self.numeric.into_iter().map(|(p, v)| (apply(p), CellValue::Number(v))));
        cells.extend(self.text.into_iter().map(|(p, v)| (apply(p), CellValue::Text(v))));
        cells
    }

    pub fn cell_count(&self) -> usize {
        self.numeric.len() + self.text.len()
    }
}

/// Timestamps are kept at microsecond precision so text and binary agree.
fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

// ============================================================================
// SAVE
// ============================================================================

/// Writes the text file and its binary cache.
pub fn save_cube_file(file: &CubeFile, text_path: &Path, binary_path: &Path) -> Result<(), PersistenceError> {
    write_text(file, text_path)?;
    write_binary(file, binary_path)?;
    Ok(())
}

pub fn write_text(file: &CubeFile, path: &Path) -> Result<(), PersistenceError> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", SECTION_CUBE)?;
    writeln!(out, "NAME;{}", file.name)?;
    writeln!(out, "VERSION;{}", CUBE_FILE_VERSION)?;
    writeln!(out, "DIMENSIONS;{}", file.dim_count)?;
    writeln!(out, "TIMESTAMP;{}", file.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))?;

    if !file.aliases.is_empty() {
        writeln!(out, "{}", SECTION_ALIAS)?;
        for alias in &file.aliases {
            writeln!(out, "{};{};{}", alias.dimension, alias.from, alias.to)?;
        }
    }

    writeln!(out, "{}", SECTION_NUMERIC)?;
    for (path, value) in &file.numeric {
        writeln!(out, "{};{}", join_path(path), value)?;
    }
    writeln!(out, "{}", SECTION_STRING)?;
    for (path, value) in &file.text {
        writeln!(out, "{};{}", join_path(path), serde_json::to_string(value)?)?;
    }
    out.flush()?;
    Ok(())
}

fn join_path(path: &CellPath) -> String {
    path.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(";")
}

pub fn write_binary(file: &CubeFile, path: &Path) -> Result<(), PersistenceError> {
    let mut out = BufWriter::new(File::create(path)?);
    out.write_all(BINARY_MAGIC)?;
    out.write_all(&CUBE_FILE_VERSION.to_ne_bytes())?;
    out.write_all(&BYTE_ORDER_TAG.to_ne_bytes())?;
    out.write_all(&file.timestamp.timestamp_micros().to_ne_bytes())?;
    out.write_all(&(file.dim_count as u32).to_ne_bytes())?;

    out.write_all(&(file.numeric.len() as u64).to_ne_bytes())?;
    for (path, value) in &file.numeric {
        for element in path {
            out.write_all(&element.to_ne_bytes())?;
        }
        out.write_all(&value.to_ne_bytes())?;
    }
    out.write_all(&(file.text.len() as u64).to_ne_bytes())?;
    for (path, value) in &file.text {
        for element in path {
            out.write_all(&element.to_ne_bytes())?;
        }
        out.write_all(&(value.len() as u32).to_ne_bytes())?;
        out.write_all(value.as_bytes())?;
    }
    out.flush()?;
    Ok(())
}

// ============================================================================
// LOAD
// ============================================================================

/// Loads a cube file, preferring the binary cache when it matches the text file.
pub fn load_cube_file(text_path: &Path, binary_path: &Path) -> Result<CubeFile, PersistenceError> {
    let header = read_text_file(text_path, false)?;
    if binary_path.exists() {
        match read_binary(binary_path, &header) {
            Ok(file) => return Ok(file),
            Err(e) => log_warn!(
                "FILE",
                "binary cube file {} not usable ({}); loading {}",
                binary_path.display(),
                e,
                text_path.display()
            ),
        }
    }
    read_text_file(text_path, true)
}

pub fn read_text(path: &Path) -> Result<CubeFile, PersistenceError> {
    read_text_file(path, true)
}

#[derive(PartialEq)]
enum Section {
    None,
    Cube,
    Alias,
    Numeric,
    Text,
}

/// Parses the text file. Without `values` parsing stops at the first value section.
fn read_text_file(path: &Path, values: bool) -> Result<CubeFile, PersistenceError> {
    let reader = BufReader::new(File::open(path)?);
    let mut file = CubeFile::new("", 0);
    let mut seen_header = false;
    let mut section = Section::None;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let number = index + 1;
        match line {
            SECTION_CUBE => {
                section = Section::Cube;
                seen_header = true;
                continue;
            }
            SECTION_ALIAS => {
                section = Section::Alias;
                continue;
            }
            SECTION_NUMERIC | SECTION_STRING => {
                if !values {
                    break;
                }
                section = if line == SECTION_NUMERIC { Section::Numeric } else { Section::Text };
                continue;
            }
            _ => {}
        }

        match section {
            Section::None => {
                return Err(invalid(path, number, "data before the [CUBE] section"));
            }
            Section::Cube => {
                let (key, value) = line.split_once(';').ok_or_else(|| invalid(path, number, "expected KEY;VALUE"))?;
                match key {
                    "NAME" => file.name = value.to_string(),
                    "VERSION" => {
                        let version: u32 = value.parse().map_err(|_| invalid(path, number, "bad version"))?;
                        if version > CUBE_FILE_VERSION {
                            return Err(PersistenceError::UnsupportedVersion(version));
                        }
                    }
                    "DIMENSIONS" => {
                        file.dim_count = value.parse().map_err(|_| invalid(path, number, "bad dimension count"))?;
                    }
                    "TIMESTAMP" => {
                        file.timestamp = DateTime::parse_from_rfc3339(value)
                            .map_err(|_| invalid(path, number, "bad timestamp"))?
                            .with_timezone(&Utc);
                    }
                    _ => log_debug!("FILE", "{}:{}: unknown header key '{}'", path.display(), number, key),
                }
            }
            Section::Alias => {
                let fields: Vec<&str> = line.split(';').collect();
                let parsed: Option<Vec<u32>> = fields.iter().map(|f| f.parse().ok()).collect();
                match parsed.as_deref() {
                    Some([dimension, from, to]) => file.aliases.push(ElementAlias {
                        dimension: *dimension as usize,
                        from: *from,
                        to: *to,
                    }),
                    _ => return Err(invalid(path, number, "expected DIMENSION;FROM;TO")),
                }
            }
            Section::Numeric => {
                let (cell, value) = split_cell(line, file.dim_count).ok_or_else(|| invalid(path, number, "bad cell"))?;
                let value: f64 = value.parse().map_err(|_| invalid(path, number, "bad number"))?;
                file.numeric.push((cell, value));
            }
            Section::Text => {
                let (cell, value) = split_cell(line, file.dim_count).ok_or_else(|| invalid(path, number, "bad cell"))?;
                let value: String = serde_json::from_str(value).map_err(|_| invalid(path, number, "bad string"))?;
                file.text.push((cell, value));
            }
        }
    }

    if !seen_header || file.dim_count == 0 {
        return Err(PersistenceError::InvalidFormat(format!("{}: missing cube header", path.display())));
    }
    Ok(file)
}

/// Splits `e1;e2;...;value` into the path and the raw value.
fn split_cell(line: &str, dim_count: usize) -> Option<(CellPath, &str)> {
    let mut path = CellPath::with_capacity(dim_count);
    let mut rest = line;
    for _ in 0..dim_count {
        let (element, tail) = rest.split_once(';')?;
        path.push(element.parse().ok()?);
        rest = tail;
    }
    Some((path, rest))
}

fn invalid(path: &Path, line: usize, message: &str) -> PersistenceError {
    PersistenceError::InvalidFormat(format!("{}:{}: {}", path.display(), line, message))
}

/// Bounds-checked reader over the binary file.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], PersistenceError> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.bytes.len());
        match end {
            Some(end) => {
                let bytes = self.bytes;
                let slice = &bytes[self.pos..end];
                self.pos = end;
                Ok(slice)
            }
            None => Err(PersistenceError::InvalidFormat(format!("binary file truncated at byte {}", self.pos))),
        }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PersistenceError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, PersistenceError> {
        Ok(u32::from_ne_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, PersistenceError> {
        Ok(u64::from_ne_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, PersistenceError> {
        Ok(i64::from_ne_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, PersistenceError> {
        Ok(f64::from_ne_bytes(self.array()?))
    }

    fn path(&mut self, dim_count: usize) -> Result<CellPath, PersistenceError> {
        let mut path = CellPath::with_capacity(dim_count);
        for _ in 0..dim_count {
            path.push(self.u32()?);
        }
        Ok(path)
    }
}

/// Reads the binary cache. `header` is the text file header it must match.
pub fn read_binary(path: &Path, header: &CubeFile) -> Result<CubeFile, PersistenceError> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let mut reader = ByteReader { bytes: &bytes, pos: 0 };

    if reader.take(BINARY_MAGIC.len())? != BINARY_MAGIC {
        return Err(PersistenceError::InvalidFormat("not a binary cube file".to_string()));
    }
    let version = reader.u32()?;
    if version != CUBE_FILE_VERSION {
        return Err(PersistenceError::UnsupportedVersion(version));
    }
    if reader.u32()? != BYTE_ORDER_TAG {
        return Err(PersistenceError::InvalidFormat("byte order differs".to_string()));
    }
    let timestamp = reader.i64()?;
    if timestamp != header.timestamp.timestamp_micros() {
        return Err(PersistenceError::InvalidFormat("binary file is older than the text file".to_string()));
    }
    let dim_count = reader.u32()? as usize;
    if dim_count != header.dim_count {
        return Err(PersistenceError::InvalidFormat(format!(
            "binary file has {} dimensions, text file {}",
            dim_count, header.dim_count
        )));
    }

    let mut file = CubeFile {
        name: header.name.clone(),
        dim_count,
        timestamp: header.timestamp,
        aliases: header.aliases.clone(),
        numeric: Vec::new(),
        text: Vec::new(),
    };
    let numeric_count = reader.u64()?;
    for _ in 0..numeric_count {
        let cell = reader.path(dim_count)?;
        file.numeric.push((cell, reader.f64()?));
    }
    let text_count = reader.u64()?;
    for _ in 0..text_count {
        let cell = reader.path(dim_count)?;
        let len = reader.u32()? as usize;
        let value = std::str::from_utf8(reader.take(len)?)
            .map_err(|_| PersistenceError::InvalidFormat("string value is not UTF-8".to_string()))?;
        file.text.push((cell, value.to_string()));
    }
    if reader.pos != bytes.len() {
        return Err(PersistenceError::InvalidFormat("trailing bytes after string section".to_string()));
    }
    Ok(file)
}
