//! Newline-delimited JSON streams and atomic JSON files.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Errors reading or writing output files
#[derive(Debug, thiserror::Error)]
pub enum JsonlError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error on {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl JsonlError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        JsonlError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Append-only writer, one JSON value per line
#[derive(Debug)]
pub struct JsonlWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlWriter {
    /// Open for appending, creating the file and parent directories as needed.
    ///
    /// A trailing partial line left by an interrupted write is terminated so
    /// new records start on a fresh line.
    pub fn append(path: &Path) -> Result<Self, JsonlError> {
        ensure_parent(path)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| JsonlError::io(path, e))?;

        if ends_without_newline(&mut file).map_err(|e| JsonlError::io(path, e))? {
            file.write_all(b"\n").map_err(|e| JsonlError::io(path, e))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    /// Create or truncate the file
    pub fn create(path: &Path) -> Result<Self, JsonlError> {
        ensure_parent(path)?;
        let file = File::create(path).map_err(|e| JsonlError::io(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one value as a line
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), JsonlError> {
        serde_json::to_writer(&mut self.writer, value).map_err(|e| JsonlError::Json {
            path: self.path.clone(),
            source: e,
        })?;
        self.writer
            .write_all(b"\n")
            .map_err(|e| JsonlError::io(&self.path, e))
    }

    /// Flush buffered lines to the OS
    pub fn flush(&mut self) -> Result<(), JsonlError> {
        self.writer
            .flush()
            .map_err(|e| JsonlError::io(&self.path, e))
    }
}

fn ends_without_newline(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

fn ensure_parent(path: &Path) -> Result<(), JsonlError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| JsonlError::io(parent, e))
        }
        _ => Ok(()),
    }
}

/// Read every parseable line of a JSONL file.
///
/// A missing file reads as empty. Lines that fail to parse (typically a
/// record torn by an interrupted run) are skipped with a warning.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, JsonlError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(JsonlError::io(path, e)),
    };

    let mut items = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| JsonlError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(item) => items.push(item),
            Err(e) => tracing::warn!(
                "Skipping unreadable line {} of {}: {}",
                index + 1,
                path.display(),
                e
            ),
        }
    }
    Ok(items)
}

/// Read a JSON file, `None` when it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, JsonlError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(JsonlError::io(path, e)),
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| JsonlError::Json {
            path: path.to_path_buf(),
            source: e,
        })
}

/// Write pretty JSON through a temporary file and rename it into place, so
/// readers never observe a half-written file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), JsonlError> {
    ensure_parent(path)?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| JsonlError::io(path, e))?;
    serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| JsonlError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    tmp.write_all(b"\n").map_err(|e| JsonlError::io(path, e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| JsonlError::io(path, e))?;
    tmp.persist(path)
        .map_err(|e| JsonlError::io(path, e.error))?;
    Ok(())
}
