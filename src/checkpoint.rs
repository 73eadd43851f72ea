//! Persisted intermediate files shared between pipeline stages.
//!
//! Key sets are plain line-delimited decimal files, richer records are JSON.
//! Every whole-file write goes through a temp file in the target directory and
//! is renamed into place, so a crashed run never leaves a half-written
//! checkpoint behind.

use crate::core::{EntityKey, ReconcileError, Result};
use serde::Serialize;
use serde::de::{self, DeserializeOwned, DeserializeSeed, SeqAccess, Visitor};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Where a stage result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageSource {
    Computed,
    Checkpoint,
}

/// A stage result tagged with its origin.
#[derive(Debug, Clone)]
pub struct Staged<T> {
    pub value: T,
    pub source: StageSource,
}

impl<T> Staged<T> {
    pub fn computed(value: T) -> Self {
        Self {
            value,
            source: StageSource::Computed,
        }
    }

    pub fn checkpoint(value: T) -> Self {
        Self {
            value,
            source: StageSource::Checkpoint,
        }
    }
}

// ============================================================================
// Key files
// ============================================================================

/// Lazily parsed line-delimited key file. Blank lines are skipped.
pub struct KeyLines<R> {
    path: PathBuf,
    lines: Lines<R>,
    line_no: usize,
}

impl<R: BufRead> KeyLines<R> {
    pub fn new(path: impl Into<PathBuf>, reader: R) -> Self {
        Self {
            path: path.into(),
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R: BufRead> Iterator for KeyLines<R> {
    type Item = Result<EntityKey>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = self.lines.next()?;
            self.line_no += 1;
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(ReconcileError::io(&self.path, err))),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(parse_key(trimmed).map_err(|_| {
                ReconcileError::Malformed(format!(
                    "{}:{}: '{}' is not a process instance key",
                    self.path.display(),
                    self.line_no,
                    trimmed
                ))
            }));
        }
    }
}

fn parse_key(raw: &str) -> std::result::Result<EntityKey, std::num::ParseIntError> {
    raw.parse::<EntityKey>()
}

pub fn open_key_lines(path: &Path) -> Result<KeyLines<BufReader<File>>> {
    let file = File::open(path).map_err(|err| ReconcileError::io(path, err))?;
    Ok(KeyLines::new(path, BufReader::new(file)))
}

pub fn read_keys(path: &Path) -> Result<Vec<EntityKey>> {
    open_key_lines(path)?.collect()
}

pub fn write_keys(path: &Path, keys: &[EntityKey]) -> Result<()> {
    write_atomic(path, |writer| {
        for key in keys {
            writeln!(writer, "{}", key).map_err(|err| ReconcileError::io(path, err))?;
        }
        Ok(())
    })
}

// ============================================================================
// JSON files
// ============================================================================

pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, |writer| {
        serde_json::to_writer(&mut *writer, value)
            .map_err(|err| ReconcileError::io(path, err.into()))
    })
}

/// Writes `items` as one JSON array without collecting them first.
///
/// Returns the number of elements written. The first item error aborts the
/// write and leaves any previous file at `path` untouched.
pub fn write_json_seq<T, I>(path: &Path, items: I) -> Result<usize>
where
    T: Serialize,
    I: IntoIterator<Item = Result<T>>,
{
    let mut count = 0usize;
    write_atomic(path, |writer| {
        let io_err = |err: std::io::Error| ReconcileError::io(path, err);
        writer.write_all(b"[").map_err(io_err)?;
        for item in items {
            let item = item?;
            if count > 0 {
                writer.write_all(b",").map_err(io_err)?;
            }
            serde_json::to_writer(&mut *writer, &item).map_err(|err| io_err(err.into()))?;
            count += 1;
        }
        writer.write_all(b"]").map_err(io_err)
    })?;
    Ok(count)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let file = File::open(path).map_err(|err| ReconcileError::io(path, err))?;
    serde_json::from_reader(BufReader::new(file)).map_err(|err| {
        ReconcileError::Malformed(format!("{}: {}", path.display(), err))
    })
}

/// Streams a top-level JSON array from `path`, handing elements to `on_batch`
/// in chunks of at most `batch_size` without materialising the whole array.
///
/// Returns the number of elements read.
pub fn for_each_json_batch<T, F>(path: &Path, batch_size: usize, mut on_batch: F) -> Result<usize>
where
    T: DeserializeOwned,
    F: FnMut(Vec<T>) -> Result<()>,
{
    if batch_size == 0 {
        return Err(ReconcileError::Config("batch size must be positive".to_string()));
    }
    let file = File::open(path).map_err(|err| ReconcileError::io(path, err))?;
    let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
    let mut callback_error = None;

    let outcome = BatchSeed {
        batch_size,
        on_batch: &mut on_batch,
        callback_error: &mut callback_error,
        _marker: PhantomData,
    }
    .deserialize(&mut deserializer);

    if let Some(err) = callback_error {
        return Err(err);
    }
    let total = outcome
        .map_err(|err| ReconcileError::Malformed(format!("{}: {}", path.display(), err)))?;
    deserializer
        .end()
        .map_err(|err| ReconcileError::Malformed(format!("{}: {}", path.display(), err)))?;
    Ok(total)
}

struct BatchSeed<'a, T, F> {
    batch_size: usize,
    on_batch: &'a mut F,
    callback_error: &'a mut Option<ReconcileError>,
    _marker: PhantomData<T>,
}

impl<'de, T, F> DeserializeSeed<'de> for BatchSeed<'_, T, F>
where
    T: DeserializeOwned,
    F: FnMut(Vec<T>) -> Result<()>,
{
    type Value = usize;

    fn deserialize<D>(self, deserializer: D) -> std::result::Result<usize, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        deserializer.deserialize_seq(self)
    }
}

impl<'de, T, F> Visitor<'de> for BatchSeed<'_, T, F>
where
    T: DeserializeOwned,
    F: FnMut(Vec<T>) -> Result<()>,
{
    type Value = usize;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a JSON array of records")
    }

    fn visit_seq<A>(self, mut seq: A) -> std::result::Result<usize, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut batch = Vec::with_capacity(self.batch_size.min(4096));
        let mut total = 0usize;
        while let Some(item) = seq.next_element::<T>()? {
            batch.push(item);
            total += 1;
            if batch.len() >= self.batch_size {
                if let Err(err) = (self.on_batch)(std::mem::take(&mut batch)) {
                    *self.callback_error = Some(err);
                    return Err(de::Error::custom("batch handler failed"));
                }
            }
        }
        if !batch.is_empty() {
            if let Err(err) = (self.on_batch)(batch) {
                *self.callback_error = Some(err);
                return Err(de::Error::custom("batch handler failed"));
            }
        }
        Ok(total)
    }
}

// ============================================================================
// Plumbing
// ============================================================================

fn write_atomic<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<NamedTempFile>) -> Result<()>,
{
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|err| ReconcileError::io(parent, err))?;

    let temp = NamedTempFile::new_in(parent).map_err(|err| ReconcileError::io(parent, err))?;
    let mut writer = BufWriter::new(temp);
    fill(&mut writer)?;
    let temp = writer
        .into_inner()
        .map_err(|err| ReconcileError::io(path, err.into_error()))?;
    temp.persist(path)
        .map_err(|err| ReconcileError::io(path, err.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FlowNodeRef;
    use tempfile::tempdir;

    #[test]
    fn keys_survive_a_write_read_cycle_and_skip_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys");
        write_keys(&path, &[3, 1, 2]).unwrap();
        fs::write(&path, format!("{}\n\n", fs::read_to_string(&path).unwrap())).unwrap();

        assert_eq!(read_keys(&path).unwrap(), vec![3, 1, 2]);
    }

    #[test]
    fn bad_key_line_reports_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys");
        fs::write(&path, "1\nnope\n").unwrap();

        let err = read_keys(&path).unwrap_err();
        let message = err.to_string();
        assert!(message.contains(":2:"), "{}", message);
        assert!(message.contains("nope"), "{}", message);
    }

    #[test]
    fn json_array_is_streamed_in_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("refs.json");
        let refs: Vec<FlowNodeRef> = (0..7)
            .map(|i| FlowNodeRef {
                key: i.to_string(),
                process_instance_key: i,
            })
            .collect();
        write_json(&path, &refs).unwrap();

        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        let total = for_each_json_batch(&path, 3, |batch: Vec<FlowNodeRef>| {
            sizes.push(batch.len());
            seen.extend(batch);
            Ok(())
        })
        .unwrap();

        assert_eq!(total, 7);
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(seen, refs);
    }

    #[test]
    fn streamed_array_write_counts_items() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seq.json");
        let count = write_json_seq(&path, (1u64..=3).map(Ok)).unwrap();
        assert_eq!(count, 3);
        assert_eq!(read_json::<Vec<u64>>(&path).unwrap(), vec![1, 2, 3]);

        let empty = dir.path().join("empty.json");
        assert_eq!(write_json_seq(&empty, std::iter::empty::<Result<u64>>()).unwrap(), 0);
        assert!(read_json::<Vec<u64>>(&empty).unwrap().is_empty());
    }

    #[test]
    fn batch_handler_error_is_returned_as_is() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("refs.json");
        write_json(&path, &[1u64, 2, 3]).unwrap();

        let err = for_each_json_batch(&path, 2, |_: Vec<u64>| {
            Err(ReconcileError::Config("stop".to_string()))
        })
        .unwrap_err();
        assert!(matches!(err, ReconcileError::Config(msg) if msg == "stop"));
    }
}
