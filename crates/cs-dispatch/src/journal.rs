use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use cs_types::{internal_error, CsResult, EvaluationResult};

/// Append-only JSON-lines file with one fsync per record.
///
/// A single writer per file is assumed. A torn final line (crash during a
/// write) is skipped when reading and truncated away when the log is opened
/// for appending.
#[derive(Debug)]
pub struct AppendLog<T> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<fn(T)>,
}

/// Every finished evaluation, in completion order.
pub type ResultLog = AppendLog<EvaluationResult>;

impl<T: Serialize + DeserializeOwned> AppendLog<T> {
    pub fn open(path: impl Into<PathBuf>) -> CsResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        let complete = complete_prefix_len(&mut file, len)?;
        if complete < len {
            warn!(path = ?path, dropped_bytes = len - complete, "Truncating torn final record");
            file.set_len(complete)?;
            file.sync_data()?;
        }

        Ok(Self {
            path,
            file: Mutex::new(file),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &T) -> CsResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    pub fn read_all(&self) -> CsResult<Vec<T>> {
        read_records(&self.path)
    }
}

/// Length of the file up to and including its last newline.
fn complete_prefix_len(file: &mut File, len: u64) -> std::io::Result<u64> {
    const CHUNK: u64 = 4096;
    let mut end = len;
    let mut buffer = vec![0u8; CHUNK as usize];
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buffer[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}

/// Read every record of a JSON-lines file; a missing file reads as empty.
///
/// An unparseable last line is treated as a torn write and skipped; an
/// unparseable line anywhere else is an error.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> CsResult<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<Result<_, _>>()?;
    let last_content = lines.iter().rposition(|l| !l.trim().is_empty());

    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if Some(idx) == last_content => {
                warn!(path = ?path, line = idx + 1, error = %e, "Skipping torn final record");
            }
            Err(e) => {
                return Err(internal_error!(
                    "Corrupted record in {}:{}: {}",
                    path.display(),
                    idx + 1,
                    e
                ))
            }
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Entry {
        n: u32,
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let log: AppendLog<Entry> = AppendLog::open(dir.path().join("nested/log.jsonl")).unwrap();
        log.append(&Entry { n: 1 }).unwrap();
        log.append(&Entry { n: 2 }).unwrap();
        assert_eq!(log.read_all().unwrap(), vec![Entry { n: 1 }, Entry { n: 2 }]);
    }

    #[test]
    fn torn_tail_is_skipped_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1}\n{\"n\":").unwrap();

        let records: Vec<Entry> = read_records(&path).unwrap();
        assert_eq!(records, vec![Entry { n: 1 }]);

        let log: AppendLog<Entry> = AppendLog::open(&path).unwrap();
        log.append(&Entry { n: 3 }).unwrap();
        assert_eq!(log.read_all().unwrap(), vec![Entry { n: 1 }, Entry { n: 3 }]);
    }

    #[test]
    fn corruption_in_the_middle_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        std::fs::write(&path, "{\"n\":1}\nnot json\n{\"n\":2}\n").unwrap();
        assert!(read_records::<Entry>(&path).is_err());
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<Entry> = read_records(&dir.path().join("absent.jsonl")).unwrap();
        assert!(records.is_empty());
    }
}
