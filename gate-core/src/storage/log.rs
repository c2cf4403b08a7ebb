use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use fs4::FileExt;
use crate::error::{CResult, Error};
use crate::storage::KeyDir;

/// An append-only log file, containing a sequence of key/value entries
/// encoded as follows:
///
/// - Key length as big-endian u32.
/// - Value length as big-endian i32, or -1 for tombstones.
/// - Key as raw bytes (max 2 GB).
/// - Value as raw bytes (max 2 GB).
pub struct Log {
    /// Path to the log file.
    pub(crate) path: PathBuf,
    /// The opened file containing the log.
    pub(crate) file: std::fs::File,
}

impl Log {
    /// Opens a log file, creating it if it doesn't exist, and takes an
    /// exclusive lock on it for the lifetime of this handle.
    pub fn new(path: PathBuf) -> CResult<Self> {
        Self::new_with_lock(path, true)
    }

    pub fn new_with_lock(path: PathBuf, try_lock: bool) -> CResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|err| Error::Internal(format!("creating {:?}: {err}", dir)))?;
        }

        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        if try_lock {
            file.try_lock_exclusive()?;
        }

        Ok(Self { path, file })
    }

    /// Replays the log from the start to rebuild the keydir, as happens
    /// whenever a bucket is opened. Each entry either sets or removes its
    /// key's keydir slot depending on whether it carried a tombstone.
    /// A truncated final entry (an interrupted write) is discarded and the
    /// file is truncated back to the last complete entry.
    pub fn build_keydir(&mut self) -> CResult<KeyDir> {
        let mut len_buf = [0u8; 4];
        let mut keydir = KeyDir::new();
        let file_len = self.file.metadata()?.len();
        let mut r = BufReader::new(&mut self.file);

        let mut pos = r.seek(SeekFrom::Start(0))?;

        while pos < file_len {
            // Reads the next entry, returning the key, the value's offset,
            // and its length (or `None` for a tombstone).
            let mut result = || -> Result<(Vec<u8>, u64, Option<u32>), std::io::Error> {
                r.read_exact(&mut len_buf)?;
                let key_len = u32::from_be_bytes(len_buf);
                r.read_exact(&mut len_buf)?;
                let value_len_or_tombstone = match i32::from_be_bytes(len_buf) {
                    l if l >= 0 => Some(l as u32),
                    _ => None, // -1 for tombstones
                };
                let value_pos = pos + 4 + 4 + key_len as u64;

                let mut key = vec![0; key_len as usize];
                r.read_exact(&mut key)?;

                if let Some(value_len) = value_len_or_tombstone {
                    if value_pos + value_len as u64 > file_len {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            "value extends beyond end of file",
                        ));
                    }
                    r.seek_relative(value_len as i64)?; // avoids discarding buffer
                }

                Ok((key, value_pos, value_len_or_tombstone))
            };

            match result() {
                // Populate the keydir with the entry, or remove it on tombstones.
                Ok((key, value_pos, Some(value_len))) => {
                    keydir.insert(key, (value_pos, value_len));
                    pos = value_pos + value_len as u64;
                }
                Ok((key, value_pos, None)) => {
                    keydir.remove(&key);
                    pos = value_pos;
                }

                // An incomplete entry at the end of the file means a write
                // was interrupted; discard it and truncate back to the
                // last complete entry.
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    log::error!("Found incomplete entry at offset {}, truncating file", pos);
                    self.file.set_len(pos)?;
                    break;
                }
                Err(err) => return Err(err.into()),
            }
        }

        Ok(keydir)
    }

    /// Reads back a value previously written at `value_pos`/`value_len`.
    pub fn read_value(&mut self, value_pos: u64, value_len: u32) -> CResult<Vec<u8>> {
        let mut value = vec![0; value_len as usize];
        self.file.seek(SeekFrom::Start(value_pos))?;
        self.file.read_exact(&mut value)?;
        Ok(value)
    }

    /// Appends one key/value entry (`value == None` writes a tombstone)
    /// and returns its `(offset, total length)`, for the caller to derive
    /// the value's own offset/length to store in the keydir.
    pub fn write_entry(&mut self, key: &[u8], value: Option<&[u8]>) -> CResult<(u64, u32)> {
        let key_len = key.len() as u32;
        let value_len = value.map_or(0, |v| v.len() as u32);
        let value_len_or_tombstone = value.map_or(-1, |v| v.len() as i32);
        let len = 4 + 4 + key_len + value_len;

        let pos = self.file.seek(SeekFrom::End(0))?;
        let mut w = BufWriter::with_capacity(len as usize, &mut self.file);
        w.write_all(&key_len.to_be_bytes())?;
        w.write_all(&value_len_or_tombstone.to_be_bytes())?;
        w.write_all(key)?;
        if let Some(value) = value {
            w.write_all(value)?;
        }
        w.flush()?;

        Ok((pos, len))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn new_log_starts_with_an_empty_keydir() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::new(dir.path().join("bucket")).unwrap();
        assert!(log.build_keydir().unwrap().is_empty());
    }

    #[test]
    fn write_then_read_round_trips_the_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = Log::new(dir.path().join("bucket")).unwrap();

        let (pos, len) = log.write_entry(b"a", Some(b"hello")).unwrap();
        let value_pos = pos + len as u64 - 5;
        assert_eq!(log.read_value(value_pos, 5).unwrap(), b"hello");
    }

    #[test]
    fn build_keydir_replays_sets_and_tombstones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket");
        {
            let mut log = Log::new(path.clone()).unwrap();
            log.write_entry(b"a", Some(b"1")).unwrap();
            log.write_entry(b"b", Some(b"2")).unwrap();
            log.write_entry(b"a", None).unwrap();
        }

        let mut log = Log::new_with_lock(path, false).unwrap();
        let keydir = log.build_keydir().unwrap();
        assert!(!keydir.contains_key(b"a".as_slice()));
        let (pos, len) = keydir[b"b".as_slice()];
        assert_eq!(log.read_value(pos, len).unwrap(), b"2");
    }

    #[test]
    fn truncated_trailing_entry_is_discarded_on_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bucket");
        {
            let mut log = Log::new(path.clone()).unwrap();
            log.write_entry(b"a", Some(b"1")).unwrap();
        }
        // Simulate a write interrupted mid-entry: a length prefix with no
        // payload behind it.
        {
            let file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            let mut w = BufWriter::new(file);
            w.write_all(&3u32.to_be_bytes()).unwrap();
            w.write_all(&2i32.to_be_bytes()).unwrap();
            w.flush().unwrap();
        }

        let full_len = std::fs::metadata(&path).unwrap().len();
        let mut log = Log::new_with_lock(path.clone(), false).unwrap();
        let keydir = log.build_keydir().unwrap();
        assert_eq!(keydir.len(), 1);
        assert!(std::fs::metadata(&path).unwrap().len() < full_len);
    }
}
