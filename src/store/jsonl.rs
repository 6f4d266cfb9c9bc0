//! JSONL-backed loop store with an in-memory cache.
//!
//! Records live one-per-line in `loops.jsonl`. Creates append; updates and
//! deletes rewrite the file from cache. The file is the source of truth and
//! is written before the cache mutates.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::traits::LoopStore;
use crate::domain::Loop;
use crate::error::{RalphdError, Result};

const LOOPS_FILE: &str = "loops.jsonl";

pub struct JsonlLoopStore {
    path: PathBuf,
    cache: RwLock<Vec<Loop>>,
}

impl JsonlLoopStore {
    /// Open (or create) a store rooted at the given directory.
    pub fn open(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path.as_ref();
        fs::create_dir_all(base_path)?;
        let path = base_path.join(LOOPS_FILE);

        let records = if path.exists() {
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            let mut records = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                records.push(serde_json::from_str(&line)?);
            }
            records
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            cache: RwLock::new(records),
        })
    }

    fn append_to_file(&self, record: &Loop) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(record)?)?;
        Ok(())
    }

    fn rewrite_file(&self, records: &[Loop]) -> Result<()> {
        let mut file = File::create(&self.path)?;
        for record in records {
            writeln!(file, "{}", serde_json::to_string(record)?)?;
        }
        Ok(())
    }
}

impl LoopStore for JsonlLoopStore {
    fn create(&self, record: &Loop) -> Result<()> {
        let mut cache = self.cache.write().map_err(|e| RalphdError::Storage(e.to_string()))?;
        if cache.iter().any(|r| r.id == record.id) {
            return Err(RalphdError::Storage(format!("duplicate loop id: {}", record.id)));
        }
        self.append_to_file(record)?;
        cache.push(record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Loop>> {
        let cache = self.cache.read().map_err(|e| RalphdError::Storage(e.to_string()))?;
        Ok(cache.iter().find(|r| r.id == id).cloned())
    }

    fn list(&self) -> Result<Vec<Loop>> {
        let cache = self.cache.read().map_err(|e| RalphdError::Storage(e.to_string()))?;
        Ok(cache.clone())
    }

    fn update(&self, record: &Loop) -> Result<()> {
        let mut cache = self.cache.write().map_err(|e| RalphdError::Storage(e.to_string()))?;
        let Some(index) = cache.iter().position(|r| r.id == record.id) else {
            return Err(RalphdError::LoopNotFound(record.id.clone()));
        };
        let mut next = cache.clone();
        next[index] = record.clone();
        self.rewrite_file(&next)?;
        *cache = next;
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut cache = self.cache.write().map_err(|e| RalphdError::Storage(e.to_string()))?;
        if !cache.iter().any(|r| r.id == id) {
            return Ok(());
        }
        let next: Vec<Loop> = cache.iter().filter(|r| r.id != id).cloned().collect();
        self.rewrite_file(&next)?;
        *cache = next;
        Ok(())
    }
}
