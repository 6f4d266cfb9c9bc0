//! In-memory loop store for tests and embedded use.

use std::sync::RwLock;

use super::traits::LoopStore;
use crate::domain::Loop;
use crate::error::{RalphdError, Result};

/// Keeps records in insertion order behind an RwLock.
#[derive(Default)]
pub struct MemoryLoopStore {
    records: RwLock<Vec<Loop>>,
}

impl MemoryLoopStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoopStore for MemoryLoopStore {
    fn create(&self, record: &Loop) -> Result<()> {
        let mut records = self.records.write().map_err(|e| RalphdError::Storage(e.to_string()))?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(RalphdError::Storage(format!("duplicate loop id: {}", record.id)));
        }
        records.push(record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<Loop>> {
        let records = self.records.read().map_err(|e| RalphdError::Storage(e.to_string()))?;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    fn list(&self) -> Result<Vec<Loop>> {
        let records = self.records.read().map_err(|e| RalphdError::Storage(e.to_string()))?;
        Ok(records.clone())
    }

    fn update(&self, record: &Loop) -> Result<()> {
        let mut records = self.records.write().map_err(|e| RalphdError::Storage(e.to_string()))?;
        match records.iter_mut().find(|r| r.id == record.id) {
            Some(slot) => {
                *slot = record.clone();
                Ok(())
            }
            None => Err(RalphdError::LoopNotFound(record.id.clone())),
        }
    }

    fn delete(&self, id: &str) -> Result<()> {
        let mut records = self.records.write().map_err(|e| RalphdError::Storage(e.to_string()))?;
        records.retain(|r| r.id != id);
        Ok(())
    }
}
