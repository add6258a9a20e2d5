//! Descriptors and the per-descriptor birth-time store.
//!
//! A birth time only ever moves earlier: `lower_if_earlier` is the correction
//! path used by the scanner, and `reimport` is the single explicit exception.

use crate::chain::hash_newtype;
use crate::error::{ScanError, ScanResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

hash_newtype!(DescriptorId);

/// An output-script matching rule. Matching is script equality; deriving the
/// script set from keys happens before a descriptor reaches this crate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub label: String,
    pub scripts: Vec<Vec<u8>>,
}

impl Descriptor {
    /// Watch-only descriptor for a single output script.
    pub fn watch_script(script: Vec<u8>) -> Self {
        Self { label: format!("raw({})", hex::encode(&script)), scripts: vec![script] }
    }

    pub fn id(&self) -> DescriptorId {
        let mut h = blake3::Hasher::new();
        h.update(b"walletscan/descriptor");
        h.update(self.label.as_bytes());
        for script in &self.scripts {
            h.update(&(script.len() as u32).to_le_bytes());
            h.update(script);
        }
        DescriptorId(*h.finalize().as_bytes())
    }

    pub fn matches(&self, script: &[u8]) -> bool {
        self.scripts.iter().any(|s| s == script)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorRecord {
    pub descriptor: Descriptor,
    /// Unix seconds; lower bound on when this descriptor can have received funds
    pub birth_time: u64,
    /// Height of the block that last lowered `birth_time`, when known
    pub birth_height: Option<u64>,
    /// Set once a complete scan from the birth time through a chain tip was applied
    pub verified: bool,
}

#[derive(Debug, Default)]
pub struct BirthTimeStore {
    records: BTreeMap<DescriptorId, DescriptorRecord>,
    by_script: HashMap<Vec<u8>, Vec<DescriptorId>>,
}

impl BirthTimeStore {
    pub fn from_records(records: impl IntoIterator<Item = DescriptorRecord>) -> Self {
        let mut store = Self::default();
        for record in records {
            store.index(&record);
            store.records.insert(record.descriptor.id(), record);
        }
        store
    }

    fn index(&mut self, record: &DescriptorRecord) {
        let id = record.descriptor.id();
        for script in &record.descriptor.scripts {
            let ids = self.by_script.entry(script.clone()).or_default();
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }

    /// Adds `descriptor` if unknown; an existing descriptor keeps the earlier of the two times.
    pub fn insert(&mut self, descriptor: Descriptor, birth_time: u64) -> &DescriptorRecord {
        let id = descriptor.id();
        if !self.records.contains_key(&id) {
            let record = DescriptorRecord {
                descriptor,
                birth_time,
                birth_height: None,
                verified: false,
            };
            self.index(&record);
            self.records.insert(id, record);
        } else {
            let _ = self.lower_if_earlier(&id, birth_time, None);
        }
        &self.records[&id]
    }

    /// Records a candidate birth time. Never raises an existing value.
    pub fn set_birth_time(&mut self, id: &DescriptorId, time: u64) -> ScanResult<bool> {
        self.lower_if_earlier(id, time, None)
    }

    /// Minimum birth time over descriptors not yet verified by a complete scan.
    pub fn get_min_birth_time(&self) -> Option<u64> {
        self.records
            .values()
            .filter(|r| !r.verified)
            .map(|r| r.birth_time)
            .min()
    }

    /// Decreases the stored birth time iff `discovered_time` is strictly earlier.
    /// Applying the same value twice changes nothing the second time.
    pub fn lower_if_earlier(
        &mut self,
        id: &DescriptorId,
        discovered_time: u64,
        height: Option<u64>,
    ) -> ScanResult<bool> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| ScanError::NotFound(format!("descriptor {id}")))?;
        if discovered_time >= record.birth_time {
            return Ok(false);
        }
        record.birth_time = discovered_time;
        if height.is_some() {
            record.birth_height = height;
        }
        Ok(true)
    }

    /// Explicit forget-and-re-import: the only operation allowed to raise a birth time.
    pub fn reimport(&mut self, id: &DescriptorId, birth_time: u64) -> ScanResult<()> {
        let record = self
            .records
            .get_mut(id)
            .ok_or_else(|| ScanError::NotFound(format!("descriptor {id}")))?;
        record.birth_time = birth_time;
        record.birth_height = None;
        record.verified = false;
        Ok(())
    }

    /// Marks verified every unverified descriptor whose birth time is at or after
    /// `scanned_from`, returning the ids that changed.
    pub fn mark_verified_from(&mut self, scanned_from: u64) -> Vec<DescriptorId> {
        let mut changed = Vec::new();
        for (id, record) in self.records.iter_mut() {
            if !record.verified && record.birth_time >= scanned_from {
                record.verified = true;
                changed.push(*id);
            }
        }
        changed
    }

    /// Chain data was rebuilt: nothing previously scanned counts as verified.
    pub fn invalidate_all(&mut self) {
        for record in self.records.values_mut() {
            record.verified = false;
        }
    }

    pub fn matching(&self, script: &[u8]) -> &[DescriptorId] {
        self.by_script.get(script).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, id: &DescriptorId) -> Option<&DescriptorRecord> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &DescriptorRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
