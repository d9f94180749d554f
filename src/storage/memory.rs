use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SubsecRound, Utc};

use super::{check_write_mode, ChamberRecords, DetectionStore, RecordFilter, RecordKey, WriteMode};
use crate::error::{InspectError, Result};
use crate::record::{DetectionRecord, NewRecord};

#[derive(Default)]
struct MemoryState {
    /// Oldest first; lookups reverse it.
    records: Vec<DetectionRecord>,
    next_id: i64,
    last_seq: u64,
    last_ts: Option<DateTime<Utc>>,
}

/// Process-local store with the same write and ordering rules as the SQLite store.
#[derive(Default)]
pub struct InMemoryDetectionStore {
    state: Mutex<MemoryState>,
    mode: WriteMode,
}

impl InMemoryDetectionStore {
    pub fn new(mode: WriteMode) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            mode,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| InspectError::Persistence("memory store lock poisoned".into()))
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn mode(&self) -> WriteMode {
        self.mode
    }

    fn write(&self, record: NewRecord, mode: WriteMode) -> Result<DetectionRecord> {
        check_write_mode(self.mode, mode)?;
        let mut state = self.lock()?;
        let now = Utc::now().trunc_subsecs(6);
        let timestamp = match state.last_ts {
            Some(prev) if prev > now => prev,
            _ => now,
        };
        state.last_seq += 1;
        state.next_id += 1;
        state.last_ts = Some(timestamp);

        if mode == WriteMode::Upsert {
            let chamber = record.chamber_id.as_str();
            state.records.retain(|r| r.chamber_id != chamber);
        }
        let stored = DetectionRecord::from_new(record, state.next_id, state.last_seq, timestamp);
        state.records.push(stored.clone());
        Ok(stored)
    }

    fn get(&self, chamber_id: &str) -> Result<ChamberRecords> {
        let records = self.list(&RecordFilter::exact(chamber_id))?;
        ChamberRecords::shaped(self.mode, records, chamber_id)
    }

    fn get_by_id(&self, id: i64) -> Result<DetectionRecord> {
        self.lock()?
            .records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| InspectError::NotFound(format!("no record with id {id}")))
    }

    fn list(&self, filter: &RecordFilter) -> Result<Vec<DetectionRecord>> {
        let state = self.lock()?;
        let matching = state
            .records
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect();
        Ok(matching)
    }

    fn delete(&self, key: &RecordKey) -> Result<DetectionRecord> {
        let mut state = self.lock()?;
        let position = match key {
            RecordKey::Chamber(chamber_id) => {
                state.records.iter().rposition(|r| &r.chamber_id == chamber_id)
            }
            RecordKey::Id(id) => state.records.iter().position(|r| r.id == *id),
        };
        match position {
            Some(idx) => Ok(state.records.remove(idx)),
            None => Err(InspectError::NotFound(format!("no record for {key}"))),
        }
    }

    fn count(&self) -> Result<usize> {
        Ok(self.lock()?.records.len())
    }
}
