use crate::errors::AppResult;
use crate::models::Record;
use crate::store::RecordStore;
use std::path::Path;

/// Typed façade over [`RecordStore`]: serde at the boundary, `Option` for
/// absent records, and tolerance for index entries whose value is missing or
/// unreadable.
#[derive(Debug)]
pub struct RecordRepository {
    store: RecordStore,
}

impl RecordRepository {
    pub fn open(path: &Path) -> AppResult<Self> {
        Ok(Self {
            store: RecordStore::new(path)?,
        })
    }

    pub fn initialize(&self) -> AppResult<()> {
        self.store.initialize()
    }

    pub fn load_record(&self, id: &str) -> AppResult<Option<Record>> {
        match self.store.get(id)? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn save_record(&self, record: &Record) -> AppResult<()> {
        let json = serde_json::to_string(record)?;
        self.store.put(&record.id, &json)
    }

    /// Saves each record individually; not atomic across the batch. A crash
    /// midway persists a prefix only, which `load_records` tolerates.
    pub fn save_records(&self, records: &[Record]) -> AppResult<()> {
        for record in records {
            self.save_record(record)?;
        }
        Ok(())
    }

    /// Resolves every id in the index. An id with no value, or one whose
    /// value no longer parses, is skipped rather than failing the load.
    pub fn load_records(&self) -> AppResult<Vec<Record>> {
        let ids = self.store.list_ids()?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(json) = self.store.get(&id)? else {
                tracing::warn!(record_id = %id, "index entry has no stored value, skipping");
                continue;
            };
            match serde_json::from_str::<Record>(&json) {
                Ok(record) => records.push(record),
                Err(error) => {
                    tracing::warn!(record_id = %id, error = %error, "stored record is unreadable, skipping");
                }
            }
        }
        Ok(records)
    }

    pub fn load_root_records(&self) -> AppResult<Vec<Record>> {
        let records = self.load_records()?;
        Ok(records
            .into_iter()
            .filter(|record| record.parent_id.is_none())
            .collect())
    }

    pub fn load_child_records(&self, parent_id: &str) -> AppResult<Vec<Record>> {
        let records = self.load_records()?;
        Ok(records
            .into_iter()
            .filter(|record| record.parent_id.as_deref() == Some(parent_id))
            .collect())
    }

    /// Deletes the record and its whole subtree from both the value keys and
    /// the index. Deleting an absent id still clears any dangling index slot.
    pub fn delete_record(&self, id: &str) -> AppResult<()> {
        match self.load_record(id)? {
            Some(record) => {
                for subtree_id in record.subtree_ids() {
                    self.store.delete(&subtree_id)?;
                }
            }
            None => self.store.delete(id)?,
        }
        Ok(())
    }

    pub fn clear_storage(&self) -> AppResult<()> {
        self.store.clear()
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &RecordStore {
        &self.store
    }
}
