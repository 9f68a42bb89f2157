use crate::errors::{AppError, AppResult};
use crate::models::{validate_label, Record};
use crate::repository::RecordRepository;
use crate::timer;
use chrono::Utc;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Command surface consumed by the presentation layer. Owns the repository
/// and serializes mutating commands behind one lock: root records are a
/// sibling group of their own, so a toggle can reach across trees and
/// per-tree locking could not keep sibling exclusivity at the root level.
#[derive(Debug)]
pub struct TimerService {
    repository: RecordRepository,
    command_lock: Mutex<()>,
}

impl TimerService {
    pub fn open(path: &Path) -> AppResult<Self> {
        Ok(Self {
            repository: RecordRepository::open(path)?,
            command_lock: Mutex::new(()),
        })
    }

    /// Prepares storage and folds the restart gap into any record that was
    /// left running: its elapsed wall-clock time is banked and its interval
    /// re-opened at now, then the recovered trees are persisted before any
    /// command runs.
    pub fn initialize(&self) -> AppResult<()> {
        let _guard = self.lock()?;
        self.repository.initialize()?;

        let now_ms = now_ms();
        let mut recovered = 0usize;
        for mut root in self.repository.load_root_records()? {
            if timer::recover(&mut root, now_ms) {
                self.repository.save_records(&root.flatten())?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(trees = recovered, "recovered running timers after restart");
        }
        Ok(())
    }

    /// Creates a root record, or a child appended to `parent_id`'s children.
    pub fn create_record(&self, label: &str, parent_id: Option<&str>) -> AppResult<Record> {
        let label = validate_label(label)?;
        let _guard = self.lock()?;

        let Some(parent_id) = parent_id else {
            let record = Record::new(label, None);
            self.repository.save_record(&record)?;
            tracing::debug!(record_id = %record.id, "created root record");
            return Ok(record);
        };

        let mut roots = self.repository.load_root_records()?;
        let root = containing_root_mut(&mut roots, parent_id)?;
        let child = Record::new(label, Some(parent_id.to_string()));
        let created = child.clone();
        match root.find_mut(parent_id) {
            Some(parent) => parent.children.push(child),
            None => {
                return Err(AppError::NotFound(format!(
                    "no record with id {parent_id}"
                )))
            }
        }
        self.repository.save_records(&root.flatten())?;
        tracing::debug!(record_id = %created.id, parent_id = %parent_id, "created child record");
        Ok(created)
    }

    pub fn rename_record(&self, id: &str, label: &str) -> AppResult<Record> {
        let label = validate_label(label)?;
        self.update_node(id, |node| node.label = label)
    }

    pub fn set_note(&self, id: &str, note: Option<String>) -> AppResult<Record> {
        self.update_node(id, |node| node.note = note)
    }

    pub fn toggle_collapsed(&self, id: &str) -> AppResult<Record> {
        self.update_node(id, |node| node.is_collapsed = !node.is_collapsed)
    }

    /// Start/stop toggle on one record. Persists every node of each tree the
    /// transition touched and returns the refreshed root forest for display.
    pub fn toggle_timer(&self, id: &str) -> AppResult<Vec<Record>> {
        let _guard = self.lock()?;
        let mut roots = self.repository.load_root_records()?;
        let changed = timer::toggle(&mut roots, id, now_ms())?;

        for root in &roots {
            if changed.iter().any(|changed_id| root.contains(changed_id)) {
                self.repository.save_records(&root.flatten())?;
            }
        }
        tracing::debug!(record_id = %id, changed = changed.len(), "applied timer toggle");
        Ok(roots)
    }

    /// Deletes a record and its whole subtree. An id absent everywhere is a
    /// no-op beyond clearing any dangling index slot.
    pub fn delete_record(&self, id: &str) -> AppResult<()> {
        let _guard = self.lock()?;
        let mut roots = self.repository.load_root_records()?;

        let Some(index) = roots.iter().position(|root| root.contains(id)) else {
            return self.repository.delete_record(id);
        };

        if roots[index].id == id {
            self.repository.delete_record(id)?;
        } else {
            let root = &mut roots[index];
            detach(root, id);
            self.repository.delete_record(id)?;
            self.repository.save_records(&root.flatten())?;
        }
        tracing::debug!(record_id = %id, "deleted record subtree");
        Ok(())
    }

    pub fn list_roots(&self) -> AppResult<Vec<Record>> {
        self.repository.load_root_records()
    }

    pub fn get_record(&self, id: &str) -> AppResult<Option<Record>> {
        self.repository.load_record(id)
    }

    pub fn clear_all(&self) -> AppResult<()> {
        let _guard = self.lock()?;
        self.repository.clear_storage()?;
        self.repository.initialize()
    }

    fn update_node(&self, id: &str, apply: impl FnOnce(&mut Record)) -> AppResult<Record> {
        let _guard = self.lock()?;
        let mut roots = self.repository.load_root_records()?;
        let root = containing_root_mut(&mut roots, id)?;
        let updated = match root.find_mut(id) {
            Some(node) => {
                apply(node);
                node.clone()
            }
            None => return Err(AppError::NotFound(format!("no record with id {id}"))),
        };
        self.repository.save_records(&root.flatten())?;
        Ok(updated)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, ()>> {
        self.command_lock
            .lock()
            .map_err(|_| AppError::Internal("command mutex poisoned".to_string()))
    }
}

fn containing_root_mut<'a>(roots: &'a mut [Record], id: &str) -> AppResult<&'a mut Record> {
    roots
        .iter_mut()
        .find(|root| root.contains(id))
        .ok_or_else(|| AppError::NotFound(format!("no record with id {id}")))
}

fn detach(root: &mut Record, id: &str) {
    root.children.retain(|child| child.id != id);
    for child in &mut root.children {
        detach(child, id);
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
