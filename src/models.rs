use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One node of the timer tree. The persisted unit: a record's stored value
/// includes its full nested subtree, while every node also has its own store
/// entry and index slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children: Vec<Record>,
    pub is_running: bool,
    /// Seconds banked as of the last start/stop transition.
    pub base_time: i64,
    /// Epoch milliseconds of the current interval's start; set only while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// Display snapshot. Authoritative when stopped (equals `base_time`),
    /// advisory while running.
    pub time: i64,
    pub is_collapsed: bool,
    pub created_at: DateTime<Utc>,
}

impl Record {
    pub fn new(label: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            note: None,
            parent_id,
            children: Vec::new(),
            is_running: false,
            base_time: 0,
            start_time: None,
            time: 0,
            is_collapsed: false,
            created_at: Utc::now(),
        }
    }

    pub fn find(&self, id: &str) -> Option<&Record> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Record> {
        if self.id == id {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.find(id).is_some()
    }

    /// Ids of this record and every descendant, parent before children.
    pub fn subtree_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids);
        ids
    }

    fn collect_ids(&self, out: &mut Vec<String>) {
        out.push(self.id.clone());
        for child in &self.children {
            child.collect_ids(out);
        }
    }

    /// Clones of this record and every descendant, parent before children.
    /// Each clone keeps its own nested subtree, matching the persisted shape.
    pub fn flatten(&self) -> Vec<Record> {
        let mut records = Vec::new();
        self.collect_records(&mut records);
        records
    }

    fn collect_records(&self, out: &mut Vec<Record>) {
        out.push(self.clone());
        for child in &self.children {
            child.collect_records(out);
        }
    }

    /// True if any strict descendant is running.
    pub fn has_running_descendant(&self) -> bool {
        self.children
            .iter()
            .any(|child| child.is_running || child.has_running_descendant())
    }
}

/// Display names must carry at least one non-whitespace character.
pub fn validate_label(label: &str) -> AppResult<String> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidLabel(
            "record label must not be blank".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}
