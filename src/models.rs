// Task lists and the tasks they own

use crate::record::{IndexValue, Record};
use crate::store::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

pub(crate) fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// A named, ordered collection of tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskList {
    pub id: String,
    pub title: String,
    /// Creation time (milliseconds since epoch)
    pub date: i64,
    /// Ids of the owned tasks, in display order
    pub task_ids: Vec<String>,
    pub updated_at: i64,
}

impl TaskList {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_ms();
    }

    /// Oldest first, the order lists were created in
    pub fn by_creation(a: &TaskList, b: &TaskList) -> std::cmp::Ordering {
        a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id))
    }
}

impl Default for TaskList {
    fn default() -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            title: String::new(),
            date: now,
            task_ids: Vec::new(),
            updated_at: now,
        }
    }
}

impl Record for TaskList {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "task_lists"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("title".to_string(), IndexValue::String(self.title.clone()));
        fields
    }
}

/// A unit of work owned by exactly one list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Owning list; empty until the task is saved into one
    pub list_id: String,
    pub title: String,
    pub note: String,
    pub date: i64,
    pub is_complete: bool,
    pub updated_at: i64,
}

impl Task {
    pub fn new(title: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            note: note.into(),
            ..Self::default()
        }
    }

    pub fn titled(title: impl Into<String>) -> Self {
        Self::new(title, "")
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn dated(mut self, date: i64) -> Self {
        self.date = date;
        self
    }

    pub fn completed(mut self) -> Self {
        self.is_complete = true;
        self
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = now_ms();
    }
}

impl Default for Task {
    fn default() -> Self {
        let now = now_ms();
        Self {
            id: new_id(),
            list_id: String::new(),
            title: String::new(),
            note: String::new(),
            date: now,
            is_complete: false,
            updated_at: now,
        }
    }
}

impl Record for Task {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> i64 {
        self.updated_at
    }

    fn collection_name() -> &'static str {
        "tasks"
    }

    fn indexed_fields(&self) -> HashMap<String, IndexValue> {
        let mut fields = HashMap::new();
        fields.insert("list_id".to_string(), IndexValue::String(self.list_id.clone()));
        fields.insert("title".to_string(), IndexValue::String(self.title.clone()));
        fields.insert("is_complete".to_string(), IndexValue::Bool(self.is_complete));
        fields
    }
}

/// A list with its tasks, not yet saved. Used for bulk inserts.
#[derive(Debug, Clone, Default)]
pub struct NewTaskList {
    pub title: String,
    pub date: Option<i64>,
    pub tasks: Vec<Task>,
}

impl NewTaskList {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn dated(mut self, date: i64) -> Self {
        self.date = Some(date);
        self
    }

    pub fn with_tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    /// Insert tasks starting at `index`; past the end they are appended
    pub fn insert(&mut self, index: usize, tasks: impl IntoIterator<Item = Task>) {
        let index = index.min(self.tasks.len());
        self.tasks.splice(index..index, tasks);
    }
}

/// A list is done when it has tasks and none are incomplete
pub fn all_done(tasks: &[Task]) -> bool {
    !tasks.is_empty() && tasks.iter().all(|t| t.is_complete)
}
