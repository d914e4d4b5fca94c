// Task list persistence and state transitions

use crate::error::ListError;
use crate::filter::Filter;
use crate::live::{ChangeSet, LiveResults};
use crate::models::{NewTaskList, Task, TaskList, all_done};
use crate::record::Record;
use crate::store::{Store, Transaction};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::mpsc::Receiver;
use tracing::{debug, info, warn};

pub type ListResult<T> = std::result::Result<T, ListError>;

/// The only way the front end touches stored data.
///
/// Every mutation runs in one engine transaction and either fully commits or
/// leaves journal and cache untouched. Handles are record ids: each operation
/// re-reads the current record inside its transaction, so a stale copy held by
/// the caller is never written back, and an id that no longer exists yields
/// `ListNotFound` / `TaskNotFound` instead of a mutation.
pub struct ListStore {
    store: Store,
}

impl ListStore {
    /// Open (or create) the store rooted at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> ListResult<Self> {
        let mut store = Store::open(path)?;

        // A journal replay during open restores records but not index rows
        let lists = store.rebuild_indexes::<TaskList>()?;
        let tasks = store.rebuild_indexes::<Task>()?;
        debug!(lists, tasks, "ListStore::open: indexes ready");

        Ok(Self { store })
    }

    /// The underlying record engine, for live views and raw queries
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn subscribe(&mut self) -> Receiver<ChangeSet> {
        self.store.subscribe()
    }

    /// Rebuild the cache from the journal, e.g. after the files were edited
    pub fn sync(&mut self) -> ListResult<()> {
        self.store.sync()?;
        self.store.rebuild_indexes::<TaskList>()?;
        self.store.rebuild_indexes::<Task>()?;
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn fetch_all<T: Record>(&self) -> ListResult<Vec<T>> {
        self.fetch(&[])
    }

    pub fn fetch<T: Record>(&self, filters: &[Filter]) -> ListResult<Vec<T>> {
        Ok(self.store.list(filters)?)
    }

    /// A view over `T` that follows every later commit
    pub fn live<T: Record>(&self, filters: Vec<Filter>) -> LiveResults<T> {
        LiveResults::filtered(filters)
    }

    /// All lists, oldest first, as a live view
    pub fn live_lists(&self) -> LiveResults<TaskList> {
        LiveResults::filtered(Vec::new()).ordered_by(TaskList::by_creation)
    }

    /// A list's tasks in list order as a live view; see [`ListStore::tasks_in`].
    ///
    /// Once the list is deleted the view is empty.
    pub fn live_tasks(&self, list_id: &str, done: Option<bool>) -> LiveResults<Task> {
        let list_id = list_id.to_string();
        LiveResults::from_query(move |store: &Store| {
            let Some(list) = store.get::<TaskList>(&list_id)? else {
                return Ok(Vec::new());
            };
            let tasks: Vec<Task> = store.list(&section_filters(&list_id, done))?;
            Ok(in_list_order(&list, tasks))
        })
    }

    /// All lists, oldest first
    pub fn lists(&self) -> ListResult<Vec<TaskList>> {
        let mut lists: Vec<TaskList> = self.store.list(&[])?;
        lists.sort_by(TaskList::by_creation);
        Ok(lists)
    }

    pub fn is_empty(&self) -> ListResult<bool> {
        Ok(self.store.count::<TaskList>()? == 0)
    }

    pub fn get_list(&self, list_id: &str) -> ListResult<TaskList> {
        self.store
            .get::<TaskList>(list_id)?
            .ok_or_else(|| ListError::ListNotFound(list_id.to_string()))
    }

    pub fn get_task(&self, task_id: &str) -> ListResult<Task> {
        self.store
            .get::<Task>(task_id)?
            .ok_or_else(|| ListError::TaskNotFound(task_id.to_string()))
    }

    /// Look a list up by id or by exact title
    pub fn find_list(&self, key: &str) -> ListResult<TaskList> {
        if let Some(list) = self.store.get::<TaskList>(key)? {
            return Ok(list);
        }

        let mut matches: Vec<TaskList> = self.store.list(&[Filter::eq("title", key)])?;
        match matches.len() {
            0 => Err(ListError::ListNotFound(key.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(ListError::Ambiguous {
                kind: "list",
                key: key.to_string(),
            }),
        }
    }

    /// Look a task up by id or by a unique id prefix
    pub fn find_task(&self, key: &str) -> ListResult<Task> {
        if let Some(task) = self.store.get::<Task>(key)? {
            return Ok(task);
        }

        let mut matches: Vec<Task> = self
            .store
            .list::<Task>(&[])?
            .into_iter()
            .filter(|t| !key.is_empty() && t.id.starts_with(key))
            .collect();
        match matches.len() {
            0 => Err(ListError::TaskNotFound(key.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(ListError::Ambiguous {
                kind: "task",
                key: key.to_string(),
            }),
        }
    }

    /// A list's tasks in list order, optionally only done or only open ones
    pub fn tasks_in(&self, list_id: &str, done: Option<bool>) -> ListResult<Vec<Task>> {
        let list = self.get_list(list_id)?;
        let tasks: Vec<Task> = self.store.list(&section_filters(list_id, done))?;

        Ok(in_list_order(&list, tasks))
    }

    /// True iff the list has at least one task and every task is complete
    pub fn is_list_done(&self, list_id: &str) -> ListResult<bool> {
        Ok(all_done(&self.tasks_in(list_id, None)?))
    }

    // ========================================================================
    // Lists
    // ========================================================================

    /// Insert fully-formed lists with their tasks in one transaction.
    ///
    /// The tasks must be new: an id already stored, or repeated across the
    /// drafts, fails the whole batch with `DuplicateTask` rather than moving a
    /// task out of the list that owns it.
    pub fn save_lists(&mut self, drafts: Vec<NewTaskList>) -> ListResult<Vec<TaskList>> {
        let result = self.store.write(|tx| {
            let mut saved = Vec::with_capacity(drafts.len());
            let mut seen = HashSet::new();

            for draft in drafts {
                let mut list = TaskList::new(draft.title);
                if let Some(date) = draft.date {
                    list.date = date;
                }

                for mut task in draft.tasks {
                    if !seen.insert(task.id.clone()) || tx.get::<Task>(&task.id)?.is_some() {
                        return Err(ListError::DuplicateTask(task.id));
                    }
                    task.list_id = list.id.clone();
                    list.task_ids.push(task.id.clone());
                    tx.put(&task)?;
                }
                tx.put(&list)?;
                saved.push(list);
            }

            Ok::<_, ListError>(saved)
        });

        let saved = logged("save_lists", result)?;
        info!(count = saved.len(), "save_lists: inserted");
        Ok(saved)
    }

    pub fn save_list(&mut self, title: &str) -> ListResult<TaskList> {
        let list = TaskList::new(validate_title(title)?);
        let result = self.store.write(|tx| tx.put(&list).map_err(ListError::from));
        logged("save_list", result)?;

        info!(list_id = %list.id, title = %list.title, "save_list: created");
        Ok(list)
    }

    /// Delete a list and, in the same transaction, every task it owns.
    ///
    /// Ownership is the task's `list_id`; an entry in `task_ids` pointing at
    /// another list's task does not take that task down with it.
    pub fn delete_list(&mut self, list_id: &str) -> ListResult<()> {
        let result = self.store.write(|tx| {
            require_list(tx, list_id)?;

            let removed = tx.delete_where::<Task>(&[Filter::eq("list_id", list_id)])?;
            tx.delete::<TaskList>(list_id)?;

            Ok::<_, ListError>(removed)
        });

        let removed = logged("delete_list", result)?;
        info!(list_id, tasks = removed, "delete_list: deleted");
        Ok(())
    }

    pub fn rename_list(&mut self, list_id: &str, new_title: &str) -> ListResult<TaskList> {
        let new_title = validate_title(new_title)?;

        let result = self.store.write(|tx| {
            let mut list = require_list(tx, list_id)?;
            list.title = new_title;
            list.touch();
            tx.put(&list)?;
            Ok::<_, ListError>(list)
        });

        let list = logged("rename_list", result)?;
        info!(list_id, title = %list.title, "rename_list: renamed");
        Ok(list)
    }

    /// Mark every task of the list complete. Returns how many changed.
    ///
    /// One-way: there is no bulk "undone". Running it twice changes nothing
    /// the second time.
    pub fn mark_list_done(&mut self, list_id: &str) -> ListResult<usize> {
        let result = self.store.write(|tx| {
            require_list(tx, list_id)?;

            let open: Vec<Task> = tx.list(&[
                Filter::eq("list_id", list_id),
                Filter::eq("is_complete", false),
            ])?;
            for mut task in open.iter().cloned() {
                task.is_complete = true;
                task.touch();
                tx.put(&task)?;
            }

            Ok::<_, ListError>(open.len())
        });

        let changed = logged("mark_list_done", result)?;
        info!(list_id, changed, "mark_list_done: done");
        Ok(changed)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Append a new task to the end of the list
    pub fn save_task(&mut self, list_id: &str, title: &str, note: &str) -> ListResult<Task> {
        self.insert_task(list_id, usize::MAX, title, note)
    }

    /// Insert a new task at `index`; past the end it is appended
    pub fn insert_task(&mut self, list_id: &str, index: usize, title: &str, note: &str) -> ListResult<Task> {
        let title = validate_title(title)?;

        let result = self.store.write(|tx| {
            let mut list = require_list(tx, list_id)?;

            let mut task = Task::new(title, note);
            task.list_id = list.id.clone();

            let index = index.min(list.task_ids.len());
            list.task_ids.insert(index, task.id.clone());
            list.touch();

            tx.put(&task)?;
            tx.put(&list)?;
            Ok::<_, ListError>(task)
        });

        let task = logged("insert_task", result)?;
        info!(list_id, task_id = %task.id, title = %task.title, "insert_task: created");
        Ok(task)
    }

    /// Delete a task and drop it from its list's order
    pub fn delete_task(&mut self, task_id: &str) -> ListResult<()> {
        let result = self.store.write(|tx| {
            let task = require_task(tx, task_id)?;

            if let Some(mut list) = tx.get::<TaskList>(&task.list_id)? {
                list.task_ids.retain(|id| id != task_id);
                list.touch();
                tx.put(&list)?;
            } else {
                warn!(task_id, list_id = %task.list_id, "delete_task: owning list missing");
            }
            tx.delete::<Task>(task_id)?;

            Ok::<_, ListError>(())
        });

        logged("delete_task", result)?;
        info!(task_id, "delete_task: deleted");
        Ok(())
    }

    /// Replace title and note together
    pub fn edit_task(&mut self, task_id: &str, new_title: &str, new_note: &str) -> ListResult<Task> {
        let new_title = validate_title(new_title)?;

        let result = self.store.write(|tx| {
            let mut task = require_task(tx, task_id)?;
            task.title = new_title;
            task.note = new_note.to_string();
            task.touch();
            tx.put(&task)?;
            Ok::<_, ListError>(task)
        });

        let task = logged("edit_task", result)?;
        info!(task_id, "edit_task: edited");
        Ok(task)
    }

    /// Flip a task between done and not done
    pub fn toggle_task_done(&mut self, task_id: &str) -> ListResult<Task> {
        let result = self.store.write(|tx| {
            let mut task = require_task(tx, task_id)?;
            task.is_complete = !task.is_complete;
            task.touch();
            tx.put(&task)?;
            Ok::<_, ListError>(task)
        });

        let task = logged("toggle_task_done", result)?;
        info!(task_id, is_complete = task.is_complete, "toggle_task_done: toggled");
        Ok(task)
    }
}

fn require_list(tx: &Transaction<'_>, list_id: &str) -> ListResult<TaskList> {
    tx.get::<TaskList>(list_id)?
        .ok_or_else(|| ListError::ListNotFound(list_id.to_string()))
}

fn require_task(tx: &Transaction<'_>, task_id: &str) -> ListResult<Task> {
    tx.get::<Task>(task_id)?
        .ok_or_else(|| ListError::TaskNotFound(task_id.to_string()))
}

fn section_filters(list_id: &str, done: Option<bool>) -> Vec<Filter> {
    let mut filters = vec![Filter::eq("list_id", list_id)];
    if let Some(done) = done {
        filters.push(Filter::eq("is_complete", done));
    }
    filters
}

fn validate_title(title: &str) -> ListResult<String> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ListError::InvalidTitle);
    }
    Ok(title.to_string())
}

/// Failures are returned to the caller and also logged here, at the boundary
fn logged<T>(op: &'static str, result: ListResult<T>) -> ListResult<T> {
    if let Err(e) = &result {
        warn!(op, error = %e, "ListStore operation failed");
    }
    result
}

/// Order `tasks` by their position in `list.task_ids`; unknown ids go last
fn in_list_order(list: &TaskList, mut tasks: Vec<Task>) -> Vec<Task> {
    let position: HashMap<&str, usize> = list
        .task_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    tasks.sort_by_key(|t| position.get(t.id.as_str()).copied().unwrap_or(usize::MAX));
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open() -> (TempDir, ListStore) {
        let temp = TempDir::new().unwrap();
        let store = ListStore::open(temp.path()).unwrap();
        (temp, store)
    }

    fn titles(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.title.as_str()).collect()
    }

    #[test]
    fn test_save_list_defaults() {
        let (_temp, mut store) = open();

        let list = store.save_list("Shopping List").unwrap();

        assert_eq!(list.title, "Shopping List");
        assert!(list.is_empty());
        assert_eq!(store.get_list(&list.id).unwrap(), list);
        assert!(!store.is_empty().unwrap());
    }

    #[test]
    fn test_blank_titles_rejected() {
        let (_temp, mut store) = open();

        assert!(matches!(store.save_list("   "), Err(ListError::InvalidTitle)));
        let list = store.save_list("Chores").unwrap();
        assert!(matches!(store.save_task(&list.id, "", "x"), Err(ListError::InvalidTitle)));
        assert!(matches!(store.rename_list(&list.id, ""), Err(ListError::InvalidTitle)));
    }

    #[test]
    fn test_insert_at_index_preserves_order() {
        let (_temp, mut store) = open();
        let list = store.save_list("Shopping List").unwrap();

        store.save_task(&list.id, "Milk", "2L").unwrap();
        store.insert_task(&list.id, 0, "Apples", "2Kg").unwrap();
        store.insert_task(&list.id, 1, "Bread", "").unwrap();
        store.insert_task(&list.id, 42, "Salt", "").unwrap();

        let tasks = store.tasks_in(&list.id, None).unwrap();
        assert_eq!(titles(&tasks), vec!["Apples", "Bread", "Milk", "Salt"]);
        assert!(tasks.iter().all(|t| t.list_id == list.id));
    }

    #[test]
    fn test_delete_task_removes_it_from_list_order() {
        let (_temp, mut store) = open();
        let list = store.save_list("Errands").unwrap();
        let bank = store.save_task(&list.id, "Bank", "").unwrap();
        store.save_task(&list.id, "Post office", "").unwrap();

        store.delete_task(&bank.id).unwrap();

        let list = store.get_list(&list.id).unwrap();
        assert_eq!(list.len(), 1);
        assert!(matches!(store.get_task(&bank.id), Err(ListError::TaskNotFound(_))));
    }

    #[test]
    fn test_edit_task_updates_both_fields() {
        let (_temp, mut store) = open();
        let list = store.save_list("Errands").unwrap();
        let task = store.save_task(&list.id, "Bank", "deposit").unwrap();

        let edited = store.edit_task(&task.id, "Bank", "withdraw").unwrap();

        assert_eq!(edited.note, "withdraw");
        assert_eq!(store.get_task(&task.id).unwrap().note, "withdraw");
    }

    #[test]
    fn test_stale_handles_are_not_found() {
        let (_temp, mut store) = open();
        let list = store.save_list("Errands").unwrap();
        let task = store.save_task(&list.id, "Bank", "").unwrap();
        store.delete_list(&list.id).unwrap();

        assert!(store.toggle_task_done(&task.id).unwrap_err().is_not_found());
        assert!(store.edit_task(&task.id, "x", "y").unwrap_err().is_not_found());
        assert!(store.delete_task(&task.id).unwrap_err().is_not_found());
        assert!(store.rename_list(&list.id, "x").unwrap_err().is_not_found());
        assert!(store.mark_list_done(&list.id).unwrap_err().is_not_found());
        assert!(store.save_task(&list.id, "x", "").unwrap_err().is_not_found());
    }

    #[test]
    fn test_failed_operation_commits_nothing() {
        let (_temp, mut store) = open();
        let changes = store.subscribe();

        assert!(store.delete_list("missing").is_err());

        assert_eq!(store.store().revision(), 0);
        assert!(changes.try_recv().is_err());
    }

    #[test]
    fn test_find_list_by_title_and_task_by_prefix() {
        let (_temp, mut store) = open();
        let list = store.save_list("Movies List").unwrap();
        let task = store.save_task(&list.id, "Best film ever", "").unwrap();

        assert_eq!(store.find_list("Movies List").unwrap().id, list.id);
        assert_eq!(store.find_list(&list.id).unwrap().id, list.id);
        assert!(store.find_list("Books").unwrap_err().is_not_found());

        assert_eq!(store.find_task(&task.id[..task.id.len() - 4]).unwrap().id, task.id);
    }

    #[test]
    fn test_find_list_ambiguous_title() {
        let (_temp, mut store) = open();
        store.save_list("Chores").unwrap();
        store.save_list("Chores").unwrap();

        assert!(matches!(store.find_list("Chores"), Err(ListError::Ambiguous { .. })));
    }

    #[test]
    fn test_live_lists_follow_commits() {
        let (_temp, mut store) = open();
        let mut lists = store.live_lists();
        assert!(lists.rows(store.store()).unwrap().is_empty());

        let first = store.save_list("First").unwrap();
        store.save_list("Second").unwrap();
        assert_eq!(lists.rows(store.store()).unwrap().len(), 2);

        store.delete_list(&first.id).unwrap();
        let rows = lists.rows(store.store()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Second");
    }

    #[test]
    fn test_live_tasks_follow_list_order() {
        let (_temp, mut store) = open();
        let list = store.save_list("Chores").unwrap();
        let mut all = store.live_tasks(&list.id, None);
        let mut open_tasks = store.live_tasks(&list.id, Some(false));

        store.save_task(&list.id, "A", "").unwrap();
        let b = store.save_task(&list.id, "B", "").unwrap();
        store.save_task(&list.id, "C", "").unwrap();
        assert_eq!(titles(all.rows(store.store()).unwrap()), vec!["A", "B", "C"]);

        store.insert_task(&list.id, 0, "D", "").unwrap();
        assert_eq!(titles(all.rows(store.store()).unwrap()), vec!["D", "A", "B", "C"]);

        store.toggle_task_done(&b.id).unwrap();
        assert_eq!(titles(open_tasks.rows(store.store()).unwrap()), vec!["D", "A", "C"]);
        assert_eq!(titles(all.rows(store.store()).unwrap()), vec!["D", "A", "B", "C"]);

        store.delete_list(&list.id).unwrap();
        assert!(all.rows(store.store()).unwrap().is_empty());
    }

    #[test]
    fn test_save_lists_rejects_existing_task() {
        let (_temp, mut store) = open();
        let list = store.save_list("Groceries").unwrap();
        let milk = store.save_task(&list.id, "Milk", "").unwrap();

        let thief = NewTaskList::new("Thief").with_tasks(vec![milk.clone()]);
        let result = store.save_lists(vec![thief]);

        assert!(matches!(result, Err(ListError::DuplicateTask(id)) if id == milk.id));
        assert_eq!(store.get_task(&milk.id).unwrap().list_id, list.id);
        assert_eq!(store.lists().unwrap().len(), 1);
    }

    #[test]
    fn test_save_lists_rejects_task_repeated_across_drafts() {
        let (_temp, mut store) = open();
        let shared = Task::new("Shared", "");

        let first = NewTaskList::new("First").with_tasks(vec![shared.clone()]);
        let second = NewTaskList::new("Second").with_tasks(vec![shared]);

        assert!(matches!(store.save_lists(vec![first, second]), Err(ListError::DuplicateTask(_))));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_delete_list_spares_tasks_owned_elsewhere() {
        let (_temp, mut store) = open();
        let doomed = store.save_list("Doomed").unwrap();
        let kept = store.save_list("Kept").unwrap();
        let mine = store.save_task(&doomed.id, "Mine", "").unwrap();
        let theirs = store.save_task(&kept.id, "Theirs", "").unwrap();

        // A journal edited by hand can leave a foreign id in task_ids
        store
            .store
            .write(|tx| {
                let mut list = require_list(tx, &doomed.id)?;
                list.task_ids.push(theirs.id.clone());
                tx.put(&list)?;
                Ok::<_, ListError>(())
            })
            .unwrap();

        store.delete_list(&doomed.id).unwrap();

        assert!(store.get_task(&mine.id).unwrap_err().is_not_found());
        assert_eq!(store.get_task(&theirs.id).unwrap().list_id, kept.id);
        assert_eq!(titles(&store.tasks_in(&kept.id, None).unwrap()), vec!["Theirs"]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let list_id = {
            let mut store = ListStore::open(temp.path()).unwrap();
            let list = store.save_list("Shopping List").unwrap();
            let milk = store.save_task(&list.id, "Milk", "2L").unwrap();
            store.insert_task(&list.id, 0, "Apples", "2Kg").unwrap();
            store.toggle_task_done(&milk.id).unwrap();
            list.id
        };

        std::fs::remove_file(temp.path().join(".tasklists/tasklists.db")).unwrap();

        let store = ListStore::open(temp.path()).unwrap();
        let tasks = store.tasks_in(&list_id, None).unwrap();
        assert_eq!(titles(&tasks), vec!["Apples", "Milk"]);

        let done = store.tasks_in(&list_id, Some(true)).unwrap();
        assert_eq!(titles(&done), vec!["Milk"]);
    }
}
