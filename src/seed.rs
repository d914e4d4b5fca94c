// Demo data for a first launch

use crate::lists::{ListResult, ListStore};
use crate::models::{NewTaskList, Task, TaskList};
use crate::store::now_ms;
use tracing::info;

/// The two example lists, built three different ways
pub fn demo_lists() -> Vec<NewTaskList> {
    // Field by field
    let mut shopping = NewTaskList::new("Shopping List");

    let mut milk = Task::default();
    milk.title = "Milk".to_string();
    milk.note = "2L".to_string();

    // Positional and builder style
    let apples = Task::new("Apples", "2Kg");
    let bread = Task::titled("Bread").completed();

    shopping.push(milk);
    shopping.insert(1, [apples, bread]);

    let movies = NewTaskList::new("Movies List").dated(now_ms()).with_tasks([
        Task::titled("Best film ever"),
        Task::new("The best of the best", "Must have")
            .dated(now_ms())
            .completed(),
    ]);

    vec![shopping, movies]
}

/// Insert the demo lists if the store has no lists yet.
///
/// Returns the lists it created; empty when the store was already populated.
pub fn seed_if_empty(store: &mut ListStore) -> ListResult<Vec<TaskList>> {
    if !store.is_empty()? {
        return Ok(Vec::new());
    }

    let lists = store.save_lists(demo_lists())?;
    info!(lists = lists.len(), "seed_if_empty: demo data inserted");
    Ok(lists)
}
