// Change notifications and self-refreshing query views

use crate::filter::Filter;
use crate::record::Record;
use crate::store::Store;
use eyre::Result;
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One record touched by a committed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub collection: &'static str,
    pub id: String,
    pub kind: ChangeKind,
}

/// Everything one commit changed, tagged with the store revision it produced.
///
/// An empty `changes` list means the whole cache was rebuilt from the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub revision: u64,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    pub fn is_reload(&self) -> bool {
        self.changes.is_empty()
    }

    /// Whether a view over `collection` has to re-query
    pub fn touches(&self, collection: &str) -> bool {
        self.is_reload() || self.changes.iter().any(|c| c.collection == collection)
    }

    pub fn ids(&self, collection: &str) -> impl Iterator<Item = &str> {
        self.changes
            .iter()
            .filter(move |c| c.collection == collection)
            .map(|c| c.id.as_str())
    }
}

/// Produces the rows of a live view from committed store state
pub type Query<T> = Box<dyn Fn(&Store) -> Result<Vec<T>>>;

/// A view of one collection that re-queries itself after commits.
///
/// The view does not borrow the store; it remembers the store revision its
/// rows came from and reloads on access once the revision has moved.
pub struct LiveResults<T: Record> {
    query: Query<T>,
    rows: Vec<T>,
    revision: Option<u64>,
}

impl<T: Record> LiveResults<T> {
    /// Records matching `filters`, most recently updated first
    pub fn filtered(filters: Vec<Filter>) -> Self {
        Self::from_query(move |store: &Store| store.list(&filters))
    }

    /// Rows computed by an arbitrary query, e.g. one that applies a list's order
    pub fn from_query<Q>(query: Q) -> Self
    where
        Q: Fn(&Store) -> Result<Vec<T>> + 'static,
    {
        Self {
            query: Box::new(query),
            rows: Vec::new(),
            revision: None,
        }
    }

    /// Sort rows with `order` after every refresh
    pub fn ordered_by(self, order: fn(&T, &T) -> Ordering) -> Self {
        let query = self.query;
        Self::from_query(move |store: &Store| {
            let mut rows = query(store)?;
            rows.sort_by(order);
            Ok(rows)
        })
    }

    /// True when the rows reflect every commit the store has seen
    pub fn is_current(&self, store: &Store) -> bool {
        self.revision == Some(store.revision())
    }

    /// Current rows, re-querying first if the store changed since the last read
    pub fn rows(&mut self, store: &Store) -> Result<&[T]> {
        if !self.is_current(store) {
            let rows = (self.query)(store)?;
            debug!(
                collection = T::collection_name(),
                revision = store.revision(),
                count = rows.len(),
                "LiveResults: refreshed"
            );
            self.rows = rows;
            self.revision = Some(store.revision());
        }
        Ok(&self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(collection: &'static str, id: &str) -> Change {
        Change {
            collection,
            id: id.to_string(),
            kind: ChangeKind::Updated,
        }
    }

    #[test]
    fn test_change_set_touches_collection() {
        let set = ChangeSet {
            revision: 3,
            changes: vec![change("tasks", "t-1"), change("tasks", "t-2")],
        };

        assert!(set.touches("tasks"));
        assert!(!set.touches("task_lists"));
        assert_eq!(set.ids("tasks").collect::<Vec<_>>(), vec!["t-1", "t-2"]);
    }

    #[test]
    fn test_reload_touches_everything() {
        let set = ChangeSet {
            revision: 9,
            changes: vec![],
        };

        assert!(set.is_reload());
        assert!(set.touches("task_lists"));
    }
}
