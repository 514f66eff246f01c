//! Free slot list for a record table
//!
//! Built lazily by a full scan the first time the table allocates or deletes
//! after being opened, then kept up to date in memory. Ids are reused LIFO.

use super::slot::RecordId;

#[derive(Debug, Default)]
pub struct FreeList {
    ids: Option<Vec<RecordId>>,
}

impl FreeList {
    pub fn new() -> Self {
        Self { ids: None }
    }

    /// Whether the initial scan has happened
    pub fn is_built(&self) -> bool {
        self.ids.is_some()
    }

    /// Install the result of the initial scan
    pub fn build(&mut self, ids: Vec<RecordId>) {
        self.ids = Some(ids);
    }

    /// Take a free id, most recently freed first
    pub fn pop(&mut self) -> Option<RecordId> {
        self.ids.as_mut().and_then(Vec::pop)
    }

    /// Return an id to the list; ignored until the list has been built, since
    /// the initial scan will pick the slot up
    pub fn push(&mut self, id: RecordId) {
        if let Some(ids) = self.ids.as_mut() {
            ids.push(id);
        }
    }

    pub fn len(&self) -> usize {
        self.ids.as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> &[RecordId] {
        self.ids.as_deref().unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(raw: u32) -> RecordId {
        RecordId::new(raw).unwrap()
    }

    #[test]
    fn test_unbuilt_list_ignores_pushes() {
        let mut list = FreeList::new();
        list.push(id(3));
        assert!(!list.is_built());
        assert_eq!(list.pop(), None);
    }

    #[test]
    fn test_lifo_reuse() {
        let mut list = FreeList::new();
        list.build(vec![id(1), id(4)]);
        list.push(id(7));

        assert_eq!(list.len(), 3);
        assert_eq!(list.pop(), Some(id(7)));
        assert_eq!(list.pop(), Some(id(4)));
        assert_eq!(list.pop(), Some(id(1)));
        assert!(list.is_empty());
    }
}
