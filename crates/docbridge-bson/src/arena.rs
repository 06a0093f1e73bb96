//! Task-owned arena of binary documents.
//!
//! Every document built or received for a task is pushed here and addressed
//! by a [`DocHandle`]. Release happens once, in allocation order, when the
//! arena is closed or dropped.

use bson::raw::{RawDocument, RawDocumentBuf};
use tracing::trace;

/// Index of a document inside its arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocHandle(usize);

impl DocHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Default)]
pub struct DocumentArena {
    docs: Vec<RawDocumentBuf>,
    released: bool,
}

impl DocumentArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, doc: RawDocumentBuf) -> DocHandle {
        let handle = DocHandle(self.docs.len());
        trace!(index = handle.0, bytes = doc.as_bytes().len(), "Arena allocation");
        self.docs.push(doc);
        handle
    }

    pub fn get(&self, handle: DocHandle) -> Option<&RawDocument> {
        self.docs.get(handle.0).map(|doc| &**doc)
    }

    /// Documents allocated from `start` onwards, in allocation order
    pub fn since(&self, start: usize) -> impl Iterator<Item = &RawDocument> {
        self.docs.iter().skip(start).map(|doc| &**doc)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Total encoded bytes currently held
    pub fn total_bytes(&self) -> usize {
        self.docs.iter().map(|doc| doc.as_bytes().len()).sum()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Release every document in allocation order. Returns the number of
    /// documents released; a second call releases nothing.
    pub fn close(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let count = self.docs.len();
        for (index, doc) in self.docs.drain(..).enumerate() {
            trace!(index, bytes = doc.as_bytes().len(), "Arena release");
            drop(doc);
        }
        count
    }
}

impl Drop for DocumentArena {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn raw(n: i32) -> RawDocumentBuf {
        let mut bytes = Vec::new();
        doc! { "n": n }.to_writer(&mut bytes).unwrap();
        RawDocumentBuf::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_push_and_get() {
        let mut arena = DocumentArena::new();
        let first = arena.push(raw(1));
        let second = arena.push(raw(2));
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert_eq!(arena.get(second).unwrap().get_i32("n").unwrap(), 2);
        assert_eq!(arena.len(), 2);
        assert!(arena.total_bytes() > 0);
    }

    #[test]
    fn test_since_iterates_in_order() {
        let mut arena = DocumentArena::new();
        for n in 0..4 {
            arena.push(raw(n));
        }
        let values: Vec<i32> = arena.since(1).map(|d| d.get_i32("n").unwrap()).collect();
        assert_eq!(values, vec![1, 2, 3]);
    }

    #[test]
    fn test_close_releases_once() {
        let mut arena = DocumentArena::new();
        arena.push(raw(1));
        arena.push(raw(2));
        assert_eq!(arena.close(), 2);
        assert!(arena.is_released());
        assert!(arena.is_empty());
        assert_eq!(arena.close(), 0);
    }
}
