use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde::Serialize;

use crate::{
    comment::{Comment, CommentId},
    store::{CommentStore, StoreError},
};

/// Comments announced by the push channel, kept apart from the rendered
/// store until the visitor asks for them.
///
/// `stage` and `merge_into_store` lock the same sequence for their whole
/// duration, so a comment staged while a merge runs lands in the next batch.
#[derive(Debug, Default)]
pub struct LiveUpdateBuffer {
    inner: Mutex<Staged>,
}

#[derive(Debug, Default)]
struct Staged {
    /// Newest first
    pending: VecDeque<Comment>,
    /// Replies whose parent was missing at the last merge, oldest first
    held: Vec<Comment>,
}

#[derive(Debug, Default, Serialize, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub merged: Vec<CommentId>,
    /// Orphan replies kept back for the next merge
    pub held: Vec<CommentId>,
    /// Comments the store refused for any other reason, these are dropped
    pub rejected: Vec<CommentId>,
}

impl LiveUpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Puts a comment at the front of the buffer. A comment with an id that is
    /// already staged replaces the staged copy where it is.
    pub fn stage(&self, comment: Comment) {
        let mut staged = self.lock();
        let staged = &mut *staged;

        if let Some(slot) = staged
            .pending
            .iter_mut()
            .chain(staged.held.iter_mut())
            .find(|c| c.id == comment.id)
        {
            *slot = comment;
            return;
        }

        staged.pending.push_front(comment);
    }

    /// Takes a comment out of the buffer, e.g. once the store got it some
    /// other way.
    pub fn discard(&self, id: CommentId) -> Option<Comment> {
        let mut staged = self.lock();
        if let Some(at) = staged.pending.iter().position(|c| c.id == id) {
            return staged.pending.remove(at);
        }
        let at = staged.held.iter().position(|c| c.id == id)?;
        Some(staged.held.remove(at))
    }

    /// Number of comments waiting to be merged. Held orphans are not counted.
    pub fn count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn pending(&self) -> Vec<Comment> {
        self.lock().pending.iter().cloned().collect()
    }

    pub fn held_orphans(&self) -> Vec<Comment> {
        self.lock().held.clone()
    }

    /// Moves every staged comment into `store`, oldest first, so roots end up
    /// newest first at the top and replies in arrival order under their
    /// parent. Replies whose parent still can't be found are held back.
    pub fn merge_into_store(&self, store: &mut CommentStore) -> MergeReport {
        let mut staged = self.lock();
        let staged = &mut *staged;

        let mut remaining: Vec<Comment> = staged
            .held
            .drain(..)
            .chain(staged.pending.drain(..).rev())
            .collect();
        let mut report = MergeReport::default();

        // Keep going while something got in, a reply may be staged before
        // the comment it answers
        loop {
            let before = remaining.len();
            let mut orphans = Vec::new();

            for comment in remaining {
                let id = comment.id;
                match store.insert(comment.clone()) {
                    Ok(()) => report.merged.push(id),
                    Err(StoreError::OrphanReply { .. }) => orphans.push(comment),
                    Err(e) => {
                        tracing::warn!(id, error = %e, "Dropping pushed comment");
                        report.rejected.push(id);
                    }
                }
            }

            remaining = orphans;
            if remaining.is_empty() || remaining.len() == before {
                break;
            }
        }

        for comment in &remaining {
            tracing::debug!(
                id = comment.id,
                parent_id = comment.parent_id,
                "Holding pushed reply until its parent is known"
            );
        }
        report.held = remaining.iter().map(|c| c.id).collect();
        staged.held = remaining;

        report
    }

    fn lock(&self) -> MutexGuard<'_, Staged> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::*;
    use crate::store::test::mock_comment;

    fn root_ids(store: &CommentStore) -> Vec<CommentId> {
        store.roots().iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_merge_prepends_buffer_to_roots() {
        let mut store = CommentStore::new();
        store.insert(mock_comment(2, None)).unwrap();
        store.insert(mock_comment(1, None)).unwrap();

        let buffer = LiveUpdateBuffer::new();
        buffer.stage(mock_comment(8, None));
        buffer.stage(mock_comment(9, None));
        assert_eq!(
            buffer.pending().iter().map(|c| c.id).collect::<Vec<_>>(),
            vec![9, 8],
            "Buffer should be newest first"
        );

        let report = buffer.merge_into_store(&mut store);

        assert_eq!(root_ids(&store), vec![9, 8, 1, 2]);
        assert_eq!(buffer.count(), 0, "Buffer should be empty after merge");
        assert_eq!(report.merged, vec![8, 9]);
    }

    #[test]
    fn test_staging_never_touches_the_store() {
        let store = CommentStore::new();
        let buffer = LiveUpdateBuffer::new();
        buffer.stage(mock_comment(1, None));

        assert_eq!(buffer.count(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_replies_are_appended_in_arrival_order() {
        let mut store = CommentStore::new();
        store.insert(mock_comment(1, None)).unwrap();
        store.insert(mock_comment(2, Some(1))).unwrap();

        let buffer = LiveUpdateBuffer::new();
        buffer.stage(mock_comment(3, Some(1)));
        buffer.stage(mock_comment(4, Some(1)));
        buffer.merge_into_store(&mut store);

        let replies: Vec<_> = store.children_of(Some(1)).iter().map(|c| c.id).collect();
        assert_eq!(replies, vec![2, 3, 4]);
    }

    #[test]
    fn test_duplicate_stage_replaces_in_place() {
        let buffer = LiveUpdateBuffer::new();
        buffer.stage(mock_comment(1, None));
        buffer.stage(mock_comment(2, None));

        let mut again = mock_comment(1, None);
        again.text = "redelivered".into();
        buffer.stage(again);

        let pending = buffer.pending();
        assert_eq!(buffer.count(), 2);
        assert_eq!(pending[1].text, "redelivered");
    }

    #[test]
    fn test_discard() {
        let buffer = LiveUpdateBuffer::new();
        buffer.stage(mock_comment(1, None));
        buffer.stage(mock_comment(2, None));

        assert_eq!(buffer.discard(1).map(|c| c.id), Some(1));
        assert_eq!(buffer.discard(1), None);
        assert_eq!(buffer.count(), 1);
    }

    #[test]
    fn test_orphans_are_held_until_parent_arrives() {
        let mut store = CommentStore::new();
        let buffer = LiveUpdateBuffer::new();

        buffer.stage(mock_comment(5, Some(4)));
        let report = buffer.merge_into_store(&mut store);
        assert_eq!(report.held, vec![5]);
        assert_eq!(buffer.count(), 0, "Held orphans are not pending");
        assert_eq!(buffer.held_orphans().len(), 1);
        assert!(store.is_empty());

        buffer.stage(mock_comment(4, None));
        let report = buffer.merge_into_store(&mut store);
        assert_eq!(report.merged, vec![4, 5]);
        assert!(buffer.held_orphans().is_empty());
        assert_eq!(store.children_of(Some(4)).len(), 1);
    }

    #[test]
    fn test_concurrent_stage_is_not_lost() {
        let buffer = Arc::new(LiveUpdateBuffer::new());
        let mut store = CommentStore::new();

        let stager = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for id in 0..500 {
                    buffer.stage(mock_comment(id, None));
                }
            })
        };

        let mut merged = 0;
        while !stager.is_finished() {
            merged += buffer.merge_into_store(&mut store).merged.len();
        }
        stager.join().unwrap();
        merged += buffer.merge_into_store(&mut store).merged.len();

        assert_eq!(merged, 500);
        assert_eq!(store.len(), 500);
        assert_eq!(buffer.count(), 0);
    }
}
