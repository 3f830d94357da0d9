//! Nested threads built from the flat [`CommentStore`].
//!
//! Building is a pure function of the store: the same store revision always
//! produces the same threads. Children are looked up through the store's
//! parent index, so a build is O(n) overall, and the traversal uses an
//! explicit stack so that very deep reply chains do not exhaust the call
//! stack.

use serde::Serialize;

use crate::{
    comment::{Comment, CommentId},
    store::CommentStore,
};

/// A comment together with its replies, borrowed from the store.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Thread<'a> {
    #[serde(flatten)]
    pub comment: &'a Comment,
    pub replies: Vec<Thread<'a>>,
}

/// Same as [`Thread`] but owning its data, so it can outlive the store.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct OwnedThread {
    #[serde(flatten)]
    pub comment: Comment,
    /// Not yet accepted by the backend
    pub provisional: bool,
    pub replies: Vec<OwnedThread>,
}

impl Thread<'_> {
    /// Number of comments in this thread, the root included.
    pub fn size(&self) -> usize {
        let mut size = 0;
        let mut stack = vec![self];
        while let Some(thread) = stack.pop() {
            size += 1;
            stack.extend(thread.replies.iter());
        }
        size
    }
}

/// Every root comment with its replies, in store root order.
pub fn build_forest(store: &CommentStore) -> Vec<Thread<'_>> {
    store
        .root_ids()
        .iter()
        .filter_map(|id| build_thread(store, *id))
        .collect()
}

/// The thread rooted at `id`, which may be a reply as well as a root comment.
pub fn build_thread(store: &CommentStore, id: CommentId) -> Option<Thread<'_>> {
    assemble(
        store,
        id,
        |comment| Thread {
            comment,
            replies: Vec::new(),
        },
        |parent, reply| parent.replies.push(reply),
    )
}

pub fn build_owned_forest(store: &CommentStore) -> Vec<OwnedThread> {
    store
        .root_ids()
        .iter()
        .filter_map(|id| {
            assemble(
                store,
                *id,
                |comment| OwnedThread {
                    comment: comment.clone(),
                    provisional: store.is_provisional(comment.id),
                    replies: Vec::new(),
                },
                |parent, reply| parent.replies.push(reply),
            )
        })
        .collect()
}

fn assemble<'a, N>(
    store: &'a CommentStore,
    root: CommentId,
    leaf: impl Fn(&'a Comment) -> N,
    attach: impl Fn(&mut N, N),
) -> Option<N> {
    // Each frame is a node under construction, its id and the index of the
    // next reply to visit
    let mut stack = vec![(leaf(store.get(root)?), root, 0usize)];

    loop {
        let (_, id, next_reply) = stack.last_mut()?;
        let reply_ids = store.reply_ids(*id);

        if let Some(reply_id) = reply_ids.get(*next_reply).copied() {
            *next_reply += 1;
            if let Some(reply) = store.get(reply_id) {
                stack.push((leaf(reply), reply_id, 0));
            }
            continue;
        }

        let (done, _, _) = stack.pop()?;
        match stack.last_mut() {
            Some((parent, _, _)) => attach(parent, done),
            None => return Some(done),
        }
    }
}
