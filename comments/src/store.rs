use std::collections::{HashMap, HashSet, VecDeque};

use crate::comment::{Comment, CommentId};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("orphan reply: comment {id} replies to unknown comment {parent_id}")]
    OrphanReply { id: CommentId, parent_id: CommentId },

    #[error("comment {id} cannot be placed under {parent_id} without becoming its own ancestor")]
    Cycle { id: CommentId, parent_id: CommentId },

    #[error("comment {0} is not a provisional comment")]
    NotProvisional(CommentId),
}

/// The in-memory set of comments with their parent/child ordering.
///
/// Root comments are kept newest first (every insert goes to the front),
/// replies are kept oldest first under their parent (every insert goes to the
/// back).
#[derive(Debug, Clone, Default)]
pub struct CommentStore {
    comments: HashMap<CommentId, Comment>,
    roots: VecDeque<CommentId>,
    replies: HashMap<CommentId, Vec<CommentId>>,
    provisional: HashSet<CommentId>,
    revision: u64,
}

impl CommentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a comment, or replaces the stored one with the same id.
    ///
    /// A reply must point at a comment that is already in the store, otherwise
    /// the insert is rejected as an orphan and nothing changes.
    pub fn insert(&mut self, comment: Comment) -> Result<(), StoreError> {
        let id = comment.id;

        if let Some(parent_id) = comment.parent_id {
            if parent_id == id || (self.contains(id) && self.is_ancestor(id, parent_id)) {
                return Err(StoreError::Cycle { id, parent_id });
            }
            if !self.contains(parent_id) {
                return Err(StoreError::OrphanReply { id, parent_id });
            }
        }

        let parent_id = comment.parent_id;
        match self.comments.insert(id, comment) {
            Some(previous) if previous.parent_id == parent_id => {}
            Some(previous) => {
                self.detach(id, previous.parent_id);
                self.attach(id, parent_id);
            }
            None => self.attach(id, parent_id),
        }

        self.revision += 1;
        Ok(())
    }

    /// Inserts a comment created locally that the backend has yet to accept.
    pub fn insert_provisional(&mut self, comment: Comment) -> Result<(), StoreError> {
        let id = comment.id;
        self.insert(comment)?;
        self.provisional.insert(id);
        Ok(())
    }

    pub fn is_provisional(&self, id: CommentId) -> bool {
        self.provisional.contains(&id)
    }

    /// Replaces a provisional comment with the version the backend accepted.
    ///
    /// When the backend assigned a different id, the comment keeps its place
    /// and its direct replies are moved under the new id. On error the store
    /// is left as it was and the comment stays provisional.
    pub fn confirm(&mut self, local_id: CommentId, confirmed: Comment) -> Result<(), StoreError> {
        if !self.provisional.contains(&local_id) {
            return Err(StoreError::NotProvisional(local_id));
        }

        let id = confirmed.id;
        if let Some(parent_id) = confirmed.parent_id {
            // Below the local copy means below the confirmed one after rekeying
            if parent_id == id
                || parent_id == local_id
                || self.is_ancestor(local_id, parent_id)
                || (self.contains(id) && self.is_ancestor(id, parent_id))
            {
                return Err(StoreError::Cycle { id, parent_id });
            }
            if !self.contains(parent_id) {
                return Err(StoreError::OrphanReply { id, parent_id });
            }
        }

        self.provisional.remove(&local_id);
        if confirmed.id != local_id {
            if self.contains(confirmed.id) {
                // The backend copy got here first, e.g. through a merge of
                // pushed comments. Fold the local copy into it.
                self.fold_into(local_id, confirmed.id);
            } else {
                self.rekey(local_id, confirmed.id);
            }
        }

        self.insert(confirmed)
    }

    /// Removes a provisional comment together with every reply below it.
    /// The removed comments are returned in depth-first order.
    pub fn rollback(&mut self, local_id: CommentId) -> Result<Vec<Comment>, StoreError> {
        if !self.provisional.contains(&local_id) {
            return Err(StoreError::NotProvisional(local_id));
        }

        let parent_id = self.comments.get(&local_id).and_then(|c| c.parent_id);
        self.detach(local_id, parent_id);

        let mut removed = vec![];
        let mut stack = vec![local_id];
        while let Some(id) = stack.pop() {
            if let Some(children) = self.replies.remove(&id) {
                stack.extend(children.into_iter().rev());
            }
            self.provisional.remove(&id);
            if let Some(comment) = self.comments.remove(&id) {
                removed.push(comment);
            }
        }

        self.revision += 1;
        Ok(removed)
    }

    /// Throws away the current contents and loads `comments` instead.
    ///
    /// Roots and replies keep the order of the list. When an id shows up more
    /// than once, the first occurrence decides the position and the last one
    /// the payload. Comments that cannot be reached from a root through the
    /// list (orphans, cycles) are not loaded and are returned to the caller.
    pub fn replace_all(&mut self, comments: Vec<Comment>) -> Vec<Comment> {
        let mut order = Vec::with_capacity(comments.len());
        let mut latest = HashMap::with_capacity(comments.len());
        for comment in comments {
            let id = comment.id;
            if latest.insert(id, comment).is_none() {
                order.push(id);
            }
        }

        let mut roots = VecDeque::new();
        let mut replies: HashMap<CommentId, Vec<CommentId>> = HashMap::new();
        for id in &order {
            match latest[id].parent_id {
                None => roots.push_back(*id),
                Some(parent_id) if parent_id != *id && latest.contains_key(&parent_id) => {
                    replies.entry(parent_id).or_default().push(*id)
                }
                Some(_) => {}
            }
        }

        let mut reachable = HashSet::with_capacity(order.len());
        let mut stack: Vec<CommentId> = roots.iter().copied().collect();
        while let Some(id) = stack.pop() {
            if reachable.insert(id) {
                if let Some(children) = replies.get(&id) {
                    stack.extend(children.iter().copied());
                }
            }
        }

        let mut rejected = vec![];
        for id in order.iter().filter(|id| !reachable.contains(*id)) {
            replies.remove(id);
            if let Some(comment) = latest.remove(id) {
                tracing::warn!(
                    id = comment.id,
                    parent_id = comment.parent_id,
                    "Dropping comment that does not resolve to a root comment"
                );
                rejected.push(comment);
            }
        }

        self.comments = latest;
        self.roots = roots;
        self.replies = replies;
        self.provisional.retain(|id| self.comments.contains_key(id));
        self.revision += 1;

        rejected
    }

    /// Direct children of `parent_id`, or the root comments for `None`.
    pub fn children_of(&self, parent_id: Option<CommentId>) -> Vec<&Comment> {
        match parent_id {
            None => self.roots.iter().map(|id| &self.comments[id]).collect(),
            Some(parent_id) => self
                .reply_ids(parent_id)
                .iter()
                .map(|id| &self.comments[id])
                .collect(),
        }
    }

    pub fn roots(&self) -> Vec<&Comment> {
        self.children_of(None)
    }

    pub(crate) fn root_ids(&self) -> &VecDeque<CommentId> {
        &self.roots
    }

    pub(crate) fn reply_ids(&self, parent_id: CommentId) -> &[CommentId] {
        self.replies
            .get(&parent_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn get(&self, id: CommentId) -> Option<&Comment> {
        self.comments.get(&id)
    }

    pub fn contains(&self, id: CommentId) -> bool {
        self.comments.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.comments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comments.is_empty()
    }

    pub fn root_count(&self) -> usize {
        self.roots.len()
    }

    /// Bumped on every mutation. Two reads with the same revision see the
    /// same contents.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Every comment, depth first, in store order.
    pub fn iter(&self) -> DepthFirst<'_> {
        DepthFirst {
            store: self,
            stack: self.roots.iter().rev().copied().collect(),
        }
    }

    fn is_ancestor(&self, ancestor: CommentId, of: CommentId) -> bool {
        let mut current = Some(of);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.comments.get(&id).and_then(|c| c.parent_id);
        }
        false
    }

    fn attach(&mut self, id: CommentId, parent_id: Option<CommentId>) {
        match parent_id {
            None => self.roots.push_front(id),
            Some(parent_id) => self.replies.entry(parent_id).or_default().push(id),
        }
    }

    fn detach(&mut self, id: CommentId, parent_id: Option<CommentId>) {
        match parent_id {
            None => self.roots.retain(|c| *c != id),
            Some(parent_id) => {
                if let Some(siblings) = self.replies.get_mut(&parent_id) {
                    siblings.retain(|c| *c != id);
                }
            }
        }
    }

    fn rekey(&mut self, old: CommentId, new: CommentId) {
        let Some(mut comment) = self.comments.remove(&old) else {
            return;
        };

        let siblings = match comment.parent_id {
            None => self.roots.iter_mut().find(|c| **c == old),
            Some(parent_id) => self
                .replies
                .get_mut(&parent_id)
                .and_then(|s| s.iter_mut().find(|c| **c == old)),
        };
        if let Some(slot) = siblings {
            *slot = new;
        }

        if let Some(children) = self.replies.remove(&old) {
            for child in &children {
                if let Some(c) = self.comments.get_mut(child) {
                    c.parent_id = Some(new);
                }
            }
            self.replies.insert(new, children);
        }

        comment.id = new;
        self.comments.insert(new, comment);
    }

    fn fold_into(&mut self, old: CommentId, into: CommentId) {
        let Some(comment) = self.comments.remove(&old) else {
            return;
        };
        self.detach(old, comment.parent_id);

        if let Some(children) = self.replies.remove(&old) {
            for child in &children {
                if let Some(c) = self.comments.get_mut(child) {
                    c.parent_id = Some(into);
                }
            }
            self.replies.entry(into).or_default().extend(children);
        }
    }
}

pub struct DepthFirst<'a> {
    store: &'a CommentStore,
    stack: Vec<CommentId>,
}

impl<'a> Iterator for DepthFirst<'a> {
    type Item = &'a Comment;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.stack.pop()?;
        self.stack
            .extend(self.store.reply_ids(id).iter().rev().copied());
        self.store.comments.get(&id)
    }
}
