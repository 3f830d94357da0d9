//! The collaborators the engine talks to: where pages of comments come from,
//! where new comments are sent, and where announcements of other visitors'
//! comments arrive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    comment::{Comment, CommentRecord, NewComment},
    paginate::{ListingState, SortField, SortOrder},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("comment source unavailable: {0}")]
    Unavailable(String),

    #[error("comment rejected: {0}")]
    Rejected(String),
}

impl SourceError {
    /// Whether asking again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootQuery {
    pub sort_field: SortField,
    pub sort_order: SortOrder,
    pub limit: usize,
    pub offset: usize,
}

impl From<&ListingState> for RootQuery {
    fn from(state: &ListingState) -> Self {
        RootQuery {
            sort_field: state.sort_field,
            sort_order: state.sort_order,
            limit: state.page_size,
            offset: state.offset(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct RootPage {
    pub comments: Vec<CommentRecord>,
    /// Total number of root comments, when the source knows it
    #[serde(default)]
    pub total: Option<usize>,
}

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn fetch_root_comments(&self, query: RootQuery) -> Result<RootPage, SourceError>;
}

#[async_trait]
pub trait CommentCreator: Send + Sync {
    async fn create_comment(
        &self,
        comment: &NewComment,
        created_at: DateTime<Utc>,
    ) -> Result<Comment, SourceError>;
}

pub type PushHandler = Box<dyn Fn(Comment) + Send + Sync + 'static>;

pub trait PushChannel {
    /// Calls `handler` for every new comment announced from now on, until the
    /// returned subscription is dropped.
    fn subscribe(&self, handler: PushHandler) -> Subscription;
}

/// A live push subscription. Dropping it tears the subscription down.
#[must_use = "the subscription ends as soon as it is dropped"]
pub struct Subscription {
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            teardown: Some(Box::new(teardown)),
        }
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            teardown();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.teardown.is_some())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn test_subscription_tears_down_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let subscription = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        subscription.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = calls.clone();
        drop(Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "Dropping should tear down too");
    }

    #[test]
    fn test_query_offset_follows_page() {
        let mut state = ListingState::new(25);
        state.page = 3;

        let query = RootQuery::from(&state);
        assert_eq!(query.limit, 25);
        assert_eq!(query.offset, 50);
    }
}
