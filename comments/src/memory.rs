use std::{
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{Mutex, broadcast};
use tokio_stream::{
    StreamExt as _,
    wrappers::{BroadcastStream, errors::BroadcastStreamRecvError},
};

use crate::{
    comment::{Comment, CommentRecord, NewComment},
    paginate::sort_roots,
    source::{
        CommentCreator, DataSource, PushChannel, PushHandler, RootPage, RootQuery, SourceError,
        Subscription,
    },
    store::CommentStore,
};

const EVENTS_CAPACITY: usize = 256;

/// A backend that keeps every comment in memory. It answers page queries,
/// accepts new comments, and announces each accepted comment to push
/// subscribers.
pub struct MemoryBackend {
    /// Oldest first
    comments: Mutex<Vec<Comment>>,
    next_id: AtomicI64,
    events: broadcast::Sender<Comment>,
    unavailable: AtomicBool,
    fetch_delay: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            comments: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
            events,
            unavailable: AtomicBool::new(false),
            fetch_delay: None,
        }
    }

    /// Delay every page query, handy to watch out-of-order responses.
    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    /// A backend holding a few threads to play with.
    pub fn with_demo_data() -> Self {
        let at = |day, hour, minute| -> DateTime<Utc> {
            Utc.with_ymd_and_hms(2024, 10, day, hour, minute, 0)
                .single()
                .unwrap_or_default()
        };
        let comment = |id, user_name: &str, created_at, text: &str, parent_id| Comment {
            id,
            user_name: user_name.to_string(),
            email: format!("{}@example.com", user_name.to_lowercase()),
            created_at,
            text: text.to_string(),
            homepage: None,
            image_url: None,
            parent_id,
        };

        let mut with_image = comment(
            6,
            "AliceJohnson",
            at(3, 10, 0),
            "Reply to John's comment.",
            Some(5),
        );
        with_image.image_url =
            Some("https://cdn.factorio.com/assets/blog-sync/fff-431-stromatolites.png".into());

        Self::from_comments(vec![
            comment(1, "JohnDoe", at(1, 12, 0), "This is a test comment.", None),
            comment(
                2,
                "JaneSmith",
                at(1, 12, 30),
                "<strong>This is a reply to the first comment.</strong>",
                Some(1),
            ),
            comment(3, "AliceJohnson", at(1, 13, 0), "This is a reply to the reply.", Some(2)),
            comment(4, "JaneSmith", at(2, 14, 30), "Another comment <i>without</i> replies.", None),
            comment(5, "JohnDoe", at(3, 9, 15), "A comment from John.", None),
            with_image,
        ])
    }

    /// A backend preloaded with `comments`, given oldest first.
    pub fn from_comments(comments: Vec<Comment>) -> Self {
        let next_id = comments.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        let backend = Self::new();
        backend.next_id.store(next_id, Ordering::SeqCst);
        Self {
            comments: Mutex::new(comments),
            ..backend
        }
    }

    /// Makes every call fail as if the backend were down, or brings it back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), SourceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("backend is down".into()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataSource for MemoryBackend {
    async fn fetch_root_comments(&self, query: RootQuery) -> Result<RootPage, SourceError> {
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;

        let mut store = CommentStore::new();
        for comment in self.comments.lock().await.iter() {
            if let Err(e) = store.insert(comment.clone()) {
                tracing::error!(error = %e, "Backend holds a comment it cannot place");
            }
        }

        let roots = sort_roots(&store, query.sort_field, query.sort_order);
        let total = roots.len();
        let comments = roots
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .map(|root| {
                let replies: Vec<Comment> = store
                    .children_of(Some(root.id))
                    .into_iter()
                    .cloned()
                    .collect();
                CommentRecord {
                    comment: root.clone(),
                    replies: (!replies.is_empty()).then_some(replies),
                }
            })
            .collect();

        Ok(RootPage {
            comments,
            total: Some(total),
        })
    }
}

#[async_trait]
impl CommentCreator for MemoryBackend {
    async fn create_comment(
        &self,
        comment: &NewComment,
        created_at: DateTime<Utc>,
    ) -> Result<Comment, SourceError> {
        self.check_available()?;

        let mut comments = self.comments.lock().await;
        if let Some(parent_id) = comment.parent_id {
            if !comments.iter().any(|c| c.id == parent_id) {
                return Err(SourceError::Rejected(format!(
                    "comment {parent_id} does not exist"
                )));
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created = comment.clone().into_comment(id, created_at);
        comments.push(created.clone());
        drop(comments);

        // Nobody listening is fine
        let _ = self.events.send(created.clone());
        tracing::info!(id, parent_id = created.parent_id, "Comment created");

        Ok(created)
    }
}

impl PushChannel for MemoryBackend {
    /// Must be called from within a tokio runtime.
    fn subscribe(&self, handler: PushHandler) -> Subscription {
        let mut stream = BroadcastStream::new(self.events.subscribe());
        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                match event {
                    Ok(comment) => handler(comment),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Push subscriber fell behind, comments skipped");
                    }
                }
            }
        });
        Subscription::new(move || task.abort())
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex as StdMutex};

    use super::*;
    use crate::paginate::{SortField, SortOrder};

    fn query(sort_field: SortField, sort_order: SortOrder, limit: usize, offset: usize) -> RootQuery {
        RootQuery {
            sort_field,
            sort_order,
            limit,
            offset,
        }
    }

    fn draft(user_name: &str, parent_id: Option<i64>) -> NewComment {
        NewComment {
            user_name: user_name.into(),
            email: "someone@example.com".into(),
            text: "hello".into(),
            homepage: None,
            image_url: None,
            parent_id,
        }
    }

    #[tokio::test]
    async fn test_fetch_returns_roots_with_one_level_of_replies() {
        let backend = MemoryBackend::with_demo_data();
        let page = backend
            .fetch_root_comments(query(SortField::CreatedAt, SortOrder::Asc, 25, 0))
            .await
            .unwrap();

        assert_eq!(page.total, Some(3));
        let ids: Vec<_> = page.comments.iter().map(|r| r.comment.id).collect();
        assert_eq!(ids, vec![1, 4, 5]);

        let replies = page.comments[0].replies.as_ref().unwrap();
        assert_eq!(replies.len(), 1, "Only direct replies are inlined");
        assert_eq!(replies[0].id, 2);
        assert!(page.comments[1].replies.is_none());
    }

    #[tokio::test]
    async fn test_fetch_pages_with_limit_and_offset() {
        let backend = MemoryBackend::with_demo_data();
        let page = backend
            .fetch_root_comments(query(SortField::CreatedAt, SortOrder::Desc, 2, 2))
            .await
            .unwrap();

        let ids: Vec<_> = page.comments.iter().map(|r| r.comment.id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_create_rejects_unknown_parent_and_outage() {
        let backend = MemoryBackend::new();
        let err = backend
            .create_comment(&draft("bob", Some(99)), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Rejected(_)));
        assert!(!err.is_retryable());

        backend.set_unavailable(true);
        let err = backend
            .create_comment(&draft("bob", None), Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_subscribers_hear_created_comments_until_unsubscribed() {
        let backend = MemoryBackend::new();
        let heard = Arc::new(StdMutex::new(Vec::new()));

        let sink = heard.clone();
        let subscription = backend.subscribe(Box::new(move |c: Comment| sink.lock().unwrap().push(c.id)));

        let first = backend.create_comment(&draft("bob", None), Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*heard.lock().unwrap(), vec![first.id]);

        subscription.unsubscribe();
        backend.create_comment(&draft("eve", None), Utc::now()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(heard.lock().unwrap().len(), 1, "No events after unsubscribing");
    }
}
