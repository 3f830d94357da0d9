use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::{
    StreamExt as _,
    channel::mpsc::{UnboundedReceiver, UnboundedSender},
};
use tokio::sync::oneshot;
use tracing::Instrument as _;

use crate::{
    comment::{Comment, CommentId, NewComment},
    error::Error,
    live::MergeReport,
    paginate::{ListingKey, SortField},
    source::{CommentCreator, DataSource, PushChannel, RootPage, SourceError, Subscription},
};

use super::{
    CommentEngine, CreateOutcome, CreateRequest, FetchRequest, FetchToken, ViewSnapshot,
};

#[derive(Debug)]
pub(super) enum EngineEvent {
    /// A visitor submitted a comment
    Submit(NewComment, oneshot::Sender<Result<Comment, Error>>),

    /// The backend answered a comment submission
    Created {
        local_id: CommentId,
        result: Result<Comment, SourceError>,
    },

    /// The push channel announced a comment
    Push(Comment),

    Merge(oneshot::Sender<MergeReport>),
    SelectSort(SortField, oneshot::Sender<ListingKey>),
    NextPage(oneshot::Sender<Option<ListingKey>>),
    PrevPage(oneshot::Sender<Option<ListingKey>>),
    Retry(oneshot::Sender<Option<ListingKey>>),

    /// The data source answered a page fetch
    PageLoaded {
        token: FetchToken,
        result: Result<RootPage, SourceError>,
    },

    /// Reply once no fetch or submission is outstanding
    Settle(oneshot::Sender<Arc<ViewSnapshot>>),

    Shutdown,
}

struct EngineState {
    engine: CommentEngine,
    event_recv: UnboundedReceiver<EngineEvent>,

    // Handed to spawned fetches and submissions so they can post their
    // results back into the loop.
    event_send: UnboundedSender<EngineEvent>,

    source: Arc<dyn DataSource>,
    creator: Arc<dyn CommentCreator>,
    view: Arc<ArcSwap<ViewSnapshot>>,

    // Submissions sent to the backend and not answered yet. Replies held
    // back for a provisional parent are not counted; they are sent or
    // dropped when the parent's answer comes in.
    creating: usize,
    settle_waiters: Vec<oneshot::Sender<Arc<ViewSnapshot>>>,
}

impl EngineState {
    async fn main_loop(mut self) {
        while let Some(event) = self.event_recv.next().await {
            if let EngineEvent::Shutdown = event {
                break;
            }
            if !self.handle_event(event) {
                self.publish();
            }
            self.wake_settle_waiters();
        }
        tracing::info!("Comment engine shutting down, exiting main loop");
    }

    /// Returns true when the view was already published while handling the
    /// event.
    fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Submit(submission, reply) => {
                let result = self.engine.submit(submission);
                self.spawn_creates();
                self.respond(reply, result)
            }
            EngineEvent::Created { local_id, result } => {
                self.creating = self.creating.saturating_sub(1);
                match self.engine.resolve_created(local_id, result) {
                    Ok(CreateOutcome::Confirmed(id)) => {
                        tracing::info!(local_id, id, "Comment confirmed by backend");
                        // Replies held back for this comment can go now
                        self.spawn_creates();
                    }
                    Ok(CreateOutcome::RolledBack(removed)) => {
                        tracing::info!(local_id, removed = removed.len(), "Comment rolled back");
                    }
                    Ok(CreateOutcome::Gone) => {}
                    Err(e) => {
                        tracing::error!(local_id, error = %e, "Failed to settle created comment");
                    }
                }
                false
            }
            EngineEvent::Push(comment) => {
                self.engine.receive_push(comment);
                false
            }
            EngineEvent::Merge(reply) => {
                let report = self.engine.merge();
                self.respond(reply, report)
            }
            EngineEvent::SelectSort(field, reply) => {
                let request = self.engine.select_sort(field);
                self.spawn_fetch(request);
                self.respond(reply, request.key)
            }
            EngineEvent::NextPage(reply) => {
                let request = self.engine.next_page();
                self.respond_with_fetch(request, reply)
            }
            EngineEvent::PrevPage(reply) => {
                let request = self.engine.prev_page();
                self.respond_with_fetch(request, reply)
            }
            EngineEvent::Retry(reply) => {
                let request = self.engine.retry();
                self.respond_with_fetch(request, reply)
            }
            EngineEvent::PageLoaded { token, result } => {
                self.engine.apply_page(token, result);
                false
            }
            EngineEvent::Settle(reply) => {
                self.settle_waiters.push(reply);
                true
            }
            EngineEvent::Shutdown => true,
        }
    }

    fn publish(&self) {
        self.view.store(Arc::new(self.engine.snapshot()));
    }

    /// Publishes first so the caller sees its own change in the view.
    fn respond<T>(&self, reply: oneshot::Sender<T>, value: T) -> bool {
        self.publish();
        let _ = reply.send(value);
        true
    }

    fn respond_with_fetch(
        &self,
        request: Option<FetchRequest>,
        reply: oneshot::Sender<Option<ListingKey>>,
    ) -> bool {
        if let Some(request) = request {
            self.spawn_fetch(request);
        }
        self.respond(reply, request.map(|r| r.key))
    }

    fn spawn_fetch(&self, request: FetchRequest) {
        let source = self.source.clone();
        let event_send = self.event_send.clone();

        tokio::spawn(
            async move {
                let result = source.fetch_root_comments(request.query).await;
                if event_send
                    .unbounded_send(EngineEvent::PageLoaded {
                        token: request.token,
                        result,
                    })
                    .is_err()
                {
                    tracing::debug!("Engine gone before page arrived");
                }
            }
            .instrument(tracing::info_span!(
                "fetch_page",
                page = request.key.page,
                sort_field = %request.key.sort_field,
                sort_order = %request.key.sort_order,
            )),
        );
    }

    fn spawn_creates(&mut self) {
        for request in self.engine.take_create_requests() {
            self.spawn_create(request);
        }
    }

    fn spawn_create(&mut self, request: CreateRequest) {
        let creator = self.creator.clone();
        let event_send = self.event_send.clone();
        let CreateRequest {
            local_id,
            submission,
            created_at,
        } = request;

        self.creating += 1;
        tokio::spawn(
            async move {
                let result = creator.create_comment(&submission, created_at).await;
                if event_send
                    .unbounded_send(EngineEvent::Created { local_id, result })
                    .is_err()
                {
                    tracing::debug!("Engine gone before comment was created");
                }
            }
            .instrument(tracing::info_span!("create_comment", local_id)),
        );
    }

    fn wake_settle_waiters(&mut self) {
        if self.settle_waiters.is_empty() || self.creating > 0 || self.engine.is_loading() {
            return;
        }
        let view = self.view.load_full();
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(view.clone());
        }
    }
}

/// Runs a [`CommentEngine`] on its own task. Every operation is queued as an
/// event and applied in order, and readers get the latest published
/// [`ViewSnapshot`] without waiting on the loop.
///
/// Dropping the handle stops the engine.
pub struct EngineHandle {
    event_send: UnboundedSender<EngineEvent>,
    view: Arc<ArcSwap<ViewSnapshot>>,
    main_loop_handle: tokio::task::JoinHandle<()>,
}

impl EngineHandle {
    /// Spawns the engine and issues the first page fetch. Must be called
    /// from within a tokio runtime.
    pub fn new(
        engine: CommentEngine,
        source: Arc<dyn DataSource>,
        creator: Arc<dyn CommentCreator>,
    ) -> Self {
        let (event_send, event_recv) = futures::channel::mpsc::unbounded();
        let view = Arc::new(ArcSwap::from_pointee(engine.snapshot()));
        let page_size = engine.listing().page_size;

        let state = EngineState {
            engine,
            event_recv,
            event_send: event_send.clone(),
            source,
            creator,
            view: view.clone(),
            creating: 0,
            settle_waiters: vec![],
        };

        let main_loop_handle = tokio::spawn(
            async move {
                let mut state = state;
                let request = state.engine.load();
                state.spawn_fetch(request);
                state.publish();
                state.main_loop().await;
            }
            .instrument(tracing::info_span!("comment_engine", page_size)),
        );

        Self {
            event_send,
            view,
            main_loop_handle,
        }
    }

    /// The most recently published view.
    pub fn view(&self) -> Arc<ViewSnapshot> {
        self.view.load_full()
    }

    /// Validates and optimistically inserts a comment, returning it with its
    /// local id. The backend is asked to create it in the background.
    pub async fn submit(&self, submission: NewComment) -> Result<Comment, Error> {
        self.request(|reply| EngineEvent::Submit(submission, reply))
            .await?
    }

    /// Stages a pushed comment. Safe to call from any thread.
    pub fn receive_push(&self, comment: Comment) {
        push_into(&self.event_send, comment);
    }

    pub async fn merge(&self) -> Result<MergeReport, Error> {
        self.request(EngineEvent::Merge).await
    }

    /// Returns the listing the fetch was issued for.
    pub async fn select_sort(&self, field: SortField) -> Result<ListingKey, Error> {
        self.request(|reply| EngineEvent::SelectSort(field, reply))
            .await
    }

    /// `None` when already on the last page.
    pub async fn next_page(&self) -> Result<Option<ListingKey>, Error> {
        self.request(EngineEvent::NextPage).await
    }

    /// `None` when already on the first page.
    pub async fn prev_page(&self) -> Result<Option<ListingKey>, Error> {
        self.request(EngineEvent::PrevPage).await
    }

    /// `None` when the last fetch did not fail.
    pub async fn retry(&self) -> Result<Option<ListingKey>, Error> {
        self.request(EngineEvent::Retry).await
    }

    /// Waits until no page fetch or comment submission is outstanding and
    /// returns the view at that point.
    pub async fn settled(&self) -> Result<Arc<ViewSnapshot>, Error> {
        self.request(EngineEvent::Settle).await
    }

    /// Feeds every comment announced on `channel` into the engine until the
    /// returned subscription is dropped.
    pub fn connect_push(&self, channel: &impl PushChannel) -> Subscription {
        let event_send = self.event_send.clone();
        channel.subscribe(Box::new(move |comment: Comment| {
            push_into(&event_send, comment)
        }))
    }

    async fn request<T>(
        &self,
        event: impl FnOnce(oneshot::Sender<T>) -> EngineEvent,
    ) -> Result<T, Error> {
        let (reply, response) = oneshot::channel();
        self.event_send
            .unbounded_send(event(reply))
            .map_err(|_| Error::EngineClosed)?;
        response.await.map_err(|_| Error::EngineClosed)
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        if self.event_send.unbounded_send(EngineEvent::Shutdown).is_err() {
            self.main_loop_handle.abort();
        }
    }
}

fn push_into(event_send: &UnboundedSender<EngineEvent>, comment: Comment) {
    let id = comment.id;
    if event_send.unbounded_send(EngineEvent::Push(comment)).is_err() {
        tracing::debug!(id, "Engine gone, dropping pushed comment");
    }
}
