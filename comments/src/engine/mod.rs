//! The comment engine. [`CommentEngine`] holds all the state and applies one
//! event at a time; [`EngineHandle`] runs it on its own task so that events
//! coming from visitors, the push channel and finished fetches are applied
//! strictly one after another.

mod handle;

pub use handle::EngineHandle;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    comment::{Comment, CommentId, LocalIdGenerator, NewComment, flatten_records},
    error::Error,
    live::{LiveUpdateBuffer, MergeReport},
    paginate::{self, ListingKey, ListingState, SortField},
    source::{RootPage, RootQuery, SourceError},
    store::{CommentStore, StoreError},
    tree::{OwnedThread, build_owned_forest},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FetchToken(u64);

/// A page fetch the engine wants issued. Its response must be handed back to
/// [`CommentEngine::apply_page`] together with `token`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub token: FetchToken,
    pub key: ListingKey,
    pub query: RootQuery,
}

#[derive(Clone, Debug, Default, Serialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchState {
    #[default]
    Idle,
    Loading { key: ListingKey },
    Failed { key: ListingKey, message: String, retryable: bool },
}

/// A provisional comment the engine wants sent to the backend. Its answer must
/// be handed back to [`CommentEngine::resolve_created`] with `local_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRequest {
    pub local_id: CommentId,
    pub submission: NewComment,
    pub created_at: DateTime<Utc>,
}

/// What became of an optimistic comment once the backend answered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreateOutcome {
    Confirmed(CommentId),
    /// The backend refused the comment, these comments were taken back out
    RolledBack(Vec<Comment>),
    /// The comment was no longer in the store, e.g. a new page was loaded
    Gone,
}

/// Everything a renderer needs, detached from the engine.
#[derive(Clone, Debug, Default, Serialize, PartialEq)]
pub struct ViewSnapshot {
    pub threads: Vec<OwnedThread>,
    pub listing: ListingState,
    pub total_pages: usize,
    /// Comments waiting for a merge. Zero means nothing to announce.
    pub pending_count: usize,
    pub held_orphans: Vec<Comment>,
    pub fetch: FetchState,
    pub revision: u64,
}

#[derive(Debug, Default)]
pub struct CommentEngine {
    store: CommentStore,
    live: LiveUpdateBuffer,
    listing: ListingState,
    ids: LocalIdGenerator,
    fetch: FetchState,
    next_token: u64,
    in_flight: Option<FetchRequest>,
    /// Root count reported by the data source with the last page
    known_total: Option<usize>,
    last_page_len: usize,
    /// Provisional comments to send to the backend, oldest first
    ready_creates: Vec<CommentId>,
    /// Replies held back until their provisional parent is confirmed, keyed
    /// by the parent's local id
    awaiting_parent: HashMap<CommentId, Vec<CommentId>>,
}

impl CommentEngine {
    pub fn new(listing: ListingState) -> Self {
        Self {
            listing,
            ..Default::default()
        }
    }

    pub fn store(&self) -> &CommentStore {
        &self.store
    }

    pub fn listing(&self) -> &ListingState {
        &self.listing
    }

    pub fn fetch_state(&self) -> &FetchState {
        &self.fetch
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.fetch, FetchState::Loading { .. })
    }

    /// Validates a submission and inserts it right away as a provisional
    /// comment. Nothing changes when validation fails.
    pub fn submit(&mut self, mut submission: NewComment) -> Result<Comment, Error> {
        submission.validate()?;

        let now = Utc::now();
        let comment = submission.into_comment(self.ids.next_id(now), now);
        self.store.insert_provisional(comment.clone())?;

        match comment.parent_id {
            // The backend doesn't know a local id, wait for the parent's real one
            Some(parent_id) if self.store.is_provisional(parent_id) => {
                self.awaiting_parent
                    .entry(parent_id)
                    .or_default()
                    .push(comment.id);
            }
            _ => self.ready_creates.push(comment.id),
        }

        tracing::debug!(
            id = comment.id,
            parent_id = comment.parent_id,
            "Inserted provisional comment"
        );
        Ok(comment)
    }

    /// Takes the provisional comments that can be sent to the backend now.
    /// A reply to a provisional comment only shows up here once its parent
    /// is confirmed, and then carries the parent's confirmed id.
    pub fn take_create_requests(&mut self) -> Vec<CreateRequest> {
        let store = &self.store;
        self.ready_creates
            .drain(..)
            .filter(|id| store.is_provisional(*id))
            .filter_map(|id| store.get(id))
            .map(|comment| CreateRequest {
                local_id: comment.id,
                submission: NewComment::from(comment),
                created_at: comment.created_at,
            })
            .collect()
    }

    /// Settles a provisional comment with the backend's answer.
    pub fn resolve_created(
        &mut self,
        local_id: CommentId,
        result: Result<Comment, SourceError>,
    ) -> Result<CreateOutcome, StoreError> {
        let outcome = match result {
            Ok(confirmed) => {
                let id = confirmed.id;
                self.store.confirm(local_id, confirmed).map(|()| {
                    // The push channel may have announced it before the
                    // backend answered
                    if self.live.discard(id).is_some() {
                        tracing::debug!(id, "Dropped staged copy of own comment");
                    }
                    if let Some(replies) = self.awaiting_parent.remove(&local_id) {
                        tracing::debug!(id, replies = replies.len(), "Releasing held replies");
                        self.ready_creates.extend(replies);
                    }
                    CreateOutcome::Confirmed(id)
                })
            }
            Err(e) => {
                tracing::warn!(local_id, error = %e, "Backend rejected comment, rolling back");
                self.store.rollback(local_id).map(CreateOutcome::RolledBack)
            }
        };

        // Held replies whose parent was rolled back or replaced went with it
        let store = &self.store;
        self.awaiting_parent
            .retain(|parent_id, _| store.is_provisional(*parent_id));

        match outcome {
            Err(StoreError::NotProvisional(_)) => {
                tracing::debug!(local_id, "Provisional comment already gone");
                Ok(CreateOutcome::Gone)
            }
            outcome => outcome,
        }
    }

    /// Stages a comment announced by the push channel. Returns false for
    /// comments the store already has.
    pub fn receive_push(&mut self, comment: Comment) -> bool {
        if self.store.contains(comment.id) {
            tracing::debug!(id = comment.id, "Ignoring pushed comment already in store");
            return false;
        }
        self.live.stage(comment);
        true
    }

    pub fn merge(&mut self) -> MergeReport {
        let report = self.live.merge_into_store(&mut self.store);
        tracing::info!(
            merged = report.merged.len(),
            held = report.held.len(),
            rejected = report.rejected.len(),
            "Merged new comments"
        );
        report
    }

    pub fn pending_count(&self) -> usize {
        self.live.count()
    }

    /// Fetch for the current listing, used for the first load.
    pub fn load(&mut self) -> FetchRequest {
        self.issue()
    }

    pub fn select_sort(&mut self, field: SortField) -> FetchRequest {
        self.listing.select_sort(field);
        self.issue()
    }

    pub fn next_page(&mut self) -> Option<FetchRequest> {
        let total_pages = self.total_pages();
        self.listing
            .next_page(total_pages)
            .then(|| self.issue())
    }

    pub fn prev_page(&mut self) -> Option<FetchRequest> {
        self.listing.prev_page().then(|| self.issue())
    }

    /// Issues the failed fetch again. Does nothing unless the last fetch
    /// failed.
    pub fn retry(&mut self) -> Option<FetchRequest> {
        matches!(self.fetch, FetchState::Failed { .. }).then(|| self.issue())
    }

    /// Applies a fetch response. Responses to anything but the most recently
    /// issued request are dropped and false is returned.
    pub fn apply_page(&mut self, token: FetchToken, result: Result<RootPage, SourceError>) -> bool {
        let Some(request) = self.in_flight.filter(|r| r.token == token) else {
            tracing::debug!(?token, "Dropping stale page response");
            return false;
        };
        self.in_flight = None;

        match result {
            Ok(page) => {
                self.known_total = page.total;
                self.last_page_len = page.comments.len();

                let rejected = self.store.replace_all(flatten_records(page.comments));
                if !rejected.is_empty() {
                    tracing::warn!(
                        rejected = rejected.len(),
                        "Page contained comments that could not be placed"
                    );
                }
                // Local comments are gone with the old page
                self.awaiting_parent.clear();

                self.fetch = FetchState::Idle;
                tracing::info!(
                    page = request.key.page,
                    sort_field = %request.key.sort_field,
                    sort_order = %request.key.sort_order,
                    "Loaded page"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, page = request.key.page, "Failed to load page");
                self.fetch = FetchState::Failed {
                    key: request.key,
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                };
            }
        }

        true
    }

    /// Number of pages of root comments. Uses the total reported by the data
    /// source; without one, a full page suggests there is at least one more.
    pub fn total_pages(&self) -> usize {
        match self.known_total {
            Some(total) => paginate::total_pages(total, self.listing.page_size),
            None if self.last_page_len >= self.listing.page_size => self.listing.page + 1,
            None => self.listing.page,
        }
    }

    pub fn snapshot(&self) -> ViewSnapshot {
        ViewSnapshot {
            threads: build_owned_forest(&self.store),
            listing: self.listing,
            total_pages: self.total_pages(),
            pending_count: self.live.count(),
            held_orphans: self.live.held_orphans(),
            fetch: self.fetch.clone(),
            revision: self.store.revision(),
        }
    }

    fn issue(&mut self) -> FetchRequest {
        self.next_token += 1;
        let request = FetchRequest {
            token: FetchToken(self.next_token),
            key: self.listing.key(),
            query: RootQuery::from(&self.listing),
        };
        self.in_flight = Some(request);
        self.fetch = FetchState::Loading { key: request.key };
        request
    }
}
