//! Sorting and paging of root comments. Replies are never reordered here,
//! they always keep the store's oldest-first order.

use std::{cmp::Reverse, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{comment::Comment, store::CommentStore};

pub const DEFAULT_PAGE_SIZE: usize = 25;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    UserName,
    Email,
    #[default]
    CreatedAt,
    /// Keep the store order
    None,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn flipped(self) -> Self {
        match self {
            SortOrder::Asc => SortOrder::Desc,
            SortOrder::Desc => SortOrder::Asc,
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_name" => Ok(SortField::UserName),
            "email" => Ok(SortField::Email),
            "created_at" => Ok(SortField::CreatedAt),
            "none" => Ok(SortField::None),
            _ => Err(format!("invalid sort field `{s}`")),
        }
    }
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(SortOrder::Asc),
            "desc" => Ok(SortOrder::Desc),
            _ => Err(format!("invalid sort order `{s}`")),
        }
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortField::UserName => "user_name",
            SortField::Email => "email",
            SortField::CreatedAt => "created_at",
            SortField::None => "none",
        })
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        })
    }
}

/// Identifies one listing request. A response is only ever applied for the
/// key it was requested with.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
pub struct ListingKey {
    pub sort_field: SortField,
    pub sort_order: SortOrder,
    pub page: usize,
}

/// The visitor's current sort and page selection.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub struct ListingState {
    pub sort_field: SortField,
    pub sort_order: SortOrder,
    /// 1-indexed
    pub page: usize,
    pub page_size: usize,
}

impl Default for ListingState {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl ListingState {
    pub fn new(page_size: usize) -> Self {
        Self {
            sort_field: SortField::default(),
            sort_order: SortOrder::default(),
            page: 1,
            page_size: page_size.max(1),
        }
    }

    /// Picking a new field sorts ascending by it, picking the current field
    /// again flips the order. Either way the listing goes back to page 1.
    pub fn select_sort(&mut self, field: SortField) {
        if self.sort_field == field {
            self.sort_order = self.sort_order.flipped();
        } else {
            self.sort_field = field;
            self.sort_order = SortOrder::Asc;
        }
        self.page = 1;
    }

    /// Returns false, leaving the state alone, when already on the last page.
    pub fn next_page(&mut self, total_pages: usize) -> bool {
        if self.page >= total_pages {
            return false;
        }
        self.page += 1;
        true
    }

    /// Returns false, leaving the state alone, when already on the first page.
    pub fn prev_page(&mut self) -> bool {
        if self.page <= 1 {
            return false;
        }
        self.page -= 1;
        true
    }

    pub fn clamp(&mut self, total_pages: usize) {
        self.page = self.page.clamp(1, total_pages.max(1));
    }

    pub fn key(&self) -> ListingKey {
        ListingKey {
            sort_field: self.sort_field,
            sort_order: self.sort_order,
            page: self.page,
        }
    }

    /// Pages count from 1; a page of 0 is read as the first page.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1) * self.page_size
    }
}

pub fn total_pages(count: usize, page_size: usize) -> usize {
    count.div_ceil(page_size.max(1)).max(1)
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct Page<'a> {
    pub comments: Vec<&'a Comment>,
    pub page: usize,
    pub total_pages: usize,
}

/// Orders comments by `field`. The sort is stable, so comments with equal keys
/// keep their incoming order in both directions.
pub fn sort_comments(comments: &mut [&Comment], field: SortField, order: SortOrder) {
    match field {
        SortField::None => {}
        SortField::CreatedAt => comments.sort_by(|a, b| match order {
            SortOrder::Asc => a.created_at.cmp(&b.created_at),
            SortOrder::Desc => b.created_at.cmp(&a.created_at),
        }),
        SortField::UserName => sort_text(comments, order, |c| c.user_name.as_str()),
        SortField::Email => sort_text(comments, order, |c| c.email.as_str()),
    }
}

fn sort_text(comments: &mut [&Comment], order: SortOrder, text: impl Fn(&Comment) -> &str) {
    match order {
        SortOrder::Asc => comments.sort_by_cached_key(|c| text(c).to_lowercase()),
        SortOrder::Desc => comments.sort_by_cached_key(|c| Reverse(text(c).to_lowercase())),
    }
}

/// The root comments of `store` sorted according to `field` and `order`.
pub fn sort_roots(store: &CommentStore, field: SortField, order: SortOrder) -> Vec<&Comment> {
    let mut roots = store.roots();
    sort_comments(&mut roots, field, order);
    roots
}

/// The page of sorted root comments selected by `state`. A page past the end
/// is read as the last page.
pub fn paginate<'a>(store: &'a CommentStore, state: &ListingState) -> Page<'a> {
    let sorted = sort_roots(store, state.sort_field, state.sort_order);
    let total_pages = total_pages(sorted.len(), state.page_size);

    let mut state = *state;
    state.clamp(total_pages);

    let comments = sorted
        .into_iter()
        .skip(state.offset())
        .take(state.page_size)
        .collect();

    Page {
        comments,
        page: state.page,
        total_pages,
    }
}
