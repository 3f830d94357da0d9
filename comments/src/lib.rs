//! Core of a threaded comment widget: validating submissions, keeping the
//! comments of the current page in a flat store, building reply threads from
//! it, sorting and paging root comments, and holding back comments pushed by
//! other visitors until they are merged in.

pub mod comment;
pub mod config;
pub mod engine;
pub mod error;
pub mod json;
pub mod live;
pub mod markup;
pub mod memory;
pub mod paginate;
pub mod routes;
pub mod source;
pub mod store;
pub mod tree;

pub use comment::{Comment, CommentId, CommentRecord, NewComment};
pub use engine::{CommentEngine, EngineHandle, ViewSnapshot};
pub use error::Error;
pub use live::LiveUpdateBuffer;
pub use paginate::{ListingState, SortField, SortOrder};
pub use store::CommentStore;
pub use tree::{Thread, build_forest};
