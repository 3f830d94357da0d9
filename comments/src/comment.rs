use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::markup::{self, MarkupError};

pub type CommentId = i64;

const MAX_NAME_LEN: usize = 50;
const MAX_EMAIL_LEN: usize = 50;
const MAX_TEXT_LEN: usize = 5000;

static USER_NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9]+$").expect("user name pattern is valid"));

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("email pattern is valid")
});

static HOMEPAGE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}(/[^\s]*)?$")
        .expect("homepage pattern is valid")
});

/// A single comment. Comments are never edited once created; the store only
/// ever replaces them wholesale.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Comment {
    pub id: CommentId,
    pub user_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub parent_id: Option<CommentId>,
}

impl Comment {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// A root comment as delivered by the data source, carrying one level of
/// inline replies.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CommentRecord {
    #[serde(flatten)]
    pub comment: Comment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<Comment>>,
}

impl From<Comment> for CommentRecord {
    fn from(comment: Comment) -> Self {
        CommentRecord {
            comment,
            replies: None,
        }
    }
}

/// Flattens a page of records into store order: each root followed by its
/// direct replies. Nested `replies` are not looked at past the first level.
pub fn flatten_records(records: Vec<CommentRecord>) -> Vec<Comment> {
    let mut flat = Vec::with_capacity(records.len());
    for record in records {
        flat.push(record.comment);
        if let Some(replies) = record.replies {
            flat.extend(replies);
        }
    }
    flat
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("No user name provided")]
    MissingUserName,

    #[error("User name too long (max {MAX_NAME_LEN} characters)")]
    UserNameTooLong,

    #[error("User name may only contain latin letters and digits")]
    InvalidUserName,

    #[error("No email provided")]
    MissingEmail,

    #[error("Email too long (max {MAX_EMAIL_LEN} characters)")]
    EmailTooLong,

    #[error("Invalid email")]
    InvalidEmail,

    #[error("Invalid homepage URL")]
    InvalidHomepage,

    #[error("No content provided")]
    MissingText,

    #[error("Content too long (max {MAX_TEXT_LEN} characters)")]
    TextTooLong,

    #[error(transparent)]
    Markup(#[from] MarkupError),
}

/// A comment as submitted by a visitor, before it has an id or a timestamp.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NewComment {
    pub user_name: String,
    pub email: String,
    pub text: String,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
}

impl NewComment {
    /// Normalizes the submission in place and checks every field. The
    /// submission is left untouched when a check fails.
    pub fn validate(&mut self) -> Result<(), SubmissionError> {
        let user_name = self.user_name.trim();
        if user_name.is_empty() {
            return Err(SubmissionError::MissingUserName);
        }
        if user_name.chars().count() > MAX_NAME_LEN {
            return Err(SubmissionError::UserNameTooLong);
        }
        if !USER_NAME_PATTERN.is_match(user_name) {
            return Err(SubmissionError::InvalidUserName);
        }

        let email = self.email.trim().to_lowercase();
        if email.is_empty() {
            return Err(SubmissionError::MissingEmail);
        }
        if email.chars().count() > MAX_EMAIL_LEN {
            return Err(SubmissionError::EmailTooLong);
        }
        if !EMAIL_PATTERN.is_match(&email) {
            return Err(SubmissionError::InvalidEmail);
        }

        let homepage = self
            .homepage
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty());
        if let Some(homepage) = homepage {
            if !HOMEPAGE_PATTERN.is_match(homepage) {
                return Err(SubmissionError::InvalidHomepage);
            }
        }

        let text = self.text.trim();
        if text.is_empty() {
            return Err(SubmissionError::MissingText);
        }
        if text.chars().count() > MAX_TEXT_LEN {
            return Err(SubmissionError::TextTooLong);
        }
        markup::validate(text)?;

        let homepage = homepage.map(str::to_string);
        let image_url = self
            .image_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string);

        self.user_name = user_name.to_string();
        self.text = text.to_string();
        self.email = email;
        self.homepage = homepage;
        self.image_url = image_url;

        Ok(())
    }

    pub fn into_comment(self, id: CommentId, created_at: DateTime<Utc>) -> Comment {
        Comment {
            id,
            user_name: self.user_name,
            email: self.email,
            created_at,
            text: self.text,
            homepage: self.homepage,
            image_url: self.image_url,
            parent_id: self.parent_id,
        }
    }
}

impl From<&Comment> for NewComment {
    fn from(comment: &Comment) -> Self {
        NewComment {
            user_name: comment.user_name.clone(),
            email: comment.email.clone(),
            text: comment.text.clone(),
            homepage: comment.homepage.clone(),
            image_url: comment.image_url.clone(),
            parent_id: comment.parent_id,
        }
    }
}

/// Hands out client-side ids derived from the clock. Ids are strictly
/// increasing for one generator even when the clock stalls or goes backwards.
#[derive(Debug, Default)]
pub struct LocalIdGenerator {
    last: CommentId,
}

impl LocalIdGenerator {
    pub fn next_id(&mut self, now: DateTime<Utc>) -> CommentId {
        let id = now.timestamp_micros().max(self.last + 1);
        self.last = id;
        id
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn submission() -> NewComment {
        NewComment {
            user_name: "  alice42 ".into(),
            email: " Alice@Example.COM ".into(),
            text: " <strong>hello</strong> ".into(),
            homepage: Some("".into()),
            image_url: None,
            parent_id: None,
        }
    }

    #[test]
    fn test_validate_normalizes_fields() {
        let mut c = submission();
        c.validate().unwrap();

        assert_eq!(c.user_name, "alice42");
        assert_eq!(c.email, "alice@example.com", "Email should be lowercased");
        assert_eq!(c.text, "<strong>hello</strong>");
        assert_eq!(c.homepage, None, "Empty homepage should be dropped");
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut c = submission();
        c.user_name = "alice smith".into();
        assert_eq!(c.validate(), Err(SubmissionError::InvalidUserName));

        let mut c = submission();
        c.email = "email.com".into();
        assert_eq!(c.validate(), Err(SubmissionError::InvalidEmail));

        let mut c = submission();
        c.homepage = Some("not a url".into());
        assert_eq!(c.validate(), Err(SubmissionError::InvalidHomepage));

        let mut c = submission();
        c.text = "   ".into();
        assert_eq!(c.validate(), Err(SubmissionError::MissingText));

        let mut c = submission();
        c.text = "x".repeat(MAX_TEXT_LEN + 1);
        assert_eq!(c.validate(), Err(SubmissionError::TextTooLong));
    }

    #[test]
    fn test_validate_rejects_markup_and_leaves_submission_untouched() {
        let mut c = submission();
        c.text = "<b>hi</b>".into();
        let before = c.clone();

        let err = c.validate().unwrap_err();
        assert!(matches!(err, SubmissionError::Markup(MarkupError::InvalidTag(ref t)) if t == "b"));
        assert_eq!(c, before, "A failed validation must not modify the submission");
    }

    #[test]
    fn test_flatten_records_keeps_replies_after_their_root() {
        let at = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();
        let mk = |id, parent_id| NewComment {
            parent_id,
            ..submission()
        }
        .into_comment(id, at);

        let records = vec![
            CommentRecord {
                comment: mk(1, None),
                replies: Some(vec![mk(2, Some(1)), mk(3, Some(1))]),
            },
            mk(4, None).into(),
        ];

        let ids: Vec<_> = flatten_records(records).iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_local_ids_strictly_increase() {
        let at = Utc.with_ymd_and_hms(2024, 10, 1, 12, 0, 0).unwrap();
        let mut ids = LocalIdGenerator::default();

        let a = ids.next_id(at);
        let b = ids.next_id(at);
        let c = ids.next_id(at - chrono::Duration::seconds(5));

        assert!(a < b && b < c, "Ids should increase even with a stalled clock");
    }
}
