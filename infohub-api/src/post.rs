use std::{fmt, str::FromStr};

use uuid::Uuid;

use crate::{Attachment, CommentNode, Error, FieldErrors, Team, Time, UserId};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct PostId(pub Uuid);

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum PostType {
    Article,
    Discussion,
    Inquiry,
}

impl PostType {
    pub const ALL: [PostType; 3] = [PostType::Article, PostType::Discussion, PostType::Inquiry];

    pub fn as_str(&self) -> &'static str {
        match self {
            PostType::Article => "Article",
            PostType::Discussion => "Discussion",
            PostType::Inquiry => "Inquiry",
        }
    }
}

impl Default for PostType {
    fn default() -> PostType {
        PostType::Article
    }
}

impl fmt::Display for PostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostType {
    type Err = Error;

    fn from_str(s: &str) -> Result<PostType, Error> {
        PostType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::field("type", "Unknown post type"))
    }
}

/// Body of both post creation and post edition
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewPost {
    pub title: String,
    pub content: String,
    #[serde(rename = "type", default)]
    pub post_type: PostType,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl NewPost {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.title)?;
        crate::validate_string(&self.content)?;
        for t in &self.tags {
            crate::validate_string(t)?;
        }
        let mut errors = FieldErrors::new();
        crate::require_len(&mut errors, "title", &self.title, 1, "Title is required");
        crate::require_len(&mut errors, "content", &self.content, 1, "Content is required");
        match errors.is_empty() {
            true => Ok(()),
            false => Err(Error::InvalidFields(errors)),
        }
    }

    /// Trimmed, non-empty tags, first occurrence of each kept
    pub fn normalized_tags(&self) -> Vec<String> {
        let mut res: Vec<String> = Vec::with_capacity(self.tags.len());
        for t in self.tags.iter().map(|t| t.trim()) {
            if !t.is_empty() && !res.iter().any(|r| r == t) {
                res.push(String::from(t));
            }
        }
        res
    }
}

/// A post as shown in the feed and on its own page
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Post {
    pub id: PostId,
    pub author_id: UserId,
    pub author_name: String,
    pub author_team: Team,
    pub title: String,
    pub content: String,
    #[serde(rename = "type")]
    pub post_type: PostType,
    pub tags: Vec<String>,
    pub views: i64,
    pub likes_count: i64,
    pub comments_count: i64,
    pub has_liked: bool,
    pub created_at: Time,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PostView {
    pub post: Post,
    pub attachments: Vec<Attachment>,
    /// Newest thread first, replies oldest first
    pub comments: Vec<CommentNode>,
}
