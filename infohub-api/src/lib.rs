use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

mod attachment;
pub use attachment::{
    check_photo, check_upload, file_extension, Attachment, AttachmentId, ALLOWED_EXTENSIONS,
    MAX_FILES_PER_POST, MAX_FILE_SIZE, MAX_PHOTO_SIZE, PHOTO_CONTENT_TYPES,
};

mod auth;
pub use auth::{
    validate_email, validate_password, AuthToken, ChangePassword, NewSession, NewUser,
    BCRYPT_COST, MIN_PASSWORD_LEN, SESSION_COOKIE,
};

mod comment;
pub use comment::{
    build_comment_tree, check_reply_depth, CommentId, CommentNode, CommentRecord, CommentTree,
    NewComment, MAX_REPLY_DEPTH,
};

mod error;
pub use error::{Error, FieldErrors};

mod feed;
pub use feed::{FeedPage, FeedQuery, FeedSort, PAGE_SIZE};

mod post;
pub use post::{NewPost, Post, PostId, PostType, PostView};

mod user;
pub use user::{ChangeRole, ChangeTeam, Role, Team, User, UserId, UserPost, UserProfile, UserStats};

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct LikeState {
    pub liked: bool,
    pub likes_count: i64,
}

pub fn validate_string(s: &str) -> Result<(), Error> {
    if s.contains('\0') {
        Err(Error::NullByteInString(String::from(s)))
    } else {
        Ok(())
    }
}

/// Adds `message` under `field` unless `s` has at least `min` characters once trimmed
pub(crate) fn require_len(errors: &mut FieldErrors, field: &str, s: &str, min: usize, message: &str) {
    if s.trim().chars().count() < min {
        errors
            .entry(String::from(field))
            .or_insert_with(Vec::new)
            .push(String::from(message));
    }
}
