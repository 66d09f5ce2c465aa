use std::{collections::BTreeMap, str::FromStr};

use anyhow::{anyhow, Context};
use serde_json::json;
use uuid::Uuid;

/// Field name to the list of problems found with it
pub type FieldErrors = BTreeMap<String, Vec<String>>;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Permission denied")]
    PermissionDenied,

    #[error("Email already used {0}")]
    EmailAlreadyUsed(String),

    #[error("Null byte in string is not allowed {0:?}")]
    NullByteInString(String),

    #[error("Invalid fields {0:?}")]
    InvalidFields(FieldErrors),

    #[error("User not found {0:?}")]
    UserNotFound(String),

    #[error("Post not found {0}")]
    PostNotFound(Uuid),

    #[error("Comment not found {0}")]
    CommentNotFound(Uuid),

    #[error("File is too large, limit is {limit} bytes")]
    FileTooLarge { limit: u64 },

    #[error("Invalid file type {0:?}")]
    InvalidFileType(String),

    #[error("Attachment limit of {0} reached")]
    AttachmentLimitReached(usize),
}

impl Error {
    pub fn field(field: &str, message: &str) -> Error {
        let mut errors = FieldErrors::new();
        errors.insert(String::from(field), vec![String::from(message)]);
        Error::InvalidFields(errors)
    }

    pub fn status_code(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::PermissionDenied => StatusCode::FORBIDDEN,
            Error::EmailAlreadyUsed(_) => StatusCode::CONFLICT,
            Error::NullByteInString(_) => StatusCode::BAD_REQUEST,
            Error::InvalidFields(_) => StatusCode::BAD_REQUEST,
            Error::UserNotFound(_) => StatusCode::NOT_FOUND,
            Error::PostNotFound(_) => StatusCode::NOT_FOUND,
            Error::CommentNotFound(_) => StatusCode::NOT_FOUND,
            Error::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::InvalidFileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::AttachmentLimitReached(_) => StatusCode::CONFLICT,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        serde_json::to_vec(&match self {
            Error::Unknown(msg) => json!({
                "message": msg,
                "type": "unknown",
            }),
            Error::PermissionDenied => json!({
                "message": "permission denied",
                "type": "permission-denied",
            }),
            Error::EmailAlreadyUsed(email) => json!({
                "message": "email already exists",
                "type": "conflict-email",
                "email": email,
            }),
            Error::NullByteInString(s) => json!({
                "message": "there was a null byte in argument string",
                "type": "null-byte",
                "string": s,
            }),
            Error::InvalidFields(fields) => json!({
                "message": "some fields are invalid",
                "type": "invalid-fields",
                "fields": fields,
            }),
            Error::UserNotFound(name) => json!({
                "message": "user not found",
                "type": "user-not-found",
                "name": name,
            }),
            Error::PostNotFound(id) => json!({
                "message": "post not found",
                "type": "post-not-found",
                "id": id,
            }),
            Error::CommentNotFound(id) => json!({
                "message": "comment not found",
                "type": "comment-not-found",
                "id": id,
            }),
            Error::FileTooLarge { limit } => json!({
                "message": "file is too large",
                "type": "file-too-large",
                "limit": limit,
            }),
            Error::InvalidFileType(name) => json!({
                "message": "invalid file type",
                "type": "invalid-file-type",
                "name": name,
            }),
            Error::AttachmentLimitReached(max) => json!({
                "message": "maximum attachment limit reached for this post",
                "type": "attachment-limit",
                "max": max,
            }),
        })
        .expect("serializing error contents")
    }

    pub fn parse(body: &[u8]) -> anyhow::Result<Error> {
        let data: serde_json::Value =
            serde_json::from_slice(body).context("parsing error contents")?;
        let string_field = |name: &str| {
            data.get(name)
                .and_then(|s| s.as_str())
                .map(String::from)
                .ok_or_else(|| anyhow!("error contents is missing string field {name:?}"))
        };
        let uuid_field = |name: &str| {
            data.get(name)
                .and_then(|u| u.as_str())
                .and_then(|u| Uuid::from_str(u).ok())
                .ok_or_else(|| anyhow!("error contents is missing uuid field {name:?}"))
        };
        let u64_field = |name: &str| {
            data.get(name)
                .and_then(|n| n.as_u64())
                .ok_or_else(|| anyhow!("error contents is missing integer field {name:?}"))
        };
        Ok(
            match data
                .get("type")
                .and_then(|t| t.as_str())
                .ok_or_else(|| anyhow!("error type is not a string"))?
            {
                "unknown" => Error::Unknown(string_field("message").unwrap_or_default()),
                "permission-denied" => Error::PermissionDenied,
                "conflict-email" => Error::EmailAlreadyUsed(string_field("email")?),
                "null-byte" => Error::NullByteInString(string_field("string")?),
                "invalid-fields" => Error::InvalidFields(
                    serde_json::from_value(
                        data.get("fields")
                            .cloned()
                            .ok_or_else(|| anyhow!("invalid-fields error without fields"))?,
                    )
                    .context("parsing invalid fields")?,
                ),
                "user-not-found" => Error::UserNotFound(string_field("name")?),
                "post-not-found" => Error::PostNotFound(uuid_field("id")?),
                "comment-not-found" => Error::CommentNotFound(uuid_field("id")?),
                "file-too-large" => Error::FileTooLarge {
                    limit: u64_field("limit")?,
                },
                "invalid-file-type" => Error::InvalidFileType(string_field("name")?),
                "attachment-limit" => Error::AttachmentLimitReached(
                    usize::try_from(u64_field("max")?).context("attachment limit overflow")?,
                ),
                _ => return Err(anyhow!("error contents has unknown type")),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_errors_keep_every_message() {
        let mut fields = FieldErrors::new();
        fields.insert(
            String::from("password"),
            vec![String::from("too short"), String::from("no match")],
        );
        fields.insert(String::from("email"), vec![String::from("invalid")]);
        let e = Error::InvalidFields(fields);
        assert_eq!(Error::parse(&e.contents()).unwrap(), e);
    }

    #[test]
    fn unknown_error_without_message_parses() {
        assert_eq!(
            Error::parse(br#"{"type": "unknown"}"#).unwrap(),
            Error::Unknown(String::new())
        );
    }

    #[test]
    fn missing_payload_is_rejected() {
        assert!(Error::parse(br#"{"type": "post-not-found"}"#).is_err());
        assert!(Error::parse(br#"{"type": "file-too-large", "limit": "big"}"#).is_err());
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Error::parse(br#"{"type": "nope"}"#).is_err());
        assert!(Error::parse(b"not json").is_err());
    }

    #[test]
    fn status_codes() {
        assert_eq!(Error::PermissionDenied.status_code(), http::StatusCode::FORBIDDEN);
        assert_eq!(
            Error::PostNotFound(Uuid::nil()).status_code(),
            http::StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::FileTooLarge { limit: 1 }.status_code(),
            http::StatusCode::PAYLOAD_TOO_LARGE
        );
    }
}
