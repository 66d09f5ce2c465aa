use infohub_api::{CommentId, Error as ApiError, PostId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl Error {
    pub fn permission_denied() -> Error {
        Error::Api(ApiError::PermissionDenied)
    }

    pub fn email_already_used(email: String) -> Error {
        Error::Api(ApiError::EmailAlreadyUsed(email))
    }

    pub fn user_not_found(name: String) -> Error {
        Error::Api(ApiError::UserNotFound(name))
    }

    pub fn post_not_found(post: PostId) -> Error {
        Error::Api(ApiError::PostNotFound(post.0))
    }

    pub fn comment_not_found(comment: CommentId) -> Error {
        Error::Api(ApiError::CommentNotFound(comment.0))
    }
}

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let err = match self {
            Error::Anyhow(err) => {
                tracing::error!(?err, "internal server error");
                #[cfg(not(test))]
                let err =
                    ApiError::Unknown(String::from("Internal server error, see logs for details"));
                #[cfg(test)]
                let err = ApiError::Unknown(format!("Internal server error: {err:?}"));
                err
            }
            Error::Api(err) => {
                tracing::info!("returning error to client: {err}");
                err
            }
        };
        (
            err.status_code(),
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            err.contents(),
        )
            .into_response()
    }
}
