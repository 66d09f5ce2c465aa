use anyhow::Context;
use axum::{
    extract::{Multipart, Path, State},
    http::header,
    Json,
};
use infohub_api::{
    build_comment_tree, check_photo, check_upload, Attachment, AttachmentId, AuthToken,
    ChangePassword, ChangeRole, ChangeTeam, CommentId, Error as ApiError, FeedPage, FeedQuery,
    LikeState, NewComment, NewPost, NewSession, NewUser, PostId, PostView, Role, User, UserId,
    UserProfile, UserStats, Uuid, MAX_FILE_SIZE, MAX_PHOTO_SIZE, SESSION_COOKIE,
};

use crate::{
    db,
    extractors::*,
    uploads::{photo_extension, UploadDir},
    Error,
};

#[cfg(not(test))]
const HASH_COST: u32 = infohub_api::BCRYPT_COST;
// bcrypt's minimum, tests hash a lot of passwords
#[cfg(test)]
const HASH_COST: u32 = 4;

type SetCookie = [(header::HeaderName, String); 1];

fn session_cookie(token: AuthToken) -> SetCookie {
    [(
        header::SET_COOKIE,
        format!("{SESSION_COOKIE}={}; HttpOnly; SameSite=Lax; Path=/", token.0),
    )]
}

fn clear_session_cookie() -> SetCookie {
    [(
        header::SET_COOKIE,
        format!("{SESSION_COOKIE}=; HttpOnly; SameSite=Lax; Path=/; Max-Age=0"),
    )]
}

async fn hash_password(password: String) -> anyhow::Result<String> {
    tokio::task::spawn_blocking(move || bcrypt::hash(password, HASH_COST))
        .await
        .context("joining password hashing task")?
        .context("hashing password")
}

async fn verify_password(password: String, hash: String) -> anyhow::Result<bool> {
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .context("joining password verification task")?
        .context("verifying password")
}

async fn create_user(
    conn: &mut sqlx::PgConnection,
    data: NewUser,
    role: Role,
) -> Result<UserId, Error> {
    data.validate()?;
    let hash = hash_password(data.password).await?;
    let id = db::create_user(
        conn,
        &data.email,
        data.full_name.trim(),
        &hash,
        role,
        data.team,
    )
    .await?;
    tracing::info!(?id, ?role, "created user");
    Ok(id)
}

pub async fn signup(mut conn: PgConn, Json(data): Json<NewUser>) -> Result<Json<UserId>, Error> {
    Ok(Json(create_user(&mut *conn, data, Role::User).await?))
}

pub async fn admin_create_user(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Json(data): Json<NewUser>,
) -> Result<Json<UserId>, Error> {
    let role = data.role;
    Ok(Json(create_user(&mut *conn, data, role).await?))
}

pub async fn auth(
    mut conn: PgConn,
    Json(data): Json<NewSession>,
) -> Result<(SetCookie, Json<AuthToken>), Error> {
    data.validate()?;
    let (user, hash) = db::fetch_credentials(&mut *conn, &data.email)
        .await?
        .ok_or(Error::permission_denied())?;
    if !verify_password(data.password, hash).await? {
        return Err(Error::permission_denied());
    }
    let token = db::create_session(&mut *conn, user, &data.device)
        .await
        .context("logging user in")?;
    tracing::debug!(?user, device = ?data.device, "user logged in");
    Ok((session_cookie(token), Json(token)))
}

pub async fn unauth(user: PreAuth, mut conn: PgConn) -> Result<SetCookie, Error> {
    match db::logout_user(&mut *conn, &user.0).await {
        Ok(true) => Ok(clear_session_cookie()),
        Ok(false) => Err(Error::permission_denied()),
        Err(e) => Err(Error::Anyhow(e)),
    }
}

pub async fn whoami(user: Auth, mut conn: PgConn) -> Result<Json<User>, Error> {
    Ok(Json(
        db::fetch_user(&mut *conn, user.user)
            .await?
            .ok_or(Error::permission_denied())?,
    ))
}

pub async fn fetch_users(user: Auth, mut conn: PgConn) -> Result<Json<Vec<User>>, Error> {
    Ok(Json(db::fetch_users(&mut *conn).await.with_context(
        || format!("fetching user list for {:?}", user.user),
    )?))
}

pub async fn fetch_user_profile(
    _user: Auth,
    mut conn: PgConn,
    Path(name): Path<String>,
) -> Result<Json<UserProfile>, Error> {
    let user = db::fetch_user_by_name(&mut *conn, &name)
        .await?
        .ok_or_else(|| Error::user_not_found(name.clone()))?;
    let posts = db::fetch_user_posts(&mut *conn, user.id).await?;
    Ok(Json(UserProfile {
        stats: UserStats::of(&posts),
        user,
        posts,
    }))
}

pub async fn change_team(
    user: Auth,
    mut conn: PgConn,
    Json(data): Json<ChangeTeam>,
) -> Result<(), Error> {
    db::set_team(&mut *conn, user.user, data.team).await
}

pub async fn change_password(
    user: Auth,
    mut conn: PgConn,
    Json(data): Json<ChangePassword>,
) -> Result<(), Error> {
    data.validate()?;
    let hash = db::fetch_password_hash(&mut *conn, user.user)
        .await?
        .ok_or(Error::permission_denied())?;
    if !verify_password(data.current_password, hash).await? {
        return Err(Error::Api(ApiError::field(
            "currentPassword",
            "Incorrect current password.",
        )));
    }
    let hash = hash_password(data.new_password).await?;
    db::set_password_hash(&mut *conn, user.user, &hash).await?;
    tracing::info!(user = ?user.user, "password changed");
    Ok(())
}

pub async fn upload_photo(
    user: Auth,
    State(pool): State<PgPool>,
    State(uploads): State<UploadDir>,
    mut multipart: Multipart,
) -> Result<Json<String>, Error> {
    let staged = uploads
        .stage(&mut multipart, "photo", MAX_PHOTO_SIZE)
        .await?;
    check_photo(&staged.content_type, staged.size)?;
    let ext = photo_extension(&staged.content_type);
    let url = uploads.commit(staged, ext).await?;
    let mut conn = pool.acquire().await?;
    let previous = db::set_photo(&mut *conn, user.user, &url).await?;
    if let Some(previous) = previous {
        if let Err(err) = uploads.remove(&previous).await {
            tracing::warn!(?err, "failed removing previous photo");
        }
    }
    Ok(Json(url))
}

pub async fn set_role(
    AdminAuth: AdminAuth,
    mut conn: PgConn,
    Path(id): Path<Uuid>,
    Json(data): Json<ChangeRole>,
) -> Result<(), Error> {
    db::set_role(&mut *conn, UserId(id), data.role).await?;
    tracing::info!(user = ?id, role = ?data.role, "changed user role");
    Ok(())
}

pub async fn create_post(
    user: Auth,
    mut conn: PgConn,
    Json(data): Json<NewPost>,
) -> Result<Json<PostId>, Error> {
    data.validate()?;
    Ok(Json(db::create_post(&mut *conn, user.user, &data).await?))
}

pub async fn fetch_post(
    user: Auth,
    mut conn: PgConn,
    Path(id): Path<Uuid>,
) -> Result<Json<PostView>, Error> {
    let id = PostId(id);
    if !db::increment_views(&mut *conn, id).await? {
        return Err(Error::post_not_found(id));
    }
    let post = db::fetch_post(&mut *conn, user.user, id)
        .await?
        .ok_or(Error::post_not_found(id))?;
    let attachments = db::fetch_attachments(&mut *conn, id).await?;
    let tree = build_comment_tree(db::fetch_comments(&mut *conn, user.user, id).await?);
    if !tree.orphans.is_empty() {
        tracing::warn!(post = ?id, orphans = ?tree.orphans, "comments with no reachable parent shown as threads");
    }
    if !tree.duplicates.is_empty() {
        tracing::warn!(post = ?id, duplicates = ?tree.duplicates, "duplicate comment ids");
    }
    Ok(Json(PostView {
        post,
        attachments,
        comments: tree.roots,
    }))
}

async fn check_post_edit(
    conn: &mut sqlx::PgConnection,
    user: &Auth,
    post: PostId,
) -> Result<(), Error> {
    let author = db::post_author(conn, post)
        .await?
        .ok_or(Error::post_not_found(post))?;
    if !user.can_edit(author) {
        return Err(Error::permission_denied());
    }
    Ok(())
}

pub async fn edit_post(
    user: Auth,
    mut conn: PgConn,
    Path(id): Path<Uuid>,
    Json(data): Json<NewPost>,
) -> Result<(), Error> {
    let id = PostId(id);
    data.validate()?;
    check_post_edit(&mut *conn, &user, id).await?;
    if !db::update_post(&mut *conn, id, &data).await? {
        return Err(Error::post_not_found(id));
    }
    Ok(())
}

pub async fn delete_post(
    user: Auth,
    State(uploads): State<UploadDir>,
    mut conn: PgConn,
    Path(id): Path<Uuid>,
) -> Result<(), Error> {
    let id = PostId(id);
    check_post_edit(&mut *conn, &user, id).await?;
    for url in db::delete_post(&mut *conn, id).await? {
        if let Err(err) = uploads.remove(&url).await {
            tracing::warn!(?err, ?url, "failed removing attachment of deleted post");
        }
    }
    tracing::info!(post = ?id, by = ?user.user, "deleted post");
    Ok(())
}

pub async fn fetch_feed(
    user: Auth,
    mut conn: PgConn,
    Json(q): Json<FeedQuery>,
) -> Result<Json<FeedPage>, Error> {
    q.validate()?;
    Ok(Json(
        db::fetch_feed(&mut *conn, user.user, &q)
            .await
            .with_context(|| format!("fetching feed for {:?}", user.user))?,
    ))
}

pub async fn create_comment(
    user: Auth,
    mut conn: PgConn,
    Path(post): Path<Uuid>,
    Json(data): Json<NewComment>,
) -> Result<Json<CommentId>, Error> {
    data.validate()?;
    Ok(Json(
        db::create_comment(&mut *conn, user.user, PostId(post), &data).await?,
    ))
}

pub async fn delete_comment(
    user: Auth,
    mut conn: PgConn,
    Path(id): Path<Uuid>,
) -> Result<(), Error> {
    let id = CommentId(id);
    let author = db::comment_author(&mut *conn, id)
        .await?
        .ok_or(Error::comment_not_found(id))?;
    if !user.can_edit(author) {
        return Err(Error::permission_denied());
    }
    db::delete_comment(&mut *conn, id).await?;
    Ok(())
}

pub async fn like_post(
    user: Auth,
    mut conn: PgConn,
    Path(id): Path<Uuid>,
) -> Result<Json<LikeState>, Error> {
    Ok(Json(
        db::toggle_post_like(&mut *conn, user.user, PostId(id)).await?,
    ))
}

pub async fn like_comment(
    user: Auth,
    mut conn: PgConn,
    Path(id): Path<Uuid>,
) -> Result<Json<LikeState>, Error> {
    Ok(Json(
        db::toggle_comment_like(&mut *conn, user.user, CommentId(id)).await?,
    ))
}

pub async fn upload_attachment(
    user: Auth,
    State(pool): State<PgPool>,
    State(uploads): State<UploadDir>,
    Path(post): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<Attachment>, Error> {
    let post = PostId(post);
    {
        // do not hold onto a connection while receiving the file
        let mut conn = pool.acquire().await?;
        check_post_edit(&mut *conn, &user, post).await?;
    }
    let staged = uploads.stage(&mut multipart, "file", MAX_FILE_SIZE).await?;

    let mut conn = pool.acquire().await?;
    let mut tx = sqlx::Connection::begin(&mut *conn)
        .await
        .context("starting transaction")?;
    let existing = db::lock_attachments(&mut *tx, post)
        .await?
        .ok_or(Error::post_not_found(post))?;
    let ext = check_upload(&staged.file_name, staged.size, existing)?;
    let attachment = Attachment {
        id: AttachmentId(Uuid::new_v4()),
        owner_id: user.user,
        post_id: post,
        file_name: staged.file_name.clone(),
        file_type: staged.content_type.clone(),
        file_size: Some(i64::try_from(staged.size).context("file size overflows i64")?),
        file_url: uploads.commit(staged, &ext).await?,
        created_at: db::now(),
    };
    let stored = match db::insert_attachment(&mut *tx, &attachment).await {
        Ok(()) => tx.commit().await.context("committing transaction"),
        Err(e) => Err(e),
    };
    if let Err(err) = stored {
        if let Err(err) = uploads.remove(&attachment.file_url).await {
            tracing::warn!(?err, "failed removing upload after database error");
        }
        return Err(Error::Anyhow(err));
    }
    tracing::debug!(post = ?post, file = ?attachment.file_name, "stored attachment");
    Ok(Json(attachment))
}
