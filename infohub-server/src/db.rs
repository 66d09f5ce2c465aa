use anyhow::{anyhow, Context};
use chrono::{SubsecRound, Utc};
use futures::TryStreamExt;
use infohub_api::{
    check_reply_depth, Attachment, AttachmentId, AuthToken, CommentId, CommentRecord, FeedPage,
    FeedQuery, LikeState, NewComment, NewPost, Post, PostId, Role, Time, User, UserId, UserPost,
    Uuid, MAX_REPLY_DEPTH, PAGE_SIZE,
};
use sqlx::{postgres::PgRow, Row};

use crate::{query, Error};

fn user_from_row(r: &PgRow) -> anyhow::Result<User> {
    Ok(User {
        id: UserId(r.try_get("id").context("retrieving the id field")?),
        email: r.try_get("email").context("retrieving the email field")?,
        full_name: r
            .try_get("full_name")
            .context("retrieving the full_name field")?,
        photo_id_url: r
            .try_get("photo_id_url")
            .context("retrieving the photo_id_url field")?,
        role: r
            .try_get::<String, _>("role")
            .context("retrieving the role field")?
            .parse()
            .context("parsing the role field")?,
        team: r
            .try_get::<String, _>("team")
            .context("retrieving the team field")?
            .parse()
            .context("parsing the team field")?,
        created_at: r
            .try_get("created_at")
            .context("retrieving the created_at field")?,
    })
}

/// Current time, at the precision postgres stores
pub fn now() -> Time {
    Utc::now().trunc_subsecs(6)
}

const USER_FIELDS: &str = "id, email, full_name, photo_id_url, role, team, created_at";

/// Creates the user, unless the email is already taken
pub async fn create_user(
    conn: &mut sqlx::PgConnection,
    email: &str,
    full_name: &str,
    password_hash: &str,
    role: Role,
    team: infohub_api::Team,
) -> Result<UserId, Error> {
    let id = UserId(Uuid::new_v4());
    let res = sqlx::query(
        "
            INSERT INTO users (id, email, password, full_name, role, team, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (email) DO NOTHING
        ",
    )
    .bind(id.0)
    .bind(email)
    .bind(password_hash)
    .bind(full_name)
    .bind(role.as_str())
    .bind(team.as_str())
    .bind(now())
    .execute(conn)
    .await
    .with_context(|| format!("inserting user {email:?}"))?;
    match res.rows_affected() {
        1 => Ok(id),
        _ => Err(Error::email_already_used(String::from(email))),
    }
}

/// Id and password hash of the user with this email, if any
pub async fn fetch_credentials(
    conn: &mut sqlx::PgConnection,
    email: &str,
) -> anyhow::Result<Option<(UserId, String)>> {
    let row = sqlx::query("SELECT id, password FROM users WHERE email = $1")
        .bind(email)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching credentials of {email:?}"))?;
    row.map(|r| -> anyhow::Result<_> {
        Ok((
            UserId(r.try_get("id").context("retrieving the id field")?),
            r.try_get("password")
                .context("retrieving the password field")?,
        ))
    })
    .transpose()
}

pub async fn fetch_password_hash(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> anyhow::Result<Option<String>> {
    Ok(sqlx::query("SELECT password FROM users WHERE id = $1")
        .bind(user.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching password hash of {user:?}"))?
        .map(|r| r.try_get("password"))
        .transpose()
        .context("retrieving the password field")?)
}

pub async fn set_password_hash(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    hash: &str,
) -> anyhow::Result<()> {
    sqlx::query("UPDATE users SET password = $2 WHERE id = $1")
        .bind(user.0)
        .bind(hash)
        .execute(conn)
        .await
        .with_context(|| format!("updating password of {user:?}"))?;
    Ok(())
}

pub async fn create_session(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    device: &str,
) -> anyhow::Result<AuthToken> {
    let token = AuthToken(Uuid::new_v4());
    sqlx::query("INSERT INTO sessions VALUES ($1, $2, $3, $4, $4)")
        .bind(token.0)
        .bind(user.0)
        .bind(device)
        .bind(now())
        .execute(conn)
        .await
        .with_context(|| format!("inserting session for {user:?}"))?;
    Ok(token)
}

/// Returns true iff the session existed
pub async fn logout_user(conn: &mut sqlx::PgConnection, token: &AuthToken) -> anyhow::Result<bool> {
    let res = sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(token.0)
        .execute(conn)
        .await
        .context("deleting session")?;
    Ok(res.rows_affected() == 1)
}

pub async fn recover_session(
    conn: &mut sqlx::PgConnection,
    token: AuthToken,
) -> Result<(UserId, Role), Error> {
    let row = sqlx::query(
        "
            UPDATE sessions s
                SET last_active = $2
            FROM users u
            WHERE s.id = $1
            AND u.id = s.user_id
            RETURNING u.id, u.role
        ",
    )
    .bind(token.0)
    .bind(now())
    .fetch_optional(conn)
    .await
    .context("recovering session")?
    .ok_or(Error::permission_denied())?;
    let user = UserId(row.try_get("id").context("retrieving the id field")?);
    let role = row
        .try_get::<String, _>("role")
        .context("retrieving the role field")?
        .parse::<Role>()
        .context("parsing the role field")?;
    Ok((user, role))
}

pub async fn fetch_user(conn: &mut sqlx::PgConnection, user: UserId) -> anyhow::Result<Option<User>> {
    sqlx::query(&format!("SELECT {USER_FIELDS} FROM users WHERE id = $1"))
        .bind(user.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching user {user:?}"))?
        .map(|r| user_from_row(&r))
        .transpose()
}

pub async fn fetch_users(conn: &mut sqlx::PgConnection) -> anyhow::Result<Vec<User>> {
    let mut res = Vec::new();
    let sql = format!("SELECT {USER_FIELDS} FROM users ORDER BY created_at, id");
    let mut rows = sqlx::query(&sql).fetch(conn);
    while let Some(r) = rows.try_next().await.context("querying users table")? {
        res.push(user_from_row(&r)?);
    }
    Ok(res)
}

/// Oldest user with this exact full name
pub async fn fetch_user_by_name(
    conn: &mut sqlx::PgConnection,
    name: &str,
) -> anyhow::Result<Option<User>> {
    sqlx::query(&format!(
        "SELECT {USER_FIELDS} FROM users WHERE full_name = $1 ORDER BY created_at, id LIMIT 1"
    ))
    .bind(name)
    .fetch_optional(conn)
    .await
    .with_context(|| format!("fetching user named {name:?}"))?
    .map(|r| user_from_row(&r))
    .transpose()
}

pub async fn fetch_user_posts(
    conn: &mut sqlx::PgConnection,
    user: UserId,
) -> anyhow::Result<Vec<UserPost>> {
    let mut rows = sqlx::query(
        "
            SELECT p.id, p.title, p.type, p.tags, p.views, p.created_at,
                (SELECT COUNT(*) FROM likes l WHERE l.post_id = p.id) AS likes_count
            FROM posts p
            WHERE p.author_id = $1
            ORDER BY p.created_at DESC, p.id
        ",
    )
    .bind(user.0)
    .fetch(conn);
    let mut res = Vec::new();
    while let Some(r) = rows
        .try_next()
        .await
        .with_context(|| format!("fetching posts of {user:?}"))?
    {
        res.push(UserPost {
            id: PostId(r.try_get("id").context("retrieving the id field")?),
            title: r.try_get("title").context("retrieving the title field")?,
            post_type: r
                .try_get::<String, _>("type")
                .context("retrieving the type field")?
                .parse()
                .context("parsing the type field")?,
            tags: r.try_get("tags").context("retrieving the tags field")?,
            views: r.try_get("views").context("retrieving the views field")?,
            likes_count: r
                .try_get("likes_count")
                .context("retrieving the likes_count field")?,
            created_at: r
                .try_get("created_at")
                .context("retrieving the created_at field")?,
        });
    }
    Ok(res)
}

macro_rules! update_user_field {
    ($fn:ident, $field:literal, $typ:ty, |$v:ident| $bind:expr) => {
        /// Returns UserNotFound if the user does not exist
        pub async fn $fn(
            conn: &mut sqlx::PgConnection,
            user: UserId,
            $v: $typ,
        ) -> Result<(), Error> {
            let res = sqlx::query(concat!("UPDATE users SET ", $field, " = $2 WHERE id = $1"))
                .bind(user.0)
                .bind($bind)
                .execute(conn)
                .await
                .with_context(|| format!(concat!("updating ", $field, " of {:?}"), user))?;
            match res.rows_affected() {
                1 => Ok(()),
                _ => Err(Error::user_not_found(user.0.to_string())),
            }
        }
    };
}

update_user_field!(set_team, "team", infohub_api::Team, |team| team.as_str());
update_user_field!(set_role, "role", Role, |role| role.as_str());

/// Sets the photo of `user`, returning the url of the previous one
pub async fn set_photo(
    conn: &mut sqlx::PgConnection,
    user: UserId,
    url: &str,
) -> anyhow::Result<Option<String>> {
    let row = sqlx::query(
        "
            UPDATE users u
                SET photo_id_url = $2
            FROM users old
            WHERE u.id = $1
            AND old.id = u.id
            RETURNING old.photo_id_url
        ",
    )
    .bind(user.0)
    .bind(url)
    .fetch_optional(conn)
    .await
    .with_context(|| format!("updating photo of {user:?}"))?;
    Ok(match row {
        None => None,
        Some(r) => r
            .try_get("photo_id_url")
            .context("retrieving the photo_id_url field")?,
    })
}

pub async fn create_post(
    conn: &mut sqlx::PgConnection,
    author: UserId,
    p: &NewPost,
) -> anyhow::Result<PostId> {
    let id = PostId(Uuid::new_v4());
    sqlx::query(
        "
            INSERT INTO posts (id, author_id, title, content, type, tags, views, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
        ",
    )
    .bind(id.0)
    .bind(author.0)
    .bind(&p.title)
    .bind(&p.content)
    .bind(p.post_type.as_str())
    .bind(p.normalized_tags())
    .bind(now())
    .execute(conn)
    .await
    .with_context(|| format!("inserting post {:?}", p.title))?;
    Ok(id)
}

/// Returns false if the post does not exist
pub async fn update_post(
    conn: &mut sqlx::PgConnection,
    post: PostId,
    p: &NewPost,
) -> anyhow::Result<bool> {
    let res = sqlx::query("UPDATE posts SET title = $2, content = $3, type = $4, tags = $5 WHERE id = $1")
        .bind(post.0)
        .bind(&p.title)
        .bind(&p.content)
        .bind(p.post_type.as_str())
        .bind(p.normalized_tags())
        .execute(conn)
        .await
        .with_context(|| format!("updating post {post:?}"))?;
    Ok(res.rows_affected() == 1)
}

pub async fn post_author(
    conn: &mut sqlx::PgConnection,
    post: PostId,
) -> anyhow::Result<Option<UserId>> {
    Ok(sqlx::query("SELECT author_id FROM posts WHERE id = $1")
        .bind(post.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching author of {post:?}"))?
        .map(|r| r.try_get("author_id"))
        .transpose()
        .context("retrieving the author_id field")?
        .map(UserId))
}

/// Deletes the post along with everything attached to it, returning the urls
/// of the attachment files that should now be removed
pub async fn delete_post(conn: &mut sqlx::PgConnection, post: PostId) -> anyhow::Result<Vec<String>> {
    let mut tx = sqlx::Connection::begin(conn)
        .await
        .context("starting transaction")?;
    let mut urls = Vec::new();
    let mut rows = sqlx::query("SELECT file_url FROM attachments WHERE post_id = $1")
        .bind(post.0)
        .fetch(&mut *tx);
    while let Some(r) = rows
        .try_next()
        .await
        .with_context(|| format!("listing attachments of {post:?}"))?
    {
        urls.push(r.try_get("file_url").context("retrieving the file_url field")?);
    }
    std::mem::drop(rows); // free tx borrow
    sqlx::query("DELETE FROM posts WHERE id = $1")
        .bind(post.0)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("deleting post {post:?}"))?;
    tx.commit().await.context("committing transaction")?;
    Ok(urls)
}

/// Returns false if the post does not exist
pub async fn increment_views(conn: &mut sqlx::PgConnection, post: PostId) -> anyhow::Result<bool> {
    let res = sqlx::query("UPDATE posts SET views = views + 1 WHERE id = $1")
        .bind(post.0)
        .execute(conn)
        .await
        .with_context(|| format!("incrementing views of {post:?}"))?;
    Ok(res.rows_affected() == 1)
}

/// Assumes the viewer is bound as $1
const POST_SELECT: &str = "
    SELECT
        p.id, p.author_id, p.title, p.content, p.type, p.tags, p.views, p.created_at,
        u.full_name AS author_name,
        u.team AS author_team,
        (SELECT COUNT(*) FROM likes l WHERE l.post_id = p.id) AS likes_count,
        (SELECT COUNT(*) FROM comments c WHERE c.post_id = p.id) AS comments_count,
        EXISTS (SELECT 1 FROM likes l WHERE l.post_id = p.id AND l.user_id = $1) AS has_liked
    FROM posts p
    INNER JOIN users u
        ON u.id = p.author_id
";

fn post_from_row(r: &PgRow) -> anyhow::Result<Post> {
    Ok(Post {
        id: PostId(r.try_get("id").context("retrieving the id field")?),
        author_id: UserId(
            r.try_get("author_id")
                .context("retrieving the author_id field")?,
        ),
        author_name: r
            .try_get("author_name")
            .context("retrieving the author_name field")?,
        author_team: r
            .try_get::<String, _>("author_team")
            .context("retrieving the author_team field")?
            .parse()
            .context("parsing the author_team field")?,
        title: r.try_get("title").context("retrieving the title field")?,
        content: r.try_get("content").context("retrieving the content field")?,
        post_type: r
            .try_get::<String, _>("type")
            .context("retrieving the type field")?
            .parse()
            .context("parsing the type field")?,
        tags: r.try_get("tags").context("retrieving the tags field")?,
        views: r.try_get("views").context("retrieving the views field")?,
        likes_count: r
            .try_get("likes_count")
            .context("retrieving the likes_count field")?,
        comments_count: r
            .try_get("comments_count")
            .context("retrieving the comments_count field")?,
        has_liked: r
            .try_get("has_liked")
            .context("retrieving the has_liked field")?,
        created_at: r
            .try_get("created_at")
            .context("retrieving the created_at field")?,
    })
}

pub async fn fetch_post(
    conn: &mut sqlx::PgConnection,
    viewer: UserId,
    post: PostId,
) -> anyhow::Result<Option<Post>> {
    sqlx::query(&format!("{POST_SELECT} WHERE p.id = $2"))
        .bind(viewer.0)
        .bind(post.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching post {post:?}"))?
        .map(|r| post_from_row(&r))
        .transpose()
}

pub async fn fetch_feed(
    conn: &mut sqlx::PgConnection,
    viewer: UserId,
    q: &FeedQuery,
) -> anyhow::Result<FeedPage> {
    let filter = query::to_postgres(q, 1);
    let total: i64 = sqlx::query_with(
        &format!("SELECT COUNT(*) AS total FROM posts p WHERE {}", filter.where_clause),
        query::arguments(&filter.binds),
    )
    .fetch_one(&mut *conn)
    .await
    .context("counting feed posts")?
    .try_get("total")
    .context("retrieving the total field")?;

    // the viewer is $1
    let filter = query::to_postgres(q, 2);
    let args = query::arguments(&[&[query::Bind::Uuid(viewer.0)][..], &filter.binds[..]].concat());
    let sql = format!(
        "{POST_SELECT} WHERE {} ORDER BY {} LIMIT {} OFFSET {}",
        filter.where_clause,
        query::order_by(q.sort),
        PAGE_SIZE,
        q.offset(),
    );
    let mut posts = Vec::new();
    let mut rows = sqlx::query_with(&sql, args).fetch(&mut *conn);
    while let Some(r) = rows.try_next().await.context("querying feed")? {
        posts.push(post_from_row(&r)?);
    }
    Ok(FeedPage {
        posts,
        page: q.page(),
        total_pages: FeedPage::total_pages_for(
            usize::try_from(total).map_err(|_| anyhow!("negative post count {total}"))?,
        ),
    })
}

pub async fn fetch_comments(
    conn: &mut sqlx::PgConnection,
    viewer: UserId,
    post: PostId,
) -> anyhow::Result<Vec<CommentRecord>> {
    let mut rows = sqlx::query(
        "
            SELECT c.id, c.parent_id, c.author_id, c.content, c.created_at,
                u.full_name AS author_name,
                (SELECT COUNT(*) FROM likes l WHERE l.comment_id = c.id) AS likes_count,
                EXISTS (
                    SELECT 1 FROM likes l WHERE l.comment_id = c.id AND l.user_id = $2
                ) AS has_liked
            FROM comments c
            INNER JOIN users u
                ON u.id = c.author_id
            WHERE c.post_id = $1
            ORDER BY c.created_at, c.id
        ",
    )
    .bind(post.0)
    .bind(viewer.0)
    .fetch(conn);
    let mut res = Vec::new();
    while let Some(r) = rows
        .try_next()
        .await
        .with_context(|| format!("fetching comments of {post:?}"))?
    {
        res.push(CommentRecord {
            id: CommentId(r.try_get("id").context("retrieving the id field")?),
            parent_id: r
                .try_get::<Option<Uuid>, _>("parent_id")
                .context("retrieving the parent_id field")?
                .map(CommentId),
            author_id: UserId(
                r.try_get("author_id")
                    .context("retrieving the author_id field")?,
            ),
            author_name: r
                .try_get("author_name")
                .context("retrieving the author_name field")?,
            content: r.try_get("content").context("retrieving the content field")?,
            created_at: r
                .try_get("created_at")
                .context("retrieving the created_at field")?,
            likes_count: r
                .try_get("likes_count")
                .context("retrieving the likes_count field")?,
            has_liked: r
                .try_get("has_liked")
                .context("retrieving the has_liked field")?,
        });
    }
    Ok(res)
}

/// Number of ancestors still present above `comment`, counted up to
/// `MAX_REPLY_DEPTH`
pub async fn comment_depth(
    conn: &mut sqlx::PgConnection,
    comment: CommentId,
) -> anyhow::Result<usize> {
    let depth = sqlx::query(
        "
            WITH RECURSIVE ancestors (id, post_id, parent_id, depth) AS (
                SELECT id, post_id, parent_id, 0 FROM comments WHERE id = $1
            UNION ALL
                SELECT c.id, c.post_id, c.parent_id, a.depth + 1
                    FROM comments c
                INNER JOIN ancestors a
                    ON c.id = a.parent_id AND c.post_id = a.post_id
                WHERE a.depth < $2
            )
            SELECT MAX(depth) AS depth FROM ancestors
        ",
    )
    .bind(comment.0)
    .bind(MAX_REPLY_DEPTH as i32)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("computing the depth of comment {comment:?}"))?
    .try_get::<Option<i32>, _>("depth")
    .context("retrieving the depth field")?;
    Ok(depth.unwrap_or(0) as usize)
}

pub async fn create_comment(
    conn: &mut sqlx::PgConnection,
    author: UserId,
    post: PostId,
    c: &NewComment,
) -> Result<CommentId, Error> {
    if post_author(&mut *conn, post).await?.is_none() {
        return Err(Error::post_not_found(post));
    }
    if let Some(parent) = c.parent_id {
        let parent_post = sqlx::query("SELECT post_id FROM comments WHERE id = $1")
            .bind(parent.0)
            .fetch_optional(&mut *conn)
            .await
            .with_context(|| format!("fetching parent comment {parent:?}"))?
            .map(|r| r.try_get::<Uuid, _>("post_id"))
            .transpose()
            .context("retrieving the post_id field")?;
        if parent_post != Some(post.0) {
            return Err(Error::comment_not_found(parent));
        }
        check_reply_depth(comment_depth(&mut *conn, parent).await?)?;
    }
    let id = CommentId(Uuid::new_v4());
    sqlx::query("INSERT INTO comments VALUES ($1, $2, $3, $4, $5, $6)")
        .bind(id.0)
        .bind(author.0)
        .bind(post.0)
        .bind(c.parent_id.map(|p| p.0))
        .bind(&c.content)
        .bind(now())
        .execute(&mut *conn)
        .await
        .with_context(|| format!("inserting comment on {post:?}"))?;
    Ok(id)
}

pub async fn comment_author(
    conn: &mut sqlx::PgConnection,
    comment: CommentId,
) -> anyhow::Result<Option<UserId>> {
    Ok(sqlx::query("SELECT author_id FROM comments WHERE id = $1")
        .bind(comment.0)
        .fetch_optional(conn)
        .await
        .with_context(|| format!("fetching author of {comment:?}"))?
        .map(|r| r.try_get("author_id"))
        .transpose()
        .context("retrieving the author_id field")?
        .map(UserId))
}

pub async fn delete_comment(conn: &mut sqlx::PgConnection, comment: CommentId) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM comments WHERE id = $1")
        .bind(comment.0)
        .execute(conn)
        .await
        .with_context(|| format!("deleting comment {comment:?}"))?;
    Ok(())
}

macro_rules! toggle_like {
    ($fn:ident, $id:ty, $table:literal, $column:literal, $not_found:expr) => {
        pub async fn $fn(
            conn: &mut sqlx::PgConnection,
            user: UserId,
            target: $id,
        ) -> Result<LikeState, Error> {
            let mut tx = sqlx::Connection::begin(conn)
                .await
                .context("starting transaction")?;
            let exists = sqlx::query(concat!("SELECT 1 FROM ", $table, " WHERE id = $1 FOR SHARE"))
                .bind(target.0)
                .fetch_optional(&mut *tx)
                .await
                .with_context(|| format!("locking {:?}", target))?;
            if exists.is_none() {
                return Err($not_found(target));
            }
            let removed = sqlx::query(concat!(
                "DELETE FROM likes WHERE user_id = $1 AND ",
                $column,
                " = $2"
            ))
            .bind(user.0)
            .bind(target.0)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("removing like of {:?} on {:?}", user, target))?
            .rows_affected();
            if removed == 0 {
                sqlx::query(concat!(
                    "INSERT INTO likes (id, user_id, ",
                    $column,
                    ", created_at) VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING"
                ))
                .bind(Uuid::new_v4())
                .bind(user.0)
                .bind(target.0)
                .bind(now())
                .execute(&mut *tx)
                .await
                .with_context(|| format!("adding like of {:?} on {:?}", user, target))?;
            }
            let likes_count: i64 = sqlx::query(concat!(
                "SELECT COUNT(*) AS likes_count FROM likes WHERE ",
                $column,
                " = $1"
            ))
            .bind(target.0)
            .fetch_one(&mut *tx)
            .await
            .with_context(|| format!("counting likes on {:?}", target))?
            .try_get("likes_count")
            .context("retrieving the likes_count field")?;
            tx.commit().await.context("committing transaction")?;
            Ok(LikeState {
                liked: removed == 0,
                likes_count,
            })
        }
    };
}

toggle_like!(toggle_post_like, PostId, "posts", "post_id", Error::post_not_found);
toggle_like!(
    toggle_comment_like,
    CommentId,
    "comments",
    "comment_id",
    Error::comment_not_found
);

fn attachment_from_row(r: &PgRow) -> anyhow::Result<Attachment> {
    Ok(Attachment {
        id: AttachmentId(r.try_get("id").context("retrieving the id field")?),
        owner_id: UserId(r.try_get("owner_id").context("retrieving the owner_id field")?),
        post_id: PostId(r.try_get("post_id").context("retrieving the post_id field")?),
        file_url: r.try_get("file_url").context("retrieving the file_url field")?,
        file_name: r
            .try_get("file_name")
            .context("retrieving the file_name field")?,
        file_type: r
            .try_get("file_type")
            .context("retrieving the file_type field")?,
        file_size: r
            .try_get("file_size")
            .context("retrieving the file_size field")?,
        created_at: r
            .try_get::<Time, _>("created_at")
            .context("retrieving the created_at field")?,
    })
}

pub async fn fetch_attachments(
    conn: &mut sqlx::PgConnection,
    post: PostId,
) -> anyhow::Result<Vec<Attachment>> {
    let mut res = Vec::new();
    let mut rows = sqlx::query("SELECT * FROM attachments WHERE post_id = $1 ORDER BY created_at, id")
        .bind(post.0)
        .fetch(conn);
    while let Some(r) = rows.try_next().await.context("querying attachments table")? {
        res.push(attachment_from_row(&r)?);
    }
    Ok(res)
}

/// Locks the post against concurrent attachment uploads for the rest of the
/// transaction and returns how many attachments it has, or None if the post
/// does not exist
pub async fn lock_attachments(
    conn: &mut sqlx::PgConnection,
    post: PostId,
) -> anyhow::Result<Option<usize>> {
    let locked = sqlx::query("SELECT id FROM posts WHERE id = $1 FOR UPDATE")
        .bind(post.0)
        .fetch_optional(&mut *conn)
        .await
        .with_context(|| format!("locking {post:?}"))?;
    if locked.is_none() {
        return Ok(None);
    }
    let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM attachments WHERE post_id = $1")
        .bind(post.0)
        .fetch_one(conn)
        .await
        .with_context(|| format!("counting attachments of {post:?}"))?
        .try_get("count")
        .context("retrieving the count field")?;
    Ok(Some(usize::try_from(count).context("negative attachment count")?))
}

pub async fn insert_attachment(conn: &mut sqlx::PgConnection, a: &Attachment) -> anyhow::Result<()> {
    sqlx::query("INSERT INTO attachments VALUES ($1, $2, $3, $4, $5, $6, $7, $8)")
        .bind(a.id.0)
        .bind(a.owner_id.0)
        .bind(a.post_id.0)
        .bind(&a.file_url)
        .bind(&a.file_name)
        .bind(&a.file_type)
        .bind(a.file_size)
        .bind(a.created_at)
        .execute(conn)
        .await
        .with_context(|| format!("inserting attachment {:?}", a.file_name))?;
    Ok(())
}
