use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    routing::{get, get_service, post},
    Router,
};
use infohub_api::{AuthToken, Uuid};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing_subscriber::EnvFilter;

mod db;
mod error;
mod extractors;
mod fuzz;
mod handlers;
mod query;
mod uploads;

use error::Error;
use extractors::{AppState, PgPool};
use uploads::UploadDir;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(structopt::StructOpt)]
struct Opt {
    /// Postgres connection string
    #[structopt(long, env = "DATABASE_URL")]
    database_url: String,

    #[structopt(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Where attachments and profile photos are stored
    #[structopt(long, env = "UPLOAD_DIR", default_value = "uploads", parse(from_os_str))]
    upload_dir: PathBuf,

    /// Token granting access to the admin routes, for use by infohub-ctl
    #[structopt(long, env = "ADMIN_TOKEN")]
    admin_token: Option<Uuid>,
}

pub async fn create_sqlx_pool(db_url: &str) -> anyhow::Result<PgPool> {
    Ok(PgPool::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(16)
            .connect(db_url)
            .await
            .with_context(|| format!("Error opening database {:?}", db_url))?,
    ))
}

pub async fn app(db: PgPool, admin_token: Option<AuthToken>, uploads: UploadDir) -> Router {
    let files = get_service(ServeDir::new(uploads.path())).handle_error(
        |err: std::io::Error| async move {
            tracing::error!(?err, "failed serving uploaded file");
            StatusCode::INTERNAL_SERVER_ERROR
        },
    );
    let state = AppState {
        db,
        uploads,
        admin_token,
    };
    Router::new()
        .route("/api/signup", post(handlers::signup))
        .route("/api/auth", post(handlers::auth))
        .route("/api/unauth", post(handlers::unauth))
        .route("/api/whoami", get(handlers::whoami))
        .route("/api/users", get(handlers::fetch_users))
        .route("/api/users/by-name/:name", get(handlers::fetch_user_profile))
        .route("/api/me/team", post(handlers::change_team))
        .route("/api/me/password", post(handlers::change_password))
        .route(
            "/api/me/photo",
            post(handlers::upload_photo).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/admin/create-user", post(handlers::admin_create_user))
        .route("/api/admin/users/:id/role", post(handlers::set_role))
        .route("/api/posts", post(handlers::create_post))
        .route(
            "/api/posts/:id",
            get(handlers::fetch_post)
                .put(handlers::edit_post)
                .delete(handlers::delete_post),
        )
        .route("/api/posts/:id/comments", post(handlers::create_comment))
        .route("/api/posts/:id/like", post(handlers::like_post))
        .route(
            "/api/posts/:id/attachments",
            post(handlers::upload_attachment).layer(DefaultBodyLimit::disable()),
        )
        .route("/api/comments/:id", axum::routing::delete(handlers::delete_comment))
        .route("/api/comments/:id/like", post(handlers::like_comment))
        .route("/api/feed", post(handlers::fetch_feed))
        .nest_service("/uploads", files)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug")),
        )
        .init();

    let opt = <Opt as structopt::StructOpt>::from_args();

    let db = create_sqlx_pool(&opt.database_url).await?;
    MIGRATOR
        .run(&mut *db.acquire().await?)
        .await
        .context("applying migrations")?;

    let uploads = UploadDir::new(opt.upload_dir).await?;
    if opt.admin_token.is_none() {
        tracing::warn!("no ADMIN_TOKEN set, admin routes only accept admin users' sessions");
    }
    let app = app(db, opt.admin_token.map(AuthToken), uploads).await;

    tracing::info!("listening on {}", opt.listen);
    axum::Server::bind(&opt.listen)
        .serve(app.into_make_service())
        .await
        .context("serving axum webserver")
}
