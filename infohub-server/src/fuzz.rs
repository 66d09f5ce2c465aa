#![cfg(test)]

use async_recursion::async_recursion;
use axum::{
    extract::FromRequestParts,
    http::{self, request},
    Router,
};
use infohub_api::{
    Attachment, AuthToken, ChangePassword, ChangeRole, ChangeTeam, CommentId, CommentNode,
    Error as ApiError, FeedPage, FeedQuery, FeedSort, LikeState, NewComment, NewPost, NewSession,
    NewUser, Post, PostId, PostType, PostView, Role, Team, User, UserId, UserProfile, Uuid,
    MAX_FILES_PER_POST, MAX_REPLY_DEPTH,
};
use infohub_mock_server::MockServer;
use std::{cmp, fmt::Debug, ops::RangeTo, panic::AssertUnwindSafe, path::Path};
use tower::{Service, ServiceExt};

use crate::{extractors::*, uploads::UploadDir, *};

macro_rules! do_tokio_test {
    ( $name:ident, $typ:ty, $fn:expr ) => {
        #[test]
        fn $name() {
            let runtime = AssertUnwindSafe(
                tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed initializing tokio runtime"),
            );
            bolero::check!()
                .with_type::<$typ>()
                .cloned()
                .for_each(move |v| {
                    let () = runtime.block_on($fn(v));
                })
        }
    };
}

fn build_pg_cluster(data: &Path) -> postgresfixture::cluster::Cluster {
    let mut runtime = None;
    let mut best_version = None;
    for r in postgresfixture::runtime::Runtime::find_on_path() {
        if let Ok(v) = r.version() {
            if best_version.as_ref().map(|b| *b < v).unwrap_or(true) {
                runtime = Some(r);
                best_version = Some(v);
            }
        }
    }
    postgresfixture::cluster::Cluster::new(
        data,
        runtime.expect("postgresql seems to not be installed in path"),
    )
}

macro_rules! do_sqlx_test {
    ( $name:ident, $gen:expr, $fn:expr ) => {
        #[test]
        #[ignore = "requires postgresql binaries on PATH"]
        fn $name() {
            if std::env::var("RUST_LOG").is_ok() {
                tracing_subscriber::fmt::init();
            }
            let lockfile = tempfile::tempfile().expect("creating tempfile");
            let datadir = tempfile::tempdir().expect("creating tempdir");
            let datadir_path: &Path = datadir.as_ref();
            let cluster = build_pg_cluster(datadir_path);
            let datadir_path: &str = datadir_path.to_str().expect("tempdir is not valid utf8");
            postgresfixture::coordinate::run_and_destroy(&cluster, lockfile.into(), || {
                cluster.createdb("test_db").expect("creating test_db database");
                let runtime = AssertUnwindSafe(
                    tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("failed initializing tokio runtime"),
                );
                let pool = AssertUnwindSafe(runtime.block_on(async move {
                    let pool = create_sqlx_pool(&format!("postgresql://?host={}&dbname=test_db", datadir_path)).await.expect("creating sqlx pool");
                    MIGRATOR
                        .run(&mut *pool.acquire().await.expect("getting migrator connection"))
                        .await
                        .expect("failed applying migrations");
                    pool
                }));
                bolero::check!()
                    .with_generator($gen)
                    .cloned()
                    .for_each(move |v| {
                        let pool = pool.clone();
                        let idle_before = pool.num_idle();
                        let v_str = format!("{v:?}");
                        let idle_after_res: Result<usize, _> = {
                            let pool = pool.clone();
                            std::panic::catch_unwind(AssertUnwindSafe(|| {
                                runtime.block_on(async move {
                                    let () = $fn(pool.clone(), v).await;
                                    let mut idle_after = pool.num_idle();
                                    let wait_release_since = std::time::Instant::now();
                                    while idle_after < idle_before
                                        && wait_release_since.elapsed()
                                            <= std::time::Duration::from_secs(1)
                                    {
                                        tokio::task::yield_now().await;
                                        idle_after = pool.num_idle();
                                    }
                                    idle_after
                                })
                            }))
                        };
                        runtime.block_on(async move {
                            let mut conn =
                                pool.acquire().await.expect("getting db cleanup connection");
                            sqlx::query(include_str!("../reset-test-db.sql"))
                                .execute(&mut *conn)
                                .await
                                .expect("failed cleaning up database");
                        });
                        match idle_after_res {
                            Err(e) => std::panic::resume_unwind(e),
                            Ok(idle_after) => assert!(
                                idle_after >= idle_before,
                                "test {} held onto pool after exiting test: before there were {idle_before} connections, and after there were {idle_after} with value {v_str}",
                                stringify!($name)
                            ),
                        }
                    });
            })
            .expect("coordinating spinup and shutdown of the pg cluster");
        }
    };
}

do_tokio_test!(fuzz_preauth_extractor, (String, String), |(auth, cookie)| async move {
    let req = http::Request::builder()
        .method(http::Method::GET)
        .uri("/")
        .header(http::header::AUTHORIZATION, auth)
        .header(http::header::COOKIE, cookie)
        .body(());
    if let Ok(req) = req {
        let mut req = req.into_parts().0;
        match PreAuth::from_request_parts(&mut req, &()).await {
            Ok(_) => (),
            Err(Error::Api(ApiError::PermissionDenied)) => (),
            Err(e) => panic!("got unexpected error: {e}"),
        }
    }
});

const NAMES: [&str; 5] = ["Ann Lee", "Bob Ray", "Chidi Okafor", "Ann Lee", "X"];
const WORDS: [&str; 8] = [
    "patch", "Firewall", "route53", "Onboarding", "VPN access", "budget", "", "   ",
];
const PASSWORD: &str = "correct horse battery";
const NEW_PASSWORDS: [&str; 4] = [PASSWORD, "tr0ub4dor&3 staple", "short", ""];

fn word(i: u8) -> String {
    String::from(WORDS[usize::from(i) % WORDS.len()])
}

fn team(i: u8) -> Team {
    Team::ALL[usize::from(i) % Team::ALL.len()]
}

fn post_type(i: u8) -> PostType {
    PostType::ALL[usize::from(i) % PostType::ALL.len()]
}

fn new_post(title: u8, content: u8, typ: u8, tag: u8) -> NewPost {
    NewPost {
        title: word(title),
        content: word(content),
        post_type: post_type(typ),
        tags: vec![word(tag), word(tag.wrapping_add(1))],
    }
}

#[derive(Clone, Debug, bolero::generator::TypeGenerator)]
enum FuzzOp {
    CreateUser {
        name: u8,
        email: u8,
        team: u8,
        admin: bool,
    },
    Signup {
        name: u8,
        email: u8,
        team: u8,
        admin: bool,
    },
    Auth {
        uid: usize,
        device: u8,
    },
    Unauth {
        sid: usize,
    },
    Whoami {
        sid: usize,
    },
    FetchUsers {
        sid: usize,
    },
    FetchProfile {
        sid: usize,
        name: u8,
    },
    ChangeTeam {
        sid: usize,
        team: u8,
    },
    ChangePassword {
        sid: usize,
        current: bool,
        new: u8,
        confirm: bool,
    },
    SetRole {
        uid: usize,
        admin: bool,
    },
    CreatePost {
        sid: usize,
        title: u8,
        content: u8,
        typ: u8,
        tag: u8,
    },
    EditPost {
        sid: usize,
        pid: usize,
        title: u8,
        content: u8,
        typ: u8,
        tag: u8,
    },
    DeletePost {
        sid: usize,
        pid: usize,
    },
    FetchPost {
        sid: usize,
        pid: usize,
    },
    FetchFeed {
        sid: usize,
        sort: u8,
        typ: Option<u8>,
        tag: Option<u8>,
        search: Option<u8>,
        page: u8,
    },
    Comment {
        sid: usize,
        pid: usize,
        parent: Option<usize>,
        content: u8,
    },
    DeleteComment {
        sid: usize,
        cid: usize,
    },
    LikePost {
        sid: usize,
        pid: usize,
    },
    LikeComment {
        sid: usize,
        cid: usize,
    },
}

async fn call<Req, Resp>(
    app: &mut Router,
    req: request::Request<axum::body::Body>,
    req_body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    app.ready().await.expect("waiting for app to be ready");
    let resp = app.call(req).await.expect("running request");
    let status = resp.status();
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .expect("recovering resp bytes");
    if status == http::StatusCode::OK {
        if std::any::TypeId::of::<Resp>() == std::any::TypeId::of::<()>() {
            // the server returns an empty body in this situation, which does not parse properly with serde_json
            return Ok(serde_json::from_slice(b"null").unwrap());
        }
        return Ok(serde_json::from_slice(&body).unwrap_or_else(|err| {
            panic!(
                r#"
                    Failed parsing resp body!

                    The error is the following:
                    ---
                    {err}
                    ---

                    Response body is:
                    ---
                    {body:?}
                    ---

                    Request was:
                    ---
                    {req_body:?}
                    ---
                "#
            )
        }));
    }
    Err(ApiError::parse(&body)
        .unwrap_or_else(|err| panic!("parsing error response body {err}, body is {body:?}")))
}

const BOUNDARY: &str = "infohub-test-boundary";

/// A `multipart/form-data` request carrying `data` as the single file field `field`
fn multipart_request(
    uri: &str,
    token: AuthToken,
    field: &str,
    file_name: &str,
    content_type: &str,
    data: &[u8],
) -> request::Request<axum::body::Body> {
    let mut body = format!(
        "--{BOUNDARY}\r\n\
         Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
         Content-Type: {content_type}\r\n\
         \r\n"
    )
    .into_bytes();
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    request::Builder::new()
        .method("POST")
        .uri(uri)
        .header(
            http::header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .header(http::header::AUTHORIZATION, format!("bearer {}", token.0))
        .body(axum::body::Body::from(body))
        .expect("building multipart request")
}

/// Names of the files that made it out of staging, sorted
fn stored_uploads(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .expect("listing upload dir")
        .map(|e| e.expect("reading upload dir entry"))
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

fn staging_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir.join(".staging"))
        .expect("listing staging dir")
        .next()
        .is_none()
}

fn stored_name(url: &str) -> String {
    String::from(url.strip_prefix("/uploads/").expect("upload url prefix"))
}

async fn run_on_app<Req, Resp>(
    app: &mut Router,
    method: &str,
    uri: &str,
    token: Option<Uuid>,
    body: &Req,
) -> Result<Resp, ApiError>
where
    Req: Debug + serde::Serialize,
    Resp: 'static + for<'de> serde::Deserialize<'de>,
{
    let req = request::Builder::new()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    let req = match token {
        Some(token) => req.header(http::header::AUTHORIZATION, format!("bearer {token}")),
        None => req,
    };
    let req = req
        .body(axum::body::Body::from(
            serde_json::to_vec(body).expect("serializing request body to json"),
        ))
        .expect("building request");
    call(app, req, body).await
}

/// Ids are generated independently by the app and the mock, so they are
/// blanked out of errors before comparing
fn without_ids(e: ApiError) -> ApiError {
    match e {
        ApiError::Unknown(msg) => panic!("app or mock hit an internal error: {msg}"),
        ApiError::PostNotFound(_) => ApiError::PostNotFound(Uuid::nil()),
        ApiError::CommentNotFound(_) => ApiError::CommentNotFound(Uuid::nil()),
        e => e,
    }
}

fn compare<T>(name: &str, app_res: Result<T, ApiError>, mock_res: Result<T, ApiError>)
where
    T: Debug + PartialEq,
{
    assert_eq!(
        app_res.map_err(without_ids),
        mock_res.map_err(without_ids),
        "app and mock did not return the same result for {name}"
    );
}

fn resize_int(fuzz_id: usize, RangeTo { end }: RangeTo<usize>) -> Option<usize> {
    if end == 0 {
        return None;
    }
    let bucket_size = cmp::max(1, usize::MAX / end); // in case we rounded to 0
    let id = fuzz_id / bucket_size;
    Some(cmp::min(id, end - 1)) // in case id was actually over end - 1 due to rounding
}

/// Everything about a user that does not depend on who generated the ids
#[derive(Debug, PartialEq)]
struct UserSummary {
    email: String,
    full_name: String,
    role: Role,
    team: Team,
    has_photo: bool,
}

impl From<User> for UserSummary {
    fn from(u: User) -> UserSummary {
        UserSummary {
            email: u.email,
            full_name: u.full_name,
            role: u.role,
            team: u.team,
            has_photo: u.photo_id_url.is_some(),
        }
    }
}

#[derive(Debug, PartialEq)]
struct PostSummary {
    author_name: String,
    author_team: Team,
    title: String,
    content: String,
    post_type: PostType,
    tags: Vec<String>,
    views: i64,
    likes_count: i64,
    comments_count: i64,
    has_liked: bool,
}

impl From<Post> for PostSummary {
    fn from(p: Post) -> PostSummary {
        PostSummary {
            author_name: p.author_name,
            author_team: p.author_team,
            title: p.title,
            content: p.content,
            post_type: p.post_type,
            tags: p.tags,
            views: p.views,
            likes_count: p.likes_count,
            comments_count: p.comments_count,
            has_liked: p.has_liked,
        }
    }
}

/// Comments flattened in display order along with their depth
fn comment_summary(threads: &[CommentNode]) -> Vec<(usize, String, String, i64, bool)> {
    threads
        .iter()
        .flat_map(|t| t.walk())
        .map(|(depth, n)| {
            let c = &n.comment;
            (
                depth,
                c.author_name.clone(),
                c.content.clone(),
                c.likes_count,
                c.has_liked,
            )
        })
        .collect()
}

fn view_summary(v: PostView) -> (PostSummary, Vec<(usize, String, String, i64, bool)>) {
    let comments = comment_summary(&v.comments);
    (PostSummary::from(v.post), comments)
}

fn feed_summary(f: FeedPage) -> (Vec<PostSummary>, u32, u32) {
    (
        f.posts.into_iter().map(PostSummary::from).collect(),
        f.page,
        f.total_pages,
    )
}

fn profile_summary(p: UserProfile) -> (UserSummary, Vec<(String, i64, i64)>, i64, i64) {
    (
        UserSummary::from(p.user),
        p.posts
            .into_iter()
            .map(|p| (p.title, p.views, p.likes_count))
            .collect(),
        p.stats.total_views,
        p.stats.post_count,
    )
}

struct Pair<T> {
    app: T,
    mock: T,
}

struct ComparativeFuzzer {
    admin_token: Uuid,
    app: Router,
    mock: MockServer,
    uploads: tempfile::TempDir,
    users: Vec<Pair<UserId>>,
    sessions: Vec<Pair<AuthToken>>,
    posts: Vec<Pair<PostId>>,
    comments: Vec<Pair<CommentId>>,
}

impl ComparativeFuzzer {
    async fn new(pool: PgPool) -> ComparativeFuzzer {
        let admin_token = Uuid::new_v4();
        let uploads = tempfile::tempdir().expect("creating upload tempdir");
        let upload_dir = UploadDir::new(uploads.path().to_path_buf())
            .await
            .expect("creating upload dir");
        let app = app(pool, Some(AuthToken(admin_token)), upload_dir).await;
        ComparativeFuzzer {
            admin_token,
            app,
            mock: MockServer::new(),
            uploads,
            users: Vec::new(),
            sessions: Vec::new(),
            posts: Vec::new(),
            comments: Vec::new(),
        }
    }

    /// Index of a session to act with, logging a user in first if there is none
    async fn session(&mut self, sid: usize) -> usize {
        if self.sessions.is_empty() {
            self.execute_fuzz_op(FuzzOp::Auth { uid: 0, device: 0 }).await;
        }
        resize_int(sid, ..self.sessions.len()).expect("logging in always succeeds")
    }

    /// Password the mock currently holds for the user behind session `s`
    fn session_password(&self, s: usize) -> String {
        let email = match self.mock.whoami(self.sessions[s].mock) {
            Ok(u) => u.email,
            Err(_) => return String::from(PASSWORD),
        };
        (0..self.mock.test_num_users())
            .map(|u| self.mock.test_get_user_info(u))
            .find(|(e, _)| *e == email)
            .map(|(_, p)| String::from(p))
            .unwrap_or_else(|| String::from(PASSWORD))
    }

    /// Has a freshly logged in user create a post, returning their token and the post
    async fn authored_post(&mut self) -> (AuthToken, PostId) {
        self.execute_fuzz_op(FuzzOp::CreatePost {
            sid: 0,
            title: 0,
            content: 0,
            typ: 0,
            tag: 0,
        })
        .await;
        (self.sessions[0].app, self.posts[0].app)
    }

    #[async_recursion]
    async fn execute_fuzz_op(&mut self, op: FuzzOp) {
        match op {
            FuzzOp::CreateUser {
                name,
                email,
                team: t,
                admin,
            } => {
                let mut new_user = NewUser::new(
                    String::from(NAMES[usize::from(name) % NAMES.len()]),
                    format!("user{}@corp.example", email % 8),
                    String::from(PASSWORD),
                    team(t),
                );
                if admin {
                    new_user.role = Role::Admin;
                }
                let app_res = run_on_app(
                    &mut self.app,
                    "POST",
                    "/api/admin/create-user",
                    Some(self.admin_token),
                    &new_user,
                )
                .await;
                let mock_res = self.mock.admin_create_user(new_user);
                if let (&Ok(app), &Ok(mock)) = (&app_res, &mock_res) {
                    self.users.push(Pair { app, mock });
                }
                compare("CreateUser", app_res.map(|_| ()), mock_res.map(|_| ()));
            }
            FuzzOp::Signup {
                name,
                email,
                team: t,
                admin,
            } => {
                let mut new_user = NewUser::new(
                    String::from(NAMES[usize::from(name) % NAMES.len()]),
                    format!("user{}@corp.example", email % 8),
                    String::from(PASSWORD),
                    team(t),
                );
                if admin {
                    // must be ignored on this route
                    new_user.role = Role::Admin;
                }
                let app_res =
                    run_on_app(&mut self.app, "POST", "/api/signup", None, &new_user).await;
                let mock_res = self.mock.signup(new_user);
                if let (&Ok(app), &Ok(mock)) = (&app_res, &mock_res) {
                    self.users.push(Pair { app, mock });
                }
                compare("Signup", app_res.map(|_| ()), mock_res.map(|_| ()));
            }
            FuzzOp::Auth { uid, device } => {
                if let Some(uid) = resize_int(uid, ..self.mock.test_num_users()) {
                    let (email, password) = self.mock.test_get_user_info(uid);
                    let session = NewSession {
                        email: String::from(email),
                        password: String::from(password),
                        device: word(device),
                    };
                    let app_tok =
                        run_on_app(&mut self.app, "POST", "/api/auth", None, &session).await;
                    let mock_tok = self.mock.auth(session);
                    if let (&Ok(app), &Ok(mock)) = (&app_tok, &mock_tok) {
                        self.sessions.push(Pair { app, mock });
                    }
                    compare("Auth", app_tok.map(|_| ()), mock_tok.map(|_| ()));
                } else {
                    self.execute_fuzz_op(FuzzOp::CreateUser {
                        name: 0,
                        email: 0,
                        team: 0,
                        admin: false,
                    })
                    .await;
                    self.execute_fuzz_op(FuzzOp::Auth { uid, device }).await;
                }
            }
            FuzzOp::Unauth { sid } => {
                let s = self.session(sid).await;
                let app_res = run_on_app(
                    &mut self.app,
                    "POST",
                    "/api/unauth",
                    Some(self.sessions[s].app.0),
                    &(),
                )
                .await;
                let mock_res = self.mock.unauth(self.sessions[s].mock);
                compare::<()>("Unauth", app_res, mock_res);
            }
            FuzzOp::Whoami { sid } => {
                let s = self.session(sid).await;
                let app_res: Result<User, _> = run_on_app(
                    &mut self.app,
                    "GET",
                    "/api/whoami",
                    Some(self.sessions[s].app.0),
                    &(),
                )
                .await;
                let mock_res = self.mock.whoami(self.sessions[s].mock);
                compare(
                    "Whoami",
                    app_res.map(UserSummary::from),
                    mock_res.map(UserSummary::from),
                );
            }
            FuzzOp::FetchUsers { sid } => {
                let s = self.session(sid).await;
                let app_res: Result<Vec<User>, _> = run_on_app(
                    &mut self.app,
                    "GET",
                    "/api/users",
                    Some(self.sessions[s].app.0),
                    &(),
                )
                .await;
                let mock_res = self.mock.fetch_users(self.sessions[s].mock);
                let summary =
                    |r: Vec<User>| r.into_iter().map(UserSummary::from).collect::<Vec<_>>();
                compare("FetchUsers", app_res.map(summary), mock_res.map(summary));
            }
            FuzzOp::FetchProfile { sid, name } => {
                let s = self.session(sid).await;
                let name = NAMES[usize::from(name) % NAMES.len()];
                let app_res: Result<UserProfile, _> = run_on_app(
                    &mut self.app,
                    "GET",
                    &format!("/api/users/by-name/{}", name.replace(' ', "%20")),
                    Some(self.sessions[s].app.0),
                    &(),
                )
                .await;
                let mock_res = self.mock.fetch_user_profile(self.sessions[s].mock, name);
                compare(
                    "FetchProfile",
                    app_res.map(profile_summary),
                    mock_res.map(profile_summary),
                );
            }
            FuzzOp::ChangeTeam { sid, team: t } => {
                let s = self.session(sid).await;
                let app_res = run_on_app(
                    &mut self.app,
                    "POST",
                    "/api/me/team",
                    Some(self.sessions[s].app.0),
                    &ChangeTeam { team: team(t) },
                )
                .await;
                let mock_res = self.mock.change_team(self.sessions[s].mock, team(t));
                compare::<()>("ChangeTeam", app_res, mock_res);
            }
            FuzzOp::ChangePassword {
                sid,
                current,
                new,
                confirm,
            } => {
                let s = self.session(sid).await;
                let current_password = match current {
                    true => self.session_password(s),
                    false => String::from("not the password"),
                };
                let new_password =
                    String::from(NEW_PASSWORDS[usize::from(new) % NEW_PASSWORDS.len()]);
                let data = ChangePassword {
                    current_password,
                    confirm_password: match confirm {
                        true => new_password.clone(),
                        false => format!("{new_password}!"),
                    },
                    new_password,
                };
                let app_res = run_on_app(
                    &mut self.app,
                    "POST",
                    "/api/me/password",
                    Some(self.sessions[s].app.0),
                    &data,
                )
                .await;
                let mock_res = self.mock.change_password(self.sessions[s].mock, data);
                compare::<()>("ChangePassword", app_res, mock_res);
            }
            FuzzOp::SetRole { uid, admin } => {
                if let Some(uid) = resize_int(uid, ..self.users.len()) {
                    let role = match admin {
                        true => Role::Admin,
                        false => Role::User,
                    };
                    let app_res = run_on_app(
                        &mut self.app,
                        "POST",
                        &format!("/api/admin/users/{}/role", self.users[uid].app.0),
                        Some(self.admin_token),
                        &ChangeRole { role },
                    )
                    .await;
                    let mock_res = self.mock.set_role(self.users[uid].mock, role);
                    compare::<()>("SetRole", app_res, mock_res);
                }
            }
            FuzzOp::CreatePost {
                sid,
                title,
                content,
                typ,
                tag,
            } => {
                let s = self.session(sid).await;
                let post = new_post(title, content, typ, tag);
                let app_res = run_on_app(
                    &mut self.app,
                    "POST",
                    "/api/posts",
                    Some(self.sessions[s].app.0),
                    &post,
                )
                .await;
                let mock_res = self.mock.create_post(self.sessions[s].mock, post);
                if let (&Ok(app), &Ok(mock)) = (&app_res, &mock_res) {
                    self.posts.push(Pair { app, mock });
                }
                compare("CreatePost", app_res.map(|_| ()), mock_res.map(|_| ()));
            }
            FuzzOp::EditPost {
                sid,
                pid,
                title,
                content,
                typ,
                tag,
            } => {
                let s = self.session(sid).await;
                if let Some(p) = resize_int(pid, ..self.posts.len()) {
                    let post = new_post(title, content, typ, tag);
                    let app_res = run_on_app(
                        &mut self.app,
                        "PUT",
                        &format!("/api/posts/{}", self.posts[p].app.0),
                        Some(self.sessions[s].app.0),
                        &post,
                    )
                    .await;
                    let mock_res =
                        self.mock
                            .edit_post(self.sessions[s].mock, self.posts[p].mock, post);
                    compare::<()>("EditPost", app_res, mock_res);
                }
            }
            FuzzOp::DeletePost { sid, pid } => {
                let s = self.session(sid).await;
                if let Some(p) = resize_int(pid, ..self.posts.len()) {
                    let app_res = run_on_app(
                        &mut self.app,
                        "DELETE",
                        &format!("/api/posts/{}", self.posts[p].app.0),
                        Some(self.sessions[s].app.0),
                        &(),
                    )
                    .await;
                    let mock_res = self
                        .mock
                        .delete_post(self.sessions[s].mock, self.posts[p].mock);
                    compare::<()>("DeletePost", app_res, mock_res);
                }
            }
            FuzzOp::FetchPost { sid, pid } => {
                let s = self.session(sid).await;
                if let Some(p) = resize_int(pid, ..self.posts.len()) {
                    let app_res: Result<PostView, _> = run_on_app(
                        &mut self.app,
                        "GET",
                        &format!("/api/posts/{}", self.posts[p].app.0),
                        Some(self.sessions[s].app.0),
                        &(),
                    )
                    .await;
                    let mock_res = self
                        .mock
                        .fetch_post(self.sessions[s].mock, self.posts[p].mock);
                    compare(
                        "FetchPost",
                        app_res.map(view_summary),
                        mock_res.map(view_summary),
                    );
                }
            }
            FuzzOp::FetchFeed {
                sid,
                sort,
                typ,
                tag,
                search,
                page,
            } => {
                let s = self.session(sid).await;
                let q = FeedQuery {
                    post_type: typ.map(post_type),
                    tag: tag.map(word),
                    search: search.map(word),
                    author: None,
                    sort: [FeedSort::Recent, FeedSort::Liked, FeedSort::Views]
                        [usize::from(sort) % 3],
                    page: u32::from(page % 4),
                };
                let app_res: Result<FeedPage, _> = run_on_app(
                    &mut self.app,
                    "POST",
                    "/api/feed",
                    Some(self.sessions[s].app.0),
                    &q,
                )
                .await;
                let mock_res = self.mock.fetch_feed(self.sessions[s].mock, q);
                compare(
                    "FetchFeed",
                    app_res.map(feed_summary),
                    mock_res.map(feed_summary),
                );
            }
            FuzzOp::Comment {
                sid,
                pid,
                parent,
                content,
            } => {
                let s = self.session(sid).await;
                let parent = parent.and_then(|c| resize_int(c, ..self.comments.len()));
                if let Some(p) = resize_int(pid, ..self.posts.len()) {
                    let comment = |parent_id| NewComment {
                        content: word(content),
                        parent_id,
                    };
                    let app_res = run_on_app(
                        &mut self.app,
                        "POST",
                        &format!("/api/posts/{}/comments", self.posts[p].app.0),
                        Some(self.sessions[s].app.0),
                        &comment(parent.map(|c| self.comments[c].app)),
                    )
                    .await;
                    let mock_res = self.mock.create_comment(
                        self.sessions[s].mock,
                        self.posts[p].mock,
                        comment(parent.map(|c| self.comments[c].mock)),
                    );
                    if let (&Ok(app), &Ok(mock)) = (&app_res, &mock_res) {
                        self.comments.push(Pair { app, mock });
                    }
                    compare("Comment", app_res.map(|_| ()), mock_res.map(|_| ()));
                }
            }
            FuzzOp::DeleteComment { sid, cid } => {
                let s = self.session(sid).await;
                if let Some(c) = resize_int(cid, ..self.comments.len()) {
                    let app_res = run_on_app(
                        &mut self.app,
                        "DELETE",
                        &format!("/api/comments/{}", self.comments[c].app.0),
                        Some(self.sessions[s].app.0),
                        &(),
                    )
                    .await;
                    let mock_res = self
                        .mock
                        .delete_comment(self.sessions[s].mock, self.comments[c].mock);
                    compare::<()>("DeleteComment", app_res, mock_res);
                }
            }
            FuzzOp::LikePost { sid, pid } => {
                let s = self.session(sid).await;
                if let Some(p) = resize_int(pid, ..self.posts.len()) {
                    let app_res: Result<LikeState, _> = run_on_app(
                        &mut self.app,
                        "POST",
                        &format!("/api/posts/{}/like", self.posts[p].app.0),
                        Some(self.sessions[s].app.0),
                        &(),
                    )
                    .await;
                    let mock_res = self
                        .mock
                        .like_post(self.sessions[s].mock, self.posts[p].mock);
                    compare("LikePost", app_res, mock_res);
                }
            }
            FuzzOp::LikeComment { sid, cid } => {
                let s = self.session(sid).await;
                if let Some(c) = resize_int(cid, ..self.comments.len()) {
                    let app_res: Result<LikeState, _> = run_on_app(
                        &mut self.app,
                        "POST",
                        &format!("/api/comments/{}/like", self.comments[c].app.0),
                        Some(self.sessions[s].app.0),
                        &(),
                    )
                    .await;
                    let mock_res = self
                        .mock
                        .like_comment(self.sessions[s].mock, self.comments[c].mock);
                    compare("LikeComment", app_res, mock_res);
                }
            }
        }
    }
}

do_sqlx_test!(
    compare_with_mock,
    bolero::generator::gen_with::<Vec<FuzzOp>>().len(1..100usize),
    |pool, test: Vec<FuzzOp>| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        for op in test {
            fuzzer.execute_fuzz_op(op).await;
        }
    }
);

do_sqlx_test!(
    replies_stop_at_max_depth,
    bolero::generator::gen::<bool>(),
    |pool, delete_root: bool| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        fuzzer.authored_post().await;
        let reply = |parent| FuzzOp::Comment {
            sid: 0,
            pid: 0,
            parent,
            content: 0,
        };
        fuzzer.execute_fuzz_op(reply(None)).await;
        // the last attempt goes one level past the cap
        for _ in 0..=MAX_REPLY_DEPTH {
            fuzzer.execute_fuzz_op(reply(Some(usize::MAX))).await;
        }
        assert_eq!(fuzzer.comments.len(), MAX_REPLY_DEPTH + 1);
        if delete_root {
            fuzzer
                .execute_fuzz_op(FuzzOp::DeleteComment { sid: 0, cid: 0 })
                .await;
            fuzzer.execute_fuzz_op(reply(Some(usize::MAX))).await;
            assert_eq!(fuzzer.comments.len(), MAX_REPLY_DEPTH + 2);
        }
        fuzzer
            .execute_fuzz_op(FuzzOp::FetchPost { sid: 0, pid: 0 })
            .await;
    }
);

do_sqlx_test!(
    attachments_stop_at_limit,
    bolero::generator::gen::<u8>(),
    |pool, uploads: u8| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        let (tok, post) = fuzzer.authored_post().await;
        let uri = format!("/api/posts/{}/attachments", post.0);
        let mut stored = Vec::new();
        for i in 0..=usize::from(uploads % 6) {
            let name = format!("runbook-{i}.PDF");
            let req =
                multipart_request(&uri, tok, "file", &name, "application/pdf", name.as_bytes());
            let res: Result<Attachment, _> = call(&mut fuzzer.app, req, &name).await;
            match res {
                Ok(a) if i < MAX_FILES_PER_POST => {
                    assert_eq!(a.file_name, name);
                    assert_eq!(a.file_size, Some(name.len() as i64));
                    assert!(a.file_url.ends_with(".pdf"));
                    stored.push(stored_name(&a.file_url));
                }
                Err(ApiError::AttachmentLimitReached(n)) if i >= MAX_FILES_PER_POST => {
                    assert_eq!(n, MAX_FILES_PER_POST)
                }
                r => panic!("unexpected result for upload {i}: {r:?}"),
            }
        }
        stored.sort();
        assert_eq!(stored_uploads(fuzzer.uploads.path()), stored);
        assert!(staging_is_empty(fuzzer.uploads.path()));
        let view: PostView = run_on_app(
            &mut fuzzer.app,
            "GET",
            &format!("/api/posts/{}", post.0),
            Some(tok.0),
            &(),
        )
        .await
        .expect("fetching post");
        assert_eq!(view.attachments.len(), stored.len());
    }
);

do_sqlx_test!(
    failed_attachment_insert_removes_file,
    bolero::generator::gen::<bool>(),
    |pool: PgPool, ok_first: bool| async move {
        let constraint = |sql: &'static str| {
            let pool = pool.clone();
            async move {
                let mut conn = pool.acquire().await.expect("getting connection");
                sqlx::query(sql)
                    .execute(&mut *conn)
                    .await
                    .expect("altering attachments table");
            }
        };
        constraint("ALTER TABLE attachments DROP CONSTRAINT IF EXISTS attachments_no_csv").await;
        constraint(
            "ALTER TABLE attachments ADD CONSTRAINT attachments_no_csv CHECK (file_name NOT LIKE '%.csv')",
        )
        .await;

        let mut fuzzer = ComparativeFuzzer::new(pool.clone()).await;
        let (tok, post) = fuzzer.authored_post().await;
        let uri = format!("/api/posts/{}/attachments", post.0);
        let names = match ok_first {
            true => ["notes.txt", "costs.csv"],
            false => ["costs.csv", "notes.txt"],
        };
        let mut stored = Vec::new();
        for name in names {
            let req = multipart_request(&uri, tok, "file", name, "text/csv", b"a,b\n1,2\n");
            let res: Result<Attachment, _> = call(&mut fuzzer.app, req, &name).await;
            match (name, res) {
                ("notes.txt", Ok(a)) => stored.push(stored_name(&a.file_url)),
                ("costs.csv", Err(ApiError::Unknown(_))) => (),
                (name, r) => panic!("unexpected result for {name}: {r:?}"),
            }
        }
        assert_eq!(stored_uploads(fuzzer.uploads.path()), stored);
        assert!(staging_is_empty(fuzzer.uploads.path()));

        constraint("ALTER TABLE attachments DROP CONSTRAINT attachments_no_csv").await;
    }
);

do_sqlx_test!(
    new_photo_replaces_previous,
    bolero::generator::gen::<u8>(),
    |pool, photos: u8| async move {
        let mut fuzzer = ComparativeFuzzer::new(pool).await;
        let s = fuzzer.session(0).await;
        let tok = fuzzer.sessions[s].app;
        let mut previous: Option<String> = None;
        for i in 0..=(photos % 4) {
            let req =
                multipart_request("/api/me/photo", tok, "photo", "me", "image/png", &[i; 16]);
            let url: String = call(&mut fuzzer.app, req, &i).await.expect("uploading photo");
            assert!(url.ends_with(".png"));
            assert_ne!(previous.as_ref(), Some(&url));
            assert_eq!(stored_uploads(fuzzer.uploads.path()), vec![stored_name(&url)]);
            let me: User = run_on_app(&mut fuzzer.app, "GET", "/api/whoami", Some(tok.0), &())
                .await
                .expect("fetching current user");
            assert_eq!(me.photo_id_url.as_deref(), Some(url.as_str()));
            previous = Some(url);
        }
        assert!(staging_is_empty(fuzzer.uploads.path()));
    }
);
