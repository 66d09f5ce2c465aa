use std::ops::{Deref, DerefMut};

use anyhow::Context;
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{self, request},
};
use infohub_api::{AuthToken, Role, UserId, Uuid, SESSION_COOKIE};

use crate::{db, uploads::UploadDir, Error};

#[derive(Clone, axum::extract::FromRef)]
pub struct AppState {
    pub db: PgPool,
    pub uploads: UploadDir,
    pub admin_token: Option<AuthToken>,
}

#[derive(Clone)]
pub struct PgPool(sqlx::PgPool);

impl PgPool {
    pub fn new(pool: sqlx::PgPool) -> PgPool {
        PgPool(pool)
    }

    pub async fn acquire(&self) -> Result<PgConn, Error> {
        Ok(PgConn(
            self.0.acquire().await.context("acquiring db connection")?,
        ))
    }

    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }
}

pub struct PgConn(sqlx::pool::PoolConnection<sqlx::Postgres>);

#[async_trait]
impl FromRequestParts<AppState> for PgConn {
    type Rejection = Error;

    async fn from_request_parts(
        _req: &mut request::Parts,
        state: &AppState,
    ) -> Result<PgConn, Error> {
        state.db.acquire().await
    }
}

impl Deref for PgConn {
    type Target = sqlx::PgConnection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PgConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Session token as presented by the client, not yet checked against the database
///
/// Taken from the `Authorization: Bearer` header if there is one, and from the
/// session cookie otherwise.
pub struct PreAuth(pub AuthToken);

fn parse_bearer(auth: &http::HeaderValue) -> Result<AuthToken, Error> {
    let auth = auth.to_str().map_err(|_| Error::permission_denied())?;
    let mut auth = auth.split(' ');
    if !auth
        .next()
        .ok_or(Error::permission_denied())?
        .eq_ignore_ascii_case("bearer")
    {
        return Err(Error::permission_denied());
    }
    let token = auth.next().ok_or(Error::permission_denied())?;
    if !auth.next().is_none() {
        return Err(Error::permission_denied());
    }
    let token = Uuid::try_from(token).map_err(|_| Error::permission_denied())?;
    Ok(AuthToken(token))
}

fn session_cookie(headers: &http::HeaderMap) -> Option<&str> {
    headers
        .get_all(http::header::COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|h| h.split(';'))
        .filter_map(|c| c.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim_matches('"'))
}

#[async_trait]
impl<S: Sync> FromRequestParts<S> for PreAuth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, _state: &S) -> Result<PreAuth, Error> {
        if let Some(auth) = req.headers.get(http::header::AUTHORIZATION) {
            return Ok(PreAuth(parse_bearer(auth)?));
        }
        let token = session_cookie(&req.headers).ok_or(Error::permission_denied())?;
        let token = Uuid::try_from(token).map_err(|_| Error::permission_denied())?;
        Ok(PreAuth(AuthToken(token)))
    }
}

pub struct Auth {
    pub user: UserId,
    pub role: Role,
}

impl Auth {
    /// Whether this user may modify things owned by `owner`
    pub fn can_edit(&self, owner: UserId) -> bool {
        self.user == owner || self.role == Role::Admin
    }
}

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = Error;

    async fn from_request_parts(req: &mut request::Parts, state: &AppState) -> Result<Auth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        let mut conn = PgConn::from_request_parts(req, state).await?;
        let (user, role) = db::recover_session(&mut *conn, token).await?;
        Ok(Auth { user, role })
    }
}

/// Either the configured admin token, or the session of a user with the admin role
pub struct AdminAuth;

#[async_trait]
impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = Error;

    async fn from_request_parts(
        req: &mut request::Parts,
        state: &AppState,
    ) -> Result<AdminAuth, Error> {
        let token = PreAuth::from_request_parts(req, state).await?.0;
        if Some(token) == state.admin_token {
            return Ok(AdminAuth);
        }
        let mut conn = PgConn::from_request_parts(req, state).await?;
        match db::recover_session(&mut *conn, token).await? {
            (_, Role::Admin) => Ok(AdminAuth),
            (_, Role::User) => Err(Error::permission_denied()),
        }
    }
}

#[cfg(test)]
mod tests {
    use infohub_api::Error as ApiError;

    use super::*;

    const TOKEN: &str = "67e55044-10b1-426f-9247-bb680e5fe0c8";

    async fn preauth(headers: &[(http::HeaderName, &str)]) -> Result<AuthToken, Error> {
        let mut req = http::Request::builder().method(http::Method::GET).uri("/");
        for (name, value) in headers {
            req = req.header(name, *value);
        }
        let mut req = req.body(()).expect("building request").into_parts().0;
        PreAuth::from_request_parts(&mut req, &()).await.map(|a| a.0)
    }

    fn denied(res: Result<AuthToken, Error>) -> bool {
        matches!(res, Err(Error::Api(ApiError::PermissionDenied)))
    }

    #[tokio::test]
    async fn bearer_token() {
        let token = AuthToken(Uuid::try_from(TOKEN).unwrap());
        let auth = format!("Bearer {TOKEN}");
        assert_eq!(
            preauth(&[(http::header::AUTHORIZATION, &auth)]).await.unwrap(),
            token
        );
        let auth = format!("bearer {TOKEN}");
        assert_eq!(
            preauth(&[(http::header::AUTHORIZATION, &auth)]).await.unwrap(),
            token
        );
        let auth = format!("Basic {TOKEN}");
        assert!(denied(preauth(&[(http::header::AUTHORIZATION, &auth)]).await));
        let auth = format!("Bearer {TOKEN} extra");
        assert!(denied(preauth(&[(http::header::AUTHORIZATION, &auth)]).await));
        assert!(denied(
            preauth(&[(http::header::AUTHORIZATION, "Bearer not-a-uuid")]).await
        ));
    }

    #[tokio::test]
    async fn session_cookie_token() {
        let token = AuthToken(Uuid::try_from(TOKEN).unwrap());
        let cookie = format!("theme=dark; {SESSION_COOKIE}={TOKEN}; lang=en");
        assert_eq!(
            preauth(&[(http::header::COOKIE, &cookie)]).await.unwrap(),
            token
        );
        let cookie = format!("{SESSION_COOKIE}=\"{TOKEN}\"");
        assert_eq!(
            preauth(&[(http::header::COOKIE, &cookie)]).await.unwrap(),
            token
        );
        assert!(denied(preauth(&[(http::header::COOKIE, "theme=dark")]).await));
        let cookie = format!("{SESSION_COOKIE}=garbage");
        assert!(denied(preauth(&[(http::header::COOKIE, &cookie)]).await));
        assert!(denied(preauth(&[]).await));
    }

    #[tokio::test]
    async fn header_takes_precedence_over_cookie() {
        let cookie = format!("{SESSION_COOKIE}={TOKEN}");
        assert!(denied(
            preauth(&[
                (http::header::AUTHORIZATION, "Bearer nope"),
                (http::header::COOKIE, &cookie),
            ])
            .await
        ));
    }

    #[test]
    fn owners_and_admins_can_edit() {
        let owner = UserId(Uuid::new_v4());
        let other = UserId(Uuid::new_v4());
        let user = |role| Auth { user: owner, role };
        assert!(user(Role::User).can_edit(owner));
        assert!(!user(Role::User).can_edit(other));
        assert!(user(Role::Admin).can_edit(other));
    }
}
