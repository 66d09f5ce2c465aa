use std::collections::{HashMap, HashSet};

use chrono::{Duration, SubsecRound, Utc};
use infohub_api::{
    build_comment_tree, check_reply_depth, AuthToken, ChangePassword, CommentId, CommentRecord,
    Error, FeedPage, FeedQuery, LikeState, NewComment, NewPost, NewSession, NewUser, Post, PostId,
    PostType, PostView, Role, Team, Time, User, UserId, UserPost, UserProfile, UserStats, Uuid,
    MAX_REPLY_DEPTH,
};

/// In-memory model of the server, used as the reference the real server is
/// fuzzed against
///
/// Passwords are kept in plain text, tests do not actually use bcrypt.
pub struct MockServer {
    users: Vec<DbUser>,
    sessions: HashMap<AuthToken, Session>,
    posts: Vec<DbPost>,
    comments: Vec<DbComment>,
    post_likes: HashSet<(UserId, PostId)>,
    comment_likes: HashSet<(UserId, CommentId)>,
    clock: Time,
}

#[derive(Debug)]
struct DbUser {
    user: User,
    pass: String,
}

#[derive(Debug)]
struct Session {
    user: UserId,
    #[allow(dead_code)] // mirrors the sessions table
    device: String,
}

#[derive(Debug)]
struct DbPost {
    id: PostId,
    author: UserId,
    title: String,
    content: String,
    post_type: PostType,
    tags: Vec<String>,
    views: i64,
    created_at: Time,
}

#[derive(Debug)]
struct DbComment {
    id: CommentId,
    post: PostId,
    parent: Option<CommentId>,
    author: UserId,
    content: String,
    created_at: Time,
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        MockServer {
            users: Vec::new(),
            sessions: HashMap::new(),
            posts: Vec::new(),
            comments: Vec::new(),
            post_likes: HashSet::new(),
            comment_likes: HashSet::new(),
            clock: Time::MIN_UTC,
        }
    }

    /// Return email & pass for user number `id`
    pub fn test_get_user_info(&self, id: usize) -> (&str, &str) {
        let u = self
            .users
            .get(id)
            .unwrap_or_else(|| panic!("getting user {id} among {}", self.users.len()));
        (&u.user.email, &u.pass)
    }

    /// Return the current number of users
    pub fn test_num_users(&self) -> usize {
        self.users.len()
    }

    /// Return the post and id of comment number `id`, oldest first
    pub fn test_get_comment(&self, id: usize) -> (PostId, CommentId) {
        let c = &self.comments[id];
        (c.post, c.id)
    }

    /// Strictly increasing, with the same microsecond precision as the database
    fn now(&mut self) -> Time {
        let now = Utc::now().trunc_subsecs(6);
        self.clock = std::cmp::max(now, self.clock + Duration::microseconds(1));
        self.clock
    }

    fn create_user(&mut self, u: NewUser, role: Role) -> Result<UserId, Error> {
        u.validate()?;
        if self.users.iter().any(|db| db.user.email == u.email) {
            return Err(Error::EmailAlreadyUsed(u.email));
        }
        let id = UserId(Uuid::new_v4());
        let created_at = self.now();
        self.users.push(DbUser {
            user: User {
                id,
                email: u.email,
                full_name: String::from(u.full_name.trim()),
                photo_id_url: None,
                role,
                team: u.team,
                created_at,
            },
            pass: u.password,
        });
        Ok(id)
    }

    pub fn signup(&mut self, u: NewUser) -> Result<UserId, Error> {
        self.create_user(u, Role::User)
    }

    pub fn admin_create_user(&mut self, u: NewUser) -> Result<UserId, Error> {
        let role = u.role;
        self.create_user(u, role)
    }

    pub fn auth(&mut self, s: NewSession) -> Result<AuthToken, Error> {
        s.validate()?;
        let user = self
            .users
            .iter()
            .find(|u| u.user.email == s.email)
            .ok_or(Error::PermissionDenied)?;
        if user.pass != s.password {
            return Err(Error::PermissionDenied);
        }
        let tok = AuthToken(Uuid::new_v4());
        let session = Session {
            user: user.user.id,
            device: s.device,
        };
        self.sessions.insert(tok, session);
        Ok(tok)
    }

    fn resolve(&self, tok: AuthToken) -> Result<&User, Error> {
        let session = self.sessions.get(&tok).ok_or(Error::PermissionDenied)?;
        self.user(session.user).ok_or(Error::PermissionDenied)
    }

    fn user(&self, id: UserId) -> Option<&User> {
        self.users.iter().map(|u| &u.user).find(|u| u.id == id)
    }

    fn user_mut(&mut self, id: UserId) -> Option<&mut DbUser> {
        self.users.iter_mut().find(|u| u.user.id == id)
    }

    fn can_edit(&self, tok: AuthToken, owner: UserId) -> Result<(), Error> {
        let u = self.resolve(tok)?;
        match u.id == owner || u.role == Role::Admin {
            true => Ok(()),
            false => Err(Error::PermissionDenied),
        }
    }

    pub fn unauth(&mut self, tok: AuthToken) -> Result<(), Error> {
        self.sessions
            .remove(&tok)
            .map(|_| ())
            .ok_or(Error::PermissionDenied)
    }

    pub fn whoami(&self, tok: AuthToken) -> Result<User, Error> {
        self.resolve(tok).cloned()
    }

    pub fn fetch_users(&self, tok: AuthToken) -> Result<Vec<User>, Error> {
        self.resolve(tok)?;
        Ok(self.users.iter().map(|u| u.user.clone()).collect())
    }

    pub fn fetch_user_profile(&self, tok: AuthToken, name: &str) -> Result<UserProfile, Error> {
        self.resolve(tok)?;
        let user = self
            .users
            .iter()
            .map(|u| &u.user)
            .find(|u| u.full_name == name)
            .ok_or_else(|| Error::UserNotFound(String::from(name)))?;
        let posts: Vec<UserPost> = self
            .posts
            .iter()
            .rev()
            .filter(|p| p.author == user.id)
            .map(|p| UserPost {
                id: p.id,
                title: p.title.clone(),
                post_type: p.post_type,
                tags: p.tags.clone(),
                views: p.views,
                likes_count: self.post_likes_count(p.id),
                created_at: p.created_at,
            })
            .collect();
        Ok(UserProfile {
            user: user.clone(),
            stats: UserStats::of(&posts),
            posts,
        })
    }

    pub fn change_team(&mut self, tok: AuthToken, team: Team) -> Result<(), Error> {
        let id = self.resolve(tok)?.id;
        if let Some(u) = self.user_mut(id) {
            u.user.team = team;
        }
        Ok(())
    }

    pub fn change_password(&mut self, tok: AuthToken, data: ChangePassword) -> Result<(), Error> {
        let id = self.resolve(tok)?.id;
        data.validate()?;
        let u = self.user_mut(id).ok_or(Error::PermissionDenied)?;
        if u.pass != data.current_password {
            return Err(Error::field("currentPassword", "Incorrect current password."));
        }
        u.pass = data.new_password;
        Ok(())
    }

    /// Admin-only, the caller is assumed to hold the admin token
    pub fn set_role(&mut self, user: UserId, role: Role) -> Result<(), Error> {
        let u = self
            .user_mut(user)
            .ok_or_else(|| Error::UserNotFound(user.0.to_string()))?;
        u.user.role = role;
        Ok(())
    }

    pub fn create_post(&mut self, tok: AuthToken, p: NewPost) -> Result<PostId, Error> {
        let author = self.resolve(tok)?.id;
        p.validate()?;
        let id = PostId(Uuid::new_v4());
        let created_at = self.now();
        self.posts.push(DbPost {
            id,
            author,
            tags: p.normalized_tags(),
            title: p.title,
            content: p.content,
            post_type: p.post_type,
            views: 0,
            created_at,
        });
        Ok(id)
    }

    fn post_idx(&self, id: PostId) -> Result<usize, Error> {
        self.posts
            .iter()
            .position(|p| p.id == id)
            .ok_or(Error::PostNotFound(id.0))
    }

    fn post_likes_count(&self, post: PostId) -> i64 {
        self.post_likes.iter().filter(|(_, p)| *p == post).count() as i64
    }

    fn comment_likes_count(&self, comment: CommentId) -> i64 {
        self.comment_likes
            .iter()
            .filter(|(_, c)| *c == comment)
            .count() as i64
    }

    fn post_view(&self, viewer: UserId, p: &DbPost) -> Post {
        let author = self.user(p.author).expect("posts always have an author");
        Post {
            id: p.id,
            author_id: p.author,
            author_name: author.full_name.clone(),
            author_team: author.team,
            title: p.title.clone(),
            content: p.content.clone(),
            post_type: p.post_type,
            tags: p.tags.clone(),
            views: p.views,
            likes_count: self.post_likes_count(p.id),
            comments_count: self.comments.iter().filter(|c| c.post == p.id).count() as i64,
            has_liked: self.post_likes.contains(&(viewer, p.id)),
            created_at: p.created_at,
        }
    }

    pub fn fetch_post(&mut self, tok: AuthToken, id: PostId) -> Result<PostView, Error> {
        let viewer = self.resolve(tok)?.id;
        let idx = self.post_idx(id)?;
        self.posts[idx].views += 1;
        let mut comments: Vec<&DbComment> = self.comments.iter().filter(|c| c.post == id).collect();
        comments.sort_by_key(|c| (c.created_at, c.id));
        let tree = build_comment_tree(comments.into_iter().map(|c| CommentRecord {
            id: c.id,
            parent_id: c.parent,
            author_id: c.author,
            author_name: self
                .user(c.author)
                .map(|u| u.full_name.clone())
                .unwrap_or_default(),
            content: c.content.clone(),
            created_at: c.created_at,
            likes_count: self.comment_likes_count(c.id),
            has_liked: self.comment_likes.contains(&(viewer, c.id)),
        }));
        Ok(PostView {
            post: self.post_view(viewer, &self.posts[idx]),
            attachments: Vec::new(),
            comments: tree.roots,
        })
    }

    pub fn edit_post(&mut self, tok: AuthToken, id: PostId, p: NewPost) -> Result<(), Error> {
        self.resolve(tok)?;
        p.validate()?;
        let idx = self.post_idx(id)?;
        self.can_edit(tok, self.posts[idx].author)?;
        let post = &mut self.posts[idx];
        post.tags = p.normalized_tags();
        post.title = p.title;
        post.content = p.content;
        post.post_type = p.post_type;
        Ok(())
    }

    pub fn delete_post(&mut self, tok: AuthToken, id: PostId) -> Result<(), Error> {
        self.resolve(tok)?;
        let idx = self.post_idx(id)?;
        self.can_edit(tok, self.posts[idx].author)?;
        self.posts.remove(idx);
        let removed: HashSet<CommentId> = self
            .comments
            .iter()
            .filter(|c| c.post == id)
            .map(|c| c.id)
            .collect();
        self.comments.retain(|c| c.post != id);
        self.post_likes.retain(|(_, p)| *p != id);
        self.comment_likes.retain(|(_, c)| !removed.contains(c));
        Ok(())
    }

    pub fn fetch_feed(&self, tok: AuthToken, q: FeedQuery) -> Result<FeedPage, Error> {
        let viewer = self.resolve(tok)?.id;
        q.validate()?;
        Ok(q.apply(self.posts.iter().map(|p| self.post_view(viewer, p))))
    }

    /// Number of ancestors still present above `id`, counted up to `MAX_REPLY_DEPTH`
    fn comment_depth(&self, post: PostId, id: CommentId) -> usize {
        let parent_of = |id: CommentId| {
            self.comments
                .iter()
                .find(|c| c.id == id && c.post == post)
                .and_then(|c| c.parent)
        };
        let exists = |id: CommentId| self.comments.iter().any(|c| c.id == id && c.post == post);
        let mut depth = 0;
        let mut current = parent_of(id);
        while let Some(p) = current {
            if depth >= MAX_REPLY_DEPTH || !exists(p) {
                break;
            }
            depth += 1;
            current = parent_of(p);
        }
        depth
    }

    pub fn create_comment(
        &mut self,
        tok: AuthToken,
        post: PostId,
        c: NewComment,
    ) -> Result<CommentId, Error> {
        let author = self.resolve(tok)?.id;
        c.validate()?;
        self.post_idx(post)?;
        if let Some(parent) = c.parent_id {
            if !self.comments.iter().any(|p| p.id == parent && p.post == post) {
                return Err(Error::CommentNotFound(parent.0));
            }
            check_reply_depth(self.comment_depth(post, parent))?;
        }
        let id = CommentId(Uuid::new_v4());
        let created_at = self.now();
        self.comments.push(DbComment {
            id,
            post,
            parent: c.parent_id,
            author,
            content: c.content,
            created_at,
        });
        Ok(id)
    }

    /// Replies are kept, and show up as threads of their own
    pub fn delete_comment(&mut self, tok: AuthToken, id: CommentId) -> Result<(), Error> {
        self.resolve(tok)?;
        let author = self
            .comments
            .iter()
            .find(|c| c.id == id)
            .ok_or(Error::CommentNotFound(id.0))?
            .author;
        self.can_edit(tok, author)?;
        self.comments.retain(|c| c.id != id);
        self.comment_likes.retain(|(_, c)| *c != id);
        Ok(())
    }

    pub fn like_post(&mut self, tok: AuthToken, id: PostId) -> Result<LikeState, Error> {
        let user = self.resolve(tok)?.id;
        self.post_idx(id)?;
        let liked = toggle(&mut self.post_likes, (user, id));
        Ok(LikeState {
            liked,
            likes_count: self.post_likes_count(id),
        })
    }

    pub fn like_comment(&mut self, tok: AuthToken, id: CommentId) -> Result<LikeState, Error> {
        let user = self.resolve(tok)?.id;
        if !self.comments.iter().any(|c| c.id == id) {
            return Err(Error::CommentNotFound(id.0));
        }
        let liked = toggle(&mut self.comment_likes, (user, id));
        Ok(LikeState {
            liked,
            likes_count: self.comment_likes_count(id),
        })
    }
}

/// Returns whether `v` is now in `set`
fn toggle<T: Eq + std::hash::Hash>(set: &mut HashSet<T>, v: T) -> bool {
    if set.remove(&v) {
        false
    } else {
        set.insert(v);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str) -> NewUser {
        NewUser::new(
            String::from(name),
            format!("{}@corp.example", name.to_lowercase().replace(' ', ".")),
            String::from("correct horse"),
            Team::Infrastructure,
        )
    }

    fn login(m: &mut MockServer, name: &str) -> AuthToken {
        m.signup(new_user(name)).unwrap();
        let email = format!("{}@corp.example", name.to_lowercase().replace(' ', "."));
        m.auth(NewSession {
            email,
            password: String::from("correct horse"),
            device: String::from("test"),
        })
        .unwrap()
    }

    fn post(title: &str) -> NewPost {
        NewPost {
            title: String::from(title),
            content: String::from("body"),
            post_type: PostType::Article,
            tags: vec![String::from("ops")],
        }
    }

    #[test]
    fn emails_are_unique() {
        let mut m = MockServer::new();
        m.signup(new_user("Ann Lee")).unwrap();
        assert_eq!(
            m.signup(new_user("Ann Lee")),
            Err(Error::EmailAlreadyUsed(String::from("ann.lee@corp.example")))
        );
        assert_eq!(m.test_num_users(), 1);
    }

    #[test]
    fn sessions() {
        let mut m = MockServer::new();
        let tok = login(&mut m, "Ann Lee");
        assert_eq!(m.whoami(tok).unwrap().full_name, "Ann Lee");
        m.unauth(tok).unwrap();
        assert_eq!(m.whoami(tok), Err(Error::PermissionDenied));
        assert_eq!(m.unauth(tok), Err(Error::PermissionDenied));
    }

    #[test]
    fn only_authors_and_admins_edit() {
        let mut m = MockServer::new();
        let ann = login(&mut m, "Ann Lee");
        let bob = login(&mut m, "Bob Ray");
        let p = m.create_post(ann, post("Runbook")).unwrap();
        assert_eq!(m.delete_post(bob, p), Err(Error::PermissionDenied));
        let bob_id = m.whoami(bob).unwrap().id;
        m.set_role(bob_id, Role::Admin).unwrap();
        m.edit_post(bob, p, post("Runbook v2")).unwrap();
        assert_eq!(m.fetch_post(ann, p).unwrap().post.title, "Runbook v2");
        m.delete_post(bob, p).unwrap();
        assert_eq!(m.fetch_post(ann, p), Err(Error::PostNotFound(p.0)));
    }

    #[test]
    fn views_and_likes() {
        let mut m = MockServer::new();
        let ann = login(&mut m, "Ann Lee");
        let p = m.create_post(ann, post("Runbook")).unwrap();
        m.fetch_post(ann, p).unwrap();
        let like = m.like_post(ann, p).unwrap();
        assert_eq!(
            like,
            LikeState {
                liked: true,
                likes_count: 1
            }
        );
        let view = m.fetch_post(ann, p).unwrap();
        assert_eq!(view.post.views, 2);
        assert!(view.post.has_liked);
        assert!(!m.like_post(ann, p).unwrap().liked);
    }

    #[test]
    fn deleted_parent_leaves_replies() {
        let mut m = MockServer::new();
        let ann = login(&mut m, "Ann Lee");
        let p = m.create_post(ann, post("Runbook")).unwrap();
        let comment = |content: &str, parent_id| NewComment {
            content: String::from(content),
            parent_id,
        };
        let top = m.create_comment(ann, p, comment("top", None)).unwrap();
        m.create_comment(ann, p, comment("reply", Some(top))).unwrap();
        assert_eq!(m.fetch_post(ann, p).unwrap().comments.len(), 1);
        m.delete_comment(ann, top).unwrap();
        let view = m.fetch_post(ann, p).unwrap();
        assert_eq!(view.comments.len(), 1);
        assert_eq!(view.comments[0].comment.content, "reply");
        assert_eq!(view.post.comments_count, 1);

        let other = m.create_post(ann, post("Other")).unwrap();
        let reply = m.test_get_comment(0).1;
        assert_eq!(
            m.create_comment(ann, other, comment("x", Some(reply))),
            Err(Error::CommentNotFound(reply.0))
        );
    }

    #[test]
    fn replies_stop_at_max_depth() {
        let mut m = MockServer::new();
        let ann = login(&mut m, "Ann Lee");
        let p = m.create_post(ann, post("Runbook")).unwrap();
        let reply = |parent_id| NewComment {
            content: String::from("+1"),
            parent_id,
        };
        let mut chain = vec![m.create_comment(ann, p, reply(None)).unwrap()];
        for _ in 0..MAX_REPLY_DEPTH {
            let parent = *chain.last().unwrap();
            chain.push(m.create_comment(ann, p, reply(Some(parent))).unwrap());
        }
        let deepest = *chain.last().unwrap();
        match m.create_comment(ann, p, reply(Some(deepest))) {
            Err(Error::InvalidFields(f)) => assert!(f.contains_key("parentId")),
            r => panic!("unexpected result {r:?}"),
        }
        let view = m.fetch_post(ann, p).unwrap();
        assert_eq!(view.comments[0].walk().map(|(d, _)| d).max(), Some(MAX_REPLY_DEPTH));

        // siblings at the cap are fine, and removing a link frees up depth
        m.create_comment(ann, p, reply(Some(chain[MAX_REPLY_DEPTH - 1]))).unwrap();
        m.delete_comment(ann, chain[10]).unwrap();
        m.create_comment(ann, p, reply(Some(deepest))).unwrap();
    }

    #[test]
    fn feed_is_newest_first() {
        let mut m = MockServer::new();
        let ann = login(&mut m, "Ann Lee");
        for i in 0..12 {
            m.create_post(ann, post(&format!("post {i}"))).unwrap();
        }
        let page = m.fetch_feed(ann, FeedQuery::default()).unwrap();
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.posts[0].title, "post 11");
        let page = m
            .fetch_feed(
                ann,
                FeedQuery {
                    page: 2,
                    ..FeedQuery::default()
                },
            )
            .unwrap();
        assert_eq!(
            page.posts.iter().map(|p| p.title.as_str()).collect::<Vec<_>>(),
            vec!["post 1", "post 0"]
        );
    }
}
