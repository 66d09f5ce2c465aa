use std::{fmt, str::FromStr};

use uuid::Uuid;

use crate::{Error, PostId, PostType, Time, STUB_UUID};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Admin => "Admin",
        }
    }
}

impl Default for Role {
    fn default() -> Role {
        Role::User
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Role, Error> {
        match s {
            "User" => Ok(Role::User),
            "Admin" => Ok(Role::Admin),
            _ => Err(Error::field("role", "Unknown role")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum Team {
    #[serde(rename = "Digital Transformation")]
    DigitalTransformation,
    #[serde(rename = "Service Delivery")]
    ServiceDelivery,
    #[serde(rename = "Project Management")]
    ProjectManagement,
    Infrastructure,
    Security,
    Product,
}

impl Team {
    pub const ALL: [Team; 6] = [
        Team::DigitalTransformation,
        Team::ServiceDelivery,
        Team::ProjectManagement,
        Team::Infrastructure,
        Team::Security,
        Team::Product,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Team::DigitalTransformation => "Digital Transformation",
            Team::ServiceDelivery => "Service Delivery",
            Team::ProjectManagement => "Project Management",
            Team::Infrastructure => "Infrastructure",
            Team::Security => "Security",
            Team::Product => "Product",
        }
    }
}

impl fmt::Display for Team {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Team {
    type Err = Error;

    fn from_str(s: &str) -> Result<Team, Error> {
        Team::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::field("team", "Unknown team"))
    }
}

/// Public view of a user, never carries the password hash
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub full_name: String,
    pub photo_id_url: Option<String>,
    pub role: Role,
    pub team: Team,
    pub created_at: Time,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ChangeTeam {
    pub team: Team,
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct ChangeRole {
    pub role: Role,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct UserPost {
    pub id: PostId,
    pub title: String,
    #[serde(rename = "type")]
    pub post_type: PostType,
    pub tags: Vec<String>,
    pub views: i64,
    pub likes_count: i64,
    pub created_at: Time,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct UserStats {
    pub total_views: i64,
    pub post_count: i64,
}

impl UserStats {
    pub fn of(posts: &[UserPost]) -> UserStats {
        UserStats {
            total_views: posts.iter().map(|p| p.views).sum(),
            post_count: posts.len() as i64,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct UserProfile {
    pub user: User,
    /// Newest first
    pub posts: Vec<UserPost>,
    pub stats: UserStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_names_match_their_wire_form() {
        for t in Team::ALL {
            assert_eq!(t.as_str().parse::<Team>().unwrap(), t);
            assert_eq!(
                serde_json::to_string(&t).unwrap(),
                format!("\"{}\"", t.as_str())
            );
        }
        assert!("Marketing".parse::<Team>().is_err());
    }

    #[test]
    fn stats_sum_views() {
        let post = |views| UserPost {
            id: PostId(Uuid::new_v4()),
            title: String::from("t"),
            post_type: PostType::Article,
            tags: Vec::new(),
            views,
            likes_count: 0,
            created_at: chrono::Utc::now(),
        };
        assert_eq!(
            UserStats::of(&[post(3), post(0), post(39)]),
            UserStats {
                total_views: 42,
                post_count: 3
            }
        );
        assert_eq!(UserStats::of(&[]), UserStats::default());
    }
}
