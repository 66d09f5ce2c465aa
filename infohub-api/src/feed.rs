use std::cmp::Reverse;

use crate::{Error, Post, PostType, UserId};

pub const PAGE_SIZE: usize = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum FeedSort {
    /// Newest first
    Recent,
    /// Most liked first
    Liked,
    /// Most viewed first
    Views,
}

impl Default for FeedSort {
    fn default() -> FeedSort {
        FeedSort::Recent
    }
}

impl FeedSort {
    /// Ties are broken by creation date (newest first) then by id, so that
    /// the order is total and pagination is stable
    pub fn sort(&self, posts: &mut [Post]) {
        match self {
            FeedSort::Recent => posts.sort_unstable_by_key(|p| (Reverse(p.created_at), p.id)),
            FeedSort::Liked => posts
                .sort_unstable_by_key(|p| (Reverse(p.likes_count), Reverse(p.created_at), p.id)),
            FeedSort::Views => {
                posts.sort_unstable_by_key(|p| (Reverse(p.views), Reverse(p.created_at), p.id))
            }
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FeedQuery {
    #[serde(default)]
    pub post_type: Option<PostType>,

    /// Exact match against one of the post's tags
    #[serde(default)]
    pub tag: Option<String>,

    /// Case-insensitive substring of the title, content, a tag, or the type name
    #[serde(default)]
    pub search: Option<String>,

    #[serde(default)]
    pub author: Option<UserId>,

    #[serde(default)]
    pub sort: FeedSort,

    /// 1-based, 0 is understood as 1
    #[serde(default)]
    pub page: u32,
}

impl FeedQuery {
    pub fn validate(&self) -> Result<(), Error> {
        if let Some(t) = &self.tag {
            crate::validate_string(t)?;
        }
        if let Some(s) = &self.search {
            crate::validate_string(s)?;
        }
        Ok(())
    }

    pub fn page(&self) -> u32 {
        std::cmp::max(self.page, 1)
    }

    pub fn offset(&self) -> usize {
        (self.page() as usize - 1) * PAGE_SIZE
    }

    /// Search text, trimmed, or None if there is nothing to search for
    pub fn search_text(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }

    pub fn matches(&self, p: &Post) -> bool {
        if let Some(t) = self.post_type {
            if p.post_type != t {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !p.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(author) = self.author {
            if p.author_id != author {
                return false;
            }
        }
        if let Some(search) = self.search_text() {
            let search = search.to_lowercase();
            let found = p.title.to_lowercase().contains(&search)
                || p.content.to_lowercase().contains(&search)
                || p.tags.iter().any(|t| t.to_lowercase().contains(&search))
                || p.post_type.as_str().to_lowercase().contains(&search);
            if !found {
                return false;
            }
        }
        true
    }

    /// Filters, sorts and cuts out the requested page
    pub fn apply(&self, posts: impl IntoIterator<Item = Post>) -> FeedPage {
        let mut posts: Vec<Post> = posts.into_iter().filter(|p| self.matches(p)).collect();
        self.sort.sort(&mut posts);
        let total = posts.len();
        FeedPage {
            posts: posts.into_iter().skip(self.offset()).take(PAGE_SIZE).collect(),
            page: self.page(),
            total_pages: FeedPage::total_pages_for(total),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct FeedPage {
    pub posts: Vec<Post>,
    pub page: u32,
    pub total_pages: u32,
}

impl FeedPage {
    pub fn total_pages_for(total_posts: usize) -> u32 {
        let pages = (total_posts + PAGE_SIZE - 1) / PAGE_SIZE;
        std::cmp::max(1, u32::try_from(pages).unwrap_or(u32::MAX))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::{PostId, Team, Uuid};

    fn post(n: u128, post_type: PostType, tags: &[&str], likes: i64, views: i64) -> Post {
        Post {
            id: PostId(Uuid::from_u128(n)),
            author_id: UserId(Uuid::from_u128(n % 2)),
            author_name: format!("author {}", n % 2),
            author_team: Team::Product,
            title: format!("Post number {n}"),
            content: String::from("Body text about Route53 failover"),
            post_type,
            tags: tags.iter().map(|t| String::from(*t)).collect(),
            views,
            likes_count: likes,
            comments_count: 0,
            has_liked: false,
            created_at: chrono::Utc
                .timestamp_opt(n as i64 * 60, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    fn ids(page: &FeedPage) -> Vec<u128> {
        page.posts.iter().map(|p| p.id.0.as_u128()).collect()
    }

    fn sample() -> Vec<Post> {
        vec![
            post(1, PostType::Article, &["Security", "Infrastructure"], 45, 1204),
            post(2, PostType::Inquiry, &["Product", "Frontend"], 12, 89),
            post(3, PostType::Discussion, &["Digital Transformation"], 67, 450),
            post(4, PostType::Article, &["Security"], 12, 89),
        ]
    }

    #[test]
    fn sorts() {
        let q = |sort| FeedQuery {
            sort,
            ..FeedQuery::default()
        };
        assert_eq!(ids(&q(FeedSort::Recent).apply(sample())), vec![4, 3, 2, 1]);
        assert_eq!(ids(&q(FeedSort::Liked).apply(sample())), vec![3, 1, 4, 2]);
        assert_eq!(ids(&q(FeedSort::Views).apply(sample())), vec![1, 3, 4, 2]);
    }

    #[test]
    fn filters() {
        let by_type = FeedQuery {
            post_type: Some(PostType::Article),
            ..FeedQuery::default()
        };
        assert_eq!(ids(&by_type.apply(sample())), vec![4, 1]);

        let by_tag = FeedQuery {
            tag: Some(String::from("Security")),
            sort: FeedSort::Views,
            ..FeedQuery::default()
        };
        assert_eq!(ids(&by_tag.apply(sample())), vec![1, 4]);

        let partial_tag = FeedQuery {
            tag: Some(String::from("Secur")),
            ..FeedQuery::default()
        };
        assert!(partial_tag.apply(sample()).posts.is_empty());

        let by_author = FeedQuery {
            author: Some(UserId(Uuid::from_u128(1))),
            ..FeedQuery::default()
        };
        assert_eq!(ids(&by_author.apply(sample())), vec![3, 1]);
    }

    #[test]
    fn search_is_case_insensitive_and_covers_every_field() {
        let search = |s: &str| FeedQuery {
            search: Some(String::from(s)),
            ..FeedQuery::default()
        };
        assert_eq!(ids(&search("NUMBER 2").apply(sample())), vec![2]);
        assert_eq!(ids(&search("frontend").apply(sample())), vec![2]);
        assert_eq!(ids(&search("inquiry").apply(sample())), vec![2]);
        assert_eq!(ids(&search("route53").apply(sample())).len(), 4);
        assert_eq!(ids(&search("   ").apply(sample())).len(), 4);
        assert!(search("kubernetes").apply(sample()).posts.is_empty());
    }

    #[test]
    fn pagination() {
        let posts: Vec<Post> = (1..=23)
            .map(|n| post(n, PostType::Article, &[], 0, 0))
            .collect();
        let page = |page| FeedQuery {
            page,
            ..FeedQuery::default()
        };
        let first = page(0).apply(posts.clone());
        assert_eq!(first.page, 1);
        assert_eq!(first.total_pages, 3);
        assert_eq!(ids(&first), (14..=23).rev().collect::<Vec<_>>());
        assert_eq!(ids(&page(3).apply(posts.clone())), vec![3, 2, 1]);
        let past_end = page(4).apply(posts);
        assert!(past_end.posts.is_empty());
        assert_eq!(past_end.total_pages, 3);
        assert_eq!(FeedPage::total_pages_for(0), 1);
        assert_eq!(FeedPage::total_pages_for(10), 1);
        assert_eq!(FeedPage::total_pages_for(11), 2);
    }

    #[test]
    fn sorted_feed_is_a_total_order() {
        bolero::check!()
            .with_type::<Vec<(u8, u8, u8)>>()
            .cloned()
            .for_each(|input| {
                let posts: Vec<Post> = input
                    .iter()
                    .enumerate()
                    .map(|(i, &(likes, views, at))| {
                        let mut p = post(i as u128, PostType::Article, &[], i64::from(likes), i64::from(views));
                        p.created_at = chrono::Utc
                            .timestamp_opt(i64::from(at), 0)
                            .single()
                            .expect("valid timestamp");
                        p
                    })
                    .collect();
                for sort in [FeedSort::Recent, FeedSort::Liked, FeedSort::Views] {
                    let mut a = posts.clone();
                    let mut b: Vec<Post> = posts.iter().rev().cloned().collect();
                    sort.sort(&mut a);
                    sort.sort(&mut b);
                    assert_eq!(a, b);
                }
            });
    }
}
