use infohub_api::{FeedQuery, FeedSort, Uuid};
use sqlx::{postgres::PgArguments, Arguments};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Bind {
    Uuid(Uuid),
    String(String),
}

#[derive(Debug, Default)]
pub struct Sql {
    pub where_clause: String,
    pub binds: Vec<Bind>,
}

impl Sql {
    /// Adds a Bind, returning the index that should be used to refer to it assuming the first bind is at index first_bind_idx
    fn add_bind(&mut self, first_bind_idx: usize, b: Bind) -> usize {
        let res = first_bind_idx + self.binds.len();
        self.binds.push(b);
        res
    }
}

pub fn arguments(binds: &[Bind]) -> PgArguments {
    let mut args = PgArguments::default();
    for b in binds {
        match b {
            Bind::Uuid(u) => args.add(*u),
            Bind::String(s) => args.add(s.clone()),
        }
    }
    args
}

/// Assumes table p (posts) is available
pub fn to_postgres(q: &FeedQuery, first_bind_idx: usize) -> Sql {
    let mut res = Sql {
        where_clause: String::from("true"),
        binds: Vec::new(),
    };
    if let Some(t) = q.post_type {
        let idx = res.add_bind(first_bind_idx, Bind::String(String::from(t.as_str())));
        res.where_clause.push_str(&format!(" AND p.type = ${idx}"));
    }
    if let Some(tag) = &q.tag {
        let idx = res.add_bind(first_bind_idx, Bind::String(tag.clone()));
        res.where_clause.push_str(&format!(" AND ${idx} = ANY(p.tags)"));
    }
    if let Some(author) = q.author {
        let idx = res.add_bind(first_bind_idx, Bind::Uuid(author.0));
        res.where_clause.push_str(&format!(" AND p.author_id = ${idx}"));
    }
    if let Some(search) = q.search_text() {
        // strpos rather than LIKE, so that % and _ need no escaping
        let idx = res.add_bind(first_bind_idx, Bind::String(search.to_lowercase()));
        res.where_clause.push_str(&format!(
            " AND (strpos(lower(p.title), ${idx}) > 0 \
                OR strpos(lower(p.content), ${idx}) > 0 \
                OR strpos(lower(p.type), ${idx}) > 0 \
                OR EXISTS (SELECT 1 FROM unnest(p.tags) tag WHERE strpos(lower(tag), ${idx}) > 0))"
        ));
    }
    res
}

/// Assumes the like count is available as `likes_count`
pub fn order_by(sort: FeedSort) -> &'static str {
    match sort {
        FeedSort::Recent => "p.created_at DESC, p.id",
        FeedSort::Liked => "likes_count DESC, p.created_at DESC, p.id",
        FeedSort::Views => "p.views DESC, p.created_at DESC, p.id",
    }
}

#[cfg(test)]
mod tests {
    use infohub_api::{PostType, UserId};

    use super::*;

    #[test]
    fn empty_query_matches_everything() {
        let sql = to_postgres(&FeedQuery::default(), 1);
        assert_eq!(sql.where_clause, "true");
        assert!(sql.binds.is_empty());
    }

    #[test]
    fn binds_are_numbered_from_the_first_index() {
        let author = Uuid::new_v4();
        let q = FeedQuery {
            post_type: Some(PostType::Inquiry),
            tag: Some(String::from("Security")),
            author: Some(UserId(author)),
            ..FeedQuery::default()
        };
        let sql = to_postgres(&q, 3);
        assert_eq!(
            sql.where_clause,
            "true AND p.type = $3 AND $4 = ANY(p.tags) AND p.author_id = $5"
        );
        assert_eq!(
            sql.binds,
            vec![
                Bind::String(String::from("Inquiry")),
                Bind::String(String::from("Security")),
                Bind::Uuid(author),
            ]
        );
    }

    #[test]
    fn search_is_lowercased_and_bound_once() {
        let q = FeedQuery {
            search: Some(String::from("  Route53 50%_off ")),
            ..FeedQuery::default()
        };
        let sql = to_postgres(&q, 1);
        assert_eq!(sql.binds, vec![Bind::String(String::from("route53 50%_off"))]);
        assert_eq!(sql.where_clause.matches("$1").count(), 4);
        assert!(!sql.where_clause.contains("$2"));

        let blank = FeedQuery {
            search: Some(String::from("   ")),
            ..FeedQuery::default()
        };
        assert!(to_postgres(&blank, 1).binds.is_empty());
    }

    #[test]
    fn every_sort_is_total() {
        for s in [FeedSort::Recent, FeedSort::Liked, FeedSort::Views] {
            assert!(order_by(s).ends_with("p.id"));
        }
    }
}
