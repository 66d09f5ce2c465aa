use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
};

use uuid::Uuid;

use crate::{Error, FieldErrors, Time, UserId};

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
pub struct CommentId(pub Uuid);

/// Deepest reply allowed, top-level comments being at depth 0
///
/// Each level nests one JSON object and one array, so this keeps a whole
/// `PostView` under serde_json's default recursion limit of 128.
pub const MAX_REPLY_DEPTH: usize = 50;

/// Checks that a reply to a comment sitting at `parent_depth` is allowed
pub fn check_reply_depth(parent_depth: usize) -> Result<(), Error> {
    match parent_depth < MAX_REPLY_DEPTH {
        true => Ok(()),
        false => Err(Error::field(
            "parentId",
            &format!("Replies cannot be nested more than {MAX_REPLY_DEPTH} levels deep"),
        )),
    }
}

#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
pub struct NewComment {
    pub content: String,
    #[serde(default)]
    pub parent_id: Option<CommentId>,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), Error> {
        crate::validate_string(&self.content)?;
        let mut errors = FieldErrors::new();
        crate::require_len(&mut errors, "content", &self.content, 1, "Comment cannot be empty");
        match errors.is_empty() {
            true => Ok(()),
            false => Err(Error::InvalidFields(errors)),
        }
    }
}

/// One comment as fetched from storage, before threading
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentRecord {
    pub id: CommentId,
    pub parent_id: Option<CommentId>,
    pub author_id: UserId,
    pub author_name: String,
    pub content: String,
    pub created_at: Time,
    pub likes_count: i64,
    pub has_liked: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentNode {
    #[serde(flatten)]
    pub comment: CommentRecord,

    /// Direct replies, oldest first
    pub replies: Vec<CommentNode>,
}

impl CommentNode {
    /// Depth-first, pre-order walk over this node and all its descendants,
    /// yielding each node along with its depth (0 for `self`)
    pub fn walk(&self) -> Walk<'_> {
        Walk {
            stack: vec![(0, self)],
        }
    }

    /// Number of comments in this thread, including this one
    pub fn count(&self) -> usize {
        self.walk().count()
    }
}

impl Drop for CommentNode {
    // The derived drop would recurse once per nesting level
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.replies);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.replies);
        }
    }
}

pub struct Walk<'a> {
    stack: Vec<(usize, &'a CommentNode)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (usize, &'a CommentNode);

    fn next(&mut self) -> Option<Self::Item> {
        let (depth, node) = self.stack.pop()?;
        self.stack
            .extend(node.replies.iter().rev().map(|r| (depth + 1, r)));
        Some((depth, node))
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommentTree {
    /// Newest thread first
    pub roots: Vec<CommentNode>,

    /// Comments that name a parent but were placed among the roots: the parent
    /// is missing, is the comment itself, or is part of a reply cycle
    pub orphans: Vec<CommentId>,

    /// Ids seen more than once; only the last record for each was kept
    pub duplicates: Vec<CommentId>,
}

impl CommentTree {
    pub fn walk(&self) -> impl Iterator<Item = (usize, &CommentNode)> {
        self.roots.iter().flat_map(|r| r.walk())
    }

    pub fn count(&self) -> usize {
        self.walk().count()
    }
}

#[derive(Clone, Copy)]
enum Visit {
    New,
    OnPath(usize),
    Done,
}

/// Threads a flat list of comments into a reply forest.
///
/// Never fails: missing parents and self-references turn the comment into a
/// root, reply cycles are broken at their oldest comment, and duplicate ids
/// keep their last record. All of these are reported in the returned tree so
/// that the caller can log them. Roots are sorted newest first and replies
/// oldest first, ties keeping input order.
pub fn build_comment_tree<I>(comments: I) -> CommentTree
where
    I: IntoIterator<Item = CommentRecord>,
{
    let mut slots: Vec<Option<CommentRecord>> = Vec::new();
    let mut last_seen = HashMap::new();
    let mut duplicates = Vec::new();
    let mut reported = HashSet::new();
    for c in comments {
        if let Some(prev) = last_seen.insert(c.id, slots.len()) {
            slots[prev] = None;
            if reported.insert(c.id) {
                duplicates.push(c.id);
            }
        }
        slots.push(Some(c));
    }
    let comments: Vec<CommentRecord> = slots.into_iter().flatten().collect();
    let index: HashMap<CommentId, usize> = comments
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id, i))
        .collect();

    let mut parent: Vec<Option<usize>> = comments
        .iter()
        .enumerate()
        .map(|(i, c)| {
            c.parent_id
                .and_then(|p| index.get(&p).copied())
                .filter(|&p| p != i)
        })
        .collect();
    let mut orphans: Vec<CommentId> = comments
        .iter()
        .zip(parent.iter())
        .filter(|(c, p)| c.parent_id.is_some() && p.is_none())
        .map(|(c, _)| c.id)
        .collect();

    // Walk up from every comment; reaching a comment already on the current
    // path means none of the path's cycle can reach a root
    let mut visit = vec![Visit::New; comments.len()];
    for start in 0..comments.len() {
        let mut path = Vec::new();
        let mut cur = start;
        loop {
            match visit[cur] {
                Visit::Done => break,
                Visit::OnPath(pos) => {
                    let oldest = path[pos..]
                        .iter()
                        .copied()
                        .min_by_key(|&i: &usize| (comments[i].created_at, i))
                        .unwrap_or(cur);
                    parent[oldest] = None;
                    orphans.push(comments[oldest].id);
                    break;
                }
                Visit::New => {
                    visit[cur] = Visit::OnPath(path.len());
                    path.push(cur);
                    match parent[cur] {
                        Some(p) => cur = p,
                        None => break,
                    }
                }
            }
        }
        for i in path {
            visit[i] = Visit::Done;
        }
    }

    let mut children = vec![Vec::new(); comments.len()];
    let mut roots = Vec::new();
    for (i, p) in parent.iter().enumerate() {
        match p {
            Some(p) => children[*p].push(i),
            None => roots.push(i),
        }
    }
    for c in children.iter_mut() {
        c.sort_by_key(|&i| comments[i].created_at);
    }
    roots.sort_by_key(|&i| Reverse(comments[i].created_at));

    // Pre-order from the roots, so that walking it backwards sees every reply
    // before its parent
    let mut order = Vec::with_capacity(comments.len());
    let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
    while let Some(i) = stack.pop() {
        order.push(i);
        stack.extend(children[i].iter().rev());
    }

    let mut comments: Vec<Option<CommentRecord>> = comments.into_iter().map(Some).collect();
    let mut built: Vec<Option<CommentNode>> = (0..comments.len()).map(|_| None).collect();
    for &i in order.iter().rev() {
        let replies = children[i]
            .iter()
            .filter_map(|&c| built[c].take())
            .collect();
        if let Some(comment) = comments[i].take() {
            built[i] = Some(CommentNode { comment, replies });
        }
    }

    CommentTree {
        roots: roots.iter().filter_map(|&i| built[i].take()).collect(),
        orphans,
        duplicates,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};

    use chrono::TimeZone;

    use super::*;

    fn id(n: u8) -> CommentId {
        CommentId(Uuid::from_u128(u128::from(n) + 1))
    }

    fn at(secs: u8) -> Time {
        chrono::Utc
            .timestamp_opt(i64::from(secs), 0)
            .single()
            .expect("small timestamps are valid")
    }

    fn record(n: u8, parent: Option<u8>, secs: u8) -> CommentRecord {
        CommentRecord {
            id: id(n),
            parent_id: parent.map(id),
            author_id: UserId::stub(),
            author_name: format!("author of {n}"),
            content: format!("comment {n}"),
            created_at: at(secs),
            likes_count: 0,
            has_liked: false,
        }
    }

    fn ids(nodes: &[CommentNode]) -> Vec<CommentId> {
        nodes.iter().map(|n| n.comment.id).collect()
    }

    #[test]
    fn replies_sorted_oldest_first() {
        let tree = build_comment_tree(vec![
            record(0, None, 10),
            record(1, Some(0), 20),
            record(2, Some(0), 15),
        ]);
        assert_eq!(ids(&tree.roots), vec![id(0)]);
        assert_eq!(ids(&tree.roots[0].replies), vec![id(2), id(1)]);
        assert!(tree.orphans.is_empty());
        assert!(tree.duplicates.is_empty());
    }

    #[test]
    fn orphan_becomes_root() {
        let tree = build_comment_tree(vec![record(0, Some(99), 5)]);
        assert_eq!(ids(&tree.roots), vec![id(0)]);
        assert_eq!(tree.orphans, vec![id(0)]);
    }

    #[test]
    fn self_reference_becomes_root() {
        let tree = build_comment_tree(vec![record(0, Some(0), 1)]);
        assert_eq!(ids(&tree.roots), vec![id(0)]);
        assert!(tree.roots[0].replies.is_empty());
        assert_eq!(tree.orphans, vec![id(0)]);
    }

    #[test]
    fn empty_input() {
        assert_eq!(build_comment_tree(Vec::new()), CommentTree::default());
    }

    #[test]
    fn forward_reference() {
        let tree = build_comment_tree(vec![record(1, Some(0), 2), record(0, None, 1)]);
        assert_eq!(ids(&tree.roots), vec![id(0)]);
        assert_eq!(ids(&tree.roots[0].replies), vec![id(1)]);
    }

    #[test]
    fn roots_newest_first_and_ties_keep_input_order() {
        let tree = build_comment_tree(vec![
            record(0, None, 1),
            record(1, None, 3),
            record(2, None, 2),
            record(3, None, 3),
            record(4, Some(0), 7),
            record(5, Some(0), 7),
        ]);
        assert_eq!(ids(&tree.roots), vec![id(1), id(3), id(2), id(0)]);
        assert_eq!(ids(&tree.roots[3].replies), vec![id(4), id(5)]);
    }

    #[test]
    fn nested_levels_are_sorted() {
        let tree = build_comment_tree(vec![
            record(0, None, 0),
            record(1, Some(0), 5),
            record(2, Some(1), 9),
            record(3, Some(1), 6),
            record(4, Some(3), 8),
            record(5, Some(3), 7),
        ]);
        let walked: Vec<(usize, CommentId)> =
            tree.walk().map(|(d, n)| (d, n.comment.id)).collect();
        assert_eq!(
            walked,
            vec![
                (0, id(0)),
                (1, id(1)),
                (2, id(3)),
                (3, id(5)),
                (3, id(4)),
                (2, id(2)),
            ]
        );
    }

    #[test]
    fn two_cycle_is_broken_at_oldest() {
        let tree = build_comment_tree(vec![record(0, Some(1), 2), record(1, Some(0), 1)]);
        assert_eq!(ids(&tree.roots), vec![id(1)]);
        assert_eq!(ids(&tree.roots[0].replies), vec![id(0)]);
        assert_eq!(tree.orphans, vec![id(1)]);
    }

    #[test]
    fn cycle_with_a_tail_keeps_everything() {
        // 3 -> 2 -> 1 -> 0 -> 2, plus a regular root 4
        let tree = build_comment_tree(vec![
            record(3, Some(2), 9),
            record(2, Some(1), 5),
            record(1, Some(0), 6),
            record(0, Some(2), 7),
            record(4, None, 1),
        ]);
        assert_eq!(tree.count(), 5);
        assert_eq!(ids(&tree.roots), vec![id(2), id(4)]);
        assert_eq!(tree.orphans, vec![id(2)]);
        let two = &tree.roots[0];
        assert_eq!(ids(&two.replies), vec![id(0), id(3)]);
        assert_eq!(ids(&two.replies[0].replies), vec![id(1)]);
    }

    #[test]
    fn duplicates_keep_last_record() {
        let mut second = record(0, None, 4);
        second.content = String::from("edited");
        let tree = build_comment_tree(vec![
            record(0, None, 3),
            record(1, Some(0), 5),
            second,
            record(0, None, 6),
        ]);
        assert_eq!(tree.duplicates, vec![id(0)]);
        assert_eq!(tree.count(), 2);
        assert_eq!(tree.roots[0].comment.created_at, at(6));
        assert_eq!(ids(&tree.roots[0].replies), vec![id(1)]);
    }

    #[test]
    fn deep_chain_does_not_overflow() {
        const DEPTH: u32 = 50_000;
        let records = (0..DEPTH).map(|i| CommentRecord {
            id: CommentId(Uuid::from_u128(u128::from(i) + 1)),
            parent_id: i.checked_sub(1).map(|p| CommentId(Uuid::from_u128(u128::from(p) + 1))),
            author_id: UserId::stub(),
            author_name: String::new(),
            content: String::new(),
            created_at: at(0),
            likes_count: 0,
            has_liked: false,
        });
        let tree = build_comment_tree(records);
        assert_eq!(tree.roots.len(), 1);
        let max_depth = tree.walk().map(|(d, _)| d).max();
        assert_eq!(max_depth, Some(DEPTH as usize - 1));
    }

    #[test]
    fn reply_depth_is_capped() {
        check_reply_depth(0).unwrap();
        check_reply_depth(MAX_REPLY_DEPTH - 1).unwrap();
        match check_reply_depth(MAX_REPLY_DEPTH) {
            Err(Error::InvalidFields(f)) => assert!(f.contains_key("parentId")),
            r => panic!("unexpected result {r:?}"),
        }
        assert!(check_reply_depth(MAX_REPLY_DEPTH + 10).is_err());
    }

    #[test]
    fn many_duplicates_are_reported_once() {
        let records = (0..10_000u32).map(|i| record((i % 3) as u8, None, (i % 200) as u8));
        let tree = build_comment_tree(records);
        assert_eq!(tree.duplicates, vec![id(0), id(1), id(2)]);
        assert_eq!(tree.count(), 3);
    }

    #[test]
    fn serialized_node_is_flat() {
        let tree = build_comment_tree(vec![record(0, None, 1), record(1, Some(0), 2)]);
        let json = serde_json::to_value(&tree.roots[0]).unwrap();
        assert_eq!(json["content"], "comment 0");
        assert_eq!(json["replies"][0]["content"], "comment 1");
        assert_eq!(json["replies"][0]["replies"], serde_json::json!([]));
        let back: CommentNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, tree.roots[0]);
    }

    #[test]
    fn input_is_untouched_and_output_deterministic() {
        let input = vec![
            record(2, Some(0), 3),
            record(0, None, 1),
            record(1, Some(0), 3),
            record(3, Some(7), 2),
        ];
        let before = input.clone();
        let a = build_comment_tree(input.iter().cloned());
        let b = build_comment_tree(input.iter().cloned());
        assert_eq!(a, b);
        assert_eq!(input, before);
    }

    #[test]
    fn arbitrary_inputs() {
        bolero::check!()
            .with_type::<Vec<(u8, Option<u8>, u8)>>()
            .cloned()
            .for_each(|input| {
                let records: Vec<CommentRecord> = input
                    .iter()
                    .map(|&(n, p, secs)| record(n % 32, p.map(|p| p % 32), secs))
                    .collect();
                let tree = build_comment_tree(records.clone());

                // the last record for each id is the one that must survive
                let mut expected: HashMap<CommentId, &CommentRecord> = HashMap::new();
                for r in &records {
                    expected.insert(r.id, r);
                }

                // every kept record exactly once, with its own data
                let mut seen = HashSet::new();
                for (_, node) in tree.walk() {
                    assert!(seen.insert(node.comment.id), "{:?} twice", node.comment.id);
                    assert_eq!(Some(&&node.comment), expected.get(&node.comment.id));
                }
                assert_eq!(seen.len(), expected.len());

                // replies sit under their parent, roots have no parent or are reported
                let orphans: HashSet<CommentId> = tree.orphans.iter().copied().collect();
                let mut stack: Vec<(Option<CommentId>, &CommentNode)> =
                    tree.roots.iter().map(|r| (None, r)).collect();
                while let Some((parent, node)) = stack.pop() {
                    match parent {
                        Some(p) => assert_eq!(node.comment.parent_id, Some(p)),
                        None => assert!(
                            node.comment.parent_id.is_none() || orphans.contains(&node.comment.id)
                        ),
                    }
                    for pair in node.replies.windows(2) {
                        assert!(pair[0].comment.created_at <= pair[1].comment.created_at);
                    }
                    stack.extend(node.replies.iter().map(|r| (Some(node.comment.id), r)));
                }
                for pair in tree.roots.windows(2) {
                    assert!(pair[0].comment.created_at >= pair[1].comment.created_at);
                }

                for o in &tree.orphans {
                    assert!(expected[o].parent_id.is_some());
                }

                assert_eq!(build_comment_tree(records), tree);
            });
    }
}
