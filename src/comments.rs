//! Comment threads: building a forest from the flat list the backend returns,
//! and editing that forest in place by id.
//!
//! All lookups share one depth-first, pre-order search ([`path_to`]). Find,
//! insert, replace and remove resolve their target through it, so a node
//! inserted at any depth is found again at the same depth.

use std::collections::HashMap;

use crate::api::Comment;

/// Builds the reply forest for one post.
///
/// - A comment whose parent is zero, missing from `flat`, or itself is a root.
/// - Parent chains that loop are cut at the earliest comment of the loop in
///   input order, which becomes a root.
/// - Root order is kept as received; any reply group of two or more is sorted
///   by `created_at`, ties keeping input order.
///
/// Duplicate ids are not expected from the backend; the last one wins the
/// index and both are kept.
pub fn build_forest(flat: Vec<Comment>) -> Vec<Comment> {
    let count = flat.len();
    let index: HashMap<i64, usize> = flat
        .iter()
        .enumerate()
        .map(|(pos, comment)| (comment.id, pos))
        .collect();

    let mut parent_of: Vec<Option<usize>> = flat
        .iter()
        .map(|comment| {
            if comment.parent_id == 0 || comment.parent_id == comment.id {
                return None;
            }
            index.get(&comment.parent_id).copied()
        })
        .collect();
    break_cycles(&mut parent_of);

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); count];
    let mut roots = Vec::new();
    for (pos, parent) in parent_of.iter().enumerate() {
        match parent {
            Some(parent) => children[*parent].push(pos),
            None => roots.push(pos),
        }
    }
    for group in children.iter_mut().filter(|group| group.len() >= 2) {
        group.sort_by_key(|&pos| flat[pos].created_at);
    }

    // Pre-order from the roots, then assemble bottom-up so no recursion is
    // needed however deep the thread goes.
    let mut order = Vec::with_capacity(count);
    let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
    while let Some(pos) = stack.pop() {
        order.push(pos);
        stack.extend(children[pos].iter().rev().copied());
    }

    let mut slots: Vec<Option<Comment>> = flat.into_iter().map(Some).collect();
    let mut built: Vec<Option<Comment>> = vec![None; count];
    for &pos in order.iter().rev() {
        let Some(mut comment) = slots[pos].take() else {
            continue;
        };
        comment.replies = children[pos]
            .iter()
            .filter_map(|&child| built[child].take())
            .collect();
        built[pos] = Some(comment);
    }

    roots.into_iter().filter_map(|pos| built[pos].take()).collect()
}

fn break_cycles(parent_of: &mut [Option<usize>]) {
    const UNSEEN: u8 = 0;
    const ACTIVE: u8 = 1;
    const DONE: u8 = 2;

    let mut mark = vec![UNSEEN; parent_of.len()];
    for start in 0..parent_of.len() {
        let mut chain = Vec::new();
        let mut cursor = Some(start);
        while let Some(pos) = cursor {
            match mark[pos] {
                DONE => break,
                ACTIVE => {
                    // `pos` is on the chain we are walking: cut the loop at
                    // its earliest member.
                    let loop_start = chain.iter().position(|&p| p == pos).unwrap_or(0);
                    if let Some(&earliest) = chain[loop_start..].iter().min() {
                        parent_of[earliest] = None;
                    }
                    break;
                }
                _ => {
                    mark[pos] = ACTIVE;
                    chain.push(pos);
                    cursor = parent_of[pos];
                }
            }
        }
        for pos in chain {
            mark[pos] = DONE;
        }
    }
}

/// Flattens a forest depth-first, parents before children, with empty
/// `replies`. Feeding the result back into [`build_forest`] reproduces the
/// same forest.
pub fn flatten(forest: &[Comment]) -> Vec<Comment> {
    let mut flat = Vec::new();
    let mut stack: Vec<&Comment> = forest.iter().rev().collect();
    while let Some(comment) = stack.pop() {
        let mut copy = comment.clone();
        copy.replies = Vec::new();
        flat.push(copy);
        stack.extend(comment.replies.iter().rev());
    }
    flat
}

/// Sibling indices leading to the first comment, in pre-order, that matches.
pub fn path_to<F>(forest: &[Comment], mut matches: F) -> Option<Vec<usize>>
where
    F: FnMut(&Comment) -> bool,
{
    let mut stack: Vec<(Vec<usize>, &Comment)> = forest
        .iter()
        .enumerate()
        .rev()
        .map(|(i, comment)| (vec![i], comment))
        .collect();
    while let Some((path, comment)) = stack.pop() {
        if matches(comment) {
            return Some(path);
        }
        for (i, reply) in comment.replies.iter().enumerate().rev() {
            let mut child = path.clone();
            child.push(i);
            stack.push((child, reply));
        }
    }
    None
}

/// Runs `action` on the sibling list holding the first match and its index.
pub fn visit<F, A, R>(forest: &mut Vec<Comment>, matches: F, action: A) -> Option<R>
where
    F: FnMut(&Comment) -> bool,
    A: FnOnce(&mut Vec<Comment>, usize) -> R,
{
    let path = path_to(forest, matches)?;
    let (&last, parents) = path.split_last()?;
    let mut siblings = forest;
    for &i in parents {
        siblings = &mut siblings[i].replies;
    }
    Some(action(siblings, last))
}

pub fn find(forest: &[Comment], id: i64) -> Option<&Comment> {
    let path = path_to(forest, |comment| comment.id == id)?;
    let (&last, parents) = path.split_last()?;
    let mut siblings = forest;
    for &i in parents {
        siblings = siblings[i].replies.as_slice();
    }
    siblings.get(last)
}

/// Prepends `comment` to the replies of `parent_id`. Returns `false`, leaving
/// the forest untouched, when the parent is not in it.
pub fn insert_under(forest: &mut Vec<Comment>, parent_id: i64, comment: Comment) -> bool {
    visit(
        forest,
        |candidate| candidate.id == parent_id,
        move |siblings, i| siblings[i].replies.insert(0, comment),
    )
    .is_some()
}

/// Swaps the comment `id` for whatever `with` builds from it, in place.
pub fn replace<W>(forest: &mut Vec<Comment>, id: i64, with: W) -> bool
where
    W: FnOnce(Comment) -> Comment,
{
    visit(
        forest,
        |candidate| candidate.id == id,
        move |siblings, i| {
            let current = siblings.remove(i);
            siblings.insert(i, with(current));
        },
    )
    .is_some()
}

/// Detaches the comment `id`, with its replies, from wherever it sits.
pub fn remove(forest: &mut Vec<Comment>, id: i64) -> Option<Comment> {
    visit(
        forest,
        |candidate| candidate.id == id,
        |siblings, i| siblings.remove(i),
    )
}

pub fn count(forest: &[Comment]) -> usize {
    forest
        .iter()
        .map(|comment| 1 + count(&comment.replies))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn comment(id: i64, parent_id: i64, minute: u32) -> Comment {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap();
        Comment {
            id,
            post_id: 1,
            parent_id,
            root_id: 0,
            content: format!("comment {id}"),
            author: "amy".into(),
            avatar: String::new(),
            created_at: at,
            updated_at: at,
            replies: Vec::new(),
        }
    }

    fn ids(forest: &[Comment]) -> Vec<i64> {
        forest.iter().map(|c| c.id).collect()
    }

    fn shape(forest: &[Comment]) -> Vec<(i64, Vec<i64>)> {
        flatten(forest)
            .iter()
            .map(|c| {
                let node = find(forest, c.id).unwrap();
                (c.id, ids(&node.replies))
            })
            .collect()
    }

    #[test]
    fn replies_nest_under_parents_and_roots_keep_order() {
        let forest = build_forest(vec![
            comment(3, 0, 30),
            comment(1, 0, 10),
            comment(4, 3, 31),
            comment(5, 4, 32),
            comment(2, 1, 11),
        ]);
        assert_eq!(ids(&forest), vec![3, 1]);
        assert_eq!(ids(&forest[0].replies), vec![4]);
        assert_eq!(ids(&forest[0].replies[0].replies), vec![5]);
        assert_eq!(ids(&forest[1].replies), vec![2]);
        assert_eq!(count(&forest), 5);
    }

    #[test]
    fn sibling_groups_sorted_by_creation_time() {
        let forest = build_forest(vec![
            comment(1, 0, 0),
            comment(13, 1, 3),
            comment(11, 1, 1),
            comment(12, 1, 2),
        ]);
        assert_eq!(ids(&forest[0].replies), vec![11, 12, 13]);
    }

    #[test]
    fn orphan_becomes_root() {
        let forest = build_forest(vec![comment(1, 0, 0), comment(2, 999, 1)]);
        assert_eq!(ids(&forest), vec![1, 2]);
    }

    #[test]
    fn self_parent_becomes_root() {
        let forest = build_forest(vec![comment(7, 7, 0)]);
        assert_eq!(ids(&forest), vec![7]);
        assert!(forest[0].replies.is_empty());
    }

    #[test]
    fn parent_loop_is_cut_and_nothing_is_lost() {
        let forest = build_forest(vec![
            comment(1, 0, 0),
            comment(2, 3, 1),
            comment(3, 2, 2),
            comment(4, 3, 3),
        ]);
        assert_eq!(count(&forest), 4);
        assert_eq!(ids(&forest), vec![1, 2]);
        assert_eq!(ids(&forest[1].replies), vec![3]);
        assert_eq!(ids(&forest[1].replies[0].replies), vec![4]);
    }

    #[test]
    fn stale_replies_on_input_are_reset() {
        let mut parent = comment(1, 0, 0);
        parent.replies = vec![comment(99, 1, 5)];
        let forest = build_forest(vec![parent, comment(2, 1, 1)]);
        assert_eq!(ids(&forest[0].replies), vec![2]);
    }

    #[test]
    fn flatten_then_rebuild_is_isomorphic() {
        let forest = build_forest(vec![
            comment(10, 0, 50),
            comment(20, 0, 40),
            comment(11, 10, 51),
            comment(12, 10, 52),
            comment(13, 11, 53),
            comment(21, 20, 41),
            comment(22, 21, 42),
        ]);
        let rebuilt = build_forest(flatten(&forest));
        assert_eq!(shape(&rebuilt), shape(&forest));
        assert_eq!(rebuilt, forest);
    }

    #[test]
    fn edits_reach_any_depth() {
        let mut forest = build_forest(vec![
            comment(1, 0, 0),
            comment(2, 1, 1),
            comment(3, 2, 2),
            comment(4, 3, 3),
        ]);

        assert!(insert_under(&mut forest, 4, comment(-5, 4, 4)));
        assert_eq!(find(&forest, -5).map(|c| c.parent_id), Some(4));

        assert!(replace(&mut forest, -5, |old| Comment {
            id: 5,
            ..old
        }));
        assert!(find(&forest, -5).is_none());
        assert!(find(&forest, 5).is_some());

        let removed = remove(&mut forest, 5).unwrap();
        assert_eq!(removed.id, 5);
        assert_eq!(count(&forest), 4);
    }

    #[test]
    fn missing_targets_leave_forest_untouched() {
        let mut forest = build_forest(vec![comment(1, 0, 0)]);
        let before = forest.clone();
        assert!(!insert_under(&mut forest, 42, comment(-1, 42, 1)));
        assert!(!replace(&mut forest, 42, |c| c));
        assert!(remove(&mut forest, 42).is_none());
        assert_eq!(forest, before);
    }
}
