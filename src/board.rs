//! Client-held board state and the optimistic mutations applied to it.
//!
//! Likes and comments change local state before the backend answers and roll
//! back if it refuses. Post create/update/delete are applied only after the
//! backend confirms them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::api::{
    Comment, Confession, ConfessionDraft, ConfessionUpdate, LikeState, Page, PageRequest,
};
use crate::comments;
use crate::data::{ConfessionService, Feed, FeedService, InteractionService, PostService};
use crate::gateway::GatewayError;

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("post {0} is not loaded")]
    UnknownPost(i64),
    #[error("post {0} is not the post currently open")]
    DetailNotLoaded(i64),
    #[error("comment must not be empty")]
    EmptyComment,
    #[error("the comment being replied to ({0}) was discarded")]
    ParentDiscarded(i64),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// A post opened with its comment forest.
#[derive(Debug, Clone, PartialEq)]
pub struct PostDetail {
    pub post: Confession,
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommentDraft {
    pub post_id: i64,
    pub content: String,
    /// `None` or `Some(0)` posts a root comment.
    pub parent_id: Option<i64>,
    pub root_id: Option<i64>,
}

impl CommentDraft {
    pub fn root(post_id: i64, content: impl Into<String>) -> Self {
        Self {
            post_id,
            content: content.into(),
            parent_id: None,
            root_id: None,
        }
    }

    pub fn reply(post_id: i64, parent_id: i64, content: impl Into<String>) -> Self {
        Self {
            post_id,
            content: content.into(),
            parent_id: Some(parent_id),
            root_id: None,
        }
    }
}

/// Source of temporary comment ids: negative, derived from the wall clock and
/// strictly decreasing, so they never meet a server id.
#[derive(Debug, Default)]
pub struct TemporaryIds {
    last: AtomicI64,
}

impl TemporaryIds {
    pub fn next(&self) -> i64 {
        let now = -Utc::now().timestamp_millis().max(1);
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if now < last { now } else { last - 1 };
            match self
                .last
                .compare_exchange(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return candidate,
                Err(seen) => last = seen,
            }
        }
    }
}

#[derive(Default)]
struct BoardState {
    feeds: HashMap<Feed, Page<Confession>>,
    detail: Option<PostDetail>,
    /// Temporary ids still waiting on the backend.
    pending: HashSet<i64>,
    /// Settled temporary ids: `Some(confirmed)` or `None` when rolled back.
    /// Entries go when their last waiter reads them or the detail reloads.
    resolved: HashMap<i64, Option<i64>>,
    /// Replies blocked on each pending temporary id.
    waiting: HashMap<i64, usize>,
}

impl BoardState {
    fn like_state(&self, post_id: i64) -> Option<LikeState> {
        self.detail
            .iter()
            .map(|detail| &detail.post)
            .chain(self.feeds.values().flat_map(|page| page.posts.iter()))
            .find(|post| post.id == post_id)
            .map(Confession::like_state)
    }

    fn posts_mut(&mut self, post_id: i64) -> impl Iterator<Item = &mut Confession> {
        self.detail
            .iter_mut()
            .map(|detail| &mut detail.post)
            .chain(self.feeds.values_mut().flat_map(|page| page.posts.iter_mut()))
            .filter(move |post| post.id == post_id)
    }

    fn set_like_state(&mut self, post_id: i64, like: LikeState) {
        for post in self.posts_mut(post_id) {
            post.set_like_state(like);
        }
    }

    fn detail_for(&mut self, post_id: i64) -> Option<&mut PostDetail> {
        self.detail
            .as_mut()
            .filter(|detail| detail.post.id == post_id)
    }

    /// The last waiter on `temp` takes its resolution with it.
    fn release_waiter(&mut self, temp: i64) {
        if let Some(count) = self.waiting.get_mut(&temp) {
            *count -= 1;
            if *count == 0 {
                self.waiting.remove(&temp);
                self.resolved.remove(&temp);
            }
        }
    }
}

pub struct Board {
    service: Arc<dyn ConfessionService>,
    state: Mutex<BoardState>,
    ids: TemporaryIds,
    settled: Notify,
    viewer: RwLock<String>,
}

impl Board {
    pub fn new(service: Arc<dyn ConfessionService>) -> Self {
        Self {
            service,
            state: Mutex::new(BoardState::default()),
            ids: TemporaryIds::default(),
            settled: Notify::new(),
            viewer: RwLock::new(String::new()),
        }
    }

    /// Name shown as the author of optimistic comments.
    pub fn set_viewer(&self, name: impl Into<String>) {
        *self.viewer.write() = name.into();
    }

    pub fn feed(&self, feed: Feed) -> Option<Page<Confession>> {
        self.state.lock().feeds.get(&feed).cloned()
    }

    pub fn detail(&self) -> Option<PostDetail> {
        self.state.lock().detail.clone()
    }

    pub fn like_state(&self, post_id: i64) -> Option<LikeState> {
        self.state.lock().like_state(post_id)
    }

    pub async fn load_feed(
        &self,
        feed: Feed,
        page: PageRequest,
    ) -> Result<Page<Confession>, BoardError> {
        let listing = self.service.list(feed, page).await?;
        debug!(%feed, posts = listing.posts.len(), "board: feed loaded");
        self.state.lock().feeds.insert(feed, listing.clone());
        Ok(listing)
    }

    /// Fetches a post and threads its comments.
    pub async fn load_detail(&self, post_id: i64) -> Result<PostDetail, BoardError> {
        let fetched = self.service.detail(post_id).await?;
        let detail = PostDetail {
            post: fetched.post,
            comments: comments::build_forest(fetched.comments),
        };
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.detail = Some(detail.clone());
        let BoardState {
            resolved, waiting, ..
        } = state;
        resolved.retain(|temp, _| waiting.contains_key(temp));
        Ok(detail)
    }

    /// Flips the viewer's like at once and undoes that flip if the backend
    /// refuses. Other toggles that landed in the meantime are kept.
    pub async fn toggle_like(&self, post_id: i64) -> Result<LikeState, BoardError> {
        let optimistic = {
            let mut state = self.state.lock();
            let optimistic = state
                .like_state(post_id)
                .ok_or(BoardError::UnknownPost(post_id))?
                .toggled();
            state.set_like_state(post_id, optimistic);
            optimistic
        };

        match self.service.toggle_like(post_id).await {
            Ok(()) => Ok(optimistic),
            Err(err) => {
                warn!(post_id, error = %err, "board: like rejected, undoing");
                let mut state = self.state.lock();
                if let Some(current) = state.like_state(post_id) {
                    state.set_like_state(post_id, current.toggled());
                }
                Err(err.into())
            }
        }
    }

    /// Shows the comment immediately under a temporary id, then swaps in the
    /// backend's copy or takes it out again.
    pub async fn submit_comment(&self, draft: CommentDraft) -> Result<Comment, BoardError> {
        let content = draft.content.trim().to_string();
        if content.is_empty() {
            return Err(BoardError::EmptyComment);
        }
        let parent = draft.parent_id.filter(|&id| id != 0);
        let temp = self.ids.next();
        let now = Utc::now();
        let mut optimistic = Comment {
            id: temp,
            post_id: draft.post_id,
            parent_id: parent.unwrap_or(0),
            root_id: 0,
            content: content.clone(),
            author: self.viewer.read().clone(),
            avatar: String::new(),
            created_at: now,
            updated_at: now,
            replies: Vec::new(),
        };

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let detail = state
                .detail_for(draft.post_id)
                .ok_or(BoardError::DetailNotLoaded(draft.post_id))?;
            let thread_root = parent.and_then(|parent_id| {
                comments::find(&detail.comments, parent_id).map(|node| match node.root_id {
                    0 => node.id,
                    root => root,
                })
            });
            optimistic.root_id = draft.root_id.or(thread_root).or(parent).unwrap_or(0);
            match parent {
                None => detail.comments.insert(0, optimistic),
                Some(parent_id) => {
                    if !comments::insert_under(&mut detail.comments, parent_id, optimistic) {
                        debug!(parent_id, "board: parent not shown, reply kept off-tree");
                    }
                }
            }
            state.pending.insert(temp);
        }

        let target = match parent {
            Some(parent_id) if parent_id < 0 => match self.confirmed_id(parent_id).await {
                Ok(confirmed) => Some(confirmed),
                Err(err) => {
                    self.discard(draft.post_id, temp);
                    return Err(err);
                }
            },
            other => other,
        };

        match self.service.comment(draft.post_id, &content, target).await {
            Ok(confirmed) => {
                self.confirm(draft.post_id, temp, &confirmed);
                Ok(confirmed)
            }
            Err(err) => {
                warn!(temp, error = %err, "board: comment rejected, removing");
                self.discard(draft.post_id, temp);
                Err(err.into())
            }
        }
    }

    /// Waits until the pending comment `temp` settles and returns its real id.
    async fn confirmed_id(&self, temp: i64) -> Result<i64, BoardError> {
        let mut registered = false;
        loop {
            let notified = self.settled.notified();
            {
                let mut state = self.state.lock();
                if let Some(outcome) = state.resolved.get(&temp).copied() {
                    if registered {
                        state.release_waiter(temp);
                    }
                    return outcome.ok_or(BoardError::ParentDiscarded(temp));
                }
                if !state.pending.contains(&temp) {
                    return Err(BoardError::ParentDiscarded(temp));
                }
                if !registered {
                    *state.waiting.entry(temp).or_default() += 1;
                    registered = true;
                }
            }
            notified.await;
        }
    }

    fn confirm(&self, post_id: i64, temp: i64, confirmed: &Comment) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(detail) = state.detail_for(post_id) {
            let replaced = comments::replace(&mut detail.comments, temp, |pending| {
                let mut node = confirmed.clone();
                let mut interim = pending.replies;
                reparent(&mut interim, temp, confirmed.id);
                interim.append(&mut node.replies);
                node.replies = interim;
                node
            });
            if !replaced {
                debug!(temp, "board: confirmed comment no longer shown");
            }
        }
        state.pending.remove(&temp);
        state.resolved.insert(temp, Some(confirmed.id));
        drop(guard);
        self.settled.notify_waiters();
    }

    fn discard(&self, post_id: i64, temp: i64) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(detail) = state.detail_for(post_id) {
            comments::remove(&mut detail.comments, temp);
        }
        state.pending.remove(&temp);
        state.resolved.insert(temp, None);
        drop(guard);
        self.settled.notify_waiters();
    }

    pub async fn create_post(&self, draft: &ConfessionDraft) -> Result<Confession, BoardError> {
        let created = self.service.create(draft).await?;
        if let Some(mine) = self.state.lock().feeds.get_mut(&Feed::Mine) {
            mine.posts.insert(0, created.clone());
            mine.total += 1;
        }
        Ok(created)
    }

    pub async fn update_post(
        &self,
        post_id: i64,
        update: &ConfessionUpdate,
    ) -> Result<Confession, BoardError> {
        let updated = self.service.update(post_id, update).await?;
        let mut state = self.state.lock();
        for post in state.posts_mut(post_id) {
            *post = updated.clone();
        }
        Ok(updated)
    }

    pub async fn delete_post(&self, post_id: i64) -> Result<(), BoardError> {
        self.service.delete(post_id).await?;
        let mut state = self.state.lock();
        for page in state.feeds.values_mut() {
            let before = page.posts.len();
            page.posts.retain(|post| post.id != post_id);
            let removed = (before - page.posts.len()) as u64;
            page.total = page.total.saturating_sub(removed);
        }
        if state.detail_for(post_id).is_some() {
            state.detail = None;
        }
        Ok(())
    }
}

fn reparent(replies: &mut [Comment], temp: i64, confirmed: i64) {
    for reply in replies {
        if reply.parent_id == temp {
            reply.parent_id = confirmed;
        }
        if reply.root_id == temp {
            reply.root_id = confirmed;
        }
        reparent(&mut reply.replies, temp, confirmed);
    }
}
