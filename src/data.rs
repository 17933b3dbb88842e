use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::api::{
    self, Comment, Confession, ConfessionDetail, ConfessionDraft, ConfessionUpdate, Page,
    PageRequest,
};
use crate::gateway::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feed {
    Mine,
    Community,
    Hot,
}

impl Feed {
    pub const ALL: [Feed; 3] = [Feed::Mine, Feed::Community, Feed::Hot];

    pub fn default_page(self) -> PageRequest {
        match self {
            Feed::Hot => PageRequest::hot(),
            Feed::Mine | Feed::Community => PageRequest::default(),
        }
    }
}

impl fmt::Display for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Feed::Mine => "mine",
            Feed::Community => "community",
            Feed::Hot => "hot",
        };
        f.write_str(name)
    }
}

pub fn feed_from_key(key: &str) -> Option<Feed> {
    match key {
        "mine" | "my" => Some(Feed::Mine),
        "community" | "all" => Some(Feed::Community),
        "hot" => Some(Feed::Hot),
        _ => None,
    }
}

#[async_trait]
pub trait FeedService: Send + Sync {
    async fn list(&self, feed: Feed, page: PageRequest) -> Result<Page<Confession>, GatewayError>;
    async fn detail(&self, post_id: i64) -> Result<ConfessionDetail, GatewayError>;
}

#[async_trait]
pub trait PostService: Send + Sync {
    async fn create(&self, draft: &ConfessionDraft) -> Result<Confession, GatewayError>;
    async fn update(&self, post_id: i64, update: &ConfessionUpdate)
        -> Result<Confession, GatewayError>;
    async fn delete(&self, post_id: i64) -> Result<(), GatewayError>;
}

#[async_trait]
pub trait InteractionService: Send + Sync {
    async fn toggle_like(&self, post_id: i64) -> Result<(), GatewayError>;
    /// Posts a root comment when `parent` is `None`, a reply otherwise.
    async fn comment(
        &self,
        post_id: i64,
        content: &str,
        parent: Option<i64>,
    ) -> Result<Comment, GatewayError>;
}

/// Everything the board needs from the backend.
pub trait ConfessionService: FeedService + PostService + InteractionService {}

impl<T> ConfessionService for T where T: FeedService + PostService + InteractionService {}

pub struct ApiService {
    client: Arc<api::Client>,
}

impl ApiService {
    pub fn new(client: Arc<api::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FeedService for ApiService {
    async fn list(&self, feed: Feed, page: PageRequest) -> Result<Page<Confession>, GatewayError> {
        match feed {
            Feed::Mine => self.client.my_confessions(page).await,
            Feed::Community => self.client.community_confessions(page).await,
            Feed::Hot => self.client.hot_confessions(page).await,
        }
    }

    async fn detail(&self, post_id: i64) -> Result<ConfessionDetail, GatewayError> {
        self.client.confession_detail(post_id).await
    }
}

#[async_trait]
impl PostService for ApiService {
    async fn create(&self, draft: &ConfessionDraft) -> Result<Confession, GatewayError> {
        self.client.create_confession(draft).await
    }

    async fn update(
        &self,
        post_id: i64,
        update: &ConfessionUpdate,
    ) -> Result<Confession, GatewayError> {
        self.client.update_confession(post_id, update).await
    }

    async fn delete(&self, post_id: i64) -> Result<(), GatewayError> {
        self.client.delete_confession(post_id).await
    }
}

#[async_trait]
impl InteractionService for ApiService {
    async fn toggle_like(&self, post_id: i64) -> Result<(), GatewayError> {
        self.client.toggle_like(post_id).await
    }

    async fn comment(
        &self,
        post_id: i64,
        content: &str,
        parent: Option<i64>,
    ) -> Result<Comment, GatewayError> {
        match parent {
            Some(parent_id) => self.client.post_reply(parent_id, content).await,
            None => self.client.post_comment(post_id, content).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_keys_resolve() {
        assert_eq!(feed_from_key("my"), Some(Feed::Mine));
        assert_eq!(feed_from_key("hot"), Some(Feed::Hot));
        assert_eq!(feed_from_key("best"), None);
        assert_eq!(Feed::Hot.default_page(), PageRequest::new(1, 5));
        assert_eq!(Feed::Community.to_string(), "community");
    }
}
