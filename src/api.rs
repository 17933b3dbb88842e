use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::info;

use crate::gateway::{ApiRequest, AuthTokens, Gateway, GatewayError};
use crate::session::TokenStore;

/// Characters escaped when a username is used as a path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub size: u32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self { page: 1, size: 10 }
    }
}

impl PageRequest {
    pub fn new(page: u32, size: u32) -> Self {
        Self { page, size }
    }

    /// The hot list is usually shown as a short top five.
    pub fn hot() -> Self {
        Self { page: 1, size: 5 }
    }

    fn apply(self, request: ApiRequest) -> ApiRequest {
        request.query("page", self.page).query("size", self.size)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub posts: Vec<T>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub pages: u64,
    #[serde(default)]
    pub current: u64,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            posts: Vec::new(),
            total: 0,
            pages: 0,
            current: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confession {
    pub id: i64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub photos: Vec<String>,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub open: bool,
    #[serde(default)]
    pub anonymous: bool,
    #[serde(default)]
    pub poster_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub create_at: String,
    #[serde(default)]
    pub update_at: String,
}

impl Confession {
    pub fn like_state(&self) -> LikeState {
        LikeState {
            liked: self.liked,
            likes: self.likes,
        }
    }

    pub fn set_like_state(&mut self, state: LikeState) {
        self.liked = state.liked;
        self.likes = state.likes;
    }
}

/// Whether the viewer likes a post, and how many people do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LikeState {
    pub liked: bool,
    pub likes: u64,
}

impl LikeState {
    /// The state after one toggle: `likes` follows `liked` by exactly one.
    pub fn toggled(self) -> Self {
        let liked = !self.liked;
        let likes = if liked {
            self.likes.saturating_add(1)
        } else {
            self.likes.saturating_sub(1)
        };
        Self { liked, likes }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfessionDraft {
    pub send_time: String,
    pub title: String,
    pub content: String,
    pub photos: Vec<String>,
    pub open: bool,
    pub anonymous: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfessionUpdate {
    pub title: String,
    pub content: String,
    pub photos: Vec<String>,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfessionDetail {
    #[serde(flatten)]
    pub post: Confession,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    #[serde(default, alias = "postId")]
    pub post_id: i64,
    /// Zero for a top-level comment.
    #[serde(default, alias = "parentId", deserialize_with = "zero_if_null")]
    pub parent_id: i64,
    #[serde(default, alias = "rootId", deserialize_with = "zero_if_null")]
    pub root_id: i64,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(alias = "createdAt", deserialize_with = "flexible_timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, alias = "updatedAt", deserialize_with = "flexible_timestamp")]
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub replies: Vec<Comment>,
}

fn zero_if_null<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i64>::deserialize(deserializer)?.unwrap_or(0))
}

/// RFC 3339, or a zone-less `YYYY-MM-DD HH:MM:SS` read as UTC.
fn flexible_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(parsed) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&raw, format).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| serde::de::Error::custom(format!("unrecognised timestamp {raw:?}")))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginData {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterData {
    pub username: String,
    pub password: String,
    pub name: String,
    pub usertype: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub usertype: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// Typed access to every backend endpoint, all routed through the gateway.
pub struct Client {
    gateway: Arc<Gateway>,
}

impl Client {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        self.gateway.tokens()
    }

    pub async fn login(&self, data: &LoginData) -> Result<(), GatewayError> {
        let request = ApiRequest::post("/users/login").json(data)?.public();
        let tokens: AuthTokens = self.gateway.send_json(request).await?;
        self.store_tokens(tokens)?;
        info!(username = %data.username, "api: logged in");
        Ok(())
    }

    /// Registers and logs straight in with the returned tokens.
    pub async fn register(&self, data: &RegisterData) -> Result<(), GatewayError> {
        let request = ApiRequest::post("/users/register").json(data)?.public();
        let tokens: AuthTokens = self.gateway.send_json(request).await?;
        self.store_tokens(tokens)?;
        info!(username = %data.username, "api: registered");
        Ok(())
    }

    pub fn logout(&self) {
        self.tokens().clear();
        info!("api: logged out");
    }

    fn store_tokens(&self, tokens: AuthTokens) -> Result<(), GatewayError> {
        let credentials = tokens.into_credentials()?;
        self.tokens()
            .replace(credentials)
            .map_err(|err| GatewayError::Decode(err.to_string()))
    }

    pub async fn create_confession(&self, draft: &ConfessionDraft) -> Result<Confession, GatewayError> {
        let request = ApiRequest::post("/confessions").json(draft)?;
        self.gateway.send_json(request).await
    }

    pub async fn my_confessions(&self, page: PageRequest) -> Result<Page<Confession>, GatewayError> {
        let request = page.apply(ApiRequest::get("/confessions/my"));
        self.gateway.send_json(request).await
    }

    pub async fn community_confessions(
        &self,
        page: PageRequest,
    ) -> Result<Page<Confession>, GatewayError> {
        let request = page.apply(ApiRequest::get("/confessions"));
        self.gateway.send_json(request).await
    }

    pub async fn hot_confessions(&self, page: PageRequest) -> Result<Page<Confession>, GatewayError> {
        let request = page.apply(ApiRequest::get("/confessions/hot"));
        self.gateway.send_json(request).await
    }

    pub async fn delete_confession(&self, id: i64) -> Result<(), GatewayError> {
        self.gateway
            .send(ApiRequest::delete(format!("/confessions/{}", id)))
            .await?;
        Ok(())
    }

    pub async fn update_confession(
        &self,
        id: i64,
        update: &ConfessionUpdate,
    ) -> Result<Confession, GatewayError> {
        let request = ApiRequest::put(format!("/confessions/{}", id)).json(update)?;
        self.gateway.send_json(request).await
    }

    /// Toggles the viewer's like. The response body is not used: the caller
    /// already holds the state it asked for.
    pub async fn toggle_like(&self, id: i64) -> Result<(), GatewayError> {
        self.gateway
            .send(ApiRequest::post(format!("/confessions/{}/like", id)))
            .await?;
        Ok(())
    }

    pub async fn confession_detail(&self, id: i64) -> Result<ConfessionDetail, GatewayError> {
        self.gateway
            .send_json(ApiRequest::get(format!("/confessions/{}", id)))
            .await
    }

    pub async fn post_comment(&self, post_id: i64, content: &str) -> Result<Comment, GatewayError> {
        let request = ApiRequest::post(format!("/confessions/{}/comments", post_id))
            .json(&serde_json::json!({ "content": content, "parentId": 0 }))?;
        self.gateway.send_json(request).await
    }

    pub async fn post_reply(&self, parent_id: i64, content: &str) -> Result<Comment, GatewayError> {
        let request = ApiRequest::post(format!("/comments/{}/replies", parent_id))
            .json(&serde_json::json!({ "content": content }))?;
        self.gateway.send_json(request).await
    }

    pub async fn me(&self) -> Result<Profile, GatewayError> {
        self.gateway.send_json(ApiRequest::get("/users/me")).await
    }

    pub async fn update_me(&self, update: &ProfileUpdate) -> Result<Profile, GatewayError> {
        let request = ApiRequest::put("/users/me").json(update)?;
        self.gateway.send_json(request).await
    }

    pub async fn profile(&self, username: &str) -> Result<Profile, GatewayError> {
        self.gateway
            .send_json(ApiRequest::get(user_path(username, "")?))
            .await
    }

    pub async fn block(&self, username: &str) -> Result<(), GatewayError> {
        self.gateway
            .send(ApiRequest::post(user_path(username, "/block")?))
            .await?;
        Ok(())
    }

    pub async fn unblock(&self, username: &str) -> Result<(), GatewayError> {
        self.gateway
            .send(ApiRequest::post(user_path(username, "/unblock")?))
            .await?;
        Ok(())
    }

    pub async fn blacklist(&self) -> Result<Vec<Profile>, GatewayError> {
        self.gateway
            .send_json(ApiRequest::get("/users/me/blacklist"))
            .await
    }
}

fn user_path(username: &str, suffix: &str) -> Result<String, GatewayError> {
    let username = username.trim();
    if username.is_empty() {
        return Err(GatewayError::InvalidRequest("username is required".into()));
    }
    Ok(format!(
        "/users/{}{}",
        utf8_percent_encode(username, SEGMENT),
        suffix
    ))
}
