// src/wall.rs
//
// Narrow contract onto the wall/post screens. The engine only ever appends
// comments and the mention path only ever reads text; everything else about
// the wall UI lives outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Post {
    pub id: String,
    pub panel: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub comments: Vec<Comment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Error)]
pub enum WallError {
    #[error("post `{0}` not found")]
    PostNotFound(String),
}

#[async_trait]
pub trait PostStore: Send + Sync {
    async fn append_post(&self, panel: &str, author: &str, text: &str) -> Post;
    async fn append_comment(&self, post_id: &str, author: &str, text: &str) -> Result<Comment, WallError>;
    async fn get(&self, post_id: &str) -> Option<Post>;
    async fn comment_count(&self, post_id: &str) -> usize;

    fn name(&self) -> &'static str;
}

pub struct InMemoryWall {
    posts: DashMap<String, Post>,
}

impl InMemoryWall {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self { posts: DashMap::new() })
    }
}

#[async_trait]
impl PostStore for InMemoryWall {
    async fn append_post(&self, panel: &str, author: &str, text: &str) -> Post {
        let post = Post {
            id: Uuid::new_v4().to_string(),
            panel: panel.to_string(),
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            comments: Vec::new(),
        };
        self.posts.insert(post.id.clone(), post.clone());
        post
    }

    async fn append_comment(&self, post_id: &str, author: &str, text: &str) -> Result<Comment, WallError> {
        let mut entry = self
            .posts
            .get_mut(post_id)
            .ok_or_else(|| WallError::PostNotFound(post_id.to_string()))?;
        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };
        entry.comments.push(comment.clone());
        Ok(comment)
    }

    async fn get(&self, post_id: &str) -> Option<Post> {
        self.posts.get(post_id).map(|e| e.value().clone())
    }

    async fn comment_count(&self, post_id: &str) -> usize {
        self.posts.get(post_id).map(|e| e.comments.len()).unwrap_or(0)
    }

    fn name(&self) -> &'static str {
        "InMemoryWall"
    }
}

/// Extract `@agent:<name>` mentions from post text. Names are
/// alphanumeric plus `_` and `-`.
pub fn mentions(text: &str) -> Vec<String> {
    const MARKER: &str = "@agent:";
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(at) = rest.find(MARKER) {
        let tail = &rest[at + MARKER.len()..];
        let name: String = tail
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        let name_len = name.len();
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
        rest = &tail[name_len..];
    }
    out
}
