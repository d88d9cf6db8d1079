//! Thin JSON REST client shared by the forges without an SDK.

use std::{fmt, future::Future, time::Duration};

use anyhow::{Context, Result};
use futures_util::{Stream, stream};
use http::StatusCode;
use reqwest::{Method, RequestBuilder, Response, header};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::ForgeError;

const USER_AGENT: &str = concat!("forgehook/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub enum Auth {
    None,
    Bearer(String),
    Basic { user: String, password: String },
    /// Gitea style `Authorization: token <t>`.
    Token(String),
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Bearer(_) => f.write_str("Bearer(<redacted>)"),
            Auth::Basic { user, .. } => write!(f, "Basic({user}, <redacted>)"),
            Auth::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base: String,
    auth: Auth,
}

impl RestClient {
    pub fn new(base: &str, auth: Auth) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { http, base: base.trim_end_matches('/').to_string(), auth })
    }

    pub fn base(&self) -> &str { &self.base }

    /// `path` may be absolute (`http...`) or relative to the base URL.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base, path.trim_start_matches('/'))
        }
    }

    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.auth {
            Auth::None => builder,
            Auth::Bearer(token) => builder.bearer_auth(token),
            Auth::Basic { user, password } => builder.basic_auth(user, Some(password)),
            Auth::Token(token) => builder.header(header::AUTHORIZATION, format!("token {token}")),
        }
    }

    pub async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder.send().await.context("HTTP request failed")?;
        check_status(response).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(self.request(Method::GET, path)).await?;
        response.json().await.with_context(|| format!("Failed to decode response from {path}"))
    }

    pub async fn get_text(&self, path: &str) -> Result<String> {
        let response = self.send(self.request(Method::GET, path)).await?;
        response.text().await.with_context(|| format!("Failed to read response from {path}"))
    }

    pub async fn get_bytes(&self, path: &str) -> Result<Vec<u8>> {
        let response = self.send(self.request(Method::GET, path)).await?;
        let bytes =
            response.bytes().await.with_context(|| format!("Failed to read response from {path}"))?;
        Ok(bytes.to_vec())
    }

    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Response> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    pub async fn patch_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        content_type: &str,
    ) -> Result<Response> {
        let body = serde_json::to_vec(body).context("Failed to encode request body")?;
        self.send(
            self.request(Method::PATCH, path).header(header::CONTENT_TYPE, content_type).body(body),
        )
        .await
    }
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().clone();
    let message = response.text().await.unwrap_or_default();
    let err = match status {
        StatusCode::NOT_FOUND => ForgeError::NotFound(url.path().to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ForgeError::Unauthorized(format!("{status} on {}", url.path()))
        }
        _ => ForgeError::Api { status, message },
    };
    Err(err.into())
}

/// One page of a paginated listing. `next` is the cursor for the following
/// page, if the forge advertised one.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<u64>,
}

/// Stream of pages starting at `start`. Ends when the forge reports no next
/// page or a page comes back shorter than `limit`.
pub fn paginate<T, F, Fut>(limit: usize, start: u64, fetch: F) -> impl Stream<Item = Result<Vec<T>>>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    stream::try_unfold((Some(start), fetch), move |(cursor, mut fetch)| async move {
        let Some(cursor) = cursor else {
            return Ok(None);
        };
        let page = fetch(cursor).await?;
        let next = if page.items.len() < limit { None } else { page.next };
        Ok(Some((page.items, (next, fetch))))
    })
}
