//! Catalog lookup collaborator.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: i64,
    pub title: String,
    /// Unit price in minor units.
    pub unit_price: i64,
    pub publisher_id: i64,
}

#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn get_book(&self, ctx: &RequestContext, id: i64) -> Result<Book>;

    async fn batch_get_books(&self, ctx: &RequestContext, ids: &[i64]) -> Result<Vec<Book>>;
}

/// HTTP-backed catalog client. Trace context travels as a `traceparent`
/// header; a 404 maps to `ITEM_NOT_FOUND`, everything else non-2xx to a
/// dependency error.
pub struct HttpCatalogClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    async fn fetch(&self, ctx: &RequestContext, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = ctx
            .bound(async {
                self.client
                    .get(&url)
                    .header("traceparent", ctx.traceparent())
                    .send()
                    .await
                    .map_err(Error::from)
            })
            .await?;
        Ok(response)
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn get_book(&self, ctx: &RequestContext, id: i64) -> Result<Book> {
        let response = self.fetch(ctx, &format!("/api/v1/books/{id}")).await?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<Book>().await?),
            reqwest::StatusCode::NOT_FOUND => Err(Error::ItemNotFound(id)),
            status => Err(Error::Dependency(format!(
                "catalog returned {status} for book {id}"
            ))),
        }
    }

    async fn batch_get_books(&self, ctx: &RequestContext, ids: &[i64]) -> Result<Vec<Book>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let response = self.fetch(ctx, &format!("/api/v1/books?ids={joined}")).await?;

        if !response.status().is_success() {
            return Err(Error::Dependency(format!(
                "catalog returned {} for batch lookup",
                response.status()
            )));
        }
        Ok(response.json::<Vec<Book>>().await?)
    }
}
