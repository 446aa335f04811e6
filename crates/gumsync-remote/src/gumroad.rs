//! Gumroad product listing.

use async_trait::async_trait;
use gumsync_core::StorefrontProduct;
use serde::Deserialize;
use tracing::debug;

use crate::{join_url, send_json, ApiError, HttpClientConfig, SecretToken, Storefront};

pub const GUMROAD_API_BASE: &str = "https://api.gumroad.com/v2";

#[derive(Debug)]
pub struct GumroadClient {
    client: reqwest::Client,
    base_url: String,
    token: SecretToken,
}

#[derive(Debug, Deserialize)]
struct ProductsResponse {
    #[serde(default = "default_success")]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    products: Option<Vec<StorefrontProduct>>,
}

fn default_success() -> bool {
    true
}

impl GumroadClient {
    pub fn new(
        config: &HttpClientConfig,
        base_url: impl Into<String>,
        token: SecretToken,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            client: config.build_client()?,
            base_url: base_url.into(),
            token,
        })
    }
}

#[async_trait]
impl Storefront for GumroadClient {
    async fn list_products(&self) -> Result<Vec<StorefrontProduct>, ApiError> {
        let url = join_url(&self.base_url, "products");
        let req = self.client.get(&url).bearer_auth(self.token.expose());
        let resp: ProductsResponse = send_json(req, &url).await?;

        if !resp.success {
            return Err(ApiError::Malformed(format!(
                "storefront rejected product listing: {}",
                resp.message.as_deref().unwrap_or("no message")
            )));
        }
        let products = resp
            .products
            .ok_or_else(|| ApiError::Malformed("product listing has no products field".into()))?;
        debug!(count = products.len(), "listed storefront products");
        Ok(products)
    }
}
