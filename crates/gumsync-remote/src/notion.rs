//! Notion client: database search, paginated row queries and page create/update.

use async_trait::async_trait;
use gumsync_core::{Decimal, Entry, FALLBACK_COVER_URL};
use reqwest::Method;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info_span, Instrument};

use crate::{join_url, send_json, ApiError, HttpClientConfig, KnowledgeBase, SecretToken};

pub const NOTION_API_BASE: &str = "https://api.notion.com/v1";
pub const NOTION_VERSION: &str = "2022-02-22";

const QUERY_PAGE_SIZE: u32 = 100;

pub const PROP_EXTERNAL_ID: &str = "id";
pub const PROP_NAME: &str = "Name";
pub const PROP_PRICE: &str = "Price";
pub const PROP_SALES_COUNT: &str = "Sales Count";
pub const PROP_REVENUE: &str = "Revenue";
pub const PROP_LINK: &str = "Link";

#[derive(Debug)]
pub struct NotionClient {
    client: reqwest::Client,
    base_url: String,
    token: SecretToken,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<PageObject>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// A database row as returned by the query endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct PageObject {
    pub id: String,
    #[serde(default)]
    pub properties: JsonValue,
    #[serde(default)]
    pub cover: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct PageRef {
    id: String,
}

impl NotionClient {
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

    fn request(&self, method: Method, path: &str) -> (String, reqwest::RequestBuilder) {
        let url = join_url(&self.base_url, path);
        let builder = self
            .client
            .request(method, &url)
            .bearer_auth(self.token.expose())
            .header("Notion-Version", NOTION_VERSION);
        (url, builder)
    }
}

#[async_trait]
impl KnowledgeBase for NotionClient {
    async fn find_database(&self, query: &str) -> Result<String, ApiError> {
        let (url, req) = self.request(Method::POST, "search");
        let body = json!({
            "query": query,
            "filter": { "value": "database", "property": "object" },
        });
        let resp: SearchResponse = send_json(req.json(&body), &url).await?;

        match resp.results.as_slice() {
            [only] => Ok(only.id.clone()),
            hits => Err(ApiError::DatabaseDiscovery {
                query: query.to_string(),
                found: hits.len(),
            }),
        }
    }

    async fn query_rows(&self, database_id: &str) -> Result<Vec<Entry>, ApiError> {
        let span = info_span!("notion_query", database_id);
        async move {
            let mut entries = Vec::new();
            let mut cursor: Option<String> = None;

            loop {
                let (url, req) =
                    self.request(Method::POST, &format!("databases/{database_id}/query"));
                let mut body = json!({ "page_size": QUERY_PAGE_SIZE });
                if let Some(c) = &cursor {
                    body["start_cursor"] = json!(c);
                }
                let page: QueryResponse = send_json(req.json(&body), &url).await?;
                debug!(rows = page.results.len(), has_more = page.has_more, "fetched row page");

                for row in &page.results {
                    entries.push(parse_page(row)?);
                }

                match (page.has_more, page.next_cursor) {
                    (true, Some(next)) => cursor = Some(next),
                    (true, None) => {
                        return Err(ApiError::Malformed(
                            "query reported has_more without next_cursor".into(),
                        ))
                    }
                    (false, _) => break,
                }
            }

            Ok::<_, ApiError>(entries)
        }
        .instrument(span)
        .await
    }

    async fn create_row(&self, database_id: &str, entry: &Entry) -> Result<String, ApiError> {
        let (url, req) = self.request(Method::POST, "pages");
        let payload = page_payload(Some(database_id), entry);
        let created: PageRef = send_json(req.json(&payload), &url).await?;
        debug!(external_id = %entry.external_id, row_id = %created.id, "created row");
        Ok(created.id)
    }

    async fn update_row(&self, row_id: &str, entry: &Entry) -> Result<String, ApiError> {
        let (url, req) = self.request(Method::PATCH, &format!("pages/{row_id}"));
        let payload = page_payload(None, entry);
        let updated: PageRef = send_json(req.json(&payload), &url).await?;
        debug!(external_id = %entry.external_id, row_id = %updated.id, "updated row");
        Ok(updated.id)
    }
}

/// Notion number properties are JSON floats; amounts are exact decimals everywhere else.
fn decimal_number(value: Decimal) -> JsonValue {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}

fn text_block(content: &str) -> JsonValue {
    json!([{ "type": "text", "text": { "content": content } }])
}

/// Build the create/update body for an entry. `database_id` is set only for creates.
pub fn page_payload(database_id: Option<&str>, entry: &Entry) -> JsonValue {
    let mut payload = json!({
        "cover": {
            "type": "external",
            "external": { "url": entry.cover_image_url },
        },
        "properties": {
            PROP_SALES_COUNT: { "type": "number", "number": entry.sales_count },
            PROP_PRICE: { "type": "number", "number": decimal_number(entry.price) },
            PROP_REVENUE: { "type": "number", "number": decimal_number(entry.revenue) },
            PROP_LINK: { "type": "url", "url": entry.link },
            PROP_EXTERNAL_ID: { "type": "rich_text", "rich_text": text_block(&entry.external_id) },
            PROP_NAME: { "type": "title", "title": text_block(&entry.name) },
        },
    });
    if let Some(id) = database_id {
        payload["parent"] = json!({ "database_id": id });
    }
    payload
}

fn property<'a>(page: &'a PageObject, name: &str) -> Result<&'a JsonValue, ApiError> {
    page.properties
        .get(name)
        .ok_or_else(|| ApiError::Malformed(format!("row {} has no {name:?} property", page.id)))
}

/// Concatenated `plain_text` of a title or rich-text property.
fn plain_text(page: &PageObject, name: &str, kind: &str) -> Result<String, ApiError> {
    let segments = property(page, name)?
        .get(kind)
        .and_then(JsonValue::as_array)
        .ok_or_else(|| {
            ApiError::Malformed(format!("row {} property {name:?} is not {kind}", page.id))
        })?;
    Ok(segments
        .iter()
        .filter_map(|s| {
            s.get("plain_text")
                .or_else(|| s.get("text").and_then(|t| t.get("content")))
                .and_then(JsonValue::as_str)
        })
        .collect())
}

fn number(page: &PageObject, name: &str) -> Result<f64, ApiError> {
    property(page, name)?
        .get("number")
        .and_then(JsonValue::as_f64)
        .ok_or_else(|| ApiError::Malformed(format!("row {} property {name:?} has no number", page.id)))
}

/// A number property read back as a currency amount, rounded to cents.
fn amount(page: &PageObject, name: &str) -> Result<Decimal, ApiError> {
    let raw = number(page, name)?;
    Decimal::try_from(raw)
        .map(|d| d.round_dp(2))
        .map_err(|_| ApiError::Malformed(format!("row {} property {name:?} is not an amount: {raw}", page.id)))
}

fn cover_url(page: &PageObject) -> Option<String> {
    let cover = page.cover.as_ref()?;
    ["external", "file"]
        .iter()
        .find_map(|kind| cover.get(*kind)?.get("url")?.as_str())
        .filter(|url| !url.is_empty())
        .map(ToString::to_string)
}

/// Rebuild an entry from a database row.
pub fn parse_page(page: &PageObject) -> Result<Entry, ApiError> {
    let external_id = plain_text(page, PROP_EXTERNAL_ID, "rich_text")?;
    if external_id.is_empty() {
        return Err(ApiError::Malformed(format!("row {} has an empty id", page.id)));
    }

    let sales_count = number(page, PROP_SALES_COUNT)?;
    if !sales_count.is_finite() || sales_count < 0.0 {
        return Err(ApiError::Malformed(format!(
            "row {} has invalid sales count {sales_count}",
            page.id
        )));
    }

    let link = property(page, PROP_LINK)?
        .get("url")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ApiError::Malformed(format!("row {} has no link url", page.id)))?
        .to_string();

    Ok(Entry {
        external_id,
        internal_row_id: Some(page.id.clone()),
        name: plain_text(page, PROP_NAME, "title")?,
        price: amount(page, PROP_PRICE)?,
        sales_count: sales_count.round() as u64,
        revenue: amount(page, PROP_REVENUE)?,
        link,
        cover_image_url: cover_url(page).unwrap_or_else(|| FALLBACK_COVER_URL.to_string()),
    })
}
