//! Ad source contracts + the HTML listing source implementation.

use std::sync::Arc;
use std::time::Duration;

use admap_core::{AdLocation, ListingSummary, RawAd, SearchCriteria};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "admap-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("listing request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unparseable listing page: {0}")]
    Parse(String),
    #[error("invalid listing link {link}: {reason}")]
    Link { link: String, reason: String },
}

/// One remote classified-ad source. `search` resolves a criteria set to
/// lightweight listing summaries; `fetch_detail` upgrades a summary's link to
/// a full raw ad record.
#[async_trait]
pub trait AdSource: Send + Sync {
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<ListingSummary>, SourceError>;

    async fn fetch_detail(&self, link: &str) -> Result<RawAd, SourceError>;
}

#[derive(Debug, Clone)]
pub struct HtmlSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on concurrent detail fetches; the pipeline awaits them as
    /// a group.
    pub detail_concurrency: usize,
}

impl Default for HtmlSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.kijiji.ca".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            detail_concurrency: 8,
        }
    }
}

/// Scrapes a public listing index page and the per-ad detail pages behind it.
#[derive(Debug)]
pub struct HtmlAdSource {
    base: Url,
    client: reqwest::Client,
    detail_limit: Arc<Semaphore>,
}

impl HtmlAdSource {
    pub fn new(config: HtmlSourceConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&config.base_url)
            .with_context(|| format!("parsing source base url {}", config.base_url))?;

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            base,
            client,
            detail_limit: Arc::new(Semaphore::new(config.detail_concurrency.max(1))),
        })
    }

    fn search_url(&self, criteria: &SearchCriteria) -> Result<Url, SourceError> {
        let path = format!("b-{}/{}", criteria.category, criteria.location);
        let mut url = self.base.join(&path).map_err(|err| SourceError::Link {
            link: path,
            reason: err.to_string(),
        })?;
        url.query_pairs_mut()
            .append_pair("sort", criteria.sort.as_query_value())
            .append_pair("minResults", &criteria.min_results.to_string());
        Ok(url)
    }

    async fn fetch_page(&self, url: Url) -> Result<String, SourceError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl AdSource for HtmlAdSource {
    async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<ListingSummary>, SourceError> {
        let url = self.search_url(criteria)?;
        debug!(%url, "fetching listing index");
        let html = self.fetch_page(url).await?;
        parse_listing_summaries(&html)
    }

    async fn fetch_detail(&self, link: &str) -> Result<RawAd, SourceError> {
        let _permit = self
            .detail_limit
            .acquire()
            .await
            .expect("semaphore not closed");

        let url = self.base.join(link).map_err(|err| SourceError::Link {
            link: link.to_string(),
            reason: err.to_string(),
        })?;
        let canonical = url.to_string();
        let id = listing_id_from_href(link).ok_or_else(|| SourceError::Link {
            link: link.to_string(),
            reason: "no trailing identifier segment".to_string(),
        })?;

        debug!(%canonical, "fetching ad detail");
        let html = self.fetch_page(url).await?;
        parse_ad_detail(&html, &id, &canonical)
    }
}

/// Extract listing summaries from an index page, in document order (newest
/// first for date-sorted queries). The identifier is the link's trailing path
/// segment.
pub fn parse_listing_summaries(html: &str) -> Result<Vec<ListingSummary>, SourceError> {
    let document = Html::parse_document(html);
    let selector = parse_selector(r#"[data-testid="listing-link"]"#)?;

    let mut summaries = Vec::new();
    for node in document.select(&selector) {
        let Some(href) = node.value().attr("href") else {
            continue;
        };
        let Some(id) = listing_id_from_href(href) else {
            continue;
        };
        summaries.push(ListingSummary {
            id,
            link: href.to_string(),
        });
    }
    Ok(summaries)
}

fn listing_id_from_href(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let id = path.trim_end_matches('/').rsplit('/').next()?;
    if id.is_empty() {
        return None;
    }
    Some(id.to_string())
}

/// Parse one ad detail page into a raw ad. Structured data (JSON-LD) is the
/// primary source; visible markup fills anything the island lacks. Required
/// fields are enforced downstream by the normalizer, not here.
pub fn parse_ad_detail(html: &str, id: &str, canonical_url: &str) -> Result<RawAd, SourceError> {
    let document = Html::parse_document(html);
    let mut ad = RawAd {
        id: id.to_string(),
        title: None,
        date: None,
        image: None,
        images: Vec::new(),
        url: Some(canonical_url.to_string()),
        attributes: Default::default(),
    };

    if let Some(payload) = select_first_text(&document, r#"script[type="application/ld+json"]"#)? {
        if let Ok(value) = serde_json::from_str::<JsonValue>(&payload) {
            apply_structured_data(&mut ad, &value);
        }
    }

    if ad.title.is_none() {
        ad.title = select_first_text(&document, "h1")?;
    }
    if ad.date.is_none() {
        ad.date = select_first_attr(&document, "time[datetime]", "datetime")?
            .as_deref()
            .and_then(parse_date);
    }
    if ad.images.is_empty() {
        ad.images = select_all_attrs(&document, r#"[data-testid="gallery"] img"#, "src")?;
    }
    if ad.image.is_none() {
        ad.image = ad.images.first().cloned();
    }

    let attributes = &mut ad.attributes;
    if attributes.price.is_none() {
        attributes.price = select_first_text(&document, r#"[data-testid="ad-price"]"#)?
            .as_deref()
            .and_then(first_number);
    }
    if attributes.bedrooms.is_none() {
        attributes.bedrooms = select_first_text(&document, r#"[data-testid="unit-bedrooms"]"#)?
            .as_deref()
            .and_then(first_number);
    }
    if attributes.bathrooms.is_none() {
        attributes.bathrooms = select_first_text(&document, r#"[data-testid="unit-bathrooms"]"#)?
            .as_deref()
            .and_then(first_number);
    }
    if attributes.sqft.is_none() {
        attributes.sqft = select_first_text(&document, r#"[data-testid="unit-sqft"]"#)?
            .as_deref()
            .and_then(first_number);
    }

    let address = select_first_text(&document, r#"[itemprop="address"]"#)?;
    if address.is_some() {
        let location = attributes.location.get_or_insert_with(AdLocation::default);
        if location.map_address.is_none() {
            location.map_address = address;
        }
    }

    Ok(ad)
}

fn apply_structured_data(ad: &mut RawAd, value: &JsonValue) {
    // JSON-LD is either one object or a @graph list; take the first node that
    // looks like the ad itself.
    let nodes: Vec<&JsonValue> = match value {
        JsonValue::Array(items) => items.iter().collect(),
        other => match other.get("@graph").and_then(JsonValue::as_array) {
            Some(items) => items.iter().collect(),
            None => vec![other],
        },
    };

    for node in nodes {
        if ad.title.is_none() {
            ad.title = json_str(node, &["name"]).map(ToString::to_string);
        }
        if ad.date.is_none() {
            ad.date = json_str(node, &["datePosted"]).and_then(parse_date);
        }
        if ad.images.is_empty() {
            ad.images = match node.get("image") {
                Some(JsonValue::String(single)) => vec![single.clone()],
                Some(JsonValue::Array(many)) => many
                    .iter()
                    .filter_map(|v| v.as_str().map(ToString::to_string))
                    .collect(),
                _ => Vec::new(),
            };
        }

        let attributes = &mut ad.attributes;
        if attributes.price.is_none() {
            attributes.price = json_number(node, &["offers", "price"]);
        }
        if attributes.bedrooms.is_none() {
            attributes.bedrooms = json_number(node, &["numberOfBedrooms"]);
        }
        if attributes.bathrooms.is_none() {
            attributes.bathrooms = json_number(node, &["numberOfBathroomsTotal"]);
        }
        if attributes.sqft.is_none() {
            attributes.sqft = json_number(node, &["floorSize", "value"]);
        }

        let latitude = json_number(node, &["geo", "latitude"]);
        let longitude = json_number(node, &["geo", "longitude"]);
        let street = json_str(node, &["address", "streetAddress"]).map(ToString::to_string);
        if latitude.is_some() || longitude.is_some() || street.is_some() {
            let location = attributes.location.get_or_insert_with(AdLocation::default);
            if location.latitude.is_none() {
                location.latitude = latitude;
            }
            if location.longitude.is_none() {
                location.longitude = longitude;
            }
            if location.map_address.is_none() {
                location.map_address = street;
            }
        }
    }
}

fn parse_selector(selector: &str) -> Result<Selector, SourceError> {
    Selector::parse(selector).map_err(|err| SourceError::Parse(err.to_string()))
}

fn select_first_text(document: &Html, selector: &str) -> Result<Option<String>, SourceError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_first_attr(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Option<String>, SourceError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string())))
}

fn select_all_attrs(
    document: &Html,
    selector: &str,
    attr: &str,
) -> Result<Vec<String>, SourceError> {
    let sel = parse_selector(selector)?;
    Ok(document
        .select(&sel)
        .filter_map(|n| n.value().attr(attr))
        .filter_map(|s| text_or_none(s.to_string()))
        .collect())
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str()
}

fn json_number(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    match cur {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => first_number(s),
        _ => None,
    }
}

fn first_number(text: &str) -> Option<f64> {
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == ',' && !current.is_empty() {
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            break;
        }
    }
    current.parse::<f64>().ok()
}

fn parse_date(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
