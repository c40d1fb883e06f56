//! DuckDuckGo search over its HTML endpoint.
//!
//! The HTML endpoint needs no API key. Result links are wrapped in a
//! `duckduckgo.com/l/?uddg=` redirect which is unwrapped here so callers
//! see the real source URL.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;

use super::{WebSearchClient, WebSearchError, WebSearchResult};
use crate::config::WebSearchSettings;
use crate::models::WebResult;

pub struct DuckDuckGoSearch {
    client: Client,
    endpoint: String,
    region: Option<String>,
}

impl DuckDuckGoSearch {
    pub fn new(settings: &WebSearchSettings) -> WebSearchResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .user_agent(settings.user_agent.as_str())
            .build()
            .map_err(|e| WebSearchError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
            region: settings.region.clone(),
        })
    }
}

#[async_trait]
impl WebSearchClient for DuckDuckGoSearch {
    async fn search(&self, query: &str, max_results: usize) -> WebSearchResult<Vec<WebResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(WebSearchError::InvalidQuery("query is empty".to_string()));
        }
        if max_results == 0 {
            return Ok(Vec::new());
        }

        let mut params = vec![("q", query)];
        if let Some(region) = self.region.as_deref() {
            params.push(("kl", region));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| WebSearchError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(WebSearchError::Unavailable("rate limited by search engine".to_string()));
        }
        if !status.is_success() {
            return Err(WebSearchError::Unavailable(format!("search engine returned {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| WebSearchError::Unavailable(e.to_string()))?;

        let results = parse_results(&body, query, max_results);
        debug!(query, hits = results.len(), "web search finished");
        Ok(results)
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}

struct ResultSelectors {
    result: Selector,
    title: Selector,
    snippet: Selector,
}

static SELECTORS: LazyLock<ResultSelectors> = LazyLock::new(|| ResultSelectors {
    result: Selector::parse("div.result").expect("result selector"),
    title: Selector::parse("a.result__a").expect("title selector"),
    snippet: Selector::parse(".result__snippet").expect("snippet selector"),
});

/// Extract up to `max_results` organic hits from a result page.
fn parse_results(html: &str, query: &str, max_results: usize) -> Vec<WebResult> {
    let selectors = &*SELECTORS;
    let document = Html::parse_document(html);

    let mut results = Vec::new();
    for block in document.select(&selectors.result) {
        if results.len() >= max_results {
            break;
        }
        if block.value().classes().any(|c| c == "result--ad") {
            continue;
        }
        let Some(anchor) = block.select(&selectors.title).next() else {
            continue;
        };
        let Some(url) = anchor.value().attr("href").and_then(resolve_href) else {
            continue;
        };
        let title = element_text(&anchor);
        if title.is_empty() {
            continue;
        }
        let snippet = block
            .select(&selectors.snippet)
            .next()
            .map(|s| element_text(&s))
            .unwrap_or_default();

        results.push(WebResult {
            query: query.to_string(),
            title,
            snippet,
            url,
            rank: results.len() + 1,
        });
    }
    results
}

/// Text of an element with inline markup flattened and whitespace collapsed.
fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Turn a result href into the target URL, unwrapping the redirect.
fn resolve_href(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let url = Url::parse(&absolute).ok()?;

    let is_redirect = url
        .host_str()
        .is_some_and(|host| host.ends_with("duckduckgo.com"))
        && url.path().starts_with("/l/");
    if is_redirect {
        return url
            .query_pairs()
            .find(|(key, _)| key == "uddg")
            .map(|(_, target)| target.into_owned());
    }

    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
    <html><body>
      <div class="result results_links result--ad">
        <h2 class="result__title"><a class="result__a" href="https://ads.example.com">Sponsored</a></h2>
        <a class="result__snippet">Buy now</a>
      </div>
      <div class="result results_links web-result">
        <h2 class="result__title">
          <a class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Farxiv.org%2Fabs%2F2006.10637&amp;rut=abc">Temporal Graph <b>Networks</b></a>
        </h2>
        <a class="result__snippet" href="#">TGN is a generic framework for deep learning on <b>dynamic graphs</b>.</a>
      </div>
      <div class="result results_links web-result">
        <h2 class="result__title"><a class="result__a" href="https://example.org/dgnn">Dynamic GNN survey</a></h2>
        <a class="result__snippet">A survey.</a>
      </div>
      <div class="result results_links web-result">
        <h2 class="result__title"><a class="result__a" href="https://example.org/third">Third</a></h2>
      </div>
    </body></html>
    "##;

    #[test]
    fn test_parses_organic_results_in_order() {
        let results = parse_results(PAGE, "dynamic gnn", 10);
        assert_eq!(results.len(), 3);

        assert_eq!(results[0].title, "Temporal Graph Networks");
        assert_eq!(results[0].url, "https://arxiv.org/abs/2006.10637");
        assert_eq!(
            results[0].snippet,
            "TGN is a generic framework for deep learning on dynamic graphs."
        );
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[0].query, "dynamic gnn");

        assert_eq!(results[1].url, "https://example.org/dgnn");
        assert_eq!(results[1].rank, 2);
        assert_eq!(results[2].snippet, "");
    }

    #[test]
    fn test_respects_max_results() {
        let results = parse_results(PAGE, "q", 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Temporal Graph Networks");
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(
            resolve_href("//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fa%3Fb%3D1").as_deref(),
            Some("https://example.com/a?b=1")
        );
        assert_eq!(resolve_href("javascript:void(0)"), None);
        assert_eq!(resolve_href("not a url"), None);
    }

    #[tokio::test]
    async fn test_blank_query_rejected() {
        let client = DuckDuckGoSearch::new(&WebSearchSettings::default()).unwrap();
        assert!(matches!(
            client.search("   ", 3).await,
            Err(WebSearchError::InvalidQuery(_))
        ));
    }
}
