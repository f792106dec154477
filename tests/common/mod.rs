#![allow(dead_code)]

use bookbind::classifier::UrlClassifier;
use bookbind::extractor::ContentExtractor;
use bookbind::fetcher::{Fetcher, HttpFetcher};
use bookbind::traversal::{Traversal, TraversalOptions};
use bookbind::Config;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// A documentation page with its links inside the `main` content region.
pub fn page(title: &str, stylesheets: &[&str], links: &[&str]) -> String {
    let styles: String = stylesheets
        .iter()
        .map(|href| format!(r#"<link rel="stylesheet" href="{}">"#, href))
        .collect();
    let anchors: String = links
        .iter()
        .map(|href| format!(r#"<li><a href="{}">{}</a></li>"#, href, href))
        .collect();
    format!(
        "<html><head><title>{}</title>{}</head><body><nav>menu</nav>\
         <main><p>{} content</p><ul>{}</ul></main></body></html>",
        title, styles, title, anchors
    )
}

pub fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body, "text/html; charset=utf-8")
}

/// Serves `body` at `route`, expecting exactly one request.
pub async fn serve_once(server: &MockServer, route: &str, body: String) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(html(body))
        .expect(1)
        .mount(server)
        .await;
}

pub fn fetcher() -> Arc<dyn Fetcher> {
    Arc::new(HttpFetcher::new(Duration::from_secs(5), 0, Duration::from_millis(10)).unwrap())
}

pub fn traversal(fetcher: Arc<dyn Fetcher>, max_pages: usize, concurrency: usize) -> Traversal {
    let config = Config::default();
    Traversal::new(
        fetcher,
        ContentExtractor::new(config.content_selectors.as_slice()).unwrap(),
        UrlClassifier::new(&config.excluded_extensions),
        TraversalOptions {
            max_pages,
            concurrency,
        },
    )
}

pub fn paths(urls: impl IntoIterator<Item = String>) -> Vec<String> {
    urls.into_iter()
        .map(|url| url::Url::parse(&url).unwrap().path().to_string())
        .collect()
}
