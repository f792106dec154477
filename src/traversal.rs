//! Site traversal.
//!
//! Pages are consumed in depth-first-on-discovery order: a page's links are followed,
//! in document order, before the links of any page discovered after it. Consumption
//! is strictly sequential, which is what assigns `order_index`; fetching and
//! extraction run ahead of it on a bounded set of tokio tasks, prefetching the URLs
//! the walk is about to reach. Each canonical URL is dispatched at most once.

use colored::*;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::assets::AssetResolver;
use crate::classifier::{CanonicalUrl, UrlClassifier};
use crate::error::{Error, Result};
use crate::extractor::{parse_document, ContentExtractor, Extraction, UNTITLED};
use crate::fetcher::Fetcher;

/// Extracted title and body of one visited page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUnit {
    pub source_url: CanonicalUrl,
    pub title: String,
    /// `None` when no content region was found; the page still gets a heading
    pub body: Option<String>,
    pub order_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitStatus {
    Unvisited,
    Visited,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    pub url: CanonicalUrl,
    pub status: VisitStatus,
}

/// Result of one traversal run.
#[derive(Debug, Clone, Default)]
pub struct Crawl {
    pub units: Vec<ContentUnit>,
    /// Stylesheet origins in first-discovery order, without duplicates
    pub stylesheets: Vec<Url>,
    /// First non-empty page title in traversal order
    pub title: Option<String>,
    /// Every accepted URL in acceptance order
    pub visits: Vec<Visit>,
    /// Whether the page cap stopped the walk early
    pub capped: bool,
}

impl Crawl {
    pub fn failed(&self) -> impl Iterator<Item = &CanonicalUrl> {
        self.visits
            .iter()
            .filter(|visit| visit.status == VisitStatus::Failed)
            .map(|visit| &visit.url)
    }

    pub fn document_title(&self, seed: &Url) -> String {
        self.title
            .clone()
            .or_else(|| seed.host_str().map(str::to_string))
            .unwrap_or_else(|| "Documentation".to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TraversalOptions {
    pub max_pages: usize,
    pub concurrency: usize,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            max_pages: 500,
            concurrency: 4,
        }
    }
}

/// What a worker hands back for one page.
#[derive(Debug)]
struct PageContent {
    /// Where the page was served from once redirects were followed
    final_url: CanonicalUrl,
    /// Base the page's links resolve against
    base: Url,
    title: Option<String>,
    body: Option<String>,
    stylesheets: Vec<Url>,
    links: Vec<String>,
}

/// In-scope links of a consumed page, walked left to right.
struct Frame {
    links: Vec<CanonicalUrl>,
    cursor: usize,
}

impl Frame {
    fn next(&mut self) -> Option<CanonicalUrl> {
        let link = self.links.get(self.cursor).cloned();
        self.cursor += 1;
        link
    }

    fn remaining(&self) -> &[CanonicalUrl] {
        self.links.get(self.cursor..).unwrap_or(&[])
    }
}

/// Walks one site. All per-run state lives inside [`Traversal::run`], so a single
/// `Traversal` can serve several runs, concurrently or not.
pub struct Traversal {
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<ContentExtractor>,
    classifier: UrlClassifier,
    assets: Option<Arc<AssetResolver>>,
    options: TraversalOptions,
}

impl Traversal {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        extractor: ContentExtractor,
        classifier: UrlClassifier,
        options: TraversalOptions,
    ) -> Self {
        Self {
            fetcher,
            extractor: Arc::new(extractor),
            classifier,
            assets: None,
            options,
        }
    }

    /// Resolve stylesheets and localize images while pages are loaded.
    pub fn with_assets(mut self, assets: Arc<AssetResolver>) -> Self {
        self.assets = Some(assets);
        self
    }

    pub async fn run(&self, seed: &Url) -> Result<Crawl> {
        let seed_url = CanonicalUrl::new(seed.clone());
        let mut run = Run::new(self.options);

        run.accept(&seed_url);
        self.dispatch(&mut run, &seed_url);

        let mut stack: Vec<Frame> = Vec::new();
        let mut current = Some(seed_url);

        while let Some(url) = current.take() {
            match run.take(&url).await {
                Ok(page) => {
                    let links = self.in_scope_links(&page.links, &page.base, seed);
                    debug!("{} has {} in-scope links", url, links.len());
                    if page.final_url != url {
                        run.alias(&page.final_url);
                    }
                    run.record(&url, page);
                    stack.push(Frame { links, cursor: 0 });
                }
                Err(e) => {
                    warn!("Skipping {}: {}", url.to_string().yellow(), e);
                    run.fail(&url);
                }
            }

            current = self.next_url(&mut run, &mut stack);
            self.prefetch(&mut run, &stack);
        }

        Ok(run.finish())
    }

    /// Pops frames until an unvisited link turns up, then accepts it.
    fn next_url(&self, run: &mut Run, stack: &mut Vec<Frame>) -> Option<CanonicalUrl> {
        loop {
            let frame = stack.last_mut()?;
            let Some(link) = frame.next() else {
                stack.pop();
                continue;
            };
            if run.state.contains_key(&link) {
                continue;
            }
            if run.crawl.visits.len() >= self.options.max_pages {
                warn!(
                    "Reached the limit of {} pages, stopping traversal",
                    self.options.max_pages
                );
                run.crawl.capped = true;
                return None;
            }
            run.accept(&link);
            if !run.in_flight.contains_key(&link) {
                self.dispatch(run, &link);
            }
            return Some(link);
        }
    }

    /// Dispatches the links the walk will reach next, deepest frame first.
    fn prefetch(&self, run: &mut Run, stack: &[Frame]) {
        let window = self.options.concurrency * 2;
        let mut upcoming = Vec::new();
        let mut seen = HashSet::new();

        'frames: for frame in stack.iter().rev() {
            for link in frame.remaining() {
                if run.in_flight.len() + upcoming.len() >= window
                    || run.dispatched + upcoming.len() >= self.options.max_pages
                {
                    break 'frames;
                }
                if run.state.contains_key(link)
                    || run.in_flight.contains_key(link)
                    || !seen.insert(link)
                {
                    continue;
                }
                upcoming.push(link.clone());
            }
        }

        for link in upcoming {
            self.dispatch(run, &link);
        }
    }

    fn dispatch(&self, run: &mut Run, url: &CanonicalUrl) {
        let fetcher = self.fetcher.clone();
        let extractor = self.extractor.clone();
        let assets = self.assets.clone();
        let permits = run.permits.clone();
        let target = url.clone();

        let handle = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            load_page(fetcher.as_ref(), &extractor, assets.as_deref(), &target).await
        });
        run.in_flight.insert(url.clone(), handle);
        run.dispatched += 1;
    }

    fn in_scope_links(&self, links: &[String], base: &Url, site: &Url) -> Vec<CanonicalUrl> {
        links
            .iter()
            .filter_map(|href| self.classifier.classify(href, base, site).accepted())
            .collect()
    }
}

/// Per-run state: the visit map, the ordered output and the in-flight work.
struct Run {
    state: HashMap<CanonicalUrl, VisitStatus>,
    in_flight: HashMap<CanonicalUrl, JoinHandle<Result<PageContent>>>,
    permits: Arc<Semaphore>,
    dispatched: usize,
    seen_stylesheets: HashSet<Url>,
    crawl: Crawl,
}

impl Run {
    fn new(options: TraversalOptions) -> Self {
        Self {
            state: HashMap::new(),
            in_flight: HashMap::new(),
            permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
            dispatched: 0,
            seen_stylesheets: HashSet::new(),
            crawl: Crawl::default(),
        }
    }

    fn accept(&mut self, url: &CanonicalUrl) {
        self.state.insert(url.clone(), VisitStatus::Unvisited);
        self.crawl.visits.push(Visit {
            url: url.clone(),
            status: VisitStatus::Unvisited,
        });
        info!(
            "[{}] Visiting \"{}\"",
            self.crawl.visits.len(),
            url.to_string().green()
        );
    }

    async fn take(&mut self, url: &CanonicalUrl) -> Result<PageContent> {
        let handle = self.in_flight.remove(url).ok_or_else(|| Error::Parse {
            url: url.to_string(),
            message: "page was never dispatched".to_string(),
        })?;
        handle.await.map_err(|e| Error::Parse {
            url: url.to_string(),
            message: format!("worker stopped: {}", e),
        })?
    }

    fn set_status(&mut self, url: &CanonicalUrl, status: VisitStatus) {
        self.state.insert(url.clone(), status);
        if let Some(visit) = self.crawl.visits.iter_mut().rev().find(|v| &v.url == url) {
            visit.status = status;
        }
    }

    fn record(&mut self, url: &CanonicalUrl, page: PageContent) {
        self.set_status(url, VisitStatus::Visited);

        if self.crawl.title.is_none() {
            self.crawl.title = page.title.clone();
        }
        for stylesheet in page.stylesheets {
            if self.seen_stylesheets.insert(stylesheet.clone()) {
                self.crawl.stylesheets.push(stylesheet);
            }
        }
        if page.body.is_none() {
            debug!("No content region on {}, emitting heading only", url);
        }

        let order_index = self.crawl.units.len();
        self.crawl.units.push(ContentUnit {
            source_url: url.clone(),
            title: page.title.unwrap_or_else(|| UNTITLED.to_string()),
            body: page.body,
            order_index,
        });
    }

    /// Marks the redirect target of a visited page so it is not visited again.
    fn alias(&mut self, target: &CanonicalUrl) {
        self.state.entry(target.clone()).or_insert(VisitStatus::Visited);
    }

    fn fail(&mut self, url: &CanonicalUrl) {
        self.set_status(url, VisitStatus::Failed);
    }

    fn finish(mut self) -> Crawl {
        for (url, handle) in self.in_flight.drain() {
            debug!("Discarding prefetched {}", url);
            handle.abort();
        }
        self.crawl
    }
}

async fn load_page(
    fetcher: &dyn Fetcher,
    extractor: &ContentExtractor,
    assets: Option<&AssetResolver>,
    url: &CanonicalUrl,
) -> Result<PageContent> {
    let page = fetcher.fetch_page(url.as_url()).await?;
    let extraction = extract_page(extractor, &page.text, &page.url)?;

    let mut body = extraction.body;
    if let Some(assets) = assets {
        for stylesheet in &extraction.stylesheets {
            assets.stylesheet(stylesheet).await;
        }
        if let Some(region) = body.take() {
            body = Some(
                assets
                    .localize_images(&region, &extraction.images, &extraction.srcsets)
                    .await,
            );
        }
    }

    Ok(PageContent {
        final_url: CanonicalUrl::new(page.url),
        base: extraction.base,
        title: extraction.title,
        body,
        stylesheets: extraction.stylesheets,
        links: extraction.links,
    })
}

// The parsed tree is not `Send`, so it never lives across an await point.
fn extract_page(extractor: &ContentExtractor, text: &str, url: &Url) -> Result<Extraction> {
    let document = parse_document(text, url)?;
    Ok(extractor.extract(&document, url))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(s: &str) -> CanonicalUrl {
        CanonicalUrl::parse(s).unwrap()
    }

    #[test]
    fn frame_walks_links_in_order() {
        let mut frame = Frame {
            links: vec![canonical("https://a.test/1"), canonical("https://a.test/2")],
            cursor: 0,
        };
        assert_eq!(frame.remaining().len(), 2);
        assert_eq!(frame.next(), Some(canonical("https://a.test/1")));
        assert_eq!(frame.remaining(), &[canonical("https://a.test/2")]);
        assert_eq!(frame.next(), Some(canonical("https://a.test/2")));
        assert_eq!(frame.next(), None);
        assert!(frame.remaining().is_empty());
    }

    #[test]
    fn document_title_falls_back_to_host() {
        let seed = Url::parse("https://docs.example.com/").unwrap();
        let mut crawl = Crawl::default();
        assert_eq!(crawl.document_title(&seed), "docs.example.com");
        crawl.title = Some("Guide".to_string());
        assert_eq!(crawl.document_title(&seed), "Guide");
    }

    #[test]
    fn record_assigns_gapless_indices_and_first_title() {
        let mut run = Run::new(TraversalOptions::default());
        for (i, title) in [None, Some("First"), Some("Second")].into_iter().enumerate() {
            let url = canonical(&format!("https://a.test/{}", i));
            run.accept(&url);
            run.record(
                &url,
                PageContent {
                    final_url: url.clone(),
                    base: url.as_url().clone(),
                    title: title.map(str::to_string),
                    body: None,
                    stylesheets: vec![Url::parse("https://a.test/s.css").unwrap()],
                    links: Vec::new(),
                },
            );
        }
        let crawl = run.finish();

        let indices: Vec<_> = crawl.units.iter().map(|u| u.order_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(crawl.units[0].title, UNTITLED);
        assert_eq!(crawl.title.as_deref(), Some("First"));
        assert_eq!(crawl.stylesheets.len(), 1);
        assert!(crawl.visits.iter().all(|v| v.status == VisitStatus::Visited));
    }
}
