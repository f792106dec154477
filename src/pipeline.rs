use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info, warn};
use url::Url;

use crate::assets::AssetResolver;
use crate::classifier::UrlClassifier;
use crate::composite::MergeThenRender;
use crate::config::{Config, Engine, Strategy};
use crate::error::{Error, Result};
use crate::extractor::ContentExtractor;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::pdf_merger::PdfMerger;
use crate::per_page::RenderThenMerge;
use crate::renderer::{ChromiumRenderer, DocumentRenderer, HeaderFooter, WkhtmltopdfRenderer};
use crate::traversal::{Crawl, Traversal, TraversalOptions};

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub output: PathBuf,
    pub title: String,
    pub pages_visited: usize,
    pub pages_failed: usize,
    /// Pages that made it into the final document
    pub pages_included: usize,
    /// Images that could not be cached and still point at the site
    pub remote_images: usize,
    pub bytes: u64,
    pub capped: bool,
}

enum CompositeBackend {
    Chromium(ChromiumRenderer),
    Wkhtmltopdf(WkhtmltopdfRenderer),
}

impl CompositeBackend {
    fn renderer(&self) -> &dyn DocumentRenderer {
        match self {
            CompositeBackend::Chromium(renderer) => renderer,
            CompositeBackend::Wkhtmltopdf(renderer) => renderer,
        }
    }

    async fn close(self) {
        if let CompositeBackend::Chromium(renderer) = self {
            renderer.close().await;
        }
    }
}

pub struct Pipeline {
    config: Config,
}

impl Pipeline {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    pub async fn run(&self, seed: &str) -> Result<RunSummary> {
        self.config.validate()?;
        let seed = parse_seed(seed)?;

        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(
            self.config.request_timeout(),
            self.config.max_retries,
            Duration::from_millis(self.config.retry_backoff_ms),
        )?);

        match self.config.strategy {
            Strategy::MergeThenRender => {
                let backend = self.composite_backend().await?;
                let result = self.merge_then_render(&seed, fetcher, backend.renderer()).await;
                backend.close().await;
                result
            }
            Strategy::RenderThenMerge => {
                let renderer = self.launch_chromium().await?;
                let result = self.render_then_merge(&seed, fetcher, &renderer).await;
                renderer.close().await;
                result
            }
        }
    }

    async fn launch_chromium(&self) -> Result<ChromiumRenderer> {
        ChromiumRenderer::launch(
            self.config.headful,
            Duration::from_millis(self.config.settle_delay_ms),
        )
        .await
    }

    async fn composite_backend(&self) -> Result<CompositeBackend> {
        match self.config.renderer {
            Engine::Chromium => Ok(CompositeBackend::Chromium(self.launch_chromium().await?)),
            Engine::Wkhtmltopdf => Ok(CompositeBackend::Wkhtmltopdf(
                WkhtmltopdfRenderer::probe(&self.config.wkhtmltopdf_path).await?,
            )),
        }
    }

    fn traversal(&self, fetcher: Arc<dyn Fetcher>) -> Result<Traversal> {
        let extractor = ContentExtractor::new(self.config.content_selectors.as_slice())?;
        let classifier = UrlClassifier::new(&self.config.excluded_extensions);
        Ok(Traversal::new(
            fetcher,
            extractor,
            classifier,
            TraversalOptions {
                max_pages: self.config.max_pages,
                concurrency: self.config.concurrency,
            },
        ))
    }

    fn work_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bookbind-");
        let dir = match &self.config.work_dir {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        debug!("Working directory {}", dir.path().display());
        Ok(dir)
    }

    async fn crawl(&self, seed: &Url, traversal: Traversal) -> Result<Crawl> {
        info!("Crawling \"{}\"", seed.as_str().green());
        let crawl = traversal.run(seed).await?;

        let failed = crawl.failed().count();
        info!(
            "Visited {} pages ({} failed){}",
            crawl.visits.len(),
            failed,
            if crawl.capped { ", page limit reached" } else { "" }
        );
        if crawl.units.is_empty() {
            return Err(Error::NoOutput(self.config.output.clone()));
        }
        Ok(crawl)
    }

    async fn merge_then_render(
        &self,
        seed: &Url,
        fetcher: Arc<dyn Fetcher>,
        renderer: &dyn DocumentRenderer,
    ) -> Result<RunSummary> {
        let assets = Arc::new(AssetResolver::new(fetcher.clone(), &self.config.assets_dir));
        debug!("Image cache {}", assets.assets_dir().display());
        let traversal = self.traversal(fetcher)?.with_assets(assets.clone());
        let crawl = self.crawl(seed, traversal).await?;

        let remote_images = assets.remote_fallbacks();
        if remote_images > 0 {
            warn!(
                "{} images could not be cached and will be loaded from the site while rendering",
                remote_images
            );
        }

        let header_footer = HeaderFooter {
            title: crawl.document_title(seed),
            date: chrono::Local::now().format("%Y-%m-%d").to_string(),
        };

        let work = self.work_dir()?;
        let assembly = MergeThenRender {
            renderer,
            geometry: &self.config.geometry,
            work_dir: work.path(),
        };
        let result = assembly
            .assemble(&crawl, &assets, &header_footer, &self.config.output)
            .await;
        close_work_dir(work);
        let bytes = result?;

        Ok(self.summary(&crawl, header_footer.title, crawl.units.len(), remote_images, bytes))
    }

    async fn render_then_merge(
        &self,
        seed: &Url,
        fetcher: Arc<dyn Fetcher>,
        renderer: &ChromiumRenderer,
    ) -> Result<RunSummary> {
        let crawl = self.crawl(seed, self.traversal(fetcher)?).await?;

        let work = self.work_dir()?;
        let pages_dir = if self.config.preserve_pages {
            self.config
                .output
                .parent()
                .map(|parent| parent.join("pages"))
                .unwrap_or_else(|| PathBuf::from("pages"))
        } else {
            work.path().join("pages")
        };

        let merger = PdfMerger::new();
        let assembly = RenderThenMerge {
            renderer,
            merger: &merger,
            geometry: &self.config.geometry,
            pages_dir: &pages_dir,
            concurrency: self.config.concurrency,
            timeout: self.config.render_timeout(),
            preserve_pages: self.config.preserve_pages,
        };
        let result = assembly.assemble(&crawl.units, &self.config.output).await;
        close_work_dir(work);
        let report = result?;

        if report.skipped > 0 {
            warn!("{} pages could not be rendered and were left out", report.skipped);
        }
        Ok(self.summary(&crawl, crawl.document_title(seed), report.rendered, 0, report.bytes))
    }

    fn summary(
        &self,
        crawl: &Crawl,
        title: String,
        pages_included: usize,
        remote_images: usize,
        bytes: u64,
    ) -> RunSummary {
        RunSummary {
            output: self.config.output.clone(),
            title,
            pages_visited: crawl.visits.len(),
            pages_failed: crawl.failed().count(),
            pages_included,
            remote_images,
            bytes,
            capped: crawl.capped,
        }
    }
}

fn parse_seed(seed: &str) -> Result<Url> {
    let hint = "pass an absolute http(s) URL such as https://docs.example.com/";
    let url = Url::parse(seed)
        .map_err(|e| Error::configuration(format!("invalid seed URL {:?}: {}", seed, e), hint))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(Error::configuration(
            format!("unsupported seed URL {:?}", seed),
            hint,
        ));
    }
    Ok(url)
}

fn close_work_dir(work: TempDir) {
    let path = work.path().to_path_buf();
    if let Err(e) = work.close() {
        warn!("Failed to remove working directory {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn seed_must_be_absolute_http() {
        assert!(parse_seed("https://docs.example.com/").is_ok());
        for bad in ["docs.example.com", "file:///etc/passwd", "ftp://x.test/"] {
            assert!(
                matches!(parse_seed(bad), Err(Error::Configuration { .. })),
                "{}",
                bad
            );
        }
    }

    #[tokio::test]
    async fn missing_renderer_stops_before_crawling() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let pipeline = Pipeline::new(Config {
            renderer: Engine::Wkhtmltopdf,
            wkhtmltopdf_path: PathBuf::from("/nonexistent/wkhtmltopdf"),
            ..Config::default()
        });
        let err = pipeline.run(&format!("{}/", server.uri())).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn invalid_config_fails_before_any_work() {
        let pipeline = Pipeline::new(Config {
            max_pages: 0,
            ..Config::default()
        });
        let err = pipeline.run("https://docs.example.com/").await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
