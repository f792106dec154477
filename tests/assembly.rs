mod common;

use async_trait::async_trait;
use bookbind::assets::AssetResolver;
use bookbind::classifier::CanonicalUrl;
use bookbind::composite::MergeThenRender;
use bookbind::per_page::RenderThenMerge;
use bookbind::renderer::{DocumentRenderer, HeaderFooter, PageRenderer};
use bookbind::traversal::ContentUnit;
use bookbind::{ArtifactMerger, Error, PageGeometry, Result};
use common::{fetcher, page, serve_once, traversal};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Keeps the composite markup it was asked to render.
#[derive(Default)]
struct CapturingRenderer {
    markup: Mutex<Option<String>>,
    fail: bool,
}

#[async_trait]
impl DocumentRenderer for CapturingRenderer {
    async fn render_document(
        &self,
        markup: &Path,
        _geometry: &PageGeometry,
        _header_footer: &HeaderFooter,
    ) -> Result<Vec<u8>> {
        let text = std::fs::read_to_string(markup)?;
        *self.markup.lock().unwrap() = Some(text);
        if self.fail {
            return Err(Error::render(markup.display().to_string(), "engine crashed"));
        }
        Ok(b"%PDF-1.5 composite".to_vec())
    }
}

/// Fails every page whose path is listed, prints the others.
struct SelectiveRenderer {
    failing: Vec<&'static str>,
    slow: Vec<&'static str>,
}

#[async_trait]
impl PageRenderer for SelectiveRenderer {
    async fn render_page(&self, url: &Url, _geometry: &PageGeometry) -> Result<Vec<u8>> {
        if self.slow.contains(&url.path()) {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        if self.failing.contains(&url.path()) {
            return Err(Error::render(url.as_str(), "navigation failed"));
        }
        Ok(format!("%PDF-1.5 {}", url.path()).into_bytes())
    }
}

/// Records what it was asked to merge and whether the inputs existed at that point.
#[derive(Default)]
struct RecordingMerger {
    inputs: Mutex<Vec<PathBuf>>,
    all_present: Mutex<bool>,
}

#[async_trait]
impl ArtifactMerger for RecordingMerger {
    async fn merge(&self, inputs: &[PathBuf], output: &Path) -> Result<()> {
        *self.all_present.lock().unwrap() = inputs.iter().all(|p| p.exists());
        self.inputs.lock().unwrap().extend_from_slice(inputs);
        std::fs::write(output, b"%PDF-1.5 merged")?;
        Ok(())
    }
}

fn header_footer() -> HeaderFooter {
    HeaderFooter {
        title: "Site".to_string(),
        date: "2026-10-19".to_string(),
    }
}

fn unit(index: usize, route: &str) -> ContentUnit {
    ContentUnit {
        source_url: CanonicalUrl::parse(&format!("https://docs.example.com{}", route)).unwrap(),
        title: route.to_string(),
        body: Some(format!("<main>{}</main>", route)),
        order_index: index,
    }
}

fn file_names(paths: &[PathBuf]) -> Vec<String> {
    paths
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect()
}

async fn site_with_shared_stylesheets() -> MockServer {
    let server = MockServer::start().await;
    serve_once(&server, "/a", page("A", &["/s1.css"], &["/b"])).await;
    serve_once(&server, "/b", page("B", &["/s1.css"], &["/c"])).await;
    serve_once(&server, "/c", page("C", &["/s2.css"], &[])).await;
    for (route, css) in [("/s1.css", ".s1 { color: red; }"), ("/s2.css", ".s2 { color: blue; }")] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(css))
            .expect(1)
            .mount(&server)
            .await;
    }
    server
}

#[tokio::test]
async fn composite_holds_each_stylesheet_once_and_pages_in_order() {
    let server = site_with_shared_stylesheets().await;
    let assets_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let fetcher = fetcher();
    let assets = Arc::new(AssetResolver::new(fetcher.clone(), assets_dir.path()));

    let seed = Url::parse(&format!("{}/a", server.uri())).unwrap();
    let crawl = traversal(fetcher, 100, 4)
        .with_assets(assets.clone())
        .run(&seed)
        .await
        .unwrap();

    let renderer = CapturingRenderer::default();
    let output = work.path().join("out").join("book.pdf");
    let bytes = MergeThenRender {
        renderer: &renderer,
        geometry: &PageGeometry::default(),
        work_dir: work.path(),
    }
    .assemble(&crawl, &assets, &header_footer(), &output)
    .await
    .unwrap();

    assert_eq!(bytes, std::fs::metadata(&output).unwrap().len());

    let markup = renderer.markup.lock().unwrap().clone().unwrap();
    assert_eq!(markup.matches(".s1 { color: red; }").count(), 1);
    assert_eq!(markup.matches(".s2 { color: blue; }").count(), 1);
    assert_eq!(markup.matches("<div class=\"page-break\"></div>").count(), 3);

    let a = markup.find("<h1>A</h1>").unwrap();
    let b = markup.find("<h1>B</h1>").unwrap();
    let c = markup.find("<h1>C</h1>").unwrap();
    assert!(a < b && b < c);

    assert!(!work.path().join("composite.html").exists());
}

#[tokio::test]
async fn composite_images_and_links_do_not_point_at_the_work_dir() {
    let server = MockServer::start().await;
    serve_once(
        &server,
        "/guide/",
        r#"<html><head><title>Guide</title></head><body><main>
            <img src="img/a.png" srcset="img/a.png 1x, img/a@2x.png 2x">
            <a href="setup">next</a></main></body></html>"#
            .to_string(),
    )
    .await;
    serve_once(&server, "/guide/setup", page("Setup", &[], &[])).await;
    for route in ["/guide/img/a.png", "/guide/img/a@2x.png"] {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_raw(b"\x89PNG".to_vec(), "image/png"))
            .expect(1)
            .mount(&server)
            .await;
    }

    let assets_dir = tempfile::tempdir().unwrap();
    let work = tempfile::tempdir().unwrap();
    let fetcher = fetcher();
    let assets = Arc::new(AssetResolver::new(fetcher.clone(), assets_dir.path()));
    let seed = Url::parse(&format!("{}/guide/", server.uri())).unwrap();
    let crawl = traversal(fetcher, 100, 4)
        .with_assets(assets.clone())
        .run(&seed)
        .await
        .unwrap();

    let renderer = CapturingRenderer::default();
    MergeThenRender {
        renderer: &renderer,
        geometry: &PageGeometry::default(),
        work_dir: work.path(),
    }
    .assemble(&crawl, &assets, &header_footer(), &work.path().join("book.pdf"))
    .await
    .unwrap();

    let markup = renderer.markup.lock().unwrap().clone().unwrap();
    assert!(!markup.contains("\"img/"));
    assert!(!markup.contains(" img/a@2x.png"));
    assert!(markup.contains(".png 2x\""));
    assert!(markup.contains(&format!(r#"href="{}/guide/setup""#, server.uri())));
}

#[tokio::test]
async fn composite_is_removed_when_rendering_fails() {
    let work = tempfile::tempdir().unwrap();
    let assets_dir = tempfile::tempdir().unwrap();
    let assets = AssetResolver::new(fetcher(), assets_dir.path());
    let crawl = bookbind::traversal::Crawl {
        units: vec![unit(0, "/a")],
        ..Default::default()
    };

    let renderer = CapturingRenderer {
        fail: true,
        ..Default::default()
    };
    let err = MergeThenRender {
        renderer: &renderer,
        geometry: &PageGeometry::default(),
        work_dir: work.path(),
    }
    .assemble(&crawl, &assets, &header_footer(), &work.path().join("book.pdf"))
    .await
    .unwrap_err();

    match err {
        Error::Render { message, .. } => assert!(message.contains("render-then-merge")),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(renderer.markup.lock().unwrap().is_some());
    assert!(!work.path().join("composite.html").exists());
    assert!(!work.path().join("book.pdf").exists());
}

#[tokio::test]
async fn failed_page_is_skipped_and_the_rest_merged_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let pages_dir = dir.path().join("pages");
    let output = dir.path().join("book.pdf");
    let renderer = SelectiveRenderer {
        failing: vec!["/b"],
        slow: Vec::new(),
    };
    let merger = RecordingMerger::default();

    let report = RenderThenMerge {
        renderer: &renderer,
        merger: &merger,
        geometry: &PageGeometry::default(),
        pages_dir: &pages_dir,
        concurrency: 3,
        timeout: Duration::from_secs(5),
        preserve_pages: false,
    }
    .assemble(&[unit(0, "/a"), unit(1, "/b"), unit(2, "/c")], &output)
    .await
    .unwrap();

    assert_eq!(report.rendered, 2);
    assert_eq!(report.skipped, 1);
    let inputs = merger.inputs.lock().unwrap().clone();
    assert_eq!(file_names(&inputs), vec!["0000_a.pdf", "0002_c.pdf"]);
    assert!(*merger.all_present.lock().unwrap());
    assert!(inputs.iter().all(|p| !p.exists()));
    assert!(output.exists());
}

#[tokio::test]
async fn timed_out_page_is_skipped_and_preserved_pages_stay() {
    let dir = tempfile::tempdir().unwrap();
    let pages_dir = dir.path().join("pages");
    let renderer = SelectiveRenderer {
        failing: Vec::new(),
        slow: vec!["/a"],
    };
    let merger = RecordingMerger::default();

    let report = RenderThenMerge {
        renderer: &renderer,
        merger: &merger,
        geometry: &PageGeometry::default(),
        pages_dir: &pages_dir,
        concurrency: 2,
        timeout: Duration::from_millis(100),
        preserve_pages: true,
    }
    .assemble(&[unit(0, "/a"), unit(1, "/b")], &dir.path().join("book.pdf"))
    .await
    .unwrap();

    assert_eq!(report.rendered, 1);
    assert!(pages_dir.join("0001_b.pdf").exists());
    assert!(!pages_dir.join("0000_a.pdf").exists());
}

#[tokio::test]
async fn no_rendered_page_means_no_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("book.pdf");
    let renderer = SelectiveRenderer {
        failing: vec!["/a", "/b"],
        slow: Vec::new(),
    };
    let merger = RecordingMerger::default();

    let err = RenderThenMerge {
        renderer: &renderer,
        merger: &merger,
        geometry: &PageGeometry::default(),
        pages_dir: &dir.path().join("pages"),
        concurrency: 2,
        timeout: Duration::from_secs(5),
        preserve_pages: false,
    }
    .assemble(&[unit(0, "/a"), unit(1, "/b")], &output)
    .await
    .unwrap_err();

    assert!(matches!(err, Error::NoOutput(_)));
    assert!(merger.inputs.lock().unwrap().is_empty());
    assert!(!output.exists());
}
