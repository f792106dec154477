use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::page::PrintToPdfParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error};
use url::Url;

use crate::composite::escape_html;
use crate::config::PageGeometry;
use crate::error::{Error, Result};

/// Running header and footer of the composite document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderFooter {
    pub title: String,
    pub date: String,
}

impl HeaderFooter {
    fn header_template(&self) -> String {
        format!(
            r#"<div style="font-size: 9px; color: #666; width: 100%; text-align: right; padding: 0 1cm;">{}</div>"#,
            escape_html(&self.title)
        )
    }

    fn footer_template(&self) -> String {
        format!(
            r#"<div style="font-size: 10px; width: 100%; padding: 0 1cm; display: flex; justify-content: space-between;">
                <span></span><span class="pageNumber"></span>
                <span style="font-size: 9px; color: #666;">{}</span>
            </div>"#,
            escape_html(&self.date)
        )
    }
}

/// Prints a live page to a standalone PDF.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render_page(&self, url: &Url, geometry: &PageGeometry) -> Result<Vec<u8>>;
}

/// Renders a local HTML document, with running header and footer, to a PDF.
#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render_document(
        &self,
        markup: &Path,
        geometry: &PageGeometry,
        header_footer: &HeaderFooter,
    ) -> Result<Vec<u8>>;
}

const PREPARE_PAGE_JS: &str = r#"
    (() => {
        // Expand collapsed sections so their content is printed
        const toExpand = document.querySelectorAll([
            'div[aria-controls^="expandable-body-"]',
            'details:not([open]) > summary',
        ].join(', '));
        for (const element of toExpand) {
            element.click();
        }

        // Interactive chrome that only clutters a printout
        const toRemove = document.querySelectorAll([
            'header + div[data-rnwrdesktop-hidden="true"]',
            'div[aria-label^="Search"]',
            'div[aria-label="Page actions"]',
            '.DocSearch',
        ].join(', '));
        for (const element of toRemove) {
            element.remove();
        }

        // Relative timestamps become absolute ones
        const lastModified = document.querySelector('div[dir="auto"] > span[aria-label]');
        if (lastModified) {
            lastModified.innerText = lastModified.getAttribute('aria-label');
        }
    })()
"#;

/// Closes a tab when dropped, including when the render future is cancelled.
struct Tab(Option<Page>);

impl Drop for Tab {
    fn drop(&mut self) {
        if let Some(page) = self.0.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = page.close().await {
                        debug!("Failed to close tab: {}", e);
                    }
                });
            }
        }
    }
}

/// Renderer backed by a headless Chromium driven over the DevTools protocol.
pub struct ChromiumRenderer {
    browser: Browser,
    handler: JoinHandle<()>,
    settle: Duration,
}

impl ChromiumRenderer {
    pub async fn launch(headful: bool, settle: Duration) -> Result<Self> {
        let remediation = "install Google Chrome or Chromium, or point the CHROME environment variable at its executable";

        let mut builder = BrowserConfig::builder().window_size(1920, 1080);
        if headful {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(|e| {
            Error::configuration(format!("failed to create browser config: {}", e), remediation)
        })?;

        let (browser, mut handler) = Browser::launch(config).await.map_err(|e| {
            Error::configuration(format!("failed to launch browser: {}", e), remediation)
        })?;

        let handler = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if let Err(err) = h {
                    // Unknown CDP messages are noise, not failures
                    let err_str = err.to_string();
                    if !err_str.contains("data did not match any variant")
                        && !err_str.contains("untagged enum Message")
                    {
                        error!("Browser handler error: {}", err);
                    } else {
                        debug!("Chrome protocol message ignored: {}", err);
                    }
                }
            }
        });

        Ok(Self {
            browser,
            handler,
            settle,
        })
    }

    pub async fn close(mut self) {
        if let Err(e) = self.browser.close().await {
            debug!("Failed to close browser: {}", e);
        }
        self.handler.abort();
    }

    async fn print(&self, target: &str, params: PrintToPdfParams, prepare: bool) -> Result<Vec<u8>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .map_err(|e| Error::render(target, format!("failed to create new page: {}", e)))?;
        let tab = Tab(Some(page.clone()));

        page.goto(target)
            .await
            .map_err(|e| Error::render(target, format!("failed to navigate: {}", e)))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| Error::render(target, format!("failed to wait for navigation: {}", e)))?;

        tokio::time::sleep(self.settle).await;

        if prepare {
            page.evaluate(PREPARE_PAGE_JS)
                .await
                .map_err(|e| Error::render(target, format!("failed to prepare page: {}", e)))?;
        }

        let pdf = page
            .pdf(params)
            .await
            .map_err(|e| Error::render(target, format!("failed to generate PDF: {}", e)))?;

        drop(tab);
        Ok(pdf)
    }
}

fn print_params(geometry: &PageGeometry, header_footer: Option<&HeaderFooter>) -> PrintToPdfParams {
    PrintToPdfParams {
        scale: Some(geometry.scale),
        paper_width: Some(geometry.paper_width),
        paper_height: Some(geometry.paper_height),
        margin_top: Some(geometry.margin_top),
        margin_right: Some(geometry.margin_right),
        margin_bottom: Some(geometry.margin_bottom),
        margin_left: Some(geometry.margin_left),
        print_background: Some(true),
        display_header_footer: Some(header_footer.is_some()),
        header_template: header_footer.map(HeaderFooter::header_template),
        footer_template: header_footer.map(HeaderFooter::footer_template),
        ..Default::default()
    }
}

#[async_trait]
impl PageRenderer for ChromiumRenderer {
    async fn render_page(&self, url: &Url, geometry: &PageGeometry) -> Result<Vec<u8>> {
        self.print(url.as_str(), print_params(geometry, None), true).await
    }
}

#[async_trait]
impl DocumentRenderer for ChromiumRenderer {
    async fn render_document(
        &self,
        markup: &Path,
        geometry: &PageGeometry,
        header_footer: &HeaderFooter,
    ) -> Result<Vec<u8>> {
        let absolute = fs::canonicalize(markup).await?;
        let target = Url::from_file_path(&absolute).map_err(|_| {
            Error::render(markup.display().to_string(), "not an absolute file path")
        })?;
        self.print(target.as_str(), print_params(geometry, Some(header_footer)), false)
            .await
    }
}

/// Composite renderer shelling out to `wkhtmltopdf`.
pub struct WkhtmltopdfRenderer {
    binary: PathBuf,
}

impl WkhtmltopdfRenderer {
    /// Checks that the binary runs before any crawling starts.
    pub async fn probe(binary: impl Into<PathBuf>) -> Result<Self> {
        let binary = binary.into();
        let remediation = "install wkhtmltopdf from https://wkhtmltopdf.org/downloads.html or set wkhtmltopdf-path";

        let output = Command::new(&binary)
            .arg("--version")
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                Error::configuration(
                    format!("cannot run {}: {}", binary.display(), e),
                    remediation,
                )
            })?;
        if !output.status.success() {
            return Err(Error::configuration(
                format!("{} --version exited with {}", binary.display(), output.status),
                remediation,
            ));
        }
        debug!("Using {}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(Self { binary })
    }

    fn arguments(
        markup: &Path,
        output: &Path,
        geometry: &PageGeometry,
        header_footer: &HeaderFooter,
    ) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--quiet".into(),
            "--encoding".into(),
            "UTF-8".into(),
            "--page-width".into(),
            PageGeometry::mm(geometry.paper_width),
            "--page-height".into(),
            PageGeometry::mm(geometry.paper_height),
            "--margin-top".into(),
            PageGeometry::mm(geometry.margin_top),
            "--margin-right".into(),
            PageGeometry::mm(geometry.margin_right),
            "--margin-bottom".into(),
            PageGeometry::mm(geometry.margin_bottom),
            "--margin-left".into(),
            PageGeometry::mm(geometry.margin_left),
            "--zoom".into(),
            geometry.scale.to_string(),
            "--header-right".into(),
            header_footer.title.clone(),
            "--header-font-size".into(),
            "9".into(),
            "--header-spacing".into(),
            "10".into(),
            "--footer-center".into(),
            "[page]".into(),
            "--footer-font-size".into(),
            "10".into(),
            "--footer-right".into(),
            header_footer.date.clone(),
            "--footer-spacing".into(),
            "10".into(),
            "--enable-local-file-access".into(),
        ];
        args.push(markup.display().to_string());
        args.push(output.display().to_string());
        args
    }
}

#[async_trait]
impl DocumentRenderer for WkhtmltopdfRenderer {
    async fn render_document(
        &self,
        markup: &Path,
        geometry: &PageGeometry,
        header_footer: &HeaderFooter,
    ) -> Result<Vec<u8>> {
        let output = markup.with_extension("pdf");
        let target = markup.display().to_string();

        let result = Command::new(&self.binary)
            .args(Self::arguments(markup, &output, geometry, header_footer))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::render(&target, e))?;

        if !result.status.success() {
            let _ = fs::remove_file(&output).await;
            return Err(Error::render(
                target,
                format!(
                    "wkhtmltopdf exited with {}: {}",
                    result.status,
                    String::from_utf8_lossy(&result.stderr).trim()
                ),
            ));
        }

        let pdf = fs::read(&output).await?;
        let _ = fs::remove_file(&output).await;
        Ok(pdf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_footer() -> HeaderFooter {
        HeaderFooter {
            title: "Guide <v2>".to_string(),
            date: "2026-10-19".to_string(),
        }
    }

    #[test]
    fn print_params_follow_geometry() {
        let geometry = PageGeometry::default();
        let params = print_params(&geometry, None);
        assert_eq!(params.paper_width, Some(8.27));
        assert_eq!(params.margin_left, Some(0.98));
        assert_eq!(params.display_header_footer, Some(false));
        assert!(params.header_template.is_none());
    }

    #[test]
    fn header_and_footer_are_escaped_and_numbered() {
        let params = print_params(&PageGeometry::default(), Some(&header_footer()));
        assert_eq!(params.display_header_footer, Some(true));
        assert!(params.header_template.unwrap().contains("Guide &lt;v2&gt;"));
        let footer = params.footer_template.unwrap();
        assert!(footer.contains("pageNumber"));
        assert!(footer.contains("2026-10-19"));
    }

    #[test]
    fn wkhtmltopdf_arguments_end_with_input_and_output() {
        let args = WkhtmltopdfRenderer::arguments(
            Path::new("/tmp/run/composite.html"),
            Path::new("/tmp/run/composite.pdf"),
            &PageGeometry::default(),
            &header_footer(),
        );
        let n = args.len();
        assert_eq!(args[n - 2], "/tmp/run/composite.html");
        assert_eq!(args[n - 1], "/tmp/run/composite.pdf");
        assert!(args.windows(2).any(|w| w[0] == "--footer-center" && w[1] == "[page]"));
        assert!(args.windows(2).any(|w| w[0] == "--page-width" && w[1] == "210.1mm"));
    }

    #[tokio::test]
    async fn missing_wkhtmltopdf_is_a_configuration_error() {
        let err = WkhtmltopdfRenderer::probe("/nonexistent/wkhtmltopdf")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
