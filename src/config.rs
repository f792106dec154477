use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// How the final PDF is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Build one composite HTML document and render it once
    #[default]
    MergeThenRender,
    /// Print every page in a headless browser and merge the PDFs
    RenderThenMerge,
}

/// Which engine renders the composite document of the merge-then-render strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Engine {
    #[default]
    Chromium,
    Wkhtmltopdf,
}

/// Paper size, margins and scale used for every rendered page. Lengths are inches.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PageGeometry {
    pub paper_width: f64,
    pub paper_height: f64,
    pub margin_top: f64,
    pub margin_right: f64,
    pub margin_bottom: f64,
    pub margin_left: f64,
    pub scale: f64,
}

impl Default for PageGeometry {
    // A4 with 2cm vertical and 2.5cm horizontal margins
    fn default() -> Self {
        Self {
            paper_width: 8.27,
            paper_height: 11.69,
            margin_top: 0.79,
            margin_right: 0.98,
            margin_bottom: 0.79,
            margin_left: 0.98,
            scale: 1.0,
        }
    }
}

impl PageGeometry {
    /// Margin in millimetres, the unit wkhtmltopdf expects.
    pub fn mm(inches: f64) -> String {
        format!("{:.1}mm", inches * 25.4)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub output: PathBuf,
    pub strategy: Strategy,
    pub renderer: Engine,
    pub max_pages: usize,
    pub concurrency: usize,
    pub request_timeout_secs: f64,
    pub render_timeout_secs: f64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub settle_delay_ms: u64,
    pub assets_dir: PathBuf,
    pub work_dir: Option<PathBuf>,
    pub preserve_pages: bool,
    pub headful: bool,
    pub content_selectors: Vec<String>,
    pub excluded_extensions: Vec<String>,
    pub wkhtmltopdf_path: PathBuf,
    pub geometry: PageGeometry,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output: PathBuf::from("book.pdf"),
            strategy: Strategy::default(),
            renderer: Engine::default(),
            max_pages: 500,
            concurrency: 4,
            request_timeout_secs: 30.0,
            render_timeout_secs: 60.0,
            max_retries: 2,
            retry_backoff_ms: 500,
            settle_delay_ms: 1000,
            assets_dir: PathBuf::from("bookbind_assets"),
            work_dir: None,
            preserve_pages: false,
            headful: false,
            content_selectors: ["article", "main", "div.page-inner"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            excluded_extensions: [
                "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "bmp", "pdf", "zip", "gz",
                "tar", "mp4", "mp3", "css", "js", "xml", "json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            wkhtmltopdf_path: PathBuf::from("wkhtmltopdf"),
            geometry: PageGeometry::default(),
        }
    }
}

impl Config {
    /// Loads a TOML configuration file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(
                format!("failed to read config file {}: {}", path.display(), e),
                "check the --config path",
            )
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| {
            Error::configuration(
                format!("invalid configuration: {}", e),
                "keys are kebab-case, e.g. max-pages = 200",
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.render_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::configuration(
                "concurrency must be at least 1",
                "pass --jobs 1 for sequential crawling",
            ));
        }
        if self.max_pages == 0 {
            return Err(Error::configuration(
                "max-pages must be at least 1",
                "raise --max-pages",
            ));
        }
        if !(self.request_timeout_secs > 0.0 && self.render_timeout_secs > 0.0) {
            return Err(Error::configuration(
                "timeouts must be positive",
                "set request-timeout-secs and render-timeout-secs above zero",
            ));
        }
        if self.content_selectors.is_empty() {
            return Err(Error::configuration(
                "no content selectors configured",
                "add at least one CSS selector such as \"main\"",
            ));
        }
        for selector in &self.content_selectors {
            if scraper::Selector::parse(selector).is_err() {
                return Err(Error::configuration(
                    format!("invalid content selector {:?}", selector),
                    "content selectors must be valid CSS selectors",
                ));
            }
        }
        Ok(())
    }
}
