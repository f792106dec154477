//! Merge-then-render assembly: every content unit goes into one composite HTML
//! document which is rendered once.

use colored::*;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::assets::AssetResolver;
use crate::config::PageGeometry;
use crate::error::{Error, Result};
use crate::renderer::{DocumentRenderer, HeaderFooter};
use crate::traversal::{ContentUnit, Crawl};

const COMPOSITE_FILE: &str = "composite.html";

const RENDER_HINT: &str = "make sure the selected renderer is installed and can read local files, \
                           or retry with --strategy render-then-merge";

const PRINT_CSS: &str = r#"
    body {
        font-family: "Arial", sans-serif;
        font-size: 11pt;
        line-height: 1.6;
        max-width: 100%;
    }
    h1 { font-size: 20pt; color: #333; margin-top: 2em; }
    h2 { font-size: 16pt; color: #444; margin-top: 1.5em; }
    h3 { font-size: 14pt; color: #555; }
    img { max-width: 100%; height: auto; margin: 1em 0; }
    code {
        font-family: "Consolas", monospace;
        background-color: #f5f5f5;
        padding: 2px 4px;
        border-radius: 3px;
    }
    pre {
        background-color: #f5f5f5;
        padding: 1em;
        border-radius: 5px;
        overflow-x: auto;
        font-size: 10pt;
    }
    table { width: 100%; border-collapse: collapse; margin: 1em 0; }
    th, td { border: 1px solid #ddd; padding: 8px; text-align: left; }
    th { background-color: #f5f5f5; }
    a { color: #0366d6; text-decoration: none; }
    blockquote { border-left: 4px solid #ddd; margin: 1em 0; padding-left: 1em; color: #666; }
    .page-break { page-break-before: always; break-before: page; }
    .cover-title { font-size: 32pt; margin-top: 30%; text-align: center; }
    .generation-date { text-align: center; color: #666; }
"#;

pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Builds the composite document: styles, title page, then one page-break
/// delimited section per unit in `order_index` order.
pub fn build_composite(
    title: &str,
    date: &str,
    stylesheets: &[&str],
    units: &[ContentUnit],
) -> String {
    let title = escape_html(title);

    let mut sections = String::new();
    let mut ordered: Vec<&ContentUnit> = units.iter().collect();
    ordered.sort_by_key(|unit| unit.order_index);
    for unit in ordered {
        sections.push_str("<div class=\"page-break\"></div>\n");
        sections.push_str(&format!("<h1>{}</h1>\n", escape_html(&unit.title)));
        if let Some(body) = &unit.body {
            sections.push_str(body);
            sections.push('\n');
        }
    }

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<title>{title}</title>
<style>
{stylesheets}
{print_css}
</style>
</head>
<body>
<h1 class="cover-title">{title}</h1>
<div class="generation-date">Generated on {date}</div>
{sections}</body>
</html>
"#,
        title = title,
        stylesheets = stylesheets.join("\n"),
        print_css = PRINT_CSS,
        date = escape_html(date),
        sections = sections,
    )
}

/// Removes the intermediate document however assembly ends.
struct Intermediate(PathBuf);

impl Drop for Intermediate {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!("Removed {}", self.0.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.0.display(), e),
        }
    }
}

fn with_hint(error: Error) -> Error {
    match error {
        Error::Render { target, message } => Error::Render {
            target,
            message: format!("{}\n  hint: {}", message, RENDER_HINT),
        },
        other => other,
    }
}

pub struct MergeThenRender<'a> {
    pub renderer: &'a dyn DocumentRenderer,
    pub geometry: &'a PageGeometry,
    pub work_dir: &'a Path,
}

impl MergeThenRender<'_> {
    /// Renders `crawl` into `output`, returning the size of the written PDF.
    pub async fn assemble(
        &self,
        crawl: &Crawl,
        assets: &AssetResolver,
        header_footer: &HeaderFooter,
        output: &Path,
    ) -> Result<u64> {
        let mut stylesheets = Vec::new();
        for url in &crawl.stylesheets {
            stylesheets.push(assets.stylesheet(url).await);
        }
        let styles: Vec<&str> = stylesheets
            .iter()
            .filter_map(|asset| asset.stylesheet_text())
            .collect();

        info!(
            "Composing {} pages with {} stylesheets",
            crawl.units.len(),
            styles.len()
        );
        let markup = build_composite(
            &header_footer.title,
            &header_footer.date,
            &styles,
            &crawl.units,
        );

        let path = self.work_dir.join(COMPOSITE_FILE);
        fs::write(&path, markup).await?;
        let intermediate = Intermediate(path);

        let pdf = self
            .renderer
            .render_document(&intermediate.0, self.geometry, header_footer)
            .await
            .map_err(with_hint)?;
        drop(intermediate);

        if pdf.is_empty() {
            return Err(Error::render(
                output.display().to_string(),
                "renderer produced an empty document",
            ));
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        fs::write(output, &pdf).await?;
        info!("PDF written to {}", output.display().to_string().blue());
        Ok(pdf.len() as u64)
    }
}
