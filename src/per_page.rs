//! Render-then-merge assembly: every visited page is printed on its own, then the
//! per-page PDFs are merged in traversal order.

use colored::*;
use futures_util::stream::{self, StreamExt};
use slug::slugify;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::PageGeometry;
use crate::error::{Error, Result};
use crate::pdf_merger::ArtifactMerger;
use crate::renderer::PageRenderer;
use crate::traversal::ContentUnit;

/// One rendered page waiting to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageArtifact {
    pub order_index: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderReport {
    pub rendered: usize,
    pub skipped: usize,
    pub bytes: u64,
}

pub struct RenderThenMerge<'a> {
    pub renderer: &'a dyn PageRenderer,
    pub merger: &'a dyn ArtifactMerger,
    pub geometry: &'a PageGeometry,
    pub pages_dir: &'a Path,
    pub concurrency: usize,
    pub timeout: Duration,
    pub preserve_pages: bool,
}

impl RenderThenMerge<'_> {
    /// Renders every unit, skipping failures, and returns the artifacts in order.
    pub async fn render_all(&self, units: &[ContentUnit]) -> Result<Vec<PageArtifact>> {
        fs::create_dir_all(self.pages_dir).await?;

        let mut artifacts: Vec<PageArtifact> = stream::iter(units)
            .map(|unit| self.render_one(unit, units.len()))
            .buffered(self.concurrency.max(1))
            .filter_map(|artifact| async move { artifact })
            .collect()
            .await;

        artifacts.sort_by_key(|artifact| artifact.order_index);
        Ok(artifacts)
    }

    async fn render_one(&self, unit: &ContentUnit, total: usize) -> Option<PageArtifact> {
        let url = unit.source_url.as_url();
        let path = self.pages_dir.join(artifact_name(unit));

        let rendered = tokio::time::timeout(self.timeout, self.renderer.render_page(url, self.geometry))
            .await
            .unwrap_or_else(|_| {
                Err(Error::RenderTimeout {
                    target: url.to_string(),
                    seconds: self.timeout.as_secs_f64(),
                })
            });

        let pdf = match rendered {
            Ok(pdf) if !pdf.is_empty() => pdf,
            Ok(_) => {
                warn!("Skipping {}: renderer returned no data", url.to_string().yellow());
                return None;
            }
            Err(e) => {
                warn!("Skipping {}: {}", url.to_string().yellow(), e);
                return None;
            }
        };

        if let Err(e) = fs::write(&path, pdf).await {
            warn!("Skipping {}: failed to write {}: {}", url, path.display(), e);
            return None;
        }

        info!(
            "[{}/{}] Rendered \"{}\" into \"{}\"",
            unit.order_index + 1,
            total,
            url.to_string().green(),
            path.display().to_string().blue()
        );
        Some(PageArtifact {
            order_index: unit.order_index,
            path,
        })
    }

    pub async fn assemble(&self, units: &[ContentUnit], output: &Path) -> Result<RenderReport> {
        let artifacts = self.render_all(units).await?;
        if artifacts.is_empty() {
            return Err(Error::NoOutput(output.to_path_buf()));
        }

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let paths: Vec<PathBuf> = artifacts.iter().map(|a| a.path.clone()).collect();
        info!("Combining {} page PDFs into a single file...", paths.len());
        self.merger.merge(&paths, output).await?;

        if !self.preserve_pages {
            info!("Cleaning up individual page files...");
            for path in &paths {
                if let Err(e) = fs::remove_file(path).await {
                    debug!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }

        let bytes = fs::metadata(output).await?.len();
        info!("Combined PDF saved to: {}", output.display().to_string().blue());
        Ok(RenderReport {
            rendered: artifacts.len(),
            skipped: units.len() - artifacts.len(),
            bytes,
        })
    }
}

/// `0007_guide-setup.pdf`: sortable by order, readable by path.
pub fn artifact_name(unit: &ContentUnit) -> String {
    let mut slug = slugify(unit.source_url.as_url().path());
    if let Some(query) = unit.source_url.as_url().query() {
        slug = format!("{}-{}", slug, slugify(query));
    }
    let slug = slug.trim_matches('-');
    let slug = if slug.is_empty() { "index" } else { slug };
    format!("{:04}_{}.pdf", unit.order_index, slug)
}
