//! At-most-once resolution of stylesheets and images referenced by pages.
//!
//! Every distinct origin URL is resolved once per run, no matter how many pages
//! reference it or how many workers ask concurrently. Images are persisted in a
//! content-addressed cache directory that is reused across runs.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::extractor::{rewrite_attr, ImageRef, SrcsetRef};
use crate::fetcher::Fetcher;

/// Extension used when neither the URL nor the response tells us the image type.
pub const FALLBACK_IMAGE_EXTENSION: &str = "img";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    Stylesheet,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Stylesheet text, inlined into the composite document
    Embedded(Arc<str>),
    /// Image downloaded into the asset cache
    Local(PathBuf),
    /// Image that could not be downloaded; the page keeps pointing at the origin
    Remote(Url),
    /// Stylesheet that could not be downloaded and is left out
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRef {
    pub origin: Url,
    pub kind: AssetKind,
    pub location: Location,
}

impl AssetRef {
    /// Value to put in an `src` attribute for this asset.
    pub fn reference(&self) -> String {
        match &self.location {
            Location::Local(path) => Url::from_file_path(path)
                .map(|url| url.to_string())
                .unwrap_or_else(|_| path.display().to_string()),
            _ => self.origin.to_string(),
        }
    }

    pub fn stylesheet_text(&self) -> Option<&str> {
        match &self.location {
            Location::Embedded(text) => Some(&**text),
            _ => None,
        }
    }
}

type Slot = Arc<OnceCell<AssetRef>>;

pub struct AssetResolver {
    fetcher: Arc<dyn Fetcher>,
    assets_dir: PathBuf,
    slots: Mutex<HashMap<(AssetKind, Url), Slot>>,
    remote_fallbacks: AtomicUsize,
}

impl AssetResolver {
    pub fn new(fetcher: Arc<dyn Fetcher>, assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            assets_dir: assets_dir.into(),
            slots: Mutex::new(HashMap::new()),
            remote_fallbacks: AtomicUsize::new(0),
        }
    }

    pub async fn stylesheet(&self, url: &Url) -> AssetRef {
        let slot = self.slot(AssetKind::Stylesheet, url);
        let asset = slot.get_or_init(|| self.fetch_stylesheet(url)).await.clone();
        asset
    }

    pub async fn image(&self, url: &Url) -> AssetRef {
        let slot = self.slot(AssetKind::Image, url);
        let asset = slot.get_or_init(|| self.fetch_image(url)).await.clone();
        asset
    }

    /// Resolves the images of one content region and rewrites their `src` and
    /// `srcset` attributes.
    pub async fn localize_images(
        &self,
        body: &str,
        images: &[ImageRef],
        srcsets: &[SrcsetRef],
    ) -> String {
        let mut body = body.to_string();
        for image in images {
            let resolved = self.image(&image.url).await;
            body = rewrite_attr(&body, "src", &image.raw_src, &resolved.reference());
        }
        for srcset in srcsets {
            let mut candidates = Vec::with_capacity(srcset.candidates.len());
            for candidate in &srcset.candidates {
                let location = match &candidate.url {
                    Some(url) => self.image(url).await.reference(),
                    None => candidate.raw_url.clone(),
                };
                candidates.push(if candidate.descriptor.is_empty() {
                    location
                } else {
                    format!("{} {}", location, candidate.descriptor)
                });
            }
            body = rewrite_attr(&body, "srcset", &srcset.raw, &candidates.join(", "));
        }
        body
    }

    /// Number of distinct images that fell back to their remote URL.
    pub fn remote_fallbacks(&self) -> usize {
        self.remote_fallbacks.load(Ordering::Relaxed)
    }

    fn slot(&self, kind: AssetKind, url: &Url) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        slots.entry((kind, url.clone())).or_default().clone()
    }

    async fn fetch_stylesheet(&self, url: &Url) -> AssetRef {
        let location = match self.fetcher.fetch(url).await {
            Ok(fetched) => {
                debug!("Stylesheet {} resolved ({} bytes)", url, fetched.bytes.len());
                Location::Embedded(String::from_utf8_lossy(&fetched.bytes).into_owned().into())
            }
            Err(e) => {
                warn!("Skipping stylesheet: {}", e);
                Location::Unavailable
            }
        };
        AssetRef {
            origin: url.clone(),
            kind: AssetKind::Stylesheet,
            location,
        }
    }

    async fn fetch_image(&self, url: &Url) -> AssetRef {
        let location = match self.download_image(url).await {
            Ok(path) => Location::Local(path),
            Err(reason) => {
                warn!("Keeping remote image {}: {}", url, reason);
                self.remote_fallbacks.fetch_add(1, Ordering::Relaxed);
                Location::Remote(url.clone())
            }
        };
        AssetRef {
            origin: url.clone(),
            kind: AssetKind::Image,
            location,
        }
    }

    async fn download_image(&self, url: &Url) -> Result<PathBuf, String> {
        let stem = url_hash(url);
        let url_extension = extension_from_url(url);

        if let Some(path) = self.cached_image(&stem, url_extension.as_deref()).await {
            debug!("Reusing cached image {} for {}", path.display(), url);
            return Ok(path);
        }

        let fetched = self.fetcher.fetch(url).await.map_err(|e| e.to_string())?;
        let extension = url_extension
            .or_else(|| fetched.content_type.as_deref().and_then(extension_from_media_type))
            .unwrap_or_else(|| FALLBACK_IMAGE_EXTENSION.to_string());

        fs::create_dir_all(&self.assets_dir)
            .await
            .map_err(|e| format!("failed to create {}: {}", self.assets_dir.display(), e))?;
        let path = self.assets_dir.join(format!("{}.{}", stem, extension));

        // Only complete files ever appear under the final name
        let partial = tempfile::Builder::new()
            .prefix(".partial-")
            .tempfile_in(&self.assets_dir)
            .map_err(|e| format!("failed to create a file in {}: {}", self.assets_dir.display(), e))?;
        fs::write(partial.path(), &fetched.bytes)
            .await
            .map_err(|e| format!("failed to write {}: {}", partial.path().display(), e))?;
        partial
            .persist(&path)
            .map_err(|e| format!("failed to move image into {}: {}", path.display(), e.error))?;

        fs::canonicalize(&path)
            .await
            .map_err(|e| format!("failed to resolve {}: {}", path.display(), e))
    }

    async fn cached_image(&self, stem: &str, extension: Option<&str>) -> Option<PathBuf> {
        if let Some(extension) = extension {
            let path = self.assets_dir.join(format!("{}.{}", stem, extension));
            return usable_file(&path).await;
        }

        let mut entries = fs::read_dir(&self.assets_dir).await.ok()?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) == Some(stem) {
                if let Some(path) = usable_file(&path).await {
                    return Some(path);
                }
            }
        }
        None
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }
}

/// Canonical path of `path` when it is a non-empty regular file.
async fn usable_file(path: &Path) -> Option<PathBuf> {
    match fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => fs::canonicalize(path).await.ok(),
        _ => None,
    }
}

/// Stable file stem for an asset URL.
pub fn url_hash(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    hex::encode(&digest[..8])
}

fn extension_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    let known = ["png", "jpg", "jpeg", "gif", "svg", "webp", "bmp", "ico", "avif", "tif", "tiff"];
    known.contains(&ext.as_str()).then_some(ext)
}

fn extension_from_media_type(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
    let ext = match essence.as_str() {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/avif" => "avif",
        "image/x-icon" | "image/vnd.microsoft.icon" => "ico",
        _ => return None,
    };
    Some(ext.to_string())
}
