use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

use crate::error::{Error, Result};

/// Heading used for pages without a `<title>`.
pub const UNTITLED: &str = "Untitled";

/// An `<img>` found inside the content region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// The `src` attribute exactly as written in the page
    pub raw_src: String,
    pub url: Url,
}

/// One entry of a `srcset` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcsetCandidate {
    pub raw_url: String,
    /// `None` for inline `data:` images, which stay as they are
    pub url: Option<Url>,
    /// Width or density descriptor such as `2x`, possibly empty
    pub descriptor: String,
}

/// A `srcset` attribute of an `<img>` or `<source>` inside the content region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrcsetRef {
    /// The attribute exactly as written in the page
    pub raw: String,
    pub candidates: Vec<SrcsetCandidate>,
}

/// Everything the traversal needs from one page.
#[derive(Debug, Clone)]
pub struct Extraction {
    /// URL relative references resolve against: `<base href>` or the page URL
    pub base: Url,
    pub title: Option<String>,
    /// Outer HTML of the content region with absolute link targets, `None` when no
    /// selector matched
    pub body: Option<String>,
    pub stylesheets: Vec<Url>,
    pub images: Vec<ImageRef>,
    pub srcsets: Vec<SrcsetRef>,
    /// Raw `href` values of every anchor in the document
    pub links: Vec<String>,
}

/// Turns a decoded page into a document tree.
pub fn parse_document(text: &str, url: &Url) -> Result<Html> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    if text.trim().is_empty() {
        return Err(Error::Parse {
            url: url.to_string(),
            message: "empty document".to_string(),
        });
    }
    Ok(Html::parse_document(text))
}

pub struct ContentExtractor {
    content_selectors: Vec<Selector>,
    title: Selector,
    base: Selector,
    stylesheet: Selector,
    image: Selector,
    srcset: Selector,
    anchor: Selector,
}

impl ContentExtractor {
    /// Builds an extractor that tries `content_selectors` in order.
    pub fn new<S: AsRef<str>>(content_selectors: &[S]) -> Result<Self> {
        let content_selectors = content_selectors
            .iter()
            .map(|s| parse_selector(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            content_selectors,
            title: parse_selector("title")?,
            base: parse_selector("base[href]")?,
            stylesheet: parse_selector("link[rel~=\"stylesheet\"][href]")?,
            image: parse_selector("img[src]")?,
            srcset: parse_selector("img[srcset], source[srcset]")?,
            anchor: parse_selector("a[href]")?,
        })
    }

    pub fn extract(&self, document: &Html, page_url: &Url) -> Extraction {
        let base = document
            .select(&self.base)
            .next()
            .and_then(|element| element.value().attr("href"))
            .and_then(|href| page_url.join(href.trim()).ok())
            .unwrap_or_else(|| page_url.clone());

        let title = document
            .select(&self.title)
            .next()
            .map(|element| element.text().collect::<String>().trim().to_string())
            .filter(|title| !title.is_empty());

        let region = self
            .content_selectors
            .iter()
            .find_map(|selector| document.select(selector).next());

        let mut seen = HashSet::new();
        let stylesheets = document
            .select(&self.stylesheet)
            .filter_map(|element| element.value().attr("href"))
            .filter_map(|href| base.join(href.trim()).ok())
            .filter(|url| seen.insert(url.clone()))
            .collect();

        let images = region
            .map(|region| {
                region
                    .select(&self.image)
                    .filter_map(|element| element.value().attr("src"))
                    .filter(|src| !src.trim_start().starts_with("data:"))
                    .filter_map(|src| {
                        base.join(src.trim()).ok().map(|url| ImageRef {
                            raw_src: src.to_string(),
                            url,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let srcsets = region
            .map(|region| {
                region
                    .select(&self.srcset)
                    .filter_map(|element| element.value().attr("srcset"))
                    .map(|raw| SrcsetRef {
                        raw: raw.to_string(),
                        candidates: parse_srcset(raw, &base),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let links = document
            .select(&self.anchor)
            .filter_map(|element| element.value().attr("href"))
            .map(str::to_string)
            .collect();

        Extraction {
            body: region.map(|region| self.absolute_links(region, &base)),
            base,
            title,
            stylesheets,
            images,
            srcsets,
            links,
        }
    }

    /// Serializes the region with every relative anchor target made absolute.
    fn absolute_links(&self, region: ElementRef, base: &Url) -> String {
        let mut body = region.html();
        let mut seen = HashSet::new();
        for href in region
            .select(&self.anchor)
            .filter_map(|element| element.value().attr("href"))
        {
            let trimmed = href.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') || !seen.insert(href) {
                continue;
            }
            if let Ok(absolute) = base.join(trimmed) {
                if absolute.as_str() != href {
                    body = rewrite_attr(&body, "href", href, absolute.as_str());
                }
            }
        }
        body
    }
}

/// Splits a `srcset` value into its candidates, resolving each against `base`.
///
/// A candidate URL runs up to the next whitespace, so commas inside `data:` URLs
/// are kept.
pub fn parse_srcset(raw: &str, base: &Url) -> Vec<SrcsetCandidate> {
    let mut candidates = Vec::new();
    let mut rest = raw;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if rest.is_empty() {
            break;
        }

        let url_end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let mut raw_url = &rest[..url_end];
        rest = &rest[url_end..];

        let descriptor = if raw_url.ends_with(',') {
            raw_url = raw_url.trim_end_matches(',');
            ""
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            let descriptor = rest[..end].trim();
            rest = &rest[end..];
            descriptor
        };

        let url = if raw_url.starts_with("data:") {
            None
        } else {
            base.join(raw_url).ok()
        };
        candidates.push(SrcsetCandidate {
            raw_url: raw_url.to_string(),
            url,
            descriptor: descriptor.to_string(),
        });
    }
    candidates
}

/// Attribute escaping matching the HTML serializer used for extracted regions.
fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('\u{a0}', "&nbsp;")
        .replace('"', "&quot;")
}

/// Replaces every `name="raw"` attribute in serialized markup with `name="replacement"`.
pub fn rewrite_attr(markup: &str, name: &str, raw: &str, replacement: &str) -> String {
    let from = format!(" {}=\"{}\"", name, escape_attr(raw));
    let to = format!(" {}=\"{}\"", name, escape_attr(replacement));
    markup.replace(&from, &to)
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector).map_err(|e| {
        Error::configuration(
            format!("invalid CSS selector {:?}: {}", selector, e),
            "fix the selector in the configuration",
        )
    })
}
