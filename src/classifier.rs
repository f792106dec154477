//! Scope checks and canonical forms for discovered links.

use std::fmt;
use url::Url;

/// An absolute http(s) URL with its fragment removed.
///
/// Two links that point at the same page (modulo `#anchor`) share one canonical
/// form, which is what the traversal deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalUrl(Url);

impl CanonicalUrl {
    pub fn new(mut url: Url) -> Self {
        url.set_fragment(None);
        Self(url)
    }

    pub fn parse(input: &str) -> Result<Self, url::ParseError> {
        Url::parse(input).map(Self::new)
    }

    pub fn as_url(&self) -> &Url {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for CanonicalUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unresolvable,
    Scheme,
    OtherHost,
    Fragment,
    Extension,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub canonical: Option<CanonicalUrl>,
    pub rejection: Option<Rejection>,
}

impl Classification {
    pub fn in_scope(&self) -> bool {
        self.rejection.is_none()
    }

    /// The canonical form, only for in-scope links.
    pub fn accepted(self) -> Option<CanonicalUrl> {
        match self.rejection {
            None => self.canonical,
            Some(_) => None,
        }
    }

    fn reject(canonical: Option<CanonicalUrl>, reason: Rejection) -> Self {
        Self {
            canonical,
            rejection: Some(reason),
        }
    }
}

/// Decides which links belong to the book being crawled.
#[derive(Debug, Clone)]
pub struct UrlClassifier {
    excluded_extensions: Vec<String>,
}

impl UrlClassifier {
    pub fn new<I, S>(excluded_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            excluded_extensions: excluded_extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    /// Classifies `candidate` as found on page `base` of the site rooted at `site`.
    ///
    /// The rules are applied in order: resolve, same host, not a pure fragment of the
    /// current page, not an excluded file type. The function is pure.
    pub fn classify(&self, candidate: &str, base: &Url, site: &Url) -> Classification {
        let candidate = candidate.trim();
        let resolved = match base.join(candidate) {
            Ok(url) => url,
            Err(_) => return Classification::reject(None, Rejection::Unresolvable),
        };

        if !matches!(resolved.scheme(), "http" | "https") {
            return Classification::reject(None, Rejection::Scheme);
        }

        let canonical = CanonicalUrl::new(resolved);

        if !same_host(canonical.as_url(), site) {
            return Classification::reject(Some(canonical), Rejection::OtherHost);
        }

        if candidate.starts_with('#') || canonical == CanonicalUrl::new(base.clone()) {
            return Classification::reject(Some(canonical), Rejection::Fragment);
        }

        if self.has_excluded_extension(canonical.as_url()) {
            return Classification::reject(Some(canonical), Rejection::Extension);
        }

        Classification {
            canonical: Some(canonical),
            rejection: None,
        }
    }

    fn has_excluded_extension(&self, url: &Url) -> bool {
        let last = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("");
        match last.rsplit_once('.') {
            Some((_, ext)) if !ext.is_empty() => {
                let ext = ext.to_ascii_lowercase();
                self.excluded_extensions.iter().any(|e| *e == ext)
            }
            _ => false,
        }
    }
}

fn same_host(url: &Url, site: &Url) -> bool {
    let host = |u: &Url| u.host_str().map(|h| h.to_ascii_lowercase());
    host(url) == host(site) && url.port_or_known_default() == site.port_or_known_default()
}
