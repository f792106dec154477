//! # bookbind
//!
//! A CLI utility to bind a multi-page documentation website (GitBook, Docusaurus,
//! mdBook and the like) into a single PDF.
//!
//! ## How it works
//!
//! - Every same-site page reachable from the start page is crawled once, in
//!   depth-first-on-discovery order
//! - The main content region of each page is extracted, stylesheets and images
//!   are cached locally
//! - The pages are assembled either by rendering one composite HTML document
//!   (merge-then-render) or by printing every page in a headless browser and
//!   merging the PDFs (render-then-merge)
//!
//! ## Usage
//!
//! ```bash
//! bookbind download https://docs.gitbook.com -o gitbook.pdf
//! bookbind download https://docs.gitbook.com --strategy render-then-merge
//! ```

pub mod assets;
pub mod classifier;
pub mod composite;
pub mod config;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod pdf_merger;
pub mod per_page;
pub mod pipeline;
pub mod renderer;
pub mod traversal;

pub use config::{Config, Engine, PageGeometry, Strategy};
pub use error::{Error, FetchError, Result};
pub use pdf_merger::{ArtifactMerger, PdfMerger};
pub use pipeline::{Pipeline, RunSummary};
