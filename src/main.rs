use anyhow::{Context, Result};
use bookbind::{Config, Engine, PdfMerger, Pipeline, RunSummary, Strategy};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::process;
use tokio::fs;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bookbind")]
#[command(about = "CLI utility to bind a multi-page documentation website into a single PDF for offline reading")]
#[command(version)]
struct Args {
    /// Enable debug logging
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl a documentation website and bind it into a single PDF
    Download(DownloadArgs),
    /// Merge existing PDF files into a single document
    Merge {
        /// Directory containing PDF files to merge
        #[arg(short = 'd', long = "dir", default_value = "pages")]
        input_dir: PathBuf,

        /// Output file path for the merged PDF
        #[arg(short = 'o', long = "output", default_value = "merged.pdf")]
        output_file: PathBuf,
    },
}

#[derive(clap::Args)]
struct DownloadArgs {
    /// URL of the first page of the site
    url: String,

    /// Output PDF file
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// How pages are assembled into the final PDF
    #[arg(long = "strategy", value_enum)]
    strategy: Option<Strategy>,

    /// Engine used to render the composite document
    #[arg(long = "renderer", value_enum)]
    renderer: Option<Engine>,

    /// Maximum number of pages to include
    #[arg(long = "max-pages")]
    max_pages: Option<usize>,

    /// Number of pages fetched or rendered at the same time
    #[arg(short = 'j', long = "jobs")]
    jobs: Option<usize>,

    /// Request timeout in seconds
    #[arg(short = 't', long = "timeout", value_parser = parse_timeout)]
    timeout: Option<f64>,

    /// TOML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Keep the individual page PDFs next to the output (render-then-merge only)
    #[arg(short = 'p', long = "preserve-pages")]
    preserve_pages: bool,

    /// Show the browser window while rendering
    #[arg(long = "headful")]
    headful: bool,
}

impl DownloadArgs {
    /// The configuration file, or the defaults, with command-line flags applied on top.
    fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };

        if let Some(output) = &self.output {
            config.output = output.clone();
        }
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(renderer) = self.renderer {
            config.renderer = renderer;
        }
        if let Some(max_pages) = self.max_pages {
            config.max_pages = max_pages;
        }
        if let Some(jobs) = self.jobs {
            config.concurrency = jobs;
        }
        if let Some(timeout) = self.timeout {
            config.request_timeout_secs = timeout;
        }
        config.preserve_pages |= self.preserve_pages;
        config.headful |= self.headful;

        Ok(config)
    }
}

fn parse_timeout(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|_| "Not a number.")?;
    if value <= 0.0 {
        return Err("Must be a positive number.".to_string());
    }
    Ok(value)
}

async fn download(args: DownloadArgs) -> Result<()> {
    let config = args.config()?;
    let summary = Pipeline::new(config).run(&args.url).await?;
    report(&summary);
    Ok(())
}

fn report(summary: &RunSummary) {
    info!(
        "\"{}\": {} of {} visited pages bound into {} ({} bytes)",
        summary.title.green(),
        summary.pages_included,
        summary.pages_visited,
        summary.output.display().to_string().blue(),
        summary.bytes
    );
    if summary.pages_failed > 0 {
        warn!("{} pages could not be fetched", summary.pages_failed);
    }
    if summary.remote_images > 0 {
        warn!("{} images are referenced from the site instead of the local cache", summary.remote_images);
    }
    if summary.capped {
        warn!("Page limit reached, the site has more pages than were included");
    }
}

async fn merge_pdfs(input_dir: &Path, output_file: &Path) -> Result<()> {
    if !input_dir.exists() {
        return Err(anyhow::anyhow!("Input directory '{}' does not exist", input_dir.display()));
    }

    info!("Scanning directory: {}", input_dir.display().to_string().green());

    let mut entries = fs::read_dir(input_dir)
        .await
        .with_context(|| format!("failed to read {}", input_dir.display()))?;
    let mut pdf_files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|extension| extension == "pdf") {
            pdf_files.push(path);
        }
    }

    if pdf_files.is_empty() {
        return Err(anyhow::anyhow!("No PDF files found in '{}'", input_dir.display()));
    }

    // Page files are numbered, so name order is page order
    pdf_files.sort();

    info!("Found {} PDF files to merge:", pdf_files.len());
    for (i, path) in pdf_files.iter().enumerate() {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        info!("  {}: {}", i + 1, name.blue());
    }

    let mut merger = PdfMerger::new();
    for pdf_path in &pdf_files {
        if let Err(e) = merger.add_pdf(pdf_path).await {
            error!("Failed to add PDF {}: {}", pdf_path.display(), e);
        }
    }
    if merger.is_empty() {
        return Err(anyhow::anyhow!("None of the PDF files in '{}' could be read", input_dir.display()));
    }

    merger.save(output_file).await?;

    info!(
        "Successfully merged {} PDFs into: {}",
        merger.len(),
        output_file.display().to_string().green()
    );

    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Set up logging with chromiumoxide errors suppressed
    let level = if args.verbose { "bookbind=debug" } else { "bookbind=info" };
    let mut filter = EnvFilter::from_default_env();
    for directive in ["chromiumoxide::conn=off", "chromiumoxide::handler=off", level] {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {}: {}", directive, e),
        }
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let result = match args.command {
        Commands::Download(download_args) => download(download_args).await,
        Commands::Merge {
            input_dir,
            output_file,
        } => merge_pdfs(&input_dir, &output_file).await,
    };

    if let Err(e) = result {
        error!("{}", format!("Error: {}", e).red());
        process::exit(1);
    }
}
