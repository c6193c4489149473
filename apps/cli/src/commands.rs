//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use genie_compressor::{CompressOptions, try_compress_with};
use genie_core::pipeline::{AnalyzeOptions, ProgressReporter, analyze, prepare_urls};
use genie_core::{BridgeClient, FieldProposer, FieldRefiner, StaticProposer, load_mapping, validate};
use genie_fetcher::SafeFetcher;
use genie_shared::{AnalysisReport, AppConfig, FetchConfig, init_config, load_config, load_config_from};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// Genie: infer field selectors from sample pages.
#[derive(Parser)]
#[command(
    name = "genie",
    version,
    about = "Infer a field→selector mapping from a few sample pages of one site.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file (defaults to ~/.genie/genie.toml).
    #[arg(long, global = true, env = "GENIE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Per-request fetch timeout in seconds (overrides the config).
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Fetch sample pages, propose a mapping, and validate it.
    Analyze {
        /// Sample page URLs from one site.
        #[arg(required = true)]
        urls: Vec<String>,

        /// Field name the mapping should cover (repeatable).
        #[arg(long = "hint")]
        hints: Vec<String>,

        /// Use this mapping file instead of asking the bridge for one.
        #[arg(long)]
        mapping: Option<PathBuf>,

        /// Skip the refiner; ambiguous fields keep their warnings.
        #[arg(long)]
        no_refine: bool,

        /// Model forwarded to the bridge (overrides the config).
        #[arg(long)]
        model: Option<String>,
    },

    /// Fetch pages and report what came back.
    Fetch {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Print the compressed skeleton of a file or URL.
    Compress {
        /// Local HTML file or http(s) URL.
        source: String,
    },

    /// Validate an existing mapping against sample pages.
    Validate {
        /// Mapping file (JSON object of field → selector).
        #[arg(long)]
        mapping: PathBuf,

        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags. Logs go to stderr so stdout stays
/// clean for JSON output.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "genie=info",
        1 => "genie=debug",
        _ => "genie=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let settings = Settings {
        config_path: cli.config,
        timeout: cli.timeout,
    };

    match cli.command {
        Command::Analyze {
            urls,
            hints,
            mapping,
            no_refine,
            model,
        } => cmd_analyze(&settings, &urls, hints, mapping.as_deref(), no_refine, model).await,
        Command::Fetch { urls } => cmd_fetch(&settings, &urls).await,
        Command::Compress { source } => cmd_compress(&settings, &source).await,
        Command::Validate { mapping, urls } => cmd_validate(&settings, &mapping, &urls).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(&settings).await,
        },
    }
}

/// Global flags that feed into config resolution.
struct Settings {
    config_path: Option<PathBuf>,
    timeout: Option<u64>,
}

impl Settings {
    fn load(&self) -> Result<AppConfig> {
        let mut config = match &self.config_path {
            Some(path) => load_config_from(path)?,
            None => load_config()?,
        };
        self.apply(&mut config);
        Ok(config)
    }

    /// Flag overrides on top of the file config.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(secs) = self.timeout {
            config.fetch.timeout_secs = secs;
        }
    }

    fn fetcher(&self, config: &AppConfig) -> SafeFetcher {
        SafeFetcher::new(FetchConfig::from(config))
    }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_analyze(
    settings: &Settings,
    urls: &[String],
    hints: Vec<String>,
    mapping: Option<&Path>,
    no_refine: bool,
    model: Option<String>,
) -> Result<()> {
    let mut config = settings.load()?;
    if let Some(model) = model {
        config.bridge.model = model;
    }

    let fetcher = settings.fetcher(&config);
    let options = AnalyzeOptions {
        hints,
        ..AnalyzeOptions::from(&config)
    };

    let static_proposer = mapping.map(StaticProposer::from_path).transpose()?;
    let needs_bridge = static_proposer.is_none() || !no_refine;
    let bridge = if needs_bridge {
        match BridgeClient::spawn(&config.bridge) {
            Ok(bridge) => Some(bridge),
            // Only the refiner depends on the bridge here, so carry on.
            Err(e) if static_proposer.is_some() => {
                warn!(error = %e, "bridge unavailable, continuing without refinement");
                None
            }
            Err(e) => return Err(e.into()),
        }
    } else {
        None
    };

    let proposer: &dyn FieldProposer = match (&static_proposer, &bridge) {
        (Some(proposer), _) => proposer,
        (None, Some(bridge)) => bridge,
        (None, None) => return Err(eyre!("no proposer available")),
    };
    let refiner: Option<&dyn FieldRefiner> = if no_refine {
        None
    } else {
        bridge.as_ref().map(|bridge| bridge as &dyn FieldRefiner)
    };

    info!(
        urls = urls.len(),
        hints = options.hints.len(),
        refine = refiner.is_some(),
        "analyzing sample pages"
    );

    let reporter = CliProgress::new();
    let result = analyze(urls, &fetcher, proposer, refiner, &options, &reporter).await;
    reporter.finish();

    if let Some(bridge) = bridge {
        bridge.shutdown();
    }

    let report = result?;
    print_json(&report)
}

async fn cmd_fetch(settings: &Settings, urls: &[String]) -> Result<()> {
    let config = settings.load()?;
    let fetcher = settings.fetcher(&config);
    let urls = prepare_urls(urls, fetcher.config().max_urls)?;

    let reporter = CliProgress::new();
    reporter.phase("Fetching pages");
    let pages = fetcher.fetch_all(&urls).await;
    reporter.finish();

    let summary: Vec<serde_json::Value> = pages
        .iter()
        .map(|page| {
            serde_json::json!({
                "url": page.url,
                "chars": page.markup.as_ref().map(|m| m.chars().count()),
                "error": page.error,
            })
        })
        .collect();
    print_json(&summary)
}

async fn cmd_compress(settings: &Settings, source: &str) -> Result<()> {
    let config = settings.load()?;

    let markup = if source.starts_with("http://") || source.starts_with("https://") {
        let page = settings.fetcher(&config).fetch_one(source).await;
        page.try_markup()?.to_string()
    } else {
        std::fs::read_to_string(source).map_err(|e| eyre!("cannot read '{source}': {e}"))?
    };

    let compressed = try_compress_with(&markup, &CompressOptions::from(&config.compress))?;
    if let Some(hint) = &compressed.container {
        info!(tag = %hint.tag, class = %hint.class_token, "main container");
    }
    info!(
        input_chars = markup.chars().count(),
        output_chars = compressed.html.chars().count(),
        "compressed"
    );
    println!("{}", compressed.html);
    Ok(())
}

async fn cmd_validate(settings: &Settings, mapping: &Path, urls: &[String]) -> Result<()> {
    let config = settings.load()?;
    let mapping = load_mapping(mapping)?;
    let fetcher = settings.fetcher(&config);
    let urls = prepare_urls(urls, fetcher.config().max_urls)?;

    let reporter = CliProgress::new();
    reporter.phase("Fetching pages");
    let pages = fetcher.fetch_all(&urls).await;
    reporter.phase("Validating selectors");
    let results = validate(&mapping, &pages);
    reporter.finish();

    for page in &pages {
        if let Some(err) = &page.error {
            warn!(url = %page.url, error = %err, "page skipped");
        }
    }
    print_json(&results)
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(settings: &Settings) -> Result<()> {
    let config: AppConfig = settings.load()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner on stderr.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn pages_fetched(&self, fetched: usize, total: usize) {
        self.spinner
            .set_message(format!("Fetched {fetched}/{total} pages"));
    }

    fn done(&self, report: &AnalysisReport) {
        self.spinner.finish_and_clear();
        info!(
            fields = report.mappings.len(),
            seconds = report.elapsed_seconds,
            "done"
        );
    }
}
