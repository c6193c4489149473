//! End-to-end `analyze` pipeline: URLs → fetch → compress → propose → scope →
//! detect → narrow → refine → validate → report.

use std::collections::BTreeMap;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use genie_compressor::{CompressOptions, try_compress_with};
use genie_dom::Selector;
use genie_fetcher::SafeFetcher;
use genie_shared::{
    AmbiguityContext, AnalysisReport, AppConfig, GenieError, Page, PageFailure, Result,
};

use crate::ambiguity::find_ambiguous_parsed;
use crate::narrowing::narrow_parsed;
use crate::proposer::{FieldProposer, FieldRefiner, sanitize_mapping};
use crate::scope::{dominant_hint, scope_mapping};
use crate::validator::{parse_pages, truncate_chars, validate_parsed};

/// Per-page cap on compressed text handed to the proposer.
pub const DEFAULT_MAX_PROMPT_CHARS: usize = 8_000;

/// Options for [`analyze`].
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
    /// Field names the proposer should try to cover.
    pub hints: Vec<String>,
    pub compress: CompressOptions,
    pub max_prompt_chars: usize,
}

impl Default for AnalyzeOptions {
    fn default() -> Self {
        Self {
            hints: Vec::new(),
            compress: CompressOptions::default(),
            max_prompt_chars: DEFAULT_MAX_PROMPT_CHARS,
        }
    }
}

impl From<&AppConfig> for AnalyzeOptions {
    fn from(config: &AppConfig) -> Self {
        Self {
            hints: Vec::new(),
            compress: CompressOptions::from(&config.compress),
            max_prompt_chars: config.compress.max_prompt_chars,
        }
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once fetching is over.
    fn pages_fetched(&self, fetched: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, report: &AnalysisReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn pages_fetched(&self, _fetched: usize, _total: usize) {}
    fn done(&self, _report: &AnalysisReport) {}
}

/// Trim entries, skip blanks, and enforce the batch limit.
pub fn prepare_urls(urls: &[String], max_urls: usize) -> Result<Vec<String>> {
    let urls: Vec<String> = urls
        .iter()
        .map(|url| url.trim())
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect();

    if urls.is_empty() {
        return Err(GenieError::validation("no URLs given"));
    }
    if urls.len() > max_urls {
        return Err(GenieError::validation(format!(
            "too many URLs: {} (maximum {max_urls})",
            urls.len()
        )));
    }
    Ok(urls)
}

/// Run the full `analyze` pipeline.
///
/// 1. Fetch every sample page
/// 2. Compress the fetched pages
/// 3. Ask the proposer for a mapping
/// 4. Scope, detect ambiguity, narrow, refine
/// 5. Validate and report
#[instrument(skip_all, fields(urls = urls.len(), hints = options.hints.len()))]
pub async fn analyze(
    urls: &[String],
    fetcher: &SafeFetcher,
    proposer: &dyn FieldProposer,
    refiner: Option<&dyn FieldRefiner>,
    options: &AnalyzeOptions,
    progress: &dyn ProgressReporter,
) -> Result<AnalysisReport> {
    let start = Instant::now();
    let urls = prepare_urls(urls, fetcher.config().max_urls)?;

    // --- Phase 1: Fetch ---
    progress.phase("Fetching sample pages");
    let pages = fetcher.fetch_all(&urls).await;
    let fetched = pages.iter().filter(|page| page.is_fetched()).count();
    progress.pages_fetched(fetched, pages.len());

    if fetched == 0 {
        return Err(GenieError::validation(format!(
            "no pages were fetched ({} URLs failed)",
            pages.len()
        )));
    }

    let mut report = analyze_pages(pages, proposer, refiner, options, progress)?;
    report.elapsed_seconds = start.elapsed().as_secs_f64();
    Ok(report)
}

/// Everything after fetching, over pages already in hand.
#[instrument(skip_all, fields(pages = pages.len()))]
pub fn analyze_pages(
    pages: Vec<Page>,
    proposer: &dyn FieldProposer,
    refiner: Option<&dyn FieldRefiner>,
    options: &AnalyzeOptions,
    progress: &dyn ProgressReporter,
) -> Result<AnalysisReport> {
    let start = Instant::now();
    let site = pages.first().map(|page| site_of(&page.url)).unwrap_or_default();

    // --- Phase 2: Compress ---
    progress.phase("Compressing pages");
    let mut failures = Vec::new();
    let mut usable = Vec::new();
    let mut documents = Vec::new();
    let mut container_hints = Vec::new();

    for page in pages {
        if let Some(error) = &page.error {
            failures.push(PageFailure {
                url: page.url.clone(),
                error: error.to_string(),
            });
            continue;
        }
        let Some(markup) = page.markup.as_deref() else {
            continue;
        };
        let compressed = match try_compress_with(markup, &options.compress) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!(url = %page.url, error = %e, "page compressed to nothing, skipping");
                failures.push(PageFailure {
                    url: page.url.clone(),
                    error: e.to_string(),
                });
                continue;
            }
        };
        debug!(url = %page.url, chars = compressed.html.chars().count(), "page compressed");
        documents.push(truncate_chars(&compressed.html, options.max_prompt_chars));
        container_hints.extend(compressed.container);
        usable.push(page);
    }

    let parsed = parse_pages(&usable);
    if parsed.is_empty() {
        return Err(GenieError::validation("no fetched page had usable content"));
    }

    // --- Phase 3: Propose ---
    progress.phase("Proposing field mapping");
    let proposal = proposer.propose(&documents, &options.hints)?;
    let mut tokens_used = proposal.tokens_used;
    let mut mapping = sanitize_mapping(proposal.mapping);
    info!(fields = mapping.len(), tokens = proposal.tokens_used, "mapping proposed");

    // --- Phase 4: Scope to the main container ---
    if let Some(hint) = dominant_hint(&container_hints) {
        let (scoped, fields) = scope_mapping(&mapping, &hint, &parsed);
        info!(
            tag = %hint.tag,
            class = %hint.class_token,
            scoped = fields.len(),
            "scoped selectors to main container"
        );
        mapping = scoped;
    }

    // --- Phase 5: Ambiguity & narrowing ---
    progress.phase("Resolving ambiguous selectors");
    let ambiguous = find_ambiguous_parsed(&mapping, &parsed);
    let narrowed = narrow_parsed(&mapping, &ambiguous, &parsed);
    let narrowed_fields: Vec<String> = narrowed.keys().cloned().collect();
    mapping.extend(narrowed);

    let escalated: BTreeMap<String, AmbiguityContext> = ambiguous
        .into_iter()
        .filter(|(field, _)| !narrowed_fields.contains(field))
        .collect();

    // --- Phase 6: Refinement ---
    let mut refined_fields = Vec::new();
    match refiner {
        Some(refiner) if !escalated.is_empty() => {
            progress.phase("Refining ambiguous selectors");
            match refiner.refine(&escalated) {
                Ok(refinement) => {
                    tokens_used += refinement.tokens_used;
                    for (field, selector) in sanitize_mapping(refinement.replacements) {
                        if !escalated.contains_key(&field) {
                            debug!(field = %field, "ignoring replacement for a field not sent");
                            continue;
                        }
                        if let Err(e) = Selector::parse(&selector) {
                            warn!(field = %field, selector = %selector, error = %e, "refiner returned an invalid selector");
                            continue;
                        }
                        mapping.insert(field.clone(), selector);
                        refined_fields.push(field);
                    }
                }
                Err(e) => {
                    warn!(fields = escalated.len(), error = %e, "refinement failed, keeping selectors");
                }
            }
        }
        _ => {
            if !escalated.is_empty() {
                debug!(fields = escalated.len(), "no refiner, ambiguous fields left as proposed");
            }
        }
    }

    // --- Phase 7: Validate ---
    progress.phase("Validating selectors");
    let mappings = validate_parsed(&mapping, &parsed);

    let report = AnalysisReport {
        site,
        mappings,
        pages_analyzed: parsed.len(),
        pages_failed: failures.len(),
        failures,
        tokens_used,
        narrowed_fields,
        refined_fields,
        elapsed_seconds: start.elapsed().as_secs_f64(),
        analyzed_at: Utc::now(),
    };

    progress.done(&report);

    info!(
        site = %report.site,
        fields = report.mappings.len(),
        pages = report.pages_analyzed,
        failed = report.pages_failed,
        narrowed = report.narrowed_fields.len(),
        refined = report.refined_fields.len(),
        tokens = report.tokens_used,
        "analysis complete"
    );

    Ok(report)
}

/// Host of `url`, or the raw string when it has none.
fn site_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use genie_shared::{FetchConfig, FetchError, FieldMapping};

    use super::*;
    use crate::proposer::{Proposal, Refinement, StaticProposer};

    const DESCRIPTION: &str = "分散システム基盤チームでRustを用いたバックエンド開発を担当していただきます。\
        大規模なトラフィックを支えるサービスの設計、実装、運用までを一貫して行い、\
        チームと共にプロダクトの信頼性と性能を継続的に改善していきます。\
        コードレビューや技術選定にも積極的に関わっていただけることを期待しています。\
        リモートワークとフレックスタイム制を導入しており、柔軟な働き方が可能です。";

    fn job_page(title: &str, salary: &str, tags: &[&str]) -> String {
        let tags: String = tags.iter().map(|t| format!("<li>{t}</li>")).collect();
        format!(
            r#"<html><head><title>{title}</title></head><body>
            <header class="site-header"><a href="/">Jobs</a></header>
            <div class="job-detail">
              <h1>{title}</h1>
              <div class="head"><span class="company">Acme</span></div>
              <dl class="job-spec"><dt>給与</dt><dd>{salary}</dd></dl>
              <ul class="tags">{tags}</ul>
              <p class="description">{DESCRIPTION}</p>
              <div class="foot"><span class="company">Acme</span></div>
            </div>
            <div class="related-jobs"><dl><dt>給与</dt><dd>月給20万円</dd></dl></div>
            </body></html>"#
        )
    }

    fn jobs() -> Vec<String> {
        vec![
            job_page("Backend Engineer", "年収600万円", &["Rust", "Remote"]),
            job_page("SRE", "年収700万円", &["Go", "Kubernetes"]),
            job_page("Data Engineer", "年収650万円", &["Python", "Spark"]),
        ]
    }

    fn proposed_mapping() -> FieldMapping {
        sanitize_mapping(
            [
                ("title", "//h1"),
                ("company", "//span[contains(@class,'company')]"),
                ("salary", "//dt[text()='給与']/following-sibling::dd[1]"),
                ("tag", "//ul[@class='tags']/li"),
                ("phone", "//span[@class='tel']"),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    async fn serve(server: &MockServer, bodies: &[String]) -> Vec<String> {
        let mut urls = Vec::new();
        for (i, body) in bodies.iter().enumerate() {
            let route = format!("/jobs/{}", i + 1);
            Mock::given(method("GET"))
                .and(path(route.as_str()))
                .respond_with(
                    ResponseTemplate::new(200).set_body_raw(body.clone(), "text/html; charset=utf-8"),
                )
                .mount(server)
                .await;
            urls.push(format!("{}{route}", server.uri()));
        }
        urls
    }

    fn fetcher() -> SafeFetcher {
        SafeFetcher::new(FetchConfig::default()).allow_private_networks()
    }

    /// Refiner that records what it was asked and answers with a fixed result.
    struct RecordingRefiner {
        seen: Mutex<Vec<String>>,
        answer: Option<FieldMapping>,
    }

    impl RecordingRefiner {
        fn new(answer: Option<FieldMapping>) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                answer,
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl FieldRefiner for RecordingRefiner {
        fn refine(&self, fields: &BTreeMap<String, AmbiguityContext>) -> Result<Refinement> {
            self.seen.lock().unwrap().extend(fields.keys().cloned());
            match &self.answer {
                Some(replacements) => Ok(Refinement {
                    replacements: replacements.clone(),
                    tokens_used: 42,
                }),
                None => Err(GenieError::Refiner("model unavailable".into())),
            }
        }
    }

    struct FailingProposer;

    impl FieldProposer for FailingProposer {
        fn propose(&self, _documents: &[String], _hints: &[String]) -> Result<Proposal> {
            Err(GenieError::Proposer("no mapping".into()))
        }
    }

    #[tokio::test]
    async fn full_analysis_scopes_narrows_and_validates() {
        let server = MockServer::start().await;
        let urls = serve(&server, &jobs()).await;
        let proposer = StaticProposer::new(proposed_mapping());
        let refiner = RecordingRefiner::new(None);

        let report = analyze(
            &urls,
            &fetcher(),
            &proposer,
            Some(&refiner),
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .await
        .expect("analyze");

        assert_eq!(report.site, "127.0.0.1");
        assert_eq!(report.pages_analyzed, 3);
        assert_eq!(report.pages_failed, 0);

        let title = &report.mappings["title"];
        assert_eq!(title.selector, "//div[contains(@class,'job-detail')]//h1");
        assert_eq!(title.confidence, 1.0);
        assert!(!title.optional);
        assert!(title.warning.is_none());
        assert_eq!(title.samples[1].as_deref(), Some("SRE"));

        // Scoping drops the related-jobs match, so no warning remains.
        let salary = &report.mappings["salary"];
        assert!(salary.warning.is_none());
        assert_eq!(salary.samples[0].as_deref(), Some("年収600万円"));

        // Identical duplicates are narrowed mechanically.
        assert_eq!(report.narrowed_fields, vec!["company".to_string()]);
        let company = &report.mappings["company"];
        assert_eq!(
            company.selector,
            "//div[contains(@class,'job-detail')]//div[contains(@class,'head')]//span[contains(@class,'company')]"
        );
        assert!(company.warning.is_none());

        // Divergent values go to the refiner; its failure leaves the warning.
        assert_eq!(refiner.seen(), vec!["tag".to_string()]);
        assert!(report.refined_fields.is_empty());
        assert!(report.mappings["tag"].warning.is_some());

        let phone = &report.mappings["phone"];
        assert_eq!(phone.confidence, 0.0);
        assert!(phone.optional);
        assert_eq!(phone.samples, vec![None, None, None]);
    }

    #[tokio::test]
    async fn refiner_replacements_are_merged() {
        let server = MockServer::start().await;
        let urls = serve(&server, &jobs()).await;
        let proposer = StaticProposer::new(proposed_mapping());
        let answer = sanitize_mapping([
            ("tag".to_string(), "//ul[@class='tags']/li[1]".to_string()),
            ("title".to_string(), "//title".to_string()),
        ]);
        let refiner = RecordingRefiner::new(Some(answer));

        let report = analyze(
            &urls,
            &fetcher(),
            &proposer,
            Some(&refiner),
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .await
        .expect("analyze");

        assert_eq!(report.refined_fields, vec!["tag".to_string()]);
        assert_eq!(report.tokens_used, 42);
        let tag = &report.mappings["tag"];
        assert_eq!(tag.selector, "//ul[@class='tags']/li[1]");
        assert!(tag.warning.is_none());
        assert_eq!(tag.samples[0].as_deref(), Some("Rust"));
        // Replacements for fields that were not escalated are ignored.
        assert_eq!(
            report.mappings["title"].selector,
            "//div[contains(@class,'job-detail')]//h1"
        );
    }

    #[test]
    fn unresolved_duplicates_are_escalated_and_bad_replacements_ignored() {
        let page = |title: &str| {
            format!(
                "<html><body><div class=\"detail\"><h1>{title}</h1>\
                 <section><p>Same</p></section><section><p>Same</p></section></div></body></html>"
            )
        };
        let pages = vec![
            Page::fetched("https://notes.example/1", page("One")),
            Page::fetched("https://notes.example/2", page("Two")),
        ];
        let proposer = StaticProposer::new(sanitize_mapping(
            [("title", "//h1"), ("note", "//section/p")].map(|(k, v)| (k.to_string(), v.to_string())),
        ));
        let refiner = RecordingRefiner::new(Some(sanitize_mapping([(
            "note".to_string(),
            "//section[".to_string(),
        )])));

        let report = analyze_pages(
            pages,
            &proposer,
            Some(&refiner),
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .expect("analyze");

        // No ancestor token makes the identical duplicates unique.
        assert!(report.narrowed_fields.is_empty());
        assert_eq!(refiner.seen(), vec!["note".to_string()]);
        assert!(report.refined_fields.is_empty());
        assert_eq!(report.tokens_used, 42);

        let note = &report.mappings["note"];
        assert_eq!(note.selector, "//section/p");
        assert_eq!(note.confidence, 1.0);
        assert!(note.warning.is_none());
        assert_eq!(note.samples[0].as_deref(), Some("Same"));
    }

    #[tokio::test]
    async fn failed_pages_are_reported_not_fatal() {
        let server = MockServer::start().await;
        let mut urls = serve(&server, &jobs()[..2]).await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        urls.push(format!("{}/gone", server.uri()));

        let report = analyze(
            &urls,
            &fetcher(),
            &StaticProposer::new(proposed_mapping()),
            None,
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .await
        .expect("analyze");

        assert_eq!(report.pages_analyzed, 2);
        assert_eq!(report.pages_failed, 1);
        assert_eq!(report.failures[0].url, urls[2]);
        assert_eq!(report.mappings["title"].samples.len(), 2);
        // Without a refiner the divergent field keeps its warning.
        assert!(report.mappings["tag"].warning.is_some());
    }

    #[tokio::test]
    async fn nothing_fetched_is_a_validation_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let urls = vec![format!("{}/a", server.uri()), format!("{}/b", server.uri())];

        let err = analyze(
            &urls,
            &fetcher(),
            &StaticProposer::new(proposed_mapping()),
            None,
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GenieError::Validation { .. }));
    }

    #[tokio::test]
    async fn private_targets_are_blocked_by_default() {
        let server = MockServer::start().await;
        let urls = serve(&server, &jobs()[..1]).await;

        let err = analyze(
            &urls,
            &SafeFetcher::new(FetchConfig::default()),
            &StaticProposer::new(proposed_mapping()),
            None,
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("no pages were fetched"));
    }

    #[test]
    fn proposer_failure_is_fatal() {
        let pages = vec![Page::fetched("https://jobs.example/1", jobs().remove(0))];
        let err = analyze_pages(
            pages,
            &FailingProposer,
            None,
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .unwrap_err();
        assert!(matches!(err, GenieError::Proposer(_)));
    }

    #[test]
    fn blank_markup_counts_as_failed_page() {
        let pages = vec![
            Page::fetched("https://jobs.example/1", jobs().remove(0)),
            Page::fetched("https://jobs.example/2", "   "),
            Page::failed(
                "https://jobs.example/3",
                FetchError::Blocked {
                    reason: "private address".into(),
                },
            ),
        ];
        let report = analyze_pages(
            pages,
            &StaticProposer::new(proposed_mapping()),
            None,
            &AnalyzeOptions::default(),
            &SilentProgress,
        )
        .expect("analyze");
        assert_eq!(report.site, "jobs.example");
        assert_eq!(report.pages_analyzed, 1);
        assert_eq!(report.pages_failed, 2);
        assert_eq!(report.failures[0].url, "https://jobs.example/2");
        assert!(report.failures[0].error.starts_with("parse error"));
        assert_eq!(report.failures[1].url, "https://jobs.example/3");
    }

    #[test]
    fn url_batches_are_checked() {
        let urls = vec![" https://a.example/1 ".to_string(), "".to_string()];
        assert_eq!(prepare_urls(&urls, 10).unwrap(), vec!["https://a.example/1".to_string()]);
        assert!(prepare_urls(&["  ".to_string()], 10).is_err());
        let many: Vec<String> = (0..11).map(|i| format!("https://a.example/{i}")).collect();
        let err = prepare_urls(&many, 10).unwrap_err();
        assert!(err.to_string().contains("too many URLs"));
    }
}
