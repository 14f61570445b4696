use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{sleep, Instant};

use super::{domain_of, extract::Extractor, fetch::FetchClient, health::HealthTracker};
use crate::{
    config::CrawlConfig,
    db::OpportunityStore,
    domain::{CrawlJobSpec, JobKind, RunResult},
};

/// Everything a crawl needs, shared by all jobs.
pub struct CrawlContext {
    pub fetch: Arc<FetchClient>,
    pub extractor: Arc<Extractor>,
    pub health: Arc<HealthTracker>,
    pub store: Arc<dyn OpportunityStore>,
    pub crawl: CrawlConfig,
}

impl CrawlContext {
    fn polite_delay(&self) -> Duration {
        let min = self.crawl.polite_delay_min;
        let max = self.crawl.polite_delay_max;
        if max <= min {
            return min;
        }
        let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// A unit of work the scheduler can run by id.
#[async_trait]
pub trait Crawlable: Send + Sync {
    fn id(&self) -> &str;

    async fn run(&self, ctx: &CrawlContext) -> RunResult;
}

pub struct SiteCrawl {
    spec: CrawlJobSpec,
}

impl SiteCrawl {
    pub fn new(spec: CrawlJobSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl Crawlable for SiteCrawl {
    fn id(&self) -> &str {
        &self.spec.id
    }

    async fn run(&self, ctx: &CrawlContext) -> RunResult {
        crawl_site(&self.spec, ctx, &mut Pacer::default()).await
    }
}

/// Crawls every site job in turn; succeeds when more than half of them do.
pub struct RunAllCrawl {
    id: String,
    sites: Vec<CrawlJobSpec>,
}

impl RunAllCrawl {
    pub fn new(id: impl Into<String>, sites: Vec<CrawlJobSpec>) -> Self {
        Self {
            id: id.into(),
            sites,
        }
    }
}

#[async_trait]
impl Crawlable for RunAllCrawl {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, ctx: &CrawlContext) -> RunResult {
        let mut total = RunResult::default();
        let mut succeeded = 0usize;
        let mut errors = Vec::new();
        let mut pacer = Pacer::default();

        for spec in &self.sites {
            let result = crawl_site(spec, ctx, &mut pacer).await;
            total.opportunities_found += result.opportunities_found;
            total.attempted += result.attempted;
            total.skipped += result.skipped;
            total.failed += result.failed;
            if result.success {
                succeeded += 1;
            } else if let Some(err) = result.error {
                errors.push(format!("{}: {err}", spec.id));
            }
        }

        total.success = self.sites.is_empty() || succeeded * 2 > self.sites.len();
        if !total.success {
            total.error = Some(format!(
                "{succeeded}/{} site jobs succeeded; {}",
                self.sites.len(),
                errors.join("; ")
            ));
        }
        tracing::info!(
            target: "crawl",
            job_id = %self.id,
            sites = self.sites.len(),
            succeeded,
            found = total.opportunities_found,
            "run-all finished"
        );
        total
    }
}

/// Spaces out sequential requests for the length of one job run, across
/// site boundaries too.
#[derive(Default)]
struct Pacer {
    sent: bool,
}

impl Pacer {
    async fn before_request(&mut self, ctx: &CrawlContext) {
        if self.sent {
            let delay = ctx.polite_delay();
            if !delay.is_zero() {
                sleep(delay).await;
            }
        }
        self.sent = true;
    }
}

/// What one job run saw for a domain; reported to health once the run ends.
#[derive(Default)]
struct DomainOutcome {
    successes: u32,
    latency_ms: f64,
    last_error: Option<String>,
}

impl DomainOutcome {
    fn failed(&self) -> bool {
        self.successes == 0 && self.last_error.is_some()
    }
}

async fn crawl_site(spec: &CrawlJobSpec, ctx: &CrawlContext, pacer: &mut Pacer) -> RunResult {
    let mut result = RunResult::default();
    let mut succeeded = 0usize;
    let mut last_error = None;
    let mut domains: Vec<(String, DomainOutcome)> = Vec::new();

    for url in &spec.target_urls {
        let domain = domain_of(url).unwrap_or_else(|| url.clone());
        if ctx.health.is_open(&domain) {
            tracing::info!(target: "crawl", job_id = %spec.id, url = %url, domain = %domain, "circuit open; skipping");
            result.skipped += 1;
            continue;
        }
        let slot = match domains.iter().position(|(seen, _)| *seen == domain) {
            Some(index) => index,
            None => {
                domains.push((domain.clone(), DomainOutcome::default()));
                domains.len() - 1
            }
        };
        if domains[slot].1.failed() {
            tracing::info!(target: "crawl", job_id = %spec.id, url = %url, domain = %domain, "domain already failed this run; skipping");
            result.skipped += 1;
            continue;
        }

        pacer.before_request(ctx).await;
        result.attempted += 1;

        let started = Instant::now();
        match ctx.fetch.fetch(url, ctx.fetch.default_timeout(), true).await {
            Ok(response) => {
                let latency_ms = started.elapsed().as_secs_f64() * 1_000.0;
                let outcome = &mut domains[slot].1;
                outcome.successes += 1;
                outcome.latency_ms += latency_ms;
                succeeded += 1;

                let candidates = ctx.extractor.extract(&response.body, url);
                for candidate in &candidates {
                    match ctx.store.upsert(candidate).await {
                        Ok(_) => result.opportunities_found += 1,
                        Err(err) => tracing::warn!(
                            target: "crawl",
                            job_id = %spec.id,
                            url = %candidate.url,
                            error = %err,
                            "failed to store opportunity"
                        ),
                    }
                }
                tracing::debug!(
                    target: "crawl",
                    job_id = %spec.id,
                    url = %url,
                    status = response.status,
                    attempts = response.attempts,
                    candidates = candidates.len(),
                    latency_ms,
                    "page crawled"
                );
            }
            Err(err) => {
                let message = err.to_string();
                domains[slot].1.last_error = Some(message.clone());
                result.failed += 1;
                last_error = Some(message);
            }
        }
    }

    for (domain, outcome) in &domains {
        if outcome.successes > 0 {
            ctx.health
                .report_success(domain, outcome.latency_ms / f64::from(outcome.successes));
        } else if let Some(error) = &outcome.last_error {
            ctx.health.report_failure(domain, error);
        }
    }

    result.success = result.attempted == 0 || succeeded > 0;
    if !result.success {
        result.error = Some(format!(
            "all {} attempted url(s) failed; last error: {}",
            result.attempted,
            last_error.unwrap_or_default()
        ));
    }
    tracing::info!(
        target: "crawl",
        job_id = %spec.id,
        attempted = result.attempted,
        skipped = result.skipped,
        failed = result.failed,
        found = result.opportunities_found,
        success = result.success,
        "crawl finished"
    );
    result
}

/// Static id → crawlable table. Every site job becomes a `SiteCrawl`; the
/// run-all job aggregates all of them.
pub fn build_registry(specs: &[CrawlJobSpec]) -> HashMap<String, Arc<dyn Crawlable>> {
    let sites: Vec<CrawlJobSpec> = specs
        .iter()
        .filter(|spec| spec.kind == JobKind::Site)
        .cloned()
        .collect();

    specs
        .iter()
        .map(|spec| {
            let crawlable: Arc<dyn Crawlable> = match spec.kind {
                JobKind::Site => Arc::new(SiteCrawl::new(spec.clone())),
                JobKind::RunAll => Arc::new(RunAllCrawl::new(spec.id.clone(), sites.clone())),
            };
            (crawlable.id().to_string(), crawlable)
        })
        .collect()
}
