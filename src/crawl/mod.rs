pub mod extract;
pub mod fetch;
pub mod health;
pub mod job;

pub use extract::Extractor;
pub use fetch::{FetchClient, ReqwestTransport, Transport};
pub use health::HealthTracker;
pub use job::{build_registry, CrawlContext, Crawlable};

/// Health-tracking key of a URL: its host, lowercased, without a `www.` prefix.
pub fn domain_of(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw).ok()?;
    let host = url.host_str()?.to_ascii_lowercase();
    Some(host.strip_prefix("www.").map(str::to_string).unwrap_or(host))
}

#[cfg(test)]
mod tests {
    use super::domain_of;

    #[test]
    fn domain_strips_www_and_port() {
        assert_eq!(
            domain_of("https://www.SFAC.org:8443/grants?x=1").as_deref(),
            Some("sfac.org")
        );
        assert_eq!(domain_of("not a url"), None);
    }
}
