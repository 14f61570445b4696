use std::collections::HashSet;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::domain_of;
use crate::{config::ExtractConfig, domain::OpportunityCandidate};

const CONTAINER_SELECTORS: &[&str] = &[
    "article",
    ".opportunity",
    ".post",
    ".listing",
    ".job-listing",
    ".card",
    ".item",
    ".result",
    ".entry",
    "div.row",
    "li.listing",
    "div[id*=\"opportunity\"]",
    "div[class*=\"opportunity\"]",
    "div[id*=\"post\"]",
    "div[class*=\"post\"]",
    "div[id*=\"listing\"]",
    "div[class*=\"listing\"]",
];

const LINK_VOCABULARY: &[&str] = &["apply", "details", "learn more", "more info", "read more"];

const MAX_TITLE_CHARS: usize = 200;
const MIN_LEAF_TITLE_CHARS: usize = 10;
const MIN_PARAGRAPH_CHARS: usize = 20;
const MAX_DESCRIPTION_CHARS: usize = 500;

static CONTAINERS: Lazy<Vec<Selector>> = Lazy::new(|| {
    CONTAINER_SELECTORS
        .iter()
        .map(|raw| Selector::parse(raw).expect("static container selector"))
        .collect()
});
static HEADINGS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h1, h2, h3, h4").expect("static heading selector"));
static TITLED: Lazy<Selector> =
    Lazy::new(|| Selector::parse("[title]").expect("static title selector"));
static BLOCKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p, div").expect("static block selector"));
static PARAGRAPHS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("p").expect("static paragraph selector"));
static ANCHORS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("static anchor selector"));
static IMAGES: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img[src]").expect("static image selector"));
static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse("body").expect("static body selector"));

static DEADLINE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    const DATE: &str = r"(?P<date>[a-zA-Z]+\s+\d{1,2},?\s+\d{4})";
    [
        r"deadlines?:?\s*",
        r"due(?:\s+by)?:?\s*",
        r"applications\s+due:?\s*",
        r"closing\s+date:?\s*",
        r"submit\s+by:?\s*",
        r"apply\s+by:?\s*",
    ]
    .iter()
    .map(|prefix| Regex::new(&format!("(?i){prefix}{DATE}")).expect("static deadline pattern"))
    .collect()
});

static LOCATION_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)location:\s*(?P<place>[^,.]+(?:,\s*[^,.]+)?)").expect("static location pattern")
});
static LOCATION_PREPOSITION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:in|at)\s+(?P<place>[A-Z][a-z]+(?:\s+[A-Z][a-z]+)*(?:,\s*[A-Z][a-z]+)?)")
        .expect("static location pattern")
});

/// Heuristic HTML → opportunity extraction.
pub struct Extractor {
    keywords: Vec<String>,
}

impl Extractor {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            keywords: config
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect(),
        }
    }

    /// Returns at most one candidate per canonical URL, in document order.
    pub fn extract(&self, html: &str, source_url: &str) -> Vec<OpportunityCandidate> {
        let Ok(base) = Url::parse(source_url) else {
            tracing::warn!(target: "extract", source_url, "unparseable source url");
            return Vec::new();
        };
        let document = Html::parse_document(html);
        let source_domain = domain_of(source_url).unwrap_or_default();

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for container in self.find_containers(&document) {
            let text = normalized_text(container);
            if !self.mentions_keyword(&text) {
                continue;
            }
            let Some(candidate) = self.extract_container(container, &text, &base, &source_domain)
            else {
                continue;
            };
            if seen.insert(candidate.url.clone()) {
                candidates.push(candidate);
            }
        }

        tracing::debug!(
            target: "extract",
            source_url,
            found = candidates.len(),
            "extraction finished"
        );
        candidates
    }

    fn find_containers<'a>(&self, document: &'a Html) -> Vec<ElementRef<'a>> {
        let mut seen = HashSet::new();
        let mut containers = Vec::new();
        for selector in CONTAINERS.iter() {
            for element in document.select(selector) {
                if seen.insert(element.id()) {
                    containers.push(element);
                }
            }
        }
        if !containers.is_empty() {
            return containers;
        }

        for heading in document.select(&HEADINGS) {
            if !self.mentions_keyword(&normalized_text(heading)) {
                continue;
            }
            if let Some(parent) = heading.parent().and_then(ElementRef::wrap) {
                if seen.insert(parent.id()) {
                    containers.push(parent);
                }
            }
        }
        if !containers.is_empty() {
            return containers;
        }

        document.select(&BODY).take(1).collect()
    }

    fn mentions_keyword(&self, text: &str) -> bool {
        let lowered = text.to_lowercase();
        self.keywords.iter().any(|k| lowered.contains(k.as_str()))
    }

    fn extract_container(
        &self,
        container: ElementRef<'_>,
        text: &str,
        base: &Url,
        source_domain: &str,
    ) -> Option<OpportunityCandidate> {
        let Some(title) = extract_title(container) else {
            tracing::debug!(target: "extract", source_url = %base, "container without a usable title");
            return None;
        };
        let Some(url) = extract_link(container, base) else {
            tracing::debug!(target: "extract", source_url = %base, title = %title, "container without a usable link");
            return None;
        };

        Some(OpportunityCandidate {
            title,
            description: extract_description(container, text),
            url: url.to_string(),
            deadline: extract_deadline(text),
            location: extract_location(text),
            image_url: container
                .select(&IMAGES)
                .filter_map(|img| img.value().attr("src"))
                .find_map(|src| canonicalize(base, src))
                .map(|u| u.to_string()),
            source_domain: source_domain.to_string(),
            source_url: base.to_string(),
            scraped_at: Utc::now(),
        })
    }
}

fn normalized_text(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn extract_title(container: ElementRef<'_>) -> Option<String> {
    let fits = |title: &str| !title.is_empty() && title.chars().count() < MAX_TITLE_CHARS;

    if let Some(title) = container
        .select(&HEADINGS)
        .map(normalized_text)
        .find(|t| fits(t))
    {
        return Some(title);
    }

    if let Some(title) = container
        .select(&TITLED)
        .filter_map(|el| el.value().attr("title"))
        .map(|t| t.trim().to_string())
        .find(|t| fits(t))
    {
        return Some(title);
    }

    container
        .select(&BLOCKS)
        .filter(|block| is_leaf_block(*block))
        .map(normalized_text)
        .find(|t| {
            let len = t.chars().count();
            len > MIN_LEAF_TITLE_CHARS && len < MAX_TITLE_CHARS
        })
}

fn is_leaf_block(block: ElementRef<'_>) -> bool {
    !block
        .descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
        .any(|el| matches!(el.value().name(), "p" | "div"))
}

fn extract_link(container: ElementRef<'_>, base: &Url) -> Option<Url> {
    let links: Vec<(String, Url)> = container
        .select(&ANCHORS)
        .filter_map(|a| {
            let href = a.value().attr("href")?;
            let url = canonicalize(base, href)?;
            Some((normalized_text(a).to_lowercase(), url))
        })
        .collect();

    let preferred = links
        .iter()
        .find(|(text, _)| LINK_VOCABULARY.iter().any(|word| text.contains(word)));
    match preferred.or_else(|| links.first()) {
        Some((_, url)) => Some(url.clone()),
        None => canonicalize(base, base.as_str()),
    }
}

fn extract_description(container: ElementRef<'_>, text: &str) -> String {
    let paragraphs: Vec<String> = container
        .select(&PARAGRAPHS)
        .map(normalized_text)
        .filter(|p| p.chars().count() > MIN_PARAGRAPH_CHARS)
        .collect();
    if !paragraphs.is_empty() {
        return paragraphs.join(" ");
    }
    truncate(text, MAX_DESCRIPTION_CHARS)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars - 3).collect();
    out.push_str("...");
    out
}

fn extract_deadline(text: &str) -> Option<String> {
    DEADLINE_PATTERNS
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.name("date"))
        .map(|m| m.as_str().trim().to_string())
}

fn extract_location(text: &str) -> Option<String> {
    [&*LOCATION_LABEL, &*LOCATION_PREPOSITION]
        .into_iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.name("place"))
        .map(|m| m.as_str().trim().to_string())
        .filter(|place| !place.is_empty())
}

/// Resolves `href` against `base`, keeping only http(s) targets and dropping
/// the fragment.
fn canonicalize(base: &Url, href: &str) -> Option<Url> {
    let mut url = base.join(href.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);
    Some(url)
}
