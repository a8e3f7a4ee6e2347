//! Search routing and result merging.
//!
//! Pure functions: route construction from a typed config (with localized
//! route overlays keyed by language) and merging of raw results with
//! URL-normalised deduplication, a per-domain cap, and priority-boosted
//! ordering. The search execution itself happens through agent tools and is
//! out of scope here.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::taskweave::types::SearchResult;

/// Configuration for one source-type route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRoute {
    /// Source type this route serves (e.g. `"news"`, `"academic"`).
    pub source_type: String,
    /// Site restrictions, when any.
    #[serde(default)]
    pub sites: Vec<String>,
    /// Recency window in days; `None` means unrestricted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recency_days: Option<u32>,
    /// Result cap for this route.
    pub max_results: usize,
    /// Score multiplier applied when merging.
    pub priority_boost: f64,
    /// Provider category hint (e.g. an Exa category).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// Routing table with optional per-language overlays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchRoutingConfig {
    /// Default routes keyed by source type.
    #[serde(default)]
    pub routes: Vec<SearchRoute>,
    /// Localized routes keyed by language code; these replace same-typed
    /// default routes when the language matches.
    #[serde(default)]
    pub localized: HashMap<String, Vec<SearchRoute>>,
    /// Cap on results per registrable domain after merging.
    #[serde(default = "default_max_per_domain")]
    pub max_per_domain: usize,
}

fn default_max_per_domain() -> usize {
    3
}

/// Build the routes for the requested source types, applying localized
/// overrides for `language` when present.
pub fn build_routes(
    config: &SearchRoutingConfig,
    source_types: &[String],
    language: Option<&str>,
) -> Vec<SearchRoute> {
    let localized = language.and_then(|lang| config.localized.get(lang));
    source_types
        .iter()
        .filter_map(|source_type| {
            if let Some(overlay) = localized {
                if let Some(route) = overlay.iter().find(|r| &r.source_type == source_type) {
                    return Some(route.clone());
                }
            }
            config
                .routes
                .iter()
                .find(|r| &r.source_type == source_type)
                .cloned()
        })
        .collect()
}

/// Normalise a URL for deduplication: lowercase scheme and host, drop
/// fragments, default ports, tracking parameters, and trailing slashes.
///
/// ```
/// use taskweave::activities::search::normalize_url;
///
/// assert_eq!(
///     normalize_url("HTTPS://Example.com:443/Path/?utm_source=x&id=1#frag"),
///     "https://example.com/Path?id=1"
/// );
/// ```
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
        None => ("https".to_string(), url),
    };
    let rest = rest.split('#').next().unwrap_or(rest);

    let (host_port, path_query) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, ""),
    };
    let mut host = host_port.to_ascii_lowercase();
    for default_port in [":443", ":80"] {
        if let Some(stripped) = host.strip_suffix(default_port) {
            host = stripped.to_string();
        }
    }

    let (path, query) = match path_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_query, None),
    };
    let path = path.trim_end_matches('/');

    let query = query
        .map(|query| {
            query
                .split('&')
                .filter(|param| {
                    let key = param.split('=').next().unwrap_or("");
                    !key.starts_with("utm_") && key != "fbclid" && key != "gclid"
                })
                .collect::<Vec<_>>()
                .join("&")
        })
        .filter(|query| !query.is_empty());

    match query {
        Some(query) => format!("{}://{}{}?{}", scheme, host, path, query),
        None => format!("{}://{}{}", scheme, host, path),
    }
}

/// Registrable domain of a URL, for the per-domain cap.
pub fn domain_of(url: &str) -> String {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let host = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    host.strip_prefix("www.").unwrap_or(&host).to_string()
}

/// Merge raw results from several routes.
///
/// Deduplicates on the normalised URL (keeping the highest-scored copy),
/// sorts by `score × priority_boost` of the producing route (descending),
/// and enforces the per-domain cap in that order.
pub fn merge_results(
    results: Vec<SearchResult>,
    routes: &[SearchRoute],
    max_per_domain: usize,
) -> Vec<SearchResult> {
    let boosts: HashMap<&str, f64> = routes
        .iter()
        .map(|route| (route.source_type.as_str(), route.priority_boost))
        .collect();

    let mut best: HashMap<String, SearchResult> = HashMap::new();
    for result in results {
        let key = normalize_url(&result.url);
        match best.get(&key) {
            Some(existing) if existing.score >= result.score => {}
            _ => {
                best.insert(key, result);
            }
        }
    }

    let mut merged: Vec<SearchResult> = best.into_values().collect();
    let effective = |result: &SearchResult| {
        result.score * boosts.get(result.source_type.as_str()).copied().unwrap_or(1.0)
    };
    merged.sort_by(|a, b| {
        effective(b)
            .partial_cmp(&effective(a))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut per_domain: HashMap<String, usize> = HashMap::new();
    merged.retain(|result| {
        let domain = domain_of(&result.url);
        let count = per_domain.entry(domain).or_insert(0);
        *count += 1;
        *count <= max_per_domain.max(1)
    });
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(url: &str, score: f64, source_type: &str) -> SearchResult {
        SearchResult {
            title: url.to_string(),
            url: url.to_string(),
            snippet: String::new(),
            score,
            source_type: source_type.to_string(),
            published_at: None,
        }
    }

    fn route(source_type: &str, boost: f64) -> SearchRoute {
        SearchRoute {
            source_type: source_type.to_string(),
            sites: vec![],
            recency_days: None,
            max_results: 10,
            priority_boost: boost,
            category: None,
        }
    }

    #[test]
    fn test_normalize_url_dedup_forms() {
        assert_eq!(
            normalize_url("https://example.com/a/"),
            normalize_url("HTTPS://EXAMPLE.COM/a")
        );
        assert_eq!(
            normalize_url("http://example.com:80/x?utm_campaign=c"),
            "http://example.com/x"
        );
        assert_eq!(normalize_url("example.com/page"), "https://example.com/page");
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://www.example.com/path"), "example.com");
        assert_eq!(domain_of("http://sub.example.org:8080/x"), "sub.example.org");
    }

    #[test]
    fn test_merge_dedup_keeps_best_score() {
        let merged = merge_results(
            vec![
                result("https://example.com/a", 0.5, "web"),
                result("https://example.com/a/", 0.9, "web"),
            ],
            &[route("web", 1.0)],
            3,
        );
        assert_eq!(merged.len(), 1);
        assert!((merged[0].score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_merge_priority_boost_ordering() {
        let merged = merge_results(
            vec![
                result("https://a.com/1", 0.6, "web"),
                result("https://b.com/1", 0.5, "academic"),
            ],
            &[route("web", 1.0), route("academic", 2.0)],
            3,
        );
        // academic 0.5 * 2.0 = 1.0 beats web 0.6.
        assert_eq!(merged[0].source_type, "academic");
    }

    #[test]
    fn test_merge_max_per_domain() {
        let merged = merge_results(
            vec![
                result("https://a.com/1", 0.9, "web"),
                result("https://a.com/2", 0.8, "web"),
                result("https://a.com/3", 0.7, "web"),
                result("https://b.com/1", 0.6, "web"),
            ],
            &[route("web", 1.0)],
            2,
        );
        let from_a = merged.iter().filter(|r| domain_of(&r.url) == "a.com").count();
        assert_eq!(from_a, 2);
        assert!(merged.iter().any(|r| domain_of(&r.url) == "b.com"));
    }

    #[test]
    fn test_build_routes_localized_override() {
        let mut config = SearchRoutingConfig {
            routes: vec![route("news", 1.0)],
            localized: HashMap::new(),
            max_per_domain: 3,
        };
        let mut localized_news = route("news", 1.5);
        localized_news.sites = vec!["lemonde.fr".into()];
        config.localized.insert("fr".into(), vec![localized_news]);

        let default = build_routes(&config, &["news".into()], None);
        assert!(default[0].sites.is_empty());

        let french = build_routes(&config, &["news".into()], Some("fr"));
        assert_eq!(french[0].sites, vec!["lemonde.fr"]);

        let unknown = build_routes(&config, &["blogs".into()], None);
        assert!(unknown.is_empty());
    }
}
