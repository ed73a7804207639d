//! GeoSite Matcher: a domain catalog built from the `v2ray-rules-dat`
//! line grammar (`full:`/`domain:`/`keyword:`/`regexp:`/`include:`).

use std::collections::HashSet;

use regex::Regex;

/// Immutable, parsed GeoSite catalog. Replaced wholesale by the Data
/// Catalog Manager on refresh — never mutated in place.
#[derive(Debug, Default)]
pub struct GeoSiteCatalog {
    exact_domains: HashSet<String>,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
    /// `include:`/`geosite:` directives are recorded but never expanded.
    pub includes: Vec<String>,
}

impl GeoSiteCatalog {
    pub fn exact_domain_count(&self) -> usize {
        self.exact_domains.len()
    }

    pub fn keyword_count(&self) -> usize {
        self.keywords.len()
    }

    pub fn regex_count(&self) -> usize {
        self.regexes.len()
    }

    /// Parse the GeoSite text format, line by line.
    pub fn parse(text: &str) -> Self {
        let mut exact_domains = HashSet::new();
        let mut keywords = Vec::new();
        let mut regexes = Vec::new();
        let mut includes = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix("full:") {
                insert_domain(&mut exact_domains, rest);
            } else if let Some(rest) = line.strip_prefix("domain:") {
                insert_domain(&mut exact_domains, rest);
            } else if let Some(rest) = line.strip_prefix("keyword:") {
                let kw = rest.trim();
                if !kw.is_empty() {
                    keywords.push(kw.to_ascii_lowercase());
                }
            } else if let Some(rest) = line.strip_prefix("regexp:") {
                let pattern = rest.trim();
                if !pattern.is_empty() {
                    match regex::RegexBuilder::new(pattern).case_insensitive(true).build() {
                        Ok(re) => regexes.push(re),
                        Err(e) => tracing::warn!(pattern, error = %e, "invalid GeoSite regexp, skipping"),
                    }
                }
            } else if let Some(rest) = line.strip_prefix("include:") {
                record_include(&mut includes, rest);
            } else if let Some(rest) = line.strip_prefix("geosite:") {
                record_include(&mut includes, rest);
            } else {
                insert_domain(&mut exact_domains, line);
            }
        }

        if !includes.is_empty() {
            tracing::warn!(count = includes.len(), "GeoSite include directives are not expanded");
        }

        Self {
            exact_domains,
            keywords,
            regexes,
            includes,
        }
    }

    /// Exact match, then suffix chop, then keyword substring, then regex
    /// search. Short-circuits on first match; no reverse check.
    pub fn matches(&self, query: &str) -> bool {
        let q = query.to_ascii_lowercase();
        if self.exact_domains.contains(&q) {
            return true;
        }
        let labels: Vec<&str> = q.split('.').collect();
        for i in 1..labels.len() {
            let suffix = labels[i..].join(".");
            if self.exact_domains.contains(&suffix) {
                return true;
            }
        }
        if self.keywords.iter().any(|kw| q.contains(kw.as_str())) {
            return true;
        }
        if self.regexes.iter().any(|re| re.is_match(&q)) {
            return true;
        }
        false
    }
}

fn insert_domain(set: &mut HashSet<String>, raw: &str) {
    let d = raw.trim();
    if !d.is_empty() {
        set.insert(d.to_ascii_lowercase());
    }
}

fn record_include(includes: &mut Vec<String>, raw: &str) {
    let item = raw.trim();
    if !item.is_empty() {
        includes.push(item.to_string());
    }
}
