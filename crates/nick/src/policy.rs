//! Request allow/deny rules
//!
//! A rule is either a URL prefix (`https://cdn.example.com/js/`), a bare
//! host prefix (`example.com` also matches `http://example.com...`), or a
//! domain pattern (`*.example.com`, `www.` tolerant). With a whitelist,
//! only matching requests pass; the blacklist is applied after it.

use url::Url;

use crate::config::BrowserConfig;

#[derive(Debug, Clone, Default)]
pub struct UrlPolicy {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
}

impl UrlPolicy {
    pub fn new(whitelist: &[String], blacklist: &[String]) -> Self {
        let normalize = |rules: &[String]| {
            rules
                .iter()
                .map(|r| r.trim().to_ascii_lowercase())
                .filter(|r| !r.is_empty())
                .collect()
        };
        Self {
            whitelist: normalize(whitelist),
            blacklist: normalize(blacklist),
        }
    }

    pub fn from_config(config: &BrowserConfig) -> Self {
        Self::new(&config.whitelist, &config.blacklist)
    }

    /// Whether any rule is configured; otherwise requests are not filtered
    pub fn is_restrictive(&self) -> bool {
        !self.whitelist.is_empty() || !self.blacklist.is_empty()
    }

    pub fn is_url_allowed(&self, url: &str) -> bool {
        // Internal pages are never filtered
        if url == "about:blank" {
            return true;
        }

        let lower = url.to_ascii_lowercase();
        let parsed = Url::parse(&lower).ok();
        if let Some(parsed) = &parsed {
            if matches!(parsed.scheme(), "data" | "blob") {
                return true;
            }
        }
        let host = parsed.as_ref().and_then(|p| p.host_str().map(String::from));

        if !self.whitelist.is_empty()
            && !self
                .whitelist
                .iter()
                .any(|rule| Self::matches(&lower, host.as_deref(), rule))
        {
            tracing::debug!("[UrlPolicy] Not found in whitelist: {}", url);
            return false;
        }

        if let Some(rule) = self
            .blacklist
            .iter()
            .find(|rule| Self::matches(&lower, host.as_deref(), rule))
        {
            tracing::debug!("[UrlPolicy] Blacklisted by \"{}\": {}", rule, url);
            return false;
        }

        true
    }

    fn matches(url: &str, host: Option<&str>, rule: &str) -> bool {
        if url.starts_with(rule)
            || url.starts_with(&format!("http://{}", rule))
            || url.starts_with(&format!("https://{}", rule))
        {
            return true;
        }
        match host {
            Some(host) if !rule.contains('/') => Self::matches_domain(host, rule),
            _ => false,
        }
    }

    /// Exact, `www.`-insensitive, or wildcard domain match
    fn matches_domain(host: &str, pattern: &str) -> bool {
        let bare = host.strip_prefix("www.").unwrap_or(host);
        let pattern_bare = pattern.strip_prefix("www.").unwrap_or(pattern);
        if bare == pattern_bare {
            return true;
        }

        if let Some(domain) = pattern.strip_prefix("*.") {
            return host == domain || host.ends_with(&format!(".{}", domain));
        }

        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            let (prefix, suffix) = (parts[0], parts[1]);
            return host.starts_with(prefix) && host.ends_with(suffix);
        }

        false
    }
}
