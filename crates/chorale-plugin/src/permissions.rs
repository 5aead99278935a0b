//! Network permission enforcement for outbound plugin requests.
//!
//! An http or websocket grant must name a reason and a non-empty set of
//! allowed URL patterns. Requests are checked exact-pattern first, then
//! wildcard patterns, and requests to private or loopback addresses are
//! refused unless the grant opts in to local network access.

use std::collections::HashMap;
use std::net::IpAddr;

use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::error::PluginError;
use crate::manifest::Grant;

// ─── Parsing ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNetworkConstraints {
    #[serde(default)]
    allowed_urls: HashMap<String, Vec<String>>,
    #[serde(default)]
    allow_local_network: bool,
}

/// Compiled form of an http/websocket grant.
#[derive(Debug)]
pub struct NetworkPermissions {
    pub reason: String,
    pub allow_local_network: bool,
    /// Patterns without wildcards, checked first.
    exact: Vec<UrlRule>,
    /// Patterns containing `*`, checked after every exact rule.
    wildcard: Vec<UrlRule>,
}

/// One allowed-URL pattern, decomposed so host wildcards can never leak
/// into the path. A `*` in the host covers a single label (or a numeric
/// run for IP patterns); a trailing `/*` in the path is a prefix match.
#[derive(Debug)]
struct UrlRule {
    pattern: String,
    scheme: String,
    host: String,
    /// Compiled host candidates when the host contains `*`: one regex
    /// treating `*` as a numeric IP run, one as a domain label.
    host_matchers: Vec<Regex>,
    path: String,
    methods: Vec<String>,
}

impl NetworkPermissions {
    /// Compile a grant's constraints into an enforceable rule set.
    ///
    /// Fails construction when the reason is empty, the allowed-URL map is
    /// missing or empty, or a pattern does not parse.
    pub fn from_grant(service: &str, grant: &Grant) -> Result<Self, PluginError> {
        if grant.reason.trim().is_empty() {
            return Err(PluginError::Construction(format!(
                "{service} grant requires a reason"
            )));
        }

        let raw_value = serde_json::Value::Object(grant.constraints.clone());
        let raw: RawNetworkConstraints = serde_json::from_value(raw_value)
            .map_err(|e| PluginError::Construction(format!("{service} grant is malformed: {e}")))?;

        if raw.allowed_urls.is_empty() {
            return Err(PluginError::Construction(format!(
                "{service} grant requires at least one allowed URL"
            )));
        }

        let mut exact = Vec::new();
        let mut wildcard = Vec::new();
        for (pattern, methods) in raw.allowed_urls {
            if methods.is_empty() {
                return Err(PluginError::Construction(format!(
                    "{service} grant pattern {pattern} has no methods"
                )));
            }
            let mut rule = compile_pattern(service, &pattern)?;
            rule.methods = methods.iter().map(|m| m.to_uppercase()).collect();
            if pattern.contains('*') {
                wildcard.push(rule);
            } else {
                exact.push(rule);
            }
        }

        Ok(Self {
            reason: grant.reason.clone(),
            allow_local_network: raw.allow_local_network,
            exact,
            wildcard,
        })
    }

    // ─── Enforcement ────────────────────────────────────────────────────

    /// Check whether a method + URL pair is permitted under this grant.
    pub fn check_request(&self, method: &str, raw_url: &str) -> Result<(), PluginError> {
        let url = Url::parse(raw_url)
            .map_err(|e| PluginError::PermissionDenied(format!("invalid URL {raw_url}: {e}")))?;

        match url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => {
                return Err(PluginError::PermissionDenied(format!(
                    "scheme {other} is not allowed"
                )))
            }
        }

        if !self.allow_local_network {
            if let Some(host) = url.host_str() {
                if is_local_host(host) {
                    return Err(PluginError::PermissionDenied(format!(
                        "local network access to {host} is not allowed"
                    )));
                }
            }
        }

        let host_port = match url.port() {
            Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
            None => url.host_str().unwrap_or_default().to_string(),
        };
        let normalized = normalize_url(&url);
        let method = method.to_uppercase();

        // Exact patterns take priority over wildcard patterns.
        for rule in self.exact.iter().chain(self.wildcard.iter()) {
            if rule.matches(url.scheme(), &host_port, url.path()) {
                if rule.methods.iter().any(|m| m == "*" || *m == method) {
                    return Ok(());
                }
                return Err(PluginError::PermissionDenied(format!(
                    "method {method} not allowed for {} (pattern {})",
                    normalized, rule.pattern
                )));
            }
        }

        Err(PluginError::PermissionDenied(format!(
            "URL {normalized} matches no allowed pattern"
        )))
    }

    /// Host names (with port when present) usable by the sandbox allowlist.
    pub fn allowed_hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for rule in self.exact.iter().chain(self.wildcard.iter()) {
            if let Some(host) = pattern_host(&rule.pattern) {
                if !hosts.contains(&host) {
                    hosts.push(host);
                }
            }
        }
        hosts
    }
}

impl UrlRule {
    fn matches(&self, scheme: &str, host: &str, path: &str) -> bool {
        if self.pattern == "*" {
            return true;
        }
        if self.scheme != scheme {
            return false;
        }
        if !self.host_matches(host) {
            return false;
        }
        // A wildcard pattern with no path component allows any path.
        if (self.path.is_empty() || self.path == "/") && self.pattern.contains('*') {
            return true;
        }
        self.path_matches(path)
    }

    fn host_matches(&self, host: &str) -> bool {
        if self.host == "*" {
            return true;
        }
        if self.host_matchers.is_empty() {
            return self.host == host;
        }
        self.host_matchers.iter().any(|m| m.is_match(host))
    }

    fn path_matches(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let pattern = normalize_path(&self.path);
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            let prefix = if prefix.is_empty() { "/" } else { prefix };
            return path.starts_with(prefix);
        }
        path == pattern
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

/// Decompose a URL pattern into scheme, host, and path parts. Host and
/// path wildcards never see each other's component, so `*.example.com`
/// cannot swallow a `/` and drift into the path.
fn compile_pattern(service: &str, pattern: &str) -> Result<UrlRule, PluginError> {
    if pattern == "*" {
        return Ok(UrlRule {
            pattern: pattern.to_string(),
            scheme: String::new(),
            host: "*".to_string(),
            host_matchers: Vec::new(),
            path: "*".to_string(),
            methods: Vec::new(),
        });
    }

    let (scheme, rest) = pattern.split_once("://").ok_or_else(|| {
        PluginError::Construction(format!(
            "{service} grant pattern {pattern} is missing a scheme"
        ))
    })?;
    let (host, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    if host.is_empty() {
        return Err(PluginError::Construction(format!(
            "{service} grant pattern {pattern} has no host"
        )));
    }

    let mut host_matchers = Vec::new();
    if host != "*" && host.contains('*') {
        // Try the IP reading first, then the single-label domain reading.
        for wildcard in ["[0-9.]+", "[^.]*"] {
            let source = format!("^{}$", regex::escape(host).replace("\\*", wildcard));
            host_matchers.push(Regex::new(&source).map_err(|e| {
                PluginError::Construction(format!("{service} grant pattern {pattern}: {e}"))
            })?);
        }
    }

    Ok(UrlRule {
        pattern: pattern.to_string(),
        scheme: scheme.to_string(),
        host: host.to_string(),
        host_matchers,
        path: path.to_string(),
        methods: Vec::new(),
    })
}

/// Empty paths become `/`; trailing slashes are insignificant.
fn normalize_path(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/"
    } else {
        trimmed
    }
}

fn normalize_url(url: &Url) -> String {
    let mut out = format!(
        "{}://{}",
        url.scheme(),
        url.host_str().unwrap_or_default()
    );
    if let Some(port) = url.port() {
        out.push_str(&format!(":{port}"));
    }
    let path = url.path().trim_end_matches('/');
    out.push_str(path);
    out
}

/// Extract the host component from a URL pattern, keeping `*` labels.
fn pattern_host(pattern: &str) -> Option<String> {
    let rest = pattern.split_once("://").map(|(_, r)| r).unwrap_or(pattern);
    let host = rest.split('/').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

/// True for loopback names, private/link-local IPs, and unqualified hosts.
fn is_local_host(host: &str) -> bool {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || is_unique_local(&v6),
        };
    }
    let lower = bare.to_lowercase();
    lower == "localhost" || lower.ends_with(".localhost") || lower.ends_with(".local")
        || !lower.contains('.')
}

fn is_unique_local(v6: &std::net::Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00 || (v6.segments()[0] & 0xffc0) == 0xfe80
}
