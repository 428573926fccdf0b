//! Ingress annotation parsing.
//!
//! Every feature parses independently; a malformed annotation is logged
//! against its ingress and the feature reverts to its default, so one bad
//! value never takes down the rest of the sync.

use crate::ingress::Ingress;
use ipnetwork::Ipv4Network;
use regex::Regex;
use shared::tables::{
    CookieSessionAffinity, MatchPattern, MatchRule, SessionAffinityConfig, Ticket,
    UpstreamHashByConfig,
};
use std::collections::HashMap;
use std::sync::OnceLock;

pub const ANNOTATION_PREFIX: &str = "nginx.ingress.kubernetes.io";

const DEFAULT_AFFINITY_COOKIE: &str = "route";
const DEFAULT_AFFINITY_HASH: &str = "md5";
const DEFAULT_HASH_SUBSET_SIZE: u32 = 3;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum AnnotationError {
    #[error("invalid content in annotation {name}: {content}")]
    InvalidContent { name: &'static str, content: String },
}

impl AnnotationError {
    fn invalid(name: &'static str, content: impl Into<String>) -> Self {
        AnnotationError::InvalidContent {
            name,
            content: content.into(),
        }
    }
}

fn get(ingress: &Ingress, name: &str) -> Option<String> {
    ingress
        .metadata
        .annotations
        .get(&format!("{ANNOTATION_PREFIX}/{name}"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn get_bool(ingress: &Ingress, name: &str) -> Option<bool> {
    get(ingress, name).map(|v| v == "true")
}

/// Blue/green split parsed from `service-weight`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceWeight {
    /// Service name (not yet canonical) to normalised percent.
    pub weights: HashMap<String, u32>,
}

/// Parses `service-weight: "svcA: 20, svcB: 80"`.
///
/// A single parsed entry `w` keeps `100*w/(100+w)` for itself (the
/// colleague implicitly holds the rest); with more entries the first two
/// in textual order are kept and normalised so the pair sums to 100
/// under integer division.
pub fn parse_service_weight(raw: &str) -> Result<Option<ServiceWeight>, AnnotationError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let mut entries: Vec<(String, u32)> = Vec::new();
    for pair in raw.split(',') {
        let mut kv = pair.splitn(2, ':');
        let name = kv.next().unwrap_or("").trim();
        let value = kv.next().ok_or_else(|| {
            AnnotationError::invalid("service-weight", raw)
        })?;
        if name.is_empty() {
            return Err(AnnotationError::invalid("service-weight", raw));
        }
        let weight: u32 = value
            .trim()
            .parse()
            .map_err(|_| AnnotationError::invalid("service-weight", raw))?;

        match entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, w)) => *w = weight,
            None => entries.push((name.to_string(), weight)),
        }
    }

    let mut weights = HashMap::new();
    match entries.as_slice() {
        [] => return Ok(None),
        [(service, weight)] => {
            weights.insert(service.clone(), 100 * weight / (100 + weight));
        }
        [first, second, ..] => {
            let total = first.1 + second.1;
            if total == 0 {
                return Err(AnnotationError::invalid("service-weight", raw));
            }
            weights.insert(first.0.clone(), 100 * first.1 / total);
            weights.insert(second.0.clone(), 100 * second.1 / total);
        }
    }

    Ok(Some(ServiceWeight { weights }))
}

/// Gray-release claims parsed from `service-match`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceMatch {
    pub rules: HashMap<String, MatchRule>,
}

fn match_group_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"[^,.]+?: *(header|cookie|query)\(.+?,.+?\)"#).unwrap())
}

fn match_clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(.+?): *(header|cookie|query)\("(.+?)",(.+?)\)"#).unwrap())
}

/// Parses `service-match: 'svcA: header("X", /re/), svcB: cookie("Y", "z")'`.
///
/// The string is split into clauses by a group matcher, then each clause
/// yields a `(service, ticket, key, value)` tuple. A value wrapped in
/// `/.../` is a regex, one wrapped in `"..."` is an exact literal;
/// anything else is invalid.
pub fn parse_service_match(raw: &str) -> Result<Option<ServiceMatch>, AnnotationError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }

    let mut rules = HashMap::new();
    for clause in match_group_regex().find_iter(raw) {
        let (service, rule) = parse_match_clause(clause.as_str())?;
        rules.insert(service, rule);
    }

    if rules.is_empty() {
        return Ok(None);
    }
    Ok(Some(ServiceMatch { rules }))
}

fn parse_match_clause(clause: &str) -> Result<(String, MatchRule), AnnotationError> {
    let captures = match_clause_regex()
        .captures(clause)
        .ok_or_else(|| AnnotationError::invalid("service-match", clause))?;

    let service = captures[1].trim().to_string();
    if service.is_empty() {
        return Err(AnnotationError::invalid("service-match", clause));
    }

    let ticket = match &captures[2] {
        "header" => Ticket::Header,
        "cookie" => Ticket::Cookie,
        "query" => Ticket::Query,
        _ => return Err(AnnotationError::invalid("service-match", clause)),
    };

    let key = captures[3].trim().to_string();
    if key.is_empty() {
        return Err(AnnotationError::invalid("service-match", clause));
    }

    let pattern = parse_pattern_value(captures[4].trim())
        .ok_or_else(|| AnnotationError::invalid("service-match", clause))?;

    Ok((service, MatchRule { ticket, key, pattern }))
}

fn parse_pattern_value(value: &str) -> Option<MatchPattern> {
    let slashed = value.strip_prefix('/').and_then(|v| v.strip_suffix('/'));
    if let Some(re) = slashed {
        return (!re.is_empty()).then(|| MatchPattern::Regex(re.to_string()));
    }

    let quoted = value.strip_prefix('"').and_then(|v| v.strip_suffix('"'));
    if let Some(lit) = quoted {
        return (!lit.is_empty()).then(|| MatchPattern::Exact(lit.to_string()));
    }

    None
}

/// Parses `whitelist-source-range`. Bare addresses count as /32; only
/// IPv4 ranges are accepted in this revision.
pub fn parse_whitelist(raw: &str) -> Result<Vec<Ipv4Network>, AnnotationError> {
    raw.split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<Ipv4Network>()
                .map_err(|_| AnnotationError::invalid("whitelist-source-range", raw))
        })
        .collect()
}

#[derive(Clone, Debug, PartialEq)]
pub struct RedirectConfig {
    pub url: String,
    pub code: u16,
}

fn parse_redirect(ingress: &Ingress) -> Result<Option<RedirectConfig>, AnnotationError> {
    if let Some(url) = get(ingress, "permanent-redirect") {
        let code = match get(ingress, "permanent-redirect-code") {
            Some(raw) => {
                let code: u16 = raw
                    .parse()
                    .map_err(|_| AnnotationError::invalid("permanent-redirect-code", raw.clone()))?;
                if !(300..=308).contains(&code) {
                    return Err(AnnotationError::invalid("permanent-redirect-code", raw));
                }
                code
            }
            None => 301,
        };
        return Ok(Some(RedirectConfig { url, code }));
    }

    if let Some(url) = get(ingress, "temporal-redirect") {
        return Ok(Some(RedirectConfig { url, code: 302 }));
    }

    Ok(None)
}

/// Legacy canary configuration (`canary: "true"` plus its by-* fields).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Canary {
    pub enabled: bool,
    pub header: String,
    pub header_value: String,
    pub header_pattern: String,
    pub cookie: String,
    pub weight: u32,
}

fn parse_canary(ingress: &Ingress) -> Result<Canary, AnnotationError> {
    let enabled = get_bool(ingress, "canary").unwrap_or(false);
    if !enabled {
        return Ok(Canary::default());
    }

    let weight = match get(ingress, "canary-weight") {
        Some(raw) => raw
            .parse()
            .map_err(|_| AnnotationError::invalid("canary-weight", raw))?,
        None => 0,
    };

    Ok(Canary {
        enabled,
        header: get(ingress, "canary-by-header").unwrap_or_default(),
        header_value: get(ingress, "canary-by-header-value").unwrap_or_default(),
        header_pattern: get(ingress, "canary-by-header-pattern").unwrap_or_default(),
        cookie: get(ingress, "canary-by-cookie").unwrap_or_default(),
        weight,
    })
}

fn parse_session_affinity(ingress: &Ingress) -> Result<Option<SessionAffinityConfig>, AnnotationError> {
    let Some(affinity) = get(ingress, "affinity") else {
        return Ok(None);
    };
    if affinity != "cookie" {
        return Err(AnnotationError::invalid("affinity", affinity));
    }

    let hash = get(ingress, "session-cookie-hash")
        .unwrap_or_else(|| DEFAULT_AFFINITY_HASH.to_string());
    if hash != "md5" && hash != "sha1" {
        return Err(AnnotationError::invalid("session-cookie-hash", hash));
    }

    for name in ["session-cookie-expires", "session-cookie-max-age"] {
        if let Some(raw) = get(ingress, name) {
            if raw.parse::<u64>().is_err() {
                return Err(AnnotationError::InvalidContent {
                    name: "session-cookie-expires",
                    content: raw,
                });
            }
        }
    }

    Ok(Some(SessionAffinityConfig {
        name: affinity,
        mode: get(ingress, "affinity-mode").unwrap_or_default(),
        cookie: CookieSessionAffinity {
            name: get(ingress, "session-cookie-name")
                .unwrap_or_else(|| DEFAULT_AFFINITY_COOKIE.to_string()),
            hash,
            expires: get(ingress, "session-cookie-expires").unwrap_or_default(),
            max_age: get(ingress, "session-cookie-max-age").unwrap_or_default(),
            locations: HashMap::new(),
        },
    }))
}

fn parse_upstream_hash_by(ingress: &Ingress) -> Option<UpstreamHashByConfig> {
    let key = get(ingress, "upstream-hash-by")?;
    let subset_size = get(ingress, "upstream-hash-by-subset-size")
        .and_then(|raw| raw.parse().ok())
        .filter(|n| *n > 0);

    Some(UpstreamHashByConfig {
        key,
        subset: subset_size.is_some(),
        subset_size: subset_size.unwrap_or(DEFAULT_HASH_SUBSET_SIZE),
    })
}

/// Everything the table builder reads off one ingress.
#[derive(Clone, Debug, Default)]
pub struct Annotations {
    pub service_weight: Option<ServiceWeight>,
    pub service_match: Option<ServiceMatch>,
    pub canary: Canary,
    pub whitelist: Vec<Ipv4Network>,
    pub redirect: Option<RedirectConfig>,
    pub rewrite_target: String,
    pub app_root: String,
    pub ssl_redirect: bool,
    pub force_ssl_redirect: bool,
    pub load_balance: Option<String>,
    pub upstream_hash_by: Option<UpstreamHashByConfig>,
    pub session_affinity: Option<SessionAffinityConfig>,
    pub aliases: Vec<String>,
}

impl Annotations {
    /// True when this ingress declares release semantics (and is not a
    /// plain canary ingress).
    pub fn is_release(&self) -> bool {
        !self.canary.enabled && (self.service_weight.is_some() || self.service_match.is_some())
    }

    pub fn parse(ingress: &Ingress) -> Annotations {
        let mut annotations = Annotations {
            rewrite_target: get(ingress, "rewrite-target").unwrap_or_default(),
            app_root: get(ingress, "app-root").unwrap_or_default(),
            ssl_redirect: get_bool(ingress, "ssl-redirect").unwrap_or(false),
            force_ssl_redirect: get_bool(ingress, "force-ssl-redirect").unwrap_or(false),
            load_balance: get(ingress, "load-balance"),
            upstream_hash_by: parse_upstream_hash_by(ingress),
            aliases: get(ingress, "server-alias")
                .map(|raw| {
                    raw.split(',')
                        .map(|a| a.trim().to_string())
                        .filter(|a| !a.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            ..Default::default()
        };

        let ingress_ref = format!("{}/{}", ingress.metadata.namespace, ingress.metadata.name);
        let mut report = |feature: &str, err: AnnotationError| {
            tracing::warn!(ingress = %ingress_ref, %feature, error = %err, "ignoring invalid annotation");
        };

        if let Some(raw) = get(ingress, "service-weight") {
            match parse_service_weight(&raw) {
                Ok(weight) => annotations.service_weight = weight,
                Err(err) => report("service-weight", err),
            }
        }
        if let Some(raw) = get(ingress, "service-match") {
            match parse_service_match(&raw) {
                Ok(rules) => annotations.service_match = rules,
                Err(err) => report("service-match", err),
            }
        }
        match parse_canary(ingress) {
            Ok(canary) => annotations.canary = canary,
            Err(err) => report("canary", err),
        }
        if let Some(raw) = get(ingress, "whitelist-source-range") {
            match parse_whitelist(&raw) {
                Ok(whitelist) => annotations.whitelist = whitelist,
                Err(err) => report("whitelist-source-range", err),
            }
        }
        match parse_redirect(ingress) {
            Ok(redirect) => annotations.redirect = redirect,
            Err(err) => report("redirect", err),
        }
        match parse_session_affinity(ingress) {
            Ok(affinity) => annotations.session_affinity = affinity,
            Err(err) => report("affinity", err),
        }

        annotations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::Metadata;

    fn ingress_with(annotations: &[(&str, &str)]) -> Ingress {
        Ingress {
            metadata: Metadata {
                namespace: "default".into(),
                name: "test".into(),
                annotations: annotations
                    .iter()
                    .map(|(k, v)| (format!("{ANNOTATION_PREFIX}/{k}"), v.to_string()))
                    .collect(),
            },
            rules: vec![],
        }
    }

    #[test]
    fn service_weight_two_entries() {
        let weight = parse_service_weight("old-svc: 20, new-svc: 80")
            .unwrap()
            .unwrap();
        assert_eq!(weight.weights["old-svc"], 20);
        assert_eq!(weight.weights["new-svc"], 80);
    }

    #[test]
    fn service_weight_normalises_to_percent() {
        let weight = parse_service_weight("a: 1, b: 3").unwrap().unwrap();
        assert_eq!(weight.weights["a"], 25);
        assert_eq!(weight.weights["b"], 75);
    }

    #[test]
    fn service_weight_single_entry() {
        // One entry keeps 100*w/(100+w); its colleague implicitly holds
        // the remainder.
        let weight = parse_service_weight("new-svc: 25").unwrap().unwrap();
        assert_eq!(weight.weights["new-svc"], 20);
    }

    #[test]
    fn service_weight_keeps_first_two() {
        let weight = parse_service_weight("a: 50, b: 50, c: 50").unwrap().unwrap();
        assert_eq!(weight.weights.len(), 2);
        assert_eq!(weight.weights["a"], 50);
        assert_eq!(weight.weights["b"], 50);
    }

    #[test]
    fn service_weight_rejects_malformed() {
        assert!(parse_service_weight("just-a-name").is_err());
        assert!(parse_service_weight(": 20").is_err());
        assert!(parse_service_weight("svc: twenty").is_err());
        assert!(parse_service_weight("svc: -3").is_err());
        assert_eq!(parse_service_weight("  ").unwrap(), None);
    }

    #[test]
    fn service_match_header_regex() {
        let rules = parse_service_match(r#"new-svc: header("Foo", /bar|rab/)"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            rules.rules["new-svc"],
            MatchRule {
                ticket: Ticket::Header,
                key: "Foo".into(),
                pattern: MatchPattern::Regex("bar|rab".into()),
            }
        );
    }

    #[test]
    fn service_match_multiple_clauses() {
        let rules = parse_service_match(
            r#"svc1: header("name", /value/), svc2: cookie("name", "value")"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(rules.rules.len(), 2);
        assert_eq!(rules.rules["svc2"].ticket, Ticket::Cookie);
        assert_eq!(
            rules.rules["svc2"].pattern,
            MatchPattern::Exact("value".into())
        );
    }

    #[test]
    fn service_match_query_ticket() {
        let rules = parse_service_match(r#"svc: query("foo", "bar")"#).unwrap().unwrap();
        assert_eq!(rules.rules["svc"].ticket, Ticket::Query);
    }

    #[test]
    fn service_match_rejects_bare_value() {
        // Neither /re/ nor "literal": the clause parses but the value
        // shape is invalid.
        assert!(parse_service_match(r#"svc: header("Foo", bar)"#).is_err());
    }

    #[test]
    fn service_match_ignores_unmatchable_input() {
        assert_eq!(parse_service_match("no rules here").unwrap(), None);
    }

    #[test]
    fn whitelist_accepts_cidrs_and_bare_ips() {
        let list = parse_whitelist("100.100.100.0/24, 127.0.0.1").unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].contains("100.100.100.57".parse().unwrap()));
        assert_eq!(list[1].prefix(), 32);
    }

    #[test]
    fn whitelist_rejects_garbage() {
        assert!(parse_whitelist("not-a-cidr").is_err());
    }

    #[test]
    fn redirect_codes() {
        let ing = ingress_with(&[("permanent-redirect", "https://example.com")]);
        let redirect = parse_redirect(&ing).unwrap().unwrap();
        assert_eq!(redirect.code, 301);

        let ing = ingress_with(&[
            ("permanent-redirect", "https://example.com"),
            ("permanent-redirect-code", "308"),
        ]);
        assert_eq!(parse_redirect(&ing).unwrap().unwrap().code, 308);

        let ing = ingress_with(&[
            ("permanent-redirect", "https://example.com"),
            ("permanent-redirect-code", "404"),
        ]);
        assert!(parse_redirect(&ing).is_err());

        let ing = ingress_with(&[("temporal-redirect", "https://example.com")]);
        assert_eq!(parse_redirect(&ing).unwrap().unwrap().code, 302);
    }

    #[test]
    fn invalid_weight_reverts_feature_only() {
        let ing = ingress_with(&[
            ("service-weight", "broken"),
            ("rewrite-target", "/$1"),
        ]);
        let annotations = Annotations::parse(&ing);
        assert!(annotations.service_weight.is_none());
        assert_eq!(annotations.rewrite_target, "/$1");
    }

    #[test]
    fn session_affinity_defaults() {
        let ing = ingress_with(&[("affinity", "cookie")]);
        let affinity = Annotations::parse(&ing).session_affinity.unwrap();
        assert_eq!(affinity.cookie.name, "route");
        assert_eq!(affinity.cookie.hash, "md5");
    }

    #[test]
    fn release_flag() {
        let ing = ingress_with(&[("service-weight", "a: 50, b: 50")]);
        assert!(Annotations::parse(&ing).is_release());

        // A plain canary ingress is not a release ingress.
        let ing = ingress_with(&[
            ("service-weight", "a: 50, b: 50"),
            ("canary", "true"),
        ]);
        assert!(!Annotations::parse(&ing).is_release());
    }
}
