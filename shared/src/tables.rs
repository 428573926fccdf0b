//! Wire-format types for the backend and server tables.
//!
//! These are the JSON artifacts the controller publishes and every proxy
//! worker polls. Field names on the wire follow the ingress-nginx
//! configuration payload so the tables stay drop-in compatible with
//! existing tooling; the Rust names are idiomatic snake_case.
//!
//! # Tables
//!
//! 1. **Backend table**: upstream pools with endpoints, load-balancing
//!    inputs, release links (`alternativeBackends`) and the traffic
//!    shaping policy.
//! 2. **Server table**: virtual hosts with an ordered location list and
//!    per-location policy (whitelist, redirect, rewrite).

use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;

/// A single upstream peer. `port` stays a string on the wire because
/// named service ports survive all the way into the table.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub port: String,
}

impl Endpoint {
    /// Builds an endpoint from a resolved IP. IPv6 literals are emitted
    /// bracketed so the address can be joined with the port unambiguously.
    pub fn from_ip(ip: IpAddr, port: &str) -> Self {
        let address = match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        };
        Endpoint {
            address,
            port: port.to_string(),
        }
    }

    /// `address:port` form suitable for a connector.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Kubernetes service type, as published under `service.spec.type`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceType {
    #[default]
    #[serde(rename = "ClusterIP")]
    ClusterIp,
    NodePort,
    LoadBalancer,
    ExternalName,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(rename = "type", default)]
    pub service_type: ServiceType,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub spec: ServiceSpec,
}

/// Cookie-based session affinity, published under
/// `sessionAffinityConfig.cookieSessionAffinity`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CookieSessionAffinity {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hash: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub expires: String,
    #[serde(rename = "maxage", default, skip_serializing_if = "String::is_empty")]
    pub max_age: String,
    /// Hostname to the paths the affinity cookie is scoped to.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub locations: HashMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionAffinityConfig {
    /// Affinity kind; only `"cookie"` is meaningful.
    #[serde(default)]
    pub name: String,
    /// `"balanced"` (default) or `"persistent"`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mode: String,
    #[serde(rename = "cookieSessionAffinity", default)]
    pub cookie: CookieSessionAffinity,
}

impl SessionAffinityConfig {
    pub fn is_cookie(&self) -> bool {
        self.name == "cookie"
    }

    pub fn is_disabled(&self) -> bool {
        self.name.is_empty()
    }
}

/// Consistent-hash inputs, published under `upstreamHashByConfig`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamHashByConfig {
    /// Request variable the hash key is read from, e.g. `$request_uri`.
    #[serde(rename = "upstream-hash-by", default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(rename = "upstream-hash-by-subset", default, skip_serializing_if = "std::ops::Not::not")]
    pub subset: bool,
    #[serde(rename = "upstream-hash-by-subset-size", default)]
    pub subset_size: u32,
}

/// Where a match rule reads its request value from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ticket {
    Header,
    Cookie,
    Query,
}

/// How a match rule compares the extracted value. The variant carries the
/// expected value so a pattern without one cannot be represented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchPattern {
    Exact(String),
    Regex(String),
}

/// A `(ticket, pattern, key, value)` predicate claiming requests for a
/// release sibling.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchRule {
    pub ticket: Ticket,
    pub key: String,
    pub pattern: MatchPattern,
}

// The wire shape is the flat `{ticket, pattern, key, value}` object of the
// ingress-nginx payload; the Rust shape keeps pattern and value fused.
impl Serialize for MatchRule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (pattern, value) = match &self.pattern {
            MatchPattern::Exact(v) => ("exact", v),
            MatchPattern::Regex(v) => ("regex", v),
        };
        let mut s = serializer.serialize_struct("MatchRule", 4)?;
        s.serialize_field("ticket", &self.ticket)?;
        s.serialize_field("pattern", pattern)?;
        s.serialize_field("key", &self.key)?;
        s.serialize_field("value", value)?;
        s.end()
    }
}

impl<'de> Deserialize<'de> for MatchRule {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct RuleVisitor;

        impl<'de> Visitor<'de> for RuleVisitor {
            type Value = MatchRule;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a match rule object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<MatchRule, A::Error> {
                let mut ticket = None;
                let mut pattern: Option<String> = None;
                let mut key = None;
                let mut value: Option<String> = None;
                while let Some(field) = map.next_key::<String>()? {
                    match field.as_str() {
                        "ticket" => ticket = Some(map.next_value()?),
                        "pattern" => pattern = Some(map.next_value()?),
                        "key" => key = Some(map.next_value()?),
                        "value" => value = Some(map.next_value()?),
                        _ => {
                            map.next_value::<de::IgnoredAny>()?;
                        }
                    }
                }
                let ticket = ticket.ok_or_else(|| de::Error::missing_field("ticket"))?;
                let key = key.ok_or_else(|| de::Error::missing_field("key"))?;
                let value = value.ok_or_else(|| de::Error::missing_field("value"))?;
                let pattern = match pattern.as_deref() {
                    Some("regex") => MatchPattern::Regex(value),
                    Some("exact") => MatchPattern::Exact(value),
                    other => {
                        return Err(de::Error::invalid_value(
                            de::Unexpected::Str(other.unwrap_or("")),
                            &"\"exact\" or \"regex\"",
                        ));
                    }
                };
                Ok(MatchRule { ticket, key, pattern })
            }
        }

        deserializer.deserialize_map(RuleVisitor)
    }
}

/// Release traffic shaping attached to the primary pool of a release
/// group, plus the legacy single-pool canary fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficShapingPolicy {
    /// `<host><path>` identity of the release group; also the input for
    /// the sticky release cookie name.
    #[serde(rename = "hostPath", default, skip_serializing_if = "String::is_empty")]
    pub host_path: String,
    /// Pool name to integer percent; at most two entries, summing to 100.
    #[serde(rename = "serviceWeight", default, skip_serializing_if = "HashMap::is_empty")]
    pub service_weight: HashMap<String, u32>,
    /// Pool name to the rule that claims requests for it.
    #[serde(rename = "serviceMatch", default, skip_serializing_if = "HashMap::is_empty")]
    pub service_match: HashMap<String, MatchRule>,

    // Legacy canary mode: a plain header/cookie/weight test against the
    // single alternative, with no release-group bookkeeping.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub header: String,
    #[serde(rename = "headerValue", default, skip_serializing_if = "String::is_empty")]
    pub header_value: String,
    #[serde(rename = "headerPattern", default, skip_serializing_if = "String::is_empty")]
    pub header_pattern: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cookie: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub weight: u32,
}

fn is_zero(v: &u32) -> bool {
    *v == 0
}

impl TrafficShapingPolicy {
    /// True when the policy carries release semantics (as opposed to the
    /// legacy canary fields only).
    pub fn is_release(&self) -> bool {
        !self.service_weight.is_empty() || !self.service_match.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.host_path.is_empty()
            && !self.is_release()
            && self.header.is_empty()
            && self.cookie.is_empty()
            && self.weight == 0
    }
}

/// An upstream pool in the backend table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Backend {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub service: Service,
    #[serde(
        rename = "sessionAffinityConfig",
        default,
        skip_serializing_if = "SessionAffinityConfig::is_disabled"
    )]
    pub session_affinity: SessionAffinityConfig,
    #[serde(rename = "upstreamHashByConfig", default, skip_serializing_if = "Option::is_none")]
    pub upstream_hash_by: Option<UpstreamHashByConfig>,
    /// Explicit algorithm override; when absent the worker derives one
    /// from the affinity and hash-by configs.
    #[serde(rename = "load-balance", default, skip_serializing_if = "Option::is_none")]
    pub load_balance: Option<String>,
    /// Sibling pools in the same release group, group minus self.
    #[serde(rename = "alternativeBackends", default, skip_serializing_if = "Vec::is_empty")]
    pub alternative_backends: Vec<String>,
    #[serde(
        rename = "trafficShapingPolicy",
        default,
        skip_serializing_if = "TrafficShapingPolicy::is_empty"
    )]
    pub traffic_shaping_policy: TrafficShapingPolicy,
}

impl Backend {
    pub fn is_external_name(&self) -> bool {
        self.service.spec.service_type == ServiceType::ExternalName
    }
}

/// Identifies the (namespace, ingress, service, port) a location was built
/// from. Published for downstream observability; the wire name is kept for
/// compatibility with the ingress-nginx payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendRef {
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "ingressName", default)]
    pub ingress_name: String,
    #[serde(rename = "serviceName", default)]
    pub service_name: String,
    #[serde(rename = "servicePort", default)]
    pub service_port: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Whitelist {
    #[serde(default)]
    pub cidr: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Redirect {
    pub url: String,
    #[serde(default = "default_redirect_code")]
    pub code: u16,
}

pub fn default_redirect_code() -> u16 {
    302
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rewrite {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target: String,
    #[serde(rename = "appRoot", default, skip_serializing_if = "String::is_empty")]
    pub app_root: String,
    #[serde(rename = "sslRedirect", default, skip_serializing_if = "std::ops::Not::not")]
    pub ssl_redirect: bool,
    #[serde(rename = "forceSSLRedirect", default, skip_serializing_if = "std::ops::Not::not")]
    pub force_ssl_redirect: bool,
}

impl Rewrite {
    pub fn is_empty(&self) -> bool {
        self.target.is_empty()
            && self.app_root.is_empty()
            && !self.ssl_redirect
            && !self.force_ssl_redirect
    }
}

/// One routable location under a virtual host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Literal prefix, optionally with a trailing regex (`/nginx/?(.*)`).
    pub path: String,
    /// Upstream pool name; empty for pure redirect/rewrite locations.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend: String,
    #[serde(rename = "luaBackend", default)]
    pub backend_ref: BackendRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub whitelist: Option<Whitelist>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect: Option<Redirect>,
    #[serde(default, skip_serializing_if = "Rewrite::is_empty")]
    pub rewrite: Rewrite,
}

/// A virtual host in the server table.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    /// Ordered: ties in longest-path selection break by first-seen.
    #[serde(default)]
    pub locations: Vec<Location>,
}
