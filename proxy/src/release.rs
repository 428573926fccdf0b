//! The balancer-phase release selector: given the primary pool the
//! router named, decide which member of its release group serves this
//! request.
//!
//! Order of evaluation: sticky release cookie, match rules, weight draw,
//! legacy canary, then empty-endpoint failover.

use crate::state::{RequestInfo, Shaping, Snapshot};
use rand::Rng;

/// Sticky release cookie lifetime: eight hours.
const RELEASE_COOKIE_MAX_AGE_SECS: u32 = 8 * 60 * 60;

#[derive(Debug, PartialEq)]
pub enum Selection {
    Pool {
        name: String,
        set_cookie: Option<String>,
    },
    /// Every member of the group is drained.
    Unavailable,
}

fn release_cookie(shaping: &Shaping, pool: &str, info: &RequestInfo<'_>, location_path: &str) -> String {
    let mut cookie = format!(
        "{}={pool}; Path={location_path}; Max-Age={RELEASE_COOKIE_MAX_AGE_SECS}",
        shaping.cookie_name
    );
    if info.tls {
        cookie.push_str("; Secure");
    }
    cookie.push_str("; HttpOnly");
    cookie
}

/// The raw choice before failover: which pool the policy wants, plus
/// whether a weight draw should be pinned.
struct Choice<'a> {
    target: &'a str,
    pin: bool,
}

fn decide<'a>(
    shaping: &Shaping,
    primary: &'a str,
    alternative: &'a str,
    info: &RequestInfo<'_>,
) -> Choice<'a> {
    // 1. Sticky short-circuit: a cookie naming a group member wins
    //    outright; any other value is ignored.
    if !shaping.host_path.is_empty() {
        if let Some(value) = info.cookie(&shaping.cookie_name) {
            if value == primary {
                return Choice { target: primary, pin: false };
            }
            if value == alternative {
                return Choice { target: alternative, pin: false };
            }
        }
    }

    let weight_enabled = !shaping.service_weight.is_empty();

    // 2. Match rules: the rule claims the sibling it is keyed by. A hit
    //    selects that sibling; a miss falls to the weight draw, or to
    //    the opposite sibling when weights are off.
    if !shaping.rules.is_empty() {
        for candidate in [primary, alternative] {
            if let Some(rule) = shaping.rules.get(candidate) {
                if rule.evaluate(info) {
                    return Choice { target: candidate, pin: false };
                }
            }
        }
        if !weight_enabled {
            let claimed = [primary, alternative]
                .into_iter()
                .find(|name| shaping.rules.contains_key(*name))
                .unwrap_or(primary);
            let opposite = if claimed == primary { alternative } else { primary };
            return Choice { target: opposite, pin: false };
        }
    }

    // 3. Weight draw against the alternative's percent: 0 never, 100
    //    always. The outcome is pinned into the sticky cookie.
    if weight_enabled {
        let alternative_percent = shaping
            .service_weight
            .get(alternative)
            .copied()
            .unwrap_or_else(|| {
                100u32.saturating_sub(
                    shaping.service_weight.get(primary).copied().unwrap_or(100),
                )
            });
        let draw = rand::rng().random_range(1..=100);
        let target = if draw <= alternative_percent {
            alternative
        } else {
            primary
        };
        return Choice { target, pin: !shaping.host_path.is_empty() };
    }

    // 4. Legacy canary: header, then cookie tokens, then weight; any
    //    positive match routes to the alternative.
    if let Some(legacy) = &shaping.legacy {
        if !legacy.header.is_empty() {
            let value = info.header(&legacy.header);
            let matched = if !legacy.header_value.is_empty() {
                value == legacy.header_value
            } else if let Some(pattern) = &legacy.header_pattern {
                pattern.is_match(value)
            } else {
                false
            };
            if matched {
                return Choice { target: alternative, pin: false };
            }
        }

        if !legacy.cookie.is_empty() {
            match info.cookie(&legacy.cookie).as_deref() {
                Some("always") => return Choice { target: alternative, pin: false },
                Some("never") => return Choice { target: primary, pin: false },
                _ => {}
            }
        }

        if legacy.weight > 0 {
            let draw = rand::rng().random_range(1..=100);
            if draw <= legacy.weight {
                return Choice { target: alternative, pin: false };
            }
        }
    }

    Choice { target: primary, pin: false }
}

/// Selects the pool that serves this request. `primary` is whatever the
/// router published; the group link may live on either side since a
/// drained pool leaves the table.
pub fn select(
    snapshot: &Snapshot,
    primary: &str,
    info: &RequestInfo<'_>,
    location_path: &str,
) -> Selection {
    let sibling = snapshot.sibling_of(primary);

    let Some(sibling) = sibling else {
        // Not part of a release group.
        return if snapshot.has_peers(primary) {
            Selection::Pool {
                name: primary.to_string(),
                set_cookie: None,
            }
        } else {
            Selection::Unavailable
        };
    };
    let alternative = sibling.backend.name.as_str();

    let shaping = snapshot
        .backend(primary)
        .and_then(|view| view.shaping.as_ref())
        .or(sibling.shaping.as_ref());

    let choice = match shaping {
        Some(shaping) => decide(shaping, primary, alternative, info),
        None => Choice {
            target: primary,
            pin: false,
        },
    };

    // Empty-endpoint failover: a drained target falls through to its
    // sibling; both drained is a 503.
    let target = if snapshot.has_peers(choice.target) {
        choice.target
    } else {
        let other = if choice.target == primary { alternative } else { primary };
        if !snapshot.has_peers(other) {
            return Selection::Unavailable;
        }
        other
    };

    let set_cookie = (choice.pin && target == choice.target)
        .then(|| shaping.map(|s| release_cookie(s, target, info, location_path)))
        .flatten();

    Selection::Pool {
        name: target.to_string(),
        set_cookie,
    }
}
