//! Release linking: turns the per-ingress weight/match annotations into
//! traffic shaping policy on the pools, and cross-links pools sharing a
//! (host, path) into symmetric release groups.

use crate::annotations::Annotations;
use crate::ingress::Ingress;
use crate::upstreams::upstream_name;
use shared::tables::{Backend, TrafficShapingPolicy};
use std::collections::HashMap;

/// Attaches the release traffic shaping policy to one pool of a release
/// ingress. Weight and match keys are rewritten from service names to
/// canonical pool names; services the ingress does not route to are
/// dropped.
pub fn configure_release_policy(
    backend: &mut Backend,
    ingress: &Ingress,
    annotations: &Annotations,
    host_path: &str,
) {
    if !annotations.is_release() {
        return;
    }

    backend.traffic_shaping_policy = TrafficShapingPolicy {
        host_path: host_path.to_string(),
        ..Default::default()
    };

    if let Some(weight) = &annotations.service_weight {
        for (service, percent) in &weight.weights {
            if let Some(name) = ingress.upstream_name_for(service) {
                backend
                    .traffic_shaping_policy
                    .service_weight
                    .insert(name, *percent);
            }
        }
    }

    if let Some(matches) = &annotations.service_match {
        for (service, rule) in &matches.rules {
            if let Some(name) = ingress.upstream_name_for(service) {
                backend
                    .traffic_shaping_policy
                    .service_match
                    .insert(name, rule.clone());
            }
        }
    }
}

/// Links release siblings: within each rule of each release ingress,
/// paths with the same literal value whose pools exist in the table form
/// a group, and every member's `alternative_backends` becomes the group
/// minus itself.
pub fn link_alternative_backends(
    release_ingresses: &[&Ingress],
    upstreams: &mut HashMap<String, Backend>,
) {
    for ingress in release_ingresses {
        for rule in &ingress.rules {
            let mut colleagues: HashMap<&str, Vec<String>> = HashMap::new();
            for path in &rule.paths {
                let name = upstream_name(
                    &ingress.metadata.namespace,
                    &path.backend.service_name,
                    &path.backend.service_port,
                );
                if !upstreams.contains_key(&name) {
                    continue;
                }
                colleagues.entry(path.path.as_str()).or_default().push(name);
            }

            for group in colleagues.values() {
                if group.len() < 2 {
                    continue;
                }
                for member in group {
                    let alternatives: Vec<String> =
                        group.iter().filter(|b| *b != member).cloned().collect();
                    if let Some(backend) = upstreams.get_mut(member) {
                        backend.alternative_backends = alternatives;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::{HttpPath, IngressBackend, IngressRule, Metadata};

    fn release_ingress() -> Ingress {
        Ingress {
            metadata: Metadata {
                namespace: "default".into(),
                name: "bg".into(),
                annotations: HashMap::from([(
                    "nginx.ingress.kubernetes.io/service-weight".to_string(),
                    "old: 50, new: 50".to_string(),
                )]),
            },
            rules: vec![IngressRule {
                host: "bg50.release.com".into(),
                paths: vec![
                    HttpPath {
                        path: "/".into(),
                        backend: IngressBackend {
                            service_name: "old".into(),
                            service_port: "80".into(),
                        },
                    },
                    HttpPath {
                        path: "/".into(),
                        backend: IngressBackend {
                            service_name: "new".into(),
                            service_port: "80".into(),
                        },
                    },
                ],
            }],
        }
    }

    fn pools(names: &[&str]) -> HashMap<String, Backend> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    Backend {
                        name: n.to_string(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn links_are_symmetric() {
        let ingress = release_ingress();
        let mut upstreams = pools(&["default-old-80", "default-new-80"]);

        link_alternative_backends(&[&ingress], &mut upstreams);

        assert_eq!(
            upstreams["default-old-80"].alternative_backends,
            vec!["default-new-80"]
        );
        assert_eq!(
            upstreams["default-new-80"].alternative_backends,
            vec!["default-old-80"]
        );
    }

    #[test]
    fn missing_pool_breaks_the_group() {
        let ingress = release_ingress();
        // Only one of the two pools made it into the table; a group of
        // one gets no links.
        let mut upstreams = pools(&["default-old-80"]);

        link_alternative_backends(&[&ingress], &mut upstreams);
        assert!(upstreams["default-old-80"].alternative_backends.is_empty());
    }

    #[test]
    fn different_paths_do_not_group() {
        let mut ingress = release_ingress();
        ingress.rules[0].paths[1].path = "/other".into();
        let mut upstreams = pools(&["default-old-80", "default-new-80"]);

        link_alternative_backends(&[&ingress], &mut upstreams);
        assert!(upstreams["default-old-80"].alternative_backends.is_empty());
        assert!(upstreams["default-new-80"].alternative_backends.is_empty());
    }

    #[test]
    fn policy_uses_canonical_names() {
        let ingress = release_ingress();
        let annotations = Annotations::parse(&ingress);
        let mut backend = Backend {
            name: "default-old-80".into(),
            ..Default::default()
        };

        configure_release_policy(&mut backend, &ingress, &annotations, "bg50.release.com/");

        let policy = &backend.traffic_shaping_policy;
        assert_eq!(policy.host_path, "bg50.release.com/");
        assert_eq!(policy.service_weight["default-old-80"], 50);
        assert_eq!(policy.service_weight["default-new-80"], 50);
    }

    #[test]
    fn unknown_services_are_dropped_from_policy() {
        let mut ingress = release_ingress();
        ingress.metadata.annotations.insert(
            "nginx.ingress.kubernetes.io/service-weight".into(),
            "old: 50, stranger: 50".into(),
        );
        let annotations = Annotations::parse(&ingress);
        let mut backend = Backend::default();

        configure_release_policy(&mut backend, &ingress, &annotations, "bg50.release.com/");
        let weights = &backend.traffic_shaping_policy.service_weight;
        assert_eq!(weights.len(), 1);
        assert!(weights.contains_key("default-old-80"));
    }
}
