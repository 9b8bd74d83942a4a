//! Event templates: local metadata defining the failure modes the fleet is
//! probed for, and how each maps onto probe groups and probes.

use serde_json::json;
use serde_json::Value;
use shoal_domain::catalog;

/// Format-version suffix appended to every probe-group name. Bump when the
/// naming scheme changes so stale groups become identifiable.
pub const GROUP_NAME_VERSION: &str = ";v=1";

/// Placeholder substituted with the service alias in `each`-scoped event
/// classes.
pub const SERVICE_PLACEHOLDER: &str = "$service";

/// Group names created by versions of this toolkit that predate the
/// versioned naming scheme. Removable on update.
const LEGACY_GROUP_NAMES: &[&str] = &["shoal-alarms", "shoal-probes", "fleet-default-alarms"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Minor,
    Major,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Minor => write!(f, "minor"),
            Severity::Major => write!(f, "major"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Operator-facing knowledge article attached to an event template.
#[derive(Debug, Clone)]
pub struct KnowledgeArticle {
    pub severity: Severity,
    pub title: &'static str,
    pub description: &'static str,
    pub impact: &'static str,
    pub response: &'static str,
    pub action: &'static str,
}

/// How an event template expands over the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventScope {
    /// One probe per local instance of the service; with `global`, one probe
    /// per distinct compute node hosting the service instead.
    Service { service: &'static str, global: bool },
    /// Expanded once per probe-supporting service, substituting the service
    /// alias into the event class.
    Each,
    /// One group covering every instance of every probe-supporting service.
    All,
    /// For each instance of `target`, one probe on each instance of
    /// `checker`: the checker is the agent, the target the machine.
    CheckFrom {
        target: &'static str,
        checker: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct CheckTemplate {
    pub check_type: &'static str,
    pub config: Value,
    /// Instance-metadata keys copied into the check's environment.
    pub auto_env: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct EventTemplate {
    /// Dotted event class; `each` templates carry [`SERVICE_PLACEHOLDER`].
    pub event_class: &'static str,
    pub scope: EventScope,
    pub checks: Vec<CheckTemplate>,
    pub article: KnowledgeArticle,
}

/// Probe-group name for an (expanded) event class. Names are the only
/// cross-run identity of a group: equal name ⇔ same logical group.
pub fn group_name(event_class: &str) -> String {
    format!("{}{}", event_class, GROUP_NAME_VERSION)
}

/// Alias used when substituting a service name into an event class. Dotted
/// event classes cannot carry `-`.
pub fn service_alias(service: &str) -> String {
    service.replace('-', "_")
}

/// Every event class the current catalog can produce, post-expansion.
fn expanded_event_classes() -> Vec<String> {
    let mut classes = Vec::new();
    for template in event_catalog() {
        match template.scope {
            EventScope::Each => {
                for service in catalog::probe_targets() {
                    classes.push(
                        template
                            .event_class
                            .replace(SERVICE_PLACEHOLDER, &service_alias(service)),
                    );
                }
            }
            _ => classes.push(template.event_class.to_string()),
        }
    }
    classes
}

/// Whether a deployed probe-group name belongs to this toolkit and may be
/// removed when no longer wanted. Anything else is operator-owned.
pub fn is_removable_group_name(name: &str) -> bool {
    if LEGACY_GROUP_NAMES.contains(&name) {
        return true;
    }
    match name.strip_suffix(GROUP_NAME_VERSION) {
        Some(class) => expanded_event_classes().iter().any(|c| c == class),
        None => false,
    }
}

/// The built-in event catalog.
pub fn event_catalog() -> Vec<EventTemplate> {
    vec![
        EventTemplate {
            event_class: "upset.shoal.nameservice.ping_failed",
            scope: EventScope::Service {
                service: "nameservice",
                global: false,
            },
            checks: vec![CheckTemplate {
                check_type: "cmd",
                config: json!({ "cmd": "svcs -H -o state nameservice", "stdoutMatch": "online" }),
                auto_env: &[],
            }],
            article: KnowledgeArticle {
                severity: Severity::Critical,
                title: "Nameservice instance not responding",
                description: "A nameservice instance failed its liveness check.",
                impact: "Service discovery may be degraded; if a quorum is lost, the fleet cannot elect coordinators.",
                response: "No automated response.",
                action: "Log into the instance and inspect the nameservice SMF log.",
            },
        },
        EventTemplate {
            event_class: "upset.shoal.postgres.replication_lag",
            scope: EventScope::Service {
                service: "postgres",
                global: false,
            },
            checks: vec![CheckTemplate {
                check_type: "cmd",
                config: json!({ "cmd": "pg-lag-check", "threshold": "30s" }),
                auto_env: &["shard"],
            }],
            article: KnowledgeArticle {
                severity: Severity::Major,
                title: "Postgres replication lag above threshold",
                description: "A replica of this shard is lagging its primary.",
                impact: "Failover of the shard would lose recent writes.",
                response: "No automated response.",
                action: "Inspect replication status on the shard's peers.",
            },
        },
        EventTemplate {
            event_class: "upset.shoal.moray.connect_failed",
            scope: EventScope::CheckFrom {
                target: "moray",
                checker: "electric-moray",
            },
            checks: vec![CheckTemplate {
                check_type: "tcp",
                config: json!({ "port": 2020 }),
                auto_env: &[],
            }],
            article: KnowledgeArticle {
                severity: Severity::Major,
                title: "Moray unreachable from routing tier",
                description: "A routing instance cannot connect to a moray instance.",
                impact: "Requests routed to the affected shard will fail.",
                response: "No automated response.",
                action: "Check the moray instance and the network path from the checker.",
            },
        },
        EventTemplate {
            event_class: "upset.shoal.storage.zpool_degraded",
            scope: EventScope::Service {
                service: "storage",
                global: true,
            },
            checks: vec![CheckTemplate {
                check_type: "cmd",
                config: json!({ "cmd": "zpool status -x", "stdoutMatch": "all pools are healthy" }),
                auto_env: &[],
            }],
            article: KnowledgeArticle {
                severity: Severity::Critical,
                title: "Storage pool degraded",
                description: "A storage compute node reports an unhealthy pool.",
                impact: "Objects on the affected node may be at reduced redundancy.",
                response: "No automated response.",
                action: "Run zpool status on the compute node and replace failed devices.",
            },
        },
        EventTemplate {
            event_class: "upset.shoal.medusa.latency_high",
            scope: EventScope::Service {
                service: "medusa",
                global: false,
            },
            checks: vec![CheckTemplate {
                check_type: "http",
                config: json!({ "path": "/ping", "maxResponseTime": 2000 }),
                auto_env: &[],
            }],
            article: KnowledgeArticle {
                severity: Severity::Minor,
                title: "API latency above threshold",
                description: "An API instance is slow to answer its ping endpoint.",
                impact: "End-user requests through this instance are slow.",
                response: "No automated response.",
                action: "Profile the instance; restart it if it does not recover.",
            },
        },
        EventTemplate {
            event_class: "upset.shoal.$service.log_error",
            scope: EventScope::Each,
            checks: vec![CheckTemplate {
                check_type: "log-scan",
                config: json!({ "path": "/var/svc/log/*.log", "match": { "pattern": "ERROR" } }),
                auto_env: &[],
            }],
            article: KnowledgeArticle {
                severity: Severity::Minor,
                title: "Service logged an error",
                description: "An instance wrote an ERROR entry to its service log.",
                impact: "Depends on the error; often none.",
                response: "No automated response.",
                action: "Read the matching log entries on the instance.",
            },
        },
        EventTemplate {
            event_class: "upset.shoal.instance_down",
            scope: EventScope::All,
            checks: vec![CheckTemplate {
                check_type: "machine-up",
                config: json!({}),
                auto_env: &[],
            }],
            article: KnowledgeArticle {
                severity: Severity::Critical,
                title: "Instance down",
                description: "A fleet instance stopped running.",
                impact: "Capacity of the owning service is reduced.",
                response: "No automated response.",
                action: "Boot the instance; if it fails to boot, inspect the compute node.",
            },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_names_carry_the_version_suffix() {
        assert_eq!(
            group_name("upset.shoal.instance_down"),
            "upset.shoal.instance_down;v=1"
        );
    }

    #[test]
    fn current_group_names_are_removable() {
        assert!(is_removable_group_name("upset.shoal.instance_down;v=1"));
        assert!(is_removable_group_name(
            "upset.shoal.electric_moray.log_error;v=1"
        ));
        assert!(is_removable_group_name("shoal-alarms"));
    }

    #[test]
    fn operator_group_names_are_not_removable() {
        assert!(!is_removable_group_name("ops-custom-checks"));
        assert!(!is_removable_group_name("upset.shoal.instance_down"));
        assert!(!is_removable_group_name("upset.other.thing;v=1"));
    }

    #[test]
    fn aliases_replace_dashes() {
        assert_eq!(service_alias("electric-moray"), "electric_moray");
        assert_eq!(service_alias("moray"), "moray");
    }
}
