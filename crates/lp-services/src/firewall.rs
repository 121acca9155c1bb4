//! UFW firewall rules: the panel catalog and the live rule table.
//!
//! The panel database is the catalog of rules the operator manages; ufw
//! is the ground truth for what is actually enforced. `list` merges the
//! two and flags rules the host no longer applies instead of hiding the
//! drift.

use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::MySqlPool;
use thiserror::Error;
use tracing::{error, info, warn};

use lp_core::process::{CommandSpec, ProcessRunner};
use lp_core::security::audit::{AuditAction, AuditLogger, AuditResult};
use lp_core::security::input;
use lp_db::models::{FirewallRule, NewFirewallRule};
use lp_db::queries;
use lp_db::DbError;

use crate::context::RequestIdentity;
use crate::locks::{self, LockRegistry};

/// Port numbers behind the named services `validate_port_spec` accepts.
const NAMED_PORT_NUMBERS: &[(&str, &str)] = &[
    ("http", "80"),
    ("https", "443"),
    ("ftp", "21"),
    ("ssh", "22"),
    ("smtp", "25"),
    ("dns", "53"),
    ("mysql", "3306"),
    ("postgresql", "5432"),
    ("mongodb", "27017"),
    ("redis", "6379"),
];

static NUMBERED_RULE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[\s*(\d+)\]\s+(.+?)\s{2,}([A-Z]+(?:\s+[A-Z]+)?)\s{2,}(.+)$")
        .expect("numbered rule regex")
});

static DEFAULT_POLICY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Default:\s+(\w+)\s+\(incoming\),\s+(\w+)\s+\(outgoing\)")
        .expect("default policy regex")
});

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("{0}")]
    Validation(String),
    #[error("Firewall rule not found")]
    NotFound,
    /// ufw applied the change but the panel record did not follow.
    #[error("{0}")]
    Partial(String),
    #[error("{0}")]
    External(String),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Parsed `ufw status verbose` header.
#[derive(Debug, Clone, Serialize)]
pub struct FirewallStatus {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_incoming: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_outgoing: Option<String>,
}

/// One live rule from `ufw status numbered`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UfwRule {
    pub number: u32,
    pub to: String,
    pub action: String,
    pub from: String,
}

/// Panel rule merged with its live counterpart.
#[derive(Debug, Serialize)]
pub struct RuleStatus {
    #[serde(flatten)]
    pub rule: FirewallRule,
    /// Present in the live ufw table right now.
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ufw_number: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RuleList {
    pub rules: Vec<RuleStatus>,
    pub total: usize,
    pub status: FirewallStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AddRuleRequest {
    pub action: String,
    pub protocol: Option<String>,
    pub port: String,
    pub source: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AddedRule {
    pub rule_id: String,
    pub action: String,
    pub protocol: String,
    pub port: String,
    pub source: String,
}

pub struct FirewallService {
    pool: MySqlPool,
    runner: Arc<dyn ProcessRunner>,
    locks: Arc<LockRegistry>,
    audit: Arc<dyn AuditLogger>,
    /// Ports whose rules refuse deletion: SSH plus the panel's own port.
    protected_ports: Vec<String>,
}

impl FirewallService {
    pub fn new(
        pool: MySqlPool,
        runner: Arc<dyn ProcessRunner>,
        locks: Arc<LockRegistry>,
        audit: Arc<dyn AuditLogger>,
        panel_port: u16,
    ) -> Self {
        Self {
            pool,
            runner,
            locks,
            audit,
            protected_ports: vec!["22".to_string(), panel_port.to_string()],
        }
    }

    /// Live firewall state from `ufw status verbose`.
    pub async fn status(&self) -> Result<FirewallStatus, FirewallError> {
        let spec = CommandSpec::new("ufw").arg("status").arg("verbose").elevated();
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| FirewallError::External(e.to_string()))?;
        if !output.success() {
            return Err(FirewallError::External(format!(
                "ufw status failed: {}",
                output.output.trim()
            )));
        }
        Ok(parse_ufw_status(&output.output))
    }

    /// Enable, disable, or reload the firewall. Disabling requires an
    /// explicit confirmation.
    pub async fn control(
        &self,
        identity: &RequestIdentity,
        action: &str,
        confirm: bool,
    ) -> Result<FirewallStatus, FirewallError> {
        let args: &[&str] = match action {
            "enable" => &["--force", "enable"],
            "disable" => {
                if !confirm {
                    return Err(FirewallError::Validation(
                        "Please confirm by adding ?confirm=true".to_string(),
                    ));
                }
                &["disable"]
            }
            "reload" => &["reload"],
            _ => {
                return Err(FirewallError::Validation(
                    "Invalid control action. Must be: enable, disable, or reload".to_string(),
                ));
            }
        };

        let mut spec = CommandSpec::new("ufw").elevated();
        for arg in args {
            spec = spec.arg(*arg);
        }
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| FirewallError::External(e.to_string()))?;
        if !output.success() {
            return Err(FirewallError::External(format!(
                "ufw {action} failed: {}",
                output.output.trim()
            )));
        }

        info!(action, "Firewall control");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::FirewallControl, "firewall")
                    .details(serde_json::json!({ "action": action })),
            )
            .await;

        self.status().await
    }

    /// Panel rules merged with the live `ufw status numbered` table.
    pub async fn list(&self) -> Result<RuleList, FirewallError> {
        let rules = queries::list_firewall_rules(&self.pool).await?;

        let spec = CommandSpec::new("ufw").arg("status").arg("numbered").elevated();
        let live = match self.runner.run(&spec).await {
            Ok(output) if output.success() => parse_numbered_rules(&output.output),
            _ => Vec::new(),
        };

        let merged: Vec<RuleStatus> = rules
            .into_iter()
            .map(|rule| {
                let ufw_number = live_rule_number(&rule, &live);
                RuleStatus {
                    applied: ufw_number.is_some(),
                    ufw_number,
                    rule,
                }
            })
            .collect();

        Ok(RuleList {
            total: merged.len(),
            rules: merged,
            status: self.status().await.unwrap_or(FirewallStatus {
                enabled: false,
                default_incoming: None,
                default_outgoing: None,
            }),
        })
    }

    pub async fn get_rule(&self, rule_id: &str) -> Result<FirewallRule, FirewallError> {
        match queries::get_firewall_rule(&self.pool, rule_id).await {
            Ok(rule) => Ok(rule),
            Err(DbError::NotFound(_)) => Err(FirewallError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Apply a new rule to ufw, then record it.
    pub async fn add(
        &self,
        identity: &RequestIdentity,
        req: &AddRuleRequest,
    ) -> Result<AddedRule, FirewallError> {
        let created_by = identity
            .user_id
            .ok_or_else(|| FirewallError::Validation("Authentication required".to_string()))?;

        let action = input::validate_firewall_action(&req.action)
            .map_err(|e| FirewallError::Validation(e.to_string()))?;
        let protocol = req.protocol.as_deref().unwrap_or("tcp");
        let protocol = input::validate_protocol(protocol)
            .map_err(|e| FirewallError::Validation(e.to_string()))?;
        let port = input::validate_port_spec(&req.port)
            .map_err(|e| FirewallError::Validation(e.to_string()))?;
        let source = req.source.as_deref().unwrap_or("any");
        let source = input::validate_rule_source(source)
            .map_err(|e| FirewallError::Validation(e.to_string()))?;

        let rule_id = build_rule_id(action, port);
        let _guard = self.locks.acquire(&locks::firewall_key(&rule_id)).await;

        let spec = ufw_rule_spec(action, protocol, port, source, false);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| FirewallError::External(e.to_string()))?;
        if !output.success() {
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::FirewallAdd, "firewall")
                        .result(AuditResult::Failed)
                        .details(serde_json::json!({
                            "rule_id": rule_id,
                            "error": output.output.trim(),
                        })),
                )
                .await;
            return Err(FirewallError::External(format!(
                "Failed to add firewall rule: {}",
                output.output.trim()
            )));
        }

        let rule = NewFirewallRule {
            rule_id: rule_id.clone(),
            action: action.to_string(),
            protocol: protocol.to_string(),
            port: port.to_string(),
            source: source.to_string(),
            description: req.description.clone(),
            created_by,
        };
        if let Err(e) = queries::insert_firewall_rule(&self.pool, &rule).await {
            // ufw treats a repeated rule as a no-op, so the duplicate
            // row is the conflict signal, not drift.
            if let DbError::Duplicate(message) = e {
                return Err(FirewallError::Validation(message));
            }
            error!(rule_id, error = %e, "ufw rule applied but panel insert failed");
            self.audit
                .log_event(
                    &identity
                        .event(AuditAction::FirewallAdd, "firewall")
                        .result(AuditResult::Warning)
                        .details(serde_json::json!({
                            "rule_id": rule_id,
                            "drift": "applied in ufw, missing from panel",
                            "error": e.to_string(),
                        })),
                )
                .await;
            return Err(FirewallError::Partial(
                "Rule added but failed to save to database".to_string(),
            ));
        }

        info!(rule_id, action, port, "Added firewall rule");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::FirewallAdd, "firewall")
                    .details(serde_json::json!({
                        "rule_id": rule_id,
                        "action": action,
                        "port": port,
                        "source": source,
                    })),
            )
            .await;

        Ok(AddedRule {
            rule_id,
            action: action.to_string(),
            protocol: protocol.to_string(),
            port: port.to_string(),
            source: source.to_string(),
        })
    }

    /// Remove a rule from ufw and the panel. The row survives a ufw
    /// failure so the rule stays manageable.
    pub async fn delete(
        &self,
        identity: &RequestIdentity,
        rule_id: &str,
        confirm: bool,
    ) -> Result<(), FirewallError> {
        if !confirm {
            return Err(FirewallError::Validation(
                "Please confirm by adding ?confirm=true".to_string(),
            ));
        }
        let rule = self.get_rule(rule_id).await?;

        let port_number = named_port_number(&rule.port);
        if self.protected_ports.iter().any(|p| *p == port_number) {
            return Err(FirewallError::Validation(format!(
                "Cannot delete protected rule for port {}",
                rule.port
            )));
        }

        let _guard = self.locks.acquire(&locks::firewall_key(rule_id)).await;

        if rule.enabled {
            self.unapply(&rule).await?;
        }
        queries::delete_firewall_rule(&self.pool, rule_id).await?;

        info!(rule_id, "Deleted firewall rule");
        self.audit
            .log_event(
                &identity
                    .event(AuditAction::FirewallDelete, "firewall")
                    .details(serde_json::json!({ "rule_id": rule_id })),
            )
            .await;
        Ok(())
    }

    /// Enable or disable a rule: the live ufw entry follows the flag.
    pub async fn toggle(
        &self,
        identity: &RequestIdentity,
        rule_id: &str,
    ) -> Result<bool, FirewallError> {
        let rule = self.get_rule(rule_id).await?;
        let _guard = self.locks.acquire(&locks::firewall_key(rule_id)).await;

        let enable = !rule.enabled;
        if enable {
            let spec = ufw_rule_spec(&rule.action, &rule.protocol, &rule.port, &rule.source, false);
            let output = self
                .runner
                .run(&spec)
                .await
                .map_err(|e| FirewallError::External(e.to_string()))?;
            if !output.success() {
                return Err(FirewallError::External(format!(
                    "Failed to apply firewall rule: {}",
                    output.output.trim()
                )));
            }
        } else {
            self.unapply(&rule).await?;
        }
        queries::set_firewall_rule_enabled(&self.pool, rule_id, enable).await?;

        self.audit
            .log_event(
                &identity
                    .event(AuditAction::FirewallToggle, "firewall")
                    .details(serde_json::json!({ "rule_id": rule_id, "enabled": enable })),
            )
            .await;
        Ok(enable)
    }

    /// Update rule metadata. Only the description is mutable; the rule
    /// itself is delete-and-recreate.
    pub async fn update_rule(
        &self,
        identity: &RequestIdentity,
        rule_id: &str,
        description: Option<&str>,
    ) -> Result<(), FirewallError> {
        self.get_rule(rule_id).await?;
        let Some(description) = description else {
            return Err(FirewallError::Validation("No fields to update".to_string()));
        };
        queries::update_firewall_rule_description(&self.pool, rule_id, Some(description)).await?;

        self.audit
            .log_event(
                &identity
                    .event(AuditAction::FirewallToggle, "firewall")
                    .details(serde_json::json!({ "rule_id": rule_id, "updated": "description" })),
            )
            .await;
        Ok(())
    }

    async fn unapply(&self, rule: &FirewallRule) -> Result<(), FirewallError> {
        let spec = ufw_rule_spec(&rule.action, &rule.protocol, &rule.port, &rule.source, true);
        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| FirewallError::External(e.to_string()))?;
        if !output.success() {
            warn!(rule_id = %rule.rule_id, "ufw delete failed");
            return Err(FirewallError::External(format!(
                "Failed to remove firewall rule: {}",
                output.output.trim()
            )));
        }
        Ok(())
    }
}

/// `RULE_ALLOW_443_1724140800` style identifier; port separators become
/// underscores so the id stays a single token.
fn build_rule_id(action: &str, port: &str) -> String {
    let sanitized: String = port
        .chars()
        .map(|c| match c {
            '.' | '/' | ':' => '_',
            other => other,
        })
        .collect();
    format!(
        "RULE_{}_{}_{}",
        action.to_uppercase(),
        sanitized,
        Utc::now().timestamp()
    )
}

/// Build the ufw invocation for a rule, or its deletion.
fn ufw_rule_spec(action: &str, protocol: &str, port: &str, source: &str, delete: bool) -> CommandSpec {
    let mut spec = CommandSpec::new("ufw").elevated();
    if delete {
        spec = spec.arg("--force").arg("delete");
    }
    spec = spec.arg(action);

    if source == "any" {
        if protocol == "both" {
            spec.arg(port)
        } else {
            spec.arg(format!("{port}/{protocol}"))
        }
    } else {
        spec = spec
            .arg("from")
            .arg(source)
            .arg("to")
            .arg("any")
            .arg("port")
            .arg(port);
        if protocol == "both" {
            spec
        } else {
            spec.arg("proto").arg(protocol)
        }
    }
}

fn parse_ufw_status(output: &str) -> FirewallStatus {
    let enabled = output
        .lines()
        .any(|line| line.trim().eq_ignore_ascii_case("Status: active"));
    let (default_incoming, default_outgoing) = DEFAULT_POLICY_RE
        .captures(output)
        .map(|caps| (Some(caps[1].to_string()), Some(caps[2].to_string())))
        .unwrap_or((None, None));
    FirewallStatus {
        enabled,
        default_incoming,
        default_outgoing,
    }
}

/// Parse `ufw status numbered` lines like
/// `[ 1] 22/tcp  ALLOW IN  Anywhere`.
fn parse_numbered_rules(output: &str) -> Vec<UfwRule> {
    output
        .lines()
        .filter_map(|line| {
            let caps = NUMBERED_RULE_RE.captures(line.trim_end())?;
            Some(UfwRule {
                number: caps[1].parse().ok()?,
                to: caps[2].trim().to_string(),
                action: caps[3].trim().to_string(),
                from: caps[4].trim().to_string(),
            })
        })
        .collect()
}

/// Translate a named service to its port number; numeric specs pass
/// through.
fn named_port_number(port: &str) -> String {
    NAMED_PORT_NUMBERS
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(port))
        .map(|(_, number)| number.to_string())
        .unwrap_or_else(|| port.to_string())
}

/// Find the live ufw entry matching a panel rule, ignoring the
/// duplicate `(v6)` entries.
fn live_rule_number(rule: &FirewallRule, live: &[UfwRule]) -> Option<u32> {
    let port = named_port_number(&rule.port);
    let want_action = rule.action.to_uppercase();

    live.iter()
        .find(|entry| {
            if entry.to.contains("(v6)") {
                return false;
            }
            let to = entry.to.split_whitespace().next().unwrap_or("");
            let to_matches = if rule.source != "any" && to == "Anywhere" {
                // Source-scoped rules list the port on the From side or
                // as Anywhere; fall through to the source check.
                true
            } else {
                to == port || to == format!("{port}/{}", rule.protocol)
            };
            let action_matches = entry
                .action
                .split_whitespace()
                .next()
                .is_some_and(|word| word == want_action);
            let from_matches = if rule.source == "any" {
                entry.from.starts_with("Anywhere")
            } else {
                entry.from.starts_with(rule.source.as_str())
            };
            to_matches && action_matches && from_matches
        })
        .map(|entry| entry.number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_rule(action: &str, protocol: &str, port: &str, source: &str) -> FirewallRule {
        FirewallRule {
            id: 1,
            rule_id: "RULE_TEST".to_string(),
            action: action.to_string(),
            protocol: protocol.to_string(),
            port: port.to_string(),
            source: source.to_string(),
            description: None,
            enabled: true,
            created_by: 1,
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            updated_at: Utc.timestamp_opt(0, 0).unwrap(),
        }
    }

    const NUMBERED_OUTPUT: &str = "Status: active\n\n\
     To                         Action      From\n\
     --                         ------      ----\n\
[ 1] 22/tcp                     ALLOW IN    Anywhere\n\
[ 2] 80                         ALLOW IN    Anywhere\n\
[ 3] 3306/tcp                   DENY IN     203.0.113.0/24\n\
[ 4] 22/tcp (v6)                ALLOW IN    Anywhere (v6)\n";

    #[test]
    fn test_parse_ufw_status_verbose() {
        let output = "Status: active\nLogging: on (low)\n\
                      Default: deny (incoming), allow (outgoing), disabled (routed)\n";
        let status = parse_ufw_status(output);
        assert!(status.enabled);
        assert_eq!(status.default_incoming.as_deref(), Some("deny"));
        assert_eq!(status.default_outgoing.as_deref(), Some("allow"));

        let status = parse_ufw_status("Status: inactive\n");
        assert!(!status.enabled);
        assert_eq!(status.default_incoming, None);
    }

    #[test]
    fn test_parse_numbered_rules() {
        let rules = parse_numbered_rules(NUMBERED_OUTPUT);
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].number, 1);
        assert_eq!(rules[0].to, "22/tcp");
        assert_eq!(rules[0].action, "ALLOW IN");
        assert_eq!(rules[2].from, "203.0.113.0/24");
    }

    #[test]
    fn test_live_rule_number_matches_port_and_protocol() {
        let live = parse_numbered_rules(NUMBERED_OUTPUT);
        assert_eq!(
            live_rule_number(&sample_rule("allow", "tcp", "22", "any"), &live),
            Some(1)
        );
        assert_eq!(
            live_rule_number(&sample_rule("allow", "both", "80", "any"), &live),
            Some(2)
        );
        assert_eq!(
            live_rule_number(
                &sample_rule("deny", "tcp", "3306", "203.0.113.0/24"),
                &live
            ),
            Some(3)
        );
        assert_eq!(
            live_rule_number(&sample_rule("allow", "tcp", "443", "any"), &live),
            None
        );
    }

    #[test]
    fn test_live_rule_number_translates_named_services() {
        let live = parse_numbered_rules(NUMBERED_OUTPUT);
        assert_eq!(
            live_rule_number(&sample_rule("allow", "tcp", "ssh", "any"), &live),
            Some(1)
        );
    }

    #[test]
    fn test_build_rule_id_sanitizes_separators() {
        let id = build_rule_id("allow", "8000:8100");
        assert!(id.starts_with("RULE_ALLOW_8000_8100_"));
        let id = build_rule_id("deny", "443");
        assert!(id.starts_with("RULE_DENY_443_"));
    }

    #[test]
    fn test_ufw_rule_spec_forms() {
        let spec = ufw_rule_spec("allow", "tcp", "443", "any", false);
        assert_eq!(spec.args, vec!["allow", "443/tcp"]);

        let spec = ufw_rule_spec("allow", "both", "443", "any", false);
        assert_eq!(spec.args, vec!["allow", "443"]);

        let spec = ufw_rule_spec("deny", "udp", "53", "203.0.113.7", false);
        assert_eq!(
            spec.args,
            vec!["deny", "from", "203.0.113.7", "to", "any", "port", "53", "proto", "udp"]
        );

        let spec = ufw_rule_spec("allow", "tcp", "22", "any", true);
        assert_eq!(spec.args, vec!["--force", "delete", "allow", "22/tcp"]);
    }

    #[test]
    fn test_named_port_number() {
        assert_eq!(named_port_number("https"), "443");
        assert_eq!(named_port_number("8080"), "8080");
    }
}
