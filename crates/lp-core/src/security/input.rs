//! Strict allowlist-based input validation.
//!
//! Every external input that flows into subprocess arguments, SQL
//! identifiers, file paths, or configuration files MUST pass through one
//! of these validators first. Error display strings double as the
//! user-visible API messages, so they are worded for an operator reading
//! a JSON response, and the offending value is carried for server-side
//! logs but never interpolated into the message.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Errors returned when input fails validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid domain format")]
    InvalidDomain(String),
    #[error("Invalid email format")]
    InvalidEmail(String),
    #[error("Invalid database name. Only alphanumeric characters and underscores allowed.")]
    InvalidDatabaseName(String),
    #[error("Invalid username. Only alphanumeric characters and underscores allowed.")]
    InvalidDbUsername(String),
    #[error("Invalid backend port")]
    InvalidBackendPort(String),
    #[error("Invalid action. Must be: allow, deny, or limit")]
    InvalidFirewallAction(String),
    #[error("Invalid port format")]
    InvalidPortSpec(String),
    #[error("Invalid protocol. Must be: tcp, udp, or both")]
    InvalidProtocol(String),
    #[error("Invalid source address")]
    InvalidSource(String),
    #[error("Invalid maxmemory_policy")]
    InvalidEvictionPolicy(String),
    #[error("Invalid maxmemory value")]
    InvalidMaxMemory(String),
    #[error("Invalid timeout value")]
    InvalidTimeout(String),
    #[error("Invalid tcp_keepalive value")]
    InvalidKeepalive(String),
    #[error("Invalid extension name")]
    InvalidExtensionName(String),
    #[error("Invalid path component: {0}")]
    InvalidPathComponent(String),
    #[error("Input too long: max {max} chars, got {actual}")]
    TooLong { max: usize, actual: usize },
    #[error("Input contains forbidden characters: {0}")]
    ForbiddenCharacters(String),
}

// ---------------------------------------------------------------------------
// Strict regex patterns -- allowlists only, never denylists.
// ---------------------------------------------------------------------------

/// Fully-qualified domain name (RFC 1035 / RFC 1123 compatible).
static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*\.[a-zA-Z]{2,}$",
    )
    .unwrap()
});

/// RFC 5321 compatible email address (simplified but safe).
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)*\.[a-zA-Z]{2,}$",
    )
    .unwrap()
});

/// MySQL/MariaDB identifier for panel-created databases and users.
/// Underscore-only on purpose; hyphens would need quoting in GRANT.
static SQL_IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9_]+$").unwrap());

/// UFW port range, e.g. "6000:6100".
static PORT_RANGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+:\d+$").unwrap());

/// Redis maxmemory directive value, e.g. "2g", "512mb", "1048576".
static MAXMEMORY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)\d+(k|kb|m|mb|g|gb)?$").unwrap());

/// PHP extension name as it appears in php.ini `extension=` lines.
static EXTENSION_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]{1,64}$").unwrap());

/// Safe path component: no slashes, no traversal, no shell metacharacters.
static SAFE_PATH_COMPONENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9._-]{1,255}$").unwrap());

/// Service names UFW understands without a port number.
const NAMED_PORTS: &[&str] = &[
    "http",
    "https",
    "ftp",
    "ssh",
    "smtp",
    "dns",
    "mysql",
    "postgresql",
    "mongodb",
    "redis",
];

/// Redis eviction policies accepted by `maxmemory-policy`.
pub const EVICTION_POLICIES: &[&str] = &[
    "volatile-lru",
    "allkeys-lru",
    "volatile-random",
    "allkeys-random",
    "volatile-ttl",
    "noeviction",
    "allkeys-lfu",
    "volatile-lfu",
];

/// Shell metacharacters that must never appear in any input passed to
/// subprocesses. `Command::new().arg()` does not invoke a shell, but the
/// guard also covers values written into config files another process
/// parses.
const SHELL_METACHARACTERS: &[char] = &[
    '`', '$', '(', ')', '{', '}', '[', ']', '|', ';', '&', '<', '>', '\n', '\r', '\0', '\\', '"',
    '\'',
];

// ---------------------------------------------------------------------------
// Public validation functions
// ---------------------------------------------------------------------------

/// Validate a fully-qualified domain name.
///
/// Rejects: empty, too long (>253), leading/trailing hyphens, bare TLDs,
/// whitespace, shell metacharacters, path traversal sequences.
pub fn validate_domain(domain: &str) -> Result<&str, ValidationError> {
    if domain.len() > 253 {
        return Err(ValidationError::TooLong {
            max: 253,
            actual: domain.len(),
        });
    }
    if !DOMAIN_RE.is_match(domain) {
        return Err(ValidationError::InvalidDomain(domain.to_string()));
    }
    Ok(domain)
}

/// Validate an email address.
pub fn validate_email(email: &str) -> Result<&str, ValidationError> {
    if email.len() > 254 {
        return Err(ValidationError::TooLong {
            max: 254,
            actual: email.len(),
        });
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ValidationError::InvalidEmail(email.to_string()));
    }
    Ok(email)
}

/// Validate a database name created or dropped through the panel.
///
/// Alphanumeric and underscore only, max 64 characters (MySQL limit).
/// The name is interpolated into backtick-quoted DDL, so the allowlist is
/// the whole defense.
pub fn validate_database_name(name: &str) -> Result<&str, ValidationError> {
    if name.is_empty() || name.len() > 64 || !SQL_IDENT_RE.is_match(name) {
        return Err(ValidationError::InvalidDatabaseName(name.to_string()));
    }
    Ok(name)
}

/// Validate a MySQL account name created through the panel.
///
/// Same allowlist as database names, max 32 characters (MySQL account
/// limit).
pub fn validate_db_username(username: &str) -> Result<&str, ValidationError> {
    if username.is_empty() || username.len() > 32 || !SQL_IDENT_RE.is_match(username) {
        return Err(ValidationError::InvalidDbUsername(username.to_string()));
    }
    Ok(username)
}

/// Validate a proxy backend port.
pub fn validate_backend_port(port: i64) -> Result<u16, ValidationError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| ValidationError::InvalidBackendPort(port.to_string()))
}

/// Validate a firewall rule action.
pub fn validate_firewall_action(action: &str) -> Result<&str, ValidationError> {
    match action {
        "allow" | "deny" | "limit" => Ok(action),
        _ => Err(ValidationError::InvalidFirewallAction(action.to_string())),
    }
}

/// Validate a firewall protocol.
pub fn validate_protocol(protocol: &str) -> Result<&str, ValidationError> {
    match protocol {
        "tcp" | "udp" | "both" => Ok(protocol),
        _ => Err(ValidationError::InvalidProtocol(protocol.to_string())),
    }
}

/// Validate a UFW port specification: a single port, a `low:high` range,
/// or one of the named services UFW ships profiles for.
pub fn validate_port_spec(port: &str) -> Result<&str, ValidationError> {
    if let Ok(n) = port.parse::<u32>() {
        if (1..=65535).contains(&n) {
            return Ok(port);
        }
        return Err(ValidationError::InvalidPortSpec(port.to_string()));
    }

    if PORT_RANGE_RE.is_match(port) {
        let mut parts = port.splitn(2, ':');
        let low = parts.next().and_then(|p| p.parse::<u32>().ok());
        let high = parts.next().and_then(|p| p.parse::<u32>().ok());
        return match (low, high) {
            (Some(l), Some(h)) if (1..=65535).contains(&l) && (1..=65535).contains(&h) => Ok(port),
            _ => Err(ValidationError::InvalidPortSpec(port.to_string())),
        };
    }

    if NAMED_PORTS.contains(&port.to_ascii_lowercase().as_str()) {
        return Ok(port);
    }

    Err(ValidationError::InvalidPortSpec(port.to_string()))
}

/// Validate a firewall rule source: `any`, an IP address, or a CIDR block.
pub fn validate_rule_source(source: &str) -> Result<&str, ValidationError> {
    if source == "any" {
        return Ok(source);
    }

    if let Some((addr, prefix)) = source.split_once('/') {
        let max = match addr.parse::<std::net::IpAddr>() {
            Ok(std::net::IpAddr::V4(_)) => 32u8,
            Ok(std::net::IpAddr::V6(_)) => 128u8,
            Err(_) => return Err(ValidationError::InvalidSource(source.to_string())),
        };
        return match prefix.parse::<u8>() {
            Ok(p) if p <= max => Ok(source),
            _ => Err(ValidationError::InvalidSource(source.to_string())),
        };
    }

    if source.parse::<std::net::IpAddr>().is_ok() {
        return Ok(source);
    }

    Err(ValidationError::InvalidSource(source.to_string()))
}

/// Validate a Redis eviction policy against the known set.
pub fn validate_eviction_policy(policy: &str) -> Result<&str, ValidationError> {
    if EVICTION_POLICIES.contains(&policy) {
        return Ok(policy);
    }
    Err(ValidationError::InvalidEvictionPolicy(policy.to_string()))
}

/// Validate a Redis `maxmemory` value (bytes, or a k/m/g suffixed size).
pub fn validate_maxmemory(value: &str) -> Result<&str, ValidationError> {
    if !MAXMEMORY_RE.is_match(value) {
        return Err(ValidationError::InvalidMaxMemory(value.to_string()));
    }
    Ok(value)
}

/// Validate a Redis `timeout` value (seconds, non-negative).
pub fn validate_redis_timeout(value: i64) -> Result<i64, ValidationError> {
    if value < 0 {
        return Err(ValidationError::InvalidTimeout(value.to_string()));
    }
    Ok(value)
}

/// Validate a Redis `tcp-keepalive` value (seconds, non-negative).
pub fn validate_redis_keepalive(value: i64) -> Result<i64, ValidationError> {
    if value < 0 {
        return Err(ValidationError::InvalidKeepalive(value.to_string()));
    }
    Ok(value)
}

/// Validate a PHP extension name as accepted in php.ini `extension=` lines.
pub fn validate_extension_name(name: &str) -> Result<&str, ValidationError> {
    if !EXTENSION_NAME_RE.is_match(name) {
        return Err(ValidationError::InvalidExtensionName(name.to_string()));
    }
    Ok(name)
}

/// Validate a single path component (file or directory name, NOT a full
/// path).
///
/// Rejects: traversal (`..`), slashes, backslashes, null bytes, and any
/// character not in the `[a-zA-Z0-9._-]` allowlist.
pub fn validate_path_component(component: &str) -> Result<&str, ValidationError> {
    if component.contains("..")
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0')
    {
        return Err(ValidationError::InvalidPathComponent(
            component.to_string(),
        ));
    }
    if !SAFE_PATH_COMPONENT_RE.is_match(component) {
        return Err(ValidationError::InvalidPathComponent(
            component.to_string(),
        ));
    }
    Ok(component)
}

/// Assert that a string contains no shell metacharacters.
///
/// Applied to anything that ends up in a subprocess argument or inside a
/// config file another daemon parses line-wise.
pub fn assert_no_shell_metacharacters(input: &str) -> Result<&str, ValidationError> {
    for ch in SHELL_METACHARACTERS {
        if input.contains(*ch) {
            return Err(ValidationError::ForbiddenCharacters(format!(
                "contains forbidden character: {:?}",
                ch
            )));
        }
    }
    Ok(input)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Domain validation --------------------------------------------------

    #[test]
    fn test_valid_domains() {
        assert!(validate_domain("example.com").is_ok());
        assert!(validate_domain("blog.example.co.uk").is_ok());
        assert!(validate_domain("sub-domain.example.org").is_ok());
        assert!(validate_domain("a.bc").is_ok());
    }

    #[test]
    fn test_invalid_domains() {
        assert!(validate_domain("").is_err());
        assert!(validate_domain("-example.com").is_err());
        assert!(validate_domain("example").is_err());
        assert!(validate_domain("exam ple.com").is_err());
        assert!(validate_domain("example.com; rm -rf /").is_err());
        assert!(validate_domain("../../../etc/passwd").is_err());
        assert!(validate_domain("example.com\ninjection").is_err());
        assert!(validate_domain(".example.com").is_err());
    }

    #[test]
    fn test_domain_too_long() {
        let long_domain = format!("{}.com", "a".repeat(250));
        assert!(validate_domain(&long_domain).is_err());
    }

    // -- Email validation ---------------------------------------------------

    #[test]
    fn test_valid_emails() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("first.last@mail.example.com").is_ok());
        assert!(validate_email("user+tag@example.org").is_ok());
    }

    #[test]
    fn test_invalid_emails() {
        assert!(validate_email("").is_err());
        assert!(validate_email("notanemail").is_err());
        assert!(validate_email("user@").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@example.com\n").is_err());
    }

    // -- SQL identifier validation ------------------------------------------

    #[test]
    fn test_database_name_validation() {
        assert!(validate_database_name("wp_site1").is_ok());
        assert!(validate_database_name("db123").is_ok());
        assert!(validate_database_name("my-db").is_err()); // hyphen rejected
        assert!(validate_database_name("DROP TABLE users;--").is_err());
        assert!(validate_database_name("db name").is_err());
        assert!(validate_database_name("").is_err());
        assert!(validate_database_name(&"a".repeat(65)).is_err());
        assert!(validate_database_name(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn test_db_username_validation() {
        assert!(validate_db_username("wp_user").is_ok());
        assert!(validate_db_username("user1").is_ok());
        assert!(validate_db_username("user-name").is_err());
        assert!(validate_db_username("root'; --").is_err());
        assert!(validate_db_username("").is_err());
        assert!(validate_db_username(&"a".repeat(33)).is_err());
        assert!(validate_db_username(&"a".repeat(32)).is_ok());
    }

    // -- Firewall field validation ------------------------------------------

    #[test]
    fn test_firewall_action_validation() {
        assert!(validate_firewall_action("allow").is_ok());
        assert!(validate_firewall_action("deny").is_ok());
        assert!(validate_firewall_action("limit").is_ok());
        assert!(validate_firewall_action("reject").is_err());
        assert!(validate_firewall_action("ALLOW").is_err());
        assert!(validate_firewall_action("").is_err());
    }

    #[test]
    fn test_protocol_validation() {
        assert!(validate_protocol("tcp").is_ok());
        assert!(validate_protocol("udp").is_ok());
        assert!(validate_protocol("both").is_ok());
        assert!(validate_protocol("icmp").is_err());
        assert!(validate_protocol("").is_err());
    }

    #[test]
    fn test_port_spec_single() {
        assert!(validate_port_spec("22").is_ok());
        assert!(validate_port_spec("65535").is_ok());
        assert!(validate_port_spec("1").is_ok());
        assert!(validate_port_spec("0").is_err());
        assert!(validate_port_spec("65536").is_err());
        assert!(validate_port_spec("-1").is_err());
    }

    #[test]
    fn test_port_spec_range() {
        assert!(validate_port_spec("6000:6100").is_ok());
        assert!(validate_port_spec("1:65535").is_ok());
        assert!(validate_port_spec("0:100").is_err());
        assert!(validate_port_spec("100:70000").is_err());
        assert!(validate_port_spec("100-200").is_err());
    }

    #[test]
    fn test_port_spec_named() {
        assert!(validate_port_spec("http").is_ok());
        assert!(validate_port_spec("HTTPS").is_ok());
        assert!(validate_port_spec("ssh").is_ok());
        assert!(validate_port_spec("telnet").is_err());
        assert!(validate_port_spec("http; rm -rf /").is_err());
    }

    #[test]
    fn test_rule_source_validation() {
        assert!(validate_rule_source("any").is_ok());
        assert!(validate_rule_source("192.168.1.10").is_ok());
        assert!(validate_rule_source("10.0.0.0/8").is_ok());
        assert!(validate_rule_source("2001:db8::1").is_ok());
        assert!(validate_rule_source("2001:db8::/32").is_ok());
        assert!(validate_rule_source("10.0.0.0/33").is_err());
        assert!(validate_rule_source("not-an-ip").is_err());
        assert!(validate_rule_source("").is_err());
    }

    // -- Redis field validation ---------------------------------------------

    #[test]
    fn test_eviction_policy_validation() {
        for policy in EVICTION_POLICIES {
            assert!(validate_eviction_policy(policy).is_ok());
        }
        assert!(validate_eviction_policy("lru").is_err());
        assert!(validate_eviction_policy("allkeys").is_err());
        assert!(validate_eviction_policy("").is_err());
    }

    #[test]
    fn test_maxmemory_validation() {
        assert!(validate_maxmemory("2g").is_ok());
        assert!(validate_maxmemory("512mb").is_ok());
        assert!(validate_maxmemory("1048576").is_ok());
        assert!(validate_maxmemory("4GB").is_ok());
        assert!(validate_maxmemory("2 g").is_err());
        assert!(validate_maxmemory("g2").is_err());
        assert!(validate_maxmemory("").is_err());
    }

    #[test]
    fn test_redis_numeric_validation() {
        assert!(validate_redis_timeout(0).is_ok());
        assert!(validate_redis_timeout(300).is_ok());
        assert!(validate_redis_timeout(-1).is_err());
        assert!(validate_redis_keepalive(60).is_ok());
        assert!(validate_redis_keepalive(-5).is_err());
    }

    // -- Extension name validation ------------------------------------------

    #[test]
    fn test_extension_name_validation() {
        assert!(validate_extension_name("opcache").is_ok());
        assert!(validate_extension_name("pdo_mysql").is_ok());
        assert!(validate_extension_name("gd").is_ok());
        assert!(validate_extension_name("OPcache").is_err());
        assert!(validate_extension_name("ext name").is_err());
        assert!(validate_extension_name("ext=evil").is_err());
        assert!(validate_extension_name("").is_err());
    }

    // -- Path traversal rejection -------------------------------------------

    #[test]
    fn test_path_traversal_rejection() {
        assert!(validate_path_component("valid-name").is_ok());
        assert!(validate_path_component("backup.sql.gz").is_ok());
        assert!(validate_path_component("..").is_err());
        assert!(validate_path_component("../etc/passwd").is_err());
        assert!(validate_path_component("foo/bar").is_err());
        assert!(validate_path_component("foo\\bar").is_err());
        assert!(validate_path_component("").is_err());
        assert!(validate_path_component(" ").is_err());
    }

    // -- Shell metacharacter rejection --------------------------------------

    #[test]
    fn test_shell_metacharacter_rejection() {
        assert!(assert_no_shell_metacharacters("safe-input.123").is_ok());
        assert!(assert_no_shell_metacharacters("simple_name").is_ok());
        assert!(assert_no_shell_metacharacters("$(whoami)").is_err());
        assert!(assert_no_shell_metacharacters("`id`").is_err());
        assert!(assert_no_shell_metacharacters("foo;bar").is_err());
        assert!(assert_no_shell_metacharacters("foo|bar").is_err());
        assert!(assert_no_shell_metacharacters("foo\nbar").is_err());
        assert!(assert_no_shell_metacharacters("foo&bar").is_err());
    }

    // -- Backend port -------------------------------------------------------

    #[test]
    fn test_backend_port_validation() {
        assert_eq!(validate_backend_port(8080).unwrap(), 8080);
        assert_eq!(validate_backend_port(1).unwrap(), 1);
        assert_eq!(validate_backend_port(65535).unwrap(), 65535);
        assert!(validate_backend_port(0).is_err());
        assert!(validate_backend_port(-3).is_err());
        assert!(validate_backend_port(65536).is_err());
    }

    // -- User-visible messages ----------------------------------------------

    #[test]
    fn test_error_messages_are_user_facing() {
        let err = validate_database_name("bad-name").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid database name. Only alphanumeric characters and underscores allowed."
        );
        let err = validate_firewall_action("reject").unwrap_err();
        assert_eq!(err.to_string(), "Invalid action. Must be: allow, deny, or limit");
        let err = validate_port_spec("70000").unwrap_err();
        assert_eq!(err.to_string(), "Invalid port format");
        let err = validate_eviction_policy("lru").unwrap_err();
        assert_eq!(err.to_string(), "Invalid maxmemory_policy");
    }
}
