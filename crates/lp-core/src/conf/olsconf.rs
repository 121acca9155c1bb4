//! OpenLiteSpeed config fragments and surgery.
//!
//! The panel touches two OLS files: the global `httpd_config.conf`
//! (virtualhost/listener/extprocessor blocks) and the per-vhost
//! `vhconf.conf`. Blocks are generated here as strings and written by
//! the services through [`crate::fs::atomic`]; removal is brace-aware
//! so deleting a domain never truncates an unrelated block.

use std::path::Path;

/// Handler name for a reverse-proxy external processor,
/// `proxy_{domain}_{port}` with dots flattened to underscores.
pub fn proxy_handler_name(domain: &str, port: u16) -> String {
    format!("proxy_{}_{}", domain.replace('.', "_"), port)
}

/// `extprocessor` block for `httpd_config.conf` routing to a local
/// backend.
pub fn extprocessor_block(name: &str, backend_host: &str, backend_port: u16) -> String {
    format!(
        "\nextprocessor {name} {{\n  \
         type proxy\n  \
         address {backend_host}:{backend_port}\n  \
         maxConns 100\n  \
         initTimeout 60\n  \
         retryTimeout 0\n  \
         pcKeepAliveTimeout 60\n  \
         respBuffer 0\n}}\n"
    )
}

/// `context` block for a vhost's `vhconf.conf` pointing a URI at a
/// named external processor.
pub fn proxy_context_block(uri: &str, handler: &str) -> String {
    format!(
        "\ncontext {uri} {{\n  \
         type proxy\n  \
         location {uri}\n  \
         handler {handler}\n  \
         addDefaultCharset off\n}}\n"
    )
}

/// `vhssl` block for a vhost's `vhconf.conf`. Callers must check
/// [`has_vhssl`] first; OLS rejects duplicate blocks.
pub fn vhssl_block(cert_file: &Path, key_file: &Path) -> String {
    format!(
        "\nvhssl  {{\n  \
         sslCertFile             {}\n  \
         sslKeyFile              {}\n  \
         certChain               1\n  \
         enableSpdy              15\n  \
         enableStapling          1\n  \
         ocspRespMaxAge          86400\n}}\n",
        cert_file.display(),
        key_file.display()
    )
}

/// True if the vhost config already carries a `vhssl` block.
pub fn has_vhssl(content: &str) -> bool {
    content
        .lines()
        .any(|line| line.trim_start().starts_with("vhssl"))
}

/// Drop the `vhssl` block from a vhost config, matching braces across
/// nesting. Content without one passes through unchanged.
pub fn remove_vhssl(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        if trimmed.starts_with("vhssl") && trimmed.ends_with('{') {
            let mut depth = brace_delta(line);
            while depth > 0 {
                match lines.next() {
                    Some(inner) => depth += brace_delta(inner),
                    None => break,
                }
            }
            if matches!(lines.peek(), Some(next) if next.trim().is_empty()) {
                lines.next();
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    out
}

/// Append a generated block, keeping exactly one blank line between the
/// existing content and the new block.
pub fn append_block(content: &str, block: &str) -> String {
    let mut out = content.trim_end().to_string();
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(block.trim_start_matches('\n'));
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Strip every reference to a domain from an OLS config.
///
/// Top-level blocks whose header names the domain (or its underscored
/// form, as used in proxy handler names) are dropped whole, matching
/// braces across nesting. Inside retained blocks, plain directive lines
/// mentioning the literal domain (listener `map` entries) are dropped
/// individually. All other lines pass through untouched.
pub fn remove_domain_references(content: &str, domain: &str) -> String {
    let underscored = domain.replace('.', "_");
    let mut out = String::with_capacity(content.len());
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        let opens_block = trimmed.ends_with('{');

        if opens_block && (trimmed.contains(domain) || trimmed.contains(&underscored)) {
            let mut depth = brace_delta(line);
            while depth > 0 {
                match lines.next() {
                    Some(inner) => depth += brace_delta(inner),
                    None => break,
                }
            }
            // Swallow one blank line left behind by the removed block.
            if matches!(lines.peek(), Some(next) if next.trim().is_empty()) {
                lines.next();
            }
            continue;
        }

        if !opens_block && trimmed != "}" && trimmed.contains(domain) {
            continue;
        }

        out.push_str(line);
        out.push('\n');
    }

    out
}

fn brace_delta(line: &str) -> i32 {
    let mut delta = 0;
    for ch in line.chars() {
        match ch {
            '{' => delta += 1,
            '}' => delta -= 1,
            _ => {}
        }
    }
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const HTTPD_CONF: &str = "\
serverName              panel

virtualhost example.com {
  vhRoot                /var/www/example.com
  configFile            conf/vhosts/example.com/vhconf.conf
  allowSymbolLink       1
}

virtualhost other.net {
  vhRoot                /var/www/other.net
  configFile            conf/vhosts/other.net/vhconf.conf
}

listener Default {
  address               *:80
  map                   example.com example.com, www.example.com
  map                   other.net other.net
}

extprocessor proxy_example_com_3000 {
  type proxy
  address 127.0.0.1:3000
}
";

    #[test]
    fn test_proxy_handler_name() {
        assert_eq!(
            proxy_handler_name("app.example.com", 3000),
            "proxy_app_example_com_3000"
        );
    }

    #[test]
    fn test_extprocessor_block_shape() {
        let block = extprocessor_block("proxy_example_com_3000", "127.0.0.1", 3000);
        assert!(block.contains("extprocessor proxy_example_com_3000 {"));
        assert!(block.contains("address 127.0.0.1:3000"));
        assert!(block.contains("maxConns 100"));
        assert!(block.trim_end().ends_with('}'));
    }

    #[test]
    fn test_proxy_context_block_shape() {
        let block = proxy_context_block("/", "proxy_example_com_3000");
        assert!(block.contains("context / {"));
        assert!(block.contains("handler proxy_example_com_3000"));
        assert!(block.contains("addDefaultCharset off"));
    }

    #[test]
    fn test_vhssl_block_and_detection() {
        let block = vhssl_block(
            &PathBuf::from("/usr/local/lsws/conf/vhosts/example.com/cert/example.com.crt"),
            &PathBuf::from("/usr/local/lsws/conf/vhosts/example.com/cert/example.com.key"),
        );
        assert!(block.contains("vhssl  {"));
        assert!(block.contains("sslCertFile"));
        assert!(block.contains("ocspRespMaxAge          86400"));

        assert!(!has_vhssl("docRoot /var/www/html\n"));
        let patched = append_block("docRoot /var/www/html\n", &block);
        assert!(has_vhssl(&patched));
    }

    #[test]
    fn test_remove_vhssl_drops_only_that_block() {
        let conf = "\
docRoot /var/www/example.com

vhssl  {
  sslCertFile /usr/local/lsws/conf/vhosts/example.com/cert/example.com.crt
  sslKeyFile /usr/local/lsws/conf/vhosts/example.com/cert/example.com.key
}

context / {
  type proxy
}
";
        let cleaned = remove_vhssl(conf);
        assert!(!has_vhssl(&cleaned));
        assert!(cleaned.contains("docRoot /var/www/example.com"));
        assert!(cleaned.contains("context / {"));

        // No vhssl block means no change.
        assert_eq!(remove_vhssl("docRoot /var/www\n"), "docRoot /var/www\n");
    }

    #[test]
    fn test_append_block_single_separator() {
        let appended = append_block("a 1\n\n\n", "\nblock x {\n}\n");
        assert_eq!(appended, "a 1\nblock x {\n}\n");
        // Appending to empty content yields just the block.
        assert_eq!(append_block("", "\nblock x {\n}\n"), "block x {\n}\n");
    }

    #[test]
    fn test_remove_drops_vhost_block_and_map_line() {
        let cleaned = remove_domain_references(HTTPD_CONF, "example.com");
        assert!(!cleaned.contains("virtualhost example.com"));
        assert!(!cleaned.contains("www.example.com"));
        assert!(!cleaned.contains("proxy_example_com_3000"));
        // The listener itself and the unrelated vhost survive.
        assert!(cleaned.contains("listener Default {"));
        assert!(cleaned.contains("map                   other.net other.net"));
        assert!(cleaned.contains("virtualhost other.net {"));
        assert!(cleaned.contains("serverName              panel"));
    }

    #[test]
    fn test_remove_is_noop_for_unknown_domain() {
        let cleaned = remove_domain_references(HTTPD_CONF, "absent.io");
        assert_eq!(cleaned, HTTPD_CONF);
    }

    #[test]
    fn test_remove_handles_nested_blocks() {
        let conf = "\
virtualhost example.com {
  rewrite  {
    enable 1
  }
}
after 1
";
        let cleaned = remove_domain_references(conf, "example.com");
        assert_eq!(cleaned, "after 1\n");
    }

    #[test]
    fn test_closing_brace_never_dropped() {
        // A block we keep, containing a directive naming the domain:
        // only the directive line goes, braces stay balanced.
        let conf = "\
listener SSL {
  address *:443
  map example.com example.com
}
";
        let cleaned = remove_domain_references(conf, "example.com");
        assert_eq!(cleaned, "listener SSL {\n  address *:443\n}\n");
    }
}
