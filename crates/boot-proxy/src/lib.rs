//! nginx front-proxy rendering for the OpenClaw gateway.
//!
//! Pure templating: a typed [`ProxySite`] renders to the same server block
//! for the same inputs, every boot. Every environment-derived value is
//! escaped before it is embedded, so nothing an operator puts in a token or
//! path can break out of the generated config.

#![forbid(unsafe_code)]

use serde_json::Value;
use std::fmt::Write;
use std::path::PathBuf;

/// Webhook locations keep streaming deliveries open for up to a day.
pub const HOOK_TIMEOUT_SECS: u32 = 86_400;

// ─────────────────────────────────────────────────────────────
// Inputs
// ─────────────────────────────────────────────────────────────

/// Basic-auth settings for the default and browser locations. Never applied
/// to the webhook location, which authenticates with the bearer token.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub htpasswd_path: PathBuf,
}

/// Webhook passthrough settings, read from the generated gateway config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hooks {
    pub path: String,
}

/// Everything the server block is rendered from.
#[derive(Debug, Clone)]
pub struct ProxySite {
    pub listen_port: u16,
    pub gateway_port: u16,
    pub gateway_token: String,
    pub basic_auth: Option<BasicAuth>,
    pub hooks: Option<Hooks>,
    pub browser_port: u16,
    /// Directory the static starting page is served from.
    pub html_root: PathBuf,
}

/// Read webhook settings out of the gateway configuration document.
/// Fails soft: anything malformed means "hooks absent".
pub fn read_hooks(doc: &Value) -> Option<Hooks> {
    let hooks = doc.get("hooks")?;
    if !hooks.get("enabled")?.as_bool()? {
        return None;
    }
    let path = hooks.get("path")?.as_str()?;
    let path = sanitize_path(path);
    if path.len() < 2 {
        return None;
    }
    Some(Hooks { path })
}

// ─────────────────────────────────────────────────────────────
// Escaping
// ─────────────────────────────────────────────────────────────

/// Escape a value for embedding inside a double-quoted nginx string.
/// Backslash-escapes `"` and `\`; drops control characters and `$` so no
/// variable interpolation can be injected.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '$' => {}
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}

/// Restrict a URL path to characters safe in an nginx `location` directive.
pub fn sanitize_path(path: &str) -> String {
    let cleaned: String = path
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.'))
        .collect();
    if cleaned.starts_with('/') {
        cleaned
    } else {
        format!("/{cleaned}")
    }
}

// ─────────────────────────────────────────────────────────────
// Rendering
// ─────────────────────────────────────────────────────────────

/// Render the full server block.
pub fn render(site: &ProxySite) -> String {
    let token = escape_value(&site.gateway_token);
    let gateway = format!("http://127.0.0.1:{}", site.gateway_port);

    let auth_block = match &site.basic_auth {
        Some(auth) => format!(
            "        auth_basic \"OpenClaw\";\n        auth_basic_user_file \"{}\";\n",
            escape_value(&auth.htpasswd_path.display().to_string())
        ),
        None => String::new(),
    };

    let mut out = String::new();

    // Header + upgrade map for WebSocket passthrough.
    let _ = write!(
        out,
        r#"# Generated by clawboot. Regenerated on every container start; do not edit.

map $http_upgrade $connection_upgrade {{
    default upgrade;
    ''      close;
}}

server {{
    listen {listen};
    listen [::]:{listen};
    server_name _;

    client_max_body_size 100m;
    proxy_intercept_errors on;
    error_page 502 503 504 /starting.html;

    location = /healthz {{
        proxy_pass {gateway}/;
        error_page 502 503 504 = @starting;
    }}

    location @starting {{
        default_type application/json;
        return 200 '{{"status":"starting"}}';
    }}
"#,
        listen = site.listen_port,
        gateway = gateway,
    );

    // Webhook passthrough: bearer token injected, basic auth explicitly
    // off, day-long timeouts for streaming deliveries.
    if let Some(hooks) = &site.hooks {
        let _ = write!(
            out,
            r#"
    location {path} {{
        auth_basic off;
        proxy_pass {gateway};
        proxy_http_version 1.1;
        proxy_set_header Authorization "Bearer {token}";
        proxy_read_timeout {timeout}s;
        proxy_send_timeout {timeout}s;
        proxy_buffering off;
    }}
"#,
            path = hooks.path,
            gateway = gateway,
            token = token,
            timeout = HOOK_TIMEOUT_SECS,
        );
    }

    // Default location: inject the bearer token as a query parameter only
    // when the inbound request lacks one; inbound args pass through
    // untouched otherwise.
    let _ = write!(
        out,
        r#"
    location / {{
{auth_block}        set $gateway_args $args;
        if ($arg_token = "") {{
            set $gateway_args "token={token}&$args";
        }}
        proxy_pass {gateway}$uri?$gateway_args;
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection $connection_upgrade;
        proxy_set_header Host $host;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_read_timeout 300s;
    }}

    location /browser/ {{
{auth_block}        proxy_pass http://127.0.0.1:{browser}/;
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection $connection_upgrade;
    }}

    location = /starting.html {{
        root "{html_root}";
        internal;
    }}
}}
"#,
        auth_block = auth_block,
        token = token,
        gateway = gateway,
        browser = site.browser_port,
        html_root = escape_value(&site.html_root.display().to_string()),
    );

    out
}

/// The static fallback page served while the gateway is still coming up.
pub fn render_starting_page() -> String {
    r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="5">
  <title>OpenClaw is starting</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center;
           justify-content: center; height: 100vh; margin: 0; background: #111; color: #eee; }
    main { text-align: center; }
    .dot { animation: blink 1.2s infinite; }
    @keyframes blink { 50% { opacity: 0.2; } }
  </style>
</head>
<body>
  <main>
    <h1>Starting<span class="dot">&hellip;</span></h1>
    <p>The gateway is coming up. This page refreshes automatically.</p>
  </main>
</body>
</html>
"#
    .to_string()
}

// ─────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base_site() -> ProxySite {
        ProxySite {
            listen_port: 8080,
            gateway_port: 18789,
            gateway_token: "tok-abc".to_string(),
            basic_auth: None,
            hooks: None,
            browser_port: 9223,
            html_root: PathBuf::from("/var/www/openclaw"),
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let site = base_site();
        assert_eq!(render(&site), render(&site));
    }

    #[test]
    fn test_default_location_injects_token_conditionally() {
        let rendered = render(&base_site());
        assert!(rendered.contains(r#"if ($arg_token = "")"#));
        assert!(rendered.contains(r#"set $gateway_args "token=tok-abc&$args";"#));
        // Inbound args preserved when a token is already present.
        assert!(rendered.contains("set $gateway_args $args;"));
    }

    #[test]
    fn test_websocket_headers_forwarded() {
        let rendered = render(&base_site());
        assert!(rendered.contains("proxy_set_header Upgrade $http_upgrade;"));
        assert!(rendered.contains("proxy_set_header Connection $connection_upgrade;"));
        assert!(rendered.contains("map $http_upgrade $connection_upgrade"));
    }

    #[test]
    fn test_hooks_block_only_when_enabled() {
        let without = render(&base_site());
        assert!(!without.contains("Authorization"));

        let mut site = base_site();
        site.hooks = Some(Hooks {
            path: "/hooks".to_string(),
        });
        let with = render(&site);
        assert!(with.contains("location /hooks {"));
        assert!(with.contains(r#"proxy_set_header Authorization "Bearer tok-abc";"#));
        assert!(with.contains("proxy_read_timeout 86400s;"));
        assert!(with.contains("auth_basic off;"));
    }

    #[test]
    fn test_basic_auth_applies_everywhere_except_hooks() {
        let mut site = base_site();
        site.basic_auth = Some(BasicAuth {
            htpasswd_path: PathBuf::from("/etc/nginx/openclaw.htpasswd"),
        });
        site.hooks = Some(Hooks {
            path: "/hooks".to_string(),
        });
        let rendered = render(&site);

        assert_eq!(rendered.matches("auth_basic \"OpenClaw\";").count(), 2);
        assert!(rendered.contains(r#"auth_basic_user_file "/etc/nginx/openclaw.htpasswd";"#));

        // The hooks block must carry `auth_basic off` and nothing else.
        let hooks_block = rendered
            .split("location /hooks {")
            .nth(1)
            .and_then(|rest| rest.split('}').next())
            .expect("hooks block present");
        assert!(hooks_block.contains("auth_basic off;"));
        assert!(!hooks_block.contains("auth_basic_user_file"));
    }

    #[test]
    fn test_token_is_escaped() {
        let mut site = base_site();
        site.gateway_token = "evil\";inject $document_root\\".to_string();
        site.hooks = Some(Hooks {
            path: "/hooks".to_string(),
        });
        let rendered = render(&site);
        assert!(rendered.contains(r#"Bearer evil\";inject document_root\\"#));
        assert!(rendered.contains(r#"token=evil\";inject document_root\\&$args"#));
        assert!(!rendered.contains("$document_root"));
    }

    #[test]
    fn test_starting_fallbacks_present() {
        let rendered = render(&base_site());
        assert!(rendered.contains("error_page 502 503 504 = @starting;"));
        assert!(rendered.contains(r#"return 200 '{"status":"starting"}';"#));
        assert!(rendered.contains("error_page 502 503 504 /starting.html;"));
        assert!(rendered.contains(r#"root "/var/www/openclaw";"#));
    }

    #[test]
    fn test_browser_passthrough_targets_sidecar() {
        let rendered = render(&base_site());
        assert!(rendered.contains("location /browser/ {"));
        assert!(rendered.contains("proxy_pass http://127.0.0.1:9223/;"));
    }

    #[test]
    fn test_read_hooks_fail_soft() {
        assert_eq!(
            read_hooks(&json!({"hooks": {"enabled": true, "path": "/hooks"}})),
            Some(Hooks { path: "/hooks".to_string() })
        );
        assert_eq!(read_hooks(&json!({"hooks": {"enabled": false, "path": "/hooks"}})), None);
        assert_eq!(read_hooks(&json!({"hooks": {"enabled": true}})), None);
        assert_eq!(read_hooks(&json!({"hooks": "garbage"})), None);
        assert_eq!(read_hooks(&json!({})), None);
        assert_eq!(read_hooks(&json!(null)), None);
        // A path that sanitizes to nothing useful is treated as absent.
        assert_eq!(read_hooks(&json!({"hooks": {"enabled": true, "path": "{} {}"}})), None);
    }

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("/hooks"), "/hooks");
        assert_eq!(sanitize_path("hooks/github"), "/hooks/github");
        assert_eq!(sanitize_path("/hooks;{evil}"), "/hooksevil");
    }

    #[test]
    fn test_escape_value() {
        assert_eq!(escape_value("plain-token_123"), "plain-token_123");
        assert_eq!(escape_value(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_value(r"a\b"), r"a\\b");
        assert_eq!(escape_value("a$b\nc"), "abc");
    }
}
