use crate::config::Replacement;
use indexmap::IndexMap;
use regex::Regex;
use std::collections::HashMap;

/// Expand kubelet-style `$(VAR)` references against already-resolved
/// entries. Unresolved references stay literal; `$$(VAR)` is the escaped
/// form and collapses to a literal `$(VAR)`.
pub fn expand_vars(input: &str, resolved: &IndexMap<String, String>) -> String {
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while let Some(c) = input[i..].chars().next() {
        if input[i..].starts_with("$$(") {
            out.push_str("$(");
            i += 3;
            continue;
        }
        if input[i..].starts_with("$(") {
            if let Some(end) = input[i + 2..].find(')') {
                let name = &input[i + 2..i + 2 + end];
                match resolved.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&input[i..i + 3 + end]),
                }
                i += 3 + end;
                continue;
            }
        }
        out.push(c);
        i += c.len_utf8();
    }
    out
}

/// Escape shell-style `$` so Compose does not re-interpolate values.
/// Kubelet references and the `$secret:` / `$volume_root` placeholders are
/// resolved by later phases and must keep their single `$`.
pub fn escape_shell_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while let Some(c) = input[i..].chars().next() {
        if c != '$' {
            out.push(c);
            i += c.len_utf8();
            continue;
        }
        let rest = &input[i + 1..];
        if rest.starts_with('$') {
            out.push_str("$$");
            i += 2;
            continue;
        }
        if rest.starts_with('(') || rest.starts_with("secret:") || rest.starts_with("volume_root")
        {
            out.push('$');
        } else {
            out.push_str("$$");
        }
        i += 1;
    }
    out
}

/// Single-pass rewriting of `host:port` occurrences. Built from the
/// service-port map; a host that is not in the rule table is left alone, so
/// applying the rewrite twice equals applying it once.
#[derive(Debug)]
pub struct PortRemapper {
    rules: HashMap<(String, String), u16>,
    pattern: Regex,
}

impl Default for PortRemapper {
    fn default() -> Self {
        Self::new()
    }
}

impl PortRemapper {
    pub fn new() -> Self {
        // over-captures hosts on purpose: the matched host is checked
        // against the rule table, so foo.example.com:80 never matches a
        // rule registered for com
        let pattern = Regex::new(r"(?P<host>[A-Za-z0-9][A-Za-z0-9_.-]*):(?P<port>\d{1,5})")
            .expect("static pattern compiles");
        Self {
            rules: HashMap::new(),
            pattern,
        }
    }

    /// Register a remap for one service: every DNS variant of the service
    /// host with `port` gets rewritten to `target`.
    pub fn add_service(&mut self, service: &str, namespace: &str, port: u16, target: u16) {
        if port == target {
            return;
        }
        for host in [
            service.to_string(),
            format!("{}.{}", service, namespace),
            format!("{}.{}.svc", service, namespace),
            format!("{}.{}.svc.cluster.local", service, namespace),
        ] {
            self.rules.insert((host, port.to_string()), target);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, input: &str) -> String {
        if self.rules.is_empty() || !input.contains(':') {
            return input.to_string();
        }
        self.pattern
            .replace_all(input, |caps: &regex::Captures<'_>| {
                let host = &caps["host"];
                let port = &caps["port"];
                match self.rules.get(&(host.to_string(), port.to_string())) {
                    Some(target) => format!("{}:{}", host, target),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }
}

/// Literal user replacements from the project config, applied in order.
pub fn apply_replacements(input: &str, replacements: &[Replacement]) -> String {
    let mut out = input.to_string();
    for replacement in replacements {
        if !replacement.old.is_empty() {
            out = out.replace(&replacement.old, &replacement.new);
        }
    }
    out
}

/// Resolve `$secret:<name>:<key>` and `$volume_root` placeholders.
/// Unresolvable placeholders emit a warning and stay literal.
pub fn resolve_placeholders(
    input: &str,
    secret: impl Fn(&str, &str) -> Option<String>,
    volume_root: &str,
    warnings: &mut Vec<String>,
) -> String {
    let mut out = input.to_string();
    if out.contains("$secret:") {
        let pattern = Regex::new(r"\$secret:(?P<name>[A-Za-z0-9_.-]+):(?P<key>[A-Za-z0-9_.-]+)")
            .expect("static pattern compiles");
        out = pattern
            .replace_all(&out, |caps: &regex::Captures<'_>| {
                match secret(&caps["name"], &caps["key"]) {
                    Some(value) => value,
                    None => {
                        warnings.push(format!(
                            "unresolved placeholder {}: secret or key not found",
                            &caps[0]
                        ));
                        caps[0].to_string()
                    }
                }
            })
            .into_owned();
    }
    if out.contains("$volume_root") {
        out = out.replace("$volume_root", volume_root);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolved(pairs: &[(&str, &str)]) -> IndexMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_vars() {
        let env = resolved(&[("HOST", "db"), ("PORT", "5432")]);
        assert_eq!(expand_vars("$(HOST):$(PORT)", &env), "db:5432");
        assert_eq!(expand_vars("$(MISSING)", &env), "$(MISSING)");
        assert_eq!(expand_vars("$$(HOST)", &env), "$(HOST)");
        assert_eq!(expand_vars("no refs", &env), "no refs");
    }

    #[test]
    fn test_escape_shell_vars() {
        assert_eq!(escape_shell_vars("$HOME/x"), "$$HOME/x");
        assert_eq!(escape_shell_vars("$$HOME"), "$$HOME");
        assert_eq!(escape_shell_vars("$secret:redis:pw"), "$secret:redis:pw");
        assert_eq!(escape_shell_vars("$volume_root/db"), "$volume_root/db");
        assert_eq!(escape_shell_vars("$(LEFTOVER)"), "$(LEFTOVER)");
        // escaping twice is a no-op
        let once = escape_shell_vars("$HOME and $secret:a:b");
        assert_eq!(escape_shell_vars(&once), once);
    }

    #[test]
    fn test_port_remap_is_idempotent() {
        let mut remapper = PortRemapper::new();
        remapper.add_service("web", "default", 80, 8080);
        let input = "http://web:80/api and web.default.svc.cluster.local:80";
        let once = remapper.apply(input);
        assert_eq!(
            once,
            "http://web:8080/api and web.default.svc.cluster.local:8080"
        );
        assert_eq!(remapper.apply(&once), once);
    }

    #[test]
    fn test_port_remap_leaves_foreign_hosts() {
        let mut remapper = PortRemapper::new();
        remapper.add_service("web", "default", 80, 8080);
        assert_eq!(remapper.apply("cdn.web.example.com:80"), "cdn.web.example.com:80");
        assert_eq!(remapper.apply("other:80"), "other:80");
    }

    #[test]
    fn test_resolve_placeholders() {
        let mut warnings = Vec::new();
        let secret = |name: &str, key: &str| {
            (name == "redis" && key == "pw").then(|| "hunter2".to_string())
        };
        let out = resolve_placeholders(
            "--requirepass $secret:redis:pw --dir $volume_root/redis",
            secret,
            "./data",
            &mut warnings,
        );
        assert_eq!(out, "--requirepass hunter2 --dir ./data/redis");
        assert!(warnings.is_empty());

        let out = resolve_placeholders("$secret:missing:key", secret, "./data", &mut warnings);
        assert_eq!(out, "$secret:missing:key");
        assert_eq!(warnings.len(), 1);
    }
}
