//! Render requests as curl commands for logs.
//!
//! Bearer tokens are always redacted.

use serde_json::Value;

/// Format a request as a copy-pasteable curl command.
pub fn format_as_curl(
    method: &str,
    url: &str,
    headers: &[(&str, String)],
    payload: Option<&Value>,
) -> String {
    let mut parts = vec![format!("curl -X {}", method.to_uppercase())];

    for (name, value) in headers {
        parts.push(format!("-H \"{}: {}\"", name, redact_header(name, value)));
    }

    if let Some(payload) = payload {
        let body = payload.to_string().replace('\'', "'\\''");
        parts.push(format!("-d '{}'", body));
    }

    parts.push(url.to_string());
    parts.join(" ")
}

fn redact_header(name: &str, value: &str) -> String {
    if !name.eq_ignore_ascii_case("authorization") {
        return value.to_string();
    }
    match value.split_once(' ') {
        Some((scheme, _)) => format!("{} ***", scheme),
        None => "***".to_string(),
    }
}
