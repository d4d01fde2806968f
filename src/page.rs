//! Preview page served at `<prefix>/<name>`

use std::time::Duration;

/// Render the preview page: the proxied app in an iframe plus a keepalive loop
pub fn render_preview_page(name: &str, prefix: &str, ping_interval: Duration) -> String {
    let name = escape_html(name);
    let prefix = escape_html(prefix);
    let interval_ms = ping_interval.as_millis().max(1000);

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Preview: {name}</title>
<style>
  html, body {{ margin: 0; height: 100%; font-family: system-ui, sans-serif; }}
  header {{ padding: 6px 12px; background: #1e1e2e; color: #cdd6f4; font-size: 13px; }}
  header .state {{ float: right; opacity: 0.7; }}
  iframe {{ border: 0; width: 100%; height: calc(100% - 30px); }}
</style>
</head>
<body>
<header>Preview <strong>{name}</strong><span class="state" id="state">connecting</span></header>
<iframe src="{prefix}/{name}/app/" title="{name}"></iframe>
<script>
  (function () {{
    var state = document.getElementById("state");
    function ping() {{
      fetch("{prefix}/{name}/ping", {{ method: "POST" }})
        .then(function (r) {{ state.textContent = r.ok ? "live" : "stopped"; }})
        .catch(function () {{ state.textContent = "offline"; }});
    }}
    ping();
    setInterval(ping, {interval_ms});
  }})();
</script>
</body>
</html>
"#
    )
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_embeds_app_and_ping() {
        let html = render_preview_page("demo", "/preview", Duration::from_secs(10));
        assert!(html.contains(r#"<iframe src="/preview/demo/app/""#));
        assert!(html.contains(r#"fetch("/preview/demo/ping""#));
        assert!(html.contains("setInterval(ping, 10000)"));
    }

    #[test]
    fn test_page_escapes_name() {
        let html = render_preview_page("<b>", "/preview", Duration::from_secs(10));
        assert!(html.contains("&lt;b&gt;"));
        assert!(!html.contains("<b>"));
    }

    #[test]
    fn test_ping_interval_floor() {
        let html = render_preview_page("demo", "/p", Duration::from_millis(10));
        assert!(html.contains("setInterval(ping, 1000)"));
    }
}
