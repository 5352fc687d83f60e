//! Landing page.
//!
//! A minimal HTML page describing how to reach the gateway. The real UI is
//! the bundled browser client served from `server.novnc_dir`; this page is
//! also what the reverse tunnel's scheme autodetection probes, so it must
//! answer 200 on a plain GET.

use std::fmt::Write;

use axum::extract::State;
use axum::response::Html;

use crate::AppState;

/// `GET /` — landing page. Connection options are hidden when `basic_ui`
/// is set.
pub async fn index(State(state): State<AppState>) -> Html<String> {
    let policy = &state.policy;

    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>vncgate</title></head>\n<body>\n<h1>vncgate</h1>\n",
    );

    if state.config.server.basic_ui {
        page.push_str("<p>Connect your viewer to <a href=\"/vnc\"><code>/vnc</code></a>.</p>\n");
    } else if policy.host_options().is_empty() {
        let _ = writeln!(
            page,
            "<p>Default destination: <code>{}:{}</code> via <a href=\"/vnc\"><code>/vnc</code></a>.</p>",
            policy.default_host(),
            policy.default_port()
        );
        if policy.arbitrary_hosts() {
            page.push_str("<p>Other hosts: <code>/vnc/&lt;host&gt;</code>");
            if policy.arbitrary_ports() {
                page.push_str(" or <code>/vnc/&lt;host&gt;/&lt;port&gt;</code>");
            }
            page.push_str(".</p>\n");
        }
    } else {
        page.push_str("<ul>\n");
        for option in policy.host_options() {
            let _ = writeln!(
                page,
                "<li><a href=\"/vnc/{host}/{port}\">{name}</a> — <code>{host}:{port}</code></li>",
                name = option.name,
                host = option.host,
                port = option.port
            );
        }
        page.push_str("</ul>\n");
    }

    page.push_str("</body>\n</html>\n");
    Html(page)
}
