use core::fmt::Write as _;

use crate::{
    bootstrap::Passphrase,
    mux::{MuxState, MuxVariant},
    provisioning::ScannedNetwork,
};

pub const SAVE_ACK_BODY: &str = "Saved! Rebooting...";

const PAGE_HEAD: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{title}</title>
  <style>
    body{font-family:'Segoe UI',Tahoma,sans-serif;display:flex;flex-direction:column;align-items:center;justify-content:center;min-height:100vh;margin:0;background:linear-gradient(135deg,#74ABE2,#5563DE);color:#fff}
    h1,h2{margin-bottom:20px;text-shadow:1px 1px 2px rgba(0,0,0,.3)}
    .status{margin-bottom:30px;font-size:1.5rem;padding:10px 20px;background:rgba(255,255,255,.2);border-radius:10px;text-align:center}
    form{display:flex;flex-direction:column;align-items:center}
    .btn,button{background:#fff;color:#5563DE;border:none;padding:15px 30px;margin:10px;font-size:1.2rem;border-radius:8px;cursor:pointer;min-width:160px}
    .btn:hover,button:hover{background:#f0f0f0}
    select,input{font-size:1rem;padding:10px;margin:10px;border-radius:5px;width:250px;box-sizing:border-box}
    .muted{opacity:.8}
  </style>
</head>
<body>
"#;

const PAGE_TAIL: &str = "</body>\n</html>\n";

/// Minimal HTML escaping for text and double-quoted attribute values.
pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn head(title: &str) -> String {
    PAGE_HEAD.replace("{title}", title)
}

pub fn render_control_page(state: MuxState, variant: MuxVariant) -> String {
    let mut html = head("HDMI MUX Control");
    html.push_str("  <h1>HDMI MUX Control</h1>\n");
    let _ = writeln!(
        html,
        "  <div class=\"status\">Current State: <strong>{}</strong></div>",
        escape_html(state.label())
    );
    html.push_str("  <form action=\"/set\" method=\"get\">\n");

    for option in variant.states() {
        let caption = if option.is_enabled() {
            format!("Switch to {}", option.label())
        } else {
            "Disable".to_string()
        };
        let _ = writeln!(
            html,
            "    <button class=\"btn\" name=\"state\" value=\"{}\">{}</button>",
            option.token(),
            escape_html(&caption)
        );
    }

    html.push_str("  </form>\n");
    html.push_str(PAGE_TAIL);
    html
}

pub fn render_setup_page(networks: &[ScannedNetwork]) -> String {
    let mut html = head("Wi-Fi Config");
    html.push_str("  <h2>Select Wi-Fi Network</h2>\n");
    html.push_str("  <form action=\"/save\" method=\"get\">\n");
    html.push_str("    <label for=\"ssid\">SSID:</label>\n");
    html.push_str("    <select name=\"ssid\" id=\"ssid\">\n");

    for network in networks {
        let ssid = escape_html(&network.ssid);
        let _ = writeln!(
            html,
            "      <option value=\"{ssid}\">{ssid} ({} dBm)</option>",
            network.signal_strength
        );
    }

    html.push_str("    </select>\n");
    if networks.is_empty() {
        html.push_str("    <p class=\"muted\">No networks found. Restart the device to scan again.</p>\n");
    }
    html.push_str("    <label for=\"pass\">Password:</label>\n");
    let _ = writeln!(
        html,
        "    <input type=\"password\" id=\"pass\" name=\"pass\" maxlength=\"{}\" placeholder=\"Wi-Fi Password\">",
        Passphrase::capacity()
    );
    html.push_str("    <button type=\"submit\">Save &amp; Connect</button>\n");
    html.push_str("  </form>\n");
    html.push_str(PAGE_TAIL);
    html
}
