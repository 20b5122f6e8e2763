//! Instrumented test page construction.
//!
//! The served HTML is the prefetched test body with two injections: a
//! `<script>` in the head carrying the in-page agent (captures TAP output
//! from `console.log` and error telemetry, streams it back over buffered
//! POSTs), and a small compatibility script at the end of the body for
//! frameworks that enable their TAP reporter programmatically.
//!
//! Injections never contain a newline, so document line numbers (and with
//! them stack traces) are unchanged.

use std::sync::OnceLock;

use regex::Regex;

/// Browser-side agent source. `{{QTAP_URL}}` is replaced with the TAP
/// endpoint for the specific client the page is served to.
///
/// Send policy is a single-flight trampoline: while a POST is in flight
/// nothing else is sent; on completion, anything buffered meanwhile goes out
/// immediately. A single in-flight `XMLHttpRequest` keeps delivery ordered
/// without server-side sequence numbers. References to `setTimeout` and
/// `XMLHttpRequest` are captured up front so user-space mocks cannot
/// intercept the agent.
const AGENT_JS: &str = r#"(function () {
  var url = '{{QTAP_URL}}';
  var XHR = window.XMLHttpRequest;
  var laterTick = window.setTimeout;
  var buffer = '';
  var inflight = false;
  var scheduled = false;
  function send() {
    scheduled = false;
    if (!buffer || inflight) { return; }
    var body = buffer;
    buffer = '';
    inflight = true;
    var xhr = new XHR();
    xhr.onload = xhr.onerror = function () {
      inflight = false;
      if (buffer) { send(); }
    };
    xhr.open('POST', url, true);
    xhr.send(body);
  }
  function queue(text) {
    buffer += text;
    if (!inflight && !scheduled) {
      scheduled = true;
      laterTick(send, 0);
    }
  }
  function consoleLine(text) {
    queue('# console: ' + String(text).replace(/\n/g, '\n# console: ') + '\n');
  }
  window.qunit_config_reporters_tap = 'true';
  var origLog = console.log;
  console.log = function (message) {
    if (typeof message === 'string') {
      queue(message + '\n');
    } else {
      origLog.apply(console, arguments);
    }
  };
  var origWarn = console.warn;
  console.warn = function (message) {
    consoleLine(message);
    origWarn.apply(console, arguments);
  };
  var origError = console.error;
  console.error = function (message) {
    consoleLine(message);
    origError.apply(console, arguments);
  };
  window.addEventListener('error', function (event) {
    consoleLine(event.error && event.error.stack ? event.error.stack : event.message);
  });
}());"#;

/// Enables a framework's TAP reporter when it only supports programmatic
/// configuration and has loaded by end of body.
const BODY_JS: &str = r#"(function () {
  if (window.QUnit && QUnit.config && !QUnit.config.reporters) {
    QUnit.config.reporters = { tap: true };
  }
}());"#;

/// The TAP ingest URL the agent posts to for a given client.
pub fn tap_url(proxy_base: &str, client_id: &str) -> String {
    format!("{proxy_base}/.qtap/tap/?qtap_clientId={client_id}")
}

fn head_res() -> &'static [Regex; 3] {
    static RES: OnceLock<[Regex; 3]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?i)<head(\s[^>]*)?>").unwrap(),
            Regex::new(r"(?i)<html(\s[^>]*)?>").unwrap(),
            Regex::new(r"(?i)<!doctype(\s[^>]*)?>").unwrap(),
        ]
    })
}

fn body_res() -> &'static [Regex; 2] {
    static RES: OnceLock<[Regex; 2]> = OnceLock::new();
    RES.get_or_init(|| {
        [
            Regex::new(r"(?i)</body\s*>").unwrap(),
            Regex::new(r"(?i)</html\s*>").unwrap(),
        ]
    })
}

/// Offset right after the first matching of `<head>`, `<html>`, `<!doctype>`;
/// document start otherwise.
fn head_insert_pos(html: &str) -> usize {
    for re in head_res() {
        if let Some(found) = re.find(html) {
            return found.end();
        }
    }
    0
}

/// Offset right before `</body>`, else `</html>`, else document end.
fn body_insert_pos(html: &str) -> usize {
    for re in body_res() {
        if let Some(found) = re.find(html) {
            return found.start();
        }
    }
    html.len()
}

/// Build the instrumented page for one client.
///
/// `base_href` is set for URL-sourced tests so relative asset references
/// still resolve against the origin; file-sourced tests get no `<base>`.
pub fn instrument(
    html: &str,
    proxy_base: &str,
    client_id: &str,
    base_href: Option<&str>,
) -> String {
    let url = tap_url(proxy_base, client_id).replace('\'', "%27");
    let agent = AGENT_JS.replace("{{QTAP_URL}}", &url).replace('\n', " ");

    let mut head_inject = String::new();
    if let Some(href) = base_href {
        head_inject.push_str(&format!("<base href=\"{}\"/>", href.replace('"', "%22")));
    }
    head_inject.push_str("<script>");
    head_inject.push_str(&agent);
    head_inject.push_str("</script>");

    let body_inject = format!("<script>{}</script>", BODY_JS.replace('\n', " "));

    let head_pos = head_insert_pos(html);
    let mut out = String::with_capacity(html.len() + head_inject.len() + body_inject.len());
    out.push_str(&html[..head_pos]);
    out.push_str(&head_inject);
    out.push_str(&html[head_pos..]);

    let body_pos = body_insert_pos(&out);
    out.insert_str(body_pos, &body_inject);
    out
}
