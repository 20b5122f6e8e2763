//! The control server: one loopback HTTP proxy per test input.
//!
//! It serves the instrumented test page plus any sibling static files,
//! receives the agent's TAP POSTs, and demultiplexes them to the right
//! client's parser. The test body is prefetched in parallel with the
//! socket bind and held in memory; a URL input that cannot be fetched
//! aborts the run before any browser is launched.

pub mod static_files;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use axum::extract::{RawQuery, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::client::ClientMap;
use crate::events::EventBus;
use crate::output::logger::Logger;
use crate::page;

/// A test input: a local HTML file or an absolute URL.
#[derive(Debug, Clone)]
pub struct TestInput {
    pub raw: String,
    pub kind: InputKind,
}

#[derive(Debug, Clone)]
pub enum InputKind {
    File {
        /// Nearest directory containing the file; the static-serving root.
        root: PathBuf,
        /// Path of the test file relative to `root`, `/`-separated.
        display: String,
        /// Absolute filesystem path used for reads.
        abs: PathBuf,
    },
    Url(Url),
}

impl TestInput {
    /// Resolve a raw CLI input against `cwd`.
    ///
    /// File paths are normalized so the root is the nearest directory that
    /// contains the file: leading `..` segments move the root up, and the
    /// remaining path (backslashes normalized to `/`) becomes the display
    /// path used in URLs and events.
    pub fn resolve(raw: &str, cwd: &Path) -> Result<TestInput> {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url = Url::parse(raw).with_context(|| format!("invalid test URL '{raw}'"))?;
            return Ok(TestInput {
                raw: raw.to_string(),
                kind: InputKind::Url(url),
            });
        }

        let normalized = raw.replace('\\', "/");
        let path = Path::new(&normalized);

        let (root, display) = if path.is_absolute() {
            let abs = path.to_path_buf();
            let root = abs
                .parent()
                .with_context(|| format!("test file '{raw}' has no parent directory"))?
                .to_path_buf();
            let name = abs
                .file_name()
                .with_context(|| format!("test file '{raw}' has no file name"))?
                .to_string_lossy()
                .into_owned();
            (root, name)
        } else {
            let mut root = cwd.to_path_buf();
            let mut rest: Vec<String> = Vec::new();
            for component in path.components() {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir if rest.is_empty() => {
                        root = root
                            .parent()
                            .with_context(|| {
                                format!("cannot resolve '{raw}': ran out of parent directories")
                            })?
                            .to_path_buf();
                    }
                    other => rest.push(other.as_os_str().to_string_lossy().into_owned()),
                }
            }
            if rest.is_empty() {
                bail!("'{raw}' does not name a test file");
            }
            (root, rest.join("/"))
        };

        let abs = root.join(display.replace('/', std::path::MAIN_SEPARATOR_STR));
        if !abs.is_file() {
            bail!("no such test file: {raw}");
        }

        Ok(TestInput {
            raw: raw.to_string(),
            kind: InputKind::File { root, display, abs },
        })
    }

    /// The value reporters see in `testFile` fields.
    pub fn display(&self) -> &str {
        match &self.kind {
            InputKind::File { display, .. } => display,
            InputKind::Url(_) => &self.raw,
        }
    }
}

/// Strip ANSI SGR sequences (`ESC[…m`) so colorized TAP emitters cannot
/// confuse the parser.
pub fn strip_ansi(input: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new("\u{1b}\\[[0-9;]*m").unwrap());
    re.replace_all(input, "").into_owned()
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

static SERVER_SEQ: AtomicU64 = AtomicU64::new(1);

/// State shared between the HTTP handlers, the watchdog, and supervisors.
pub struct ServerShared {
    pub id: String,
    pub input: TestInput,
    pub proxy_base: String,
    pub html: String,
    pub clients: ClientMap,
    pub bus: Arc<EventBus>,
    pub logger: Logger,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl ServerShared {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

/// Listening proxy for one test input. Create with [`ControlServer::start`],
/// tear down with [`ControlServer::close`].
pub struct ControlServer {
    pub shared: Arc<ServerShared>,
    serve_task: JoinHandle<()>,
}

impl ControlServer {
    pub async fn start(
        input: TestInput,
        bus: Arc<EventBus>,
        logger: &Logger,
    ) -> Result<ControlServer> {
        let id = format!("server_{}", SERVER_SEQ.fetch_add(1, Ordering::Relaxed));
        let logger = logger.scoped(&id);

        // Prefetch in parallel with the bind.
        let (listener, html) = tokio::join!(
            tokio::net::TcpListener::bind(("127.0.0.1", 0)),
            fetch_test_html(&input),
        );
        let listener = listener.context("failed to bind control server socket")?;
        let html = html?;
        let addr = listener.local_addr()?;
        let proxy_base = format!("http://{addr}");
        logger.debug(format!("listening on {proxy_base} for {}", input.display()));

        let shared = Arc::new(ServerShared {
            id,
            input,
            proxy_base,
            html,
            clients: Arc::new(Mutex::new(HashMap::new())),
            bus,
            logger,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let router = Router::new()
            .route("/.qtap/tap/", post(receive_tap))
            .fallback(serve_any)
            .with_state(shared.clone());

        let shutdown = shared.shutdown.clone();
        let task_logger = shared.logger.clone();
        let serve_task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await;
            if let Err(err) = result {
                task_logger.warn(format!("control server stopped: {err}"));
            }
        });

        Ok(ControlServer { shared, serve_task })
    }

    /// Stop listening. Idempotent: the second call is a no-op returning
    /// false.
    pub fn close(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.logger.debug("closing");
        self.shared.shutdown.cancel();
        true
    }

    /// Wait for the listener task to wind down after `close`.
    #[allow(dead_code)]
    pub async fn join(self) {
        let _ = self.serve_task.await;
    }
}

async fn fetch_test_html(input: &TestInput) -> Result<String> {
    match &input.kind {
        InputKind::File { abs, .. } => tokio::fs::read_to_string(abs)
            .await
            .with_context(|| format!("failed to read test file {}", abs.display())),
        InputKind::Url(url) => {
            let response = reqwest::get(url.clone())
                .await
                .with_context(|| format!("failed to fetch test URL {url}"))?;
            let response = response
                .error_for_status()
                .with_context(|| format!("test URL {url} returned an error status"))?;
            response
                .text()
                .await
                .with_context(|| format!("failed to read body of test URL {url}"))
        }
    }
}

/// `POST /.qtap/tap/?qtap_clientId=<id>`: route the body to the client's
/// parser. Unknown ids are logged and discarded; the agent always gets 204.
async fn receive_tap(
    State(shared): State<Arc<ServerShared>>,
    RawQuery(query): RawQuery,
    body: String,
) -> StatusCode {
    let client_id = query.as_deref().and_then(|q| query_param(q, "qtap_clientId"));
    let body = strip_ansi(&body);

    let client = client_id.as_ref().and_then(|id| {
        let clients = shared.clients.lock().unwrap();
        clients.get(id).cloned()
    });

    match client {
        Some(client) => client.feed(&body),
        None => shared.logger.debug(format!(
            "discarding TAP for unknown client {}",
            client_id.as_deref().unwrap_or("<missing>")
        )),
    }
    StatusCode::NO_CONTENT
}

/// Everything except the TAP endpoint: requests carrying `qtap_clientId`
/// get the instrumented page for that client; anything else is a static
/// file under the root (file inputs only).
async fn serve_any(State(shared): State<Arc<ServerShared>>, uri: Uri) -> Response {
    let client_id = uri.query().and_then(|q| query_param(q, "qtap_clientId"));

    if let Some(client_id) = client_id {
        let client = {
            let clients = shared.clients.lock().unwrap();
            clients.get(&client_id).cloned()
        };
        match client {
            Some(client) => client.mark_online(),
            None => shared
                .logger
                .debug(format!("page request for unknown client {client_id}")),
        }

        let base_href = match &shared.input.kind {
            InputKind::Url(url) => Some(url.as_str()),
            InputKind::File { .. } => None,
        };
        let html = page::instrument(&shared.html, &shared.proxy_base, &client_id, base_href);
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            html,
        )
            .into_response();
    }

    match &shared.input.kind {
        InputKind::File { root, .. } => {
            static_files::serve(root, uri.path(), &shared.logger).await
        }
        InputKind::Url(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn resolves_relative_file_input() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("test/fixtures")).unwrap();
        fs::write(dir.path().join("test/fixtures/pass.html"), "<html/>").unwrap();

        let input = TestInput::resolve("test/fixtures/pass.html", dir.path()).unwrap();
        match input.kind {
            InputKind::File { root, display, .. } => {
                assert_eq!(root, dir.path());
                assert_eq!(display, "test/fixtures/pass.html");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn climbs_parent_prefixes_out_of_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("project");
        fs::create_dir_all(&cwd).unwrap();
        fs::create_dir_all(dir.path().join("sibling")).unwrap();
        fs::write(dir.path().join("sibling/x.html"), "<html/>").unwrap();

        let input = TestInput::resolve("../sibling/x.html", &cwd).unwrap();
        match input.kind {
            InputKind::File { root, display, .. } => {
                assert_eq!(root, dir.path());
                assert_eq!(display, "sibling/x.html");
            }
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn normalizes_backslashes_in_display() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/t.html"), "<html/>").unwrap();

        let input = TestInput::resolve("sub\\t.html", dir.path()).unwrap();
        assert_eq!(input.display(), "sub/t.html");
    }

    #[test]
    fn missing_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = TestInput::resolve("nope.html", dir.path()).unwrap_err();
        assert!(err.to_string().contains("no such test file"));
    }

    #[test]
    fn url_input_keeps_raw_as_display() {
        let input =
            TestInput::resolve("https://example.org/suite/test.html?mod=a", Path::new("/")).unwrap();
        assert!(matches!(input.kind, InputKind::Url(_)));
        assert_eq!(input.display(), "https://example.org/suite/test.html?mod=a");
    }

    #[test]
    fn strip_ansi_removes_sgr_only() {
        let colored = "\u{1b}[32mok 1\u{1b}[0m - fine";
        assert_eq!(strip_ansi(colored), "ok 1 - fine");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param("a=1&qtap_clientId=client_7&b=2", "qtap_clientId").as_deref(),
            Some("client_7")
        );
        assert_eq!(query_param("a=1", "qtap_clientId"), None);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.html"), "<html></html>").unwrap();
        let input = TestInput::resolve("t.html", dir.path()).unwrap();
        let server = ControlServer::start(input, EventBus::new(), &Logger::new(false))
            .await
            .unwrap();
        assert!(server.close());
        assert!(!server.close());
        server.join().await;
    }
}
