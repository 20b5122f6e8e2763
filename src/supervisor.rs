//! Per-(test input × browser) supervision.
//!
//! The supervisor creates the client, invokes the launcher, and publishes
//! the `client` event before awaiting the launch future, so reporters see
//! the browser's display name even when the launch itself takes a while.
//! Launch failures bail the client and propagate to the orchestrator.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::browsers::{BrowserLauncher, LaunchContext};
use crate::client::{next_client_id, Client, ClientOutcome, ClientState};
use crate::events::{ClientEvent, RunEvent};
use crate::server::{InputKind, ServerShared, TestInput};

/// How long to wait for the browser process to exit after its cancellation
/// fired, before giving up on the reap.
const EXIT_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bail reason for clients stopped because the run as a whole is going
/// down (launch failure elsewhere, reporter fault, interrupt).
pub const STOPPED_REASON: &str = "Stopped by test harness";

/// The URL the browser opens.
///
/// File tests are served under the normalized display path. URL tests keep
/// the original path and query (tests that inspect `location` behave as
/// they would without the proxy) with only `qtap_clientId` added; the
/// proxy serves the instrumented body for them on any path.
pub fn test_url(input: &TestInput, proxy_base: &str, client_id: &str) -> String {
    match &input.kind {
        InputKind::File { display, .. } => {
            format!("{proxy_base}/{display}?qtap_clientId={client_id}")
        }
        InputKind::Url(url) => {
            let mut out = format!("{proxy_base}{}", url.path());
            let mut sep = '?';
            if let Some(query) = url.query() {
                out.push('?');
                out.push_str(query);
                sep = '&';
            }
            out.push(sep);
            out.push_str("qtap_clientId=");
            out.push_str(client_id);
            out
        }
    }
}

/// Run one (server × browser) pair to completion.
///
/// `stop` aborts this client when the orchestrator tears the run down
/// early. Returns the client's terminal outcome, or an error when the
/// browser could not be launched (the client has already bailed then).
pub async fn run_pair(
    server: Arc<ServerShared>,
    launcher: Arc<dyn BrowserLauncher>,
    global_signal: CancellationToken,
    stop: CancellationToken,
    debug: bool,
    launched: mpsc::Sender<ClientEvent>,
) -> Result<ClientOutcome> {
    let client_id = next_client_id();
    let url = test_url(&server.input, &server.proxy_base, &client_id);

    let client = Client::new(
        client_id,
        server.input.display().to_string(),
        launcher.name().to_string(),
        launcher.display_name(),
        server.proxy_base.clone(),
        server.bus.clone(),
        server.clients.clone(),
        server.logger.clone(),
    );

    // In debug mode the launcher gets a token that never fires, keeping the
    // browser open for inspection; the real token still drives bookkeeping.
    let browser_signal = if debug {
        CancellationToken::new()
    } else {
        client.token.clone()
    };

    let mut launch = launcher.launch(LaunchContext {
        url,
        browser_signal,
        global_signal,
        logger: server.logger.scoped(launcher.name()),
        debug,
    });

    // Invoke first, then announce: the `client` event must precede the
    // launch await.
    let announcement = ClientEvent {
        client_id: client.id.clone(),
        test_file: client.test_file.clone(),
        browser_name: client.browser_name.clone(),
        display_name: client.display_name.clone(),
    };
    server.bus.emit(RunEvent::Client(announcement.clone()));
    let _ = launched.send(announcement).await;

    tokio::select! {
        result = &mut launch => {
            if let Err(err) = result {
                if !client.token.is_cancelled() {
                    // Fatal launch failure: bail this client and re-throw so
                    // the orchestrator can stop the other clients.
                    client.try_terminal(
                        ClientState::LaunchError,
                        ClientOutcome::Bail(format!("{err:#}")),
                    );
                    return Err(err);
                }
            }
        }
        _ = client.token.cancelled() => {
            reap(&server, &client.id, &mut launch, debug).await;
        }
        _ = stop.cancelled() => {
            client.try_terminal(
                ClientState::Bailed,
                ClientOutcome::Bail(STOPPED_REASON.to_string()),
            );
            reap(&server, &client.id, &mut launch, debug).await;
        }
    }

    match client.outcome() {
        Some(outcome) => Ok(outcome),
        None => {
            // The launcher resolved without a cancellation; treat the early
            // exit as a failure of this client.
            client.try_terminal(
                ClientState::LaunchError,
                ClientOutcome::Bail("Browser ended unexpectedly".to_string()),
            );
            Ok(client.outcome().expect("terminal client has an outcome"))
        }
    }
}

/// Wait for the browser process to wind down after its cancellation fired.
/// Debug-mode browsers are deliberately left running.
async fn reap(
    server: &ServerShared,
    client_id: &str,
    launch: &mut (impl std::future::Future<Output = Result<()>> + Unpin),
    debug: bool,
) {
    if !debug
        && tokio::time::timeout(EXIT_REAP_TIMEOUT, launch)
            .await
            .is_err()
    {
        server
            .logger
            .warn(format!("browser for {client_id} did not exit in time"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn file_input(dir: &Path) -> TestInput {
        std::fs::write(dir.join("t.html"), "<html></html>").unwrap();
        TestInput::resolve("t.html", dir).unwrap()
    }

    #[test]
    fn file_url_uses_display_path() {
        let dir = tempfile::tempdir().unwrap();
        let input = file_input(dir.path());
        assert_eq!(
            test_url(&input, "http://127.0.0.1:9000", "client_3"),
            "http://127.0.0.1:9000/t.html?qtap_clientId=client_3"
        );
    }

    #[test]
    fn url_input_preserves_path_and_query() {
        let input = TestInput::resolve(
            "https://example.org/suite/test.html?module=core&x=1",
            Path::new("/"),
        )
        .unwrap();
        assert_eq!(
            test_url(&input, "http://127.0.0.1:9000", "client_4"),
            "http://127.0.0.1:9000/suite/test.html?module=core&x=1&qtap_clientId=client_4"
        );
    }

    #[test]
    fn url_input_without_query_gets_question_mark() {
        let input =
            TestInput::resolve("https://example.org/t.html", Path::new("/")).unwrap();
        assert_eq!(
            test_url(&input, "http://127.0.0.1:9000", "client_5"),
            "http://127.0.0.1:9000/t.html?qtap_clientId=client_5"
        );
    }
}
