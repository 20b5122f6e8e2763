//! Static file serving for sibling assets of a file-sourced test.
//!
//! Everything is delimited to the server's root directory: a resolved path
//! that escapes the root is rejected with 403 before any read happens.

use std::path::Path;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::output::logger::Logger;

/// Fixed extension → MIME mapping. Unknown extensions fall back to
/// `application/octet-stream`.
pub const MIME_TYPES: &[(&str, &str)] = &[
    ("bin", "application/octet-stream"),
    ("css", "text/css"),
    ("gif", "image/gif"),
    ("htm", "text/html"),
    ("html", "text/html"),
    ("jpe", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("jpg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("mjs", "application/javascript"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("ttf", "font/ttf"),
    ("txt", "text/plain"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
];

pub fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) => MIME_TYPES
            .iter()
            .find(|(known, _)| *known == ext)
            .map(|(_, mime)| *mime)
            .unwrap_or("application/octet-stream"),
        None => "application/octet-stream",
    }
}

/// Decode `%XX` escapes; invalid escapes pass through untouched.
pub fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = bytes.get(i + 1..i + 3).and_then(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
            });
            if let Some(byte) = hex {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// True when the path's components walk above the serving root at any
/// point.
fn escapes_root(relative: &str) -> bool {
    let mut depth: i64 = 0;
    for component in relative.split(['/', '\\']) {
        match component {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

/// Serve a file under `root`. 403 when the requested path escapes the root,
/// 404 when it does not exist, 500 (logged) on read errors.
///
/// The escape check is lexical and runs before any filesystem access:
/// escape takes precedence over existence.
pub async fn serve(root: &Path, url_path: &str, logger: &Logger) -> Response {
    let decoded = percent_decode(url_path);
    let relative = decoded.trim_start_matches('/');

    if escapes_root(relative) {
        logger.debug(format!("refusing path outside root: {url_path}"));
        return StatusCode::FORBIDDEN.into_response();
    }

    let candidate = root.join(relative);
    let resolved = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    // Symlinks inside the root can still point out of it.
    let root_resolved = match tokio::fs::canonicalize(root).await {
        Ok(path) => path,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    if !resolved.starts_with(&root_resolved) {
        logger.debug(format!("refusing path outside root: {url_path}"));
        return StatusCode::FORBIDDEN.into_response();
    }
    if !resolved.is_file() {
        return StatusCode::NOT_FOUND.into_response();
    }

    match tokio::fs::read(&resolved).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, mime_for(&resolved))],
            bytes,
        )
            .into_response(),
        Err(err) => {
            logger.warn(format!("failed to read {}: {}", resolved.display(), err));
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
