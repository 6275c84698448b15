//! Bundled static asset serving collaborator shim.
//!
//! `SPEC_FULL.md` §1 lists "bundled static asset serving" as an out-of-scope collaborator — the
//! real operator UI build output. This embeds whatever lives under `static/` at compile time
//! (mirroring the original's `//go:embed client/build`) so `GET /` has something to wire up to;
//! the shipped `static/index.html` is a placeholder, not the operator UI itself.

use include_dir::{Dir, include_dir};

static ASSETS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/static");

/// Resolves a request path to embedded file contents and a best-effort content type.
/// `/` and any path with no match fall back to `index.html`.
pub fn lookup(path: &str) -> Option<(&'static [u8], &'static str)> {
	let trimmed = path.trim_start_matches('/');
	let candidate = if trimmed.is_empty() { "index.html" } else { trimmed };
	ASSETS
		.get_file(candidate)
		.or_else(|| ASSETS.get_file("index.html"))
		.map(|f| (f.contents(), mime_for(candidate)))
}

fn mime_for(path: &str) -> &'static str {
	match path.rsplit('.').next() {
		Some("html") => "text/html; charset=utf-8",
		Some("js") => "application/javascript",
		Some("css") => "text/css",
		Some("json") => "application/json",
		Some("svg") => "image/svg+xml",
		_ => "application/octet-stream",
	}
}
