//! Registry HTTP routes.
//!
//! Only the routes required for pulling images exist; pushing and the
//! rest of the registry API are not part of this service. Image names
//! may contain slashes, so the V2 sub-paths are matched with the same
//! regexes the protocol defines rather than with path segments.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use nixery_core::error::NixeryError;
use nixery_registry::manifest::MANIFEST_TYPE;
use nixery_registry::storage::{Persister, ServeOutcome};
use nixery_registry::{build_image, Image};

use crate::error::RegistryError;

type BuildState = Arc<nixery_registry::State>;

fn manifest_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([\w\-._/]+)/manifests/([\w\-._]+)$").unwrap())
}

fn blob_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([\w\-._/]+)/(blobs|manifests)/sha256:([a-f0-9]{64})$").unwrap())
}

/// Build the full application router.
pub fn router(state: BuildState) -> Router {
    let web_dir = state.config.web_dir.clone();

    Router::new()
        .route("/", get(index))
        .nest_service("/static", ServeDir::new(web_dir))
        .route("/v2/", get(version_check))
        .route("/v2/*path", get(dispatch))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Protocol acknowledgement: an empty 200 tells clients we speak V2.
async fn version_check() -> StatusCode {
    StatusCode::OK
}

/// Dispatch a request below `/v2/` to the matching handler.
async fn dispatch(
    Path(path): Path<String>,
    State(state): State<BuildState>,
    headers: HeaderMap,
) -> Response {
    if let Some(captures) = blob_regex().captures(&path) {
        let digest = captures[3].to_string();
        return match serve_blob(&state, &digest, &headers).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
    }

    if let Some(captures) = manifest_regex().captures(&path) {
        let name = captures[1].to_string();
        let tag = captures[2].to_string();
        return match serve_manifest_tag(&state, &name, &tag).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        };
    }

    tracing::info!(uri = %path, "unsupported registry route");
    StatusCode::NOT_FOUND.into_response()
}

/// Build (or cache-hit) an image and serve its manifest.
async fn serve_manifest_tag(
    state: &BuildState,
    name: &str,
    tag: &str,
) -> Result<Response, RegistryError> {
    tracing::info!(image = %name, tag = %tag, "requesting image manifest");

    let image = Image::from_name(name, tag);

    let manifest = match build_image(state, &image).await {
        Ok(manifest) => manifest,
        Err(e) => {
            state.errors.add(&format!("{}:{}", image.name, tag), &e.to_string());

            match &e {
                NixeryError::PackagesNotFound { pkgs } => {
                    tracing::warn!(image = %name, tag = %tag, packages = ?pkgs, "could not find Nix packages");
                }
                _ => {
                    tracing::error!(image = %name, tag = %tag, error = %e, "failed to build image manifest");
                }
            }

            return Err(RegistryError::from_build_failure(&e));
        }
    };

    // The manifest has to be persisted into blob storage before any
    // response bytes go out: clients are known to immediately refetch
    // it by the digest they compute from the body.
    let mut hasher = Sha256::new();
    hasher.update(&manifest);
    let sha256 = hex::encode(hasher.finalize());

    let bytes = manifest.clone();
    let reported = sha256.clone();
    let persister: Persister = Box::new(move |w: &mut dyn Write| {
        w.write_all(&bytes)?;
        Ok((reported, bytes.len() as u64))
    });

    if let Err(e) = state
        .storage
        .persist(&format!("layers/{}", sha256), MANIFEST_TYPE, persister)
        .await
    {
        tracing::error!(image = %name, tag = %tag, error = %e, "could not upload manifest");
        return Err(RegistryError::manifest_upload());
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, MANIFEST_TYPE)
        .header("Docker-Content-Digest", format!("sha256:{}", sha256))
        .body(Body::from(manifest))
        .map_err(|_| RegistryError::unknown("failed to construct response"))
}

/// Serve a blob by digest, either by streaming it from disk or by
/// redirecting the client at the object store.
async fn serve_blob(
    state: &BuildState,
    digest: &str,
    headers: &HeaderMap,
) -> Result<Response, RegistryError> {
    match state.storage.serve(digest).await {
        Ok(ServeOutcome::File(path)) => stream_blob_file(path, digest, headers).await,
        Ok(ServeOutcome::Redirect(url)) => Response::builder()
            .status(StatusCode::SEE_OTHER)
            .header(header::LOCATION, url)
            .body(Body::empty())
            .map_err(|_| RegistryError::unknown("failed to construct response")),
        Err(NixeryError::NotFound { .. }) => Err(RegistryError::blob_unknown()),
        Err(e) => {
            tracing::error!(
                layer = %digest,
                backend = %state.storage.name(),
                error = %e,
                "failed to serve blob from storage backend"
            );
            Err(RegistryError::unknown("storage failure"))
        }
    }
}

/// A single `bytes=start-end` range, if the request carries one we can
/// satisfy. Suffix and multi-range requests fall back to a full
/// response.
fn parse_range(headers: &HeaderMap, len: u64) -> Option<(u64, u64)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }

    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = if end.is_empty() {
        len.checked_sub(1)?
    } else {
        end.parse().ok()?
    };

    (start <= end && end < len).then_some((start, end))
}

async fn stream_blob_file(
    path: PathBuf,
    digest: &str,
    headers: &HeaderMap,
) -> Result<Response, RegistryError> {
    let mut file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to open blob file");
            return Err(RegistryError::unknown("storage failure"));
        }
    };

    let len = match file.metadata().await {
        Ok(meta) => meta.len(),
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to stat blob file");
            return Err(RegistryError::unknown("storage failure"));
        }
    };

    if let Some((start, end)) = parse_range(headers, len) {
        if file.seek(std::io::SeekFrom::Start(start)).await.is_err() {
            return Err(RegistryError::unknown("storage failure"));
        }
        let count = end - start + 1;

        return Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .header(header::CONTENT_LENGTH, count)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, len),
            )
            .header("Docker-Content-Digest", format!("sha256:{}", digest))
            .body(Body::from_stream(ReaderStream::new(file.take(count))))
            .map_err(|_| RegistryError::unknown("failed to construct response"));
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header("Docker-Content-Digest", format!("sha256:{}", digest))
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|_| RegistryError::unknown("failed to construct response"))
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// The landing page: version information and recent build failures.
async fn index(State(state): State<BuildState>) -> Html<String> {
    let errors = state.errors.recent();

    let error_section = if errors.is_empty() {
        String::new()
    } else {
        let rows: String = errors
            .iter()
            .map(|e| {
                format!(
                    "<tr><td><code>{}</code></td><td>{}</td></tr>",
                    html_escape(&e.key),
                    html_escape(&e.error)
                )
            })
            .collect();

        format!(
            "<h2>Recent build errors</h2>\
             <table><tr><th>Image</th><th>Error</th></tr>{}</table>",
            rows
        )
    };

    Html(format!(
        "<!doctype html>\
         <html><head><title>Nixery</title></head><body>\
         <h1>Nixery</h1>\
         <p>An on-demand container image registry.</p>\
         <p>Pull an image by naming the packages it should contain, e.g. \
         <code>docker pull &lt;host&gt;/shell/git/htop</code>.</p>\
         <p><small>version {}</small></p>\
         {}\
         </body></html>",
        html_escape(nixery_core::VERSION),
        error_section
    ))
}
