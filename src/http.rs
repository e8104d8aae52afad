//! Shared reqwest plumbing for the workspace API and service adapters.
use crate::error::{PipeError, PipeResult};
use reqwest::{Client, Response, StatusCode, Url};
use tracing::warn;

pub fn client() -> PipeResult<Client> {
    Ok(Client::builder().user_agent("pipesync/0.1").build()?)
}

/// Parses a base URL, making sure relative joins stay below it.
pub fn base_url(raw: &str) -> PipeResult<Url> {
    let mut raw = raw.trim().to_string();
    if !raw.ends_with('/') {
        raw.push('/');
    }
    Url::parse(&raw).map_err(|e| PipeError::Config(format!("invalid url '{}': {}", raw, e)))
}

pub fn join(base: &Url, path: &str) -> PipeResult<Url> {
    base.join(path)
        .map_err(|e| PipeError::Config(format!("invalid path '{}': {}", path, e)))
}

/// Returns the body of a successful response. Rejected credentials become
/// `Auth` errors, any other failure status a `Remote` error.
pub async fn read_body(res: Response) -> PipeResult<String> {
    let status = res.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        let body = res.text().await.unwrap_or_default();
        return Err(PipeError::Auth(format!("{}: {}", status, body)));
    }
    if !status.is_success() {
        let body = res.text().await.unwrap_or_default();
        warn!(%status, "remote api error");
        return Err(PipeError::Remote { status, body });
    }
    Ok(res.text().await?)
}
