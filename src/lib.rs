#![allow(clippy::too_many_arguments)]

use anyhow::Result;
use url::Url;

pub mod aws_credentials;
pub mod batch_path;
pub mod clock;
pub mod config;
pub mod gcp_oauth;
pub mod http;
pub mod logging;
pub mod metrics;
mod retries;
pub mod scheduler;
pub mod storage;
pub mod task;
pub mod test_utils;

/// The timestamp format used in batch object keys and task payloads: UTC with
/// minute precision, e.g. "2020/10/31/20/29".
pub const DATE_FORMAT: &str = "%Y/%m/%d/%H/%M";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
    #[error("HTTP resource error: {0}")]
    HttpError(#[from] ureq::Error),
    #[error("error parsing time: {0}")]
    TimeParse(#[from] chrono::ParseError),
    #[error("missing arguments: {0}")]
    MissingArguments(&'static str),
    #[error(transparent)]
    Url(#[from] UrlParseError),
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse: {1}, {0}")]
pub struct UrlParseError(url::ParseError, String);

pub fn parse_url(input: String) -> Result<Url, UrlParseError> {
    Url::parse(&input).map_err(|e| UrlParseError(e, input))
}
