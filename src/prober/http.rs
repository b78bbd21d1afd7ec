//! HTTP check

use std::error::Error as _;
use std::io;
use std::time::Duration;

use reqwest::{Client, Url};
use tracing::trace;

use crate::model::{HttpMethod, StatusMatcher, status_allowed};

use super::{ProbeError, policy};

/// Issue one request and compare the response status against the allowed list.
///
/// Returns the status code when it is allowed.
pub(super) async fn check_http(
    client: &Client,
    url: &str,
    method: HttpMethod,
    allowed_status: &[StatusMatcher],
    timeout: Duration,
    allow_private: bool,
) -> Result<u16, ProbeError> {
    let parsed = Url::parse(url).map_err(|e| ProbeError::InvalidTarget(format!("{url}: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ProbeError::InvalidTarget(format!(
            "unsupported scheme '{}'",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| ProbeError::InvalidTarget(format!("{url}: missing host")))?;
    let port = parsed.port_or_known_default().unwrap_or(80);

    let addrs = policy::resolve(host, port).await?;
    if !allow_private {
        policy::ensure_allowed(&addrs)?;
    }

    let method = match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
    };

    let response = client
        .request(method, parsed)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let status_code = response.status().as_u16();
    trace!("received status {status_code}");

    if status_allowed(allowed_status, status_code) {
        Ok(status_code)
    } else {
        Err(ProbeError::DisallowedStatus(status_code))
    }
}

/// Map a client error onto the probe error taxonomy.
///
/// URLs are stripped so query-string credentials never end up in stored errors.
fn classify(error: reqwest::Error, timeout: Duration) -> ProbeError {
    if error.is_timeout() {
        return ProbeError::Timeout(timeout);
    }

    let error = error.without_url();

    if error.is_redirect() {
        let message = describe(&error);
        if message.contains("network policy") {
            return ProbeError::PolicyBlocked(message);
        }
        return ProbeError::Network(message);
    }

    let refused = {
        let mut source = error.source();
        let mut found = false;
        while let Some(err) = source {
            if let Some(io_err) = err.downcast_ref::<io::Error>() {
                if io_err.kind() == io::ErrorKind::ConnectionRefused {
                    found = true;
                    break;
                }
            }
            source = err.source();
        }
        found
    };

    if refused {
        ProbeError::Refused(describe(&error))
    } else {
        ProbeError::Network(describe(&error))
    }
}

/// Render an error together with its source chain
fn describe(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}
