/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// The REST batch channel: POST /changes to upload, GET /changes to
// download.  Blocking reqwest, no cookies, per-request timeout; every
// request carries the four identity headers.

use std::sync::Arc;
use std::time::Duration;

use url::Url;

use crate::error::*;
use crate::sync::record::{ChangeLog, ChangeSet, UploadAck};
use crate::transport::{RequestContext, Transport};
use types::Timestamp;

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    changes_url: Url,
    ctx: Arc<RequestContext>,
}

impl HttpTransport {
    pub fn new(
        server_url: &str,
        request_timeout: Duration,
        ctx: Arc<RequestContext>,
    ) -> Result<Self> {
        let base = Url::parse(server_url)?;
        let changes_url = base.join("changes")?;
        // Note: no cookie or cache support, like the rest of our HTTP
        // stack.
        let client = reqwest::blocking::ClientBuilder::new()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            changes_url,
            ctx,
        })
    }

    fn apply_headers(
        &self,
        builder: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        let builder = builder
            .header("X-Project-Id", &self.ctx.project_id)
            .header("Authorization", format!("Bearer {}", self.ctx.auth_token))
            .header("X-Device-Id", &self.ctx.device_id);
        match self.ctx.user_id() {
            Some(user_id) => builder.header("X-User-Id", user_id),
            None => builder,
        }
    }

    fn check_status(&self, status: reqwest::StatusCode, route: &str) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        let code = status.as_u16();
        Err(match code {
            401 | 403 => Error::Auth { status: code },
            500..=599 => Error::Transport(format!("HTTP {} from {}", code, route)),
            _ => Error::UnexpectedStatus {
                status: code,
                route: route.to_owned(),
            },
        })
    }
}

fn network_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Transport(format!("request timed out: {}", e))
    } else {
        Error::Transport(e.to_string())
    }
}

impl Transport for HttpTransport {
    fn send_changes(&self, change_set: &ChangeSet) -> Result<UploadAck> {
        log::debug!(
            "uploading {} change(s) to {}",
            change_set.change_count(),
            self.changes_url
        );
        let response = self
            .apply_headers(self.client.post(self.changes_url.clone()))
            .json(change_set)
            .send()
            .map_err(network_error)?;
        self.check_status(response.status(), "POST /changes")?;
        let ack: UploadAck = response.json().map_err(network_error)?;
        Ok(ack)
    }

    fn fetch_changes(&self, since: Option<Timestamp>, limit: usize) -> Result<Vec<ChangeLog>> {
        let mut url = self.changes_url.clone();
        {
            let mut query = url.query_pairs_mut();
            if let Some(since) = since {
                query.append_pair("since", &since.as_millis().to_string());
            }
            query.append_pair("limit", &limit.to_string());
        }
        log::debug!("fetching changes from {}", url);
        let response = self
            .apply_headers(self.client.get(url))
            .send()
            .map_err(network_error)?;
        self.check_status(response.status(), "GET /changes")?;
        let logs: Vec<ChangeLog> = response.json().map_err(network_error)?;
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> HttpTransport {
        let ctx = Arc::new(RequestContext::new(
            "proj-1".into(),
            "secret".into(),
            "device-1".into(),
            Some("user-1".into()),
        ));
        HttpTransport::new("https://sync.example.com/v1/", Duration::from_secs(30), ctx).unwrap()
    }

    #[test]
    fn test_url_construction() {
        let t = transport();
        assert_eq!(
            t.changes_url.as_str(),
            "https://sync.example.com/v1/changes"
        );
    }

    #[test]
    fn test_status_classification() {
        let t = transport();
        assert!(t.check_status(reqwest::StatusCode::OK, "r").is_ok());
        assert!(matches!(
            t.check_status(reqwest::StatusCode::UNAUTHORIZED, "r"),
            Err(Error::Auth { status: 401 })
        ));
        assert!(matches!(
            t.check_status(reqwest::StatusCode::FORBIDDEN, "r"),
            Err(Error::Auth { status: 403 })
        ));
        let transient = t
            .check_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "r")
            .unwrap_err();
        assert!(transient.is_transient());
        let odd = t
            .check_status(reqwest::StatusCode::IM_A_TEAPOT, "r")
            .unwrap_err();
        assert!(matches!(odd, Error::UnexpectedStatus { status: 418, .. }));
    }

    #[test]
    fn test_bad_server_url() {
        let ctx = Arc::new(RequestContext::new(
            "p".into(),
            "t".into(),
            "d".into(),
            None,
        ));
        assert!(HttpTransport::new("not a url", Duration::from_secs(1), ctx).is_err());
    }
}
