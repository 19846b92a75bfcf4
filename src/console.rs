//! C10: thin HTTP client for the Console oracle (§6) used by C1 and C7.
//!
//! Grounded in the teacher's `reqwest`-based reverse proxy client: one
//! `reqwest::Client`, one method per remote contract, headers attached by hand.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app_key::AppKey;
use crate::device::SessionId;

const SESSION_HEADER: &str = "X-Session-Id";

#[derive(Debug, Error)]
pub enum ConsoleError {
    #[error("transport error talking to console: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("console returned an error: {0}")]
    Remote(String),
    #[error("console response was malformed: {0}")]
    Malformed(&'static str),
    #[error("no manifest published for {0}")]
    ManifestNotFound(AppKey),
}

pub struct ActivationOutcome {
    pub session: SessionId,
    pub license_key: Option<String>,
}

pub struct ConsoleClient {
    base_url: String,
    http: reqwest::Client,
}

impl ConsoleClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    fn session_header_value(session: SessionId) -> String {
        format!("{}:{}", session.id, session.timestamp)
    }

    fn parse_session_header(raw: &str) -> Option<SessionId> {
        let (id, timestamp) = raw.split_once(':')?;
        Some(SessionId {
            id: id.parse().ok()?,
            timestamp: timestamp.parse().ok()?,
        })
    }

    fn fresh_session(response: &reqwest::Response) -> Option<SessionId> {
        response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::parse_session_header)
    }

    pub async fn activate_license(
        &self,
        session: SessionId,
        license_key: Option<String>,
    ) -> Result<ActivationOutcome, ConsoleError> {
        #[derive(Serialize)]
        struct Body {
            #[serde(skip_serializing_if = "Option::is_none", rename = "licenseKey")]
            license_key: Option<String>,
        }
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "sessionId")]
            session_id: String,
        }
        #[derive(Deserialize)]
        struct Envelope {
            data: Data,
        }

        let response = self
            .http
            .post(format!("{}/api/v2/device/license/activate", self.base_url))
            .header(SESSION_HEADER, Self::session_header_value(session))
            .json(&Body { license_key: license_key.clone() })
            .send()
            .await?;

        let fresh = Self::fresh_session(&response);

        match response.status() {
            StatusCode::OK => {
                let envelope: Envelope = response.json().await?;
                let session_id = envelope
                    .data
                    .session_id
                    .parse()
                    .map_err(|_| ConsoleError::Malformed("sessionId was not a uuid"))?;
                Ok(ActivationOutcome {
                    session: fresh.unwrap_or(SessionId {
                        id: session_id,
                        timestamp: session.timestamp,
                    }),
                    license_key,
                })
            }
            StatusCode::NO_CONTENT => Ok(ActivationOutcome {
                session: fresh.unwrap_or(session),
                license_key,
            }),
            other => {
                let reason = extract_reason(response).await;
                Err(ConsoleError::Remote(format!("{other}: {reason}")))
            }
        }
    }

    pub async fn validate_license(
        &self,
        session: SessionId,
    ) -> Result<(bool, Option<SessionId>), ConsoleError> {
        #[derive(Deserialize)]
        struct Body {
            #[serde(rename = "isValid")]
            is_valid: bool,
        }

        let response = self
            .http
            .post(format!("{}/api/v2/device/license/validate", self.base_url))
            .header(SESSION_HEADER, Self::session_header_value(session))
            .send()
            .await?;

        let fresh = Self::fresh_session(&response);
        if !response.status().is_success() {
            let reason = extract_reason(response).await;
            return Err(ConsoleError::Remote(reason));
        }

        let body: Body = response.json().await?;
        Ok((body.is_valid, fresh))
    }

    pub async fn fetch_manifest(
        &self,
        session: SessionId,
        key: &AppKey,
    ) -> Result<String, ConsoleError> {
        let response = self
            .http
            .get(format!(
                "{}/api/v2/manifests/{}/{}",
                self.base_url, key.name, key.version
            ))
            .header(SESSION_HEADER, Self::session_header_value(session))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(ConsoleError::ManifestNotFound(key.clone()));
        }
        if !response.status().is_success() {
            let reason = extract_reason(response).await;
            return Err(ConsoleError::Remote(reason));
        }

        Ok(response.text().await?)
    }

    /// Returns `None` on a `204` ("no token required for this app").
    pub async fn fetch_token(
        &self,
        session: SessionId,
        key: &AppKey,
    ) -> Result<Option<String>, ConsoleError> {
        #[derive(Serialize)]
        struct Request<'a> {
            app: &'a str,
            version: &'a str,
        }
        #[derive(Deserialize)]
        struct Response {
            token: String,
        }

        let response = self
            .http
            .post(format!("{}/api/v2/tokens", self.base_url))
            .header(SESSION_HEADER, Self::session_header_value(session))
            .json(&Request {
                app: key.name.as_str(),
                version: &key.version,
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => Ok(Some(response.json::<Response>().await?.token)),
            other => {
                let reason = extract_reason(response).await;
                Err(ConsoleError::Remote(format!("{other}: {reason}")))
            }
        }
    }
}

async fn extract_reason(response: reqwest::Response) -> String {
    #[derive(Deserialize)]
    struct Reason {
        reason: String,
    }

    let status = response.status();
    match response.json::<Reason>().await {
        Ok(r) => r.reason,
        Err(_) => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_header_round_trips() {
        let session = SessionId {
            id: uuid::Uuid::new_v4(),
            timestamp: 12345,
        };
        let header = ConsoleClient::session_header_value(session);
        let parsed = ConsoleClient::parse_session_header(&header).unwrap();
        assert_eq!(parsed, session);
    }
}
