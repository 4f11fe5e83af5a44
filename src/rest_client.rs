//! Stateless REST helper.
//!
//! Independent of the realtime session: plain GET and form-encoded POST
//! against the exchange's HTTP API, with signed parameters merged into
//! authenticated POSTs. Responses must be `200` with a JSON content type;
//! the legacy `text/json` label is accepted alongside `application/json`.

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::signing::RestSigner;
use serde_json::Value;
use tracing::debug;

pub struct RestClient {
    base_uri: String,
    signer: Option<RestSigner>,
    http: reqwest::Client,
}

impl RestClient {
    pub fn new(cfg: &ClientConfig) -> Result<Self, ClientError> {
        let base_uri = cfg
            .rest_uri
            .clone()
            .ok_or_else(|| ClientError::Config("rest.uri is not configured".to_owned()))?;

        let signer = if cfg.authorize {
            let auth = cfg
                .auth
                .as_ref()
                .ok_or_else(|| ClientError::Config("auth credentials are not configured".to_owned()))?;
            let user_id = auth
                .user_id
                .clone()
                .ok_or_else(|| ClientError::Config("auth.user_id is required for REST signing".to_owned()))?;
            Some(RestSigner::new(user_id, auth.key.clone(), auth.secret.clone()))
        } else {
            None
        };

        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(RestClient { base_uri, signer, http })
    }

    pub async fn get(&self, resource: &str) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.base_uri, resource);
        debug!(%url, "rest get");
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Connectivity(e.to_string()))?;
        Self::decode(&url, response).await
    }

    /// POST `params` form-encoded; signed parameters are merged in when
    /// auth is configured.
    pub async fn post(&self, resource: &str, params: Value) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.base_uri, resource);
        debug!(%url, "rest post");

        let mut params = match params {
            Value::Object(map) => map,
            Value::Null => serde_json::Map::new(),
            other => {
                return Err(ClientError::InvalidMessage(format!(
                    "POST params must be an object: {other}"
                )));
            }
        };
        if let Some(signer) = &self.signer {
            if let Value::Object(signed) = signer.params() {
                params.extend(signed);
            }
        }

        let response = self
            .http
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ClientError::Connectivity(e.to_string()))?;
        Self::decode(&url, response).await
    }

    async fn decode(url: &str, response: reqwest::Response) -> Result<Value, ClientError> {
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        validate(url, status, content_type.as_deref())?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(format!("decoding body of {url}: {e}")))?;
        debug!(%body, "rest response");
        Ok(body)
    }
}

fn validate(url: &str, status: u16, content_type: Option<&str>) -> Result<(), ClientError> {
    if status != 200 {
        return Err(ClientError::InvalidResponse(format!(
            "error response code {status} at: {url}"
        )));
    }
    match content_type {
        Some(ct) if ct.starts_with("application/json") || ct.starts_with("text/json") => Ok(()),
        other => Err(ClientError::InvalidResponse(format!(
            "invalid response content-type {other:?} of: {url}"
        ))),
    }
}
