//! Client for the upstream management service ("ocloud").
//!
//! Every endpoint wraps its payload in an envelope carrying a numeric
//! `returnCode`: 200 means success everywhere except the port endpoint, which
//! uses 0. Any other value is surfaced as a typed rejection together with the
//! accompanying message.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use std::time::Duration;

use crate::errors::{GatewayError, GatewayResult};
use crate::models::{SpiceRendering, VmInfo};

const RETURN_OK: i64 = 200;
const RETURN_OK_PORT: i64 = 0;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoginData {
    pub token: String,
    pub vms: Vec<VmInfo>,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmConnectionInfo {
    pub host_ip: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmPorts {
    pub vnc_port: u16,
    pub spice_port: u16,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpiceConnectionInfo {
    pub host_ip: String,
    pub spice_port: u16,
    /// Already plain text, unlike the VNC password endpoint.
    pub password: String,
}

/// The slice of the management API the gateway consumes.
#[async_trait]
pub trait ManagementApi: Send + Sync + 'static {
    async fn login(&self, username: &str, password: &str) -> GatewayResult<LoginData>;
    async fn vm_connection_info(&self, token: &str, vm_id: &str)
        -> GatewayResult<VmConnectionInfo>;
    async fn vm_port(&self, token: &str, vm_id: &str) -> GatewayResult<VmPorts>;
    /// Returns the password exactly as the upstream sent it: base64-wrapped.
    /// Each call yields a fresh password; callers must cache the decoded
    /// value rather than asking again.
    async fn vnc_password(&self, token: &str, vm_id: &str) -> GatewayResult<String>;
    async fn spice_connection_info(
        &self,
        token: &str,
        vm_id: &str,
        rendering: &SpiceRendering,
    ) -> GatewayResult<SpiceConnectionInfo>;
}

pub struct OcloudClient {
    http: reqwest::Client,
    base_url: String,
}

impl OcloudClient {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post(&self, path: &str, body: Value, ok_code: i64) -> GatewayResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;
        check_envelope(response, ok_code).await
    }

    async fn get(&self, path: &str, query: &[(&str, &str)], ok_code: i64) -> GatewayResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| GatewayError::UpstreamUnreachable(e.to_string()))?;
        check_envelope(response, ok_code).await
    }
}

async fn check_envelope(response: reqwest::Response, ok_code: i64) -> GatewayResult<Value> {
    match response.status().as_u16() {
        401 => return Err(GatewayError::Unauthenticated),
        403 => return Err(GatewayError::Forbidden),
        404 => return Err(GatewayError::VmNotFound("unknown".into())),
        status if !(200..300).contains(&status) => {
            return Err(GatewayError::UpstreamRejected {
                code: i64::from(status),
                message: format!("unexpected upstream status {status}"),
            })
        }
        _ => {}
    }

    let value: Value = response
        .json()
        .await
        .map_err(|e| GatewayError::UpstreamUnreachable(format!("invalid upstream body: {e}")))?;

    let code = value
        .get("returnCode")
        .and_then(Value::as_i64)
        .ok_or_else(|| GatewayError::Internal("upstream envelope missing returnCode".into()))?;
    if code != ok_code {
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("upstream error")
            .to_string();
        return Err(GatewayError::UpstreamRejected { code, message });
    }
    Ok(value)
}

fn decode_payload<T: DeserializeOwned>(value: Value) -> GatewayResult<T> {
    serde_json::from_value(value)
        .map_err(|e| GatewayError::Internal(format!("malformed upstream payload: {e}")))
}

#[async_trait]
impl ManagementApi for OcloudClient {
    async fn login(&self, username: &str, password: &str) -> GatewayResult<LoginData> {
        let value = self
            .post(
                "/login",
                json!({ "username": username, "password": password }),
                RETURN_OK,
            )
            .await?;
        decode_payload(value)
    }

    async fn vm_connection_info(
        &self,
        token: &str,
        vm_id: &str,
    ) -> GatewayResult<VmConnectionInfo> {
        let value = self
            .post(
                "/vm-connection-info",
                json!({ "token": token, "vmId": vm_id }),
                RETURN_OK,
            )
            .await?;
        decode_payload(value)
    }

    async fn vm_port(&self, token: &str, vm_id: &str) -> GatewayResult<VmPorts> {
        let value = self
            .get(
                "/vm-port",
                &[("token", token), ("vmId", vm_id)],
                RETURN_OK_PORT,
            )
            .await?;
        decode_payload(value)
    }

    async fn vnc_password(&self, token: &str, vm_id: &str) -> GatewayResult<String> {
        #[derive(Deserialize)]
        struct PasswordPayload {
            password: String,
        }
        let value = self
            .post(
                "/vnc-password",
                json!({ "token": token, "vmId": vm_id }),
                RETURN_OK,
            )
            .await?;
        let payload: PasswordPayload = decode_payload(value)?;
        Ok(payload.password)
    }

    async fn spice_connection_info(
        &self,
        token: &str,
        vm_id: &str,
        rendering: &SpiceRendering,
    ) -> GatewayResult<SpiceConnectionInfo> {
        let value = self
            .post(
                "/spice-connection-info",
                json!({ "token": token, "vmId": vm_id, "rendering": rendering }),
                RETURN_OK,
            )
            .await?;
        decode_payload(value)
    }
}
