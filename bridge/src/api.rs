use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use tracing::{debug, warn};

use humidifier_common::{config::ApiConfig, CommandError, CommandSender, DeviceCommand};

const STATUS_SUCCESS: i64 = 100;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "statusCode")]
    status_code: i64,
    body: Option<T>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Device {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "deviceName")]
    pub device_name: String,
    #[serde(rename = "remoteType", default)]
    pub remote_type: Option<String>,
    #[serde(rename = "hubDeviceId", default)]
    pub hub_device_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DeviceList {
    #[serde(rename = "deviceList", default)]
    device_list: Vec<Device>,
    #[serde(rename = "infraredRemoteList", default)]
    infrared_remote_list: Vec<Device>,
}

enum Backend {
    Http {
        http: reqwest::Client,
        base_url: String,
        token: String,
    },
    Disabled,
}

pub struct SwitchBotClient {
    backend: Backend,
}

impl SwitchBotClient {
    pub fn new(config: &ApiConfig) -> anyhow::Result<Self> {
        if config.token.trim().is_empty() {
            warn!("no SwitchBot token configured, device commands will be dropped");
            return Ok(Self::disabled());
        }

        let mut builder = reqwest::Client::builder();
        if let Some(timeout_ms) = config.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(timeout_ms));
        }
        let http = builder
            .build()
            .context("failed to build SwitchBot HTTP client")?;

        Ok(Self {
            backend: Backend::Http {
                http,
                base_url: config.base_url.clone(),
                token: config.token.clone(),
            },
        })
    }

    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
        }
    }

    pub async fn list_infrared_remotes(&self) -> anyhow::Result<Vec<Device>> {
        let Backend::Http {
            http,
            base_url,
            token,
        } = &self.backend
        else {
            return Ok(Vec::new());
        };

        let response = http
            .get(format!("{base_url}/devices"))
            .header(AUTHORIZATION, token.as_str())
            .send()
            .await
            .context("device list request failed")?
            .error_for_status()
            .context("device list request rejected")?
            .json::<ApiResponse<DeviceList>>()
            .await
            .context("invalid device list response")?;

        if response.status_code != STATUS_SUCCESS {
            bail!(
                "device list rejected with status {}: {}",
                response.status_code,
                response.message
            );
        }

        let devices = response.body.unwrap_or_default();
        debug!(
            "listed {} devices and {} infrared remotes",
            devices.device_list.len(),
            devices.infrared_remote_list.len()
        );
        Ok(devices.infrared_remote_list)
    }
}

#[async_trait]
impl CommandSender for SwitchBotClient {
    async fn send_command(
        &self,
        device_id: &str,
        command: &DeviceCommand,
    ) -> Result<(), CommandError> {
        let Backend::Http {
            http,
            base_url,
            token,
        } = &self.backend
        else {
            warn!(
                "SwitchBot API disabled, dropping command {} for {device_id}",
                command.command
            );
            return Ok(());
        };

        debug!("sending command {} to {device_id}", command.command);

        let envelope = http
            .post(format!("{base_url}/devices/{device_id}/commands"))
            .header(AUTHORIZATION, token.as_str())
            .json(command)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(transport_error)?
            .json::<ApiResponse<serde_json::Value>>()
            .await
            .map_err(transport_error)?;

        check_status(envelope.status_code, envelope.message)
    }
}

fn transport_error(err: reqwest::Error) -> CommandError {
    CommandError::Transport(err.to_string())
}

fn check_status(status_code: i64, message: String) -> Result<(), CommandError> {
    if status_code == STATUS_SUCCESS {
        Ok(())
    } else {
        Err(CommandError::Rejected {
            status: status_code,
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICE_LIST: &str = r#"{"statusCode":100,"body":{"deviceList":[{"deviceId":"483FDA0AFD5D","deviceName":"Plug 1","deviceType":"Plug","enableCloudService":true,"hubDeviceId":"000000000000"}],"infraredRemoteList":[{"deviceId":"02-202102111506-97603093","deviceName":"加湿器","remoteType":"Others","hubDeviceId":"F3709208082A"}]},"message":"success"}"#;

    #[test]
    fn parses_device_list_envelope() {
        let response: ApiResponse<DeviceList> = serde_json::from_str(DEVICE_LIST).unwrap();
        assert_eq!(response.status_code, STATUS_SUCCESS);

        let devices = response.body.unwrap();
        assert_eq!(devices.device_list.len(), 1);
        assert_eq!(
            devices.infrared_remote_list,
            vec![Device {
                device_id: "02-202102111506-97603093".to_string(),
                device_name: "加湿器".to_string(),
                remote_type: Some("Others".to_string()),
                hub_device_id: Some("F3709208082A".to_string()),
            }]
        );
    }

    #[test]
    fn non_success_status_is_a_rejection() {
        assert!(check_status(100, "success".to_string()).is_ok());

        let err = check_status(161, "device offline".to_string()).unwrap_err();
        assert!(matches!(err, CommandError::Rejected { status: 161, .. }));
        assert_eq!(
            err.to_string(),
            "command rejected with status 161: device offline"
        );
    }

    #[test]
    fn command_body_matches_api_shape() {
        let body = serde_json::to_string(&DeviceCommand::customize("湿度")).unwrap();
        assert_eq!(
            body,
            r#"{"command":"湿度","parameter":"default","commandType":"customize"}"#
        );
    }

    #[tokio::test]
    async fn disabled_client_drops_commands() {
        let client = SwitchBotClient::disabled();
        let result = client
            .send_command("device", &DeviceCommand::customize("power"))
            .await;

        assert!(result.is_ok());
        assert!(client.list_infrared_remotes().await.unwrap().is_empty());
    }
}
