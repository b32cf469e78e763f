use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Customize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceCommand {
    pub command: String,
    pub parameter: String,
    #[serde(rename = "commandType")]
    pub command_type: CommandType,
}

impl DeviceCommand {
    pub fn customize(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            parameter: "default".to_string(),
            command_type: CommandType::Customize,
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("command rejected with status {status}: {message}")]
    Rejected { status: i64, message: String },
}

#[async_trait]
pub trait CommandSender: Send + Sync {
    async fn send_command(&self, device_id: &str, command: &DeviceCommand)
        -> Result<(), CommandError>;
}
