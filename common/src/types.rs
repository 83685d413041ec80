use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MuxStatusPayload {
    pub state: &'static str,
    pub label: &'static str,
    pub enable: bool,
    pub select1: bool,
    pub select2: bool,
    #[serde(rename = "lastCommand")]
    pub last_command: String,
    #[serde(rename = "commandAgeMs")]
    pub command_age_ms: Option<u64>,
    pub mode: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
