extern crate alloc;
use alloc::string::String;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::{ApiError, bounded};

/// Download format for `ExportSession`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    Csv,
}

/// A dashboard command.
///
/// On the wire: `{"command": "<Name>", "data": {...}}`. `data` may be omitted
/// for commands without parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiRequest {
    StartBrewSession {
        session_name: String,
        schedule: String,
    },
    StopBrewSession,
    Pause,
    /// Resumes a paused brew, otherwise starts `schedule`
    Start {
        schedule: String,
    },
    ContinueToNextStep,
    SkipToNextStep,
    ContinueBrewSession {
        session_id: u32,
    },
    GetSessionHistory,
    GetStatistics,
    GetSessionData {
        session_id: u32,
    },
    ExportSession {
        session_id: u32,
        format: ExportFormat,
    },
    GetStatus,
    SetMaxSessions {
        max_sessions: u8,
    },
}

#[derive(Deserialize)]
struct Envelope {
    command: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPayload {
    #[serde(default)]
    session_name: String,
    #[serde(default)]
    selected_mash_schedule: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    session_id: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExportPayload {
    session_id: u32,
    #[serde(default)]
    format: ExportFormat,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MaxSessionsPayload {
    max_sessions: u8,
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, ApiError> {
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };
    serde_json::from_value(data).map_err(|e| ApiError::Malformed(bounded(&alloc::format!("{}", e))))
}

impl ApiRequest {
    pub fn from_json(body: &str) -> Result<Self, ApiError> {
        let envelope: Envelope = serde_json::from_str(body)
            .map_err(|e| ApiError::Malformed(bounded(&alloc::format!("{}", e))))?;

        let request = match envelope.command.as_str() {
            "StartBrewSession" => {
                let p: StartPayload = payload(envelope.data)?;
                Self::StartBrewSession {
                    session_name: p.session_name,
                    schedule: p.selected_mash_schedule,
                }
            }
            "StopBrewSession" => Self::StopBrewSession,
            "Pause" => Self::Pause,
            "Start" => {
                let p: StartPayload = payload(envelope.data)?;
                Self::Start {
                    schedule: p.selected_mash_schedule,
                }
            }
            "ContinueToNextStep" => Self::ContinueToNextStep,
            "SkipToNextStep" => Self::SkipToNextStep,
            "ContinueBrewSession" => {
                let p: SessionPayload = payload(envelope.data)?;
                Self::ContinueBrewSession {
                    session_id: p.session_id,
                }
            }
            "GetSessionHistory" => Self::GetSessionHistory,
            "GetStatistics" => Self::GetStatistics,
            "GetSessionData" => {
                let p: SessionPayload = payload(envelope.data)?;
                Self::GetSessionData {
                    session_id: p.session_id,
                }
            }
            "ExportSession" => {
                let p: ExportPayload = payload(envelope.data)?;
                Self::ExportSession {
                    session_id: p.session_id,
                    format: p.format,
                }
            }
            "GetStatus" => Self::GetStatus,
            "SetMaxSessions" => {
                let p: MaxSessionsPayload = payload(envelope.data)?;
                Self::SetMaxSessions {
                    max_sessions: p.max_sessions,
                }
            }
            other => return Err(ApiError::UnknownCommand(bounded(other))),
        };
        Ok(request)
    }
}
