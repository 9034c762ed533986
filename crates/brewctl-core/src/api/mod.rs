//! Request/response commands for the web dashboard.
//!
//! Transport is out of scope: the HTTP layer hands a JSON body to
//! [`handle_json`] and sends back the returned string. Every response has
//! the shape `{"success": bool, "data": ..., "message": "..."}`.

mod request;

pub use request::{ApiRequest, ExportFormat};

extern crate alloc;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use embedded_hal::delay::DelayNs;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror_no_std::Error;

use crate::brewing::ScheduleSource;
use crate::controller::BrewController;
use crate::storage::KvStore;
use crate::storage::export::SessionSummary;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("malformed request: {0}")]
    Malformed(heapless::String<64>),
    #[error("unknown command: {0}")]
    UnknownCommand(heapless::String<32>),
}

/// Truncate `text` to fit a bounded string
fn bounded<const N: usize>(text: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    for c in text.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Value,
    pub message: String,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            message: String::new(),
        }
    }

    pub fn ok_with_message(data: Value, message: &str) -> Self {
        Self {
            success: true,
            data,
            message: message.into(),
        }
    }

    pub fn error(message: impl ToString) -> Self {
        Self {
            success: false,
            data: Value::Null,
            message: message.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            warn!("Failed to render API response: {}", e);
            String::from(r#"{"success":false,"data":null,"message":"internal error"}"#)
        })
    }
}

/// One row of `GetSessionHistory`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HistoryEntry<'a> {
    id: u32,
    name: &'a str,
    created: u32,
    last_modified: u32,
    brewing_state: &'static str,
    current_step: Option<u8>,
    schedule: &'a str,
}

fn to_data<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or_else(|e| {
        warn!("Failed to encode API payload: {}", e);
        Value::Null
    })
}

/// Parse, execute and render one request body.
pub fn handle_json<K, D, S>(
    controller: &mut BrewController<'_, K, D, S>,
    body: &str,
    now: u32,
) -> String
where
    K: KvStore,
    D: DelayNs,
    S: ScheduleSource,
{
    let response = match ApiRequest::from_json(body) {
        Ok(request) => dispatch(controller, request, now),
        Err(e) => {
            warn!("Rejected API request: {}", e);
            ApiResponse::error(e)
        }
    };
    response.to_json()
}

/// Execute one command against the controller.
pub fn dispatch<K, D, S>(
    controller: &mut BrewController<'_, K, D, S>,
    request: ApiRequest,
    now: u32,
) -> ApiResponse
where
    K: KvStore,
    D: DelayNs,
    S: ScheduleSource,
{
    debug!("API request: {:?}", request);

    match request {
        ApiRequest::StartBrewSession {
            session_name,
            schedule,
        } => match controller.start_brew(&schedule, &session_name, now) {
            Ok(id) => ApiResponse::ok_with_message(json!({ "sessionId": id }), "Brew session started"),
            Err(e) => ApiResponse::error(e),
        },
        ApiRequest::StopBrewSession => match controller.stop_brew(now) {
            Ok(ended) => ApiResponse::ok_with_message(
                ended
                    .as_ref()
                    .map_or(Value::Null, |s| to_data(&SessionSummary::from(s))),
                "Brew session stopped",
            ),
            Err(e) => ApiResponse::error(e),
        },
        ApiRequest::Pause => match controller.pause(now) {
            Ok(()) => ApiResponse::ok_with_message(Value::Null, "Brew paused"),
            Err(e) => ApiResponse::error(e),
        },
        ApiRequest::Start { schedule } => match controller.start_or_resume(&schedule, now) {
            Ok(id) => ApiResponse::ok(json!({ "sessionId": id })),
            Err(e) => ApiResponse::error(e),
        },
        ApiRequest::ContinueToNextStep => match controller.continue_to_next_step(now) {
            Ok(()) => ApiResponse::ok(Value::Null),
            Err(e) => ApiResponse::error(e),
        },
        ApiRequest::SkipToNextStep => match controller.skip_to_next_step(now) {
            Ok(()) => ApiResponse::ok(Value::Null),
            Err(e) => ApiResponse::error(e),
        },
        ApiRequest::ContinueBrewSession { session_id } => {
            match controller.continue_session(session_id, now) {
                Ok(()) => ApiResponse::ok_with_message(
                    json!({ "sessionId": session_id }),
                    "Session restored, paused",
                ),
                Err(e) => ApiResponse::error(e),
            }
        }
        ApiRequest::GetSessionHistory => ApiResponse::ok(session_history(controller, now)),
        ApiRequest::GetStatistics => ApiResponse::ok(statistics(controller)),
        ApiRequest::GetSessionData { session_id } => {
            let recorder = controller.recorder();
            if recorder.active_id() == Some(session_id) {
                ApiResponse::ok(to_data(&recorder.samples()))
            } else {
                ApiResponse::ok(to_data(&controller.store().session_data(session_id)))
            }
        }
        ApiRequest::ExportSession { session_id, format } => {
            let store = controller.store();
            let text = match format {
                ExportFormat::Json => store.export_session_json(session_id),
                ExportFormat::Csv => store.export_session_csv(session_id),
            };
            ApiResponse::ok(Value::String(text))
        }
        ApiRequest::GetStatus => ApiResponse::ok(to_data(&controller.status(now))),
        ApiRequest::SetMaxSessions { max_sessions } => {
            match controller.set_max_sessions(max_sessions) {
                Ok(evicted) => ApiResponse::ok(json!({
                    "maxSessions": max_sessions.max(1),
                    "evicted": evicted,
                })),
                Err(e) => ApiResponse::error(e),
            }
        }
    }
}

fn session_history<K, D, S>(controller: &mut BrewController<'_, K, D, S>, now: u32) -> Value
where
    K: KvStore,
    D: DelayNs,
    S: ScheduleSource,
{
    let active_id = controller.recorder().active_id();
    let phase = controller.machine().phase();
    let step = controller.machine().step_index() as u8;
    let sessions = controller.store_mut().session_list();

    let entries: Vec<HistoryEntry<'_>> = sessions
        .iter()
        .map(|s| {
            let live = Some(s.session_id) == active_id;
            HistoryEntry {
                id: s.session_id,
                name: &s.name,
                created: s.start_time,
                last_modified: if live { now } else { s.end_time },
                brewing_state: match (live, s.completed) {
                    (true, _) => phase.label(),
                    (false, true) => "completed",
                    (false, false) => "interrupted",
                },
                current_step: (live && phase.is_running()).then_some(step),
                schedule: &s.schedule_name,
            }
        })
        .collect();
    to_data(&entries)
}

fn statistics<K, D, S>(controller: &mut BrewController<'_, K, D, S>) -> Value
where
    K: KvStore,
    D: DelayNs,
    S: ScheduleSource,
{
    let active_id = controller.recorder().active_id();
    let data_points = controller.recorder().data_points();
    let store = controller.store_mut();
    let sessions = store.session_list();
    let summaries: Vec<SessionSummary<'_>> = sessions.iter().map(SessionSummary::from).collect();

    json!({
        "sessions": to_data(&summaries),
        "stats": to_data(&store.session_stats()),
        "config": {
            "maxSessions": store.max_sessions(),
            "currentSessionActive": active_id.is_some(),
            "currentSessionId": active_id,
            "currentDataPoints": data_points,
        },
    })
}
