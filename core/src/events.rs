//! Tracker payloads handed to the connector. The engine only reads them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-session metadata shared by every event of a session.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Session {
    pub session_id: u64,
    pub project_id: u32,
    pub user_id: Option<String>,
    pub user_uuid: String,
    pub user_os: String,
    pub user_os_version: String,
    pub user_device: String,
    pub user_device_type: String,
    pub user_country: String,
    pub user_browser: String,
    pub user_browser_version: String,
    pub tracker_version: String,
    pub referrer: Option<String>,
    /// Session start, epoch milliseconds.
    pub timestamp: u64,
    pub duration: Option<u64>,
    pub pages_count: u32,
    pub events_count: u32,
    pub errors_count: u32,
    pub issue_score: u64,
    pub issue_types: Vec<String>,
    pub metadata: [Option<String>; 10],
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub method: String,
    pub duration: u64,
    pub ttfb: u64,
    pub header_size: u64,
    pub encoded_body_size: u64,
    pub decoded_body_size: u64,
    pub success: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PageEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub url: String,
    pub request_start: u64,
    pub response_start: u64,
    pub response_end: u64,
    pub dom_content_loaded_event_start: u64,
    pub dom_content_loaded_event_end: u64,
    pub load_event_start: u64,
    pub load_event_end: u64,
    pub first_paint: u64,
    pub first_contentful_paint: u64,
    pub speed_index: u64,
    pub visually_complete: u64,
    pub time_to_interactive: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ClickEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub label: String,
    pub hesitation_time: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct InputEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub label: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorEvent {
    pub message_id: u64,
    pub timestamp: u64,
    pub source: String,
    pub name: String,
    pub message: String,
    pub payload: String,
    pub tags: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PerformanceTrackAggr {
    pub timestamp_start: u64,
    pub timestamp_end: u64,
    pub url: String,
    pub min_fps: u64,
    pub avg_fps: u64,
    pub max_fps: u64,
    pub min_cpu: u64,
    pub avg_cpu: u64,
    pub max_cpu: u64,
    pub min_total_js_heap_size: u64,
    pub avg_total_js_heap_size: u64,
    pub max_total_js_heap_size: u64,
    pub min_used_js_heap_size: u64,
    pub avg_used_js_heap_size: u64,
    pub max_used_js_heap_size: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkRequest {
    pub index: u64,
    pub timestamp: u64,
    pub url: String,
    pub method: String,
    pub request: String,
    pub response: String,
    pub status: u64,
    pub duration: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CustomEvent {
    pub index: u64,
    pub timestamp: u64,
    pub name: String,
    pub payload: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GraphQl {
    pub index: u64,
    pub timestamp: u64,
    pub operation_name: String,
    pub variables: String,
    pub response: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IssueEvent {
    pub message_id: u64,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub context_string: String,
    pub payload: String,
    pub url: String,
}

/// One event of any category, as carried on the wire.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum Event {
    Session,
    Resource(ResourceEvent),
    Page(PageEvent),
    Click(ClickEvent),
    Input(InputEvent),
    Error(ErrorEvent),
    Performance(PerformanceTrackAggr),
    Request(NetworkRequest),
    Custom(CustomEvent),
    #[serde(rename = "graphql")]
    GraphQl(GraphQl),
    Issue(IssueEvent),
    Autocomplete {
        #[serde(rename = "type")]
        kind: String,
        value: String,
    },
}

/// Envelope consumed from the event source.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestMessage {
    pub session: Session,
    pub event: Event,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_click_envelope() {
        let raw = r#"{
            "session": {"session_id": 7, "project_id": 3, "timestamp": 1000},
            "event": {"kind": "click", "payload": {"message_id": 12, "timestamp": 1500, "label": "Buy"}}
        }"#;
        let msg: IngestMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.session.session_id, 7);
        match msg.event {
            Event::Click(click) => {
                assert_eq!(click.label, "Buy");
                assert_eq!(click.hesitation_time, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_session_and_autocomplete() {
        let raw = r#"{"session": {"session_id": 1, "duration": 50}, "event": {"kind": "session"}}"#;
        let msg: IngestMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg.event, Event::Session));
        assert_eq!(msg.session.duration, Some(50));

        let raw = r#"{"session": {}, "event": {"kind": "autocomplete", "payload": {"type": "CLICK", "value": "Buy"}}}"#;
        let msg: IngestMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg.event, Event::Autocomplete { ref kind, .. } if kind == "CLICK"));
    }
}
