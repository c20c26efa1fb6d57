//! Row encoders: pure mappings from a session and one event to the ordered
//! column values of its destination, plus the categorical checks the store
//! cannot be trusted to perform itself.
//!
//! Encoders returning `Option` yield `None` for events that are deliberately skipped.

use std::str::FromStr;

use sha2::{Digest, Sha256};

use crate::errors::ValidationError;
use crate::events::{
    ClickEvent, CustomEvent, ErrorEvent, GraphQl, InputEvent, IssueEvent, NetworkRequest,
    PageEvent, PerformanceTrackAggr, ResourceEvent, Session,
};
use crate::value::{Row, Value, datetime, nullable_string, nullable_u16, nullable_u32};

macro_rules! closed_set {
    ($(#[$meta:meta])* $name:ident, $err:expr, { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err($err(other.to_string())),
                }
            }
        }
    };
}

closed_set!(
    /// Issue categories accepted by the issues table.
    IssueType, ValidationError::UnknownIssueType, {
    ClickRage => "click_rage",
    DeadClick => "dead_click",
    ExcessiveScrolling => "excessive_scrolling",
    BadRequest => "bad_request",
    MissingResource => "missing_resource",
    Memory => "memory",
    Cpu => "cpu",
    SlowResource => "slow_resource",
    SlowPageLoad => "slow_page_load",
    Crash => "crash",
    MlCpu => "ml_cpu",
    MlMemory => "ml_memory",
    MlDeadClick => "ml_dead_click",
    MlClickRage => "ml_click_rage",
    MlMouseThrashing => "ml_mouse_thrashing",
    MlExcessiveScrolling => "ml_excessive_scrolling",
    MlSlowResources => "ml_slow_resources",
    Custom => "custom",
    JsException => "js_exception",
});

closed_set!(
    /// Origins an error event may report.
    ErrorSource, ValidationError::UnknownErrorSource, {
    JsException => "js_exception",
    Bugsnag => "bugsnag",
    Cloudwatch => "cloudwatch",
    Datadog => "datadog",
    Elasticsearch => "elasticsearch",
    Newrelic => "newrelic",
    Rollbar => "rollbar",
    Sentry => "sentry",
    Stackdriver => "stackdriver",
    Sumologic => "sumologic",
});

/// Normalised resource type, or `None` when unrecognised.
pub fn ensure_resource_type(kind: &str) -> Option<&'static str> {
    match kind.to_ascii_lowercase().as_str() {
        "other" => Some("other"),
        "script" => Some("script"),
        "stylesheet" | "css" => Some("stylesheet"),
        "fetch" | "xmlhttprequest" => Some("fetch"),
        "img" | "image" => Some("img"),
        "media" => Some("media"),
        _ => None,
    }
}

/// Upper-cased HTTP method, or `None` when unrecognised.
pub fn ensure_method(method: &str) -> Option<&'static str> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Some("GET"),
        "HEAD" => Some("HEAD"),
        "POST" => Some("POST"),
        "PUT" => Some("PUT"),
        "DELETE" => Some("DELETE"),
        "CONNECT" => Some("CONNECT"),
        "OPTIONS" => Some("OPTIONS"),
        "TRACE" => Some("TRACE"),
        "PATCH" => Some("PATCH"),
        _ => None,
    }
}

pub fn discard_url_query(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(i) => &url[..i],
        None => url,
    }
}

/// Stable hex identifier derived from a project and identifying fields.
pub fn hash_id(project_id: u32, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(project_id.to_le_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect()
}

pub fn issue_id(project_id: u32, msg: &IssueEvent) -> String {
    hash_id(
        project_id,
        &[msg.kind.as_str(), msg.context_string.as_str(), msg.payload.as_str()],
    )
}

pub fn error_id(project_id: u32, msg: &ErrorEvent) -> String {
    hash_id(
        project_id,
        &[
            msg.source.as_str(),
            msg.name.as_str(),
            msg.message.as_str(),
            msg.payload.as_str(),
        ],
    )
}

fn event_head(session: &Session, message_id: u64, timestamp: u64) -> Row {
    vec![
        Value::UInt64(session.session_id),
        Value::UInt16(session.project_id as u16),
        Value::UInt64(message_id),
        datetime(timestamp),
    ]
}

fn extend<const N: usize>(mut row: Row, tail: [Value; N]) -> Row {
    row.extend(tail);
    row
}

pub fn session_row(session: &Session) -> Result<Row, ValidationError> {
    let duration = session
        .duration
        .ok_or(ValidationError::MissingField { field: "duration" })?;
    let mut row = vec![
        Value::UInt64(session.session_id),
        Value::UInt16(session.project_id as u16),
        session.user_id.clone().into(),
        session.user_uuid.as_str().into(),
        session.user_os.as_str().into(),
        nullable_string(&session.user_os_version),
        nullable_string(&session.user_device),
        session.user_device_type.as_str().into(),
        session.user_country.as_str().into(),
        datetime(session.timestamp),
        Value::UInt32(duration as u32),
        Value::UInt16(session.pages_count as u16),
        Value::UInt16(session.events_count as u16),
        Value::UInt16(session.errors_count as u16),
        Value::UInt32(session.issue_score as u32),
        session.referrer.clone().into(),
        Value::StringArray(session.issue_types.clone()),
        session.tracker_version.as_str().into(),
        session.user_browser.as_str().into(),
        nullable_string(&session.user_browser_version),
    ];
    row.extend(session.metadata.iter().cloned().map(Value::from));
    Ok(row)
}

pub fn resource_row(session: &Session, msg: &ResourceEvent) -> Result<Row, ValidationError> {
    let kind =
        ensure_resource_type(&msg.kind).ok_or_else(|| ValidationError::UnknownResourceType {
            session_id: session.session_id,
            kind: msg.kind.clone(),
        })?;
    Ok(extend(
        event_head(session, msg.message_id, msg.timestamp),
        [
            discard_url_query(&msg.url).into(),
            kind.into(),
            nullable_u16(msg.duration),
            nullable_u16(msg.ttfb),
            nullable_u16(msg.header_size),
            nullable_u32(msg.encoded_body_size),
            nullable_u32(msg.decoded_body_size),
            msg.success.into(),
        ],
    ))
}

pub fn page_row(session: &Session, msg: &PageEvent) -> Row {
    extend(
        event_head(session, msg.message_id, msg.timestamp),
        [
            discard_url_query(&msg.url).into(),
            nullable_u16(msg.request_start),
            nullable_u16(msg.response_start),
            nullable_u16(msg.response_end),
            nullable_u16(msg.dom_content_loaded_event_start),
            nullable_u16(msg.dom_content_loaded_event_end),
            nullable_u16(msg.load_event_start),
            nullable_u16(msg.load_event_end),
            nullable_u16(msg.first_paint),
            nullable_u16(msg.first_contentful_paint),
            nullable_u16(msg.speed_index),
            nullable_u16(msg.visually_complete),
            nullable_u16(msg.time_to_interactive),
            "LOCATION".into(),
        ],
    )
}

pub fn click_row(session: &Session, msg: &ClickEvent) -> Option<Row> {
    if msg.label.is_empty() {
        return None;
    }
    Some(extend(
        event_head(session, msg.message_id, msg.timestamp),
        [
            msg.label.as_str().into(),
            nullable_u32(msg.hesitation_time),
            "CLICK".into(),
        ],
    ))
}

pub fn input_row(session: &Session, msg: &InputEvent) -> Option<Row> {
    if msg.label.is_empty() {
        return None;
    }
    Some(extend(
        event_head(session, msg.message_id, msg.timestamp),
        [msg.label.as_str().into(), "INPUT".into()],
    ))
}

pub fn error_row(session: &Session, msg: &ErrorEvent) -> Result<Row, ValidationError> {
    let source: ErrorSource = msg.source.parse()?;
    let (keys, values): (Vec<String>, Vec<Option<String>>) =
        msg.tags.iter().map(|(k, v)| (k.clone(), v.clone())).unzip();
    Ok(extend(
        event_head(session, msg.message_id, msg.timestamp),
        [
            source.as_str().into(),
            nullable_string(&msg.name),
            msg.message.as_str().into(),
            error_id(session.project_id, msg).into(),
            "ERROR".into(),
            Value::StringArray(keys),
            Value::NullableStringArray(values),
        ],
    ))
}

pub fn performance_row(session: &Session, msg: &PerformanceTrackAggr) -> Row {
    let timestamp = msg.timestamp_start / 2
        + msg.timestamp_end / 2
        + (msg.timestamp_start % 2 + msg.timestamp_end % 2) / 2;
    // Aggregates carry no message id of their own.
    extend(
        event_head(session, 0, timestamp),
        [
            nullable_string(&msg.url),
            Value::UInt8(msg.min_fps as u8),
            Value::UInt8(msg.avg_fps as u8),
            Value::UInt8(msg.max_fps as u8),
            Value::UInt8(msg.min_cpu as u8),
            Value::UInt8(msg.avg_cpu as u8),
            Value::UInt8(msg.max_cpu as u8),
            Value::UInt64(msg.min_total_js_heap_size),
            Value::UInt64(msg.avg_total_js_heap_size),
            Value::UInt64(msg.max_total_js_heap_size),
            Value::UInt64(msg.min_used_js_heap_size),
            Value::UInt64(msg.avg_used_js_heap_size),
            Value::UInt64(msg.max_used_js_heap_size),
            "PERFORMANCE".into(),
        ],
    )
}

pub fn autocomplete_row(session: &Session, kind: &str, value: &str) -> Option<Row> {
    if value.is_empty() {
        return None;
    }
    Some(vec![
        Value::UInt16(session.project_id as u16),
        kind.into(),
        value.into(),
    ])
}

pub fn request_row(
    session: &Session,
    msg: &NetworkRequest,
    save_payload: bool,
) -> Result<Row, ValidationError> {
    let method = ensure_method(&msg.method).ok_or_else(|| ValidationError::UnknownMethod {
        session_id: session.session_id,
        method: msg.method.clone(),
    })?;
    let (request, response) = if save_payload {
        (
            Value::String(msg.request.clone()),
            Value::String(msg.response.clone()),
        )
    } else {
        (Value::Null, Value::Null)
    };
    Ok(extend(
        event_head(session, msg.index, msg.timestamp),
        [
            msg.url.as_str().into(),
            request,
            response,
            Value::UInt16(msg.status as u16),
            method.into(),
            Value::UInt16(msg.duration as u16),
            Value::Bool(msg.status < 400),
            "REQUEST".into(),
        ],
    ))
}

pub fn custom_row(session: &Session, msg: &CustomEvent) -> Row {
    extend(
        event_head(session, msg.index, msg.timestamp),
        [
            msg.name.as_str().into(),
            msg.payload.as_str().into(),
            "CUSTOM".into(),
        ],
    )
}

pub fn graphql_row(session: &Session, msg: &GraphQl) -> Row {
    extend(
        event_head(session, msg.index, msg.timestamp),
        [
            msg.operation_name.as_str().into(),
            nullable_string(&msg.variables),
            nullable_string(&msg.response),
            "GRAPHQL".into(),
        ],
    )
}

/// An issue lands in two destinations sharing one hashed id.
pub struct IssueRows {
    pub event: Row,
    pub issue: Row,
}

pub fn issue_rows(session: &Session, msg: &IssueEvent) -> Result<IssueRows, ValidationError> {
    let kind: IssueType = msg.kind.parse()?;
    let id = issue_id(session.project_id, msg);
    let event = extend(
        event_head(session, msg.message_id, msg.timestamp),
        [
            id.as_str().into(),
            kind.as_str().into(),
            "ISSUE".into(),
            msg.url.as_str().into(),
        ],
    );
    let issue = vec![
        Value::UInt16(session.project_id as u16),
        id.into(),
        kind.as_str().into(),
        msg.context_string.as_str().into(),
    ];
    Ok(IssueRows { event, issue })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            session_id: 42,
            project_id: 7,
            timestamp: 1_700_000_000_000,
            duration: Some(1200),
            ..Default::default()
        }
    }

    #[test]
    fn test_issue_type_enumeration() {
        assert_eq!("dead_click".parse::<IssueType>(), Ok(IssueType::DeadClick));
        assert_eq!(
            "rage_quit".parse::<IssueType>(),
            Err(ValidationError::UnknownIssueType("rage_quit".to_string()))
        );
    }

    #[test]
    fn test_issue_rows_share_id() {
        let msg = IssueEvent {
            kind: "click_rage".to_string(),
            context_string: "#buy".to_string(),
            url: "/cart".to_string(),
            ..Default::default()
        };
        let rows = issue_rows(&session(), &msg).unwrap();
        assert_eq!(rows.event[4], rows.issue[1]);
        assert_eq!(rows.event[6], Value::from("ISSUE"));
    }

    #[test]
    fn test_session_requires_duration() {
        let mut s = session();
        assert_eq!(session_row(&s).unwrap().len(), 30);
        s.duration = None;
        assert_eq!(
            session_row(&s).unwrap_err(),
            ValidationError::MissingField { field: "duration" }
        );
    }

    #[test]
    fn test_empty_labels_are_skipped() {
        let click = ClickEvent::default();
        assert!(click_row(&session(), &click).is_none());
        let input = InputEvent {
            label: "email".to_string(),
            ..Default::default()
        };
        assert_eq!(input_row(&session(), &input).unwrap().len(), 6);
        assert!(autocomplete_row(&session(), "INPUT", "").is_none());
    }

    #[test]
    fn test_resource_row_normalises_type_and_url() {
        let msg = ResourceEvent {
            url: "https://cdn.example.com/app.js?v=3#x".to_string(),
            kind: "script".to_string(),
            duration: 12,
            ..Default::default()
        };
        let row = resource_row(&session(), &msg).unwrap();
        assert_eq!(row[4], Value::from("https://cdn.example.com/app.js"));
        assert_eq!(row[6], Value::UInt16(12));
        assert_eq!(row[7], Value::Null);

        let bad = ResourceEvent {
            kind: "font".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            resource_row(&session(), &bad),
            Err(ValidationError::UnknownResourceType { .. })
        ));
    }

    #[test]
    fn test_request_payloads_follow_flag() {
        let msg = NetworkRequest {
            method: "post".to_string(),
            status: 404,
            request: "{}".to_string(),
            ..Default::default()
        };
        let row = request_row(&session(), &msg, false).unwrap();
        assert_eq!(row[5], Value::Null);
        assert_eq!(row[8], Value::from("POST"));
        assert_eq!(row[10], Value::Bool(false));

        let row = request_row(&session(), &msg, true).unwrap();
        assert_eq!(row[5], Value::from("{}"));

        let bad = NetworkRequest {
            method: "BREW".to_string(),
            ..Default::default()
        };
        assert!(request_row(&session(), &bad, false).is_err());
    }

    #[test]
    fn test_error_row_splits_tags() {
        let mut msg = ErrorEvent {
            source: "sentry".to_string(),
            message: "boom".to_string(),
            ..Default::default()
        };
        msg.tags.insert("env".to_string(), Some("prod".to_string()));
        msg.tags.insert("release".to_string(), None);
        let row = error_row(&session(), &msg).unwrap();
        assert_eq!(
            row[9],
            Value::StringArray(vec!["env".to_string(), "release".to_string()])
        );
        assert_eq!(
            row[10],
            Value::NullableStringArray(vec![Some("prod".to_string()), None])
        );

        msg.source = "pagerduty".to_string();
        assert!(error_row(&session(), &msg).is_err());
    }

    #[test]
    fn test_performance_uses_midpoint() {
        let msg = PerformanceTrackAggr {
            timestamp_start: 1_000,
            timestamp_end: 3_001,
            ..Default::default()
        };
        let row = performance_row(&session(), &msg);
        assert_eq!(row[2], Value::UInt64(0));
        assert_eq!(row[3], datetime(2_000));
        assert_eq!(row[4], Value::Null);
    }

    #[test]
    fn test_hash_id_is_stable() {
        assert_eq!(hash_id(1, &["a", "b"]), hash_id(1, &["a", "b"]));
        assert_ne!(hash_id(1, &["ab", ""]), hash_id(1, &["a", "b"]));
        assert_ne!(hash_id(1, &["a"]), hash_id(2, &["a"]));
        assert_eq!(hash_id(1, &["a"]).len(), 32);
    }
}
