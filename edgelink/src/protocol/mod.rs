//! Cloud protocol codec.
//!
//! Outbound traffic is a JSON object with a single field, the monotonically
//! increasing message id, whose value carries a `command` and its `params`.
//! Inbound traffic arrives on two topics: `notify/mailbox_activity` tells the
//! agent that its mailbox has pending entries and `reply` carries the mailbox
//! content as action invocations.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde_json::{json, Map, Value};

use crate::actions::ActionRequest;
use crate::status::{AgentError, ErrorKind, Result};
use crate::value::{Location, TypedValue};

/// Topic the agent publishes commands to.
pub const API_TOPIC: &str = "api";
/// Subscription filter for mailbox replies.
pub const REPLY_TOPIC_FILTER: &str = "reply/#";
/// Topic carrying mailbox activity notifications.
pub const MAILBOX_NOTIFY_TOPIC: &str = "notify/mailbox_activity";

/// Source tag attached to every decoded action request.
pub const REQUEST_SOURCE: &str = "tr50";

/// Maximum length of the composed thing key, including the terminator the
/// protocol reserves.
const THING_KEY_MAX: usize = 73;

/// Maximum length of a cloud-assigned request id.
const REQUEST_ID_MAX: usize = 36;

/// Composes the cloud identifier of this device instance. Recomputed on
/// every reconnect.
pub fn compose_thing_key(device_id: &str, session_id: &str) -> String {
    let mut key = format!("{device_id}-{session_id}");
    truncate_utf8(&mut key, THING_KEY_MAX - 1);
    key
}

fn truncate_utf8(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Formats a timestamp the way the cloud expects it: RFC3339 UTC with a
/// millisecond fraction only when it is non-zero, and a trailing `Z`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    if ts.timestamp_subsec_millis() == 0 {
        ts.to_rfc3339_opts(SecondsFormat::Secs, true)
    } else {
        ts.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Parses a timestamp produced by [`format_timestamp`] or by the cloud.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AgentError::new(ErrorKind::ParseError, format!("timestamp {s:?}: {e}")))
}

/// Inbound traffic after decoding.
#[derive(Debug)]
pub enum Inbound {
    /// Our mailbox has pending entries; a `mailbox.check` should follow.
    MailboxActivity,
    /// Action invocations pulled from the mailbox.
    Requests(Vec<ActionRequest>),
    /// Message for another thing or on an unknown topic.
    Ignored,
}

/// Stateful encoder/decoder bound to one session.
pub struct Codec {
    thing_key: String,
    next_msg_id: u64,
}

impl Codec {
    pub fn new(device_id: &str, session_id: &str) -> Codec {
        Codec {
            thing_key: compose_thing_key(device_id, session_id),
            next_msg_id: 1,
        }
    }

    pub fn thing_key(&self) -> &str {
        &self.thing_key
    }

    /// Recomposes the thing key, e.g. after a reconnect.
    pub fn rebind(&mut self, device_id: &str, session_id: &str) {
        self.thing_key = compose_thing_key(device_id, session_id);
    }

    fn envelope(&mut self, command: &str, params: Value) -> Vec<u8> {
        let id = self.next_msg_id.to_string();
        self.next_msg_id += 1;

        let mut body = Map::new();
        body.insert("command".into(), Value::from(command));
        body.insert("params".into(), params);
        let mut root = Map::new();
        root.insert(id, Value::Object(body));
        Value::Object(root).to_string().into_bytes()
    }

    /// Encodes one telemetry, attribute or location publication. The command
    /// is selected purely by the type of the value.
    pub fn encode_publish(
        &mut self,
        key: &str,
        value: &TypedValue,
        ts: Option<DateTime<Utc>>,
    ) -> Vec<u8> {
        let command = match value {
            TypedValue::Location(_) => "location.publish",
            TypedValue::String(_) | TypedValue::Raw(_) => "attribute.publish",
            _ => "property.publish",
        };

        let mut params = Map::new();
        params.insert("thingKey".into(), Value::from(self.thing_key.clone()));
        params.insert("key".into(), Value::from(key));
        match value {
            TypedValue::Location(location) => append_location(&mut params, location),
            other => {
                params.insert("value".into(), encode_value(other));
            }
        }
        if let Some(ts) = ts {
            params.insert("ts".into(), Value::from(format_timestamp(ts)));
        }

        self.envelope(command, Value::Object(params))
    }

    /// Encodes the poll asking the cloud for pending invocations.
    pub fn encode_mailbox_check(&mut self) -> Vec<u8> {
        self.envelope("mailbox.check", json!({ "autoComplete": false }))
    }

    /// Encodes the acknowledgement of a completed action request.
    pub fn encode_mailbox_ack(
        &mut self,
        request: &ActionRequest,
        result: &Result<()>,
    ) -> Vec<u8> {
        let mut params = Map::new();
        params.insert("id".into(), Value::from(request.request_id.clone()));
        match result {
            Ok(()) => {
                params.insert("errorCode".into(), Value::from(0));
            }
            Err(e) => {
                params.insert("errorCode".into(), Value::from(e.kind().code()));
                if let Some(message) = e.message() {
                    params.insert("errorMessage".into(), Value::from(message));
                }
            }
        }
        if !request.out_params.is_empty() {
            let mut out = Map::new();
            for (name, value) in &request.out_params {
                out.insert(name.clone(), encode_value(value));
            }
            params.insert("params".into(), Value::Object(out));
        }

        self.envelope("mailbox.ack", Value::Object(params))
    }

    /// Decodes one inbound publication.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<Inbound> {
        let root: Value = serde_json::from_slice(payload)?;

        if topic == MAILBOX_NOTIFY_TOPIC {
            let matches = root
                .get("thingKey")
                .and_then(Value::as_str)
                .map(|key| key == self.thing_key)
                .unwrap_or(false);
            if matches {
                return Ok(Inbound::MailboxActivity);
            }
            return Ok(Inbound::Ignored);
        }

        if topic == "reply" || topic.starts_with("reply/") {
            let messages = root
                .get("cmd")
                .and_then(|cmd| cmd.get("params"))
                .and_then(|params| params.get("messages"))
                .and_then(Value::as_array);
            let Some(messages) = messages else {
                return Ok(Inbound::Ignored);
            };

            let mut requests = Vec::new();
            for message in messages {
                match decode_request(message) {
                    Some(request) => requests.push(request),
                    None => log::debug!("skipping malformed mailbox entry"),
                }
            }
            return Ok(Inbound::Requests(requests));
        }

        log::debug!("message received on unknown topic {topic:?}");
        Ok(Inbound::Ignored)
    }
}

fn decode_request(message: &Value) -> Option<ActionRequest> {
    let id = message.get("id").and_then(Value::as_str)?;
    let params = message.get("params")?;
    let method = params.get("method").and_then(Value::as_str)?;

    let mut request_id = id.to_string();
    truncate_utf8(&mut request_id, REQUEST_ID_MAX);

    let mut decoded = IndexMap::new();
    if let Some(Value::Object(fields)) = params.get("params") {
        for (name, value) in fields {
            match decode_value(value) {
                Some(value) => {
                    decoded.insert(name.clone(), value);
                }
                // Arrays, objects and nulls carry no typed representation.
                None => log::debug!("ignoring parameter {name:?} of unsupported type"),
            }
        }
    }

    Some(ActionRequest::new(method, request_id, REQUEST_SOURCE, decoded))
}

fn encode_value(value: &TypedValue) -> Value {
    match value {
        TypedValue::Bool(v) => Value::from(*v),
        TypedValue::I8(v) => Value::from(*v),
        TypedValue::I16(v) => Value::from(*v),
        TypedValue::I32(v) => Value::from(*v),
        TypedValue::I64(v) => Value::from(*v),
        TypedValue::U8(v) => Value::from(*v),
        TypedValue::U16(v) => Value::from(*v),
        TypedValue::U32(v) => Value::from(*v),
        TypedValue::U64(v) => Value::from(*v),
        TypedValue::F32(v) => Value::from(f64::from(*v)),
        TypedValue::F64(v) => Value::from(*v),
        TypedValue::String(v) => Value::from(v.clone()),
        TypedValue::Raw(bytes) => Value::from(BASE64.encode(bytes)),
        TypedValue::Location(location) => {
            let mut fields = Map::new();
            append_location(&mut fields, location);
            Value::Object(fields)
        }
    }
}

fn decode_value(value: &Value) -> Option<TypedValue> {
    match value {
        Value::Bool(v) => Some(TypedValue::Bool(*v)),
        Value::Number(n) => {
            if let Some(v) = n.as_i64() {
                Some(TypedValue::I64(v))
            } else if let Some(v) = n.as_u64() {
                Some(TypedValue::U64(v))
            } else {
                n.as_f64().map(TypedValue::F64)
            }
        }
        Value::String(v) => Some(TypedValue::String(v.clone())),
        Value::Array(_) | Value::Object(_) | Value::Null => None,
    }
}

fn append_location(params: &mut Map<String, Value>, location: &Location) {
    params.insert("lat".into(), Value::from(location.latitude));
    params.insert("lng".into(), Value::from(location.longitude));
    if let Some(heading) = location.heading {
        params.insert("heading".into(), Value::from(heading));
    }
    if let Some(altitude) = location.altitude {
        params.insert("altitude".into(), Value::from(altitude));
    }
    if let Some(speed) = location.speed {
        params.insert("speed".into(), Value::from(speed));
    }
    if let Some(accuracy) = location.accuracy {
        params.insert("fixAcc".into(), Value::from(accuracy));
    }
    if let Some(source) = location.source {
        params.insert("fixType".into(), Value::from(source.wire_name()));
    }
    if let Some(tag) = &location.tag {
        params.insert("street".into(), Value::from(tag.clone()));
    }
}
