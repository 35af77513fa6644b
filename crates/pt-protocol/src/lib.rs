// pt-protocol: Tracking-events WebSocket message types and decoding.
//
// Every message in both directions is a JSON object discriminated by a
// top-level `action` field.  Client messages are a plain serde-tagged enum.
// Server messages are decoded by hand because several actions have aliases,
// payloads arrive either nested or flattened, and unknown actions must be
// reported as data rather than as decode failures.

use serde::{Deserialize, Deserializer, Serialize, de::Error as _};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Client -> Server messages
// ---------------------------------------------------------------------------

/// All messages the tracking client sends.
///
/// ```json
/// { "action": "subscribe", "package_code": "PKG123", "user_id": "42" }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action")]
#[serde(rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        package_code: String,
        /// Opaque identity derived from the client's token; `null` when anonymous.
        #[serde(default)]
        user_id: Option<String>,
    },
    Unsubscribe {
        package_code: String,
    },
    Ping,
}

impl ClientMessage {
    pub fn subscribe(package_code: impl Into<String>, user_id: Option<String>) -> Self {
        Self::Subscribe {
            package_code: package_code.into(),
            user_id,
        }
    }

    pub fn unsubscribe(package_code: impl Into<String>) -> Self {
        Self::Unsubscribe {
            package_code: package_code.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> Client payloads
// ---------------------------------------------------------------------------

/// One tracking-history entry.
///
/// Shared by live `package_track_updated` events and the REST history
/// endpoint.  `action` and `timestamp` are optional at the wire level so that
/// an incomplete event can still be decoded, logged and dropped by the
/// consumer instead of failing the whole frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackPayload {
    #[serde(default, alias = "id", deserialize_with = "opt_id")]
    pub track_id: Option<String>,
    #[serde(default)]
    pub package_code: Option<String>,
    /// Track action code, e.g. `SEND_DEPOT` or `ARRIVED_FINAL`.
    #[serde(default)]
    pub action: Option<String>,
    /// RFC 3339 timestamp of the event.
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default, deserialize_with = "opt_id")]
    pub depot_id: Option<String>,
    #[serde(default)]
    pub depot_name: Option<String>,
}

/// An uploaded package image.
///
/// The server has used three names for the primary URL over time; all are
/// accepted and kept separately so the consumer can pick the best variant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePayload {
    #[serde(default, alias = "id", deserialize_with = "opt_id")]
    pub image_id: Option<String>,
    #[serde(default)]
    pub package_code: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCreated {
    pub package_code: String,
}

/// A live track update.  `package_code` is taken from the envelope first and
/// from the nested track second.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackUpdate {
    pub package_code: Option<String>,
    pub track: TrackPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUploaded {
    pub package_code: Option<String>,
    pub image: ImagePayload,
}

/// Server acknowledgements and keep-alive replies.  None of them mutate
/// client state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlAction {
    Pong,
    Subscribed { package_code: Option<String> },
    Unsubscribed { package_code: Option<String> },
    Echo,
}

/// Events that change what the client shows for a package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    PackageCreated(PackageCreated),
    TrackUpdated(TrackUpdate),
    ImageUploaded(ImageUploaded),
}

impl DomainEvent {
    /// The package code this event refers to, when the server named one.
    pub fn package_code(&self) -> Option<&str> {
        match self {
            DomainEvent::PackageCreated(c) => Some(c.package_code.as_str()),
            DomainEvent::TrackUpdated(u) => u.package_code.as_deref(),
            DomainEvent::ImageUploaded(i) => i.package_code.as_deref(),
        }
    }
}

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Control(ControlAction),
    Event(DomainEvent),
    /// A well-formed frame whose `action` this client does not know.
    Unknown { action: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("message has no string `action` field")]
    MissingAction,
}

impl ServerMessage {
    /// Decode one text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(obj) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let action = obj
            .get("action")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingAction)?
            .to_owned();

        let msg = match action.as_str() {
            "pong" => ServerMessage::Control(ControlAction::Pong),
            "echo" => ServerMessage::Control(ControlAction::Echo),
            "subscribed" => ServerMessage::Control(ControlAction::Subscribed {
                package_code: string_field(&obj, "package_code"),
            }),
            "unsubscribed" => ServerMessage::Control(ControlAction::Unsubscribed {
                package_code: string_field(&obj, "package_code"),
            }),
            "package_created" => ServerMessage::Event(DomainEvent::PackageCreated(
                serde_json::from_value(Value::Object(obj))?,
            )),
            "package_track_updated" | "package_track_update" => {
                ServerMessage::Event(DomainEvent::TrackUpdated(decode_track_update(obj)?))
            }
            "image_uploaded" | "image_upload" => {
                ServerMessage::Event(DomainEvent::ImageUploaded(decode_image_uploaded(obj)?))
            }
            _ => ServerMessage::Unknown { action },
        };
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// Decoding helpers
// ---------------------------------------------------------------------------

fn string_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Nested form: `{"action": "package_track_updated", "package_code": .., "track": {...}}`.
/// Flattened form carries the track fields on the envelope itself; since the
/// envelope owns `action`, the track's action code travels as `track_action`.
fn decode_track_update(mut obj: Map<String, Value>) -> Result<TrackUpdate, serde_json::Error> {
    let envelope_code = string_field(&obj, "package_code");
    let track: TrackPayload = match obj.remove("track") {
        Some(nested @ Value::Object(_)) => serde_json::from_value(nested)?,
        _ => {
            obj.remove("action");
            if let Some(code) = obj.remove("track_action") {
                obj.insert("action".to_owned(), code);
            }
            serde_json::from_value(Value::Object(obj))?
        }
    };
    Ok(TrackUpdate {
        package_code: envelope_code.or_else(|| track.package_code.clone()),
        track,
    })
}

fn decode_image_uploaded(mut obj: Map<String, Value>) -> Result<ImageUploaded, serde_json::Error> {
    let envelope_code = string_field(&obj, "package_code");
    let image: ImagePayload = match obj.remove("image") {
        Some(nested @ Value::Object(_)) => serde_json::from_value(nested)?,
        _ => serde_json::from_value(Value::Object(obj))?,
    };
    Ok(ImageUploaded {
        package_code: envelope_code.or_else(|| image.package_code.clone()),
        image,
    })
}

/// Ids arrive as strings from some endpoints and as integers from others.
/// Use with `#[serde(default, deserialize_with = "pt_protocol::opt_id")]`.
pub fn opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}
