use derive_more::{Display, Error};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// The variables of a GraphQL operation, keyed by variable name.
pub type Variables = serde_json::Map<String, Value>;

/// Clients may send `"variables": null`; treat it like an omitted map.
fn variables_or_default<'de, D>(deserializer: D) -> Result<Variables, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Variables>::deserialize(deserializer)?.unwrap_or_default())
}

/// The payload of a client's "start" message. This triggers execution of a
/// subscription operation.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GraphQLRequest {
    /// The document body.
    pub query: String,

    /// The optional variables.
    #[serde(default, deserialize_with = "variables_or_default")]
    pub variables: Variables,

    /// The optional operation name (required if the document contains multiple operations).
    pub operation_name: Option<String>,
}

/// The message envelope common to every frame on the wire.
///
/// Decoding only requires `type` to be a string, not a known value: the
/// handler answers unrecognized types with a `connection_error` that echoes
/// the frame's id, which a stricter decode could not provide.
#[derive(Debug, Deserialize, PartialEq)]
pub struct OperationMessage {
    /// The message type.
    #[serde(rename = "type")]
    pub message_type: String,

    /// The operation id, when the frame carries one.
    #[serde(default)]
    pub id: Option<String>,

    /// The message payload, when the frame carries one.
    #[serde(default)]
    pub payload: Option<Value>,
}

impl OperationMessage {
    /// Decodes a text frame into the envelope.
    pub fn from_text(frame: &str) -> serde_json::Result<Self> {
        serde_json::from_str(frame)
    }
}

/// ClientMessage defines the message types that clients can send, after
/// classification of the raw envelope.
#[derive(Debug, PartialEq)]
pub enum ClientMessage {
    /// ConnectionInit is sent by the client upon connecting. The payload is
    /// often used for authentication and is retained for hook invocations.
    ConnectionInit {
        /// The frame's id, when present. The legacy protocol starts
        /// keep-alives only for inits that carried one.
        id: Option<String>,
        /// Optional parameters of any shape sent from the client.
        payload: Option<Value>,
    },
    /// Start messages are used to execute a GraphQL subscription.
    Start {
        /// The id of the operation. Must be unique among the session's
        /// in-flight operations; duplicates are ignored.
        id: String,
        /// The query, variables, and operation name.
        payload: GraphQLRequest,
    },
    /// Stop messages are used to unsubscribe from a subscription.
    Stop {
        /// The id of the operation to stop.
        id: Option<String>,
    },
    /// ConnectionTerminate is used to terminate the connection.
    ConnectionTerminate,
}

/// Errors raised while decoding or classifying an inbound frame. Every
/// variant is answered on the wire with a `connection_error`.
#[derive(Debug, Display, Error)]
pub enum ProtocolError {
    /// The frame was not a valid message envelope.
    #[display("invalid message: {_0}")]
    Envelope(#[error(source)] serde_json::Error),

    /// The message `type` is not one a client may send.
    #[display("unknown message type: {message_type}")]
    UnknownMessageType {
        /// The unrecognized `type` value.
        message_type: String,
        /// The frame's id, echoed back to the client.
        id: Option<String>,
    },

    /// A `start` message arrived without an operation id.
    #[display("start message without an operation id")]
    MissingOperationId,

    /// A `start` payload could not be decoded as a GraphQL request.
    #[display("invalid start payload: {source}")]
    Payload {
        /// The operation id the payload belonged to.
        id: String,
        /// The underlying decode failure.
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// The operation id to echo on the resulting `connection_error`, if the
    /// offending frame supplied one.
    pub fn operation_id(&self) -> Option<&str> {
        match self {
            Self::UnknownMessageType { id, .. } => id.as_deref(),
            Self::Payload { id, .. } => Some(id),
            Self::Envelope(_) | Self::MissingOperationId => None,
        }
    }
}

impl TryFrom<OperationMessage> for ClientMessage {
    type Error = ProtocolError;

    fn try_from(msg: OperationMessage) -> Result<Self, ProtocolError> {
        let OperationMessage {
            message_type,
            id,
            payload,
        } = msg;
        match message_type.as_str() {
            "connection_init" => Ok(Self::ConnectionInit { id, payload }),
            "start" => {
                let id = id.ok_or(ProtocolError::MissingOperationId)?;
                let payload = serde_json::from_value(payload.unwrap_or(Value::Null))
                    .map_err(|source| ProtocolError::Payload {
                        id: id.clone(),
                        source,
                    })?;
                Ok(Self::Start { id, payload })
            }
            "stop" => Ok(Self::Stop { id }),
            "connection_terminate" => Ok(Self::ConnectionTerminate),
            _ => Err(ProtocolError::UnknownMessageType { message_type, id }),
        }
    }
}

impl ClientMessage {
    /// Decodes and classifies a text frame in one step.
    pub fn from_text(frame: &str) -> Result<Self, ProtocolError> {
        OperationMessage::from_text(frame)
            .map_err(ProtocolError::Envelope)?
            .try_into()
    }
}
