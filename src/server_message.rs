use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// The payload for errors that are not associated with a GraphQL operation.
#[derive(Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionErrorPayload {
    /// The error message.
    pub message: String,
}

/// A single error produced while executing an operation.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct GraphQLError {
    /// The error message.
    pub message: String,
}

impl GraphQLError {
    /// Constructs an error from its message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Engines may report `"errors": null`; treat it like an omitted list.
fn errors_or_default<'de, D>(deserializer: D) -> Result<Vec<GraphQLError>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<GraphQLError>>::deserialize(deserializer)?.unwrap_or_default())
}

/// The result of executing an operation. For subscriptions, one of these is
/// produced for every event in the event stream.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct GraphQLResponse {
    /// The result data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// The errors that occurred during execution.
    #[serde(
        default,
        deserialize_with = "errors_or_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    /// Constructs a successful response from its data.
    pub fn from_data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: vec![],
        }
    }

    /// Constructs a failed response from its errors.
    pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
        Self { data: None, errors }
    }

    /// Whether the response carries any errors. Responses that do are sent
    /// to the client as `error` messages rather than `data` messages.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// ServerMessage defines the message types that servers can send.
#[derive(Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// ConnectionError is used for errors that are not associated with a
    /// live operation. For example, this will be used when:
    ///
    ///   * The server is unable to decode a client's message.
    ///   * The client's initialization parameters are rejected.
    ConnectionError {
        /// The id of the offending frame, echoed back when it supplied one.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        /// The error that occurred.
        payload: ConnectionErrorPayload,
    },
    /// ConnectionAck is sent in response to a client's ConnectionInit
    /// message if the server accepted the connection.
    ConnectionAck,
    /// Data contains the result of a subscription event.
    Data {
        /// The id of the operation that the data is for.
        id: String,
        /// The data and errors that occurred during execution.
        payload: GraphQLResponse,
    },
    /// Error contains an operation-scoped error, such as a rejected
    /// operation or a failed result stream.
    Error {
        /// The id of the operation that triggered this error.
        id: String,
        /// The error(s).
        payload: GraphQLResponse,
    },
    /// Complete indicates that no more data will be sent for the given
    /// operation.
    Complete {
        /// The id of the operation that has completed.
        id: String,
    },
    /// ConnectionKeepAlive is sent periodically after accepting a
    /// connection.
    #[serde(rename = "ka")]
    ConnectionKeepAlive,
}

impl ServerMessage {
    /// Constructs a `connection_error` message.
    pub(crate) fn connection_error(id: Option<String>, message: impl Into<String>) -> Self {
        Self::ConnectionError {
            id,
            payload: ConnectionErrorPayload {
                message: message.into(),
            },
        }
    }
}
