//! Binary batch mode.
//!
//! Protobuf `RequestBatch`/`ResponseBatch` envelope used when the
//! negotiated protocol version selects binary payloads. Outbound
//! publishes embed `IncomingMessage`s addressed by public channel id and
//! signature; inbound responses embed `OutgoingMessage`s whose `body` is
//! a JSON envelope in the text-mode format.

use prost::Message as _;
use pulse_core::PulseError;

/// Batch of client-to-server requests.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestBatch {
    /// Requests in submission order.
    #[prost(message, repeated, tag = "1")]
    pub requests: Vec<Request>,
}

/// One client-to-server request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    /// Direct message submission.
    #[prost(message, optional, tag = "1")]
    pub incoming_messages: Option<IncomingMessagesRequest>,
}

/// Messages being published by this client.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IncomingMessagesRequest {
    /// Messages to deliver.
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<IncomingMessage>,
}

/// One message published to a set of receivers.
#[derive(Clone, PartialEq, prost::Message)]
pub struct IncomingMessage {
    /// Addressed receivers (public channel id + signature).
    #[prost(message, repeated, tag = "1")]
    pub receivers: Vec<Receiver>,
    /// JSON envelope body.
    #[prost(string, tag = "2")]
    pub body: String,
    /// Seconds the server may buffer the message for offline receivers.
    #[prost(uint32, tag = "3")]
    pub expiry: u32,
}

/// A publish target.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Receiver {
    /// Public channel id of the receiver.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Signature proving the sender may address this channel.
    #[prost(string, tag = "2")]
    pub signature: String,
}

/// Batch of server-to-client responses.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ResponseBatch {
    /// Responses in server order.
    #[prost(message, repeated, tag = "1")]
    pub responses: Vec<Response>,
}

/// One server-to-client response.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    /// Messages pushed to this client.
    #[prost(message, optional, tag = "1")]
    pub outgoing_messages: Option<OutgoingMessagesResponse>,
}

/// Messages delivered to this client.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OutgoingMessagesResponse {
    /// Delivered messages.
    #[prost(message, repeated, tag = "1")]
    pub messages: Vec<OutgoingMessage>,
}

/// One delivered message.
#[derive(Clone, PartialEq, prost::Message)]
pub struct OutgoingMessage {
    /// Opaque message id.
    #[prost(string, tag = "1")]
    pub id: String,
    /// Who sent it.
    #[prost(message, optional, tag = "2")]
    pub sender: Option<Sender>,
    /// JSON envelope body.
    #[prost(string, tag = "3")]
    pub body: String,
}

/// Message originator.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Sender {
    /// Originator kind.
    #[prost(enumeration = "SenderType", tag = "1")]
    pub r#type: i32,
    /// Public channel id of the sending client, when applicable.
    #[prost(string, optional, tag = "2")]
    pub id: Option<String>,
}

/// Kind of message originator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SenderType {
    /// Not specified.
    Unknown = 0,
    /// Another client published it directly.
    Client = 1,
    /// The backend originated it.
    Backend = 2,
}

/// Build a publish batch for one message addressed to `receivers`.
#[must_use]
pub fn publish_batch(receivers: Vec<Receiver>, body: String, expiry: u32) -> RequestBatch {
    RequestBatch {
        requests: vec![Request {
            incoming_messages: Some(IncomingMessagesRequest {
                messages: vec![IncomingMessage {
                    receivers,
                    body,
                    expiry,
                }],
            }),
        }],
    }
}

/// Encode a request batch to wire bytes.
#[must_use]
pub fn encode_request_batch(batch: &RequestBatch) -> Vec<u8> {
    batch.encode_to_vec()
}

/// Decode a response batch from wire bytes.
pub fn decode_response_batch(bytes: &[u8]) -> Result<ResponseBatch, PulseError> {
    ResponseBatch::decode(bytes).map_err(|err| PulseError::Protocol {
        context: format!("invalid response batch: {err}"),
    })
}
