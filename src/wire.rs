//! Wire framing and envelopes
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload]
//!
//! A request payload is a document. An optional top-level `requestId` is
//! stripped before the document reaches the matcher and echoed back on the
//! response.

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MockError, Result};
use crate::matcher::Document;
use crate::response::WireEnvelope;

/// Largest frame accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const REQUEST_ID_FIELD: &str = "requestId";

/// Response envelope: wraps the reply with optional requestId for echo-back.
#[derive(Serialize)]
struct ResponseEnvelope<'a> {
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    request_id: Option<&'a str>,
    #[serde(flatten)]
    response: &'a WireEnvelope,
}

/// Read one frame; `Ok(None)` on clean EOF before a length prefix.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Message too large: {} bytes", len),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_frame<W>(writer: &mut W, data: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds 4 GiB")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Decode a request payload, splitting off the echo id.
pub fn decode_request(payload: &[u8]) -> Result<(Option<String>, Document)> {
    let mut doc: Value = rmp_serde::from_slice(payload)?;
    let map = doc
        .as_object_mut()
        .ok_or_else(|| MockError::InvalidRequest("request must be a document".to_string()))?;
    let request_id = match map.remove(REQUEST_ID_FIELD) {
        Some(Value::String(id)) => Some(id),
        Some(other) => return Err(MockError::InvalidRequest(format!("requestId must be a string, got {}", other))),
        None => None,
    };
    Ok((request_id, doc))
}

pub fn encode_response(request_id: Option<&str>, response: &WireEnvelope) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(&ResponseEnvelope { request_id, response })?)
}

/// Client side: encode a request document, optionally tagged with an id.
pub fn encode_request(request_id: Option<&str>, request: &Document) -> Result<Vec<u8>> {
    let mut doc = request.clone();
    if let (Some(id), Some(map)) = (request_id, doc.as_object_mut()) {
        map.insert(REQUEST_ID_FIELD.to_string(), Value::from(id));
    }
    Ok(rmp_serde::to_vec_named(&doc)?)
}

/// Client side: decode a response payload into a document.
pub fn decode_response(payload: &[u8]) -> Result<Document> {
    Ok(rmp_serde::from_slice(payload)?)
}

#[cfg(test)]
mod wire_tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, b"hello").await.unwrap();
        drop(client);

        let frame = read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert_eq!(frame.as_deref(), Some(&b"hello"[..]));
        assert_eq!(read_frame(&mut server, DEFAULT_MAX_FRAME_BYTES).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &[0u8; 64]).await.unwrap();

        let err = read_frame(&mut server, 16).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_request_id_is_stripped_and_echoed() {
        let request = json!({"continue": 5, "collection": "coll"});
        let payload = encode_request(Some("r-1"), &request).unwrap();

        let (request_id, doc) = decode_request(&payload).unwrap();
        assert_eq!(request_id.as_deref(), Some("r-1"));
        assert_eq!(doc, request);

        let reply = WireEnvelope::ok_with(vec![("pong", json!(true))]);
        let bytes = encode_response(request_id.as_deref(), &reply).unwrap();
        let decoded = decode_response(&bytes).unwrap();
        assert_eq!(decoded, json!({"requestId": "r-1", "pong": true, "ok": 1}));
    }

    #[test]
    fn test_non_document_request_rejected() {
        let payload = rmp_serde::to_vec_named(&json!([1, 2])).unwrap();
        let err = decode_request(&payload).unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");

        let payload = rmp_serde::to_vec_named(&json!({"ping": 1, "requestId": 4})).unwrap();
        assert!(decode_request(&payload).is_err());
    }
}
