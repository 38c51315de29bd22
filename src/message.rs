//! Wire protocol: typed request/response records and frame codec.
//!
//! Frames are length-prefixed (`u32` little-endian length, then payload).
//! A request payload is the encoded [`RequestHeader`] followed by the body
//! for its message type; a response payload is the encoded
//! [`ResponseHeader`] followed by either the typed result (`ok = true`) or
//! an [`ErrorBody`] (`ok = false`).

use crate::error::WorldStateError;
use crate::field::Fr;
use crate::types::{BlockData, Leaf, Revision, TreeId};
use crate::world::BatchResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Recognized message types. The discriminants are the wire tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    GetTreeInfo = 1,
    GetStateReference = 2,
    FindLeafIndex = 3,
    GetLeafValue = 4,
    GetLeafPreimage = 5,
    GetSiblingPath = 6,
    UpdateArchive = 7,
    UpdatePublicData = 8,
    AppendLeaves = 9,
    BatchInsert = 10,
    SyncBlock = 11,
    Commit = 12,
    Rollback = 13,
}

impl MessageType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => MessageType::GetTreeInfo,
            2 => MessageType::GetStateReference,
            3 => MessageType::FindLeafIndex,
            4 => MessageType::GetLeafValue,
            5 => MessageType::GetLeafPreimage,
            6 => MessageType::GetSiblingPath,
            7 => MessageType::UpdateArchive,
            8 => MessageType::UpdatePublicData,
            9 => MessageType::AppendLeaves,
            10 => MessageType::BatchInsert,
            11 => MessageType::SyncBlock,
            12 => MessageType::Commit,
            13 => MessageType::Rollback,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeader {
    pub msg_type: u32,
    pub request_id: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub request_id: u64,
    pub msg_type: u32,
    pub ok: bool,
}

/// Wire-level error category, mirroring the engine's error taxonomy plus a
/// codec-level `InvalidRequest`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    DuplicateKey,
    TreeFull,
    InvalidRevision,
    BlockStateMismatch,
    InvalidTreeOperation,
    Storage,
    UnknownMessage,
    Shutdown,
    /// The frame or body could not be decoded.
    InvalidRequest,
}

impl From<&WorldStateError> for ErrorKind {
    fn from(err: &WorldStateError) -> Self {
        match err {
            WorldStateError::DuplicateKey(_) => ErrorKind::DuplicateKey,
            WorldStateError::TreeFull { .. } => ErrorKind::TreeFull,
            WorldStateError::InvalidRevision(_) => ErrorKind::InvalidRevision,
            WorldStateError::BlockStateMismatch(_) => ErrorKind::BlockStateMismatch,
            WorldStateError::InvalidTreeOperation(_) => ErrorKind::InvalidTreeOperation,
            WorldStateError::Storage(_) => ErrorKind::Storage,
            WorldStateError::UnknownMessage(_) => ErrorKind::UnknownMessage,
            WorldStateError::Shutdown => ErrorKind::Shutdown,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

// Request bodies, one struct per message type.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetTreeInfoRequest {
    pub tree_id: TreeId,
    pub revision: Revision,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStateReferenceRequest {
    pub revision: Revision,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindLeafIndexRequest {
    pub tree_id: TreeId,
    pub revision: Revision,
    pub leaf: Leaf,
    pub from_index: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLeafValueRequest {
    pub tree_id: TreeId,
    pub revision: Revision,
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetLeafPreimageRequest {
    pub tree_id: TreeId,
    pub revision: Revision,
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSiblingPathRequest {
    pub tree_id: TreeId,
    pub revision: Revision,
    pub index: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateArchiveRequest {
    pub block_hash: Fr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePublicDataRequest {
    pub leaf: crate::tree::PublicDataLeafValue,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendLeavesRequest {
    pub tree_id: TreeId,
    pub leaves: Vec<Fr>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInsertRequest {
    pub tree_id: TreeId,
    pub leaves: Vec<Leaf>,
}

pub type SyncBlockRequest = BlockData;

/// Responses without a natural struct reuse these aliases for clarity.
pub type FindLeafIndexResponse = Option<u64>;
pub type GetLeafValueResponse = Option<Leaf>;
pub type GetLeafPreimageResponse = Option<crate::types::LeafPreimage>;
pub type GetSiblingPathResponse = Vec<Fr>;
pub type BatchInsertResponse = BatchResult;

// Frame codec.

/// Prefixes a payload with its `u32` little-endian length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Strips and validates the length prefix.
pub fn decode_frame(frame: &[u8]) -> Option<&[u8]> {
    let length_bytes: [u8; 4] = frame.get(..4)?.try_into().ok()?;
    let length = u32::from_le_bytes(length_bytes) as usize;
    let payload = frame.get(4..)?;
    (payload.len() == length).then_some(payload)
}

/// Encodes a framed request: header, then body.
pub fn encode_request<B: Serialize>(
    msg_type: MessageType,
    request_id: u64,
    body: &B,
) -> Vec<u8> {
    let header = RequestHeader {
        msg_type: msg_type as u32,
        request_id,
    };
    let mut payload = bincode::serialize(&header).expect("header encoding is infallible");
    payload.extend(bincode::serialize(body).expect("request body encoding is infallible"));
    encode_frame(&payload)
}

/// Decodes a request header, returning the rest of the payload.
pub fn decode_request_header(payload: &[u8]) -> Option<(RequestHeader, &[u8])> {
    let mut reader = payload;
    let header: RequestHeader = bincode::deserialize_from(&mut reader).ok()?;
    Some((header, reader))
}

pub fn decode_body<B: DeserializeOwned>(body: &[u8]) -> Option<B> {
    bincode::deserialize(body).ok()
}

/// Encodes a framed success response.
pub fn encode_ok_response<B: Serialize>(request_id: u64, msg_type: u32, body: &B) -> Vec<u8> {
    let header = ResponseHeader {
        request_id,
        msg_type,
        ok: true,
    };
    let mut payload = bincode::serialize(&header).expect("header encoding is infallible");
    payload.extend(bincode::serialize(body).expect("response body encoding is infallible"));
    encode_frame(&payload)
}

/// Encodes a framed error response.
pub fn encode_error_response(
    request_id: u64,
    msg_type: u32,
    kind: ErrorKind,
    message: impl Into<String>,
) -> Vec<u8> {
    let header = ResponseHeader {
        request_id,
        msg_type,
        ok: false,
    };
    let body = ErrorBody {
        kind,
        message: message.into(),
    };
    let mut payload = bincode::serialize(&header).expect("header encoding is infallible");
    payload.extend(bincode::serialize(&body).expect("error body encoding is infallible"));
    encode_frame(&payload)
}

/// Decodes a framed response into its header and typed body.
pub fn decode_response<B: DeserializeOwned>(
    frame: &[u8],
) -> Option<(ResponseHeader, Result<B, ErrorBody>)> {
    let payload = decode_frame(frame)?;
    let mut reader = payload;
    let header: ResponseHeader = bincode::deserialize_from(&mut reader).ok()?;
    let body = if header.ok {
        Ok(bincode::deserialize_from(&mut reader).ok()?)
    } else {
        Err(bincode::deserialize_from(&mut reader).ok()?)
    };
    Some((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TreeInfo;

    /// Frames round-trip and reject truncated or padded payloads.
    #[test]
    fn test_frame_codec() {
        let frame = encode_frame(b"hello");
        assert_eq!(decode_frame(&frame), Some(b"hello".as_slice()));

        assert_eq!(decode_frame(&frame[..frame.len() - 1]), None);
        let mut padded = frame.clone();
        padded.push(0);
        assert_eq!(decode_frame(&padded), None);
        assert_eq!(decode_frame(&[1, 0]), None);
    }

    /// A request round-trips through header and body decoding.
    #[test]
    fn test_request_round_trip() {
        let body = GetTreeInfoRequest {
            tree_id: TreeId::NoteHash,
            revision: Revision::Uncommitted,
        };
        let frame = encode_request(MessageType::GetTreeInfo, 7, &body);

        let payload = decode_frame(&frame).unwrap();
        let (header, rest) = decode_request_header(payload).unwrap();
        assert_eq!(header.msg_type, 1);
        assert_eq!(header.request_id, 7);
        assert_eq!(MessageType::from_u32(header.msg_type), Some(MessageType::GetTreeInfo));
        assert_eq!(decode_body::<GetTreeInfoRequest>(rest), Some(body));
    }

    /// Success and error responses carry the request id and decode to the
    /// right side of the result.
    #[test]
    fn test_response_round_trip() {
        let info = TreeInfo {
            tree_id: TreeId::Archive,
            root: Fr::from_u64(9),
            size: 3,
            depth: 16,
        };
        let frame = encode_ok_response(11, MessageType::GetTreeInfo as u32, &info);
        let (header, body) = decode_response::<TreeInfo>(&frame).unwrap();
        assert!(header.ok);
        assert_eq!(header.request_id, 11);
        assert_eq!(body.unwrap(), info);

        let frame = encode_error_response(
            12,
            MessageType::BatchInsert as u32,
            ErrorKind::DuplicateKey,
            "duplicate key",
        );
        let (header, body) = decode_response::<BatchResult>(&frame).unwrap();
        assert!(!header.ok);
        assert_eq!(header.request_id, 12);
        let error = body.unwrap_err();
        assert_eq!(error.kind, ErrorKind::DuplicateKey);
        assert_eq!(error.message, "duplicate key");
    }

    /// Every documented message tag maps to its type and back.
    #[test]
    fn test_message_type_tags() {
        for tag in 1..=13u32 {
            let message_type = MessageType::from_u32(tag).unwrap();
            assert_eq!(message_type as u32, tag);
        }
        assert_eq!(MessageType::from_u32(0), None);
        assert_eq!(MessageType::from_u32(14), None);
    }
}
