//! Message dispatcher and asynchronous operation runner.
//!
//! Each inbound frame is decoded just far enough to read its header, then
//! the typed handler runs on the engine's worker pool. The returned
//! [`OpFuture`] resolves with the encoded response frame; engine errors are
//! captured into the response envelope, and a pool shutdown before
//! execution resolves the future with [`WorldStateError::Shutdown`].
//!
//! The dispatcher itself is not serialized: handlers for different requests
//! may run concurrently against the engine, whose per-tree locks make that
//! safe. With a single worker thread, execution order equals dispatch
//! order.

use crate::error::WorldStateError;
use crate::message::{
    decode_body, decode_frame, decode_request_header, encode_error_response, encode_ok_response,
    AppendLeavesRequest, BatchInsertRequest, ErrorKind, FindLeafIndexRequest,
    GetLeafPreimageRequest, GetLeafValueRequest, GetSiblingPathRequest, GetStateReferenceRequest,
    GetTreeInfoRequest, MessageType, RequestHeader, SyncBlockRequest, UpdateArchiveRequest,
    UpdatePublicDataRequest,
};
use crate::types::{Leaf, TreeId};
use crate::world::{IndexedLeaves, WorldState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::mpsc;
use std::sync::Arc;

/// Completion handle for one dispatched request.
pub struct OpFuture {
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl OpFuture {
    /// Blocks until the response frame is ready. A hung-up channel means
    /// the pool dropped the task during shutdown.
    pub fn wait(self) -> Result<Vec<u8>, WorldStateError> {
        self.receiver.recv().map_err(|_| WorldStateError::Shutdown)
    }
}

/// Routes framed requests to engine operations.
pub struct MessageDispatcher {
    world: Arc<WorldState>,
}

impl MessageDispatcher {
    pub fn new(world: Arc<WorldState>) -> Self {
        MessageDispatcher { world }
    }

    /// Schedules a frame for execution and returns its completion future.
    pub fn dispatch(&self, frame: &[u8]) -> OpFuture {
        let (sender, receiver) = mpsc::channel();
        let world = Arc::clone(&self.world);
        let frame = frame.to_vec();
        self.world.pool().enqueue(move || {
            let response = handle_frame(&world, &frame);
            let _ = sender.send(response);
        });
        OpFuture { receiver }
    }
}

fn respond<B: Serialize>(header: RequestHeader, result: Result<B, WorldStateError>) -> Vec<u8> {
    match result {
        Ok(body) => encode_ok_response(header.request_id, header.msg_type, &body),
        Err(err) => {
            tracing::debug!(
                request_id = header.request_id,
                msg_type = header.msg_type,
                error = %err,
                "request failed"
            );
            encode_error_response(
                header.request_id,
                header.msg_type,
                ErrorKind::from(&err),
                err.to_string(),
            )
        }
    }
}

fn with_body<Req, B>(
    header: RequestHeader,
    body: &[u8],
    handler: impl FnOnce(Req) -> Result<B, WorldStateError>,
) -> Vec<u8>
where
    Req: DeserializeOwned,
    B: Serialize,
{
    match decode_body::<Req>(body) {
        Some(request) => respond(header, handler(request)),
        None => encode_error_response(
            header.request_id,
            header.msg_type,
            ErrorKind::InvalidRequest,
            "undecodable request body",
        ),
    }
}

/// Converts wire leaves into the typed batch for the target tree.
fn to_indexed_leaves(tree_id: TreeId, leaves: Vec<Leaf>) -> Result<IndexedLeaves, WorldStateError> {
    match tree_id {
        TreeId::Nullifier => leaves
            .into_iter()
            .map(|leaf| match leaf {
                Leaf::Nullifier(value) => Ok(value),
                _ => Err(WorldStateError::InvalidTreeOperation(tree_id)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(IndexedLeaves::Nullifiers),
        TreeId::PublicData => leaves
            .into_iter()
            .map(|leaf| match leaf {
                Leaf::PublicData(value) => Ok(value),
                _ => Err(WorldStateError::InvalidTreeOperation(tree_id)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(IndexedLeaves::PublicData),
        other => Err(WorldStateError::InvalidTreeOperation(other)),
    }
}

fn handle_frame(world: &WorldState, frame: &[u8]) -> Vec<u8> {
    let Some(payload) = decode_frame(frame) else {
        return encode_error_response(0, 0, ErrorKind::InvalidRequest, "malformed frame");
    };
    let Some((header, body)) = decode_request_header(payload) else {
        return encode_error_response(0, 0, ErrorKind::InvalidRequest, "undecodable header");
    };
    let Some(message_type) = MessageType::from_u32(header.msg_type) else {
        let err = WorldStateError::UnknownMessage(header.msg_type);
        tracing::warn!(msg_type = header.msg_type, "no handler registered");
        return encode_error_response(
            header.request_id,
            header.msg_type,
            ErrorKind::UnknownMessage,
            err.to_string(),
        );
    };

    match message_type {
        MessageType::GetTreeInfo => with_body(header, body, |r: GetTreeInfoRequest| {
            world.get_tree_info(r.tree_id, r.revision)
        }),
        MessageType::GetStateReference => with_body(header, body, |r: GetStateReferenceRequest| {
            world.get_state_reference(r.revision)
        }),
        MessageType::FindLeafIndex => with_body(header, body, |r: FindLeafIndexRequest| {
            world.find_leaf_index(r.tree_id, &r.leaf, r.from_index.unwrap_or(0), r.revision)
        }),
        MessageType::GetLeafValue => with_body(header, body, |r: GetLeafValueRequest| {
            world.get_leaf(r.tree_id, r.index, r.revision)
        }),
        MessageType::GetLeafPreimage => with_body(header, body, |r: GetLeafPreimageRequest| {
            world.get_indexed_leaf(r.tree_id, r.index, r.revision)
        }),
        MessageType::GetSiblingPath => with_body(header, body, |r: GetSiblingPathRequest| {
            world.sibling_path(r.tree_id, r.index, r.revision)
        }),
        MessageType::UpdateArchive => with_body(header, body, |r: UpdateArchiveRequest| {
            world.update_archive(r.block_hash)
        }),
        MessageType::UpdatePublicData => with_body(header, body, |r: UpdatePublicDataRequest| {
            world.update_public_data(r.leaf)
        }),
        MessageType::AppendLeaves => with_body(header, body, |r: AppendLeavesRequest| {
            world.append_leaves(r.tree_id, &r.leaves)
        }),
        MessageType::BatchInsert => with_body(header, body, |r: BatchInsertRequest| {
            let leaves = to_indexed_leaves(r.tree_id, r.leaves)?;
            world.append_indexed_leaves(r.tree_id, leaves)
        }),
        MessageType::SyncBlock => {
            with_body(header, body, |r: SyncBlockRequest| world.sync_block(&r))
        }
        MessageType::Commit => with_body(header, body, |_: ()| world.commit()),
        MessageType::Rollback => with_body(header, body, |_: ()| world.rollback()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::Fr;
    use crate::message::{decode_response, encode_frame, encode_request, ErrorBody};
    use crate::tree::NullifierLeafValue;
    use crate::types::{Revision, TreeInfo};
    use crate::world::{BatchResult, WorldStateConfig};
    use tempfile::TempDir;

    fn test_dispatcher() -> (TempDir, Arc<WorldState>, MessageDispatcher) {
        let dir = TempDir::new().unwrap();
        let world = Arc::new(
            WorldState::open(&WorldStateConfig {
                data_directory: dir.path().to_path_buf(),
                map_size_kb: 1024,
                worker_threads: 1,
            })
            .unwrap(),
        );
        let dispatcher = MessageDispatcher::new(Arc::clone(&world));
        (dir, world, dispatcher)
    }

    fn roundtrip<B: DeserializeOwned>(
        dispatcher: &MessageDispatcher,
        frame: Vec<u8>,
    ) -> (u64, Result<B, ErrorBody>) {
        let response = dispatcher.dispatch(&frame).wait().unwrap();
        let (header, body) = decode_response::<B>(&response).unwrap();
        (header.request_id, body)
    }

    /// A full wire round-trip: append, read back at both revisions, commit.
    #[test]
    fn test_wire_append_and_read() {
        let (_dir, _world, dispatcher) = test_dispatcher();

        let (id, result) = roundtrip::<()>(
            &dispatcher,
            encode_request(
                MessageType::AppendLeaves,
                1,
                &AppendLeavesRequest {
                    tree_id: TreeId::NoteHash,
                    leaves: vec![Fr::from_u64(42)],
                },
            ),
        );
        assert_eq!(id, 1);
        result.unwrap();

        let (_, uncommitted) = roundtrip::<Option<Leaf>>(
            &dispatcher,
            encode_request(
                MessageType::GetLeafValue,
                2,
                &GetLeafValueRequest {
                    tree_id: TreeId::NoteHash,
                    revision: Revision::Uncommitted,
                    index: 0,
                },
            ),
        );
        assert_eq!(uncommitted.unwrap(), Some(Leaf::Value(Fr::from_u64(42))));

        let (_, committed) = roundtrip::<Option<Leaf>>(
            &dispatcher,
            encode_request(
                MessageType::GetLeafValue,
                3,
                &GetLeafValueRequest {
                    tree_id: TreeId::NoteHash,
                    revision: Revision::Committed,
                    index: 0,
                },
            ),
        );
        assert_eq!(committed.unwrap(), None);

        let (_, commit) = roundtrip::<()>(
            &dispatcher,
            encode_request(MessageType::Commit, 4, &()),
        );
        commit.unwrap();

        let (_, info) = roundtrip::<TreeInfo>(
            &dispatcher,
            encode_request(
                MessageType::GetTreeInfo,
                5,
                &GetTreeInfoRequest {
                    tree_id: TreeId::NoteHash,
                    revision: Revision::Committed,
                },
            ),
        );
        assert_eq!(info.unwrap().size, 1);
    }

    /// Batch insertion returns typed witnesses over the wire.
    #[test]
    fn test_wire_batch_insert() {
        let (_dir, _world, dispatcher) = test_dispatcher();
        let leaves = vec![
            Leaf::Nullifier(NullifierLeafValue::new(Fr::from_u64(50))),
            Leaf::Nullifier(NullifierLeafValue::new(Fr::from_u64(42))),
            Leaf::Nullifier(NullifierLeafValue::new(Fr::from_u64(80))),
        ];
        let (_, result) = roundtrip::<BatchResult>(
            &dispatcher,
            encode_request(
                MessageType::BatchInsert,
                9,
                &BatchInsertRequest {
                    tree_id: TreeId::Nullifier,
                    leaves,
                },
            ),
        );
        let BatchResult::Nullifier(result) = result.unwrap() else {
            panic!("nullifier batch must return nullifier results");
        };
        assert_eq!(result.witnesses.len(), 3);
        assert_eq!(result.sorted_leaves[0].1, 2);
    }

    /// Engine failures arrive as typed error envelopes bound to the
    /// request id.
    #[test]
    fn test_wire_error_envelope() {
        let (_dir, _world, dispatcher) = test_dispatcher();
        let insert = |request_id| {
            encode_request(
                MessageType::BatchInsert,
                request_id,
                &BatchInsertRequest {
                    tree_id: TreeId::Nullifier,
                    leaves: vec![Leaf::Nullifier(NullifierLeafValue::new(Fr::from_u64(42)))],
                },
            )
        };
        let (_, first) = roundtrip::<BatchResult>(&dispatcher, insert(1));
        first.unwrap();

        let (id, second) = roundtrip::<BatchResult>(&dispatcher, insert(2));
        assert_eq!(id, 2);
        let error = second.unwrap_err();
        assert_eq!(error.kind, ErrorKind::DuplicateKey);
    }

    /// Unknown message tags produce `UnknownMessage` bound to the request.
    #[test]
    fn test_unknown_message() {
        let (_dir, _world, dispatcher) = test_dispatcher();
        let mut payload = bincode::serialize(&RequestHeader {
            msg_type: 999,
            request_id: 55,
        })
        .unwrap();
        payload.extend([0u8; 4]);
        let (header_id, body) =
            roundtrip::<()>(&dispatcher, encode_frame(&payload));
        assert_eq!(header_id, 55);
        assert_eq!(body.unwrap_err().kind, ErrorKind::UnknownMessage);
    }

    /// Undecodable bodies and malformed frames are codec errors.
    #[test]
    fn test_invalid_request() {
        let (_dir, _world, dispatcher) = test_dispatcher();

        let mut payload = bincode::serialize(&RequestHeader {
            msg_type: MessageType::GetTreeInfo as u32,
            request_id: 3,
        })
        .unwrap();
        payload.extend([0xff]);
        let (_, body) = roundtrip::<TreeInfo>(&dispatcher, encode_frame(&payload));
        assert_eq!(body.unwrap_err().kind, ErrorKind::InvalidRequest);

        let response = dispatcher.dispatch(b"not a frame").wait().unwrap();
        let (_, body) = decode_response::<()>(&response).unwrap();
        assert_eq!(body.unwrap_err().kind, ErrorKind::InvalidRequest);
    }

    /// A dropped completion channel surfaces as `Shutdown`.
    #[test]
    fn test_future_observes_shutdown() {
        let (sender, receiver) = mpsc::channel::<Vec<u8>>();
        drop(sender);
        let future = OpFuture { receiver };
        assert!(matches!(future.wait(), Err(WorldStateError::Shutdown)));
    }
}
