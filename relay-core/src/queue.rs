//! Store-and-forward queue (C8): persists a frame for a peer that isn't
//! currently present in the exchange, and re-materializes it on `GET_DATA`.

use crate::frame::{ActorType, Frame, FrameId};
use crate::store::Store;
use relay_proto::crypto;
use relay_proto::logging::Logger;

/// Encoded payloads above this size are dropped rather than stored.
pub const MAX_ENCODED_PAYLOAD: usize = 2048;

fn frame_tail(frame: &Frame) -> Vec<u8> {
    let encoded = frame.encode();
    let tail = &encoded[1..];
    let end = tail.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    tail[..end].to_vec()
}

/// Spools `frame` for later pickup by the opposite actor type. Oversized
/// payloads are dropped with a logged warning; this is never surfaced to
/// the sender as an error.
pub fn store_outgoing(
    store: &Store,
    user_id: u64,
    device_key: &str,
    sender_actor: ActorType,
    frame: &Frame,
    log: &Logger,
) {
    let tail = frame_tail(frame);
    if tail.is_empty() {
        slog::warn!(log, "dropping empty store-and-forward payload"; "device_key" => device_key);
        return;
    }

    let encoded = crypto::encode_payload(&tail);
    if encoded.len() > MAX_ENCODED_PAYLOAD {
        slog::warn!(
            log,
            "dropping oversized store-and-forward payload";
            "device_key" => device_key,
            "encoded_len" => encoded.len(),
        );
        return;
    }

    if let Err(e) = store.insert_message(
        user_id,
        device_key,
        sender_actor as u8,
        frame.id() as u8,
        &encoded,
    ) {
        slog::error!(log, "failed to store queued message"; "error" => %e);
    }
}

/// Pops and re-materializes the oldest message destined for `caller_actor`,
/// deleting the row before returning it (so a crash after this call but
/// before the transport send is the only redelivery risk).
pub fn take_incoming(
    store: &Store,
    user_id: u64,
    device_key: &str,
    caller_actor: ActorType,
    log: &Logger,
) -> Option<Frame> {
    let sender_actor = caller_actor.opposite();
    let row = match store.oldest_message(user_id, device_key, sender_actor as u8) {
        Ok(Some(row)) => row,
        Ok(None) => return None,
        Err(e) => {
            slog::error!(log, "failed to read queued message"; "error" => %e);
            return None;
        }
    };

    let frame_id = match FrameId::from_u8(row.message_type) {
        Ok(id) => id,
        Err(_) => {
            slog::error!(log, "queued message has an invalid frame id"; "message_id" => row.message_id);
            let _ = store.delete_message(row.message_id);
            return None;
        }
    };

    let data = match crypto::decode_payload(&row.message_data_b64) {
        Ok(d) => d,
        Err(_) => {
            slog::warn!(log, "queued message failed to decode"; "message_id" => row.message_id);
            let _ = store.delete_message(row.message_id);
            return None;
        }
    };

    if let Err(e) = store.delete_message(row.message_id) {
        slog::error!(log, "failed to delete delivered queued message"; "error" => %e);
    }

    Some(Frame::opaque(frame_id, data))
}
