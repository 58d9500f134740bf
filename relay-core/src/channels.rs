//! Channel directory (C9, connection role): resolves a named channel to an
//! (address, port) pair.

use crate::frame::{ActorType, ChannelResponse, ResultCode};
use crate::store::{ChannelRow, Store};

/// Liveness window: rows with `last_update < now - LIVENESS_WINDOW_S` are
/// treated as stale.
pub const LIVENESS_WINDOW_S: u64 = 300;

pub fn handle_channel_request(
    store: &Store,
    caller_actor: ActorType,
    user_id: u64,
    device_key: &str,
    channel_name: &str,
    now: u64,
) -> ChannelResponse {
    let min_last_update = now.saturating_sub(LIVENESS_WINDOW_S);

    let picked = match caller_actor {
        ActorType::App => pick_for_app(store, user_id, device_key, channel_name, min_last_update),
        ActorType::Platform => pick_for_platform(store, channel_name, min_last_update),
    };

    match picked {
        Ok(Some(row)) => ChannelResponse {
            channel: channel_name.to_string(),
            address: row.address,
            port: row.port,
            result: ResultCode::None,
        },
        _ => ChannelResponse {
            channel: channel_name.to_string(),
            address: String::new(),
            port: 0,
            result: ResultCode::NoChannel,
        },
    }
}

fn pick_for_app(
    store: &Store,
    user_id: u64,
    device_key: &str,
    channel_name: &str,
    min_last_update: u64,
) -> Result<Option<ChannelRow>, relay_proto::error::PersistenceError> {
    let channel_ids = store.channel_ids_for_device(user_id, device_key)?;
    let mut best: Option<ChannelRow> = None;

    for channel_id in channel_ids {
        let row = match store.channel_by_id(channel_id)? {
            Some(row) => row,
            None => continue,
        };
        if row.name != channel_name || row.last_update < min_last_update {
            continue;
        }
        if best.as_ref().map_or(true, |b| row.last_update > b.last_update) {
            best = Some(row);
        }
    }

    Ok(best)
}

fn pick_for_platform(
    store: &Store,
    channel_name: &str,
    min_last_update: u64,
) -> Result<Option<ChannelRow>, relay_proto::error::PersistenceError> {
    let candidates = store.channels_by_name(channel_name, min_last_update)?;
    Ok(candidates
        .into_iter()
        .min_by_key(|row| row.assistant_connections))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_caller_resolves_via_connection_device_channel() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_channel(&ChannelRow {
                channel_id: 10,
                name: "voice".to_string(),
                address: "10.0.0.2".to_string(),
                port: 9001,
                assistant_connections: 0,
                last_update: 1000,
            })
            .unwrap();
        store
            .upsert_channel(&ChannelRow {
                channel_id: 11,
                name: "voice".to_string(),
                address: "10.0.0.1".to_string(),
                port: 9000,
                assistant_connections: 0,
                last_update: 1000,
            })
            .unwrap();
        store.insert_connection_device_channel(11, 7, "D1").unwrap();

        let response = handle_channel_request(&store, ActorType::App, 7, "D1", "voice", 1000);
        assert_eq!(response.result, ResultCode::None);
        assert_eq!(response.address, "10.0.0.1");
        assert_eq!(response.port, 9000);
    }

    #[test]
    fn platform_caller_picks_least_loaded_channel() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_channel(&ChannelRow {
                channel_id: 1,
                name: "voice".to_string(),
                address: "a".to_string(),
                port: 1,
                assistant_connections: 5,
                last_update: 1000,
            })
            .unwrap();
        store
            .upsert_channel(&ChannelRow {
                channel_id: 2,
                name: "voice".to_string(),
                address: "b".to_string(),
                port: 2,
                assistant_connections: 1,
                last_update: 1000,
            })
            .unwrap();

        let response = handle_channel_request(&store, ActorType::Platform, 0, "", "voice", 1000);
        assert_eq!(response.address, "b");
    }

    #[test]
    fn stale_rows_are_excluded() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_channel(&ChannelRow {
                channel_id: 1,
                name: "voice".to_string(),
                address: "a".to_string(),
                port: 1,
                assistant_connections: 0,
                last_update: 100,
            })
            .unwrap();

        let response = handle_channel_request(&store, ActorType::Platform, 0, "", "voice", 100 + LIVENESS_WINDOW_S + 1);
        assert_eq!(response.result, ResultCode::NoChannel);
    }
}
