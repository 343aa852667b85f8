//! Client-server API wire types, only the fields we read

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use common::auth::PowerLevels;
use common::entry::{RecordMeta, RECORD_TYPE};
use common::remote::{RecordChange, RoomEvent};

pub const POWER_LEVELS_TYPE: &str = "m.room.power_levels";

/// Error body returned by the homeserver
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatrixErrorBody {
    #[serde(default)]
    pub errcode: String,
    #[serde(default)]
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct LoginRequest<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub identifier: UserIdentifier<'a>,
    pub password: &'a str,
    pub initial_device_display_name: &'static str,
}

#[derive(Debug, Serialize)]
pub struct UserIdentifier<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub user: &'a str,
}

#[derive(Debug, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct WhoAmI {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendResponse {
    pub event_id: Option<String>,
}

/// A state event as found in `/sync` and `/state` responses
#[derive(Debug, Clone, Deserialize)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: serde_json::Value,
    pub event_id: Option<String>,
    pub sender: Option<String>,
    #[serde(default)]
    pub origin_server_ts: i64,
}

impl StateEvent {
    pub fn meta(&self) -> RecordMeta {
        RecordMeta {
            event_id: self.event_id.clone(),
            sender: self.sender.clone(),
            timestamp: self.origin_server_ts,
        }
    }

    /// The engine's view of this event; `None` for anything it ignores
    pub fn into_room_event(self) -> Option<RoomEvent> {
        let key = self.state_key.clone()?;
        if self.event_type == RECORD_TYPE {
            return Some(RoomEvent::Record(RecordChange {
                meta: self.meta(),
                event_type: self.event_type,
                key,
                content: self.content,
            }));
        }
        if self.event_type != POWER_LEVELS_TYPE {
            return None;
        }
        match serde_json::from_value::<PowerLevels>(self.content) {
            Ok(levels) => Some(RoomEvent::PowerLevels(levels)),
            Err(err) => {
                tracing::warn!("ignoring malformed power levels: {}", err);
                None
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoom>,
}

#[derive(Debug, Default, Deserialize)]
pub struct JoinedRoom {
    #[serde(default)]
    pub state: EventList,
    #[serde(default)]
    pub timeline: EventList,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<serde_json::Value>,
}

impl SyncResponse {
    /// State changes for `room`, state block first, then the timeline
    ///
    /// Events are parsed one by one so a single odd event does not lose
    /// the batch.
    pub fn room_events(mut self, room: &str) -> Vec<RoomEvent> {
        let Some(joined) = self.rooms.join.remove(room) else {
            return Vec::new();
        };

        joined
            .state
            .events
            .into_iter()
            .chain(joined.timeline.events)
            .filter_map(|raw| match serde_json::from_value::<StateEvent>(raw) {
                Ok(event) => event.into_room_event(),
                Err(err) => {
                    tracing::debug!("skipping unparseable event: {}", err);
                    None
                }
            })
            .collect()
    }
}

/// Inline `/sync` filter: only our room, only the state types we follow
pub fn sync_filter(room: &str) -> serde_json::Value {
    let types = [RECORD_TYPE, POWER_LEVELS_TYPE];
    serde_json::json!({
        "presence": { "not_types": ["*"] },
        "account_data": { "not_types": ["*"] },
        "room": {
            "rooms": [room],
            "state": { "types": types, "lazy_load_members": true },
            "timeline": { "types": types, "limit": 100 },
            "ephemeral": { "not_types": ["*"] },
            "account_data": { "not_types": ["*"] }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ROOM: &str = "!room:example.org";

    fn record_event(key: &str, ts: i64) -> serde_json::Value {
        json!({
            "type": RECORD_TYPE,
            "state_key": key,
            "content": { "type": "f", "data": "hi" },
            "event_id": format!("$ev{}", ts),
            "sender": "@other:example.org",
            "origin_server_ts": ts
        })
    }

    #[test]
    fn test_sync_response_yields_records_and_levels() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s72",
            "rooms": { "join": { ROOM: {
                "state": { "events": [record_event("/a", 1)] },
                "timeline": { "events": [
                    record_event("/b", 2),
                    { "type": "m.room.message", "content": { "body": "hi" },
                      "event_id": "$msg", "sender": "@x:y", "origin_server_ts": 3 },
                    { "type": POWER_LEVELS_TYPE, "state_key": "",
                      "content": { "users": { "@me:example.org": 100 } },
                      "event_id": "$pl", "sender": "@x:y", "origin_server_ts": 4 }
                ] }
            } } }
        }))
        .unwrap();
        assert_eq!(response.next_batch, "s72");

        let events = response.room_events(ROOM);
        assert_eq!(events.len(), 3);
        match &events[1] {
            RoomEvent::Record(change) => {
                assert_eq!(change.key, "/b");
                assert_eq!(change.meta.timestamp, 2);
                assert_eq!(change.meta.event_id.as_deref(), Some("$ev2"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        match &events[2] {
            RoomEvent::PowerLevels(levels) => {
                assert_eq!(levels.users.get("@me:example.org"), Some(&100));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_other_rooms_are_ignored() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s1",
            "rooms": { "join": { "!elsewhere:example.org": {
                "timeline": { "events": [record_event("/a", 1)] }
            } } }
        }))
        .unwrap();
        assert!(response.room_events(ROOM).is_empty());
    }

    #[test]
    fn test_empty_sync_response() {
        let response: SyncResponse = serde_json::from_value(json!({ "next_batch": "s2" })).unwrap();
        assert!(response.room_events(ROOM).is_empty());
    }

    #[test]
    fn test_filter_names_room_and_types() {
        let filter = sync_filter(ROOM);
        assert_eq!(filter["room"]["rooms"][0], ROOM);
        assert_eq!(filter["room"]["state"]["types"][0], RECORD_TYPE);
    }
}
