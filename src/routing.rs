//! Routing conventions and shared message types.
//!
//! Client and server processes agree on a small set of exchanges, routing
//! key prefixes and payload types. Routing keys are dot-delimited: a category
//! prefix followed by a username for targeted messages (`army_moves.alice`),
//! or by `*` for subscriptions that want every instance (`army_moves.*`).
//!
//! Payload field names are PascalCase on the wire so JSON payloads stay
//! readable by non-Rust peers of the game.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Direct exchange for control signals (pause / resume).
pub const EXCHANGE_PERIL_DIRECT: &str = "peril_direct";

/// Topic exchange for game events.
pub const EXCHANGE_PERIL_TOPIC: &str = "peril_topic";

/// Prefix of army move routing keys.
pub const ARMY_MOVES_PREFIX: &str = "army_moves";

/// Prefix of war recognition routing keys.
pub const WAR_RECOGNITIONS_PREFIX: &str = "war";

/// Routing key of pause signals.
pub const PAUSE_KEY: &str = "pause";

/// Prefix of game log routing keys.
pub const GAME_LOG_SLUG: &str = "game_logs";

/// `<prefix>.<username>`
pub fn key(prefix: &str, username: &str) -> String {
    format!("{prefix}.{username}")
}

/// `<prefix>.*`
pub fn wildcard(prefix: &str) -> String {
    format!("{prefix}.*")
}

/// Pause / resume signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayingState {
    pub is_paused: bool,
}

/// Map locations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Americas,
    Europe,
    Africa,
    Asia,
    Antarctica,
    Australia,
}

/// Unit ranks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitRank {
    Infantry,
    Cavalry,
    Artillery,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Unit {
    #[serde(rename = "ID")]
    pub id: u32,
    pub rank: UnitRank,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Player {
    pub username: String,
    pub units: HashMap<u32, Unit>,
}

impl Player {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            units: HashMap::new(),
        }
    }
}

/// A player moving units to a location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArmyMove {
    pub player: Player,
    pub units: Vec<Unit>,
    pub to_location: Location,
}

/// Published when two players' armies meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecognitionOfWar {
    pub attacker: Player,
    pub defender: Player,
}

/// A line for the server's game log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GameLog {
    pub current_time: SystemTime,
    pub message: String,
    pub username: String,
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Codec, PubSubError};

    fn unit(id: u32, rank: UnitRank) -> Unit {
        Unit {
            id,
            rank,
            location: Location::Europe,
        }
    }

    fn army_move() -> ArmyMove {
        let mut player = Player::new("alice");
        player.units.insert(1, unit(1, UnitRank::Infantry));
        player.units.insert(2, unit(2, UnitRank::Cavalry));

        ArmyMove {
            units: vec![unit(1, UnitRank::Infantry), unit(2, UnitRank::Cavalry)],
            player,
            to_location: Location::Asia,
        }
    }

    #[test]
    fn test_keys() {
        // ---
        assert_eq!(key(ARMY_MOVES_PREFIX, "alice"), "army_moves.alice");
        assert_eq!(wildcard(WAR_RECOGNITIONS_PREFIX), "war.*");
    }

    #[test]
    fn test_every_message_type_round_trips() {
        // ---
        let war = RecognitionOfWar {
            attacker: army_move().player,
            defender: Player::new("bob"),
        };
        let log = GameLog {
            current_time: SystemTime::now(),
            message: "alice won a war against bob".into(),
            username: "alice".into(),
        };
        let pause = PlayingState { is_paused: true };

        for codec in [Codec::Json, Codec::Bincode] {
            let bytes = codec.encode(&army_move()).unwrap();
            assert_eq!(codec.decode::<ArmyMove>(&bytes).unwrap(), army_move());

            let bytes = codec.encode(&war).unwrap();
            assert_eq!(codec.decode::<RecognitionOfWar>(&bytes).unwrap(), war);

            let bytes = codec.encode(&log).unwrap();
            assert_eq!(codec.decode::<GameLog>(&bytes).unwrap(), log);

            let bytes = codec.encode(&pause).unwrap();
            assert_eq!(codec.decode::<PlayingState>(&bytes).unwrap(), pause);
        }
    }

    #[test]
    fn test_json_wire_names() {
        // ---
        let bytes = Codec::Json.encode(&army_move()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(value["ToLocation"], "asia");
        assert_eq!(value["Player"]["Username"], "alice");
        assert!(value["Units"][0]["ID"].is_number());
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        // ---
        let bytes = Codec::Json.encode(&PlayingState { is_paused: true }).unwrap();
        let err = Codec::Json.decode::<ArmyMove>(&bytes).unwrap_err();
        assert!(matches!(err, PubSubError::Decode(_)));

        let bytes = Codec::Json
            .encode(&serde_json::json!({"Units": [], "ToLocation": "atlantis"}))
            .unwrap();
        assert!(Codec::Json.decode::<ArmyMove>(&bytes).is_err());
    }
}
