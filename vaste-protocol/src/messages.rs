//! JSON messages carried on text frames.
//!
//! Tags are snake_case; payload fields keep the wire's camelCase names
//! where the contract fixes them (`actionId`, `chunkKey`, `blockType`,
//! `playerId`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vaste_utils::ChunkPos;

use crate::error::ProtocolError;

/// An inclusive sequence-number range in a resume manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeqRange {
    /// First covered sequence number.
    pub from: u32,
    /// Last covered sequence number, inclusive.
    pub to: u32,
}

impl SeqRange {
    /// Whether `seq` falls inside this range.
    #[must_use]
    pub const fn contains(&self, seq: u32) -> bool {
        self.from <= seq && seq <= self.to
    }
}

/// A message received from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The authentication handshake; the only message accepted pre-auth.
    AuthInfo {
        /// Bearer token to validate against the account service.
        token: String,
    },
    /// Resume manifest of frames the client already applied.
    ChunkHave {
        /// Individual sequence numbers.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        seqs: Vec<u32>,
        /// Compacted inclusive ranges.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        ranges: Vec<SeqRange>,
    },
    /// Acknowledges one delivered chunk frame.
    ChunkAck {
        /// Redundant human-readable key, `cx,cy,cz:version:seq`.
        #[serde(rename = "chunkKey")]
        chunk_key: String,
        /// The acknowledged frame sequence number.
        seq: u32,
    },
    /// Player position update.
    PlayerMove {
        /// World x.
        x: f64,
        /// World y.
        y: f64,
        /// World z.
        z: f64,
    },
    /// Break the block at the given coordinates.
    BreakBlock {
        /// World x.
        x: i32,
        /// World y.
        y: i32,
        /// World z.
        z: i32,
        /// Client-chosen id correlating the authoritative response.
        #[serde(rename = "actionId")]
        action_id: String,
    },
    /// Place a block at the given coordinates.
    PlaceBlock {
        /// World x.
        x: i32,
        /// World y.
        y: i32,
        /// World z.
        z: i32,
        /// Block type to place; defaults to 1 when absent.
        #[serde(rename = "blockType", skip_serializing_if = "Option::is_none")]
        block_type: Option<u16>,
        /// Client-chosen id correlating the authoritative response.
        #[serde(rename = "actionId")]
        action_id: String,
    },
}

impl ClientMessage {
    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// A single authoritative cell update inside a [`ServerMessage::BlockPatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockPatchEntry {
    /// World x.
    pub x: i32,
    /// World y.
    pub y: i32,
    /// World z.
    pub z: i32,
    /// The authoritative block type now at the cell.
    #[serde(rename = "type")]
    pub block_type: u16,
    /// The originating action, when the patch reasserts one.
    #[serde(rename = "actionId", skip_serializing_if = "Option::is_none")]
    pub action_id: Option<String>,
}

/// A message sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once after a successful handshake.
    WorldInit {
        /// The verified account id of the player.
        #[serde(rename = "playerId")]
        player_id: String,
        /// World extent hint for the client.
        #[serde(rename = "worldSize")]
        world_size: u32,
    },
    /// Minimal authoritative cell updates.
    BlockPatch {
        /// The updated cells.
        patches: Vec<BlockPatchEntry>,
    },
    /// Authoritative outcome of a block action.
    BlockActionResult {
        /// The id the client attached to the action.
        #[serde(rename = "actionId")]
        action_id: String,
        /// Whether the mutation was committed.
        success: bool,
        /// Failure reason when `success` is false.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        /// Echoed x coordinate on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        x: Option<i32>,
        /// Echoed y coordinate on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        y: Option<i32>,
        /// Echoed z coordinate on success.
        #[serde(skip_serializing_if = "Option::is_none")]
        z: Option<i32>,
    },
    /// A player joined the world.
    PlayerJoined {
        /// Session id of the joining player.
        id: u64,
        /// Display name.
        username: String,
        /// Spawn x.
        x: f64,
        /// Spawn y.
        y: f64,
        /// Spawn z.
        z: f64,
    },
    /// A player moved. One broadcast per actual position change.
    PlayerMove {
        /// Session id of the moving player.
        id: u64,
        /// World x.
        x: f64,
        /// World y.
        y: f64,
        /// World z.
        z: f64,
    },
    /// Synonym of [`ServerMessage::PlayerMove`] kept for older peers;
    /// receivers treat both identically.
    PlayerUpdate {
        /// Session id of the moving player.
        id: u64,
        /// World x.
        x: f64,
        /// World y.
        y: f64,
        /// World z.
        z: f64,
    },
    /// A player left the world.
    PlayerDisconnect {
        /// Session id of the departed player.
        id: u64,
    },
    /// Forces the client to a position.
    Teleport {
        /// World x.
        x: f64,
        /// World y.
        y: f64,
        /// World z.
        z: f64,
    },
}

impl ServerMessage {
    /// Serializes to a text frame.
    ///
    /// # Panics
    /// Never: every variant serializes.
    #[must_use]
    pub fn to_json(&self) -> String {
        #[allow(clippy::unwrap_used)]
        serde_json::to_string(self).unwrap()
    }
}

/// The redundant chunk ack key, `cx,cy,cz:version:seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAckKey {
    /// The acknowledged chunk.
    pub pos: ChunkPos,
    /// The applied chunk version.
    pub version: u32,
    /// The acknowledged frame sequence number.
    pub seq: u32,
}

impl fmt::Display for ChunkAckKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.pos, self.version, self.seq)
    }
}

impl FromStr for ChunkAckKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ProtocolError::MalformedAckKey(s.to_string());

        let mut sections = s.split(':');
        let coords = sections.next().ok_or_else(malformed)?;
        let version = sections.next().ok_or_else(malformed)?;
        let seq = sections.next().ok_or_else(malformed)?;
        if sections.next().is_some() {
            return Err(malformed());
        }

        let mut axes = coords.split(',');
        let mut axis = || -> Result<i32, ProtocolError> {
            axes.next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(malformed)
        };
        let pos = ChunkPos::new(axis()?, axis()?, axis()?);

        Ok(Self {
            pos,
            version: version.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_tags() {
        let msg = ClientMessage::parse(r#"{"type":"auth_info","token":"abc"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::AuthInfo {
                token: "abc".to_string()
            }
        );

        let msg = ClientMessage::parse(
            r#"{"type":"place_block","x":1,"y":2,"z":0,"blockType":1,"actionId":"a-1"}"#,
        )
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::PlaceBlock {
                x: 1,
                y: 2,
                z: 0,
                block_type: Some(1),
                action_id: "a-1".to_string()
            }
        );
    }

    #[test]
    fn chunk_have_accepts_seqs_or_ranges() {
        let msg = ClientMessage::parse(r#"{"type":"chunk_have","seqs":[1,2,9]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ChunkHave {
                seqs: vec![1, 2, 9],
                ranges: Vec::new()
            }
        );

        let msg =
            ClientMessage::parse(r#"{"type":"chunk_have","ranges":[{"from":3,"to":8}]}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::ChunkHave {
                seqs: Vec::new(),
                ranges: vec![SeqRange { from: 3, to: 8 }]
            }
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(ClientMessage::parse(r#"{"type":"make_coffee"}"#).is_err());
    }

    #[test]
    fn server_message_wire_fields() {
        let json = ServerMessage::WorldInit {
            player_id: "u-1".to_string(),
            world_size: 1024,
        }
        .to_json();
        assert!(json.contains(r#""type":"world_init""#));
        assert!(json.contains(r#""playerId":"u-1""#));
        assert!(json.contains(r#""worldSize":1024"#));

        let json = ServerMessage::BlockPatch {
            patches: vec![BlockPatchEntry {
                x: 1,
                y: 2,
                z: 0,
                block_type: 1,
                action_id: Some("a-1".to_string()),
            }],
        }
        .to_json();
        assert!(json.contains(r#""type":"block_patch""#));
        // The inner patch entry's block type also rides under "type".
        assert!(json.contains(r#""type":1"#));
        assert!(json.contains(r#""actionId":"a-1""#));
    }

    #[test]
    fn ack_key_roundtrip() {
        let key = ChunkAckKey {
            pos: ChunkPos::new(-2, 0, 5),
            version: 3,
            seq: 17,
        };
        assert_eq!(key.to_string(), "-2,0,5:3:17");
        assert_eq!(key.to_string().parse::<ChunkAckKey>().unwrap(), key);

        assert!("1,2:3:4".parse::<ChunkAckKey>().is_err());
        assert!("1,2,3:nope:4".parse::<ChunkAckKey>().is_err());
    }
}
