//! Client operation tokens and the payload carried through Paxos.

use super::Itinerary;

use crate::paxos::OpKind;
use crate::utils::TripStoreError;

use serde::{Deserialize, Serialize};

/// Maximum length of a sharee email in a SHARE request.
const MAX_SHAREE_LEN: usize = 40;

/// A validated client request against the itinerary store.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum KvOperation {
    /// Asks the client for itinerary details; the record itself arrives
    /// through `put_itinerary()`.
    Put,

    Get { id: String },

    Delete { id: String },

    Edit { id: String },

    Share { id: String, sharee: String },

    ListCreated,

    ListCollab,
}

impl KvOperation {
    /// Parses a pipe-delimited `OP|arg...` message. On invalid input,
    /// returns the message to reply with.
    pub fn parse(message: &str) -> Result<Self, String> {
        let tokens: Vec<&str> = message.trim().split('|').collect();
        let op = tokens[0].to_ascii_uppercase();

        match tokens.len() {
            1 => match op.as_str() {
                "PUT" => Ok(KvOperation::Put),
                _ => Err(format!(
                    "Invalid operation: {}. Only PUT is supported with \
                     Single operand.",
                    tokens[0]
                )),
            },

            2 => {
                let id = tokens[1].to_string();
                match op.as_str() {
                    "GET" => Ok(KvOperation::Get { id }),
                    "DELETE" => Ok(KvOperation::Delete { id }),
                    "EDIT" => Ok(KvOperation::Edit { id }),
                    "LIST" => match tokens[1].to_ascii_uppercase().as_str() {
                        "CREATED" => Ok(KvOperation::ListCreated),
                        "COLLAB" => Ok(KvOperation::ListCollab),
                        _ => Err(format!(
                            "Invalid operation: {} {}. Only CREATED and \
                             COLLAB are supported with LIST operands.",
                            tokens[0], tokens[1]
                        )),
                    },
                    _ => Err(format!(
                        "Invalid operation: {}. Only GET, DELETE, EDIT, and \
                         LIST are supported with Two operands.",
                        tokens[0]
                    )),
                }
            }

            3 => match op.as_str() {
                "SHARE" if tokens[2].len() > MAX_SHAREE_LEN => {
                    Err("Invalid token input".into())
                }
                "SHARE" => Ok(KvOperation::Share {
                    id: tokens[1].into(),
                    sharee: tokens[2].into(),
                }),
                _ => Err(format!(
                    "Invalid operation: {}. Only SHARE is supported with \
                     Three operands.",
                    tokens[0]
                )),
            },

            _ => Err("Invalid number of operands in the request. Only PUT, \
                      GET, DELETE, EDIT, SHARE, and LIST are supported as \
                      operations."
                .into()),
        }
    }
}

/// The state machine command inside a Paxos value.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    /// Create a new itinerary, or rewrite the one named by `prev_id`.
    Insert { itinerary: Itinerary },

    Delete,

    Edit,

    Share { sharee: String },
}

impl KvCommand {
    /// Operation kind this command is learned under.
    pub fn kind(&self) -> OpKind {
        match self {
            KvCommand::Insert { .. } => OpKind::Put,
            KvCommand::Delete => OpKind::Delete,
            KvCommand::Edit => OpKind::Edit,
            KvCommand::Share { .. } => OpKind::Share,
        }
    }
}

/// Value agreed upon by one Paxos instance. Carries the acting user so
/// that every replica reaches the same authorization verdict, and a
/// request id that makes repeated deliveries apply at most once.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PaxosValue {
    pub request_id: String,

    pub actor: String,

    pub command: KvCommand,
}

impl PaxosValue {
    /// Wraps `command` under a freshly generated request id.
    pub fn new(actor: &str, command: KvCommand) -> Self {
        PaxosValue {
            request_id: uuid::Uuid::new_v4().to_string(),
            actor: actor.into(),
            command,
        }
    }

    /// JSON form, opaque to consensus.
    pub fn encode(&self) -> Result<String, TripStoreError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(value: &str) -> Result<Self, TripStoreError> {
        Ok(serde_json::from_str(value)?)
    }
}
