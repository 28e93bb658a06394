//! Replica identity helpers.

/// Server replica ID type.
pub type ReplicaId = u8;

/// Registry name of the itinerary store replica with given ID.
pub fn kv_server_name(id: ReplicaId) -> String {
    format!("KVS{}", id)
}

/// Registry name of the user directory replica with given ID.
pub fn userdb_server_name(id: ReplicaId) -> String {
    format!("UserDB2PC{}", id)
}
