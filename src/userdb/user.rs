//! User account record.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One account of the user directory, keyed by email.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct User {
    pub name: String,

    pub email: String,

    pub password: String,

    pub logged_in: bool,

    /// Ids of itineraries this user owns.
    pub created: Vec<String>,

    /// Ids of itineraries other users shared with this user.
    pub shared_with_me: Vec<String>,

    /// Owner's view: owned itinerary id -> emails it is shared with.
    pub sharee_map: BTreeMap<String, Vec<String>>,
}

impl User {
    /// A freshly signed-up user, logged in right away.
    pub fn new(name: &str, email: &str, password: &str) -> Self {
        User {
            name: name.into(),
            email: email.into(),
            password: password.into(),
            logged_in: true,
            created: vec![],
            shared_with_me: vec![],
            sharee_map: BTreeMap::new(),
        }
    }

    /// Registers an itinerary created by this user.
    pub fn add_created(&mut self, id: &str) {
        if !self.created.iter().any(|c| c == id) {
            self.created.push(id.into());
        }
        self.sharee_map.entry(id.into()).or_default();
    }

    /// Records that `sharee` got access to my itinerary `id`.
    pub fn add_sharee(&mut self, id: &str, sharee: &str) {
        let sharees = self.sharee_map.entry(id.into()).or_default();
        if !sharees.iter().any(|s| s == sharee) {
            sharees.push(sharee.into());
        }
    }

    /// Records that itinerary `id` was shared with me.
    pub fn add_shared_with_me(&mut self, id: &str) {
        if !self.shared_with_me.iter().any(|s| s == id) {
            self.shared_with_me.push(id.into());
        }
    }

    /// Forgets every link to itinerary `id`.
    pub fn unlink(&mut self, id: &str) {
        self.created.retain(|c| c != id);
        self.shared_with_me.retain(|s| s != id);
        self.sharee_map.remove(id);
    }

    /// Does my sharee map grant `email` access to itinerary `id`?
    pub fn shares_with(&self, id: &str, email: &str) -> bool {
        self.sharee_map
            .get(id)
            .map(|sharees| sharees.iter().any(|s| s == email))
            .unwrap_or(false)
    }
}
