//! Replicated itinerary state machine.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use super::{Itinerary, KvCommand, PaxosValue};

use crate::userdb::{User, UserDirectory};

use tokio::sync::Mutex;

/// Reply to a non-owner's SHARE attempt.
const NOT_OWNER_MSG: &str =
    "You're not the Owner of this itinerary, so you can't share it with other users!";

/// Number of most recent request results remembered for deduplication.
const APPLIED_CAPACITY: usize = 4096;

/// State guarded by the store mutex.
#[derive(Debug, Default)]
struct StoreState {
    /// Itinerary id -> record.
    itineraries: HashMap<String, Itinerary>,

    /// Request id -> result of the most recently applied values, so that a
    /// repeated learn returns the first result without mutating again.
    applied: HashMap<String, String>,

    /// Request ids in `applied`, oldest first.
    applied_order: VecDeque<String>,
}

impl StoreState {
    /// Remembers the result of a request, forgetting the oldest one once
    /// `APPLIED_CAPACITY` are held.
    fn remember(&mut self, request_id: &str, result: &str) {
        if self
            .applied
            .insert(request_id.into(), result.into())
            .is_none()
        {
            self.applied_order.push_back(request_id.into());
        }
        while self.applied_order.len() > APPLIED_CAPACITY {
            if let Some(oldest) = self.applied_order.pop_front() {
                self.applied.remove(&oldest);
            }
        }
    }
}

/// Itinerary store of one replica. Every mutation happens under the store
/// mutex; owner/sharee bookkeeping on users additionally takes the
/// directory lock, always after the store lock.
pub struct KeyValueStore {
    /// Node name used as logging prefix.
    me: String,

    state: Mutex<StoreState>,

    /// Co-located user directory.
    directory: Arc<UserDirectory>,
}

/// GET/EDIT/DELETE are permitted to the owner, to anyone in the record's
/// sharee list, and to anyone in the owner's sharee map entry for it.
fn authorized(
    itinerary: &Itinerary,
    actor: &str,
    users: &HashMap<String, User>,
) -> bool {
    itinerary.owner == actor
        || itinerary.sharees.iter().any(|s| s == actor)
        || users
            .get(&itinerary.owner)
            .map(|owner| owner.shares_with(&itinerary.id, actor))
            .unwrap_or(false)
}

impl KeyValueStore {
    /// Creates an empty store backed by the given user directory.
    pub fn new(me: impl ToString, directory: Arc<UserDirectory>) -> Self {
        KeyValueStore {
            me: me.to_string(),
            state: Mutex::new(StoreState::default()),
            directory,
        }
    }

    /// Applies a learned value to key `key`, at most once per request id.
    /// Returns the reply message.
    pub async fn apply(&self, key: &str, value: &PaxosValue) -> String {
        let mut state = self.state.lock().await;
        if let Some(result) = state.applied.get(&value.request_id) {
            pf_debug!(self.me; "request {} on key {} already applied",
                               value.request_id, key);
            return result.clone();
        }

        let mut users = self.directory.lock().await;
        let itineraries = &mut state.itineraries;
        let actor = value.actor.as_str();

        let result = match &value.command {
            KvCommand::Insert { itinerary } if itinerary.is_edit() => {
                match itineraries.get_mut(key) {
                    None => "Itinerary Not found".into(),
                    Some(stored) if !authorized(stored, actor, &users) => {
                        "No Authorization Access".into()
                    }
                    Some(stored) if stored.version != itinerary.version => {
                        pf_debug!(self.me; "edit of key {} based on version {} \
                                           but stored is {}",
                                           key, itinerary.version, stored.version);
                        "Itinerary version conflict".into()
                    }
                    Some(stored) => {
                        stored.name = itinerary.name.clone();
                        stored.location = itinerary.location.clone();
                        stored.start_date = itinerary.start_date.clone();
                        stored.end_date = itinerary.end_date.clone();
                        stored.description = itinerary.description.clone();
                        stored.version += 1;
                        stored.prev_id = Some(key.into());
                        pf_debug!(self.me; "edited key {} to version {}",
                                           key, stored.version);
                        key.to_string()
                    }
                }
            }

            KvCommand::Insert { itinerary } => {
                if !itineraries.contains_key(key) {
                    let record = Itinerary {
                        id: key.into(),
                        owner: actor.into(),
                        sharees: vec![],
                        version: 1,
                        prev_id: None,
                        ..itinerary.clone()
                    };
                    if let Some(owner) = users.get_mut(actor) {
                        owner.add_created(key);
                    }
                    itineraries.insert(key.into(), record);
                    pf_debug!(self.me; "created key {} for {}", key, actor);
                }
                key.to_string()
            }

            KvCommand::Delete => match itineraries.get(key) {
                None => "Key Not Found".into(),
                Some(stored) if !authorized(stored, actor, &users) => {
                    "No Authorization Access".into()
                }
                Some(_) => {
                    if let Some(removed) = itineraries.remove(key) {
                        for email in
                            std::iter::once(&removed.owner).chain(&removed.sharees)
                        {
                            if let Some(user) = users.get_mut(email) {
                                user.unlink(key);
                            }
                        }
                    }
                    pf_debug!(self.me; "deleted key {}", key);
                    "Deleted".into()
                }
            },

            KvCommand::Edit => match itineraries.get(key) {
                None => "Itinerary Not found".into(),
                Some(stored) if !authorized(stored, actor, &users) => {
                    "No Authorization Access".into()
                }
                Some(_) => "Update Itinerary Details".into(),
            },

            KvCommand::Share { sharee } => match itineraries.get_mut(key) {
                None => "Itinerary Not found".into(),
                Some(_) if !users.contains_key(sharee) => "No User Found".into(),
                Some(stored) if stored.owner == *sharee => {
                    "Cannot share to own self.".into()
                }
                Some(stored) if stored.owner != actor => NOT_OWNER_MSG.into(),
                Some(stored) if stored.sharees.contains(sharee) => {
                    "Itinerary is Already Shared".into()
                }
                Some(stored) => {
                    stored.sharees.push(sharee.clone());
                    if let Some(owner) = users.get_mut(actor) {
                        owner.add_sharee(key, sharee);
                    }
                    if let Some(user) = users.get_mut(sharee) {
                        user.add_shared_with_me(key);
                    }
                    pf_debug!(self.me; "shared key {} with {}", key, sharee);
                    "Itinerary Successfully Shared".into()
                }
            },
        };

        state.remember(&value.request_id, &result);
        result
    }

    /// True if the value carrying `request_id` has been applied here.
    pub async fn was_applied(&self, request_id: &str) -> bool {
        self.state.lock().await.applied.contains_key(request_id)
    }

    /// Authorized read of one itinerary.
    pub async fn get(&self, id: &str, actor: &str) -> String {
        let state = self.state.lock().await;
        let users = self.directory.lock().await;
        match state.itineraries.get(id) {
            None => "Itinerary Not found".into(),
            Some(itinerary) if authorized(itinerary, actor, &users) => {
                itinerary.to_string()
            }
            Some(_) => {
                pf_debug!(self.me; "{} has no access to key {}", actor, id);
                "No Authorization Access".into()
            }
        }
    }

    /// Itineraries owned by `actor`, each with the emails it is shared with.
    pub async fn list_created(&self, actor: &str) -> String {
        let users = self.directory.lock().await;
        match users.get(actor) {
            None => "User Not found".into(),
            Some(user) => {
                let entries: Vec<String> = user
                    .sharee_map
                    .iter()
                    .map(|(id, sharees)| format!("{}=[{}]", id, sharees.join(", ")))
                    .collect();
                format!("{{{}}}", entries.join(", "))
            }
        }
    }

    /// Itineraries other users shared with `actor`.
    pub async fn list_collab(&self, actor: &str) -> String {
        let users = self.directory.lock().await;
        match users.get(actor) {
            None => "User Not found".into(),
            Some(user) => {
                let mut ids = user.shared_with_me.clone();
                ids.sort();
                format!("[{}]", ids.join(", "))
            }
        }
    }

    /// Snapshot copy of one itinerary.
    pub async fn itinerary(&self, id: &str) -> Option<Itinerary> {
        self.state.lock().await.itineraries.get(id).cloned()
    }

    /// Number of itineraries stored.
    pub async fn count(&self) -> usize {
        self.state.lock().await.itineraries.len()
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;
    use crate::userdb::DirectoryOp;

    async fn store_with_users(emails: &[&str]) -> KeyValueStore {
        let directory = Arc::new(UserDirectory::new("UserDB2PC0"));
        for email in emails {
            directory
                .apply(&DirectoryOp::SignUp {
                    name: email.to_string(),
                    email: email.to_string(),
                    password: "pw".into(),
                })
                .await;
        }
        KeyValueStore::new("KVS0", directory)
    }

    fn paris() -> Itinerary {
        Itinerary {
            name: "Paris Trip".into(),
            location: "Paris".into(),
            start_date: "2024-05-01".into(),
            end_date: "2024-05-07".into(),
            description: "museums".into(),
            ..Default::default()
        }
    }

    fn insert(actor: &str, itinerary: Itinerary) -> PaxosValue {
        PaxosValue::new(actor, KvCommand::Insert { itinerary })
    }

    fn share(actor: &str, sharee: &str) -> PaxosValue {
        PaxosValue::new(
            actor,
            KvCommand::Share {
                sharee: sharee.into(),
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_and_get() {
        let store = store_with_users(&["ann@x.com", "bob@x.com"]).await;
        assert_eq!(store.apply("t1", &insert("ann@x.com", paris())).await, "t1");
        let stored = store.itinerary("t1").await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.owner, "ann@x.com");
        assert!(store.get("t1", "ann@x.com").await.contains("Name: Paris Trip"));
        assert_eq!(store.get("t1", "bob@x.com").await, "No Authorization Access");
        assert_eq!(store.get("t2", "ann@x.com").await, "Itinerary Not found");
        assert_eq!(store.list_created("ann@x.com").await, "{t1=[]}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn share_rules() {
        let store = store_with_users(&["ann@x.com", "bob@x.com", "cat@x.com"]).await;
        store.apply("t1", &insert("ann@x.com", paris())).await;

        assert_eq!(
            store.apply("t1", &share("bob@x.com", "cat@x.com")).await,
            NOT_OWNER_MSG
        );
        assert!(store.itinerary("t1").await.unwrap().sharees.is_empty());
        assert_eq!(
            store.apply("t1", &share("ann@x.com", "ann@x.com")).await,
            "Cannot share to own self."
        );
        assert_eq!(
            store.apply("t1", &share("ann@x.com", "zed@x.com")).await,
            "No User Found"
        );
        assert_eq!(
            store.apply("t9", &share("ann@x.com", "bob@x.com")).await,
            "Itinerary Not found"
        );
        assert_eq!(
            store.apply("t1", &share("ann@x.com", "bob@x.com")).await,
            "Itinerary Successfully Shared"
        );
        assert_eq!(
            store.apply("t1", &share("ann@x.com", "bob@x.com")).await,
            "Itinerary is Already Shared"
        );

        // sharee can now read but still not share further
        assert!(store.get("t1", "bob@x.com").await.starts_with("Itinerary Details"));
        assert_eq!(
            store.apply("t1", &share("bob@x.com", "cat@x.com")).await,
            NOT_OWNER_MSG
        );
        assert_eq!(store.list_created("ann@x.com").await, "{t1=[bob@x.com]}");
        assert_eq!(store.list_collab("bob@x.com").await, "[t1]");
        assert_eq!(store.list_collab("nobody@x.com").await, "User Not found");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_repeated() {
        let store = store_with_users(&["ann@x.com", "bob@x.com"]).await;
        store.apply("t1", &insert("ann@x.com", paris())).await;
        store.apply("t1", &share("ann@x.com", "bob@x.com")).await;

        let delete = PaxosValue::new("ann@x.com", KvCommand::Delete);
        assert_eq!(store.apply("t1", &delete).await, "Deleted");
        // same learned value delivered again
        assert_eq!(store.apply("t1", &delete).await, "Deleted");
        // a distinct delete of the now absent key
        let again = PaxosValue::new("ann@x.com", KvCommand::Delete);
        assert_eq!(store.apply("t1", &again).await, "Key Not Found");
        assert_eq!(store.count().await, 0);
        assert_eq!(store.list_created("ann@x.com").await, "{}");
        assert_eq!(store.list_collab("bob@x.com").await, "[]");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn delete_unauthorized() {
        let store = store_with_users(&["ann@x.com", "bob@x.com"]).await;
        store.apply("t1", &insert("ann@x.com", paris())).await;
        let delete = PaxosValue::new("bob@x.com", KvCommand::Delete);
        assert_eq!(store.apply("t1", &delete).await, "No Authorization Access");
        assert_eq!(store.count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn edit_versions() {
        let store = store_with_users(&["ann@x.com", "bob@x.com"]).await;
        store.apply("t1", &insert("ann@x.com", paris())).await;
        store.apply("t1", &share("ann@x.com", "bob@x.com")).await;

        let prompt = PaxosValue::new("bob@x.com", KvCommand::Edit);
        assert_eq!(store.apply("t1", &prompt).await, "Update Itinerary Details");

        let edited = Itinerary {
            name: "Paris & Lyon".into(),
            version: 1,
            prev_id: Some("t1".into()),
            ..paris()
        };
        let edit = insert("bob@x.com", edited.clone());
        assert_eq!(store.apply("t1", &edit).await, "t1");
        assert_eq!(store.apply("t1", &edit).await, "t1");
        let stored = store.itinerary("t1").await.unwrap();
        assert_eq!(stored.version, 2);
        assert_eq!(stored.name, "Paris & Lyon");
        assert_eq!(stored.owner, "ann@x.com");
        assert_eq!(stored.sharees, vec!["bob@x.com".to_string()]);

        // stale base version
        let stale = insert("ann@x.com", edited);
        assert_eq!(store.apply("t1", &stale).await, "Itinerary version conflict");
        assert_eq!(store.itinerary("t1").await.unwrap().version, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn applied_results_bounded() {
        let store = store_with_users(&["ann@x.com"]).await;
        let first = insert("ann@x.com", paris());
        store.apply("t0", &first).await;
        assert!(store.was_applied(&first.request_id).await);

        for i in 0..5000 {
            let key = format!("t{}", i + 1);
            assert_eq!(store.apply(&key, &insert("ann@x.com", paris())).await, key);
            let delete = PaxosValue::new("ann@x.com", KvCommand::Delete);
            assert_eq!(store.apply(&key, &delete).await, "Deleted");
        }

        let state = store.state.lock().await;
        assert_eq!(state.applied.len(), APPLIED_CAPACITY);
        assert_eq!(state.applied_order.len(), APPLIED_CAPACITY);
        assert!(!state.applied.contains_key(&first.request_id));
        assert_eq!(state.itineraries.len(), 1);
    }
}
