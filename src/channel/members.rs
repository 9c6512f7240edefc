use std::collections::HashMap;

use serde::ser::SerializeStruct as _;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// A presence channel member.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Member {
    pub id: String,
    pub info: Value,
}

/// Members of a presence channel, as last reported by the service.
///
/// Emptied whenever the channel loses its subscription; the local member's id
/// obtained during authorization is kept so it can be found again after the
/// resubscription.
#[derive(Debug, Clone, Default)]
pub struct Members {
    members: HashMap<String, Value>,
    count: usize,
    my_id: Option<String>,
    me: Option<Member>,
}

/// Serialized as the `pusher:subscription_succeeded` payload of presence channels.
impl Serialize for Members {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Members", 3)?;
        state.serialize_field("count", &self.count)?;
        state.serialize_field("me", &self.me)?;
        state.serialize_field("members", &self.members)?;
        state.end()
    }
}

#[derive(Debug, Deserialize)]
struct Subscription {
    presence: Presence,
}

#[derive(Debug, Deserialize)]
struct Presence {
    #[serde(default)]
    hash: HashMap<String, Value>,
    #[serde(default)]
    count: usize,
}

/// User ids are strings on the wire but applications commonly send numbers.
pub(crate) fn user_id(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

impl Members {
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// The local member, once the subscription succeeded.
    #[must_use]
    pub fn me(&self) -> Option<&Member> {
        self.me.as_ref()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Member> {
        self.members.get(id).map(|info| Member {
            id: id.to_owned(),
            info: info.clone(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Member> + '_ {
        self.members.iter().map(|(id, info)| Member {
            id: id.clone(),
            info: info.clone(),
        })
    }

    pub(crate) fn set_my_id(&mut self, id: String) {
        self.my_id = Some(id);
    }

    /// Seed from `pusher_internal:subscription_succeeded`.
    pub(crate) fn on_subscription(&mut self, data: &Value) {
        let Ok(Subscription { presence }) = Subscription::deserialize(data) else {
            #[cfg(feature = "tracing")]
            tracing::warn!(%data, "Presence subscription without member data");
            return;
        };

        self.members = presence.hash;
        self.count = presence.count;
        self.me = self.my_id.as_deref().and_then(|id| self.get(id));
    }

    /// Apply `pusher_internal:member_added`. Re-adding a known member only updates
    /// its info.
    pub(crate) fn add(&mut self, data: &Value) -> Option<Member> {
        let id = user_id(data.get("user_id")?)?;
        let info = data.get("user_info").cloned().unwrap_or_default();

        if self.members.insert(id.clone(), info).is_none() {
            self.count += 1;
        }
        self.get(&id)
    }

    /// Apply `pusher_internal:member_removed`, returning the member that left.
    pub(crate) fn remove(&mut self, data: &Value) -> Option<Member> {
        let id = user_id(data.get("user_id")?)?;
        let member = self.get(&id)?;

        self.members.remove(&id);
        self.count = self.count.saturating_sub(1);
        Some(member)
    }

    pub(crate) fn reset(&mut self) {
        self.members.clear();
        self.count = 0;
        self.me = None;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn seeded() -> Members {
        let mut members = Members::default();
        members.set_my_id("42".to_owned());
        members.on_subscription(&json!({
            "presence": { "hash": { "42": { "name": "a" } }, "count": 1 },
        }));
        members
    }

    #[test]
    fn subscription_seeds_members_and_me() {
        let members = seeded();

        assert_eq!(members.count(), 1);
        assert_eq!(members.me().unwrap().id, "42");
        assert_eq!(members.me().unwrap().info, json!({ "name": "a" }));
    }

    #[test]
    fn duplicate_add_does_not_count_twice() {
        let mut members = seeded();

        members.add(&json!({ "user_id": 7, "user_info": { "name": "b" } }));
        let updated = members.add(&json!({ "user_id": "7", "user_info": { "name": "c" } }));

        assert_eq!(members.count(), 2);
        assert_eq!(updated.unwrap().info, json!({ "name": "c" }));
    }

    #[test]
    fn remove_returns_member_and_decrements() {
        let mut members = seeded();

        let removed = members.remove(&json!({ "user_id": "42" })).unwrap();
        assert_eq!(removed.info, json!({ "name": "a" }));
        assert_eq!(members.count(), 0);

        assert!(members.remove(&json!({ "user_id": "42" })).is_none());
        assert_eq!(members.count(), 0);
    }

    #[test]
    fn reset_keeps_my_id_for_resubscription() {
        let mut members = seeded();
        members.reset();

        assert_eq!(members.count(), 0);
        assert!(members.me().is_none());
        assert_eq!(members.iter().count(), 0);

        members.on_subscription(&json!({
            "presence": { "hash": { "42": {}, "43": {} }, "count": 2 },
        }));
        assert_eq!(members.me().unwrap().id, "42");
    }
}
