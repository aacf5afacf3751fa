//! Entities: one document in a named collection.
//!
//! An entity keeps the last document the server confirmed (its baseline)
//! apart from the changes made since. Changes are recorded as intents
//! (set, increment, push, ...) and folded into a single mutation document on
//! save; the server's answer then becomes the new baseline.
//!
//! Keys must not contain `$` or `.`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use indexmap::IndexMap;
use serde_json::{json, Map as JsonMap, Number, Value as Json};

use crate::cache::CachePolicy;
use crate::client::{spawn_callback, Client, Pending};
use crate::codec;
use crate::error::{Error, Result};
use crate::transport::{Method, Request, Response};
use crate::value::{add_numbers, Map, Reference, Value};

pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const CREATOR_ID_FIELD: &str = "creatorId";

pub const USERNAME_FIELD: &str = "username";
pub const PASSWORD_FIELD: &str = "password";

pub const LOGIN_PATH: &str = "login";
pub const LOGOUT_PATH: &str = "logout";
pub const ME_PATH: &str = "me";

/// A pending change to one key
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Set(Value),
    Increment(Number),
    Push(Value),
    PushAll(Vec<Value>),
    /// Not every Deployd version honors `$addToSet`.
    AddToSet(Value),
    AddAllToSet(Vec<Value>),
    PullAll(Vec<Value>),
}

impl Mutation {
    /// Wire operator, `None` for plain assignment.
    pub fn operator(&self) -> Option<&'static str> {
        match self {
            Mutation::Set(_) => None,
            Mutation::Increment(_) => Some("$inc"),
            Mutation::Push(_) => Some("$push"),
            Mutation::PushAll(_) => Some("$pushAll"),
            Mutation::AddToSet(_) | Mutation::AddAllToSet(_) => Some("$addToSet"),
            Mutation::PullAll(_) => Some("$pullAll"),
        }
    }

    /// Wire value for this change, given what earlier changes to the same
    /// key under the same operator produced.
    fn fold(&self, previous: Option<&Json>) -> Json {
        let list = |values: &[Value]| {
            let mut items = match previous {
                Some(Json::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            items.extend(values.iter().map(codec::encode));
            Json::Array(items)
        };
        match self {
            Mutation::Set(v) | Mutation::Push(v) | Mutation::AddToSet(v) => codec::encode(v),
            Mutation::Increment(n) => match previous {
                Some(Json::Number(total)) => Json::Number(add_numbers(total, n)),
                _ => Json::Number(n.clone()),
            },
            Mutation::AddAllToSet(vs) => {
                let each = vs.iter().map(codec::encode).collect();
                json!({ "$each": Json::Array(each) })
            }
            Mutation::PushAll(vs) | Mutation::PullAll(vs) => list(vs),
        }
    }
}

/// Operators in the order they appear in a mutation document.
const VERB_ORDER: [&str; 5] = ["$inc", "$push", "$pushAll", "$addToSet", "$pullAll"];

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidParams("key must not be empty".into()));
    }
    if key.contains('$') || key.contains('.') {
        return Err(Error::InvalidParams(format!(
            "key {:?} must not contain '$' or '.'",
            key
        )));
    }
    Ok(())
}

fn expect_document(body: Value) -> Result<Map> {
    match body {
        Value::Object(doc) => Ok(doc),
        other => Err(Error::InvalidResponse(format!(
            "expected an entity document, got {:?}",
            other
        ))),
    }
}

// Deployd event scripts often store seconds, the JS default is milliseconds.
fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Date(d) => Some(*d),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&Utc)),
        Value::Number(n) => match n.as_i64() {
            Some(n) if n.unsigned_abs() >= 100_000_000_000 => Utc.timestamp_millis_opt(n).single(),
            Some(n) => Utc.timestamp_opt(n, 0).single(),
            None => {
                let n = n.as_f64().filter(|n| n.is_finite())?;
                let millis = if n.abs() >= 1e11 { n } else { n * 1000.0 };
                DateTime::from_timestamp_millis(millis.round() as i64)
            }
        },
        _ => None,
    }
}

type Commit<T> = fn(&mut Entity, Response) -> Result<T>;

/// One document in a collection
#[derive(Clone)]
pub struct Entity {
    client: Client,
    entity_name: String,
    result_map: Map,
    pending: Vec<(String, Mutation)>,
    cache_policy: CachePolicy,
    max_cache_age: Duration,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("entity_name", &self.entity_name)
            .field("result_map", &self.result_map)
            .field("pending", &self.pending)
            .finish()
    }
}

impl Entity {
    /// New, unsaved entity.
    pub fn new(client: &Client, entity_name: impl Into<String>) -> Self {
        Self::from_document(client, entity_name, Map::new())
    }

    /// Entity whose baseline is a document the server returned.
    pub(crate) fn from_document(client: &Client, entity_name: impl Into<String>, doc: Map) -> Self {
        let config = client.config();
        Self {
            client: client.clone(),
            entity_name: entity_name.into(),
            result_map: doc,
            pending: Vec::new(),
            cache_policy: config.cache_policy,
            max_cache_age: config.max_cache_age,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn id(&self) -> Option<&str> {
        self.result_map.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn is_new(&self) -> bool {
        self.id().is_none()
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.result_map.get(CREATED_AT_FIELD).and_then(timestamp)
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.result_map.get(UPDATED_AT_FIELD).and_then(timestamp)
    }

    pub fn creator_id(&self) -> Option<&str> {
        self.result_map.get(CREATOR_ID_FIELD).and_then(Value::as_str)
    }

    /// Reference to this entity, once it has an id.
    pub fn reference(&self) -> Option<Reference> {
        self.id().map(|id| Reference::new(self.entity_name.clone(), id))
    }

    /// Last document confirmed by the server.
    pub fn result_map(&self) -> &Map {
        &self.result_map
    }

    /// Changes not yet saved, in the order they were made.
    pub fn pending(&self) -> &[(String, Mutation)] {
        &self.pending
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    pub fn set_cache_policy(&mut self, policy: CachePolicy) {
        self.cache_policy = policy;
    }

    pub fn set_max_cache_age(&mut self, max_age: Duration) {
        self.max_cache_age = max_age;
    }

    /// Value at `key`: an unsaved assignment if there is one, else the baseline.
    pub fn object_for_key(&self, key: &str) -> Option<&Value> {
        self.pending
            .iter()
            .rev()
            .find_map(|(k, m)| match m {
                Mutation::Set(v) if k == key => Some(v),
                _ => None,
            })
            .or_else(|| self.result_map.get(key))
    }

    fn record(&mut self, key: &str, mutation: Mutation) -> Result<()> {
        validate_key(key)?;
        self.pending.push((key.to_string(), mutation));
        Ok(())
    }

    pub fn set_object(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.record(key, Mutation::Set(value.into()))
    }

    /// Append to the list at `key`. The server creates the list if needed and
    /// fails the save if `key` holds something else.
    pub fn push_object(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.record(key, Mutation::Push(value.into()))
    }

    pub fn push_all_objects<I, T>(&mut self, key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.record(key, Mutation::PushAll(values))
    }

    /// Remove every occurrence of `value` from the list at `key`.
    pub fn pull_object(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.record(key, Mutation::PullAll(vec![value.into()]))
    }

    pub fn pull_all_objects<I, T>(&mut self, key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.record(key, Mutation::PullAll(values))
    }

    /// Append `value` to the list at `key` unless already present.
    pub fn add_object_to_set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.record(key, Mutation::AddToSet(value.into()))
    }

    /// Append each of `values` not already present, sent as `$each`.
    pub fn add_all_objects_to_set<I, T>(&mut self, key: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.record(key, Mutation::AddAllToSet(values))
    }

    pub fn increment_key(&mut self, key: &str) -> Result<()> {
        self.increment_key_by(key, 1)
    }

    /// Add `amount` (possibly negative) to the number at `key`.
    /// Increments made before a save add up.
    pub fn increment_key_by(&mut self, key: &str, amount: impl Into<Value>) -> Result<()> {
        match amount.into() {
            Value::Number(n) => self.record(key, Mutation::Increment(n)),
            other => Err(Error::InvalidParams(format!(
                "increment amount must be a number, got {:?}",
                other
            ))),
        }
    }

    /// Discard unsaved changes.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    /// Fold the pending changes into the wire mutation document.
    ///
    /// Assignments come first at the top level, followed by `$inc`, `$push`,
    /// `$pushAll`, `$addToSet` and `$pullAll`.
    pub fn mutation_document(&self) -> Json {
        let mut doc = JsonMap::new();
        let mut verbs: IndexMap<&str, JsonMap<String, Json>> =
            VERB_ORDER.iter().map(|op| (*op, JsonMap::new())).collect();

        for (key, mutation) in &self.pending {
            let target = match mutation.operator() {
                None => &mut doc,
                Some(op) => verbs.entry(op).or_default(),
            };
            let folded = mutation.fold(target.get(key.as_str()));
            target.insert(key.clone(), folded);
        }

        for (op, entries) in verbs {
            if !entries.is_empty() {
                doc.insert(op.to_string(), Json::Object(entries));
            }
        }
        Json::Object(doc)
    }

    fn require_id(&self) -> Result<String> {
        self.id()
            .map(str::to_string)
            .ok_or_else(|| Error::failed(format!("{} entity has no id", self.entity_name)))
    }

    fn require_name(&self) -> Result<()> {
        if self.entity_name.is_empty() {
            Err(Error::InvalidParams("entity name must not be empty".into()))
        } else {
            Ok(())
        }
    }

    // Each operation is split into a `begin_*` step that validates and queues
    // the request, and a commit step that applies the response.

    fn begin_save(&self) -> Result<Pending<Response>> {
        self.require_name()?;
        let body = self.mutation_document();
        let request = match self.id() {
            Some(id) => {
                let mut doc = JsonMap::new();
                doc.insert(ID_FIELD.to_string(), Json::String(id.to_string()));
                if let Json::Object(changes) = body {
                    doc.extend(changes);
                }
                Request::new(Method::Put, self.entity_name.clone())
                    .with_path(id)
                    .with_body(Json::Object(doc))
            }
            None => Request::new(Method::Post, self.entity_name.clone()).with_body(body),
        };
        Ok(self.client.submit(request))
    }

    fn begin_refresh(&self) -> Result<Pending<Response>> {
        self.require_name()?;
        let id = self.require_id()?;
        let request = Request::new(Method::Get, self.entity_name.clone())
            .with_path(id)
            .with_cache(self.cache_policy, self.max_cache_age);
        Ok(self.client.submit(request))
    }

    fn begin_delete(&self) -> Result<Pending<Response>> {
        self.require_name()?;
        let id = self.require_id()?;
        let request = Request::new(Method::Delete, self.entity_name.clone()).with_path(id);
        Ok(self.client.submit(request))
    }

    fn begin_login(&self, username: &str, password: &str) -> Result<Pending<Response>> {
        self.require_name()?;
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidParams("username and password are required".into()));
        }
        let mut body = JsonMap::new();
        body.insert(USERNAME_FIELD.into(), Json::String(username.to_string()));
        body.insert(PASSWORD_FIELD.into(), Json::String(password.to_string()));
        let request = Request::new(Method::Post, self.entity_name.clone())
            .with_path(LOGIN_PATH)
            .with_body(Json::Object(body));
        Ok(self.client.submit(request))
    }

    fn begin_logout(&self) -> Result<Pending<Response>> {
        self.require_name()?;
        let request = Request::new(Method::Post, self.entity_name.clone()).with_path(LOGOUT_PATH);
        Ok(self.client.submit(request))
    }

    fn begin_logged_user(&self) -> Result<Pending<Response>> {
        self.require_name()?;
        let request = Request::new(Method::Get, self.entity_name.clone()).with_path(ME_PATH);
        Ok(self.client.submit(request))
    }

    /// Baseline := response document, pending changes dropped.
    fn commit_document(&mut self, response: Response) -> Result<()> {
        let doc = expect_document(response.body)?;
        self.result_map = doc;
        self.pending.clear();
        Ok(())
    }

    fn commit_cleared(&mut self, _response: Response) -> Result<()> {
        self.result_map.clear();
        self.pending.clear();
        Ok(())
    }

    fn commit_logged_user(&mut self, response: Response) -> Result<bool> {
        match response.body {
            Value::Null => Ok(false),
            Value::Object(doc) if doc.is_empty() => Ok(false),
            body => {
                self.commit_document(Response { body, ..response })?;
                Ok(true)
            }
        }
    }

    async fn run<T>(&mut self, started: Result<Pending<Response>>, commit: Commit<T>) -> Result<T> {
        let response = started?.await?;
        commit(self, response)
    }

    fn run_blocking<T>(&mut self, started: Result<Pending<Response>>, commit: Commit<T>) -> Result<T> {
        let response = started?.wait()?;
        commit(self, response)
    }

    fn run_in_background<F>(mut self, started: Result<Pending<Response>>, commit: Commit<()>, callback: F)
    where
        F: FnOnce(Entity, Result<()>) + Send + 'static,
    {
        spawn_callback(async move {
            let result = match started {
                Ok(pending) => match pending.await {
                    Ok(response) => commit(&mut self, response),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err),
            };
            callback(self, result);
        });
    }

    /// Create or update the entity on the server.
    ///
    /// On success the returned document becomes the baseline and all pending
    /// changes are cleared; on failure nothing changes locally.
    pub async fn save(&mut self) -> Result<()> {
        let started = self.begin_save();
        self.run(started, Entity::commit_document).await
    }

    /// Blocking [`Entity::save`]. Must not be called from async code.
    pub fn save_blocking(&mut self) -> Result<()> {
        let started = self.begin_save();
        self.run_blocking(started, Entity::commit_document)
    }

    /// Queue a save and hand the entity back to `callback` when it has run.
    pub fn save_in_background<F>(self, callback: F)
    where
        F: FnOnce(Entity, Result<()>) + Send + 'static,
    {
        let started = self.begin_save();
        self.run_in_background(started, Entity::commit_document, callback);
    }

    /// Replace the baseline with the server's copy. Unsaved changes are lost.
    pub async fn refresh(&mut self) -> Result<()> {
        let started = self.begin_refresh();
        self.run(started, Entity::commit_document).await
    }

    pub fn refresh_blocking(&mut self) -> Result<()> {
        let started = self.begin_refresh();
        self.run_blocking(started, Entity::commit_document)
    }

    pub fn refresh_in_background<F>(self, callback: F)
    where
        F: FnOnce(Entity, Result<()>) + Send + 'static,
    {
        let started = self.begin_refresh();
        self.run_in_background(started, Entity::commit_document, callback);
    }

    /// Delete the entity on the server; on success it becomes new again.
    pub async fn delete(&mut self) -> Result<()> {
        let started = self.begin_delete();
        self.run(started, Entity::commit_cleared).await
    }

    pub fn delete_blocking(&mut self) -> Result<()> {
        let started = self.begin_delete();
        self.run_blocking(started, Entity::commit_cleared)
    }

    pub fn delete_in_background<F>(self, callback: F)
    where
        F: FnOnce(Entity, Result<()>) + Send + 'static,
    {
        let started = self.begin_delete();
        self.run_in_background(started, Entity::commit_cleared, callback);
    }

    /// Log in against this user collection. The session document becomes the baseline.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let started = self.begin_login(username, password);
        self.run(started, Entity::commit_document).await
    }

    pub fn login_blocking(&mut self, username: &str, password: &str) -> Result<()> {
        let started = self.begin_login(username, password);
        self.run_blocking(started, Entity::commit_document)
    }

    pub async fn logout(&mut self) -> Result<()> {
        let started = self.begin_logout();
        self.run(started, Entity::commit_cleared).await
    }

    pub fn logout_blocking(&mut self) -> Result<()> {
        let started = self.begin_logout();
        self.run_blocking(started, Entity::commit_cleared)
    }

    /// Whether a user is logged in; if so the user document becomes the baseline.
    pub async fn logged_user(&mut self) -> Result<bool> {
        let started = self.begin_logged_user();
        self.run(started, Entity::commit_logged_user).await
    }

    pub fn logged_user_blocking(&mut self) -> Result<bool> {
        let started = self.begin_logged_user();
        self.run_blocking(started, Entity::commit_logged_user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, ErrorKind};

    fn entity() -> Entity {
        let client = Client::new(Config::new("http://localhost:2403")).unwrap();
        client.entity("posts")
    }

    fn persisted() -> Entity {
        let client = Client::new(Config::new("http://localhost:2403")).unwrap();
        let mut doc = Map::new();
        doc.insert("id".into(), "507f".into());
        doc.insert("title".into(), "old".into());
        doc.insert("createdAt".into(), 1_340_000_000.into());
        Entity::from_document(&client, "posts", doc)
    }

    #[test]
    fn test_new_entity_state() {
        let e = entity();
        assert!(e.is_new());
        assert!(!e.is_dirty());
        assert_eq!(e.mutation_document(), json!({}));
    }

    #[test]
    fn test_rejects_bad_keys() {
        let mut e = entity();
        for key in ["a.b", "$set", ""] {
            let err = e.set_object(key, 1).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParams);
        }
        assert!(e.increment_key("x.y").is_err());
        assert!(!e.is_dirty());
    }

    #[test]
    fn test_increments_accumulate() {
        let mut e = entity();
        e.increment_key_by("score", 3).unwrap();
        e.increment_key_by("score", -1).unwrap();
        assert_eq!(e.mutation_document(), json!({"$inc": {"score": 2}}));
    }

    #[test]
    fn test_increment_rejects_non_numbers() {
        let mut e = entity();
        assert!(e.increment_key_by("score", "ten").is_err());
        e.increment_key("score").unwrap();
        e.increment_key_by("score", 0.5).unwrap();
        assert_eq!(e.mutation_document()["$inc"]["score"], json!(1.5));
    }

    #[test]
    fn test_fold_order_and_competing_verbs() {
        let mut e = entity();
        e.pull_object("tags", "old").unwrap();
        e.push_all_objects("tags", ["a", "b"]).unwrap();
        e.push_all_objects("tags", ["c"]).unwrap();
        e.push_object("log", "first").unwrap();
        e.push_object("log", "second").unwrap();
        e.add_object_to_set("labels", "x").unwrap();
        e.pull_all_objects("tags", ["older"]).unwrap();
        e.increment_key("views").unwrap();
        e.set_object("views", 0).unwrap();

        let doc = e.mutation_document();
        assert_eq!(
            doc,
            json!({
                "views": 0,
                "$inc": {"views": 1},
                "$push": {"log": "second"},
                "$pushAll": {"tags": ["a", "b", "c"]},
                "$addToSet": {"labels": "x"},
                "$pullAll": {"tags": ["old", "older"]}
            })
        );
        let keys: Vec<&String> = doc.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["views", "$inc", "$push", "$pushAll", "$addToSet", "$pullAll"]);
    }

    #[test]
    fn test_add_all_to_set_uses_each() {
        let mut e = entity();
        e.add_object_to_set("labels", "x").unwrap();
        e.add_all_objects_to_set("labels", ["y", "z"]).unwrap();
        assert_eq!(
            e.mutation_document(),
            json!({"$addToSet": {"labels": {"$each": ["y", "z"]}}})
        );
    }

    #[test]
    fn test_object_for_key_prefers_pending_set() {
        let mut e = persisted();
        assert_eq!(e.object_for_key("title"), Some(&Value::from("old")));
        e.set_object("title", "new").unwrap();
        assert_eq!(e.object_for_key("title"), Some(&Value::from("new")));
        e.reset();
        assert!(!e.is_dirty());
        assert_eq!(e.object_for_key("title"), Some(&Value::from("old")));
    }

    #[test]
    fn test_special_values_in_payload() {
        let mut e = entity();
        e.set_object("owner", Reference::new("users", "u1")).unwrap();
        e.set_object("blob", Value::Binary(vec![1, 2, 3])).unwrap();
        assert_eq!(
            e.mutation_document(),
            json!({"owner": {"$ref": {"entity": "users", "id": "u1"}}, "blob": {"$binary": "AQID"}})
        );
    }

    #[test]
    fn test_persisted_accessors() {
        let e = persisted();
        assert!(!e.is_new());
        assert_eq!(e.id(), Some("507f"));
        assert_eq!(e.created_at().unwrap().timestamp(), 1_340_000_000);
        assert_eq!(e.reference(), Some(Reference::new("posts", "507f")));
        assert!(e.creator_id().is_none());
    }

    #[test]
    fn test_timestamp_formats() {
        assert_eq!(
            timestamp(&Value::from(1_340_000_000_123_i64)).unwrap().timestamp_millis(),
            1_340_000_000_123
        );
        assert!(timestamp(&Value::from("2012-06-18T06:13:20.000Z")).is_some());
        assert!(timestamp(&Value::from(true)).is_none());
    }

    #[test]
    fn test_timestamp_extreme_integers() {
        assert!(timestamp(&Value::from(i64::MIN)).is_none());
        assert!(timestamp(&Value::from(i64::MAX)).is_none());
        assert!(timestamp(&Value::from(u64::MAX)).is_none());
    }

    #[test]
    fn test_timestamp_fractional_numbers() {
        let millis = timestamp(&Value::from(1.340000000123e12)).unwrap();
        assert_eq!(millis.timestamp_millis(), 1_340_000_000_123);

        let seconds = timestamp(&Value::from(1_340_000_000.5)).unwrap();
        assert_eq!(seconds.timestamp_millis(), 1_340_000_000_500);

        assert!(timestamp(&Value::from(1e300)).is_none());
    }

    #[test]
    fn test_refresh_and_delete_need_id() {
        let e = entity();
        assert_eq!(e.begin_refresh().err().unwrap().kind(), ErrorKind::OperationFailed);
        assert_eq!(e.begin_delete().err().unwrap().kind(), ErrorKind::OperationFailed);
    }

    #[test]
    fn test_commit_rejects_non_document() {
        let mut e = persisted();
        e.set_object("title", "new").unwrap();
        let response = Response {
            status: 200,
            body: Value::Array(vec![]),
            from_cache: false,
        };
        assert!(e.commit_document(response).is_err());
        assert!(e.is_dirty());
        assert_eq!(e.id(), Some("507f"));
    }
}
