//! Query builder for Deployd collections
//!
//! Conditions accumulate into MongoDB-style operator dictionaries:
//!
//! ```no_run
//! use deployd::{Client, Config};
//!
//! # async fn run() -> deployd::Result<()> {
//! let client = Client::new(Config::new("http://localhost:2403"))?;
//! let mut query = client.query("posts");
//! query.where_key("likes").greater_than(10);
//! query.or().where_key("author").equal_to("alice");
//! query.or().where_key("author").equal_to("bob");
//! query.order_descending_by_creation_date().limit(20);
//!
//! for post in query.find_all().await? {
//!     println!("{:?}", post.object_for_key("title"));
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use indexmap::IndexMap;
use serde_json::{json, Map as JsonMap, Value as Json};

use crate::cache::CachePolicy;
use crate::client::{spawn_callback, Client, Pending};
use crate::codec;
use crate::entity::{Entity, CREATED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::error::{Error, Result};
use crate::transport::{Method, Request, Response};
use crate::value::{Map, Regex, RegexOptions, Value};

/// Sub-path Deployd serves collection counts on
pub const COUNT_PATH: &str = "count";

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Lt,
    Lte,
    Gt,
    Gte,
    Ne,
    In,
    NotIn,
    All,
    Regex,
    Exists,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Ne => "$ne",
            Operator::In => "$in",
            Operator::NotIn => "$nin",
            Operator::All => "$all",
            Operator::Regex => "$regex",
            Operator::Exists => "$exists",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Condition on a single key
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Shorthand equality, sent as the bare value.
    Equals(Value),
    /// One entry per operator.
    Operators(IndexMap<Operator, Value>),
}

impl Condition {
    fn to_wire(&self) -> Json {
        match self {
            Condition::Equals(value) => codec::encode(value),
            Condition::Operators(ops) => {
                let mut out = JsonMap::new();
                for (op, value) in ops {
                    match (op, value) {
                        (Operator::Regex, Value::Regex(regex)) => {
                            out.insert("$regex".into(), Json::String(regex.pattern.clone()));
                            if !regex.options.is_empty() {
                                out.insert("$options".into(), Json::String(regex.options.letters()));
                            }
                        }
                        _ => {
                            out.insert(op.as_str().into(), codec::encode(value));
                        }
                    }
                }
                Json::Object(out)
            }
        }
    }
}

/// A group of per-key conditions, combined with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conditions {
    entries: IndexMap<String, Condition>,
}

impl Conditions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a condition on `key`.
    pub fn where_key(&mut self, key: impl Into<String>) -> KeyCondition<'_> {
        KeyCondition {
            conditions: self,
            key: key.into(),
        }
    }

    /// Match the entity with the given id.
    pub fn where_entity_id_matches(&mut self, id: impl Into<String>) -> &mut Self {
        self.where_key(ID_FIELD).equal_to(id.into())
    }

    pub fn get(&self, key: &str) -> Option<&Condition> {
        self.entries.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn set_equal(&mut self, key: String, value: Value) -> &mut Self {
        self.entries.insert(key, Condition::Equals(value));
        self
    }

    // An operator replaces a bare equality on the same key; operators merge.
    fn set_operator(&mut self, key: String, op: Operator, value: Value) -> &mut Self {
        match self.entries.get_mut(&key) {
            Some(Condition::Operators(ops)) => {
                ops.insert(op, value);
            }
            _ => {
                let mut ops = IndexMap::new();
                ops.insert(op, value);
                self.entries.insert(key, Condition::Operators(ops));
            }
        }
        self
    }

    fn write_wire(&self, out: &mut JsonMap<String, Json>) {
        for (key, condition) in &self.entries {
            out.insert(key.clone(), condition.to_wire());
        }
    }

    /// Wire form of this group
    pub fn to_wire(&self) -> Json {
        let mut out = JsonMap::new();
        self.write_wire(&mut out);
        Json::Object(out)
    }
}

/// Condition builder for one key; every verb returns the owning group.
pub struct KeyCondition<'a> {
    conditions: &'a mut Conditions,
    key: String,
}

fn array<I, T>(values: I) -> Value
where
    I: IntoIterator<Item = T>,
    T: Into<Value>,
{
    Value::Array(values.into_iter().map(Into::into).collect())
}

impl<'a> KeyCondition<'a> {
    fn op(self, op: Operator, value: Value) -> &'a mut Conditions {
        self.conditions.set_operator(self.key, op, value)
    }

    pub fn equal_to(self, value: impl Into<Value>) -> &'a mut Conditions {
        self.conditions.set_equal(self.key, value.into())
    }

    pub fn less_than(self, value: impl Into<Value>) -> &'a mut Conditions {
        self.op(Operator::Lt, value.into())
    }

    pub fn less_than_or_equal_to(self, value: impl Into<Value>) -> &'a mut Conditions {
        self.op(Operator::Lte, value.into())
    }

    pub fn greater_than(self, value: impl Into<Value>) -> &'a mut Conditions {
        self.op(Operator::Gt, value.into())
    }

    pub fn greater_than_or_equal_to(self, value: impl Into<Value>) -> &'a mut Conditions {
        self.op(Operator::Gte, value.into())
    }

    pub fn not_equal_to(self, value: impl Into<Value>) -> &'a mut Conditions {
        self.op(Operator::Ne, value.into())
    }

    /// The key's value (or one of its elements) is in `values`.
    pub fn contained_in<I, T>(self, values: I) -> &'a mut Conditions
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.op(Operator::In, array(values))
    }

    pub fn not_contained_in<I, T>(self, values: I) -> &'a mut Conditions
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.op(Operator::NotIn, array(values))
    }

    /// The key's list holds every element of `values`.
    pub fn contains_all_in<I, T>(self, values: I) -> &'a mut Conditions
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        self.op(Operator::All, array(values))
    }

    pub fn matches_regex(self, pattern: impl Into<String>, options: RegexOptions) -> &'a mut Conditions {
        self.op(Operator::Regex, Value::Regex(Regex::new(pattern, options)))
    }

    /// Substring match. Does not apply to list fields.
    pub fn contains_string(self, needle: &str, case_insensitive: bool) -> &'a mut Conditions {
        let options = if case_insensitive {
            RegexOptions::CASE_INSENSITIVE
        } else {
            RegexOptions::NONE
        };
        self.matches_regex(format!(".*{}.*", regex::escape(needle)), options)
    }

    pub fn has_prefix(self, prefix: &str) -> &'a mut Conditions {
        self.matches_regex(format!("^{}", regex::escape(prefix)), RegexOptions::NONE)
    }

    pub fn has_suffix(self, suffix: &str) -> &'a mut Conditions {
        self.matches_regex(format!("{}$", regex::escape(suffix)), RegexOptions::NONE)
    }

    pub fn exists(self) -> &'a mut Conditions {
        self.op(Operator::Exists, Value::Bool(true))
    }

    pub fn does_not_exist(self) -> &'a mut Conditions {
        self.op(Operator::Exists, Value::Bool(false))
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDir {
    Asc,
    Desc,
}

impl SortDir {
    fn wire(self) -> i64 {
        match self {
            SortDir::Asc => 1,
            SortDir::Desc => -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FindMode {
    All,
    One,
    Count,
}

enum Found {
    Entities(Vec<Entity>),
    Count(u64),
}

/// Query against one collection. Re-executable; [`Query::reset`] clears it.
#[derive(Clone)]
pub struct Query {
    client: Client,
    entity_name: String,
    conditions: Conditions,
    ors: Vec<Conditions>,
    ands: Vec<Conditions>,
    sort: IndexMap<String, SortDir>,
    fields: IndexMap<String, u8>,
    limit: Option<usize>,
    skip: Option<usize>,
    limit_recursion: Option<usize>,
    cache_policy: CachePolicy,
    max_cache_age: Duration,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("entity_name", &self.entity_name)
            .field("document", &self.query_document())
            .finish()
    }
}

impl Query {
    pub fn new(client: &Client, entity_name: impl Into<String>) -> Self {
        let config = client.config();
        Self {
            client: client.clone(),
            entity_name: entity_name.into(),
            conditions: Conditions::new(),
            ors: Vec::new(),
            ands: Vec::new(),
            sort: IndexMap::new(),
            fields: IndexMap::new(),
            limit: None,
            skip: None,
            limit_recursion: None,
            cache_policy: config.cache_policy,
            max_cache_age: config.max_cache_age,
        }
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// Top-level conditions.
    pub fn conditions(&self) -> &Conditions {
        &self.conditions
    }

    pub fn where_key(&mut self, key: impl Into<String>) -> KeyCondition<'_> {
        self.conditions.where_key(key)
    }

    pub fn where_entity_id_matches(&mut self, id: impl Into<String>) -> &mut Conditions {
        self.conditions.where_entity_id_matches(id)
    }

    /// Open a new OR group. Each call starts a separate group:
    ///
    /// ```ignore
    /// query.or().where_key("a").equal_to(1);
    /// query.or().where_key("b").equal_to(2);   // $or: [{a: 1}, {b: 2}]
    /// ```
    pub fn or(&mut self) -> &mut Conditions {
        let idx = self.ors.len();
        self.ors.push(Conditions::new());
        &mut self.ors[idx]
    }

    /// Open a new AND group.
    pub fn and(&mut self) -> &mut Conditions {
        let idx = self.ands.len();
        self.ands.push(Conditions::new());
        &mut self.ands[idx]
    }

    /// Sort by key. Re-sorting by a key keeps its position and takes the new direction.
    pub fn order_by(&mut self, key: impl Into<String>, direction: SortDir) -> &mut Self {
        self.sort.insert(key.into(), direction);
        self
    }

    pub fn order_ascending_by_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.order_by(key, SortDir::Asc)
    }

    pub fn order_descending_by_key(&mut self, key: impl Into<String>) -> &mut Self {
        self.order_by(key, SortDir::Desc)
    }

    pub fn order_ascending_by_creation_date(&mut self) -> &mut Self {
        self.order_by(CREATED_AT_FIELD, SortDir::Asc)
    }

    pub fn order_descending_by_creation_date(&mut self) -> &mut Self {
        self.order_by(CREATED_AT_FIELD, SortDir::Desc)
    }

    pub fn order_ascending_by_update_date(&mut self) -> &mut Self {
        self.order_by(UPDATED_AT_FIELD, SortDir::Asc)
    }

    pub fn order_descending_by_update_date(&mut self) -> &mut Self {
        self.order_by(UPDATED_AT_FIELD, SortDir::Desc)
    }

    /// Return only these keys. Do not combine with [`Query::exclude_keys`].
    pub fn include_keys<I, S>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            self.fields.insert(key.into(), 1);
        }
        self
    }

    /// Leave these keys out of results. Do not combine with [`Query::include_keys`].
    pub fn exclude_keys<I, S>(&mut self, keys: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in keys {
            self.fields.insert(key.into(), 0);
        }
        self
    }

    pub fn limit(&mut self, n: usize) -> &mut Self {
        self.limit = Some(n);
        self
    }

    pub fn skip(&mut self, n: usize) -> &mut Self {
        self.skip = Some(n);
        self
    }

    /// Override the server's recursion limit for event-script driven queries.
    pub fn limit_recursion(&mut self, n: usize) -> &mut Self {
        self.limit_recursion = Some(n);
        self
    }

    pub fn cache_policy(&mut self, policy: CachePolicy) -> &mut Self {
        self.cache_policy = policy;
        self
    }

    pub fn max_cache_age(&mut self, max_age: Duration) -> &mut Self {
        self.max_cache_age = max_age;
        self
    }

    /// Clear every condition, ordering, projection and paging option.
    pub fn reset(&mut self) {
        self.conditions = Conditions::new();
        self.ors.clear();
        self.ands.clear();
        self.sort.clear();
        self.fields.clear();
        self.limit = None;
        self.skip = None;
        self.limit_recursion = None;
    }

    /// The wire query document `find_all` sends.
    pub fn query_document(&self) -> Json {
        self.document(FindMode::All)
    }

    fn document(&self, mode: FindMode) -> Json {
        let mut doc = JsonMap::new();
        self.conditions.write_wire(&mut doc);

        let groups = |list: &[Conditions]| -> Vec<Json> {
            list.iter()
                .filter(|group| !group.is_empty())
                .map(Conditions::to_wire)
                .collect()
        };
        let ors = groups(&self.ors);
        if !ors.is_empty() {
            doc.insert("$or".into(), Json::Array(ors));
        }
        let ands = groups(&self.ands);
        if !ands.is_empty() {
            doc.insert("$and".into(), Json::Array(ands));
        }

        if mode == FindMode::Count {
            return Json::Object(doc);
        }

        if !self.sort.is_empty() {
            let sort: JsonMap<String, Json> = self
                .sort
                .iter()
                .map(|(key, dir)| (key.clone(), json!(dir.wire())))
                .collect();
            doc.insert("$sort".into(), Json::Object(sort));
        }
        let limit = match mode {
            FindMode::One => Some(1),
            _ => self.limit,
        };
        if let Some(limit) = limit {
            doc.insert("$limit".into(), json!(limit));
        }
        if let Some(skip) = self.skip {
            doc.insert("$skip".into(), json!(skip));
        }
        if let Some(n) = self.limit_recursion {
            doc.insert("$limitRecursion".into(), json!(n));
        }
        if !self.fields.is_empty() {
            let fields: JsonMap<String, Json> = self
                .fields
                .iter()
                .map(|(key, flag)| (key.clone(), json!(flag)))
                .collect();
            doc.insert("$fields".into(), Json::Object(fields));
        }
        Json::Object(doc)
    }

    fn request(&self, mode: FindMode) -> Request {
        let mut request = Request::new(Method::Get, self.entity_name.clone())
            .with_cache(self.cache_policy, self.max_cache_age);
        if mode == FindMode::Count {
            request = request.with_path(COUNT_PATH);
        }
        let doc = self.document(mode);
        if doc.as_object().is_some_and(|m| !m.is_empty()) {
            request = request.with_query(doc);
        }
        request
    }

    /// Whether a cached response exists for this query.
    pub fn has_cached_result(&self) -> Pending<bool> {
        self.client.has_cached_result(self.request(FindMode::All))
    }

    // All call shapes go through `start` + `collect`.

    fn start(&self, mode: FindMode) -> (Pending<Response>, Collector) {
        let collector = Collector {
            client: self.client.clone(),
            entity_name: self.entity_name.clone(),
            mode,
        };
        (self.client.submit(self.request(mode)), collector)
    }

    async fn find(&self, mode: FindMode) -> Result<Found> {
        let (pending, collector) = self.start(mode);
        collector.collect(pending.await?)
    }

    fn find_blocking(&self, mode: FindMode) -> Result<Found> {
        let (pending, collector) = self.start(mode);
        collector.collect(pending.wait()?)
    }

    fn find_in_background<F>(&self, mode: FindMode, callback: F)
    where
        F: FnOnce(Result<Found>) + Send + 'static,
    {
        let (pending, collector) = self.start(mode);
        spawn_callback(async move {
            callback(pending.await.and_then(|response| collector.collect(response)));
        });
    }

    /// Find all matching entities.
    pub async fn find_all(&self) -> Result<Vec<Entity>> {
        self.find(FindMode::All).await.map(Found::into_entities)
    }

    /// Blocking [`Query::find_all`]. Must not be called from async code.
    pub fn find_all_blocking(&self) -> Result<Vec<Entity>> {
        self.find_blocking(FindMode::All).map(Found::into_entities)
    }

    /// Queue a find and hand the results to `callback` once it has run.
    pub fn find_all_in_background<F>(&self, callback: F)
    where
        F: FnOnce(Result<Vec<Entity>>) + Send + 'static,
    {
        self.find_in_background(FindMode::All, move |found| {
            callback(found.map(Found::into_entities))
        });
    }

    /// First matching entity, if any.
    pub async fn find_one(&self) -> Result<Option<Entity>> {
        self.find(FindMode::One).await.map(Found::into_first)
    }

    pub fn find_one_blocking(&self) -> Result<Option<Entity>> {
        self.find_blocking(FindMode::One).map(Found::into_first)
    }

    pub fn find_one_in_background<F>(&self, callback: F)
    where
        F: FnOnce(Result<Option<Entity>>) + Send + 'static,
    {
        self.find_in_background(FindMode::One, move |found| callback(found.map(Found::into_first)));
    }

    /// Number of matching entities. Sorting, paging and projection are ignored.
    pub async fn count_all(&self) -> Result<u64> {
        self.find(FindMode::Count).await.and_then(Found::into_count)
    }

    pub fn count_all_blocking(&self) -> Result<u64> {
        self.find_blocking(FindMode::Count).and_then(Found::into_count)
    }

    pub fn count_all_in_background<F>(&self, callback: F)
    where
        F: FnOnce(Result<u64>) + Send + 'static,
    {
        self.find_in_background(FindMode::Count, move |found| {
            callback(found.and_then(Found::into_count))
        });
    }
}

impl Found {
    fn into_entities(self) -> Vec<Entity> {
        match self {
            Found::Entities(entities) => entities,
            Found::Count(_) => Vec::new(),
        }
    }

    fn into_first(self) -> Option<Entity> {
        self.into_entities().into_iter().next()
    }

    fn into_count(self) -> Result<u64> {
        match self {
            Found::Count(n) => Ok(n),
            Found::Entities(_) => Err(Error::InvalidResponse("expected a count".into())),
        }
    }
}

/// Turns a find response into entities or a count.
struct Collector {
    client: Client,
    entity_name: String,
    mode: FindMode,
}

impl Collector {
    fn collect(&self, response: Response) -> Result<Found> {
        if self.mode == FindMode::Count {
            return response
                .body
                .get("count")
                .and_then(Value::as_i64)
                .and_then(|n| u64::try_from(n).ok())
                .map(Found::Count)
                .ok_or_else(|| Error::InvalidResponse("count response has no count".into()));
        }

        let entities = match response.body {
            Value::Null => Vec::new(),
            // Deployd answers id queries with a single object
            Value::Object(doc) => vec![self.hydrate(doc)],
            Value::Array(items) => items
                .into_iter()
                .map(|item| match item {
                    Value::Object(doc) => Ok(self.hydrate(doc)),
                    other => Err(Error::InvalidResponse(format!(
                        "expected an object in result list, got {:?}",
                        other
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(Error::InvalidResponse(format!(
                    "expected a list of objects, got {:?}",
                    other
                )))
            }
        };
        Ok(Found::Entities(entities))
    }

    fn hydrate(&self, doc: Map) -> Entity {
        Entity::from_document(&self.client, self.entity_name.clone(), doc)
    }
}
