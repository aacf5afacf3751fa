//! Deployd Rust Client SDK
//!
//! A client for the Deployd HTTP document store: entities, queries, and an
//! optional response cache, with every request executed in submission order.
//!
//! # Example
//!
//! ```no_run
//! use deployd::{Client, Config, SortDir};
//!
//! #[tokio::main]
//! async fn main() -> deployd::Result<()> {
//!   let client = Client::new(Config::new("http://localhost:2403"))?;
//!
//!   // Create a document
//!   let mut post = client.entity("posts");
//!   post.set_object("title", "Hello")?;
//!   post.increment_key("views")?;
//!   post.save().await?;
//!   println!("Saved: {:?}", post.id());
//!
//!   // Query documents
//!   let mut query = client.query("posts");
//!   query.where_key("views").greater_than(10);
//!   query.order_by("title", SortDir::Asc).limit(20);
//!   for post in query.find_all().await? {
//!     println!("Found: {:?}", post.object_for_key("title"));
//!   }
//!
//!   Ok(())
//! }
//! ```

pub mod cache;
mod client;
pub mod codec;
mod config;
mod entity;
mod error;
mod query;
pub mod transport;
mod value;

pub use cache::CachePolicy;
pub use client::{Client, Pending};
pub use codec::CodecError;
pub use config::{Config, DEFAULT_MAX_CACHE_AGE, DEFAULT_TIMEOUT};
pub use entity::{
  Entity, Mutation, CREATED_AT_FIELD, CREATOR_ID_FIELD, ID_FIELD, UPDATED_AT_FIELD,
};
pub use error::{Error, ErrorKind, Result};
pub use query::{Condition, Conditions, KeyCondition, Operator, Query, SortDir};
pub use transport::{Method, Request, Response};
pub use value::{Map, Reference, Regex, RegexOptions, Value};
