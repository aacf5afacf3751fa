//! Basic example demonstrating Deployd Rust SDK usage.
//!
//! Expects a Deployd app on localhost:2403 with a `posts` collection.

use std::time::Duration;

use deployd::{CachePolicy, Client, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> deployd::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deployd=debug")))
    .init();

  let config = Config::new("http://localhost:2403")
    .with_request_log(true)
    .with_cache_policy(CachePolicy::UseCacheIfOffline)
    .with_max_cache_age(Duration::from_secs(120));
  let client = Client::new(config)?;

  if !client.endpoint_reachable().await? {
    println!("Deployd is not reachable, cached results only");
  }

  // Create a post
  let mut post = client.entity("posts");
  post.set_object("title", "Hello from Rust")?;
  post.set_object("published", true)?;
  post.push_object("tags", "rust")?;
  post.save().await?;
  println!("Created post {:?} at {:?}", post.id(), post.created_at());

  // Update it
  post.increment_key_by("likes", 5)?;
  post.save().await?;
  println!("Likes: {:?}", post.object_for_key("likes"));

  // Query published posts
  let mut query = client.query("posts");
  query.where_key("published").equal_to(true);
  query.where_key("title").contains_string("hello", true);
  query.order_descending_by_creation_date().limit(10);

  for found in query.find_all().await? {
    println!("Found: {:?} {:?}", found.id(), found.object_for_key("title"));
  }
  println!("Published posts: {}", query.count_all().await?);

  // Clean up
  post.delete().await?;
  println!("Deleted, is new again: {}", post.is_new());

  Ok(())
}
