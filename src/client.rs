//! Client handle and the serial request worker.
//!
//! Every network operation goes through one worker thread that executes jobs
//! strictly in submission order. The worker owns the [`Transport`] and its
//! cache, so neither needs locking.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::trace;
use uuid::Uuid;

use crate::config::Config;
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::query::Query;
use crate::transport::{Request, Response, Transport};

enum Job {
  Send {
    id: Uuid,
    request: Request,
    reply: oneshot::Sender<Result<Response>>,
  },
  HasCached {
    request: Request,
    reply: oneshot::Sender<Result<bool>>,
  },
  ClearCache {
    reply: oneshot::Sender<Result<()>>,
  },
  Probe {
    reply: oneshot::Sender<Result<bool>>,
  },
}

/// Result of a queued job.
///
/// Await it from async code, or call [`Pending::wait`] from a thread that is
/// not driving an async runtime.
#[must_use = "a pending job does nothing unless awaited or waited on"]
pub struct Pending<T> {
  rx: oneshot::Receiver<Result<T>>,
}

impl<T> Pending<T> {
  fn failed(err: Error) -> Self {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(Err(err));
    Self { rx }
  }

  /// Block the current thread until the job has run.
  pub fn wait(self) -> Result<T> {
    futures::executor::block_on(self)
  }
}

impl<T> Future for Pending<T> {
  type Output = Result<T>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    Pin::new(&mut self.get_mut().rx)
      .poll(cx)
      .map(|received| received.unwrap_or_else(|_| Err(queue_closed())))
  }
}

fn queue_closed() -> Error {
  Error::ConnectionFailed("request queue closed".to_string())
}

/// Run `task` on the caller's tokio runtime if there is one, otherwise on a
/// dedicated thread.
pub(crate) fn spawn_callback<F>(task: F)
where
  F: Future<Output = ()> + Send + 'static,
{
  match tokio::runtime::Handle::try_current() {
    Ok(handle) => {
      handle.spawn(task);
    }
    Err(_) => {
      std::thread::spawn(move || futures::executor::block_on(task));
    }
  }
}

struct Inner {
  config: Config,
  jobs: mpsc::UnboundedSender<Job>,
}

/// Deployd client.
///
/// Cheap to clone; all clones share one request queue. The worker thread
/// stops once every clone (and every entity or query holding one) is dropped.
#[derive(Clone)]
pub struct Client {
  inner: Arc<Inner>,
}

impl Client {
  /// Validate the configuration and start the request worker.
  pub fn new(config: Config) -> Result<Self> {
    let url = reqwest::Url::parse(&config.endpoint)
      .map_err(|e| Error::InvalidParams(format!("invalid endpoint {:?}: {}", config.endpoint, e)))?;
    if url.scheme() != "http" && url.scheme() != "https" {
      return Err(Error::InvalidParams(format!(
        "endpoint must be http or https, got {}",
        url.scheme()
      )));
    }

    let transport = Transport::new(&config)?;
    let runtime = tokio::runtime::Builder::new_current_thread()
      .enable_all()
      .build()
      .map_err(|e| Error::failed(format!("cannot start request worker: {}", e)))?;
    let (jobs, rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
      .name("deployd-requests".to_string())
      .spawn(move || runtime.block_on(run_worker(transport, rx)))
      .map_err(|e| Error::failed(format!("cannot start request worker: {}", e)))?;

    Ok(Self {
      inner: Arc::new(Inner { config, jobs }),
    })
  }

  pub fn config(&self) -> &Config {
    &self.inner.config
  }

  /// New, unsaved entity in the given collection.
  pub fn entity(&self, entity_name: impl Into<String>) -> Entity {
    Entity::new(self, entity_name)
  }

  /// New query against the given collection.
  pub fn query(&self, entity_name: impl Into<String>) -> Query {
    Query::new(self, entity_name)
  }

  /// Queue a request.
  pub fn submit(&self, request: Request) -> Pending<Response> {
    let id = Uuid::new_v4();
    trace!(request_id = %id, method = request.method.as_str(), entity = %request.entity_name, "queueing request");
    self.enqueue(|reply| Job::Send { id, request, reply })
  }

  /// Whether the cache holds a response for `request`.
  pub fn has_cached_result(&self, request: Request) -> Pending<bool> {
    self.enqueue(|reply| Job::HasCached { request, reply })
  }

  /// Drop every cached response.
  pub fn clear_all_cached_results(&self) -> Pending<()> {
    self.enqueue(|reply| Job::ClearCache { reply })
  }

  /// Whether the endpoint currently answers HTTP requests.
  pub fn endpoint_reachable(&self) -> Pending<bool> {
    self.enqueue(|reply| Job::Probe { reply })
  }

  fn enqueue<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Job) -> Pending<T> {
    let (tx, rx) = oneshot::channel();
    match self.inner.jobs.send(make(tx)) {
      Ok(()) => Pending { rx },
      Err(_) => Pending::failed(queue_closed()),
    }
  }
}

async fn run_worker(mut transport: Transport, mut rx: mpsc::UnboundedReceiver<Job>) {
  while let Some(job) = rx.recv().await {
    match job {
      Job::Send { id, request, reply } => {
        trace!(request_id = %id, "running request");
        let result = transport.execute(&request, id).await;
        let _ = reply.send(result);
      }
      Job::HasCached { request, reply } => {
        let _ = reply.send(transport.has_cached(&request));
      }
      Job::ClearCache { reply } => {
        transport.clear_cache();
        let _ = reply.send(Ok(()));
      }
      Job::Probe { reply } => {
        let _ = reply.send(Ok(transport.probe().await));
      }
    }
  }
  trace!("request queue closed");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rejects_bad_endpoint() {
    let err = Client::new(Config::new("not a url")).err().unwrap();
    assert_eq!(err.code(), 100);

    let err = Client::new(Config::new("ftp://example.com")).err().unwrap();
    assert!(err.to_string().contains("http or https"));
  }

  #[test]
  fn test_clear_cache_round_trip() {
    let client = Client::new(Config::new("http://127.0.0.1:9")).unwrap();
    client.clear_all_cached_results().wait().unwrap();
    let cached = client
      .has_cached_result(Request::new(crate::transport::Method::Get, "posts"))
      .wait()
      .unwrap();
    assert!(!cached);
  }

  #[test]
  fn test_failed_pending_resolves_immediately() {
    let pending: Pending<()> = Pending::failed(Error::failed("boom"));
    assert!(pending.wait().is_err());
  }
}
