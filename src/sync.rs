//! Replays queued mutations against the fleet API.
//!
//! `create` items carrying an optimistic document id get one extra step: if
//! the server already has that id (409), a fresh one is allocated against the
//! server's list and the queue is told to rewrite later references.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::error::{AllocationError, ApplyError, CreateError};
use crate::net::{Fetcher, HttpRequest, HttpResponse};
use crate::queue::{Applied, ApplyMutation, OperationKind, QueueItem};
use crate::sequence::{
  DocumentFamily, DocumentId, IdSource, PartitionKey, SequenceAllocator, SqliteDocumentIndex,
};

/// Longest slice of a rejection body kept in error messages.
const ERROR_BODY_LIMIT: usize = 200;

/// Identifiers known to the server plus those claimed on this device.
pub struct ServerIdSource {
  fetcher: Arc<dyn Fetcher>,
  api: Url,
  local: Arc<SqliteDocumentIndex>,
}

impl ServerIdSource {
  pub fn new(fetcher: Arc<dyn Fetcher>, api: Url, local: Arc<SqliteDocumentIndex>) -> Self {
    Self { fetcher, api, local }
  }

  /// `GET {api}/{collection}/ids?partition={partition}`, a JSON array of ids.
  fn listing_url(&self, family: DocumentFamily, partition: &PartitionKey) -> Result<Url, AllocationError> {
    let mut url = self
      .api
      .join(&format!("{}/ids", family.collection()))
      .map_err(|e| AllocationError::Source(e.to_string()))?;
    url
      .query_pairs_mut()
      .append_pair("partition", &partition.to_string());
    Ok(url)
  }
}

#[async_trait]
impl IdSource for ServerIdSource {
  async fn existing_ids(
    &self,
    family: DocumentFamily,
    partition: &PartitionKey,
  ) -> Result<Vec<String>, AllocationError> {
    let url = self.listing_url(family, partition)?;
    let response = self
      .fetcher
      .fetch(&HttpRequest::get(url))
      .await
      .map_err(|e| AllocationError::Source(e.to_string()))?;
    if !response.is_success() {
      return Err(AllocationError::Source(format!(
        "identifier listing answered {}",
        response.status
      )));
    }

    let mut ids: Vec<String> = serde_json::from_slice(&response.body)
      .map_err(|e| AllocationError::Source(format!("Failed to parse identifier listing: {}", e)))?;
    ids.extend(self.local.ids(family, partition)?);
    Ok(ids)
  }
}

/// `ApplyMutation` over HTTP: create → POST, update → PATCH, delete → DELETE.
pub struct HttpApply {
  fetcher: Arc<dyn Fetcher>,
  api: Url,
  index: Arc<SqliteDocumentIndex>,
  allocator: SequenceAllocator,
}

impl HttpApply {
  pub fn new(
    fetcher: Arc<dyn Fetcher>,
    api: Url,
    index: Arc<SqliteDocumentIndex>,
    max_retries: u32,
  ) -> Self {
    let source = ServerIdSource::new(fetcher.clone(), api.clone(), index.clone());
    Self {
      fetcher,
      api,
      index,
      allocator: SequenceAllocator::new(Arc::new(source), max_retries),
    }
  }

  fn endpoint(&self, target: &str) -> Result<Url, ApplyError> {
    self
      .api
      .join(target.trim_start_matches('/'))
      .map_err(|e| ApplyError::Permanent(format!("invalid target '{}': {}", target, e)))
  }

  async fn reallocate(
    &self,
    item: &QueueItem,
    url: Url,
    original: DocumentId,
  ) -> Result<Applied, ApplyError> {
    let result = self
      .allocator
      .create_with_retry(original.family, original.partition, |candidate| {
        let request = HttpRequest::get(url.clone())
          .with_json(Method::POST, &with_document_id(&item.payload, &candidate));
        let fetcher = self.fetcher.clone();
        async move {
          let response = fetcher
            .fetch(&request)
            .await
            .map_err(|e| CreateError::Failed(e.to_string()))?;
          match response.status {
            200..=299 => Ok(()),
            409 => Err(CreateError::Conflict(candidate.to_string())),
            _ => Err(CreateError::Failed(describe(&response))),
          }
        }
      })
      .await;

    match result {
      Ok((confirmed, ())) => {
        if let Err(e) = self.index.record(&confirmed) {
          warn!(id = %confirmed, error = %e, "Failed to record confirmed document id");
        }
        Ok(Applied::Reassigned {
          from: original.to_string(),
          to: confirmed.to_string(),
        })
      }
      Err(e @ AllocationError::Exhausted { .. }) => Err(ApplyError::Permanent(e.to_string())),
      Err(e) => Err(ApplyError::Transient(e.to_string())),
    }
  }
}

#[async_trait]
impl ApplyMutation for HttpApply {
  async fn apply(&self, item: &QueueItem) -> Result<Applied, ApplyError> {
    let url = self.endpoint(&item.target)?;
    let request = match item.operation {
      OperationKind::Create => HttpRequest::get(url.clone()).with_json(Method::POST, &item.payload),
      OperationKind::Update => HttpRequest::get(url.clone()).with_json(Method::PATCH, &item.payload),
      OperationKind::Delete if item.payload.is_null() => HttpRequest {
        method: Method::DELETE,
        ..HttpRequest::get(url.clone())
      },
      OperationKind::Delete => HttpRequest::get(url.clone()).with_json(Method::DELETE, &item.payload),
    };

    let response = self.fetcher.fetch(&request).await?;
    debug!(id = %item.id, status = response.status, "Server answered queued mutation");

    match (item.operation, response.status) {
      (OperationKind::Create, 200..=299) => {
        if let Some(id) = optimistic_id(item) {
          if let Err(e) = self.index.record(&id) {
            warn!(id = %id, error = %e, "Failed to record created document id");
          }
        }
        Ok(Applied::Done)
      }
      (_, 200..=299) => Ok(Applied::Done),
      // Already gone
      (OperationKind::Delete, 404 | 410) => Ok(Applied::Done),
      (OperationKind::Create, 409) => match optimistic_id(item) {
        Some(original) => {
          warn!(id = %original, "Optimistic id taken on the server, re-allocating");
          self.reallocate(item, url, original).await
        }
        None => Err(ApplyError::Permanent(describe(&response))),
      },
      (_, 408 | 425 | 429) => Err(ApplyError::Transient(describe(&response))),
      (_, 400..=499) => Err(ApplyError::Permanent(describe(&response))),
      _ => Err(ApplyError::Transient(describe(&response))),
    }
  }
}

/// The document id a `create` was submitted under, if it has one.
fn optimistic_id(item: &QueueItem) -> Option<DocumentId> {
  let id = item
    .payload
    .get("id")
    .and_then(Value::as_str)
    .and_then(DocumentId::parse)?;
  let collection = item.target.trim_matches('/');
  (id.family.collection() == collection).then_some(id)
}

fn with_document_id(payload: &Value, id: &DocumentId) -> Value {
  let mut payload = payload.clone();
  if let Some(fields) = payload.as_object_mut() {
    fields.insert("id".to_string(), Value::String(id.to_string()));
  }
  payload
}

fn describe(response: &HttpResponse) -> String {
  let body = response.text();
  let body = body.trim();
  if body.is_empty() {
    return format!("server answered {}", response.status);
  }
  let snippet: String = body.chars().take(ERROR_BODY_LIMIT).collect();
  format!("server answered {}: {}", response.status, snippet)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::{ConnectivityMonitor, ConnectivityState};
  use crate::db::Database;
  use crate::error::FetchError;
  use crate::net::testing::ScriptedFetcher;
  use crate::queue::{ReplayOutcome, ReplayPolicy, SqliteQueueStore, WriteQueue};
  use serde_json::json;
  use std::time::Duration;

  const API: &str = "https://fleet.example.com/api/";

  fn setup() -> (Arc<ScriptedFetcher>, HttpApply, Arc<SqliteDocumentIndex>) {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let index = Arc::new(SqliteDocumentIndex::new(Arc::new(
      Database::open_in_memory().unwrap(),
    )));
    let apply = HttpApply::new(fetcher.clone(), Url::parse(API).unwrap(), index.clone(), 3);
    (fetcher, apply, index)
  }

  fn create_item(id: &str) -> QueueItem {
    QueueItem::new(
      OperationKind::Create,
      "work-orders",
      json!({"id": id, "vehicle": "TRK-12"}),
    )
  }

  #[tokio::test]
  async fn test_methods_and_status_mapping() {
    let (fetcher, apply, _) = setup();
    fetcher.respond("https://fleet.example.com/api/vehicles/TRK-12", 200, "{}");
    fetcher.respond("https://fleet.example.com/api/fuel-loads/CC-202503-001", 404, "");
    fetcher.respond("https://fleet.example.com/api/maintenance/MT-202503-001", 422, "bad date");
    fetcher.respond("https://fleet.example.com/api/maintenance/MT-202503-002", 503, "");

    let update = QueueItem::new(OperationKind::Update, "vehicles/TRK-12", json!({"km": 10}));
    assert_eq!(apply.apply(&update).await, Ok(Applied::Done));

    let delete = QueueItem::new(OperationKind::Delete, "fuel-loads/CC-202503-001", Value::Null);
    assert_eq!(apply.apply(&delete).await, Ok(Applied::Done));

    let rejected = QueueItem::new(OperationKind::Update, "maintenance/MT-202503-001", json!({}));
    assert_eq!(
      apply.apply(&rejected).await,
      Err(ApplyError::Permanent("server answered 422: bad date".to_string()))
    );

    let unavailable = QueueItem::new(OperationKind::Update, "maintenance/MT-202503-002", json!({}));
    assert!(matches!(
      apply.apply(&unavailable).await,
      Err(ApplyError::Transient(_))
    ));

    let methods: Vec<Method> = fetcher.requests().into_iter().map(|(m, _)| m).collect();
    assert_eq!(
      methods,
      vec![Method::PATCH, Method::DELETE, Method::PATCH, Method::PATCH]
    );
  }

  #[tokio::test]
  async fn test_transport_failure_is_transient() {
    let (fetcher, apply, _) = setup();
    fetcher.push(
      "https://fleet.example.com/api/vehicles/TRK-12",
      Err(FetchError::Timeout(Duration::from_secs(10))),
    );

    let update = QueueItem::new(OperationKind::Update, "vehicles/TRK-12", json!({}));
    assert!(matches!(
      apply.apply(&update).await,
      Err(ApplyError::Transient(_))
    ));
  }

  #[tokio::test]
  async fn test_create_records_document_id() {
    let (fetcher, apply, index) = setup();
    fetcher.respond("https://fleet.example.com/api/work-orders", 201, "{}");

    assert_eq!(apply.apply(&create_item("OT-2025-011")).await, Ok(Applied::Done));
    assert_eq!(
      index
        .ids(DocumentFamily::WorkOrder, &PartitionKey::Year(2025))
        .unwrap(),
      vec!["OT-2025-011"]
    );
  }

  #[tokio::test]
  async fn test_conflicting_create_is_reassigned() {
    let (fetcher, apply, _) = setup();
    let collection = "https://fleet.example.com/api/work-orders";
    fetcher.push(collection, Ok(HttpResponse::new(Url::parse(collection).unwrap(), 409, "")));
    fetcher.respond(collection, 201, "{}");
    fetcher.respond(
      "https://fleet.example.com/api/work-orders/ids?partition=2025",
      200,
      r#"["OT-2025-010", "OT-2025-011", "OT-2024-099"]"#,
    );

    assert_eq!(
      apply.apply(&create_item("OT-2025-011")).await,
      Ok(Applied::Reassigned {
        from: "OT-2025-011".to_string(),
        to: "OT-2025-012".to_string(),
      })
    );
  }

  #[tokio::test]
  async fn test_reallocation_gives_up() {
    let (fetcher, apply, _) = setup();
    fetcher.respond("https://fleet.example.com/api/work-orders", 409, "");
    fetcher.respond(
      "https://fleet.example.com/api/work-orders/ids?partition=2025",
      200,
      "[]",
    );

    assert!(matches!(
      apply.apply(&create_item("OT-2025-001")).await,
      Err(ApplyError::Permanent(_))
    ));
    // Original attempt plus four allocations
    assert_eq!(
      fetcher.request_count("https://fleet.example.com/api/work-orders"),
      5
    );
  }

  #[tokio::test]
  async fn test_offline_edits_replay_in_order() {
    let (fetcher, apply, _) = setup();
    let monitor = Arc::new(ConnectivityMonitor::with_state(ConnectivityState::Offline));
    let store = SqliteQueueStore::new(Arc::new(Database::open_in_memory().unwrap()));
    let queue = WriteQueue::new(store, monitor.clone(), ReplayPolicy::default()).unwrap();

    // Created offline under an optimistic id, then edited
    queue
      .submit(
        OperationKind::Create,
        "work-orders",
        json!({"id": "OT-2025-011", "vehicle": "TRK-12"}),
      )
      .unwrap();
    queue
      .submit(
        OperationKind::Update,
        "work-orders/OT-2025-011",
        json!({"status": "in_progress"}),
      )
      .unwrap();
    assert_eq!(queue.pending_count().unwrap(), 2);

    fetcher.respond("https://fleet.example.com/api/work-orders", 201, "{}");
    fetcher.respond("https://fleet.example.com/api/work-orders/OT-2025-011", 200, "{}");

    monitor.observe(Some(true));
    let report = queue.replay(&apply).await;

    assert_eq!(report.applied, 2);
    assert_eq!(report.outcome, ReplayOutcome::Drained);
    assert!(queue.list().unwrap().is_empty());
    assert_eq!(
      fetcher.requests(),
      vec![
        (Method::POST, "https://fleet.example.com/api/work-orders".to_string()),
        (
          Method::PATCH,
          "https://fleet.example.com/api/work-orders/OT-2025-011".to_string()
        ),
      ]
    );
  }
}
