//! Queue record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "create" => Some(OperationKind::Create),
      "update" => Some(OperationKind::Update),
      "delete" => Some(OperationKind::Delete),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueueStatus {
  Pending,
  InFlight,
  Done,
  Failed,
}

impl QueueStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      QueueStatus::Pending => "PENDING",
      QueueStatus::InFlight => "IN_FLIGHT",
      QueueStatus::Done => "DONE",
      QueueStatus::Failed => "FAILED",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "PENDING" => Some(QueueStatus::Pending),
      "IN_FLIGHT" => Some(QueueStatus::InFlight),
      "DONE" => Some(QueueStatus::Done),
      "FAILED" => Some(QueueStatus::Failed),
      _ => None,
    }
  }

  /// DONE and FAILED end an item's replay. A FAILED item leaves only by
  /// dismiss or retry.
  pub fn is_terminal(&self) -> bool {
    matches!(self, QueueStatus::Done | QueueStatus::Failed)
  }
}

/// A pending mutation, owned by the write queue until it settles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
  pub id: String,
  pub created_at: DateTime<Utc>,
  pub operation: OperationKind,
  /// Resource path relative to the API base, e.g. "work-orders/OT-2025-011"
  pub target: String,
  pub payload: Value,
  pub attempts: u32,
  pub last_error: Option<String>,
  pub status: QueueStatus,
}

impl QueueItem {
  pub fn new(operation: OperationKind, target: impl Into<String>, payload: Value) -> Self {
    Self {
      id: Uuid::new_v4().to_string(),
      created_at: Utc::now(),
      operation,
      target: target.into(),
      payload,
      attempts: 0,
      last_error: None,
      status: QueueStatus::Pending,
    }
  }

  /// Replace every reference to `from` with `to`: whole path segments of the
  /// target and whole string values anywhere in the payload.
  ///
  /// Returns whether anything changed.
  pub fn rewrite_reference(&mut self, from: &str, to: &str) -> bool {
    let mut changed = false;

    if self.target.split('/').any(|segment| segment == from) {
      let rewritten = self
        .target
        .split('/')
        .map(|segment| if segment == from { to } else { segment })
        .collect::<Vec<_>>()
        .join("/");
      self.target = rewritten;
      changed = true;
    }

    if rewrite_value(&mut self.payload, from, to) {
      changed = true;
    }
    changed
  }
}

fn rewrite_value(value: &mut Value, from: &str, to: &str) -> bool {
  match value {
    Value::String(s) if s == from => {
      *s = to.to_string();
      true
    }
    Value::Array(items) => items
      .iter_mut()
      .fold(false, |changed, v| rewrite_value(v, from, to) || changed),
    Value::Object(map) => map
      .values_mut()
      .fold(false, |changed, v| rewrite_value(v, from, to) || changed),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_new_item_is_pending() {
    let item = QueueItem::new(OperationKind::Create, "work-orders", json!({"id": "OT-2025-011"}));
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.attempts, 0);
    assert!(!item.id.is_empty());
  }

  #[test]
  fn test_rewrite_reference_matches_whole_values_only() {
    let mut item = QueueItem::new(
      OperationKind::Update,
      "work-orders/OT-2025-011",
      json!({
        "id": "OT-2025-011",
        "notes": "see OT-2025-011",
        "links": ["OT-2025-011", "OT-2025-0110"],
      }),
    );

    assert!(item.rewrite_reference("OT-2025-011", "OT-2025-014"));
    assert_eq!(item.target, "work-orders/OT-2025-014");
    assert_eq!(item.payload["id"], "OT-2025-014");
    assert_eq!(item.payload["notes"], "see OT-2025-011");
    assert_eq!(item.payload["links"], json!(["OT-2025-014", "OT-2025-0110"]));

    assert!(!item.rewrite_reference("OT-2025-999", "OT-2025-998"));
  }

  #[test]
  fn test_status_strings() {
    for status in [
      QueueStatus::Pending,
      QueueStatus::InFlight,
      QueueStatus::Done,
      QueueStatus::Failed,
    ] {
      assert_eq!(QueueStatus::parse(status.as_str()), Some(status));
    }
    assert!(QueueStatus::Failed.is_terminal());
    assert!(!QueueStatus::InFlight.is_terminal());
  }
}
