//! Pending-mutation model: operations, mutable tables, queued changes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Flat field-name → value mapping carried by a change.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Kind of mutation applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
  Create,
  Update,
  Delete,
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Create => write!(f, "create"),
      Self::Update => write!(f, "update"),
      Self::Delete => write!(f, "delete"),
    }
  }
}

/// The fixed set of mutable entity tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
  Customers,
  CatalogItems,
  Quotes,
  QuoteItems,
}

impl Table {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Customers => "customers",
      Self::CatalogItems => "catalog_items",
      Self::Quotes => "quotes",
      Self::QuoteItems => "quote_items",
    }
  }
}

impl fmt::Display for Table {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Table {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "customers" => Ok(Self::Customers),
      "catalog_items" => Ok(Self::CatalogItems),
      "quotes" => Ok(Self::Quotes),
      "quote_items" => Ok(Self::QuoteItems),
      other => Err(format!("unknown table: {}", other)),
    }
  }
}

/// One pending mutation awaiting reconciliation with the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedChange {
  pub operation_type: Operation,
  pub table_name: Table,
  pub record_id: String,
  pub payload: Payload,
  pub enqueued_at: DateTime<Utc>,
  pub retry_attempts: u32,
}

impl QueuedChange {
  fn new(operation_type: Operation, table_name: Table, record_id: String, payload: Payload) -> Self {
    Self {
      operation_type,
      table_name,
      record_id,
      payload,
      enqueued_at: Utc::now(),
      retry_attempts: 0,
    }
  }

  pub fn create(table: Table, record_id: impl Into<String>, payload: Payload) -> Self {
    Self::new(Operation::Create, table, record_id.into(), payload)
  }

  pub fn update(table: Table, record_id: impl Into<String>, payload: Payload) -> Self {
    Self::new(Operation::Update, table, record_id.into(), payload)
  }

  pub fn delete(table: Table, record_id: impl Into<String>) -> Self {
    Self::new(Operation::Delete, table, record_id.into(), Payload::new())
  }

  /// Identity for in-place updates and removal: everything except the
  /// retry counter, which is the only field mutated after enqueue.
  pub(crate) fn same_change(&self, other: &Self) -> bool {
    self.operation_type == other.operation_type
      && self.table_name == other.table_name
      && self.record_id == other.record_id
      && self.enqueued_at == other.enqueued_at
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_serialized_field_names_are_stable() {
    let mut payload = Payload::new();
    payload.insert("name".to_string(), "Acme".into());

    let change = QueuedChange::create(Table::Customers, "c-1", payload);
    let json = serde_json::to_value(&change).unwrap();

    assert_eq!(json["operationType"], "create");
    assert_eq!(json["tableName"], "customers");
    assert_eq!(json["recordId"], "c-1");
    assert_eq!(json["payload"]["name"], "Acme");
    assert_eq!(json["retryAttempts"], 0);
    assert!(json.get("enqueuedAt").is_some());
  }

  #[test]
  fn test_table_parse_roundtrip() {
    for table in [
      Table::Customers,
      Table::CatalogItems,
      Table::Quotes,
      Table::QuoteItems,
    ] {
      assert_eq!(table.as_str().parse::<Table>().unwrap(), table);
    }
    assert!("invoices".parse::<Table>().is_err());
  }

  #[test]
  fn test_same_change_ignores_retry_counter() {
    let a = QueuedChange::delete(Table::Quotes, "q-1");
    let mut b = a.clone();
    b.retry_attempts = 2;

    assert!(a.same_change(&b));
  }
}
