//! Document families, calendar partitions and the identifier format.

use chrono::{Datelike, NaiveDate, Utc};
use std::fmt;

/// How a family partitions its sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
  Year,
  YearMonth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum DocumentFamily {
  WorkOrder,
  Maintenance,
  FuelLoad,
}

impl DocumentFamily {
  pub const ALL: [DocumentFamily; 3] = [
    DocumentFamily::WorkOrder,
    DocumentFamily::Maintenance,
    DocumentFamily::FuelLoad,
  ];

  pub fn prefix(&self) -> &'static str {
    match self {
      DocumentFamily::WorkOrder => "OT",
      DocumentFamily::Maintenance => "MT",
      DocumentFamily::FuelLoad => "CC",
    }
  }

  pub fn granularity(&self) -> Granularity {
    match self {
      DocumentFamily::WorkOrder => Granularity::Year,
      DocumentFamily::Maintenance | DocumentFamily::FuelLoad => Granularity::YearMonth,
    }
  }

  /// API collection path segment.
  pub fn collection(&self) -> &'static str {
    match self {
      DocumentFamily::WorkOrder => "work-orders",
      DocumentFamily::Maintenance => "maintenance",
      DocumentFamily::FuelLoad => "fuel-loads",
    }
  }

  pub fn from_prefix(prefix: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|f| f.prefix() == prefix)
  }

  pub fn from_collection(collection: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|f| f.collection() == collection)
  }
}

impl fmt::Display for DocumentFamily {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.prefix())
  }
}

/// Calendar partition of a sequence: `2025` or `202503`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionKey {
  Year(i32),
  YearMonth(i32, u32),
}

impl PartitionKey {
  pub fn for_date(family: DocumentFamily, date: NaiveDate) -> Self {
    match family.granularity() {
      Granularity::Year => PartitionKey::Year(date.year()),
      Granularity::YearMonth => PartitionKey::YearMonth(date.year(), date.month()),
    }
  }

  pub fn current(family: DocumentFamily) -> Self {
    Self::for_date(family, Utc::now().date_naive())
  }

  /// Parse the partition segment of an identifier for `family`.
  pub fn parse(family: DocumentFamily, s: &str) -> Option<Self> {
    if !s.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    match (family.granularity(), s.len()) {
      (Granularity::Year, 4) => s.parse().ok().map(PartitionKey::Year),
      (Granularity::YearMonth, 6) => {
        let year = s[..4].parse().ok()?;
        let month = s[4..].parse().ok()?;
        (1..=12)
          .contains(&month)
          .then_some(PartitionKey::YearMonth(year, month))
      }
      _ => None,
    }
  }

  pub fn matches(&self, family: DocumentFamily) -> bool {
    matches!(
      (self, family.granularity()),
      (PartitionKey::Year(_), Granularity::Year) | (PartitionKey::YearMonth(..), Granularity::YearMonth)
    )
  }
}

impl fmt::Display for PartitionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PartitionKey::Year(year) => write!(f, "{:04}", year),
      PartitionKey::YearMonth(year, month) => write!(f, "{:04}{:02}", year, month),
    }
  }
}

/// `{prefix}-{partition}-{seq}`, seq zero-padded to at least three digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DocumentId {
  pub family: DocumentFamily,
  pub partition: PartitionKey,
  pub seq: u32,
}

impl DocumentId {
  pub fn new(family: DocumentFamily, partition: PartitionKey, seq: u32) -> Self {
    Self {
      family,
      partition,
      seq,
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    let mut parts = s.splitn(3, '-');
    let family = DocumentFamily::from_prefix(parts.next()?)?;
    let partition = PartitionKey::parse(family, parts.next()?)?;
    let digits = parts.next()?;
    if digits.len() < 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
      return None;
    }
    let seq: u32 = digits.parse().ok()?;
    (seq > 0).then_some(Self::new(family, partition, seq))
  }
}

impl fmt::Display for DocumentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-{}-{:03}", self.family.prefix(), self.partition, self.seq)
  }
}
