//! Toy records and store fixtures shared by the workspace tests.
//!
//! One record enum covers the three shapes the indexes care about: users
//! (scalar and multi-valued fields), venues (geographic positions) and
//! docs (embedding vectors). Records serialize with bincode; the access
//! impl knows how to revive each type from its stored bytes, which is
//! what backfill and scrubbing exercise.

use serde::{Deserialize, Serialize};

use taxis_core::{
    IndexError, Record, RecordAccess, StoreLayout, Subspace, Transaction, Tuple, TupleElement,
};
use taxis_memory::MemoryKv;

pub const USER: &str = "user";
pub const VENUE: &str = "venue";
pub const DOC: &str = "doc";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub score: i64,
    pub region: Option<String>,
    pub tags: Vec<String>,
    pub balance_cents: i64,
}

impl User {
    pub fn new(id: i64, email: &str) -> Self {
        Self {
            id,
            email: email.to_string(),
            score: 0,
            region: None,
            tags: Vec::new(),
            balance_cents: 0,
        }
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    pub fn with_region(mut self, region: &str) -> Self {
        self.region = Some(region.to_string());
        self
    }

    pub fn with_balance(mut self, cents: i64) -> Self {
        self.balance_cents = cents;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Venue {
    pub id: i64,
    pub name: String,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Doc {
    pub id: i64,
    pub embedding: Vec<f64>,
}

/// The store's record universe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TestRecord {
    User(User),
    Venue(Venue),
    Doc(Doc),
}

impl From<User> for TestRecord {
    fn from(value: User) -> Self {
        Self::User(value)
    }
}

impl From<Venue> for TestRecord {
    fn from(value: Venue) -> Self {
        Self::Venue(value)
    }
}

impl From<Doc> for TestRecord {
    fn from(value: Doc) -> Self {
        Self::Doc(value)
    }
}

impl Record for TestRecord {
    fn record_type(&self) -> &'static str {
        match self {
            Self::User(_) => USER,
            Self::Venue(_) => VENUE,
            Self::Doc(_) => DOC,
        }
    }

    fn primary_key(&self) -> Tuple {
        let id = match self {
            Self::User(user) => user.id,
            Self::Venue(venue) => venue.id,
            Self::Doc(doc) => doc.id,
        };
        Tuple::new().with(id)
    }
}

pub struct TestAccess;

impl RecordAccess<TestRecord> for TestAccess {
    fn extract_field(
        &self,
        record: &TestRecord,
        name: &str,
    ) -> Result<Vec<TupleElement>, IndexError> {
        match (record, name) {
            (TestRecord::User(user), "id") => Ok(vec![user.id.into()]),
            (TestRecord::User(user), "email") => Ok(vec![user.email.as_str().into()]),
            (TestRecord::User(user), "score") => Ok(vec![user.score.into()]),
            (TestRecord::User(user), "balance_cents") => {
                Ok(vec![user.balance_cents.into()])
            }
            (TestRecord::User(user), "region") => Ok(user
                .region
                .iter()
                .map(|region| TupleElement::from(region.as_str()))
                .collect()),
            (TestRecord::User(user), "tags") => Ok(user
                .tags
                .iter()
                .map(|tag| TupleElement::from(tag.as_str()))
                .collect()),
            (TestRecord::Venue(venue), "id") => Ok(vec![venue.id.into()]),
            (TestRecord::Venue(venue), "name") => Ok(vec![venue.name.as_str().into()]),
            (TestRecord::Venue(venue), "position") => Ok(vec![
                TupleElement::Double(venue.lat),
                TupleElement::Double(venue.lon),
            ]),
            (TestRecord::Doc(doc), "id") => Ok(vec![doc.id.into()]),
            (TestRecord::Doc(doc), "embedding") => Ok(doc
                .embedding
                .iter()
                .map(|component| TupleElement::Double(*component))
                .collect()),
            (record, name) => Err(IndexError::invalid_argument(format!(
                "{} has no field {name}",
                record.record_type()
            ))),
        }
    }

    fn deserialize(&self, record_type: &str, bytes: &[u8]) -> Result<TestRecord, IndexError> {
        let revive = |e: bincode::Error| {
            IndexError::internal(format!("corrupt {record_type} record: {e}"))
        };

        match record_type {
            USER => Ok(TestRecord::User(bincode::deserialize(bytes).map_err(revive)?)),
            VENUE => Ok(TestRecord::Venue(
                bincode::deserialize(bytes).map_err(revive)?,
            )),
            DOC => Ok(TestRecord::Doc(bincode::deserialize(bytes).map_err(revive)?)),
            other => Err(IndexError::invalid_argument(format!(
                "unknown record type {other}"
            ))),
        }
    }
}

pub fn encode_record(record: &TestRecord) -> Vec<u8> {
    let bytes = match record {
        TestRecord::User(user) => bincode::serialize(user),
        TestRecord::Venue(venue) => bincode::serialize(venue),
        TestRecord::Doc(doc) => bincode::serialize(doc),
    };
    bytes.expect("fixture records always serialize")
}

/// Write the record bytes under the store layout, bypassing any index
/// maintenance (tests use this both for seeding and for manufacturing
/// corruption).
pub fn write_record_bytes<T: Transaction>(
    txn: &mut T,
    layout: &StoreLayout,
    record: &TestRecord,
) {
    let key = layout.record_key(record.record_type(), &record.primary_key());
    txn.set(&key, &encode_record(record));
}

/// Delete the record bytes, again bypassing maintenance.
pub fn clear_record_bytes<T: Transaction>(
    txn: &mut T,
    layout: &StoreLayout,
    record: &TestRecord,
) {
    let key = layout.record_key(record.record_type(), &record.primary_key());
    txn.clear(&key);
}

/// A fresh in-memory store with the standard test layout.
pub fn test_store() -> (MemoryKv, StoreLayout) {
    let kv = MemoryKv::new();
    let layout = StoreLayout::new(Subspace::new(b"S".to_vec()));
    (kv, layout)
}

/// A deterministic batch of users with round-robin regions.
pub fn sample_users(count: usize) -> Vec<User> {
    let regions = ["eu", "us", "apac"];

    (0..count)
        .map(|i| {
            User::new(i as i64 + 1, &format!("user{}@example.com", i + 1))
                .with_score((i as i64 * 7) % 100)
                .with_region(regions[i % regions.len()])
                .with_balance((i as i64 + 1) * 250)
        })
        .collect()
}
