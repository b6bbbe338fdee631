//! Document conventions
//!
//! Collection naming, document id generation and pluggable JSON encoders.

use crate::error::BulkInsertError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

/// Metadata key holding the document's collection
pub const METADATA_COLLECTION: &str = "@collection";

/// Metadata key holding an explicit document id
pub const METADATA_ID: &str = "@id";

/// Entity field read as the document id when present
pub const ENTITY_ID_FIELD: &str = "Id";

/// Reserved trailing character of document ids
pub const ID_SEPARATOR: char = '|';

/// Document metadata
pub type Metadata = serde_json::Map<String, Value>;

/// Generates ids for entities stored without one
#[async_trait]
pub trait DocumentIdGenerator: Send + Sync {
    async fn generate_document_id(
        &self,
        collection: &str,
        entity: &Value,
    ) -> Result<String, BulkInsertError>;
}

/// Client-local `{collection}/{n}` ids
///
/// Counters are per collection and per generator instance. Callers that need
/// cluster-wide uniqueness plug in their own generator.
#[derive(Debug, Default)]
pub struct SequentialIdGenerator {
    counters: Mutex<HashMap<String, u64>>,
}

#[async_trait]
impl DocumentIdGenerator for SequentialIdGenerator {
    async fn generate_document_id(
        &self,
        collection: &str,
        _entity: &Value,
    ) -> Result<String, BulkInsertError> {
        let prefix = collection.to_lowercase();
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = counters.entry(prefix.clone()).or_insert(0);
        *next += 1;
        Ok(format!("{}/{}", prefix, next))
    }
}

/// Custom JSON encoding of entities and metadata
///
/// Returning `Ok(false)` falls back to the default serde_json encoding. An
/// encoder that returns `Ok(true)` must have written exactly one JSON value.
pub trait EntityEncoder: Send + Sync {
    fn try_encode_entity(&self, entity: &Value, out: &mut dyn io::Write)
        -> Result<bool, BulkInsertError>;

    fn try_encode_metadata(
        &self,
        _metadata: &Metadata,
        _out: &mut dyn io::Write,
    ) -> Result<bool, BulkInsertError> {
        Ok(false)
    }
}

type CollectionNamer = dyn Fn(&str) -> String + Send + Sync;

/// Conventions shared by every session of a client
#[derive(Clone)]
pub struct Conventions {
    /// Id generator for entities without an explicit id
    pub id_generator: Arc<dyn DocumentIdGenerator>,
    /// Session-wide custom encoder
    pub entity_encoder: Option<Arc<dyn EntityEncoder>>,
    collection_namer: Arc<CollectionNamer>,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            id_generator: Arc::new(SequentialIdGenerator::default()),
            entity_encoder: None,
            collection_namer: Arc::new(default_collection_name),
        }
    }
}

impl std::fmt::Debug for Conventions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conventions")
            .field("entity_encoder", &self.entity_encoder.is_some())
            .finish_non_exhaustive()
    }
}

impl Conventions {
    pub fn with_id_generator(mut self, generator: Arc<dyn DocumentIdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn with_entity_encoder(mut self, encoder: Arc<dyn EntityEncoder>) -> Self {
        self.entity_encoder = Some(encoder);
        self
    }

    /// Replace the type-name → collection-name mapping
    pub fn with_collection_namer<F>(mut self, namer: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.collection_namer = Arc::new(namer);
        self
    }

    /// Collection name for entities of type `T`
    pub fn collection_name<T: ?Sized>(&self) -> String {
        (self.collection_namer)(short_type_name::<T>())
    }
}

/// Unqualified type name without generic arguments
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// Pluralized type name, e.g. `User` → `Users`, `Company` → `Companies`
pub fn default_collection_name(type_name: &str) -> String {
    pluralize(type_name)
}

fn pluralize(word: &str) -> String {
    if word.is_empty() {
        return word.to_string();
    }
    let lower = word.to_lowercase();
    if lower.ends_with('s')
        || lower.ends_with('x')
        || lower.ends_with('z')
        || lower.ends_with("ch")
        || lower.ends_with("sh")
    {
        return format!("{}es", word);
    }
    if let Some(stem) = word.strip_suffix('y').or_else(|| word.strip_suffix('Y')) {
        let before_y = stem.chars().last().map(|c| c.to_ascii_lowercase());
        if !matches!(before_y, Some('a' | 'e' | 'i' | 'o' | 'u')) {
            return format!("{}ies", stem);
        }
    }
    format!("{}s", word)
}

/// Check an explicit document id
///
/// # Errors
///
/// Returns `InvalidIdentifier` if the id is empty or ends with `|`.
pub fn verify_valid_id(id: &str) -> Result<(), BulkInsertError> {
    if id.is_empty() {
        return Err(BulkInsertError::InvalidIdentifier(
            "Document id must have a non empty value".to_string(),
        ));
    }
    if id.ends_with(ID_SEPARATOR) {
        return Err(BulkInsertError::InvalidIdentifier(format!(
            "Document ids cannot end with '{}', but was called with {}",
            ID_SEPARATOR, id
        )));
    }
    Ok(())
}
