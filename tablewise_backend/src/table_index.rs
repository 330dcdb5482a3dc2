use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::catalog::TableMetadata;
use crate::embedding::{cosine_similarity, Embedding};

/// One indexed table document.
#[derive(Debug, Clone)]
pub struct IndexedTable {
    pub id: String,
    /// The text that was embedded (the table description).
    pub document: String,
    pub metadata: TableMetadata,
    pub embedding: Embedding,
}

impl IndexedTable {
    pub fn new(metadata: TableMetadata, embedding: Embedding) -> Self {
        Self {
            id: metadata.document_id(),
            document: metadata.description.clone(),
            metadata,
            embedding,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TableMatch {
    pub table: IndexedTable,
    pub score: f32,
}

/// In-memory similarity index over table descriptions.
///
/// Writes replace whole entries by id; reads take a shared lock, so a
/// reconfiguration never interleaves with a running query.
#[derive(Default)]
pub struct TableIndex {
    documents: RwLock<HashMap<String, IndexedTable>>,
}

impl TableIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete every id in `tables`, then insert them. Never merges.
    pub async fn upsert(&self, tables: Vec<IndexedTable>) {
        let mut documents = self.documents.write().await;
        for table in &tables {
            documents.remove(&table.id);
        }
        for table in tables {
            documents.insert(table.id.clone(), table);
        }
    }

    /// Top `k` documents by cosine similarity; ties broken by id.
    pub async fn query(&self, query_embedding: &[f32], k: usize) -> Vec<TableMatch> {
        let documents = self.documents.read().await;
        let mut matches = documents
            .values()
            .map(|table| TableMatch {
                score: cosine_similarity(query_embedding, &table.embedding),
                table: table.clone(),
            })
            .collect::<Vec<_>>();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.table.id.cmp(&b.table.id))
        });
        matches.truncate(k);
        matches
    }

    pub async fn get(&self, id: &str) -> Option<IndexedTable> {
        self.documents.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }
}
