//! Retrieval index: build, persist, load, search.
//!
//! The index is a single JSON file:
//!
//! ```text
//! { "version": 1, "model": "...", "dims": 384, "built_at": "...",
//!   "chunks": [ { "id", "source", "text", "meta", "hash", "embedding" } ] }
//! ```
//!
//! `embedding` is base64 of little-endian f32 bytes. Chunks come from two
//! places: FinOps docs under `[retrieval].docs_dir` (ids `finops_N`) and
//! one summary line per resource-month of billing (ids `bill_<rid>_<month>`).
//!
//! Rebuilds write a temp file and rename it over the serving file. A rebuild
//! reuses the embedding of any chunk whose text hash is unchanged, as long as
//! the model and dimensions still match.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use walkdir::WalkDir;

use crate::analytics::Dataset;
use crate::chunk::{split_paragraphs, text_hash};
use crate::config::Config;
use crate::db;
use crate::embedding::{self, blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::CopilotError;
use crate::models::DocumentChunk;

pub const INDEX_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    model: String,
    dims: usize,
    built_at: DateTime<Utc>,
    chunks: Vec<StoredChunk>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredChunk {
    id: String,
    source: String,
    text: String,
    #[serde(default)]
    meta: serde_json::Value,
    #[serde(default)]
    hash: String,
    embedding: String,
}

/// An immutable, fully embedded chunk set. Shared read-only by handlers.
#[derive(Debug, Clone)]
pub struct RetrievalIndex {
    pub model: String,
    pub dims: usize,
    pub built_at: DateTime<Utc>,
    chunks: Vec<DocumentChunk>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub source: String,
    pub text: String,
    pub meta: serde_json::Value,
    pub score: f32,
}

impl RetrievalIndex {
    pub fn new(model: impl Into<String>, dims: usize, chunks: Vec<DocumentChunk>) -> Self {
        Self {
            model: model.into(),
            dims,
            built_at: Utc::now(),
            chunks,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[DocumentChunk] {
        &self.chunks
    }

    /// Load and validate an index file. Any failure is a retrieval error so
    /// callers can answer 503 without touching the KPI side.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            CopilotError::Retrieval(format!("cannot read index {}: {}", path.display(), e))
        })?;
        let file: IndexFile = serde_json::from_slice(&bytes)
            .map_err(|e| CopilotError::Retrieval(format!("corrupt index file: {}", e)))?;
        if file.version != INDEX_VERSION {
            return Err(CopilotError::Retrieval(format!(
                "unsupported index version {} (expected {})",
                file.version, INDEX_VERSION
            )));
        }

        let mut chunks = Vec::with_capacity(file.chunks.len());
        for stored in file.chunks {
            let bytes = STANDARD.decode(stored.embedding.as_bytes()).map_err(|e| {
                CopilotError::Retrieval(format!("chunk {}: bad embedding encoding: {}", stored.id, e))
            })?;
            let embedding = blob_to_vec(&bytes);
            if embedding.len() != file.dims {
                return Err(CopilotError::Retrieval(format!(
                    "chunk {} has {} dims, index declares {}",
                    stored.id,
                    embedding.len(),
                    file.dims
                )));
            }
            if embedding.iter().any(|v| !v.is_finite()) {
                return Err(CopilotError::Retrieval(format!(
                    "chunk {} has non-finite embedding values",
                    stored.id
                )));
            }
            let hash = if stored.hash.is_empty() {
                text_hash(&stored.text)
            } else {
                stored.hash
            };
            chunks.push(DocumentChunk {
                id: stored.id,
                source: stored.source,
                text: stored.text,
                meta: stored.meta,
                hash,
                embedding,
            });
        }

        tracing::info!(path = %path.display(), chunks = chunks.len(), model = %file.model, "loaded retrieval index");
        Ok(Self {
            model: file.model,
            dims: file.dims,
            built_at: file.built_at,
            chunks,
        })
    }

    /// Write to `path` through a sibling temp file and an atomic rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = IndexFile {
            version: INDEX_VERSION,
            model: self.model.clone(),
            dims: self.dims,
            built_at: self.built_at,
            chunks: self
                .chunks
                .iter()
                .map(|c| StoredChunk {
                    id: c.id.clone(),
                    source: c.source.clone(),
                    text: c.text.clone(),
                    meta: c.meta.clone(),
                    hash: c.hash.clone(),
                    embedding: STANDARD.encode(vec_to_blob(&c.embedding)),
                })
                .collect(),
        };
        let bytes = serde_json::to_vec(&file)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move index into place at {}", path.display()))?;
        Ok(())
    }

    /// Top `k` chunks by cosine similarity. Ties keep index order, so the
    /// same query against the same index always returns the same list.
    pub fn search(&self, query: &[f32], k: usize) -> crate::error::Result<Vec<SearchHit>> {
        if query.len() != self.dims {
            return Err(CopilotError::Retrieval(format!(
                "query has {} dims, index has {}",
                query.len(),
                self.dims
            )));
        }
        let mut scored: Vec<(usize, f32)> = self
            .chunks
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let score = cosine_similarity(query, &c.embedding);
                // `+ 0.0` folds -0.0 into 0.0 so zero scores still tie.
                (i, if score.is_nan() { f32::NEG_INFINITY } else { score + 0.0 })
            })
            .collect();
        // sort_by is stable; total_cmp keeps the ordering total.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| {
                let c = &self.chunks[i];
                SearchHit {
                    id: c.id.clone(),
                    source: c.source.clone(),
                    text: c.text.clone(),
                    meta: c.meta.clone(),
                    score,
                }
            })
            .collect())
    }
}

fn unembedded(id: String, source: &str, text: String, meta: serde_json::Value) -> DocumentChunk {
    DocumentChunk {
        id,
        source: source.to_string(),
        hash: text_hash(&text),
        text,
        meta,
        embedding: Vec::new(),
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Paragraph chunks of every doc under `docs_dir` matching the globs, with
/// ids numbered from `finops_1`. Files are visited in path order so ids are
/// stable across rebuilds.
pub fn doc_chunks(docs_dir: &Path, globs: &[String], max_tokens: usize) -> Result<Vec<DocumentChunk>> {
    if !docs_dir.exists() {
        tracing::warn!(dir = %docs_dir.display(), "docs directory not found, indexing billing only");
        return Ok(Vec::new());
    }
    let include = build_globset(globs)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(docs_dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(docs_dir)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string();
        if include.is_match(&rel) {
            files.push((rel, path.to_path_buf()));
        }
    }
    files.sort();

    let mut chunks = Vec::new();
    for (rel, path) in files {
        let body = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        for (i, text) in split_paragraphs(&body, max_tokens).into_iter().enumerate() {
            let id = format!("finops_{}", chunks.len() + 1);
            let meta = serde_json::json!({ "path": rel, "chunk_index": i });
            chunks.push(unembedded(id, "finops_doc", text, meta));
        }
    }
    Ok(chunks)
}

/// One summary line per resource and invoice month. The service named is
/// the category with the largest cost that month.
pub fn billing_summaries(data: &Dataset, sentinel: &str) -> Vec<DocumentChunk> {
    struct Acc<'a> {
        cost: f64,
        by_category: BTreeMap<&'a str, f64>,
        owner: String,
        env: String,
    }

    let rows = data.enrich(sentinel);
    let mut groups: BTreeMap<(&str, &str), Acc<'_>> = BTreeMap::new();
    for row in &rows {
        let acc = groups
            .entry((row.record.resource_id.as_str(), row.record.invoice_month.as_str()))
            .or_insert_with(|| Acc {
                cost: 0.0,
                by_category: BTreeMap::new(),
                owner: row.owner.clone(),
                env: row.env.clone(),
            });
        acc.cost += row.record.amount;
        *acc.by_category.entry(row.record.category.as_str()).or_insert(0.0) += row.record.amount;
    }

    groups
        .into_iter()
        .map(|((rid, month), acc)| {
            let service = acc
                .by_category
                .iter()
                .fold(None::<(&str, f64)>, |best, (cat, cost)| match best {
                    Some((_, b)) if b >= *cost => best,
                    _ => Some((cat, *cost)),
                })
                .map(|(c, _)| c)
                .unwrap_or("unknown");
            let text = format!(
                "Resource {} ({}) in {}: cost {:.2}; owner: {}; env: {}.",
                rid, service, month, acc.cost, acc.owner, acc.env
            );
            let meta = serde_json::json!({
                "resource_id": rid,
                "month": month,
                "owner": acc.owner,
                "env": acc.env,
                "cost": acc.cost,
            });
            unembedded(format!("bill_{}_{}", rid, month), "billing", text, meta)
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildSummary {
    pub doc_chunks: usize,
    pub billing_chunks: usize,
    pub embedded: usize,
    pub reused: usize,
    pub dims: usize,
}

/// Embed `chunks` (reusing vectors from `previous` where the hash matches)
/// and return the finished index.
pub async fn embed_chunks(
    config: &Config,
    mut chunks: Vec<DocumentChunk>,
    previous: Option<&RetrievalIndex>,
) -> Result<(RetrievalIndex, usize, usize)> {
    let provider = embedding::create_provider(&config.embedding)?;
    let model = provider.model_name().to_string();
    let expected_dims = provider.dims();

    let reusable: HashMap<&str, &[f32]> = previous
        .filter(|p| p.model == model && (expected_dims == 0 || p.dims == expected_dims))
        .map(|p| {
            p.chunks
                .iter()
                .map(|c| (c.hash.as_str(), c.embedding.as_slice()))
                .collect()
        })
        .unwrap_or_default();

    let mut pending = Vec::new();
    let mut reused = 0usize;
    for (i, chunk) in chunks.iter_mut().enumerate() {
        match reusable.get(chunk.hash.as_str()) {
            Some(v) => {
                chunk.embedding = v.to_vec();
                reused += 1;
            }
            None => pending.push(i),
        }
    }

    let texts: Vec<String> = pending.iter().map(|&i| chunks[i].text.clone()).collect();
    if !texts.is_empty() {
        tracing::info!(count = texts.len(), provider = %config.embedding.provider, "embedding chunks");
        let vectors = embedding::embed_texts(&config.embedding, &texts).await?;
        for (&i, v) in pending.iter().zip(vectors) {
            chunks[i].embedding = v;
        }
    }

    let dims = chunks.first().map(|c| c.embedding.len()).unwrap_or(expected_dims);
    if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != dims) {
        bail!(
            "Embedding dimension mismatch on chunk {}: got {}, expected {}",
            bad.id,
            bad.embedding.len(),
            dims
        );
    }

    Ok((RetrievalIndex::new(model, dims, chunks), pending.len(), reused))
}

pub async fn build_index(config: &Config) -> Result<BuildSummary> {
    let r = &config.retrieval;
    let mut chunks = doc_chunks(&r.docs_dir, &r.doc_globs, r.max_chunk_tokens)?;
    let doc_count = chunks.len();

    if r.include_billing_summaries {
        let pool = db::connect(config).await?;
        let data = Dataset::load(&pool).await?;
        pool.close().await;
        chunks.extend(billing_summaries(&data, &config.analytics.unassigned_sentinel));
    }
    let billing_count = chunks.len() - doc_count;

    if chunks.is_empty() {
        bail!(
            "Nothing to index: no docs under {} and no billing data",
            r.docs_dir.display()
        );
    }

    let previous = if r.index_path.exists() {
        match RetrievalIndex::load(&r.index_path) {
            Ok(idx) => Some(idx),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring unreadable previous index");
                None
            }
        }
    } else {
        None
    };

    let (index, embedded, reused) = embed_chunks(config, chunks, previous.as_ref()).await?;
    index.save(&r.index_path)?;

    Ok(BuildSummary {
        doc_chunks: doc_count,
        billing_chunks: billing_count,
        embedded,
        reused,
        dims: index.dims,
    })
}

/// CLI entry point for `copilot index build`.
pub async fn run_index_build(config: &Config) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding].provider to build the index.");
    }
    let summary = build_index(config).await?;

    println!("Index built: {}", config.retrieval.index_path.display());
    println!("  doc chunks:     {}", summary.doc_chunks);
    println!("  billing chunks: {}", summary.billing_chunks);
    println!("  embedded:       {}", summary.embedded);
    println!("  reused:         {}", summary.reused);
    println!("  dims:           {}", summary.dims);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BillingRecord, Resource};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn chunk(id: &str, embedding: Vec<f32>) -> DocumentChunk {
        DocumentChunk {
            id: id.to_string(),
            source: "finops_doc".to_string(),
            text: format!("text of {}", id),
            meta: serde_json::Value::Null,
            hash: text_hash(&format!("text of {}", id)),
            embedding,
        }
    }

    fn hashing_config(dir: &Path) -> Config {
        let text = format!(
            "[db]\npath = \"{}\"\n[retrieval]\nindex_path = \"{}\"\ndocs_dir = \"{}\"\ninclude_billing_summaries = false\n[embedding]\nprovider = \"hashing\"\ndims = 64\n",
            dir.join("db.sqlite").display(),
            dir.join("index.json").display(),
            dir.join("docs").display(),
        );
        toml::from_str(&text).unwrap()
    }

    #[test]
    fn search_orders_by_score_then_insertion() {
        let index = RetrievalIndex::new(
            "test",
            2,
            vec![
                chunk("a", vec![0.0, 1.0]),
                chunk("b", vec![1.0, 0.0]),
                chunk("c", vec![2.0, 0.0]),
                chunk("d", vec![1.0, 1.0]),
            ],
        );
        let hits = index.search(&[1.0, 0.0], 3).unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);
    }

    #[test]
    fn search_is_repeatable() {
        let index = RetrievalIndex::new(
            "test",
            2,
            (0..10).map(|i| chunk(&format!("c{}", i), vec![1.0, (i % 3) as f32])).collect(),
        );
        let first = index.search(&[0.3, 0.7], 5).unwrap();
        let second = index.search(&[0.3, 0.7], 5).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn search_rejects_wrong_dims() {
        let index = RetrievalIndex::new("test", 2, vec![chunk("a", vec![1.0, 0.0])]);
        assert!(matches!(
            index.search(&[1.0, 0.0, 0.0], 1),
            Err(CopilotError::Retrieval(_))
        ));
    }

    #[test]
    fn search_ranks_nan_scores_last_without_panicking() {
        let chunks = (0..64)
            .map(|i| {
                let embedding = if i % 3 == 0 {
                    vec![f32::NAN, 1.0]
                } else {
                    vec![1.0, (i % 5) as f32]
                };
                chunk(&format!("c{}", i), embedding)
            })
            .collect();
        let index = RetrievalIndex::new("test", 2, chunks);
        let hits = index.search(&[1.0, 0.2], 5).unwrap();
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|h| h.score.is_finite()));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));

        let all = index.search(&[1.0, 0.2], 64).unwrap();
        assert_eq!(all.len(), 64);
        assert!(all[..42].iter().all(|h| h.score.is_finite()));
        assert!(all[42..].iter().all(|h| h.score == f32::NEG_INFINITY));
    }

    #[test]
    fn load_rejects_non_finite_embeddings() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        let index = RetrievalIndex::new(
            "test",
            2,
            vec![chunk("ok", vec![1.0, 0.0]), chunk("bad", vec![f32::NAN, 1.0])],
        );
        index.save(&path).unwrap();
        match RetrievalIndex::load(&path) {
            Err(CopilotError::Retrieval(msg)) => assert!(msg.contains("bad")),
            other => panic!("expected retrieval error, got {:?}", other.map(|i| i.chunks().len())),
        }
    }

    #[test]
    fn save_then_load_preserves_chunks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("index.json");
        let index = RetrievalIndex::new("test", 3, vec![chunk("a", vec![0.5, -1.25, 3.0])]);
        index.save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = RetrievalIndex::load(&path).unwrap();
        assert_eq!(loaded.model, "test");
        assert_eq!(loaded.chunks(), index.chunks());
    }

    #[test]
    fn missing_or_corrupt_index_is_retrieval_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        assert!(matches!(RetrievalIndex::load(&path), Err(CopilotError::Retrieval(_))));
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(RetrievalIndex::load(&path), Err(CopilotError::Retrieval(_))));
    }

    #[test]
    fn doc_chunks_use_sequential_ids_in_path_order() {
        let dir = TempDir::new().unwrap();
        let docs = dir.path().join("docs");
        std::fs::create_dir_all(docs.join("sub")).unwrap();
        std::fs::write(docs.join("b.md"), "Beta one.\n\nBeta two.").unwrap();
        std::fs::write(docs.join("a.md"), "Alpha.").unwrap();
        std::fs::write(docs.join("sub").join("c.txt"), "Gamma.").unwrap();
        std::fs::write(docs.join("skip.csv"), "x,y").unwrap();

        let chunks = doc_chunks(&docs, &["**/*.md".to_string(), "**/*.txt".to_string()], 200).unwrap();
        let ids: Vec<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["finops_1", "finops_2", "finops_3", "finops_4"]);
        assert_eq!(chunks[0].text, "Alpha.");
        assert_eq!(chunks[1].text, "Beta one.");
        assert_eq!(chunks[2].text, "Beta two.");
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].text, "Gamma.");
    }

    #[test]
    fn shipped_playbook_ids_match_answer_examples() {
        let docs = Path::new(env!("CARGO_MANIFEST_DIR")).join("docs");
        let cfg = crate::config::RetrievalConfig::default();
        let chunks = doc_chunks(&docs, &cfg.doc_globs, cfg.max_chunk_tokens).unwrap();
        assert_eq!(chunks[0].id, "finops_1");
        assert!(chunks[0].text.contains("## Idle resources"));
        assert!(chunks[0].text.contains("no usage for 30 days is idle"));
        assert_eq!(chunks[1].id, "finops_2");
        assert!(chunks[1].text.contains("## Tagging and ownership"));
        assert!(chunks[1].text.contains("owner tag"));
    }

    #[test]
    fn billing_summary_lines() {
        let d = NaiveDate::from_ymd_opt(2025, 8, 3).unwrap();
        let data = Dataset {
            billing: vec![
                BillingRecord::new("vm-1", d, "Compute", 30.0, 3.0),
                BillingRecord::new("vm-1", d, "Storage", 5.0, 1.0),
            ],
            resources: vec![Resource::tagged("vm-1", "team-A", "proj-alpha", "prod")],
            skipped: 0,
        };
        let chunks = billing_summaries(&data, "unassigned");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "bill_vm-1_2025-08");
        assert_eq!(
            chunks[0].text,
            "Resource vm-1 (Compute) in 2025-08: cost 35.00; owner: team-A; env: prod."
        );
    }

    #[tokio::test]
    async fn rebuild_reuses_unchanged_embeddings() {
        let dir = TempDir::new().unwrap();
        let config = hashing_config(dir.path());
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs").join("tips.md"), "Tag everything.\n\nStop idle VMs.").unwrap();

        let first = build_index(&config).await.unwrap();
        assert_eq!(first.embedded, 2);
        assert_eq!(first.reused, 0);

        let second = build_index(&config).await.unwrap();
        assert_eq!(second.embedded, 0);
        assert_eq!(second.reused, 2);

        let index = RetrievalIndex::load(&config.retrieval.index_path).unwrap();
        assert_eq!(index.dims, 64);
    }
}
