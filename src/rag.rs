//! Retrieval-augmented answers to FinOps questions.
//!
//! The flow for one question: guard, embed the query, search the index,
//! redact the hits, assemble a bounded prompt, call the generator. A
//! generation failure still hands back the retrieved sources; an index
//! that is missing or unusable is a retrieval error and never touches the
//! KPI side of the service.

use anyhow::bail;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{Config, EmbeddingConfig, GenerationConfig};
use crate::embedding;
use crate::error::{CopilotError, Result};
use crate::generation::{create_generator, ChatMessage, Generator};
use crate::guard::{check_model, check_top_k, PromptGuard};
use crate::index::{RetrievalIndex, SearchHit};

pub const SYSTEM_PROMPT: &str = "You are a FinOps assistant. Answer using ONLY the provided context chunks. \
If you see resources with 'unassigned' ownership, highlight this as a problem that needs fixing \
and reference FinOps guidance about proper tagging. \
Be specific about cost impacts when possible. \
Be concise and cite the source ids you used in the answer.";

const FEW_SHOT: &[(&str, &str)] = &[
    (
        "What should I do with idle resources?",
        "Terminate or stop resources idle >30 days; estimate savings by current monthly cost x 0.7. [finops_1]",
    ),
    (
        "How do tags help with cost?",
        "Tags let you attribute cost to teams/projects; missing tags create unknown spend and prevent accountability. [finops_2]",
    ),
];

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub model: String,
    pub sources: Vec<SearchHit>,
}

#[derive(Debug, Clone)]
pub enum AskOutcome {
    Answered(Answer),
    GenerationFailed { error: String, sources: Vec<SearchHit> },
}

pub struct Answerer {
    index: Option<Arc<RetrievalIndex>>,
    generator: Arc<dyn Generator>,
    guard: PromptGuard,
    embedding: EmbeddingConfig,
    generation: GenerationConfig,
    default_top_k: usize,
    max_context_chars: usize,
}

impl Answerer {
    pub fn new(
        config: &Config,
        index: Option<Arc<RetrievalIndex>>,
        generator: Arc<dyn Generator>,
    ) -> Result<Self> {
        Ok(Self {
            index,
            generator,
            guard: PromptGuard::new(&config.retrieval.denylist)?,
            embedding: config.embedding.clone(),
            generation: config.generation.clone(),
            default_top_k: config.retrieval.top_k,
            max_context_chars: config.retrieval.max_context_chars,
        })
    }

    pub fn index(&self) -> Option<&Arc<RetrievalIndex>> {
        self.index.as_ref()
    }

    /// Top-`k` hits for an already-validated question, redacted.
    pub async fn retrieve(&self, question: &str, top_k: usize) -> Result<Vec<SearchHit>> {
        let index = self
            .index
            .as_ref()
            .ok_or_else(|| CopilotError::Retrieval("no index loaded; run `copilot index build`".to_string()))?;

        // Vectors from different models are not comparable even at equal dims.
        let provider = embedding::create_provider(&self.embedding)
            .map_err(|e| CopilotError::Retrieval(format!("embedding provider unavailable: {}", e)))?;
        if index.model != provider.model_name() {
            return Err(CopilotError::Retrieval(format!(
                "index built with model {}, provider is {}; rebuild with `copilot index build`",
                index.model,
                provider.model_name()
            )));
        }

        let query = embedding::embed_query(&self.embedding, question)
            .await
            .map_err(|e| CopilotError::Retrieval(format!("query embedding failed: {}", e)))?;
        let mut hits = index.search(&query, top_k)?;
        for hit in &mut hits {
            hit.text = self.guard.redact(&hit.text);
        }
        Ok(hits)
    }

    pub async fn ask(&self, req: &AskRequest) -> Result<AskOutcome> {
        let top_k = check_top_k(req.top_k.unwrap_or(self.default_top_k))?;
        let model = check_model(&self.generation, req.model.as_deref())?;
        let question = self.guard.check_question(&req.question)?;

        let sources = self.retrieve(&question, top_k).await?;
        let context = build_context(&sources, self.max_context_chars);
        let messages = build_messages(&question, &context);

        tracing::info!(top_k, model = %model, hits = sources.len(), "answering question");
        match self.generator.generate(&model, &messages).await {
            Ok(answer) => Ok(AskOutcome::Answered(Answer {
                answer,
                model,
                sources,
            })),
            Err(e) => {
                tracing::warn!(error = %e, "generation failed, returning sources only");
                Ok(AskOutcome::GenerationFailed {
                    error: e.to_string(),
                    sources,
                })
            }
        }
    }
}

/// `[id] text` blocks in rank order, stopping before the first block that
/// would overflow `max_chars`. A first block that is too long on its own is
/// truncated instead of dropped.
pub fn build_context(hits: &[SearchHit], max_chars: usize) -> String {
    let mut out = String::new();
    let mut used = 0usize;
    for (i, hit) in hits.iter().enumerate() {
        let entry = format!("[{}] {}", hit.id, hit.text);
        let sep = if i == 0 { 0 } else { 2 };
        let len = entry.chars().count();
        if used + sep + len <= max_chars {
            if sep > 0 {
                out.push_str("\n\n");
            }
            out.push_str(&entry);
            used += sep + len;
        } else {
            if i == 0 {
                out = entry.chars().take(max_chars).collect();
            }
            break;
        }
    }
    out
}

pub fn build_messages(question: &str, context: &str) -> Vec<ChatMessage> {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    for (q, a) in FEW_SHOT {
        messages.push(ChatMessage::user(*q));
        messages.push(ChatMessage::assistant(*a));
    }
    messages.push(ChatMessage::user(format!(
        "Context:\n{}\n\nQuestion: {}\n\nAnswer concisely and include source ids (e.g. [finops_1] or [bill_res-23_2025-08]).",
        context, question
    )));
    messages
}

/// Loads the index named in config, or `None` (with a warning) when it is
/// missing or unreadable.
pub fn load_index(config: &Config) -> Option<Arc<RetrievalIndex>> {
    match RetrievalIndex::load(&config.retrieval.index_path) {
        Ok(idx) => Some(Arc::new(idx)),
        Err(e) => {
            tracing::warn!(error = %e, "retrieval index not available");
            None
        }
    }
}

fn print_sources(sources: &[SearchHit]) {
    println!();
    println!("Sources:");
    for s in sources {
        println!("  [{}] ({:.3}) {}", s.id, s.score, s.text);
    }
}

/// CLI entry point for `copilot ask`.
pub async fn run_ask(
    config: &Config,
    question: &str,
    top_k: Option<usize>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let index = RetrievalIndex::load(&config.retrieval.index_path)?;
    let generator = create_generator(&config.generation)?;
    let answerer = Answerer::new(config, Some(Arc::new(index)), generator)?;

    let req = AskRequest {
        question: question.to_string(),
        top_k,
        model,
    };
    match answerer.ask(&req).await? {
        AskOutcome::Answered(answer) => {
            println!("{}", answer.answer);
            print_sources(&answer.sources);
            Ok(())
        }
        AskOutcome::GenerationFailed { error, sources } => {
            print_sources(&sources);
            bail!("{}", error)
        }
    }
}
