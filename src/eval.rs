//! Offline evaluation of retrieval and answer quality.
//!
//! Retrieval is scored as keyword recall@k: the share of a case's relevant
//! keywords that appear (case-insensitively) in at least one of the top-k
//! retrieved chunks, averaged over cases. Answers, when requested, get a
//! 1–5 rubric score from overlap with the expected answer, whether a
//! retrieved source id is cited, and whether anything was said at all.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::generation::create_generator;
use crate::guard::MAX_TOP_K;
use crate::index::RetrievalIndex;
use crate::rag::{AskOutcome, AskRequest, Answerer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalCase {
    pub id: String,
    pub question: String,
    pub relevant_keywords: Vec<String>,
    #[serde(default)]
    pub expected_answer: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub id: String,
    pub question: String,
    pub retrieved_ids: Vec<String>,
    pub recall: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub run_id: String,
    pub index_model: String,
    pub cases_evaluated: usize,
    pub recall: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_score: Option<f64>,
    pub cases: Vec<CaseResult>,
}

pub fn load_cases(path: &Path) -> Result<Vec<EvalCase>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read eval set {}", path.display()))?;
    let cases: Vec<EvalCase> = serde_json::from_str(&text)
        .with_context(|| format!("Invalid eval set {}", path.display()))?;
    if let Some(c) = cases.iter().find(|c| c.relevant_keywords.is_empty()) {
        bail!("eval case {} has no relevant_keywords", c.id);
    }
    Ok(cases)
}

fn recall_key(k: usize) -> String {
    format!("recall@{}", k)
}

/// Fraction of `keywords` found in the first `k` of `texts` (already lowercased).
pub fn recall_at_k(keywords: &[String], texts: &[String], k: usize) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let top = &texts[..k.min(texts.len())];
    let found = keywords
        .iter()
        .filter(|kw| {
            let kw = kw.to_lowercase();
            top.iter().any(|t| t.contains(&kw))
        })
        .count();
    found as f64 / keywords.len() as f64
}

fn content_words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .map(|w| w.to_string())
        .collect()
}

/// 1–5 rubric. Empty answers score 1; a non-empty answer starts at 2, gains
/// up to 2 for overlap with the expected answer's content words and 1 for
/// citing a retrieved source id.
pub fn rubric_score(answer: &str, expected: Option<&str>, source_ids: &[String]) -> u8 {
    let answer = answer.trim();
    if answer.is_empty() {
        return 1;
    }
    let mut score = 2u8;

    if let Some(expected) = expected {
        let wanted = content_words(expected);
        if !wanted.is_empty() {
            let have = content_words(answer);
            let hits = wanted.iter().filter(|w| have.contains(*w)).count();
            let overlap = hits as f64 / wanted.len() as f64;
            if overlap >= 0.5 {
                score += 2;
            } else if overlap >= 0.2 {
                score += 1;
            }
        }
    }

    if source_ids.iter().any(|id| answer.contains(id.as_str())) {
        score += 1;
    }
    score.min(5)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

pub async fn evaluate(
    answerer: &Answerer,
    cases: &[EvalCase],
    ks: &[usize],
    with_answers: bool,
) -> crate::error::Result<EvalReport> {
    let max_k = ks.iter().copied().max().unwrap_or(1).clamp(1, MAX_TOP_K);
    let mut results = Vec::with_capacity(cases.len());

    for case in cases {
        let hits = answerer.retrieve(&case.question, max_k).await?;
        let texts: Vec<String> = hits.iter().map(|h| h.text.to_lowercase()).collect();
        let retrieved_ids: Vec<String> = hits.iter().map(|h| h.id.clone()).collect();
        let recall = ks
            .iter()
            .map(|&k| (recall_key(k), recall_at_k(&case.relevant_keywords, &texts, k)))
            .collect();

        let mut result = CaseResult {
            id: case.id.clone(),
            question: case.question.clone(),
            retrieved_ids,
            recall,
            answer: None,
            score: None,
            error: None,
        };

        if with_answers {
            let req = AskRequest {
                question: case.question.clone(),
                top_k: Some(max_k),
                model: None,
            };
            match answerer.ask(&req).await {
                Ok(AskOutcome::Answered(ans)) => {
                    let ids: Vec<String> = ans.sources.iter().map(|s| s.id.clone()).collect();
                    result.score = Some(rubric_score(&ans.answer, case.expected_answer.as_deref(), &ids));
                    result.answer = Some(ans.answer);
                }
                Ok(AskOutcome::GenerationFailed { error, .. }) => {
                    result.score = Some(1);
                    result.error = Some(error);
                }
                Err(e) => {
                    result.score = Some(1);
                    result.error = Some(e.to_string());
                }
            }
        }
        tracing::debug!(case = %case.id, "evaluated");
        results.push(result);
    }

    let recall = ks
        .iter()
        .map(|&k| {
            let key = recall_key(k);
            let avg = mean(results.iter().filter_map(|r| r.recall.get(&key).copied())).unwrap_or(0.0);
            (key, avg)
        })
        .collect();
    let mean_score = mean(results.iter().filter_map(|r| r.score.map(f64::from)));

    Ok(EvalReport {
        run_id: Uuid::new_v4().to_string(),
        index_model: answerer.index().map(|i| i.model.clone()).unwrap_or_default(),
        cases_evaluated: results.len(),
        recall,
        mean_score,
        cases: results,
    })
}

/// CLI entry point for `copilot eval`.
pub async fn run_eval(
    config: &Config,
    queries: &Path,
    ks: &[usize],
    with_answers: bool,
    out: Option<PathBuf>,
) -> Result<()> {
    if ks.is_empty() || ks.iter().any(|k| !(1..=MAX_TOP_K).contains(k)) {
        bail!("--k values must be in [1, {}]", MAX_TOP_K);
    }
    let cases = load_cases(queries)?;
    let index = RetrievalIndex::load(&config.retrieval.index_path)?;
    let generator = create_generator(&config.generation)?;
    let answerer = Answerer::new(config, Some(Arc::new(index)), generator)?;

    let report = evaluate(&answerer, &cases, ks, with_answers).await?;

    println!("Evaluated {} queries (run {})", report.cases_evaluated, report.run_id);
    for (metric, value) in &report.recall {
        println!("  {:<10} {:.3}", metric, value);
    }
    if let Some(s) = report.mean_score {
        println!("  {:<10} {:.2}", "score", s);
    }

    if let Some(out) = out {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", out.display()))?;
        println!("Report written to {}", out.display());
    }
    Ok(())
}
