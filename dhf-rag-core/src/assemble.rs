//! Tiered, token-budgeted context assembly
//!
//! Tier 1 holds instructions, document summaries and referenced master
//! record material and is never dropped. Tier 2 holds ranked procedure
//! chunks and tier 3 ranked context chunks; when the rendered fragment is
//! over budget, whole entries are dropped from the tail of tier 3, then
//! tier 2.

use crate::config::RetrievalConfig;
use crate::document::{CategoryKey, Summary};
use crate::policy::RetrievalPolicy;
use crate::reference::{Reference, ReferenceSet};
use crate::store::{CategoryFilter, ChunkId, ScoredChunk, VectorStore};
use crate::tokens::TokenEstimator;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Per-request retrieval knobs
#[derive(Debug, Clone, Default)]
pub struct RetrievalOptions {
    pub procedure_top_k: usize,
    pub context_top_k: usize,
    pub max_tokens: usize,
    /// Master record fields available to `[Master Record|field]`
    pub master_record: BTreeMap<String, String>,
    /// Checklist text available to `[Master Checklist]`
    pub master_checklist: Option<String>,
}

impl RetrievalOptions {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            procedure_top_k: config.procedure_top_k,
            context_top_k: config.context_top_k,
            max_tokens: config.max_tokens,
            ..Self::default()
        }
    }

    pub fn with_top_k(mut self, procedure_top_k: usize, context_top_k: usize) -> Self {
        self.procedure_top_k = procedure_top_k;
        self.context_top_k = context_top_k;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_master_record(mut self, fields: BTreeMap<String, String>) -> Self {
        self.master_record = fields;
        self
    }

    pub fn with_master_checklist(mut self, checklist: impl Into<String>) -> Self {
        self.master_checklist = Some(checklist.into());
        self
    }
}

/// A retrieved chunk, detached from the store
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedChunk {
    pub id: ChunkId,
    pub file_name: String,
    pub relative_path: String,
    pub category: String,
    pub subcategory: String,
    pub chunk_index: usize,
    pub content: String,
    pub similarity: f32,
}

impl From<ScoredChunk<'_>> for RankedChunk {
    fn from(scored: ScoredChunk<'_>) -> Self {
        let meta = &scored.chunk.metadata;
        Self {
            id: scored.chunk.id.clone(),
            file_name: meta.file_name.clone(),
            relative_path: meta.relative_path.clone(),
            category: meta.category.clone(),
            subcategory: meta.subcategory.clone(),
            chunk_index: meta.chunk_index,
            content: meta.content.clone(),
            similarity: scored.similarity,
        }
    }
}

/// Bounded context handed to the generator
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPackage {
    pub summaries: Vec<Summary>,
    pub ranked_procedure_chunks: Vec<RankedChunk>,
    pub ranked_context_chunks: Vec<RankedChunk>,
    /// File names contributing to the fragment, first appearance order
    pub sources: Vec<String>,
    pub fragment: String,
    pub estimated_tokens: usize,
    /// Tier 1 alone exceeded `max_tokens`
    pub over_budget: bool,
    pub references: Vec<Reference>,
}

pub struct ContextAssembler<'a> {
    instructions: &'a str,
    procedures_category: &'a str,
    policy: &'a RetrievalPolicy,
    estimator: &'a TokenEstimator,
}

impl<'a> ContextAssembler<'a> {
    pub fn new(
        instructions: &'a str,
        procedures_category: &'a str,
        policy: &'a RetrievalPolicy,
        estimator: &'a TokenEstimator,
    ) -> Self {
        Self {
            instructions,
            procedures_category,
            policy,
            estimator,
        }
    }

    pub fn assemble(
        &self,
        store: &VectorStore,
        summaries: &[Summary],
        query: &[f32],
        refs: &ReferenceSet,
        options: &RetrievalOptions,
    ) -> ContextPackage {
        let summaries: Vec<Summary> = self
            .policy
            .filter(summaries.iter().collect::<Vec<&Summary>>(), refs)
            .into_iter()
            .cloned()
            .collect();
        let tier1 = self.render_tier1(&summaries, refs, options);

        let mut procedures = self.rank_procedures(store, query, refs, options.procedure_top_k);
        let mut context = self.rank_context(store, query, refs, options.context_top_k);

        let mut fragment = render(&tier1, &procedures, &context);
        let mut estimated_tokens = self.estimator.estimate(&fragment);
        let mut over_budget = false;

        while estimated_tokens > options.max_tokens {
            if context.pop().is_none() && procedures.pop().is_none() {
                over_budget = true;
                tracing::warn!(
                    estimated_tokens,
                    max_tokens = options.max_tokens,
                    "instructions and summaries alone exceed the token budget"
                );
                break;
            }
            fragment = render(&tier1, &procedures, &context);
            estimated_tokens = self.estimator.estimate(&fragment);
        }

        let mut sources: Vec<String> = Vec::new();
        let names = summaries
            .iter()
            .map(|s| &s.file_name)
            .chain(procedures.iter().map(|c| &c.file_name))
            .chain(context.iter().map(|c| &c.file_name));
        for name in names {
            if !sources.contains(name) {
                sources.push(name.clone());
            }
        }

        ContextPackage {
            summaries,
            ranked_procedure_chunks: procedures,
            ranked_context_chunks: context,
            sources,
            fragment,
            estimated_tokens,
            over_budget,
            references: refs.references().to_vec(),
        }
    }

    /// Procedure chunks, narrowed to referenced subcategories when any match.
    fn rank_procedures(
        &self,
        store: &VectorStore,
        query: &[f32],
        refs: &ReferenceSet,
        top_k: usize,
    ) -> Vec<RankedChunk> {
        let filter = CategoryFilter::include(&[self.procedures_category]);
        let ranked = self
            .policy
            .filter(store.search(query, store.len(), Some(&filter)), refs);

        let wanted = refs.procedure_subcategories();
        let narrowed: Vec<ScoredChunk<'_>> = if wanted.is_empty() {
            ranked
        } else {
            let matching: Vec<ScoredChunk<'_>> = ranked
                .iter()
                .copied()
                .filter(|s| wanted.contains(&CategoryKey::new(&s.chunk.metadata.subcategory)))
                .collect();
            if matching.is_empty() {
                tracing::debug!(?wanted, "no procedure chunks in referenced subcategories");
                ranked
            } else {
                matching
            }
        };

        narrowed.into_iter().take(top_k).map(RankedChunk::from).collect()
    }

    fn rank_context(
        &self,
        store: &VectorStore,
        query: &[f32],
        refs: &ReferenceSet,
        top_k: usize,
    ) -> Vec<RankedChunk> {
        let filter = CategoryFilter::exclude(&[self.procedures_category]);
        self.policy
            .filter(store.search(query, store.len(), Some(&filter)), refs)
            .into_iter()
            .take(top_k)
            .map(RankedChunk::from)
            .collect()
    }

    fn render_tier1(&self, summaries: &[Summary], refs: &ReferenceSet, options: &RetrievalOptions) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Instructions\n\n{}\n", self.instructions.trim());

        if !summaries.is_empty() {
            out.push_str("# Document Summaries\n\n");
            for s in summaries {
                let _ = writeln!(out, "## {} ({})\n\n{}\n", s.file_name, label(&s.category, &s.subcategory), s.text);
            }
        }

        let fields = refs.master_record_fields();
        if !fields.is_empty() {
            out.push_str("# Master Record\n\n");
            for field in fields {
                let key = CategoryKey::new(field);
                let value = options
                    .master_record
                    .iter()
                    .find(|(name, _)| CategoryKey::new(name) == key)
                    .map(|(_, value)| value.as_str());
                match value {
                    Some(value) => {
                        let _ = writeln!(out, "- {field}: {value}");
                    }
                    None => {
                        tracing::debug!(field, "referenced master record field not provided");
                        let _ = writeln!(out, "- {field}: [not provided]");
                    }
                }
            }
            out.push('\n');
        }

        if refs.wants_master_checklist() {
            match &options.master_checklist {
                Some(checklist) => {
                    let _ = writeln!(out, "# Master Checklist\n\n{}\n", checklist.trim());
                }
                None => tracing::debug!("master checklist referenced but not provided"),
            }
        }

        out
    }
}

fn label(category: &str, subcategory: &str) -> String {
    if subcategory.is_empty() {
        category.to_string()
    } else {
        format!("{category} / {subcategory}")
    }
}

fn render_chunks(out: &mut String, heading: &str, chunks: &[RankedChunk]) {
    if chunks.is_empty() {
        return;
    }
    let _ = writeln!(out, "# {heading}\n");
    for c in chunks {
        let _ = writeln!(
            out,
            "## {} ({}, part {})\n\n{}\n",
            c.file_name,
            label(&c.category, &c.subcategory),
            c.chunk_index + 1,
            c.content
        );
    }
}

fn render(tier1: &str, procedures: &[RankedChunk], context: &[RankedChunk]) -> String {
    let mut out = tier1.to_string();
    render_chunks(&mut out, "Procedures", procedures);
    render_chunks(&mut out, "Project Context", context);
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, HashingEmbedder};
    use crate::store::{content_hash, Chunk, ChunkMetadata};

    const INSTRUCTIONS: &str = "Draft DHF sections.";

    fn store(embedder: &HashingEmbedder) -> VectorStore {
        let docs = [
            ("Context/General/notes.txt", "General", "", "general notes about sterilization validation"),
            ("Context/Risk/fmea.txt", "Risk", "", "risk analysis for sterilization failure modes"),
            ("Procedures/Design/dc.txt", "Procedures", "Design", "design control procedure for sterilization"),
            ("Procedures/Risk/rm.txt", "Procedures", "Risk", "risk management procedure for sterilization"),
        ];
        let mut store = VectorStore::new("fp", "t", embedder.model_id(), embedder.dimension());
        for (path, category, sub, text) in docs {
            store
                .add_entry(Chunk {
                    id: ChunkId::new(path, 0),
                    embedding: embedder.embed(text).unwrap(),
                    metadata: ChunkMetadata {
                        file_name: path.rsplit('/').next().unwrap().to_string(),
                        relative_path: path.to_string(),
                        category: category.to_string(),
                        subcategory: sub.to_string(),
                        chunk_index: 0,
                        content: text.to_string(),
                        content_hash: content_hash(text),
                    },
                })
                .unwrap();
        }
        store
    }

    fn summaries() -> Vec<Summary> {
        vec![
            Summary {
                file_name: "notes.txt".to_string(),
                relative_path: "Context/General/notes.txt".to_string(),
                category: "General".to_string(),
                subcategory: String::new(),
                text: "general notes".to_string(),
            },
            Summary {
                file_name: "fmea.txt".to_string(),
                relative_path: "Context/Risk/fmea.txt".to_string(),
                category: "Risk".to_string(),
                subcategory: String::new(),
                text: "risk analysis".to_string(),
            },
        ]
    }

    fn run(prompt: &str, options: &RetrievalOptions) -> ContextPackage {
        let embedder = HashingEmbedder::new(256);
        let store = store(&embedder);
        let policy = RetrievalPolicy::new([CategoryKey::new("General")]);
        let estimator = TokenEstimator::chars(4);
        let known = [CategoryKey::new("General")];
        let refs = ReferenceSet::from_prompt(prompt, &known);
        let query = embedder.embed(prompt).unwrap();
        ContextAssembler::new(INSTRUCTIONS, "Procedures", &policy, &estimator)
            .assemble(&store, &summaries(), &query, &refs, options)
    }

    fn options() -> RetrievalOptions {
        RetrievalOptions::default().with_top_k(8, 8).with_max_tokens(10_000)
    }

    #[test]
    fn on_demand_material_needs_a_reference() {
        let package = run("sterilization", &options());
        assert!(package.ranked_context_chunks.iter().all(|c| c.category != "General"));
        assert!(package.summaries.iter().all(|s| s.category != "General"));
        assert_eq!(package.ranked_procedure_chunks.len(), 2);

        let package = run("sterilization [General|notes.txt]", &options());
        assert!(package.ranked_context_chunks.iter().any(|c| c.file_name == "notes.txt"));
        assert!(package.sources.contains(&"notes.txt".to_string()));
    }

    #[test]
    fn procedure_reference_narrows_channel() {
        let package = run("sterilization [Procedure|risk]", &options());
        assert_eq!(package.ranked_procedure_chunks.len(), 1);
        assert_eq!(package.ranked_procedure_chunks[0].subcategory, "Risk");

        let package = run("sterilization [Procedure|Nonexistent]", &options());
        assert_eq!(package.ranked_procedure_chunks.len(), 2);
    }

    #[test]
    fn budget_drops_context_before_procedures() {
        let full = run("sterilization", &options());
        assert!(!full.over_budget);
        let estimator = TokenEstimator::chars(4);
        let last_context = full.ranked_context_chunks.last().unwrap();
        let without_context = full.estimated_tokens
            - estimator.estimate(&last_context.content)
            - 4;

        let package = run("sterilization", &options().with_max_tokens(without_context));
        assert!(package.estimated_tokens <= without_context);
        assert!(package.ranked_context_chunks.is_empty());
        assert_eq!(package.ranked_procedure_chunks.len(), 2);
        assert!(package.fragment.starts_with("# Instructions"));
    }

    #[test]
    fn tier_one_is_kept_when_over_budget() {
        let package = run("sterilization", &options().with_max_tokens(5));
        assert!(package.over_budget);
        assert!(package.ranked_procedure_chunks.is_empty());
        assert!(package.ranked_context_chunks.is_empty());
        assert!(package.fragment.contains(INSTRUCTIONS));
        assert!(package.fragment.contains("risk analysis"));
    }

    #[test]
    fn master_record_fields_render_in_tier_one() {
        let mut fields = BTreeMap::new();
        fields.insert("Device Name".to_string(), "CardioSense".to_string());
        let opts = options()
            .with_master_record(fields)
            .with_master_checklist("1. Design inputs approved");
        let package = run("[MR|device name] [MR|Class] [Checklist]", &opts);
        assert!(package.fragment.contains("- device name: CardioSense"));
        assert!(package.fragment.contains("- Class: [not provided]"));
        assert!(package.fragment.contains("1. Design inputs approved"));
        assert_eq!(package.references.len(), 3);
    }

    #[test]
    fn repeated_assembly_is_identical() {
        let a = run("sterilization risk", &options());
        let b = run("sterilization risk", &options());
        assert_eq!(a.fragment, b.fragment);
        assert_eq!(a.sources, b.sources);
    }
}
