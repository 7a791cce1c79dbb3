//! Answer-path orchestration.
//!
//! The flow detect-language → guardrail → retrieve → generate (with a
//! refusal branch for off-topic queries) is an explicit state machine: one
//! transition function consumes the current [`ChatState`] and [`Stage`] and
//! returns the updated state plus the next routing decision. No graph
//! library, no hidden edges.
//!
//! Two fallback policies here are deliberate, not accidental catches:
//! guardrail classifier errors **fail open** (the query is treated as
//! on-topic), and generation errors produce a language-appropriate apology
//! rather than surfacing the raw failure.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use tracing::{debug, info, warn};

use crate::retrieval::{Citation, RetrievedContext, Retriever};
use crate::types::{CorpusError, Language};

/// One prior exchange message, oldest first.
#[derive(Clone, Debug)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

/// Mutable context threaded through the stages.
#[derive(Clone, Debug, Default)]
pub struct ChatState {
    pub query: String,
    pub language: Language,
    pub history: Vec<ChatTurn>,
    pub context: RetrievedContext,
    pub response: String,
    pub sources: Vec<Citation>,
    pub off_topic: bool,
    pub error: Option<String>,
}

impl ChatState {
    pub fn new(query: impl Into<String>, history: Vec<ChatTurn>) -> Self {
        Self {
            query: query.into(),
            history,
            ..Self::default()
        }
    }

    fn format_history(&self) -> String {
        if self.history.is_empty() {
            return "No previous conversation.".to_string();
        }
        self.history
            .iter()
            .rev()
            .take(6)
            .rev()
            .map(|turn| {
                let mut role = turn.role.clone();
                if let Some(first) = role.get_mut(..1) {
                    first.make_ascii_uppercase();
                }
                format!("{role}: {}", turn.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Routing decisions of the transition function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    DetectLanguage,
    Guardrail,
    Retrieve,
    Generate,
    Refuse,
    Done,
}

/// Chat completion boundary; the model call itself is external.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, CorpusError>;
}

/// Drives a query through the staged answer flow.
pub struct AnswerFlow {
    retriever: Retriever,
    model: Arc<dyn ChatModel>,
}

impl AnswerFlow {
    pub fn new(retriever: Retriever, model: Arc<dyn ChatModel>) -> Self {
        Self { retriever, model }
    }

    /// Runs the state machine to completion.
    pub async fn answer(&self, query: impl Into<String>, history: Vec<ChatTurn>) -> ChatState {
        let mut state = ChatState::new(query, history);
        let mut stage = Stage::DetectLanguage;
        while stage != Stage::Done {
            (state, stage) = self.step(state, stage).await;
        }
        state
    }

    /// The transition function: next state plus routing decision.
    pub async fn step(&self, mut state: ChatState, stage: Stage) -> (ChatState, Stage) {
        match stage {
            Stage::DetectLanguage => {
                state.language = detect_language(&state.query);
                debug!(language = %state.language, "detected query language");
                (state, Stage::Guardrail)
            }
            Stage::Guardrail => {
                state.off_topic = self.is_off_topic(&state.query).await;
                let next = if state.off_topic {
                    Stage::Refuse
                } else {
                    Stage::Retrieve
                };
                (state, next)
            }
            Stage::Retrieve => {
                match self.retriever.retrieve(&state.query, None).await {
                    Ok(context) => {
                        state.sources = context.citations.clone();
                        state.context = context;
                    }
                    Err(err) => {
                        warn!(error = %err, "retrieval failed");
                        state.error = Some(format!("failed to retrieve context: {err}"));
                        state.context = RetrievedContext::default();
                        state.sources.clear();
                    }
                }
                (state, Stage::Generate)
            }
            Stage::Generate => {
                self.generate(&mut state).await;
                (state, Stage::Done)
            }
            Stage::Refuse => {
                info!("refusing off-topic query");
                state.response = refusal_text(state.language).to_string();
                state.sources.clear();
                (state, Stage::Done)
            }
            Stage::Done => (state, Stage::Done),
        }
    }

    /// Classifier errors fail open: a broken guardrail must not block
    /// legitimate questions.
    async fn is_off_topic(&self, query: &str) -> bool {
        if query.trim().chars().count() < 2 {
            return false;
        }
        let prompt = format!("{GUARDRAIL_PROMPT}\n\nUser message: {query}");
        match self.model.complete(GUARDRAIL_SYSTEM, &prompt).await {
            Ok(verdict) => {
                let verdict = verdict.trim().to_lowercase();
                debug!(%verdict, "guardrail verdict");
                verdict.starts_with("no")
            }
            Err(err) => {
                warn!(error = %err, "guardrail check failed; failing open");
                false
            }
        }
    }

    async fn generate(&self, state: &mut ChatState) {
        if state.context.items.is_empty() {
            state.response = no_context_text(state.language).to_string();
            state.sources.clear();
            return;
        }

        let system = system_prompt(state.language)
            .replace("{history}", &state.format_history())
            .replace("{context}", &state.context.format_context());

        match self.model.complete(&system, &state.query).await {
            Ok(response) => {
                state.response = response;
            }
            Err(err) => {
                warn!(error = %err, "generation failed");
                state.error = Some(format!("failed to generate response: {err}"));
                state.response = generation_error_text(state.language).to_string();
            }
        }
    }
}

static FRENCH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(je|tu|il|elle|nous|vous|ils|elles)\b",
        r"\b(le|la|les|un|une|des)\b",
        r"\b(est|sont|avoir|être|fait)\b",
        r"\b(pour|avec|dans|sur|sous)\b",
        r"\b(comment|pourquoi|quand|où|qui|quoi)\b",
        r"\b(impôt|impôts|crédit|déclaration|revenu)\b",
        r"\b(merci|bonjour|salut|s'il vous plaît)\b",
        r"\bqu[e']",
        r"[àâäéèêëïîôùûüç]",
    ])
});

static ENGLISH_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"\b(i|you|he|she|we|they)\b",
        r"\b(the|a|an)\b",
        r"\b(is|are|was|were|have|has)\b",
        r"\b(for|with|in|on|at)\b",
        r"\b(how|why|when|where|who|what)\b",
        r"\b(tax|taxes|credit|return|income)\b",
        r"\b(thank|hello|please)\b",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .expect("language patterns are valid")
        })
        .collect()
}

fn score_language(text: &str, patterns: &[Regex]) -> usize {
    patterns
        .iter()
        .map(|pattern| pattern.find_iter(text).count())
        .sum()
}

/// Scores the query against both pattern sets. English is the default;
/// French wins when its score clears 80% of the English score, which biases
/// against false French positives on short queries.
pub fn detect_language(text: &str) -> Language {
    if text.trim().is_empty() {
        return Language::En;
    }
    let lowered = text.to_lowercase();
    let french = score_language(&lowered, &FRENCH_PATTERNS);
    let english = score_language(&lowered, &ENGLISH_PATTERNS);
    if french as f64 > english as f64 * 0.8 {
        Language::Fr
    } else {
        Language::En
    }
}

const GUARDRAIL_SYSTEM: &str =
    "You decide whether a user message is about government services, taxes, or benefits.";

const GUARDRAIL_PROMPT: &str = "Answer with exactly 'yes' if the message below is about \
government services, taxes, benefits, or closely related topics, and exactly 'no' otherwise.";

const SYSTEM_PROMPT_EN: &str = "You are a helpful assistant for an official government website. \
Only answer from the retrieved information below; never invent rates, deadlines, or eligibility \
criteria, and cite source URLs when you use them. If the retrieved information does not contain \
the answer, say you do not have that information and suggest visiting the official site directly.\n\n\
## Previous conversation\n{history}\n\n## Retrieved information\n{context}";

const SYSTEM_PROMPT_FR: &str = "Vous êtes un assistant utile pour un site Web officiel du \
gouvernement. Répondez uniquement à partir des informations récupérées ci-dessous; n'inventez \
jamais de taux, de dates limites ou de critères d'admissibilité, et citez les URL sources que \
vous utilisez. Si les informations récupérées ne contiennent pas la réponse, dites que vous \
n'avez pas cette information et suggérez de visiter directement le site officiel.\n\n\
## Conversation précédente\n{history}\n\n## Informations récupérées\n{context}";

fn system_prompt(language: Language) -> &'static str {
    match language {
        Language::Fr => SYSTEM_PROMPT_FR,
        Language::En => SYSTEM_PROMPT_EN,
    }
}

fn refusal_text(language: Language) -> &'static str {
    match language {
        Language::Fr => {
            "Je ne peux répondre qu'aux questions concernant les services gouvernementaux, \
les impôts et les prestations. Veuillez reformuler votre question."
        }
        Language::En => {
            "I can only answer questions about government services, taxes, and benefits. \
Please rephrase your question."
        }
    }
}

fn no_context_text(language: Language) -> &'static str {
    match language {
        Language::Fr => {
            "Je n'ai pas d'informations spécifiques sur ce sujet dans ma base de connaissances \
actuelle. Pour les détails les plus précis, veuillez visiter directement le site officiel."
        }
        Language::En => {
            "I don't have specific information about that topic in my current knowledge base. \
For the most accurate details, please visit the official site directly."
        }
    }
}

fn generation_error_text(language: Language) -> &'static str {
    match language {
        Language::Fr => {
            "Je suis désolé, j'ai rencontré une erreur en traitant votre demande. Veuillez \
réessayer ou visiter directement le site officiel."
        }
        Language::En => {
            "I'm sorry, I encountered an error processing your request. Please try again or \
visit the official site directly."
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, MockEmbeddingProvider};
    use crate::store::{DocumentUpsert, MemoryVectorStore, NewChunk, VectorStore};
    use parking_lot::Mutex;
    use serde_json::json;

    struct ScriptedModel {
        guardrail_reply: Result<String, ()>,
        answer_reply: Result<String, ()>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedModel {
        fn new(guardrail: Result<&str, ()>, answer: Result<&str, ()>) -> Self {
            Self {
                guardrail_reply: guardrail.map(str::to_string),
                answer_reply: answer.map(str::to_string),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(&self, system: &str, _user: &str) -> Result<String, CorpusError> {
            let mut calls = self.calls.lock();
            calls.push(system.to_string());
            let reply = if system == GUARDRAIL_SYSTEM {
                &self.guardrail_reply
            } else {
                &self.answer_reply
            };
            reply
                .clone()
                .map_err(|_| CorpusError::Embedding("model unavailable".to_string()))
        }
    }

    async fn seeded_retriever() -> Retriever {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let content = "File your income tax return by April 30.";
        let embedding = embedder.embed_query(content).await.unwrap();
        store
            .upsert_document(
                DocumentUpsert {
                    url: "https://example.org/en/deadlines".to_string(),
                    title: Some("Deadlines".to_string()),
                    content: content.to_string(),
                    content_hash: "hash".to_string(),
                    language: Language::En,
                    sitemap_lastmod: None,
                    last_scraped_at: None,
                    embedding_version: None,
                    metadata: json!({}),
                },
                vec![NewChunk {
                    content: content.to_string(),
                    embedding,
                    chunk_index: 0,
                    metadata: json!({
                        "url": "https://example.org/en/deadlines",
                        "title": "Deadlines",
                        "language": "en",
                    }),
                }],
            )
            .await
            .unwrap();
        Retriever::new(store, embedder, 5)
    }

    #[tokio::test]
    async fn on_topic_query_flows_through_to_generation_with_sources() {
        let model = Arc::new(ScriptedModel::new(Ok("yes"), Ok("File by April 30.")));
        let flow = AnswerFlow::new(seeded_retriever().await, model);

        let state = flow.answer("When is the tax filing deadline?", vec![]).await;

        assert!(!state.off_topic);
        assert_eq!(state.response, "File by April 30.");
        assert_eq!(state.sources.len(), 1);
        assert_eq!(state.sources[0].url, "https://example.org/en/deadlines");
        assert!(state.error.is_none());
    }

    #[tokio::test]
    async fn off_topic_query_routes_to_refusal_without_sources() {
        let model = Arc::new(ScriptedModel::new(Ok("no"), Ok("unused")));
        let flow = AnswerFlow::new(seeded_retriever().await, model);

        let state = flow.answer("Tell me a story about dragons", vec![]).await;

        assert!(state.off_topic);
        assert_eq!(state.response, refusal_text(Language::En));
        assert!(state.sources.is_empty());
    }

    #[tokio::test]
    async fn guardrail_errors_fail_open() {
        let model = Arc::new(ScriptedModel::new(Err(()), Ok("Answer anyway.")));
        let flow = AnswerFlow::new(seeded_retriever().await, model);

        let state = flow.answer("When is the tax filing deadline?", vec![]).await;

        assert!(!state.off_topic, "classifier failure must not block queries");
        assert_eq!(state.response, "Answer anyway.");
    }

    #[tokio::test]
    async fn generation_errors_fall_back_to_an_apology() {
        let model = Arc::new(ScriptedModel::new(Ok("yes"), Err(())));
        let flow = AnswerFlow::new(seeded_retriever().await, model);

        let state = flow.answer("When is the tax filing deadline?", vec![]).await;

        assert_eq!(state.response, generation_error_text(Language::En));
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn empty_store_yields_the_no_context_response() {
        let store = Arc::new(MemoryVectorStore::new());
        let embedder = Arc::new(MockEmbeddingProvider::new());
        let retriever = Retriever::new(store, embedder, 5);
        let model = Arc::new(ScriptedModel::new(Ok("yes"), Ok("unused")));
        let flow = AnswerFlow::new(retriever, model.clone());

        let state = flow.answer("When is the tax filing deadline?", vec![]).await;

        assert_eq!(state.response, no_context_text(Language::En));
        assert!(state.sources.is_empty());
        // Only the guardrail call reached the model.
        assert_eq!(model.calls.lock().len(), 1);
    }

    #[test]
    fn detects_french_and_english_queries() {
        assert_eq!(
            detect_language("Comment déclarer mes impôts cette année?"),
            Language::Fr
        );
        assert_eq!(
            detect_language("How do I file my income tax return?"),
            Language::En
        );
        assert_eq!(detect_language(""), Language::En);
    }

    #[test]
    fn history_formats_last_six_turns() {
        let mut state = ChatState::new("q", vec![]);
        for i in 0..8 {
            state.history.push(ChatTurn {
                role: "user".to_string(),
                content: format!("message {i}"),
            });
        }
        let formatted = state.format_history();
        assert!(!formatted.contains("message 0"));
        assert!(!formatted.contains("message 1"));
        assert!(formatted.contains("message 2"));
        assert!(formatted.contains("message 7"));
        assert!(formatted.contains("User:"));
    }
}
