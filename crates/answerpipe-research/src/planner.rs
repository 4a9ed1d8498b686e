use answerpipe_core::{PlannedQuery, SearchPlan};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;

const MAX_QUERY_CHARS: usize = 400;
const MAX_PLANNED_QUERIES: usize = 3;

/// Judges whether two consecutive user messages are about the same topic.
/// Deliberately pluggable; the pipeline only depends on "unrelated ⇒ suggest
/// a new chat".
pub trait TopicSimilarity: Send + Sync {
    fn related(&self, previous: &str, current: &str) -> bool;
}

const STOPWORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "do", "does", "did", "can",
    "could", "should", "would", "will", "what", "who", "when", "where", "why", "how", "which",
    "of", "in", "on", "at", "to", "for", "from", "with", "about", "and", "or", "not", "it",
    "its", "this", "that", "these", "those", "you", "your", "i", "my", "me", "we", "our",
    "please", "tell",
];

fn content_tokens(text: &str) -> BTreeSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|t| {
            t.trim_matches(|c: char| !c.is_alphanumeric())
                .to_string()
        })
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}

/// Token-set Jaccard overlap. Empty token sets are treated as related so a
/// contentless follow-up ("and then?") never triggers a new-chat suggestion.
#[derive(Debug, Clone)]
pub struct JaccardSimilarity {
    pub threshold: f64,
}

impl Default for JaccardSimilarity {
    fn default() -> Self {
        Self { threshold: 0.2 }
    }
}

impl TopicSimilarity for JaccardSimilarity {
    fn related(&self, previous: &str, current: &str) -> bool {
        let a = content_tokens(previous);
        let b = content_tokens(current);
        if a.is_empty() || b.is_empty() {
            return true;
        }
        let inter = a.intersection(&b).count() as f64;
        let union = a.union(&b).count() as f64;
        inter / union >= self.threshold
    }
}

const SMALL_TALK: &[&str] = &[
    "hi", "hello", "hey", "yo", "thanks", "thank you", "thx", "ok", "okay", "cool", "great",
    "nice", "bye", "goodbye", "good morning", "good night", "got it", "sounds good", "sure",
    "lol", "no problem", "you too",
];

const INTERROGATIVES: &[&str] = &[
    "what", "who", "when", "where", "why", "how", "is", "are", "does", "do", "can", "should",
    "which", "will",
];

fn normalized_message(msg: &str) -> String {
    msg.trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_lowercase()
}

fn is_small_talk(msg: &str) -> bool {
    let n = normalized_message(msg);
    if n.is_empty() || SMALL_TALK.contains(&n.as_str()) {
        return true;
    }
    // Short exclamations built from small-talk words ("ok thanks!") still
    // count; anything with a question mark never does.
    if msg.contains('?') {
        return false;
    }
    let words: Vec<&str> = n.split_whitespace().collect();
    words.len() <= 3 && words.iter().all(|w| SMALL_TALK.contains(w))
}

fn looks_like_question(msg: &str) -> bool {
    if msg.contains('?') {
        return true;
    }
    let n = msg.trim().to_lowercase();
    INTERROGATIVES
        .iter()
        .any(|w| n.starts_with(&format!("{w} ")))
}

fn primary_query(msg: &str) -> String {
    let collapsed = msg.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(|c: char| c == '?' || c == '!' || c == '.');
    answerpipe_core::truncate_chars(trimmed.trim(), MAX_QUERY_CHARS)
}

fn keyword_query(msg: &str) -> String {
    content_tokens(msg).into_iter().take(8).collect::<Vec<_>>().join(" ")
}

type PlanKey = (String, String);

/// Decides whether and what to search for a new message. Plans are cached by
/// exact `(chat_id, message)` so identical input replays identically; a race
/// between identical lookups recomputes the same value, which is fine.
pub struct SearchPlanner {
    cache: DashMap<PlanKey, SearchPlan>,
    similarity: Arc<dyn TopicSimilarity>,
}

impl Default for SearchPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SearchPlanner {
    pub fn new() -> Self {
        Self::with_similarity(Arc::new(JaccardSimilarity::default()))
    }

    pub fn with_similarity(similarity: Arc<dyn TopicSimilarity>) -> Self {
        Self {
            cache: DashMap::new(),
            similarity,
        }
    }

    pub fn cached_plan_count(&self) -> usize {
        self.cache.len()
    }

    /// `recent_context` is the preceding user messages, oldest first; only the
    /// last one feeds the topic-change check.
    pub fn plan(&self, chat_id: &str, message: &str, recent_context: &[String]) -> SearchPlan {
        let key = (chat_id.to_string(), message.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return hit.value().clone();
        }

        let plan = self.compute(message, recent_context);
        tracing::debug!(
            chat_id,
            should_search = plan.should_search,
            queries = plan.queries.len(),
            "planned message"
        );
        self.cache.insert(key, plan.clone());
        plan
    }

    fn compute(&self, message: &str, recent_context: &[String]) -> SearchPlan {
        if is_small_talk(message) {
            return SearchPlan::no_search(0.95);
        }

        let primary = primary_query(message);
        let mut queries = vec![PlannedQuery::new(
            primary.clone(),
            "direct query from the user message",
            1,
        )];

        if message.len() > 80 {
            let kw = keyword_query(message);
            if !kw.is_empty() && kw != primary {
                queries.push(PlannedQuery::new(
                    kw,
                    "keyword distillation of a long message",
                    2,
                ));
            }
        }
        queries.truncate(MAX_PLANNED_QUERIES);

        let suggest_new_chat = recent_context
            .last()
            .map(|prev| !self.similarity.related(prev, message))
            .unwrap_or(false);

        let decision_confidence = if looks_like_question(message) { 0.9 } else { 0.75 };

        SearchPlan {
            should_search: true,
            queries,
            suggest_new_chat,
            decision_confidence,
        }
    }
}
