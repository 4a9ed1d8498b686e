/// Query augmentation as a closed set of strategies, dispatched from a static
/// list. Each strategy is a pure function of the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AugmentStrategy {
    CurrentEvents,
    Comparison,
    LocalInfo,
    Health,
    Technical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryAugmentation {
    pub strategy: AugmentStrategy,
    pub query: String,
    pub note: &'static str,
}

pub const STRATEGIES: &[AugmentStrategy] = &[
    AugmentStrategy::CurrentEvents,
    AugmentStrategy::Comparison,
    AugmentStrategy::LocalInfo,
    AugmentStrategy::Health,
    AugmentStrategy::Technical,
];

impl AugmentStrategy {
    fn keywords(self) -> &'static [&'static str] {
        match self {
            AugmentStrategy::CurrentEvents => {
                &["latest", "news", "today", "current", "recent", "breaking", "update"]
            }
            AugmentStrategy::Comparison => {
                &["vs", "versus", "compare", "comparison", "difference between", "better than"]
            }
            AugmentStrategy::LocalInfo => &["near me", "nearby", "local", "open now", "closest"],
            AugmentStrategy::Health => {
                &["symptom", "symptoms", "treatment", "medication", "side effects", "dosage"]
            }
            AugmentStrategy::Technical => {
                &["error", "exception", "stack trace", "how to fix", "install", "configure"]
            }
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            AugmentStrategy::CurrentEvents => "latest developments",
            AugmentStrategy::Comparison => "detailed comparison pros and cons",
            AugmentStrategy::LocalInfo => "location details hours",
            AugmentStrategy::Health => "evidence-based medical information",
            AugmentStrategy::Technical => "solution documentation",
        }
    }

    pub fn note(self) -> &'static str {
        match self {
            AugmentStrategy::CurrentEvents => "query targets fast-moving news",
            AugmentStrategy::Comparison => "query asks for a comparison",
            AugmentStrategy::LocalInfo => "query asks about nearby places",
            AugmentStrategy::Health => "query is health-related",
            AugmentStrategy::Technical => "query looks like a technical problem",
        }
    }

    pub fn matches(self, query: &str) -> bool {
        let lower = query.to_lowercase();
        let tokens: Vec<String> = lower
            .split_whitespace()
            .map(|t| {
                t.trim_matches(|c: char| !c.is_alphanumeric())
                    .to_string()
            })
            .filter(|t| !t.is_empty())
            .collect();
        self.keywords().iter().any(|k| {
            if k.contains(' ') {
                lower.contains(k)
            } else {
                tokens.iter().any(|t| t == k)
            }
        })
    }

    pub fn apply(self, query: &str) -> Option<QueryAugmentation> {
        if !self.matches(query) {
            return None;
        }
        Some(QueryAugmentation {
            strategy: self,
            query: format!("{} {}", query.trim(), self.suffix()),
            note: self.note(),
        })
    }
}

/// First matching strategy wins; the list order is the dispatch priority.
pub fn augment(query: &str) -> Option<QueryAugmentation> {
    STRATEGIES.iter().find_map(|s| s.apply(query))
}
