//! Text heuristics behind a replaceable interface.
//!
//! Enrichers and transformers only talk to [`ScoringStrategy`]; the
//! keyword lexicon here can be swapped for a real NLP component without
//! touching pipeline or transformer contracts.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Text scoring used by the emotional, social and memory enrichers
pub trait ScoringStrategy: Send + Sync {
    /// Per-emotion scores in [0, 1]; absent emotions score 0
    fn emotion_scores(&self, text: &str) -> BTreeMap<String, f64>;

    /// Sentiment in [-1, 1]
    fn sentiment(&self, text: &str) -> f64;

    /// Relationship type suggested by the text, if any
    fn relationship_hint(&self, text: &str) -> Option<String>;

    /// Similarity of `text` to `query` in [0, 1]
    fn relevance(&self, query: &str, text: &str) -> f64 {
        jaccard_similarity(query, text)
    }

    /// Most frequent non-stopword terms, highest count first
    fn key_terms(&self, text: &str, limit: usize) -> Vec<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut first_seen: HashMap<String, usize> = HashMap::new();
        for (idx, token) in tokenize(text).into_iter().enumerate() {
            if token.len() < 3 || STOPWORDS.contains(&token.as_str()) {
                continue;
            }
            first_seen.entry(token.clone()).or_insert(idx);
            *counts.entry(token).or_insert(0) += 1;
        }

        let mut terms: Vec<(String, usize)> = counts.into_iter().collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| first_seen[&a.0].cmp(&first_seen[&b.0])));
        terms.into_iter().take(limit).map(|(t, _)| t).collect()
    }
}

/// Lowercased alphanumeric tokens
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Calculate Jaccard similarity between two strings
pub fn jaccard_similarity(s1: &str, s2: &str) -> f64 {
    let words1: HashSet<String> = tokenize(s1).into_iter().collect();
    let words2: HashSet<String> = tokenize(s2).into_iter().collect();

    if words1.is_empty() && words2.is_empty() {
        return 0.0;
    }

    let intersection = words1.intersection(&words2).count();
    let union = words1.union(&words2).count();

    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "has", "have", "this", "that", "with", "from", "they", "will", "would",
    "there", "their", "what", "about", "which", "when", "your", "just", "been", "were", "into",
    "than", "then", "them", "also", "some", "very", "its", "how", "who", "did", "does",
];

const EMOTION_LEXICON: &[(&str, &[&str])] = &[
    (
        "happy",
        &[
            "happy", "joy", "joyful", "glad", "delighted", "great", "awesome", "wonderful",
            "success", "successful", "pleased", "cheerful", "fantastic", "excellent", "love",
        ],
    ),
    (
        "sad",
        &[
            "sad", "unhappy", "depressed", "down", "miserable", "lonely", "cry", "crying",
            "loss", "lost", "grief", "disappointed", "sorry",
        ],
    ),
    (
        "angry",
        &[
            "angry", "mad", "furious", "annoyed", "irritated", "hate", "rage", "frustrated",
            "frustrating", "outraged",
        ],
    ),
    (
        "anxious",
        &[
            "anxious", "worried", "nervous", "afraid", "scared", "fear", "stress", "stressed",
            "panic", "uneasy", "concerned",
        ],
    ),
    (
        "surprised",
        &[
            "surprised", "surprise", "shocked", "unexpected", "wow", "amazing", "astonished",
            "suddenly",
        ],
    ),
    (
        "grateful",
        &["thanks", "thank", "grateful", "appreciate", "appreciated", "thankful"],
    ),
];

const POSITIVE_WORDS: &[&str] = &[
    "thanks", "thank", "great", "good", "love", "helpful", "appreciate", "happy", "agree",
    "trust", "reliable", "excellent", "nice", "wonderful", "glad", "friend", "support",
];

const NEGATIVE_WORDS: &[&str] = &[
    "bad", "hate", "angry", "wrong", "annoyed", "disappointed", "terrible", "awful", "never",
    "unreliable", "lied", "broken", "fail", "failed", "upset", "rude",
];

const RELATIONSHIP_KEYWORDS: &[(&str, &[&str])] = &[
    ("family", &["mom", "dad", "mother", "father", "sister", "brother", "family", "son", "daughter"]),
    ("friend", &["friend", "buddy", "pal", "hangout", "party"]),
    ("professional", &["meeting", "project", "deadline", "colleague", "manager", "client", "work", "team"]),
    ("mentor", &["mentor", "advice", "learn", "teach", "guidance"]),
];

/// Keyword-lexicon scorer
#[derive(Debug, Clone)]
pub struct LexiconScorer {
    /// Score added per matching keyword
    pub per_match_weight: f64,
}

impl Default for LexiconScorer {
    fn default() -> Self {
        Self {
            per_match_weight: 0.2,
        }
    }
}

impl LexiconScorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emotion names known to the lexicon
    pub fn emotions() -> Vec<&'static str> {
        EMOTION_LEXICON.iter().map(|(name, _)| *name).collect()
    }
}

impl ScoringStrategy for LexiconScorer {
    fn emotion_scores(&self, text: &str) -> BTreeMap<String, f64> {
        let tokens = tokenize(text);
        let mut scores = BTreeMap::new();

        for (emotion, words) in EMOTION_LEXICON {
            let matches = tokens.iter().filter(|t| words.contains(&t.as_str())).count();
            if matches > 0 {
                let score = (matches as f64 * self.per_match_weight).min(1.0);
                scores.insert((*emotion).to_string(), score);
            }
        }

        scores
    }

    fn sentiment(&self, text: &str) -> f64 {
        let tokens = tokenize(text);
        let positive = tokens.iter().filter(|t| POSITIVE_WORDS.contains(&t.as_str())).count();
        let negative = tokens.iter().filter(|t| NEGATIVE_WORDS.contains(&t.as_str())).count();
        let total = positive + negative;

        if total == 0 {
            return 0.0;
        }
        (positive as f64 - negative as f64) / total as f64
    }

    fn relationship_hint(&self, text: &str) -> Option<String> {
        let tokens = tokenize(text);
        RELATIONSHIP_KEYWORDS
            .iter()
            .map(|(kind, words)| {
                let hits = tokens.iter().filter(|t| words.contains(&t.as_str())).count();
                (*kind, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(kind, _)| kind.to_string())
    }
}
