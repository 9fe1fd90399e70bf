//! Hallucination Guard: classifies an incoming question as on-topic,
//! off-topic, or ambiguous before any costly LLM/SQL work runs.
//!
//! The bounded cache keyed by `(normalized_question, locale)` is grounded
//! structurally on the teacher's LLM prompt-cache pattern (hash key, bounded
//! map, eviction) — reused in shape, not verbatim, since the teacher's cache
//! keys on LLM request hashes rather than question/locale pairs.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::locale::Locale;

const DOMAIN_KEYWORDS: &[&str] = &[
    "revenue", "patient", "patients", "claim", "claims", "invoice", "invoices", "admission",
    "admissions", "billing", "account", "accounts", "visit", "visits", "appointment",
    "appointments", "diagnosis", "procedure", "payment", "payments", "balance", "expense",
    "expenses", "clinic", "hospital", "insurance", "reimbursement",
];

/// Per spec.md §9(b): the source mixes a struct and a map shape for this
/// output; the typed struct is the one this crate implements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Verdict {
    OnTopic,
    OffTopic { reason: String },
    Ambiguous { clarification: String },
}

struct CacheEntry {
    key: (String, Locale),
    verdict: Verdict,
}

/// Bounded FIFO cache — simple and sufficient for the bounded-size
/// requirement in spec.md §4.8; eviction drops the oldest entry.
struct BoundedVerdictCache {
    capacity: usize,
    entries: VecDeque<CacheEntry>,
}

impl BoundedVerdictCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    fn get(&self, key: &(String, Locale)) -> Option<Verdict> {
        self.entries
            .iter()
            .find(|e| &e.key == key)
            .map(|e| e.verdict.clone())
    }

    fn insert(&mut self, key: (String, Locale), verdict: Verdict) {
        if self.entries.iter().any(|e| e.key == key) {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(CacheEntry { key, verdict });
    }
}

/// Classifies questions by domain-keyword scoring plus length/specificity
/// heuristics. Runs early, before any LLM/SQL work.
pub struct HallucinationGuard {
    cache: Mutex<BoundedVerdictCache>,
}

impl HallucinationGuard {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(BoundedVerdictCache::new(cache_capacity)),
        }
    }

    pub fn classify(&self, normalized_question: &str, locale: Locale) -> Verdict {
        let key = (normalized_question.to_ascii_lowercase(), locale);

        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            return cached;
        }

        let verdict = self.classify_uncached(normalized_question, locale);
        self.cache.lock().unwrap().insert(key, verdict.clone());
        verdict
    }

    fn classify_uncached(&self, normalized_question: &str, locale: Locale) -> Verdict {
        let lower = normalized_question.to_ascii_lowercase();
        let word_count = lower.split_whitespace().count();

        let keyword_hits = DOMAIN_KEYWORDS
            .iter()
            .filter(|kw| lower.contains(*kw))
            .count();

        if word_count <= 2 {
            return Verdict::Ambiguous {
                clarification: ambiguous_message(locale),
            };
        }

        if keyword_hits == 0 {
            return Verdict::OffTopic {
                reason: off_topic_message(locale),
            };
        }

        Verdict::OnTopic
    }
}

fn ambiguous_message(locale: Locale) -> String {
    match locale {
        Locale::En => {
            "Could you say more about what you'd like to see — which metric, entity, or time range?"
                .to_string()
        }
        Locale::Ar => "هل يمكنك توضيح المقياس أو الفترة الزمنية المطلوبة؟".to_string(),
    }
}

fn off_topic_message(locale: Locale) -> String {
    match locale {
        Locale::En => {
            "I can only answer questions about healthcare and accounting data in this warehouse."
                .to_string()
        }
        Locale::Ar => "يمكنني الإجابة فقط عن أسئلة بيانات الرعاية الصحية والمحاسبة.".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn off_topic_question_is_rejected() {
        let guard = HallucinationGuard::new(8);
        let verdict = guard.classify("what's the weather today?", Locale::En);
        assert!(matches!(verdict, Verdict::OffTopic { .. }));
    }

    #[test]
    fn ambiguous_short_question_requests_clarification() {
        let guard = HallucinationGuard::new(8);
        let verdict = guard.classify("show data", Locale::En);
        assert!(matches!(verdict, Verdict::Ambiguous { .. }));
    }

    #[test]
    fn on_topic_question_proceeds() {
        let guard = HallucinationGuard::new(8);
        let verdict = guard.classify("what is total revenue in january 2026", Locale::En);
        assert_eq!(verdict, Verdict::OnTopic);
    }

    #[test]
    fn cache_returns_same_verdict_for_same_key() {
        let guard = HallucinationGuard::new(1);
        let first = guard.classify("total revenue this month", Locale::En);
        let second = guard.classify("total revenue this month", Locale::En);
        assert_eq!(first, second);
    }

    #[test]
    fn cache_evicts_oldest_entry_beyond_capacity() {
        let mut cache = BoundedVerdictCache::new(1);
        cache.insert(("a".to_string(), Locale::En), Verdict::OnTopic);
        cache.insert(
            ("b".to_string(), Locale::En),
            Verdict::OffTopic {
                reason: "x".to_string(),
            },
        );
        assert!(cache.get(&("a".to_string(), Locale::En)).is_none());
        assert!(cache.get(&("b".to_string(), Locale::En)).is_some());
    }
}
