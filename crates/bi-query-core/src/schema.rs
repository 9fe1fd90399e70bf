//! Schema Retriever: given a normalized question, returns the ranked
//! table/column/query-pattern context used to prompt the Text-to-SQL
//! Generator.

use serde::{Deserialize, Serialize};

/// A warehouse table available for prompt grounding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub description: String,
    pub columns: Vec<String>,
    pub primary_keys: Vec<String>,
    pub relevance: f64,
}

/// A representative query template, included to show the model idiomatic
/// shapes for a given intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub name: String,
    pub description: String,
    pub template_sql: String,
    pub relevance: f64,
}

/// Ranked retrieval context handed to the Text-to-SQL Generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaContext {
    pub tables: Vec<TableSpec>,
    pub patterns: Vec<Pattern>,
    pub relevance: f64,
}

impl SchemaContext {
    pub fn to_prompt_fragment(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            out.push_str(&format!(
                "TABLE {} ({}) — {}\n  columns: {}\n  primary_keys: {}\n",
                table.name,
                table.relevance,
                table.description,
                table.columns.join(", "),
                table.primary_keys.join(", "),
            ));
        }
        for pattern in &self.patterns {
            out.push_str(&format!(
                "PATTERN {} — {}\n  {}\n",
                pattern.name, pattern.description, pattern.template_sql
            ));
        }
        out
    }
}

/// Source of candidate tables/patterns a concrete catalog implements.
/// Kept as a trait (rather than a hardcoded in-memory set) so a production
/// deployment can back it with an embedding-similarity index without
/// touching the retriever's ranking/capping logic.
pub trait SchemaCatalog: Send + Sync {
    fn candidate_tables(&self, normalized_text: &str) -> Vec<TableSpec>;
    fn candidate_patterns(&self, normalized_text: &str) -> Vec<Pattern>;
}

/// Retrieves and caps schema context to fit a prompt budget.
pub struct SchemaRetriever {
    catalog: Box<dyn SchemaCatalog>,
    max_tables: usize,
    max_patterns: usize,
}

impl SchemaRetriever {
    pub fn new(catalog: Box<dyn SchemaCatalog>, max_tables: usize, max_patterns: usize) -> Self {
        Self {
            catalog,
            max_tables,
            max_patterns,
        }
    }

    pub fn retrieve(&self, normalized_text: &str) -> SchemaContext {
        let mut tables = self.catalog.candidate_tables(normalized_text);
        let mut patterns = self.catalog.candidate_patterns(normalized_text);

        // Deterministic tie-break: descending relevance, then ascending name
        // (spec.md §4.5). Relevance is bucketed to two decimal places before
        // comparison so floating noise doesn't break ties unpredictably.
        tables.sort_by(|a, b| tie_break_key(a.relevance, &a.name).cmp(&tie_break_key(b.relevance, &b.name)));
        patterns.sort_by(|a, b| {
            tie_break_key(a.relevance, &a.name).cmp(&tie_break_key(b.relevance, &b.name))
        });

        tables.truncate(self.max_tables);
        patterns.truncate(self.max_patterns);

        let overall_relevance = tables
            .first()
            .map(|t| t.relevance)
            .unwrap_or(0.0)
            .max(patterns.first().map(|p| p.relevance).unwrap_or(0.0));

        SchemaContext {
            tables,
            patterns,
            relevance: overall_relevance,
        }
    }
}

/// Sorts descending by relevance, ascending by name — negating the bucketed
/// relevance turns "descending relevance" into a plain ascending tuple sort.
fn tie_break_key(relevance: f64, name: &str) -> (i64, String) {
    let bucketed = (relevance * 100.0).round() as i64;
    (-bucketed, name.to_string())
}

/// Reference catalog for the healthcare/accounting warehouse this gateway
/// targets. Relevance is a plain keyword-overlap score against each table's
/// name/description/columns — standing in for the "embedding-similarity
/// conceptually" retrieval spec.md leaves implementation-defined, without
/// pulling in a vector index for a fixed, small table set.
pub struct StaticSchemaCatalog {
    tables: Vec<TableSpec>,
    patterns: Vec<Pattern>,
}

impl Default for StaticSchemaCatalog {
    fn default() -> Self {
        Self {
            tables: vec![
                TableSpec {
                    name: "patients".to_string(),
                    description: "One row per registered patient".to_string(),
                    columns: vec![
                        "patient_id".to_string(),
                        "full_name".to_string(),
                        "date_of_birth".to_string(),
                        "clinic_id".to_string(),
                    ],
                    primary_keys: vec!["patient_id".to_string()],
                    relevance: 0.0,
                },
                TableSpec {
                    name: "patient_visits".to_string(),
                    description: "One row per patient visit/appointment attended".to_string(),
                    columns: vec![
                        "visit_id".to_string(),
                        "patient_id".to_string(),
                        "clinic_id".to_string(),
                        "visit_date".to_string(),
                        "department".to_string(),
                    ],
                    primary_keys: vec!["visit_id".to_string()],
                    relevance: 0.0,
                },
                TableSpec {
                    name: "invoices".to_string(),
                    description: "Billing invoices raised against a patient visit".to_string(),
                    columns: vec![
                        "invoice_id".to_string(),
                        "patient_id".to_string(),
                        "total_billed_amount".to_string(),
                        "currency".to_string(),
                        "issued_at".to_string(),
                    ],
                    primary_keys: vec!["invoice_id".to_string()],
                    relevance: 0.0,
                },
                TableSpec {
                    name: "claims".to_string(),
                    description: "Insurance claims filed against an invoice".to_string(),
                    columns: vec![
                        "claim_id".to_string(),
                        "invoice_id".to_string(),
                        "status".to_string(),
                        "denied_reason".to_string(),
                        "filed_at".to_string(),
                    ],
                    primary_keys: vec!["claim_id".to_string()],
                    relevance: 0.0,
                },
                TableSpec {
                    name: "appointments".to_string(),
                    description: "Scheduled appointments, including no-shows".to_string(),
                    columns: vec![
                        "appointment_id".to_string(),
                        "patient_id".to_string(),
                        "scheduled_at".to_string(),
                        "attended".to_string(),
                    ],
                    primary_keys: vec!["appointment_id".to_string()],
                    relevance: 0.0,
                },
                TableSpec {
                    name: "accounts_receivable".to_string(),
                    description: "Outstanding amounts owed to the organization".to_string(),
                    columns: vec![
                        "ar_id".to_string(),
                        "invoice_id".to_string(),
                        "outstanding_amount".to_string(),
                        "due_date".to_string(),
                    ],
                    primary_keys: vec!["ar_id".to_string()],
                    relevance: 0.0,
                },
                TableSpec {
                    name: "accounts_payable".to_string(),
                    description: "Outstanding amounts owed to vendors".to_string(),
                    columns: vec![
                        "ap_id".to_string(),
                        "vendor_id".to_string(),
                        "outstanding_amount".to_string(),
                        "due_date".to_string(),
                    ],
                    primary_keys: vec!["ap_id".to_string()],
                    relevance: 0.0,
                },
            ],
            patterns: vec![
                Pattern {
                    name: "monthly_total".to_string(),
                    description: "Sum a measure grouped by calendar month".to_string(),
                    template_sql: "SELECT strftime('%Y-%m', issued_at) AS month, SUM(total_billed_amount) AS total FROM invoices GROUP BY month".to_string(),
                    relevance: 0.0,
                },
                Pattern {
                    name: "breakdown_by_department".to_string(),
                    description: "Count rows grouped by department/category".to_string(),
                    template_sql: "SELECT department, COUNT(*) AS count FROM patient_visits GROUP BY department".to_string(),
                    relevance: 0.0,
                },
                Pattern {
                    name: "single_kpi".to_string(),
                    description: "A single aggregate value with no grouping".to_string(),
                    template_sql: "SELECT COUNT(*) AS value FROM patients".to_string(),
                    relevance: 0.0,
                },
            ],
        }
    }
}

impl StaticSchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn keyword_overlap(text: &str, haystack: &str) -> f64 {
    let words: Vec<String> = text
        .to_ascii_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let haystack = haystack.to_ascii_lowercase();
    let hits = words.iter().filter(|w| haystack.contains(w.as_str())).count();
    (hits as f64 / words.len() as f64).min(1.0)
}

impl SchemaCatalog for StaticSchemaCatalog {
    fn candidate_tables(&self, normalized_text: &str) -> Vec<TableSpec> {
        self.tables
            .iter()
            .cloned()
            .map(|mut table| {
                let haystack = format!("{} {} {}", table.name, table.description, table.columns.join(" "));
                table.relevance = keyword_overlap(normalized_text, &haystack).max(0.1);
                table
            })
            .collect()
    }

    fn candidate_patterns(&self, normalized_text: &str) -> Vec<Pattern> {
        self.patterns
            .iter()
            .cloned()
            .map(|mut pattern| {
                let haystack = format!("{} {}", pattern.name, pattern.description);
                pattern.relevance = keyword_overlap(normalized_text, &haystack).max(0.05);
                pattern
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedCatalog {
        tables: Vec<TableSpec>,
        patterns: Vec<Pattern>,
    }

    impl SchemaCatalog for FixedCatalog {
        fn candidate_tables(&self, _normalized_text: &str) -> Vec<TableSpec> {
            self.tables.clone()
        }

        fn candidate_patterns(&self, _normalized_text: &str) -> Vec<Pattern> {
            self.patterns.clone()
        }
    }

    fn table(name: &str, relevance: f64) -> TableSpec {
        TableSpec {
            name: name.to_string(),
            description: String::new(),
            columns: vec!["id".to_string()],
            primary_keys: vec!["id".to_string()],
            relevance,
        }
    }

    #[test]
    fn caps_to_max_tables_and_patterns() {
        let catalog = FixedCatalog {
            tables: vec![table("a", 0.9), table("b", 0.8), table("c", 0.95)],
            patterns: vec![],
        };
        let retriever = SchemaRetriever::new(Box::new(catalog), 2, 0);
        let ctx = retriever.retrieve("revenue by month");
        assert_eq!(ctx.tables.len(), 2);
        assert_eq!(ctx.tables[0].name, "c");
    }

    #[test]
    fn ties_break_by_ascending_name() {
        let catalog = FixedCatalog {
            tables: vec![table("zebra", 0.9), table("alpha", 0.9)],
            patterns: vec![],
        };
        let retriever = SchemaRetriever::new(Box::new(catalog), 5, 5);
        let ctx = retriever.retrieve("anything");
        assert_eq!(ctx.tables[0].name, "alpha");
        assert_eq!(ctx.tables[1].name, "zebra");
    }
}
