//! Visualization Router: picks a chart type from detected intent and the
//! result's data shape.

use serde::{Deserialize, Serialize};

/// Tagged chart specification handed back to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChartSpec {
    Line {
        data: serde_json::Value,
        axes: Vec<String>,
        title: String,
        confidence: f64,
    },
    Bar {
        data: serde_json::Value,
        axes: Vec<String>,
        title: String,
        confidence: f64,
    },
    Pie {
        data: serde_json::Value,
        axes: Vec<String>,
        title: String,
        confidence: f64,
    },
    #[serde(rename = "kpi")]
    KPI {
        data: serde_json::Value,
        axes: Vec<String>,
        title: String,
        confidence: f64,
    },
    Scatter {
        data: serde_json::Value,
        axes: Vec<String>,
        title: String,
        confidence: f64,
    },
    Table {
        data: serde_json::Value,
        axes: Vec<String>,
        title: String,
        confidence: f64,
    },
}

impl ChartSpec {
    pub fn confidence(&self) -> f64 {
        match self {
            ChartSpec::Line { confidence, .. }
            | ChartSpec::Bar { confidence, .. }
            | ChartSpec::Pie { confidence, .. }
            | ChartSpec::KPI { confidence, .. }
            | ChartSpec::Scatter { confidence, .. }
            | ChartSpec::Table { confidence, .. } => *confidence,
        }
    }
}

/// Shape of the result set the router classifies on top of intent.
#[derive(Debug, Clone)]
pub struct ResultShape {
    pub row_count: usize,
    pub numeric_column_count: usize,
    pub has_time_column: bool,
    pub distinct_category_count: Option<usize>,
}

/// Combines intent-based and data-shape classification via a weighted sum;
/// falls back to `Table` when combined confidence is below 60.
pub struct VisualizationRouter;

impl VisualizationRouter {
    pub fn route(
        detected_intent: &str,
        intent_confidence: f64,
        shape: &ResultShape,
        title: impl Into<String>,
        data: serde_json::Value,
        axes: Vec<String>,
    ) -> ChartSpec {
        let title = title.into();

        // KPICard takes priority for single-row, single-numeric results,
        // regardless of intent label (spec.md §4.11 tie-break rule).
        if shape.row_count == 1 && shape.numeric_column_count == 1 {
            return ChartSpec::KPI {
                data,
                axes,
                title,
                confidence: intent_confidence.max(0.6),
            };
        }

        let shape_confidence = shape_based_confidence(shape);
        let combined = (intent_confidence * 0.6 + shape_confidence * 0.4) * 100.0;

        if combined < 60.0 {
            return ChartSpec::Table {
                data,
                axes,
                title,
                confidence: combined / 100.0,
            };
        }

        let confidence = combined / 100.0;
        match detected_intent.to_ascii_lowercase().as_str() {
            "trend" => {
                // Prefer Line over Bar on a time-typed x-axis.
                if shape.has_time_column {
                    ChartSpec::Line { data, axes, title, confidence }
                } else {
                    ChartSpec::Bar { data, axes, title, confidence }
                }
            }
            "comparison" => ChartSpec::Bar { data, axes, title, confidence },
            "breakdown" => {
                if shape.distinct_category_count.unwrap_or(usize::MAX) <= 8 {
                    ChartSpec::Pie { data, axes, title, confidence }
                } else {
                    ChartSpec::Bar { data, axes, title, confidence }
                }
            }
            "kpi" => ChartSpec::KPI { data, axes, title, confidence },
            "correlation" => ChartSpec::Scatter { data, axes, title, confidence },
            _ => ChartSpec::Table { data, axes, title, confidence },
        }
    }
}

fn shape_based_confidence(shape: &ResultShape) -> f64 {
    if shape.row_count == 0 {
        return 0.0;
    }
    let mut score = 0.5;
    if shape.numeric_column_count > 0 {
        score += 0.2;
    }
    if shape.has_time_column {
        score += 0.15;
    }
    if let Some(categories) = shape.distinct_category_count {
        if categories > 0 && categories <= 8 {
            score += 0.15;
        }
    }
    score.min(1.0)
}
