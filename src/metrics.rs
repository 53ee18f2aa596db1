use crate::types::{Mpt, Ratio};

#[derive(Debug, Clone)]
pub struct PartMetrics {
    pub part_index: usize,
    pub element_count: usize,
    pub footnote_element_count: usize,
    pub adjust_ratio: Ratio,
    pub difference: Mpt,
    pub blank: bool,
}

#[derive(Debug, Clone, Default)]
pub struct FlowMetrics {
    pub parts: Vec<PartMetrics>,
    pub passes: usize,
    pub nodes_created: u64,
    pub nodes_pruned: u64,
    pub fallback_parts: usize,
    pub overflows: usize,
    pub restart_at: Option<usize>,
    pub total_ms: f64,
}
