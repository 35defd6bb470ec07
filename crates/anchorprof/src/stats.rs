//! Per-function, per-kind aggregation of logged values.

use crate::parser::Block;
use anchorprof_trace::ResultKind;
use std::collections::BTreeMap;

/// Summary statistics of one group of samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub stddev: f64,
    pub min: u64,
    pub max: u64,
    pub p50: u64,
    pub p99: u64,
}

impl Summary {
    /// Sorts `values` in place. `None` for an empty group.
    pub fn compute(values: &mut [u64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        values.sort_unstable();

        let count = values.len();
        let sum: u128 = values.iter().map(|&v| v as u128).sum();
        let mean = sum as f64 / count as f64;
        let variance = values
            .iter()
            .map(|&v| {
                let d = v as f64 - mean;
                d * d
            })
            .sum::<f64>()
            / count as f64;

        Some(Summary {
            count,
            mean,
            stddev: variance.sqrt(),
            min: values[0],
            max: values[count - 1],
            p50: percentile(values, 50),
            p99: percentile(values, 99),
        })
    }
}

/// `sorted[floor(len * pct / 100)]`.
pub fn percentile(sorted: &[u64], pct: usize) -> u64 {
    let index = (sorted.len() * pct / 100).min(sorted.len() - 1);
    sorted[index]
}

/// Display label for a raw kind value.
pub fn kind_label(kind: u64) -> String {
    match ResultKind::from_u64(kind) {
        Some(kind) => kind.name().to_string(),
        None => format!("unknown({kind})"),
    }
}

/// Statistics of one (function, kind) group.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub function: String,
    pub kind: u64,
    pub summary: Summary,
}

impl GroupStats {
    pub fn kind_label(&self) -> String {
        kind_label(self.kind)
    }
}

/// Collects raw values from any number of logs.
#[derive(Debug, Default)]
pub struct Aggregator {
    groups: BTreeMap<String, BTreeMap<u64, Vec<u64>>>,
    blocks: usize,
    records: usize,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, block: &Block) {
        self.blocks += 1;
        if block.records.is_empty() {
            return;
        }
        let kinds = self.groups.entry(block.name.clone()).or_default();
        for record in &block.records {
            kinds.entry(record.kind).or_default().push(record.value);
        }
        self.records += block.records.len();
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn records(&self) -> usize {
        self.records
    }

    /// Groups ordered by function name, then kind value.
    pub fn finish(self) -> Vec<GroupStats> {
        let mut out = Vec::new();
        for (function, kinds) in self.groups {
            for (kind, mut values) in kinds {
                if let Some(summary) = Summary::compute(&mut values) {
                    out.push(GroupStats {
                        function: function.clone(),
                        kind,
                        summary,
                    });
                }
            }
        }
        out
    }
}
