#![allow(dead_code)]

use anchorprof_trace::format::{FLUSH_HEADER_SIZE, decode_records};
use anchorprof_trace::{FlushHeader, ResultKind, ResultRecord};
use std::path::Path;

/// One decoded flush block.
pub struct Block {
    pub header: FlushHeader,
    pub name: String,
    pub records: Vec<ResultRecord>,
}

/// Decode every block in a complete log, panicking on malformed input.
pub fn read_blocks(path: &Path) -> Vec<Block> {
    let bytes = std::fs::read(path).unwrap();
    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let raw: &[u8; FLUSH_HEADER_SIZE] = bytes[pos..pos + FLUSH_HEADER_SIZE].try_into().unwrap();
        let header = FlushHeader::decode(raw);
        pos += FLUSH_HEADER_SIZE;
        let name_end = pos + header.name_length as usize;
        let name = String::from_utf8(bytes[pos..name_end].to_vec()).unwrap();
        let payload_end = name_end + header.payload_length as usize;
        let records = decode_records(&bytes[name_end..payload_end]).collect();
        blocks.push(Block {
            header,
            name,
            records,
        });
        pos = payload_end;
    }
    blocks
}

/// Records logged under `name`, across all blocks.
pub fn records_for(blocks: &[Block], name: &str) -> Vec<ResultRecord> {
    blocks
        .iter()
        .filter(|block| block.name == name)
        .flat_map(|block| block.records.iter().copied())
        .collect()
}

/// Cycle and cpu-migration records: exactly one per finished measurement.
pub fn timing_records(records: &[ResultRecord]) -> usize {
    records
        .iter()
        .filter(|r| matches!(r.kind(), Some(ResultKind::Cycles | ResultKind::CpuMigrations)))
        .count()
}
