//! Tooling around materialized JSONL: line access, display truncation, and
//! task/document down-sampling. The global allocator comes from `headwater`.

pub mod jsonl;
pub mod sampling;
