use std::collections::HashSet;

use serde::Serialize;

use crate::models::{
    question::CandidateQuestion,
    template::{TemplateBlock, TemplateSegment},
};

/// Candidates for one template segment.
#[derive(Debug, Clone, Serialize)]
pub struct SegmentPool {
    pub segment_id: i64,
    pub required: usize,
    pub candidates: Vec<CandidateQuestion>,
}

/// Candidates for one template block, segment by segment.
#[derive(Debug, Clone, Serialize)]
pub struct CacheBlock {
    pub block: TemplateBlock,
    pub segments: Vec<SegmentPool>,
}

/// Request-scoped snapshot of every eligible candidate, built once per
/// generation request and shared read-only by all variants of that request.
///
/// Sampling never mutates it; each attempt works on its own ordering of the pools.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GeneratorCache {
    blocks: Vec<CacheBlock>,
}

impl GeneratorCache {
    pub fn new(blocks: Vec<CacheBlock>) -> Self {
        Self { blocks }
    }

    pub fn blocks(&self) -> &[CacheBlock] {
        &self.blocks
    }

    /// Distinct candidate question ids across all segments.
    pub fn question_ids(&self) -> HashSet<i64> {
        self.blocks
            .iter()
            .flat_map(|b| b.segments.iter())
            .flat_map(|s| s.candidates.iter().map(|c| c.id))
            .collect()
    }
}

impl SegmentPool {
    pub fn new(segment: &TemplateSegment, candidates: Vec<CandidateQuestion>) -> Self {
        Self {
            segment_id: segment.id,
            required: segment.question_count.max(0) as usize,
            candidates,
        }
    }
}

/// Merges hand-picked and filter-derived candidates, keeping the first
/// occurrence of every question id.
pub fn merge_candidates(
    handpicked: Vec<CandidateQuestion>,
    filtered: Vec<CandidateQuestion>,
) -> Vec<CandidateQuestion> {
    let mut seen = HashSet::new();
    handpicked
        .into_iter()
        .chain(filtered)
        .filter(|c| seen.insert(c.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::template::QuestionFormat;

    fn candidate(id: i64) -> CandidateQuestion {
        CandidateQuestion {
            id,
            times_used: 0,
            question_format: QuestionFormat::Open,
            answers: vec![],
        }
    }

    #[test]
    fn test_merge_candidates_dedups() {
        let merged = merge_candidates(
            vec![candidate(1), candidate(2)],
            vec![candidate(2), candidate(3)],
        );
        let ids: Vec<i64> = merged.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
