use std::collections::HashMap;

use crate::cache::CacheSnapshot;
use crate::maps::MemoryRegion;

const ANONYMOUS: &str = "[anon]";

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PageAnalysisResult {
    pub total_slots: u64,
    pub filled_slots: u64,
    pub empty_slots: u64,
    /// Pages whose address is no longer mapped.
    pub unmapped_pages: u64,
    /// Pages per backing name; anonymous memory is counted under `[anon]`.
    pub pages_by_region: HashMap<String, u64>,
}

/// Attribute the pages in `snapshot` to the regions they fall into.
pub fn page_analytics(snapshot: &CacheSnapshot, regions: &[MemoryRegion]) -> PageAnalysisResult {
    let mut result = PageAnalysisResult {
        total_slots: snapshot.capacity() as u64,
        ..PageAnalysisResult::default()
    };
    for page in snapshot.pages() {
        result.filled_slots += 1;
        match regions.iter().find(|r| r.range().contains(page)) {
            Some(region) => {
                let name = if region.is_anonymous() {
                    ANONYMOUS
                } else {
                    region.pathname.as_str()
                };
                *result.pages_by_region.entry(name.to_string()).or_insert(0) += 1;
            }
            None => result.unmapped_pages += 1,
        }
    }
    result.empty_slots = result.total_slots - result.filled_slots;
    result
}

pub fn log_analytics(result: &PageAnalysisResult) {
    info!("Cache slots: {}", result.total_slots);
    info!("Touched pages: {}", result.filled_slots);
    info!("Empty slots: {}", result.empty_slots);
    if result.unmapped_pages > 0 {
        info!("Pages no longer mapped: {}", result.unmapped_pages);
    }
    let mut regions: Vec<_> = result.pages_by_region.iter().collect();
    regions.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
    for (name, count) in regions {
        info!("{:>8} pages in {}", count, name);
    }
}
