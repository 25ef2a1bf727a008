use hashbrown::HashMap;
use serde::Serialize;

use super::meta::AllocationInfo;
use crate::stack::StackNodeHandle;

/// A copy of one live allocation's metadata, safe to hold on to after the
/// allocation is gone
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    /// The user pointer (or for external records, the record's own address)
    pub address: usize,
    pub size: usize,
    pub align: usize,
    pub tag: Option<&'static str>,
    pub stack: StackNodeHandle,
    pub external: bool,
}

impl AllocationRecord {
    pub(crate) fn new(info: &AllocationInfo, address: usize) -> Self {
        Self {
            address,
            size: info.size(),
            align: info.align(),
            tag: info.tag(),
            stack: info.stack(),
            external: info.is_external(),
        }
    }
}

/// Everything still alive when the leak check ran. Empty means no leaks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LeakReport {
    pub leaks: Vec<AllocationRecord>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SiteSummary {
    pub count: usize,
    pub bytes: usize,
}

impl LeakReport {
    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.leaks.len()
    }

    pub fn total_bytes(&self) -> usize {
        self.leaks.iter().map(|leak| leak.size).sum()
    }

    /// Leaks grouped by the call stack that allocated them
    pub fn by_site(&self) -> HashMap<StackNodeHandle, SiteSummary> {
        let mut sites: HashMap<StackNodeHandle, SiteSummary> = HashMap::new();
        for leak in &self.leaks {
            let site = sites.entry(leak.stack).or_default();
            site.count += 1;
            site.bytes += leak.size;
        }
        sites
    }
}

/// One allocation whose guards didn't hold
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GuardViolation {
    pub allocation: AllocationRecord,
    /// Something wrote just before the allocation
    pub front_intact: bool,
    /// Something wrote just past the allocation
    pub back_intact: bool,
}

/// Result of one full guard scan
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GuardReport {
    /// Allocations looked at (external ones don't count)
    pub checked: usize,
    pub violations: Vec<GuardViolation>,
}

impl GuardReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn find(&self, address: usize) -> Option<&GuardViolation> {
        self.violations
            .iter()
            .find(|v| v.allocation.address == address)
    }
}
