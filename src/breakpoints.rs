//! Shadow bookkeeping of which breakpoints are physically installed in the
//! real debuggee.
//!
//! A breakpoint requested while live-recording is pushed down to process
//! control; one requested while replaying only exists here. Removal must
//! know the difference so that it never asks process control to remove a
//! breakpoint it never saw.

use crate::target::AddressSpaceId;

/// Where a breakpoint is placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BreakpointSite {
    /// Code address
    pub address: u64,
    /// Address space of the code
    pub address_space: AddressSpaceId,
}

impl BreakpointSite {
    /// A site in the default address space
    pub fn new(address: u64) -> Self {
        Self {
            address,
            address_space: AddressSpaceId::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ShadowEntry {
    site: BreakpointSite,
    physically_inserted: bool,
}

/// Set of breakpoints known while recording is active
#[derive(Debug, Default)]
pub struct BreakpointShadow {
    entries: Vec<ShadowEntry>,
}

impl BreakpointShadow {
    /// An empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopts breakpoints that were installed before recording started
    pub fn sync(&mut self, sites: impl IntoIterator<Item = BreakpointSite>) {
        self.entries = sites
            .into_iter()
            .map(|site| ShadowEntry {
                site,
                physically_inserted: true,
            })
            .collect();
    }

    /// Records an inserted breakpoint. Inserting a known site again is a no-op.
    pub fn note_inserted(&mut self, site: BreakpointSite, physically_inserted: bool) {
        if let Some(entry) = self.entries.iter().find(|entry| entry.site == site) {
            if entry.physically_inserted != physically_inserted {
                log::warn!(
                    "breakpoint at {:#x} re-inserted with a different installation state",
                    site.address
                );
            }
            return;
        }
        self.entries.push(ShadowEntry {
            site,
            physically_inserted,
        });
    }

    /// Forgets a breakpoint, returning whether it was physically inserted,
    /// or `None` if the site is unknown
    pub fn note_removed(&mut self, site: BreakpointSite) -> Option<bool> {
        let index = self.entries.iter().position(|entry| entry.site == site)?;
        Some(self.entries.swap_remove(index).physically_inserted)
    }

    /// Whether the breakpoint at `site` is installed in the real debuggee
    pub fn is_physically_inserted(&self, site: BreakpointSite) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.site == site && entry.physically_inserted)
    }

    /// Whether any breakpoint, physical or not, sits at `address`
    pub fn contains(&self, address_space: AddressSpaceId, address: u64) -> bool {
        self.entries.iter().any(|entry| {
            entry.site.address == address && entry.site.address_space == address_space
        })
    }

    /// Number of tracked breakpoints
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no breakpoints are tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tracked sites in insertion order (modulo removals)
    pub fn sites(&self) -> impl Iterator<Item = BreakpointSite> + '_ {
        self.entries.iter().map(|entry| entry.site)
    }
}
