//! Per-name append-only list of `(revision, definition-or-tombstone)`
//! entries with bisection lookup.
//!
//! Thread-safety is the caller's responsibility: the watching cache guards
//! each kind's map of lists with a readers-writer lock.

use std::time::Instant;

use crate::storage::Revision;
use crate::ProxyError;

/// One observed version of a named definition. `definition == None` is a
/// tombstone recording a deletion at `revision`.
#[derive(Debug, Clone)]
pub(crate) struct VersionedEntry<D> {
    revision: Revision,
    definition: Option<D>,
    observed_at: Instant,
}

impl<D> VersionedEntry<D> {
    pub(crate) fn revision(&self) -> Revision {
        self.revision
    }

    pub(crate) fn definition(&self) -> Option<&D> {
        self.definition.as_ref()
    }
}

/// Append-only, strictly revision-ordered versions of one name.
#[derive(Debug, Clone)]
pub(crate) struct VersionedEntries<D> {
    entries: Vec<VersionedEntry<D>>,
}

impl<D> Default for VersionedEntries<D> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<D> VersionedEntries<D> {
    /// Appends a definition or tombstone at `revision`.
    ///
    /// Revisions must be strictly increasing; a second message at the last
    /// entry's exact revision replaces it (the stream may batch several
    /// messages at one commit). An older revision means the stream is out of
    /// order and the caller must drop to fallback mode.
    pub(crate) fn append(
        &mut self,
        revision: Revision,
        definition: Option<D>,
    ) -> std::result::Result<(), ProxyError> {
        if let Some(last) = self.entries.last_mut() {
            if last.revision == revision {
                last.definition = definition;
                last.observed_at = Instant::now();
                return Ok(());
            }
            if revision < last.revision {
                return Err(ProxyError::OrderingViolation {
                    revision,
                    last: last.revision,
                });
            }
        }

        self.entries.push(VersionedEntry {
            revision,
            definition,
            observed_at: Instant::now(),
        });
        Ok(())
    }

    /// Returns the entry with the greatest revision at or below `revision`,
    /// or `None` when every entry is above it.
    pub(crate) fn lookup(
        &self,
        revision: Revision,
    ) -> Option<&VersionedEntry<D>> {
        let index = self.entries.partition_point(|entry| entry.revision <= revision);
        index.checked_sub(1).map(|i| &self.entries[i])
    }

    /// Drops all but the most recent entry with revision at or below
    /// `revision`, preserving lookups at every retained revision. Reserved
    /// for a minimum-active-reader retention policy.
    #[allow(dead_code)]
    pub(crate) fn trim_before(
        &mut self,
        revision: Revision,
    ) {
        let index = self.entries.partition_point(|entry| entry.revision <= revision);
        if index > 1 {
            self.entries.drain(..index - 1);
        }
    }

    /// Drops all but the most recent entry observed before `cutoff`. The
    /// retained entry stays the lookup base for every newer revision.
    pub(crate) fn trim_observed_before(
        &mut self,
        cutoff: Instant,
    ) {
        let index = self.entries.partition_point(|entry| entry.observed_at < cutoff);
        if index > 1 {
            self.entries.drain(..index - 1);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
