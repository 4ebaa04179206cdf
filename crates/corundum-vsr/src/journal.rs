//! In-memory index over the WAL.
//!
//! The journal holds, per slot, the header the replica believes is
//! there plus two bitmaps:
//!
//! - **dirty**: the header is trusted but the prepare body is missing
//!   or unverified (torn slots, headers adopted from a peer).
//! - **faulty**: the slot is unreadable and vouches for nothing.
//!
//! During normal status the journal is authoritative for "which ops
//! this replica has". Repair enqueues `request_prepare` for dirty ops
//! within `[commit_min + 1, op_head]`.

use corundum_types::constants::SLOT_COUNT;
use corundum_types::{Checksum, OpNumber};
use corundum_wire::Header;

const WORDS: usize = SLOT_COUNT.div_ceil(64);

/// A bitmap over WAL slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct SlotSet {
    words: [u64; WORDS],
}

impl SlotSet {
    fn get(&self, slot: usize) -> bool {
        self.words[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set(&mut self, slot: usize, value: bool) {
        if value {
            self.words[slot / 64] |= 1 << (slot % 64);
        } else {
            self.words[slot / 64] &= !(1 << (slot % 64));
        }
    }

    fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// The slot-indexed view of the WAL.
#[derive(Debug, Clone)]
pub struct Journal {
    headers: Vec<Option<Header>>,
    dirty: SlotSet,
    faulty: SlotSet,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            headers: vec![None; SLOT_COUNT],
            dirty: SlotSet::default(),
            faulty: SlotSet::default(),
        }
    }

    /// Installs a header for its slot, clean (body present and
    /// verified).
    pub fn set_header_clean(&mut self, header: Header) {
        let slot = header.op.slot();
        self.headers[slot] = Some(header);
        self.dirty.set(slot, false);
        self.faulty.set(slot, false);
    }

    /// Installs a header whose body is not (yet) locally valid.
    pub fn set_header_dirty(&mut self, header: Header) {
        let slot = header.op.slot();
        self.headers[slot] = Some(header);
        self.dirty.set(slot, true);
        self.faulty.set(slot, false);
    }

    /// Marks a slot completely unusable.
    pub fn set_faulty(&mut self, slot: usize) {
        self.headers[slot] = None;
        self.dirty.set(slot, false);
        self.faulty.set(slot, true);
    }

    /// Clears a slot back to empty (used when truncating a suffix).
    pub fn clear_slot(&mut self, slot: usize) {
        self.headers[slot] = None;
        self.dirty.set(slot, false);
        self.faulty.set(slot, false);
    }

    /// Marks an op's body as repaired.
    pub fn mark_repaired(&mut self, op: OpNumber) {
        debug_assert!(self.header_for_op(op).is_some());
        self.dirty.set(op.slot(), false);
    }

    /// The header for `op`, if this journal holds exactly that op.
    pub fn header_for_op(&self, op: OpNumber) -> Option<&Header> {
        self.headers[op.slot()].as_ref().filter(|h| h.op == op)
    }

    /// Whatever header currently occupies a slot, regardless of op.
    pub fn header_in_slot(&self, slot: usize) -> Option<&Header> {
        self.headers[slot].as_ref()
    }

    /// The checksum of the prepare at `op`, if known.
    pub fn checksum_for_op(&self, op: OpNumber) -> Option<Checksum> {
        self.header_for_op(op).map(|h| h.checksum)
    }

    /// True when the replica can vouch for both header and body of
    /// `op`.
    pub fn has_prepare(&self, op: OpNumber) -> bool {
        self.header_for_op(op).is_some() && !self.dirty.get(op.slot())
    }

    /// True when the replica has a trusted header for `op` (body may
    /// still be dirty).
    pub fn has_header(&self, op: OpNumber) -> bool {
        self.header_for_op(op).is_some()
    }

    pub fn is_dirty(&self, op: OpNumber) -> bool {
        self.header_for_op(op).is_some() && self.dirty.get(op.slot())
    }

    pub fn is_slot_faulty(&self, slot: usize) -> bool {
        self.faulty.get(slot)
    }

    /// Faulty slot indices, for do_view_change reporting.
    pub fn faulty_slots(&self) -> Vec<u32> {
        (0..SLOT_COUNT)
            .filter(|&slot| self.faulty.get(slot))
            .map(|slot| slot as u32)
            .collect()
    }

    /// Ops in `[op_min, op_max]` whose bodies need repair: dirty, or
    /// missing entirely (no header).
    pub fn repair_candidates(
        &self,
        op_min: OpNumber,
        op_max: OpNumber,
    ) -> impl Iterator<Item = OpNumber> + '_ {
        (op_min.as_u64()..=op_max.as_u64())
            .map(OpNumber::new)
            .filter(|&op| !self.has_prepare(op))
    }

    /// The highest op with a trusted header at or above `floor`.
    pub fn op_head(&self, floor: OpNumber) -> OpNumber {
        self.headers
            .iter()
            .flatten()
            .map(|h| h.op)
            .filter(|&op| op >= floor)
            .max()
            .unwrap_or(floor)
    }

    /// Headers for ops in `[op_min, op_max]`, ascending. Gaps (ops with
    /// no header) are simply absent from the result.
    pub fn headers_in_range(&self, op_min: OpNumber, op_max: OpNumber) -> Vec<Header> {
        (op_min.as_u64()..=op_max.as_u64())
            .filter_map(|op| self.header_for_op(OpNumber::new(op)).copied())
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.dirty.count()
    }

    pub fn faulty_count(&self) -> usize {
        self.faulty.count()
    }
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corundum_types::ClusterId;
    use corundum_wire::Command;

    fn header(op: u64) -> Header {
        let mut h = Header::new(ClusterId::new(1), Command::Prepare);
        h.op = OpNumber::new(op);
        h.set_checksum_body(&[]);
        h.set_checksum();
        h
    }

    #[test]
    fn clean_header_has_prepare() {
        let mut journal = Journal::new();
        journal.set_header_clean(header(5));
        assert!(journal.has_prepare(OpNumber::new(5)));
        assert!(!journal.is_dirty(OpNumber::new(5)));
        assert_eq!(journal.op_head(OpNumber::ZERO), OpNumber::new(5));
    }

    #[test]
    fn slot_aliasing_distinguishes_ops() {
        let mut journal = Journal::new();
        journal.set_header_clean(header(5));
        // op 5 + SLOT_COUNT shares the slot but is a different op.
        assert!(!journal.has_prepare(OpNumber::new(5 + SLOT_COUNT as u64)));
        assert!(journal.has_prepare(OpNumber::new(5)));
    }

    #[test]
    fn dirty_header_needs_repair() {
        let mut journal = Journal::new();
        journal.set_header_dirty(header(5));
        assert!(journal.has_header(OpNumber::new(5)));
        assert!(!journal.has_prepare(OpNumber::new(5)));
        let needs: Vec<_> = journal
            .repair_candidates(OpNumber::new(4), OpNumber::new(6))
            .collect();
        assert_eq!(
            needs,
            vec![OpNumber::new(4), OpNumber::new(5), OpNumber::new(6)]
        );

        journal.mark_repaired(OpNumber::new(5));
        assert!(journal.has_prepare(OpNumber::new(5)));
    }

    #[test]
    fn faulty_slot_reporting() {
        let mut journal = Journal::new();
        journal.set_faulty(9);
        assert!(journal.is_slot_faulty(9));
        assert_eq!(journal.faulty_slots(), vec![9]);
        assert!(!journal.has_header(OpNumber::new(9)));
    }

    #[test]
    fn headers_in_range_skips_gaps() {
        let mut journal = Journal::new();
        journal.set_header_clean(header(3));
        journal.set_header_clean(header(5));
        let headers = journal.headers_in_range(OpNumber::new(1), OpNumber::new(6));
        let ops: Vec<u64> = headers.iter().map(|h| h.op.as_u64()).collect();
        assert_eq!(ops, vec![3, 5]);
    }
}
