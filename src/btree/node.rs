//! # Node Layout
//!
//! Tree nodes live in the payload of a page. Keys and payloads are fixed
//! eight-byte words, so a node is three flat arrays behind a small header:
//!
//! ```text
//! Payload offset 0..8    NodeHeader { node_type, count }
//!
//! Leaf:   8..2032        keys    [u64; LEAF_MAX_ENTRIES]
//!         2032..4056     values  [u64; LEAF_MAX_ENTRIES]
//!
//! Inner:  8..2032        keys     [u64; INNER_MAX_ENTRIES]
//!         2032..4064     children [u64; INNER_MAX_ENTRIES + 1]  (swips)
//! ```
//!
//! Maximum entries are derived from the page payload divided by the entry
//! footprint, minus one slack entry. Child slots hold raw swip words and are
//! additionally addressable as [`Swip`]s in place, since the slots are
//! eight-aligned within the 4096-aligned page.
//!
//! ## Read Views vs Mutation Views
//!
//! `Leaf`/`Inner` are read views used under optimistic guards: every value
//! they return may be torn and must be revalidated with the guard's
//! `recheck` before use. The only read that could otherwise walk out of
//! bounds is the entry count, so the optimistic `lower_bound` treats an
//! impossible count as a restart. `LeafMut`/`InnerMut` require the holder
//! to have the frame latched exclusively and trust what they read.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::buffer::Swip;
use crate::storage::{Page, PAGE_PAYLOAD_SIZE};
use crate::sync::{OpError, OpResult};

pub const NODE_INNER: u8 = 1;
pub const NODE_LEAF: u8 = 2;

pub const NODE_HEADER_SIZE: usize = 8;
const NODE_BODY_SIZE: usize = PAGE_PAYLOAD_SIZE - NODE_HEADER_SIZE;
const ENTRY_SIZE: usize = 16;

/// One slack entry keeps the arrays from ever filling to the brim.
pub const LEAF_MAX_ENTRIES: usize = NODE_BODY_SIZE / ENTRY_SIZE - 1;
pub const INNER_MAX_ENTRIES: usize = NODE_BODY_SIZE / ENTRY_SIZE - 1;

const KEYS_OFFSET: usize = NODE_HEADER_SIZE;
const LEAF_VALUES_OFFSET: usize = KEYS_OFFSET + LEAF_MAX_ENTRIES * 8;
const INNER_CHILDREN_OFFSET: usize = KEYS_OFFSET + INNER_MAX_ENTRIES * 8;

const _: () = assert!(
    LEAF_VALUES_OFFSET + LEAF_MAX_ENTRIES * 8 <= PAGE_PAYLOAD_SIZE,
    "leaf arrays overflow the page payload"
);
const _: () = assert!(
    INNER_CHILDREN_OFFSET + (INNER_MAX_ENTRIES + 1) * 8 <= PAGE_PAYLOAD_SIZE,
    "inner arrays overflow the page payload"
);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
struct NodeHeader {
    node_type: u8,
    _pad: u8,
    count: u16,
    _pad2: [u8; 4],
}

const _: () = assert!(size_of::<NodeHeader>() == NODE_HEADER_SIZE);

fn header(page: &Page) -> &NodeHeader {
    NodeHeader::ref_from_bytes(&page.payload()[..NODE_HEADER_SIZE])
        .expect("node header is within the payload")
}

fn header_mut(page: &mut Page) -> &mut NodeHeader {
    NodeHeader::mut_from_bytes(&mut page.payload_mut()[..NODE_HEADER_SIZE])
        .expect("node header is within the payload")
}

pub fn is_inner(page: &Page) -> bool {
    header(page).node_type == NODE_INNER
}

/// Smallest key stored in the node, used to route a parent search toward it.
/// Key arrays sit at the same offset in both layouts. `None` for an empty
/// node or a torn count.
pub fn routing_key(page: &Page) -> Option<u64> {
    let count = header(page).count as usize;
    if count == 0 || count > LEAF_MAX_ENTRIES {
        None
    } else {
        Some(read_u64(page, KEYS_OFFSET))
    }
}

fn read_u64(page: &Page, offset: usize) -> u64 {
    let bytes = &page.payload()[offset..offset + 8];
    u64::from_le_bytes(bytes.try_into().expect("eight bytes"))
}

fn write_u64(page: &mut Page, offset: usize, value: u64) {
    page.payload_mut()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn shift_up(page: &mut Page, base: usize, from: usize, upto: usize) {
    // Moves slots [from, upto) one to the right within the array at `base`.
    let start = base + from * 8;
    let end = base + upto * 8;
    page.payload_mut().copy_within(start..end, start + 8);
}

/// Binary search for the first slot with key >= `key`. `count` is trusted;
/// exact matches report their slot.
fn search_slot(page: &Page, count: usize, key: u64) -> (usize, bool) {
    let mut lower = 0;
    let mut upper = count;
    while lower < upper {
        let mid = (upper - lower) / 2 + lower;
        let probe = read_u64(page, KEYS_OFFSET + mid * 8);
        match key.cmp(&probe) {
            std::cmp::Ordering::Less => upper = mid,
            std::cmp::Ordering::Greater => lower = mid + 1,
            std::cmp::Ordering::Equal => return (mid, true),
        }
    }
    (lower, false)
}

/// `lowerBound` for optimistic readers: a count beyond the node's capacity
/// can only come from a torn read, so it surfaces as a restart instead of an
/// out-of-range probe.
fn lower_bound_optimistic(page: &Page, count: usize, max: usize, key: u64) -> OpResult<usize> {
    if count > max {
        return Err(OpError::Restart);
    }
    Ok(search_slot(page, count, key).0)
}

// ── Leaf views ───────────────────────────────────────────────────────────

pub struct Leaf<'a>(pub &'a Page);

impl Leaf<'_> {
    pub fn count(&self) -> usize {
        header(self.0).count as usize
    }

    pub fn key_at(&self, slot: usize) -> u64 {
        read_u64(self.0, KEYS_OFFSET + slot * 8)
    }

    pub fn value_at(&self, slot: usize) -> u64 {
        read_u64(self.0, LEAF_VALUES_OFFSET + slot * 8)
    }

    pub fn lower_bound(&self, key: u64) -> OpResult<usize> {
        lower_bound_optimistic(self.0, self.count(), LEAF_MAX_ENTRIES, key)
    }
}

pub struct LeafMut<'a>(pub &'a mut Page);

impl LeafMut<'_> {
    /// Formats the payload as an empty leaf.
    pub fn init(page: &mut Page) {
        let header = header_mut(page);
        header.node_type = NODE_LEAF;
        header._pad = 0;
        header.count = 0;
        header._pad2 = [0; 4];
    }

    pub fn count(&self) -> usize {
        header(self.0).count as usize
    }

    /// Sorted insert; an exact key match overwrites the payload in place.
    pub fn insert(&mut self, key: u64, value: u64) {
        let count = self.count();
        debug_assert!(count < LEAF_MAX_ENTRIES, "leaf insert past capacity");

        let (slot, found) = search_slot(self.0, count, key);
        if found {
            write_u64(self.0, LEAF_VALUES_OFFSET + slot * 8, value);
            return;
        }

        shift_up(self.0, KEYS_OFFSET, slot, count);
        shift_up(self.0, LEAF_VALUES_OFFSET, slot, count);
        write_u64(self.0, KEYS_OFFSET + slot * 8, key);
        write_u64(self.0, LEAF_VALUES_OFFSET + slot * 8, value);
        header_mut(self.0).count = (count + 1) as u16;
    }

    /// Moves the upper half of the entries into `right` (a fresh leaf) and
    /// returns the separator: the largest key remaining on the left.
    pub fn split_into(&mut self, right: &mut Page) -> u64 {
        let count = self.count();
        debug_assert!(count >= 2, "splitting an underfilled leaf");

        let right_count = count - count / 2;
        let left_count = count - right_count;

        LeafMut::init(right);
        for i in 0..right_count {
            let key = read_u64(self.0, KEYS_OFFSET + (left_count + i) * 8);
            let value = read_u64(self.0, LEAF_VALUES_OFFSET + (left_count + i) * 8);
            write_u64(right, KEYS_OFFSET + i * 8, key);
            write_u64(right, LEAF_VALUES_OFFSET + i * 8, value);
        }
        header_mut(right).count = right_count as u16;
        header_mut(self.0).count = left_count as u16;

        read_u64(self.0, KEYS_OFFSET + (left_count - 1) * 8)
    }
}

// ── Inner views ──────────────────────────────────────────────────────────

pub struct Inner<'a>(pub &'a Page);

impl<'a> Inner<'a> {
    pub fn count(&self) -> usize {
        header(self.0).count as usize
    }

    pub fn key_at(&self, slot: usize) -> u64 {
        read_u64(self.0, KEYS_OFFSET + slot * 8)
    }

    pub fn child_raw(&self, slot: usize) -> u64 {
        read_u64(self.0, INNER_CHILDREN_OFFSET + slot * 8)
    }

    /// In-place view of a child slot as a swip.
    pub fn child_swip(&self, slot: usize) -> &'a Swip {
        debug_assert!(slot <= INNER_MAX_ENTRIES);
        let offset = INNER_CHILDREN_OFFSET + slot * 8;
        let ptr = self.0.payload()[offset..].as_ptr() as *const Swip;
        // SAFETY: the slot is eight-aligned (payload is eight-aligned within
        // the 4096-aligned page and `offset` is a multiple of eight), in
        // bounds by the layout asserts, and `Swip` is a transparent wrapper
        // over AtomicU64. The lifetime is that of the page borrow.
        unsafe { &*ptr }
    }

    pub fn lower_bound(&self, key: u64) -> OpResult<usize> {
        lower_bound_optimistic(self.0, self.count(), INNER_MAX_ENTRIES, key)
    }
}

pub struct InnerMut<'a>(pub &'a mut Page);

impl InnerMut<'_> {
    /// Formats the payload as an inner node with a single (leftmost) child.
    pub fn init(page: &mut Page, leftmost_child: u64) {
        let header = header_mut(page);
        header.node_type = NODE_INNER;
        header._pad = 0;
        header.count = 0;
        header._pad2 = [0; 4];
        write_u64(page, INNER_CHILDREN_OFFSET, leftmost_child);
    }

    pub fn count(&self) -> usize {
        header(self.0).count as usize
    }

    /// Overwrites one child slot with a raw swip word.
    pub fn set_child_raw(&mut self, slot: usize, raw: u64) {
        debug_assert!(slot <= INNER_MAX_ENTRIES);
        write_u64(self.0, INNER_CHILDREN_OFFSET + slot * 8, raw);
    }

    /// Inserts `key` with `right_child` as the subtree on its right.
    pub fn insert_separator(&mut self, key: u64, right_child: u64) {
        let count = self.count();
        debug_assert!(count < INNER_MAX_ENTRIES, "inner insert past capacity");

        let (slot, found) = search_slot(self.0, count, key);
        debug_assert!(!found, "separator {} inserted twice", key);

        shift_up(self.0, KEYS_OFFSET, slot, count);
        // Children to the right of the separator shift with it.
        shift_up(self.0, INNER_CHILDREN_OFFSET, slot + 1, count + 1);
        write_u64(self.0, KEYS_OFFSET + slot * 8, key);
        write_u64(self.0, INNER_CHILDREN_OFFSET + (slot + 1) * 8, right_child);
        header_mut(self.0).count = (count + 1) as u16;
    }

    /// Splits around the middle key, which moves up as the separator and is
    /// removed from both halves. `right` receives the upper entries together
    /// with their surrounding children.
    pub fn split_into(&mut self, right: &mut Page) -> u64 {
        let count = self.count();
        debug_assert!(count >= 3, "splitting an underfilled inner node");

        let right_count = count - count / 2;
        let left_count = count - right_count - 1;
        let separator = read_u64(self.0, KEYS_OFFSET + left_count * 8);

        InnerMut::init(right, read_u64(self.0, INNER_CHILDREN_OFFSET + (left_count + 1) * 8));
        for i in 0..right_count {
            let key = read_u64(self.0, KEYS_OFFSET + (left_count + 1 + i) * 8);
            write_u64(right, KEYS_OFFSET + i * 8, key);
        }
        for i in 0..right_count {
            let child = read_u64(self.0, INNER_CHILDREN_OFFSET + (left_count + 2 + i) * 8);
            write_u64(right, INNER_CHILDREN_OFFSET + (i + 1) * 8, child);
        }
        header_mut(right).count = right_count as u16;
        header_mut(self.0).count = left_count as u16;

        separator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{decode, encode_unswizzled, SwipState};

    fn leaf_page() -> Page {
        let mut page = Page::zeroed();
        LeafMut::init(&mut page);
        page
    }

    #[test]
    fn capacities_are_derived_with_slack() {
        assert_eq!(LEAF_MAX_ENTRIES, 253);
        assert_eq!(INNER_MAX_ENTRIES, 253);
    }

    #[test]
    fn leaf_insert_keeps_keys_sorted() {
        let mut page = leaf_page();
        let mut leaf = LeafMut(&mut page);

        for key in [30u64, 10, 20, 40, 15] {
            leaf.insert(key, key * 100);
        }

        let view = Leaf(&page);
        assert_eq!(view.count(), 5);
        let keys: Vec<u64> = (0..5).map(|i| view.key_at(i)).collect();
        assert_eq!(keys, vec![10, 15, 20, 30, 40]);
        assert_eq!(view.value_at(2), 2000);
    }

    #[test]
    fn leaf_insert_overwrites_duplicate_key() {
        let mut page = leaf_page();
        let mut leaf = LeafMut(&mut page);

        leaf.insert(5, 1);
        leaf.insert(5, 2);

        let view = Leaf(&page);
        assert_eq!(view.count(), 1);
        assert_eq!(view.value_at(0), 2);
    }

    #[test]
    fn leaf_lower_bound_finds_insertion_point() {
        let mut page = leaf_page();
        let mut leaf = LeafMut(&mut page);
        for key in [10u64, 20, 30] {
            leaf.insert(key, key);
        }

        let view = Leaf(&page);
        assert_eq!(view.lower_bound(5).unwrap(), 0);
        assert_eq!(view.lower_bound(20).unwrap(), 1);
        assert_eq!(view.lower_bound(25).unwrap(), 2);
        assert_eq!(view.lower_bound(99).unwrap(), 3);
    }

    #[test]
    fn lower_bound_restarts_on_impossible_count() {
        let mut page = leaf_page();
        header_mut(&mut page).count = (LEAF_MAX_ENTRIES + 1) as u16;

        let view = Leaf(&page);
        assert!(view.lower_bound(1).is_err());
    }

    #[test]
    fn leaf_split_separator_is_last_left_key() {
        let mut page = leaf_page();
        let mut leaf = LeafMut(&mut page);
        for key in 1..=7u64 {
            leaf.insert(key, key * 10);
        }

        let mut right = Page::zeroed();
        let separator = LeafMut(&mut page).split_into(&mut right);

        // 7 entries: left keeps 3, right takes 4.
        assert_eq!(separator, 3);
        assert_eq!(Leaf(&page).count(), 3);
        assert_eq!(Leaf(&right).count(), 4);
        assert_eq!(Leaf(&right).key_at(0), 4);
        assert_eq!(Leaf(&right).value_at(3), 70);
    }

    #[test]
    fn inner_insert_separator_places_right_child() {
        let mut page = Page::zeroed();
        InnerMut::init(&mut page, encode_unswizzled(100));
        let mut inner = InnerMut(&mut page);

        inner.insert_separator(10, encode_unswizzled(110));
        inner.insert_separator(30, encode_unswizzled(130));
        inner.insert_separator(20, encode_unswizzled(120));

        let view = Inner(&page);
        assert_eq!(view.count(), 3);
        let keys: Vec<u64> = (0..3).map(|i| view.key_at(i)).collect();
        assert_eq!(keys, vec![10, 20, 30]);

        let children: Vec<SwipState> = (0..=3).map(|i| decode(view.child_raw(i))).collect();
        assert_eq!(
            children,
            vec![
                SwipState::Unswizzled { pid: 100 },
                SwipState::Unswizzled { pid: 110 },
                SwipState::Unswizzled { pid: 120 },
                SwipState::Unswizzled { pid: 130 },
            ]
        );
    }

    #[test]
    fn inner_split_removes_middle_key_from_both_halves() {
        let mut page = Page::zeroed();
        InnerMut::init(&mut page, encode_unswizzled(0));
        let mut inner = InnerMut(&mut page);
        for i in 1..=7u64 {
            inner.insert_separator(i * 10, encode_unswizzled(i));
        }

        let mut right = Page::zeroed();
        let separator = InnerMut(&mut page).split_into(&mut right);

        // 7 keys: right takes 4, separator is key index 2, left keeps 2.
        assert_eq!(separator, 30);
        let left = Inner(&page);
        let right_view = Inner(&right);
        assert_eq!(left.count(), 2);
        assert_eq!(right_view.count(), 4);

        assert_eq!(left.key_at(0), 10);
        assert_eq!(left.key_at(1), 20);
        assert_eq!(right_view.key_at(0), 40);
        assert_eq!(right_view.key_at(3), 70);

        // The child between 30 and 40 becomes the right node's leftmost.
        assert_eq!(decode(right_view.child_raw(0)), SwipState::Unswizzled { pid: 3 });
        assert_eq!(decode(right_view.child_raw(4)), SwipState::Unswizzled { pid: 7 });
        assert_eq!(decode(left.child_raw(2)), SwipState::Unswizzled { pid: 2 });
    }

    #[test]
    fn routing_is_preserved_across_inner_split() {
        // Build an inner node, split it, and check that every key routes to
        // the same child as before through (left, separator, right).
        let mut page = Page::zeroed();
        InnerMut::init(&mut page, encode_unswizzled(0));
        let mut inner = InnerMut(&mut page);
        for i in 1..=9u64 {
            inner.insert_separator(i * 10, encode_unswizzled(i));
        }

        let route_before: Vec<u64> = (0..100u64)
            .map(|k| {
                let view = Inner(&page);
                let pos = view.lower_bound(k).unwrap();
                view.child_raw(pos) >> 1
            })
            .collect();

        let mut right = Page::zeroed();
        let separator = InnerMut(&mut page).split_into(&mut right);

        let route_after: Vec<u64> = (0..100u64)
            .map(|k| {
                let view = if k <= separator {
                    Inner(&page)
                } else {
                    Inner(&right)
                };
                let pos = view.lower_bound(k).unwrap();
                view.child_raw(pos) >> 1
            })
            .collect();

        assert_eq!(route_before, route_after);
    }

    #[test]
    fn child_swip_reads_slots_in_place() {
        let mut page = Page::zeroed();
        InnerMut::init(&mut page, encode_unswizzled(55));
        InnerMut(&mut page).insert_separator(10, encode_unswizzled(66));

        let view = Inner(&page);
        assert_eq!(view.child_swip(0).pid(), 55);
        assert_eq!(view.child_swip(1).pid(), 66);

        view.child_swip(1).swizzle(3);
        assert_eq!(decode(Inner(&page).child_raw(1)), SwipState::Swizzled { frame: 3 });
    }

    #[test]
    fn node_type_tags_distinguish_views() {
        let mut leaf = Page::zeroed();
        LeafMut::init(&mut leaf);
        assert!(!is_inner(&leaf));

        let mut inner = Page::zeroed();
        InnerMut::init(&mut inner, encode_unswizzled(0));
        assert!(is_inner(&inner));
    }
}
