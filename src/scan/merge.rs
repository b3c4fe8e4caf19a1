//! Quorum-gated k-way merge over per-peer cell cursors.

use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};

use tracing::trace;

use super::{ScanPage, ScanParams};
use crate::traits::{Atlas, Fanout};
use crate::types::{Cell, HostId, Position};

/// One peer's cursor: the head cell, the rest of its current page, and the
/// continuation position if the peer has more beyond this page.
struct Element {
    x: Cell,
    xs: std::vec::IntoIter<Cell>,
    next: Option<Position>,
    from: HostId,
}

/// Heap entry reversing [`Cell::compare`] so the max-heap pops the minimum
/// cell under the store's order.
struct Entry(Element);

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.x.compare(&self.0.x)
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

/// Merge state for one scan: per-peer cursors, contribution tracking, and
/// the emission high-water mark.
pub(crate) struct Gather<T> {
    atlas: T,
    params: ScanParams,
    heap: BinaryHeap<Entry>,
    /// Peers currently contributing a page or a completion.
    have: BTreeSet<HostId>,
    /// Peers that have reported no more data.
    done: BTreeSet<HostId>,
    /// The last position emitted; nothing at or below it is emitted again.
    last: Position,
}

impl<T: Atlas> Gather<T> {
    pub(crate) fn new(atlas: T, params: ScanParams) -> Self {
        // One past the scan origin: time is bounded above by params.time, so
        // the first eligible cell is strictly after (key, time + 1) in
        // key-ascending, time-descending order.
        let last = Position {
            key: params.key.clone(),
            time: params.time.saturating_add(1),
        };
        Self {
            atlas,
            params,
            heap: BinaryHeap::new(),
            have: BTreeSet::new(),
            done: BTreeSet::new(),
            last,
        }
    }

    pub(crate) fn last(&self) -> &Position {
        &self.last
    }

    pub(crate) fn have(&self) -> &BTreeSet<HostId> {
        &self.have
    }

    /// Fold one deputy page into the merge state.
    pub(crate) fn admit(&mut self, page: ScanPage, fanout: &impl Fanout) {
        let ScanPage { cells, next, from } = page;
        let mut cells = cells.into_iter();
        match cells.next() {
            Some(head) => {
                trace!(%from, remaining = cells.len(), "page received");
                self.have.insert(from);
                self.heap.push(Entry(Element {
                    x: head,
                    xs: cells,
                    next,
                    from,
                }));
            }
            None => match next {
                // An empty page with a continuation carries no information;
                // chase the continuation directly.
                Some(next) => {
                    trace!(%from, "empty page, chasing continuation");
                    fanout.scan(from, self.params.starting_at(&next));
                }
                None => {
                    trace!(%from, "peer exhausted");
                    self.have.insert(from);
                    self.done.insert(from);
                }
            },
        }
    }

    /// Drain ordered cells while a quorum of peers is contributing.
    ///
    /// Stops when the quorum is lost (a contributor drained into a
    /// continuation) or the heap empties. Duplicates across replicas are
    /// dropped by strict dominance over `last`.
    pub(crate) fn merge(&mut self, fanout: &impl Fanout) -> Vec<Cell> {
        let mut out = Vec::new();
        while self.atlas.quorum(&self.have) {
            let Some(Entry(element)) = self.heap.pop() else {
                break;
            };
            let Element {
                mut x,
                mut xs,
                next,
                from,
            } = element;

            // Advance the cursor strictly past the high-water mark.
            let mut live = x.position() > self.last;
            while !live {
                match xs.next() {
                    Some(cell) => {
                        x = cell;
                        live = x.position() > self.last;
                    }
                    None => break,
                }
            }

            if live {
                // Advancing may skip past cells another cursor still holds
                // (a replica missing intermediate versions); reinsert and pop
                // afresh so emission stays globally ordered.
                if self
                    .heap
                    .peek()
                    .is_some_and(|Entry(top)| top.x.compare(&x) == Ordering::Less)
                {
                    self.heap.push(Entry(Element { x, xs, next, from }));
                    continue;
                }
                self.last = x.position();
                out.push(x);
                if let Some(head) = xs.next() {
                    self.heap.push(Entry(Element {
                        x: head,
                        xs,
                        next,
                        from,
                    }));
                    continue;
                }
            }

            // The cursor drained: chase the continuation (the peer stops
            // contributing until it replies again) or mark it done.
            match next {
                Some(next) => {
                    trace!(%from, "cursor drained, chasing continuation");
                    self.have.remove(&from);
                    fanout.scan(from, self.params.starting_at(&next));
                }
                None => {
                    trace!(%from, "cursor exhausted");
                    self.done.insert(from);
                }
            }
        }
        out
    }

    /// The scan completes once a quorum has fully drained and nothing is
    /// left to merge.
    pub(crate) fn finished(&self) -> bool {
        self.atlas.quorum(&self.done) && self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::memory::Majority;
    use crate::types::{Key, Time, Value};

    /// Records reissued scans instead of sending them anywhere.
    #[derive(Default)]
    struct Reissues(Mutex<Vec<(HostId, ScanParams)>>);

    impl Fanout for Reissues {
        fn scan(&self, to: HostId, params: ScanParams) {
            self.0.lock().unwrap().push((to, params));
        }
    }

    impl Reissues {
        fn take(&self) -> Vec<(HostId, ScanParams)> {
            std::mem::take(&mut self.0.lock().unwrap())
        }
    }

    fn cell(key: &'static str, time: Time) -> Cell {
        Cell::new(key, time, Some(Value::from("v")))
    }

    fn page(from: u64, cells: Vec<Cell>, next: Option<Position>) -> ScanPage {
        ScanPage {
            cells,
            next,
            from: HostId(from),
        }
    }

    fn gather(peers: &[u64]) -> Gather<Majority> {
        let atlas = Majority::new(peers.iter().copied().map(HostId));
        Gather::new(atlas, ScanParams::new(Key::default(), Time::MAX, 64))
    }

    #[test]
    fn merge_waits_for_quorum() {
        let fanout = Reissues::default();
        let mut gather = gather(&[1, 2]);

        gather.admit(page(1, vec![cell("a", 3)], None), &fanout);
        assert!(gather.merge(&fanout).is_empty());

        gather.admit(page(2, vec![cell("a", 3)], None), &fanout);
        let cells = gather.merge(&fanout);
        assert_eq!(cells, vec![cell("a", 3)]);
    }

    #[test]
    fn merge_orders_and_deduplicates_across_replicas() {
        let fanout = Reissues::default();
        let mut gather = gather(&[1, 2]);

        gather.admit(
            page(1, vec![cell("k1", 2), cell("k1", 1)], None),
            &fanout,
        );
        gather.admit(
            page(2, vec![cell("k1", 2), cell("k2", 3)], None),
            &fanout,
        );

        let cells = gather.merge(&fanout);
        assert_eq!(cells, vec![cell("k1", 2), cell("k1", 1), cell("k2", 3)]);
        assert!(gather.finished());
    }

    #[test]
    fn continuation_drops_contributor_and_reissues() {
        let fanout = Reissues::default();
        let mut gather = gather(&[1, 2]);

        // Replica 1 pages out with a continuation; replica 2 is complete.
        gather.admit(
            page(
                1,
                vec![cell("k1", 2), cell("k1", 1)],
                Some(Position::new("k2", Time::MAX)),
            ),
            &fanout,
        );
        gather.admit(
            page(2, vec![cell("k1", 2), cell("k2", 3)], None),
            &fanout,
        );

        // The merge stops at the continuation: replica 1 stops contributing,
        // so (k2, 3) stays buffered until it replies again.
        let cells = gather.merge(&fanout);
        assert_eq!(cells, vec![cell("k1", 2), cell("k1", 1)]);
        let reissued = fanout.take();
        assert_eq!(reissued.len(), 1);
        assert_eq!(reissued[0].0, HostId(1));
        assert_eq!(reissued[0].1.key, Key::from("k2"));
        assert!(!gather.finished());

        // Replica 1 reports no more data; the buffered tail flows.
        gather.admit(page(1, vec![], None), &fanout);
        let cells = gather.merge(&fanout);
        assert_eq!(cells, vec![cell("k2", 3)]);
        assert!(gather.finished());
    }

    #[test]
    fn late_replay_does_not_duplicate() {
        let fanout = Reissues::default();
        let mut gather = gather(&[1, 2]);

        gather.admit(page(1, vec![cell("a", 5), cell("b", 4)], None), &fanout);
        gather.admit(page(2, vec![cell("a", 5)], None), &fanout);
        assert_eq!(
            gather.merge(&fanout),
            vec![cell("a", 5), cell("b", 4)]
        );

        // A roused replica replays from the high-water mark.
        gather.admit(page(2, vec![cell("a", 5), cell("b", 4), cell("c", 9)], None), &fanout);
        assert_eq!(gather.merge(&fanout), vec![cell("c", 9)]);
    }

    #[test]
    fn empty_page_with_continuation_is_chased() {
        let fanout = Reissues::default();
        let mut gather = gather(&[1, 2]);

        gather.admit(
            page(1, vec![], Some(Position::new("k9", Time::MAX))),
            &fanout,
        );
        assert!(gather.have().is_empty());
        let reissued = fanout.take();
        assert_eq!(reissued.len(), 1);
        assert_eq!(reissued[0].1.key, Key::from("k9"));
    }
}
