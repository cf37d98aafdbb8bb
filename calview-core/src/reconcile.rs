//! Incremental reconciliation of displayed occurrence lists.
//!
//! [`reconcile`] walks the previously displayed sequence and a freshly
//! computed one in lockstep and produces a [`ReconcilePatch`]: contiguous
//! runs of removals and insertions that turn the old list into the new one.
//! Items that are the same displayed occurrence keep their previous `Arc`, so
//! a bound view never sees unchanged rows destroyed and recreated. A same item
//! whose content changed is superseded in its slot without a structural edit.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::occurrence::Occurrence;

/// The list a view currently displays, in display order.
pub type DisplayedSequence = Vec<Arc<Occurrence>>;

/// One structural edit. Indices refer to the list as it stands after every
/// preceding op of the same patch has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOp {
    Remove {
        index: usize,
        count: usize,
    },
    Insert {
        index: usize,
        items: Vec<Arc<Occurrence>>,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePatch {
    pub ops: Vec<PatchOp>,
    /// Same items whose content changed, by index in the new sequence.
    /// Written into their slots after every op has been applied.
    pub replaced: Vec<(usize, Arc<Occurrence>)>,
    pub changed: bool,
}

impl ReconcilePatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.replaced.is_empty()
    }

    pub fn removed(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                PatchOp::Remove { count, .. } => *count,
                PatchOp::Insert { .. } => 0,
            })
            .sum()
    }

    pub fn inserted(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                PatchOp::Insert { items, .. } => items.len(),
                PatchOp::Remove { .. } => 0,
            })
            .sum()
    }

    /// Replay the patch onto a mirror of the previous sequence.
    pub fn apply(&self, sequence: &mut DisplayedSequence) {
        for op in &self.ops {
            match op {
                PatchOp::Remove { index, count } => {
                    sequence.drain(*index..*index + *count);
                }
                PatchOp::Insert { index, items } => {
                    sequence.splice(*index..*index, items.iter().cloned());
                }
            }
        }
        for (index, item) in &self.replaced {
            sequence[*index] = Arc::clone(item);
        }
    }
}

/// Patch `previous` in place so it holds `incoming`.
///
/// `incoming` must already be sorted by [`Occurrence::display_cmp`]. Unchanged
/// items are the instances from `previous`.
pub fn reconcile(
    previous: &mut DisplayedSequence,
    incoming: Vec<Arc<Occurrence>>,
) -> ReconcilePatch {
    debug_assert!(
        incoming
            .windows(2)
            .all(|w| w[0].display_cmp(&w[1]) != Ordering::Greater),
        "incoming occurrences are not sorted"
    );

    let old = std::mem::take(previous);
    let mut out: DisplayedSequence = Vec::with_capacity(incoming.len());
    let mut patch = ReconcilePatch::default();

    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < incoming.len() {
        if i < old.len() && j < incoming.len() && old[i].same_item(&incoming[j]) {
            if old[i].content_differs(&incoming[j]) {
                patch.replaced.push((out.len(), Arc::clone(&incoming[j])));
                out.push(Arc::clone(&incoming[j]));
            } else {
                out.push(Arc::clone(&old[i]));
            }
            i += 1;
            j += 1;
            continue;
        }

        if i < old.len() && removes(&old[i], incoming.get(j)) {
            let begin = i;
            while i < old.len() && removes(&old[i], incoming.get(j)) {
                i += 1;
            }
            patch.ops.push(PatchOp::Remove {
                index: out.len(),
                count: i - begin,
            });
            continue;
        }

        let index = out.len();
        let mut items = Vec::new();
        while j < incoming.len() && (i == old.len() || inserts(&old[i], &incoming[j])) {
            items.push(Arc::clone(&incoming[j]));
            j += 1;
        }
        out.extend(items.iter().cloned());
        patch.ops.push(PatchOp::Insert { index, items });
    }

    patch.changed = !patch.ops.is_empty() || out.len() != old.len();
    *previous = out;
    patch
}

/// The previous item sorts before the next incoming one (or nothing is left)
/// and is not the same item, so it has gone away.
fn removes(old: &Occurrence, next: Option<&Arc<Occurrence>>) -> bool {
    match next {
        None => true,
        Some(next) => !old.same_item(next) && old.display_cmp(next) == Ordering::Less,
    }
}

fn inserts(old: &Occurrence, next: &Occurrence) -> bool {
    !old.same_item(next) && old.display_cmp(next) != Ordering::Less
}
