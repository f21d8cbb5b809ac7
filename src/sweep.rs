//! The sweeper: bounded-chunk walks over one heap list at a time,
//! freeing dead objects and re-tinting survivors to the current white.
//!
//! Grounded on `sweeplist`/`sweeptolive` in
//! `examples/original_source/lgc.c`. The cursor is modeled as the
//! `prev` object (or `None` for "examine the list head next"), the
//! same shape the `GCObject **p` walking pointer gives the C code.

use crate::gc::Gc;
use crate::header::{AGE_NEW, AGE_OLD, AGE_OLD0, AGE_OLD1, AGE_SURVIVAL, AGE_TOUCHED1, AGE_TOUCHED2};
use crate::heap::GcList;
use crate::value::ObjectId;

/// Advance the sweeper across `list` by at most `max` objects, starting
/// from `cursor`. Returns the updated cursor (`None` once the list is
/// exhausted) and how many objects were actually visited.
pub(crate) fn sweep_step(gc: &mut Gc, list: GcList, cursor: Option<ObjectId>, max: usize) -> (Option<ObjectId>, usize) {
    let mut prev = cursor;
    let mut visited = 0;
    let other_white = gc.other_white();
    while visited < max {
        let next_id = match prev {
            None => gc.heap.list_head(list),
            Some(p) => gc.heap.header(p).next,
        };
        let Some(id) = next_id else {
            return (prev, visited);
        };
        visited += 1;

        if gc.heap.header(id).is_dead(other_white) {
            gc.heap.list_unlink_after(list, prev, id);
            let size = gc.heap.free_object(id);
            gc.stats.objects_freed += 1;
            gc.stats.bytes_freed += size as usize;
            // prev is unchanged: the node that used to follow `id` now
            // follows `prev` directly.
        } else {
            retint_survivor(gc, id);
            prev = Some(id);
        }
    }
    (prev, visited)
}

fn retint_survivor(gc: &mut Gc, id: ObjectId) {
    let current_white = gc.current_white;
    let kind = gc.kind;
    let header = gc.heap.header_mut(id);
    header.make_white(current_white);
    let promoted = kind != crate::gc::GcKind::Incremental && advance_age(header);
    if promoted {
        gc.promoted_this_minor += 1;
        gc.stats.objects_promoted += 1;
    }
}

/// Generational age advance on survival (`sweepgen`'s `nextage` table),
/// collapsing the source's `survival`/`old1`/`reallyold` cursor
/// bookkeeping into a per-object rule. `TOUCHED1`/`TOUCHED2` are left
/// alone here — they only advance via the barrier-correction pass, not
/// an ordinary sweep. Returns whether this call is the one that carried
/// the object into `AGE_OLD` for the first time, so callers can count
/// promotions.
fn advance_age(header: &mut crate::header::GcHeader) -> bool {
    let age = header.age();
    let next = match age {
        AGE_NEW => AGE_SURVIVAL,
        AGE_SURVIVAL => AGE_OLD1,
        AGE_OLD0 => AGE_OLD1,
        AGE_OLD1 => AGE_OLD,
        AGE_TOUCHED1 => AGE_TOUCHED1,
        AGE_TOUCHED2 => AGE_TOUCHED2,
        other => other,
    };
    header.set_age(next);
    next == AGE_OLD && age != AGE_OLD
}

/// `sweeptolive`: advance `cursor` past a maximal run of dead objects so
/// it lands on the first survivor (or the list end). Used when a
/// mid-sweep mutator operation (e.g. `check_finalizer`) needs a stable
/// `allgc` predecessor for `o`; see `Gc::sweep_to_live_for_check_finalizer`.
pub(crate) fn sweep_to_live(gc: &mut Gc, list: GcList, cursor: Option<ObjectId>) -> Option<ObjectId> {
    let mut prev = cursor;
    loop {
        let next_id = match prev {
            None => gc.heap.list_head(list),
            Some(p) => gc.heap.header(p).next,
        };
        let Some(id) = next_id else {
            return prev;
        };
        let other_white = gc.other_white();
        if gc.heap.header(id).is_dead(other_white) {
            gc.heap.list_unlink_after(list, prev, id);
            let size = gc.heap.free_object(id);
            gc.stats.objects_freed += 1;
            gc.stats.bytes_freed += size as usize;
        } else {
            return prev;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::GcHeader;

    fn aged(age: u8) -> GcHeader {
        let mut h = GcHeader::new(0, 8);
        h.set_age(age);
        h
    }

    #[test]
    fn advance_age_follows_the_nextage_table() {
        let mut h = aged(AGE_NEW);
        assert!(!advance_age(&mut h));
        assert_eq!(h.age(), AGE_SURVIVAL);

        let mut h = aged(AGE_SURVIVAL);
        assert!(!advance_age(&mut h));
        assert_eq!(h.age(), AGE_OLD1);

        let mut h = aged(AGE_OLD0);
        assert!(!advance_age(&mut h));
        assert_eq!(h.age(), AGE_OLD1);

        let mut h = aged(AGE_OLD1);
        assert!(advance_age(&mut h), "OLD1 -> OLD is the promotion transition");
        assert_eq!(h.age(), AGE_OLD);

        let mut h = aged(AGE_OLD);
        assert!(!advance_age(&mut h), "already OLD is not a new promotion");
        assert_eq!(h.age(), AGE_OLD);
    }

    #[test]
    fn touched_ages_are_unchanged_by_ordinary_sweep() {
        let mut h = aged(AGE_TOUCHED1);
        advance_age(&mut h);
        assert_eq!(h.age(), AGE_TOUCHED1);

        let mut h = aged(AGE_TOUCHED2);
        advance_age(&mut h);
        assert_eq!(h.age(), AGE_TOUCHED2);
    }
}
