//! Finalizer driver: migrates dead finalizable objects from `finobj` to
//! `tobefnz`, then dequeues and invokes them under a protected call.
//!
//! Grounded on `separatetobefnz`/`GCTM`/`runafewfinalizers` in
//! `examples/original_source/lgc.c`. This crate has no bytecode
//! interpreter of its own (out of scope per the overview), so invoking a
//! finalizer value is delegated to a host-supplied [`FinalizerHost`] —
//! the equivalent of `luaD_pcall(L, dothecall, ...)`, minus the actual
//! call machinery, which belongs to the embedding runtime.

use crate::gc::Gc;
use crate::header::AGE_OLD1;
use crate::heap::GcList;
use crate::value::ObjectId;
use log::warn;

/// Host hook for invoking a `__gc` finalizer. Implementations perform
/// the actual call (pushing the finalizer and `object` as its argument,
/// running it without allowing a yield) and report success or an error
/// message, mirroring the protected-call contract around `GCTM`.
pub trait FinalizerHost {
    fn call_finalizer(&mut self, heap: &mut crate::heap::Heap, object: ObjectId) -> Result<(), String>;
}

/// A host that runs no finalizers at all (valid when the embedding
/// runtime has no `__gc` metamethod support, or for tests that only
/// check list migration).
pub struct NoopFinalizerHost;

impl FinalizerHost for NoopFinalizerHost {
    fn call_finalizer(&mut self, _heap: &mut crate::heap::Heap, _object: ObjectId) -> Result<(), String> {
        Ok(())
    }
}

/// `markbeingfnz`: every object already queued on `tobefnz` must survive
/// this cycle (its finalizer has not run yet), so it and everything it
/// references is marked.
pub(crate) fn mark_being_fnz(gc: &mut Gc) -> isize {
    let mut work = 0;
    let ids: Vec<ObjectId> = gc.heap.list_iter(GcList::ToBeFnz).collect();
    for id in ids {
        work += 1;
        crate::marker::mark_object(gc, id);
    }
    work
}

/// `separatetobefnz`: move every unmarked (or, if `all`, every) object
/// off `finobj` onto the tail of `tobefnz`.
pub(crate) fn separate_to_be_fnz(gc: &mut Gc, all: bool) {
    let mut cur = gc.heap.list_head(GcList::FinObj);
    let mut prev: Option<ObjectId> = None;
    while let Some(id) = cur {
        let next = gc.heap.header(id).next;
        let dead = all || gc.heap.header(id).is_white();
        if !dead {
            prev = Some(id);
        } else {
            gc.heap.list_unlink_after(GcList::FinObj, prev, id);
            gc.heap.list_push_back(GcList::ToBeFnz, id);
        }
        cur = next;
    }
}

/// `udata2finalize` + `GCTM`: dequeue one object from `tobefnz`, relink
/// it into `allgc`, clear its finalized flag, retint it if mid-sweep,
/// and invoke its finalizer (if any) through the installed host.
fn run_one(gc: &mut Gc) {
    let Some(id) = gc.heap.list_head(GcList::ToBeFnz) else {
        return;
    };
    let next = gc.heap.header(id).next;
    gc.heap.set_list_head(GcList::ToBeFnz, next);
    gc.heap.header_mut(id).next = None;
    gc.heap.list_push_front(GcList::AllGc, id);
    gc.heap.header_mut(id).clear_finalized();
    if gc.state.is_sweep_phase() {
        gc.heap.header_mut(id).make_white(gc.current_white);
    } else if gc.heap.header(id).age() == AGE_OLD1 {
        gc.firstold1 = Some(id);
    }

    gc.stats.finalizers_run += 1;
    // Disjoint partial borrow: `heap` and `finalizer_host` are distinct
    // fields, so this does not conflict with the field accesses above.
    let Gc { heap, finalizer_host, .. } = gc;
    if let Err(msg) = finalizer_host.call_finalizer(heap, id) {
        warn!("error in __gc: {msg}");
    }
}

/// `runafewfinalizers`: invoke up to `n` pending finalizers, returning
/// how many actually ran.
pub(crate) fn run_a_few_finalizers(gc: &mut Gc, n: usize) -> usize {
    let mut ran = 0;
    while ran < n && gc.heap.list_head(GcList::ToBeFnz).is_some() {
        run_one(gc);
        ran += 1;
    }
    ran
}

/// `callallpendingfinalizers`, used by shutdown.
pub(crate) fn run_all_pending_finalizers(gc: &mut Gc) {
    while gc.heap.list_head(GcList::ToBeFnz).is_some() {
        run_one(gc);
    }
}
