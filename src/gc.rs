//! The collector's process-wide mutable state, and the allocation /
//! barrier half of the external interface.
//! The state machine itself (`step`, `full_gc`, `change_mode`) lives in
//! [`crate::scheduler`]; marking in [`crate::marker`]; the atomic phase in
//! [`crate::atomic`]; sweeping in [`crate::sweep`]; finalization in
//! [`crate::finalizer`] — all as `impl Gc` blocks over this one struct.

use crate::config::GcConfig;
use crate::heap::{BaseType, GcList, Heap};
use crate::object::Payload;
use crate::value::{ObjectId, Value};
use log::trace;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcState {
    Pause,
    Propagate,
    EnterAtomic,
    SwpAllGc,
    SwpFinObj,
    SwpToBeFnz,
    SwpEnd,
    CallFin,
}

impl GcState {
    pub fn is_sweep_phase(self) -> bool {
        matches!(
            self,
            GcState::SwpAllGc | GcState::SwpFinObj | GcState::SwpToBeFnz | GcState::SwpEnd
        )
    }

    /// "keepinvariant" in the source: true while the tri-color invariant
    /// must hold (pause through the atomic phase, inclusive).
    pub fn keeps_invariant(self) -> bool {
        matches!(self, GcState::Pause | GcState::Propagate | GcState::EnterAtomic)
    }

    /// True once the atomic phase has started deciding the fate of weak
    /// references (used to route a freshly-traversed weak-value table to
    /// `weak` vs. `grayagain`).
    pub fn is_atomic(self) -> bool {
        matches!(self, GcState::EnterAtomic)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcKind {
    Incremental,
    GenMinor,
    GenMajor,
}

/// The mode the host selects via [`Gc::change_mode`]; `GenMinor`/`GenMajor`
/// are internal sub-states of `Generational` the scheduler shifts between.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcMode {
    Incremental,
    Generational,
}

#[derive(Debug, Clone, Default)]
pub struct GcStats {
    pub cycles_completed: usize,
    pub minor_cycles: usize,
    pub major_cycles: usize,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub finalizers_run: usize,
    pub objects_promoted: usize,
}

/// Cursor into a sweep list. `None` means "about to examine the list
/// head"; `Some(p)` means "about to examine `header(p).next`" — the same
/// shape as the `GCObject **p` walking pointer in `lgc.c`'s `sweeplist`.
pub(crate) type SweepCursor = Option<ObjectId>;

pub struct Gc {
    pub heap: Heap,
    pub config: GcConfig,

    pub(crate) total_bytes: isize,
    pub(crate) gc_debt: isize,
    pub(crate) gc_estimate: isize,

    pub(crate) state: GcState,
    pub(crate) kind: GcKind,
    pub(crate) current_white: u8,
    pub(crate) emergency: bool,
    pub(crate) stopem: bool,
    pub stopped: bool,
    pub(crate) closing: bool,

    pub(crate) gray: Vec<ObjectId>,
    pub(crate) grayagain: Vec<ObjectId>,
    pub(crate) weak: Vec<ObjectId>,
    pub(crate) ephemeron: Vec<ObjectId>,
    pub(crate) allweak: Vec<ObjectId>,

    pub(crate) survival: Option<ObjectId>,
    pub(crate) old1: Option<ObjectId>,
    pub(crate) reallyold: Option<ObjectId>,
    pub(crate) firstold1: Option<ObjectId>,
    pub(crate) fin_survival: Option<ObjectId>,
    pub(crate) fin_old1: Option<ObjectId>,
    pub(crate) fin_reallyold: Option<ObjectId>,

    pub(crate) sweep_cursor: SweepCursor,
    pub(crate) promoted_this_minor: usize,

    /// The thread actually executing when `step`/`full_gc` was invoked;
    /// the atomic phase marks it directly since it may not appear on any
    /// other root path yet.
    pub current_thread: Option<ObjectId>,

    /// Interned `"__gc"` key, used to probe a metatable for a finalizer.
    pub(crate) gc_key: ObjectId,
    /// Interned `"__mode"` key, used to decode table weakness.
    pub(crate) mode_key: ObjectId,

    /// Scratch output of the last `traverse_ephemeron_table` call, read
    /// back by `converge_ephemerons` (stands in for the original's direct
    /// boolean return, since `propagate_mark`'s dispatch is uniform).
    pub(crate) ephemeron_marked_last: bool,

    /// Invoked by the finalizer driver to actually run a `__gc` value;
    /// defaults to a no-op since this crate carries no interpreter.
    pub(crate) finalizer_host: Box<dyn crate::finalizer::FinalizerHost>,

    pub stats: GcStats,
}

impl Gc {
    pub fn new(config: GcConfig) -> Self {
        let mut heap = Heap::new();
        let current_white = 0u8;
        let gc_key = heap.alloc_string("__gc", current_white);
        // The interner itself must not be collected out from under us.
        heap.fix(gc_key);
        let mode_key = heap.alloc_string("__mode", current_white);
        heap.fix(mode_key);

        let main = heap.alloc_thread(true, current_white);
        heap.fix(main);
        heap.main_thread = Some(main);

        Gc {
            heap,
            config,
            total_bytes: 0,
            gc_debt: 0,
            gc_estimate: 0,
            state: GcState::Pause,
            kind: GcKind::Incremental,
            current_white,
            emergency: false,
            stopem: false,
            stopped: false,
            closing: false,
            gray: Vec::new(),
            grayagain: Vec::new(),
            weak: Vec::new(),
            ephemeron: Vec::new(),
            allweak: Vec::new(),
            survival: None,
            old1: None,
            reallyold: None,
            firstold1: None,
            fin_survival: None,
            fin_old1: None,
            fin_reallyold: None,
            sweep_cursor: None,
            promoted_this_minor: 0,
            current_thread: Some(main),
            gc_key,
            mode_key,
            ephemeron_marked_last: false,
            finalizer_host: Box::new(crate::finalizer::NoopFinalizerHost),
            stats: GcStats::default(),
        }
    }

    /// Install the host callback used to actually run `__gc` values.
    pub fn set_finalizer_host(&mut self, host: Box<dyn crate::finalizer::FinalizerHost>) {
        self.finalizer_host = host;
    }

    #[inline]
    pub fn other_white(&self) -> u8 {
        self.current_white ^ 1
    }

    #[inline]
    pub fn total_bytes(&self) -> isize {
        self.total_bytes
    }

    #[inline]
    pub fn debt(&self) -> isize {
        self.gc_debt
    }

    #[inline]
    pub fn should_collect(&self) -> bool {
        !self.stopped && self.gc_debt > 0
    }

    // ---- allocation ------------------------------------------------------

    fn charge(&mut self, size: u32) {
        let size = size as isize;
        self.total_bytes += size;
        self.gc_debt += size;
    }

    pub fn new_table(&mut self) -> ObjectId {
        let id = self.heap.alloc_table(self.current_white);
        self.charge(self.heap.header(id).size);
        id
    }

    pub fn new_string(&mut self, s: &str) -> ObjectId {
        let id = self.heap.alloc_string(s, self.current_white);
        self.charge(self.heap.header(id).size);
        id
    }

    pub fn new_native_closure(&mut self, captured: Vec<Value>) -> ObjectId {
        let id = self.heap.alloc_native_closure(captured, self.current_white);
        self.charge(self.heap.header(id).size);
        id
    }

    pub fn new_lua_closure(
        &mut self,
        proto: Option<ObjectId>,
        upvalues: Vec<Option<ObjectId>>,
    ) -> ObjectId {
        let id = self
            .heap
            .alloc_lua_closure(proto, upvalues, self.current_white);
        if let Some(p) = proto {
            if self.heap.header(p).is_black() {
                self.barrier_forward(id, p);
            }
        }
        self.charge(self.heap.header(id).size);
        id
    }

    pub fn new_proto(&mut self) -> ObjectId {
        let id = self.heap.alloc_proto(self.current_white);
        self.charge(self.heap.header(id).size);
        id
    }

    pub fn new_userdata(&mut self, user_values: Vec<Value>) -> ObjectId {
        let id = self.heap.alloc_userdata(user_values, self.current_white);
        self.charge(self.heap.header(id).size);
        id
    }

    pub fn new_open_upvalue(&mut self, thread: ObjectId, stack_index: usize) -> ObjectId {
        let id = self
            .heap
            .alloc_open_upvalue(thread, stack_index, self.current_white);
        self.charge(self.heap.header(id).size);
        if let Payload::Thread(t) = &mut self.heap.get_mut(thread).payload {
            t.open_upvalues.push(id);
        }
        if self.heap.header(thread).is_black() {
            self.barrier_forward(thread, id);
        }
        id
    }

    pub fn new_thread(&mut self) -> ObjectId {
        let id = self.heap.alloc_thread(false, self.current_white);
        self.charge(self.heap.header(id).size);
        id
    }

    // ---- `fix` -------------------------------------------------------------

    pub fn fix(&mut self, o: ObjectId) {
        self.heap.fix(o);
    }

    // ---- `check_finalizer` -------------------------------------------------

    /// `new_metatable` is the metatable about to be installed on `o`.
    /// `allgc_prev` must be the object preceding `o` on `allgc` (or
    /// `None` if `o` is presently the head); if a sweep is mid-flight and
    /// its cursor points at `o`, the caller must advance the cursor first
    /// with [`Gc::sweep_to_live_for_check_finalizer`].
    pub fn check_finalizer(
        &mut self,
        o: ObjectId,
        allgc_prev: Option<ObjectId>,
        new_metatable: Option<ObjectId>,
    ) -> Result<(), crate::error::GcError> {
        if self.closing {
            return Err(crate::error::GcError::ClosingState);
        }
        let has_gc = self.heap.has_gc_metamethod(new_metatable, self.gc_key);
        self.heap.check_finalizer(o, allgc_prev, has_gc);
        Ok(())
    }

    /// `sweeptolive` entry point for a host about to call
    /// [`Gc::check_finalizer`] mid-sweep. Only meaningful while the
    /// sweeper is walking `allgc` (`GcState::SwpAllGc`): outside that
    /// phase there is no live cursor to disturb, so this is a no-op that
    /// returns `allgc_prev` unchanged. When it does act, it advances the
    /// collector's own sweep cursor past any dead prefix and returns the
    /// resulting stable predecessor, which the caller should pass as
    /// `check_finalizer`'s `allgc_prev`.
    pub fn sweep_to_live_for_check_finalizer(&mut self, allgc_prev: Option<ObjectId>) -> Option<ObjectId> {
        if self.state != GcState::SwpAllGc {
            return allgc_prev;
        }
        let advanced = crate::sweep::sweep_to_live(self, GcList::AllGc, self.sweep_cursor);
        self.sweep_cursor = advanced;
        advanced
    }

    // ---- barriers ----------------------------------------------------------

    /// Forward barrier: call when a black `src` is about to hold a
    /// reference to white `dst`.
    pub fn barrier_forward(&mut self, src: ObjectId, dst: ObjectId) {
        if !self.heap.header(src).is_black() || !self.heap.header(dst).is_white() {
            return;
        }
        trace!("forward barrier: {:?} -> {:?}", src, dst);
        if self.state.keeps_invariant() {
            crate::marker::really_mark_object(self, dst);
        } else {
            debug_assert!(self.state.is_sweep_phase());
            self.heap.header_mut(src).make_white(self.current_white);
        }
        if self.kind != GcKind::Incremental
            && self.heap.header(src).is_old()
            && !self.heap.header(dst).is_old()
        {
            self.heap.header_mut(dst).set_age(crate::header::AGE_OLD0);
        }
    }

    /// Backward barrier: call when a black `src` (typically a table) has
    /// just had its reference set mutated in place.
    pub fn barrier_backward(&mut self, src: ObjectId) {
        if !self.heap.header(src).is_black() {
            return;
        }
        trace!("backward barrier: {:?}", src);
        self.heap.header_mut(src).make_gray();
        self.grayagain.push(src);
        if self.kind != GcKind::Incremental {
            self.heap.header_mut(src).set_age(crate::header::AGE_TOUCHED1);
        }
    }

    // ---- metatables / roots --------------------------------------------------

    pub fn set_metatable(&mut self, bt: BaseType, mt: Option<ObjectId>) {
        self.heap.set_metatable(bt, mt);
    }

    pub fn table_set_metatable(&mut self, table: ObjectId, mt: Option<ObjectId>) {
        if let Some(mt_id) = mt {
            if self.heap.header(table).is_black() {
                self.barrier_forward(table, mt_id);
            }
        }
        let weakness = mt
            .and_then(|mt_id| self.heap.table_mode_string(mt_id, self.mode_key))
            .map(|s| crate::object::Weakness::from_mode_str(&s))
            .unwrap_or(crate::object::Weakness::Strong);
        if let Payload::Table(t) = &mut self.heap.get_mut(table).payload {
            t.metatable = mt;
            t.weakness = weakness;
        }
    }

    pub fn userdata_set_metatable(&mut self, ud: ObjectId, mt: Option<ObjectId>) {
        if let Some(mt_id) = mt {
            if self.heap.header(ud).is_black() {
                self.barrier_forward(ud, mt_id);
            }
        }
        if let Payload::Userdata(u) = &mut self.heap.get_mut(ud).payload {
            u.metatable = mt;
        }
    }

    // ---- `free_all` --------------------------------------------------------

    /// Shutdown: move every still-finalizable object onto `tobefnz`
    /// regardless of color, run every pending finalizer, then free
    /// everything on `allgc` and `finobj` except the main thread, then
    /// free `fixedgc`. Mirrors `luaC_freeallobjects`'s
    /// `separatetobefnz(g, 1)` followed by `callallpendingfinalizers`
    /// and a three-list free.
    pub fn free_all(&mut self) {
        self.closing = true;
        crate::finalizer::separate_to_be_fnz(self, true);
        crate::finalizer::run_all_pending_finalizers(self);

        let main = self.heap.main_thread;
        for list in [GcList::AllGc, GcList::FinObj] {
            let mut cur = self.heap.list_head(list);
            let mut prev: Option<ObjectId> = None;
            while let Some(id) = cur {
                let next = self.heap.header(id).next;
                if Some(id) == main {
                    prev = Some(id);
                    cur = next;
                    continue;
                }
                self.heap.list_unlink_after(list, prev, id);
                let size = self.heap.free_object(id);
                self.stats.objects_freed += 1;
                self.stats.bytes_freed += size as usize;
                cur = next;
            }
        }

        let mut cur = self.heap.list_head(GcList::FixedGc);
        while let Some(id) = cur {
            let next = self.heap.header(id).next;
            if Some(id) != main {
                let size = self.heap.free_object(id);
                self.stats.bytes_freed += size as usize;
            }
            cur = next;
        }
        self.heap.set_list_head(GcList::FixedGc, main);
        if let Some(m) = main {
            self.heap.header_mut(m).next = None;
        }
    }
}
