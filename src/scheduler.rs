//! State-machine driver: `singlestep`, `step` (the host-facing
//! `incstep`), `full_gc`, and `change_mode`.
//!
//! Grounded on `singlestep`/`incstep`/`fullinc`/`luaC_changemode` in
//! `examples/original_source/lgc.c`.

use crate::atomic::atomic_phase;
use crate::config::{FIN_COST, FIN_MAX, PAUSE_ADJ};
use crate::gc::{Gc, GcKind, GcMode, GcState};
use crate::header::AGE_OLD;
use crate::heap::GcList;
use crate::marker::{mark_object, mark_value, propagate_mark};
use crate::object::Payload;

impl Gc {
    /// `singlestep`: perform one unit of work for the current state,
    /// returning the work charged.
    fn single_step(&mut self) -> isize {
        match self.state {
            GcState::Pause => {
                self.restart_collection();
                self.state = GcState::Propagate;
                0
            }
            GcState::Propagate => {
                if self.gray.is_empty() {
                    self.state = GcState::EnterAtomic;
                    0
                } else {
                    propagate_mark(self)
                }
            }
            GcState::EnterAtomic => {
                let work = atomic_phase(self);
                self.gc_estimate = self.total_bytes;
                self.sweep_cursor = None;
                self.state = GcState::SwpAllGc;
                work
            }
            GcState::SwpAllGc => self.sweep_one_list(GcList::AllGc, GcState::SwpFinObj),
            GcState::SwpFinObj => self.sweep_one_list(GcList::FinObj, GcState::SwpToBeFnz),
            GcState::SwpToBeFnz => self.sweep_one_list(GcList::ToBeFnz, GcState::SwpEnd),
            GcState::SwpEnd => {
                self.heap.maybe_shrink_string_table();
                self.state = GcState::CallFin;
                0
            }
            GcState::CallFin => {
                if self.emergency {
                    self.state = GcState::Pause;
                    return 0;
                }
                let ran = crate::finalizer::run_a_few_finalizers(self, FIN_MAX);
                if self.heap.list_head(GcList::ToBeFnz).is_none() {
                    self.end_cycle();
                    self.state = GcState::Pause;
                }
                ran as isize * FIN_COST
            }
        }
    }

    fn sweep_one_list(&mut self, list: GcList, next: GcState) -> isize {
        let (cursor, visited) = crate::sweep::sweep_step(self, list, self.sweep_cursor, crate::config::SWEEP_MAX);
        self.sweep_cursor = cursor;
        if visited < crate::config::SWEEP_MAX {
            self.sweep_cursor = None;
            self.state = next;
        }
        visited as isize
    }

    /// `restartcollection`: reset gray lists, mark the root set.
    fn restart_collection(&mut self) {
        self.gray.clear();
        self.grayagain.clear();
        self.weak.clear();
        self.ephemeron.clear();
        self.allweak.clear();
        if let Some(main) = self.heap.main_thread {
            mark_object(self, main);
        }
        let registry = self.heap.registry;
        mark_value(self, &registry);
        let metatables: Vec<_> = self.heap.all_metatables().collect();
        for mt in metatables {
            mark_object(self, mt);
        }
        let pending: Vec<_> = self.heap.list_iter(GcList::ToBeFnz).collect();
        for id in pending {
            mark_object(self, id);
        }
    }

    /// Debt accounting at the close of a cycle: set next cycle's debt
    /// from the live-size estimate and `gcpause`.
    fn end_cycle(&mut self) {
        self.stats.cycles_completed += 1;
        match self.kind {
            GcKind::GenMinor => self.stats.minor_cycles += 1,
            _ => self.stats.major_cycles += 1,
        }
        let estimate = self.gc_estimate.max(0);
        let threshold = (estimate / PAUSE_ADJ) * self.config.gcpause as isize;
        let debt = self.total_bytes - threshold;
        self.gc_debt = debt.min(0);
    }

    /// `step`: the host-facing `incstep`. Converts the debt-scaled step
    /// size into work units and drives `single_step` in a loop until
    /// that budget is spent or the collector returns to pause.
    pub fn step(&mut self) {
        if self.stopped {
            return;
        }
        if self.kind != GcKind::Incremental {
            self.gen_step();
            return;
        }
        let work_budget =
            self.config.step_size_bytes() * self.config.gcstepmul as isize / 100;
        let mut work_done: isize = 0;
        loop {
            let work = self.single_step();
            work_done += work;
            if self.state == GcState::Pause || work_done >= work_budget {
                break;
            }
        }
        if self.state == GcState::Pause {
            self.gc_debt = self.gc_debt.min(0);
        }
    }

    /// Minimal generational minor-cycle driver: run a whole cycle
    /// (propagate through callfin) each time `step` is invoked, since
    /// generational collection only visits young objects and therefore
    /// completes in far fewer total steps than incremental mode.
    fn gen_step(&mut self) {
        self.promoted_this_minor = 0;
        loop {
            self.single_step();
            if self.state == GcState::Pause {
                break;
            }
        }
        let divisor = crate::config::GEN_MAJOR_PROMOTION_DIVISOR;
        if self.promoted_this_minor as isize * 100 > self.total_bytes.max(1) / divisor.max(1) {
            self.kind = GcKind::GenMajor;
        } else {
            self.kind = GcKind::GenMinor;
        }
    }

    /// `fullinc` / `fullgen`: run a complete cycle end to end. If
    /// `emergency`, finalizers and stack shrinking are skipped for the
    /// duration.
    pub fn full_gc(&mut self, emergency: bool) {
        if self.stopem {
            return; // reentrancy guard: a step is already in flight.
        }
        self.stopem = true;
        self.emergency = emergency;

        if self.state.is_sweep_phase() {
            // Finish any in-flight sweep first, turning black objects
            // white so this cycle's sweep doesn't reclaim them early.
            self.finish_sweep_early();
        }
        if !self.state.keeps_invariant() {
            self.state = GcState::Pause;
        }
        loop {
            self.single_step();
            if self.state == GcState::Pause {
                break;
            }
            if self.state == GcState::CallFin && emergency {
                break;
            }
        }
        self.emergency = false;
        self.stopem = false;
    }

    fn finish_sweep_early(&mut self) {
        for list in [GcList::AllGc, GcList::FinObj, GcList::ToBeFnz] {
            for id in self.heap.list_iter(list).collect::<Vec<_>>() {
                self.heap.header_mut(id).make_white(self.current_white);
            }
        }
        self.sweep_cursor = None;
        self.state = GcState::Pause;
    }

    /// `changemode`: switch between incremental and generational modes
    /// using the prescribed transition sequences.
    pub fn change_mode(&mut self, mode: GcMode) {
        let target_kind = match mode {
            GcMode::Incremental => GcKind::Incremental,
            GcMode::Generational => GcKind::GenMinor,
        };
        if (self.kind == GcKind::Incremental) == (target_kind == GcKind::Incremental) {
            self.kind = target_kind;
            return;
        }
        match mode {
            GcMode::Generational => {
                // Run a full incremental cycle through the end of atomic,
                // then tint every survivor old (`sweep2old`).
                self.kind = GcKind::Incremental;
                if !self.state.keeps_invariant() {
                    self.state = GcState::Pause;
                }
                loop {
                    self.single_step();
                    if self.state.is_sweep_phase() || self.state == GcState::CallFin {
                        break;
                    }
                }
                self.sweep_to_old();
                self.kind = GcKind::GenMinor;
                self.state = GcState::Pause;
            }
            GcMode::Incremental => {
                self.whiten_everything();
                self.survival = None;
                self.old1 = None;
                self.reallyold = None;
                self.firstold1 = None;
                self.kind = GcKind::Incremental;
                self.state = GcState::Pause;
            }
        }
    }

    /// `sweep2old`: free dead (white) objects outright and age every
    /// survivor to OLD; threads go back on `grayagain` (they must be
    /// watched every cycle in generational mode) and open upvalues stay
    /// gray, everything else turns black.
    fn sweep_to_old(&mut self) {
        for list in [GcList::AllGc, GcList::FinObj] {
            let mut cur = self.heap.list_head(list);
            let mut prev: Option<_> = None;
            while let Some(id) = cur {
                let next = self.heap.header(id).next;
                if self.heap.header(id).is_white() {
                    self.heap.list_unlink_after(list, prev, id);
                    let size = self.heap.free_object(id);
                    self.stats.objects_freed += 1;
                    self.stats.bytes_freed += size as usize;
                } else {
                    self.heap.header_mut(id).set_age(AGE_OLD);
                    match self.heap.kind_of(id) {
                        crate::value::ObjectKind::Thread => {
                            self.heap.header_mut(id).make_gray();
                            self.grayagain.push(id);
                        }
                        crate::value::ObjectKind::Upvalue
                            if matches!(&self.heap.get(id).payload, Payload::Upvalue(u) if u.is_open()) =>
                        {
                            self.heap.header_mut(id).make_gray();
                        }
                        _ => self.heap.header_mut(id).make_black(),
                    }
                    prev = Some(id);
                }
                cur = next;
            }
        }
    }

    fn whiten_everything(&mut self) {
        let current_white = self.current_white;
        for list in [GcList::AllGc, GcList::FinObj, GcList::ToBeFnz] {
            for id in self.heap.list_iter(list).collect::<Vec<_>>() {
                self.heap.header_mut(id).make_white(current_white);
            }
        }
    }
}
