//! Heap registry: the object arena, the four intrusive
//! heap lists (`allgc`/`finobj`/`tobefnz`/`fixedgc`), the short-string
//! intern table, and the `twups` list of threads with open upvalues.
//!
//! Grounded on `gc::object_pool_v2`'s arena-with-free-list design
//! (`Vec<Option<T>>` + reusable free slots) generalized from per-kind
//! arenas to the single closed-sum arena the design notes recommend.

use crate::header::GcHeader;
use crate::object::{
    GcObject, LuaClosure, LuaStr, NativeClosure, Payload, Proto, Table, Thread, ThreadStatus,
    Upvalue, UpvalueState, Userdata,
};
use crate::value::{ObjectId, ObjectKind, Value};
use smol_str::SmolStr;

/// Identifies one of the four disjoint heap lists an object can live on
/// (kept new-white to avoid racing the sweeper).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcList {
    AllGc,
    FinObj,
    ToBeFnz,
    FixedGc,
}

/// Base types that can carry a per-type metatable, mirroring Lua's
/// `g->mt[LUA_NUMTYPES]` array.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BaseType {
    Nil,
    Boolean,
    Number,
    String,
    Table,
    Function,
    Userdata,
    Thread,
}
const BASE_TYPE_COUNT: usize = 8;

/// Short-string interning threshold, matching Lua's `LUAI_MAXSHORTLEN`.
pub const MAX_SHORT_STRING_LEN: usize = 40;

pub struct Heap {
    objects: Vec<Option<GcObject>>,
    free_list: Vec<u32>,

    allgc: Option<ObjectId>,
    finobj: Option<ObjectId>,
    tobefnz: Option<ObjectId>,
    fixedgc: Option<ObjectId>,

    /// Short-string intern table, keyed by content.
    short_strings: hashbrown::HashMap<SmolStr, ObjectId, ahash::RandomState>,

    /// Threads with open upvalues, threaded through `Thread::twups_next`
    /// (an "other root" walked by `remarkupvals`).
    pub twups: Option<ObjectId>,

    pub main_thread: Option<ObjectId>,
    pub registry: Value,
    metatables: [Option<ObjectId>; BASE_TYPE_COUNT],

    pub total_object_count: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            free_list: Vec::new(),
            allgc: None,
            finobj: None,
            tobefnz: None,
            fixedgc: None,
            short_strings: hashbrown::HashMap::default(),
            twups: None,
            main_thread: None,
            registry: Value::Nil,
            metatables: [None; BASE_TYPE_COUNT],
            total_object_count: 0,
        }
    }

    // ---- list head accessors -------------------------------------------------

    #[inline]
    pub fn list_head(&self, list: GcList) -> Option<ObjectId> {
        match list {
            GcList::AllGc => self.allgc,
            GcList::FinObj => self.finobj,
            GcList::ToBeFnz => self.tobefnz,
            GcList::FixedGc => self.fixedgc,
        }
    }

    #[inline]
    pub fn set_list_head(&mut self, list: GcList, id: Option<ObjectId>) {
        match list {
            GcList::AllGc => self.allgc = id,
            GcList::FinObj => self.finobj = id,
            GcList::ToBeFnz => self.tobefnz = id,
            GcList::FixedGc => self.fixedgc = id,
        }
    }

    pub fn list_push_front(&mut self, list: GcList, id: ObjectId) {
        let head = self.list_head(list);
        self.header_mut(id).next = head;
        self.set_list_head(list, Some(id));
    }

    /// Unlink `id` from `list`, given the object immediately preceding it
    /// (`None` if `id` is currently the head). Used by the finalizer
    /// migration path and by the sweeper.
    pub fn list_unlink_after(&mut self, list: GcList, prev: Option<ObjectId>, id: ObjectId) {
        let next = self.header(id).next;
        match prev {
            None => self.set_list_head(list, next),
            Some(p) => self.header_mut(p).next = next,
        }
    }

    /// Append `id` to the tail of `list`, preserving discovery order
    /// (used by finalizer separation: objects become pending in the
    /// order they were found dead).
    pub fn list_push_back(&mut self, list: GcList, id: ObjectId) {
        self.header_mut(id).next = None;
        match self.list_head(list) {
            None => self.set_list_head(list, Some(id)),
            Some(mut cur) => {
                while let Some(next) = self.header(cur).next {
                    cur = next;
                }
                self.header_mut(cur).next = Some(id);
            }
        }
    }

    pub fn list_iter(&self, list: GcList) -> impl Iterator<Item = ObjectId> + '_ {
        let mut cur = self.list_head(list);
        std::iter::from_fn(move || {
            let id = cur?;
            cur = self.header(id).next;
            Some(id)
        })
    }

    pub fn metatable(&self, bt: BaseType) -> Option<ObjectId> {
        self.metatables[bt as usize]
    }

    pub fn set_metatable(&mut self, bt: BaseType, mt: Option<ObjectId>) {
        self.metatables[bt as usize] = mt;
    }

    pub fn all_metatables(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.metatables.iter().filter_map(|m| *m)
    }

    // ---- object access ---------------------------------------------------

    #[inline]
    pub fn get(&self, id: ObjectId) -> &GcObject {
        self.objects[id.index()]
            .as_ref()
            .expect("dangling ObjectId: slot already freed")
    }

    #[inline]
    pub fn get_mut(&mut self, id: ObjectId) -> &mut GcObject {
        self.objects[id.index()]
            .as_mut()
            .expect("dangling ObjectId: slot already freed")
    }

    #[inline]
    pub fn header(&self, id: ObjectId) -> &GcHeader {
        &self.get(id).header
    }

    #[inline]
    pub fn header_mut(&mut self, id: ObjectId) -> &mut GcHeader {
        &mut self.get_mut(id).header
    }

    pub fn kind_of(&self, id: ObjectId) -> ObjectKind {
        match &self.get(id).payload {
            Payload::Str(LuaStr::Short(_)) => ObjectKind::ShortString,
            Payload::Str(LuaStr::Long(_)) => ObjectKind::LongString,
            Payload::Table(_) => ObjectKind::Table,
            Payload::NativeClosure(_) => ObjectKind::NativeClosure,
            Payload::LuaClosure(_) => ObjectKind::LuaClosure,
            Payload::Proto(_) => ObjectKind::Proto,
            Payload::Userdata(_) => ObjectKind::Userdata,
            Payload::Upvalue(_) => ObjectKind::Upvalue,
            Payload::Thread(_) => ObjectKind::Thread,
        }
    }

    // ---- allocation --------------------------------------------------------

    fn insert(&mut self, obj: GcObject) -> ObjectId {
        self.total_object_count += 1;
        if let Some(idx) = self.free_list.pop() {
            self.objects[idx as usize] = Some(obj);
            ObjectId(idx)
        } else {
            let idx = self.objects.len() as u32;
            self.objects.push(Some(obj));
            ObjectId(idx)
        }
    }

    /// Allocate a new object, register it at the head of `allgc`, and
    /// tint it the given current white. This is the core of the
    /// `new_object` external interface; the scheduler wraps it to also
    /// update debt accounting.
    fn new_object(&mut self, payload: Payload, size: usize, current_white: u8) -> ObjectId {
        let obj = GcObject {
            header: GcHeader::new(current_white, size as u32),
            payload,
        };
        let id = self.insert(obj);
        self.list_push_front(GcList::AllGc, id);
        id
    }

    pub fn alloc_table(&mut self, current_white: u8) -> ObjectId {
        self.new_object(Payload::Table(Table::new()), 56, current_white)
    }

    pub fn alloc_string(&mut self, s: &str, current_white: u8) -> ObjectId {
        if s.len() <= MAX_SHORT_STRING_LEN {
            if let Some(id) = self.short_strings.get(s) {
                return *id;
            }
            let smol = SmolStr::new(s);
            let id = self.new_object(
                Payload::Str(LuaStr::Short(smol.clone())),
                16 + s.len(),
                current_white,
            );
            self.short_strings.insert(smol, id);
            id
        } else {
            self.new_object(
                Payload::Str(LuaStr::Long(std::rc::Rc::from(s))),
                16 + s.len(),
                current_white,
            )
        }
    }

    pub fn alloc_native_closure(&mut self, captured: Vec<Value>, current_white: u8) -> ObjectId {
        let size = 24 + captured.len() * 16;
        self.new_object(
            Payload::NativeClosure(NativeClosure { captured }),
            size,
            current_white,
        )
    }

    pub fn alloc_lua_closure(
        &mut self,
        proto: Option<ObjectId>,
        upvalues: Vec<Option<ObjectId>>,
        current_white: u8,
    ) -> ObjectId {
        let size = 24 + upvalues.len() * 8;
        self.new_object(
            Payload::LuaClosure(LuaClosure { proto, upvalues }),
            size,
            current_white,
        )
    }

    pub fn alloc_proto(&mut self, current_white: u8) -> ObjectId {
        self.new_object(Payload::Proto(Proto::new()), 96, current_white)
    }

    pub fn alloc_userdata(
        &mut self,
        user_values: Vec<Value>,
        current_white: u8,
    ) -> ObjectId {
        let size = 32 + user_values.len() * 16;
        self.new_object(
            Payload::Userdata(Userdata {
                metatable: None,
                user_values,
            }),
            size,
            current_white,
        )
    }

    pub fn alloc_open_upvalue(
        &mut self,
        thread: ObjectId,
        stack_index: usize,
        current_white: u8,
    ) -> ObjectId {
        self.new_object(
            Payload::Upvalue(Upvalue {
                state: UpvalueState::Open {
                    thread,
                    stack_index,
                },
            }),
            24,
            current_white,
        )
    }

    pub fn alloc_thread(&mut self, is_main: bool, current_white: u8) -> ObjectId {
        self.new_object(Payload::Thread(Thread::new(is_main)), 512, current_white)
    }

    /// Move the head of `allgc` into `fixedgc`, tint it gray, and age it
    /// OLD. Precondition: the object is `allgc`'s head —
    /// callers fix objects immediately after allocating them, before
    /// anything else can be prepended ahead of them.
    pub fn fix(&mut self, id: ObjectId) {
        debug_assert_eq!(self.allgc, Some(id), "fix() requires allgc's head");
        self.allgc = self.header(id).next;
        self.header_mut(id).next = None;
        self.header_mut(id).make_gray();
        self.header_mut(id).set_fixed();
        self.list_push_front(GcList::FixedGc, id);
    }

    /// `check_finalizer`: migrate `o` from `allgc` to `finobj`
    /// if its new metatable defines `__gc` and it is not already
    /// finalizable. Requires the caller to supply `o`'s current
    /// predecessor on `allgc` (`None` if `o` is the head) since this is a
    /// singly linked list; mid-sweep callers must have already advanced
    /// the sweep cursor past `o` via `sweeptolive`.
    pub fn check_finalizer(&mut self, o: ObjectId, allgc_prev: Option<ObjectId>, has_gc_metamethod: bool) {
        if !has_gc_metamethod || self.header(o).is_finalized() {
            return;
        }
        self.list_unlink_after(GcList::AllGc, allgc_prev, o);
        self.header_mut(o).set_finalized();
        self.list_push_front(GcList::FinObj, o);
    }

    /// Kind-specific teardown when an object is confirmed dead by the
    /// sweeper: drop its storage and, for strings/upvalues/threads,
    /// unlink it from whatever secondary structure referenced it
    /// directly (the intern table, an owning thread's open-upvalue
    /// list).
    pub fn free_object(&mut self, id: ObjectId) -> u32 {
        let idx = id.index();
        let obj = self.objects[idx].take().expect("double free of ObjectId");
        let size = obj.header.size;
        match obj.payload {
            Payload::Str(LuaStr::Short(s)) => {
                self.short_strings.remove(s.as_str());
            }
            Payload::Upvalue(uv) => {
                if let UpvalueState::Open { thread, .. } = uv.state {
                    if let Some(Some(tobj)) = self.objects.get_mut(thread.index()) {
                        if let Payload::Thread(t) = &mut tobj.payload {
                            t.open_upvalues.retain(|&uid| uid != id);
                        }
                    }
                }
            }
            Payload::Thread(_) => {
                // stack and call info simply drop with the payload.
            }
            _ => {}
        }
        self.free_list.push(idx as u32);
        self.total_object_count -= 1;
        size
    }

    pub fn intern_count(&self) -> usize {
        self.short_strings.len()
    }

    /// `checkSizes`: halve the intern table's bucket reservation
    /// when load factor drops below 25%, mirroring `lgc.c`'s
    /// `checkSizes`. `hashbrown` doesn't expose manual bucket counts the
    /// way Lua's hand-rolled string table does, so this is approximated
    /// by reconstructing the map at half the reserved capacity, which
    /// achieves the same effect (releasing unused backing memory) that
    /// the original achieves by explicit resize.
    pub fn maybe_shrink_string_table(&mut self) {
        let len = self.short_strings.len();
        let cap = self.short_strings.capacity();
        if cap > 0 && len * 4 < cap {
            let mut shrunk = hashbrown::HashMap::with_capacity_and_hasher(
                len.max(4),
                ahash::RandomState::default(),
            );
            shrunk.extend(self.short_strings.drain());
            self.short_strings = shrunk;
        }
    }

    pub fn is_thread_dead_status(&self, id: ObjectId) -> bool {
        matches!(
            &self.get(id).payload,
            Payload::Thread(t) if t.status == ThreadStatus::Dead
        )
    }

    /// Resolve a table's `__mode` entry to its string content, if any.
    /// `mode_key` is the interned `"__mode"` short string; comparing by
    /// `ObjectId` is valid because short strings are interned (two equal
    /// short strings always share one object).
    pub fn table_mode_string(&self, table: ObjectId, mode_key: ObjectId) -> Option<String> {
        let Payload::Table(t) = &self.get(table).payload else {
            return None;
        };
        let v = t.hash.get(&Value::Obj(ObjectKind::ShortString, mode_key))?;
        let (ObjectKind::ShortString | ObjectKind::LongString, sid) = v.as_object()? else {
            return None;
        };
        match &self.get(sid).payload {
            Payload::Str(s) => Some(s.as_str().to_string()),
            _ => None,
        }
    }

    pub fn is_in_twups(&self, id: ObjectId) -> bool {
        matches!(&self.get(id).payload, Payload::Thread(t) if t.in_twups)
    }

    /// Link `id` onto the front of `twups`, if it isn't already there.
    pub fn push_twups(&mut self, id: ObjectId) {
        if self.is_in_twups(id) {
            return;
        }
        let head = self.twups;
        if let Payload::Thread(t) = &mut self.get_mut(id).payload {
            t.twups_next = head;
            t.in_twups = true;
        }
        self.twups = Some(id);
    }

    pub fn twups_next(&self, id: ObjectId) -> Option<ObjectId> {
        match &self.get(id).payload {
            Payload::Thread(t) => t.twups_next,
            _ => unreachable!(),
        }
    }

    pub fn set_twups_next(&mut self, id: ObjectId, next: Option<ObjectId>) {
        if let Payload::Thread(t) = &mut self.get_mut(id).payload {
            t.twups_next = next;
        }
    }

    pub fn mark_twups_removed(&mut self, id: ObjectId) {
        if let Payload::Thread(t) = &mut self.get_mut(id).payload {
            t.in_twups = false;
            t.twups_next = None;
        }
    }

    pub fn has_gc_metamethod(&self, metatable: Option<ObjectId>, gc_key: ObjectId) -> bool {
        let Some(mt) = metatable else { return false };
        if let Payload::Table(t) = &self.get(mt).payload {
            t.hash
                .get(&Value::Obj(ObjectKind::ShortString, gc_key))
                .map(|v| !v.is_nil())
                .unwrap_or(false)
        } else {
            false
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_interning_dedupes_short_strings() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("hello", 0);
        let b = heap.alloc_string("hello", 0);
        assert_eq!(a, b);
        assert_eq!(heap.intern_count(), 1);
    }

    #[test]
    fn free_object_reuses_arena_slot() {
        let mut heap = Heap::new();
        let a = heap.alloc_table(0);
        heap.list_unlink_after(GcList::AllGc, None, a);
        heap.free_object(a);
        let b = heap.alloc_table(0);
        assert_eq!(a, b);
    }

    #[test]
    fn list_push_back_preserves_discovery_order() {
        let mut heap = Heap::new();
        let a = heap.alloc_table(0);
        let b = heap.alloc_table(0);
        let c = heap.alloc_table(0);
        heap.list_push_back(GcList::ToBeFnz, a);
        heap.list_push_back(GcList::ToBeFnz, b);
        heap.list_push_back(GcList::ToBeFnz, c);
        let order: Vec<_> = heap.list_iter(GcList::ToBeFnz).collect();
        assert_eq!(order, vec![a, b, c]);
    }

    #[test]
    fn twups_tracks_membership() {
        let mut heap = Heap::new();
        let t = heap.alloc_thread(false, 0);
        assert!(!heap.is_in_twups(t));
        heap.push_twups(t);
        assert!(heap.is_in_twups(t));
        // Pushing again is a no-op, not a second link.
        heap.push_twups(t);
        assert_eq!(heap.twups, Some(t));
        heap.mark_twups_removed(t);
        assert!(!heap.is_in_twups(t));
    }

    #[test]
    fn free_object_unlinks_open_upvalue_from_owning_thread() {
        let mut heap = Heap::new();
        let t = heap.alloc_thread(false, 0);
        let uv = heap.alloc_open_upvalue(t, 0, 0);
        if let Payload::Thread(thread) = &mut heap.get_mut(t).payload {
            thread.open_upvalues.push(uv);
        }
        heap.free_object(uv);
        match &heap.get(t).payload {
            Payload::Thread(thread) => assert!(thread.open_upvalues.is_empty()),
            _ => unreachable!(),
        }
    }
}
