//! Marker: `reallymarkobject`, `propagatemark`, table-weakness
//! decoding, and ephemeron convergence.
//!
//! Grounded on `traversetable`/`traverseweakvalue`/`traverseephemeron`/
//! `traversestrongtable` in `examples/original_source/lgc.c`; the Rust
//! rendition trades the original's tombstoned ("dead key") hash slots for
//! plain `HashMap::remove` — `hashbrown` supports true removal where
//! Lua's open-addressed table cannot shrink mid-cycle without a rehash,
//! so there is nothing to tombstone here (recorded as a resolved open
//! question in DESIGN.md).

use crate::gc::Gc;
use crate::object::{Payload, UpvalueState, Weakness};
use crate::value::{ObjectId, ObjectKind, Value};

/// A weakly-held value is only cleared if it's a collectable object
/// that's currently white. Strings are values rather than references for
/// weak-table purposes and are never cleared (`iscleared`'s
/// `iswhite(...) && !strvalue(...)` check).
#[inline]
fn is_cleared(gc: &Gc, v: Value) -> bool {
    match v.as_object() {
        Some((kind, _)) if matches!(kind, ObjectKind::ShortString | ObjectKind::LongString) => false,
        Some((_, id)) => gc.heap.header(id).is_white(),
        None => false,
    }
}

pub(crate) fn mark_object(gc: &mut Gc, id: ObjectId) {
    if gc.heap.header(id).is_white() {
        really_mark_object(gc, id);
    }
}

pub(crate) fn mark_value(gc: &mut Gc, v: &Value) {
    if let Some((_, id)) = v.as_object() {
        mark_object(gc, id);
    }
}

/// `reallymarkobject`. Precondition: `o` is white.
pub(crate) fn really_mark_object(gc: &mut Gc, o: ObjectId) {
    debug_assert!(gc.heap.header(o).is_white(), "reallymarkobject on non-white object");
    match gc.heap.kind_of(o) {
        ObjectKind::ShortString | ObjectKind::LongString => {
            gc.heap.header_mut(o).make_black();
        }
        ObjectKind::Upvalue => mark_upvalue(gc, o),
        ObjectKind::Userdata => mark_userdata(gc, o),
        ObjectKind::Table
        | ObjectKind::NativeClosure
        | ObjectKind::LuaClosure
        | ObjectKind::Proto
        | ObjectKind::Thread => {
            gc.heap.header_mut(o).make_gray();
            gc.gray.push(o);
        }
    }
}

fn mark_upvalue(gc: &mut Gc, o: ObjectId) {
    let state = match &gc.heap.get(o).payload {
        Payload::Upvalue(u) => u.state,
        _ => unreachable!(),
    };
    match state {
        // Open upvalues are transiently gray: reachable indirectly
        // through the owning thread's traversal, not through any gray
        // worklist (a deliberately named exception to the usual rule).
        UpvalueState::Open { .. } => gc.heap.header_mut(o).make_gray(),
        UpvalueState::Closed(v) => {
            gc.heap.header_mut(o).make_black();
            mark_value(gc, &v);
        }
    }
}

fn mark_userdata(gc: &mut Gc, o: ObjectId) {
    let (has_uv, metatable) = match &gc.heap.get(o).payload {
        Payload::Userdata(u) => (u.has_user_values(), u.metatable),
        _ => unreachable!(),
    };
    if has_uv {
        gc.heap.header_mut(o).make_gray();
        gc.gray.push(o);
    } else {
        if let Some(mt) = metatable {
            mark_object(gc, mt);
        }
        gc.heap.header_mut(o).make_black();
    }
}

/// `propagatemark`: pop one gray object, blacken it, traverse its
/// references. Returns the work charged (roughly "slots visited").
pub(crate) fn propagate_mark(gc: &mut Gc) -> isize {
    let Some(id) = gc.gray.pop() else {
        return 0;
    };
    gc.heap.header_mut(id).make_black();
    match gc.heap.kind_of(id) {
        ObjectKind::Table => traverse_table(gc, id),
        ObjectKind::Userdata => traverse_userdata(gc, id),
        ObjectKind::Proto => traverse_proto(gc, id),
        ObjectKind::NativeClosure => traverse_native_closure(gc, id),
        ObjectKind::LuaClosure => traverse_lua_closure(gc, id),
        ObjectKind::Thread => crate::atomic::traverse_thread(gc, id),
        ObjectKind::ShortString | ObjectKind::LongString | ObjectKind::Upvalue => 1,
    }
}

/// Drain `gray` completely; used whenever a caller needs a quiescent
/// point without regard to incremental step sizing (pause/atomic/full-gc).
pub(crate) fn propagate_all(gc: &mut Gc) -> isize {
    let mut work = 0;
    while !gc.gray.is_empty() {
        work += propagate_mark(gc);
    }
    work
}

fn traverse_table(gc: &mut Gc, id: ObjectId) -> isize {
    let (metatable, weakness) = match &gc.heap.get(id).payload {
        Payload::Table(t) => (t.metatable, t.weakness),
        _ => unreachable!(),
    };
    // The metatable itself is always a strong reference regardless of
    // the table's own weakness mode.
    if let Some(mt) = metatable {
        mark_object(gc, mt);
    }
    match weakness {
        Weakness::Strong => traverse_strong_table(gc, id),
        Weakness::WeakValues => traverse_weak_value_table(gc, id),
        Weakness::WeakKeys => traverse_ephemeron_table(gc, id, false),
        Weakness::WeakBoth => {
            gc.allweak.push(id);
            1
        }
    }
}

fn traverse_strong_table(gc: &mut Gc, id: ObjectId) -> isize {
    let (array, hash): (Vec<Value>, Vec<(Value, Value)>) = match &gc.heap.get(id).payload {
        Payload::Table(t) => (
            t.array.clone(),
            t.hash.iter().map(|(k, v)| (*k, *v)).collect(),
        ),
        _ => unreachable!(),
    };
    for v in &array {
        mark_value(gc, v);
    }
    let mut dead_keys = Vec::new();
    for (k, v) in &hash {
        if v.is_nil() {
            dead_keys.push(*k);
        } else {
            mark_value(gc, k);
            mark_value(gc, v);
        }
    }
    remove_keys(gc, id, &dead_keys);
    1 + array.len() as isize + 2 * hash.len() as isize
}

/// Weak-value table: hash-only, key-strong / value-deferred.
fn traverse_weak_value_table(gc: &mut Gc, id: ObjectId) -> isize {
    let hash: Vec<(Value, Value)> = match &gc.heap.get(id).payload {
        Payload::Table(t) => t.hash.iter().map(|(k, v)| (*k, *v)).collect(),
        _ => unreachable!(),
    };
    let has_array = match &gc.heap.get(id).payload {
        Payload::Table(t) => !t.array.is_empty(),
        _ => unreachable!(),
    };
    let mut has_clears = has_array;
    let mut dead_keys = Vec::new();
    for (k, v) in &hash {
        if v.is_nil() {
            dead_keys.push(*k);
        } else {
            mark_value(gc, k);
            if !has_clears && is_cleared(gc, *v) {
                has_clears = true;
            }
        }
    }
    remove_keys(gc, id, &dead_keys);
    gc.heap.header_mut(id).make_gray();
    if gc.state.is_atomic() && has_clears {
        gc.weak.push(id);
    } else {
        gc.grayagain.push(id);
    }
    1 + hash.len() as isize
}

/// Ephemeron table. Returns marked-something via side channel
/// (caller checks `gc.ephemeron_marked_last`), matching the original's
/// `traverseephemeron` boolean return used by `convergeephemerons`.
fn traverse_ephemeron_table(gc: &mut Gc, id: ObjectId, reverse: bool) -> isize {
    let array: Vec<Value> = match &gc.heap.get(id).payload {
        Payload::Table(t) => t.array.clone(),
        _ => unreachable!(),
    };
    let mut marked = false;
    for v in &array {
        if is_cleared(gc, *v) {
            marked = true;
            mark_value(gc, v);
        }
    }

    let mut hash: Vec<(Value, Value)> = match &gc.heap.get(id).payload {
        Payload::Table(t) => t.hash.iter().map(|(k, v)| (*k, *v)).collect(),
        _ => unreachable!(),
    };
    if reverse {
        hash.reverse();
    }

    let mut has_clears = false;
    let mut has_ww = false;
    let mut dead_keys = Vec::new();
    for (k, v) in &hash {
        if v.is_nil() {
            dead_keys.push(*k);
        } else if is_cleared(gc, *k) {
            has_clears = true;
            if is_cleared(gc, *v) {
                has_ww = true;
            }
        } else if is_cleared(gc, *v) {
            marked = true;
            mark_value(gc, v);
        }
    }
    remove_keys(gc, id, &dead_keys);

    gc.heap.header_mut(id).make_gray();
    if gc.state == crate::gc::GcState::Propagate {
        gc.grayagain.push(id);
    } else if has_ww {
        gc.ephemeron.push(id);
    } else if has_clears {
        gc.allweak.push(id);
    }
    gc.ephemeron_marked_last = marked;
    1 + array.len() as isize + 2 * hash.len() as isize
}

fn remove_keys(gc: &mut Gc, id: ObjectId, dead: &[Value]) {
    if dead.is_empty() {
        return;
    }
    if let Payload::Table(t) = &mut gc.heap.get_mut(id).payload {
        for k in dead {
            t.hash.remove(k);
        }
    }
}

fn traverse_userdata(gc: &mut Gc, id: ObjectId) -> isize {
    let (metatable, values): (Option<ObjectId>, Vec<Value>) = match &gc.heap.get(id).payload {
        Payload::Userdata(u) => (u.metatable, u.user_values.clone()),
        _ => unreachable!(),
    };
    if let Some(mt) = metatable {
        mark_object(gc, mt);
    }
    for v in &values {
        mark_value(gc, v);
    }
    1 + values.len() as isize
}

fn traverse_proto(gc: &mut Gc, id: ObjectId) -> isize {
    let (source_name, constants, upvalue_names, child_protos, local_names) =
        match &gc.heap.get(id).payload {
            Payload::Proto(p) => (
                p.source_name,
                p.constants.clone(),
                p.upvalue_names.clone(),
                p.child_protos.clone(),
                p.local_names.clone(),
            ),
            _ => unreachable!(),
        };
    if let Some(s) = source_name {
        mark_object(gc, s);
    }
    for c in &constants {
        mark_value(gc, c);
    }
    for n in upvalue_names.iter().flatten() {
        mark_object(gc, *n);
    }
    for p in &child_protos {
        mark_object(gc, *p);
    }
    for n in local_names.iter().flatten() {
        mark_object(gc, *n);
    }
    1 + constants.len() as isize + upvalue_names.len() as isize + child_protos.len() as isize
}

fn traverse_native_closure(gc: &mut Gc, id: ObjectId) -> isize {
    let captured: Vec<Value> = match &gc.heap.get(id).payload {
        Payload::NativeClosure(c) => c.captured.clone(),
        _ => unreachable!(),
    };
    for v in &captured {
        mark_value(gc, v);
    }
    1 + captured.len() as isize
}

fn traverse_lua_closure(gc: &mut Gc, id: ObjectId) -> isize {
    let (proto, upvalues): (Option<ObjectId>, Vec<Option<ObjectId>>) =
        match &gc.heap.get(id).payload {
            Payload::LuaClosure(c) => (c.proto, c.upvalues.clone()),
            _ => unreachable!(),
        };
    if let Some(p) = proto {
        mark_object(gc, p);
    }
    for uv in upvalues.iter().flatten() {
        mark_object(gc, *uv);
    }
    1 + upvalues.len() as isize
}

/// `convergeephemerons`: repeatedly drain and re-traverse the
/// `ephemeron` list, alternating direction, until a full pass marks
/// nothing new.
pub(crate) fn converge_ephemerons(gc: &mut Gc) {
    let mut reverse = false;
    loop {
        let pending = std::mem::take(&mut gc.ephemeron);
        if pending.is_empty() {
            return;
        }
        let mut any_marked = false;
        for id in pending {
            // Re-run the ephemeron traversal directly (not through
            // `propagate_mark`, which would re-blacken/re-dispatch by
            // kind); the table is already gray from its first visit.
            traverse_ephemeron_table(gc, id, reverse);
            if gc.ephemeron_marked_last {
                any_marked = true;
            }
        }
        propagate_all(gc);
        reverse = !reverse;
        if !any_marked {
            return;
        }
    }
}
