//! End-to-end scenarios exercising the collector through its public
//! surface only, the way an embedding runtime would: allocate objects,
//! wire them into a root table, mutate fields directly (calling the
//! write barriers the way a table-set opcode would), and drive the
//! collector with `step`/`full_gc`.

use luagc::object::Payload;
use luagc::value::{ObjectId, ObjectKind, Value};
use luagc::{Gc, GcConfig, GcMode};

fn root_table(gc: &mut Gc) -> ObjectId {
    let t = gc.new_table();
    gc.heap.registry = Value::Obj(ObjectKind::Table, t);
    t
}

fn array_set(gc: &mut Gc, table: ObjectId, index: usize, v: Value) {
    if let Payload::Table(t) = &mut gc.heap.get_mut(table).payload {
        if t.array.len() <= index {
            t.array.resize(index + 1, Value::Nil);
        }
        t.array[index] = v;
    }
    if gc.heap.header(table).is_black() {
        gc.barrier_backward(table);
    }
}

fn hash_set(gc: &mut Gc, table: ObjectId, key: Value, v: Value) {
    if let Payload::Table(t) = &mut gc.heap.get_mut(table).payload {
        if v.is_nil() {
            t.hash.remove(&key);
        } else {
            t.hash.insert(key, v);
        }
    }
    if gc.heap.header(table).is_black() {
        gc.barrier_backward(table);
    }
}

fn run_to_pause(gc: &mut Gc, max_steps: usize) {
    for _ in 0..max_steps {
        gc.step();
    }
}

#[test]
fn empty_heap_cycles_without_error() {
    let mut gc = Gc::new(GcConfig::default());
    for _ in 0..64 {
        gc.step();
    }
    // Nothing allocated beyond the fixed interned keys and main thread,
    // so a full cycle should never find anything to free.
    assert_eq!(gc.stats.objects_freed, 0);
}

#[test]
fn basic_reclaim() {
    let mut gc = Gc::new(GcConfig::default());
    let root = root_table(&mut gc);

    let mut tables = Vec::with_capacity(1000);
    for i in 0..1000 {
        let t = gc.new_table();
        array_set(&mut gc, root, i, Value::Obj(ObjectKind::Table, t));
        tables.push(t);
    }

    for i in (0..1000).step_by(2) {
        array_set(&mut gc, root, i, Value::Nil);
    }

    gc.full_gc(false);

    assert!(gc.stats.objects_freed >= 500);
    for (i, &t) in tables.iter().enumerate() {
        if i % 2 == 1 {
            // Odd entries are still reachable through `root`'s array.
            assert!(gc.heap.kind_of(t) == ObjectKind::Table);
        }
    }
}

struct RecordingHost {
    order: std::rc::Rc<std::cell::RefCell<Vec<&'static str>>>,
    names: std::collections::HashMap<ObjectId, &'static str>,
}

impl luagc::FinalizerHost for RecordingHost {
    fn call_finalizer(&mut self, _heap: &mut luagc::heap::Heap, object: ObjectId) -> Result<(), String> {
        if let Some(name) = self.names.get(&object) {
            self.order.borrow_mut().push(name);
        }
        Ok(())
    }
}

fn make_finalizable(gc: &mut Gc, gc_key: ObjectId) -> ObjectId {
    let mt = gc.new_table();
    // A truthy `__gc` entry is enough for `has_gc_metamethod`; the host
    // never actually looks up the stashed value when invoking it.
    hash_set(gc, mt, Value::Obj(ObjectKind::ShortString, gc_key), Value::Bool(true));
    let o = gc.new_table();
    gc.check_finalizer(o, None, Some(mt)).unwrap();
    gc.table_set_metatable(o, Some(mt));
    o
}

#[test]
fn finalizer_ordering_and_eventual_collection() {
    let mut gc = Gc::new(GcConfig::default());
    let gc_key = gc.new_string("__gc");

    let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let mut names = std::collections::HashMap::new();

    let root = root_table(&mut gc);
    let a = make_finalizable(&mut gc, gc_key);
    let b = make_finalizable(&mut gc, gc_key);
    names.insert(a, "A");
    names.insert(b, "B");
    array_set(&mut gc, root, 0, Value::Obj(ObjectKind::Table, a));
    array_set(&mut gc, root, 1, Value::Obj(ObjectKind::Table, b));

    gc.set_finalizer_host(Box::new(RecordingHost { order: order.clone(), names }));

    // Drop both references.
    array_set(&mut gc, root, 0, Value::Nil);
    array_set(&mut gc, root, 1, Value::Nil);

    gc.full_gc(false);
    gc.full_gc(false);
    gc.full_gc(false);

    let recorded = order.borrow();
    assert_eq!(recorded.len(), 2);
    assert!(recorded.contains(&"A") && recorded.contains(&"B"));
    assert_eq!(gc.stats.finalizers_run, 2);
}

#[test]
fn ephemeron_convergence() {
    let mut gc = Gc::new(GcConfig::default());
    let mode_key = gc.new_string("__mode");
    let root = root_table(&mut gc);

    let weak_mt = gc.new_table();
    let k_str = gc.new_string("k");
    hash_set(&mut gc, weak_mt, Value::Obj(ObjectKind::ShortString, mode_key), Value::Obj(ObjectKind::ShortString, k_str));

    let e = gc.new_table();
    array_set(&mut gc, root, 0, Value::Obj(ObjectKind::Table, e));
    gc.table_set_metatable(e, Some(weak_mt));

    let k1 = gc.new_table();
    let k2 = gc.new_table();
    let k3 = gc.new_table();
    hash_set(&mut gc, e, Value::Obj(ObjectKind::Table, k1), Value::Obj(ObjectKind::Table, k2));
    hash_set(&mut gc, e, Value::Obj(ObjectKind::Table, k2), Value::Obj(ObjectKind::Table, k3));

    array_set(&mut gc, root, 1, Value::Obj(ObjectKind::Table, k1));

    gc.full_gc(false);

    assert!(gc.heap.kind_of(k1) == ObjectKind::Table);
    assert!(gc.heap.kind_of(k2) == ObjectKind::Table);
    assert!(gc.heap.kind_of(k3) == ObjectKind::Table);

    // Drop the one external root keeping the chain alive.
    array_set(&mut gc, root, 1, Value::Nil);
    gc.full_gc(false);
    gc.full_gc(false);

    // The arena slots are gone; re-allocating immediately would reuse a
    // freed slot, so instead check the freed count grew by exactly the
    // three chained tables (plus whatever else was reclaimed).
    assert!(gc.stats.objects_freed >= 3);
}

#[test]
fn barrier_correctness_keeps_newly_linked_value_alive() {
    let mut config = GcConfig::default();
    config.gcstepsize = 0; // 1-byte step budget: finely incremental.
    let mut gc = Gc::new(config);
    let root = root_table(&mut gc);

    let t = gc.new_table();
    array_set(&mut gc, root, 0, Value::Obj(ObjectKind::Table, t));

    // Pad the gray worklist with filler tables so propagation takes many
    // steps and we can catch `t` blackened mid-cycle.
    for i in 1..200 {
        let filler = gc.new_table();
        array_set(&mut gc, root, i, Value::Obj(ObjectKind::Table, filler));
    }

    let mut became_black = false;
    for _ in 0..100_000 {
        gc.step();
        if gc.heap.header(t).is_black() {
            became_black = true;
            break;
        }
        if gc.stats.cycles_completed > 0 {
            break;
        }
    }
    assert!(became_black, "table never observed black mid-cycle");

    let fresh = gc.new_table();
    hash_set(&mut gc, t, Value::Int(1), Value::Obj(ObjectKind::Table, fresh));
    // The backward barrier must have re-grayed `t`.
    assert!(!gc.heap.header(t).is_black());

    run_to_pause(&mut gc, 100_000);
    assert!(gc.heap.kind_of(fresh) == ObjectKind::Table);
}

struct NeverCalledHost;
impl luagc::FinalizerHost for NeverCalledHost {
    fn call_finalizer(&mut self, _heap: &mut luagc::heap::Heap, _object: ObjectId) -> Result<(), String> {
        panic!("finalizer invoked during an emergency cycle");
    }
}

#[test]
fn emergency_cycle_skips_finalizers() {
    let mut gc = Gc::new(GcConfig::default());
    let gc_key = gc.new_string("__gc");
    gc.set_finalizer_host(Box::new(NeverCalledHost));

    let root = root_table(&mut gc);
    let a = make_finalizable(&mut gc, gc_key);
    array_set(&mut gc, root, 0, Value::Obj(ObjectKind::Table, a));
    array_set(&mut gc, root, 0, Value::Nil);

    gc.full_gc(true);
    assert_eq!(gc.stats.finalizers_run, 0);

    gc.set_finalizer_host(Box::new(luagc::finalizer::NoopFinalizerHost));
    gc.full_gc(false);
}

#[test]
fn mode_switch_ages_survivors_to_old() {
    let mut gc = Gc::new(GcConfig::default());
    let root = root_table(&mut gc);
    let mut tables = Vec::new();
    for i in 0..2000 {
        let t = gc.new_table();
        array_set(&mut gc, root, i, Value::Obj(ObjectKind::Table, t));
        tables.push(t);
    }
    gc.full_gc(false);

    let bytes_before = gc.total_bytes();
    gc.change_mode(GcMode::Generational);
    assert_eq!(gc.total_bytes(), bytes_before);

    for &t in &tables {
        assert_eq!(gc.heap.header(t).age(), luagc::header::AGE_OLD);
    }

    // A minor cycle over an all-old heap should complete without
    // reclaiming any of these survivors.
    let freed_before = gc.stats.objects_freed;
    gc.step();
    assert_eq!(gc.stats.objects_freed, freed_before);
}
