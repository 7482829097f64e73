//! Allocation and the tracing collector.
//!
//! Mark-and-sweep, stop-the-world, tri-color with an explicit gray
//! worklist. Collection triggers inside `alloc_object` when the running
//! byte estimate crosses the threshold; after each collection the
//! threshold is twice the surviving estimate. Because this is the *only*
//! place a collection can start, any code path holding a fresh object
//! across another allocation must first make it reachable (value stack,
//! compiler root list, or an import snapshot).

use super::object::{
    closure_ref, function_ref, list_ref, map_ref, upvalue_ref, Obj, ObjBody, ObjClosure,
    ObjFunction, ObjList, ObjMap, UpvalueLoc,
};
use super::table::Table;
use super::value::Value;
use super::vm::Vm;

const GC_HEAP_GROW_FACTOR: usize = 2;
pub(crate) const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

/// Rough size of an allocation, charged on alloc and refunded on free.
/// Container growth inside lists and maps is not intercepted; the string
/// payload is the one variable-size component that never changes.
fn object_size(body: &ObjBody) -> usize {
    let payload = match body {
        ObjBody::Str(s) => s.chars.len(),
        _ => 0,
    };
    std::mem::size_of::<Obj>() + payload
}

impl Vm {
    pub(crate) fn alloc_object(&mut self, body: ObjBody) -> *mut Obj {
        let size = object_size(&body);
        self.bytes_allocated += size;
        if self.gc_stress || self.bytes_allocated > self.next_gc {
            self.collect_garbage();
        }
        let obj = Box::into_raw(Box::new(Obj {
            marked: false,
            next: self.objects,
            body,
        }));
        self.objects = obj;
        obj
    }

    pub(crate) fn alloc_function(&mut self) -> *mut Obj {
        self.alloc_object(ObjBody::Function(ObjFunction::new()))
    }

    pub(crate) fn alloc_closure(&mut self, function: *mut Obj) -> *mut Obj {
        self.alloc_object(ObjBody::Closure(ObjClosure {
            function,
            upvalues: Vec::new(),
        }))
    }

    pub(crate) fn alloc_list(&mut self, items: Vec<Value>) -> *mut Obj {
        self.alloc_object(ObjBody::List(ObjList { items }))
    }

    pub(crate) fn alloc_map(&mut self) -> *mut Obj {
        self.alloc_object(ObjBody::Map(ObjMap {
            table: Table::new(),
        }))
    }

    // -----------------------------------------------------------------------
    // Collection
    // -----------------------------------------------------------------------

    pub fn collect_garbage(&mut self) {
        self.mark_roots();
        self.trace_references();
        // The intern table holds weak references; drop the entries whose
        // strings are about to die so it never dangles.
        self.strings.remove_unmarked_keys();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while !upvalue.is_null() {
            self.mark_object(upvalue);
            upvalue = upvalue_ref(upvalue).next_open;
        }
        self.mark_table_entries(|vm| &vm.globals);
        self.mark_table_entries(|vm| &vm.modules);
        for i in 0..self.compiler_roots.len() {
            let root = self.compiler_roots[i];
            self.mark_object(root);
        }
        for i in 0..self.import_snapshots.len() {
            let entries: Vec<_> = self.import_snapshots[i].iter().collect();
            for (key, value) in entries {
                self.mark_object(key);
                self.mark_value(value);
            }
        }
    }

    fn mark_table_entries(&mut self, table: fn(&Vm) -> &Table) {
        let entries: Vec<_> = table(self).iter().collect();
        for (key, value) in entries {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    pub(crate) fn mark_value(&mut self, value: Value) {
        if value.is_obj() {
            self.mark_object(value.as_obj());
        }
    }

    pub(crate) fn mark_object(&mut self, obj: *mut Obj) {
        if obj.is_null() {
            return;
        }
        if unsafe { (*obj).marked } {
            return;
        }
        unsafe { (*obj).marked = true };
        self.gray.push(obj);
    }

    fn trace_references(&mut self) {
        while let Some(obj) = self.gray.pop() {
            self.blacken(obj);
        }
    }

    fn blacken(&mut self, obj: *mut Obj) {
        match unsafe { &(*obj).body } {
            ObjBody::Str(_) | ObjBody::Native(_) => {}
            ObjBody::Function(_) => {
                let function = function_ref(obj);
                self.mark_object(function.name);
                for i in 0..function.chunk.constants.len() {
                    self.mark_value(function.chunk.constants[i]);
                }
            }
            ObjBody::Closure(_) => {
                let closure = closure_ref(obj);
                self.mark_object(closure.function);
                for i in 0..closure.upvalues.len() {
                    self.mark_object(closure.upvalues[i]);
                }
            }
            ObjBody::Upvalue(_) => {
                if let UpvalueLoc::Closed(value) = upvalue_ref(obj).location {
                    self.mark_value(value);
                }
            }
            ObjBody::List(_) => {
                let list = list_ref(obj);
                for i in 0..list.items.len() {
                    self.mark_value(list.items[i]);
                }
            }
            ObjBody::Map(_) => {
                let entries: Vec<_> = map_ref(obj).table.iter().collect();
                for (key, value) in entries {
                    self.mark_object(key);
                    self.mark_value(value);
                }
            }
        }
    }

    fn sweep(&mut self) {
        let mut previous: *mut Obj = std::ptr::null_mut();
        let mut object = self.objects;
        while !object.is_null() {
            let marked = unsafe { (*object).marked };
            if marked {
                unsafe { (*object).marked = false };
                previous = object;
                object = unsafe { (*object).next };
            } else {
                let unreached = object;
                object = unsafe { (*object).next };
                if previous.is_null() {
                    self.objects = object;
                } else {
                    unsafe { (*previous).next = object };
                }
                self.free_object(unreached);
            }
        }
    }

    fn free_object(&mut self, obj: *mut Obj) {
        let boxed = unsafe { Box::from_raw(obj) };
        self.bytes_allocated = self
            .bytes_allocated
            .saturating_sub(object_size(&boxed.body));
        drop(boxed);
    }

    /// Free everything regardless of reachability; used when the VM drops.
    pub(crate) fn free_all_objects(&mut self) {
        let mut object = self.objects;
        self.objects = std::ptr::null_mut();
        while !object.is_null() {
            let next = unsafe { (*object).next };
            drop(unsafe { Box::from_raw(object) });
            object = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object::list_mut;

    fn count_objects(vm: &Vm) -> usize {
        let mut count = 0;
        let mut obj = vm.objects;
        while !obj.is_null() {
            count += 1;
            obj = unsafe { (*obj).next };
        }
        count
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut vm = Vm::new();
        let before = count_objects(&vm);
        // Unrooted garbage: nothing refers to this list.
        vm.alloc_list(Vec::new());
        assert_eq!(count_objects(&vm), before + 1);
        vm.collect_garbage();
        assert_eq!(count_objects(&vm), before);
    }

    #[test]
    fn stack_values_survive_collection() {
        let mut vm = Vm::new();
        let list = vm.alloc_list(vec![Value::number(7.0)]);
        vm.push(Value::object(list));
        vm.collect_garbage();
        let survivor = vm.pop();
        assert!(survivor.is_list());
        assert_eq!(list_ref(survivor.as_obj()).items[0], Value::number(7.0));
    }

    #[test]
    fn interned_string_identity_survives_collection() {
        let mut vm = Vm::new();
        let a = vm.intern("survivor");
        vm.push(Value::object(a));
        vm.collect_garbage();
        let b = vm.intern("survivor");
        assert_eq!(a, b, "interning must return the same object after GC");
        vm.pop();
    }

    #[test]
    fn dead_strings_leave_the_intern_table() {
        let mut vm = Vm::new();
        vm.intern("ephemeral-string-nobody-roots");
        vm.collect_garbage();
        // A fresh intern after collection gets a fresh object; the old
        // entry must not have survived as a dangling pointer.
        let again = vm.intern("ephemeral-string-nobody-roots");
        vm.push(Value::object(again));
        vm.collect_garbage();
        assert_eq!(vm.intern("ephemeral-string-nobody-roots"), again);
        vm.pop();
    }

    #[test]
    fn cycles_are_collected() {
        let mut vm = Vm::new();
        let before = count_objects(&vm);
        let list = vm.alloc_list(Vec::new());
        // The list contains itself; refcounting would never free this.
        list_mut(list).items.push(Value::object(list));
        vm.collect_garbage();
        assert_eq!(count_objects(&vm), before);
    }

    #[test]
    fn globals_are_roots() {
        let mut vm = Vm::new();
        let list = vm.alloc_list(vec![Value::number(1.0)]);
        vm.push(Value::object(list));
        let name = vm.intern("kept");
        vm.globals.set(name, Value::object(list));
        vm.pop();
        vm.collect_garbage();
        let name = vm.intern("kept");
        let kept = vm.globals.get(name).expect("global survived");
        assert!(kept.is_list());
        assert_eq!(list_ref(kept.as_obj()).items.len(), 1);
    }

    #[test]
    fn stress_mode_collects_on_every_allocation() {
        let mut vm = Vm::new();
        vm.gc_stress = true;
        // Build a list value-by-value with collections firing constantly;
        // the rooted container must keep every element alive.
        let list = vm.alloc_list(Vec::new());
        vm.push(Value::object(list));
        for i in 0..50 {
            let s = vm.intern(&format!("item-{}", i));
            list_mut(list).items.push(Value::object(s));
        }
        for i in 0..50 {
            let item = list_ref(list).items[i];
            assert!(item.is_string());
        }
        vm.pop();
    }
}
