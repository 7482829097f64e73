//! Heap objects.
//!
//! Every GC-managed allocation is an [`Obj`]: a mark flag, an intrusive
//! `next` pointer linking it into the VM-wide allocation list, and a tagged
//! body with the variant payload. Objects are created only through the VM's
//! allocator (which drives the GC trigger) and destroyed only by the
//! sweeper.
//!
//! The accessor helpers below hand out references derived from raw
//! pointers. The VM is single-threaded and is the sole owner of every
//! object; callers keep these references short-lived and never hold one
//! across an allocation.

use super::chunk::Chunk;
use super::table::Table;
use super::value::Value;
use super::vm::{Unwind, Vm};

/// Native function signature: the VM, then the argument window. Natives
/// raise by returning `Err` with a constructed error value.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Result<Value, Unwind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjKind {
    Str,
    Function,
    Closure,
    Upvalue,
    Native,
    List,
    Map,
}

pub struct Obj {
    pub marked: bool,
    pub next: *mut Obj,
    pub body: ObjBody,
}

pub enum ObjBody {
    Str(ObjStr),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Native(ObjNative),
    List(ObjList),
    Map(ObjMap),
}

impl Obj {
    pub fn kind(&self) -> ObjKind {
        match self.body {
            ObjBody::Str(_) => ObjKind::Str,
            ObjBody::Function(_) => ObjKind::Function,
            ObjBody::Closure(_) => ObjKind::Closure,
            ObjBody::Upvalue(_) => ObjKind::Upvalue,
            ObjBody::Native(_) => ObjKind::Native,
            ObjBody::List(_) => ObjKind::List,
            ObjBody::Map(_) => ObjKind::Map,
        }
    }
}

/// Immutable interned string. The hash is computed once at allocation and
/// reused by every table lookup and by the global inline cache.
pub struct ObjStr {
    pub chars: Box<str>,
    pub hash: u32,
}

/// An upvalue descriptor recorded by the compiler: capture an enclosing
/// local by slot (`is_local`) or copy an enclosing upvalue by index.
#[derive(Debug, Clone, Copy)]
pub struct UpvalueDesc {
    pub index: u8,
    pub is_local: bool,
}

pub struct ObjFunction {
    pub arity: u8,
    /// Capture plan, in declaration order. The runtime walks this when it
    /// executes `Closure` for this function.
    pub upvalues: Vec<UpvalueDesc>,
    pub chunk: Chunk,
    /// Function name as an interned string, or null for the script body.
    pub name: *mut Obj,
}

impl ObjFunction {
    pub fn new() -> ObjFunction {
        ObjFunction {
            arity: 0,
            upvalues: Vec::new(),
            chunk: Chunk::new(),
            name: std::ptr::null_mut(),
        }
    }

    pub fn name_str(&self) -> Option<&str> {
        if self.name.is_null() {
            None
        } else {
            Some(&str_ref(self.name).chars)
        }
    }
}

/// Where an upvalue's variable currently lives: on the value stack while
/// the enclosing frame is alive, or inside the upvalue once closed.
pub enum UpvalueLoc {
    Stack(usize),
    Closed(Value),
}

pub struct ObjUpvalue {
    pub location: UpvalueLoc,
    /// Next open upvalue in the VM's list (descending slot order). Null
    /// when this upvalue is closed or last.
    pub next_open: *mut Obj,
}

pub struct ObjClosure {
    pub function: *mut Obj,
    pub upvalues: Vec<*mut Obj>,
}

pub struct ObjNative {
    pub function: NativeFn,
    pub name: &'static str,
    /// Fixed arity, or -1 for variadic (argument shapes checked by the
    /// native itself).
    pub arity: i32,
}

pub struct ObjList {
    pub items: Vec<Value>,
}

pub struct ObjMap {
    pub table: Table,
}

// ---------------------------------------------------------------------------
// Typed accessors
// ---------------------------------------------------------------------------

macro_rules! obj_accessors {
    ($ref_name:ident, $mut_name:ident, $variant:ident, $ty:ty) => {
        #[inline]
        pub fn $ref_name<'a>(obj: *mut Obj) -> &'a $ty {
            match unsafe { &(*obj).body } {
                ObjBody::$variant(inner) => inner,
                _ => unreachable!(concat!("expected ", stringify!($variant), " object")),
            }
        }

        #[inline]
        #[allow(dead_code)]
        pub fn $mut_name<'a>(obj: *mut Obj) -> &'a mut $ty {
            match unsafe { &mut (*obj).body } {
                ObjBody::$variant(inner) => inner,
                _ => unreachable!(concat!("expected ", stringify!($variant), " object")),
            }
        }
    };
}

obj_accessors!(str_ref, str_mut, Str, ObjStr);
obj_accessors!(function_ref, function_mut, Function, ObjFunction);
obj_accessors!(closure_ref, closure_mut, Closure, ObjClosure);
obj_accessors!(upvalue_ref, upvalue_mut, Upvalue, ObjUpvalue);
obj_accessors!(native_ref, native_mut, Native, ObjNative);
obj_accessors!(list_ref, list_mut, List, ObjList);
obj_accessors!(map_ref, map_mut, Map, ObjMap);

/// 32-bit FNV-1a, the hash stored in every interned string.
pub fn hash_str(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_known_vectors() {
        assert_eq!(hash_str(b""), 2166136261);
        assert_eq!(hash_str(b"a"), 0xe40c292c);
        assert_eq!(hash_str(b"foobar"), 0xbf9cf968);
    }

    #[test]
    fn kind_matches_body() {
        let func = ObjFunction::new();
        let obj = Obj {
            marked: false,
            next: std::ptr::null_mut(),
            body: ObjBody::Function(func),
        };
        assert_eq!(obj.kind(), ObjKind::Function);
    }
}
