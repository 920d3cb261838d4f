use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug, Display};
use std::mem;
use std::ops::Deref;
use std::ptr::NonNull;

use crate::{object, ObjString, Table, Value};

/// Number of allocated bytes that triggers the first collection.
const FIRST_GC_THRESHOLD: usize = 1024 * 1024;

/// Multiplier applied to the live-byte count to pick the next threshold.
const GC_GROW_FACTOR: usize = 2;

/// A garbage collected object. Implementors report the objects they reference
/// so the collector can traverse the object graph.
pub trait Trace: 'static {
    /// Mark every heap object directly reachable from this one.
    fn trace(&self, heap: &mut Heap);

    /// Heap bytes owned by the object beyond its boxed header, counted
    /// against the collection threshold.
    fn owned_bytes(&self) -> usize {
        0
    }
}

impl<T: Trace> Trace for RefCell<T> {
    fn trace(&self, heap: &mut Heap) {
        self.borrow().trace(heap);
    }

    fn owned_bytes(&self) -> usize {
        self.borrow().owned_bytes()
    }
}

/// Header and payload of a heap allocation. The next pointer threads every
/// allocation into the heap's object list for sweeping.
struct GcBox<T: Trace + ?Sized> {
    marked: Cell<bool>,
    size: usize,
    next: Cell<Option<NonNull<GcBox<dyn Trace>>>>,
    data: T,
}

/// A smart pointer for a garbage collected object.
///
/// The handle stays valid for as long as the object is reachable from the
/// roots the virtual machine marks before each collection. Holding a `Gc`
/// does not by itself keep the object alive.
pub struct Gc<T: Trace + ?Sized> {
    ptr: NonNull<GcBox<T>>,
}

impl<T: Trace + ?Sized> Gc<T> {
    /// Whether two handles refer to the same allocation.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        std::ptr::eq(
            this.ptr.as_ptr() as *const u8,
            other.ptr.as_ptr() as *const u8,
        )
    }

    pub(crate) fn is_marked(&self) -> bool {
        unsafe { self.ptr.as_ref() }.marked.get()
    }

    fn set_marked(&self, marked: bool) {
        unsafe { self.ptr.as_ref() }.marked.set(marked);
    }
}

impl<T: Trace + ?Sized> Clone for Gc<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: Trace + ?Sized> Copy for Gc<T> {}

impl<T: Trace + ?Sized> AsRef<T> for Gc<T> {
    fn as_ref(&self) -> &T {
        self
    }
}

impl<T: Trace + ?Sized> Deref for Gc<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // The interpreter is single-threaded and only dereferences handles
        // that are reachable from its roots, which the collector never frees.
        unsafe { &self.ptr.as_ref().data }
    }
}

impl<T: Trace + ?Sized + Debug> Debug for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self.deref(), f)
    }
}

impl<T: Trace + ?Sized + Display> Display for Gc<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self.deref(), f)
    }
}

/// The object heap and its mark-and-sweep collector.
///
/// Allocation never collects on its own. The virtual machine checks
/// [`Heap::should_collect`] at the points where it allocates, marks its roots,
/// and calls [`Heap::collect`]; everything not reached from a root is freed.
/// The compiler allocates through the heap as well but never collects, so
/// objects created mid-compile stay alive until the program they belong to is
/// rooted and run.
pub struct Heap {
    objects: Option<NonNull<GcBox<dyn Trace>>>,
    gray: Vec<NonNull<GcBox<dyn Trace>>>,
    strings: Table,
    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            objects: None,
            gray: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: FIRST_GC_THRESHOLD,
        }
    }

    /// Move an object onto the heap, threading it into the object list.
    pub fn alloc<T: Trace>(&mut self, data: T) -> Gc<T> {
        let size = mem::size_of::<GcBox<T>>() + data.owned_bytes();
        let boxed = Box::new(GcBox {
            marked: Cell::new(false),
            size,
            next: Cell::new(self.objects),
            data,
        });
        let ptr = NonNull::from(Box::leak(boxed));
        let erased: NonNull<GcBox<dyn Trace>> = ptr;
        self.objects = Some(erased);
        self.bytes_allocated += size;
        Gc { ptr }
    }

    /// Get the canonical string object for the given content, allocating it
    /// if no live string with that content exists.
    pub fn intern(&mut self, chars: &str) -> Gc<ObjString> {
        let hash = object::hash_str(chars);
        if let Some(existing) = self.strings.find_string(chars, hash) {
            return existing;
        }
        let string = self.alloc(ObjString::new(chars.to_string()));
        self.strings.set(string, Value::Nil);
        string
    }

    /// Whether enough has been allocated since the last collection for
    /// another one to be worthwhile.
    pub fn should_collect(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Number of bytes currently charged against the collection threshold.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Mark an object as a root for the collection in progress.
    pub fn mark<T: Trace>(&mut self, obj: Gc<T>) {
        if obj.is_marked() {
            return;
        }
        obj.set_marked(true);
        let erased: NonNull<GcBox<dyn Trace>> = obj.ptr;
        self.gray.push(erased);
    }

    /// Mark the object a value references, if any.
    pub fn mark_value(&mut self, value: Value) {
        match value {
            Value::Nil | Value::Bool(_) | Value::Number(_) => {}
            Value::Str(s) => self.mark(s),
            Value::Fun(f) => self.mark(f),
            Value::NativeFun(f) => self.mark(f.name),
            Value::Closure(c) => self.mark(c),
            Value::Class(c) => self.mark(c),
            Value::Instance(i) => self.mark(i),
            Value::BoundMethod(b) => self.mark(b),
        }
    }

    /// Trace the marked roots, drop interner entries for unreachable strings,
    /// and free every object that was not reached.
    pub fn collect(&mut self) {
        self.trace_references();
        self.strings.remove_white();
        self.sweep();
        self.next_gc = self.bytes_allocated * GC_GROW_FACTOR;
    }

    fn trace_references(&mut self) {
        while let Some(ptr) = self.gray.pop() {
            // The gray object stays alive for the duration of the call. Its
            // trace only touches mark bits and the gray stack.
            let obj = unsafe { ptr.as_ref() };
            obj.data.trace(self);
        }
    }

    fn sweep(&mut self) {
        let mut prev: Option<NonNull<GcBox<dyn Trace>>> = None;
        let mut cur = self.objects;
        while let Some(ptr) = cur {
            let header = unsafe { ptr.as_ref() };
            let next = header.next.get();
            if header.marked.get() {
                header.marked.set(false);
                prev = Some(ptr);
            } else {
                match prev {
                    Some(p) => unsafe { p.as_ref() }.next.set(next),
                    None => self.objects = next,
                }
                self.bytes_allocated -= header.size;
                drop(unsafe { Box::from_raw(ptr.as_ptr()) });
            }
            cur = next;
        }
    }

    #[cfg(test)]
    fn object_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.objects;
        while let Some(ptr) = cur {
            count += 1;
            cur = unsafe { ptr.as_ref() }.next.get();
        }
        count
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let mut cur = self.objects;
        while let Some(ptr) = cur {
            cur = unsafe { ptr.as_ref() }.next.get();
            drop(unsafe { Box::from_raw(ptr.as_ptr()) });
        }
    }
}

impl Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("bytes_allocated", &self.bytes_allocated)
            .field("next_gc", &self.next_gc)
            .finish()
    }
}
