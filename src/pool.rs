//! Object pools: per-size caches of objects carved from contiguous page
//! groups (slabs).
//!
//! Each pool keeps full/partial/empty slab lists under its own spinlock. A
//! slab is one naturally-aligned page group: the descriptor and a free-index
//! stack at the head, then the objects, offset by a per-slab color so that
//! hot fields of objects in different slabs land in different cache sets.
//!
//! The constructor runs exactly once per object, when its slab is carved;
//! the destructor runs when the slab is released back to the page allocator.

use core::marker::PhantomData;
use core::mem;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{KernelError, Result};
use crate::kalloc::Kmem;
use crate::list::{List, ListEntry};
use crate::list_node;
use crate::lock::Spinlock;
use crate::page::{Page, PGSIZE};
use crate::param::ORDER_MAX;
use crate::println;

/// Grow to a bigger page group until a slab holds at least this many
/// objects (or the group hits `ORDER_MAX`).
const MIN_SLAB_CAP: usize = 8;

/// Geometry of one slab of a pool: page-group order, objects per slab, and
/// the bound on the coloring offset.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SlabLayout {
    pub order: usize,
    pub capacity: usize,
    pub color_max: usize,
}

const fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

/// Bytes of slab descriptor + free-index stack, padded so the first object
/// lands on an `align` boundary.
fn header_bytes(capacity: usize, align: usize) -> usize {
    round_up(
        mem::size_of::<Slab>() + capacity * mem::size_of::<u16>(),
        align.max(mem::align_of::<usize>()),
    )
}

impl SlabLayout {
    /// Solves the slab geometry for one object size. Internal fragmentation
    /// is bounded by growing the page group until `MIN_SLAB_CAP` objects
    /// fit; whatever space is left over funds the coloring offsets.
    pub fn compute(obj_size: usize, align: usize) -> SlabLayout {
        let align = align.max(1);
        let obj = round_up(obj_size.max(1), align);
        for order in 0..=ORDER_MAX {
            let space = PGSIZE << order;
            let mut capacity = space / (obj + mem::size_of::<u16>());
            while capacity > 0 && header_bytes(capacity, align) + capacity * obj > space {
                capacity -= 1;
            }
            if capacity >= MIN_SLAB_CAP || (order == ORDER_MAX && capacity > 0) {
                let leftover = space - header_bytes(capacity, align) - capacity * obj;
                return SlabLayout {
                    order,
                    capacity,
                    color_max: leftover - leftover % align,
                };
            }
        }
        panic!("pool: object of {} bytes does not fit any slab", obj_size);
    }
}

/// Descriptor at the head of every slab page group. The free-index stack
/// (`capacity` u16 entries) follows it directly.
struct Slab {
    link: ListEntry,
    /// First object's address (header + this slab's color already applied).
    objs: usize,
    inuse: usize,
    /// Number of free indices on the stack.
    free_top: usize,
}

list_node!(Slab, link);

impl Slab {
    fn stack(&self) -> *mut u16 {
        (self as *const Slab as usize + mem::size_of::<Slab>()) as *mut u16
    }
}

struct PoolInner {
    layout: SlabLayout,
    partial: List<Slab>,
    full: List<Slab>,
    empty: List<Slab>,
    /// Next slab's coloring offset.
    color_next: usize,
}

/// Registry entry so `dump` can walk every pool in the system.
pub struct PoolHeader {
    link: ListEntry,
    name: &'static str,
    obj_size: usize,
    slabs: AtomicUsize,
    live: AtomicUsize,
}

list_node!(PoolHeader, link);

static POOLS: Spinlock<List<PoolHeader>> = Spinlock::new("pools", unsafe { List::new() });

/// A named cache of `T`-sized objects.
pub struct Pool<T> {
    header: PoolHeader,
    inner: Spinlock<PoolInner>,
    ctor: Option<fn(*mut T)>,
    dtor: Option<fn(*mut T)>,
    _marker: PhantomData<T>,
}

unsafe impl<T> Sync for Pool<T> {}

impl<T> Pool<T> {
    /// # Safety
    ///
    /// Call `init` before the first `get`.
    pub const unsafe fn new(
        name: &'static str,
        ctor: Option<fn(*mut T)>,
        dtor: Option<fn(*mut T)>,
    ) -> Self {
        Self {
            header: PoolHeader {
                link: unsafe { ListEntry::new() },
                name,
                obj_size: mem::size_of::<T>(),
                slabs: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
            },
            inner: Spinlock::new(
                "pool",
                PoolInner {
                    layout: SlabLayout {
                        order: 0,
                        capacity: 0,
                        color_max: 0,
                    },
                    partial: unsafe { List::new() },
                    full: unsafe { List::new() },
                    empty: unsafe { List::new() },
                    color_next: 0,
                },
            ),
            ctor,
            dtor,
            _marker: PhantomData,
        }
    }

    /// Solves the layout and links the pool into the global inventory.
    pub fn init(&'static self) {
        let mut inner = self.inner.lock();
        inner.layout = SlabLayout::compute(mem::size_of::<T>(), mem::align_of::<T>());
        inner.partial.init();
        inner.full.init();
        inner.empty.init();
        drop(inner);

        self.header.link.init();
        let pools = POOLS.lock();
        pools.init();
        pools.push_back(&self.header);
    }

    fn group_bytes(layout: &SlabLayout) -> usize {
        PGSIZE << layout.order
    }

    /// Takes a free object, growing the pool by one slab if every existing
    /// slab is full.
    pub fn get(&self, kmem: &Spinlock<Kmem>) -> Result<*mut T> {
        let mut inner = self.inner.lock();
        assert!(inner.layout.capacity > 0, "pool {} not initialized", self.header.name);

        let slab = match inner.partial.front().or_else(|| inner.empty.front()) {
            Some(s) => s as *mut Slab,
            None => self.grow(&mut inner, kmem)?,
        };

        let layout = inner.layout;
        unsafe {
            debug_assert!((*slab).free_top > 0, "pool {}: empty free stack", self.header.name);
            (*slab).free_top -= 1;
            let idx = (*slab).stack().add((*slab).free_top).read() as usize;
            let obj = ((*slab).objs + idx * round_up(self.header.obj_size, mem::align_of::<T>()))
                as *mut T;
            (*slab).inuse += 1;

            (*slab).link.remove();
            if (*slab).inuse == layout.capacity {
                inner.full.push_back(&*slab);
            } else {
                inner.partial.push_back(&*slab);
            }
            let _ = self.header.live.fetch_add(1, Ordering::Relaxed);
            Ok(obj)
        }
    }

    /// Returns an object to its owning slab.
    pub fn put(&self, obj: *mut T) {
        let inner = self.inner.lock();
        let layout = inner.layout;
        let group = Self::group_bytes(&layout);
        let slab = ((obj as usize) & !(group - 1)) as *mut Slab;
        unsafe {
            let idx = (obj as usize - (*slab).objs)
                / round_up(self.header.obj_size, mem::align_of::<T>());
            debug_assert!(idx < layout.capacity, "pool {}: bad put", self.header.name);
            (*slab).stack().add((*slab).free_top).write(idx as u16);
            (*slab).free_top += 1;
            (*slab).inuse -= 1;

            (*slab).link.remove();
            if (*slab).inuse == 0 {
                inner.empty.push_back(&*slab);
            } else {
                inner.partial.push_back(&*slab);
            }
        }
        let _ = self.header.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Carves a new slab out of a fresh page group.
    fn grow(&self, inner: &mut PoolInner, kmem: &Spinlock<Kmem>) -> Result<*mut Slab> {
        let layout = inner.layout;
        let page = kmem
            .lock()
            .alloc_order(layout.order)
            .ok_or(KernelError::NoMem)?;
        let base = page.into_usize();

        let color = inner.color_next;
        inner.color_next = if inner.color_next + mem::align_of::<T>() > layout.color_max {
            0
        } else {
            inner.color_next + mem::align_of::<T>()
        };

        let slab = base as *mut Slab;
        let objs = base + header_bytes(layout.capacity, mem::align_of::<T>()) + color;
        unsafe {
            (*slab).link = ListEntry::new();
            (*slab).link.init();
            (*slab).objs = objs;
            (*slab).inuse = 0;
            (*slab).free_top = layout.capacity;
            for i in 0..layout.capacity {
                (*slab).stack().add(i).write(i as u16);
            }
            if let Some(ctor) = self.ctor {
                let stride = round_up(self.header.obj_size, mem::align_of::<T>());
                for i in 0..layout.capacity {
                    ctor((objs + i * stride) as *mut T);
                }
            }
            inner.empty.push_back(&*slab);
        }
        let _ = self.header.slabs.fetch_add(1, Ordering::Relaxed);
        Ok(slab)
    }

    /// Returns every fully free slab to the page allocator, running the
    /// destructor over its objects.
    pub fn reap(&self, kmem: &Spinlock<Kmem>) {
        let inner = self.inner.lock();
        let layout = inner.layout;
        while let Some(slab) = inner.empty.pop_front() {
            let slab = slab as *mut Slab;
            unsafe {
                if let Some(dtor) = self.dtor {
                    let stride = round_up(self.header.obj_size, mem::align_of::<T>());
                    for i in 0..layout.capacity {
                        dtor(((*slab).objs + i * stride) as *mut T);
                    }
                }
                let group = (slab as usize) & !(Self::group_bytes(&layout) - 1);
                kmem.lock().free(Page::from_usize(group, layout.order));
            }
            let _ = self.header.slabs.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Tears the pool down. Fails while any object is still live.
    pub fn destroy(&self, kmem: &Spinlock<Kmem>) -> Result<()> {
        if self.header.live.load(Ordering::Relaxed) > 0 {
            return Err(KernelError::Inval);
        }
        self.reap(kmem);
        let _pools = POOLS.lock();
        self.header.link.remove();
        Ok(())
    }

    pub fn live(&self) -> usize {
        self.header.live.load(Ordering::Relaxed)
    }

    pub fn slabs(&self) -> usize {
        self.header.slabs.load(Ordering::Relaxed)
    }
}

/// Prints one line per pool: the slabinfo of this kernel.
pub fn dump() {
    let pools = POOLS.lock();
    pools.init();
    println!("pool          objsize  slabs  live");
    // SAFETY: registered pools are 'static and the registry lock is held.
    unsafe {
        for p in pools.iter_unchecked() {
            println!(
                "{:<12} {:>8} {:>6} {:>5}",
                p.name,
                p.obj_size,
                p.slabs.load(Ordering::Relaxed),
                p.live.load(Ordering::Relaxed),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kalloc::tests::test_kmem;
    use core::sync::atomic::AtomicUsize;

    #[test]
    fn layout_bounds_fragmentation() {
        for &(size, align) in &[(8usize, 8usize), (24, 8), (64, 8), (200, 8), (1024, 1024)] {
            let l = SlabLayout::compute(size, align);
            assert!(l.capacity >= 1);
            let space = PGSIZE << l.order;
            let obj = round_up(size, align);
            assert!(header_bytes(l.capacity, align) + l.capacity * obj + l.color_max <= space);
            if l.order < ORDER_MAX {
                assert!(l.capacity >= MIN_SLAB_CAP);
            }
        }
    }

    #[test]
    fn layout_grows_the_group_for_big_objects() {
        let l = SlabLayout::compute(5000, 8);
        assert!(l.order > 0);
        assert!(l.capacity >= 1);
    }

    #[test]
    fn coloring_steps_and_wraps() {
        let l = SlabLayout::compute(64, 8);
        assert!(l.color_max % 8 == 0);
        // The stagger sequence 0, 8, 16, ... stays within color_max.
        let mut color = 0;
        for _ in 0..1000 {
            assert!(color <= l.color_max);
            color = if color + 8 > l.color_max { 0 } else { color + 8 };
        }
    }

    #[repr(C)]
    struct Obj {
        a: u64,
        b: u64,
    }

    static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

    fn obj_ctor(o: *mut Obj) {
        let _ = CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        unsafe { (*o).a = 0xdead };
    }

    #[test]
    fn get_put_reap_cycle() {
        let kmem = Box::leak(Box::new(Spinlock::new("kmem", test_kmem(32))));
        let pool: &'static Pool<Obj> =
            Box::leak(Box::new(unsafe { Pool::new("obj", Some(obj_ctor), None) }));
        pool.init();

        let before = CTOR_RUNS.load(Ordering::Relaxed);
        let a = pool.get(kmem).unwrap();
        let cap = pool
            .inner
            .lock()
            .layout
            .capacity;
        // The constructor ran once for every object in the new slab.
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed) - before, cap);
        assert_eq!(unsafe { (*a).a }, 0xdead);

        let b = pool.get(kmem).unwrap();
        assert_ne!(a, b);
        assert_eq!(pool.live(), 2);

        // Fill one whole slab; the pool must grow a second one.
        let mut held = std::vec![a, b];
        while pool.slabs() == 1 {
            held.push(pool.get(kmem).unwrap());
        }
        assert!(pool.slabs() >= 2);

        for o in held.drain(..) {
            pool.put(o);
        }
        assert_eq!(pool.live(), 0);

        let free_before = kmem.lock().free_pages();
        pool.reap(kmem);
        assert_eq!(pool.slabs(), 0);
        assert!(kmem.lock().free_pages() > free_before);

        assert!(pool.destroy(kmem).is_ok());
    }

    #[test]
    fn destroy_fails_with_live_objects() {
        let kmem = Box::leak(Box::new(Spinlock::new("kmem", test_kmem(16))));
        let pool: &'static Pool<Obj> = Box::leak(Box::new(unsafe { Pool::new("obj2", None, None) }));
        pool.init();
        let o = pool.get(kmem).unwrap();
        assert_eq!(pool.destroy(kmem), Err(KernelError::Inval));
        pool.put(o);
        assert!(pool.destroy(kmem).is_ok());
    }
}
