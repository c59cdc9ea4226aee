//! Harris & Michael lock-free singly-linked list.
//!
//! The list runs from a head sentinel to a tail sentinel, both owned by the list. A node is
//! removed in two steps: first its own `next` word gets the deletion mark (the linearization
//! point of the removal), then the predecessor is swung past it. Any traversal that meets a
//! marked node finishes the second step, and whichever thread unlinks a node retires it.
//!
//! Traversal keeps two hazard pointers, on the predecessor and on the current node. The current
//! node is known to be safe once the predecessor's link still refers to it, unmarked, after the
//! hazard pointer was published.

use crate::allocator::{GlobalNodeAllocator, NodeAllocator};
use crate::concurrent_container::{self, ConcurrentContainer};
use crate::error::Result;
use crate::hazard_manager::{HazardManager, ThreadRecord};
use crate::hazard_pointer::HazardPointer;
use crate::util::{self, WrappedAlign64Type};
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::rc::Rc;
use std::result;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(C)]
struct Link {
    next: AtomicUsize,
}

impl Link {
    fn new(next: usize) -> Link {
        Link {
            next: AtomicUsize::new(next),
        }
    }
}

// `link` goes first: a node pointer doubles as a pointer to its link.
#[repr(C)]
struct SListNode<T> {
    link: Link,
    id: u64,
    value: T,
}

/// Identifies one node of a list for `erase` and `pop`. References never repeat within a run,
/// so a stale reference matches nothing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeReference {
    id: u64,
}

impl NodeReference {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }
}

// A predecessor/current pair found by `search`, with the hazard pointers keeping both alive.
struct Window<T> {
    prev: *const Link,
    curr: *mut SListNode<T>,
    hp_prev: HazardPointer<SListNode<T>>,
    // Held until the window is dropped.
    _hp_curr: HazardPointer<SListNode<T>>,
}

pub struct ConcurrentSList<T, A: NodeAllocator = GlobalNodeAllocator> {
    head: Box<WrappedAlign64Type<Link>>,
    tail: Box<Link>,
    // The last node pushed, or the head sentinel. Cleared from a node before it is retired.
    last: WrappedAlign64Type<AtomicUsize>,
    container: ConcurrentContainer<SListNode<T>, A>,
    _marker: PhantomData<*mut SListNode<T>>,
}

unsafe impl<T: Send, A: NodeAllocator> Send for ConcurrentSList<T, A> {}

unsafe impl<T: Send + Sync, A: NodeAllocator> Sync for ConcurrentSList<T, A> {}

impl<T: Send + 'static> Default for ConcurrentSList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> ConcurrentSList<T> {
    /// List with its own hazard manager.
    pub fn new() -> Self {
        Self::with_manager(HazardManager::new())
    }
}

impl<T, A: NodeAllocator> ConcurrentSList<T, A> {
    #[inline]
    fn head_link(&self) -> *const Link {
        &self.head.0
    }

    #[inline]
    fn head_addr(&self) -> usize {
        self.head_link() as usize
    }

    #[inline]
    fn tail_addr(&self) -> usize {
        &*self.tail as *const Link as usize
    }

    #[inline]
    pub fn manager(&self) -> &HazardManager {
        self.container.manager()
    }
}

impl<T: Send + 'static, A: NodeAllocator> ConcurrentSList<T, A> {
    /// List whose retired nodes go to `manager`. Lists of one kind usually share a manager.
    pub fn with_manager(manager: HazardManager) -> Self {
        let tail = Box::new(Link::new(0));
        let head = Box::new(WrappedAlign64Type(Link::new(
            &*tail as *const Link as usize,
        )));
        let head_addr = &head.0 as *const Link as usize;
        ConcurrentSList {
            head,
            tail,
            last: WrappedAlign64Type(AtomicUsize::new(head_addr)),
            container: ConcurrentContainer::new(manager),
            _marker: PhantomData,
        }
    }

    fn make_node(&self, value: T) -> Result<(*mut SListNode<T>, u64)> {
        let id = concurrent_container::next_node_id();
        let node = self.container.make_node(SListNode {
            link: Link::new(0),
            id,
            value,
        })?;
        Ok((node, id))
    }

    // Runs after the node is unreachable from head.
    fn retire_unlinked(&self, node: *mut SListNode<T>) {
        let _ = self.last.compare_exchange(
            node as usize,
            self.head_addr(),
            Ordering::SeqCst,
            Ordering::Relaxed,
        );
        if let Err(status) = unsafe { self.container.retire_node(node) } {
            warn!("failed to retire list node {:p}: {}", node, status);
        }
    }

    // Find the first unmarked node `stop` accepts, unlinking every marked node on the way.
    // `curr` is the tail sentinel when none is accepted.
    fn search<F>(&self, record: &Rc<ThreadRecord>, stop: F) -> Result<Window<T>>
    where
        F: FnMut(&SListNode<T>) -> bool,
    {
        self.search_with_restart(record, stop, || ())
    }

    // As `search`; `restart` runs each time the walk goes back to head.
    fn search_with_restart<F, R>(
        &self,
        record: &Rc<ThreadRecord>,
        mut stop: F,
        mut restart: R,
    ) -> Result<Window<T>>
    where
        F: FnMut(&SListNode<T>) -> bool,
        R: FnMut(),
    {
        let head = self.head_link();
        let tail = self.tail_addr();
        let mut hp_prev = HazardPointer::empty(record);
        let mut hp_curr = HazardPointer::empty(record);
        'retry: loop {
            let mut prev = head;
            let mut curr = unsafe { (*prev).next.load(Ordering::Acquire) };
            loop {
                if curr == tail {
                    return Ok(Window {
                        prev,
                        curr: curr as *mut SListNode<T>,
                        hp_prev,
                        _hp_curr: hp_curr,
                    });
                }
                let node = curr as *mut SListNode<T>;
                hp_curr.mark(node)?;
                if unsafe { (*prev).next.load(Ordering::Acquire) } != curr {
                    restart();
                    continue 'retry;
                }
                let next = unsafe { (*node).link.next.load(Ordering::Acquire) };
                if util::is_marked(next) {
                    let succ = util::unmarked(next);
                    let unlinked = unsafe {
                        (*prev).next.compare_exchange(
                            curr,
                            succ,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                    };
                    if unlinked.is_err() {
                        restart();
                        continue 'retry;
                    }
                    self.retire_unlinked(node);
                    curr = succ;
                } else {
                    if stop(unsafe { &*node }) {
                        return Ok(Window {
                            prev,
                            curr: node,
                            hp_prev,
                            _hp_curr: hp_curr,
                        });
                    }
                    prev = node as *const Link;
                    mem::swap(&mut hp_prev, &mut hp_curr);
                    curr = next;
                }
            }
        }
    }

    fn link_before(&self, window: &Window<T>, node: *mut SListNode<T>) -> bool {
        unsafe {
            (*node)
                .link
                .next
                .store(window.curr as usize, Ordering::Relaxed);
            (*window.prev)
                .next
                .compare_exchange(
                    window.curr as usize,
                    node as usize,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
        }
    }

    /// Insert `value` before the first node `n` for which `less(value, n)`; into a list kept
    /// sorted by `less` this is an ordered insert placing `value` after its equivalents.
    pub fn insert<F>(&self, value: T, mut less: F) -> Result<NodeReference>
    where
        F: FnMut(&T, &T) -> bool,
    {
        let record = self.container.local()?;
        let (node, id) = self.make_node(value)?;
        loop {
            let window =
                match self.search(&record, |n| less(unsafe { &(*node).value }, &n.value)) {
                    Ok(window) => window,
                    Err(status) => {
                        unsafe { self.container.delete_node(node) };
                        return Err(status);
                    }
                };
            if self.link_before(&window, node) {
                return Ok(NodeReference { id });
            }
        }
    }

    /// Ordered insert that refuses `value` if an equivalent one is present. The refused value
    /// is given back as `Ok(Err(value))`.
    pub fn insert_unique<F>(
        &self,
        value: T,
        mut less: F,
    ) -> Result<result::Result<NodeReference, T>>
    where
        F: FnMut(&T, &T) -> bool,
    {
        let record = self.container.local()?;
        let tail = self.tail_addr();
        let (node, id) = self.make_node(value)?;
        loop {
            let window =
                match self.search(&record, |n| !less(&n.value, unsafe { &(*node).value })) {
                    Ok(window) => window,
                    Err(status) => {
                        unsafe { self.container.delete_node(node) };
                        return Err(status);
                    }
                };
            if window.curr as usize != tail
                && unsafe { !less(&(*node).value, &(*window.curr).value) }
            {
                let value = unsafe { ptr::read(&(*node).value) };
                unsafe { self.container.deallocate_node(node) };
                return Ok(Err(value));
            }
            if self.link_before(&window, node) {
                return Ok(Ok(NodeReference { id }));
            }
        }
    }

    /// Append `value` at the end, starting from the node pushed last.
    pub fn push_back(&self, value: T) -> Result<NodeReference> {
        let record = self.container.local()?;
        let (node, id) = self.make_node(value)?;
        let hp_node = match HazardPointer::new(&record, node) {
            Ok(hp) => hp,
            Err(status) => {
                unsafe { self.container.delete_node(node) };
                return Err(status);
            }
        };
        if let Err(status) = self.link_back(&record, node) {
            drop(hp_node);
            unsafe { self.container.delete_node(node) };
            return Err(status);
        }

        self.last.store(node as usize, Ordering::SeqCst);
        // A removal that finished before the store above could not clear the hint.
        if util::is_marked(unsafe { (*node).link.next.load(Ordering::SeqCst) }) {
            let _ = self.last.compare_exchange(
                node as usize,
                self.head_addr(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            );
        }
        drop(hp_node);
        Ok(NodeReference { id })
    }

    fn link_back(&self, record: &Rc<ThreadRecord>, node: *mut SListNode<T>) -> Result<()> {
        let tail = self.tail_addr();
        unsafe { (*node).link.next.store(tail, Ordering::Relaxed) };
        loop {
            let (prev, _hp_prev) = match self.end_from_hint(record)? {
                Some(end) => end,
                None => {
                    let window = self.search(record, |_| false)?;
                    (window.prev, window.hp_prev)
                }
            };
            let linked = unsafe {
                (*prev).next.compare_exchange(
                    tail,
                    node as usize,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
            };
            if linked.is_ok() {
                return Ok(());
            }
        }
    }

    // Walk from the hint to the node before the tail sentinel. `None` if a marked node is met.
    fn end_from_hint(
        &self,
        record: &Rc<ThreadRecord>,
    ) -> Result<Option<(*const Link, HazardPointer<SListNode<T>>)>> {
        let tail = self.tail_addr();
        let mut hp_prev = HazardPointer::empty(record);
        let mut hp_curr = HazardPointer::empty(record);
        let mut prev = hp_prev.protect_link(&self.last)? as *const Link;
        loop {
            let next = unsafe { (*prev).next.load(Ordering::Acquire) };
            if util::is_marked(next) {
                return Ok(None);
            }
            if next == tail {
                return Ok(Some((prev, hp_prev)));
            }
            hp_curr.mark(next as *mut SListNode<T>)?;
            if unsafe { (*prev).next.load(Ordering::Acquire) } != next {
                continue;
            }
            prev = next as *const Link;
            mem::swap(&mut hp_prev, &mut hp_curr);
        }
    }

    // Remove the first node `stop` accepts; `extract` runs on it once this thread has marked it.
    fn remove_first<F, G, R>(
        &self,
        record: &Rc<ThreadRecord>,
        mut stop: F,
        extract: G,
    ) -> Result<Option<R>>
    where
        F: FnMut(&SListNode<T>) -> bool,
        G: FnOnce(&SListNode<T>) -> R,
    {
        let tail = self.tail_addr();
        loop {
            let window = self.search(record, &mut stop)?;
            let node = window.curr;
            if node as usize == tail {
                return Ok(None);
            }
            let next = unsafe { (*node).link.next.load(Ordering::Acquire) };
            if util::is_marked(next) {
                continue;
            }
            let marked = unsafe {
                (*node).link.next.compare_exchange(
                    next,
                    util::marked(next),
                    Ordering::SeqCst,
                    Ordering::Acquire,
                )
            };
            if marked.is_err() {
                continue;
            }
            let removed = extract(unsafe { &*node });
            let unlinked = unsafe {
                (*window.prev).next.compare_exchange(
                    node as usize,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
            };
            if unlinked.is_ok() {
                self.retire_unlinked(node);
            } else {
                drop(window);
                // The traversal unlinks the node it meets marked.
                if let Err(status) = self.search(record, &mut stop) {
                    debug!("list node {:p} left marked: {}", node, status);
                }
            }
            return Ok(Some(removed));
        }
    }

    /// Remove the node `reference` designates. `Ok(false)` if it is not in the list anymore.
    pub fn erase(&self, reference: NodeReference) -> Result<bool> {
        let record = self.container.local()?;
        let removed = self.remove_first(&record, |n| reference.id == n.id, |_| ())?;
        Ok(removed.is_some())
    }

    /// Remove the first element `pred` accepts.
    pub fn erase_if<F>(&self, mut pred: F) -> Result<bool>
    where
        F: FnMut(&T) -> bool,
    {
        let record = self.container.local()?;
        let removed = self.remove_first(&record, |n| pred(&n.value), |_| ())?;
        Ok(removed.is_some())
    }

    /// Remove every element `pred` accepts. Returns the count removed by this call.
    pub fn remove_if<F>(&self, mut pred: F) -> Result<usize>
    where
        F: FnMut(&T) -> bool,
    {
        let record = self.container.local()?;
        let mut count = 0;
        while self
            .remove_first(&record, |n| pred(&n.value), |_| ())?
            .is_some()
        {
            count += 1;
        }
        Ok(count)
    }

    /// Element count of one pass from head to tail; exact only without concurrent writers.
    pub fn size(&self) -> Result<usize> {
        let record = self.container.local()?;
        let count = Cell::new(0);
        self.search_with_restart(
            &record,
            |_| {
                count.set(count.get() + 1);
                false
            },
            || count.set(0),
        )?;
        Ok(count.get())
    }

    pub fn empty(&self) -> Result<bool> {
        let record = self.container.local()?;
        let window = self.search(&record, |_| true)?;
        Ok(window.curr as usize == self.tail_addr())
    }
}

impl<T: Clone + Send + 'static, A: NodeAllocator> ConcurrentSList<T, A> {
    /// The first element `pred` accepts, with the reference of its node.
    pub fn find_if<F>(&self, mut pred: F) -> Result<Option<(T, NodeReference)>>
    where
        F: FnMut(&T) -> bool,
    {
        let record = self.container.local()?;
        let window = self.search(&record, |n| pred(&n.value))?;
        if window.curr as usize == self.tail_addr() {
            return Ok(None);
        }
        let node = unsafe { &*window.curr };
        Ok(Some((node.value.clone(), NodeReference { id: node.id })))
    }

    /// Remove the node `reference` designates and return a copy of its value.
    pub fn pop(&self, reference: NodeReference) -> Result<Option<T>> {
        let record = self.container.local()?;
        self.remove_first(&record, |n| reference.id == n.id, |n| n.value.clone())
    }

    /// Remove the first element `pred` accepts and return a copy of it.
    pub fn pop_if<F>(&self, mut pred: F) -> Result<Option<T>>
    where
        F: FnMut(&T) -> bool,
    {
        let record = self.container.local()?;
        self.remove_first(&record, |n| pred(&n.value), |n| n.value.clone())
    }

    /// Elements met by one pass from head to tail, in list order. A pass that has to go back
    /// to head drops what it gathered and starts over.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let record = self.container.local()?;
        let values = RefCell::new(Vec::new());
        self.search_with_restart(
            &record,
            |n| {
                values.borrow_mut().push(n.value.clone());
                false
            },
            || values.borrow_mut().clear(),
        )?;
        Ok(values.into_inner())
    }

    /// Call `f` on every element of `to_vec`, in list order.
    pub fn for_each<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&T),
    {
        self.to_vec()?.iter().for_each(f);
        Ok(())
    }
}

impl<T, A: NodeAllocator> Drop for ConcurrentSList<T, A> {
    fn drop(&mut self) {
        let tail = self.tail_addr();
        let mut curr = util::unmarked(self.head.next.load(Ordering::Relaxed));
        while curr != tail {
            let node = curr as *mut SListNode<T>;
            curr = util::unmarked(unsafe { (*node).link.next.load(Ordering::Relaxed) });
            unsafe { self.container.delete_node(node) };
        }
    }
}

#[cfg(test)]
mod test {
    use crate::concurrent_slist::ConcurrentSList;
    use crate::hazard_manager::{HazardConfig, HazardManager};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn less(a: &i32, b: &i32) -> bool {
        a < b
    }

    #[test]
    fn test_ordered_insert() {
        let list = ConcurrentSList::new();
        assert!(list.empty().unwrap());
        for v in &[5, 3, 8, 1] {
            list.insert(*v, less).unwrap();
        }
        assert_eq!(list.to_vec().unwrap(), vec![1, 3, 5, 8]);
        assert_eq!(list.size().unwrap(), 4);
        assert!(!list.empty().unwrap());
    }

    #[test]
    fn test_equivalents_keep_insertion_order() {
        let list = ConcurrentSList::new();
        list.insert((1, 'a'), |a, b| a.0 < b.0).unwrap();
        list.insert((0, 'b'), |a, b| a.0 < b.0).unwrap();
        list.insert((1, 'c'), |a, b| a.0 < b.0).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![(0, 'b'), (1, 'a'), (1, 'c')]);
    }

    #[test]
    fn test_insert_unique() {
        let list = ConcurrentSList::new();
        assert!(list.insert_unique(2, less).unwrap().is_ok());
        assert!(list.insert_unique(1, less).unwrap().is_ok());
        assert_eq!(list.insert_unique(2, less).unwrap().err(), Some(2));
        assert!(list.insert_unique(3, less).unwrap().is_ok());
        assert_eq!(list.to_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_erase_pop() {
        let list = ConcurrentSList::new();
        let r5 = list.insert(5, less).unwrap();
        let r3 = list.insert(3, less).unwrap();
        let r8 = list.insert(8, less).unwrap();
        assert_ne!(r5, r3);

        assert!(list.erase(r3).unwrap());
        assert!(!list.erase(r3).unwrap());
        assert_eq!(list.pop(r8).unwrap(), Some(8));
        assert_eq!(list.pop(r8).unwrap(), None);
        assert_eq!(list.to_vec().unwrap(), vec![5]);
        assert!(list.erase(r5).unwrap());
        assert!(list.empty().unwrap());
    }

    #[test]
    fn test_find_if() {
        let list = ConcurrentSList::new();
        for v in 0..10 {
            list.push_back(v).unwrap();
        }
        let (v, reference) = list.find_if(|v| *v > 6).unwrap().unwrap();
        assert_eq!(v, 7);
        assert!(list.find_if(|v| *v > 60).unwrap().is_none());
        assert_eq!(list.pop(reference).unwrap(), Some(7));
        assert_eq!(list.find_if(|v| *v > 6).unwrap().map(|(v, _)| v), Some(8));
    }

    #[test]
    fn test_remove_if() {
        let list = ConcurrentSList::new();
        for v in 0..100 {
            list.push_back(v).unwrap();
        }
        assert_eq!(list.remove_if(|v| v % 2 == 0).unwrap(), 50);
        assert_eq!(list.remove_if(|v| v % 2 == 0).unwrap(), 0);
        assert_eq!(
            list.to_vec().unwrap(),
            (0..100).filter(|v| v % 2 == 1).collect::<Vec<_>>()
        );
        assert!(list.erase_if(|v| *v == 51).unwrap());
        assert!(!list.erase_if(|v| *v == 51).unwrap());
        assert_eq!(list.pop_if(|v| *v > 90).unwrap(), Some(91));
    }

    #[test]
    fn test_push_back_after_erasing_last() {
        let list = ConcurrentSList::new();
        list.push_back(1).unwrap();
        list.push_back(2).unwrap();
        let r3 = list.push_back(3).unwrap();
        assert!(list.erase(r3).unwrap());
        list.push_back(4).unwrap();
        let r5 = list.push_back(5).unwrap();
        list.insert(0, less).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![0, 1, 2, 4, 5]);
        assert_eq!(list.pop(r5).unwrap(), Some(5));
        assert!(list.empty().is_ok());
        list.remove_if(|_| true).unwrap();
        list.push_back(6).unwrap();
        assert_eq!(list.to_vec().unwrap(), vec![6]);
    }

    #[test]
    fn test_for_each() {
        let list = ConcurrentSList::new();
        for v in &["a", "b", "c"] {
            list.push_back(v.to_string()).unwrap();
        }
        let mut joined = String::new();
        list.for_each(|v| joined.push_str(v)).unwrap();
        assert_eq!(joined, "abc");
    }

    struct Tracked {
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_drop_and_reclaim() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let manager = HazardManager::with_config(
            HazardConfig::default()
                .retire_threshold(1_000)
                .scan_period_us(1_000_000_000),
        )
        .unwrap();
        let list: ConcurrentSList<Tracked> = ConcurrentSList::with_manager(manager.clone());
        let refs: Vec<_> = (0..10)
            .map(|_| {
                list.push_back(Tracked {
                    dropped: dropped.clone(),
                })
                .unwrap()
            })
            .collect();
        for r in &refs[..4] {
            assert!(list.erase(*r).unwrap());
        }
        // Retired, not reclaimed yet
        assert_eq!(dropped.load(Ordering::SeqCst), 0);
        assert_eq!(manager.pending_count(), 4);
        drop(list);
        assert_eq!(dropped.load(Ordering::SeqCst), 6);
        assert_eq!(manager.reclaim().unwrap(), 4);
        assert_eq!(dropped.load(Ordering::SeqCst), 10);
    }
}
