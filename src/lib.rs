//! Lock-free concurrent containers on top of a practical `Hazard Pointers` reclamation engine.
//!
//! [`Hazard Pointers`](http://www.cs.otago.ac.nz/cosc440/readings/hazard-pointers.pdf) let a
//! thread publish the address of a shared node before dereferencing it. A node removed from a
//! container is not freed at once but retired, and a retired node is reclaimed only when no
//! thread publishes its address. This avoids both use-after-free and the
//! [`ABA problem`](https://en.wikipedia.org/wiki/ABA_problem) without locks or reference
//! counting on the data path.
//!
//! The engine is `HazardManager`: a cheaply clonable handle owning a `HazardStorage`, the pool of
//! per-thread `HazardRegistry` slots. Containers of one kind share a manager, `HazardContext`
//! hands one out per tag type.
//!
//! Containers built on it:
//! - `ConcurrentSList`, the Harris & Michael lock-free singly-linked list, ordered or unordered;
//! - `ConcurrentQueue`, the Michael & Scott lock-free FIFO queue;
//! - `ConcurrentHashTable`, fixed buckets of ordered lists sharing one manager.
//!
//! ```
//! use rs_cds::concurrent_slist::ConcurrentSList;
//!
//! let list = ConcurrentSList::new();
//! for v in &[5, 3, 8, 1] {
//!     list.insert(*v, |a, b| a < b).unwrap();
//! }
//! assert_eq!(list.to_vec().unwrap(), vec![1, 3, 5, 8]);
//! ```

pub mod allocator;
pub mod concurrent_container;
pub mod concurrent_hashtable;
pub mod concurrent_queue;
pub mod concurrent_slist;
pub mod error;
pub mod hazard_context;
pub mod hazard_manager;
pub mod hazard_pointer;
pub mod hazard_registry;
pub mod hazard_storage;
pub mod spin_lock;
pub mod util;

#[macro_use]
extern crate log;

#[macro_use]
extern crate cfg_if;
