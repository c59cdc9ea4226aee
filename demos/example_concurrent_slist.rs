extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_cds;

use rs_cds::concurrent_slist::ConcurrentSList;
use rs_cds::hazard_context::HazardContext;
use rs_cds::util;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

const KEY_RANGE: u64 = 1024;

struct ListTag;

struct GlobalControl {
    list: ConcurrentSList<u64>,
    write_loops: i64,
    stop: AtomicBool,
    inserted: AtomicI64,
    erased: AtomicI64,
    read_loops: AtomicI64,
}

fn set_cpu_affinity() {
    let cpus = core_affinity::get_core_ids().unwrap();
    core_affinity::set_for_current(cpus[util::get_thread_id() as usize % cpus.len()]);
    info!(
        "set_cpu_affinity {} {}",
        util::get_thread_id(),
        util::get_thread_id() as usize % cpus.len()
    );
}

fn less(a: &u64, b: &u64) -> bool {
    a < b
}

fn writer_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    let seed = util::get_thread_id() as u64;
    let mut inserted = 0;
    let mut erased = 0;
    for i in 0..global_control.write_loops as u64 {
        let key = (i * 7 + seed * 13) % KEY_RANGE;
        let reference = global_control.list.insert(key, less).unwrap();
        inserted += 1;
        if 0 != i % 4 && global_control.list.erase(reference).unwrap() {
            erased += 1;
        }
    }
    global_control.inserted.fetch_add(inserted, Ordering::Relaxed);
    global_control.erased.fetch_add(erased, Ordering::Relaxed);
}

fn reader_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    let mut read_loops = 0;
    let mut key = util::get_thread_id() as u64;
    while !global_control.stop.load(Ordering::Acquire) {
        key = (key + 1) % KEY_RANGE;
        if let Some((v, _)) = global_control.list.find_if(|v| *v >= key).unwrap() {
            assert!(v >= key && v < KEY_RANGE);
        }
        read_loops += 1;
    }
    global_control
        .read_loops
        .fetch_add(read_loops, Ordering::Relaxed);
}

fn main() {
    let start = SystemTime::now();
    thread::spawn(|| {
        test_multi_threads();
    })
    .join()
    .unwrap();
    let end = SystemTime::now();
    let cost = {
        let t = end.duration_since(start).unwrap();
        t.subsec_millis() as u64 + t.as_secs() * 1000
    };
    println!("time cost {} ms", cost);
}

fn test_multi_threads() {
    env_logger::init();

    let cpu_count = core_affinity::get_core_ids().unwrap().len() as i64;
    let writer_count = (cpu_count + 1) / 2;
    let reader_count = (cpu_count - writer_count).max(1);
    info!("writer_count {} reader_count {}", writer_count, reader_count);

    let context = HazardContext::default();
    let global_control = Arc::new(GlobalControl {
        list: ConcurrentSList::with_manager(context.manager::<ListTag>()),
        write_loops: 20_000,
        stop: AtomicBool::new(false),
        inserted: AtomicI64::new(0),
        erased: AtomicI64::new(0),
        read_loops: AtomicI64::new(0),
    });

    let reader_threads: Vec<_> = (0..reader_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || reader_thread(global_control))
        })
        .collect();
    let writer_threads: Vec<_> = (0..writer_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || writer_thread(global_control))
        })
        .collect();

    for t in writer_threads {
        t.join().unwrap();
    }
    info!("writer_threads joined");
    global_control.stop.store(true, Ordering::Release);
    for t in reader_threads {
        t.join().unwrap();
    }
    info!("reader_threads joined");

    let inserted = global_control.inserted.load(Ordering::SeqCst);
    let erased = global_control.erased.load(Ordering::SeqCst);
    let size = global_control.list.size().unwrap() as i64;
    let manager = global_control.list.manager();
    info!(
        "inserted {} erased {} size {} read_loops {} reclaimed {} pending {}",
        inserted,
        erased,
        size,
        global_control.read_loops.load(Ordering::SeqCst),
        manager.reclaimed_count(),
        manager.pending_count()
    );
    assert_eq!(inserted - erased, size);
    let values = global_control.list.to_vec().unwrap();
    assert!(values.windows(2).all(|w| w[0] <= w[1]));
}
