extern crate core_affinity;
extern crate env_logger;
#[macro_use]
extern crate log;
extern crate rs_cds;

use rs_cds::concurrent_queue::ConcurrentQueue;
use rs_cds::util;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;
use std::time::SystemTime;

#[repr(align(16))]
struct QueueValue {
    value: i64,
}

struct GlobalControl {
    queue: ConcurrentQueue<QueueValue>,
    loop_cnt: i64,
    producer_cnt: AtomicI64,
    produced: AtomicI64,
    consumed: AtomicI64,
    tol_val: AtomicI64,
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

fn consumer_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    let mut ret = false;
    let mut tol = 0;
    let mut tol_val = 0;
    loop {
        if let Some(v) = global_control.queue.pop().unwrap() {
            tol_val += v.value;
            tol += 1;
            if tol % 1024 == 0 {
                global_control.consumed.fetch_add(tol, Ordering::Relaxed);
                global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
                tol = 0;
                tol_val = 0;
            }
            ret = false;
        } else if global_control.producer_cnt.load(Ordering::Acquire) == 0 {
            if ret {
                break;
            } else {
                ret = true;
            }
        }
    }
    global_control.consumed.fetch_add(tol, Ordering::Relaxed);
    global_control.tol_val.fetch_add(tol_val, Ordering::Relaxed);
}

fn producer_thread(global_control: Arc<GlobalControl>) {
    set_cpu_affinity();
    let mut tol = 0;
    let loop_cnt = global_control.loop_cnt;
    for i in 0..loop_cnt {
        global_control.queue.push(QueueValue { value: i }).unwrap();
        tol += 1;
        if i % 1024 == 0 {
            global_control.produced.fetch_add(tol, Ordering::Relaxed);
            tol = 0;
        }
    }
    global_control.produced.fetch_add(tol, Ordering::Relaxed);
    global_control.producer_cnt.fetch_sub(1, Ordering::Release);
}

fn debug_thread(global_control: Arc<GlobalControl>) {
    while global_control.producer_cnt.load(Ordering::Acquire) != 0 {
        info!(
            "debug_thread produced {} consumed {} pending reclaim {}",
            global_control.produced.load(Ordering::Relaxed),
            global_control.consumed.load(Ordering::Relaxed),
            global_control.queue.manager().pending_count()
        );
        thread::sleep(time::Duration::from_millis(1000));
    }
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

    let producer_count = (cpu_count + 1) / 2;
    let consumer_count = (cpu_count - producer_count).max(1);

    info!(
        "producer_count {} consumer_count {}",
        producer_count, consumer_count
    );

    let cnt = 4_000_000 / producer_count;

    info!("loop_cnt {}, total need {}", cnt, cnt * producer_count);

    let global_control = Arc::new(GlobalControl {
        queue: ConcurrentQueue::new().unwrap(),
        loop_cnt: cnt,
        producer_cnt: AtomicI64::new(producer_count),
        produced: AtomicI64::new(0),
        consumed: AtomicI64::new(0),
        tol_val: AtomicI64::new(0),
    });

    let watch_thread = {
        let global_control = global_control.clone();
        thread::spawn(move || debug_thread(global_control))
    };

    let producer_threads: Vec<_> = (0..producer_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || producer_thread(global_control))
        })
        .collect();

    let consumer_threads: Vec<_> = (0..consumer_count)
        .map(|_| {
            let global_control = global_control.clone();
            thread::spawn(move || consumer_thread(global_control))
        })
        .collect();

    for t in producer_threads {
        t.join().unwrap();
    }

    info!("producer_threads joined");

    for t in consumer_threads {
        t.join().unwrap();
    }

    info!("consumer_threads joined");

    watch_thread.join().unwrap();

    let produced = global_control.produced.load(Ordering::SeqCst);
    let consumed = global_control.consumed.load(Ordering::SeqCst);
    info!(
        "debug_thread produced {} consumed {} reclaimed {}",
        produced,
        consumed,
        global_control.queue.manager().reclaimed_count()
    );
    assert_eq!(
        global_control.tol_val.load(Ordering::SeqCst),
        producer_count * (global_control.loop_cnt - 1) * global_control.loop_cnt / 2
    );
    assert_eq!(produced, consumed);
}
