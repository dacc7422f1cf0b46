//! Cross-kernel ordering through the completion-event graph

use skein_backends::{
    CopyDescriptor, CopyKind, DeviceId, KernelLaunch, MockBackend, StreamId, StreamKind,
    StreamScheduler,
};
use skein_base::EventTable;
use std::sync::Arc;

fn scheduler_with_one_task_stream() -> (Arc<StreamScheduler>, Arc<EventTable>) {
    let events = EventTable::new();
    let backend = Box::new(MockBackend::new(DeviceId(0)));
    let sched = StreamScheduler::new(backend, Arc::clone(&events), 1, 64);
    (sched, events)
}

fn task0() -> StreamId {
    StreamId {
        device: DeviceId(0),
        kind: StreamKind::Task(0),
    }
}

#[test]
fn dependent_kernel_starts_after_predecessor_finishes() {
    let (sched, events) = scheduler_with_one_task_stream();

    let k1_done = events.create();
    let k2_done = events.create();
    sched
        .submit_kernel(KernelLaunch::new(1, vec![]), k1_done)
        .unwrap();
    // K2 is chained behind K1's completion event
    sched.submit_kernel_after(k1_done, KernelLaunch::new(2, vec![]), k2_done);

    sched.pump();
    // K1 submitted, K2 still waiting on the event
    {
        let log = sched.with_backend(|b| b.as_any().downcast_ref::<MockBackend>().unwrap().log());
        let log = log.lock();
        assert!(log.iter().any(|l| l.contains("kernel f1")));
        assert!(!log.iter().any(|l| l.contains("kernel f2")));
    }

    // the device reaches K1's marker; the completion drains and K2 follows
    sched.with_backend(|b| {
        b.as_any_mut()
            .downcast_mut::<MockBackend>()
            .unwrap()
            .advance(task0(), 1);
    });
    sched.pump();
    assert!(events.has_triggered(k1_done));
    sched.pump();

    let log = sched.with_backend(|b| b.as_any().downcast_ref::<MockBackend>().unwrap().log());
    let log = log.lock();
    let k1_finish = log
        .iter()
        .position(|l| l.starts_with("complete"))
        .expect("k1 completion in log");
    let k2_start = log
        .iter()
        .position(|l| l.contains("submit") && l.contains("kernel f2"))
        .expect("k2 submission in log");
    assert!(
        k1_finish < k2_start,
        "k2 started before k1 finished: {log:?}"
    );

    sched.with_backend(|b| {
        b.as_any_mut()
            .downcast_mut::<MockBackend>()
            .unwrap()
            .advance(task0(), 1);
    });
    sched.pump();
    assert!(events.has_triggered(k2_done));
}

#[test]
fn same_stream_work_is_fifo() {
    let (sched, events) = scheduler_with_one_task_stream();

    let evs: Vec<_> = (0..3).map(|_| events.create()).collect();
    for (i, ev) in evs.iter().enumerate() {
        sched
            .submit_kernel(KernelLaunch::new(10 + i as u64, vec![]), *ev)
            .unwrap();
    }
    sched.pump();

    // complete one marker at a time; fences fire in submission order
    for (i, ev) in evs.iter().enumerate() {
        assert!(!events.has_triggered(*ev), "fence {i} fired early");
        sched.with_backend(|b| {
            b.as_any_mut()
                .downcast_mut::<MockBackend>()
                .unwrap()
                .advance(task0(), 1);
        });
        sched.pump();
        assert!(events.has_triggered(*ev), "fence {i} did not fire");
        for later in &evs[i + 1..] {
            assert!(!events.has_triggered(*later));
        }
    }
}

#[test]
fn copies_route_to_their_dma_stream() {
    let (sched, events) = scheduler_with_one_task_stream();

    for kind in [
        CopyKind::HostToDevice,
        CopyKind::DeviceToHost,
        CopyKind::DeviceToDevice,
        CopyKind::Peer,
    ] {
        let ev = events.create();
        sched
            .submit_copy(
                CopyDescriptor {
                    src: 0,
                    dst: 0,
                    bytes: 8,
                    kind,
                },
                ev,
            )
            .unwrap();
    }
    sched.pump();

    let log = sched.with_backend(|b| b.as_any().downcast_ref::<MockBackend>().unwrap().log());
    let log = log.lock();
    for tag in ["h2d", "d2h", "d2d", "peer"] {
        assert!(
            log.iter().any(|l| l.contains(tag) && l.contains("copy")),
            "missing copy on {tag}: {log:?}"
        );
    }
}
