mod common;

use common::{CPU0, CPU1, pa, run_on, system, va};
use kernel_info::cpu::CpuId;
use kernel_info::memory::{KERNEL_SPACE_START, PAGE_SIZE};
use kernel_pmap::{EnterFlags, IpiDelivery, MachineConfig, PmapSystem, Prot, Thread};
use kernel_vmem::AccessKind;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

fn queued(cpus: usize) -> Arc<PmapSystem> {
    Arc::new(PmapSystem::bootstrap(
        MachineConfig::new(cpus).with_ipi_delivery(IpiDelivery::Queued),
    ))
}

#[test]
fn remote_translation_is_gone_after_remove() {
    let sys = system(2);
    let mmu = sys.machine().mmu();
    let p = sys.create();
    let _t = run_on(&sys, CPU1, &p);

    sys.enter(CPU0, &p, va(0x2000), pa(0x9000), Prot::READ_WRITE, EnterFlags::new())
        .unwrap();
    assert_eq!(mmu.access(CPU1, va(0x2000), AccessKind::Read, true), Ok(pa(0x9000)));
    assert!(mmu.probe(CPU1, va(0x2000)).is_some());

    sys.remove(CPU0, &p, va(0x2000), va(0x3000));
    sys.shootwait(CPU0);
    assert!(mmu.probe(CPU1, va(0x2000)).is_none());
    assert_eq!(sys.cpu(CPU0).alternate_root(), None);
}

#[test]
fn cpus_without_the_pmap_are_left_alone() {
    let sys = system(2);
    let mmu = sys.machine().mmu();
    let p = sys.create();
    let q = sys.create();
    let _t = run_on(&sys, CPU1, &q);

    sys.enter(CPU0, &p, va(0x2000), pa(0x9000), Prot::READ_WRITE, EnterFlags::new())
        .unwrap();
    let before = mmu.counters(CPU1);
    sys.remove(CPU0, &p, va(0x2000), va(0x3000));
    sys.shootwait(CPU0);
    assert_eq!(mmu.counters(CPU1), before);
}

#[test]
fn modified_bit_set_remotely_is_visible() {
    let sys = system(2);
    let mmu = sys.machine().mmu();
    let p = sys.create();
    let _t = run_on(&sys, CPU1, &p);
    let page = pa(0x9000);

    sys.enter(CPU0, &p, va(0x2000), page, Prot::READ_WRITE, EnterFlags::new()).unwrap();
    mmu.access(CPU1, va(0x2000), AccessKind::Write, true).unwrap();
    assert!(sys.is_modified(CPU0, page));

    assert!(sys.clear_modify(CPU0, page));
    // CPU1 must not keep writing through a translation that skips the dirty bit.
    assert!(mmu.probe(CPU1, va(0x2000)).is_none());
    assert!(!sys.is_modified(CPU0, page));

    mmu.access(CPU1, va(0x2000), AccessKind::Write, true).unwrap();
    assert!(sys.is_modified(CPU0, page));
}

#[test]
fn write_protect_reaches_the_remote_cpu() {
    let sys = system(2);
    let mmu = sys.machine().mmu();
    let p = sys.create();
    let _t = run_on(&sys, CPU1, &p);

    sys.enter(CPU0, &p, va(0x2000), pa(0x9000), Prot::READ_WRITE, EnterFlags::new())
        .unwrap();
    mmu.access(CPU1, va(0x2000), AccessKind::Write, true).unwrap();

    sys.protect(CPU0, &p, va(0x2000), va(0x3000), Prot::READ);
    assert!(
        mmu.access(CPU1, va(0x2000), AccessKind::Write, true)
            .is_err()
    );
}

#[test]
fn kernel_shootdown_is_broadcast_to_running_cpus() {
    let sys = system(3);
    let mmu = sys.machine().mmu();
    let cpu2 = CpuId::new(2);
    let kva = va(KERNEL_SPACE_START + 0x3000);

    sys.kenter_pa(CPU0, kva, pa(0x7000), Prot::READ_WRITE);
    for cpu in [CPU1, cpu2] {
        mmu.access(cpu, kva, AccessKind::Read, false).unwrap();
    }
    sys.cpu(cpu2).set_running(false);

    sys.kremove(CPU0, kva, PAGE_SIZE);
    sys.update(CPU0, sys.kernel());
    assert!(mmu.probe(CPU1, kva).is_none());
    // Stopped CPUs take no part.
    assert!(mmu.probe(cpu2, kva).is_some());
}

#[test]
fn large_ranges_become_full_flushes() {
    let sys = system(2);
    let mmu = sys.machine().mmu();
    let p = sys.create();
    let _t = run_on(&sys, CPU1, &p);

    let pages = 40;
    for i in 0..pages {
        let v = va(0x10_0000 + i * PAGE_SIZE);
        let frame = pa(0x2_0000 + i * PAGE_SIZE);
        sys.enter(CPU0, &p, v, frame, Prot::READ_WRITE, EnterFlags::new())
            .unwrap();
        mmu.access(CPU1, v, AccessKind::Read, true).unwrap();
    }
    let before = mmu.counters(CPU1);
    sys.write_protect(CPU0, &p, va(0x10_0000), va(0x10_0000 + pages * PAGE_SIZE), Prot::READ);
    let after = mmu.counters(CPU1);
    assert_eq!(after.invalidations, before.invalidations);
    assert!(after.flushes > before.flushes);
    assert_eq!(mmu.tlb_len(CPU1), 0);
}

#[test]
fn queued_ipis_are_serviced_by_the_target() {
    let sys = queued(2);
    let p = sys.create();
    let barrier = Arc::new(Barrier::new(2));
    let done = Arc::new(AtomicBool::new(false));

    let remote = thread::spawn({
        let (sys, p, barrier, done) = (sys.clone(), p.clone(), barrier.clone(), done.clone());
        move || {
            let _t = run_on(&sys, CPU1, &p);
            barrier.wait();
            barrier.wait();
            sys.machine()
                .mmu()
                .access(CPU1, va(0x2000), AccessKind::Read, true)
                .unwrap();
            barrier.wait();
            while !done.load(Ordering::SeqCst) {
                sys.service_interrupts(CPU1);
                std::hint::spin_loop();
            }
            sys.machine().mmu().probe(CPU1, va(0x2000))
        }
    });

    barrier.wait();
    sys.enter(CPU0, &p, va(0x2000), pa(0x9000), Prot::READ_WRITE, EnterFlags::new())
        .unwrap();
    barrier.wait();
    barrier.wait();

    sys.remove(CPU0, &p, va(0x2000), va(0x3000));
    sys.shootwait(CPU0);
    assert!(sys.machine().mmu().probe(CPU1, va(0x2000)).is_none());

    done.store(true, Ordering::SeqCst);
    assert!(remote.join().unwrap().is_none());
}

#[test]
fn crossing_updates_do_not_deadlock() {
    const ROUNDS: u64 = 200;
    let sys = queued(2);
    let pmaps = [sys.create(), sys.create()];
    let barrier = Arc::new(Barrier::new(2));
    let finished = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = [CPU0, CPU1]
        .into_iter()
        .enumerate()
        .map(|(i, cpu)| {
            let sys = sys.clone();
            let own = pmaps[i].clone();
            let other = pmaps[1 - i].clone();
            let barrier = barrier.clone();
            let finished = finished.clone();
            thread::spawn(move || {
                let current = Thread::new(own.clone());
                sys.activate(cpu, &current);
                sys.load(cpu);
                barrier.wait();

                let base = 0x40_0000 * (i as u64 + 1);
                for round in 0..ROUNDS {
                    let v = va(base + (round % 8) * PAGE_SIZE);
                    let frame = pa(0x1_0000 + (round % 16) * PAGE_SIZE);
                    for pmap in [&own, &other] {
                        sys.enter(cpu, pmap, v, frame, Prot::READ_WRITE, EnterFlags::new())
                            .unwrap();
                        sys.machine()
                            .mmu()
                            .access(cpu, v, AccessKind::Write, true)
                            .ok();
                        sys.remove(cpu, pmap, v, v.wrapping_add(PAGE_SIZE));
                    }
                }

                finished.fetch_add(1, Ordering::SeqCst);
                while finished.load(Ordering::SeqCst) < 2 {
                    sys.service_interrupts(cpu);
                    std::hint::spin_loop();
                }
                sys.shootwait(cpu);
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    for pmap in &pmaps {
        assert_eq!(pmap.resident_count(), 1);
        assert!(sys.ptp_census(CPU0, pmap).is_empty());
    }
    assert_eq!(sys.pv_nodes_in_use(), 0);
}
