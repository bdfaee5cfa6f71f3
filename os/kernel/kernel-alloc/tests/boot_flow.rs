use kernel_alloc::bootstrap::{build_kernel_space, ingest};
use kernel_alloc::{FrameAllocator, RawFrameSource};
use kernel_info::boot::{MemoryKind, MemoryMapEntry};
use kernel_info::memory::{HHDM_BASE, TABLE_CACHE_WATERMARK};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::SpinLock;
use kernel_vmem::testing::TestPhys;
use kernel_vmem::{AddressSpace, FaultResolution, MapMode, PageEntry, PageTableLevel, TableCache};

const FRAMES: u64 = 1024;

fn memory_map() -> [MemoryMapEntry; 2] {
    [
        MemoryMapEntry::new(PhysicalAddress::zero(), FRAMES - 8, MemoryKind::Free),
        MemoryMapEntry::new(PhysicalAddress::new((FRAMES - 8) * 4096), 8, MemoryKind::Kernel),
    ]
}

#[test]
fn raw_frames_then_allocator_then_kernel_space() {
    let phys = TestPhys::new(FRAMES as usize);
    let map = memory_map();

    let mut raw = RawFrameSource::new(&map);
    let early: Vec<_> = (0..4).map(|_| raw.allocate_page().unwrap()).collect();
    assert_eq!(early[0], PhysicalAddress::new(0x1000));

    let fa = SpinLock::new(FrameAllocator::new());
    let report = fa.with_lock(|fa| ingest(&map, Some(&raw), fa)).unwrap();
    assert_eq!(report.free_frames, FRAMES - 8 - 1 - 4);
    assert!(fa.with_lock(|fa| fa.free_iter().all(|b| !early.iter().any(|&p| b.contains(p)))));

    let mut cache = TableCache::new(TABLE_CACHE_WATERMARK);
    let root = fa
        .with_lock(|fa| build_kernel_space(&map, &[], &phys, &mut cache, fa))
        .unwrap();
    let kernel = AddressSpace::from_root(&phys, root);

    let (pa, _) = kernel
        .translate(VirtualAddress::new(HHDM_BASE + 0x20_0000))
        .unwrap();
    assert_eq!(pa.as_u64(), 0x20_0000);
    let (pa, _) = kernel
        .translate(VirtualAddress::new(HHDM_BASE + (FRAMES - 1) * 4096))
        .unwrap();
    assert_eq!(pa.as_u64(), (FRAMES - 1) * 4096);
}

#[test]
fn user_space_faults_are_backed_by_the_allocator() {
    let phys = TestPhys::new(FRAMES as usize);
    let map = memory_map();
    let mut fa = FrameAllocator::new();
    ingest(&map, None, &mut fa).unwrap();

    let mut cache = TableCache::new(TABLE_CACHE_WATERMARK);
    let root = build_kernel_space(&map, &[], &phys, &mut cache, &mut fa).unwrap();
    let kernel = AddressSpace::from_root(&phys, root);
    let user = kernel.new_user(&mut cache).unwrap();

    let stack = VirtualAddress::new(0x7000_0000);
    user.allow(&mut cache, &mut fa, stack, true, PageTableLevel::Pd).unwrap();

    let before = fa.free_frames();
    let resolution = user.handle_fault(&mut cache, &mut fa, stack + 0x3000).unwrap();
    let FaultResolution::Resolved(frame) = resolution else {
        panic!("fault in allowed region not resolved: {resolution:?}");
    };
    assert_eq!(fa.free_frames(), before - 1);
    assert_eq!(user.translate(stack + 0x3000).unwrap().0, frame);

    assert_eq!(
        user.handle_fault(&mut cache, &mut fa, VirtualAddress::new(0x1000)).unwrap(),
        FaultResolution::NotAllowed
    );

    let code = fa.allocate_exact(2).unwrap();
    user.map(
        &mut cache,
        &mut fa,
        VirtualAddress::new(0x40_0000),
        code,
        2,
        PageEntry::user_code(),
        MapMode::Fresh,
    )
    .unwrap();

    let used = fa.used_frames();
    let freed = user.teardown(&mut cache, &mut fa);
    assert!(freed >= 3);
    assert!(fa.used_frames() < used);
    assert_eq!(fa.consolidate(), 0);
}
