mod common;

use common::{Cpu, MemFile, address_space, check_residency, random_bytes, va, vm};
use keos::{KernelError, addressing::PAGE_SIZE};
use keos_vm::{
    KERNEL_BASE,
    page::{Loader, VmType},
};
use std::sync::Arc;

const ADDR: usize = 0x1000_0000;

#[test]
fn mm_mmap_reads_file() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let data = random_bytes(10_000);
    let file = MemFile::new(data.clone());
    assert_eq!(
        mm.mmap(va(ADDR), data.len(), false, &file.handle(), 0),
        Ok(va(ADDR))
    );
    assert_eq!(mm.spt().len(), 3);
    assert_eq!(mm.page_type(va(ADDR + 0x2fff)), Some(VmType::File));
    assert!(
        mm.spt().iter().all(|page| page.is_uninit()),
        "mmap() must not read the file"
    );

    assert_eq!(cpu.read_bytes(&mut mm, va(ADDR), data.len()), Ok(data.clone()));
    assert_eq!(
        cpu.read_bytes(&mut mm, va(ADDR + data.len()), 3 * PAGE_SIZE - data.len()),
        Ok(vec![0; 3 * PAGE_SIZE - data.len()]),
        "the tail of the last page must be zero"
    );
    assert_eq!(
        cpu.store(&mut mm, va(ADDR), 0),
        Err(KernelError::InvalidAccess),
        "read-only mapping must not be writable"
    );
    check_residency(&vm, &[&mm]);

    assert_eq!(mm.munmap(va(ADDR)), Ok(()));
    assert_eq!(file.writes(), 0, "clean pages must not be written back");
    assert_eq!(file.contents(), data);
    assert_eq!(mm.spt().len(), 0);
    assert_eq!(vm.stats().free_frames, 8);
    assert_eq!(cpu.load(&mut mm, va(ADDR)), Err(KernelError::InvalidAccess));
}

#[test]
fn mm_mmap_offset() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let data = random_bytes(3 * PAGE_SIZE);
    let file = MemFile::new(data.clone());
    mm.mmap(va(ADDR), PAGE_SIZE, true, &file.handle(), 2 * PAGE_SIZE)
        .unwrap();
    assert_eq!(mm.spt().len(), 1);
    assert_eq!(
        cpu.read_bytes(&mut mm, va(ADDR), PAGE_SIZE),
        Ok(data[2 * PAGE_SIZE..].to_vec())
    );
}

#[test]
fn mm_mmap_dirty_writeback() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let mut data = random_bytes(2 * PAGE_SIZE);
    let file = MemFile::new(data.clone());
    mm.mmap(va(ADDR), data.len(), true, &file.handle(), 0)
        .unwrap();

    let patch = b"written through the mapping";
    cpu.write_bytes(&mut mm, va(ADDR + PAGE_SIZE + 100), patch)
        .unwrap();
    // Only page 0 is read: it stays clean.
    cpu.load(&mut mm, va(ADDR)).unwrap();

    assert_eq!(mm.munmap(va(ADDR)), Ok(()));
    data[PAGE_SIZE + 100..PAGE_SIZE + 100 + patch.len()].copy_from_slice(patch);
    assert_eq!(file.contents(), data, "dirty page must reach the file");
    assert_eq!(file.writes(), 1, "only the dirty page is written back");
}

#[test]
fn mm_mmap_longer_than_file() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let data = random_bytes(5000);
    let file = MemFile::new(data.clone());
    mm.mmap(va(ADDR), 3 * PAGE_SIZE, true, &file.handle(), 0)
        .unwrap();
    assert_eq!(mm.spt().len(), 2, "pages past the end of the file are not mapped");
    assert_eq!(mm.mmap_region(va(ADDR)).unwrap().page_count, 2);

    let mut expected = data.clone();
    expected.resize(2 * PAGE_SIZE, 0);
    assert_eq!(cpu.read_bytes(&mut mm, va(ADDR), 2 * PAGE_SIZE), Ok(expected));
    assert_eq!(
        cpu.load(&mut mm, va(ADDR + 2 * PAGE_SIZE)),
        Err(KernelError::InvalidAccess)
    );

    // Dirty the padding of the last page.
    cpu.write_bytes(&mut mm, va(ADDR + 4990), &[0xff; 20]).unwrap();
    cpu.store(&mut mm, va(ADDR + 2 * PAGE_SIZE - 1), 0xff).unwrap();

    mm.munmap(va(ADDR)).unwrap();
    let contents = file.contents();
    assert_eq!(contents.len(), 5000, "padding must never reach the file");
    assert_eq!(&contents[..4990], &data[..4990]);
    assert_eq!(&contents[4990..], &[0xff; 10]);
}

#[test]
fn mm_mmap_stops_at_eof() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let data = random_bytes(100);
    let file = MemFile::new(data.clone());
    mm.alloc_page(VmType::Anon, va(ADDR + PAGE_SIZE), true, Loader::Zero)
        .unwrap();
    assert_eq!(
        mm.mmap(va(ADDR), 2 * PAGE_SIZE, false, &file.handle(), 0),
        Ok(va(ADDR)),
        "a page past the end of the file does not collide"
    );
    assert_eq!(mm.spt().len(), 2);
    assert_eq!(mm.page_type(va(ADDR)), Some(VmType::File));
    assert_eq!(mm.page_type(va(ADDR + PAGE_SIZE)), Some(VmType::Anon));

    let mut expected = data;
    expected.resize(PAGE_SIZE, 0);
    assert_eq!(cpu.read_bytes(&mut mm, va(ADDR), PAGE_SIZE), Ok(expected));

    mm.munmap(va(ADDR)).unwrap();
    assert_eq!(mm.spt().len(), 1, "munmap() must leave the anonymous page alone");
    assert!(mm.find_page(va(ADDR + PAGE_SIZE)).is_some());
}

#[test]
fn mm_mmap_at_kernel_boundary() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let data = random_bytes(PAGE_SIZE);
    let file = MemFile::new(data.clone());
    let last = va(KERNEL_BASE - PAGE_SIZE);
    assert_eq!(
        mm.mmap(last, PAGE_SIZE, false, &file.handle(), 0),
        Ok(last),
        "a mapping may end exactly at the kernel boundary"
    );
    assert_eq!(mm.mmap_region(last).unwrap().end().into_usize(), KERNEL_BASE);
    assert_eq!(cpu.read_bytes(&mut mm, last, PAGE_SIZE), Ok(data));
    assert_eq!(mm.munmap(last), Ok(()));
}

#[test]
fn mm_mmap_remap_same_contents() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let file = MemFile::new(random_bytes(2 * PAGE_SIZE + 17));
    let len = 2 * PAGE_SIZE + 17;
    let pattern = random_bytes(len);

    mm.mmap(va(ADDR), len, true, &file.handle(), 0).unwrap();
    cpu.write_bytes(&mut mm, va(ADDR), &pattern).unwrap();
    mm.munmap(va(ADDR)).unwrap();

    mm.mmap(va(ADDR + 0x10_0000), len, false, &file.handle(), 0)
        .unwrap();
    assert_eq!(
        cpu.read_bytes(&mut mm, va(ADDR + 0x10_0000), len),
        Ok(pattern),
        "a new mapping must see what the old one wrote"
    );
    check_residency(&vm, &[&mm]);
}

#[test]
fn mm_mmap_error() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);

    let file = MemFile::new(random_bytes(2 * PAGE_SIZE)).handle();
    let empty = MemFile::new(Vec::new()).handle();

    for (addr, len, file, ofs) in [
        (ADDR, 0, &file, 0),
        (ADDR, PAGE_SIZE, &empty, 0),
        (0, PAGE_SIZE, &file, 0),
        (ADDR + 0x10, PAGE_SIZE, &file, 0),
        (ADDR, PAGE_SIZE, &file, 0x10),
        (ADDR, PAGE_SIZE, &file, 2 * PAGE_SIZE),
    ] {
        assert_eq!(
            mm.mmap(va(addr), len, true, file, ofs),
            Err(KernelError::InvalidArgument),
            "mmap(0x{:x}, 0x{:x}, ofs: 0x{:x}) should fail",
            addr,
            len,
            ofs
        );
    }
    assert_eq!(
        mm.mmap(va(KERNEL_BASE - PAGE_SIZE), 2 * PAGE_SIZE, true, &file, 0),
        Err(KernelError::BadAddress),
        "mapping must not reach kernel memory"
    );
    assert_eq!(mm.spt().len(), 0);

    mm.alloc_page(VmType::Anon, va(ADDR + PAGE_SIZE), true, Loader::Zero)
        .unwrap();
    assert_eq!(
        mm.mmap(va(ADDR), 3 * PAGE_SIZE, true, &file, 0),
        Err(KernelError::FileExist),
        "mmap() over a mapped page should fail"
    );
    assert_eq!(mm.spt().len(), 1, "failed mmap() must leave nothing behind");
    assert!(mm.mmap_region(va(ADDR)).is_none());
}

#[test]
fn mm_munmap_error() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);

    let file = MemFile::new(random_bytes(2 * PAGE_SIZE)).handle();
    mm.mmap(va(ADDR), 2 * PAGE_SIZE, true, &file, 0).unwrap();
    assert_eq!(
        mm.munmap(va(ADDR + PAGE_SIZE)),
        Err(KernelError::InvalidArgument),
        "munmap() must name the start of a region"
    );
    assert_eq!(mm.munmap(va(0x1234_5000)), Err(KernelError::InvalidArgument));
    let region = mm.mmap_region(va(ADDR)).unwrap();
    assert_eq!(region.page_count, 2);
    assert_eq!(region.end(), va(ADDR + 2 * PAGE_SIZE));
    assert!(mm.region_of(va(ADDR + PAGE_SIZE + 5)).is_some());
    assert!(mm.region_of(va(ADDR + 2 * PAGE_SIZE)).is_none());

    assert_eq!(mm.munmap(va(ADDR)), Ok(()));
    assert_eq!(
        mm.munmap(va(ADDR)),
        Err(KernelError::InvalidArgument),
        "double munmap() should fail"
    );
}

#[test]
fn mm_mmap_closes_file() {
    let (vm, _) = vm(8, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let file = MemFile::new(random_bytes(4 * PAGE_SIZE));
    let handle = file.handle();
    let baseline = Arc::strong_count(&file);

    mm.mmap(va(ADDR), 4 * PAGE_SIZE, true, &handle, 0).unwrap();
    assert!(Arc::strong_count(&file) > baseline);
    cpu.store(&mut mm, va(ADDR + PAGE_SIZE), 1).unwrap();
    mm.munmap(va(ADDR)).unwrap();
    assert_eq!(
        Arc::strong_count(&file),
        baseline,
        "every handle of the mapping must be closed by munmap()"
    );
}

#[test]
fn mm_mmap_eviction() {
    let (vm, disk) = vm(2, 8);
    let (mut mm, _) = address_space(&vm);
    let cpu = Cpu::default();

    let mut data = random_bytes(4 * PAGE_SIZE);
    let file = MemFile::new(data.clone());
    mm.mmap(va(ADDR), data.len(), true, &file.handle(), 0)
        .unwrap();

    cpu.store(&mut mm, va(ADDR + 3), 0x5a).unwrap();
    data[3] = 0x5a;
    for i in 1..4 {
        cpu.load(&mut mm, va(ADDR + i * PAGE_SIZE)).unwrap();
    }
    assert!(vm.stats().evictions >= 2);
    assert!(!mm.find_page(va(ADDR)).unwrap().is_resident());
    assert_eq!(file.writes(), 1, "only the dirty page is written back on eviction");
    assert_eq!(file.contents(), data);
    assert_eq!(
        disk.writes.load(std::sync::atomic::Ordering::SeqCst),
        0,
        "file-backed pages never go to swap"
    );
    check_residency(&vm, &[&mm]);

    assert_eq!(cpu.load(&mut mm, va(ADDR + 3)), Ok(0x5a));
    assert_eq!(
        cpu.read_bytes(&mut mm, va(ADDR), data.len()),
        Ok(data.clone())
    );
}

#[test]
fn mm_exit_writes_back() {
    let (vm, _) = vm(4, 8);
    let file = MemFile::new(random_bytes(PAGE_SIZE));
    let cpu = Cpu::default();
    {
        let (mut mm, _) = address_space(&vm);
        mm.mmap(va(ADDR), PAGE_SIZE, true, &file.handle(), 0)
            .unwrap();
        cpu.store(&mut mm, va(ADDR + 9), 0x99).unwrap();
    }
    assert_eq!(file.contents()[9], 0x99, "teardown must write back dirty pages");
    assert_eq!(vm.stats().free_frames, 4);
}
