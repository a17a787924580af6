//! Simulated hardware for the paging tests.
//!
//! - [`SoftPageTable`]: a page table kept in a map, with accessed and dirty
//!   bits that [`Cpu`] updates the way the MMU does.
//! - [`RamDisk`]: a swap device in memory that counts its writes.
//! - [`MemFile`]: a regular file in memory that counts its block writes.
//! - [`Cpu`]: performs user loads and stores, and routes page faults to the
//!   address space.
#![allow(dead_code)]

use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Pa, Va},
    fs::{Disk, FileBlockNumber, RegularFile, Sector, traits},
    mm::page_table::{PFErrorCode, PageTable, PageTableMappingError, Permission, PteFlags},
};
use keos_vm::{
    MmStruct, USER_STACK, Vm, VmBuilder,
    fault::PageFaultReason,
    page::VmType,
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

#[derive(Default)]
pub struct SoftPageTable {
    entries: Mutex<BTreeMap<Va, (Pa, PteFlags)>>,
}

impl SoftPageTable {
    pub fn mapped(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl PageTable for SoftPageTable {
    fn map(&self, va: Va, pa: Pa, perm: Permission) -> Result<(), PageTableMappingError> {
        if !va.is_page_aligned() || pa.offset() != 0 {
            return Err(PageTableMappingError::Unaligned);
        }
        let mut entries = self.entries.lock().unwrap();
        if entries.contains_key(&va) {
            return Err(PageTableMappingError::Duplicated);
        }
        entries.insert(va, (pa, perm.into_pte_flags()));
        Ok(())
    }

    fn unmap(&self, va: Va) -> Result<Pa, PageTableMappingError> {
        self.entries
            .lock()
            .unwrap()
            .remove(&va)
            .map(|(pa, _)| pa)
            .ok_or(PageTableMappingError::NotExist)
    }

    fn walk(&self, va: Va) -> Result<(Pa, PteFlags), PageTableMappingError> {
        self.entries
            .lock()
            .unwrap()
            .get(&va)
            .copied()
            .ok_or(PageTableMappingError::NotExist)
    }

    fn update_flags(
        &self,
        va: Va,
        set: PteFlags,
        clear: PteFlags,
    ) -> Result<(), PageTableMappingError> {
        let mut entries = self.entries.lock().unwrap();
        let (_, flags) = entries
            .get_mut(&va)
            .ok_or(PageTableMappingError::NotExist)?;
        *flags = (*flags | set) & !clear;
        Ok(())
    }
}

pub struct RamDisk {
    data: Mutex<Vec<u8>>,
    pub writes: AtomicUsize,
}

impl RamDisk {
    pub fn new(slots: usize) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(vec![0; slots * PAGE_SIZE]),
            writes: AtomicUsize::new(0),
        })
    }
}

struct DiskHandle(Arc<RamDisk>);

impl traits::Disk for DiskHandle {
    fn sector_count(&self) -> usize {
        self.0.data.lock().unwrap().len() / 512
    }

    fn read(&self, sector: Sector, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        let ofs = sector.into_offset();
        buf.copy_from_slice(&self.0.data.lock().unwrap()[ofs..ofs + 512]);
        Ok(())
    }

    fn write(&self, sector: Sector, buf: &[u8; 512]) -> Result<(), KernelError> {
        let ofs = sector.into_offset();
        self.0.data.lock().unwrap()[ofs..ofs + 512].copy_from_slice(buf);
        self.0.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MemFile {
    data: Mutex<Vec<u8>>,
    pub writes: AtomicUsize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            writes: AtomicUsize::new(0),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn handle(self: &Arc<Self>) -> RegularFile {
        RegularFile(self.clone())
    }
}

impl traits::RegularFile for MemFile {
    fn size(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    fn read(&self, fba: FileBlockNumber, buf: &mut [u8; 4096]) -> Result<bool, KernelError> {
        let data = self.data.lock().unwrap();
        let ofs = fba.into_offset();
        buf.fill(0);
        if ofs >= data.len() {
            return Ok(false);
        }
        let n = (data.len() - ofs).min(4096);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        Ok(true)
    }

    fn write(
        &self,
        fba: FileBlockNumber,
        buf: &[u8; 4096],
        min_size: usize,
    ) -> Result<(), KernelError> {
        let mut data = self.data.lock().unwrap();
        let ofs = fba.into_offset();
        if data.len() < min_size {
            data.resize(min_size, 0);
        }
        let n = data.len().saturating_sub(ofs).min(4096);
        data[ofs..ofs + n].copy_from_slice(&buf[..n]);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn va(addr: usize) -> Va {
    Va::new(addr).unwrap()
}

pub fn vm(frames: usize, swap_slots: usize) -> (Arc<Vm>, Arc<RamDisk>) {
    let disk = RamDisk::new(swap_slots);
    let vm = VmBuilder::new()
        .frames(frames)
        .swap_disk(Disk::new(DiskHandle(disk.clone())))
        .build()
        .unwrap();
    (vm, disk)
}

pub fn address_space(vm: &Arc<Vm>) -> (MmStruct, Arc<SoftPageTable>) {
    let pt = Arc::new(SoftPageTable::default());
    (MmStruct::new(vm, pt.clone()), pt)
}

/// A user-mode CPU running on one address space.
pub struct Cpu {
    pub rsp: usize,
}

impl Default for Cpu {
    fn default() -> Self {
        Self { rsp: USER_STACK }
    }
}

impl Cpu {
    /// Translates `va` the way the MMU does, faulting into `mm` as needed.
    pub fn access(&self, mm: &mut MmStruct, va: Va, is_write: bool) -> Result<Pa, KernelError> {
        for _ in 0..2 {
            let pt = mm.page_table().clone();
            let ec = match pt.walk(va.page_down()) {
                Ok((pa, flags)) if !is_write || flags.contains(PteFlags::RW) => {
                    pt.set_accessed(va.page_down(), true).unwrap();
                    if is_write {
                        pt.set_dirty(va.page_down(), true).unwrap();
                    }
                    return Ok(pa + va.offset());
                }
                Ok(_) => PFErrorCode::PRESENT | PFErrorCode::WRITE_ACCESS | PFErrorCode::USER,
                Err(_) if is_write => PFErrorCode::WRITE_ACCESS | PFErrorCode::USER,
                Err(_) => PFErrorCode::USER,
            };
            mm.handle_page_fault(&PageFaultReason::new(ec, va, self.rsp))?;
        }
        Err(KernelError::InvalidAccess)
    }

    pub fn load(&self, mm: &mut MmStruct, va: Va) -> Result<u8, KernelError> {
        let pa = self.access(mm, va, false)?;
        Ok(mm.vm().memory().with_frame(pa, |frame| frame[pa.offset()]).unwrap())
    }

    pub fn store(&self, mm: &mut MmStruct, va: Va, byte: u8) -> Result<(), KernelError> {
        let pa = self.access(mm, va, true)?;
        mm.vm()
            .memory()
            .with_frame(pa, |frame| frame[pa.offset()] = byte)
            .unwrap();
        Ok(())
    }

    pub fn read_bytes(&self, mm: &mut MmStruct, va: Va, len: usize) -> Result<Vec<u8>, KernelError> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            let cur = va + out.len();
            let chunk = (PAGE_SIZE - cur.offset()).min(len - out.len());
            let pa = self.access(mm, cur, false)?;
            mm.vm()
                .memory()
                .with_frame(pa, |frame| out.extend_from_slice(&frame[pa.offset()..pa.offset() + chunk]))
                .unwrap();
        }
        Ok(out)
    }

    pub fn write_bytes(&self, mm: &mut MmStruct, va: Va, data: &[u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < data.len() {
            let cur = va + done;
            let chunk = (PAGE_SIZE - cur.offset()).min(data.len() - done);
            let pa = self.access(mm, cur, true)?;
            mm.vm()
                .memory()
                .with_frame(pa, |frame| {
                    frame[pa.offset()..pa.offset() + chunk].copy_from_slice(&data[done..done + chunk])
                })
                .unwrap();
            done += chunk;
        }
        Ok(())
    }
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;

    let mut buf = vec![0; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// Checks the residency invariants of the given address spaces against the
/// frame registry.
pub fn check_residency(vm: &Arc<Vm>, spaces: &[&MmStruct]) {
    let inner = vm.frame_table().lock();
    let frames = inner.frames();
    let swap_in_use = inner.swap().in_use();
    inner.unlock();

    let mut seen = HashSet::new();
    let mut resident = 0;
    let mut slots = 0;
    for mm in spaces {
        for page in mm.spt().iter() {
            match page.frame() {
                Some(pa) => {
                    resident += 1;
                    assert!(seen.insert(pa), "{:?} is claimed by two pages", pa);
                    assert!(
                        frames.contains(&(pa, page.va())),
                        "{:?} is resident in {:?} but not registered",
                        page.va(),
                        pa
                    );
                    assert_eq!(
                        mm.page_table().walk(page.va()).map(|(pa, _)| pa),
                        Ok(pa),
                        "hardware mapping of {:?} does not match its frame",
                        page.va()
                    );
                    assert!(page.swap_slot().is_none(), "resident page holds a slot");
                }
                None => {
                    assert!(
                        mm.page_table().walk(page.va()).is_err(),
                        "non-resident {:?} is still mapped",
                        page.va()
                    );
                    if page.swap_slot().is_some() {
                        slots += 1;
                    } else {
                        assert!(
                            page.is_uninit() || page.ty() == VmType::File,
                            "swapped-out anonymous page {:?} has no slot",
                            page.va()
                        );
                    }
                }
            }
        }
    }
    assert_eq!(frames.len(), resident, "registry and page tables disagree");
    assert_eq!(swap_in_use, slots, "leaked swap slots");
}
