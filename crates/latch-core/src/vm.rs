//! OS virtual-memory service
//!
//! Thin wrapper over the platform's query/allocate/protect primitives. The
//! rest of the engine only sees [`RegionInfo`] and plain addresses; every
//! platform difference stays inside this module.

use latch_common::{Error, MemoryKind, MemoryState, Protection, RegionInfo, Result};

/// Signed 32-bit displacement reach, with a small margin kept below
/// `i32::MAX` so a region's far end still encodes.
pub const REL32_REACH: usize = 0x7FFF_FFF0;

/// True when every byte of `[base, base + size)` is a rel32 target for code
/// running at `from`.
pub fn within_reach(base: usize, size: usize, from: usize) -> bool {
    if base > from {
        (base - from).saturating_add(size) < REL32_REACH
    } else {
        from - base < REL32_REACH
    }
}

pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }

    #[cfg(windows)]
    {
        0x1000
    }
}

/// Reads `len` bytes at `address`. The caller vouches the range is mapped.
pub fn read_bytes(address: usize, len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    unsafe {
        std::ptr::copy_nonoverlapping(address as *const u8, out.as_mut_ptr(), len);
    }
    out
}

/// Zeroes `len` bytes at `address`. Used when a placed code block is removed
/// so stale executable bytes do not linger.
pub fn zero(address: usize, len: usize) {
    unsafe {
        std::ptr::write_bytes(address as *mut u8, 0, len);
    }
}

/// Makes the region containing `address` writable if it is not already,
/// keeping execute rights. Used before patching runtime-owned code pages.
pub fn ensure_writable(address: usize) -> Result<()> {
    let info = query(address)?;
    if !info.protection.write {
        protect(info.base, info.size, Protection::rwx())?;
    }
    Ok(())
}

/// Patches code bytes: lifts protection, writes, restores, flushes the
/// instruction cache.
pub fn write_code(address: usize, bytes: &[u8]) -> Result<()> {
    let old = protect(address, bytes.len(), Protection::rwx())?;
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    }
    // Caves and fresh regions stay RWX; only re-apply a more restrictive
    // previous protection.
    if !old.write {
        protect(address, bytes.len(), old)?;
    }
    flush_instruction_cache(address, bytes.len());
    Ok(())
}

#[cfg(windows)]
mod imp {
    use super::*;
    use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
    use windows::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION,
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE, PAGE_PROTECTION_FLAGS,
    };
    use windows::Win32::System::Threading::GetCurrentProcess;

    /// Allocation granularity: reservations start on 64 KiB boundaries.
    const GRANULARITY: usize = 0x10000;

    fn protection_from_flags(protect: u32) -> Protection {
        const EXECUTE: u32 = 0x10;
        const EXECUTE_READ: u32 = 0x20;
        const EXECUTE_READWRITE: u32 = 0x40;
        const EXECUTE_WRITECOPY: u32 = 0x80;
        const READWRITE: u32 = 0x04;
        const WRITECOPY: u32 = 0x08;

        Protection {
            read: protect != 0,
            write: matches!(
                protect,
                READWRITE | WRITECOPY | EXECUTE_READWRITE | EXECUTE_WRITECOPY
            ),
            execute: matches!(
                protect,
                EXECUTE | EXECUTE_READ | EXECUTE_READWRITE | EXECUTE_WRITECOPY
            ),
        }
    }

    fn flags_from_protection(prot: Protection) -> PAGE_PROTECTION_FLAGS {
        let value = match (prot.read, prot.write, prot.execute) {
            (_, true, true) => 0x40,  // PAGE_EXECUTE_READWRITE
            (_, false, true) => 0x20, // PAGE_EXECUTE_READ
            (_, true, false) => 0x04, // PAGE_READWRITE
            (true, false, false) => 0x02, // PAGE_READONLY
            (false, false, false) => 0x01, // PAGE_NOACCESS
        };
        PAGE_PROTECTION_FLAGS(value)
    }

    fn region_from_mbi(mbi: &MEMORY_BASIC_INFORMATION) -> RegionInfo {
        const MEM_COMMIT_V: u32 = 0x1000;
        const MEM_RESERVE_V: u32 = 0x2000;
        const MEM_IMAGE: u32 = 0x1000000;
        const MEM_MAPPED: u32 = 0x40000;

        let state = if mbi.State.0 == MEM_COMMIT_V {
            MemoryState::Commit
        } else if mbi.State.0 == MEM_RESERVE_V {
            MemoryState::Reserve
        } else {
            MemoryState::Free
        };

        let kind = if mbi.Type.0 & MEM_IMAGE != 0 {
            MemoryKind::Image
        } else if mbi.Type.0 & MEM_MAPPED != 0 {
            MemoryKind::Mapped
        } else {
            MemoryKind::Private
        };

        RegionInfo {
            base: mbi.BaseAddress as usize,
            size: mbi.RegionSize,
            protection: protection_from_flags(mbi.Protect.0),
            state,
            kind,
        }
    }

    pub fn query(address: usize) -> Result<RegionInfo> {
        unsafe {
            let mut mbi = MEMORY_BASIC_INFORMATION::default();
            if VirtualQuery(
                Some(address as *const _),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            ) == 0
            {
                return Err(Error::MemoryAccess {
                    address,
                    message: "VirtualQuery failed".into(),
                });
            }
            Ok(region_from_mbi(&mbi))
        }
    }

    pub fn alloc(size: usize) -> Result<usize> {
        unsafe {
            let ptr = VirtualAlloc(None, size, MEM_COMMIT | MEM_RESERVE, PAGE_EXECUTE_READWRITE);
            if ptr.is_null() {
                return Err(Error::MemoryAccess {
                    address: 0,
                    message: "VirtualAlloc failed".into(),
                });
            }
            Ok(ptr as usize)
        }
    }

    pub fn alloc_near(near: usize, size: usize, max_distance: usize) -> Option<usize> {
        let lo = near.saturating_sub(max_distance);
        let hi = near.saturating_add(max_distance);

        // Walk free regions upward from the target, then downward, taking
        // the first reservation the kernel accepts.
        let mut addr = near;
        while addr < hi {
            let Ok(info) = query(addr) else { break };
            if info.state == MemoryState::Free {
                let candidate = (info.base.max(addr) + GRANULARITY - 1) & !(GRANULARITY - 1);
                if candidate + size <= info.end() && candidate + size <= hi {
                    if let Some(base) = try_alloc_at(candidate, size) {
                        return Some(base);
                    }
                }
            }
            addr = info.end();
        }

        let mut addr = near;
        while addr > lo {
            let Ok(info) = query(addr - 1) else { break };
            if info.state == MemoryState::Free {
                let candidate =
                    (info.base.max(lo) + GRANULARITY - 1) & !(GRANULARITY - 1);
                if candidate + size <= info.end() {
                    if let Some(base) = try_alloc_at(candidate, size) {
                        return Some(base);
                    }
                }
            }
            if info.base == 0 {
                break;
            }
            addr = info.base;
        }

        None
    }

    fn try_alloc_at(address: usize, size: usize) -> Option<usize> {
        unsafe {
            let ptr = VirtualAlloc(
                Some(address as *const _),
                size,
                MEM_COMMIT | MEM_RESERVE,
                PAGE_EXECUTE_READWRITE,
            );
            if ptr.is_null() {
                None
            } else {
                Some(ptr as usize)
            }
        }
    }

    pub fn free(base: usize, _size: usize) -> Result<()> {
        unsafe {
            VirtualFree(base as *mut _, 0, MEM_RELEASE).map_err(|e| Error::MemoryAccess {
                address: base,
                message: format!("VirtualFree failed: {e}"),
            })
        }
    }

    pub fn protect(address: usize, size: usize, prot: Protection) -> Result<Protection> {
        unsafe {
            let mut old = PAGE_PROTECTION_FLAGS::default();
            VirtualProtect(address as *const _, size, flags_from_protection(prot), &mut old)
                .map_err(|e| Error::Protection {
                    address,
                    message: format!("VirtualProtect failed: {e}"),
                })?;
            Ok(protection_from_flags(old.0))
        }
    }

    pub fn flush_instruction_cache(address: usize, len: usize) {
        unsafe {
            let _ = FlushInstructionCache(GetCurrentProcess(), Some(address as *const _), len);
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;

    struct MapsEntry {
        start: usize,
        end: usize,
        protection: Protection,
        path: Option<String>,
    }

    fn parse_maps() -> Vec<MapsEntry> {
        let Ok(maps) = std::fs::read_to_string("/proc/self/maps") else {
            return Vec::new();
        };
        let mut entries = Vec::new();
        for line in maps.lines() {
            let mut fields = line.split_whitespace();
            let Some(range) = fields.next() else { continue };
            let Some(perms) = fields.next() else { continue };
            let Some((start_s, end_s)) = range.split_once('-') else {
                continue;
            };
            let Ok(start) = usize::from_str_radix(start_s, 16) else {
                continue;
            };
            let Ok(end) = usize::from_str_radix(end_s, 16) else {
                continue;
            };
            let perms = perms.as_bytes();
            let protection = Protection {
                read: perms.first() == Some(&b'r'),
                write: perms.get(1) == Some(&b'w'),
                execute: perms.get(2) == Some(&b'x'),
            };
            let path = line
                .split_whitespace()
                .nth(5)
                .filter(|p| !p.is_empty())
                .map(str::to_string);
            entries.push(MapsEntry {
                start,
                end,
                protection,
                path,
            });
        }
        entries
    }

    fn kind_of(entry: &MapsEntry) -> MemoryKind {
        match &entry.path {
            Some(p) if p.starts_with('/') => MemoryKind::Image,
            Some(_) => MemoryKind::Private, // [heap], [stack], [vdso], ...
            None => MemoryKind::Private,
        }
    }

    pub fn query(address: usize) -> Result<RegionInfo> {
        let entries = parse_maps();
        for (i, entry) in entries.iter().enumerate() {
            if address >= entry.start && address < entry.end {
                return Ok(RegionInfo {
                    base: entry.start,
                    size: entry.end - entry.start,
                    protection: entry.protection,
                    state: MemoryState::Commit,
                    kind: kind_of(entry),
                });
            }
            if address < entry.start {
                // Unmapped gap before this entry.
                let gap_start = if i == 0 { 0 } else { entries[i - 1].end };
                return Ok(RegionInfo {
                    base: gap_start,
                    size: entry.start - gap_start,
                    protection: Protection::new(false, false, false),
                    state: MemoryState::Free,
                    kind: MemoryKind::Private,
                });
            }
        }
        Err(Error::MemoryAccess {
            address,
            message: "address beyond mapped space".into(),
        })
    }

    pub fn alloc(size: usize) -> Result<usize> {
        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                return Err(Error::MemoryAccess {
                    address: 0,
                    message: format!("mmap failed: {}", std::io::Error::last_os_error()),
                });
            }
            Ok(ptr as usize)
        }
    }

    #[cfg(target_os = "linux")]
    pub fn alloc_near(near: usize, size: usize, max_distance: usize) -> Option<usize> {
        let page = page_size();
        let win_start = near.saturating_sub(max_distance) & !(page - 1);
        let win_end = near.saturating_add(max_distance) & !(page - 1);

        // Walk the gaps between mapped regions inside the window and take the
        // first fixed mapping the kernel accepts.
        let entries = parse_maps();
        let mut prev_end = win_start;
        for entry in &entries {
            if entry.start > win_end {
                break;
            }
            if entry.start > prev_end {
                let gap_start = prev_end;
                let gap_end = entry.start.min(win_end);
                if gap_end > gap_start && gap_end - gap_start >= size {
                    let candidate = near.clamp(gap_start, gap_end - size) & !(page - 1);
                    if candidate >= gap_start {
                        if let Some(base) = try_map_at(candidate, size) {
                            return Some(base);
                        }
                    }
                }
            }
            prev_end = prev_end.max(entry.end);
        }
        if prev_end < win_end && win_end - prev_end >= size {
            let candidate = near.clamp(prev_end, win_end - size) & !(page - 1);
            if let Some(base) = try_map_at(candidate, size) {
                return Some(base);
            }
        }
        None
    }

    #[cfg(not(target_os = "linux"))]
    pub fn alloc_near(_near: usize, _size: usize, _max_distance: usize) -> Option<usize> {
        None
    }

    #[cfg(target_os = "linux")]
    fn try_map_at(address: usize, size: usize) -> Option<usize> {
        unsafe {
            let ptr = libc::mmap(
                address as *mut libc::c_void,
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            );
            if ptr == libc::MAP_FAILED {
                None
            } else {
                Some(ptr as usize)
            }
        }
    }

    pub fn free(base: usize, size: usize) -> Result<()> {
        unsafe {
            if libc::munmap(base as *mut libc::c_void, size) != 0 {
                return Err(Error::MemoryAccess {
                    address: base,
                    message: format!("munmap failed: {}", std::io::Error::last_os_error()),
                });
            }
        }
        Ok(())
    }

    pub fn protect(address: usize, size: usize, prot: Protection) -> Result<Protection> {
        let page = page_size();
        let start = address & !(page - 1);
        let end = (address + size + page - 1) & !(page - 1);

        let old = query(address).map(|r| r.protection).unwrap_or(Protection::rw());

        let mut flags = 0;
        if prot.read {
            flags |= libc::PROT_READ;
        }
        if prot.write {
            flags |= libc::PROT_WRITE;
        }
        if prot.execute {
            flags |= libc::PROT_EXEC;
        }

        unsafe {
            if libc::mprotect(start as *mut libc::c_void, end - start, flags) != 0 {
                return Err(Error::Protection {
                    address,
                    message: format!("mprotect failed: {}", std::io::Error::last_os_error()),
                });
            }
        }
        Ok(old)
    }

    pub fn flush_instruction_cache(_address: usize, _len: usize) {
        // x86-64 keeps instruction and data caches coherent.
    }
}

pub use imp::{alloc, alloc_near, flush_instruction_cache, free, protect, query};

/// Next region strictly above `info`.
pub fn query_above(info: &RegionInfo) -> Option<RegionInfo> {
    let next = info.end();
    if next == 0 {
        return None;
    }
    query(next).ok()
}

/// Region containing the byte just below `info`.
pub fn query_below(info: &RegionInfo) -> Option<RegionInfo> {
    if info.base == 0 {
        return None;
    }
    query(info.base - 1).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_within_reach() {
        assert!(within_reach(0x1000, 0x1000, 0x2000));
        assert!(within_reach(0x2000, 0x1000, 0x1000));
        assert!(!within_reach(0x1000, 0x1000, 0x1000 + REL32_REACH + 1));
        // Far end of the region must also be encodable.
        assert!(!within_reach(REL32_REACH, 0x1000, 0x10));
    }

    #[test]
    fn test_alloc_free_roundtrip() {
        let size = page_size();
        let base = alloc(size).unwrap();
        assert_ne!(base, 0);
        unsafe {
            std::ptr::write(base as *mut u8, 0xC3);
            assert_eq!(std::ptr::read(base as *const u8), 0xC3);
        }
        free(base, size).unwrap();
    }

    #[test]
    fn test_query_own_code() {
        let here = test_query_own_code as usize;
        let info = query(here).unwrap();
        assert!(info.contains(here));
        assert!(info.protection.execute);
        assert_eq!(info.state, MemoryState::Commit);
    }

    #[test]
    fn test_alloc_near_stays_in_reach() {
        let near = test_alloc_near_stays_in_reach as usize;
        // A gigabyte window avoids flakiness from ASLR fragmentation.
        if let Some(base) = alloc_near(near, page_size(), 0x4000_0000) {
            let dist = base.abs_diff(near);
            assert!(dist <= 0x4000_0000 + page_size());
            free(base, page_size()).unwrap();
        }
    }

    #[test]
    fn test_protect_roundtrip() {
        let size = page_size();
        let base = alloc(size).unwrap();
        let old = protect(base, size, Protection::rx()).unwrap();
        assert!(old.write);
        let old = protect(base, size, Protection::rwx()).unwrap();
        assert!(!old.write);
        free(base, size).unwrap();
    }

    #[test]
    fn test_write_code_into_fresh_region() {
        let size = page_size();
        let base = alloc(size).unwrap();
        write_code(base, &[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(read_bytes(base, 3), vec![0x90, 0x90, 0xC3]);
        zero(base, 3);
        assert_eq!(read_bytes(base, 3), vec![0, 0, 0]);
        free(base, size).unwrap();
    }
}
