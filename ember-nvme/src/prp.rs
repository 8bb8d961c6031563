//! Physical Region Page data pointers.
//!
//! A command's data buffer is described by two PRP entries. Transfers
//! within two memory pages fit in the entries themselves; anything larger
//! points the second entry at a list of page addresses. One list page is
//! enough for every transfer this driver issues, so lists never chain.

use ember_pal::DmaBuffer;
use zerocopy::byteorder::{LittleEndian, U64};

use crate::error::{NvmeError, NvmeResult};

/// Memory page size the controller is configured for.
pub const PAGE_SIZE: usize = 4096;
/// Number of entries in one PRP list page.
pub const PRP_LIST_ENTRIES: usize = PAGE_SIZE / size_of::<u64>();
/// Largest transfer expressible with a single PRP list.
pub const MAX_TRANSFER: usize = PRP_LIST_ENTRIES * PAGE_SIZE;

/// The two data pointer entries of a command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrpPair {
    pub prp1: u64,
    pub prp2: u64,
}

/// Builds the data pointers for a transfer of `len` bytes at `buf_addr`.
///
/// When the transfer spans more than two pages the page addresses are
/// written to `list` starting at `list_offset`, which must be page
/// aligned so the list never crosses a page boundary.
pub fn fill(
    list: &mut DmaBuffer,
    list_offset: usize,
    buf_addr: u64,
    len: usize,
) -> NvmeResult<PrpPair> {
    debug_assert!(len != 0, "empty transfer");
    debug_assert!(list_offset % PAGE_SIZE == 0, "list offset not page aligned");

    let page = PAGE_SIZE as u64;
    let into_page = (buf_addr % page) as usize;
    let total = into_page + len;
    if total <= PAGE_SIZE {
        return Ok(PrpPair { prp1: buf_addr, prp2: 0 });
    }

    let second_page = (buf_addr & !(page - 1)) + page;
    if total <= 2 * PAGE_SIZE {
        return Ok(PrpPair { prp1: buf_addr, prp2: second_page });
    }

    // Every page after the first needs a list entry.
    let pages = (total - PAGE_SIZE).div_ceil(PAGE_SIZE);
    if pages > PRP_LIST_ENTRIES {
        log::warn!("fill: {} byte transfer needs {} prp entries", len, pages);
        return Err(NvmeError::InvalidParameter);
    }
    for i in 0..pages {
        let entry = U64::<LittleEndian>::new(second_page + i as u64 * page);
        list.write(list_offset + i * size_of::<u64>(), entry);
    }
    Ok(PrpPair {
        prp1: buf_addr,
        prp2: list.bus_addr() + list_offset as u64,
    })
}
