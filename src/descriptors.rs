//! Memory-region descriptor wire format (DEN0077A).
//!
//! `#[repr(C)]` structs matching the FF-A transaction descriptor layouts,
//! plus the structural validation performed on every staged share/lend
//! fragment before any ownership state is touched. All parsing operates on
//! a private staging copy of the caller's TX buffer, never on the live
//! buffer, so the caller cannot mutate a descriptor mid-validation.
//!
//! v1.0 and v1.1 broke ABI on the transaction descriptor: v1.0 keeps the
//! endpoint count at offset 28 with the access array at a fixed offset 32,
//! v1.1 moved the count into the header and made the array offset explicit.

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::defs::Version;
use crate::error::Error;

/// FF-A v1.1 memory transaction descriptor (Table 11.20). 48 bytes.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MemRegionDesc {
    pub sender_id: u16,
    pub attributes: u16,
    pub flags: u32,
    pub handle: u64,
    pub tag: u64,
    pub ep_access_size: u32,
    pub ep_access_count: u32,
    pub ep_access_offset: u32,
    pub reserved: [u32; 3],
}

/// FF-A v1.0 memory transaction descriptor. 32 bytes; the endpoint access
/// array follows the header directly.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MemRegionDescV1_0 {
    pub sender_id: u16,
    pub attributes: u8,
    pub reserved_0: u8,
    pub flags: u32,
    pub handle: u64,
    pub tag: u64,
    pub reserved_1: u32,
    pub ep_access_count: u32,
}

/// Endpoint memory access descriptor. 16 bytes, one per receiver.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MemAccessDesc {
    pub receiver_id: u16,
    pub permissions: u8,
    pub flags: u8,
    pub composite_offset: u32,
    pub reserved: u64,
}

/// Composite memory region header. 16 bytes, followed by the address
/// range array.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct CompositeDesc {
    pub total_page_count: u32,
    pub range_count: u32,
    pub reserved: u64,
}

/// One entry of a partition discovery response. v1.1 appends the UUID,
/// which the proxy does not consume.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PartitionInfo {
    pub id: u16,
    pub exec_ctx_count: u16,
    pub properties: u32,
}

/// One contiguous address range: base address plus a count of 4K pages.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct AddrRange {
    pub address: u64,
    pub page_count: u32,
    pub reserved: u32,
}

const_assert_eq!(core::mem::size_of::<MemRegionDesc>(), 48);
const_assert_eq!(core::mem::size_of::<MemRegionDescV1_0>(), 32);
const_assert_eq!(core::mem::size_of::<MemAccessDesc>(), 16);
const_assert_eq!(core::mem::size_of::<CompositeDesc>(), 16);
const_assert_eq!(core::mem::size_of::<AddrRange>(), 16);
const_assert_eq!(core::mem::size_of::<PartitionInfo>(), 8);

pub const RANGE_SIZE: usize = core::mem::size_of::<AddrRange>();
pub const COMPOSITE_HDR_SIZE: usize = core::mem::size_of::<CompositeDesc>();

/// Smallest fragment that can hold a transaction header and one access
/// descriptor; anything shorter is rejected before the lock is taken.
pub const MIN_XFER_LEN: usize =
    core::mem::size_of::<MemRegionDesc>() + core::mem::size_of::<MemAccessDesc>();

/// Where a staged transaction's data lives, resolved during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionLayout {
    /// Offset of the composite header from the start of the descriptor.
    pub composite_offset: usize,
    /// Range count computed from the fragment trailer size.
    pub range_count: usize,
    /// Range count the composite header declares.
    pub declared_range_count: u32,
    /// Total page count the composite header declares.
    pub total_page_count: u32,
}

/// Endpoint access count and access-array offset, per negotiated version.
fn access_array(buf: &[u8], version: Version) -> Result<(u32, usize), Error> {
    if version == Version::V1_0 {
        let (hdr, _) =
            MemRegionDescV1_0::ref_from_prefix(buf).map_err(|_| Error::InvalidParameters)?;
        Ok((hdr.ep_access_count, core::mem::size_of::<MemRegionDescV1_0>()))
    } else {
        let (hdr, _) = MemRegionDesc::ref_from_prefix(buf).map_err(|_| Error::InvalidParameters)?;
        let offset = hdr.ep_access_offset as usize;
        // The access array offset is attacker-controlled; it must keep the
        // u64 fields of the entries naturally aligned.
        if offset % 8 != 0 {
            return Err(Error::InvalidParameters);
        }
        Ok((hdr.ep_access_count, offset))
    }
}

/// Read access descriptor `0` and return the composite offset it names.
pub fn composite_offset(buf: &[u8], version: Version) -> Result<usize, Error> {
    let (_, array_offset) = access_array(buf, version)?;
    let end = array_offset
        .checked_add(core::mem::size_of::<MemAccessDesc>())
        .ok_or(Error::InvalidParameters)?;
    if end > buf.len() {
        return Err(Error::InvalidParameters);
    }
    let access =
        MemAccessDesc::ref_from_bytes(&buf[array_offset..end]).map_err(|_| Error::InvalidParameters)?;
    let offset = access.composite_offset as usize;
    if offset % 8 != 0 {
        return Err(Error::InvalidParameters);
    }
    Ok(offset)
}

/// Validate a staged share/lend fragment and locate its composite region.
///
/// Enforced here, before any ownership state is mutated: exactly one
/// endpoint access descriptor; a non-zero composite offset that, with its
/// header, stays within the fragment; and a trailer that is an exact
/// multiple of one address-range entry.
pub fn validate_transaction(buf: &[u8], version: Version) -> Result<TransactionLayout, Error> {
    let (ep_count, array_offset) = access_array(buf, version)?;
    if ep_count != 1 {
        return Err(Error::InvalidParameters);
    }

    let access_end = array_offset
        .checked_add(core::mem::size_of::<MemAccessDesc>())
        .ok_or(Error::InvalidParameters)?;
    if access_end > buf.len() {
        return Err(Error::InvalidParameters);
    }

    let offset = composite_offset(buf, version)?;
    if offset == 0 {
        return Err(Error::InvalidParameters);
    }
    let ranges_start = offset
        .checked_add(COMPOSITE_HDR_SIZE)
        .ok_or(Error::InvalidParameters)?;
    if ranges_start > buf.len() {
        return Err(Error::InvalidParameters);
    }

    let trailer = buf.len() - ranges_start;
    if trailer % RANGE_SIZE != 0 {
        return Err(Error::InvalidParameters);
    }

    let composite = CompositeDesc::ref_from_bytes(&buf[offset..ranges_start])
        .map_err(|_| Error::InvalidParameters)?;

    Ok(TransactionLayout {
        composite_offset: offset,
        range_count: trailer / RANGE_SIZE,
        declared_range_count: composite.range_count,
        total_page_count: composite.total_page_count,
    })
}

/// The address-range array of a validated transaction.
pub fn ranges(buf: &[u8], offset: usize, count: usize) -> Result<&[AddrRange], Error> {
    let start = offset + COMPOSITE_HDR_SIZE;
    let end = start
        .checked_add(count * RANGE_SIZE)
        .ok_or(Error::InvalidParameters)?;
    if end > buf.len() {
        return Err(Error::InvalidParameters);
    }
    <[AddrRange]>::ref_from_bytes(&buf[start..end]).map_err(|_| Error::InvalidParameters)
}

/// Mutable view of an address-range array, used when painting translated
/// constituents back over a staged descriptor.
pub fn ranges_mut(buf: &mut [u8], offset: usize, count: usize) -> Result<&mut [AddrRange], Error> {
    let start = offset + COMPOSITE_HDR_SIZE;
    let end = start
        .checked_add(count * RANGE_SIZE)
        .ok_or(Error::InvalidParameters)?;
    if end > buf.len() {
        return Err(Error::InvalidParameters);
    }
    <[AddrRange]>::mut_from_bytes(&mut buf[start..end]).map_err(|_| Error::InvalidParameters)
}

/// Mutable composite header of a staged transaction.
pub fn composite_mut(buf: &mut [u8], offset: usize) -> Result<&mut CompositeDesc, Error> {
    let end = offset
        .checked_add(COMPOSITE_HDR_SIZE)
        .ok_or(Error::InvalidParameters)?;
    if end > buf.len() {
        return Err(Error::InvalidParameters);
    }
    CompositeDesc::mut_from_bytes(&mut buf[offset..end]).map_err(|_| Error::InvalidParameters)
}

/// A raw fragment-continuation payload: a bare address-range array.
pub fn fragment_ranges(buf: &[u8]) -> Result<&[AddrRange], Error> {
    if buf.len() % RANGE_SIZE != 0 {
        return Err(Error::InvalidParameters);
    }
    <[AddrRange]>::ref_from_bytes(buf).map_err(|_| Error::InvalidParameters)
}

/// Does the declared total match the per-range page counts?
///
/// Guards against a descriptor whose trailer disagrees with its header; a
/// mismatch is rejected with zero pages shared.
pub fn page_count_valid(ranges: &[AddrRange], total_page_count: u32) -> bool {
    let sum: u64 = ranges.iter().map(|r| r.page_count as u64).sum();
    sum == total_page_count as u64
}

/// Range count of a composite header inside a reassembled retrieve
/// response, bounds-checked against the declared total length.
pub fn retrieved_composite(buf: &[u8], offset: usize) -> Result<usize, Error> {
    let end = offset
        .checked_add(COMPOSITE_HDR_SIZE)
        .ok_or(Error::Aborted)?;
    if end > buf.len() {
        return Err(Error::Aborted);
    }
    let composite =
        CompositeDesc::ref_from_bytes(&buf[offset..end]).map_err(|_| Error::Aborted)?;
    let count = composite.range_count as usize;
    let ranges_end = end
        .checked_add(count.checked_mul(RANGE_SIZE).ok_or(Error::Aborted)?)
        .ok_or(Error::Aborted)?;
    if ranges_end > buf.len() {
        return Err(Error::Aborted);
    }
    Ok(count)
}

/// One partition-info entry at a byte offset of a discovery response.
pub fn partition_info_at(buf: &[u8], offset: usize) -> Result<PartitionInfo, Error> {
    let end = offset
        .checked_add(core::mem::size_of::<PartitionInfo>())
        .ok_or(Error::Aborted)?;
    if end > buf.len() {
        return Err(Error::Aborted);
    }
    PartitionInfo::read_from_bytes(&buf[offset..end]).map_err(|_| Error::Aborted)
}

/// Build the minimal retrieve-request descriptor used on the reclaim path:
/// a bare transaction header naming the sender and the handle.
pub fn write_retrieve_request(buf: &mut [u8], sender_id: u16, handle: u64) -> usize {
    let desc = MemRegionDesc {
        sender_id,
        handle,
        ..Default::default()
    };
    desc.write_to_prefix(buf).expect("staging buffer holds a descriptor header");
    core::mem::size_of::<MemRegionDesc>()
}
