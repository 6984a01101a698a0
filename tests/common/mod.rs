//! Test doubles: a stub secure partition manager and a page-ownership
//! table standing in for the stage-2 authority.
//!
//! The stub SPMC keeps real share records, honours the fragmentation
//! protocol and reads/writes the proxy's staging buffers through the
//! addresses the proxy registers, so the proxy logic is exercised against
//! an in-process model of the secure side rather than canned responses.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use ffa_proxy::authority::{AuthorityError, MemoryAuthority};
use ffa_proxy::defs::*;
use ffa_proxy::descriptors::{
    AddrRange, CompositeDesc, MemAccessDesc, MemRegionDesc, PartitionInfo,
};
use ffa_proxy::mailbox::Page;
use ffa_proxy::smc::SecureWorld;
use zerocopy::IntoBytes;

// ── Descriptor builders ──────────────────────────────────────────────

/// Lay out a v1.1 share/lend descriptor the way a caller builds it in its
/// TX buffer. Returns the descriptor length.
pub fn build_share_descriptor(
    buf: &mut [u8],
    sender_id: u16,
    ranges: &[(u64, u32)],
    total_page_count: u32,
) -> usize {
    let hdr = MemRegionDesc {
        sender_id,
        ep_access_size: core::mem::size_of::<MemAccessDesc>() as u32,
        ep_access_count: 1,
        ep_access_offset: 48,
        ..Default::default()
    };
    hdr.write_to_prefix(buf).unwrap();

    let access = MemAccessDesc {
        receiver_id: 0x8001,
        composite_offset: 64,
        ..Default::default()
    };
    access.write_to_prefix(&mut buf[48..]).unwrap();

    let composite = CompositeDesc {
        total_page_count,
        range_count: ranges.len() as u32,
        reserved: 0,
    };
    composite.write_to_prefix(&mut buf[64..]).unwrap();

    let mut offset = 80;
    for &(address, page_count) in ranges {
        let range = AddrRange {
            address,
            page_count,
            reserved: 0,
        };
        range.write_to_prefix(&mut buf[offset..]).unwrap();
        offset += 16;
    }
    offset
}

/// A bare constituent array, as carried by a fragment continuation.
pub fn build_fragment(buf: &mut [u8], ranges: &[(u64, u32)]) -> usize {
    let mut offset = 0;
    for &(address, page_count) in ranges {
        let range = AddrRange {
            address,
            page_count,
            reserved: 0,
        };
        range.write_to_prefix(&mut buf[offset..]).unwrap();
        offset += 16;
    }
    offset
}

// ── Stub SPMC ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ShareRecord {
    pub handle: u64,
    pub ranges: Vec<(u64, u32)>,
    /// Total transmitted length; nonzero while fragments are outstanding.
    pub pending_len: usize,
    pub received_len: usize,
}

#[derive(Default)]
struct SpmcState {
    /// FFA_VERSION answer; u32::MAX means "answer NOT_SUPPORTED".
    version_answer: u32,
    granularity: u64,
    own_id_for_proxy: u64,
    mapped: Option<(u64, u64)>,
    map_count: usize,
    unmap_count: usize,
    rx_release_count: usize,
    next_handle: u64,
    shares: Vec<ShareRecord>,
    /// Handle of a transfer whose next FRAG_TX is rejected.
    reject_frag_for: Option<u64>,
    /// Reject the next share/lend outright.
    reject_next_xfer: bool,
    /// Handles whose MEM_RECLAIM is refused.
    refuse_reclaim: Vec<u64>,
    /// Retrieve responses are split into chunks of this many bytes
    /// (0 = whole response at once).
    retrieve_chunk: usize,
    /// Partition descriptors served by PARTITION_INFO_GET.
    partitions: Vec<PartitionInfo>,
    /// (partition, message, endpoint) triples received as direct requests.
    pub availability_msgs: Vec<(u16, u64, u16)>,
    /// Refuse availability messages with this status.
    refuse_availability: Option<i32>,
}

#[derive(Clone)]
pub struct StubSpmc(Rc<RefCell<SpmcState>>);

impl Default for StubSpmc {
    fn default() -> Self {
        Self::new()
    }
}

impl StubSpmc {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(SpmcState {
            version_answer: Version::V1_1.0,
            granularity: FEAT_RXTX_MIN_SZ_4K,
            own_id_for_proxy: HOST_ID as u64,
            next_handle: 1,
            ..Default::default()
        })))
    }

    pub fn set_version_answer(&self, v: u32) {
        self.0.borrow_mut().version_answer = v;
    }

    pub fn set_unsupported(&self) {
        self.0.borrow_mut().version_answer = u32::MAX;
    }

    pub fn set_granularity(&self, g: u64) {
        self.0.borrow_mut().granularity = g;
    }

    pub fn reject_next_xfer(&self) {
        self.0.borrow_mut().reject_next_xfer = true;
    }

    pub fn reject_frag_for(&self, handle: u64) {
        self.0.borrow_mut().reject_frag_for = Some(handle);
    }

    pub fn refuse_reclaim(&self, handle: u64) {
        self.0.borrow_mut().refuse_reclaim.push(handle);
    }

    pub fn set_retrieve_chunk(&self, bytes: usize) {
        self.0.borrow_mut().retrieve_chunk = bytes;
    }

    pub fn add_partition(&self, id: u16, properties: u32) {
        self.0.borrow_mut().partitions.push(PartitionInfo {
            id,
            exec_ctx_count: 1,
            properties,
        });
    }

    pub fn refuse_availability(&self, status: i32) {
        self.0.borrow_mut().refuse_availability = Some(status);
    }

    pub fn map_count(&self) -> usize {
        self.0.borrow().map_count
    }

    pub fn unmap_count(&self) -> usize {
        self.0.borrow().unmap_count
    }

    pub fn rx_release_count(&self) -> usize {
        self.0.borrow().rx_release_count
    }

    pub fn share_count(&self) -> usize {
        self.0.borrow().shares.len()
    }

    pub fn share(&self, handle: u64) -> Option<ShareRecord> {
        self.0
            .borrow()
            .shares
            .iter()
            .find(|s| s.handle == handle)
            .cloned()
    }

    pub fn availability_msgs(&self) -> Vec<(u16, u64, u16)> {
        self.0.borrow().availability_msgs.clone()
    }

    /// Copy the proxy's TX buffer into an aligned page so the crate's own
    /// descriptor parsing can be reused on it.
    fn read_tx(&self, len: usize) -> Box<Page> {
        let st = self.0.borrow();
        let (tx, _) = st.mapped.expect("proxy buffers not mapped");
        assert!(len <= PAGE_SIZE);
        let mut page = Box::new(Page([0u8; PAGE_SIZE]));
        unsafe { core::ptr::copy_nonoverlapping(tx as *const u8, page.0.as_mut_ptr(), len) };
        page
    }

    fn write_rx(&self, bytes: &[u8]) {
        let st = self.0.borrow();
        let (_, rx) = st.mapped.expect("proxy buffers not mapped");
        assert!(bytes.len() <= MBOX_SIZE);
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), rx as *mut u8, bytes.len()) };
    }

    /// Parse the constituents out of a staged transaction descriptor.
    fn parse_ranges(&self, frag: &[u8]) -> (u64, Vec<(u64, u32)>) {
        let layout =
            ffa_proxy::descriptors::validate_transaction(frag, Version::V1_1).expect("descriptor");
        let ranges =
            ffa_proxy::descriptors::ranges(frag, layout.composite_offset, layout.range_count)
                .expect("ranges");
        (
            layout.total_page_count as u64,
            ranges.iter().map(|r| (r.address, r.page_count)).collect(),
        )
    }

    fn do_xfer(&self, regs: CallRegs) -> CallRegs {
        let len = regs.arg(1) as usize;
        let fraglen = regs.arg(2) as usize;

        let reject = {
            let mut st = self.0.borrow_mut();
            core::mem::take(&mut st.reject_next_xfer)
        };
        if reject {
            return CallRegs::error(FfaStatus::Denied);
        }

        let frag = self.read_tx(fraglen);
        let (_, ranges) = self.parse_ranges(&frag.0[..fraglen]);

        let mut st = self.0.borrow_mut();
        let handle = st.next_handle;
        st.next_handle += 1;
        let complete = fraglen == len;
        st.shares.push(ShareRecord {
            handle,
            ranges,
            pending_len: if complete { 0 } else { len },
            received_len: fraglen,
        });
        drop(st);

        if complete {
            let mut res = CallRegs::default();
            res.0[0] = FFA_SUCCESS as u64;
            res.0[2] = handle_lo(handle) as u64;
            res.0[3] = handle_hi(handle) as u64;
            res
        } else {
            let mut res = CallRegs::default();
            res.0[0] = FFA_MEM_FRAG_RX as u64;
            res.0[1] = handle_lo(handle) as u64;
            res.0[2] = handle_hi(handle) as u64;
            res.0[3] = fraglen as u64;
            res
        }
    }

    fn do_frag_tx(&self, regs: CallRegs) -> CallRegs {
        let handle = pack_handle(regs.arg(1) as u32, regs.arg(2) as u32);
        let fraglen = regs.arg(3) as usize;

        {
            let mut st = self.0.borrow_mut();
            if st.reject_frag_for == Some(handle) {
                st.reject_frag_for = None;
                // A rejected fragment kills the whole transaction.
                st.shares.retain(|s| s.handle != handle);
                return CallRegs::error(FfaStatus::Denied);
            }
        }

        let frag = self.read_tx(fraglen);
        let more: Vec<(u64, u32)> = ffa_proxy::descriptors::fragment_ranges(&frag.0[..fraglen])
            .expect("fragment")
            .iter()
            .map(|r| (r.address, r.page_count))
            .collect();

        let mut st = self.0.borrow_mut();
        let share = st
            .shares
            .iter_mut()
            .find(|s| s.handle == handle)
            .expect("unknown transfer");
        share.ranges.extend(more);
        share.received_len += fraglen;
        let done = share.received_len >= share.pending_len;
        let received = share.received_len;
        if done {
            share.pending_len = 0;
        }

        let mut res = CallRegs::default();
        if done {
            res.0[0] = FFA_SUCCESS as u64;
        } else {
            res.0[0] = FFA_MEM_FRAG_RX as u64;
            res.0[1] = handle_lo(handle) as u64;
            res.0[2] = handle_hi(handle) as u64;
            res.0[3] = received as u64;
        }
        res
    }

    fn build_retrieve_response(&self, record: &ShareRecord) -> Vec<u8> {
        let mut buf = vec![0u8; 80 + record.ranges.len() * 16];
        let hdr = MemRegionDesc {
            sender_id: HOST_ID,
            handle: record.handle,
            ep_access_size: 16,
            ep_access_count: 1,
            ep_access_offset: 48,
            ..Default::default()
        };
        hdr.write_to_prefix(&mut buf).unwrap();
        let access = MemAccessDesc {
            receiver_id: 0x8001,
            composite_offset: 64,
            ..Default::default()
        };
        access.write_to_prefix(&mut buf[48..]).unwrap();
        let composite = CompositeDesc {
            total_page_count: record.ranges.iter().map(|(_, c)| c).sum(),
            range_count: record.ranges.len() as u32,
            reserved: 0,
        };
        composite.write_to_prefix(&mut buf[64..]).unwrap();
        for (i, &(address, page_count)) in record.ranges.iter().enumerate() {
            let range = AddrRange {
                address,
                page_count,
                reserved: 0,
            };
            range.write_to_prefix(&mut buf[80 + i * 16..]).unwrap();
        }
        buf
    }

    fn do_retrieve_req(&self, regs: CallRegs) -> CallRegs {
        let len = regs.arg(1) as usize;
        let req = self.read_tx(len);
        let (hdr, _) =
            <MemRegionDesc as zerocopy::FromBytes>::read_from_prefix(&req.0[..len]).unwrap();
        let record = match self.share(hdr.handle) {
            Some(r) => r,
            None => return CallRegs::error(FfaStatus::InvalidParameters),
        };

        let response = self.build_retrieve_response(&record);
        let total = response.len();
        let chunk = {
            let st = self.0.borrow();
            if st.retrieve_chunk == 0 {
                total
            } else {
                st.retrieve_chunk.min(total)
            }
        };
        self.write_rx(&response[..chunk]);

        let mut res = CallRegs::default();
        res.0[0] = FFA_MEM_RETRIEVE_RESP as u64;
        res.0[1] = total as u64;
        res.0[2] = chunk as u64;
        res
    }

    fn do_frag_rx(&self, regs: CallRegs) -> CallRegs {
        let handle = pack_handle(regs.arg(1) as u32, regs.arg(2) as u32);
        let fragoff = regs.arg(3) as usize;
        let record = match self.share(handle) {
            Some(r) => r,
            None => return CallRegs::error(FfaStatus::InvalidParameters),
        };
        let response = self.build_retrieve_response(&record);
        let chunk_size = {
            let st = self.0.borrow();
            if st.retrieve_chunk == 0 {
                response.len()
            } else {
                st.retrieve_chunk
            }
        };
        let chunk = chunk_size.min(response.len() - fragoff);
        self.write_rx(&response[fragoff..fragoff + chunk]);

        let mut res = CallRegs::default();
        res.0[0] = FFA_MEM_FRAG_TX as u64;
        res.0[1] = handle_lo(handle) as u64;
        res.0[2] = handle_hi(handle) as u64;
        res.0[3] = chunk as u64;
        res
    }

    fn do_partition_info(&self, _regs: CallRegs) -> CallRegs {
        let st = self.0.borrow();
        let count = st.partitions.len();
        let mut bytes = Vec::new();
        for p in &st.partitions {
            bytes.extend_from_slice(p.as_bytes());
        }
        drop(st);
        self.write_rx(&bytes);

        let mut res = CallRegs::default();
        res.0[0] = FFA_SUCCESS as u64;
        res.0[2] = count as u64;
        res.0[3] = core::mem::size_of::<PartitionInfo>() as u64;
        res
    }
}

impl SecureWorld for StubSpmc {
    fn call(&self, regs: CallRegs) -> CallRegs {
        match regs.func_id() {
            FFA_VERSION => {
                let answer = self.0.borrow().version_answer;
                let mut res = CallRegs::default();
                if answer == u32::MAX {
                    res.0[0] = i32::from(FfaStatus::NotSupported) as u32 as u64;
                } else {
                    res.0[0] = answer as u64;
                }
                res
            }
            FFA_ID_GET => {
                let id = self.0.borrow().own_id_for_proxy;
                CallRegs::success(id)
            }
            FFA_FEATURES => CallRegs::success(self.0.borrow().granularity),
            FFA_FN64_RXTX_MAP => {
                let mut st = self.0.borrow_mut();
                st.mapped = Some((regs.arg(1), regs.arg(2)));
                st.map_count += 1;
                CallRegs::success(0)
            }
            FFA_RXTX_UNMAP => {
                let mut st = self.0.borrow_mut();
                st.mapped = None;
                st.unmap_count += 1;
                CallRegs::success(0)
            }
            FFA_RX_RELEASE => {
                self.0.borrow_mut().rx_release_count += 1;
                CallRegs::success(0)
            }
            FFA_FN64_MEM_SHARE | FFA_FN64_MEM_LEND => self.do_xfer(regs),
            FFA_MEM_FRAG_TX => self.do_frag_tx(regs),
            FFA_FN64_MEM_RETRIEVE_REQ => self.do_retrieve_req(regs),
            FFA_MEM_FRAG_RX => self.do_frag_rx(regs),
            FFA_MEM_RECLAIM => {
                let handle = pack_handle(regs.arg(1) as u32, regs.arg(2) as u32);
                let mut st = self.0.borrow_mut();
                if st.refuse_reclaim.contains(&handle) {
                    return CallRegs::error(FfaStatus::Denied);
                }
                let before = st.shares.len();
                st.shares.retain(|s| s.handle != handle);
                if st.shares.len() == before {
                    CallRegs::error(FfaStatus::InvalidParameters)
                } else {
                    CallRegs::success(0)
                }
            }
            FFA_MSG_SEND_DIRECT_REQ => {
                let mut st = self.0.borrow_mut();
                let partition = regs.arg(1) as u16;
                let msg = regs.arg(2);
                let endpoint = regs.arg(5) as u16;
                st.availability_msgs.push((partition, msg, endpoint));
                let mut res = CallRegs::default();
                res.0[0] = FFA_MSG_SEND_DIRECT_RESP as u64;
                res.0[3] = st
                    .refuse_availability
                    .map(|s| s as u32 as u64)
                    .unwrap_or(0);
                res
            }
            FFA_PARTITION_INFO_GET => self.do_partition_info(regs),
            other => {
                // Anything else reaching the stub is a mediation bug.
                panic!("stub SPMC received unexpected call {other:#x}");
            }
        }
    }
}

// ── Mock ownership authority ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Owned,
    SharedWithProxy,
    SharedWithSecure,
}

struct PageEntry {
    pa: u64,
    state: PageState,
    pins: u32,
    not_present: bool,
    backing: Option<*mut u8>,
}

#[derive(Default)]
struct AuthorityState {
    pages: HashMap<(u16, u64), PageEntry>,
    /// Backing storage for mailbox pages registered through the mock.
    mailboxes: Vec<Box<Page>>,
    fail_oom_once: bool,
}

#[derive(Clone, Default)]
pub struct MockAuthority(Rc<RefCell<AuthorityState>>);

impl MockAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a host-owned page (physical address is the address).
    pub fn add_host_page(&self, pa: u64) {
        self.add_guest_page(HOST_ID, pa, pa);
    }

    /// Register a guest-owned page with its physical translation.
    pub fn add_guest_page(&self, endpoint: u16, addr: u64, pa: u64) {
        self.0.borrow_mut().pages.insert(
            (endpoint, addr),
            PageEntry {
                pa,
                state: PageState::Owned,
                pins: 0,
                not_present: false,
                backing: None,
            },
        );
    }

    /// Allocate a real page to back a mailbox buffer and register it as
    /// owned by `endpoint`. Returns its (page-aligned) address.
    pub fn alloc_mailbox_page(&self, endpoint: u16) -> u64 {
        let mut page = Box::new(Page([0u8; PAGE_SIZE]));
        let ptr = page.0.as_mut_ptr();
        let addr = ptr as u64;
        let mut st = self.0.borrow_mut();
        st.mailboxes.push(page);
        st.pages.insert(
            (endpoint, addr),
            PageEntry {
                pa: addr,
                state: PageState::Owned,
                pins: 0,
                not_present: false,
                backing: Some(ptr),
            },
        );
        addr
    }

    /// Raw access to a mailbox page's backing, for writing descriptors.
    pub fn page_ptr(&self, endpoint: u16, addr: u64) -> *mut u8 {
        self.0.borrow().pages[&(endpoint, addr)]
            .backing
            .expect("not a mailbox page")
    }

    pub fn write_page(&self, endpoint: u16, addr: u64, bytes: &[u8]) {
        let ptr = self.page_ptr(endpoint, addr);
        unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    }

    pub fn set_not_present(&self, endpoint: u16, addr: u64) {
        self.0
            .borrow_mut()
            .pages
            .get_mut(&(endpoint, addr))
            .unwrap()
            .not_present = true;
    }

    /// Resolve a page fault the proxy bounced back to the run loop.
    pub fn resolve(&self, endpoint: u16, addr: u64) {
        self.0
            .borrow_mut()
            .pages
            .get_mut(&(endpoint, addr))
            .unwrap()
            .not_present = false;
    }

    pub fn fail_oom_once(&self) {
        self.0.borrow_mut().fail_oom_once = true;
    }

    pub fn state(&self, endpoint: u16, addr: u64) -> Option<PageState> {
        self.0
            .borrow()
            .pages
            .get(&(endpoint, addr))
            .map(|p| p.state)
    }

    pub fn pins(&self, endpoint: u16, addr: u64) -> u32 {
        self.0.borrow().pages[&(endpoint, addr)].pins
    }

    /// Every page of `endpoint` currently marked shared with the secure
    /// side.
    pub fn secure_shared(&self, endpoint: u16) -> Vec<u64> {
        let mut v: Vec<u64> = self
            .0
            .borrow()
            .pages
            .iter()
            .filter(|((ep, _), p)| *ep == endpoint && p.state == PageState::SharedWithSecure)
            .map(|((_, addr), _)| *addr)
            .collect();
        v.sort_unstable();
        v
    }
}

impl MemoryAuthority for MockAuthority {
    fn share_with_proxy(&self, endpoint: u16, addr: u64) -> Result<*mut u8, AuthorityError> {
        let mut st = self.0.borrow_mut();
        let page = st
            .pages
            .get_mut(&(endpoint, addr))
            .ok_or(AuthorityError::NotOwned)?;
        if page.not_present {
            return Err(AuthorityError::NotPresent);
        }
        match page.state {
            PageState::Owned => {
                page.state = PageState::SharedWithProxy;
                Ok(page.backing.expect("mailbox pages carry backing"))
            }
            PageState::SharedWithProxy => Err(AuthorityError::AlreadyShared),
            PageState::SharedWithSecure => Err(AuthorityError::NotOwned),
        }
    }

    fn unshare_with_proxy(&self, endpoint: u16, addr: u64) -> Result<(), AuthorityError> {
        let mut st = self.0.borrow_mut();
        let page = st
            .pages
            .get_mut(&(endpoint, addr))
            .ok_or(AuthorityError::NotOwned)?;
        if page.state != PageState::SharedWithProxy {
            return Err(AuthorityError::NotOwned);
        }
        page.state = PageState::Owned;
        Ok(())
    }

    fn pin(&self, endpoint: u16, addr: u64) -> Result<(), AuthorityError> {
        let mut st = self.0.borrow_mut();
        let page = st
            .pages
            .get_mut(&(endpoint, addr))
            .ok_or(AuthorityError::NotOwned)?;
        if page.state != PageState::SharedWithProxy {
            return Err(AuthorityError::NotOwned);
        }
        page.pins += 1;
        Ok(())
    }

    fn unpin(&self, endpoint: u16, addr: u64) {
        if let Some(page) = self.0.borrow_mut().pages.get_mut(&(endpoint, addr)) {
            page.pins = page.pins.saturating_sub(1);
        }
    }

    fn share_with_secure(
        &self,
        endpoint: u16,
        addr: u64,
        pages: u64,
    ) -> Result<u64, AuthorityError> {
        let mut st = self.0.borrow_mut();
        if st.fail_oom_once {
            st.fail_oom_once = false;
            return Err(AuthorityError::OutOfMemory);
        }

        // All-or-nothing over the whole range.
        for i in 0..pages {
            let page_addr = addr + i * PAGE_SIZE as u64;
            let page = st
                .pages
                .get(&(endpoint, page_addr))
                .ok_or(AuthorityError::NotOwned)?;
            if page.not_present {
                return Err(AuthorityError::NotPresent);
            }
            if page.state != PageState::Owned {
                return Err(AuthorityError::AlreadyShared);
            }
        }
        for i in 0..pages {
            let page_addr = addr + i * PAGE_SIZE as u64;
            st.pages.get_mut(&(endpoint, page_addr)).unwrap().state =
                PageState::SharedWithSecure;
        }
        Ok(st.pages[&(endpoint, addr)].pa)
    }

    fn unshare_with_secure(
        &self,
        endpoint: u16,
        addr: u64,
        pages: u64,
    ) -> Result<(), AuthorityError> {
        let mut st = self.0.borrow_mut();
        for i in 0..pages {
            let page_addr = addr + i * PAGE_SIZE as u64;
            let page = st
                .pages
                .get(&(endpoint, page_addr))
                .ok_or(AuthorityError::NotOwned)?;
            if page.state != PageState::SharedWithSecure {
                return Err(AuthorityError::NotOwned);
            }
        }
        for i in 0..pages {
            let page_addr = addr + i * PAGE_SIZE as u64;
            st.pages.get_mut(&(endpoint, page_addr)).unwrap().state = PageState::Owned;
        }
        Ok(())
    }
}
