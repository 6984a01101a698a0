//! FF-A proxy — validates and mediates memory-sharing calls issued by the
//! host or by guests before they reach the Secure World.
//!
//! Each trapped call is either forwarded on unmodified, rejected as
//! unsupported, or accompanied by an ownership check/update against the
//! stage-2 authority and reissued. Any attempt to make memory accessible
//! to the secure side that the caller does not exclusively own fails the
//! ownership transition and never reaches the wire.
//!
//! To allow rolling back page-ownership updates and FF-A calls when a
//! multi-phase operation fails partway, every operation touching the RXTX
//! buffers runs under one lock and is therefore serialised.

use core::array;

use log::{debug, warn};
use spin::Mutex;

use crate::authority::{AuthorityError, MemoryAuthority};
use crate::defs::*;
use crate::descriptors::{self, AddrRange};
use crate::error::{Error, InitError, RunRequest};
use crate::mailbox::{DescriptorBuf, EndpointBuffers, MappedPage};
use crate::smc::{self, SecureWorld};
use crate::transfer::{donation_pages, MemTransfer};

/// Outcome of a host call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    /// Mediated locally; the result registers were written back.
    Handled,
    /// Not ours to mediate: forward the call to the Secure World
    /// unmodified. Firmware is trusted by architecture.
    Forward,
}

/// Outcome of a guest call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOutcome {
    /// Mediated locally; the result registers were written back.
    Handled,
    /// Not mediated: forward through the vCPU call-forwarding path with
    /// the guest's endpoint identifier attached as the client ID.
    Forward { client_id: u16 },
    /// The run loop must perform a side effect, then re-issue the call.
    Retry(RunRequest),
}

/// Is a given FF-A function supported, either by forwarding on directly
/// or by handling here?
pub fn call_supported(func_id: u32) -> bool {
    !matches!(
        func_id,
        // Unsupported memory management calls
        FFA_FN64_MEM_RETRIEVE_REQ
            | FFA_MEM_RETRIEVE_RESP
            | FFA_MEM_RELINQUISH
            | FFA_MEM_OP_PAUSE
            | FFA_MEM_OP_RESUME
            | FFA_MEM_FRAG_RX
            | FFA_FN64_MEM_DONATE
            // Indirect message passing via RX/TX buffers
            | FFA_MSG_SEND
            | FFA_MSG_POLL
            | FFA_MSG_WAIT
            // 32-bit variants of 64-bit calls
            | FFA_MSG_SEND_DIRECT_RESP
            | FFA_RXTX_MAP
            | FFA_MEM_DONATE
            | FFA_MEM_RETRIEVE_REQ
    )
}

struct VersionState {
    version: Version,
    negotiated: bool,
}

struct ProxyState {
    /// The proxy's own TX staging page(s), mapped into the SPMD.
    hyp_tx: DescriptorBuf,
    /// The proxy's own RX page(s); the SPMD writes retrieve responses here.
    hyp_rx: DescriptorBuf,
    /// Scratch area for painted descriptors and reassembled retrieve
    /// responses, sized at init.
    scratch: DescriptorBuf,
    /// How many endpoints currently map the shared hyp buffer pair.
    refcnt: u16,
    endpoints: [EndpointBuffers; MAX_ENDPOINTS],
    /// Partitions that opted in to VM availability messages. Populated on
    /// the first partition discovery, append-only.
    registered: heapless::Vec<u16, MAX_REGISTERED_PARTITIONS>,
    /// Pages stuck in the shared state after a failed rollback. They can
    /// never be shared or donated again, but their contents stay
    /// unreadable to the secure side; this is lost availability, not lost
    /// confidentiality.
    stranded_pages: u64,
    /// Rollback failures whose page extent is unknown (host multi-fragment
    /// transfers carry no local range records).
    stranded_events: u64,
}

/// The mediation engine. Generic over the Secure World transport and the
/// stage-2 ownership authority so the protocol logic is testable without
/// either.
pub struct FfaProxy<S, A> {
    secure: S,
    authority: A,
    state: Mutex<ProxyState>,
    version: Mutex<VersionState>,
}

impl<S: SecureWorld, A: MemoryAuthority> FfaProxy<S, A> {
    /// Probe the Secure World for FF-A support and size the staging
    /// buffers. Fails with [`InitError::Unavailable`] when the secure side
    /// does not implement FF-A at all.
    pub fn new(secure: S, authority: A) -> Result<Self, InitError> {
        let answer = smc::version(&secure, Version::V1_1.0);
        if answer as u32 as i32 == i32::from(FfaStatus::NotSupported) {
            return Err(InitError::Unavailable);
        }

        // Firmware returns the highest version it supports; anything with
        // a different major number is not backwards-compatible with us.
        let secure_version = Version(answer as u32);
        if secure_version.major() != 1 {
            return Err(InitError::IncompatibleVersion(secure_version.0));
        }
        let version = if secure_version.minor() < Version::V1_1.minor() {
            secure_version
        } else {
            Version::V1_1
        };

        let state = ProxyState {
            hyp_tx: DescriptorBuf::new(MBOX_NR_PAGES).map_err(|_| InitError::NoMemory)?,
            hyp_rx: DescriptorBuf::new(MBOX_NR_PAGES).map_err(|_| InitError::NoMemory)?,
            scratch: DescriptorBuf::new(SCRATCH_NR_PAGES).map_err(|_| InitError::NoMemory)?,
            refcnt: 0,
            endpoints: array::from_fn(|_| EndpointBuffers::new()),
            registered: heapless::Vec::new(),
            stranded_pages: 0,
            stranded_events: 0,
        };

        debug!("ffa proxy initialised, local version {:#x}", version.0);

        Ok(Self {
            secure,
            authority,
            state: Mutex::new(state),
            version: Mutex::new(VersionState {
                version,
                negotiated: false,
            }),
        })
    }

    /// The resolved protocol version, once negotiation has completed.
    pub fn negotiated_version(&self) -> Option<Version> {
        let vs = self.version.lock();
        vs.negotiated.then_some(vs.version)
    }

    /// How many endpoints currently map the shared buffer pair.
    pub fn shared_buffer_refs(&self) -> u16 {
        self.state.lock().refcnt
    }

    /// Pages stranded in the shared state by failed rollbacks.
    pub fn stranded_pages(&self) -> u64 {
        self.state.lock().stranded_pages
    }

    /// Rollback failures of unknown page extent.
    pub fn stranded_events(&self) -> u64 {
        self.state.lock().stranded_events
    }

    fn negotiated(&self) -> bool {
        self.version.lock().negotiated
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Handle a trapped host call. The register window carries the
    /// function ID and arguments in; results are written back to x0-x3.
    pub fn handle_host_call(&self, regs: &mut CallRegs) -> HostOutcome {
        let func_id = regs.func_id();

        // Non-standard SMCs are not ours to judge; the architecture
        // requires trusting EL3 anyway, so they are forwarded unmodified.
        if !is_ffa_call(func_id) {
            return HostOutcome::Forward;
        }

        if !self.negotiated() && func_id != FFA_VERSION {
            regs.set_result(&CallRegs::error(FfaStatus::InvalidParameters));
            return HostOutcome::Handled;
        }

        match func_id {
            FFA_FEATURES => match self.do_features(regs) {
                Some(res) => regs.set_result(&res),
                None => return HostOutcome::Forward,
            },
            FFA_VERSION => {
                let res = self.do_version(regs);
                regs.set_result(&res);
            }
            // Memory management
            FFA_FN64_RXTX_MAP => {
                let r = self.do_rxtx_map(regs, HOST_ID);
                self.complete_host(regs, r);
            }
            FFA_RXTX_UNMAP => {
                let r = self.do_rxtx_unmap(regs, HOST_ID);
                self.complete_host(regs, r);
            }
            FFA_MEM_SHARE | FFA_FN64_MEM_SHARE => {
                let r = self.do_mem_xfer(FFA_FN64_MEM_SHARE, regs, HOST_ID);
                self.complete_host(regs, r);
            }
            FFA_MEM_LEND | FFA_FN64_MEM_LEND => {
                let r = self.do_mem_xfer(FFA_FN64_MEM_LEND, regs, HOST_ID);
                self.complete_host(regs, r);
            }
            FFA_MEM_RECLAIM => {
                let r = self.do_mem_reclaim(regs, HOST_ID);
                self.complete_host(regs, r);
            }
            FFA_MEM_FRAG_TX => {
                let r = self.do_mem_frag_tx(regs);
                self.complete_host(regs, r);
            }
            FFA_PARTITION_INFO_GET => {
                let r = self.do_partition_info(regs, HOST_ID);
                self.complete_host(regs, r);
            }
            _ => {
                if call_supported(func_id) {
                    return HostOutcome::Forward;
                }
                regs.set_result(&CallRegs::error(FfaStatus::NotSupported));
            }
        }

        HostOutcome::Handled
    }

    /// Handle a trapped guest call for the guest owning `endpoint`.
    pub fn handle_guest_call(&self, regs: &mut CallRegs, endpoint: u16) -> GuestOutcome {
        if endpoint == HOST_ID || endpoint as usize >= MAX_ENDPOINTS {
            regs.set_result(&CallRegs::error(FfaStatus::Denied));
            return GuestOutcome::Handled;
        }

        let func_id = regs.func_id();
        if !is_ffa_call(func_id) {
            return GuestOutcome::Forward {
                client_id: endpoint,
            };
        }

        if !self.negotiated() && func_id != FFA_VERSION {
            regs.set_result(&CallRegs::error(FfaStatus::InvalidParameters));
            return GuestOutcome::Handled;
        }

        match func_id {
            FFA_FEATURES => match self.do_features(regs) {
                Some(res) => regs.set_result(&res),
                None => {
                    return GuestOutcome::Forward {
                        client_id: endpoint,
                    }
                }
            },
            FFA_VERSION => {
                let res = self.do_version(regs);
                regs.set_result(&res);
            }
            FFA_FN64_RXTX_MAP => {
                let r = self.do_rxtx_map(regs, endpoint);
                return self.complete_guest(regs, r);
            }
            FFA_RXTX_UNMAP => {
                let r = self.do_rxtx_unmap(regs, endpoint);
                return self.complete_guest(regs, r);
            }
            FFA_MEM_SHARE | FFA_FN64_MEM_SHARE => {
                let r = self.do_mem_xfer(FFA_FN64_MEM_SHARE, regs, endpoint);
                return self.complete_guest(regs, r);
            }
            FFA_MEM_LEND | FFA_FN64_MEM_LEND => {
                let r = self.do_mem_xfer(FFA_FN64_MEM_LEND, regs, endpoint);
                return self.complete_guest(regs, r);
            }
            FFA_MEM_RECLAIM => {
                let r = self.do_mem_reclaim(regs, endpoint);
                return self.complete_guest(regs, r);
            }
            FFA_ID_GET => regs.set_result(&CallRegs::success(endpoint as u64)),
            FFA_PARTITION_INFO_GET => {
                let r = self.do_partition_info(regs, endpoint);
                return self.complete_guest(regs, r);
            }
            _ => {
                if call_supported(func_id) {
                    return GuestOutcome::Forward {
                        client_id: endpoint,
                    };
                }
                regs.set_result(&CallRegs::error(FfaStatus::NotSupported));
            }
        }

        GuestOutcome::Handled
    }

    fn complete_host(&self, regs: &mut CallRegs, result: Result<CallRegs, Error>) {
        match result {
            Ok(res) => regs.set_result(&res),
            Err(e) => {
                if let Some(rq) = e.run_request() {
                    // Host memory is always resident and the host donates
                    // through its own channel; a suspension here means the
                    // authority misclassified the endpoint.
                    warn!("suspension {rq:?} on a host call");
                    regs.set_result(&CallRegs::error(FfaStatus::Denied));
                } else {
                    regs.set_result(&CallRegs::error(e.status()));
                }
            }
        }
    }

    fn complete_guest(&self, regs: &mut CallRegs, result: Result<CallRegs, Error>) -> GuestOutcome {
        match result {
            Ok(res) => {
                regs.set_result(&res);
                GuestOutcome::Handled
            }
            Err(e) => match e.run_request() {
                Some(rq) => GuestOutcome::Retry(rq),
                None => {
                    regs.set_result(&CallRegs::error(e.status()));
                    GuestOutcome::Handled
                }
            },
        }
    }

    // ── Version negotiation ──────────────────────────────────────────

    fn do_features(&self, regs: &CallRegs) -> Option<CallRegs> {
        let id = regs.arg(1) as u32;

        if !call_supported(id) {
            return Some(CallRegs::error(FfaStatus::NotSupported));
        }

        match id {
            FFA_MEM_SHARE | FFA_FN64_MEM_SHARE | FFA_MEM_LEND | FFA_FN64_MEM_LEND => {
                // No support for dynamically allocated buffers
                Some(CallRegs::success(0))
            }
            _ => None,
        }
    }

    fn do_version(&self, regs: &CallRegs) -> CallRegs {
        let requested = Version(regs.arg(1) as u32);

        let not_supported = {
            let mut res = CallRegs::default();
            res.0[0] = i32::from(FfaStatus::NotSupported) as u32 as u64;
            res
        };

        if requested.major() != 1 {
            return not_supported;
        }

        let mut vs = self.version.lock();
        if vs.negotiated {
            let mut res = CallRegs::default();
            res.0[0] = vs.version.0 as u64;
            return res;
        }

        // A client downgrading the minor version is only honoured if the
        // secure side accepts the downgrade when asked directly.
        if requested.minor() < vs.version.minor() {
            let answer = smc::version(&self.secure, requested.0);
            if answer as u32 as i32 == i32::from(FfaStatus::NotSupported) {
                return not_supported;
            }
            vs.version = requested;
        }

        if self.post_negotiation_probe().is_err() {
            not_supported
        } else {
            vs.negotiated = true;
            let mut res = CallRegs::default();
            res.0[0] = vs.version.0 as u64;
            res
        }
    }

    /// One-time capability probe run when negotiation resolves: the secure
    /// side must assign us the host ID and must not require RXTX buffers
    /// larger than our page size.
    fn post_negotiation_probe(&self) -> Result<(), Error> {
        let res = smc::expect(smc::id_get(&self.secure), FFA_SUCCESS)?;
        if res.arg(2) != HOST_ID as u64 {
            return Err(Error::Denied);
        }

        let res = smc::expect(smc::features(&self.secure, FFA_FN64_RXTX_MAP), FFA_SUCCESS)?;
        let min_rxtx_sz = match res.arg(2) {
            FEAT_RXTX_MIN_SZ_4K => 4096,
            FEAT_RXTX_MIN_SZ_64K => 65536,
            FEAT_RXTX_MIN_SZ_16K => 16384,
            _ => return Err(Error::Denied),
        };
        if min_rxtx_sz > PAGE_SIZE {
            return Err(Error::Denied);
        }

        Ok(())
    }

    // ── RXTX buffer lifecycle ────────────────────────────────────────

    /// Map the proxy's own buffer pair into the SPMD, once, on the first
    /// endpoint mapping. Later mappings only take a reference.
    fn map_hyp_buffers(&self, st: &mut ProxyState) -> Result<(), Error> {
        if st.refcnt == u16::MAX {
            return Err(Error::Busy);
        }
        st.refcnt += 1;
        if st.refcnt > 1 {
            return Ok(());
        }

        let npages = (MBOX_NR_PAGES * PAGE_SIZE / FFA_PAGE_SIZE) as u64;
        match smc::rxtx_map(&self.secure, st.hyp_tx.pa(), st.hyp_rx.pa(), npages) {
            Ok(()) => Ok(()),
            Err(e) => {
                st.refcnt = 0;
                Err(e)
            }
        }
    }

    /// Drop one reference; unmap from the SPMD only when nobody references
    /// the pair any more.
    fn unmap_hyp_buffers(&self, st: &mut ProxyState) {
        debug_assert!(st.refcnt > 0);
        st.refcnt -= 1;
        if st.refcnt == 0 {
            if let Err(e) = smc::rxtx_unmap(&self.secure, HOST_ID) {
                warn!("secure world refused buffer unmap: {e}");
            }
        }
    }

    fn do_rxtx_map(&self, regs: &CallRegs, endpoint: u16) -> Result<CallRegs, Error> {
        let tx_addr = regs.arg(1);
        let rx_addr = regs.arg(2);
        let npages = regs.arg(3) as u32;

        if npages as usize != MBOX_NR_PAGES * PAGE_SIZE / FFA_PAGE_SIZE {
            return Err(Error::InvalidParameters);
        }
        if !page_aligned(tx_addr) || !page_aligned(rx_addr) {
            return Err(Error::InvalidParameters);
        }

        let registered = self.state.lock().registered.clone();
        self.notify_availability(endpoint, FRAMEWORK_MSG_VM_CREATED, &registered)?;

        let mut st = self.state.lock();
        let st = &mut *st;
        if st.endpoints[endpoint as usize].is_mapped() {
            return Err(Error::Denied);
        }

        // Map our own buffers into the SPMD before mapping and pinning the
        // endpoint's buffers in our address space.
        self.map_hyp_buffers(st)?;

        let mapped = if endpoint == HOST_ID {
            self.map_host_pair(tx_addr, rx_addr)
        } else {
            self.map_guest_pair(endpoint, tx_addr, rx_addr)
        };
        let (tx, rx) = match mapped {
            Ok(pair) => pair,
            Err(e) => {
                self.unmap_hyp_buffers(st);
                return Err(e);
            }
        };

        let entry = &mut st.endpoints[endpoint as usize];
        entry.tx = Some(tx);
        entry.rx = Some(rx);
        entry.tx_addr = tx_addr;
        entry.rx_addr = rx_addr;

        Ok(CallRegs::success(0))
    }

    /// Share-and-pin both host pages, unwinding whatever already succeeded
    /// when a later step fails. Host addresses are physical.
    fn map_host_pair(&self, tx_addr: u64, rx_addr: u64) -> Result<(MappedPage, MappedPage), Error> {
        let a = &self.authority;

        let tx_va = a
            .share_with_proxy(HOST_ID, tx_addr)
            .map_err(|_| Error::InvalidParameters)?;

        let rx_va = match a.share_with_proxy(HOST_ID, rx_addr) {
            Ok(va) => va,
            Err(_) => {
                self.unwind_share(HOST_ID, tx_addr);
                return Err(Error::InvalidParameters);
            }
        };

        if a.pin(HOST_ID, tx_addr).is_err() {
            self.unwind_share(HOST_ID, rx_addr);
            self.unwind_share(HOST_ID, tx_addr);
            return Err(Error::InvalidParameters);
        }

        if a.pin(HOST_ID, rx_addr).is_err() {
            a.unpin(HOST_ID, tx_addr);
            self.unwind_share(HOST_ID, rx_addr);
            self.unwind_share(HOST_ID, tx_addr);
            return Err(Error::InvalidParameters);
        }

        Ok((MappedPage::new(tx_va), MappedPage::new(rx_va)))
    }

    /// Guest buffers must first be made accessible to this trust domain.
    /// A non-resident page or exhausted bookkeeping suspends the guest
    /// instead of failing the map outright.
    fn map_guest_pair(
        &self,
        endpoint: u16,
        tx_addr: u64,
        rx_addr: u64,
    ) -> Result<(MappedPage, MappedPage), Error> {
        let a = &self.authority;

        let tx_va = a
            .share_with_proxy(endpoint, tx_addr)
            .map_err(|e| guest_recoverable(e, tx_addr))?;

        let rx_va = match a.share_with_proxy(endpoint, rx_addr) {
            Ok(va) => va,
            Err(e) => {
                self.unwind_share(endpoint, tx_addr);
                return Err(guest_recoverable(e, rx_addr));
            }
        };

        if a.pin(endpoint, tx_addr).is_err() {
            self.unwind_share(endpoint, rx_addr);
            self.unwind_share(endpoint, tx_addr);
            return Err(Error::Denied);
        }

        if a.pin(endpoint, rx_addr).is_err() {
            a.unpin(endpoint, tx_addr);
            self.unwind_share(endpoint, rx_addr);
            self.unwind_share(endpoint, tx_addr);
            return Err(Error::Denied);
        }

        Ok((MappedPage::new(tx_va), MappedPage::new(rx_va)))
    }

    fn unwind_share(&self, endpoint: u16, addr: u64) {
        if self.authority.unshare_with_proxy(endpoint, addr).is_err() {
            warn!("unshare of {addr:#x} failed while unwinding endpoint {endpoint}");
        }
    }

    fn do_rxtx_unmap(&self, regs: &CallRegs, endpoint: u16) -> Result<CallRegs, Error> {
        let id = regs.arg(1) as u32;

        // Callers may only unmap their own buffers, named by ID 0.
        if id != HOST_ID as u32 {
            return Err(Error::InvalidParameters);
        }

        let mut st = self.state.lock();
        let st = &mut *st;
        let entry = &mut st.endpoints[endpoint as usize];
        if !entry.is_mapped() {
            return Err(Error::InvalidParameters);
        }

        self.release_endpoint_pair(endpoint, entry);
        self.unmap_hyp_buffers(st);

        Ok(CallRegs::success(0))
    }

    /// Unpin and unshare both buffers of a mapped endpoint and clear its
    /// table entry. The shared-pair reference is dropped by the caller.
    fn release_endpoint_pair(&self, endpoint: u16, entry: &mut EndpointBuffers) {
        let a = &self.authority;
        a.unpin(endpoint, entry.tx_addr);
        self.unwind_share(endpoint, entry.tx_addr);
        a.unpin(endpoint, entry.rx_addr);
        self.unwind_share(endpoint, entry.rx_addr);

        entry.tx = None;
        entry.rx = None;
        entry.tx_addr = 0;
        entry.rx_addr = 0;
    }

    // ── Range sharing ────────────────────────────────────────────────

    /// Share a host range list with the secure side. All-or-nothing: a
    /// failure part-way undoes the prefix that did succeed.
    fn host_share_ranges(&self, ranges: &[AddrRange], stranded: &mut u64) -> Result<(), Error> {
        let mut shared = 0;
        for range in ranges {
            if self
                .authority
                .share_with_secure(HOST_ID, range.address, range.page_count as u64)
                .is_err()
            {
                break;
            }
            shared += 1;
        }
        if shared == ranges.len() {
            return Ok(());
        }

        for range in &ranges[..shared] {
            if self
                .authority
                .unshare_with_secure(HOST_ID, range.address, range.page_count as u64)
                .is_err()
            {
                warn!("rollback unshare failed for {:#x}", range.address);
                *stranded += range.page_count as u64;
            }
        }
        Err(Error::Denied)
    }

    /// Return a host range list to exclusive host ownership. A failure
    /// part-way re-shares the prefix so the transfer stays whole; its
    /// pages count as stranded.
    fn host_unshare_ranges(&self, ranges: &[AddrRange], stranded: &mut u64) -> Result<(), Error> {
        let mut unshared = 0;
        for range in ranges {
            if self
                .authority
                .unshare_with_secure(HOST_ID, range.address, range.page_count as u64)
                .is_err()
            {
                break;
            }
            unshared += 1;
        }
        if unshared == ranges.len() {
            return Ok(());
        }

        for range in &ranges[..unshared] {
            if self
                .authority
                .share_with_secure(HOST_ID, range.address, range.page_count as u64)
                .is_err()
            {
                warn!("restore share failed for {:#x}", range.address);
            }
        }
        *stranded += ranges.iter().map(|r| r.page_count as u64).sum::<u64>();
        Err(Error::Denied)
    }

    /// Share each guest page with the secure side, recording every
    /// translation in the transfer's ledger and painting one single-page
    /// constituent per page into `out`. Any failure mid-loop unshares
    /// everything this call shared before surfacing the error.
    fn guest_share_ranges(
        &self,
        endpoint: u16,
        ranges: &[AddrRange],
        transfer: &mut MemTransfer,
        out: &mut [u8],
        composite_offset: usize,
        stranded: &mut u64,
    ) -> Result<usize, Error> {
        let expected: u64 = ranges.iter().map(|r| r.page_count as u64).sum();

        let mut painted = 0usize;
        let mut failure = None;
        {
            let out_ranges = descriptors::ranges_mut(out, composite_offset, expected as usize)?;
            'outer: for range in ranges {
                for page in 0..range.page_count as u64 {
                    let guest_addr = range.address + page * PAGE_SIZE as u64;
                    let pa = match self.authority.share_with_secure(endpoint, guest_addr, 1) {
                        Ok(pa) => pa,
                        Err(e) => {
                            failure = Some(guest_recoverable(e, guest_addr));
                            break 'outer;
                        }
                    };
                    if let Err(e) = transfer.record(guest_addr, pa) {
                        if self
                            .authority
                            .unshare_with_secure(endpoint, guest_addr, 1)
                            .is_err()
                        {
                            warn!("unshare of {guest_addr:#x} failed after ledger exhaustion");
                            *stranded += 1;
                        }
                        failure = Some(e);
                        break 'outer;
                    }
                    out_ranges[painted] = AddrRange {
                        address: pa,
                        page_count: 1,
                        reserved: 0,
                    };
                    painted += 1;
                }
            }
        }

        if let Some(e) = failure {
            let painted_ranges = descriptors::ranges(out, composite_offset, painted)?;
            self.guest_unshare_ranges(endpoint, painted_ranges, transfer, stranded);
            return Err(e);
        }

        let composite = descriptors::composite_mut(out, composite_offset)?;
        composite.range_count = painted as u32;
        Ok(painted)
    }

    /// Undo a painted guest share: for each physical range, find the
    /// ledger entry that produced it and unshare the guest page.
    fn guest_unshare_ranges(
        &self,
        endpoint: u16,
        ranges: &[AddrRange],
        transfer: &mut MemTransfer,
        stranded: &mut u64,
    ) {
        for range in ranges {
            match transfer.take_translation(range.address) {
                Some(tr) => {
                    if self
                        .authority
                        .unshare_with_secure(endpoint, tr.guest_addr, 1)
                        .is_err()
                    {
                        warn!("guest unshare of {:#x} failed", tr.guest_addr);
                        *stranded += range.page_count as u64;
                    }
                }
                None => warn!("no translation recorded for pa {:#x}", range.address),
            }
        }
    }

    // ── Share / lend ─────────────────────────────────────────────────

    /// The share/lend state machine: validate, translate/share locally,
    /// forward to the secure side, then commit or roll back.
    fn do_mem_xfer(&self, func_id: u32, regs: &CallRegs, endpoint: u16) -> Result<CallRegs, Error> {
        debug_assert!(func_id == FFA_FN64_MEM_SHARE || func_id == FFA_FN64_MEM_LEND);

        let mut len = regs.arg(1) as u32 as usize;
        let mut fraglen = regs.arg(2) as u32 as usize;
        let addr_mbz = regs.arg(3);
        let npages_mbz = regs.arg(4);

        // Dynamically allocated buffers are unsupported: both MBZ.
        if addr_mbz != 0 || npages_mbz != 0 || fraglen > len || fraglen > MBOX_SIZE {
            return Err(Error::InvalidParameters);
        }
        if fraglen < descriptors::MIN_XFER_LEN {
            return Err(Error::InvalidParameters);
        }

        let guest = endpoint != HOST_ID;
        // A guest descriptor always arrives as one bounded buffer; the
        // fragmentation API is host-only.
        if guest && fraglen != len {
            return Err(Error::InvalidParameters);
        }

        let version = self.version.lock().version;

        let mut st = self.state.lock();
        let ProxyState {
            hyp_tx,
            scratch,
            endpoints,
            stranded_pages,
            ..
        } = &mut *st;

        let entry = &mut endpoints[endpoint as usize];
        let Some(tx) = entry.tx else {
            return Err(Error::InvalidParameters);
        };
        if guest {
            // Reserve the transfer slot up front so success after the
            // secure-side call cannot fail on allocation.
            entry
                .transfers
                .try_reserve(1)
                .map_err(|_| Error::DonateMemory(donation_pages(core::mem::size_of::<MemTransfer>())))?;
        }

        // Private staging copy: the caller cannot mutate the descriptor
        // under us once validation starts.
        let staging = hyp_tx.bytes_mut();
        // SAFETY: the endpoint TX page is pinned while mapped, and fraglen
        // is bounded by the message-box size above.
        unsafe { tx.read_into(&mut staging[..fraglen]) };

        let layout = descriptors::validate_transaction(&staging[..fraglen], version)?;
        let mut nr_ranges = layout.range_count;
        let mut transfer = MemTransfer::new();

        if guest {
            {
                let ranges = descriptors::ranges(staging, layout.composite_offset, nr_ranges)?;
                if layout.declared_range_count as usize != nr_ranges
                    || !descriptors::page_count_valid(ranges, layout.total_page_count)
                {
                    return Err(Error::InvalidParameters);
                }
                for range in ranges {
                    if !page_aligned(range.address) {
                        return Err(Error::InvalidParameters);
                    }
                }
            }

            // Painting splits guest ranges into one constituent per page;
            // the grown descriptor must still fit one message-box page.
            let head = layout.composite_offset + descriptors::COMPOSITE_HDR_SIZE;
            let painted_len = head + layout.total_page_count as usize * descriptors::RANGE_SIZE;
            if painted_len > MBOX_SIZE {
                return Err(Error::InvalidParameters);
            }

            let scratch_bytes = scratch.bytes_mut();
            scratch_bytes[..head].copy_from_slice(&staging[..head]);

            let painted = {
                let ranges = descriptors::ranges(staging, layout.composite_offset, nr_ranges)?;
                self.guest_share_ranges(
                    endpoint,
                    ranges,
                    &mut transfer,
                    scratch_bytes,
                    layout.composite_offset,
                    stranded_pages,
                )?
            };

            // Re-adjust the transfer size after painting with physical
            // addresses, then fold the painted constituents back into the
            // staged descriptor.
            if painted > nr_ranges {
                let extra = (painted - nr_ranges) * descriptors::RANGE_SIZE;
                fraglen += extra;
                len += extra;
            }
            nr_ranges = painted;

            staging[head..head + painted * descriptors::RANGE_SIZE]
                .copy_from_slice(&scratch_bytes[head..head + painted * descriptors::RANGE_SIZE]);
            let composite = descriptors::composite_mut(staging, layout.composite_offset)?;
            composite.range_count = painted as u32;
        } else {
            let ranges = descriptors::ranges(staging, layout.composite_offset, nr_ranges)?;
            for range in ranges {
                if !page_aligned(range.address) {
                    return Err(Error::InvalidParameters);
                }
            }
            self.host_share_ranges(ranges, stranded_pages)?;
        }

        let res = smc::mem_xfer(&self.secure, func_id, len as u32, fraglen as u32);
        let accepted = if fraglen != len {
            res.func_id() == FFA_MEM_FRAG_RX && res.arg(3) as usize == fraglen
        } else {
            res.func_id() == FFA_SUCCESS
        };

        if !accepted {
            let ranges = descriptors::ranges(staging, layout.composite_offset, nr_ranges)?;
            if guest {
                self.guest_unshare_ranges(endpoint, ranges, &mut transfer, stranded_pages);
            } else if self.host_unshare_ranges(ranges, stranded_pages).is_err() {
                warn!("host rollback failed after secure world rejection");
            }
            return Err(match res.func_id() {
                FFA_ERROR => Error::SecureWorld(FfaStatus::from_reg(res.arg(2))),
                other => Error::Protocol(other),
            });
        }

        if guest {
            // Finalised only now: the handle exists once the secure side
            // has acknowledged the transfer.
            transfer.handle = pack_handle(res.arg(2) as u32, res.arg(3) as u32);
            endpoints[endpoint as usize].transfers.push(transfer);
        }

        Ok(res)
    }

    // ── Fragment continuation (host only) ────────────────────────────

    fn do_mem_frag_tx(&self, regs: &CallRegs) -> Result<CallRegs, Error> {
        let handle_lo = regs.arg(1) as u32;
        let handle_hi = regs.arg(2) as u32;
        let fraglen = regs.arg(3) as u32 as usize;
        let endpoint_id = regs.arg(4) as u32;

        if fraglen > MBOX_SIZE || fraglen % descriptors::RANGE_SIZE != 0 {
            return Err(Error::InvalidParameters);
        }

        let mut st = self.state.lock();
        let ProxyState {
            hyp_tx,
            endpoints,
            stranded_pages,
            stranded_events,
            ..
        } = &mut *st;

        let Some(tx) = endpoints[HOST_ID as usize].tx else {
            return Err(Error::InvalidParameters);
        };

        let staging = hyp_tx.bytes_mut();
        // SAFETY: the host TX page is pinned while mapped and fraglen is
        // bounded by the message-box size above.
        unsafe { tx.read_into(&mut staging[..fraglen]) };

        let ranges = descriptors::fragment_ranges(&staging[..fraglen])?;
        for range in ranges {
            if !page_aligned(range.address) {
                return Err(Error::InvalidParameters);
            }
        }

        if let Err(share_err) = self.host_share_ranges(ranges, stranded_pages) {
            // The transaction is dead: restore the global state from
            // before the first fragment by reclaiming the whole transfer.
            if let Err(e) = smc::mem_reclaim(&self.secure, handle_lo, handle_hi, 0) {
                // Earlier fragments are now stuck in the shared state for
                // good. They cannot be shared or donated again, but their
                // contents stay unreadable to the secure side.
                warn!("abort reclaim failed ({e}); prior fragments stranded");
                *stranded_events += 1;
                return Err(Error::Aborted);
            }
            return Err(share_err);
        }

        let res = smc::mem_frag_tx(&self.secure, handle_lo, handle_hi, fraglen as u32, endpoint_id);
        if res.func_id() != FFA_SUCCESS && res.func_id() != FFA_MEM_FRAG_RX {
            if self.host_unshare_ranges(ranges, stranded_pages).is_err() {
                warn!("fragment rollback failed after secure world rejection");
            }
            if let Err(e) = smc::mem_reclaim(&self.secure, handle_lo, handle_hi, 0) {
                warn!("abort reclaim failed ({e}); prior fragments stranded");
                *stranded_events += 1;
                return Err(Error::Aborted);
            }
            return Err(match res.func_id() {
                FFA_ERROR => Error::SecureWorld(FfaStatus::from_reg(res.arg(2))),
                other => Error::Protocol(other),
            });
        }

        Ok(res)
    }

    // ── Reclaim ──────────────────────────────────────────────────────

    fn do_mem_reclaim(&self, regs: &CallRegs, endpoint: u16) -> Result<CallRegs, Error> {
        let handle_lo = regs.arg(1) as u32;
        let handle_hi = regs.arg(2) as u32;
        let flags = regs.arg(3) as u32;
        let handle = pack_handle(handle_lo, handle_hi);

        let version = self.version.lock().version;

        let mut st = self.state.lock();
        let ProxyState {
            hyp_tx,
            hyp_rx,
            scratch,
            endpoints,
            stranded_pages,
            ..
        } = &mut *st;

        let transfer_idx = if endpoint != HOST_ID {
            // A guest may only reclaim handles on its own transfer list.
            Some(
                endpoints[endpoint as usize]
                    .find_transfer(handle)
                    .ok_or(Error::InvalidParameters)?,
            )
        } else {
            // The host must never reclaim a handle a guest holds; the
            // secure side must not have issued colliding handles.
            for guest in endpoints.iter().skip(1) {
                if guest.find_transfer(handle).is_some() {
                    warn!("host reclaim of guest-held handle {handle:#x} refused");
                    return Err(Error::Denied);
                }
            }
            None
        };

        // Ask the secure side which ranges this handle covers.
        let req_len = descriptors::write_retrieve_request(hyp_tx.bytes_mut(), HOST_ID, handle);
        let res = smc::retrieve_req(&self.secure, req_len as u32);
        let res = smc::expect(res, FFA_MEM_RETRIEVE_RESP)?;

        let total_len = res.arg(1) as u32 as usize;
        let mut fraglen = res.arg(2) as u32 as usize;

        let offset = match descriptors::composite_offset(hyp_rx.bytes(), version) {
            Ok(offset) => offset,
            Err(_) => {
                let _ = smc::rx_release(&self.secure);
                return Err(Error::Aborted);
            }
        };
        // The SPMD should get this right; reject anything that looks
        // completely bogus rather than acting on it.
        if offset > total_len || fraglen > MBOX_SIZE || fraglen > total_len {
            warn!("malformed retrieve response for handle {handle:#x}");
            let _ = smc::rx_release(&self.secure);
            return Err(Error::Aborted);
        }
        if total_len > scratch.len() {
            let _ = smc::rx_release(&self.secure);
            return Err(Error::NoMemory);
        }

        // Reassemble the full descriptor, fragment by fragment.
        scratch.bytes_mut()[..fraglen].copy_from_slice(&hyp_rx.bytes()[..fraglen]);
        let _ = smc::rx_release(&self.secure);

        let mut fragoff = fraglen;
        while fragoff < total_len {
            let res = smc::mem_frag_rx(&self.secure, handle_lo, handle_hi, fragoff as u32);
            if res.func_id() != FFA_MEM_FRAG_TX {
                return Err(Error::InvalidParameters);
            }
            fraglen = res.arg(3) as u32 as usize;
            if fraglen == 0 || fraglen > MBOX_SIZE || fragoff + fraglen > total_len {
                warn!("malformed retrieve fragment for handle {handle:#x}");
                let _ = smc::rx_release(&self.secure);
                return Err(Error::Aborted);
            }
            scratch.bytes_mut()[fragoff..fragoff + fraglen]
                .copy_from_slice(&hyp_rx.bytes()[..fraglen]);
            let _ = smc::rx_release(&self.secure);
            fragoff += fraglen;
        }

        // Only after the secure side confirms the reclaim do we return
        // the pages to their owner.
        smc::mem_reclaim(&self.secure, handle_lo, handle_hi, flags)?;

        let desc = &scratch.bytes()[..total_len];
        let range_count = descriptors::retrieved_composite(desc, offset)?;
        let ranges = descriptors::ranges(desc, offset, range_count)?;

        if let Some(idx) = transfer_idx {
            let mut transfer = endpoints[endpoint as usize].transfers.swap_remove(idx);
            self.guest_unshare_ranges(endpoint, ranges, &mut transfer, stranded_pages);
            // The ledger must end empty: any entry the response did not
            // name is a page the secure side still counts as shared.
            let leftover = transfer.translation_count();
            if leftover != 0 {
                warn!("{leftover} translation(s) not named by the retrieve response");
                for tr in transfer.drain_translations() {
                    if self
                        .authority
                        .unshare_with_secure(endpoint, tr.guest_addr, 1)
                        .is_err()
                    {
                        *stranded_pages += 1;
                    }
                }
            }
        } else if self.host_unshare_ranges(ranges, stranded_pages).is_err() {
            warn!("host unshare failed after confirmed reclaim of {handle:#x}");
        }

        Ok(CallRegs::success(0))
    }

    // ── Partition discovery ──────────────────────────────────────────

    fn do_partition_info(&self, regs: &CallRegs, endpoint: u16) -> Result<CallRegs, Error> {
        let uuid = [regs.arg(1), regs.arg(2), regs.arg(3), regs.arg(4)];
        let flags = regs.arg(5);

        let version = self.version.lock().version;

        let mut st = self.state.lock();
        let ProxyState {
            hyp_rx,
            endpoints,
            registered,
            ..
        } = &mut *st;

        let Some(rx) = endpoints[endpoint as usize].rx else {
            return Err(Error::Busy);
        };

        let res = smc::expect(
            smc::partition_info_get(&self.secure, uuid, flags),
            FFA_SUCCESS,
        )?;

        let count = res.arg(2) as usize;
        if count == 0 {
            return Ok(res);
        }

        let partition_sz = if version.minor() > Version::V1_0.minor() {
            // A count-only query returns no descriptors.
            if flags & PARTITION_INFO_GET_COUNT_ONLY != 0 {
                return Ok(res);
            }
            res.arg(3) as usize
        } else {
            // FF-A v1.0 lacks the size in the response.
            PARTITION_INFO_SZ_V1_0
        };
        if partition_sz < core::mem::size_of::<descriptors::PartitionInfo>() {
            return Err(Error::Aborted);
        }

        let copy_sz = partition_sz.checked_mul(count).ok_or(Error::Aborted)?;
        if copy_sz > MBOX_SIZE {
            return Err(Error::Aborted);
        }

        // SAFETY: the endpoint RX page is pinned while mapped and copy_sz
        // is bounded by the message-box size above.
        unsafe { rx.write_from(&hyp_rx.bytes()[..copy_sz]) };

        // First discovery also registers the partitions that asked for VM
        // availability messages. Append-only, bounded.
        if registered.is_empty() {
            for i in 0..count.min(MAX_REGISTERED_PARTITIONS) {
                let info = descriptors::partition_info_at(hyp_rx.bytes(), i * partition_sz)?;
                let props = PartitionProperties::from_bits_truncate(info.properties);
                if props.supports_vm_availability() {
                    let _ = registered.push(info.id);
                }
            }
        }

        Ok(res)
    }

    // ── VM availability ──────────────────────────────────────────────

    /// Tell every registered partition about an endpoint coming or going.
    /// Any refusal fails the surrounding operation.
    fn notify_availability(
        &self,
        endpoint: u16,
        msg: u64,
        registered: &[u16],
    ) -> Result<(), Error> {
        for &partition in registered {
            let res = smc::availability_msg(&self.secure, partition, msg, endpoint);
            if res.func_id() != FFA_MSG_SEND_DIRECT_RESP {
                return Err(Error::Protocol(res.func_id()));
            }
            if res.arg(3) != 0 {
                return Err(Error::SecureWorld(FfaStatus::from_reg(res.arg(3))));
            }
        }
        Ok(())
    }

    // ── Endpoint teardown ────────────────────────────────────────────

    /// Reclaim everything a dying guest still has in flight, then release
    /// its buffers. A secure-side refusal aborts the teardown so it can
    /// be retried.
    pub fn teardown_endpoint(&self, endpoint: u16) -> Result<(), Error> {
        if endpoint == HOST_ID || endpoint as usize >= MAX_ENDPOINTS {
            return Err(Error::InvalidParameters);
        }

        let mut st = self.state.lock();
        let st = &mut *st;

        let has_state = {
            let entry = &st.endpoints[endpoint as usize];
            entry.is_mapped() || !entry.transfers.is_empty()
        };
        if !has_state {
            return Ok(());
        }

        let registered = st.registered.clone();
        self.notify_availability(endpoint, FRAMEWORK_MSG_VM_DESTROYED, &registered)?;

        loop {
            let handle = match st.endpoints[endpoint as usize].transfers.first() {
                Some(transfer) => transfer.handle,
                None => break,
            };
            smc::mem_reclaim(&self.secure, handle_lo(handle), handle_hi(handle), 0)?;

            let mut transfer = st.endpoints[endpoint as usize].transfers.remove(0);
            for tr in transfer.drain_translations() {
                if self
                    .authority
                    .unshare_with_secure(endpoint, tr.guest_addr, 1)
                    .is_err()
                {
                    warn!("teardown unshare of {:#x} failed", tr.guest_addr);
                    st.stranded_pages += 1;
                }
            }
            debug!("reclaimed transfer {handle:#x} for endpoint {endpoint}");
        }

        let entry = &mut st.endpoints[endpoint as usize];
        if entry.is_mapped() {
            self.release_endpoint_pair(endpoint, entry);
            self.unmap_hyp_buffers(st);
        }

        Ok(())
    }
}

/// Map an authority failure on a guest page to the recoverable suspension
/// it implies, or to a denial.
fn guest_recoverable(e: AuthorityError, addr: u64) -> Error {
    match e {
        AuthorityError::NotPresent => Error::ResolvePage(addr),
        AuthorityError::OutOfMemory => Error::DonateMemory(1),
        AuthorityError::NotOwned | AuthorityError::AlreadyShared => Error::Denied,
    }
}
