//! FF-A protocol definitions — function IDs, status codes, register blocks.
//!
//! Function IDs and status values follow DEN0077A. Only the subset the proxy
//! mediates or explicitly rejects is named here; everything else is matched
//! by range via [`is_ffa_call`].

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// FF-A memory granule. The spec counts memory in 4K pages regardless of
/// the current translation granule.
pub const FFA_PAGE_SIZE: usize = 4096;

/// Local page size. Must be at least the granularity the Secure World
/// requires for the RXTX buffers (checked during version negotiation).
pub const PAGE_SIZE: usize = 4096;

/// Size of one message-box (RX or TX) buffer, in local pages.
pub const MBOX_NR_PAGES: usize = 1;

/// Message-box size in bytes; every staged descriptor fragment is bounded
/// by this.
pub const MBOX_SIZE: usize = MBOX_NR_PAGES * PAGE_SIZE;

/// Scratch descriptor buffer size in pages. Sized at init; holds the
/// largest reassembled retrieve response and the painted guest descriptors.
pub const SCRATCH_NR_PAGES: usize = 4;

/// Endpoint table capacity: slot 0 is the host, the rest are guests.
pub const MAX_ENDPOINTS: usize = 8;

/// Bound on the append-only list of partitions registered for VM
/// availability messages.
pub const MAX_REGISTERED_PARTITIONS: usize = 8;

/// "ID value 0 must be returned at the Non-secure physical FF-A instance".
/// Shared between the proxy and the host.
pub const HOST_ID: u16 = 0;

// ── Function IDs ─────────────────────────────────────────────────────

pub const FFA_ERROR: u32 = 0x8400_0060;
pub const FFA_SUCCESS: u32 = 0x8400_0061;
pub const FFA_INTERRUPT: u32 = 0x8400_0062;
pub const FFA_VERSION: u32 = 0x8400_0063;
pub const FFA_FEATURES: u32 = 0x8400_0064;
pub const FFA_RX_RELEASE: u32 = 0x8400_0065;
pub const FFA_RXTX_MAP: u32 = 0x8400_0066;
pub const FFA_FN64_RXTX_MAP: u32 = 0xC400_0066;
pub const FFA_RXTX_UNMAP: u32 = 0x8400_0067;
pub const FFA_PARTITION_INFO_GET: u32 = 0x8400_0068;
pub const FFA_ID_GET: u32 = 0x8400_0069;
pub const FFA_MSG_POLL: u32 = 0x8400_006A;
pub const FFA_MSG_WAIT: u32 = 0x8400_006B;
pub const FFA_YIELD: u32 = 0x8400_006C;
pub const FFA_RUN: u32 = 0x8400_006D;
pub const FFA_MSG_SEND: u32 = 0x8400_006E;
pub const FFA_MSG_SEND_DIRECT_REQ: u32 = 0x8400_006F;
pub const FFA_FN64_MSG_SEND_DIRECT_REQ: u32 = 0xC400_006F;
pub const FFA_MSG_SEND_DIRECT_RESP: u32 = 0x8400_0070;
pub const FFA_FN64_MSG_SEND_DIRECT_RESP: u32 = 0xC400_0070;
pub const FFA_MEM_DONATE: u32 = 0x8400_0071;
pub const FFA_FN64_MEM_DONATE: u32 = 0xC400_0071;
pub const FFA_MEM_LEND: u32 = 0x8400_0072;
pub const FFA_FN64_MEM_LEND: u32 = 0xC400_0072;
pub const FFA_MEM_SHARE: u32 = 0x8400_0073;
pub const FFA_FN64_MEM_SHARE: u32 = 0xC400_0073;
pub const FFA_MEM_RETRIEVE_REQ: u32 = 0x8400_0074;
pub const FFA_FN64_MEM_RETRIEVE_REQ: u32 = 0xC400_0074;
pub const FFA_MEM_RETRIEVE_RESP: u32 = 0x8400_0075;
pub const FFA_MEM_RELINQUISH: u32 = 0x8400_0076;
pub const FFA_MEM_RECLAIM: u32 = 0x8400_0077;
pub const FFA_MEM_OP_PAUSE: u32 = 0x8400_0078;
pub const FFA_MEM_OP_RESUME: u32 = 0x8400_0079;
pub const FFA_MEM_FRAG_RX: u32 = 0x8400_007A;
pub const FFA_MEM_FRAG_TX: u32 = 0x8400_007B;

const SMCCC_FAST_CALL: u32 = 1 << 31;
const SMCCC_OWNER_MASK: u32 = 0x3F << 24;
const SMCCC_OWNER_STANDARD: u32 = 4 << 24;
const FFA_MIN_FUNC_NUM: u32 = 0x60;
const FFA_MAX_FUNC_NUM: u32 = 0x7B;

/// Does this function ID fall within the FF-A range?
///
/// Fast calls owned by the standard service, both 32- and 64-bit calling
/// conventions. Anything else is not ours to mediate.
pub fn is_ffa_call(func_id: u32) -> bool {
    let num = func_id & 0xFFFF;
    func_id & SMCCC_FAST_CALL != 0
        && func_id & SMCCC_OWNER_MASK == SMCCC_OWNER_STANDARD
        && (FFA_MIN_FUNC_NUM..=FFA_MAX_FUNC_NUM).contains(&num)
}

// ── Status codes ─────────────────────────────────────────────────────

/// FF-A status words, returned in w2 of an `FFA_ERROR` response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum FfaStatus {
    NotSupported = -1,
    InvalidParameters = -2,
    NoMemory = -3,
    Busy = -4,
    Interrupted = -5,
    Denied = -6,
    Retry = -7,
    Aborted = -8,
    NoData = -9,
}

impl FfaStatus {
    /// Decode a status word read from a response register. Unknown values
    /// collapse to `Aborted` so they are never mistaken for success.
    pub fn from_reg(reg: u64) -> Self {
        Self::try_from(reg as u32 as i32).unwrap_or(Self::Aborted)
    }
}

// ── Versioning ───────────────────────────────────────────────────────

/// An FF-A version word: bits [30:16] major, [15:0] minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(pub u32);

impl Version {
    pub const V1_0: Version = Version(0x1_0000);
    pub const V1_1: Version = Version(0x1_0001);

    pub fn major(self) -> u16 {
        ((self.0 >> 16) & 0x7FFF) as u16
    }

    pub fn minor(self) -> u16 {
        self.0 as u16
    }
}

// ── Feature properties ───────────────────────────────────────────────

/// `FFA_FEATURES(FFA_FN64_RXTX_MAP)` reports the minimum buffer size the
/// Secure World accepts, as one of these codes in w2.
pub const FEAT_RXTX_MIN_SZ_4K: u64 = 0;
pub const FEAT_RXTX_MIN_SZ_64K: u64 = 1;
pub const FEAT_RXTX_MIN_SZ_16K: u64 = 2;

// ── Framework messages ───────────────────────────────────────────────

/// Bit 31 of the direct-request message word marks a framework message.
pub const FRAMEWORK_MSG_FLAG: u64 = 1 << 31;
/// VM availability framework messages (DEN0077A, VM availability protocol).
pub const FRAMEWORK_MSG_VM_CREATED: u64 = FRAMEWORK_MSG_FLAG | 0x4;
pub const FRAMEWORK_MSG_VM_DESTROYED: u64 = FRAMEWORK_MSG_FLAG | 0x6;

bitflags::bitflags! {
    /// Partition properties advertised by `FFA_PARTITION_INFO_GET`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PartitionProperties: u32 {
        const NOTIFY_VM_CREATED = 1 << 6;
        const NOTIFY_VM_DESTROYED = 1 << 7;
    }
}

impl PartitionProperties {
    /// Both availability bits must be set for a partition to receive VM
    /// lifecycle messages.
    pub fn supports_vm_availability(self) -> bool {
        self.contains(Self::NOTIFY_VM_CREATED | Self::NOTIFY_VM_DESTROYED)
    }
}

/// Size of one partition-info descriptor in an FF-A v1.0 response, which
/// lacks the size field v1.1 added.
pub const PARTITION_INFO_SZ_V1_0: usize = 8;

/// Count-only queries (v1.1 flags bit 0) return no descriptors.
pub const PARTITION_INFO_GET_COUNT_ONLY: u64 = 1;

// ── Register blocks ──────────────────────────────────────────────────

/// One SMCCC register window (x0-x7), used for both the trapped call view
/// and the outbound Secure World call/result.
///
/// Results occupy x0-x3: the status word plus up to three data words.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallRegs(pub [u64; 8]);

impl CallRegs {
    pub fn new(regs: [u64; 8]) -> Self {
        Self(regs)
    }

    /// Build an outbound call: function ID plus up to seven arguments.
    pub fn call(func_id: u32, args: [u64; 7]) -> Self {
        let mut regs = [0u64; 8];
        regs[0] = func_id as u64;
        regs[1..8].copy_from_slice(&args);
        Self(regs)
    }

    pub fn func_id(&self) -> u32 {
        self.0[0] as u32
    }

    pub fn arg(&self, n: usize) -> u64 {
        self.0[n]
    }

    /// Write a result (x0-x3) back into this register window, leaving
    /// x4-x7 untouched.
    pub fn set_result(&mut self, res: &CallRegs) {
        self.0[..4].copy_from_slice(&res.0[..4]);
    }

    /// An `FFA_ERROR` response. Status words are 32-bit signed values in
    /// w2 and are not sign-extended to 64 bits.
    pub fn error(status: FfaStatus) -> Self {
        let mut regs = [0u64; 8];
        regs[0] = FFA_ERROR as u64;
        regs[2] = i32::from(status) as u32 as u64;
        Self(regs)
    }

    /// An `FFA_SUCCESS` response carrying one property word in w2.
    pub fn success(prop: u64) -> Self {
        let mut regs = [0u64; 8];
        regs[0] = FFA_SUCCESS as u64;
        regs[2] = prop;
        Self(regs)
    }
}

/// Transfer handles travel as two u32 register words.
pub fn pack_handle(lo: u32, hi: u32) -> u64 {
    (lo as u64) | ((hi as u64) << 32)
}

pub fn handle_lo(handle: u64) -> u32 {
    handle as u32
}

pub fn handle_hi(handle: u64) -> u32 {
    (handle >> 32) as u32
}

/// Page-granule alignment check used on every caller-supplied address.
pub fn page_aligned(addr: u64) -> bool {
    addr & (PAGE_SIZE as u64 - 1) == 0
}
