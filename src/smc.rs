//! Secure World transport — the "send a call, get a result" primitive and
//! one thin typed wrapper per outbound call the proxy issues.
//!
//! In production the transport is an `smc #0` from the privileged exception
//! level; tests substitute a stub secure partition manager. Calls are
//! synchronous and issued one at a time under the proxy lock.

use crate::defs::*;
use crate::error::Error;

/// The outbound call primitive. Arguments travel in x0-x7, results come
/// back in x0-x3 (the remaining words are ignored by the proxy).
pub trait SecureWorld {
    fn call(&self, regs: CallRegs) -> CallRegs;
}

/// Check a response for the opcode the protocol state expects. A response
/// with any other opcode is never acted upon.
pub fn expect(res: CallRegs, opcode: u32) -> Result<CallRegs, Error> {
    match res.func_id() {
        id if id == opcode => Ok(res),
        FFA_ERROR => Err(Error::SecureWorld(FfaStatus::from_reg(res.arg(2)))),
        other => Err(Error::Protocol(other)),
    }
}

pub fn version<S: SecureWorld>(secure: &S, requested: u32) -> u64 {
    secure
        .call(CallRegs::call(FFA_VERSION, [requested as u64, 0, 0, 0, 0, 0, 0]))
        .arg(0)
}

pub fn id_get<S: SecureWorld>(secure: &S) -> CallRegs {
    secure.call(CallRegs::call(FFA_ID_GET, [0; 7]))
}

pub fn features<S: SecureWorld>(secure: &S, feat_id: u32) -> CallRegs {
    secure.call(CallRegs::call(FFA_FEATURES, [feat_id as u64, 0, 0, 0, 0, 0, 0]))
}

pub fn rxtx_map<S: SecureWorld>(secure: &S, tx_pa: u64, rx_pa: u64, npages: u64) -> Result<(), Error> {
    let res = secure.call(CallRegs::call(
        FFA_FN64_RXTX_MAP,
        [tx_pa, rx_pa, npages, 0, 0, 0, 0],
    ));
    if res.func_id() == FFA_SUCCESS {
        Ok(())
    } else {
        Err(Error::SecureWorld(FfaStatus::from_reg(res.arg(2))))
    }
}

pub fn rxtx_unmap<S: SecureWorld>(secure: &S, id: u16) -> Result<(), Error> {
    let res = secure.call(CallRegs::call(FFA_RXTX_UNMAP, [id as u64, 0, 0, 0, 0, 0, 0]));
    if res.func_id() == FFA_SUCCESS {
        Ok(())
    } else {
        Err(Error::SecureWorld(FfaStatus::from_reg(res.arg(2))))
    }
}

pub fn mem_xfer<S: SecureWorld>(secure: &S, func_id: u32, len: u32, fraglen: u32) -> CallRegs {
    secure.call(CallRegs::call(
        func_id,
        [len as u64, fraglen as u64, 0, 0, 0, 0, 0],
    ))
}

pub fn mem_frag_tx<S: SecureWorld>(
    secure: &S,
    handle_lo: u32,
    handle_hi: u32,
    fraglen: u32,
    endpoint_id: u32,
) -> CallRegs {
    secure.call(CallRegs::call(
        FFA_MEM_FRAG_TX,
        [
            handle_lo as u64,
            handle_hi as u64,
            fraglen as u64,
            endpoint_id as u64,
            0,
            0,
            0,
        ],
    ))
}

pub fn mem_frag_rx<S: SecureWorld>(
    secure: &S,
    handle_lo: u32,
    handle_hi: u32,
    fragoff: u32,
) -> CallRegs {
    secure.call(CallRegs::call(
        FFA_MEM_FRAG_RX,
        [
            handle_lo as u64,
            handle_hi as u64,
            fragoff as u64,
            HOST_ID as u64,
            0,
            0,
            0,
        ],
    ))
}

pub fn mem_reclaim<S: SecureWorld>(
    secure: &S,
    handle_lo: u32,
    handle_hi: u32,
    flags: u32,
) -> Result<(), Error> {
    let res = secure.call(CallRegs::call(
        FFA_MEM_RECLAIM,
        [handle_lo as u64, handle_hi as u64, flags as u64, 0, 0, 0, 0],
    ));
    if res.func_id() == FFA_SUCCESS {
        Ok(())
    } else {
        Err(Error::SecureWorld(FfaStatus::from_reg(res.arg(2))))
    }
}

pub fn retrieve_req<S: SecureWorld>(secure: &S, len: u32) -> CallRegs {
    secure.call(CallRegs::call(
        FFA_FN64_MEM_RETRIEVE_REQ,
        [len as u64, len as u64, 0, 0, 0, 0, 0],
    ))
}

pub fn rx_release<S: SecureWorld>(secure: &S) -> CallRegs {
    secure.call(CallRegs::call(FFA_RX_RELEASE, [0; 7]))
}

/// VM availability framework message to one registered partition; the
/// endpoint being created/destroyed travels in w5.
pub fn availability_msg<S: SecureWorld>(secure: &S, partition: u16, msg: u64, endpoint: u16) -> CallRegs {
    secure.call(CallRegs::call(
        FFA_MSG_SEND_DIRECT_REQ,
        [partition as u64, msg, 0, 0, endpoint as u64, 0, 0],
    ))
}

pub fn partition_info_get<S: SecureWorld>(secure: &S, uuid: [u64; 4], flags: u64) -> CallRegs {
    secure.call(CallRegs::call(
        FFA_PARTITION_INFO_GET,
        [uuid[0], uuid[1], uuid[2], uuid[3], flags, 0, 0],
    ))
}
