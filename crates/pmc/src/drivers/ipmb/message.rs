//! IPMI message framing for IPMB.
//!
//! Wire layout after the I2C address byte (which the controller generates on
//! transmit and strips on receive):
//!
//! ```text
//! netFn<<2|rsLUN, csum1, rqSA, rqSeq<<2|rqLUN, cmd, data[0..n], csum2
//! ```
//!
//! `csum1` covers `rsSA` and the netFn/LUN byte; `csum2` covers everything
//! from `rqSA` through the last data byte. Both are 2's-complement checksums:
//! the byte sum over the covered range plus the checksum is zero mod 256.

use crate::drivers::{PmcError, PmcResult};

/// Maximum IPMB data field length.
pub const IPMB_MAX_DATA: usize = 25;

/// Fixed frame overhead after the address byte: netFn/LUN, csum1, rqSA,
/// rqSeq/LUN, cmd, csum2.
const FRAME_OVERHEAD: usize = 6;

/// Longest frame this station will emit or accept (address byte excluded).
pub const IPMB_FRAME_MAX: usize = FRAME_OVERHEAD + IPMB_MAX_DATA;

/// 2's-complement checksum over `bytes`.
pub fn ipmi_checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    0u8.wrapping_sub(sum)
}

/// One IPMI message as carried on IPMB.
///
/// Unused tail bytes of `data` are always zero, so structural equality is
/// message equality.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IpmiMessage {
    /// Responder (target) slave address, 8-bit form (LSB zero).
    pub rs_sa: u8,
    /// Network function code (6 bits).
    pub netfn: u8,
    /// Responder LUN (2 bits).
    pub rs_lun: u8,
    /// Requester slave address, 8-bit form.
    pub rq_sa: u8,
    /// Requester sequence number (6 bits).
    pub rq_seq: u8,
    /// Requester LUN (2 bits).
    pub rq_lun: u8,
    /// Command code.
    pub cmd: u8,
    data_len: u8,
    data: [u8; IPMB_MAX_DATA],
}

impl IpmiMessage {
    /// Build a message with the given data field.
    ///
    /// Returns `InvalidFrame` if `data` exceeds [`IPMB_MAX_DATA`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rs_sa: u8,
        netfn: u8,
        rs_lun: u8,
        rq_sa: u8,
        rq_seq: u8,
        rq_lun: u8,
        cmd: u8,
        data: &[u8],
    ) -> PmcResult<Self> {
        if data.len() > IPMB_MAX_DATA {
            return Err(PmcError::InvalidFrame);
        }
        let mut buf = [0u8; IPMB_MAX_DATA];
        buf[..data.len()].copy_from_slice(data);
        Ok(Self {
            rs_sa,
            netfn: netfn & 0x3f,
            rs_lun: rs_lun & 0x03,
            rq_sa,
            rq_seq: rq_seq & 0x3f,
            rq_lun: rq_lun & 0x03,
            cmd,
            data_len: data.len() as u8,
            data: buf,
        })
    }

    /// Data field.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.data_len as usize]
    }

    /// Serialize to wire bytes (address byte excluded; the controller sends
    /// it from the target address).
    pub fn unparse(&self) -> heapless::Vec<u8, IPMB_FRAME_MAX> {
        let mut out = heapless::Vec::new();
        let netfn_lun = (self.netfn << 2) | self.rs_lun;
        // Frame always fits: data_len <= IPMB_MAX_DATA by construction.
        let _ = out.push(netfn_lun);
        let _ = out.push(ipmi_checksum(&[self.rs_sa, netfn_lun]));
        let _ = out.push(self.rq_sa);
        let _ = out.push((self.rq_seq << 2) | self.rq_lun);
        let _ = out.push(self.cmd);
        let _ = out.extend_from_slice(self.data());
        let body_start = 2;
        let csum2 = ipmi_checksum(&out[body_start..]);
        let _ = out.push(csum2);
        out
    }

    /// Parse wire bytes received in slave mode.
    ///
    /// `rs_sa` is this station's own IPMB address (the stripped address
    /// byte), needed to verify the header checksum. Frames with a bad length
    /// or either checksum wrong are rejected.
    pub fn parse(wire: &[u8], rs_sa: u8) -> PmcResult<Self> {
        if wire.len() < FRAME_OVERHEAD || wire.len() > IPMB_FRAME_MAX {
            return Err(PmcError::InvalidFrame);
        }
        let netfn_lun = wire[0];
        if ipmi_checksum(&[rs_sa, netfn_lun]) != wire[1] {
            return Err(PmcError::InvalidFrame);
        }
        let body = &wire[2..];
        if body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) != 0 {
            return Err(PmcError::InvalidFrame);
        }
        let data = &body[3..body.len() - 1];
        Self::new(
            rs_sa,
            netfn_lun >> 2,
            netfn_lun & 0x03,
            body[0],
            body[1] >> 2,
            body[1] & 0x03,
            body[2],
            data,
        )
    }
}
