use bytes::Bytes;

use crate::{
    protocol::{Command, SegmentHeader, SEGMENT_HDR_LEN},
    utils::Seq32,
};

/// One buffered or in-flight segment: the wire header fields plus the
/// retransmission bookkeeping that never leaves this side of the link.
pub(crate) struct Segment {
    pub conv: u32,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: Seq32,
    pub una: Seq32,
    pub payload: Bytes,

    /// When the next retransmission is due.
    pub resend_ts: u32,
    /// Per-segment timeout; grows on every loss.
    pub rto: u32,
    /// How many acks for later sequence numbers have skipped this segment.
    pub fastack: u32,
    /// Transmission count.
    pub xmit: u32,
}

impl Segment {
    pub fn new(cmd: Command, payload: Bytes) -> Self {
        Segment {
            conv: 0,
            cmd,
            frg: 0,
            wnd: 0,
            ts: 0,
            sn: Seq32::new(0),
            una: Seq32::new(0),
            payload,
            resend_ts: 0,
            rto: 0,
            fastack: 0,
            xmit: 0,
        }
    }

    #[must_use]
    pub fn wire_header(&self) -> SegmentHeader {
        SegmentHeader {
            conv: self.conv,
            cmd: self.cmd.into(),
            frg: self.frg,
            wnd: self.wnd,
            ts: self.ts,
            sn: self.sn.to_u32(),
            una: self.una.to_u32(),
            len: self.payload.len() as u32,
        }
    }

    #[must_use]
    pub fn wire_len(&self) -> usize {
        SEGMENT_HDR_LEN + self.payload.len()
    }
}
