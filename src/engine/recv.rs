use std::{fmt, io};

use bytes::Bytes;
use log::trace;

use crate::{
    protocol::{Command, SegmentHeader, SEGMENT_HDR_LEN},
    utils::{time_diff, Seq32},
};

use super::{segment::Segment, ControlBlock};

#[derive(Debug, PartialEq, Eq)]
pub enum RecvError {
    /// The receive-queue holds no message at all.
    Empty,
    /// The front message is still missing fragments.
    Incomplete,
    /// The caller's buffer is smaller than the next message.
    BufferTooSmall { needed: usize },
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecvError::Empty => write!(f, "no message waiting"),
            RecvError::Incomplete => write!(f, "next message is missing fragments"),
            RecvError::BufferTooSmall { needed } => {
                write!(f, "buffer too small, next message is {} bytes", needed)
            }
        }
    }
}

impl std::error::Error for RecvError {}

#[derive(Debug, PartialEq, Eq)]
pub enum InputError {
    /// The datagram belongs to another conversation.
    ConversationMismatch { expected: u32, got: u32 },
    /// A segment header announced more payload than the datagram holds.
    Truncated,
    /// The `cmd` byte is none of PUSH/ACK/WASK/WINS.
    UnknownCommand(u8),
}

impl fmt::Display for InputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InputError::ConversationMismatch { expected, got } => {
                write!(f, "conversation mismatch: expected {}, got {}", expected, got)
            }
            InputError::Truncated => write!(f, "segment payload truncated"),
            InputError::UnknownCommand(cmd) => write!(f, "unknown command byte {}", cmd),
        }
    }
}

impl std::error::Error for InputError {}

impl ControlBlock {
    /// Feed one datagram received from the transport.
    ///
    /// The datagram is a concatenation of segments. Datagrams shorter than
    /// one header are dropped without error; a bad segment aborts the call
    /// but every segment before it has already been applied, and the
    /// engine stays usable.
    pub fn input(&mut self, data: &[u8]) -> Result<(), InputError> {
        let prev_una = self.snd_una;
        if data.len() < SEGMENT_HDR_LEN {
            return Ok(());
        }

        let mut rest = data;
        while rest.len() >= SEGMENT_HDR_LEN {
            let mut rdr = io::Cursor::new(rest);
            let hdr = match SegmentHeader::from_bytes(&mut rdr) {
                Ok(hdr) => hdr,
                Err(_) => return Err(InputError::Truncated),
            };
            if hdr.conv != self.conv {
                return Err(InputError::ConversationMismatch {
                    expected: self.conv,
                    got: hdr.conv,
                });
            }
            rest = &rest[SEGMENT_HDR_LEN..];
            let len = hdr.len as usize;
            if rest.len() < len {
                return Err(InputError::Truncated);
            }
            let cmd = Command::try_from(hdr.cmd)
                .map_err(|_e| InputError::UnknownCommand(hdr.cmd))?;

            self.rmt_wnd = hdr.wnd;
            self.drop_acked_before(Seq32::new(hdr.una));
            self.shrink_snd_una();

            match cmd {
                Command::Ack => {
                    let rtt = time_diff(self.current, hdr.ts);
                    if rtt >= 0 {
                        self.rto_estimator.sample(rtt as u32, self.interval);
                    }
                    self.take_acked(Seq32::new(hdr.sn));
                    self.shrink_snd_una();
                }
                Command::Push => {
                    let sn = Seq32::new(hdr.sn);
                    if sn.diff(self.rcv_nxt.add(self.rcv_wnd as u32)) < 0 {
                        // acknowledge even duplicates; the peer may have
                        // lost the first ack
                        self.acklist.push((sn, hdr.ts));
                        if sn.diff(self.rcv_nxt) >= 0 {
                            let mut seg = Segment::new(
                                Command::Push,
                                Bytes::copy_from_slice(&rest[..len]),
                            );
                            seg.conv = hdr.conv;
                            seg.frg = hdr.frg;
                            seg.wnd = hdr.wnd;
                            seg.ts = hdr.ts;
                            seg.sn = sn;
                            seg.una = Seq32::new(hdr.una);
                            self.store_out_of_order(seg);
                            self.promote_contiguous();
                        }
                    } else {
                        trace!(
                            "conv {}: push sn={} outside receive window, dropped",
                            self.conv,
                            hdr.sn
                        );
                    }
                }
                Command::WindowAsk => {
                    // answer with WINS at the next flush
                    self.probe_ask_tell = true;
                }
                Command::WindowTell => {
                    // the window itself was already taken from the header
                }
            }
            rest = &rest[len..];
        }

        if self.snd_una.diff(prev_una) > 0 {
            self.grow_congestion_window();
        }
        self.check_rep();
        Ok(())
    }

    /// Read the next complete message into `buffer`, removing it from the
    /// receive-queue. Returns the message length.
    pub fn recv(&mut self, buffer: &mut [u8]) -> Result<usize, RecvError> {
        self.read_front(buffer, true)
    }

    /// Read the next complete message without consuming it.
    pub fn peek(&mut self, buffer: &mut [u8]) -> Result<usize, RecvError> {
        self.read_front(buffer, false)
    }

    /// Length of the next complete message, or `None` if nothing is
    /// waiting or the front message is still missing fragments.
    #[must_use]
    pub fn peek_size(&self) -> Option<usize> {
        let front = self.rcv_queue.front()?;
        if front.frg == 0 {
            return Some(front.payload.len());
        }
        if self.rcv_queue.len() < front.frg as usize + 1 {
            return None;
        }
        let mut length = 0;
        for seg in &self.rcv_queue {
            length += seg.payload.len();
            if seg.frg == 0 {
                break;
            }
        }
        Some(length)
    }

    fn read_front(&mut self, buffer: &mut [u8], consume: bool) -> Result<usize, RecvError> {
        if self.rcv_queue.is_empty() {
            return Err(RecvError::Empty);
        }
        let size = self.peek_size().ok_or(RecvError::Incomplete)?;
        if size > buffer.len() {
            return Err(RecvError::BufferTooSmall { needed: size });
        }
        let was_full = self.rcv_queue.len() >= self.rcv_wnd as usize;

        // merge fragments into the caller's buffer
        let mut copied = 0;
        if consume {
            while let Some(seg) = self.rcv_queue.pop_front() {
                buffer[copied..copied + seg.payload.len()].copy_from_slice(&seg.payload);
                copied += seg.payload.len();
                if seg.frg == 0 {
                    break;
                }
            }
        } else {
            for seg in &self.rcv_queue {
                buffer[copied..copied + seg.payload.len()].copy_from_slice(&seg.payload);
                copied += seg.payload.len();
                if seg.frg == 0 {
                    break;
                }
            }
        }
        assert_eq!(copied, size);

        self.promote_contiguous();

        // the queue went from full to not-full: volunteer the reopened
        // window instead of waiting for the peer to probe
        if was_full && self.rcv_queue.len() < self.rcv_wnd as usize {
            self.probe_ask_tell = true;
        }

        self.check_rep();
        Ok(copied)
    }

    /// Cumulative ack: everything before `una` is confirmed received.
    fn drop_acked_before(&mut self, una: Seq32) {
        while let Some(seg) = self.snd_buf.front() {
            if una.diff(seg.sn) > 0 {
                self.snd_buf.pop_front();
            } else {
                break;
            }
        }
    }

    /// Keep `snd_una` at the front of the send-buffer.
    fn shrink_snd_una(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    /// Selective ack: drop the matching segment and count a skip-ack on
    /// every segment with a smaller sequence number.
    fn take_acked(&mut self, sn: Seq32) {
        if sn.diff(self.snd_una) < 0 || sn.diff(self.snd_nxt) >= 0 {
            return;
        }
        for i in 0..self.snd_buf.len() {
            let seg_sn = self.snd_buf[i].sn;
            if seg_sn == sn {
                let _ = self.snd_buf.remove(i);
                break;
            }
            if sn.diff(seg_sn) < 0 {
                // the buffer is sn-sorted; the ack refers to a segment
                // that is already gone
                break;
            }
            self.snd_buf[i].fastack += 1;
        }
    }

    /// Insert into the receive-buffer keeping it sn-sorted, dropping exact
    /// duplicates. Scans from the back: arrivals are usually near the tail.
    fn store_out_of_order(&mut self, seg: Segment) {
        let mut insert_at = self.rcv_buf.len();
        for i in (0..self.rcv_buf.len()).rev() {
            let existing = self.rcv_buf[i].sn;
            if existing == seg.sn {
                return;
            }
            if seg.sn.diff(existing) > 0 {
                insert_at = i + 1;
                break;
            }
            insert_at = i;
        }
        self.rcv_buf.insert(insert_at, seg);
    }

    /// Move the contiguous prefix of the receive-buffer into the
    /// receive-queue, as far as the receive window allows.
    fn promote_contiguous(&mut self) {
        while let Some(front) = self.rcv_buf.front() {
            if front.sn == self.rcv_nxt && self.rcv_queue.len() < self.rcv_wnd as usize {
                let seg = self.rcv_buf.pop_front().unwrap();
                self.rcv_queue.push_back(seg);
                self.rcv_nxt.increment();
            } else {
                break;
            }
        }
    }

    /// One step of slow start or congestion avoidance, run after an input
    /// that advanced `snd_una`.
    fn grow_congestion_window(&mut self) {
        if self.cwnd >= self.rmt_wnd as u32 {
            return;
        }
        let mss = self.mss as u32;
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        } else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr += (mss * mss) / self.incr + mss / 16;
            if (self.cwnd + 1) * mss <= self.incr {
                self.cwnd += 1;
            }
        }
        if self.cwnd > self.rmt_wnd as u32 {
            self.cwnd = self.rmt_wnd as u32;
            self.incr = self.rmt_wnd as u32 * mss;
        }
    }
}
