use log::{debug, trace, warn};

use crate::{
    protocol::{Command, SegmentHeader, SEGMENT_HDR_LEN},
    utils::time_diff,
};

use super::{ControlBlock, LinkState, OutputSink, PROBE_INIT, PROBE_LIMIT, THRESH_MIN};

/// Hand the accumulated datagram to the sink if appending `need` more
/// bytes would push it strictly past the MTU. A datagram that fills the
/// MTU exactly is not an overflow.
fn deliver_if_overflow(output: &mut dyn OutputSink, buffer: &mut Vec<u8>, mtu: usize, need: usize) {
    if !buffer.is_empty() && buffer.len() + need > mtu {
        output.transmit(buffer);
        buffer.clear();
    }
}

impl ControlBlock {
    /// Assemble and emit everything due at the current clock: pending
    /// acks, window probes and answers, then data segments in sn order.
    /// Runs under [`update`](Self::update); a no-op until the first
    /// update supplies a clock.
    pub(crate) fn flush(&mut self) {
        if !self.updated {
            return;
        }

        let conv = self.conv;
        let current = self.current;
        let mtu = self.mtu;
        let wnd_free = self.unused_rcv_window();
        let rcv_nxt = self.rcv_nxt;
        self.buffer.clear();

        // pending acks
        for &(sn, ts) in &self.acklist {
            deliver_if_overflow(self.output.as_mut(), &mut self.buffer, mtu, SEGMENT_HDR_LEN);
            SegmentHeader {
                conv,
                cmd: Command::Ack.into(),
                frg: 0,
                wnd: wnd_free,
                ts,
                sn: sn.to_u32(),
                una: rcv_nxt.to_u32(),
                len: 0,
            }
            .encode_to(&mut self.buffer);
            self.stat.acks += 1;
        }
        self.acklist.clear();

        // a peer advertising a zero window would never be asked for data
        // again; probe it on a growing schedule instead
        if self.rmt_wnd == 0 {
            if self.probe_wait == 0 {
                self.probe_wait = PROBE_INIT;
                self.ts_probe = current.wrapping_add(self.probe_wait);
            } else if time_diff(current, self.ts_probe) >= 0 {
                if self.probe_wait < PROBE_INIT {
                    self.probe_wait = PROBE_INIT;
                }
                self.probe_wait += self.probe_wait / 2;
                if self.probe_wait > PROBE_LIMIT {
                    self.probe_wait = PROBE_LIMIT;
                }
                self.ts_probe = current.wrapping_add(self.probe_wait);
                self.probe_ask_send = true;
                trace!(
                    "conv {}: remote window still closed, probing again in {} ms",
                    conv,
                    self.probe_wait
                );
            }
        } else {
            self.ts_probe = 0;
            self.probe_wait = 0;
        }

        // window probes and answers
        if self.probe_ask_send {
            deliver_if_overflow(self.output.as_mut(), &mut self.buffer, mtu, SEGMENT_HDR_LEN);
            SegmentHeader {
                conv,
                cmd: Command::WindowAsk.into(),
                frg: 0,
                wnd: wnd_free,
                ts: 0,
                sn: 0,
                una: rcv_nxt.to_u32(),
                len: 0,
            }
            .encode_to(&mut self.buffer);
        }
        if self.probe_ask_tell {
            deliver_if_overflow(self.output.as_mut(), &mut self.buffer, mtu, SEGMENT_HDR_LEN);
            SegmentHeader {
                conv,
                cmd: Command::WindowTell.into(),
                frg: 0,
                wnd: wnd_free,
                ts: 0,
                sn: 0,
                una: rcv_nxt.to_u32(),
                len: 0,
            }
            .encode_to(&mut self.buffer);
        }
        self.probe_ask_send = false;
        self.probe_ask_tell = false;

        // admission: move segments into the send window
        let mut wnd_eff = u32::min(self.snd_wnd as u32, self.rmt_wnd as u32);
        if !self.nocwnd {
            wnd_eff = u32::min(self.cwnd, wnd_eff);
        }

        while self.snd_nxt.diff(self.snd_una.add(wnd_eff)) < 0 {
            let mut seg = match self.snd_queue.pop_front() {
                Some(seg) => seg,
                None => break,
            };
            seg.conv = conv;
            seg.cmd = Command::Push;
            seg.wnd = wnd_free;
            seg.ts = current;
            seg.sn = self.snd_nxt;
            self.snd_nxt.increment();
            seg.una = rcv_nxt;
            seg.resend_ts = current;
            seg.rto = self.rto_estimator.rto();
            seg.fastack = 0;
            seg.xmit = 0;
            self.snd_buf.push_back(seg);
        }

        // (re)transmission sweep
        let resent = if self.fastresend > 0 {
            self.fastresend
        } else {
            u32::MAX
        };
        let rto_min = if self.nodelay {
            0
        } else {
            self.rto_estimator.rto() >> 3
        };
        let rx_rto = self.rto_estimator.rto();
        let nodelay = self.nodelay;
        let dead_link = self.dead_link;

        let mut lost = false;
        let mut change = false;
        let mut dead = false;

        for seg in self.snd_buf.iter_mut() {
            let mut needsend = false;
            if seg.xmit == 0 {
                // first transmission
                needsend = true;
                seg.xmit += 1;
                seg.rto = rx_rto;
                seg.resend_ts = current.wrapping_add(seg.rto).wrapping_add(rto_min);
            } else if time_diff(current, seg.resend_ts) >= 0 {
                // retransmission timeout; back off linearly, or by half
                // the timeout in nodelay mode
                needsend = true;
                seg.xmit += 1;
                seg.rto += if nodelay { rx_rto / 2 } else { rx_rto };
                seg.resend_ts = current.wrapping_add(seg.rto);
                lost = true;
                self.stat.rto_hits += 1;
                self.stat.retransmissions += 1;
            } else if seg.fastack >= resent {
                // enough acks skipped over this segment
                needsend = true;
                seg.xmit += 1;
                seg.fastack = 0;
                seg.resend_ts = current.wrapping_add(seg.rto);
                change = true;
                self.stat.fast_retransmissions += 1;
                self.stat.retransmissions += 1;
            }

            if needsend {
                seg.ts = current;
                seg.wnd = wnd_free;
                seg.una = rcv_nxt;
                deliver_if_overflow(self.output.as_mut(), &mut self.buffer, mtu, seg.wire_len());
                seg.wire_header().encode_to(&mut self.buffer);
                self.buffer.extend_from_slice(&seg.payload);
                self.stat.pushes += 1;
                if seg.xmit >= dead_link {
                    dead = true;
                }
            }
        }

        if !self.buffer.is_empty() {
            self.output.transmit(&self.buffer);
            self.buffer.clear();
        }

        if dead && self.state != LinkState::Dead {
            warn!(
                "conv {}: a segment exceeded {} transmissions, marking link dead",
                conv, dead_link
            );
            self.state = LinkState::Dead;
        }

        // congestion response
        if change {
            let inflight = self.snd_nxt.diff(self.snd_una) as u32;
            self.ssthresh = u32::max(inflight / 2, THRESH_MIN);
            self.cwnd = self.ssthresh + resent;
            self.incr = self.cwnd * self.mss as u32;
        }
        if lost {
            self.ssthresh = u32::max(wnd_eff / 2, THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss as u32;
            debug!("conv {}: timeout loss, congestion window collapsed", conv);
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, io::Cursor, rc::Rc};

    use crate::protocol::{Command, SegmentHeader, SEGMENT_HDR_LEN};

    use super::super::{ControlBlock, ControlBlockBuilder};

    type Captured = Rc<RefCell<Vec<Vec<u8>>>>;

    fn engine_with_capture(conv: u32) -> (ControlBlock, Captured) {
        let sent: Captured = Rc::new(RefCell::new(Vec::new()));
        let sink = sent.clone();
        let kcp = ControlBlockBuilder {
            conv,
            output: Box::new(move |datagram: &[u8]| sink.borrow_mut().push(datagram.to_vec())),
        }
        .build();
        (kcp, sent)
    }

    fn headers(datagram: &[u8]) -> Vec<SegmentHeader> {
        let mut out = Vec::new();
        let mut rest = datagram;
        while rest.len() >= SEGMENT_HDR_LEN {
            let mut rdr = Cursor::new(rest);
            let hdr = SegmentHeader::from_bytes(&mut rdr).unwrap();
            rest = &rest[SEGMENT_HDR_LEN + hdr.len as usize..];
            out.push(hdr);
        }
        out
    }

    fn window_tell(conv: u32, wnd: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        SegmentHeader {
            conv,
            cmd: Command::WindowTell.into(),
            frg: 0,
            wnd,
            ts: 0,
            sn: 0,
            una: 0,
            len: 0,
        }
        .encode_to(&mut buf);
        buf
    }

    #[test]
    fn silent_before_first_update() {
        let (mut kcp, sent) = engine_with_capture(1);
        kcp.send(b"pending").unwrap();
        kcp.flush();
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn first_update_transmits_queued_data() {
        let (mut kcp, sent) = engine_with_capture(1);
        kcp.send(b"hello").unwrap();
        kcp.update(0);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        let hdrs = headers(&sent[0]);
        assert_eq!(hdrs.len(), 1);
        assert_eq!(hdrs[0].cmd, u8::from(Command::Push));
        assert_eq!(hdrs[0].sn, 0);
        assert_eq!(hdrs[0].frg, 0);
        assert_eq!(hdrs[0].len, 5);
        assert_eq!(&sent[0][SEGMENT_HDR_LEN..], b"hello");
        assert_eq!(kcp.wait_snd(), 1);
    }

    #[test]
    fn acks_precede_data() {
        let (mut kcp, sent) = engine_with_capture(1);
        let mut incoming = Vec::new();
        SegmentHeader {
            conv: 1,
            cmd: Command::Push.into(),
            frg: 0,
            wnd: 32,
            ts: 33,
            sn: 0,
            una: 0,
            len: 0,
        }
        .encode_to(&mut incoming);
        kcp.input(&incoming).unwrap();

        kcp.send(b"reply").unwrap();
        kcp.update(0);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        let hdrs = headers(&sent[0]);
        assert_eq!(hdrs.len(), 2);
        assert_eq!(hdrs[0].cmd, u8::from(Command::Ack));
        assert_eq!(hdrs[0].sn, 0);
        // the ack echoes the push's timestamp for the peer's RTT sample
        assert_eq!(hdrs[0].ts, 33);
        // and carries the cumulative ack past the consumed push
        assert_eq!(hdrs[0].una, 1);
        assert_eq!(hdrs[1].cmd, u8::from(Command::Push));
        assert_eq!(kcp.stat().acks, 1);
    }

    #[test]
    fn datagrams_bounded_by_mtu() {
        let (mut kcp, sent) = engine_with_capture(1);
        kcp.set_mtu(50).unwrap(); // mss = 26: header + full payload fill the mtu exactly
        kcp.set_nodelay(None, None, None, Some(true));
        kcp.send(&[9u8; 100]).unwrap(); // 4 fragments
        kcp.update(0);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 4);
        for datagram in sent.iter() {
            assert!(datagram.len() <= 50);
        }
        let all: Vec<_> = sent.iter().flat_map(|d| headers(d)).collect();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].frg, 3);
        assert_eq!(all[3].frg, 0);
    }

    #[test]
    fn admission_gated_by_congestion_window() {
        let (mut kcp, sent) = engine_with_capture(1);
        kcp.send(b"a").unwrap();
        kcp.send(b"b").unwrap();
        kcp.send(b"c").unwrap();
        kcp.update(0);

        // a fresh engine starts with cwnd = 1
        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(headers(&sent[0]).len(), 1);
        assert_eq!(kcp.snd_buf.len(), 1);
        assert_eq!(kcp.snd_queue.len(), 2);
    }

    #[test]
    fn zero_window_probed_on_growing_schedule() {
        let (mut kcp, sent) = engine_with_capture(1);
        kcp.update(0);
        kcp.input(&window_tell(1, 0)).unwrap();

        let mut wask_times = Vec::new();
        let mut t = 100;
        while t <= 30_000 {
            sent.borrow_mut().clear();
            kcp.update(t);
            let got_wask = sent
                .borrow()
                .iter()
                .flat_map(|d| headers(d))
                .any(|h| h.cmd == u8::from(Command::WindowAsk));
            if got_wask {
                wask_times.push(t);
            }
            t += 100;
        }

        // armed at t=100 with the 7 s initial wait, then growing by half
        assert_eq!(wask_times, vec![7_100, 17_600]);
    }

    #[test]
    fn probe_timer_cleared_when_window_reopens() {
        let (mut kcp, sent) = engine_with_capture(1);
        kcp.update(0);
        kcp.input(&window_tell(1, 0)).unwrap();
        kcp.update(100); // arms the probe timer
        kcp.input(&window_tell(1, 8)).unwrap();
        kcp.update(200); // clears it

        sent.borrow_mut().clear();
        let mut t = 300;
        while t <= 10_000 {
            kcp.update(t);
            t += 100;
        }
        let wasks = sent
            .borrow()
            .iter()
            .flat_map(|d| headers(d))
            .filter(|h| h.cmd == u8::from(Command::WindowAsk))
            .count();
        assert_eq!(wasks, 0);
    }

    #[test]
    fn fast_retransmit_fires_before_timeout() {
        let (mut kcp, sent) = engine_with_capture(1);
        kcp.set_nodelay(None, None, Some(2), Some(true));
        for message in [b"m0", b"m1", b"m2", b"m3", b"m4"] {
            kcp.send(message).unwrap();
        }
        kcp.update(0);
        assert_eq!(kcp.snd_buf.len(), 5);

        // acks for sn 1 and 2 skip over sn 0 twice
        for sn in [1u32, 2] {
            let mut ack = Vec::new();
            SegmentHeader {
                conv: 1,
                cmd: Command::Ack.into(),
                frg: 0,
                wnd: 32,
                ts: 0,
                sn,
                una: 0,
                len: 0,
            }
            .encode_to(&mut ack);
            kcp.input(&ack).unwrap();
        }

        sent.borrow_mut().clear();
        kcp.update(100); // well before the ~225 ms resend time
        let pushes: Vec<_> = sent
            .borrow()
            .iter()
            .flat_map(|d| headers(d))
            .filter(|h| h.cmd == u8::from(Command::Push))
            .collect();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].sn, 0);
        assert_eq!(kcp.stat().fast_retransmissions, 1);
        assert_eq!(kcp.stat().rto_hits, 0);
    }

    #[test]
    fn dead_link_after_retransmission_budget() {
        let (mut kcp, _sent) = engine_with_capture(1);
        kcp.send(b"doomed").unwrap();

        let mut t = 0;
        for _ in 0..10 {
            kcp.update(t);
            t += 3_000;
        }
        assert!(kcp.is_dead());
        assert!(kcp.wait_snd() >= 1);
        assert_eq!(kcp.stat().rto_hits, 9);
        assert_eq!(kcp.stat().pushes, 10);

        // dead is a verdict, not a stop: the engine keeps running
        kcp.update(t);
        assert!(kcp.is_dead());
    }

    #[test]
    fn timeout_collapses_congestion_window() {
        let (mut kcp, _sent) = engine_with_capture(1);
        kcp.send(b"x").unwrap();
        kcp.update(0);
        kcp.update(3_000); // past the resend time
        assert_eq!(kcp.cwnd, 1);
        assert_eq!(kcp.incr, kcp.mss as u32);
        assert_eq!(kcp.stat().retransmissions, 1);
    }
}
