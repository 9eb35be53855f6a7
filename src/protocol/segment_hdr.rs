use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const SEGMENT_HDR_LEN: usize = 24;

/// Segment commands as carried in the `cmd` byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    /// Data fragment.
    Push = 81,
    /// Selective acknowledgement of one sequence number.
    Ack = 82,
    /// Window probe: ask the peer to report its receive window.
    WindowAsk = 83,
    /// Window answer: report the local receive window.
    WindowTell = 84,
}

/// The fixed 24-byte segment header, little-endian on the wire.
///
/// `cmd` stays a raw byte here: the receive pipeline must be able to reject
/// a truncated payload before it rejects an unknown command, so command
/// validation happens one layer up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: u8,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    Decoding { field: &'static str },
}

impl SegmentHeader {
    pub fn from_bytes(rdr: &mut io::Cursor<&[u8]>) -> Result<Self, Error> {
        let conv = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| Error::Decoding { field: "conv" })?;
        let cmd = rdr.read_u8().map_err(|_e| Error::Decoding { field: "cmd" })?;
        let frg = rdr.read_u8().map_err(|_e| Error::Decoding { field: "frg" })?;
        let wnd = rdr
            .read_u16::<LittleEndian>()
            .map_err(|_e| Error::Decoding { field: "wnd" })?;
        let ts = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| Error::Decoding { field: "ts" })?;
        let sn = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| Error::Decoding { field: "sn" })?;
        let una = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| Error::Decoding { field: "una" })?;
        let len = rdr
            .read_u32::<LittleEndian>()
            .map_err(|_e| Error::Decoding { field: "len" })?;

        Ok(SegmentHeader {
            conv,
            cmd,
            frg,
            wnd,
            ts,
            sn,
            una,
            len,
        })
    }

    pub fn encode_to(&self, wtr: &mut Vec<u8>) {
        // writes into a Vec cannot fail
        wtr.write_u32::<LittleEndian>(self.conv).unwrap();
        wtr.write_u8(self.cmd).unwrap();
        wtr.write_u8(self.frg).unwrap();
        wtr.write_u16::<LittleEndian>(self.wnd).unwrap();
        wtr.write_u32::<LittleEndian>(self.ts).unwrap();
        wtr.write_u32::<LittleEndian>(self.sn).unwrap();
        wtr.write_u32::<LittleEndian>(self.una).unwrap();
        wtr.write_u32::<LittleEndian>(self.len).unwrap();
    }
}
