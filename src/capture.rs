/*! Classic pcap capture files.

The original libpcap format: a fixed global header carrying a magic
number, the snapshot length and the link type, followed by
length-prefixed records. The magic number determines both the byte
order and whether record timestamps carry microseconds or nanoseconds.
*/

use crate::time::Timeval;
use bytes::{Buf, Bytes};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use thiserror::Error;
use tracing::*;

/// No real link can carry a frame bigger than this; a record that
/// claims to means the superstructure is corrupt.
const MAX_FRAME_BYTES: u32 = 262_144;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endianness {
    Big,
    Little,
}

/// The capture's superstructure is corrupt; further reading is impossible
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("Didn't understand magic number {0:?}")]
    DidntUnderstandMagicNumber([u8; 4]),
    #[error("File too short for the pcap global header")]
    TruncatedHeader,
    #[error("Record body cut off mid-way (expected {expected} bytes, saw {actual})")]
    TruncatedRecord { expected: usize, actual: usize },
    #[error("Record claims {0} bytes, longer than any plausible frame")]
    OversizedRecord(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Link-layer framing of the captured packets.
///
/// The registry defines over a hundred link types; the frame decoder
/// only distinguishes Ethernet from headerless raw IP, so everything
/// else stays `Unknown`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LinkType {
    Ethernet,
    Raw,
    Unknown(u32),
}

impl LinkType {
    pub fn from_u32(code: u32) -> LinkType {
        match code {
            1 => LinkType::Ethernet,
            // LINKTYPE_RAW is 101 in the registry, but libpcap writes
            // DLT_RAW: 14 on OpenBSD, 12 elsewhere.
            12 | 14 | 101 => LinkType::Raw,
            code => LinkType::Unknown(code),
        }
    }
}

/// One captured frame, as it appeared on the wire.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RawFrame {
    pub timestamp: Timeval,
    pub data: Bytes,
}

/// Reads the frames of a classic pcap file in order.
#[derive(Debug)]
pub struct Capture<R> {
    rdr: BufReader<R>,
    endianness: Endianness,
    nanosecond_ts: bool,
    snap_len: u32,
    link_type: LinkType,
}

impl Capture<File> {
    pub fn open(path: &Path) -> Result<Capture<File>, CaptureError> {
        Capture::new(File::open(path)?)
    }
}

impl<R: Read> Capture<R> {
    pub fn new(rdr: R) -> Result<Capture<R>, CaptureError> {
        let mut rdr = BufReader::new(rdr);
        let mut header = [0; 24];
        rdr.read_exact(&mut header).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => CaptureError::TruncatedHeader,
            _ => CaptureError::Io(e),
        })?;
        let (endianness, nanosecond_ts) = match &header[..4] {
            &[0xA1, 0xB2, 0xC3, 0xD4] => (Endianness::Big, false),
            &[0xD4, 0xC3, 0xB2, 0xA1] => (Endianness::Little, false),
            &[0xA1, 0xB2, 0x3C, 0x4D] => (Endianness::Big, true),
            &[0x4D, 0x3C, 0xB2, 0xA1] => (Endianness::Little, true),
            x => return Err(CaptureError::DidntUnderstandMagicNumber(x.try_into().unwrap())),
        };
        let mut buf = &header[16..];
        let snap_len = read_u32(&mut buf, endianness);
        let link_type = LinkType::from_u32(read_u32(&mut buf, endianness));
        debug!("Capture header: {endianness:?}, nanosecond_ts: {nanosecond_ts}, snap_len: {snap_len}, link_type: {link_type:?}");
        Ok(Capture {
            rdr,
            endianness,
            nanosecond_ts,
            snap_len,
            link_type,
        })
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn snap_len(&self) -> u32 {
        self.snap_len
    }

    /// The next frame, or `None` at end of capture.
    ///
    /// A record header cut off mid-way is treated as end-of-capture
    /// (interrupted captures routinely end that way); a record body
    /// cut off mid-way is an error.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let mut header = [0; 16];
        match read_up_to(&mut self.rdr, &mut header)? {
            0 => return Ok(None),
            16 => {}
            n => {
                warn!("Capture ends with a {n}-byte partial record header");
                return Ok(None);
            }
        }
        let mut buf = &header[..];
        let sec = read_u32(&mut buf, self.endianness);
        let subsec = read_u32(&mut buf, self.endianness);
        let incl_len = read_u32(&mut buf, self.endianness);
        let _orig_len = read_u32(&mut buf, self.endianness);

        if incl_len > MAX_FRAME_BYTES {
            return Err(CaptureError::OversizedRecord(incl_len));
        }
        let mut data = vec![0; incl_len as usize];
        let actual = read_up_to(&mut self.rdr, &mut data)?;
        if actual < data.len() {
            return Err(CaptureError::TruncatedRecord {
                expected: data.len(),
                actual,
            });
        }

        let usec = if self.nanosecond_ts {
            i64::from(subsec) / 1000
        } else {
            i64::from(subsec)
        };
        Ok(Some(RawFrame {
            timestamp: Timeval::new(i64::from(sec), usec),
            data: Bytes::from(data),
        }))
    }
}

impl<R: Read> Iterator for Capture<R> {
    type Item = Result<RawFrame, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn read_u32(buf: &mut &[u8], endianness: Endianness) -> u32 {
    match endianness {
        Endianness::Big => buf.get_u32(),
        Endianness::Little => buf.get_u32_le(),
    }
}

/// Like `read_exact`, but EOF short of the target is reported as the
/// number of bytes actually read.
fn read_up_to(rdr: &mut impl Read, buf: &mut [u8]) -> Result<usize, CaptureError> {
    let mut filled = 0;
    while filled < buf.len() {
        match rdr.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(CaptureError::Io(e)),
        }
    }
    Ok(filled)
}
