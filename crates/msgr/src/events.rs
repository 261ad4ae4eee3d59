//! Fast-log records for the messenger hot path.
//!
//! Record layout, after the 2-byte ring type tag:
//!
//! ```text
//! ip:         u32   peer address
//! port:       u16   peer port
//! trid:       u32   local transactor id, 0 if none
//! rem_trid:   u32   remote transactor id, 0 if none
//! event:      u16   MsgrEvent
//! event_data: u16   event-specific detail (port, errno, count...)
//! ```

use fastlog::{Entry, FastLogMgr, LogBuf};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::{self, Write};

/// Ring record types used by this crate.
pub const FL_MSGR_DEBUG: u16 = 1;
pub const FL_MSGR_INFO: u16 = 2;
pub const FL_MSGR_ERROR: u16 = 3;
pub const FL_BSEND: u16 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MsgrEvent {
    MsgrInit = 1,
    Listening,
    MsgrShutdown,
    ConnEstablished,
    OutboundConnCreated,
    InboundConnCreated,
    ConnReused,
    ConnTimedOut,
    ConnTeardown,
    MaxConnReached,
    MaxTranReached,
    MtranNonesuch,
    MtranWrongRemTrid,
    MtranMultiConn,
    HdrReadError,
    ReadError,
    WriteError,
    SendNext,
    BsendAdd,
    BsendAddFailed,
    BsendJoin,
    BsendCanceled,
    BsendReset,
}

impl MsgrEvent {
    fn name(self) -> &'static str {
        match self {
            MsgrEvent::MsgrInit => "msgr_init",
            MsgrEvent::Listening => "listening",
            MsgrEvent::MsgrShutdown => "msgr_shutdown",
            MsgrEvent::ConnEstablished => "conn_established",
            MsgrEvent::OutboundConnCreated => "outbound_conn_created",
            MsgrEvent::InboundConnCreated => "inbound_conn_created",
            MsgrEvent::ConnReused => "conn_reused",
            MsgrEvent::ConnTimedOut => "conn_timed_out",
            MsgrEvent::ConnTeardown => "conn_teardown",
            MsgrEvent::MaxConnReached => "max_conn_reached",
            MsgrEvent::MaxTranReached => "max_tran_reached",
            MsgrEvent::MtranNonesuch => "mtran_nonesuch",
            MsgrEvent::MtranWrongRemTrid => "mtran_wrong_rem_trid",
            MsgrEvent::MtranMultiConn => "mtran_multi_conn",
            MsgrEvent::HdrReadError => "hdr_read_error",
            MsgrEvent::ReadError => "read_error",
            MsgrEvent::WriteError => "write_error",
            MsgrEvent::SendNext => "send_next",
            MsgrEvent::BsendAdd => "bsend_add",
            MsgrEvent::BsendAddFailed => "bsend_add_failed",
            MsgrEvent::BsendJoin => "bsend_join",
            MsgrEvent::BsendCanceled => "bsend_canceled",
            MsgrEvent::BsendReset => "bsend_reset",
        }
    }
}

/// Append one messenger record to `fb`.
pub fn log_msgr(
    fb: &LogBuf,
    ty: u16,
    ip: u32,
    port: u16,
    trid: u32,
    rem_trid: u32,
    event: MsgrEvent,
    event_data: u16,
) {
    let mut e = Entry::new(ty);
    e.data[0..4].copy_from_slice(&ip.to_be_bytes());
    e.data[4..6].copy_from_slice(&port.to_be_bytes());
    e.data[6..10].copy_from_slice(&trid.to_be_bytes());
    e.data[10..14].copy_from_slice(&rem_trid.to_be_bytes());
    e.data[14..16].copy_from_slice(&u16::from(event).to_be_bytes());
    e.data[16..18].copy_from_slice(&event_data.to_be_bytes());
    fb.log(e);
}

fn dump_level(entry: &Entry, level: &str, w: &mut dyn Write) -> io::Result<()> {
    let ip = u32::from_be_bytes([entry.data[0], entry.data[1], entry.data[2], entry.data[3]]);
    let port = u16::from_be_bytes([entry.data[4], entry.data[5]]);
    let trid = u32::from_be_bytes([entry.data[6], entry.data[7], entry.data[8], entry.data[9]]);
    let rem = u32::from_be_bytes([entry.data[10], entry.data[11], entry.data[12], entry.data[13]]);
    let ev = u16::from_be_bytes([entry.data[14], entry.data[15]]);
    let data = u16::from_be_bytes([entry.data[16], entry.data[17]]);
    let name = MsgrEvent::try_from(ev).map(MsgrEvent::name).unwrap_or("?");
    writeln!(
        w,
        "msgr {}: {} peer={}.{}.{}.{}:{} trid={} rem_trid={} data={}",
        level,
        name,
        (ip >> 24) & 0xff,
        (ip >> 16) & 0xff,
        (ip >> 8) & 0xff,
        ip & 0xff,
        port,
        trid,
        rem,
        data
    )
}

fn dump_debug(entry: &Entry, w: &mut dyn Write) -> io::Result<()> {
    dump_level(entry, "debug", w)
}

fn dump_info(entry: &Entry, w: &mut dyn Write) -> io::Result<()> {
    dump_level(entry, "info", w)
}

fn dump_error(entry: &Entry, w: &mut dyn Write) -> io::Result<()> {
    dump_level(entry, "error", w)
}

fn dump_bsend(entry: &Entry, w: &mut dyn Write) -> io::Result<()> {
    dump_level(entry, "bsend", w)
}

/// Install the dumpers for every record type this crate emits.
pub fn register_dumpers(mgr: &FastLogMgr) {
    mgr.register_dumper(FL_MSGR_DEBUG, dump_debug);
    mgr.register_dumper(FL_MSGR_INFO, dump_info);
    mgr.register_dumper(FL_MSGR_ERROR, dump_error);
    mgr.register_dumper(FL_BSEND, dump_bsend);
}

#[cfg(test)]
mod tests {
    use super::*;
    use fastlog::FastLogMgr;

    #[test]
    fn records_render() {
        let mgr = FastLogMgr::new();
        register_dumpers(&mgr);
        let fb = mgr.create_buf("msgr");
        log_msgr(
            &fb,
            FL_MSGR_INFO,
            0x7f000001,
            9080,
            42,
            7,
            MsgrEvent::ConnEstablished,
            0,
        );
        let mut out = Vec::new();
        mgr.dump_all(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("conn_established"));
        assert!(text.contains("127.0.0.1:9080"));
        assert!(text.contains("trid=42"));
    }
}
