//! The discovery datagrams: search requests, search responses and beacons.
//!
//! Every message starts with the same 8-byte header. The header's flag byte
//! declares the body's byte order, so the fixed part is modelled with binrw
//! and the variable part goes through [`WriteBuf`]/[`ReadBuf`] (outbound) or
//! nom (inbound search payloads).

use std::io::Cursor;
use std::net::Ipv4Addr;

use binrw::{BinRead, BinWrite, binrw};
use nom::{
    IResult, Parser,
    bytes::complete::take,
    multi::count,
    number::complete::{be_u16, be_u32, le_u16, le_u32, u8 as any_u8},
};
use thiserror::Error;

use crate::buffer::{ReadBuf, WriteBuf};

pub const CMD_BEACON: u8 = 0x00;
pub const CMD_SEARCH: u8 = 0x03;
pub const CMD_SEARCH_RESPONSE: u8 = 0x04;

/// Header flag: message originates from a server.
pub const FLAG_FROM_SERVER: u8 = 0x40;
/// Header flag: body is big-endian.
pub const FLAG_BIG_ENDIAN: u8 = 0x80;

/// Search flag: reply even when nothing was claimed.
pub const SEARCH_MUST_REPLY: u8 = 0x01;
/// Search flag: the request was sent unicast.
pub const SEARCH_UNICAST: u8 = 0x80;

pub const PROTOCOL_VERSION: u8 = 2;
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("datagram too short or bad magic")]
    BadHeader,
    #[error("unexpected command {0:#04x}")]
    UnexpectedCommand(u8),
    #[error("malformed message body")]
    Malformed,
}

/// The common 8-byte message header: magic, version, flags, command and the
/// body length in the endianness the flags declare.
#[binrw]
#[brw(little, magic = 0xCAu8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Header {
    pub version: u8,
    pub flags: u8,
    pub command: u8,
    #[br(is_big = (flags & FLAG_BIG_ENDIAN) != 0)]
    #[bw(is_big = (*flags & FLAG_BIG_ENDIAN) != 0)]
    pub body_size: u32,
}

impl Header {
    pub fn new(command: u8, flags: u8, body_size: u32) -> Header {
        Header {
            version: PROTOCOL_VERSION,
            flags,
            command,
            body_size,
        }
    }

    pub fn is_big_endian(&self) -> bool {
        self.flags & FLAG_BIG_ENDIAN != 0
    }

    pub fn read_from(data: &[u8]) -> Result<Header, MessageError> {
        Header::read(&mut Cursor::new(data)).map_err(|_| MessageError::BadHeader)
    }
}

/// Prefix `body` with a header carrying its length.
fn frame(command: u8, flags: u8, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    Header::new(command, flags, body.len() as u32)
        .write(&mut Cursor::new(&mut out))
        .expect("writing a header to a vec cannot fail");
    out.extend_from_slice(&body);
    out
}

/// Addresses travel as 16 bytes; IPv4 is v4-mapped (`::ffff:a.b.c.d`).
fn put_ipv4_mapped(buf: &mut WriteBuf, addr: Ipv4Addr) {
    buf.put_bytes(&[0u8; 10]);
    buf.put_bytes(&[0xFF, 0xFF]);
    buf.put_bytes(&addr.octets());
}

fn wire_size(be: bool) -> impl Fn(&[u8]) -> IResult<&[u8], usize> {
    move |input| {
        let (input, lead) = any_u8(input)?;
        match lead {
            0xFF => Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            ))),
            0xFE => {
                let (input, len) = if be { be_u32(input) } else { le_u32(input) }?;
                Ok((input, len as usize))
            }
            lead => Ok((input, lead as usize)),
        }
    }
}

fn wire_string(be: bool) -> impl Fn(&[u8]) -> IResult<&[u8], String> {
    move |input| {
        let (input, len) = wire_size(be)(input)?;
        let (input, bytes) = take(len).parse(input)?;
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok((input, text.to_string())),
            Err(_) => Err(nom::Err::Failure(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            ))),
        }
    }
}

/// A client asking which server hosts the named PVs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchRequest {
    pub search_id: u32,
    pub must_reply: bool,
    pub unicast: bool,
    pub reply_port: u16,
    /// `(instance id, PV name)` in request order.
    pub names: Vec<(u32, String)>,
}

impl SearchRequest {
    pub fn parse(datagram: &[u8]) -> Result<SearchRequest, MessageError> {
        let header = Header::read_from(datagram)?;
        if header.command != CMD_SEARCH {
            return Err(MessageError::UnexpectedCommand(header.command));
        }
        let (_, request) = parse_search_body(&datagram[HEADER_LEN..], header.is_big_endian())
            .map_err(|_| MessageError::Malformed)?;
        Ok(request)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut wire = WriteBuf::new(&mut body, true);
        wire.put_u32(self.search_id);
        let mut flags = 0u8;
        if self.must_reply {
            flags |= SEARCH_MUST_REPLY;
        }
        if self.unicast {
            flags |= SEARCH_UNICAST;
        }
        wire.put_u8(flags);
        wire.put_bytes(&[0u8; 3]);
        put_ipv4_mapped(&mut wire, Ipv4Addr::UNSPECIFIED);
        wire.put_u16(self.reply_port);
        wire.put_size(1);
        wire.put_string("tcp");
        wire.put_u16(self.names.len() as u16);
        for (id, name) in &self.names {
            wire.put_u32(*id);
            wire.put_string(name);
        }
        frame(CMD_SEARCH, FLAG_BIG_ENDIAN, body)
    }
}

fn parse_search_body(input: &[u8], be: bool) -> IResult<&[u8], SearchRequest> {
    let p_u16: fn(&[u8]) -> IResult<&[u8], u16> = if be {
        |i| be_u16(i)
    } else {
        |i| le_u16(i)
    };
    let p_u32: fn(&[u8]) -> IResult<&[u8], u32> = if be {
        |i| be_u32(i)
    } else {
        |i| le_u32(i)
    };

    let (input, search_id) = p_u32(input)?;
    let (input, flags) = any_u8(input)?;
    let (input, _reserved) = take(3usize).parse(input)?;
    let (input, _reply_addr) = take(16usize).parse(input)?;
    let (input, reply_port) = p_u16(input)?;
    let (input, nproto) = wire_size(be)(input)?;
    let (input, _protocols) = count(wire_string(be), nproto).parse(input)?;
    let (input, nnames) = p_u16(input)?;
    let (input, names) = count((p_u32, wire_string(be)), nnames as usize).parse(input)?;

    Ok((
        input,
        SearchRequest {
            search_id,
            must_reply: flags & SEARCH_MUST_REPLY != 0,
            unicast: flags & SEARCH_UNICAST != 0,
            reply_port,
            names,
        },
    ))
}

/// A server's answer to a [`SearchRequest`], listing the claimed instance
/// ids. Sent even with no claims when the request demands a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub guid: [u8; 12],
    pub search_id: u32,
    pub tcp_port: u16,
    pub found: bool,
    pub ids: Vec<u32>,
}

impl SearchResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut wire = WriteBuf::new(&mut body, true);
        wire.put_bytes(&self.guid);
        wire.put_u32(self.search_id);
        // reply address: the wildcard, clients fall back to the datagram origin
        put_ipv4_mapped(&mut wire, Ipv4Addr::UNSPECIFIED);
        wire.put_u16(self.tcp_port);
        wire.put_string("tcp");
        wire.put_u8(self.found as u8);
        wire.put_u16(self.ids.len() as u16);
        for id in &self.ids {
            wire.put_u32(*id);
        }
        frame(
            CMD_SEARCH_RESPONSE,
            FLAG_FROM_SERVER | FLAG_BIG_ENDIAN,
            body,
        )
    }

    pub fn parse(datagram: &[u8]) -> Result<SearchResponse, MessageError> {
        let header = Header::read_from(datagram)?;
        if header.command != CMD_SEARCH_RESPONSE {
            return Err(MessageError::UnexpectedCommand(header.command));
        }
        let mut read = ReadBuf::new(&datagram[HEADER_LEN..], header.is_big_endian());
        let mut guid = [0u8; 12];
        read.get_bytes(&mut guid);
        let search_id = read.get_u32();
        let mut reply_addr = [0u8; 16];
        read.get_bytes(&mut reply_addr);
        let tcp_port = read.get_u16();
        let _transport = read.get_string();
        let found = read.get_u8() != 0;
        let nreply = read.get_u16();
        let ids = (0..nreply).map(|_| read.get_u32()).collect();
        if !read.good() {
            return Err(MessageError::Malformed);
        }
        Ok(SearchResponse {
            guid,
            search_id,
            tcp_port,
            found,
            ids,
        })
    }
}

/// Periodic UDP announcement that a server is alive.
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    pub guid: [u8; 12],
    pub tcp_port: u16,
}

impl Beacon {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let mut wire = WriteBuf::new(&mut body, true);
        wire.put_bytes(&self.guid);
        wire.put_bytes(&[0u8; 4]);
        put_ipv4_mapped(&mut wire, Ipv4Addr::UNSPECIFIED);
        wire.put_u16(self.tcp_port);
        wire.put_string("tcp");
        // null server status
        wire.put_u8(0xFF);
        frame(CMD_BEACON, FLAG_FROM_SERVER | FLAG_BIG_ENDIAN, body)
    }

    pub fn parse(datagram: &[u8]) -> Result<Beacon, MessageError> {
        let header = Header::read_from(datagram)?;
        if header.command != CMD_BEACON {
            return Err(MessageError::UnexpectedCommand(header.command));
        }
        let mut read = ReadBuf::new(&datagram[HEADER_LEN..], header.is_big_endian());
        let mut guid = [0u8; 12];
        read.get_bytes(&mut guid);
        // 4 reserved bytes and the 16-byte wildcard address
        let mut skip = [0u8; 20];
        read.get_bytes(&mut skip);
        let tcp_port = read.get_u16();
        if !read.good() {
            return Err(MessageError::Malformed);
        }
        Ok(Beacon { guid, tcp_port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_header() {
        let raw = b"\xca\x02\xc0\x04\x00\x00\x00\x10";
        let header = Header::read_from(raw).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.flags, FLAG_FROM_SERVER | FLAG_BIG_ENDIAN);
        assert_eq!(header.command, CMD_SEARCH_RESPONSE);
        assert_eq!(header.body_size, 16);

        // Now try converting it back
        let mut out = Vec::new();
        header.write(&mut Cursor::new(&mut out)).unwrap();
        assert_eq!(out, raw);

        // little-endian body length
        let raw = b"\xca\x02\x00\x03\x10\x00\x00\x00";
        assert_eq!(Header::read_from(raw).unwrap().body_size, 16);

        // bad magic
        assert!(Header::read_from(b"\xcb\x02\x00\x03\x00\x00\x00\x00").is_err());
    }

    #[test]
    fn search_request_round_trip() {
        let request = SearchRequest {
            search_id: 0x1234,
            must_reply: true,
            unicast: false,
            reply_port: 5076,
            names: vec![(1, "xxx".to_string()), (2, "yyy".to_string())],
        };
        let bytes = request.to_bytes();
        let header = Header::read_from(&bytes).unwrap();
        assert_eq!(header.command, CMD_SEARCH);
        assert_eq!(header.body_size as usize, bytes.len() - HEADER_LEN);
        assert_eq!(SearchRequest::parse(&bytes).unwrap(), request);
    }

    #[test]
    fn search_response_round_trip() {
        let response = SearchResponse {
            guid: *b"0123456789ab",
            search_id: 99,
            tcp_port: 5075,
            found: true,
            ids: vec![2],
        };
        let bytes = response.to_bytes();
        assert_eq!(SearchResponse::parse(&bytes).unwrap(), response);
    }

    #[test]
    fn beacon_round_trip() {
        let beacon = Beacon {
            guid: *b"0123456789ab",
            tcp_port: 5075,
        };
        let bytes = beacon.to_bytes();
        // null server status terminates the message
        assert_eq!(bytes.last(), Some(&0xFF));
        assert_eq!(Beacon::parse(&bytes).unwrap(), beacon);
    }

    #[test]
    fn wrong_command_rejected() {
        let beacon = Beacon {
            guid: [0; 12],
            tcp_port: 1,
        };
        assert!(matches!(
            SearchRequest::parse(&beacon.to_bytes()),
            Err(MessageError::UnexpectedCommand(CMD_BEACON))
        ));
    }
}
