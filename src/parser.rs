//! Blocking packet framing over an [`embedded_io::Read`] stream.

use embedded_io::{Read, ReadExactError};

use crate::{
    packet::Packet,
    protocol::{FixedHeader, PacketType},
    transport,
};

/// Body bytes read per step; the buffer only grows as data arrives.
const READ_CHUNK: usize = 4096;

/// Reads one complete control packet.
///
/// A stream that ends before the first byte reports
/// [`crate::Error::ConnectionClosed`]; one that ends mid-packet reports
/// [`crate::Error::UnexpectedEof`].
pub fn read_packet<R: Read>(read: &mut R) -> Result<Packet, crate::Error> {
    let header = read_fixed_header(read)?;

    let body = read_body(read, header.remaining_len)?;

    Packet::decode(&header, &body)
}

fn read_body<R: Read>(read: &mut R, len: usize) -> Result<Vec<u8>, crate::Error> {
    let mut body = Vec::with_capacity(len.min(READ_CHUNK));

    while body.len() < len {
        let start = body.len();
        let step = (len - start).min(READ_CHUNK);

        body.resize(start + step, 0);
        read_exact(read, &mut body[start..])?;
    }

    Ok(body)
}

pub(crate) fn read_fixed_header<R: Read>(read: &mut R) -> Result<FixedHeader, crate::Error> {
    let mut first = [0u8; 1];
    read.read_exact(&mut first).map_err(|err| match err {
        ReadExactError::UnexpectedEof => crate::Error::ConnectionClosed,
        ReadExactError::Other(err) => transport::stream_error(err),
    })?;

    let (packet_type, flags) = parse_first_byte(first[0])?;
    let remaining_len = read_remaining_len(read)?;

    Ok(FixedHeader {
        packet_type,
        flags,
        remaining_len,
    })
}

fn parse_first_byte(byte: u8) -> Result<(PacketType, u8), crate::Error> {
    let packet_type = PacketType::try_from(byte >> 4)?;
    let flags = byte & 0x0F;

    if !packet_type.validate_flags(flags) {
        return Err(crate::Error::InvalidFlags);
    }

    Ok((packet_type, flags))
}

fn read_remaining_len<R: Read>(read: &mut R) -> Result<usize, crate::Error> {
    let mut remaining_len: usize = 0;
    let mut multiplier = 1;

    for _ in 0..4 {
        let byte = read_u8(read)?;

        remaining_len += (byte & 0x7F) as usize * multiplier;

        if byte & 0x80 == 0 {
            return Ok(remaining_len);
        }

        multiplier *= 128;
    }

    Err(crate::Error::MalformedRemainingLength)
}

fn read_u8<R: Read>(read: &mut R) -> Result<u8, crate::Error> {
    let mut buf = [0u8; 1];
    read_exact(read, &mut buf)?;

    Ok(buf[0])
}

fn read_exact<R: Read>(read: &mut R, buf: &mut [u8]) -> Result<(), crate::Error> {
    read.read_exact(buf).map_err(|err| match err {
        ReadExactError::UnexpectedEof => crate::Error::UnexpectedEof,
        ReadExactError::Other(err) => transport::stream_error(err),
    })
}
