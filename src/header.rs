//! Control header wire format.
//!
//! A [`ControlInfo`] header is DMA'd after every payload, and back again as
//! feedback.  Both peers must agree on its layout bit for bit, so it is
//! serialized with explicit offsets rather than relying on struct layout:
//!
//! | Offset | Size | Field       |                                        |
//! |--------|------|-------------|----------------------------------------|
//! | 0      | 1    | flags       | `FLA` bit 7, `SET` 6, `BIS` 5, `CEN` 4, bit 3 reserved, `REV` 2..0 |
//! | 1      | 1    | `PART`      | position of the sub-buffer within its write |
//! | 2      | 2    | reserved    | zero                                   |
//! | 4      | 1    | `PK_ID`     | packet / session id                    |
//! | 5      | 1    | `SUB_BUF`   | sub-buffer index in the ring           |
//! | 6      | 1    | `FCNT`      | fill counter, low byte of `SEQ`        |
//! | 7      | 1    | `CH_ID`     | DMA channel number of the channel      |
//! | 8      | 8    | `BUF_ADDR`  | payload destination                    |
//! | 16     | 8    | `BUF_SIZE`  | payload length in bytes                |
//! | 24     | 8    | `INFO_ADDR` | header destination                     |
//! | 32     | 8    | `SEQ`       | full transfer sequence number          |
//!
//! The 64-bit fields are written in the [`ByteOrder`] both peers are
//! configured with.  Little endian is the default; a peer running on a
//! big-endian CPU that lays the header out natively needs
//! [`ByteOrder::Big`] on both ends.
//!
//! Headers occupy [`HEADER_SLOT`] bytes in the control regions; only the
//! first [`HEADER_LEN`] bytes are transferred.
//!
//! The flags byte sits at offset 0.  A receiver treats a slot whose `FLA`
//! (or, for feedback, `SET`) bit is clear as not yet written.
//!
//! Port commands ([`PortMessage`]) use the same slot size and the same
//! convention: byte 0 is never zero in a written message.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use bitflags::bitflags;

use crate::{Error, Result};

/// Bytes of a header that go over the wire.
pub const HEADER_LEN: usize = 40;

/// Stride of header slots in the control regions.
pub const HEADER_SLOT: usize = 256;

/// Offset of the flags byte.
pub const FLAGS_OFFSET: usize = 0;

const PART_OFFSET: usize = 1;
const PK_ID_OFFSET: usize = 4;
const SUB_BUF_OFFSET: usize = 5;
const FCNT_OFFSET: usize = 6;
const CH_ID_OFFSET: usize = 7;
const BUF_ADDR_OFFSET: usize = 8;
const BUF_SIZE_OFFSET: usize = 16;
const INFO_ADDR_OFFSET: usize = 24;
const SEQ_OFFSET: usize = 32;

bitflags! {
    /// Header flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControlFlags: u8 {
        /// Sub-buffer filled and valid
        const FLA = 0x80;
        /// Sub-buffer released by the reader (feedback)
        const SET = 0x40;
        /// Part of a multi-sub-buffer write
        const BIS = 0x20;
        /// Last sub-buffer of a multi-sub-buffer write
        const CEN = 0x10;
    }
}

const REV_MASK: u8 = 0x07;

/// Byte order of multi-byte header fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Little,
    Big,
}

impl ByteOrder {
    fn put_u64(self, buf: &mut [u8], offset: usize, value: u64) {
        let bytes = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[offset..offset + 8].copy_from_slice(&bytes);
    }

    fn get_u64(self, buf: &[u8], offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[offset..offset + 8]);
        match self {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        }
    }

    fn put_u32(self, buf: &mut [u8], offset: usize, value: u32) {
        let bytes = match self {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        buf[offset..offset + 4].copy_from_slice(&bytes);
    }

    fn get_u32(self, buf: &[u8], offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[offset..offset + 4]);
        match self {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        }
    }
}

/// A control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlInfo {
    pub flags: ControlFlags,
    /// Three-bit version field
    pub rev: u8,
    /// Index of this sub-buffer within its write; 0 starts a write
    pub part: u8,
    pub packet_id: u8,
    pub sub_buf: u8,
    pub fill_count: u8,
    pub channel_id: u8,
    pub buf_addr: u64,
    pub buf_size: u64,
    pub info_addr: u64,
    pub seq: u64,
}

impl ControlInfo {
    /// Header announcing that sub-buffer `sub_buf` holds transfer `seq`.
    pub fn filled(packet_id: u8, channel_id: u8, sub_buf: u8, seq: u64) -> Self {
        Self {
            flags: ControlFlags::FLA,
            packet_id,
            sub_buf,
            fill_count: seq as u8,
            channel_id,
            seq,
            ..Default::default()
        }
    }

    /// Feedback releasing sub-buffer `sub_buf`, which held transfer `seq`.
    pub fn released(packet_id: u8, channel_id: u8, sub_buf: u8, seq: u64) -> Self {
        Self {
            flags: ControlFlags::SET,
            ..Self::filled(packet_id, channel_id, sub_buf, seq)
        }
    }

    pub fn is_filled(&self) -> bool {
        self.flags.contains(ControlFlags::FLA)
    }

    pub fn is_released(&self) -> bool {
        self.flags.contains(ControlFlags::SET)
    }

    /// Whether this sub-buffer ends its write: a single sub-buffer write,
    /// or the `CEN` sub-buffer of a multi-sub-buffer one.
    pub fn ends_write(&self) -> bool {
        !self.flags.contains(ControlFlags::BIS) || self.flags.contains(ControlFlags::CEN)
    }

    /// Serialize to wire format.
    pub fn encode(&self, order: ByteOrder) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[FLAGS_OFFSET] = self.flags.bits() | (self.rev & REV_MASK);
        buf[PART_OFFSET] = self.part;
        buf[PK_ID_OFFSET] = self.packet_id;
        buf[SUB_BUF_OFFSET] = self.sub_buf;
        buf[FCNT_OFFSET] = self.fill_count;
        buf[CH_ID_OFFSET] = self.channel_id;
        order.put_u64(&mut buf, BUF_ADDR_OFFSET, self.buf_addr);
        order.put_u64(&mut buf, BUF_SIZE_OFFSET, self.buf_size);
        order.put_u64(&mut buf, INFO_ADDR_OFFSET, self.info_addr);
        order.put_u64(&mut buf, SEQ_OFFSET, self.seq);
        buf
    }

    /// Parse wire format.  Unknown flag bits are ignored.
    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::BufferTooSmall);
        }
        Ok(Self {
            flags: ControlFlags::from_bits_truncate(buf[FLAGS_OFFSET]),
            rev: buf[FLAGS_OFFSET] & REV_MASK,
            part: buf[PART_OFFSET],
            packet_id: buf[PK_ID_OFFSET],
            sub_buf: buf[SUB_BUF_OFFSET],
            fill_count: buf[FCNT_OFFSET],
            channel_id: buf[CH_ID_OFFSET],
            buf_addr: order.get_u64(buf, BUF_ADDR_OFFSET),
            buf_size: order.get_u64(buf, BUF_SIZE_OFFSET),
            info_addr: order.get_u64(buf, INFO_ADDR_OFFSET),
            seq: order.get_u64(buf, SEQ_OFFSET),
        })
    }
}

/// Bytes of a port message that go over the wire.
pub const PORT_MESSAGE_LEN: usize = 16;

const ACK_BIT: u8 = 0x80;
const STATUS_OFFSET: usize = 1;
const CHANNELS_OFFSET: usize = 2;
const SUB_BUFS_OFFSET: usize = 4;
const SIZE_OFFSET: usize = 8;

/// Command one end of a port sends the other.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortCommand {
    /// Compare ring geometry and restart every channel ring on the port
    Init = 1,
    /// Mark the port started
    Start = 2,
    /// Restart every channel ring on the port and mark it stopped
    Stop = 3,
}

impl TryFrom<u8> for PortCommand {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PortCommand::Init),
            2 => Ok(PortCommand::Start),
            3 => Ok(PortCommand::Stop),
            _ => Err(Error::InvalidOperation),
        }
    }
}

/// Ring geometry both ends of a port must share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub dma_channels: u8,
    pub sub_buf_count: u32,
    pub buf_size: u64,
}

/// A port command, or the acknowledgement of one.
///
/// | Offset | Size | Field                                   |
/// |--------|------|-----------------------------------------|
/// | 0      | 1    | command, bit 7 set in an acknowledgement |
/// | 1      | 1    | status: 0 accepted, 1 refused           |
/// | 2      | 1    | DMA channels per port                   |
/// | 3      | 1    | reserved                                |
/// | 4      | 4    | sub-buffers per ring                    |
/// | 8      | 8    | bytes per sub-buffer                    |
///
/// Both directions carry the sender's own geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMessage {
    pub command: PortCommand,
    pub ack: bool,
    pub accepted: bool,
    pub geometry: Geometry,
}

impl PortMessage {
    pub fn command(command: PortCommand, geometry: Geometry) -> Self {
        Self {
            command,
            ack: false,
            accepted: true,
            geometry,
        }
    }

    pub fn ack(command: PortCommand, accepted: bool, geometry: Geometry) -> Self {
        Self {
            command,
            ack: true,
            accepted,
            geometry,
        }
    }

    pub fn encode(&self, order: ByteOrder) -> [u8; PORT_MESSAGE_LEN] {
        let mut buf = [0u8; PORT_MESSAGE_LEN];
        buf[0] = self.command as u8 | if self.ack { ACK_BIT } else { 0 };
        buf[STATUS_OFFSET] = u8::from(!self.accepted);
        buf[CHANNELS_OFFSET] = self.geometry.dma_channels;
        order.put_u32(&mut buf, SUB_BUFS_OFFSET, self.geometry.sub_buf_count);
        order.put_u64(&mut buf, SIZE_OFFSET, self.geometry.buf_size);
        buf
    }

    pub fn decode(buf: &[u8], order: ByteOrder) -> Result<Self> {
        if buf.len() < PORT_MESSAGE_LEN {
            return Err(Error::BufferTooSmall);
        }
        Ok(Self {
            command: PortCommand::try_from(buf[0] & !ACK_BIT)?,
            ack: buf[0] & ACK_BIT != 0,
            accepted: buf[STATUS_OFFSET] == 0,
            geometry: Geometry {
                dma_channels: buf[CHANNELS_OFFSET],
                sub_buf_count: order.get_u32(buf, SUB_BUFS_OFFSET),
                buf_size: order.get_u64(buf, SIZE_OFFSET),
            },
        })
    }
}
