//! Per-call state on top of a multiplexed channel.

mod client;
mod server;

use bytes::{Bytes, BytesMut};

use crate::channel::wire::PacketMessage;
use crate::status::Status;

pub use client::ClientStream;
pub use server::{RequestContext, RequestStream, ResponseSink, ServerStream};

pub(crate) use server::StreamInput;

/// Largest reassembled message a stream accepts.
pub const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Splits `payload` into packets of at most `chunk_size` bytes. An empty
/// payload still yields one (empty) packet so the message is delivered.
pub(crate) fn chunk_message(payload: Bytes, chunk_size: usize) -> Vec<PacketMessage> {
    if payload.len() <= chunk_size {
        return vec![PacketMessage {
            data: payload,
            eom: true,
        }];
    }
    let mut packets = Vec::with_capacity(payload.len().div_ceil(chunk_size));
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk_size).min(payload.len());
        packets.push(PacketMessage {
            data: payload.slice(offset..end),
            eom: end == payload.len(),
        });
        offset = end;
    }
    packets
}

/// Accumulates packets until one carries the end-of-message flag.
#[derive(Debug, Default)]
pub(crate) struct MessageAssembler {
    buffer: BytesMut,
    partial: bool,
}

impl MessageAssembler {
    pub(crate) fn push(&mut self, packet: PacketMessage) -> Result<Option<Bytes>, Status> {
        if !self.partial && packet.eom {
            return Ok(Some(packet.data));
        }
        if self.buffer.len() + packet.data.len() > MAX_MESSAGE_BYTES {
            self.buffer.clear();
            self.partial = false;
            return Err(Status::resource_exhausted(format!(
                "message exceeds {MAX_MESSAGE_BYTES} bytes"
            )));
        }
        self.buffer.extend_from_slice(&packet.data);
        if packet.eom {
            self.partial = false;
            return Ok(Some(self.buffer.split().freeze()));
        }
        self.partial = true;
        Ok(None)
    }

    pub(crate) fn is_partial(&self) -> bool {
        self.partial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn large_payload_is_chunked_and_reassembled() {
        let payload: Bytes = (0..(1usize << 18)).map(|i| (i % 251) as u8).collect();
        let packets = chunk_message(payload.clone(), 16 * 1024 - 64);
        assert!(packets.len() > 1);
        assert!(packets.iter().rev().skip(1).all(|packet| !packet.eom));
        assert!(packets.last().unwrap().eom);

        let mut assembler = MessageAssembler::default();
        let mut out = None;
        for packet in packets {
            out = assembler.push(packet).unwrap();
        }
        assert_eq!(out.unwrap(), payload);
        assert!(!assembler.is_partial());
    }

    #[test_timeout::timeout]
    fn empty_payload_is_one_packet() {
        let packets = chunk_message(Bytes::new(), 1024);
        assert_eq!(packets.len(), 1);
        assert!(packets[0].eom);
    }

    #[test_timeout::timeout]
    fn oversized_message_is_rejected() {
        let mut assembler = MessageAssembler::default();
        let chunk = Bytes::from(vec![0u8; 1024 * 1024]);
        for _ in 0..4 {
            assert_eq!(
                assembler
                    .push(PacketMessage {
                        data: chunk.clone(),
                        eom: false
                    })
                    .unwrap(),
                None
            );
        }
        let err = assembler
            .push(PacketMessage {
                data: Bytes::from_static(b"x"),
                eom: true,
            })
            .unwrap_err();
        assert_eq!(err.code(), crate::status::Code::ResourceExhausted);
    }
}
