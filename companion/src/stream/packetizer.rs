//! Splits stream messages into MTU-sized packets and reassembles them.

use serde_bytes::ByteBuf;

use companion_common::messages::Packet;

use super::StreamError;

/// Upper bound on a reassembled message; anything larger is treated as a
/// framing violation.
pub const MAX_REASSEMBLED_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Encoded size of a CBOR unsigned integer: the same 1/2/3/5/9 byte size
/// classes also apply to the header of a byte string of that length.
fn cbor_uint_len(value: u64) -> usize {
    match value {
        0..=0x17 => 1,
        0x18..=0xFF => 2,
        0x100..=0xFFFF => 3,
        0x1_0000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

/// Largest chunk that keeps an encoded packet within `mtu`, assuming the
/// packet counters encode in the size class of `assumed_total`.
fn max_chunk_len(mtu: usize, message_id: u32, assumed_total: u32) -> Option<usize> {
    // Array header plus the worst-case counter encodings: `packet_number`
    // never exceeds `total_packets`.
    let fixed = 1 + 2 * cbor_uint_len(u64::from(assumed_total)) + cbor_uint_len(u64::from(message_id));

    let mut chunk = mtu.checked_sub(fixed + 1)?;
    loop {
        if fixed + cbor_uint_len(chunk as u64) + chunk <= mtu {
            return Some(chunk);
        }
        if chunk == 0 {
            return None;
        }
        chunk -= 1;
    }
}

/// Splits `payload` into packets whose encoded size never exceeds `mtu`.
///
/// The per-packet overhead depends on how many bytes the `total_packets`
/// counter itself encodes in, so the packet count is found by fixed-point
/// iteration over the counter's size class.
pub fn pack(message_id: u32, payload: &[u8], mtu: usize) -> Result<Vec<Packet>, StreamError> {
    let mut assumed_total: u32 = 1;

    let (total_packets, chunk_len) = loop {
        let chunk = max_chunk_len(mtu, message_id, assumed_total)
            .filter(|chunk| *chunk > 0)
            .ok_or(StreamError::MtuTooSmall { mtu })?;

        let total = payload.len().div_ceil(chunk).max(1);
        let total = u32::try_from(total).map_err(|_| StreamError::MessageTooLarge)?;

        if cbor_uint_len(u64::from(total)) == cbor_uint_len(u64::from(assumed_total)) {
            break (total, chunk);
        }

        // The counter grew into a larger size class; redo with more headroom.
        assumed_total = total;
    };

    let packets = (0..total_packets)
        .map(|index| {
            let start = index as usize * chunk_len;
            let end = payload.len().min(start + chunk_len);

            Packet {
                packet_number: index + 1,
                total_packets,
                message_id,
                payload: ByteBuf::from(payload[start..end].to_vec()),
            }
        })
        .collect();

    Ok(packets)
}

#[derive(Debug)]
struct InProgressMessage {
    message_id: u32,
    total_packets: u32,
    last_packet_number: u32,
    buffer: Vec<u8>,
}

/// Reassembles packets back into messages.
///
/// Packets of one message arrive strictly in order; the only tolerated
/// anomaly is a retransmit of the most recently seen packet, including the
/// final packet of a message that already completed. Anything else is fatal
/// for the stream.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    in_progress: Option<InProgressMessage>,
    last_completed: Option<(u32, u32)>,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, packet: Packet) -> Result<Option<Vec<u8>>, StreamError> {
        let message_id = packet.message_id;

        if packet.total_packets == 0
            || packet.packet_number == 0
            || packet.packet_number > packet.total_packets
        {
            return Err(StreamError::MalformedPacket { message_id });
        }

        match self.in_progress.as_mut() {
            Some(message) if message.message_id == message_id => {
                if packet.total_packets != message.total_packets {
                    return Err(StreamError::TotalPacketsMismatch { message_id });
                }
                if packet.packet_number == message.last_packet_number {
                    // Duplicate of the last packet; drop it.
                    return Ok(None);
                }
                if packet.packet_number != message.last_packet_number + 1 {
                    return Err(StreamError::PacketOutOfOrder {
                        message_id,
                        expected: message.last_packet_number + 1,
                        received: packet.packet_number,
                    });
                }

                if message.buffer.len() + packet.payload.len() > MAX_REASSEMBLED_MESSAGE_SIZE {
                    return Err(StreamError::MessageTooLarge);
                }
                message.buffer.extend_from_slice(&packet.payload);
                message.last_packet_number = packet.packet_number;

                if packet.packet_number == message.total_packets {
                    let message = self.in_progress.take().expect("message is in progress");
                    self.last_completed = Some((message.message_id, message.total_packets));

                    return Ok(Some(message.buffer));
                }

                Ok(None)
            }
            Some(message) => Err(StreamError::InterleavedMessage {
                in_progress: message.message_id,
                received: message_id,
            }),
            None => {
                // A lone retransmit of the final packet of the message that
                // just completed is dropped rather than treated as a new one.
                if self.last_completed == Some((message_id, packet.total_packets))
                    && packet.packet_number == packet.total_packets
                {
                    return Ok(None);
                }

                if packet.packet_number != 1 {
                    return Err(StreamError::PacketOutOfOrder {
                        message_id,
                        expected: 1,
                        received: packet.packet_number,
                    });
                }

                if packet.payload.len() > MAX_REASSEMBLED_MESSAGE_SIZE {
                    return Err(StreamError::MessageTooLarge);
                }

                if packet.total_packets == 1 {
                    self.last_completed = Some((message_id, 1));

                    return Ok(Some(packet.payload.into_vec()));
                }

                self.in_progress = Some(InProgressMessage {
                    message_id,
                    total_packets: packet.total_packets,
                    last_packet_number: 1,
                    buffer: packet.payload.into_vec(),
                });

                Ok(None)
            }
        }
    }
}
