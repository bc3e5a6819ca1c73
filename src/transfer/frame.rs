use crate::wire::{DataPacket, Packet};
use std::io::{Error, ErrorKind, Read, Write};
use std::net::Ipv4Addr;

/// Byte length of the START frame for a file. The trailer has a fixed
/// width and marker packets carry no transit list, so this depends on the
/// file name alone and both ends can compute it without negotiation.
pub fn start_frame_len(file_name: &str) -> usize {
    DataPacket::start(file_name).encoded_len()
}

/// Slices a file into chunk-sized data packets between START and END
/// markers and back-fills every `next_size` trailer with the encoded
/// length of its successor (END keeps 0).
pub fn build_stream(
    file_name: &str,
    bytes: &[u8],
    chunk_size: usize,
    owner: Ipv4Addr,
) -> Vec<DataPacket> {
    let mut packets = Vec::with_capacity(bytes.len() / chunk_size.max(1) + 3);
    packets.push(DataPacket::start(file_name));
    for (i, chunk) in bytes.chunks(chunk_size.max(1)).enumerate() {
        packets.push(DataPacket {
            chunk_no: i as i64,
            payload: chunk.to_vec(),
            file_name: file_name.to_string(),
            transit: vec![owner],
            next_size: 0,
        });
    }
    packets.push(DataPacket::end(file_name));

    for i in (0..packets.len() - 1).rev() {
        packets[i].next_size = packets[i + 1].encoded_len();
    }
    packets
}

pub fn write_stream<W: Write>(writer: &mut W, packets: &[DataPacket]) -> Result<(), Error> {
    for packet in packets {
        writer.write_all(&Packet::DownloadData(packet.clone()).encode())?;
    }
    writer.flush()
}

fn read_packet<R: Read>(reader: &mut R, len: usize) -> Result<DataPacket, Error> {
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    match Packet::decode(&buf)? {
        Packet::DownloadData(packet) => Ok(packet),
        other => Err(Error::new(
            ErrorKind::InvalidData,
            format!("expected a data packet, got {:?}", other),
        )),
    }
}

/// Consumes a whole download stream and reassembles the file bytes.
/// Chunks are ordered by chunk number before concatenation even though TCP
/// already delivers them in order.
pub fn read_stream<R: Read>(reader: &mut R, file_name: &str) -> Result<Vec<u8>, Error> {
    let start = read_packet(reader, start_frame_len(file_name))?;
    if !start.is_start() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "download stream did not begin with a START marker",
        ));
    }

    let mut next_size = start.next_size;
    let mut chunks: Vec<(i64, Vec<u8>)> = Vec::new();
    loop {
        if next_size == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "download stream ended without an END marker",
            ));
        }
        let packet = read_packet(reader, next_size)?;
        next_size = packet.next_size;
        if packet.is_end() {
            break;
        }
        if packet.chunk_no < 0 {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("unexpected marker chunk {}", packet.chunk_no),
            ));
        }
        chunks.push((packet.chunk_no, packet.payload));
    }

    chunks.sort_by_key(|(chunk_no, _)| *chunk_no);
    Ok(chunks.into_iter().flat_map(|(_, payload)| payload).collect())
}

/// Restreams a download from `upstream` to `downstream`, appending this
/// node to the transit list of every data chunk. Runs one packet ahead of
/// what it writes so each rewritten trailer is the exact encoded length of
/// the (possibly grown) successor. Marker bodies pass through unchanged,
/// keeping the START frame length computable at the final client.
pub fn relay_stream<R: Read, W: Write>(
    upstream: &mut R,
    downstream: &mut W,
    file_name: &str,
    relay: Ipv4Addr,
) -> Result<(), Error> {
    let mut pending = read_packet(upstream, start_frame_len(file_name))?;
    if !pending.is_start() {
        return Err(Error::new(
            ErrorKind::InvalidData,
            "upstream did not begin with a START marker",
        ));
    }

    loop {
        if pending.is_end() {
            downstream.write_all(&Packet::DownloadData(pending).encode())?;
            return downstream.flush();
        }
        let upstream_next = pending.next_size;
        if upstream_next == 0 {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                "upstream ended without an END marker",
            ));
        }
        let mut successor = read_packet(upstream, upstream_next)?;
        if successor.chunk_no >= 0 {
            successor.transit.push(relay);
        }
        pending.next_size = successor.encoded_len();
        downstream.write_all(&Packet::DownloadData(pending).encode())?;
        pending = successor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CHUNK: usize = 10;

    fn owner() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 2)
    }

    fn relay() -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, 3)
    }

    fn to_bytes(packets: &[DataPacket]) -> Vec<u8> {
        let mut out = Vec::new();
        write_stream(&mut out, packets).unwrap();
        out
    }

    #[test]
    fn test_build_stream_shape() {
        let packets = build_stream("r.txt", b"HELLO_WORLD!", CHUNK, owner());
        assert_eq!(packets.len(), 4);
        assert!(packets[0].is_start());
        assert_eq!(packets[1].payload, b"HELLO_WORLD");
        assert_eq!(packets[2].payload, b"!");
        assert!(packets[3].is_end());
        assert_eq!(packets[1].transit, vec![owner()]);
        assert!(packets[0].transit.is_empty());
    }

    #[test]
    fn test_trailers_point_at_successors() {
        let packets = build_stream("r.txt", b"0123456789abcdef", CHUNK, owner());
        for pair in packets.windows(2) {
            assert_eq!(pair[0].next_size, pair[1].encoded_len());
        }
        assert_eq!(packets.last().unwrap().next_size, 0);
    }

    #[test]
    fn test_exact_multiple_of_chunk_size() {
        let packets = build_stream("r.txt", &[7u8; 20], CHUNK, owner());
        // START, two full chunks, END
        assert_eq!(packets.len(), 4);
        assert_eq!(packets[2].payload.len(), CHUNK);
    }

    #[test]
    fn test_empty_file_is_just_markers() {
        let packets = build_stream("r.txt", b"", CHUNK, owner());
        assert_eq!(packets.len(), 2);
        assert!(packets[0].is_start());
        assert!(packets[1].is_end());
    }

    #[test]
    fn test_read_stream_roundtrip() {
        let content = b"HELLO_WORLD!";
        let bytes = to_bytes(&build_stream("r.txt", content, CHUNK, owner()));
        let mut reader = Cursor::new(bytes);
        assert_eq!(read_stream(&mut reader, "r.txt").unwrap(), content);
    }

    #[test]
    fn test_read_stream_handles_binary_content() {
        let content: Vec<u8> = (0u8..=255).cycle().take(997).collect();
        let bytes = to_bytes(&build_stream("blob.bin", &content, 64, owner()));
        let mut reader = Cursor::new(bytes);
        assert_eq!(read_stream(&mut reader, "blob.bin").unwrap(), content);
    }

    #[test]
    fn test_read_stream_rejects_truncation() {
        let mut bytes = to_bytes(&build_stream("r.txt", b"HELLO_WORLD!", CHUNK, owner()));
        bytes.truncate(bytes.len() - 10);
        let mut reader = Cursor::new(bytes);
        assert!(read_stream(&mut reader, "r.txt").is_err());
    }

    #[test]
    fn test_relay_preserves_bytes_and_records_transit() {
        let content = b"The quick brown fox jumps over the lazy dog";
        let upstream = to_bytes(&build_stream("fox.txt", content, CHUNK, owner()));

        let mut relayed = Vec::new();
        relay_stream(&mut Cursor::new(upstream), &mut relayed, "fox.txt", relay()).unwrap();

        // the relayed stream still reassembles to the same bytes
        assert_eq!(read_stream(&mut Cursor::new(relayed.clone()), "fox.txt").unwrap(), content);

        // and its data chunks carry the transit chain, markers untouched
        let mut reader = Cursor::new(relayed);
        let start = read_packet(&mut reader, start_frame_len("fox.txt")).unwrap();
        assert!(start.transit.is_empty());
        let mut next_size = start.next_size;
        loop {
            let packet = read_packet(&mut reader, next_size).unwrap();
            next_size = packet.next_size;
            if packet.is_end() {
                assert!(packet.transit.is_empty());
                break;
            }
            assert_eq!(packet.transit, vec![owner(), relay()]);
        }
    }

    #[test]
    fn test_two_relays_stack_their_addresses() {
        let content = b"chained";
        let hop0 = to_bytes(&build_stream("c.txt", content, CHUNK, owner()));
        let mut hop1 = Vec::new();
        relay_stream(&mut Cursor::new(hop0), &mut hop1, "c.txt", relay()).unwrap();
        let second_relay = Ipv4Addr::new(10, 0, 0, 4);
        let mut hop2 = Vec::new();
        relay_stream(&mut Cursor::new(hop1), &mut hop2, "c.txt", second_relay).unwrap();

        assert_eq!(read_stream(&mut Cursor::new(hop2.clone()), "c.txt").unwrap(), content);
        let mut reader = Cursor::new(hop2);
        let start = read_packet(&mut reader, start_frame_len("c.txt")).unwrap();
        let chunk = read_packet(&mut reader, start.next_size).unwrap();
        assert_eq!(chunk.transit, vec![owner(), relay(), second_relay]);
    }
}
