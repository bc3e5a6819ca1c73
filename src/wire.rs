use std::io::{Error, ErrorKind};
use std::net::Ipv4Addr;

/// Separates the fields of a control message.
pub const FIELD_SEP: u8 = b';';
/// Separates the elements of a list field (reached path, hit list).
pub const LIST_SEP: u8 = b'#';
/// Separates the sub-fields of a compound list element (a file hit).
pub const SUB_SEP: u8 = b'&';

pub const START_CHUNK_NO: i64 = -1;
pub const END_CHUNK_NO: i64 = -2;
pub const START_CHUNK_DATA: &[u8] = b"START_CHUNK";
pub const END_CHUNK_DATA: &[u8] = b"END_CHUNK";

/// Width of the zero-padded decimal `next_packet_size` trailer on a
/// DOWNLOAD_DATA packet.
pub const NEXT_PACKET_SIZE_LEN: usize = 4;

/// One search result: where a file of this name can be fetched from and how
/// many hops away the actual bytes live. `source` is always the direct
/// neighbor that supplied the hit (or this node itself), because every node
/// rewrites `source` to its own address before passing a reply upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHit {
    pub file_name: String,
    pub size: u64,
    pub source: Ipv4Addr,
    pub depth: u32,
}

/// One frame of a download stream. The trailer carries the encoded byte
/// length of the *next* packet on the wire, which is what makes the stream
/// self-synchronizing: after the first (locally computable) START read, the
/// receiver always knows exactly how many bytes to pull next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// 0-based chunk number, or START_CHUNK_NO / END_CHUNK_NO for markers.
    pub chunk_no: i64,
    pub payload: Vec<u8>,
    pub file_name: String,
    /// Nodes the chunk passed through; the owner seeds it with itself and
    /// every relay appends its own address. Empty on marker packets so that
    /// the START frame keeps the same length across any relay chain.
    pub transit: Vec<Ipv4Addr>,
    pub next_size: usize,
}

impl DataPacket {
    pub fn start(file_name: &str) -> DataPacket {
        DataPacket {
            chunk_no: START_CHUNK_NO,
            payload: START_CHUNK_DATA.to_vec(),
            file_name: file_name.to_string(),
            transit: Vec::new(),
            next_size: 0,
        }
    }

    pub fn end(file_name: &str) -> DataPacket {
        DataPacket {
            chunk_no: END_CHUNK_NO,
            payload: END_CHUNK_DATA.to_vec(),
            file_name: file_name.to_string(),
            transit: Vec::new(),
            next_size: 0,
        }
    }

    pub fn is_start(&self) -> bool {
        self.chunk_no == START_CHUNK_NO
    }

    pub fn is_end(&self) -> bool {
        self.chunk_no == END_CHUNK_NO
    }

    /// Encoded length of this packet. Independent of the `next_size` value
    /// since the trailer has a fixed width.
    pub fn encoded_len(&self) -> usize {
        Packet::DownloadData(self.clone()).encode().len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    JoinReq,
    JoinAck {
        neighbors: usize,
    },
    NeighborReq,
    SearchReq {
        file_name: String,
        path: Vec<Ipv4Addr>,
        search_id: String,
    },
    SearchRes {
        file_name: String,
        path: Vec<Ipv4Addr>,
        hits: Vec<FileHit>,
        search_id: String,
    },
    DownloadReq {
        file_name: String,
    },
    DownloadData(DataPacket),
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::JoinReq => out.extend_from_slice(b"JOIN_REQ"),
            Packet::JoinAck { neighbors } => {
                out.extend_from_slice(b"JOIN_ACK;");
                out.extend_from_slice(neighbors.to_string().as_bytes());
            }
            Packet::NeighborReq => out.extend_from_slice(b"NEIGHBOR_REQ"),
            Packet::SearchReq {
                file_name,
                path,
                search_id,
            } => {
                out.extend_from_slice(b"SEARCH_REQ;");
                escape_into(file_name.as_bytes(), &mut out);
                out.push(FIELD_SEP);
                push_ip_list(path, &mut out);
                out.push(FIELD_SEP);
                escape_into(search_id.as_bytes(), &mut out);
            }
            Packet::SearchRes {
                file_name,
                path,
                hits,
                search_id,
            } => {
                out.extend_from_slice(b"SEARCH_RES;");
                escape_into(file_name.as_bytes(), &mut out);
                out.push(FIELD_SEP);
                push_ip_list(path, &mut out);
                out.push(FIELD_SEP);
                for (i, hit) in hits.iter().enumerate() {
                    if i > 0 {
                        out.push(LIST_SEP);
                    }
                    escape_into(hit.file_name.as_bytes(), &mut out);
                    out.push(SUB_SEP);
                    out.extend_from_slice(hit.size.to_string().as_bytes());
                    out.push(SUB_SEP);
                    out.extend_from_slice(hit.source.to_string().as_bytes());
                    out.push(SUB_SEP);
                    out.extend_from_slice(hit.depth.to_string().as_bytes());
                }
                out.push(FIELD_SEP);
                escape_into(search_id.as_bytes(), &mut out);
            }
            Packet::DownloadReq { file_name } => {
                out.extend_from_slice(b"DOWNLOAD_REQ;");
                escape_into(file_name.as_bytes(), &mut out);
            }
            Packet::DownloadData(packet) => {
                out.extend_from_slice(b"DOWNLOAD_DATA;");
                out.extend_from_slice(packet.chunk_no.to_string().as_bytes());
                out.push(FIELD_SEP);
                escape_into(&packet.payload, &mut out);
                out.push(FIELD_SEP);
                escape_into(packet.file_name.as_bytes(), &mut out);
                out.push(FIELD_SEP);
                push_ip_list(&packet.transit, &mut out);
                out.push(FIELD_SEP);
                out.extend_from_slice(
                    format!("{:0width$}", packet.next_size, width = NEXT_PACKET_SIZE_LEN)
                        .as_bytes(),
                );
            }
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Packet, Error> {
        let fields: Vec<&[u8]> = data.split(|b| *b == FIELD_SEP).collect();
        let command = std::str::from_utf8(fields[0])
            .map_err(|_| Error::new(ErrorKind::InvalidData, "command tag is not ascii"))?;

        match (command, fields.len()) {
            ("JOIN_REQ", 1) => Ok(Packet::JoinReq),
            ("JOIN_ACK", 2) => Ok(Packet::JoinAck {
                neighbors: parse_number(fields[1])?,
            }),
            ("NEIGHBOR_REQ", 1) => Ok(Packet::NeighborReq),
            ("SEARCH_REQ", 4) => Ok(Packet::SearchReq {
                file_name: parse_text(fields[1])?,
                path: parse_ip_list(fields[2])?,
                search_id: parse_text(fields[3])?,
            }),
            ("SEARCH_RES", 5) => Ok(Packet::SearchRes {
                file_name: parse_text(fields[1])?,
                path: parse_ip_list(fields[2])?,
                hits: parse_hits(fields[3])?,
                search_id: parse_text(fields[4])?,
            }),
            ("DOWNLOAD_REQ", 2) => Ok(Packet::DownloadReq {
                file_name: parse_text(fields[1])?,
            }),
            ("DOWNLOAD_DATA", 6) => {
                if fields[5].len() != NEXT_PACKET_SIZE_LEN {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        "next-size trailer must be exactly 4 digits",
                    ));
                }
                Ok(Packet::DownloadData(DataPacket {
                    chunk_no: parse_number(fields[1])?,
                    payload: unescape(fields[2])?,
                    file_name: parse_text(fields[3])?,
                    transit: parse_ip_list(fields[4])?,
                    next_size: parse_number(fields[5])?,
                }))
            }
            _ => Err(Error::new(
                ErrorKind::InvalidData,
                format!("unknown command or wrong arity: {:?}", command),
            )),
        }
    }
}

/// Copies `input` into `out`, percent-escaping the three separator bytes and
/// `%` itself. Works on raw bytes so chunk payloads need not be UTF-8.
fn escape_into(input: &[u8], out: &mut Vec<u8>) {
    for &byte in input {
        match byte {
            b'%' => out.extend_from_slice(b"%25"),
            b';' => out.extend_from_slice(b"%3B"),
            b'#' => out.extend_from_slice(b"%23"),
            b'&' => out.extend_from_slice(b"%26"),
            _ => out.push(byte),
        }
    }
}

fn unescape(input: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' {
            let digits = input
                .get(i + 1..i + 3)
                .ok_or_else(|| Error::new(ErrorKind::InvalidData, "truncated escape sequence"))?;
            out.push(hex_value(digits[0])? * 16 + hex_value(digits[1])?);
            i += 3;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    Ok(out)
}

fn hex_value(byte: u8) -> Result<u8, Error> {
    match byte {
        b'0'..=b'9' => Ok(byte - b'0'),
        b'a'..=b'f' => Ok(byte - b'a' + 10),
        b'A'..=b'F' => Ok(byte - b'A' + 10),
        _ => Err(Error::new(
            ErrorKind::InvalidData,
            "escape sequence is not hex",
        )),
    }
}

fn parse_text(field: &[u8]) -> Result<String, Error> {
    String::from_utf8(unescape(field)?)
        .map_err(|_| Error::new(ErrorKind::InvalidData, "text field is not utf-8"))
}

fn parse_number<T: std::str::FromStr>(field: &[u8]) -> Result<T, Error> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "malformed numeric field"))
}

fn parse_ip(field: &[u8]) -> Result<Ipv4Addr, Error> {
    std::str::from_utf8(field)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, "malformed ipv4 address"))
}

fn push_ip_list(list: &[Ipv4Addr], out: &mut Vec<u8>) {
    for (i, ip) in list.iter().enumerate() {
        if i > 0 {
            out.push(LIST_SEP);
        }
        out.extend_from_slice(ip.to_string().as_bytes());
    }
}

fn parse_ip_list(field: &[u8]) -> Result<Vec<Ipv4Addr>, Error> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field.split(|b| *b == LIST_SEP).map(parse_ip).collect()
}

fn parse_hits(field: &[u8]) -> Result<Vec<FileHit>, Error> {
    if field.is_empty() {
        return Ok(Vec::new());
    }
    field
        .split(|b| *b == LIST_SEP)
        .map(|element| {
            let parts: Vec<&[u8]> = element.split(|b| *b == SUB_SEP).collect();
            if parts.len() != 4 {
                return Err(Error::new(
                    ErrorKind::InvalidData,
                    "file hit should have exactly 4 sub-fields",
                ));
            }
            Ok(FileHit {
                file_name: parse_text(parts[0])?,
                size: parse_number(parts[1])?,
                source: parse_ip(parts[2])?,
                depth: parse_number(parts[3])?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: Packet) {
        let bytes = packet.encode();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_join_req() {
        let bytes = Packet::JoinReq.encode();
        assert_eq!(bytes, b"JOIN_REQ");
        roundtrip(Packet::JoinReq);
    }

    #[test]
    fn test_join_ack() {
        let bytes = Packet::JoinAck { neighbors: 3 }.encode();
        assert_eq!(bytes, b"JOIN_ACK;3");
        roundtrip(Packet::JoinAck { neighbors: 0 });
    }

    #[test]
    fn test_neighbor_req() {
        assert_eq!(Packet::NeighborReq.encode(), b"NEIGHBOR_REQ");
        roundtrip(Packet::NeighborReq);
    }

    #[test]
    fn test_search_req() {
        let packet = Packet::SearchReq {
            file_name: "report".to_string(),
            path: vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
            search_id: "ab12".to_string(),
        };
        assert_eq!(packet.encode(), b"SEARCH_REQ;report;10.0.0.1#10.0.0.2;ab12");
        roundtrip(packet);
    }

    #[test]
    fn test_search_req_empty_path() {
        roundtrip(Packet::SearchReq {
            file_name: "a".to_string(),
            path: vec![],
            search_id: "x".to_string(),
        });
    }

    #[test]
    fn test_search_res() {
        let packet = Packet::SearchRes {
            file_name: "r".to_string(),
            path: vec![Ipv4Addr::new(10, 0, 0, 1)],
            hits: vec![
                FileHit {
                    file_name: "r.txt".to_string(),
                    size: 12,
                    source: Ipv4Addr::new(10, 0, 0, 2),
                    depth: 1,
                },
                FileHit {
                    file_name: "report.pdf".to_string(),
                    size: 9000,
                    source: Ipv4Addr::new(10, 0, 0, 3),
                    depth: 0,
                },
            ],
            search_id: "ff".to_string(),
        };
        assert_eq!(
            packet.encode(),
            &b"SEARCH_RES;r;10.0.0.1;r.txt&12&10.0.0.2&1#report.pdf&9000&10.0.0.3&0;ff"[..]
        );
        roundtrip(packet);
    }

    #[test]
    fn test_search_res_no_hits() {
        roundtrip(Packet::SearchRes {
            file_name: "none".to_string(),
            path: vec![],
            hits: vec![],
            search_id: "id".to_string(),
        });
    }

    #[test]
    fn test_download_req() {
        let packet = Packet::DownloadReq {
            file_name: "r.txt".to_string(),
        };
        assert_eq!(packet.encode(), b"DOWNLOAD_REQ;r.txt");
        roundtrip(packet);
    }

    #[test]
    fn test_download_data() {
        let packet = Packet::DownloadData(DataPacket {
            chunk_no: 0,
            payload: b"HELLO_WORL".to_vec(),
            file_name: "r.txt".to_string(),
            transit: vec![Ipv4Addr::new(10, 0, 0, 2)],
            next_size: 57,
        });
        assert_eq!(
            packet.encode(),
            &b"DOWNLOAD_DATA;0;HELLO_WORL;r.txt;10.0.0.2;0057"[..]
        );
        roundtrip(packet);
    }

    #[test]
    fn test_start_marker_length_is_name_dependent_only() {
        // the client computes the first read length from the file name alone,
        // so the START frame must not vary with anything else
        let a = Packet::DownloadData(DataPacket::start("r.txt")).encode();
        assert_eq!(a.len(), DataPacket::start("r.txt").encoded_len());
        let mut with_next = DataPacket::start("r.txt");
        with_next.next_size = 1234;
        assert_eq!(with_next.encoded_len(), a.len());
    }

    #[test]
    fn test_separators_in_names_are_escaped() {
        roundtrip(Packet::SearchReq {
            file_name: "we;rd#na&me%.txt".to_string(),
            path: vec![Ipv4Addr::new(192, 168, 1, 9)],
            search_id: "id".to_string(),
        });
        let bytes = Packet::DownloadReq {
            file_name: "a;b".to_string(),
        }
        .encode();
        assert_eq!(bytes, b"DOWNLOAD_REQ;a%3Bb");
    }

    #[test]
    fn test_binary_payload_roundtrip() {
        let payload: Vec<u8> = (0u8..=255).collect();
        roundtrip(Packet::DownloadData(DataPacket {
            chunk_no: 7,
            payload,
            file_name: "blob.bin".to_string(),
            transit: vec![Ipv4Addr::new(10, 0, 0, 3), Ipv4Addr::new(10, 0, 0, 2)],
            next_size: 0,
        }));
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        assert!(Packet::decode(b"HELLO;1").is_err());
        assert!(Packet::decode(b"").is_err());
    }

    #[test]
    fn test_decode_rejects_wrong_arity() {
        assert!(Packet::decode(b"SEARCH_REQ;name;10.0.0.1").is_err());
        assert!(Packet::decode(b"JOIN_ACK").is_err());
        assert!(Packet::decode(b"JOIN_ACK;1;2").is_err());
    }

    #[test]
    fn test_decode_rejects_bad_numbers() {
        assert!(Packet::decode(b"JOIN_ACK;three").is_err());
        assert!(Packet::decode(b"DOWNLOAD_DATA;x;p;f;;0000").is_err());
    }

    #[test]
    fn test_decode_rejects_bad_trailer_width() {
        assert!(Packet::decode(b"DOWNLOAD_DATA;0;p;f;;12345").is_err());
        assert!(Packet::decode(b"DOWNLOAD_DATA;0;p;f;;12").is_err());
    }

    #[test]
    fn test_decode_rejects_bad_hit() {
        assert!(Packet::decode(b"SEARCH_RES;r;;only&two;id").is_err());
        assert!(Packet::decode(b"SEARCH_RES;r;;n&1&not-an-ip&0;id").is_err());
    }
}
