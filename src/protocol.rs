//! eISCP frame encoding and decoding.
//!
//! Every ISCP message travels inside a 16-byte header:
//!
//! ```text
//! "ISCP" | header size (u32 BE, 16) | data size (u32 BE) | version (1) | 3 reserved
//! ```
//!
//! followed by the ASCII payload `"!1" + message + CR LF`.

use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame magic
pub const MAGIC: &[u8; 4] = b"ISCP";

/// Size of the fixed frame header
pub const HEADER_SIZE: usize = 16;

/// Protocol version written into every frame
pub const VERSION: u8 = 1;

/// Offset of the message text inside a frame (header plus `"!1"`)
const PAYLOAD_OFFSET: usize = HEADER_SIZE + 2;

/// Trailing bytes stripped from a decoded frame (CR LF)
const TRAILER_LEN: usize = 2;

/// Upper bound on the payload size accepted from the wire
const MAX_DATA_SIZE: usize = 64 * 1024;

/// Parsed eISCP frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub header_size: u32,
    pub data_size: u32,
    pub version: u8,
}

impl FrameHeader {
    /// Parse the first 16 bytes of a frame. Returns `None` if the magic does not match.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE || &bytes[0..4] != MAGIC {
            return None;
        }

        let header_size = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let data_size = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);

        Some(Self {
            header_size,
            data_size,
            version: bytes[12],
        })
    }
}

/// Wrap an ISCP message in an eISCP frame
///
/// Messages that do not already carry a start character get the `"!1"`
/// (receiver unit type) prefix.
pub fn encode(message: &str) -> Vec<u8> {
    let mut payload = String::with_capacity(message.len() + 4);
    if !message.starts_with('!') {
        payload.push_str("!1");
    }
    payload.push_str(message);
    payload.push_str("\r\n");

    let data = payload.as_bytes();
    let mut frame = Vec::with_capacity(HEADER_SIZE + data.len());
    frame.extend_from_slice(MAGIC);
    frame.extend_from_slice(&(HEADER_SIZE as u32).to_be_bytes());
    frame.extend_from_slice(&(data.len() as u32).to_be_bytes());
    frame.push(VERSION);
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(data);
    frame
}

/// Extract the ISCP message from a frame
///
/// Best effort: the text between the `"!1"` start sequence and the two
/// trailing bytes is returned without validation. Receivers usually end
/// messages with `EOF CR LF`, so the result may still carry a trailing
/// control character which the translator trims.
pub fn decode(frame: &[u8]) -> String {
    if frame.len() < PAYLOAD_OFFSET + TRAILER_LEN {
        return String::new();
    }

    String::from_utf8_lossy(&frame[PAYLOAD_OFFSET..frame.len() - TRAILER_LEN]).into_owned()
}

/// Read exactly one frame from a byte stream
///
/// TCP reads can split or merge frames, so the header is read first and the
/// payload length taken from it. Bytes that do not start with the magic are
/// skipped until the stream re-synchronizes. Returns `Ok(None)` on a clean
/// end of stream.
pub async fn read_frame<R>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];

    // Sync on the magic one byte at a time
    let mut matched = 0;
    while matched < MAGIC.len() {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && matched == 0 => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if byte == MAGIC[matched] {
            header[matched] = byte;
            matched += 1;
        } else if byte == MAGIC[0] {
            header[0] = byte;
            matched = 1;
        } else {
            matched = 0;
        }
    }

    reader.read_exact(&mut header[MAGIC.len()..]).await?;

    let parsed = FrameHeader::parse(&header).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "bad eISCP header")
    })?;

    let data_size = parsed.data_size as usize;
    if data_size > MAX_DATA_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("eISCP payload too large: {} bytes", data_size),
        ));
    }

    // Some firmware announces a longer header; skip the extra bytes
    let extra = (parsed.header_size as usize).saturating_sub(HEADER_SIZE);
    if extra > 0 {
        let mut skip = vec![0u8; extra];
        reader.read_exact(&mut skip).await?;
    }

    let mut frame = Vec::with_capacity(HEADER_SIZE + data_size);
    frame.extend_from_slice(&header);
    frame.resize(HEADER_SIZE + data_size, 0);
    reader.read_exact(&mut frame[HEADER_SIZE..]).await?;

    Ok(Some(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn encode_builds_header_and_payload() {
        let frame = encode("PWR01");

        assert_eq!(&frame[0..4], b"ISCP");
        assert_eq!(&frame[4..8], &16u32.to_be_bytes());
        assert_eq!(&frame[8..12], &9u32.to_be_bytes());
        assert_eq!(&frame[12..16], &[1, 0, 0, 0]);
        assert_eq!(&frame[16..], b"!1PWR01\r\n");
    }

    #[test]
    fn encode_keeps_existing_start_character() {
        let frame = encode("!xECNQSTN");
        assert_eq!(&frame[16..], b"!xECNQSTN\r\n");
        assert_eq!(FrameHeader::parse(&frame).unwrap().data_size, 11);
    }

    #[test]
    fn decode_strips_start_and_trailer() {
        assert_eq!(decode(&encode("MVL32")), "MVL32");
        assert_eq!(decode(&encode("NTM00:12/03:45")), "NTM00:12/03:45");
    }

    #[test]
    fn decode_short_frame_is_empty() {
        assert_eq!(decode(b"ISCP"), "");
        assert_eq!(decode(&[]), "");
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut frame = encode("PWR01");
        frame[0] = b'X';
        assert!(FrameHeader::parse(&frame).is_none());
    }

    #[tokio::test]
    async fn read_frame_reassembles_split_writes() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let first = encode("PWR01");
        let second = encode("MVL32");

        tokio::spawn(async move {
            client.write_all(&first[..7]).await.unwrap();
            client.write_all(&first[7..]).await.unwrap();
            client.write_all(&second).await.unwrap();
        });

        let a = read_frame(&mut server).await.unwrap().unwrap();
        let b = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(decode(&a), "PWR01");
        assert_eq!(decode(&b), "MVL32");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_frame_skips_garbage_before_magic() {
        let mut data = b"\x00\x1aIS".to_vec();
        data.extend_from_slice(&encode("AMT00"));
        let mut reader = &data[..];

        let frame = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(decode(&frame), "AMT00");
    }
}
