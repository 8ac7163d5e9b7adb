use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frames larger than this are rejected before the payload is read. The
/// vanilla handshake is under 300 bytes; modded clients (Forge mod lists
/// appended to the server address) can be much larger, but never this large.
pub const MAX_FRAME_LEN: usize = 1 << 21;

/// The handshake's server-address string is nominally capped at 255 bytes,
/// but Forge appends mod data to it, so we tolerate a lot more.
pub const MAX_SERVER_ADDRESS_LEN: usize = 4096;

/// Player names are at most 16 bytes on every protocol version we route.
pub const MAX_PLAYER_NAME_LEN: usize = 16;

/// First byte of a pre-1.7 server list ping. Legacy pings are not VarInt
/// framed, so this must be checked before frame decoding starts.
pub const LEGACY_PING_BYTE: u8 = 0xFE;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed varint")]
    MalformedVarInt,
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(usize),
    #[error("stream ended mid-frame")]
    Truncated,
    #[error("unexpected packet id {0}")]
    BadPacketId(i32),
    #[error("unsupported next state {0}")]
    UnsupportedNextState(i32),
    #[error("malformed string field")]
    MalformedString,
}

fn map_read_err(err: std::io::Error) -> DecodeError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DecodeError::Truncated
    } else {
        DecodeError::Io(err)
    }
}

/// One length-prefixed packet, kept verbatim so it can be replayed to the
/// backend byte-for-byte.
#[derive(Debug, Clone)]
pub struct Frame {
    raw: Vec<u8>,
    payload_off: usize,
}

impl Frame {
    /// Length prefix plus payload, exactly as read off the wire.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[self.payload_off..]
    }

    pub fn into_raw(self) -> Vec<u8> {
        self.raw
    }
}

/// Read one frame: a VarInt length followed by that many payload bytes.
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Frame, DecodeError> {
    read_frame_after(stream, None).await
}

/// Same as [`read_frame`], but with the first byte of the length prefix
/// already consumed by the caller (legacy-ping detection peeks it).
pub async fn read_frame_after<R: AsyncRead + Unpin>(
    stream: &mut R,
    first: Option<u8>,
) -> Result<Frame, DecodeError> {
    let mut raw: Vec<u8> = Vec::with_capacity(8);
    let mut len: u32 = 0;
    let mut shift = 0u32;
    let mut pending = first;
    loop {
        let b = match pending.take() {
            Some(b) => b,
            None => stream.read_u8().await.map_err(map_read_err)?,
        };
        raw.push(b);
        len |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= 35 {
            return Err(DecodeError::MalformedVarInt);
        }
    }

    let len = len as usize;
    if len >= MAX_FRAME_LEN {
        return Err(DecodeError::FrameTooLarge(len));
    }

    let payload_off = raw.len();
    raw.resize(payload_off + len, 0);
    stream
        .read_exact(&mut raw[payload_off..])
        .await
        .map_err(map_read_err)?;

    Ok(Frame { raw, payload_off })
}

/// Decode a VarInt from `buf` starting at `idx`. Returns the value and the
/// index just past it. At most 5 bytes; a 6th continuation bit is malformed.
pub fn read_varint(buf: &[u8], mut idx: usize) -> Result<(i32, usize), DecodeError> {
    let mut value: u32 = 0;
    let mut shift = 0u32;
    loop {
        let b = *buf.get(idx).ok_or(DecodeError::Truncated)?;
        idx += 1;
        value |= u32::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok((value as i32, idx));
        }
        shift += 7;
        if shift >= 35 {
            return Err(DecodeError::MalformedVarInt);
        }
    }
}

/// Decode a VarInt-length-prefixed UTF-8 string, bounded by `max_len` bytes.
pub fn read_string(buf: &[u8], idx: usize, max_len: usize) -> Result<(&str, usize), DecodeError> {
    let (len, idx) = read_varint(buf, idx)?;
    if len < 0 || len as usize > max_len {
        return Err(DecodeError::MalformedString);
    }
    let len = len as usize;
    let end = idx.checked_add(len).ok_or(DecodeError::MalformedString)?;
    if end > buf.len() {
        return Err(DecodeError::Truncated);
    }
    let s = std::str::from_utf8(&buf[idx..end]).map_err(|_| DecodeError::MalformedString)?;
    Ok((s, end))
}

pub fn write_varint(out: &mut Vec<u8>, value: i32) {
    let mut v = value as u32;
    loop {
        let mut b = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            b |= 0x80;
        }
        out.push(b);
        if v == 0 {
            break;
        }
    }
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_varint(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

/// Prefix `payload` with its VarInt length, producing a complete frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 5);
    write_varint(&mut out, payload.len() as i32);
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    Transfer,
}

impl NextState {
    fn from_i32(v: i32) -> Result<Self, DecodeError> {
        match v {
            1 => Ok(NextState::Status),
            2 => Ok(NextState::Login),
            3 => Ok(NextState::Transfer),
            other => Err(DecodeError::UnsupportedNextState(other)),
        }
    }

    /// Login and transfer intents are both followed by a LoginStart frame.
    pub fn expects_login_start(self) -> bool {
        matches!(self, NextState::Login | NextState::Transfer)
    }
}

#[derive(Debug, Clone)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

/// Parse the handshake packet payload (first frame in protocol state 0).
///
/// Layout: packet id VarInt (must be 0), protocol version VarInt, server
/// address string, server port u16be, next state VarInt. Trailing bytes are
/// tolerated.
pub fn parse_handshake(payload: &[u8]) -> Result<Handshake, DecodeError> {
    let (packet_id, idx) = read_varint(payload, 0)?;
    if packet_id != 0 {
        return Err(DecodeError::BadPacketId(packet_id));
    }
    let (protocol_version, idx) = read_varint(payload, idx)?;
    let (addr, idx) = read_string(payload, idx, MAX_SERVER_ADDRESS_LEN)?;
    let server_address = addr.to_string();
    if idx + 2 > payload.len() {
        return Err(DecodeError::Truncated);
    }
    let server_port = u16::from_be_bytes([payload[idx], payload[idx + 1]]);
    let (next_state, _) = read_varint(payload, idx + 2)?;

    Ok(Handshake {
        protocol_version,
        server_address,
        server_port,
        next_state: NextState::from_i32(next_state)?,
    })
}

/// Parse just the player name out of a LoginStart payload. Optional trailing
/// fields (UUID, signature data; they vary across 1.18.2/1.19.x/1.20.2+) are
/// ignored; the frame itself is relayed untouched.
pub fn parse_login_start(payload: &[u8]) -> Result<String, DecodeError> {
    let (packet_id, idx) = read_varint(payload, 0)?;
    if packet_id != 0 {
        return Err(DecodeError::BadPacketId(packet_id));
    }
    let (name, _) = read_string(payload, idx, MAX_PLAYER_NAME_LEN)?;
    Ok(name.to_string())
}

/// What the sniffer learned from the first frame(s) of a client connection.
#[derive(Debug)]
pub enum Sniff {
    /// Pre-1.7 server list ping. Not framed; the connection is closed
    /// without routing.
    LegacyPing,
    Handshake {
        handshake: Handshake,
        /// Player name from LoginStart, when the intent is login/transfer.
        player: Option<String>,
        /// Every byte consumed from the client, verbatim, for replay.
        raw: Vec<u8>,
    },
}

/// Read exactly the handshake frame (plus the LoginStart frame when the
/// intent is login or transfer) and nothing past it. Bytes the backend
/// still needs are returned in `raw`, never dropped.
pub async fn sniff<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Sniff, DecodeError> {
    let first = stream.read_u8().await.map_err(map_read_err)?;
    if first == LEGACY_PING_BYTE {
        return Ok(Sniff::LegacyPing);
    }

    let frame = read_frame_after(stream, Some(first)).await?;
    let handshake = parse_handshake(frame.payload())?;
    let mut raw = frame.into_raw();

    let mut player = None;
    if handshake.next_state.expects_login_start() {
        let login = read_frame(stream).await?;
        player = Some(parse_login_start(login.payload())?);
        raw.extend_from_slice(login.raw());
    }

    Ok(Sniff::Handshake {
        handshake,
        player,
        raw,
    })
}

/// Clientbound login-state disconnect carrying a JSON chat component.
/// Written to a client rejected by the player filter, just before close.
pub fn disconnect_packet(reason: &str) -> Vec<u8> {
    let json = serde_json::json!({ "text": reason }).to_string();
    let mut payload = Vec::with_capacity(json.len() + 8);
    write_varint(&mut payload, 0);
    write_string(&mut payload, &json);
    encode_frame(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn build_handshake(host: &str, port: u16, proto_ver: i32, next_state: i32) -> Vec<u8> {
        let mut inner = Vec::new();
        write_varint(&mut inner, 0);
        write_varint(&mut inner, proto_ver);
        write_string(&mut inner, host);
        inner.extend(port.to_be_bytes());
        write_varint(&mut inner, next_state);
        encode_frame(&inner)
    }

    pub(crate) fn build_login_start(name: &str) -> Vec<u8> {
        let mut inner = Vec::new();
        write_varint(&mut inner, 0);
        write_string(&mut inner, name);
        // 1.19.x-era trailing bytes the decoder must skip.
        inner.extend_from_slice(&[0x00]);
        encode_frame(&inner)
    }

    #[test]
    fn varint_roundtrip() {
        for v in [
            0i32,
            1,
            127,
            128,
            300,
            16383,
            16384,
            2097151,
            2097152,
            (1 << 28) - 1,
            1 << 28,
            i32::MAX,
        ] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert!(buf.len() <= 5);
            let (decoded, idx) = read_varint(&buf, 0).expect("decode");
            assert_eq!(decoded, v, "value {v}");
            assert_eq!(idx, buf.len());
        }
    }

    #[test]
    fn varint_rejects_six_continuations() {
        let buf = [0x80, 0x80, 0x80, 0x80, 0x80, 0x01];
        assert!(matches!(
            read_varint(&buf, 0),
            Err(DecodeError::MalformedVarInt)
        ));
    }

    #[test]
    fn string_roundtrip() {
        let s = "x".repeat(32 * 1024);
        let mut buf = Vec::new();
        write_string(&mut buf, &s);
        let (decoded, idx) = read_string(&buf, 0, 32 * 1024).expect("decode");
        assert_eq!(decoded, s);
        assert_eq!(idx, buf.len());
    }

    #[tokio::test]
    async fn frame_limit_enforced() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, MAX_FRAME_LEN as i32);
        let mut cursor = bytes.as_slice();
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(DecodeError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn sniff_status_reads_one_frame() {
        let data = build_handshake("Play.Example.Com", 25565, 763, 1);
        let mut stream = data.as_slice();
        let sniff = sniff(&mut stream).await.expect("sniff");
        match sniff {
            Sniff::Handshake {
                handshake,
                player,
                raw,
            } => {
                assert_eq!(handshake.server_address, "Play.Example.Com");
                assert_eq!(handshake.server_port, 25565);
                assert_eq!(handshake.protocol_version, 763);
                assert_eq!(handshake.next_state, NextState::Status);
                assert!(player.is_none());
                assert_eq!(raw, data);
            }
            other => panic!("unexpected sniff {other:?}"),
        }
        // Nothing consumed past the handshake frame.
        assert!(stream.is_empty());
    }

    #[tokio::test]
    async fn sniff_login_captures_both_frames() {
        let mut data = build_handshake("mc.example.com", 25565, 763, 2);
        data.extend(build_login_start("Alice"));
        data.extend_from_slice(b"post-login bytes for the backend");

        let mut stream = data.as_slice();
        let sniff = sniff(&mut stream).await.expect("sniff");
        match sniff {
            Sniff::Handshake { player, raw, .. } => {
                assert_eq!(player.as_deref(), Some("Alice"));
                assert_eq!(&data[..raw.len()], raw.as_slice());
                assert_eq!(stream, b"post-login bytes for the backend");
            }
            other => panic!("unexpected sniff {other:?}"),
        }
    }

    #[tokio::test]
    async fn sniff_detects_legacy_ping() {
        let data = [LEGACY_PING_BYTE, 0x01];
        let mut stream = data.as_slice();
        assert!(matches!(
            sniff(&mut stream).await.expect("sniff"),
            Sniff::LegacyPing
        ));
    }

    #[tokio::test]
    async fn sniff_truncated_input() {
        let data = build_handshake("mc.example.com", 25565, 763, 1);
        for cut in [1usize, 3, data.len() - 1] {
            let mut stream = &data[..cut];
            assert!(matches!(
                sniff(&mut stream).await,
                Err(DecodeError::Truncated)
            ));
        }
    }

    #[test]
    fn handshake_rejects_wrong_packet_id() {
        let mut inner = Vec::new();
        write_varint(&mut inner, 7);
        assert!(matches!(
            parse_handshake(&inner),
            Err(DecodeError::BadPacketId(7))
        ));
    }

    #[test]
    fn handshake_rejects_unknown_next_state() {
        let data = build_handshake("mc.example.com", 25565, 763, 9);
        let frame_payload = &data[1..]; // single-byte length prefix
        assert!(matches!(
            parse_handshake(frame_payload),
            Err(DecodeError::UnsupportedNextState(9))
        ));
    }

    #[test]
    fn login_start_name_bound() {
        let mut inner = Vec::new();
        write_varint(&mut inner, 0);
        write_string(&mut inner, "ThisNameIsWayTooLongToBeValid");
        assert!(matches!(
            parse_login_start(&inner),
            Err(DecodeError::MalformedString)
        ));
    }

    #[test]
    fn disconnect_packet_is_framed_json() {
        let pkt = disconnect_packet("not allowed");
        let (len, idx) = read_varint(&pkt, 0).expect("length");
        assert_eq!(len as usize, pkt.len() - idx);
        let (id, idx) = read_varint(&pkt, idx).expect("packet id");
        assert_eq!(id, 0);
        let (reason, _) = read_string(&pkt, idx, 1024).expect("reason");
        assert_eq!(reason, r#"{"text":"not allowed"}"#);
    }
}
