//! PostgreSQL startup-phase wire protocol.
//!
//! Handles:
//! - Framing of untagged initial packets (SSLRequest, StartupMessage)
//! - Framing of tagged backend packets (used for ErrorResponse)
//! - Decoding/encoding of the handshake messages the proxy needs to see

use std::borrow::Cow;
use std::collections::BTreeMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ProxyError, ProxyResult};

/// Protocol version 3.0 (0x00030000).
pub const PROTOCOL_VERSION_3_0: u32 = 196_608;

/// SSLRequest code.
pub const SSL_REQUEST_CODE: u32 = 80_877_103;

/// Major version reserved for request codes (SSL, GSSENC, cancel).
const REQUEST_CODE_MAJOR: u16 = 1234;

/// Largest initial packet accepted from a client, matching the server's own cap.
pub const MAX_STARTUP_PACKET_LENGTH: u32 = 10_000;

/// Reply to an SSLRequest: TLS is not available.
pub const SSL_REFUSED: u8 = b'N';

/// ErrorResponse message tag.
pub const ERROR_RESPONSE_TAG: u8 = b'E';

/// Routine tag placed in every ErrorResponse the proxy emits.
pub const ROUTINE_TAG: &str = "pg-ssh-proxy";

/// Body of one initial packet, without its length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInitialPacket(Vec<u8>);

impl RawInitialPacket {
    pub fn new(body: Vec<u8>) -> Self {
        Self(body)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode into one of the handshake messages.
    pub fn decode(&self) -> ProxyResult<InitialPacket> {
        let mut reader = Reader::new(&self.0);
        let tag = reader.read_u32()?;

        if tag == SSL_REQUEST_CODE {
            return Ok(InitialPacket::SslRequest);
        }

        let version = ProtocolVersion::from_tag(tag);
        if version.major == 0 || version.major == REQUEST_CODE_MAJOR {
            return Err(ProxyError::UnknownPacketType(tag));
        }

        let mut params = BTreeMap::new();
        loop {
            let key = reader.read_bytes()?;
            if key.is_empty() {
                break;
            }
            let value = reader.read_bytes()?;
            params.insert(key, value);
        }

        Ok(InitialPacket::Startup(StartupMessage { version, params }))
    }
}

/// Decoded initial packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialPacket {
    Startup(StartupMessage),
    SslRequest,
}

impl InitialPacket {
    pub fn encode(&self) -> RawInitialPacket {
        match self {
            InitialPacket::Startup(startup) => startup.encode(),
            InitialPacket::SslRequest => RawInitialPacket(SSL_REQUEST_CODE.to_be_bytes().to_vec()),
        }
    }
}

/// Protocol version carried in the leading tag of a StartupMessage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    pub const V3_0: ProtocolVersion = ProtocolVersion { major: 3, minor: 0 };

    pub fn from_tag(tag: u32) -> Self {
        Self {
            major: (tag >> 16) as u16,
            minor: (tag & 0xFFFF) as u16,
        }
    }

    pub fn tag(self) -> u32 {
        (u32::from(self.major) << 16) | u32::from(self.minor)
    }
}

/// StartupMessage parameters, kept sorted so encoding is reproducible.
///
/// Keys and values are raw bytes: clients may send them in any encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupMessage {
    version: ProtocolVersion,
    params: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl StartupMessage {
    /// A protocol 3.0 startup message with the given parameters.
    pub fn new<K, V>(params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<Vec<u8>>,
        V: Into<Vec<u8>>,
    {
        Self {
            version: ProtocolVersion::V3_0,
            params: params
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn with_version(mut self, version: ProtocolVersion) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn params(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.params.get(key.as_bytes()).map(Vec::as_slice)
    }

    /// `database` parameter as text, lossily decoded.
    pub fn database(&self) -> Option<Cow<'_, str>> {
        self.get("database").map(String::from_utf8_lossy)
    }

    /// `user` parameter as text, lossily decoded.
    pub fn user(&self) -> Option<Cow<'_, str>> {
        self.get("user").map(String::from_utf8_lossy)
    }

    pub fn set_database(&mut self, name: impl Into<Vec<u8>>) {
        self.params.insert(b"database".to_vec(), name.into());
    }

    pub fn encode(&self) -> RawInitialPacket {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&self.version.tag().to_be_bytes());
        for (key, value) in &self.params {
            put_bytes(&mut buf, key);
            put_bytes(&mut buf, value);
        }
        buf.push(0);
        RawInitialPacket(buf)
    }
}

/// Tagged backend packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPacket {
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// ErrorResponse fields in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    fields: Vec<(u8, String)>,
}

impl ErrorResponse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, code: u8, value: impl Into<String>) -> Self {
        self.fields.push((code, value.into()));
        self
    }

    /// The ErrorResponse sent to a client whose session failed.
    pub fn from_error(err: &ProxyError) -> Self {
        Self::new()
            .field(b'S', "ERROR")
            .field(b'C', err.sqlstate())
            .field(b'M', err.to_string())
            .field(b'R', ROUTINE_TAG)
    }

    pub fn fields(&self) -> &[(u8, String)] {
        &self.fields
    }

    pub fn get(&self, code: u8) -> Option<&str> {
        self.fields
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self) -> RawPacket {
        let mut payload = Vec::new();
        for (code, value) in &self.fields {
            payload.push(*code);
            put_cstr(&mut payload, value);
        }
        payload.push(0);
        RawPacket {
            tag: ERROR_RESPONSE_TAG,
            payload,
        }
    }

    pub fn decode(packet: &RawPacket) -> ProxyResult<Self> {
        if packet.tag != ERROR_RESPONSE_TAG {
            return Err(ProxyError::UnknownPacketType(u32::from(packet.tag)));
        }

        let mut reader = Reader::new(&packet.payload);
        let mut fields = Vec::new();
        loop {
            let code = reader.read_u8()?;
            if code == 0 {
                return Ok(Self { fields });
            }
            fields.push((code, reader.read_cstr()?));
        }
    }
}

/// Read one initial packet.
///
/// Returns `Ok(None)` when the peer closed the stream before sending any byte
/// of a new frame.
pub async fn read_initial_packet<R>(r: &mut R) -> ProxyResult<Option<RawInitialPacket>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        let n = r.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProxyError::UnexpectedEndOfStream);
        }
        filled += n;
    }

    let len = u32::from_be_bytes(header);
    if len < 4 {
        return Err(ProxyError::MalformedPacket(format!(
            "declared length {} is shorter than its own header",
            len
        )));
    }
    if len > MAX_STARTUP_PACKET_LENGTH {
        return Err(ProxyError::MalformedPacket(format!(
            "declared length {} exceeds {}",
            len, MAX_STARTUP_PACKET_LENGTH
        )));
    }

    let mut body = vec![0u8; (len - 4) as usize];
    r.read_exact(&mut body).await.map_err(ProxyError::from_read)?;
    Ok(Some(RawInitialPacket(body)))
}

/// Write one initial packet with its length prefix.
pub async fn write_initial_packet<W>(w: &mut W, packet: &RawInitialPacket) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let body = packet.as_bytes();
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&frame_len(body.len())?.to_be_bytes());
    frame.extend_from_slice(body);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one tagged packet.
pub async fn read_generic_packet<R>(r: &mut R) -> ProxyResult<RawPacket>
where
    R: AsyncRead + Unpin,
{
    let tag = r.read_u8().await.map_err(ProxyError::from_read)?;
    let len = r.read_u32().await.map_err(ProxyError::from_read)?;
    if len < 4 {
        return Err(ProxyError::MalformedPacket(format!(
            "declared length {} is shorter than its own header",
            len
        )));
    }

    let mut payload = vec![0u8; (len - 4) as usize];
    r.read_exact(&mut payload)
        .await
        .map_err(ProxyError::from_read)?;
    Ok(RawPacket { tag, payload })
}

/// Write one tagged packet.
pub async fn write_generic_packet<W>(w: &mut W, packet: &RawPacket) -> ProxyResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(packet.payload.len() + 5);
    frame.push(packet.tag);
    frame.extend_from_slice(&frame_len(packet.payload.len())?.to_be_bytes());
    frame.extend_from_slice(&packet.payload);
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

fn frame_len(body_len: usize) -> ProxyResult<u32> {
    u32::try_from(body_len)
        .ok()
        .and_then(|n| n.checked_add(4))
        .ok_or_else(|| ProxyError::MalformedPacket(format!("body of {} bytes is too large", body_len)))
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(bytes);
    buf.push(0);
}

/// Cursor over an in-memory packet body.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_u8(&mut self) -> ProxyResult<u8> {
        let (&b, rest) = self
            .buf
            .split_first()
            .ok_or(ProxyError::UnexpectedEndOfStream)?;
        self.buf = rest;
        Ok(b)
    }

    fn read_u32(&mut self) -> ProxyResult<u32> {
        if self.buf.len() < 4 {
            return Err(ProxyError::UnexpectedEndOfStream);
        }
        let (head, rest) = self.buf.split_at(4);
        self.buf = rest;
        Ok(u32::from_be_bytes([head[0], head[1], head[2], head[3]]))
    }

    /// Null-terminated string, without its terminator.
    fn read_bytes(&mut self) -> ProxyResult<Vec<u8>> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(ProxyError::UnexpectedEndOfStream)?;
        let bytes = self.buf[..end].to_vec();
        self.buf = &self.buf[end + 1..];
        Ok(bytes)
    }

    fn read_cstr(&mut self) -> ProxyResult<String> {
        String::from_utf8(self.read_bytes()?)
            .map_err(|e| ProxyError::MalformedPacket(format!("invalid utf-8 in string: {}", e)))
    }
}
