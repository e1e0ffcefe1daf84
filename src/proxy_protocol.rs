//! HAProxy PROXY protocol v1 (text) and v2 (binary), receive and send.
//!
//! The receive side consumes exactly the header bytes so the payload that
//! follows is untouched. Trusted upstreams are required to send concrete
//! TCP addresses: v1 `UNKNOWN` is rejected, v2 `LOCAL` keeps the raw peer
//! address.

use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// v2 signature: "\r\n\r\n\0\r\nQUIT\n"
const V2_SIGNATURE: [u8; 12] = [0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a];

/// A v1 line is at most 107 bytes including CRLF.
const V1_MAX_LEN: usize = 107;

#[derive(Error, Debug)]
pub enum ProxyProtoError {
    #[error("IO error reading PROXY header: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PROXY header: {0}")]
    Invalid(String),

    #[error("unsupported PROXY protocol version {0} (expected 1 or 2)")]
    UnsupportedVersion(u8),
}

/// Addresses carried by a received PROXY header.
///
/// `None` when the header was a v2 LOCAL command (health checks from the
/// proxy itself); the raw peer address should be kept in that case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub source: Option<SocketAddr>,
    pub dest: Option<SocketAddr>,
}

/// Encode a header for the configured version.
pub fn encode(version: u8, src: SocketAddr, dst: SocketAddr) -> Result<Vec<u8>, ProxyProtoError> {
    match version {
        1 => encode_v1(src, dst),
        2 => Ok(encode_v2(src, dst)),
        v => Err(ProxyProtoError::UnsupportedVersion(v)),
    }
}

/// Encode a v1 text header. Source and destination must share a family.
pub fn encode_v1(src: SocketAddr, dst: SocketAddr) -> Result<Vec<u8>, ProxyProtoError> {
    let proto = match (src.ip(), dst.ip()) {
        (IpAddr::V4(_), IpAddr::V4(_)) => "TCP4",
        (IpAddr::V6(_), IpAddr::V6(_)) => "TCP6",
        _ => {
            return Err(ProxyProtoError::Invalid(
                "mixed address families in v1 header".to_string(),
            ))
        }
    };
    Ok(format!(
        "PROXY {} {} {} {} {}\r\n",
        proto,
        src.ip(),
        dst.ip(),
        src.port(),
        dst.port()
    )
    .into_bytes())
}

/// Encode a v2 binary header. Mixed families encode as UNSPEC.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + 36);
    out.extend_from_slice(&V2_SIGNATURE);

    // ver=2 | cmd=PROXY
    out.push(0x21);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(sip), IpAddr::V4(dip)) => {
            // fam=INET | proto=STREAM
            out.push(0x11);
            out.extend_from_slice(&(12u16).to_be_bytes());
            out.extend_from_slice(&sip.octets());
            out.extend_from_slice(&dip.octets());
            out.extend_from_slice(&src.port().to_be_bytes());
            out.extend_from_slice(&dst.port().to_be_bytes());
        }
        (IpAddr::V6(sip), IpAddr::V6(dip)) => {
            // fam=INET6 | proto=STREAM
            out.push(0x21);
            out.extend_from_slice(&(36u16).to_be_bytes());
            out.extend_from_slice(&sip.octets());
            out.extend_from_slice(&dip.octets());
            out.extend_from_slice(&src.port().to_be_bytes());
            out.extend_from_slice(&dst.port().to_be_bytes());
        }
        _ => {
            out.push(0x00);
            out.extend_from_slice(&(0u16).to_be_bytes());
        }
    }

    out
}

/// Read and parse one PROXY header (v1 or v2) from the start of `stream`,
/// consuming exactly the header bytes.
pub async fn read_header<S>(stream: &mut S) -> Result<ProxyHeader, ProxyProtoError>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 12];
    stream.read_exact(&mut prefix).await?;

    if prefix == V2_SIGNATURE {
        return read_v2_rest(stream).await;
    }
    if &prefix[..6] == b"PROXY " {
        return read_v1_rest(stream, &prefix).await;
    }
    Err(ProxyProtoError::Invalid(
        "missing PROXY protocol signature".to_string(),
    ))
}

async fn read_v2_rest<S>(stream: &mut S) -> Result<ProxyHeader, ProxyProtoError>
where
    S: AsyncRead + Unpin,
{
    let mut meta = [0u8; 4];
    stream.read_exact(&mut meta).await?;

    let ver_cmd = meta[0];
    let fam_proto = meta[1];
    let len = u16::from_be_bytes([meta[2], meta[3]]) as usize;

    if ver_cmd >> 4 != 0x2 {
        return Err(ProxyProtoError::Invalid(format!(
            "bad v2 version nibble {:#x}",
            ver_cmd >> 4
        )));
    }

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    match ver_cmd & 0x0f {
        // LOCAL: connection from the proxy itself, keep the raw peer.
        0x0 => Ok(ProxyHeader {
            source: None,
            dest: None,
        }),
        0x1 => parse_v2_addresses(fam_proto, &body),
        cmd => Err(ProxyProtoError::Invalid(format!("bad v2 command {:#x}", cmd))),
    }
}

fn parse_v2_addresses(fam_proto: u8, body: &[u8]) -> Result<ProxyHeader, ProxyProtoError> {
    match fam_proto {
        // INET + STREAM
        0x11 => {
            if body.len() < 12 {
                return Err(ProxyProtoError::Invalid(
                    "v2 INET address block too short".to_string(),
                ));
            }
            let src_ip = IpAddr::from([body[0], body[1], body[2], body[3]]);
            let dst_ip = IpAddr::from([body[4], body[5], body[6], body[7]]);
            let src_port = u16::from_be_bytes([body[8], body[9]]);
            let dst_port = u16::from_be_bytes([body[10], body[11]]);
            Ok(ProxyHeader {
                source: Some(SocketAddr::new(src_ip, src_port)),
                dest: Some(SocketAddr::new(dst_ip, dst_port)),
            })
        }
        // INET6 + STREAM
        0x21 => {
            if body.len() < 36 {
                return Err(ProxyProtoError::Invalid(
                    "v2 INET6 address block too short".to_string(),
                ));
            }
            let mut src_octets = [0u8; 16];
            let mut dst_octets = [0u8; 16];
            src_octets.copy_from_slice(&body[0..16]);
            dst_octets.copy_from_slice(&body[16..32]);
            let src_port = u16::from_be_bytes([body[32], body[33]]);
            let dst_port = u16::from_be_bytes([body[34], body[35]]);
            Ok(ProxyHeader {
                source: Some(SocketAddr::new(IpAddr::from(src_octets), src_port)),
                dest: Some(SocketAddr::new(IpAddr::from(dst_octets), dst_port)),
            })
        }
        other => Err(ProxyProtoError::Invalid(format!(
            "unsupported v2 family/protocol {:#x}",
            other
        ))),
    }
}

async fn read_v1_rest<S>(stream: &mut S, prefix: &[u8; 12]) -> Result<ProxyHeader, ProxyProtoError>
where
    S: AsyncRead + Unpin,
{
    let mut line = prefix.to_vec();
    while !line.ends_with(b"\r\n") {
        if line.len() >= V1_MAX_LEN {
            return Err(ProxyProtoError::Invalid(
                "v1 header exceeds maximum length".to_string(),
            ));
        }
        line.push(stream.read_u8().await?);
    }

    let text = std::str::from_utf8(&line)
        .map_err(|_| ProxyProtoError::Invalid("v1 header is not ASCII".to_string()))?;
    let parts: Vec<&str> = text.trim_end().split(' ').collect();

    if parts.len() == 2 && parts[1] == "UNKNOWN" {
        // Trusted upstreams must send concrete addresses.
        return Err(ProxyProtoError::Invalid(
            "v1 UNKNOWN protocol not accepted".to_string(),
        ));
    }
    if parts.len() != 6 {
        return Err(ProxyProtoError::Invalid(format!(
            "v1 header has {} fields, expected 6",
            parts.len()
        )));
    }

    let expect_v4 = match parts[1] {
        "TCP4" => true,
        "TCP6" => false,
        "UNKNOWN" => {
            return Err(ProxyProtoError::Invalid(
                "v1 UNKNOWN protocol not accepted".to_string(),
            ))
        }
        other => {
            return Err(ProxyProtoError::Invalid(format!(
                "bad v1 protocol {:?}",
                other
            )))
        }
    };

    let src_ip: IpAddr = parts[2]
        .parse()
        .map_err(|_| ProxyProtoError::Invalid(format!("bad v1 source IP {:?}", parts[2])))?;
    let dst_ip: IpAddr = parts[3]
        .parse()
        .map_err(|_| ProxyProtoError::Invalid(format!("bad v1 dest IP {:?}", parts[3])))?;
    if src_ip.is_ipv4() != expect_v4 || dst_ip.is_ipv4() != expect_v4 {
        return Err(ProxyProtoError::Invalid(
            "v1 address family does not match protocol".to_string(),
        ));
    }
    let src_port: u16 = parts[4]
        .parse()
        .map_err(|_| ProxyProtoError::Invalid(format!("bad v1 source port {:?}", parts[4])))?;
    let dst_port: u16 = parts[5]
        .parse()
        .map_err(|_| ProxyProtoError::Invalid(format!("bad v1 dest port {:?}", parts[5])))?;

    Ok(ProxyHeader {
        source: Some(SocketAddr::new(src_ip, src_port)),
        dest: Some(SocketAddr::new(dst_ip, dst_port)),
    })
}
