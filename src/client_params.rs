use std::net::Ipv4Addr;

use crate::error::{ConcentratorError, Result};

/// Fixed size of the space-padded ASCII payload that follows the leading
/// `0x00` control byte (spec's Open Question, resolved: 1024 bytes).
pub const PAYLOAD_LEN: usize = 1024;
/// Total wire size of an encoded control frame (leading byte + payload).
pub const FRAME_LEN: usize = 1 + PAYLOAD_LEN;

/// Immutable per-session record pushed to a peer once its tunnel is set up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientParams {
    pub mtu: u16,
    pub peer_ip: Ipv4Addr,
    pub dns_ip: Ipv4Addr,
    pub route_ip: Ipv4Addr,
    pub route_mask: u8,
}

impl ClientParams {
    /// Encodes as the control-frame payload: `0x00` followed by
    /// `m,<mtu> a,<peerip>,32 d,<dns> r,<route>,<rmask>` space-padded to
    /// `FRAME_LEN` bytes total. Never exceeds the peer's expected buffer.
    pub fn encode(&self) -> [u8; FRAME_LEN] {
        let body = format!(
            "m,{} a,{},32 d,{} r,{},{}",
            self.mtu, self.peer_ip, self.dns_ip, self.route_ip, self.route_mask
        );
        assert!(
            body.len() <= PAYLOAD_LEN,
            "encoded ClientParams exceeds fixed payload size"
        );

        let mut frame = [0u8; FRAME_LEN];
        frame[0] = 0x00;
        frame[1..1 + body.len()].copy_from_slice(body.as_bytes());
        for b in frame[1 + body.len()..].iter_mut() {
            *b = b' ';
        }
        frame
    }

    /// Parses a frame produced by `encode`. Accepts trailing space padding
    /// and tolerates a payload shorter than `FRAME_LEN` (only the leading
    /// `0x00` and the fields matter).
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.is_empty() || frame[0] != 0x00 {
            return Err(ConcentratorError::Config(
                "control frame must start with 0x00".into(),
            ));
        }
        let body = std::str::from_utf8(&frame[1..])
            .map_err(|_| ConcentratorError::Config("control frame is not valid ASCII".into()))?
            .trim_end_matches(' ');

        let mut mtu = None;
        let mut peer_ip = None;
        let mut dns_ip = None;
        let mut route_ip = None;
        let mut route_mask = None;

        for field in body.split(' ') {
            let field = field.trim();
            if field.is_empty() {
                continue;
            }
            let mut parts = field.split(',');
            let tag = parts.next().unwrap_or("");
            match tag {
                "m" => {
                    mtu = Some(
                        parts
                            .next()
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| ConcentratorError::Config("bad mtu field".into()))?,
                    );
                }
                "a" => {
                    peer_ip = Some(
                        parts
                            .next()
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| ConcentratorError::Config("bad address field".into()))?,
                    );
                    // ignore the trailing ",32" prefix length; it is always /32.
                }
                "d" => {
                    dns_ip = Some(
                        parts
                            .next()
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| ConcentratorError::Config("bad dns field".into()))?,
                    );
                }
                "r" => {
                    route_ip = Some(
                        parts
                            .next()
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| ConcentratorError::Config("bad route field".into()))?,
                    );
                    route_mask = Some(
                        parts
                            .next()
                            .and_then(|v| v.parse().ok())
                            .ok_or_else(|| ConcentratorError::Config("bad route mask".into()))?,
                    );
                }
                _ => {}
            }
        }

        Ok(ClientParams {
            mtu: mtu.ok_or_else(|| ConcentratorError::Config("missing mtu field".into()))?,
            peer_ip: peer_ip
                .ok_or_else(|| ConcentratorError::Config("missing address field".into()))?,
            dns_ip: dns_ip.ok_or_else(|| ConcentratorError::Config("missing dns field".into()))?,
            route_ip: route_ip
                .ok_or_else(|| ConcentratorError::Config("missing route field".into()))?,
            route_mask: route_mask
                .ok_or_else(|| ConcentratorError::Config("missing route mask".into()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClientParams {
        ClientParams {
            mtu: 1400,
            peer_ip: Ipv4Addr::new(10, 0, 0, 2),
            dns_ip: Ipv4Addr::new(8, 8, 8, 8),
            route_ip: Ipv4Addr::new(0, 0, 0, 0),
            route_mask: 0,
        }
    }

    #[test]
    fn round_trips() {
        let params = sample();
        let frame = params.encode();
        assert_eq!(frame.len(), FRAME_LEN);
        assert_eq!(frame[0], 0x00);
        let parsed = ClientParams::parse(&frame).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn trailing_bytes_are_spaces() {
        let frame = sample().encode();
        let body = format!(
            "m,{} a,{},32 d,{} r,{},{}",
            sample().mtu,
            sample().peer_ip,
            sample().dns_ip,
            sample().route_ip,
            sample().route_mask
        );
        assert!(frame[1 + body.len()..].iter().all(|&b| b == b' '));
    }

    #[test]
    fn rejects_non_control_frame() {
        let mut frame = sample().encode();
        frame[0] = 0x45;
        assert!(ClientParams::parse(&frame).is_err());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Control payload round-trip: encoding and parsing back yields the
        /// same fields; the first byte is 0; length equals FRAME_LEN;
        /// unused trailing bytes are spaces.
        #[test]
        fn round_trip(
            mtu in 0u16..=9000,
            peer_octets in any::<[u8; 4]>(),
            dns_octets in any::<[u8; 4]>(),
            route_octets in any::<[u8; 4]>(),
            route_mask in 0u8..=32,
        ) {
            let params = ClientParams {
                mtu,
                peer_ip: Ipv4Addr::from(peer_octets),
                dns_ip: Ipv4Addr::from(dns_octets),
                route_ip: Ipv4Addr::from(route_octets),
                route_mask,
            };
            let frame = params.encode();
            prop_assert_eq!(frame.len(), FRAME_LEN);
            prop_assert_eq!(frame[0], 0x00);
            let parsed = ClientParams::parse(&frame).unwrap();
            prop_assert_eq!(parsed, params);
        }
    }
}
