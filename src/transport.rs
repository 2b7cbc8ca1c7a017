//! Text messages to the downstream synthesis engine.
//!
//! One space-delimited line per datagram, best effort: no acknowledgement,
//! ordering or retry.

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs, UdpSocket},
};

use crate::config::TransportConfig;
use crate::frame::HandSample;

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Gesture(String),
    PalmPosition([f64; 3]),
    PalmOrientation { yaw: f64, pitch: f64, roll: f64 },
    NumFingers(usize),
}

impl OutboundMessage {
    pub fn gesture(label: impl Into<String>) -> Self {
        Self::Gesture(label.into())
    }

    /// Position, orientation and finger count of one hand, in send order.
    pub fn hand_state(hand: &HandSample) -> [Self; 3] {
        [
            Self::PalmPosition(hand.palm_position),
            Self::PalmOrientation {
                yaw: hand.yaw(),
                pitch: hand.pitch(),
                roll: hand.roll(),
            },
            Self::NumFingers(hand.finger_count),
        ]
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gesture(label) => write!(f, "Gesture {label}"),
            Self::PalmPosition([x, y, z]) => write!(f, "Palm_Position {x} {y} {z}"),
            Self::PalmOrientation { yaw, pitch, roll } => {
                write!(f, "Palm_Orientation {yaw} {pitch} {roll}")
            }
            Self::NumFingers(n) => write!(f, "Num_Fingers {n}"),
        }
    }
}

pub trait MessageSink {
    fn send(&mut self, msg: &OutboundMessage) -> Result<()>;
}

/// Discards everything; used when the transport is disabled.
#[derive(Debug, Default)]
pub struct NoopSink;

impl MessageSink for NoopSink {
    fn send(&mut self, _msg: &OutboundMessage) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct UdpSink {
    socket: UdpSocket,
    target: SocketAddr,
}

impl UdpSink {
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let target = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {host}:{port}"))?
            .next()
            .ok_or_else(|| anyhow!("{host}:{port} resolved to no address"))?;
        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).context("failed to bind UDP socket")?;
        Ok(Self { socket, target })
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl MessageSink for UdpSink {
    fn send(&mut self, msg: &OutboundMessage) -> Result<()> {
        let line = msg.to_string();
        let sent = self
            .socket
            .send_to(line.as_bytes(), self.target)
            .with_context(|| format!("send '{line}' to {}", self.target))?;
        if sent != line.len() {
            return Err(anyhow!("short datagram: {sent} of {} bytes", line.len()));
        }
        Ok(())
    }
}

/// UDP sink per the config, or a no-op sink when disabled or unreachable.
pub fn sink_from_config(cfg: &TransportConfig) -> Box<dyn MessageSink> {
    if !cfg.enabled {
        info!("transport disabled; messages are discarded");
        return Box::new(NoopSink);
    }
    match UdpSink::connect(&cfg.host, cfg.port) {
        Ok(sink) => {
            info!("sending messages to udp://{}", sink.target());
            Box::new(sink)
        }
        Err(e) => {
            warn!("transport unavailable ({e:#}); running in NO-OP mode");
            Box::new(NoopSink)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_wire_format() {
        assert_eq!(OutboundMessage::gesture("Swipe").to_string(), "Gesture Swipe");
        assert_eq!(
            OutboundMessage::PalmPosition([1.5, -2.0, 3.0]).to_string(),
            "Palm_Position 1.5 -2 3"
        );
        assert_eq!(
            OutboundMessage::PalmOrientation {
                yaw: 0.25,
                pitch: 0.0,
                roll: -0.5
            }
            .to_string(),
            "Palm_Orientation 0.25 0 -0.5"
        );
        assert_eq!(OutboundMessage::NumFingers(4).to_string(), "Num_Fingers 4");
    }

    #[test]
    fn test_hand_state_order() {
        let hand = HandSample {
            palm_position: [1.0, 2.0, 3.0],
            palm_normal: [0.0, -1.0, 0.0],
            direction: [0.0, 0.0, -1.0],
            finger_count: 3,
        };
        let msgs = OutboundMessage::hand_state(&hand);
        assert_eq!(msgs[0], OutboundMessage::PalmPosition([1.0, 2.0, 3.0]));
        assert!(matches!(msgs[1], OutboundMessage::PalmOrientation { .. }));
        assert_eq!(msgs[2], OutboundMessage::NumFingers(3));
    }

    #[test]
    fn test_udp_sink_delivers_lines() {
        let rx = UdpSocket::bind("127.0.0.1:0").unwrap();
        rx.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let port = rx.local_addr().unwrap().port();

        let mut sink = UdpSink::connect("127.0.0.1", port).unwrap();
        sink.send(&OutboundMessage::gesture("Start")).unwrap();
        let mut buf = [0u8; 128];
        let n = rx.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Gesture Start");
    }
}
