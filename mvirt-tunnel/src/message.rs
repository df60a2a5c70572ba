//! Service messages exchanged between tunnel endpoints.
//!
//! IPv4 payloads start with 0x4_ and IPv6 payloads with 0x6_, so anything
//! else arriving on a transport is a service message. No service message may
//! ever start with either nibble.

/// Liveness check sent by a client right after dialing.
pub const HELLO: [u8; 2] = [0x01, 0x00];

/// Answer to [`HELLO`].
pub const HELLO_ACK: [u8; 2] = [0x01, 0x01];

/// Does this buffer carry IP payload (as opposed to a service message)?
pub fn is_ip_payload(buf: &[u8]) -> bool {
    matches!(buf.first().map(|b| b >> 4), Some(0x4 | 0x6))
}

/// A non-IP buffer received from a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMessage {
    Hello,
    HelloAck,
    Unknown,
}

impl ServiceMessage {
    pub fn classify(buf: &[u8]) -> Self {
        if buf == HELLO {
            ServiceMessage::Hello
        } else if buf == HELLO_ACK {
            ServiceMessage::HelloAck
        } else {
            ServiceMessage::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_messages_are_not_ip() {
        assert!(!is_ip_payload(&HELLO));
        assert!(!is_ip_payload(&HELLO_ACK));
        assert!(!is_ip_payload(&[]));
        assert!(is_ip_payload(&[0x45, 0x00]));
        assert!(is_ip_payload(&[0x60]));
    }

    #[test]
    fn test_classify() {
        assert_eq!(ServiceMessage::classify(&HELLO), ServiceMessage::Hello);
        assert_eq!(ServiceMessage::classify(&HELLO_ACK), ServiceMessage::HelloAck);
        assert_eq!(ServiceMessage::classify(&[0x01]), ServiceMessage::Unknown);
        assert_eq!(
            ServiceMessage::classify(&[0x01, 0x00, 0x00]),
            ServiceMessage::Unknown
        );
    }
}
