use std::net::{IpAddr, SocketAddr};

use bencoder::bencode::{Bencode, BencodeError};

/// `TrackerResponse` struct containing a tracker's announce response.
///
/// To create a new `TrackerResponse` use the method builder `from_bytes()`.
#[derive(Debug, PartialEq)]
pub struct TrackerResponse {
    /// Set when the tracker refused the announce; all other fields are
    /// meaningless then.
    pub failure_reason: Option<String>,
    /// Seconds until the next periodic announce.
    pub interval: i64,
    pub complete: i64,
    pub incomplete: i64,
    pub peers: Vec<SocketAddr>,
}

/// Posible `TrackerResponse` errors.
#[derive(Debug, PartialEq)]
pub enum FromTrackerResponseError {
    DecodeResponseError(BencodeError),
    InvalidFailureReason,
    InvalidInterval,
    InvalidComplete,
    InvalidIncomplete,
    InvalidPeerEntry,
    InvalidCompactPeers,
    NotADict,
    InvalidPeers,
}

impl TrackerResponse {
    /// Builds a new `TrackerResponse` decoding a bencoded byte buffer
    /// containing the tracker's response.
    ///
    /// The `peers` key comes in two shapes: a list of `{peer id, ip, port}`
    /// dicts, or a compact byte string packing each peer into 6 bytes
    /// (big-endian IPv4, big-endian port).
    pub fn from_bytes(response: &[u8]) -> Result<TrackerResponse, FromTrackerResponseError> {
        let mut failure_reason = None;
        let mut interval = 0;
        let mut complete = 0;
        let mut incomplete = 0;
        let mut peers = Vec::new();

        let decoded = Bencode::decode(response)
            .map_err(FromTrackerResponseError::DecodeResponseError)?;

        let d = match decoded {
            Bencode::BDict(d) => d,
            _ => return Err(FromTrackerResponseError::NotADict),
        };

        for (k, v) in d.iter() {
            if k == b"failure reason" {
                failure_reason = Some(Self::create_failure_reason(v)?);
            } else if k == b"interval" {
                interval = Self::create_number(v, FromTrackerResponseError::InvalidInterval)?;
            } else if k == b"complete" {
                complete = Self::create_number(v, FromTrackerResponseError::InvalidComplete)?;
            } else if k == b"incomplete" {
                incomplete = Self::create_number(v, FromTrackerResponseError::InvalidIncomplete)?;
            } else if k == b"peers" {
                peers = Self::create_peers(v)?;
            }
        }

        Ok(TrackerResponse {
            failure_reason,
            interval,
            complete,
            incomplete,
            peers,
        })
    }

    fn create_failure_reason(bencode: &Bencode) -> Result<String, FromTrackerResponseError> {
        match bencode {
            Bencode::BString(s) => String::from_utf8(s.to_vec())
                .map_err(|_| FromTrackerResponseError::InvalidFailureReason),
            _ => Err(FromTrackerResponseError::InvalidFailureReason),
        }
    }

    fn create_number(
        bencode: &Bencode,
        error: FromTrackerResponseError,
    ) -> Result<i64, FromTrackerResponseError> {
        match bencode {
            Bencode::BNumber(n) => Ok(*n),
            _ => Err(error),
        }
    }

    fn create_peers(bencode: &Bencode) -> Result<Vec<SocketAddr>, FromTrackerResponseError> {
        match bencode {
            Bencode::BList(list) => Self::create_peers_from_dicts(list),
            Bencode::BString(compact) => Self::create_peers_from_compact(compact),
            _ => Err(FromTrackerResponseError::InvalidPeers),
        }
    }

    fn create_peers_from_dicts(
        list: &[Bencode],
    ) -> Result<Vec<SocketAddr>, FromTrackerResponseError> {
        let mut peers = Vec::new();
        for entry in list {
            let d = match entry {
                Bencode::BDict(d) => d,
                _ => return Err(FromTrackerResponseError::InvalidPeerEntry),
            };

            let ip = match d.get(b"ip") {
                Some(Bencode::BString(s)) => String::from_utf8(s.to_vec())
                    .ok()
                    .and_then(|ip| ip.parse::<IpAddr>().ok())
                    .ok_or(FromTrackerResponseError::InvalidPeerEntry)?,
                _ => return Err(FromTrackerResponseError::InvalidPeerEntry),
            };
            let port = match d.get(b"port") {
                Some(Bencode::BNumber(n)) if (0..=u16::MAX as i64).contains(n) => *n as u16,
                _ => return Err(FromTrackerResponseError::InvalidPeerEntry),
            };
            peers.push(SocketAddr::new(ip, port));
        }
        Ok(peers)
    }

    fn create_peers_from_compact(
        compact: &[u8],
    ) -> Result<Vec<SocketAddr>, FromTrackerResponseError> {
        if compact.len() % 6 != 0 {
            return Err(FromTrackerResponseError::InvalidCompactPeers);
        }
        Ok(compact
            .chunks(6)
            .map(|chunk| {
                let ip = IpAddr::from([chunk[0], chunk[1], chunk[2], chunk[3]]);
                let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                SocketAddr::new(ip, port)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencoder::bencode::BDict;

    fn build_peer_dict(peer_id: Vec<u8>, ip: Vec<u8>, port: i64) -> BDict {
        let mut peer_dict = BDict::new();
        peer_dict.insert(b"peer id".to_vec(), Bencode::BString(peer_id));
        peer_dict.insert(b"ip".to_vec(), Bencode::BString(ip));
        peer_dict.insert(b"port".to_vec(), Bencode::BNumber(port));
        peer_dict
    }

    #[test]
    fn test_from_tracker_response_with_peer_dicts() {
        let peers_list = vec![
            Bencode::BDict(build_peer_dict(b"id1".to_vec(), b"127.0.0.1".to_vec(), 6868)),
            Bencode::BDict(build_peer_dict(b"id2".to_vec(), b"127.0.0.2".to_vec(), 4242)),
        ];

        let mut dict = BDict::new();
        dict.insert(b"interval".to_vec(), Bencode::BNumber(10));
        dict.insert(b"complete".to_vec(), Bencode::BNumber(7));
        dict.insert(b"incomplete".to_vec(), Bencode::BNumber(3));
        dict.insert(b"peers".to_vec(), Bencode::BList(peers_list));

        let response = Bencode::encode(&dict);
        let decoded = TrackerResponse::from_bytes(&response).unwrap();

        assert_eq!(decoded.failure_reason, None);
        assert_eq!(decoded.interval, 10);
        assert_eq!(decoded.complete, 7);
        assert_eq!(decoded.incomplete, 3);
        assert_eq!(
            decoded.peers,
            vec![
                "127.0.0.1:6868".parse().unwrap(),
                "127.0.0.2:4242".parse().unwrap()
            ]
        );
    }

    #[test]
    fn test_from_tracker_response_with_compact_peers() {
        let mut dict = BDict::new();
        dict.insert(b"interval".to_vec(), Bencode::BNumber(60));
        dict.insert(
            b"peers".to_vec(),
            Bencode::BString(vec![0x7f, 0x00, 0x00, 0x01, 0x69, 0x9f]),
        );

        let response = Bencode::encode(&dict);
        let decoded = TrackerResponse::from_bytes(&response).unwrap();

        assert_eq!(decoded.peers, vec!["127.0.0.1:27039".parse().unwrap()]);
    }

    #[test]
    fn test_compact_peers_of_invalid_length() {
        let mut dict = BDict::new();
        dict.insert(b"peers".to_vec(), Bencode::BString(vec![1, 2, 3, 4]));

        let response = Bencode::encode(&dict);
        assert_eq!(
            TrackerResponse::from_bytes(&response),
            Err(FromTrackerResponseError::InvalidCompactPeers)
        );
    }

    #[test]
    fn test_failure_reason() {
        let mut dict = BDict::new();
        dict.insert(
            b"failure reason".to_vec(),
            Bencode::BString(b"unregistered torrent".to_vec()),
        );

        let response = Bencode::encode(&dict);
        let decoded = TrackerResponse::from_bytes(&response).unwrap();
        assert_eq!(
            decoded.failure_reason,
            Some(String::from("unregistered torrent"))
        );
        assert!(decoded.peers.is_empty());
    }

    #[test]
    fn test_not_a_dict() {
        assert_eq!(
            TrackerResponse::from_bytes(b"le"),
            Err(FromTrackerResponseError::NotADict)
        );
    }
}
