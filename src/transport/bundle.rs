// Message framing.
//
// Every inter-worker message is a kind-tagged bundle. The frame is
// `{kind: u8, crc32: u32 LE, payload}`; the payload is the little-endian
// bincode serialization of the carried structure.

use crate::error::{MeshError, Result};
use crate::query::SparqlQuery;
use bytes::{BufMut, Bytes, BytesMut};

/// Wire-level message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    SparqlQuery,
    /// Bulk-load request; handled only by builds with the `dynamic-load`
    /// feature, recognized on the wire by all builds.
    GraphLoad,
}

impl MessageKind {
    fn as_byte(self) -> u8 {
        match self {
            MessageKind::SparqlQuery => 0,
            MessageKind::GraphLoad => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(MessageKind::SparqlQuery),
            1 => Ok(MessageKind::GraphLoad),
            other => Err(MeshError::Serialization(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

/// A kind-tagged opaque message.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub kind: MessageKind,
    pub payload: Bytes,
}

impl Bundle {
    /// Wrap a query for the wire.
    pub fn query(query: &SparqlQuery) -> Result<Self> {
        let payload = bincode::serde::encode_to_vec(query, bincode::config::standard())
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::SparqlQuery,
            payload: payload.into(),
        })
    }

    /// Recover the query of a [`MessageKind::SparqlQuery`] bundle.
    pub fn decode_query(&self) -> Result<SparqlQuery> {
        if self.kind != MessageKind::SparqlQuery {
            return Err(MeshError::Serialization(
                "bundle does not carry a query".to_string(),
            ));
        }
        bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map(|(query, _)| query)
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    /// Wrap a bulk-load request for the wire.
    #[cfg(feature = "dynamic-load")]
    pub fn graph_load(load: &crate::query::GraphLoad) -> Result<Self> {
        let payload = bincode::serde::encode_to_vec(load, bincode::config::standard())
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        Ok(Self {
            kind: MessageKind::GraphLoad,
            payload: payload.into(),
        })
    }

    /// Recover the bulk-load request of a [`MessageKind::GraphLoad`] bundle.
    #[cfg(feature = "dynamic-load")]
    pub fn decode_graph_load(&self) -> Result<crate::query::GraphLoad> {
        if self.kind != MessageKind::GraphLoad {
            return Err(MeshError::Serialization(
                "bundle does not carry a load request".to_string(),
            ));
        }
        bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
            .map(|(load, _)| load)
            .map_err(|e| MeshError::Serialization(e.to_string()))
    }

    /// Frame this bundle for the transport.
    pub fn encode(&self) -> Bytes {
        let mut frame = BytesMut::with_capacity(5 + self.payload.len());
        frame.put_u8(self.kind.as_byte());
        frame.put_u32_le(crc32fast::hash(&self.payload));
        frame.put_slice(&self.payload);
        frame.freeze()
    }

    /// Parse and verify a frame.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < 5 {
            return Err(MeshError::Serialization("truncated frame".to_string()));
        }
        let kind = MessageKind::from_byte(frame[0])?;
        let expected = u32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let payload = &frame[5..];
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(MeshError::Serialization(format!(
                "frame checksum mismatch: expected {}, got {}",
                expected, actual
            )));
        }
        Ok(Self {
            kind,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Direction, Pattern, PatternGroup};

    fn sample_query() -> SparqlQuery {
        let mut q = SparqlQuery::new(PatternGroup::from_patterns(vec![Pattern::new(
            1,
            10,
            Direction::Out,
            -2,
        )]));
        q.pid = 4242;
        q.id = 4242;
        q
    }

    #[test]
    fn test_query_frame_roundtrip() {
        let q = sample_query();
        let frame = Bundle::query(&q).unwrap().encode();
        let bundle = Bundle::decode(&frame).unwrap();
        assert_eq!(bundle.kind, MessageKind::SparqlQuery);
        assert_eq!(bundle.decode_query().unwrap(), q);
    }

    #[test]
    fn test_corrupt_frame_fails_checksum() {
        let mut frame = Bundle::query(&sample_query()).unwrap().encode().to_vec();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        assert!(Bundle::decode(&frame).is_err());
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let frame = [9u8, 0, 0, 0, 0];
        assert!(Bundle::decode(&frame).is_err());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        assert!(Bundle::decode(&[0u8, 1, 2]).is_err());
    }

    #[cfg(feature = "dynamic-load")]
    #[test]
    fn test_graph_load_roundtrip() {
        let load = crate::query::GraphLoad::new("/tmp/triples.nt".to_string(), true);
        let frame = Bundle::graph_load(&load).unwrap().encode();
        let bundle = Bundle::decode(&frame).unwrap();
        assert_eq!(bundle.decode_graph_load().unwrap(), load);
    }
}
