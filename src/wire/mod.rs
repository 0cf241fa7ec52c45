// Wire formats for the pairing and talk protocols.
//
// Two bencoded dictionaries cross the wire: the pairing `Request`
// (inside a sealed envelope) and the `FileOffer` (as an `x-slick/file`
// message body). Everything else is plain HTTP bodies.

pub mod bencode;
pub mod http;

use std::collections::BTreeMap;

use thiserror::Error;

use self::bencode::Value;

/// Content type marking a talk POST body as a bencoded [`FileOffer`].
/// Any other content type is treated as UTF-8 text.
pub const FILE_OFFER_CONTENT_TYPE: &str = "x-slick/file";

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed payload: {0}")]
    Malformed(&'static str),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has the wrong type or size")]
    BadField(&'static str),
}

fn take_bytes(dict: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<Vec<u8>, WireError> {
    dict.get(key.as_bytes())
        .ok_or(WireError::MissingField(key))?
        .as_bytes()
        .map(|b| b.to_vec())
        .ok_or(WireError::BadField(key))
}

fn take_string(dict: &BTreeMap<Vec<u8>, Value>, key: &'static str) -> Result<String, WireError> {
    String::from_utf8(take_bytes(dict, key)?).map_err(|_| WireError::BadField(key))
}

/// The pairing greeting: who we are and which certificate to trust.
///
/// Travels sealed to the receiving side's public key; the reply carries
/// the mirror-image `Request` sealed to ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Our certificate, PEM bytes.
    pub cert: Vec<u8>,
    /// Our display name.
    pub name: String,
    /// Our X25519 sealing public key.
    pub public_key: [u8; 32],
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut entries = BTreeMap::new();
        entries.insert(b"cert".to_vec(), Value::Bytes(self.cert.clone()));
        entries.insert(b"name".to_vec(), Value::Bytes(self.name.as_bytes().to_vec()));
        entries.insert(
            b"public_key".to_vec(),
            Value::Bytes(self.public_key.to_vec()),
        );
        bencode::encode(&Value::Dict(entries))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let value = bencode::decode(bytes)?;
        let dict = value.as_dict().ok_or(WireError::Malformed("expected dict"))?;
        let public_key: [u8; 32] = take_bytes(dict, "public_key")?
            .try_into()
            .map_err(|_| WireError::BadField("public_key"))?;
        Ok(Self {
            cert: take_bytes(dict, "cert")?,
            name: take_string(dict, "name")?,
            public_key,
        })
    }
}

/// A file offered over an established talk connection.
///
/// `url` is the offering side's talk-server path (`/f/<uuid>`); the
/// recipient fetches it with ranged GETs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub url: String,
    pub size: u64,
    pub content_type: String,
    pub name: String,
}

impl FileOffer {
    pub fn encode(&self) -> Vec<u8> {
        let mut entries = BTreeMap::new();
        entries.insert(b"name".to_vec(), Value::Bytes(self.name.as_bytes().to_vec()));
        entries.insert(b"size".to_vec(), Value::Int(self.size as i64));
        entries.insert(
            b"type".to_vec(),
            Value::Bytes(self.content_type.as_bytes().to_vec()),
        );
        entries.insert(b"url".to_vec(), Value::Bytes(self.url.as_bytes().to_vec()));
        bencode::encode(&Value::Dict(entries))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        let value = bencode::decode(bytes)?;
        let dict = value.as_dict().ok_or(WireError::Malformed("expected dict"))?;
        let size = dict
            .get(b"size".as_slice())
            .ok_or(WireError::MissingField("size"))?
            .as_int()
            .ok_or(WireError::BadField("size"))?;
        if size < 0 {
            return Err(WireError::BadField("size"));
        }
        Ok(Self {
            url: take_string(dict, "url")?,
            size: size as u64,
            content_type: take_string(dict, "type")?,
            name: take_string(dict, "name")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = Request {
            cert: b"-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n".to_vec(),
            name: "alice".to_string(),
            public_key: [7u8; 32],
        };
        assert_eq!(Request::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_request_rejects_short_key() {
        let mut entries = BTreeMap::new();
        entries.insert(b"cert".to_vec(), Value::Bytes(b"c".to_vec()));
        entries.insert(b"name".to_vec(), Value::Bytes(b"n".to_vec()));
        entries.insert(b"public_key".to_vec(), Value::Bytes(vec![0u8; 16]));
        let bytes = bencode::encode(&Value::Dict(entries));
        assert!(matches!(
            Request::decode(&bytes),
            Err(WireError::BadField("public_key"))
        ));
    }

    #[test]
    fn test_request_rejects_missing_field() {
        let mut entries = BTreeMap::new();
        entries.insert(b"cert".to_vec(), Value::Bytes(b"c".to_vec()));
        let bytes = bencode::encode(&Value::Dict(entries));
        assert!(matches!(
            Request::decode(&bytes),
            Err(WireError::MissingField("name"))
        ));
    }

    #[test]
    fn test_file_offer_roundtrip() {
        let offer = FileOffer {
            url: "/f/3aa2e8f0-99f8-4b0a-90f2-3c92a2f0cafe".to_string(),
            size: 3_500_000,
            content_type: "application/octet-stream".to_string(),
            name: "backup.tar".to_string(),
        };
        assert_eq!(FileOffer::decode(&offer.encode()).unwrap(), offer);
    }

    #[test]
    fn test_file_offer_rejects_negative_size() {
        let mut entries = BTreeMap::new();
        entries.insert(b"name".to_vec(), Value::Bytes(b"f".to_vec()));
        entries.insert(b"size".to_vec(), Value::Int(-1));
        entries.insert(b"type".to_vec(), Value::Bytes(b"t".to_vec()));
        entries.insert(b"url".to_vec(), Value::Bytes(b"/f/x".to_vec()));
        let bytes = bencode::encode(&Value::Dict(entries));
        assert!(FileOffer::decode(&bytes).is_err());
    }

    #[test]
    fn test_zero_size_offer() {
        let offer = FileOffer {
            url: "/f/x".to_string(),
            size: 0,
            content_type: "text/plain".to_string(),
            name: "empty".to_string(),
        };
        assert_eq!(FileOffer::decode(&offer.encode()).unwrap().size, 0);
    }
}
