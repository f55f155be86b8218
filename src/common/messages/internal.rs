use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "q")]
    pub message_type: String,

    #[serde(default)]
    #[serde(rename = "k")]
    pub key: ByteBuf,

    #[serde(default)]
    #[serde(rename = "n")]
    pub closer_peers: Vec<DHTPeer>,

    #[serde(default)]
    #[serde(rename = "p")]
    pub provider_peers: Vec<DHTPeer>,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTPeer {
    pub id: ByteBuf,

    #[serde(default)]
    #[serde(rename = "a")]
    // Binary multiaddrs, decoded one by one so a bad address only drops itself.
    pub addresses: Vec<ByteBuf>,
}
