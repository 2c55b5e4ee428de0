//! Signed peer descriptors.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use soulmesh_identity::{compute_peer_id_from_bytes, verify, Capability, PeerIdentity};

use crate::error::Result;
use crate::{hash_prefixed_key, DhtKey, DhtValue};

/// How to reach a peer, as published into the DHT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub peer_id: String,
    pub addresses: Vec<String>,
    pub capabilities: Vec<Capability>,
    pub public_key: [u8; 32],
    /// Unix milliseconds.
    pub published_at: u64,
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct SignedFields<'a> {
    peer_id: &'a str,
    addresses: &'a [String],
    capabilities: &'a [Capability],
    public_key: &'a [u8; 32],
    published_at: u64,
}

impl PeerDescriptor {
    /// Build and sign a descriptor for the local node.
    pub fn signed(
        identity: &PeerIdentity,
        addresses: Vec<String>,
        capabilities: Vec<Capability>,
        published_at: u64,
    ) -> Result<Self> {
        let mut descriptor = Self {
            peer_id: identity.peer_id().to_string(),
            addresses,
            capabilities,
            public_key: identity.public_key_bytes(),
            published_at,
            signature: Vec::new(),
        };
        descriptor.signature = identity.sign(&descriptor.signing_bytes()?).to_vec();
        Ok(descriptor)
    }

    fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&SignedFields {
            peer_id: &self.peer_id,
            addresses: &self.addresses,
            capabilities: &self.capabilities,
            public_key: &self.public_key,
            published_at: self.published_at,
        })?)
    }

    /// Signature is valid and the peer id belongs to the embedded key.
    pub fn verify(&self) -> bool {
        if compute_peer_id_from_bytes(&self.public_key) != self.peer_id {
            return false;
        }
        match self.signing_bytes() {
            Ok(bytes) => verify(&bytes, &self.signature, &self.public_key),
            Err(_) => false,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Addresses that parse as socket addresses.
    pub fn socket_addrs(&self) -> Vec<SocketAddr> {
        self.addresses.iter().filter_map(|a| a.parse().ok()).collect()
    }
}

/// DHT key under which a peer's descriptor lives.
pub fn descriptor_key(peer_id: &str) -> DhtKey {
    hash_prefixed_key("peer", peer_id)
}

/// `value` is a verified descriptor stored under its owner's key.
pub fn is_descriptor_record(key: &DhtKey, value: &DhtValue) -> bool {
    match PeerDescriptor::from_bytes(value.as_bytes()) {
        Ok(descriptor) => descriptor_key(&descriptor.peer_id) == *key && descriptor.verify(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(identity: &PeerIdentity) -> PeerDescriptor {
        PeerDescriptor::signed(
            identity,
            vec!["127.0.0.1:7000".into(), "not-an-addr".into()],
            vec![Capability::Mesh],
            1_700_000_000_000,
        )
        .unwrap()
    }

    #[test]
    fn signed_descriptor_verifies() {
        let identity = PeerIdentity::generate();
        let descriptor = sample(&identity);
        assert!(descriptor.verify());
        assert_eq!(descriptor.socket_addrs().len(), 1);
    }

    #[test]
    fn bytes_roundtrip_preserves_signature() {
        let identity = PeerIdentity::generate();
        let descriptor = sample(&identity);
        let restored = PeerDescriptor::from_bytes(&descriptor.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, descriptor);
        assert!(restored.verify());
    }

    #[test]
    fn tampered_address_fails() {
        let identity = PeerIdentity::generate();
        let mut descriptor = sample(&identity);
        descriptor.addresses[0] = "10.0.0.1:7000".into();
        assert!(!descriptor.verify());
    }

    #[test]
    fn foreign_peer_id_fails() {
        let identity = PeerIdentity::generate();
        let other = PeerIdentity::generate();
        let mut descriptor = sample(&identity);
        descriptor.peer_id = other.peer_id().to_string();
        assert!(!descriptor.verify());
    }

    #[test]
    fn records_must_sit_under_their_owner() {
        let identity = PeerIdentity::generate();
        let value: DhtValue = sample(&identity).to_bytes().unwrap().into();
        assert!(is_descriptor_record(&descriptor_key(identity.peer_id()), &value));
        assert!(!is_descriptor_record(&descriptor_key("b3b3/someone-else"), &value));
        assert!(!is_descriptor_record(&descriptor_key(identity.peer_id()), &"junk".into()));
    }

    #[test]
    fn key_is_per_peer() {
        assert_eq!(descriptor_key("a"), descriptor_key("a"));
        assert_ne!(descriptor_key("a"), descriptor_key("b"));
    }
}
