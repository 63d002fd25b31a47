//! Online DNSSEC signing.
//!
//! Holds one combined KSK/ZSK (flags 257). The key is ECDSA P-256
//! (algorithm 13); RSA keys from older deployments are accepted on load.
//! RRSIGs are computed over the RFC 4034 canonical form of the RRset:
//! lowercased owner name in wire form, records ordered by their canonical
//! RDATA image.

use chrono::Utc;
use hickory_proto::rr::dnssec::rdata::{DNSSECRData, DNSKEY, DS, RRSIG};
use hickory_proto::rr::dnssec::{Algorithm, DigestType};
use hickory_proto::rr::rdata::SOA;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use ring::rand::SystemRandom;
use ring::signature::{EcdsaKeyPair, KeyPair, RsaKeyPair, ECDSA_P256_SHA256_FIXED_SIGNING, RSA_PKCS1_SHA256};
use sha2::{Digest, Sha256};
use thiserror::Error;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::store::Store;

/// DNSKEY flags: ZONE | SEP.
const KEY_FLAGS: u16 = 257;
/// TTL carried by the apex DNSKEY and SOA records.
const APEX_TTL: u32 = 3600;
/// TTL suggested for the DS record handed to the parent.
const DS_TTL: u32 = 30 * 86400;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid dnssec key: {0}")]
    InvalidKey(String),

    #[error("no signing key loaded")]
    MissingKey,

    #[error("cannot sign an empty rrset")]
    EmptyRrset,

    #[error("signing operation failed")]
    SigningFailed,

    #[error("dns encoding failed: {0}")]
    Encoding(String),
}

enum PrivateKey {
    Ecdsa(EcdsaKeyPair),
    Rsa(RsaKeyPair),
}

/// DNSSEC state for the parent zone. Immutable after construction.
pub struct Signer {
    key: Option<PrivateKey>,
    rng: SystemRandom,
    /// DNSKEY public key field, wire form.
    public_key: Vec<u8>,
    algorithm: Algorithm,
    key_tag: u16,
    zone_name: Name,
    soa_mname: Name,
    soa_rname: Name,
    store: Store,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("algorithm", &self.algorithm)
            .field("key_tag", &self.key_tag)
            .field("zone_name", &self.zone_name)
            .field("soa_mname", &self.soa_mname)
            .field("soa_rname", &self.soa_rname)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Generate a fresh ECDSA P-256 key. Returns the signer and the blob
    /// the operator should place in `dns.dnssec_key`.
    pub fn generate(
        zone: &str,
        mailbox: &str,
        first_ns: &str,
        store: Store,
    ) -> Result<(Signer, String), SignerError> {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
            .map_err(|_| SignerError::SigningFailed)?;
        let key = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;

        // ring exposes the uncompressed SEC1 point (0x04 || x || y); the
        // DNSKEY field carries only x || y.
        let point = key.public_key().as_ref();
        let public_key = point[1..].to_vec();

        let blob = encode_key_blob(Algorithm::ECDSAP256SHA256, pkcs8.as_ref(), &public_key);
        let signer = Self::assemble(
            PrivateKey::Ecdsa(key),
            rng,
            public_key,
            Algorithm::ECDSAP256SHA256,
            zone,
            mailbox,
            first_ns,
            store,
        )?;
        Ok((signer, blob))
    }

    /// Load a key from a blob produced by [`Signer::generate`] (or by an
    /// older deployment; RSA private keys are still accepted).
    pub fn load(
        blob: &str,
        zone: &str,
        mailbox: &str,
        first_ns: &str,
        store: Store,
    ) -> Result<Signer, SignerError> {
        let decoded = BASE64
            .decode(blob.trim())
            .map_err(|e| SignerError::InvalidKey(format!("blob is not base64: {e}")))?;
        let text = String::from_utf8(decoded)
            .map_err(|_| SignerError::InvalidKey("blob is not ASCII text".into()))?;

        let mut algorithm: Option<u8> = None;
        let mut private_b64: Option<String> = None;
        let mut public_b64: Option<String> = None;
        for line in text.lines() {
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match field.trim() {
                "Algorithm" => {
                    let number = value.split_whitespace().next().unwrap_or_default();
                    algorithm = Some(
                        number
                            .parse()
                            .map_err(|_| SignerError::InvalidKey(format!("bad algorithm {value:?}")))?,
                    );
                }
                "PrivateKey" => private_b64 = Some(value.to_string()),
                "PublicKey" => public_b64 = Some(value.to_string()),
                _ => {}
            }
        }

        let public_b64 =
            public_b64.ok_or_else(|| SignerError::InvalidKey("missing PublicKey line".into()))?;
        let public_key = BASE64
            .decode(public_b64)
            .map_err(|e| SignerError::InvalidKey(format!("bad PublicKey line: {e}")))?;
        let private_der = BASE64
            .decode(private_b64.ok_or_else(|| SignerError::InvalidKey("missing PrivateKey line".into()))?)
            .map_err(|e| SignerError::InvalidKey(format!("bad PrivateKey line: {e}")))?;

        let rng = SystemRandom::new();
        let (key, algorithm) = match algorithm {
            Some(13) => {
                let key =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &private_der, &rng)
                        .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
                (PrivateKey::Ecdsa(key), Algorithm::ECDSAP256SHA256)
            }
            Some(8) => {
                let key = RsaKeyPair::from_pkcs8(&private_der)
                    .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
                (PrivateKey::Rsa(key), Algorithm::RSASHA256)
            }
            Some(other) => {
                return Err(SignerError::InvalidKey(format!(
                    "unsupported key algorithm {other}"
                )))
            }
            None => return Err(SignerError::InvalidKey("missing Algorithm line".into())),
        };

        Self::assemble(key, rng, public_key, algorithm, zone, mailbox, first_ns, store)
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        key: PrivateKey,
        rng: SystemRandom,
        public_key: Vec<u8>,
        algorithm: Algorithm,
        zone: &str,
        mailbox: &str,
        first_ns: &str,
        store: Store,
    ) -> Result<Signer, SignerError> {
        let zone_name = fqdn(zone)?;
        let soa_mname = fqdn(first_ns)?;
        let soa_rname = fqdn(mailbox)?;
        let key_tag = calculate_key_tag(KEY_FLAGS, u8::from(algorithm), &public_key);
        Ok(Signer {
            key: Some(key),
            rng,
            public_key,
            algorithm,
            key_tag,
            zone_name,
            soa_mname,
            soa_rname,
            store,
        })
    }

    pub fn key_tag(&self) -> u16 {
        self.key_tag
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    pub fn zone_name(&self) -> &Name {
        &self.zone_name
    }

    /// The apex DNSKEY record (flags 257, protocol 3).
    pub fn dnskey(&self) -> Record {
        let dnskey = DNSKEY::new(true, true, false, self.algorithm, self.public_key.clone());
        Record::from_rdata(
            self.zone_name.clone(),
            APEX_TTL,
            RData::DNSSEC(DNSSECRData::DNSKEY(dnskey)),
        )
    }

    /// The DS record for the parent zone, SHA-256 digest.
    pub fn ds(&self) -> Record {
        let mut hasher = Sha256::new();
        hasher.update(name_wire(&self.zone_name));
        hasher.update(self.dnskey_rdata());
        let digest = hasher.finalize().to_vec();

        let ds = DS::new(self.key_tag, self.algorithm, DigestType::SHA256, digest);
        Record::from_rdata(
            self.zone_name.clone(),
            DS_TTL,
            RData::DNSSEC(DNSSECRData::DS(ds)),
        )
    }

    /// DS in zone-file form, for the operator to hand to the registrar.
    pub fn ds_presentation(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(name_wire(&self.zone_name));
        hasher.update(self.dnskey_rdata());
        format!(
            "{} IN DS {} {} 2 {}",
            self.zone_name,
            self.key_tag,
            u8::from(self.algorithm),
            hex::encode(hasher.finalize()).to_uppercase()
        )
    }

    /// The apex SOA. Refresh/retry/expire are deliberately tiny: there are
    /// no secondaries, the zone is ephemeral.
    pub fn soa(&self) -> Record {
        let soa = SOA::new(
            self.soa_mname.clone(),
            self.soa_rname.clone(),
            self.store.serial(),
            1,
            1,
            1,
            APEX_TTL,
        );
        Record::from_rdata(self.zone_name.clone(), APEX_TTL, RData::SOA(soa))
    }

    /// Produce the RRSIG covering `rrset`. The whole slice must share one
    /// owner name and record type.
    pub fn sign_rrset(&self, rrset: &[Record]) -> Result<Record, SignerError> {
        let key = self.key.as_ref().ok_or(SignerError::MissingKey)?;
        let first = rrset.first().ok_or(SignerError::EmptyRrset)?;

        let now = Utc::now().timestamp() as u32;
        let inception = now.wrapping_sub(3600);
        let expiration = now.wrapping_add(first.ttl()).wrapping_add(3600);
        let type_covered = first.record_type();
        let num_labels = first.name().num_labels();
        let original_ttl = first.ttl();

        let data = rrsig_signing_data(
            type_covered,
            self.algorithm,
            num_labels,
            original_ttl,
            expiration,
            inception,
            self.key_tag,
            &self.zone_name,
            rrset,
        )?;

        let sig = match key {
            PrivateKey::Ecdsa(key) => key
                .sign(&self.rng, &data)
                .map_err(|_| SignerError::SigningFailed)?
                .as_ref()
                .to_vec(),
            PrivateKey::Rsa(key) => {
                let mut sig = vec![0u8; key.public().modulus_len()];
                key.sign(&RSA_PKCS1_SHA256, &self.rng, &data, &mut sig)
                    .map_err(|_| SignerError::SigningFailed)?;
                sig
            }
        };

        let rrsig = RRSIG::new(
            type_covered,
            self.algorithm,
            num_labels,
            original_ttl,
            expiration,
            inception,
            self.key_tag,
            self.zone_name.clone(),
            sig,
        );
        Ok(Record::from_rdata(
            first.name().clone(),
            original_ttl,
            RData::DNSSEC(DNSSECRData::RRSIG(rrsig)),
        ))
    }

    /// DNSKEY RDATA in wire form: flags, protocol, algorithm, public key.
    fn dnskey_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(4 + self.public_key.len());
        rdata.extend_from_slice(&KEY_FLAGS.to_be_bytes());
        rdata.push(3);
        rdata.push(u8::from(self.algorithm));
        rdata.extend_from_slice(&self.public_key);
        rdata
    }
}

/// Encode the key blob: a BIND-style private-key stanza plus the
/// `PublicKey:` line, all wrapped in base64.
fn encode_key_blob(algorithm: Algorithm, pkcs8_der: &[u8], public_key: &[u8]) -> String {
    let text = format!(
        "Private-key-format: v1.3\n\
         Algorithm: {} (ECDSAP256SHA256)\n\
         PrivateKey: {}\n\
         PublicKey: {}\n",
        u8::from(algorithm),
        BASE64.encode(pkcs8_der),
        BASE64.encode(public_key),
    );
    BASE64.encode(text.as_bytes())
}

/// Key tag over the DNSKEY RDATA, RFC 4034 appendix B.
pub fn calculate_key_tag(flags: u16, algorithm: u8, public_key: &[u8]) -> u16 {
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(3);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);

    let mut ac: u32 = 0;
    for (i, byte) in rdata.iter().enumerate() {
        if i % 2 == 0 {
            ac += (*byte as u32) << 8;
        } else {
            ac += *byte as u32;
        }
    }
    ac += (ac >> 16) & 0xFFFF;
    (ac & 0xFFFF) as u16
}

/// Owner name in canonical (lowercased, uncompressed) wire form.
fn name_wire(name: &Name) -> Vec<u8> {
    let mut wire = Vec::with_capacity(name.len() + 1);
    for label in name.iter() {
        wire.push(label.len() as u8);
        wire.extend(label.iter().map(u8::to_ascii_lowercase));
    }
    wire.push(0);
    wire
}

/// RDATA in canonical wire form (embedded names lowercased, never
/// compressed).
fn rdata_wire(rdata: &RData) -> Result<Vec<u8>, SignerError> {
    let mut buf = Vec::with_capacity(64);
    {
        let mut encoder = BinEncoder::new(&mut buf);
        encoder.set_canonical_names(true);
        rdata
            .emit(&mut encoder)
            .map_err(|e| SignerError::Encoding(e.to_string()))?;
    }
    Ok(buf)
}

/// The exact byte string an RRSIG signature is computed over: the RRSIG
/// RDATA up to (not including) the signature, followed by the canonical
/// RRset.
#[allow(clippy::too_many_arguments)]
fn rrsig_signing_data(
    type_covered: RecordType,
    algorithm: Algorithm,
    num_labels: u8,
    original_ttl: u32,
    expiration: u32,
    inception: u32,
    key_tag: u16,
    signer_name: &Name,
    rrset: &[Record],
) -> Result<Vec<u8>, SignerError> {
    let first = rrset.first().ok_or(SignerError::EmptyRrset)?;

    let mut data = Vec::with_capacity(256);
    data.extend_from_slice(&u16::from(type_covered).to_be_bytes());
    data.push(u8::from(algorithm));
    data.push(num_labels);
    data.extend_from_slice(&original_ttl.to_be_bytes());
    data.extend_from_slice(&expiration.to_be_bytes());
    data.extend_from_slice(&inception.to_be_bytes());
    data.extend_from_slice(&key_tag.to_be_bytes());
    data.extend_from_slice(&name_wire(signer_name));

    let owner = name_wire(first.name());
    let rtype = u16::from(type_covered);

    let mut images: Vec<Vec<u8>> = rrset
        .iter()
        .map(|record| {
            record
                .data()
                .ok_or(SignerError::EmptyRrset)
                .and_then(rdata_wire)
        })
        .collect::<Result<_, _>>()?;
    images.sort();

    for rdata in images {
        data.extend_from_slice(&owner);
        data.extend_from_slice(&rtype.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes()); // class IN
        data.extend_from_slice(&original_ttl.to_be_bytes());
        data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
        data.extend_from_slice(&rdata);
    }

    Ok(data)
}

/// Parse a configured host into an absolute name, tolerating a missing
/// trailing dot.
fn fqdn(host: &str) -> Result<Name, SignerError> {
    let host = host.trim_end_matches('.');
    Name::from_ascii(format!("{host}."))
        .map_err(|e| SignerError::Encoding(format!("bad name {host:?}: {e}")))
}
