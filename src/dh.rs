//! Classic finite-field Diffie-Hellman for the key exchange methods.

// Refs:
// * https://tools.ietf.org/html/rfc2409#section-6.2 (group 1)
// * https://tools.ietf.org/html/rfc3526#section-3 (group 14)

use crate::{error::Error, wire};
use num_bigint::{BigUint, RandBigInt};
use zeroize::{Zeroize as _, Zeroizing};

// Second Oakley group, 1024-bit MODP.
const GROUP1_P_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
     29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
     EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
     E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
     EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381\
     FFFFFFFFFFFFFFFF";

// 2048-bit MODP group.
const GROUP14_P_HEX: &str = "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
     29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
     EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
     E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
     EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
     C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
     83655D23DCA3AD961C62F356208552BB9ED529077096966D\
     670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
     E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
     DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
     15728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// A Diffie-Hellman group: modulus `p` and generator `g`.
#[derive(Clone, Debug)]
pub struct DhGroup {
    pub p: BigUint,
    pub g: BigUint,
}

fn modp_group(p_hex: &str) -> DhGroup {
    let bytes = hex::decode(p_hex).expect("group modulus is valid hex");
    DhGroup {
        p: BigUint::from_bytes_be(&bytes),
        g: BigUint::from(2u32),
    }
}

pub fn group1() -> DhGroup {
    modp_group(GROUP1_P_HEX)
}

pub fn group14() -> DhGroup {
    modp_group(GROUP14_P_HEX)
}

/// An ephemeral DH key pair. The private exponent never leaves this
/// module and is zeroed when the pair is dropped.
pub struct DhKeyPair {
    x: Zeroizing<Vec<u8>>,
    pub public: BigUint,
}

impl DhGroup {
    pub fn generate_keypair(&self) -> DhKeyPair {
        let mut rng = rand::thread_rng();
        let x = rng.gen_biguint_range(&BigUint::from(2u32), &(&self.p - 2u32));
        let public = self.g.modpow(&x, &self.p);
        DhKeyPair {
            x: Zeroizing::new(x.to_bytes_be()),
            public,
        }
    }

    /// Sanity check on a peer's public value: it must fall strictly
    /// between 1 and p-1 and have more than one bit set.
    pub fn pub_is_valid(&self, public: &BigUint) -> bool {
        if *public <= BigUint::from(1u32) || *public >= &self.p - 1u32 {
            return false;
        }
        let bits_set: u32 = public.to_bytes_be().iter().map(|b| b.count_ones()).sum();
        bits_set > 1
    }

    /// Computes the shared secret `peer^x mod p`.
    ///
    /// The exponentiation goes through plain `BigUint` values for `x`
    /// and K; those cannot be wiped in place, only the byte buffers
    /// feeding and leaving them are.
    pub fn shared_secret(&self, keypair: &DhKeyPair, peer_public: &BigUint) -> SharedSecret {
        let x = BigUint::from_bytes_be(&keypair.x);
        let k = peer_public.modpow(&x, &self.p);
        SharedSecret::from_magnitude(k.to_bytes_be())
    }
}

/// The shared secret K, held in its SSH2 `mpint` wire encoding since
/// every consumer (exchange hash, key derivation) needs exactly that.
/// Zeroed on drop on every exit path.
pub struct SharedSecret {
    mpint: Zeroizing<Vec<u8>>,
}

impl SharedSecret {
    /// Builds the `mpint` encoding from the big-endian magnitude of K
    /// and wipes the magnitude buffer before returning.
    fn from_magnitude(mut mag: Vec<u8>) -> Self {
        let skip = mag.iter().take_while(|&&b| b == 0).count();
        let pad = mag.get(skip).is_some_and(|&b| b & 0x80 != 0);
        let mut buf = Vec::with_capacity(4 + 1 + mag.len());
        wire::put_u32(&mut buf, (mag.len() - skip + pad as usize) as u32);
        if pad {
            buf.push(0);
        }
        buf.extend_from_slice(&mag[skip..]);
        mag.zeroize();
        Self {
            mpint: Zeroizing::new(buf),
        }
    }

    /// The `mpint` encoding of K, as hashed into the exchange hash and
    /// the key-derivation rounds.
    pub fn as_mpint(&self) -> &[u8] {
        &self.mpint
    }
}

/// Fails with [`Error::Negotiation`] when a peer offers an invalid
/// public value; this can only indicate corruption or attack.
pub fn check_peer_public(group: &DhGroup, public: &BigUint) -> Result<(), Error> {
    if !group.pub_is_valid(public) {
        return Err(Error::negotiation("bad server public DH value"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_agreement_matches() {
        let group = group14();
        let a = group.generate_keypair();
        let b = group.generate_keypair();
        let k_a = group.shared_secret(&a, &b.public);
        let k_b = group.shared_secret(&b, &a.public);
        assert_eq!(k_a.as_mpint(), k_b.as_mpint());
    }

    #[test]
    fn rejects_degenerate_public_values() {
        let group = group1();
        assert!(!group.pub_is_valid(&BigUint::from(0u32)));
        assert!(!group.pub_is_valid(&BigUint::from(1u32)));
        assert!(!group.pub_is_valid(&(&group.p - 1u32)));
        assert!(!group.pub_is_valid(&group.p));
        // a single set bit is also refused
        assert!(!group.pub_is_valid(&BigUint::from(4u32)));
        assert!(group.pub_is_valid(&BigUint::from(6u32)));
    }

    #[test]
    fn shared_secret_encoding_matches_the_codec() {
        use num_bigint::{BigInt, Sign};

        for value in [0x7fu32, 0x80, 0x1234, 0x80000000] {
            let secret = SharedSecret::from_magnitude(BigUint::from(value).to_bytes_be());
            let mut expected = vec![];
            wire::put_bignum2(&mut expected, &BigInt::from(value));
            assert_eq!(secret.as_mpint(), &expected[..]);
        }
        // leading zero bytes in the magnitude are stripped
        let secret = SharedSecret::from_magnitude(vec![0, 0, 0x12, 0x34]);
        let mut expected = vec![];
        wire::put_bignum2(&mut expected, &BigInt::from_biguint(Sign::Plus, BigUint::from(0x1234u32)));
        assert_eq!(secret.as_mpint(), &expected[..]);
    }

    #[test]
    fn group_sizes() {
        assert_eq!(group1().p.bits(), 1024);
        assert_eq!(group14().p.bits(), 2048);
    }
}
