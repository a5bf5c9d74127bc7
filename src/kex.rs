//! The key-exchange engine: algorithm negotiation, Diffie-Hellman and
//! key derivation.
//!
//! The engine runs once at connection start and again on every rekey.
//! During a round the only legal peer messages are the ones the current
//! state expects (plus IGNORE/DEBUG); anything else terminates the
//! connection.

// Refs:
// * https://tools.ietf.org/html/rfc4253#section-7
// * https://tools.ietf.org/html/rfc4419

use crate::{
    consts, dh,
    dh::SharedSecret,
    error::Error,
    hostkeys::{HostKeyStore, HostStatus},
    keys,
    packet::PacketChannel,
    wire,
};
use bytes::Buf as _;
use num_bigint::BigInt;
use ring::{digest, rand as ring_rand, rand::SecureRandom as _};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const PROPOSAL_KEX_ALGS: usize = 0;
pub const PROPOSAL_SERVER_HOST_KEY_ALGS: usize = 1;
pub const PROPOSAL_ENC_ALGS_CTOS: usize = 2;
pub const PROPOSAL_ENC_ALGS_STOC: usize = 3;
pub const PROPOSAL_MAC_ALGS_CTOS: usize = 4;
pub const PROPOSAL_MAC_ALGS_STOC: usize = 5;
pub const PROPOSAL_COMP_ALGS_CTOS: usize = 6;
pub const PROPOSAL_COMP_ALGS_STOC: usize = 7;
pub const PROPOSAL_LANG_CTOS: usize = 8;
pub const PROPOSAL_LANG_STOC: usize = 9;
pub const PROPOSAL_MAX: usize = 10;

const KEX_COOKIE_LEN: usize = 16;

pub const KEX_DH1: &str = "diffie-hellman-group1-sha1";
pub const KEX_DH14: &str = "diffie-hellman-group14-sha1";
pub const KEX_DHGEX: &str = "diffie-hellman-group-exchange-sha1";

// group-exchange size preferences
const GEX_MIN_BITS: u32 = 1024;
const GEX_PREFERRED_BITS: u32 = 2048;
const GEX_MAX_BITS: u32 = 8192;

pub const MODE_IN: usize = 0;
pub const MODE_OUT: usize = 1;
pub const MODE_MAX: usize = 2;

// ==== Proposal ====

/// One peer's KEXINIT offer: a random cookie plus ten ordered
/// algorithm-name lists.
#[derive(Clone, Debug)]
pub struct Proposal {
    pub cookie: [u8; KEX_COOKIE_LEN],
    pub names: [String; PROPOSAL_MAX],
    pub first_kex_follows: bool,
}

impl Proposal {
    pub fn new(names: [String; PROPOSAL_MAX], rng: &ring_rand::SystemRandom) -> Result<Self, Error> {
        let mut cookie = [0u8; KEX_COOKIE_LEN];
        rng.fill(&mut cookie)
            .map_err(|_| Error::local("failed to generate kex cookie"))?;
        Ok(Self {
            cookie,
            names,
            first_kex_follows: false,
        })
    }

    /// Encodes the KEXINIT body (everything after the message type).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend_from_slice(&self.cookie);
        for name in &self.names {
            wire::put_cstring(&mut buf, name);
        }
        wire::put_u8(&mut buf, self.first_kex_follows as u8);
        wire::put_u32(&mut buf, 0); // reserved
        buf
    }

    /// Parses a KEXINIT body.
    pub fn parse(body: &[u8]) -> Result<Self, Error> {
        let mut b = body;
        if b.len() < KEX_COOKIE_LEN {
            return Err(Error::protocol("short KEXINIT"));
        }
        let mut cookie = [0u8; KEX_COOKIE_LEN];
        cookie.copy_from_slice(&b[..KEX_COOKIE_LEN]);
        b = &b[KEX_COOKIE_LEN..];

        let mut names: [String; PROPOSAL_MAX] = Default::default();
        for slot in names.iter_mut() {
            let raw = wire::get_string(&mut b)?;
            *slot = String::from_utf8(raw)
                .map_err(|_| Error::protocol("non-utf8 algorithm list"))?;
            tracing::trace!("kex_parse_kexinit: {}", slot);
        }
        let first_kex_follows = wire::get_u8(&mut b)? != 0;
        let _reserved = wire::get_u32(&mut b)?;
        Ok(Self {
            cookie,
            names,
            first_kex_follows,
        })
    }
}

// ==== algorithm selection ====

/// First name in the client's list that also appears in the server's
/// list; client preference wins.
pub fn match_list(client: &str, server: &str) -> Option<String> {
    client
        .split(',')
        .find(|c| server.split(',').any(|s| s == *c))
        .map(str::to_owned)
}

fn cipher_by_name(name: &str) -> Option<(usize, usize)> {
    // (key length, block size)
    Some(match name {
        "aes128-cbc" => (16, 16),
        "aes192-cbc" => (24, 16),
        "aes256-cbc" => (32, 16),
        "3des-cbc" => (24, 8),
        "blowfish-cbc" => (16, 8),
        "cast128-cbc" => (16, 8),
        "arcfour" => (16, 8),
        "none" => (0, 8),
        _ => return None,
    })
}

fn mac_by_name(name: &str) -> Option<usize> {
    Some(match name {
        "hmac-sha1" | "hmac-sha1-96" => 20,
        "hmac-md5" | "hmac-md5-96" => 16,
        "none" => 0,
        _ => return None,
    })
}

#[derive(Clone, Debug)]
pub struct Enc {
    pub name: String,
    pub key_len: usize,
    pub block_size: usize,
}

#[derive(Clone, Debug)]
pub struct MacAlg {
    pub name: String,
    pub key_len: usize,
}

#[derive(Clone, Debug)]
pub struct Comp {
    pub name: String,
    pub zlib: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KexType {
    DhGroup1Sha1,
    DhGroup14Sha1,
    DhGexSha1,
}

/// The outcome of algorithm selection over two proposals.
#[derive(Clone, Debug)]
pub struct Negotiated {
    pub enc: [Enc; MODE_MAX],
    pub mac: [MacAlg; MODE_MAX],
    pub comp: [Comp; MODE_MAX],
    pub kex_type: KexType,
    pub hostkey_alg: String,
    /// Maximum key material length any selected algorithm needs.
    pub we_need: usize,
}

fn choose_enc(client: &str, server: &str) -> Result<Enc, Error> {
    let name = match_list(client, server).ok_or_else(|| {
        Error::Negotiation(format!(
            "no matching cipher found: client {} server {}",
            client, server
        ))
    })?;
    let (key_len, block_size) = cipher_by_name(&name)
        .ok_or_else(|| Error::Negotiation(format!("matching cipher is not supported: {}", name)))?;
    Ok(Enc {
        name,
        key_len,
        block_size,
    })
}

fn choose_mac(client: &str, server: &str, datafellows: u32) -> Result<MacAlg, Error> {
    let name = match_list(client, server).ok_or_else(|| {
        Error::Negotiation(format!(
            "no matching mac found: client {} server {}",
            client, server
        ))
    })?;
    let mut key_len = mac_by_name(&name)
        .ok_or_else(|| Error::Negotiation(format!("unsupported mac {}", name)))?;
    // some old peers truncate the mac key
    if datafellows & crate::compat::SSH_BUG_HMAC != 0 {
        key_len = 16;
    }
    Ok(MacAlg { name, key_len })
}

fn choose_comp(client: &str, server: &str) -> Result<Comp, Error> {
    let name = match_list(client, server).ok_or_else(|| {
        Error::Negotiation(format!(
            "no matching comp found: client {} server {}",
            client, server
        ))
    })?;
    let zlib = match name.as_str() {
        "zlib" => true,
        "none" => false,
        _ => return Err(Error::Negotiation(format!("unsupported comp {}", name))),
    };
    Ok(Comp { name, zlib })
}

fn choose_kex(client: &str, server: &str) -> Result<KexType, Error> {
    let name = match_list(client, server)
        .ok_or_else(|| Error::negotiation("no kex alg"))?;
    match name.as_str() {
        KEX_DH1 => Ok(KexType::DhGroup1Sha1),
        KEX_DH14 => Ok(KexType::DhGroup14Sha1),
        KEX_DHGEX => Ok(KexType::DhGexSha1),
        other => Err(Error::Negotiation(format!("bad kex alg {}", other))),
    }
}

/// Runs algorithm selection between our proposal and the peer's.
///
/// Which proposal plays the client role depends on our side of the
/// connection, not on who is compared first; the client's preference
/// order decides every slot.
pub fn choose_conf(
    my: &Proposal,
    peer: &Proposal,
    server_side: bool,
    datafellows: u32,
) -> Result<Negotiated, Error> {
    let (cprop, sprop) = if server_side {
        (&peer.names, &my.names)
    } else {
        (&my.names, &peer.names)
    };

    let pick = |mode: usize| -> Result<(Enc, MacAlg, Comp), Error> {
        let ctos = (!server_side && mode == MODE_OUT) || (server_side && mode == MODE_IN);
        let nenc = if ctos { PROPOSAL_ENC_ALGS_CTOS } else { PROPOSAL_ENC_ALGS_STOC };
        let nmac = if ctos { PROPOSAL_MAC_ALGS_CTOS } else { PROPOSAL_MAC_ALGS_STOC };
        let ncomp = if ctos { PROPOSAL_COMP_ALGS_CTOS } else { PROPOSAL_COMP_ALGS_STOC };
        let enc = choose_enc(&cprop[nenc], &sprop[nenc])?;
        let mac = choose_mac(&cprop[nmac], &sprop[nmac], datafellows)?;
        let comp = choose_comp(&cprop[ncomp], &sprop[ncomp])?;
        tracing::debug!(
            "kex: {} {} {} {}",
            if ctos { "client->server" } else { "server->client" },
            enc.name,
            mac.name,
            comp.name,
        );
        Ok((enc, mac, comp))
    };
    let (enc_in, mac_in, comp_in) = pick(MODE_IN)?;
    let (enc_out, mac_out, comp_out) = pick(MODE_OUT)?;
    let enc = [enc_in, enc_out];
    let mac = [mac_in, mac_out];
    let comp = [comp_in, comp_out];
    let kex_type = choose_kex(&cprop[PROPOSAL_KEX_ALGS], &sprop[PROPOSAL_KEX_ALGS])?;
    let hostkey_alg = match_list(
        &cprop[PROPOSAL_SERVER_HOST_KEY_ALGS],
        &sprop[PROPOSAL_SERVER_HOST_KEY_ALGS],
    )
    .ok_or_else(|| Error::negotiation("no hostkey alg"))?;

    let mut need = 0;
    for mode in 0..MODE_MAX {
        need = need
            .max(enc[mode].key_len)
            .max(enc[mode].block_size)
            .max(mac[mode].key_len);
    }

    Ok(Negotiated {
        enc,
        mac,
        comp,
        kex_type,
        hostkey_alg,
        we_need: need,
    })
}

// ==== key derivation ====

/// The first exchange hash of a connection; fixed for its lifetime and
/// used as a binding value in all later signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionId(pub [u8; 20]);

impl AsRef<[u8]> for SessionId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Six directional key-material buffers, zeroed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DerivedKeys {
    pub iv_ctos: Vec<u8>,
    pub iv_stoc: Vec<u8>,
    pub enc_key_ctos: Vec<u8>,
    pub enc_key_stoc: Vec<u8>,
    pub mac_key_ctos: Vec<u8>,
    pub mac_key_stoc: Vec<u8>,
}

/// Stretches one key from the shared secret by iterated hashing:
/// `K1 = H(K || H || id || session_id)`, `Kn+1 = H(K || H || K1..Kn)`,
/// chained until `need` bytes are available.
pub fn derive_key(
    id: u8,
    need: usize,
    hash: &[u8],
    session_id: &[u8],
    secret: &SharedSecret,
) -> Vec<u8> {
    let md = &digest::SHA1_FOR_LEGACY_USE_ONLY;
    let mut out = Vec::with_capacity(need + md.output_len);

    let mut ctx = digest::Context::new(md);
    ctx.update(secret.as_mpint());
    ctx.update(hash);
    ctx.update(&[id]);
    ctx.update(session_id);
    out.extend_from_slice(ctx.finish().as_ref());

    while out.len() < need {
        let mut ctx = digest::Context::new(md);
        ctx.update(secret.as_mpint());
        ctx.update(hash);
        ctx.update(&out);
        let digest = ctx.finish();
        out.extend_from_slice(digest.as_ref());
    }
    out.truncate(need);
    out
}

/// Derives all six directional keys ('A' through 'F').
pub fn derive_keys(
    need: usize,
    hash: &[u8],
    session_id: &SessionId,
    secret: &SharedSecret,
) -> DerivedKeys {
    let mut key = |id: u8| derive_key(id, need, hash, session_id.as_ref(), secret);
    DerivedKeys {
        iv_ctos: key(b'A'),
        iv_stoc: key(b'B'),
        enc_key_ctos: key(b'C'),
        enc_key_stoc: key(b'D'),
        mac_key_ctos: key(b'E'),
        mac_key_stoc: key(b'F'),
    }
}

// ==== exchange hash ====

struct ExchangeHashInput<'a> {
    client_version: &'a str,
    server_version: &'a str,
    client_kexinit: &'a [u8],
    server_kexinit: &'a [u8],
    host_key_blob: &'a [u8],
    /// (min, n, max, p, g) for group exchange.
    gex: Option<(u32, u32, u32, &'a BigInt, &'a BigInt)>,
    client_pub: &'a BigInt,
    server_pub: &'a BigInt,
}

/// Computes the exchange hash H over the handshake transcript. The
/// input ordering is the security contract: the peer computes the same
/// hash independently and signs it.
fn exchange_hash(input: &ExchangeHashInput<'_>, secret: &SharedSecret) -> [u8; 20] {
    let mut buf = vec![];
    wire::put_cstring(&mut buf, input.client_version);
    wire::put_cstring(&mut buf, input.server_version);
    wire::put_string(&mut buf, input.client_kexinit);
    wire::put_string(&mut buf, input.server_kexinit);
    wire::put_string(&mut buf, input.host_key_blob);
    if let Some((min, n, max, p, g)) = input.gex {
        wire::put_u32(&mut buf, min);
        wire::put_u32(&mut buf, n);
        wire::put_u32(&mut buf, max);
        wire::put_bignum2(&mut buf, p);
        wire::put_bignum2(&mut buf, g);
    }
    wire::put_bignum2(&mut buf, input.client_pub);
    wire::put_bignum2(&mut buf, input.server_pub);
    buf.extend_from_slice(secret.as_mpint());

    let digest = digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, &buf);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(digest.as_ref());
    buf.zeroize();
    hash
}

// ==== engine ====

/// Immutable configuration for a key-exchange round.
#[derive(Clone, Debug)]
pub struct KexConfig {
    pub kex_algorithms: String,
    pub hostkey_algorithms: String,
    pub ciphers: String,
    pub macs: String,
    pub compression: String,
    pub datafellows: u32,
    /// Accept a changed host key instead of refusing the connection.
    pub allow_changed_hostkey: bool,
}

impl Default for KexConfig {
    fn default() -> Self {
        Self {
            kex_algorithms: format!("{},{},{}", KEX_DH14, KEX_DH1, KEX_DHGEX),
            hostkey_algorithms: keys::SSH_ED25519.to_owned(),
            ciphers: "aes128-cbc,3des-cbc,blowfish-cbc".to_owned(),
            macs: "hmac-sha1,hmac-md5".to_owned(),
            compression: "none,zlib".to_owned(),
            datafellows: 0,
            allow_changed_hostkey: false,
        }
    }
}

impl KexConfig {
    fn proposal_names(&self) -> [String; PROPOSAL_MAX] {
        [
            self.kex_algorithms.clone(),
            self.hostkey_algorithms.clone(),
            self.ciphers.clone(),
            self.ciphers.clone(),
            self.macs.clone(),
            self.macs.clone(),
            self.compression.clone(),
            self.compression.clone(),
            String::new(),
            String::new(),
        ]
    }
}

/// Everything a completed key-exchange round produces.
pub struct KexOutcome {
    pub negotiated: Negotiated,
    pub keys: DerivedKeys,
    pub session_id: SessionId,
}

/// Reads the next packet, tolerating IGNORE/DEBUG; any other message
/// than `expected` during a kex phase is fatal.
async fn read_expect<C: PacketChannel>(chan: &mut C, expected: u8) -> Result<Vec<u8>, Error> {
    loop {
        let (msg_type, payload) = chan.read_packet().await?;
        match msg_type {
            consts::SSH2_MSG_IGNORE | consts::SSH2_MSG_DEBUG => continue,
            consts::SSH2_MSG_DISCONNECT => {
                return Err(Error::protocol("peer disconnected during key exchange"))
            }
            t if t == expected => return Ok(payload),
            other => {
                return Err(Error::Protocol(format!(
                    "kex protocol error: type {} (expected {})",
                    other, expected
                )))
            }
        }
    }
}

struct DhResult {
    hash: [u8; 20],
    secret: SharedSecret,
}

async fn kexdh<C, H>(
    chan: &mut C,
    cfg: &KexConfig,
    group: dh::DhGroup,
    host: &str,
    store: &mut H,
    client_version: &str,
    server_version: &str,
    client_kexinit: &[u8],
    server_kexinit: &[u8],
) -> Result<DhResult, Error>
where
    C: PacketChannel,
    H: HostKeyStore,
{
    let keypair = group.generate_keypair();
    let e = BigInt::from(keypair.public.clone());

    tracing::debug!("sending SSH2_MSG_KEXDH_INIT");
    let mut payload = vec![];
    wire::put_bignum2(&mut payload, &e);
    chan.send_packet(consts::SSH2_MSG_KEXDH_INIT, &payload).await?;

    tracing::debug!("expecting SSH2_MSG_KEXDH_REPLY");
    let reply = read_expect(chan, consts::SSH2_MSG_KEXDH_REPLY).await?;
    let mut b = &reply[..];
    let host_key_blob = wire::get_string(&mut b)?;
    let f = wire::get_bignum2(&mut b)?;
    let signature = wire::get_string(&mut b)?;
    if b.has_remaining() {
        return Err(Error::protocol("trailing bytes in KEXDH_REPLY"));
    }

    check_host_key(host, &host_key_blob, cfg, store)?;

    dh::check_peer_public(&group, f.magnitude())?;
    let secret = group.shared_secret(&keypair, f.magnitude());

    let hash = exchange_hash(
        &ExchangeHashInput {
            client_version,
            server_version,
            client_kexinit,
            server_kexinit,
            host_key_blob: &host_key_blob,
            gex: None,
            client_pub: &e,
            server_pub: &f,
        },
        &secret,
    );

    keys::verify(&host_key_blob, &signature, &hash, cfg.datafellows)
        .map_err(|_| Error::negotiation("signature verification failed for server host key"))?;

    Ok(DhResult { hash, secret })
}

async fn kexgex<C, H>(
    chan: &mut C,
    cfg: &KexConfig,
    host: &str,
    store: &mut H,
    client_version: &str,
    server_version: &str,
    client_kexinit: &[u8],
    server_kexinit: &[u8],
) -> Result<DhResult, Error>
where
    C: PacketChannel,
    H: HostKeyStore,
{
    tracing::debug!("sending SSH2_MSG_KEX_DH_GEX_REQUEST");
    let mut payload = vec![];
    wire::put_u32(&mut payload, GEX_MIN_BITS);
    wire::put_u32(&mut payload, GEX_PREFERRED_BITS);
    wire::put_u32(&mut payload, GEX_MAX_BITS);
    chan.send_packet(consts::SSH2_MSG_KEX_DH_GEX_REQUEST, &payload)
        .await?;

    let group_msg = read_expect(chan, consts::SSH2_MSG_KEX_DH_GEX_GROUP).await?;
    let mut b = &group_msg[..];
    let p = wire::get_bignum2(&mut b)?;
    let g = wire::get_bignum2(&mut b)?;
    let bits = p.bits() as u32;
    if !(GEX_MIN_BITS..=GEX_MAX_BITS).contains(&bits) {
        return Err(Error::Negotiation(format!(
            "server sent {}-bit group outside [{}, {}]",
            bits, GEX_MIN_BITS, GEX_MAX_BITS
        )));
    }
    let group = dh::DhGroup {
        p: p.magnitude().clone(),
        g: g.magnitude().clone(),
    };

    let keypair = group.generate_keypair();
    let e = BigInt::from(keypair.public.clone());

    let mut payload = vec![];
    wire::put_bignum2(&mut payload, &e);
    chan.send_packet(consts::SSH2_MSG_KEX_DH_GEX_INIT, &payload)
        .await?;

    let reply = read_expect(chan, consts::SSH2_MSG_KEX_DH_GEX_REPLY).await?;
    let mut b = &reply[..];
    let host_key_blob = wire::get_string(&mut b)?;
    let f = wire::get_bignum2(&mut b)?;
    let signature = wire::get_string(&mut b)?;
    if b.has_remaining() {
        return Err(Error::protocol("trailing bytes in KEX_DH_GEX_REPLY"));
    }

    check_host_key(host, &host_key_blob, cfg, store)?;

    dh::check_peer_public(&group, f.magnitude())?;
    let secret = group.shared_secret(&keypair, f.magnitude());

    let hash = exchange_hash(
        &ExchangeHashInput {
            client_version,
            server_version,
            client_kexinit,
            server_kexinit,
            host_key_blob: &host_key_blob,
            gex: Some((GEX_MIN_BITS, GEX_PREFERRED_BITS, GEX_MAX_BITS, &p, &g)),
            client_pub: &e,
            server_pub: &f,
        },
        &secret,
    );

    keys::verify(&host_key_blob, &signature, &hash, cfg.datafellows)
        .map_err(|_| Error::negotiation("signature verification failed for server host key"))?;

    Ok(DhResult { hash, secret })
}

fn check_host_key<H: HostKeyStore>(
    host: &str,
    blob: &[u8],
    cfg: &KexConfig,
    store: &mut H,
) -> Result<(), Error> {
    match store.lookup(host, blob) {
        HostStatus::Ok => Ok(()),
        HostStatus::New => {
            tracing::warn!("no recorded host key for {}, accepting offered key", host);
            Ok(())
        }
        HostStatus::Changed if cfg.allow_changed_hostkey => {
            tracing::warn!("host key for {} CHANGED, accepting due to override", host);
            Ok(())
        }
        HostStatus::Changed => Err(Error::Negotiation(format!(
            "host key for {} has changed, refusing connection",
            host
        ))),
    }
}

/// Runs a complete client-side key-exchange round: proposal exchange,
/// Diffie-Hellman, host-key verification, key derivation and the NEWKEYS
/// switch. Callable again mid-connection for rekeying; the session id
/// from the first round is passed back in and kept.
pub async fn client_kex<C, H>(
    chan: &mut C,
    cfg: &KexConfig,
    client_version: &str,
    server_version: &str,
    host: &str,
    store: &mut H,
    session_id: Option<&SessionId>,
) -> Result<KexOutcome, Error>
where
    C: PacketChannel,
    H: HostKeyStore,
{
    let rng = ring_rand::SystemRandom::new();
    let my = Proposal::new(cfg.proposal_names(), &rng)?;
    let my_body = my.to_bytes();

    tracing::debug!("sending SSH2_MSG_KEXINIT");
    chan.send_packet(consts::SSH2_MSG_KEXINIT, &my_body).await?;

    let peer_body = read_expect(chan, consts::SSH2_MSG_KEXINIT).await?;
    tracing::debug!("SSH2_MSG_KEXINIT received");
    let peer = Proposal::parse(&peer_body)?;

    let negotiated = choose_conf(&my, &peer, false, cfg.datafellows)?;

    // the payloads hashed into H include the message type byte
    let client_kexinit = kexinit_payload(&my_body);
    let server_kexinit = kexinit_payload(&peer_body);

    let dh_result = match negotiated.kex_type {
        KexType::DhGroup1Sha1 => {
            kexdh(
                chan,
                cfg,
                dh::group1(),
                host,
                store,
                client_version,
                server_version,
                &client_kexinit,
                &server_kexinit,
            )
            .await?
        }
        KexType::DhGroup14Sha1 => {
            kexdh(
                chan,
                cfg,
                dh::group14(),
                host,
                store,
                client_version,
                server_version,
                &client_kexinit,
                &server_kexinit,
            )
            .await?
        }
        KexType::DhGexSha1 => {
            kexgex(
                chan,
                cfg,
                host,
                store,
                client_version,
                server_version,
                &client_kexinit,
                &server_kexinit,
            )
            .await?
        }
    };

    // the first exchange hash becomes the session identifier
    let session_id = match session_id {
        Some(id) => id.clone(),
        None => SessionId(dh_result.hash),
    };
    let keys = derive_keys(
        negotiated.we_need,
        &dh_result.hash,
        &session_id,
        &dh_result.secret,
    );

    tracing::debug!("expecting SSH2_MSG_NEWKEYS");
    let newkeys = read_expect(chan, consts::SSH2_MSG_NEWKEYS).await?;
    if !newkeys.is_empty() {
        return Err(Error::protocol("trailing bytes in NEWKEYS"));
    }
    tracing::debug!("SSH2_MSG_NEWKEYS received, sending ours");
    chan.send_packet(consts::SSH2_MSG_NEWKEYS, &[]).await?;

    // proposal buffers and the shared secret drop here; nothing
    // negotiated-but-secret outlives the round
    Ok(KexOutcome {
        negotiated,
        keys,
        session_id,
    })
}

fn kexinit_payload(body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.push(consts::SSH2_MSG_KEXINIT);
    payload.extend_from_slice(body);
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostkeys::MemoryHostKeyStore;
    use crate::packet::StreamPacketChannel;

    fn proposal_with(names: [String; PROPOSAL_MAX]) -> Proposal {
        Proposal {
            cookie: [7u8; KEX_COOKIE_LEN],
            names,
            first_kex_follows: false,
        }
    }

    fn names(
        kex: &str,
        hostkey: &str,
        cipher: &str,
        mac: &str,
        comp: &str,
    ) -> [String; PROPOSAL_MAX] {
        [
            kex.to_owned(),
            hostkey.to_owned(),
            cipher.to_owned(),
            cipher.to_owned(),
            mac.to_owned(),
            mac.to_owned(),
            comp.to_owned(),
            comp.to_owned(),
            String::new(),
            String::new(),
        ]
    }

    #[test]
    fn proposal_roundtrip() {
        let p = proposal_with(names(
            KEX_DH14,
            keys::SSH_ED25519,
            "aes128-cbc,3des-cbc",
            "hmac-sha1",
            "none",
        ));
        let parsed = Proposal::parse(&p.to_bytes()).unwrap();
        assert_eq!(parsed.cookie, p.cookie);
        assert_eq!(parsed.names, p.names);
        assert!(!parsed.first_kex_follows);
    }

    #[test]
    fn client_preference_wins() {
        // first client-proposed name present in the server list
        assert_eq!(
            match_list("aes128-cbc,3des-cbc", "3des-cbc,aes128-cbc").as_deref(),
            Some("aes128-cbc")
        );
        assert_eq!(match_list("aes128-cbc", "3des-cbc"), None);
    }

    #[test]
    fn selection_is_role_aware_not_direction_aware() {
        let client = proposal_with(names(
            KEX_DH14,
            keys::SSH_ED25519,
            "aes128-cbc,3des-cbc",
            "hmac-sha1",
            "none",
        ));
        let server = proposal_with(names(
            KEX_DH14,
            keys::SSH_ED25519,
            "3des-cbc,aes128-cbc",
            "hmac-sha1",
            "none",
        ));

        // as the client, our list is the preference order
        let n = choose_conf(&client, &server, false, 0).unwrap();
        assert_eq!(n.enc[MODE_OUT].name, "aes128-cbc");
        assert_eq!(n.enc[MODE_IN].name, "aes128-cbc");

        // as the server, the peer's (client's) list still decides
        let n = choose_conf(&server, &client, true, 0).unwrap();
        assert_eq!(n.enc[MODE_OUT].name, "aes128-cbc");
    }

    #[test]
    fn no_common_algorithm_fails() {
        let client = proposal_with(names(
            KEX_DH14,
            keys::SSH_ED25519,
            "aes128-cbc",
            "hmac-sha1",
            "none",
        ));
        let server = proposal_with(names(
            KEX_DH14,
            keys::SSH_ED25519,
            "3des-cbc",
            "hmac-sha1",
            "none",
        ));
        match choose_conf(&client, &server, false, 0) {
            Err(Error::Negotiation(msg)) => assert!(msg.contains("no matching cipher")),
            other => panic!("expected negotiation failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn we_need_is_the_maximum_requirement() {
        let p = proposal_with(names(
            KEX_DH14,
            keys::SSH_ED25519,
            "aes256-cbc",
            "hmac-sha1",
            "none",
        ));
        let n = choose_conf(&p, &p, false, 0).unwrap();
        assert_eq!(n.we_need, 32); // aes256 key beats its block and the mac key
    }

    #[test]
    fn hmac_bug_truncates_mac_key() {
        let p = proposal_with(names(
            KEX_DH14,
            keys::SSH_ED25519,
            "3des-cbc",
            "hmac-sha1",
            "none",
        ));
        let n = choose_conf(&p, &p, false, crate::compat::SSH_BUG_HMAC).unwrap();
        assert_eq!(n.mac[MODE_OUT].key_len, 16);
    }

    #[test]
    fn derive_key_is_deterministic_and_stretches() {
        let group = dh::group1();
        let a = group.generate_keypair();
        let b = group.generate_keypair();
        let secret = group.shared_secret(&a, &b.public);
        let hash = [0x42u8; 20];

        let k1 = derive_key(b'A', 48, &hash, &hash, &secret);
        let k2 = derive_key(b'A', 48, &hash, &hash, &secret);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 48);

        // first SHA-1 block agrees with an independently-coded round
        let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
        ctx.update(secret.as_mpint());
        ctx.update(&hash);
        ctx.update(b"A");
        ctx.update(&hash);
        assert_eq!(&k1[..20], ctx.finish().as_ref());

        // a different key id diverges
        assert_ne!(k1, derive_key(b'B', 48, &hash, &hash, &secret));
    }

    // Plays the server side of a fixed-group exchange over an in-memory
    // stream and checks both sides derive identical key material.
    #[tokio::test]
    async fn full_client_kex_round() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut chan = StreamPacketChannel::new(server_io);
            let rng = ring_rand::SystemRandom::new();
            let host_key = keys::LocalKey::generate(&rng).unwrap();

            let (t, client_body) = chan.read_packet().await.unwrap();
            assert_eq!(t, consts::SSH2_MSG_KEXINIT);
            let client_prop = Proposal::parse(&client_body).unwrap();

            let my = Proposal::new(
                names(
                    KEX_DH14,
                    keys::SSH_ED25519,
                    "3des-cbc,aes128-cbc",
                    "hmac-sha1",
                    "none",
                ),
                &rng,
            )
            .unwrap();
            let my_body = my.to_bytes();
            chan.send_packet(consts::SSH2_MSG_KEXINIT, &my_body)
                .await
                .unwrap();

            let negotiated = choose_conf(&my, &client_prop, true, 0).unwrap();
            assert_eq!(negotiated.kex_type, KexType::DhGroup14Sha1);
            assert_eq!(negotiated.enc[MODE_IN].name, "aes128-cbc");

            let (t, init) = chan.read_packet().await.unwrap();
            assert_eq!(t, consts::SSH2_MSG_KEXDH_INIT);
            let e = wire::get_bignum2(&mut &init[..]).unwrap();

            let group = dh::group14();
            let keypair = group.generate_keypair();
            let f = BigInt::from(keypair.public.clone());
            let secret = group.shared_secret(&keypair, e.magnitude());

            let blob = host_key.public_blob();
            let hash = exchange_hash(
                &ExchangeHashInput {
                    client_version: "SSH-2.0-client",
                    server_version: "SSH-2.0-server",
                    client_kexinit: &kexinit_payload(&client_body),
                    server_kexinit: &kexinit_payload(&my_body),
                    host_key_blob: &blob,
                    gex: None,
                    client_pub: &e,
                    server_pub: &f,
                },
                &secret,
            );

            let mut reply = vec![];
            wire::put_string(&mut reply, &blob);
            wire::put_bignum2(&mut reply, &f);
            wire::put_string(&mut reply, &host_key.sign(&hash));
            chan.send_packet(consts::SSH2_MSG_KEXDH_REPLY, &reply)
                .await
                .unwrap();

            chan.send_packet(consts::SSH2_MSG_NEWKEYS, &[]).await.unwrap();
            let (t, _) = chan.read_packet().await.unwrap();
            assert_eq!(t, consts::SSH2_MSG_NEWKEYS);

            let session_id = SessionId(hash);
            derive_keys(negotiated.we_need, &hash, &session_id, &secret)
        });

        let mut chan = StreamPacketChannel::new(client_io);
        let mut store = MemoryHostKeyStore::default();
        let cfg = KexConfig {
            ciphers: "aes128-cbc,3des-cbc".to_owned(),
            macs: "hmac-sha1".to_owned(),
            compression: "none".to_owned(),
            ..KexConfig::default()
        };
        let outcome = client_kex(
            &mut chan,
            &cfg,
            "SSH-2.0-client",
            "SSH-2.0-server",
            "testhost",
            &mut store,
            None,
        )
        .await
        .unwrap();

        let server_keys = server.await.unwrap();
        assert_eq!(outcome.keys.enc_key_ctos, server_keys.enc_key_ctos);
        assert_eq!(outcome.keys.mac_key_stoc, server_keys.mac_key_stoc);
        assert_eq!(outcome.keys.iv_ctos.len(), outcome.negotiated.we_need);
    }
}
