//! Client-side authentication for protocol version 2.
//!
//! The client opens with an explicit "none" request to solicit the
//! server's supported-method list, then walks that list: next untried,
//! locally-enabled method each time the server answers with a failure.
//! Method-list iteration state lives in the context, so the "resume the
//! same list where we left off" behavior is an explicit transition.

// Refs:
// * https://tools.ietf.org/html/rfc4252

use crate::{
    compat, consts,
    error::Error,
    kex::SessionId,
    keys,
    packet::PacketChannel,
    wire,
};
use std::collections::VecDeque;
use zeroize::{Zeroize as _, Zeroizing};

const SERVICE_USERAUTH: &str = "ssh-userauth";
const SERVICE_CONNECTION: &str = "ssh-connection";

/// Candidate set used when a server advertises no method list at all.
const DEF_AUTHLIST: &str = "publickey,password";

/// Immutable client-side authentication configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub pubkey_authentication: bool,
    pub password_authentication: bool,
    /// Suppresses every interactive prompt.
    pub batch_mode: bool,
    pub number_of_password_prompts: u32,
    /// On-disk identity files, tried after agent-held keys.
    pub identity_files: Vec<String>,
    pub datafellows: u32,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            pubkey_authentication: true,
            password_authentication: true,
            batch_mode: false,
            number_of_password_prompts: 3,
            identity_files: vec![],
            datafellows: 0,
        }
    }
}

/// One key held by the agent.
#[derive(Clone, Debug)]
pub struct AgentIdentity {
    pub key_blob: Vec<u8>,
    pub comment: String,
}

/// A local key agent. Tried before on-disk identity files.
#[allow(async_fn_in_trait)]
pub trait KeyAgent {
    async fn list_identities(&mut self) -> Result<Vec<AgentIdentity>, Error>;

    /// Returns the framed signature blob for `data` under the key
    /// matching `key_blob`.
    async fn sign(&mut self, key_blob: &[u8], data: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Stand-in for "no agent available"; resolves the generic parameter
/// when the caller has nothing to pass.
pub struct NoAgent;

impl KeyAgent for NoAgent {
    async fn list_identities(&mut self) -> Result<Vec<AgentIdentity>, Error> {
        Ok(vec![])
    }

    async fn sign(&mut self, _key_blob: &[u8], _data: &[u8]) -> Result<Vec<u8>, Error> {
        Err(Error::local("no agent"))
    }
}

#[derive(Debug)]
pub enum KeyLoadError {
    /// File absent; skip the candidate silently.
    Missing,
    /// A passphrase is required (or the given one was wrong).
    Encrypted,
    Bad(String),
}

/// Loads private keys from identity files.
pub trait KeyLoader {
    fn load(&mut self, path: &str, passphrase: Option<&str>) -> Result<keys::LocalKey, KeyLoadError>;
}

/// Interactive prompt source for passphrases and passwords.
pub trait Prompter {
    fn read_passphrase(&mut self, prompt: &str) -> Result<Zeroizing<String>, Error>;
}

/// Loads unencrypted PKCS#8 keys straight from disk.
pub struct FileKeyLoader;

impl KeyLoader for FileKeyLoader {
    fn load(&mut self, path: &str, _passphrase: Option<&str>) -> Result<keys::LocalKey, KeyLoadError> {
        let document = match std::fs::read(path) {
            Ok(document) => document,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyLoadError::Missing)
            }
            Err(err) => return Err(KeyLoadError::Bad(err.to_string())),
        };
        keys::LocalKey::from_pkcs8(&document).map_err(|err| KeyLoadError::Bad(err.to_string()))
    }
}

// ==== method list ====

struct Method {
    name: &'static str,
    enabled: bool,
    needs_interactive: bool,
}

/// Iteration state over the server-advertised method list, owned by the
/// context. The cursor does not advance past an enabled method on its
/// own; a method stays current until it is disabled, which gives the
/// "retry the same method" behavior when the server re-advertises an
/// identical list.
struct MethodList {
    methods: Vec<Method>,
    advertised: Option<String>,
    cursor: usize,
}

impl MethodList {
    fn new(cfg: &AuthConfig) -> Self {
        Self {
            methods: vec![
                Method {
                    name: "publickey",
                    enabled: cfg.pubkey_authentication,
                    needs_interactive: false,
                },
                Method {
                    name: "password",
                    enabled: cfg.password_authentication,
                    needs_interactive: true,
                },
            ],
            advertised: None,
            cursor: 0,
        }
    }

    /// Installs a freshly advertised list. An identical list keeps the
    /// cursor; a different one starts over.
    fn update(&mut self, advertised: &str) {
        let advertised = if advertised.is_empty() {
            tracing::debug!("server did not advertise methods, using {}", DEF_AUTHLIST);
            DEF_AUTHLIST
        } else {
            advertised
        };
        if self.advertised.as_deref() != Some(advertised) {
            tracing::trace!("start over with method list {}", advertised);
            self.advertised = Some(advertised.to_owned());
            self.cursor = 0;
        } else {
            tracing::trace!("continue with method list {}", advertised);
        }
    }

    fn next(&mut self, batch_mode: bool) -> Option<&'static str> {
        let advertised = self.advertised.as_deref()?;
        let items: Vec<&str> = advertised.split(',').collect();
        while self.cursor < items.len() {
            let usable = self.methods.iter().find(|m| {
                m.name == items[self.cursor] && m.enabled && !(batch_mode && m.needs_interactive)
            });
            if let Some(method) = usable {
                return Some(method.name);
            }
            self.cursor += 1;
        }
        None
    }

    fn disable(&mut self, name: &str) {
        if let Some(method) = self.methods.iter_mut().find(|m| m.name == name) {
            tracing::debug!("method {} sent no packet, disabling", name);
            method.enabled = false;
        }
    }
}

// ==== engine ====

enum PubkeyCandidate {
    Agent(AgentIdentity),
    File(String),
}

struct Engine<'a, A, L, P> {
    cfg: &'a AuthConfig,
    user: &'a str,
    host: &'a str,
    session_id: &'a SessionId,
    agent: Option<A>,
    loader: &'a mut L,
    prompter: &'a mut P,
    methods: MethodList,
    /// Gathered lazily on the first publickey attempt.
    pubkey_candidates: Option<VecDeque<PubkeyCandidate>>,
    password_attempts: u32,
}

/// Runs protocol-2 client authentication to completion.
///
/// Fails with [`Error::Exhausted`] when every advertised method has
/// been tried without success.
pub async fn authenticate<C, A, L, P>(
    chan: &mut C,
    cfg: &AuthConfig,
    user: &str,
    host: &str,
    session_id: &SessionId,
    agent: Option<A>,
    loader: &mut L,
    prompter: &mut P,
) -> Result<(), Error>
where
    C: PacketChannel,
    A: KeyAgent,
    L: KeyLoader,
    P: Prompter,
{
    let mut payload = vec![];
    wire::put_cstring(&mut payload, SERVICE_USERAUTH);
    tracing::debug!("sending SSH2_MSG_SERVICE_REQUEST {}", SERVICE_USERAUTH);
    chan.send_packet(consts::SSH2_MSG_SERVICE_REQUEST, &payload)
        .await?;

    loop {
        let (msg_type, payload) = chan.read_packet().await?;
        match msg_type {
            consts::SSH2_MSG_IGNORE | consts::SSH2_MSG_DEBUG => continue,
            consts::SSH2_MSG_SERVICE_ACCEPT => {
                if payload.is_empty() {
                    // some servers omit the echoed service name
                    tracing::debug!("buggy server: service accept without service name");
                } else {
                    let name = wire::get_string(&mut &payload[..])?;
                    if name != SERVICE_USERAUTH.as_bytes() {
                        return Err(Error::protocol("service accept for wrong service"));
                    }
                }
                break;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "expected SSH2_MSG_SERVICE_ACCEPT, got type {}",
                    other
                )))
            }
        }
    }
    tracing::debug!("service accepted: {}", SERVICE_USERAUTH);

    let mut engine = Engine {
        cfg,
        user,
        host,
        session_id,
        agent,
        loader,
        prompter,
        methods: MethodList::new(cfg),
        pubkey_candidates: None,
        password_attempts: 0,
    };

    // solicit the method list before offering any real credential
    engine.send_none(chan).await?;

    loop {
        let (msg_type, payload) = chan.read_packet().await?;
        let mut b = &payload[..];
        match msg_type {
            consts::SSH2_MSG_IGNORE | consts::SSH2_MSG_DEBUG => continue,
            consts::SSH2_MSG_USERAUTH_SUCCESS => {
                tracing::info!("authentication succeeded for {}", user);
                return Ok(());
            }
            consts::SSH2_MSG_USERAUTH_BANNER => {
                let banner = String::from_utf8_lossy(&wire::get_string(&mut b)?).into_owned();
                tracing::info!("server banner: {}", banner.trim_end());
            }
            consts::SSH2_MSG_USERAUTH_FAILURE => {
                let authlist = String::from_utf8(wire::get_string(&mut b)?)
                    .map_err(|_| Error::protocol("non-utf8 method list"))?;
                let partial = wire::get_u8(&mut b)? != 0;
                if partial {
                    tracing::info!("authenticated with partial success");
                }
                tracing::debug!("authentications that can continue: {}", authlist);
                engine.methods.update(&authlist);
                engine.try_next_method(chan).await?;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "bad message during authentication: type {}",
                    other
                )))
            }
        }
    }
}

impl<A, L, P> Engine<'_, A, L, P>
where
    A: KeyAgent,
    L: KeyLoader,
    P: Prompter,
{
    /// Selects methods until one manages to send a request; a method
    /// that sends nothing is disabled and the cursor moves on.
    async fn try_next_method<C: PacketChannel>(&mut self, chan: &mut C) -> Result<(), Error> {
        loop {
            let name = self
                .methods
                .next(self.cfg.batch_mode)
                .ok_or_else(|| Error::Exhausted("Unable to find an authentication method".into()))?;
            tracing::debug!("next authentication method: {}", name);
            let sent = match name {
                "publickey" => self.userauth_pubkey(chan).await?,
                "password" => self.userauth_password(chan).await?,
                _ => false,
            };
            if sent {
                return Ok(());
            }
            self.methods.disable(name);
        }
    }

    fn request_header(&self, method: &str) -> Vec<u8> {
        let mut buf = vec![];
        wire::put_cstring(&mut buf, self.user);
        wire::put_cstring(&mut buf, SERVICE_CONNECTION);
        wire::put_cstring(&mut buf, method);
        buf
    }

    async fn send_none<C: PacketChannel>(&mut self, chan: &mut C) -> Result<(), Error> {
        let payload = self.request_header("none");
        chan.send_packet(consts::SSH2_MSG_USERAUTH_REQUEST, &payload)
            .await
    }

    /// The byte sequence a publickey signature covers: the session id,
    /// then the request fields exactly as they go on the wire.
    fn pubkey_sign_data(&self, key_blob: &[u8]) -> Vec<u8> {
        let mut buf = vec![];
        if self.cfg.datafellows & compat::SSH_COMPAT_SESSIONID_ENCODING != 0 {
            wire::put_string(&mut buf, self.session_id.as_ref());
        } else {
            buf.extend_from_slice(self.session_id.as_ref());
        }
        wire::put_u8(&mut buf, consts::SSH2_MSG_USERAUTH_REQUEST);
        wire::put_cstring(&mut buf, self.user);
        let service = if self.cfg.datafellows & compat::SSH_BUG_PUBKEYAUTH != 0 {
            SERVICE_USERAUTH
        } else {
            SERVICE_CONNECTION
        };
        wire::put_cstring(&mut buf, service);
        wire::put_cstring(&mut buf, "publickey");
        wire::put_u8(&mut buf, 1);
        wire::put_cstring(&mut buf, keys::SSH_ED25519);
        wire::put_string(&mut buf, key_blob);
        buf
    }

    async fn send_pubkey_request<C: PacketChannel>(
        &mut self,
        chan: &mut C,
        key_blob: &[u8],
        sig_blob: Vec<u8>,
    ) -> Result<(), Error> {
        let sig = if self.cfg.datafellows & compat::SSH_BUG_SIGBLOB != 0 {
            // such peers expect the bare signature without framing
            keys::parse_signature_blob(&sig_blob, 0)?
        } else {
            sig_blob
        };
        let mut payload = self.request_header("publickey");
        wire::put_u8(&mut payload, 1);
        wire::put_cstring(&mut payload, keys::SSH_ED25519);
        wire::put_string(&mut payload, key_blob);
        wire::put_string(&mut payload, &sig);
        chan.send_packet(consts::SSH2_MSG_USERAUTH_REQUEST, &payload)
            .await
    }

    async fn gather_pubkey_candidates(&mut self) -> VecDeque<PubkeyCandidate> {
        let mut candidates = VecDeque::new();
        if let Some(agent) = self.agent.as_mut() {
            match agent.list_identities().await {
                Ok(identities) => {
                    for id in identities {
                        tracing::debug!("agent key: {}", id.comment);
                        candidates.push_back(PubkeyCandidate::Agent(id));
                    }
                }
                Err(err) => tracing::debug!("agent unavailable: {}", err),
            }
        }
        for path in &self.cfg.identity_files {
            candidates.push_back(PubkeyCandidate::File(path.clone()));
        }
        candidates
    }

    /// Tries the next key candidate. Returns `false` once all keys are
    /// used up, which disables the method.
    async fn userauth_pubkey<C: PacketChannel>(&mut self, chan: &mut C) -> Result<bool, Error> {
        if self.pubkey_candidates.is_none() {
            let candidates = self.gather_pubkey_candidates().await;
            self.pubkey_candidates = Some(candidates);
        }

        loop {
            let candidate = match self
                .pubkey_candidates
                .as_mut()
                .and_then(|c| c.pop_front())
            {
                Some(candidate) => candidate,
                None => return Ok(false),
            };
            match candidate {
                PubkeyCandidate::Agent(id) => {
                    tracing::debug!("offering agent key: {}", id.comment);
                    let data = self.pubkey_sign_data(&id.key_blob);
                    let agent = self
                        .agent
                        .as_mut()
                        .ok_or_else(|| Error::local("agent went away"))?;
                    let sig = match agent.sign(&id.key_blob, &data).await {
                        Ok(sig) => sig,
                        Err(err) => {
                            tracing::debug!("agent refused to sign: {}", err);
                            continue;
                        }
                    };
                    self.send_pubkey_request(chan, &id.key_blob, sig).await?;
                    return Ok(true);
                }
                PubkeyCandidate::File(path) => match self.try_identity_file(&path)? {
                    Some(key) => {
                        tracing::debug!("offering identity file key: {}", path);
                        let blob = key.public_blob();
                        let data = self.pubkey_sign_data(&blob);
                        let sig = key.sign(&data);
                        self.send_pubkey_request(chan, &blob, sig).await?;
                        return Ok(true);
                    }
                    None => continue,
                },
            }
        }
    }

    /// Loads one identity file, prompting for a passphrase when the key
    /// is encrypted. `None` means skip this candidate.
    fn try_identity_file(&mut self, path: &str) -> Result<Option<keys::LocalKey>, Error> {
        match self.loader.load(path, None) {
            Ok(key) => return Ok(Some(key)),
            Err(KeyLoadError::Missing) => {
                tracing::debug!("identity file {} does not exist", path);
                return Ok(None);
            }
            Err(KeyLoadError::Bad(reason)) => {
                tracing::warn!("bad identity file {}: {}", path, reason);
                return Ok(None);
            }
            Err(KeyLoadError::Encrypted) => {}
        }
        if self.cfg.batch_mode {
            tracing::debug!("skipping encrypted key {} in batch mode", path);
            return Ok(None);
        }
        for _ in 0..self.cfg.number_of_password_prompts {
            let passphrase = self
                .prompter
                .read_passphrase(&format!("Enter passphrase for key '{}': ", path))?;
            if passphrase.is_empty() {
                break;
            }
            match self.loader.load(path, Some(&passphrase)) {
                Ok(key) => return Ok(Some(key)),
                Err(KeyLoadError::Encrypted) => {
                    tracing::debug!("bad passphrase for {}", path);
                }
                Err(_) => break,
            }
        }
        Ok(None)
    }

    /// One password prompt per invocation; gives up, and thereby
    /// disables the method, once the configured prompt count is spent.
    async fn userauth_password<C: PacketChannel>(&mut self, chan: &mut C) -> Result<bool, Error> {
        self.password_attempts += 1;
        if self.password_attempts > self.cfg.number_of_password_prompts {
            return Ok(false);
        }
        if self.password_attempts != 1 {
            tracing::info!("Permission denied, please try again.");
        }
        let password = self
            .prompter
            .read_passphrase(&format!("{}@{}'s password: ", self.user, self.host))?;
        let mut payload = self.request_header("password");
        wire::put_u8(&mut payload, 0);
        wire::put_cstring(&mut payload, &password);
        let result = chan
            .send_packet(consts::SSH2_MSG_USERAUTH_REQUEST, &payload)
            .await;
        payload.zeroize();
        result?;
        Ok(true)
    }
}
