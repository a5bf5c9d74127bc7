//! Server-side authentication loop for protocol version 1.
//!
//! The loop offers successive authentication types for one candidate
//! account while holding two guarantees: a bounded number of attempts
//! per connection, and protocol-visible behavior for an unknown user
//! that is indistinguishable from a real account with no usable
//! credential.

// Refs:
// * https://tools.ietf.org/html/draft-ylonen-ssh-protocol-00

use crate::{consts, error::Error, packet, packet::PacketChannel, wire};
use bytes::Buf as _;
use num_bigint::BigInt;
use ring::digest;
use zeroize::Zeroizing;

/// Attempts after which the connection is dropped.
pub const AUTH_FAIL_MAX: u32 = 6;
/// Attempt at which failure logging escalates to always-visible.
pub const AUTH_FAIL_LOG: u32 = AUTH_FAIL_MAX / 2;

/// A resolved local account.
#[derive(Clone, Debug)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    /// Server-side command override; its presence exempts the account
    /// from the root-login restriction.
    pub forced_command: Option<String>,
}

impl Account {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }
}

/// Immutable per-server authentication policy knobs.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub permit_root_login: bool,
    pub password_authentication: bool,
    pub rsa_authentication: bool,
    pub rhosts_authentication: bool,
    pub rhosts_rsa_authentication: bool,
    pub otp_authentication: bool,
    /// Host-local entropy mixed into fabricated challenges for unknown
    /// users, so the fake is stable per username but unguessable.
    pub host_secret: Vec<u8>,
    /// Peer address and port, for the auth log only.
    pub peer: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            permit_root_login: true,
            password_authentication: true,
            rsa_authentication: true,
            rhosts_authentication: false,
            rhosts_rsa_authentication: false,
            otp_authentication: false,
            host_secret: vec![],
            peer: String::new(),
        }
    }
}

/// Everything the loop needs from the account database and the
/// credential backends. Implementations must return plain `false` for
/// bad credentials; only local resource trouble is an error.
pub trait AccountPolicy {
    fn lookup(&mut self, user: &str) -> Option<Account>;

    /// Shell validity, allow/deny lists, expiry. Consulted once before
    /// the loop starts.
    fn allowed_user(&mut self, account: &Account) -> bool;

    fn check_password(&mut self, account: &Account, password: &str) -> bool;

    fn check_rhosts(&mut self, account: &Account, client_user: &str) -> bool;

    fn check_rhosts_rsa(&mut self, account: &Account, client_user: &str, host_key: &BigInt)
        -> bool;

    /// Issues an RSA challenge for the offered public modulus, or
    /// `None` if the key is not listed for the account.
    fn rsa_challenge(&mut self, account: &Account, public: &BigInt) -> Option<BigInt>;

    fn rsa_verify_response(&mut self, account: &Account, challenge: &BigInt, response: &[u8])
        -> bool;

    /// One-time-password challenge text for the account, or `None` if
    /// the account has no OTP state.
    fn otp_challenge(&mut self, account: &Account) -> Option<String>;

    fn otp_verify(&mut self, account: &Account, response: &str) -> bool;
}

// ==== fabricated challenges ====

fn fake_seed(user: &str, host_secret: &[u8]) -> [u8; 20] {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(user.as_bytes());
    ctx.update(host_secret);
    let mut seed = [0u8; 20];
    seed.copy_from_slice(ctx.finish().as_ref());
    seed
}

/// A deterministic RSA challenge for a nonexistent account, derived
/// from the username and host-local entropy so a remote observer sees
/// a stable per-user value just like a real key would produce.
pub(crate) fn fake_rsa_challenge(user: &str, host_secret: &[u8]) -> BigInt {
    BigInt::from_bytes_be(num_bigint::Sign::Plus, &fake_seed(user, host_secret))
}

/// A fabricated one-time-password challenge in the usual
/// `<hash> <sequence> <seed>` shape.
pub(crate) fn fake_otp_challenge(user: &str, host_secret: &[u8]) -> String {
    let seed = fake_seed(user, host_secret);
    format!("otp-sha1 {} {}", 99 - (seed[0] % 50), hex::encode(&seed[1..6]))
}

// ==== the loop ====

enum Verdict {
    Accepted,
    Rejected,
    /// A challenge was sent; no failure packet, no verdict yet.
    ChallengeSent,
}

struct AuthContext<'a> {
    cfg: &'a ServerConfig,
    user: String,
    /// `None` means the user is unknown but the protocol continues
    /// indistinguishably.
    account: Option<Account>,
}

impl AuthContext<'_> {
    /// Root-login policy, applied after a method succeeds.
    fn root_login_permitted(&self, account: &Account) -> bool {
        if !account.is_root() || self.cfg.permit_root_login {
            return true;
        }
        if account.forced_command.is_some() {
            tracing::info!("root login accepted for forced command");
            return true;
        }
        false
    }

    fn log_attempt(&self, authenticated: bool, attempt: u32, method: &str) {
        let outcome = if authenticated { "Accepted" } else { "Failed" };
        let user = match &self.account {
            Some(account) => account.name.clone(),
            None => format!("illegal user {}", self.user),
        };
        if log_elevated(authenticated, attempt, method) {
            tracing::info!("{} {} for {} from {}", outcome, method, user, self.cfg.peer);
        } else {
            tracing::debug!("{} {} for {} from {}", outcome, method, user, self.cfg.peer);
        }
    }
}

/// Whether an attempt reaches the log at normal visibility. Successes,
/// password guesses and the halfway-to-disconnect attempt always do;
/// other failures stay at debug.
fn log_elevated(authenticated: bool, attempt: u32, method: &str) -> bool {
    authenticated || attempt == AUTH_FAIL_LOG || method == "password"
}

/// Runs protocol-1 authentication to completion. Returns the
/// authenticated account on success; any protocol error or crossing the
/// attempt ceiling terminates the connection.
pub async fn do_authentication<C, P>(
    chan: &mut C,
    cfg: &ServerConfig,
    policy: &mut P,
) -> Result<Account, Error>
where
    C: PacketChannel,
    P: AccountPolicy,
{
    let (msg_type, payload) = read_skip_ignored(chan).await?;
    if msg_type != consts::SSH_CMSG_USER {
        return Err(Error::Protocol(format!(
            "expected SSH_CMSG_USER, got type {}",
            msg_type
        )));
    }
    let mut b = &payload[..];
    let user = String::from_utf8(wire::get_string(&mut b)?)
        .map_err(|_| Error::protocol("non-utf8 username"))?;
    packet::integrity_check(payload.len(), payload.len() - b.remaining(), msg_type)?;

    let account = policy
        .lookup(&user)
        .filter(|account| policy.allowed_user(account));
    if account.is_none() {
        tracing::debug!("input_user_request: illegal user {}", user);
    }

    let mut ctx = AuthContext {
        cfg,
        user,
        account,
    };

    // Accounts without a password get in without further exchange.
    if cfg.password_authentication {
        if let Some(account) = ctx.account.clone() {
            if policy.check_password(&account, "") && ctx.root_login_permitted(&account) {
                ctx.log_attempt(true, 0, "without authentication");
                chan.send_packet(consts::SSH_SMSG_SUCCESS, &[]).await?;
                return Ok(account);
            }
        }
    }

    let account = do_authloop(chan, &mut ctx, policy).await?;
    chan.send_packet(consts::SSH_SMSG_SUCCESS, &[]).await?;
    Ok(account)
}

async fn do_authloop<C, P>(
    chan: &mut C,
    ctx: &mut AuthContext<'_>,
    policy: &mut P,
) -> Result<Account, Error>
where
    C: PacketChannel,
    P: AccountPolicy,
{
    let cfg = ctx.cfg;
    chan.send_packet(consts::SSH_SMSG_FAILURE, &[]).await?;

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let (msg_type, payload) = read_skip_ignored(chan).await?;
        let mut b = &payload[..];

        let (verdict, method) = match msg_type {
            consts::SSH_CMSG_AUTH_PASSWORD => {
                let password = Zeroizing::new(wire::get_string(&mut b)?);
                packet::integrity_check(payload.len(), payload.len() - b.remaining(), msg_type)?;
                let ok = cfg.password_authentication
                    && matches!(std::str::from_utf8(&password), Ok(p) if matches!(
                        &ctx.account, Some(account) if policy.check_password(account, p)));
                (verdict_of(ok), "password")
            }
            consts::SSH_CMSG_AUTH_RSA => {
                let public = wire::get_bignum1(&mut b)?;
                packet::integrity_check(payload.len(), payload.len() - b.remaining(), msg_type)?;
                let v = auth_rsa(chan, ctx, policy, &public).await?;
                (v, "rsa")
            }
            consts::SSH_CMSG_AUTH_RHOSTS => {
                let client_user = String::from_utf8(wire::get_string(&mut b)?)
                    .map_err(|_| Error::protocol("non-utf8 client user"))?;
                packet::integrity_check(payload.len(), payload.len() - b.remaining(), msg_type)?;
                let ok = cfg.rhosts_authentication
                    && matches!(&ctx.account, Some(account) if policy.check_rhosts(account, &client_user));
                (verdict_of(ok), "rhosts")
            }
            consts::SSH_CMSG_AUTH_RHOSTS_RSA => {
                let client_user = String::from_utf8(wire::get_string(&mut b)?)
                    .map_err(|_| Error::protocol("non-utf8 client user"))?;
                let bits = wire::get_u32(&mut b)?;
                let host_key = wire::get_bignum1(&mut b)?;
                packet::integrity_check(payload.len(), payload.len() - b.remaining(), msg_type)?;
                if u64::from(bits) != host_key.bits() {
                    tracing::debug!(
                        "keysize mismatch: actual {} announced {}",
                        host_key.bits(),
                        bits
                    );
                }
                let ok = cfg.rhosts_rsa_authentication
                    && matches!(&ctx.account, Some(account) if policy.check_rhosts_rsa(account, &client_user, &host_key));
                (verdict_of(ok), "rhosts with rsa")
            }
            consts::SSH_CMSG_AUTH_TIS => {
                packet::integrity_check(payload.len(), 0, msg_type)?;
                let v = auth_tis_challenge(chan, ctx, policy).await?;
                (v, "challenge-response")
            }
            consts::SSH_CMSG_AUTH_TIS_RESPONSE => {
                let response = Zeroizing::new(wire::get_string(&mut b)?);
                packet::integrity_check(payload.len(), payload.len() - b.remaining(), msg_type)?;
                let ok = cfg.otp_authentication
                    && matches!(std::str::from_utf8(&response), Ok(r) if matches!(
                        &ctx.account, Some(account) if policy.otp_verify(account, r)));
                (verdict_of(ok), "challenge-response")
            }
            other => {
                // benign protocol skew counts as a failed attempt
                tracing::debug!("unknown message during authentication: type {}", other);
                (Verdict::Rejected, "unknown")
            }
        };

        let mut authenticated = match verdict {
            Verdict::Accepted => true,
            Verdict::Rejected => false,
            Verdict::ChallengeSent => continue,
        };

        if authenticated {
            match &ctx.account {
                Some(account) if ctx.root_login_permitted(account) => {}
                Some(account) => {
                    tracing::info!("ROOT LOGIN REFUSED for {}", account.name);
                    authenticated = false;
                }
                None => authenticated = false,
            }
        }

        ctx.log_attempt(authenticated, attempt, method);

        if authenticated {
            // account presence was just checked above
            if let Some(account) = ctx.account.clone() {
                return Ok(account);
            }
        }

        if attempt > AUTH_FAIL_MAX {
            let msg = format!("Too many authentication failures for {}", ctx.user);
            let mut payload = vec![];
            wire::put_cstring(&mut payload, &msg);
            chan.send_packet(consts::SSH_MSG_DISCONNECT, &payload).await?;
            return Err(Error::RateLimit(ctx.user.clone()));
        }

        chan.send_packet(consts::SSH_SMSG_FAILURE, &[]).await?;
    }
}

fn verdict_of(ok: bool) -> Verdict {
    if ok {
        Verdict::Accepted
    } else {
        Verdict::Rejected
    }
}

/// One RSA challenge round. An unknown user gets a fabricated challenge
/// derived from the username so the exchange looks identical from
/// outside; the response then necessarily fails.
async fn auth_rsa<C, P>(
    chan: &mut C,
    ctx: &AuthContext<'_>,
    policy: &mut P,
    public: &BigInt,
) -> Result<Verdict, Error>
where
    C: PacketChannel,
    P: AccountPolicy,
{
    if !ctx.cfg.rsa_authentication {
        return Ok(Verdict::Rejected);
    }
    let (challenge, real) = match &ctx.account {
        Some(account) => match policy.rsa_challenge(account, public) {
            Some(challenge) => (challenge, true),
            // key not listed for the account; still play the round
            None => (fake_rsa_challenge(&ctx.user, &ctx.cfg.host_secret), false),
        },
        None => (fake_rsa_challenge(&ctx.user, &ctx.cfg.host_secret), false),
    };

    let mut payload = vec![];
    wire::put_bignum1(&mut payload, &challenge)?;
    chan.send_packet(consts::SSH_SMSG_AUTH_RSA_CHALLENGE, &payload)
        .await?;

    let (msg_type, payload) = read_skip_ignored(chan).await?;
    if msg_type != consts::SSH_CMSG_AUTH_RSA_RESPONSE {
        return Err(Error::Protocol(format!(
            "expected SSH_CMSG_AUTH_RSA_RESPONSE, got type {}",
            msg_type
        )));
    }
    let mut b = &payload[..];
    let response = wire::get_string(&mut b)?;
    packet::integrity_check(payload.len(), payload.len() - b.remaining(), msg_type)?;

    let ok = real
        && matches!(&ctx.account, Some(account) if policy.rsa_verify_response(account, &challenge, &response));
    Ok(verdict_of(ok))
}

/// Sends a TIS/OTP challenge. The loop `continue`s without a failure
/// packet after a challenge; the verdict comes with the response.
async fn auth_tis_challenge<C, P>(
    chan: &mut C,
    ctx: &AuthContext<'_>,
    policy: &mut P,
) -> Result<Verdict, Error>
where
    C: PacketChannel,
    P: AccountPolicy,
{
    if !ctx.cfg.otp_authentication {
        return Ok(Verdict::Rejected);
    }
    let challenge = match &ctx.account {
        Some(account) => policy
            .otp_challenge(account)
            .unwrap_or_else(|| fake_otp_challenge(&ctx.user, &ctx.cfg.host_secret)),
        None => fake_otp_challenge(&ctx.user, &ctx.cfg.host_secret),
    };
    let mut payload = vec![];
    wire::put_cstring(&mut payload, &challenge);
    chan.send_packet(consts::SSH_SMSG_AUTH_TIS_CHALLENGE, &payload)
        .await?;
    Ok(Verdict::ChallengeSent)
}

async fn read_skip_ignored<C: PacketChannel>(chan: &mut C) -> Result<(u8, Vec<u8>), Error> {
    loop {
        let (msg_type, payload) = chan.read_packet().await?;
        match msg_type {
            consts::SSH_MSG_IGNORE | consts::SSH_MSG_DEBUG => continue,
            _ => return Ok((msg_type, payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testing::ScriptedChannel;

    struct TestPolicy {
        accounts: Vec<(Account, String)>, // (account, password)
    }

    impl TestPolicy {
        fn with(name: &str, uid: u32, password: &str, forced: Option<&str>) -> Self {
            Self {
                accounts: vec![(
                    Account {
                        name: name.to_owned(),
                        uid,
                        forced_command: forced.map(str::to_owned),
                    },
                    password.to_owned(),
                )],
            }
        }
    }

    impl AccountPolicy for TestPolicy {
        fn lookup(&mut self, user: &str) -> Option<Account> {
            self.accounts
                .iter()
                .find(|(account, _)| account.name == user)
                .map(|(account, _)| account.clone())
        }

        fn allowed_user(&mut self, _account: &Account) -> bool {
            true
        }

        fn check_password(&mut self, account: &Account, password: &str) -> bool {
            self.accounts
                .iter()
                .any(|(a, p)| a.name == account.name && p == password)
        }

        fn check_rhosts(&mut self, _account: &Account, _client_user: &str) -> bool {
            false
        }

        fn check_rhosts_rsa(
            &mut self,
            _account: &Account,
            _client_user: &str,
            _host_key: &BigInt,
        ) -> bool {
            false
        }

        fn rsa_challenge(&mut self, _account: &Account, _public: &BigInt) -> Option<BigInt> {
            None
        }

        fn rsa_verify_response(
            &mut self,
            _account: &Account,
            _challenge: &BigInt,
            _response: &[u8],
        ) -> bool {
            false
        }

        fn otp_challenge(&mut self, _account: &Account) -> Option<String> {
            None
        }

        fn otp_verify(&mut self, _account: &Account, _response: &str) -> bool {
            false
        }
    }

    fn user_packet(user: &str) -> (u8, Vec<u8>) {
        let mut p = vec![];
        wire::put_cstring(&mut p, user);
        (consts::SSH_CMSG_USER, p)
    }

    fn password_packet(password: &str) -> (u8, Vec<u8>) {
        let mut p = vec![];
        wire::put_cstring(&mut p, password);
        (consts::SSH_CMSG_AUTH_PASSWORD, p)
    }

    fn cfg() -> ServerConfig {
        ServerConfig {
            host_secret: b"host entropy".to_vec(),
            peer: "198.51.100.7 port 46262".to_owned(),
            otp_authentication: true,
            ..ServerConfig::default()
        }
    }

    async fn run(
        script: Vec<(u8, Vec<u8>)>,
        cfg: &ServerConfig,
        policy: &mut TestPolicy,
    ) -> (Result<Account, Error>, Vec<u8>) {
        let mut chan = ScriptedChannel::new(script);
        let result = do_authentication(&mut chan, cfg, policy).await;
        (result, chan.sent_types())
    }

    #[tokio::test]
    async fn unknown_user_is_indistinguishable() {
        // A real user with a password the attempts never match, and an
        // unknown user, over the same two rounds.
        let cfg = cfg();
        let script = |user: &str| {
            vec![
                user_packet(user),
                password_packet("guess one"),
                password_packet("guess two"),
            ]
        };

        let mut policy = TestPolicy::with("alice", 1000, "right", None);
        let (real_result, real_sent) = run(script("alice"), &cfg, &mut policy).await;
        let (fake_result, fake_sent) = run(script("mallory"), &cfg, &mut policy).await;

        assert!(real_result.is_err()); // script ends before success
        assert!(fake_result.is_err());
        assert_eq!(real_sent, fake_sent);
        assert_eq!(real_sent, vec![consts::SSH_SMSG_FAILURE; 3]);
    }

    #[tokio::test]
    async fn unknown_user_gets_a_stable_fake_rsa_challenge() {
        let secret = b"host entropy";
        let a = fake_rsa_challenge("mallory", secret);
        assert_eq!(a, fake_rsa_challenge("mallory", secret));
        assert_ne!(a, fake_rsa_challenge("mallory2", secret));
        assert_ne!(a, fake_rsa_challenge("mallory", b"other entropy"));
    }

    #[tokio::test]
    async fn attempt_ceiling_terminates_the_connection() {
        let cfg = cfg();
        let mut policy = TestPolicy::with("alice", 1000, "right", None);
        let mut script = vec![user_packet("alice")];
        for _ in 0..AUTH_FAIL_MAX + 1 {
            script.push(password_packet("wrong"));
        }

        let (result, sent) = run(script, &cfg, &mut policy).await;
        match result {
            Err(Error::RateLimit(user)) => assert_eq!(user, "alice"),
            other => panic!("expected rate limit, got {:?}", other.map(|_| ())),
        }
        // one initial failure, one per surviving attempt, then disconnect
        assert_eq!(sent.last(), Some(&consts::SSH_MSG_DISCONNECT));
        assert_eq!(
            sent.iter()
                .filter(|t| **t == consts::SSH_SMSG_FAILURE)
                .count() as u32,
            AUTH_FAIL_MAX + 1
        );
    }

    #[tokio::test]
    async fn root_login_refused_without_forced_command() {
        let cfg = ServerConfig {
            permit_root_login: false,
            ..cfg()
        };

        let mut policy = TestPolicy::with("root", 0, "secret", None);
        let script = vec![user_packet("root"), password_packet("secret")];
        let (result, sent) = run(script, &cfg, &mut policy).await;
        assert!(result.is_err());
        assert_eq!(sent, vec![consts::SSH_SMSG_FAILURE; 2]);

        // the forced-command exemption preserves the success
        let mut policy = TestPolicy::with("root", 0, "secret", Some("/usr/bin/backup"));
        let script = vec![user_packet("root"), password_packet("secret")];
        let (result, sent) = run(script, &cfg, &mut policy).await;
        assert_eq!(result.unwrap().name, "root");
        assert_eq!(sent.last(), Some(&consts::SSH_SMSG_SUCCESS));
    }

    #[tokio::test]
    async fn empty_password_accepts_immediately() {
        let cfg = cfg();
        let mut policy = TestPolicy::with("guest", 1000, "", None);
        let (result, sent) = run(vec![user_packet("guest")], &cfg, &mut policy).await;
        assert_eq!(result.unwrap().name, "guest");
        assert_eq!(sent, vec![consts::SSH_SMSG_SUCCESS]);
    }

    #[tokio::test]
    async fn tis_challenge_defers_the_failure_packet() {
        let cfg = cfg();
        let mut policy = TestPolicy::with("alice", 1000, "right", None);
        let mut response = vec![];
        wire::put_cstring(&mut response, "wrong otp");
        let script = vec![
            user_packet("alice"),
            (consts::SSH_CMSG_AUTH_TIS, vec![]),
            (consts::SSH_CMSG_AUTH_TIS_RESPONSE, response),
        ];

        let (result, sent) = run(script, &cfg, &mut policy).await;
        assert!(result.is_err());
        // no failure packet between the challenge and the response
        assert_eq!(
            sent,
            vec![
                consts::SSH_SMSG_FAILURE,
                consts::SSH_SMSG_AUTH_TIS_CHALLENGE,
                consts::SSH_SMSG_FAILURE,
            ]
        );
    }

    #[tokio::test]
    async fn unknown_message_type_counts_as_failed_attempt() {
        let cfg = cfg();
        let mut policy = TestPolicy::with("alice", 1000, "right", None);
        let script = vec![
            user_packet("alice"),
            (200, vec![]),
            password_packet("right"),
        ];
        let (result, sent) = run(script, &cfg, &mut policy).await;
        assert_eq!(result.unwrap().name, "alice");
        assert_eq!(
            sent,
            vec![
                consts::SSH_SMSG_FAILURE,
                consts::SSH_SMSG_FAILURE,
                consts::SSH_SMSG_SUCCESS,
            ]
        );
    }

    #[test]
    fn failure_logging_escalates_at_the_threshold() {
        assert!(!log_elevated(false, 1, "rsa"));
        assert!(!log_elevated(false, 2, "rsa"));
        assert!(log_elevated(false, AUTH_FAIL_LOG, "rsa"));
        assert!(!log_elevated(false, AUTH_FAIL_LOG + 1, "rsa"));
        assert!(log_elevated(false, 1, "password"));
        assert!(log_elevated(true, 1, "rsa"));
    }
}
