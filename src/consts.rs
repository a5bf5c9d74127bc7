//! SSH message numbers for both protocol versions.

// protocol 2 transport, defined in https://tools.ietf.org/html/rfc4253#section-12
pub(crate) const SSH2_MSG_DISCONNECT: u8 = 1;
pub(crate) const SSH2_MSG_IGNORE: u8 = 2;
pub(crate) const SSH2_MSG_UNIMPLEMENTED: u8 = 3;
pub(crate) const SSH2_MSG_DEBUG: u8 = 4;
pub(crate) const SSH2_MSG_SERVICE_REQUEST: u8 = 5;
pub(crate) const SSH2_MSG_SERVICE_ACCEPT: u8 = 6;
pub(crate) const SSH2_MSG_KEXINIT: u8 = 20;
pub(crate) const SSH2_MSG_NEWKEYS: u8 = 21;

// numbers 30-49 are reserved for the key exchange method in use
pub(crate) const SSH2_MSG_KEXDH_INIT: u8 = 30;
pub(crate) const SSH2_MSG_KEXDH_REPLY: u8 = 31;

// group exchange, defined in https://tools.ietf.org/html/rfc4419#section-5
pub(crate) const SSH2_MSG_KEX_DH_GEX_GROUP: u8 = 31;
pub(crate) const SSH2_MSG_KEX_DH_GEX_INIT: u8 = 32;
pub(crate) const SSH2_MSG_KEX_DH_GEX_REPLY: u8 = 33;
pub(crate) const SSH2_MSG_KEX_DH_GEX_REQUEST: u8 = 34;

// defined in https://tools.ietf.org/html/rfc4252#section-6
pub(crate) const SSH2_MSG_USERAUTH_REQUEST: u8 = 50;
pub(crate) const SSH2_MSG_USERAUTH_FAILURE: u8 = 51;
pub(crate) const SSH2_MSG_USERAUTH_SUCCESS: u8 = 52;
pub(crate) const SSH2_MSG_USERAUTH_BANNER: u8 = 53;

// protocol 1 message numbers
pub(crate) const SSH_MSG_DISCONNECT: u8 = 1;
pub(crate) const SSH_CMSG_USER: u8 = 4;
pub(crate) const SSH_CMSG_AUTH_RHOSTS: u8 = 5;
pub(crate) const SSH_CMSG_AUTH_RSA: u8 = 6;
pub(crate) const SSH_SMSG_AUTH_RSA_CHALLENGE: u8 = 7;
pub(crate) const SSH_CMSG_AUTH_RSA_RESPONSE: u8 = 8;
pub(crate) const SSH_CMSG_AUTH_PASSWORD: u8 = 9;
pub(crate) const SSH_SMSG_SUCCESS: u8 = 14;
pub(crate) const SSH_SMSG_FAILURE: u8 = 15;
pub(crate) const SSH_MSG_IGNORE: u8 = 32;
pub(crate) const SSH_CMSG_AUTH_RHOSTS_RSA: u8 = 35;
pub(crate) const SSH_MSG_DEBUG: u8 = 36;
pub(crate) const SSH_CMSG_AUTH_TIS: u8 = 39;
pub(crate) const SSH_SMSG_AUTH_TIS_CHALLENGE: u8 = 40;
pub(crate) const SSH_CMSG_AUTH_TIS_RESPONSE: u8 = 41;

// defined in https://tools.ietf.org/html/draft-miller-ssh-agent-04
pub(crate) const SSH_AGENTC_REQUEST_IDENTITIES: u8 = 11;
pub(crate) const SSH_AGENT_IDENTITIES_ANSWER: u8 = 12;
pub(crate) const SSH_AGENTC_SIGN_REQUEST: u8 = 13;
pub(crate) const SSH_AGENT_SIGN_RESPONSE: u8 = 14;
