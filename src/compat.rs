//! Bug-compatibility flags derived from the peer's software version,
//! and protocol-version preference parsing.

/// Peer signs only the blob, not the full signature framing.
pub const SSH_BUG_SIGBLOB: u32 = 0x0001;
/// Peer truncates HMAC keys to 16 bytes.
pub const SSH_BUG_HMAC: u32 = 0x0002;
/// Peer expects the `ssh-userauth` service name in publickey signatures.
pub const SSH_BUG_PUBKEYAUTH: u32 = 0x0004;
pub const SSH_BUG_X11FWD: u32 = 0x0008;
/// Peer expects the session id string-framed in signature payloads.
pub const SSH_COMPAT_SESSIONID_ENCODING: u32 = 0x0010;

/// Returns the bug bitmask for a peer's software-version string
/// (the part of the identifier after `SSH-x.y-`). First match wins.
pub fn datafellows(version: &str) -> u32 {
    let checks: &[(&dyn Fn(&str) -> bool, u32)] = &[
        (&|v: &str| v.contains("MindTerm"), 0),
        (
            &|v: &str| v.starts_with("2.1.0 "),
            SSH_BUG_SIGBLOB | SSH_BUG_HMAC,
        ),
        (
            &|v: &str| v.starts_with("2.0."),
            SSH_BUG_SIGBLOB | SSH_BUG_HMAC | SSH_BUG_PUBKEYAUTH | SSH_BUG_X11FWD,
        ),
        (
            &|v: &str| v.starts_with("2.2.0 ") || v.starts_with("2.3.0 "),
            SSH_BUG_HMAC | SSH_COMPAT_SESSIONID_ENCODING,
        ),
        (
            &|v: &str| {
                v.starts_with("2.")
                    && v[2..]
                        .chars()
                        .next()
                        .map_or(false, |c| ('2'..='9').contains(&c))
            },
            SSH_COMPAT_SESSIONID_ENCODING,
        ),
        (
            &|v: &str| v.starts_with("2."),
            SSH_BUG_HMAC | SSH_COMPAT_SESSIONID_ENCODING,
        ),
    ];

    for (matches, bugs) in checks {
        if matches(version) {
            tracing::debug!("compat match: {:?} bugs 0x{:04x}", version, bugs);
            return *bugs;
        }
    }
    tracing::debug!("compat no match: {:?}", version);
    0
}

pub const SSH_PROTO_UNKNOWN: u32 = 0x00;
pub const SSH_PROTO_1: u32 = 0x01;
pub const SSH_PROTO_1_PREFERRED: u32 = 0x02;
pub const SSH_PROTO_2: u32 = 0x04;

/// Parses a comma-separated protocol preference like `"2,1"`.
/// Unknown entries are logged and skipped.
pub fn proto_spec(spec: &str) -> u32 {
    let mut ret = SSH_PROTO_UNKNOWN;
    for p in spec.split(',').filter(|p| !p.is_empty()) {
        match p.trim() {
            "1" => {
                if ret == SSH_PROTO_UNKNOWN {
                    ret |= SSH_PROTO_1_PREFERRED;
                }
                ret |= SSH_PROTO_1;
            }
            "2" => ret |= SSH_PROTO_2,
            other => tracing::info!("ignoring bad proto spec: {:?}", other),
        }
    }
    ret
}
