//! Peer authentication.
//!
//! The server's token is `scheme[:argument]{+scheme[:argument]}*`. Schemes
//! with a server-side verifier must all accept; schemes without one (client
//! conveniences like `polkit`) are skipped. At most one `keyfile` scheme may
//! appear: the client proves it can read the same file by sending its
//! contents in the Auth packet. `user`/`group` verify the peer credentials
//! that Unix stream sockets expose; they never apply to TCP peers.

use std::fs;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use nix::sys::socket::getsockopt;
use nix::sys::socket::sockopt::PeerCredentials;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed auth token: {0}")]
    BadToken(String),
    #[error("duplicate keyfile scheme")]
    DuplicateKeyfile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthScheme {
    /// Accept anyone.
    None,
    /// The Auth payload must equal the file's contents.
    Keyfile(PathBuf),
    /// The peer's uid must match.
    User(u32),
    /// The peer's gid must match.
    Group(u32),
    /// Client-side only; no verifier here.
    ClientOnly(String),
}

/// Peer identity as far as the transport can prove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerIdentity {
    Anonymous,
    Unix { uid: u32, gid: u32 },
}

impl PeerIdentity {
    pub fn from_unix_stream(stream: &UnixStream) -> Self {
        match getsockopt(stream, PeerCredentials) {
            Ok(creds) => PeerIdentity::Unix {
                uid: creds.uid(),
                gid: creds.gid(),
            },
            Err(e) => {
                warn!(target: "api.auth", error = %e, "peer_credentials_unavailable");
                PeerIdentity::Anonymous
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Authenticator {
    schemes: Vec<AuthScheme>,
}

impl Authenticator {
    /// Parse a token string. Empty tokens mean `none`.
    pub fn parse(token: &str) -> Result<Self, AuthError> {
        if token.is_empty() {
            return Ok(Self {
                schemes: vec![AuthScheme::None],
            });
        }
        let mut schemes = Vec::new();
        let mut keyfile_seen = false;
        for part in token.split('+') {
            let (name, argument) = match part.split_once(':') {
                Some((name, argument)) => (name, Some(argument)),
                None => (part, None),
            };
            let scheme = match (name, argument) {
                ("none", None) => AuthScheme::None,
                ("keyfile", Some(path)) if !path.is_empty() => {
                    if keyfile_seen {
                        return Err(AuthError::DuplicateKeyfile);
                    }
                    keyfile_seen = true;
                    AuthScheme::Keyfile(PathBuf::from(path))
                }
                ("user", Some(uid)) => AuthScheme::User(
                    uid.parse()
                        .map_err(|_| AuthError::BadToken(token.to_string()))?,
                ),
                ("group", Some(gid)) => AuthScheme::Group(
                    gid.parse()
                        .map_err(|_| AuthError::BadToken(token.to_string()))?,
                ),
                ("polkit", _) => AuthScheme::ClientOnly("polkit".to_string()),
                _ => return Err(AuthError::BadToken(token.to_string())),
            };
            schemes.push(scheme);
        }
        Ok(Self { schemes })
    }

    /// Every scheme with a verifier must accept.
    pub fn verify(&self, peer: PeerIdentity, auth_payload: &[u8]) -> bool {
        for scheme in &self.schemes {
            let ok = match scheme {
                AuthScheme::None => true,
                AuthScheme::Keyfile(path) => match fs::read(path) {
                    Ok(expected) => {
                        let ok = expected == auth_payload;
                        if !ok {
                            debug!(target: "api.auth", path = %path.display(), "keyfile_mismatch");
                        }
                        ok
                    }
                    Err(e) => {
                        warn!(target: "api.auth", path = %path.display(), error = %e, "keyfile_unreadable");
                        false
                    }
                },
                AuthScheme::User(uid) => matches!(peer, PeerIdentity::Unix { uid: p, .. } if p == *uid),
                AuthScheme::Group(gid) => matches!(peer, PeerIdentity::Unix { gid: p, .. } if p == *gid),
                AuthScheme::ClientOnly(_) => continue,
            };
            if !ok {
                return false;
            }
        }
        true
    }
}
