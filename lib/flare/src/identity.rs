use crate::encoding;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// A stable peer identity, independent of the network address a peer is
/// currently reachable at. Two identities compare equal by tag and value.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Identity {
    /// A game server that never authenticated.
    AnonymousGameServer,
    /// A 64-bit platform account id.
    SteamId(u64),
    /// An arbitrary printable string chosen by the application.
    Str(String),
    /// Arbitrary binary blob chosen by the application.
    Bytes(Vec<u8>),
    /// A bare network address acting as identity.
    Ip(SocketAddr),
}

#[derive(Debug, Eq, PartialEq)]
pub struct ParseIdentityError;

impl Identity {
    /// True for identities that carry no authenticatable account.
    #[inline]
    pub fn is_anonymous(&self) -> bool {
        match self {
            Identity::AnonymousGameServer => true,
            Identity::Ip(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Identity::AnonymousGameServer => write!(f, "anon-gs"),
            Identity::SteamId(id) => write!(f, "steamid:{}", id),
            Identity::Str(s) => write!(f, "str:{}", s),
            Identity::Bytes(b) => write!(f, "gen:{}", encoding::hex::encode(b)),
            Identity::Ip(addr) => write!(f, "ip:{}", addr),
        }
    }
}

impl FromStr for Identity {
    type Err = ParseIdentityError;

    fn from_str(text: &str) -> Result<Identity, ParseIdentityError> {
        if text == "anon-gs" {
            return Ok(Identity::AnonymousGameServer);
        }

        let split = text.find(':').ok_or(ParseIdentityError)?;
        let (tag, value) = (&text[..split], &text[split + 1..]);

        match tag {
            "steamid" => value
                .parse::<u64>()
                .map(Identity::SteamId)
                .map_err(|_| ParseIdentityError),
            "str" => {
                if value.is_empty() {
                    return Err(ParseIdentityError);
                }
                Ok(Identity::Str(value.to_owned()))
            }
            "gen" => encoding::hex::decode(value)
                .map(Identity::Bytes)
                .map_err(|_| ParseIdentityError),
            "ip" => value
                .parse::<SocketAddr>()
                .map(Identity::Ip)
                .map_err(|_| ParseIdentityError),
            _ => Err(ParseIdentityError),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(identity: Identity) {
        let rendered = identity.to_string();
        assert_eq!(rendered.parse::<Identity>().unwrap(), identity);
    }

    #[test]
    fn test_render_parse_roundtrip() {
        roundtrip(Identity::AnonymousGameServer);
        roundtrip(Identity::SteamId(76561197960287930));
        roundtrip(Identity::Str("alice".to_owned()));
        roundtrip(Identity::Bytes(vec![0xde, 0xad, 0xbe, 0xef]));
        roundtrip(Identity::Ip("192.0.2.1:27015".parse().unwrap()));
        roundtrip(Identity::Ip("[2001:db8::1]:443".parse().unwrap()));
    }

    #[test]
    fn test_rendered_forms() {
        assert_eq!(Identity::SteamId(42).to_string(), "steamid:42");
        assert_eq!(
            Identity::Bytes(vec![0xab, 0xcd]).to_string(),
            "gen:abcd"
        );
        assert_eq!(Identity::AnonymousGameServer.to_string(), "anon-gs");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!("".parse::<Identity>().is_err());
        assert!("steamid:notanumber".parse::<Identity>().is_err());
        assert!("gen:zz".parse::<Identity>().is_err());
        assert!("unknown:tag".parse::<Identity>().is_err());
        assert!("str:".parse::<Identity>().is_err());
    }

    #[test]
    fn test_equality_by_tag_and_value() {
        assert_ne!(
            Identity::Str("1".to_owned()),
            Identity::SteamId(1),
        );
        assert_eq!(Identity::SteamId(7), Identity::SteamId(7));
    }
}
